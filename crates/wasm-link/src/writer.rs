//! Binary emission primitives for the output module.
//!
//! Section sizes are not known until a section is finished, so
//! [`BinaryWriter::begin_section`] writes a maximum-width LEB128 placeholder
//! and [`BinaryWriter::end_section`] patches the real size in afterwards. The
//! padded encoding keeps every following offset stable, which is what lets
//! sections be emitted in a single pass.

use std::io;

use crate::leb128;
use crate::reader::SectionCode;
use crate::Result;

pub(crate) const MAGIC: &[u8; 4] = b"\0asm";
pub(crate) const VERSION: [u8; 4] = 1u32.to_le_bytes();

/// A positioned, patchable byte sink for the linked module.
pub trait OutputStream {
    /// The current write position.
    fn position(&self) -> usize;
    /// Appends `bytes` at the current position.
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;
    /// Overwrites previously written bytes at `offset`, leaving the current
    /// position untouched.
    fn patch(&mut self, offset: usize, bytes: &[u8]) -> io::Result<()>;
}

/// An [`OutputStream`] over an in-memory buffer.
#[derive(Debug, Default)]
pub struct MemoryStream {
    bytes: Vec<u8>,
}

impl MemoryStream {
    pub fn new() -> MemoryStream {
        MemoryStream::default()
    }

    /// The bytes written so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Consumes the stream, returning its buffer.
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

impl OutputStream for MemoryStream {
    fn position(&self) -> usize {
        self.bytes.len()
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.bytes.extend_from_slice(bytes);
        Ok(())
    }

    fn patch(&mut self, offset: usize, bytes: &[u8]) -> io::Result<()> {
        let end = offset + bytes.len();
        if end > self.bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "patch beyond written bytes",
            ));
        }
        self.bytes[offset..end].copy_from_slice(bytes);
        Ok(())
    }
}

/// A pending section size, patched when the section ends.
#[derive(Debug, Clone, Copy)]
#[must_use = "a section must be finished with end_section"]
pub struct SizePlaceholder {
    offset: usize,
}

/// Encodes module structure into an [`OutputStream`].
pub struct BinaryWriter<'a> {
    stream: &'a mut dyn OutputStream,
}

impl<'a> BinaryWriter<'a> {
    pub fn new(stream: &'a mut dyn OutputStream) -> BinaryWriter<'a> {
        BinaryWriter { stream }
    }

    pub fn position(&self) -> usize {
        self.stream.position()
    }

    /// Writes the module magic and version.
    pub fn write_header(&mut self) -> Result<()> {
        self.stream.write(MAGIC)?;
        self.stream.write(&VERSION)?;
        Ok(())
    }

    /// Opens a section, leaving a padded size placeholder to patch later.
    pub fn begin_section(&mut self, code: SectionCode) -> Result<SizePlaceholder> {
        self.write_u8(code as u8)?;
        let offset = self.stream.position();
        self.stream.write(&[0x80, 0x80, 0x80, 0x80, 0x00])?;
        Ok(SizePlaceholder { offset })
    }

    /// Closes a section by patching its size placeholder.
    pub fn end_section(&mut self, placeholder: SizePlaceholder) -> Result<()> {
        let size = self.stream.position() - placeholder.offset - leb128::MAX_WIDTH;
        let mut encoded = Vec::with_capacity(leb128::MAX_WIDTH);
        // Section contents are bounded well below 2^32, the encoding cannot
        // fail to fit.
        leb128::write_u32_fixed(&mut encoded, size as u32, leb128::MAX_WIDTH);
        self.stream.patch(placeholder.offset, &encoded)?;
        Ok(())
    }

    pub fn write_u8(&mut self, byte: u8) -> Result<()> {
        self.stream.write(&[byte])?;
        Ok(())
    }

    pub fn write_u32_leb(&mut self, value: u32) -> Result<()> {
        let mut encoded = Vec::with_capacity(leb128::MAX_WIDTH);
        leb128::write_u32(&mut encoded, value);
        self.stream.write(&encoded)?;
        Ok(())
    }

    pub fn write_i32_leb(&mut self, value: i32) -> Result<()> {
        let mut encoded = Vec::with_capacity(leb128::MAX_WIDTH);
        leb128::write_i32(&mut encoded, value);
        self.stream.write(&encoded)?;
        Ok(())
    }

    /// Writes a length-prefixed UTF-8 string.
    pub fn write_str(&mut self, value: &str) -> Result<()> {
        self.write_bytes(value.as_bytes())
    }

    /// Writes a length-prefixed byte vector.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_u32_leb(bytes.len() as u32)?;
        self.stream.write(bytes)?;
        Ok(())
    }

    /// Writes bytes verbatim, without a length prefix.
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write(bytes)?;
        Ok(())
    }

    /// Writes an `i32.const <value> end` init expression.
    pub fn write_i32_const_expr(&mut self, value: i32) -> Result<()> {
        self.write_u8(0x41)?;
        self.write_i32_leb(value)?;
        self.write_u8(0x0b)?;
        Ok(())
    }
}
