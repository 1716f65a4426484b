//! Structural decoding of relocatable object modules.
//!
//! [`parse`] walks a module's sections in file order and reports one event per
//! structural item through the [`ModuleVisitor`] trait. The reader decodes
//! structure only; everything cross-module (symbol resolution, index merging)
//! lives in the visitor implementations, which keeps the reader reusable for
//! other front ends such as a dump tool.

use crate::leb128::{self, DecodeError};
use crate::relocate::{RelocEntry, RelocKind};
use crate::symbol::SymbolFlags;
use crate::ReadError;

/// The result type for decoding operations.
pub type Result<T, E = ReadError> = std::result::Result<T, E>;

pub(crate) const WASM_MAGIC: &[u8] = b"\0asm";
pub(crate) const WASM_VERSION: u32 = 1;

/// Section identifiers of a core module, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SectionCode {
    Custom = 0,
    Type = 1,
    Import = 2,
    Function = 3,
    Table = 4,
    Memory = 5,
    Global = 6,
    Export = 7,
    Start = 8,
    Element = 9,
    Code = 10,
    Data = 11,
}

impl SectionCode {
    fn from_u8(byte: u8) -> Option<SectionCode> {
        Some(match byte {
            0 => SectionCode::Custom,
            1 => SectionCode::Type,
            2 => SectionCode::Import,
            3 => SectionCode::Function,
            4 => SectionCode::Table,
            5 => SectionCode::Memory,
            6 => SectionCode::Global,
            7 => SectionCode::Export,
            8 => SectionCode::Start,
            9 => SectionCode::Element,
            10 => SectionCode::Code,
            11 => SectionCode::Data,
            _ => return None,
        })
    }

    /// Whether this section kind opens with an item-count varint.
    pub fn has_count(self) -> bool {
        !matches!(self, SectionCode::Custom | SectionCode::Start)
    }
}

/// A core WebAssembly value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValType {
    I32 = 0x7f,
    I64 = 0x7e,
    F32 = 0x7d,
    F64 = 0x7c,
}

impl ValType {
    fn from_u8(byte: u8) -> Option<ValType> {
        Some(match byte {
            0x7f => ValType::I32,
            0x7e => ValType::I64,
            0x7d => ValType::F32,
            0x7c => ValType::F64,
            _ => return None,
        })
    }
}

/// External kinds used by imports and exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExternalKind {
    Func = 0,
    Table = 1,
    Memory = 2,
    Global = 3,
}

/// Everything known about a section when its begin event fires.
#[derive(Debug, Clone, Copy)]
pub struct SectionHeader {
    pub code: SectionCode,
    /// Offset of the section contents within the module (after id and size).
    pub offset: usize,
    /// Size of the section contents in bytes.
    pub size: usize,
    /// Where the items begin, for section kinds with a leading count.
    pub payload_offset: Option<usize>,
    pub payload_size: Option<usize>,
    /// The leading item count, for section kinds that carry one.
    pub count: Option<u32>,
}

/// One entry of the object's `linking` symbol table.
#[derive(Debug, Clone, Copy)]
pub enum SymbolInfo<'a> {
    Function {
        flags: SymbolFlags,
        /// Index in the module's function index space, imports first.
        index: u32,
        /// Present for definitions and explicitly named imports; `None` means
        /// the symbol is named by the import it refers to.
        name: Option<&'a str>,
    },
    Global {
        flags: SymbolFlags,
        index: u32,
        name: Option<&'a str>,
    },
    Data {
        flags: SymbolFlags,
        name: &'a str,
        /// Location of the definition; `None` for undefined data symbols.
        definition: Option<DataDef>,
    },
}

/// Location of a defined data symbol inside its module's segments.
#[derive(Debug, Clone, Copy)]
pub struct DataDef {
    pub segment: u32,
    pub offset: u32,
    pub size: u32,
}

/// Structural events produced by [`parse`], in file order.
///
/// All methods default to doing nothing so implementations only handle the
/// events they care about. The input-model builder in [`crate::module`] is the
/// primary implementor.
#[allow(unused_variables)]
pub trait ModuleVisitor {
    /// A new section begins. Fires for every section, custom ones included.
    fn begin_section(&mut self, header: SectionHeader) {}
    /// A function import with its declared type index.
    fn import_func(&mut self, module: &str, field: &str, type_index: u32) {}
    /// A global import with its declared type and mutability.
    fn import_global(&mut self, module: &str, field: &str, ty: ValType, mutable: bool) {}
    /// The number of functions defined by the module.
    fn function_count(&mut self, count: u32) {}
    /// The module's table with its declared minimum element count.
    fn table(&mut self, element_count: u32) {}
    /// The module's memory with its declared minimum page count.
    fn memory(&mut self, initial_pages: u32) {}
    /// One export entry.
    fn export(&mut self, name: &str, kind: ExternalKind, index: u32) {}
    /// The element section's function-index list: item count and the byte
    /// range holding the encoded indices.
    fn element_items(&mut self, count: u32, payload_offset: usize, payload_size: usize) {}
    /// One data segment: its memory index, the i32 offset from its init
    /// expression, and the byte range of its contents.
    fn data_segment(&mut self, memory_index: u32, init_offset: u32, data_offset: usize, size: usize) {}
    /// Name, alignment (log2) and flags of one data segment, by segment index.
    fn segment_info(&mut self, index: u32, name: &str, alignment: u32, flags: u32) {}
    /// One static initializer: priority and the symbol index of its function.
    fn init_func(&mut self, priority: u32, symbol_index: u32) {}
    /// One symbol-table entry from the `linking` section.
    fn symbol(&mut self, info: SymbolInfo<'_>) {}
    /// Relocation entries follow, targeting the section at `target_section`
    /// (an index into the sections seen so far, in file order).
    fn reloc_section(&mut self, target_section: u32) {}
    /// One relocation entry for the current target section.
    fn reloc(&mut self, entry: RelocEntry) {}
    /// One function name from the debug `name` section.
    fn function_name(&mut self, index: u32, name: &str) {}
}

/// A binary reader over a module's raw bytes.
#[derive(Debug, Clone)]
pub struct BinaryReader<'a> {
    buffer: &'a [u8],
    position: usize,
    original_offset: usize,
}

impl<'a> BinaryReader<'a> {
    /// Creates a new binary reader over `data`.
    ///
    /// `original_offset` is added to positions reported in errors, which keeps
    /// offsets meaningful when `data` is a window into a larger module.
    pub fn new(data: &'a [u8], original_offset: usize) -> BinaryReader<'a> {
        BinaryReader {
            buffer: data,
            position: 0,
            original_offset,
        }
    }

    /// The current position relative to the start of the whole module.
    #[inline]
    pub fn original_position(&self) -> usize {
        self.original_offset + self.position
    }

    /// Whether the reader has consumed all its bytes.
    #[inline]
    pub fn eof(&self) -> bool {
        self.position >= self.buffer.len()
    }

    /// The number of bytes remaining.
    #[inline]
    pub fn bytes_remaining(&self) -> usize {
        self.buffer.len() - self.position
    }

    fn remaining(&self) -> &'a [u8] {
        &self.buffer[self.position..]
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        let byte = match self.buffer.get(self.position) {
            Some(byte) => *byte,
            None => return Err(self.eof_err()),
        };
        self.position += 1;
        Ok(byte)
    }

    /// Reads a four-byte little-endian `u32`.
    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Advances `size` bytes and returns the skipped slice.
    pub fn read_bytes(&mut self, size: usize) -> Result<&'a [u8]> {
        if self.position + size > self.buffer.len() {
            return Err(self.eof_err());
        }
        let start = self.position;
        self.position += size;
        Ok(&self.buffer[start..self.position])
    }

    /// Reads an unsigned LEB128 `u32`.
    pub fn read_var_u32(&mut self) -> Result<u32> {
        let (value, len) = leb128::read_u32(self.remaining()).map_err(|e| self.leb_err(e))?;
        self.position += len;
        Ok(value)
    }

    /// Reads a signed LEB128 `i32`.
    pub fn read_var_i32(&mut self) -> Result<i32> {
        let (value, len) = leb128::read_i32(self.remaining()).map_err(|e| self.leb_err(e))?;
        self.position += len;
        Ok(value)
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<&'a str> {
        let len = self.read_var_u32()? as usize;
        let offset = self.original_position();
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes).map_err(|_| ReadError::new("malformed UTF-8 encoding", offset))
    }

    fn eof_err(&self) -> ReadError {
        ReadError::new("unexpected end-of-file", self.original_position())
    }

    fn leb_err(&self, error: DecodeError) -> ReadError {
        let message = match error {
            DecodeError::Truncated => "truncated varint",
            DecodeError::Overflow => "varint out of range",
        };
        ReadError::new(message, self.original_position())
    }
}

// Subsection ids of the `linking` custom section.
const LINKING_VERSION: u32 = 2;
const WASM_SEGMENT_INFO: u8 = 5;
const WASM_INIT_FUNCS: u8 = 6;
const WASM_SYMBOL_TABLE: u8 = 8;

// Symbol kinds within the `linking` symbol table.
const SYMTAB_FUNCTION: u8 = 0;
const SYMTAB_DATA: u8 = 1;
const SYMTAB_GLOBAL: u8 = 2;

// Opcodes the reader has to understand to walk init expressions.
const OP_I32_CONST: u8 = 0x41;
const OP_END: u8 = 0x0b;

const FUNC_NAME_SUBSECTION: u8 = 1;

/// Decodes `data` as a module, reporting structural events to `visitor`.
pub fn parse(data: &[u8], visitor: &mut impl ModuleVisitor) -> Result<()> {
    let mut reader = BinaryReader::new(data, 0);
    let magic = reader.read_bytes(4)?;
    if magic != WASM_MAGIC {
        return Err(ReadError::new("bad magic number", 0));
    }
    let version = reader.read_u32()?;
    if version != WASM_VERSION {
        return Err(ReadError::new(
            format!("unsupported version {version}"),
            4,
        ));
    }

    while !reader.eof() {
        let id_offset = reader.original_position();
        let id = reader.read_u8()?;
        let code = SectionCode::from_u8(id)
            .ok_or_else(|| ReadError::new(format!("invalid section id {id}"), id_offset))?;
        let size = reader.read_var_u32()? as usize;
        let offset = reader.original_position();
        let contents = reader.read_bytes(size)?;
        let mut section = BinaryReader::new(contents, offset);

        let mut header = SectionHeader {
            code,
            offset,
            size,
            payload_offset: None,
            payload_size: None,
            count: None,
        };
        let mut count = 0;
        if code.has_count() {
            count = section.read_var_u32()?;
            if count == 0 {
                return Err(ReadError::new("empty section", offset));
            }
            header.count = Some(count);
            header.payload_offset = Some(section.original_position());
            header.payload_size = Some(size - (section.original_position() - offset));
        }
        visitor.begin_section(header);

        match code {
            SectionCode::Import => read_imports(&mut section, count, visitor)?,
            SectionCode::Function => visitor.function_count(count),
            SectionCode::Table => read_table(&mut section, visitor)?,
            SectionCode::Memory => read_memory(&mut section, visitor)?,
            SectionCode::Export => read_exports(&mut section, count, visitor)?,
            SectionCode::Element => read_element(&mut section, count, visitor)?,
            SectionCode::Data => read_data(&mut section, count, visitor)?,
            SectionCode::Custom => read_custom(&mut section, visitor)?,
            // Raw payloads; the linker copies these through untouched apart
            // from relocation.
            SectionCode::Type
            | SectionCode::Global
            | SectionCode::Code
            | SectionCode::Start => {}
        }
    }
    Ok(())
}

fn read_limits(reader: &mut BinaryReader<'_>) -> Result<u32> {
    let flags = reader.read_u8()?;
    let initial = reader.read_var_u32()?;
    if flags & 1 != 0 {
        reader.read_var_u32()?;
    }
    Ok(initial)
}

fn read_imports(
    reader: &mut BinaryReader<'_>,
    count: u32,
    visitor: &mut impl ModuleVisitor,
) -> Result<()> {
    for _ in 0..count {
        let module = reader.read_string()?;
        let field = reader.read_string()?;
        let kind_offset = reader.original_position();
        let kind = reader.read_u8()?;
        match kind {
            0x00 => {
                let type_index = reader.read_var_u32()?;
                visitor.import_func(module, field, type_index);
            }
            0x01 => {
                reader.read_u8()?; // element type
                read_limits(reader)?;
            }
            0x02 => {
                read_limits(reader)?;
            }
            0x03 => {
                let ty_offset = reader.original_position();
                let ty = ValType::from_u8(reader.read_u8()?)
                    .ok_or_else(|| ReadError::new("invalid value type", ty_offset))?;
                let mutable = reader.read_u8()? != 0;
                visitor.import_global(module, field, ty, mutable);
            }
            _ => return Err(ReadError::new("invalid external kind", kind_offset)),
        }
    }
    Ok(())
}

fn read_table(reader: &mut BinaryReader<'_>, visitor: &mut impl ModuleVisitor) -> Result<()> {
    let offset = reader.original_position();
    let elem_type = reader.read_u8()?;
    if elem_type != 0x70 {
        return Err(ReadError::new("table element type must be funcref", offset));
    }
    let initial = read_limits(reader)?;
    visitor.table(initial);
    Ok(())
}

fn read_memory(reader: &mut BinaryReader<'_>, visitor: &mut impl ModuleVisitor) -> Result<()> {
    let initial = read_limits(reader)?;
    visitor.memory(initial);
    Ok(())
}

fn read_exports(
    reader: &mut BinaryReader<'_>,
    count: u32,
    visitor: &mut impl ModuleVisitor,
) -> Result<()> {
    for _ in 0..count {
        let name = reader.read_string()?;
        let kind_offset = reader.original_position();
        let kind = match reader.read_u8()? {
            0 => ExternalKind::Func,
            1 => ExternalKind::Table,
            2 => ExternalKind::Memory,
            3 => ExternalKind::Global,
            _ => return Err(ReadError::new("invalid external kind", kind_offset)),
        };
        let index = reader.read_var_u32()?;
        visitor.export(name, kind, index);
    }
    Ok(())
}

fn read_i32_init_expr(reader: &mut BinaryReader<'_>) -> Result<u32> {
    let offset = reader.original_position();
    if reader.read_u8()? != OP_I32_CONST {
        return Err(ReadError::new("expected i32.const init expression", offset));
    }
    let value = reader.read_var_i32()?;
    let end_offset = reader.original_position();
    if reader.read_u8()? != OP_END {
        return Err(ReadError::new("unterminated init expression", end_offset));
    }
    Ok(value as u32)
}

fn read_element(
    reader: &mut BinaryReader<'_>,
    count: u32,
    visitor: &mut impl ModuleVisitor,
) -> Result<()> {
    // Objects produced by compilers carry at most one element segment; the
    // merged output is built around that shape.
    if count != 1 {
        return Err(ReadError::new(
            "expected exactly one element segment",
            reader.original_position(),
        ));
    }
    let table_offset = reader.original_position();
    if reader.read_var_u32()? != 0 {
        return Err(ReadError::new("element segment must target table 0", table_offset));
    }
    read_i32_init_expr(reader)?;
    let items = reader.read_var_u32()?;
    visitor.element_items(items, reader.original_position(), reader.bytes_remaining());
    Ok(())
}

fn read_data(
    reader: &mut BinaryReader<'_>,
    count: u32,
    visitor: &mut impl ModuleVisitor,
) -> Result<()> {
    for _ in 0..count {
        let memory_index = reader.read_var_u32()?;
        let init_offset = read_i32_init_expr(reader)?;
        let size = reader.read_var_u32()? as usize;
        let data_offset = reader.original_position();
        reader.read_bytes(size)?;
        visitor.data_segment(memory_index, init_offset, data_offset, size);
    }
    Ok(())
}

fn read_custom(reader: &mut BinaryReader<'_>, visitor: &mut impl ModuleVisitor) -> Result<()> {
    let name = reader.read_string()?;
    match name {
        "linking" => read_linking(reader, visitor),
        "name" => read_names(reader, visitor),
        _ if name.starts_with("reloc.") => read_reloc(reader, visitor),
        _ => Ok(()),
    }
}

fn read_linking(reader: &mut BinaryReader<'_>, visitor: &mut impl ModuleVisitor) -> Result<()> {
    let version_offset = reader.original_position();
    let version = reader.read_var_u32()?;
    if version != LINKING_VERSION {
        return Err(ReadError::new(
            format!("unsupported linking metadata version {version}"),
            version_offset,
        ));
    }
    while !reader.eof() {
        let ty = reader.read_u8()?;
        let len = reader.read_var_u32()? as usize;
        let offset = reader.original_position();
        let contents = reader.read_bytes(len)?;
        let mut sub = BinaryReader::new(contents, offset);
        match ty {
            WASM_SEGMENT_INFO => {
                let count = sub.read_var_u32()?;
                for index in 0..count {
                    let name = sub.read_string()?;
                    let alignment = sub.read_var_u32()?;
                    let flags = sub.read_var_u32()?;
                    visitor.segment_info(index, name, alignment, flags);
                }
            }
            WASM_INIT_FUNCS => {
                let count = sub.read_var_u32()?;
                for _ in 0..count {
                    let priority = sub.read_var_u32()?;
                    let symbol_index = sub.read_var_u32()?;
                    visitor.init_func(priority, symbol_index);
                }
            }
            WASM_SYMBOL_TABLE => read_symbol_table(&mut sub, visitor)?,
            // Unknown subsections (e.g. COMDAT info) are skipped whole.
            _ => {}
        }
    }
    Ok(())
}

fn read_symbol_table(reader: &mut BinaryReader<'_>, visitor: &mut impl ModuleVisitor) -> Result<()> {
    let count = reader.read_var_u32()?;
    for _ in 0..count {
        let kind_offset = reader.original_position();
        let kind = reader.read_u8()?;
        let flags = SymbolFlags::from_bits_truncate(reader.read_var_u32()?);
        let defined = !flags.contains(SymbolFlags::UNDEFINED);
        match kind {
            SYMTAB_FUNCTION | SYMTAB_GLOBAL => {
                let index = reader.read_var_u32()?;
                let name = if defined || flags.contains(SymbolFlags::EXPLICIT_NAME) {
                    Some(reader.read_string()?)
                } else {
                    None
                };
                let info = if kind == SYMTAB_FUNCTION {
                    SymbolInfo::Function { flags, index, name }
                } else {
                    SymbolInfo::Global { flags, index, name }
                };
                visitor.symbol(info);
            }
            SYMTAB_DATA => {
                let name = reader.read_string()?;
                let definition = if defined {
                    Some(DataDef {
                        segment: reader.read_var_u32()?,
                        offset: reader.read_var_u32()?,
                        size: reader.read_var_u32()?,
                    })
                } else {
                    None
                };
                visitor.symbol(SymbolInfo::Data {
                    flags,
                    name,
                    definition,
                });
            }
            _ => {
                return Err(ReadError::new(
                    format!("unsupported symbol kind {kind}"),
                    kind_offset,
                ))
            }
        }
    }
    Ok(())
}

fn read_reloc(reader: &mut BinaryReader<'_>, visitor: &mut impl ModuleVisitor) -> Result<()> {
    let target_section = reader.read_var_u32()?;
    visitor.reloc_section(target_section);
    let count = reader.read_var_u32()?;
    for _ in 0..count {
        let kind_offset = reader.original_position();
        let kind_byte = reader.read_u8()?;
        let kind = RelocKind::from_u8(kind_byte).ok_or_else(|| {
            ReadError::new(format!("unsupported relocation kind {kind_byte}"), kind_offset)
        })?;
        let offset = reader.read_var_u32()?;
        let index = reader.read_var_u32()?;
        let addend = if kind.has_addend() {
            reader.read_var_i32()?
        } else {
            0
        };
        visitor.reloc(RelocEntry {
            kind,
            offset,
            index,
            addend,
        });
    }
    Ok(())
}

fn read_names(reader: &mut BinaryReader<'_>, visitor: &mut impl ModuleVisitor) -> Result<()> {
    while !reader.eof() {
        let id = reader.read_u8()?;
        let len = reader.read_var_u32()? as usize;
        let offset = reader.original_position();
        let contents = reader.read_bytes(len)?;
        if id != FUNC_NAME_SUBSECTION {
            continue;
        }
        let mut sub = BinaryReader::new(contents, offset);
        let count = sub.read_var_u32()?;
        for _ in 0..count {
            let index = sub.read_var_u32()?;
            let name = sub.read_string()?;
            visitor.function_name(index, name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Events {
        sections: Vec<SectionCode>,
        imports: Vec<(String, String, u32)>,
        function_count: u32,
        exports: Vec<(String, u32)>,
    }

    impl ModuleVisitor for Events {
        fn begin_section(&mut self, header: SectionHeader) {
            self.sections.push(header.code);
        }
        fn import_func(&mut self, module: &str, field: &str, type_index: u32) {
            self.imports.push((module.to_string(), field.to_string(), type_index));
        }
        fn function_count(&mut self, count: u32) {
            self.function_count = count;
        }
        fn export(&mut self, name: &str, _kind: ExternalKind, index: u32) {
            self.exports.push((name.to_string(), index));
        }
    }

    fn module(sections: &[(u8, Vec<u8>)]) -> Vec<u8> {
        let mut bytes = b"\0asm\x01\0\0\0".to_vec();
        for (id, payload) in sections {
            bytes.push(*id);
            crate::leb128::write_u32(&mut bytes, payload.len() as u32);
            bytes.extend_from_slice(payload);
        }
        bytes
    }

    #[test]
    fn rejects_bad_magic() {
        let mut events = Events::default();
        let err = parse(b"\0bad\x01\0\0\0", &mut events).unwrap_err();
        assert!(err.message().contains("magic"));
    }

    #[test]
    fn rejects_bad_version() {
        let mut events = Events::default();
        let err = parse(b"\0asm\x02\0\0\0", &mut events).unwrap_err();
        assert!(err.message().contains("version"));
        assert_eq!(err.offset(), 4);
    }

    #[test]
    fn rejects_truncated_section() {
        let mut bytes = b"\0asm\x01\0\0\0".to_vec();
        bytes.extend_from_slice(&[1, 10, 0]); // type section claims 10 bytes
        let mut events = Events::default();
        assert!(parse(&bytes, &mut events).is_err());
    }

    #[test]
    fn rejects_empty_counted_section() {
        let bytes = module(&[(3, vec![0])]); // function section with count 0
        let mut events = Events::default();
        let err = parse(&bytes, &mut events).unwrap_err();
        assert!(err.message().contains("empty"));
    }

    #[test]
    fn walks_sections_in_order() {
        let mut import = vec![1]; // one import
        import.extend_from_slice(b"\x03env\x03foo\x00\x00");
        let mut export = vec![1];
        export.extend_from_slice(b"\x03run\x00\x00");
        let bytes = module(&[
            (1, vec![1, 0x60, 0, 0]),
            (2, import),
            (3, vec![1, 0]),
            (7, export),
        ]);
        let mut events = Events::default();
        parse(&bytes, &mut events).unwrap();
        assert_eq!(
            events.sections,
            [
                SectionCode::Type,
                SectionCode::Import,
                SectionCode::Function,
                SectionCode::Export
            ]
        );
        assert_eq!(events.imports, [("env".to_string(), "foo".to_string(), 0)]);
        assert_eq!(events.function_count, 1);
        assert_eq!(events.exports, [("run".to_string(), 0)]);
    }
}
