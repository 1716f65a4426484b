use std::io;
use thiserror::Error;

/// An error produced while decoding a malformed or truncated input module.
///
/// Carries the byte offset within the module where decoding failed.
#[derive(Debug, Clone, Error)]
#[error("{message} (at offset 0x{offset:x})")]
pub struct ReadError {
    message: String,
    offset: usize,
}

impl ReadError {
    pub(crate) fn new(message: impl Into<String>, offset: usize) -> Self {
        ReadError {
            message: message.into(),
            offset,
        }
    }

    /// Get this error's message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the offset within the input module where the error occurred.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// Errors produced while linking a set of object modules.
#[derive(Debug, Error)]
pub enum LinkError {
    /// An input module could not be decoded.
    #[error("{file}: {error}")]
    Parse {
        /// The offending input file.
        file: String,
        /// The underlying decode error, with its byte offset.
        error: ReadError,
    },

    /// Two input modules both carry a strong definition of the same symbol.
    #[error("duplicate symbol: {name}")]
    DuplicateSymbol {
        /// The symbol defined twice.
        name: String,
    },

    /// A symbol that must resolve to a definition never received one.
    #[error("undefined symbol: {name}")]
    UndefinedSymbol {
        /// The symbol that is still undefined.
        name: String,
    },

    /// A relocation entry could not be applied.
    #[error("bad relocation at offset 0x{offset:x}: {message}")]
    Relocation {
        /// Offset of the operand within its section.
        offset: usize,
        /// What went wrong.
        message: String,
    },

    /// The output sink failed.
    #[error("failed to write output")]
    Io(#[from] io::Error),
}

impl LinkError {
    pub(crate) fn relocation(offset: usize, message: impl Into<String>) -> Self {
        LinkError::Relocation {
            offset,
            message: message.into(),
        }
    }

    pub(crate) fn undefined(name: impl Into<String>) -> Self {
        LinkError::UndefinedSymbol { name: name.into() }
    }
}

/// The result type used throughout this crate.
pub type Result<T, E = LinkError> = std::result::Result<T, E>;
