//! A static linker for relocatable WebAssembly object modules.
//!
//! Inputs are core modules carrying the tool-conventions `linking` metadata
//! and `reloc.*` companion sections, as produced by `clang -c
//! --target=wasm32` and similar compilers. The linker resolves symbols across
//! all inputs, merges their type, function, global and table index spaces,
//! lays out data segments in one linear memory and rewrites every relocatable
//! operand in place, preserving each operand's encoded width.
//!
//! The main entry point is [`Linker`]:
//!
//! ```no_run
//! use wasm_link::{Linker, LinkOptions, MemoryStream};
//!
//! # fn main() -> wasm_link::Result<()> {
//! let mut linker = Linker::new(LinkOptions::default());
//! linker.add_module("a.o", std::fs::read("a.o")?)?;
//! linker.add_module("b.o", std::fs::read("b.o")?)?;
//! let mut output = MemoryStream::new();
//! linker.link(&mut output)?;
//! std::fs::write("linked.wasm", output.as_slice())?;
//! # Ok(())
//! # }
//! ```

pub mod leb128;
pub mod reader;
pub mod writer;

mod error;
mod layout;
mod linker;
mod module;
mod output;
mod relocate;
mod symbol;

pub use crate::error::{LinkError, ReadError, Result};
pub use crate::layout::{align_up, Chunk, DataLayout, IndexSpaces, OutputSegment, PAGE_SIZE};
pub use crate::linker::{LinkOptions, Linker};
pub use crate::module::{
    DataSegment, ElementItems, Export, FuncImport, GlobalImport, InitFunc, InputModule,
    ObjectSymbol, Section,
};
pub use crate::relocate::{RelocEntry, RelocKind, Relocator};
pub use crate::symbol::{
    Symbol, SymbolFlags, SymbolKind, SymbolTable, SymbolTarget, SyntheticValue,
};
pub use crate::writer::{BinaryWriter, MemoryStream, OutputStream};
