//! In-place rewriting of relocatable operands.
//!
//! Input objects encode every relocatable index or address as a padded LEB128
//! (or raw i32) and describe each site in a `reloc.*` companion section. The
//! [`Relocator`] copies a section's contents and rewrites every site to its
//! merged-output value, preserving each operand's encoded width so no offset
//! inside the section moves.

use log::trace;

use crate::layout::{DataLayout, IndexSpaces};
use crate::leb128;
use crate::module::{InputModule, ObjectSymbol, Section};
use crate::symbol::{SymbolFlags, SymbolTable, SymbolTarget, SyntheticValue};
use crate::{LinkError, Result};

/// Relocation kinds from the tool-conventions metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelocKind {
    /// A function index as a padded unsigned LEB, e.g. a `call` operand.
    FunctionIndexLeb = 0,
    /// A table slot as a padded signed LEB, e.g. an `i32.const` of a
    /// function's address.
    TableIndexSleb = 1,
    /// A table slot as a raw little-endian i32 stored in data.
    TableIndexI32 = 2,
    /// A memory address as a padded unsigned LEB, e.g. a load/store offset.
    MemoryAddrLeb = 3,
    /// A memory address as a padded signed LEB, e.g. an `i32.const` operand.
    MemoryAddrSleb = 4,
    /// A memory address as a raw little-endian i32 stored in data.
    MemoryAddrI32 = 5,
    /// A type index as a padded unsigned LEB, e.g. a `call_indirect` operand.
    TypeIndexLeb = 6,
    /// A global index as a padded unsigned LEB.
    GlobalIndexLeb = 7,
}

impl RelocKind {
    pub fn from_u8(byte: u8) -> Option<RelocKind> {
        Some(match byte {
            0 => RelocKind::FunctionIndexLeb,
            1 => RelocKind::TableIndexSleb,
            2 => RelocKind::TableIndexI32,
            3 => RelocKind::MemoryAddrLeb,
            4 => RelocKind::MemoryAddrSleb,
            5 => RelocKind::MemoryAddrI32,
            6 => RelocKind::TypeIndexLeb,
            7 => RelocKind::GlobalIndexLeb,
            _ => return None,
        })
    }

    /// Whether entries of this kind carry an addend.
    pub fn has_addend(self) -> bool {
        matches!(
            self,
            RelocKind::MemoryAddrLeb | RelocKind::MemoryAddrSleb | RelocKind::MemoryAddrI32
        )
    }
}

/// One relocation site within a section.
#[derive(Debug, Clone, Copy)]
pub struct RelocEntry {
    pub kind: RelocKind,
    /// Offset of the operand, relative to the section contents.
    pub offset: u32,
    /// Module-local index; a symbol index for the memory-address kinds, a
    /// function, type, global or table index otherwise.
    pub index: u32,
    /// Added to the resolved address, for the memory-address kinds.
    pub addend: i32,
}

/// Applies relocations against the merged output's index spaces and layout.
pub struct Relocator<'a> {
    modules: &'a [InputModule],
    table: &'a SymbolTable,
    spaces: &'a IndexSpaces,
    layout: &'a DataLayout,
}

impl<'a> Relocator<'a> {
    pub fn new(
        modules: &'a [InputModule],
        table: &'a SymbolTable,
        spaces: &'a IndexSpaces,
        layout: &'a DataLayout,
    ) -> Relocator<'a> {
        Relocator {
            modules,
            table,
            spaces,
            layout,
        }
    }

    /// Copies `section`'s contents and rewrites every relocation site.
    pub fn relocate(&self, section: &Section) -> Result<Vec<u8>> {
        let module = &self.modules[section.module];
        let mut bytes = module.data[section.offset..section.offset + section.size].to_vec();
        for entry in &section.relocations {
            self.apply(section.module, entry, &mut bytes)?;
        }
        Ok(bytes)
    }

    fn apply(&self, module: usize, entry: &RelocEntry, bytes: &mut [u8]) -> Result<()> {
        let offset = entry.offset as usize;
        let site = bytes.get_mut(offset..).filter(|s| !s.is_empty()).ok_or_else(|| {
            LinkError::relocation(offset, "relocation lies outside its section")
        })?;

        let value = match entry.kind {
            RelocKind::FunctionIndexLeb => self.function_index(module, entry.index)?,
            RelocKind::TypeIndexLeb => self.spaces.type_base[module] + entry.index,
            RelocKind::GlobalIndexLeb => self.global_index(module, entry.index)?,
            RelocKind::TableIndexSleb | RelocKind::TableIndexI32 => {
                self.spaces.elem_base[module] + entry.index
            }
            RelocKind::MemoryAddrLeb | RelocKind::MemoryAddrSleb | RelocKind::MemoryAddrI32 => {
                let address = self.data_address(module, entry.index, offset)?;
                address.wrapping_add_signed(entry.addend)
            }
        };
        trace!(
            "reloc {:?} at 0x{offset:x}: index {} -> {value}",
            entry.kind,
            entry.index
        );

        match entry.kind {
            RelocKind::FunctionIndexLeb
            | RelocKind::TypeIndexLeb
            | RelocKind::GlobalIndexLeb
            | RelocKind::MemoryAddrLeb => {
                let (_, width) = leb128::read_u32(site).map_err(|_| {
                    LinkError::relocation(offset, "malformed LEB128 operand")
                })?;
                let mut encoded = Vec::with_capacity(width);
                if !leb128::write_u32_fixed(&mut encoded, value, width) {
                    return Err(LinkError::relocation(
                        offset,
                        format!("value {value} does not fit the operand's {width} bytes"),
                    ));
                }
                site[..width].copy_from_slice(&encoded);
            }
            RelocKind::TableIndexSleb | RelocKind::MemoryAddrSleb => {
                let (_, width) = leb128::read_i32(site).map_err(|_| {
                    LinkError::relocation(offset, "malformed LEB128 operand")
                })?;
                let mut encoded = Vec::with_capacity(width);
                if !leb128::write_i32_fixed(&mut encoded, value as i32, width) {
                    return Err(LinkError::relocation(
                        offset,
                        format!("value {value} does not fit the operand's {width} bytes"),
                    ));
                }
                site[..width].copy_from_slice(&encoded);
            }
            RelocKind::TableIndexI32 | RelocKind::MemoryAddrI32 => {
                let site = site.get_mut(..4).ok_or_else(|| {
                    LinkError::relocation(offset, "relocation lies outside its section")
                })?;
                site.copy_from_slice(&value.to_le_bytes());
            }
        }
        Ok(())
    }

    /// Maps a module-local function index to the output function space.
    pub fn function_index(&self, module: usize, local: u32) -> Result<u32> {
        let input = &self.modules[module];
        let num_imports = input.func_imports.len() as u32;
        if local < num_imports {
            self.resolved_function(&input.func_imports[local as usize].field)
        } else {
            Ok(self.spaces.func_base[module] + (local - num_imports))
        }
    }

    /// The output function index a symbol name resolves to.
    pub fn resolved_function(&self, name: &str) -> Result<u32> {
        let symbol = self.table.find(name).ok_or_else(|| LinkError::undefined(name))?;
        match symbol.target {
            SymbolTarget::Defined { module, index } => {
                let num_imports = self.modules[module].func_imports.len() as u32;
                Ok(self.spaces.func_base[module] + (index - num_imports))
            }
            SymbolTarget::Synthetic(SyntheticValue::Function(slot)) => {
                Ok(self.spaces.synthetic_index(slot))
            }
            SymbolTarget::Undefined { .. } => self
                .spaces
                .func_imports
                .get(name)
                .copied()
                .ok_or_else(|| LinkError::undefined(name)),
            _ => Err(LinkError::undefined(name)),
        }
    }

    /// Maps a module-local global index to the output global space.
    pub fn global_index(&self, module: usize, local: u32) -> Result<u32> {
        let input = &self.modules[module];
        let num_imports = input.global_imports.len() as u32;
        if local < num_imports {
            self.resolved_global(&input.global_imports[local as usize].field)
        } else {
            Ok(self.spaces.global_base[module] + (local - num_imports))
        }
    }

    /// The output global index a symbol name resolves to.
    pub fn resolved_global(&self, name: &str) -> Result<u32> {
        let symbol = self.table.find(name).ok_or_else(|| LinkError::undefined(name))?;
        match symbol.target {
            SymbolTarget::Defined { module, index } => {
                let num_imports = self.modules[module].global_imports.len() as u32;
                Ok(self.spaces.global_base[module] + (index - num_imports))
            }
            SymbolTarget::Synthetic(SyntheticValue::StackPointer) => {
                Ok(self.spaces.stack_pointer_index())
            }
            SymbolTarget::Undefined { .. } => self
                .spaces
                .global_imports
                .get(name)
                .copied()
                .ok_or_else(|| LinkError::undefined(name)),
            _ => Err(LinkError::undefined(name)),
        }
    }

    /// Resolves a memory relocation's symbol to an absolute address.
    fn data_address(&self, module: usize, symbol_index: u32, offset: usize) -> Result<u32> {
        let input = &self.modules[module];
        let symbol = input.symbols.get(symbol_index as usize).ok_or_else(|| {
            LinkError::relocation(offset, format!("unknown symbol index {symbol_index}"))
        })?;

        // Local symbols never reach the global table; resolve them in place.
        if symbol.flags().contains(SymbolFlags::LOCAL) {
            if let ObjectSymbol::Data {
                definition: Some(def),
                name,
                ..
            } = symbol
            {
                return self
                    .layout
                    .address_of(module, def.segment, def.offset)
                    .ok_or_else(|| LinkError::undefined(&**name));
            }
            return Err(LinkError::relocation(
                offset,
                format!("local symbol {} has no address", symbol.name()),
            ));
        }

        let name = symbol.name();
        let resolved = self.table.find(name).ok_or_else(|| LinkError::undefined(name))?;
        match resolved.target {
            SymbolTarget::DefinedData {
                module,
                segment,
                offset: def_offset,
                ..
            } => self
                .layout
                .address_of(module, segment, def_offset)
                .ok_or_else(|| LinkError::undefined(name)),
            SymbolTarget::Synthetic(SyntheticValue::DataAddress(address)) => Ok(address),
            _ => Err(LinkError::undefined(name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{InputModule, Section};
    use crate::reader::SectionCode;
    use crate::symbol::SymbolTable;

    fn bare_module(name: &str, function_count: u32) -> InputModule {
        InputModule {
            name: name.to_string(),
            data: Vec::new(),
            sections: Vec::new(),
            func_imports: Vec::new(),
            global_imports: Vec::new(),
            exports: Vec::new(),
            function_count,
            table_elem_count: 0,
            elem_items: None,
            init_funcs: Vec::new(),
            symbols: Vec::new(),
            debug_names: Vec::new(),
        }
    }

    #[test]
    fn rewrites_call_operand_preserving_width() {
        let first = bare_module("a.o", 10);
        let mut second = bare_module("b.o", 3);
        // call 2, operand padded to five bytes
        second.data = vec![0x10, 0x82, 0x80, 0x80, 0x80, 0x00];
        second.sections.push(Section {
            code: SectionCode::Code,
            module: 1,
            offset: 0,
            size: 6,
            payload_offset: 0,
            payload_size: 6,
            count: 3,
            relocations: vec![RelocEntry {
                kind: RelocKind::FunctionIndexLeb,
                offset: 1,
                index: 2,
                addend: 0,
            }],
            segments: Vec::new(),
        });

        let modules = [first, second];
        let table = SymbolTable::new();
        let spaces = IndexSpaces::build(&modules, &table, 0);
        let layout = DataLayout::default();
        let relocator = Relocator::new(&modules, &table, &spaces, &layout);

        let bytes = relocator.relocate(&modules[1].sections[0]).unwrap();
        // No imports, no synthetics: b.o's functions start at index 10, so
        // local 2 becomes 12, still encoded in five bytes.
        assert_eq!(bytes, [0x10, 0x8c, 0x80, 0x80, 0x80, 0x00]);
    }

    #[test]
    fn rejects_value_wider_than_operand() {
        let mut module = bare_module("a.o", 1);
        module.data = vec![0x10, 0x00];
        module.sections.push(Section {
            code: SectionCode::Code,
            module: 0,
            offset: 0,
            size: 2,
            payload_offset: 0,
            payload_size: 2,
            count: 1,
            relocations: vec![RelocEntry {
                kind: RelocKind::FunctionIndexLeb,
                offset: 1,
                index: 200,
                addend: 0,
            }],
            segments: Vec::new(),
        });

        let modules = [module];
        let table = SymbolTable::new();
        let spaces = IndexSpaces::build(&modules, &table, 0);
        let layout = DataLayout::default();
        let relocator = Relocator::new(&modules, &table, &spaces, &layout);

        let err = relocator.relocate(&modules[0].sections[0]).unwrap_err();
        assert!(matches!(err, LinkError::Relocation { .. }));
    }
}
