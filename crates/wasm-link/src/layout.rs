//! Placement of input data segments in the output's linear memory.
//!
//! Segments with the same name are merged into one output segment, keeping
//! input order, and output segments are placed back to back from address zero.
//! Every chunk records where its bytes land so data symbols and memory
//! relocations can be turned into absolute addresses.

use std::collections::HashMap;

use indexmap::IndexMap;
use log::debug;

use crate::module::InputModule;
use crate::reader::SectionCode;

/// Size of one linear memory page.
pub const PAGE_SIZE: u32 = 0x10000;

/// Rounds `value` up to the next multiple of `align`, a power of two.
pub fn align_up(value: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// One input segment's bytes within an output segment.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// The contributing module.
    pub module: usize,
    /// Index of the module's data section within its section list.
    pub section: usize,
    /// Range of the chunk's bytes within the module's data.
    pub data: std::ops::Range<usize>,
    /// Offset of the chunk within its output segment.
    pub offset: u32,
    pub size: u32,
}

/// A merged output segment.
#[derive(Debug, Clone)]
pub struct OutputSegment {
    pub name: String,
    /// The largest alignment exponent of any contributing chunk.
    pub alignment: u32,
    /// Start address in linear memory.
    pub start: u32,
    /// Total size, padding between chunks included.
    pub size: u32,
    pub chunks: Vec<Chunk>,
}

/// The complete memory plan of the output module.
#[derive(Debug, Default)]
pub struct DataLayout {
    /// Output segments in first-contribution order.
    pub segments: Vec<OutputSegment>,
    /// End of static data, before the shadow stack.
    pub static_size: u32,
    /// Initial page count of the output memory.
    pub memory_pages: u32,
    /// Initial value of the shadow stack pointer.
    pub stack_pointer: u32,
    /// `(module, input segment ordinal)` to `(segment, chunk)` positions.
    chunk_index: HashMap<(usize, u32), (usize, usize)>,
}

impl DataLayout {
    /// Plans the output memory for `modules`, in input order.
    pub fn build(modules: &[InputModule]) -> DataLayout {
        let mut segments: IndexMap<String, OutputSegment> = IndexMap::new();
        let mut chunk_index = HashMap::new();

        for (module_index, module) in modules.iter().enumerate() {
            let Some((section_index, section)) = module
                .sections
                .iter()
                .enumerate()
                .find(|(_, s)| s.code == SectionCode::Data)
            else {
                continue;
            };
            for (ordinal, input) in section.segments.iter().enumerate() {
                let seg_index = match segments.get_index_of(&input.name) {
                    Some(index) => index,
                    None => {
                        segments.insert(
                            input.name.clone(),
                            OutputSegment {
                                name: input.name.clone(),
                                alignment: 0,
                                start: 0,
                                size: 0,
                                chunks: Vec::new(),
                            },
                        );
                        segments.len() - 1
                    }
                };
                let output = &mut segments[seg_index];
                output.alignment = output.alignment.max(input.alignment);
                let offset = align_up(output.size, 1 << input.alignment);
                let size = input.data.len() as u32;
                chunk_index.insert(
                    (module_index, ordinal as u32),
                    (seg_index, output.chunks.len()),
                );
                output.chunks.push(Chunk {
                    module: module_index,
                    section: section_index,
                    data: input.data.clone(),
                    offset,
                    size,
                });
                output.size = offset + size;
            }
        }

        let mut address = 0u32;
        let mut segments: Vec<OutputSegment> = segments.into_values().collect();
        for segment in &mut segments {
            address = align_up(address, 1 << segment.alignment);
            segment.start = address;
            address += segment.size;
            debug!(
                "placed segment {} at 0x{:x}, {} bytes",
                segment.name, segment.start, segment.size
            );
        }

        let static_size = address;
        let stack_pointer = align_up(static_size + PAGE_SIZE, 16);
        let memory_pages = (static_size + PAGE_SIZE).div_ceil(PAGE_SIZE);
        DataLayout {
            segments,
            static_size,
            memory_pages,
            stack_pointer,
            chunk_index,
        }
    }

    /// The absolute address of `offset` within an input segment, or `None`
    /// when the module has no such segment.
    pub fn address_of(&self, module: usize, segment: u32, offset: u32) -> Option<u32> {
        let (seg, chunk) = *self.chunk_index.get(&(module, segment))?;
        let segment = &self.segments[seg];
        Some(segment.start + segment.chunks[chunk].offset + offset)
    }
}

/// The merged index spaces of the output module.
///
/// Each input's types, functions, globals and table slots land at a fixed
/// base offset in the output; relocation rewrites module-local indices by
/// adding the owning module's base. Function and global spaces open with the
/// imports that survive resolution, functions followed by the linker's own
/// generated functions.
#[derive(Debug, Default)]
pub struct IndexSpaces {
    /// Output import index by symbol name, for functions still undefined.
    pub func_imports: IndexMap<String, u32>,
    /// Output import index by symbol name, for globals still undefined.
    pub global_imports: IndexMap<String, u32>,
    /// Per-module base in the output type space.
    pub type_base: Vec<u32>,
    /// Per-module output index of the module's first defined function.
    pub func_base: Vec<u32>,
    /// Per-module output index of the module's first defined global.
    pub global_base: Vec<u32>,
    /// Per-module base of the module's table slots.
    pub elem_base: Vec<u32>,
    /// Total number of input type entries across all modules.
    pub total_types: u32,
    /// Number of linker-generated functions.
    pub num_synthetic: u32,
    /// Total table slots across all modules.
    pub total_elem_items: u32,
    /// Declared minimum table size of the output.
    pub table_size: u32,
    total_module_globals: u32,
}

impl IndexSpaces {
    /// Computes the bases for `modules` given the resolved symbol `table` and
    /// the number of linker-generated functions.
    pub fn build(
        modules: &[InputModule],
        table: &crate::symbol::SymbolTable,
        num_synthetic: u32,
    ) -> IndexSpaces {
        use crate::symbol::{SymbolKind, SymbolTarget};

        let mut spaces = IndexSpaces {
            num_synthetic,
            ..IndexSpaces::default()
        };

        // Imports first, in symbol-table order for determinism.
        for symbol in table.iter() {
            if !matches!(symbol.target, SymbolTarget::Undefined { .. }) {
                continue;
            }
            match symbol.kind {
                SymbolKind::Function => {
                    let next = spaces.func_imports.len() as u32;
                    spaces.func_imports.entry(symbol.name.clone()).or_insert(next);
                }
                SymbolKind::Global => {
                    let next = spaces.global_imports.len() as u32;
                    spaces.global_imports.entry(symbol.name.clone()).or_insert(next);
                }
                // Undefined data symbols fail later, when a relocation or
                // export actually needs an address for them.
                SymbolKind::Data => {}
            }
        }

        let mut types = 0u32;
        let mut funcs = spaces.func_imports.len() as u32 + num_synthetic;
        let mut globals = spaces.global_imports.len() as u32;
        let mut elems = 0u32;
        let mut declared_table = 0u32;
        for module in modules {
            spaces.type_base.push(types);
            spaces.func_base.push(funcs);
            spaces.global_base.push(globals);
            spaces.elem_base.push(elems);
            types += module.section(SectionCode::Type).map(|s| s.count).unwrap_or(0);
            funcs += module.function_count;
            globals += module.section(SectionCode::Global).map(|s| s.count).unwrap_or(0);
            elems += module.elem_items.as_ref().map(|e| e.count).unwrap_or(0);
            declared_table = declared_table.max(module.table_elem_count);
        }
        spaces.total_types = types;
        spaces.total_elem_items = elems;
        spaces.table_size = declared_table.max(elems);
        spaces.total_module_globals = globals - spaces.global_imports.len() as u32;
        spaces
    }

    /// Output type index of the `() -> ()` entry the linker appends.
    pub fn void_type_index(&self) -> u32 {
        self.total_types
    }

    /// Output index of the shadow stack pointer global, placed after every
    /// input global.
    pub fn stack_pointer_index(&self) -> u32 {
        self.global_imports.len() as u32 + self.total_module_globals
    }

    /// Output function index of the linker-generated function in `slot`.
    pub fn synthetic_index(&self, slot: u32) -> u32 {
        self.func_imports.len() as u32 + slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leb128;
    use crate::module::InputModule;

    fn module_with_segments(index: usize, segments: &[(&str, u32, &[u8])]) -> InputModule {
        let mut data_payload = Vec::new();
        leb128::write_u32(&mut data_payload, segments.len() as u32);
        for (_, _, bytes) in segments {
            data_payload.extend_from_slice(&[0x00, 0x41, 0x00, 0x0b]);
            leb128::write_u32(&mut data_payload, bytes.len() as u32);
            data_payload.extend_from_slice(bytes);
        }
        let mut seginfo = Vec::new();
        leb128::write_u32(&mut seginfo, segments.len() as u32);
        for (name, align, _) in segments {
            leb128::write_u32(&mut seginfo, name.len() as u32);
            seginfo.extend_from_slice(name.as_bytes());
            leb128::write_u32(&mut seginfo, *align);
            seginfo.push(0);
        }
        let mut linking = vec![2, 5];
        leb128::write_u32(&mut linking, seginfo.len() as u32);
        linking.extend_from_slice(&seginfo);
        let mut custom = Vec::new();
        custom.extend_from_slice(b"\x07linking");
        custom.extend_from_slice(&linking);

        let mut bytes = b"\0asm\x01\0\0\0".to_vec();
        bytes.push(11);
        leb128::write_u32(&mut bytes, data_payload.len() as u32);
        bytes.extend_from_slice(&data_payload);
        bytes.push(0);
        leb128::write_u32(&mut bytes, custom.len() as u32);
        bytes.extend_from_slice(&custom);
        InputModule::parse("test.o", index, bytes).unwrap()
    }

    #[test]
    fn merges_segments_by_name() {
        let a = module_with_segments(0, &[(".data", 0, &[1, 2, 3, 4])]);
        let b = module_with_segments(1, &[(".data", 0, &[5, 6]), (".bss", 0, &[0; 8])]);
        let layout = DataLayout::build(&[a, b]);

        assert_eq!(layout.segments.len(), 2);
        assert_eq!(layout.segments[0].name, ".data");
        assert_eq!(layout.segments[0].size, 6);
        assert_eq!(layout.segments[1].name, ".bss");
        assert_eq!(layout.segments[1].start, 6);
        assert_eq!(layout.static_size, 14);
        assert_eq!(layout.address_of(1, 0, 1), Some(5));
        assert_eq!(layout.address_of(1, 1, 0), Some(6));
        assert_eq!(layout.address_of(2, 0, 0), None);
    }

    #[test]
    fn respects_chunk_alignment() {
        let a = module_with_segments(0, &[(".data", 0, &[1, 2, 3])]);
        let b = module_with_segments(1, &[(".data", 3, &[9; 4])]);
        let layout = DataLayout::build(&[a, b]);

        let segment = &layout.segments[0];
        assert_eq!(segment.alignment, 3);
        assert_eq!(segment.chunks[1].offset, 8);
        assert_eq!(segment.size, 12);
    }

    #[test]
    fn stack_sits_one_page_past_static_data() {
        let a = module_with_segments(0, &[(".data", 0, &[7; 100])]);
        let layout = DataLayout::build(&[a]);
        assert_eq!(layout.static_size, 100);
        assert_eq!(layout.stack_pointer, align_up(100 + PAGE_SIZE, 16));
        assert_eq!(layout.memory_pages, 2);

        let empty = DataLayout::build(&[]);
        assert_eq!(empty.memory_pages, 1);
        assert_eq!(empty.stack_pointer, PAGE_SIZE);
    }
}
