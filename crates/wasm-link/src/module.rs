//! In-memory model of one relocatable input module.
//!
//! [`InputModule::parse`] drives the structural reader over a module's bytes
//! and collects the pieces the linker needs later: section locations,
//! imports, data segments, relocation entries and the object's symbol table.
//! The raw bytes are kept alongside so section payloads can be copied and
//! patched without re-decoding.

use std::ops::Range;

use crate::reader::{
    self, DataDef, ExternalKind, ModuleVisitor, SectionCode, SectionHeader, SymbolInfo, ValType,
};
use crate::relocate::RelocEntry;
use crate::symbol::SymbolFlags;
use crate::ReadError;

/// A function import: `(import "module" "field" (func (type $t)))`.
#[derive(Debug, Clone)]
pub struct FuncImport {
    pub module: String,
    pub field: String,
    pub type_index: u32,
}

/// A global import with its declared type.
#[derive(Debug, Clone)]
pub struct GlobalImport {
    pub module: String,
    pub field: String,
    pub ty: ValType,
    pub mutable: bool,
}

/// One export entry of an input module.
#[derive(Debug, Clone)]
pub struct Export {
    pub name: String,
    pub kind: ExternalKind,
    pub index: u32,
}

/// One static initializer from the `WASM_INIT_FUNCS` subsection.
#[derive(Debug, Clone, Copy)]
pub struct InitFunc {
    pub priority: u32,
    /// Index into the module's symbol table; always a defined function.
    pub symbol: u32,
}

/// One data segment of an input module.
#[derive(Debug, Clone)]
pub struct DataSegment {
    pub memory_index: u32,
    /// Segment name from `WASM_SEGMENT_INFO`, or `.data` when absent.
    pub name: String,
    /// Alignment requirement as a power of two exponent.
    pub alignment: u32,
    /// Range of the segment contents within the module's bytes.
    pub data: Range<usize>,
    /// The i32 value of the segment's offset init expression.
    pub init_offset: u32,
}

/// Function indices referenced by the module's element segment.
#[derive(Debug, Clone)]
pub struct ElementItems {
    pub count: u32,
    /// Range of the encoded indices within the module's bytes.
    pub data: Range<usize>,
}

/// A section of an input module, with any relocations that target it.
#[derive(Debug, Clone)]
pub struct Section {
    pub code: SectionCode,
    /// Index of the owning module in the linker's input list.
    pub module: usize,
    /// Range of the section contents within the module's bytes.
    pub offset: usize,
    pub size: usize,
    /// Where the items start, past the leading count for counted sections.
    pub payload_offset: usize,
    pub payload_size: usize,
    /// The leading item count, zero for custom sections.
    pub count: u32,
    /// Relocations targeting this section, from its `reloc.*` companion.
    pub relocations: Vec<RelocEntry>,
    /// Parsed segments, for the data section only.
    pub segments: Vec<DataSegment>,
}

/// One entry of an object's symbol table.
#[derive(Debug, Clone)]
pub enum ObjectSymbol {
    Function {
        flags: SymbolFlags,
        /// Index in the module's function space, imports first.
        index: u32,
        name: String,
    },
    Global {
        flags: SymbolFlags,
        index: u32,
        name: String,
    },
    Data {
        flags: SymbolFlags,
        name: String,
        definition: Option<DataDef>,
    },
}

impl ObjectSymbol {
    /// The symbol's name.
    pub fn name(&self) -> &str {
        match self {
            ObjectSymbol::Function { name, .. }
            | ObjectSymbol::Global { name, .. }
            | ObjectSymbol::Data { name, .. } => name,
        }
    }

    /// The symbol's linking flags.
    pub fn flags(&self) -> SymbolFlags {
        match self {
            ObjectSymbol::Function { flags, .. }
            | ObjectSymbol::Global { flags, .. }
            | ObjectSymbol::Data { flags, .. } => *flags,
        }
    }

    /// Whether the object defines this symbol.
    pub fn is_defined(&self) -> bool {
        !self.flags().contains(SymbolFlags::UNDEFINED)
    }
}

/// A fully decoded input module.
#[derive(Debug)]
pub struct InputModule {
    /// Display name of the input, typically its file name.
    pub name: String,
    /// The module's raw bytes; all ranges elsewhere index into this.
    pub data: Vec<u8>,
    /// All sections in file order.
    pub sections: Vec<Section>,
    pub func_imports: Vec<FuncImport>,
    pub global_imports: Vec<GlobalImport>,
    pub exports: Vec<Export>,
    /// Number of functions the module defines (imports not included).
    pub function_count: u32,
    /// Declared minimum element count of the module's table, if any.
    pub table_elem_count: u32,
    pub elem_items: Option<ElementItems>,
    pub init_funcs: Vec<InitFunc>,
    pub symbols: Vec<ObjectSymbol>,
    /// Function names from the debug `name` section, by module-local index.
    pub debug_names: Vec<(u32, String)>,
}

impl InputModule {
    /// Decodes `data` into an input module.
    ///
    /// `index` is the module's position in the linker's input list and is
    /// stamped into every [`Section`].
    pub fn parse(name: &str, index: usize, data: Vec<u8>) -> Result<InputModule, ReadError> {
        let mut builder = ModuleBuilder::new(name, index);
        reader::parse(&data, &mut builder)?;
        builder.finish(data)
    }

    /// The module's section with the given code, if present.
    pub fn section(&self, code: SectionCode) -> Option<&Section> {
        self.sections.iter().find(|s| s.code == code)
    }
}

/// Accumulates reader events into an [`InputModule`].
struct ModuleBuilder {
    module: InputModule,
    index: usize,
    /// Pending `(target, entries)` relocation groups, attached in `finish`.
    relocs: Vec<(u32, Vec<RelocEntry>)>,
    /// Pending `(segment, name, alignment)` records from `WASM_SEGMENT_INFO`.
    segment_names: Vec<(u32, String, u32)>,
}

impl ModuleBuilder {
    fn new(name: &str, index: usize) -> ModuleBuilder {
        ModuleBuilder {
            module: InputModule {
                name: name.to_string(),
                data: Vec::new(),
                sections: Vec::new(),
                func_imports: Vec::new(),
                global_imports: Vec::new(),
                exports: Vec::new(),
                function_count: 0,
                table_elem_count: 0,
                elem_items: None,
                init_funcs: Vec::new(),
                symbols: Vec::new(),
                debug_names: Vec::new(),
            },
            index,
            relocs: Vec::new(),
            segment_names: Vec::new(),
        }
    }

    fn finish(mut self, data: Vec<u8>) -> Result<InputModule, ReadError> {
        // Attach relocation groups to their target sections. The target index
        // counts every section of the file, custom sections included.
        for (target, entries) in self.relocs {
            let section = self
                .module
                .sections
                .get_mut(target as usize)
                .ok_or_else(|| {
                    ReadError::new(format!("relocation targets unknown section {target}"), 0)
                })?;
            // A section may be targeted by more than one reloc.* group.
            section.relocations.extend(entries);
        }

        // Apply segment names and alignments recorded by the linking section.
        if !self.segment_names.is_empty() {
            let data_section = self
                .module
                .sections
                .iter_mut()
                .find(|s| s.code == SectionCode::Data)
                .ok_or_else(|| ReadError::new("segment info without a data section", 0))?;
            for (index, name, alignment) in self.segment_names.drain(..) {
                // The exponent feeds `1 << alignment`; anything past 31 is
                // unrepresentable in a wasm32 address space.
                if alignment > 31 {
                    return Err(ReadError::new(
                        format!("segment {name} alignment 2^{alignment} is out of range"),
                        0,
                    ));
                }
                let segment = data_section.segments.get_mut(index as usize).ok_or_else(|| {
                    ReadError::new(format!("segment info for unknown segment {index}"), 0)
                })?;
                segment.name = name;
                segment.alignment = alignment;
            }
        }

        let num_func_imports = self.module.func_imports.len() as u32;
        let num_global_imports = self.module.global_imports.len() as u32;
        let num_global_defs = self
            .module
            .section(SectionCode::Global)
            .map(|s| s.count)
            .unwrap_or(0);
        let num_segments = self
            .module
            .section(SectionCode::Data)
            .map(|s| s.segments.len() as u32)
            .unwrap_or(0);

        if let Some(code) = self.module.section(SectionCode::Code) {
            if code.count != self.module.function_count {
                return Err(ReadError::new(
                    format!(
                        "function section declares {} functions but code section has {}",
                        self.module.function_count, code.count
                    ),
                    code.offset,
                ));
            }
        } else if self.module.function_count != 0 {
            return Err(ReadError::new("function section without a code section", 0));
        }

        // Resolve symbol names and validate indices. Unnamed undefined
        // function and global symbols take their import's field name.
        for symbol in &mut self.module.symbols {
            match symbol {
                ObjectSymbol::Function { flags, index, name } => {
                    let total = num_func_imports + self.module.function_count;
                    if *index >= total {
                        return Err(ReadError::new(
                            format!("function symbol index {index} out of range"),
                            0,
                        ));
                    }
                    if !flags.contains(SymbolFlags::UNDEFINED) && *index < num_func_imports {
                        return Err(ReadError::new(
                            format!("defined function symbol refers to import {index}"),
                            0,
                        ));
                    }
                    if name.is_empty() {
                        if flags.contains(SymbolFlags::UNDEFINED) && *index < num_func_imports {
                            *name = self.module.func_imports[*index as usize].field.clone();
                        } else {
                            return Err(self_err("unnamed function symbol", *index));
                        }
                    }
                }
                ObjectSymbol::Global { flags, index, name } => {
                    let total = num_global_imports + num_global_defs;
                    if *index >= total {
                        return Err(ReadError::new(
                            format!("global symbol index {index} out of range"),
                            0,
                        ));
                    }
                    if !flags.contains(SymbolFlags::UNDEFINED) && *index < num_global_imports {
                        return Err(ReadError::new(
                            format!("defined global symbol refers to import {index}"),
                            0,
                        ));
                    }
                    if name.is_empty() {
                        if flags.contains(SymbolFlags::UNDEFINED) && *index < num_global_imports {
                            *name = self.module.global_imports[*index as usize].field.clone();
                        } else {
                            return Err(self_err("unnamed global symbol", *index));
                        }
                    }
                }
                ObjectSymbol::Data { definition, name, .. } => {
                    if let Some(def) = definition {
                        if def.segment >= num_segments {
                            return Err(ReadError::new(
                                format!("data symbol {name} references unknown segment"),
                                0,
                            ));
                        }
                    }
                }
            }
        }

        // Init functions must name defined function symbols.
        for init in &self.module.init_funcs {
            match self.module.symbols.get(init.symbol as usize) {
                Some(ObjectSymbol::Function { flags, .. })
                    if !flags.contains(SymbolFlags::UNDEFINED) => {}
                _ => {
                    return Err(ReadError::new(
                        format!("init function references symbol {} which is not a defined function", init.symbol),
                        0,
                    ))
                }
            }
        }

        self.module.data = data;
        Ok(self.module)
    }
}

fn self_err(what: &str, index: u32) -> ReadError {
    ReadError::new(format!("{what} at index {index}"), 0)
}

impl ModuleVisitor for ModuleBuilder {
    fn begin_section(&mut self, header: SectionHeader) {
        self.module.sections.push(Section {
            code: header.code,
            module: self.index,
            offset: header.offset,
            size: header.size,
            payload_offset: header.payload_offset.unwrap_or(header.offset),
            payload_size: header.payload_size.unwrap_or(header.size),
            count: header.count.unwrap_or(0),
            relocations: Vec::new(),
            segments: Vec::new(),
        });
    }

    fn import_func(&mut self, module: &str, field: &str, type_index: u32) {
        self.module.func_imports.push(FuncImport {
            module: module.to_string(),
            field: field.to_string(),
            type_index,
        });
    }

    fn import_global(&mut self, module: &str, field: &str, ty: ValType, mutable: bool) {
        self.module.global_imports.push(GlobalImport {
            module: module.to_string(),
            field: field.to_string(),
            ty,
            mutable,
        });
    }

    fn function_count(&mut self, count: u32) {
        self.module.function_count = count;
    }

    fn table(&mut self, element_count: u32) {
        self.module.table_elem_count = element_count;
    }

    fn memory(&mut self, _initial_pages: u32) {}

    fn export(&mut self, name: &str, kind: ExternalKind, index: u32) {
        self.module.exports.push(Export {
            name: name.to_string(),
            kind,
            index,
        });
    }

    fn element_items(&mut self, count: u32, payload_offset: usize, payload_size: usize) {
        self.module.elem_items = Some(ElementItems {
            count,
            data: payload_offset..payload_offset + payload_size,
        });
    }

    fn data_segment(&mut self, memory_index: u32, init_offset: u32, data_offset: usize, size: usize) {
        if let Some(section) = self.module.sections.last_mut() {
            section.segments.push(DataSegment {
                memory_index,
                name: ".data".to_string(),
                alignment: 0,
                data: data_offset..data_offset + size,
                init_offset,
            });
        }
    }

    fn segment_info(&mut self, index: u32, name: &str, alignment: u32, _flags: u32) {
        self.segment_names.push((index, name.to_string(), alignment));
    }

    fn init_func(&mut self, priority: u32, symbol_index: u32) {
        self.module.init_funcs.push(InitFunc {
            priority,
            symbol: symbol_index,
        });
    }

    fn symbol(&mut self, info: SymbolInfo<'_>) {
        let symbol = match info {
            SymbolInfo::Function { flags, index, name } => ObjectSymbol::Function {
                flags,
                index,
                name: name.unwrap_or("").to_string(),
            },
            SymbolInfo::Global { flags, index, name } => ObjectSymbol::Global {
                flags,
                index,
                name: name.unwrap_or("").to_string(),
            },
            SymbolInfo::Data {
                flags,
                name,
                definition,
            } => ObjectSymbol::Data {
                flags,
                name: name.to_string(),
                definition,
            },
        };
        self.module.symbols.push(symbol);
    }

    fn reloc_section(&mut self, target_section: u32) {
        self.relocs.push((target_section, Vec::new()));
    }

    fn reloc(&mut self, entry: RelocEntry) {
        if let Some((_, entries)) = self.relocs.last_mut() {
            entries.push(entry);
        }
    }

    fn function_name(&mut self, index: u32, name: &str) {
        self.module.debug_names.push((index, name.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leb128;

    fn section(id: u8, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![id];
        leb128::write_u32(&mut bytes, payload.len() as u32);
        bytes.extend_from_slice(payload);
        bytes
    }

    fn custom(name: &str, payload: &[u8]) -> Vec<u8> {
        let mut contents = Vec::new();
        leb128::write_u32(&mut contents, name.len() as u32);
        contents.extend_from_slice(name.as_bytes());
        contents.extend_from_slice(payload);
        section(0, &contents)
    }

    fn module(sections: &[Vec<u8>]) -> Vec<u8> {
        let mut bytes = b"\0asm\x01\0\0\0".to_vec();
        for section in sections {
            bytes.extend_from_slice(section);
        }
        bytes
    }

    #[test]
    fn collects_sections_and_segments() {
        let mut data = vec![1]; // one segment
        data.extend_from_slice(&[0x00, 0x41, 0x00, 0x0b, 4, 1, 2, 3, 4]);
        let mut linking = vec![2]; // metadata version
        let mut seginfo = vec![1];
        seginfo.extend_from_slice(b"\x05.text");
        seginfo.extend_from_slice(&[2, 0]); // align 2^2, flags 0
        linking.push(5); // WASM_SEGMENT_INFO
        leb128::write_u32(&mut linking, seginfo.len() as u32);
        linking.extend_from_slice(&seginfo);
        let bytes = module(&[section(11, &data), custom("linking", &linking)]);

        let module = InputModule::parse("a.o", 0, bytes).unwrap();
        let data_section = module.section(SectionCode::Data).unwrap();
        assert_eq!(data_section.segments.len(), 1);
        let segment = &data_section.segments[0];
        assert_eq!(segment.name, ".text");
        assert_eq!(segment.alignment, 2);
        assert_eq!(&module.data[segment.data.clone()], &[1, 2, 3, 4]);
        assert_eq!(data_section.module, 0);
    }

    #[test]
    fn names_undefined_function_symbols_from_imports() {
        let mut import = vec![1];
        import.extend_from_slice(b"\x03env\x04puts\x00\x00");
        let mut linking = vec![2];
        let mut symtab = vec![1]; // one symbol
        symtab.extend_from_slice(&[0, 0x10, 0]); // function, UNDEFINED, index 0
        linking.push(8); // WASM_SYMBOL_TABLE
        leb128::write_u32(&mut linking, symtab.len() as u32);
        linking.extend_from_slice(&symtab);
        let bytes = module(&[
            section(1, &[1, 0x60, 0, 0]),
            section(2, &import),
            custom("linking", &linking),
        ]);

        let module = InputModule::parse("a.o", 0, bytes).unwrap();
        assert_eq!(module.symbols.len(), 1);
        assert_eq!(module.symbols[0].name(), "puts");
        assert!(!module.symbols[0].is_defined());
    }

    #[test]
    fn rejects_mismatched_code_count() {
        let bytes = module(&[
            section(1, &[1, 0x60, 0, 0]),
            section(3, &[2, 0, 0]),
            section(10, &[1, 2, 0, 0x0b]),
        ]);
        let err = InputModule::parse("a.o", 0, bytes).unwrap_err();
        assert!(err.message().contains("code section"));
    }

    #[test]
    fn rejects_defined_symbols_in_the_import_range() {
        // A defined function symbol must not point at an import slot.
        let mut import = vec![1];
        import.extend_from_slice(b"\x03env\x04puts\x00\x00");
        let mut symtab = vec![1];
        symtab.extend_from_slice(&[0, 0x20, 0]); // function, EXPORTED, index 0
        symtab.extend_from_slice(b"\x04puts");
        let mut linking = vec![2, 8];
        leb128::write_u32(&mut linking, symtab.len() as u32);
        linking.extend_from_slice(&symtab);
        let bytes = module(&[
            section(1, &[1, 0x60, 0, 0]),
            section(2, &import),
            section(3, &[1, 0]),
            section(10, &[1, 2, 0, 0x0b]),
            custom("linking", &linking),
        ]);
        let err = InputModule::parse("a.o", 0, bytes).unwrap_err();
        assert!(err.message().contains("refers to import"));

        // Same for a defined global symbol against a global import.
        let mut import = vec![1];
        import.extend_from_slice(b"\x03env\x01g\x03\x7f\x00");
        let mut symtab = vec![1];
        symtab.extend_from_slice(&[2, 0, 0]); // global, defined, index 0
        symtab.extend_from_slice(b"\x01g");
        let mut linking = vec![2, 8];
        leb128::write_u32(&mut linking, symtab.len() as u32);
        linking.extend_from_slice(&symtab);
        let bytes = module(&[section(2, &import), custom("linking", &linking)]);
        let err = InputModule::parse("a.o", 0, bytes).unwrap_err();
        assert!(err.message().contains("refers to import"));
    }

    #[test]
    fn rejects_oversized_segment_alignment() {
        let mut data = vec![1];
        data.extend_from_slice(&[0x00, 0x41, 0x00, 0x0b, 2, 1, 2]);
        let mut seginfo = vec![1];
        seginfo.extend_from_slice(b"\x05.data");
        seginfo.extend_from_slice(&[40, 0]); // align 2^40
        let mut linking = vec![2, 5];
        leb128::write_u32(&mut linking, seginfo.len() as u32);
        linking.extend_from_slice(&seginfo);
        let bytes = module(&[section(11, &data), custom("linking", &linking)]);
        let err = InputModule::parse("a.o", 0, bytes).unwrap_err();
        assert!(err.message().contains("alignment"));
    }

    #[test]
    fn accumulates_reloc_groups_for_one_section() {
        let mut first = Vec::new();
        leb128::write_u32(&mut first, 0); // target: the type section
        leb128::write_u32(&mut first, 1);
        first.extend_from_slice(&[6, 1, 0]); // type index at offset 1
        let mut second = Vec::new();
        leb128::write_u32(&mut second, 0);
        leb128::write_u32(&mut second, 1);
        second.extend_from_slice(&[6, 2, 0]);
        let bytes = module(&[
            section(1, &[1, 0x60, 0, 0]),
            custom("reloc.TYPE", &first),
            custom("reloc.TYPE", &second),
        ]);
        let module = InputModule::parse("a.o", 0, bytes).unwrap();
        let relocs = &module.section(SectionCode::Type).unwrap().relocations;
        assert_eq!(relocs.len(), 2);
        assert_eq!((relocs[0].offset, relocs[1].offset), (1, 2));
    }

    #[test]
    fn rejects_reloc_against_missing_section() {
        let mut reloc = Vec::new();
        leb128::write_u32(&mut reloc, 9); // no such section
        leb128::write_u32(&mut reloc, 0);
        let bytes = module(&[section(1, &[1, 0x60, 0, 0]), custom("reloc.CODE", &reloc)]);
        let err = InputModule::parse("a.o", 0, bytes).unwrap_err();
        assert!(err.message().contains("unknown section"));
    }
}
