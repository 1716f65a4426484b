//! Assembly of the linked output module.
//!
//! Sections are emitted in canonical order, each one built from the inputs'
//! relocated section contents plus whatever the linker adds itself: merged
//! imports, generated function bodies, the combined table and memory, the
//! shadow stack pointer and the laid-out data segments.

use std::collections::{BTreeMap, HashMap};

use indexmap::IndexMap;
use log::debug;

use crate::layout::{DataLayout, IndexSpaces};
use crate::module::{InputModule, Section};
use crate::reader::{BinaryReader, ExternalKind, SectionCode};
use crate::relocate::Relocator;
use crate::symbol::{
    SymbolKind, SymbolTable, SymbolTarget, SyntheticBody, SyntheticFunction, SyntheticSignature,
    CALL_CTORS,
};
use crate::writer::{BinaryWriter, OutputStream};
use crate::{LinkError, Result};

const OP_UNREACHABLE: u8 = 0x00;
const OP_CALL: u8 = 0x10;
const OP_END: u8 = 0x0b;

const FUNC_TYPE: u8 = 0x60;
const FUNCREF: u8 = 0x70;
const I32_TYPE: u8 = 0x7f;

const ENTRY_POINT: &str = "_start";

/// Emits the linked module from the merge results.
pub struct OutputWriter<'a> {
    pub modules: &'a [InputModule],
    pub table: &'a SymbolTable,
    pub spaces: &'a IndexSpaces,
    pub layout: &'a DataLayout,
    pub synthetic: &'a [SyntheticFunction],
    /// Extra symbols to export, beyond those flagged in the inputs.
    pub export_symbols: &'a [String],
    pub emit_names: bool,
}

impl<'a> OutputWriter<'a> {
    /// Writes the complete output module to `stream`.
    pub fn write(&self, stream: &mut dyn OutputStream) -> Result<()> {
        let relocator = Relocator::new(self.modules, self.table, self.spaces, self.layout);
        let mut writer = BinaryWriter::new(stream);
        writer.write_header()?;
        self.write_types(&mut writer)?;
        self.write_imports(&mut writer)?;
        self.write_functions(&mut writer)?;
        self.write_table(&mut writer)?;
        self.write_memory(&mut writer)?;
        self.write_globals(&mut writer, &relocator)?;
        self.write_exports(&mut writer, &relocator)?;
        self.write_start(&mut writer, &relocator)?;
        self.write_elements(&mut writer, &relocator)?;
        self.write_code(&mut writer, &relocator)?;
        self.write_data(&mut writer, &relocator)?;
        if self.emit_names {
            self.write_names(&mut writer, &relocator)?;
        }
        Ok(())
    }

    fn payload<'m>(&self, section: &Section, module: &'m InputModule) -> &'m [u8] {
        &module.data[section.payload_offset..section.payload_offset + section.payload_size]
    }

    /// The items of a relocated section's contents, with the count stripped.
    fn relocated_payload(section: &Section, relocated: &[u8]) -> Vec<u8> {
        relocated[section.payload_offset - section.offset..].to_vec()
    }

    fn needs_void_type(&self) -> bool {
        self.synthetic
            .iter()
            .any(|f| matches!(f.signature, SyntheticSignature::Void))
    }

    fn write_types(&self, writer: &mut BinaryWriter<'_>) -> Result<()> {
        let count = self.spaces.total_types + u32::from(self.needs_void_type());
        if count == 0 {
            return Ok(());
        }
        let section = writer.begin_section(SectionCode::Type)?;
        writer.write_u32_leb(count)?;
        for module in self.modules {
            if let Some(types) = module.section(SectionCode::Type) {
                writer.write_raw(self.payload(types, module))?;
            }
        }
        if self.needs_void_type() {
            writer.write_raw(&[FUNC_TYPE, 0x00, 0x00])?;
        }
        writer.end_section(section)
    }

    fn write_imports(&self, writer: &mut BinaryWriter<'_>) -> Result<()> {
        let count = self.spaces.func_imports.len() + self.spaces.global_imports.len();
        if count == 0 {
            return Ok(());
        }
        let section = writer.begin_section(SectionCode::Import)?;
        writer.write_u32_leb(count as u32)?;
        for name in self.spaces.func_imports.keys() {
            let Some(symbol) = self.table.find(name) else {
                continue;
            };
            let SymbolTarget::Undefined { module, index } = symbol.target else {
                continue;
            };
            let import = &self.modules[module].func_imports[index as usize];
            debug!("importing undefined function {name}");
            writer.write_str(&import.module)?;
            writer.write_str(&import.field)?;
            writer.write_u8(ExternalKind::Func as u8)?;
            writer.write_u32_leb(self.spaces.type_base[module] + import.type_index)?;
        }
        for name in self.spaces.global_imports.keys() {
            let Some(symbol) = self.table.find(name) else {
                continue;
            };
            let SymbolTarget::Undefined { module, index } = symbol.target else {
                continue;
            };
            let import = &self.modules[module].global_imports[index as usize];
            debug!("importing undefined global {name}");
            writer.write_str(&import.module)?;
            writer.write_str(&import.field)?;
            writer.write_u8(ExternalKind::Global as u8)?;
            writer.write_u8(import.ty as u8)?;
            writer.write_u8(u8::from(import.mutable))?;
        }
        writer.end_section(section)
    }

    fn synthetic_type_index(&self, signature: SyntheticSignature) -> u32 {
        match signature {
            SyntheticSignature::Void => self.spaces.void_type_index(),
            SyntheticSignature::Imported { module, type_index } => {
                self.spaces.type_base[module] + type_index
            }
        }
    }

    fn write_functions(&self, writer: &mut BinaryWriter<'_>) -> Result<()> {
        let count = self.spaces.num_synthetic
            + self.modules.iter().map(|m| m.function_count).sum::<u32>();
        if count == 0 {
            return Ok(());
        }
        let section = writer.begin_section(SectionCode::Function)?;
        writer.write_u32_leb(count)?;
        for function in self.synthetic {
            writer.write_u32_leb(self.synthetic_type_index(function.signature))?;
        }
        // Declared type indices are rebased by decoding and re-encoding; the
        // entries are plain varints with no relocation entries of their own.
        for (index, module) in self.modules.iter().enumerate() {
            let Some(funcs) = module.section(SectionCode::Function) else {
                continue;
            };
            let mut reader = BinaryReader::new(self.payload(funcs, module), funcs.payload_offset);
            for _ in 0..funcs.count {
                let type_index = reader
                    .read_var_u32()
                    .map_err(|error| self.parse_error(module, error))?;
                writer.write_u32_leb(self.spaces.type_base[index] + type_index)?;
            }
        }
        writer.end_section(section)
    }

    fn write_table(&self, writer: &mut BinaryWriter<'_>) -> Result<()> {
        if self.spaces.table_size == 0 {
            return Ok(());
        }
        let section = writer.begin_section(SectionCode::Table)?;
        writer.write_u32_leb(1)?;
        writer.write_u8(FUNCREF)?;
        writer.write_u8(0)?; // no maximum
        writer.write_u32_leb(self.spaces.table_size)?;
        writer.end_section(section)
    }

    fn write_memory(&self, writer: &mut BinaryWriter<'_>) -> Result<()> {
        let section = writer.begin_section(SectionCode::Memory)?;
        writer.write_u32_leb(1)?;
        writer.write_u8(0)?; // no maximum
        writer.write_u32_leb(self.layout.memory_pages)?;
        writer.end_section(section)
    }

    fn write_globals(
        &self,
        writer: &mut BinaryWriter<'_>,
        relocator: &Relocator<'_>,
    ) -> Result<()> {
        let count = self.spaces.stack_pointer_index() + 1
            - self.spaces.global_imports.len() as u32;
        let section = writer.begin_section(SectionCode::Global)?;
        writer.write_u32_leb(count)?;
        for module in self.modules {
            if let Some(globals) = module.section(SectionCode::Global) {
                let relocated = relocator.relocate(globals)?;
                writer.write_raw(&Self::relocated_payload(globals, &relocated))?;
            }
        }
        // The shadow stack pointer, mutable and pointing one page past the
        // static data.
        writer.write_u8(I32_TYPE)?;
        writer.write_u8(1)?;
        writer.write_i32_const_expr(self.layout.stack_pointer as i32)?;
        writer.end_section(section)
    }

    fn write_exports(
        &self,
        writer: &mut BinaryWriter<'_>,
        relocator: &Relocator<'_>,
    ) -> Result<()> {
        // Name-keyed so a later export of the same name replaces an earlier
        // one, in insertion order otherwise.
        let mut exports: IndexMap<&str, (ExternalKind, u32)> = IndexMap::new();
        exports.insert("memory", (ExternalKind::Memory, 0));

        if let Some(symbol) = self.table.find(ENTRY_POINT) {
            if symbol.is_defined() && symbol.kind == SymbolKind::Function {
                exports.insert(ENTRY_POINT, (ExternalKind::Func, relocator.resolved_function(ENTRY_POINT)?));
            }
        }

        for symbol in self.table.iter() {
            if !symbol.is_exported() || !symbol.is_defined() {
                continue;
            }
            match symbol.kind {
                SymbolKind::Function => {
                    let index = relocator.resolved_function(&symbol.name)?;
                    exports.insert(symbol.name.as_str(), (ExternalKind::Func, index));
                }
                SymbolKind::Global => {
                    let index = relocator.resolved_global(&symbol.name)?;
                    exports.insert(symbol.name.as_str(), (ExternalKind::Global, index));
                }
                // Data symbols have no export representation; their
                // addresses travel through relocations instead.
                SymbolKind::Data => {}
            }
        }

        for name in self.export_symbols {
            match self.table.find(name) {
                Some(symbol) if symbol.is_defined() && symbol.kind == SymbolKind::Function => {
                    let index = relocator.resolved_function(name)?;
                    exports.insert(name.as_str(), (ExternalKind::Func, index));
                }
                _ => return Err(LinkError::undefined(&**name)),
            }
        }

        let section = writer.begin_section(SectionCode::Export)?;
        writer.write_u32_leb(exports.len() as u32)?;
        for (name, (kind, index)) in &exports {
            debug!("exporting {name} as {kind:?} {index}");
            writer.write_str(name)?;
            writer.write_u8(*kind as u8)?;
            writer.write_u32_leb(*index)?;
        }
        writer.end_section(section)
    }

    fn write_start(&self, writer: &mut BinaryWriter<'_>, relocator: &Relocator<'_>) -> Result<()> {
        let target = if self.table.find(CALL_CTORS).is_some_and(|s| s.is_defined()) {
            Some(relocator.resolved_function(CALL_CTORS)?)
        } else {
            None
        };
        let Some(index) = target else {
            return Ok(());
        };
        let section = writer.begin_section(SectionCode::Start)?;
        writer.write_u32_leb(index)?;
        writer.end_section(section)
    }

    fn write_elements(
        &self,
        writer: &mut BinaryWriter<'_>,
        relocator: &Relocator<'_>,
    ) -> Result<()> {
        if self.spaces.total_elem_items == 0 {
            return Ok(());
        }
        let section = writer.begin_section(SectionCode::Element)?;
        writer.write_u32_leb(1)?; // a single merged segment
        writer.write_u32_leb(0)?; // table 0
        writer.write_i32_const_expr(0)?;
        writer.write_u32_leb(self.spaces.total_elem_items)?;
        for (index, module) in self.modules.iter().enumerate() {
            let Some(items) = &module.elem_items else {
                continue;
            };
            let mut reader =
                BinaryReader::new(&module.data[items.data.clone()], items.data.start);
            for _ in 0..items.count {
                let local = reader
                    .read_var_u32()
                    .map_err(|error| self.parse_error(module, error))?;
                writer.write_u32_leb(relocator.function_index(index, local)?)?;
            }
        }
        writer.end_section(section)
    }

    fn write_code(&self, writer: &mut BinaryWriter<'_>, relocator: &Relocator<'_>) -> Result<()> {
        let count = self.spaces.num_synthetic
            + self.modules.iter().map(|m| m.function_count).sum::<u32>();
        if count == 0 {
            return Ok(());
        }
        let section = writer.begin_section(SectionCode::Code)?;
        writer.write_u32_leb(count)?;
        for function in self.synthetic {
            let mut body = vec![0x00]; // no locals
            match &function.body {
                SyntheticBody::CallCtors(ctors) => {
                    for ctor in ctors {
                        body.push(OP_CALL);
                        crate::leb128::write_u32(
                            &mut body,
                            relocator.function_index(ctor.module, ctor.index)?,
                        );
                    }
                }
                SyntheticBody::UnreachableStub => body.push(OP_UNREACHABLE),
            }
            body.push(OP_END);
            writer.write_bytes(&body)?;
        }
        for module in self.modules {
            if let Some(code) = module.section(SectionCode::Code) {
                let relocated = relocator.relocate(code)?;
                writer.write_raw(&Self::relocated_payload(code, &relocated))?;
            }
        }
        writer.end_section(section)
    }

    fn write_data(&self, writer: &mut BinaryWriter<'_>, relocator: &Relocator<'_>) -> Result<()> {
        if self.layout.segments.is_empty() {
            return Ok(());
        }
        // Each input's data section is relocated once, chunks then slice out
        // of the patched bytes.
        let mut relocated: HashMap<usize, Vec<u8>> = HashMap::new();
        for (index, module) in self.modules.iter().enumerate() {
            if let Some(data) = module.section(SectionCode::Data) {
                relocated.insert(index, relocator.relocate(data)?);
            }
        }

        let section = writer.begin_section(SectionCode::Data)?;
        writer.write_u32_leb(self.layout.segments.len() as u32)?;
        for segment in &self.layout.segments {
            debug!(
                "writing segment {} at 0x{:x}, {} bytes",
                segment.name, segment.start, segment.size
            );
            writer.write_u32_leb(0)?; // memory 0
            writer.write_i32_const_expr(segment.start as i32)?;
            writer.write_u32_leb(segment.size)?;
            let mut written = 0u32;
            for chunk in &segment.chunks {
                // Alignment padding between chunks.
                for _ in written..chunk.offset {
                    writer.write_u8(0)?;
                }
                let module = &self.modules[chunk.module];
                let data_section = &module.sections[chunk.section];
                let bytes = &relocated[&chunk.module];
                let start = chunk.data.start - data_section.offset;
                let end = chunk.data.end - data_section.offset;
                writer.write_raw(&bytes[start..end])?;
                written = chunk.offset + chunk.size;
            }
        }
        writer.end_section(section)
    }

    fn write_names(&self, writer: &mut BinaryWriter<'_>, relocator: &Relocator<'_>) -> Result<()> {
        let mut names: BTreeMap<u32, &str> = BTreeMap::new();
        for (slot, function) in self.synthetic.iter().enumerate() {
            names.insert(self.spaces.synthetic_index(slot as u32), &function.name);
        }
        for (index, module) in self.modules.iter().enumerate() {
            for (local, name) in &module.debug_names {
                if let Ok(output) = relocator.function_index(index, *local) {
                    names.insert(output, name);
                }
            }
        }
        if names.is_empty() {
            return Ok(());
        }

        let mut payload = Vec::new();
        crate::leb128::write_u32(&mut payload, names.len() as u32);
        for (index, name) in &names {
            crate::leb128::write_u32(&mut payload, *index);
            crate::leb128::write_u32(&mut payload, name.len() as u32);
            payload.extend_from_slice(name.as_bytes());
        }

        let section = writer.begin_section(SectionCode::Custom)?;
        writer.write_str("name")?;
        writer.write_u8(1)?; // function names subsection
        writer.write_bytes(&payload)?;
        writer.end_section(section)
    }

    fn parse_error(&self, module: &InputModule, error: crate::ReadError) -> LinkError {
        LinkError::Parse {
            file: module.name.clone(),
            error,
        }
    }
}
