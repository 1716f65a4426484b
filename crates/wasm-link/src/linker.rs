//! The link driver: parse inputs, resolve symbols, lay out memory, emit.

use log::{debug, info};

use crate::layout::{DataLayout, IndexSpaces};
use crate::module::InputModule;
use crate::output::OutputWriter;
use crate::reader::ExternalKind;
use crate::symbol::{self, Symbol, SymbolFlags, SymbolKind, SymbolTable, SymbolTarget};
use crate::writer::OutputStream;
use crate::{LinkError, Result};

/// Options controlling a link.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// Symbols to export from the output in addition to those the inputs
    /// flag as exported.
    pub export_symbols: Vec<String>,
    /// Whether to carry function names into the output's `name` section.
    pub emit_names: bool,
}

impl Default for LinkOptions {
    fn default() -> LinkOptions {
        LinkOptions {
            export_symbols: Vec::new(),
            emit_names: true,
        }
    }
}

/// Links a set of relocatable modules into one output module.
///
/// ```no_run
/// # fn objects() -> Vec<(String, Vec<u8>)> { Vec::new() }
/// use wasm_link::{Linker, LinkOptions, MemoryStream};
///
/// let mut linker = Linker::new(LinkOptions::default());
/// for (name, bytes) in objects() {
///     linker.add_module(&name, bytes)?;
/// }
/// let mut output = MemoryStream::new();
/// linker.link(&mut output)?;
/// # Ok::<(), wasm_link::LinkError>(())
/// ```
#[derive(Debug, Default)]
pub struct Linker {
    modules: Vec<InputModule>,
    options: LinkOptions,
}

impl Linker {
    pub fn new(options: LinkOptions) -> Linker {
        Linker {
            modules: Vec::new(),
            options,
        }
    }

    /// Parses `data` and queues it as the next input module.
    pub fn add_module(&mut self, name: &str, data: Vec<u8>) -> Result<()> {
        debug!("adding module {name}, {} bytes", data.len());
        let module = InputModule::parse(name, self.modules.len(), data).map_err(|error| {
            LinkError::Parse {
                file: name.to_string(),
                error,
            }
        })?;
        self.modules.push(module);
        Ok(())
    }

    /// Runs the link and writes the output module to `stream`.
    pub fn link(&self, stream: &mut dyn OutputStream) -> Result<()> {
        let mut table = SymbolTable::new();
        for (index, module) in self.modules.iter().enumerate() {
            self.register_symbols(&mut table, index, module)?;
        }
        info!(
            "resolved {} symbols across {} modules",
            table.len(),
            self.modules.len()
        );

        let layout = DataLayout::build(&self.modules);
        let synthetic = symbol::synthesize(&mut table, &self.modules, &layout)?;
        let spaces = IndexSpaces::build(&self.modules, &table, synthetic.len() as u32);

        let writer = OutputWriter {
            modules: &self.modules,
            table: &table,
            spaces: &spaces,
            layout: &layout,
            synthetic: &synthetic,
            export_symbols: &self.options.export_symbols,
            emit_names: self.options.emit_names,
        };
        writer.write(stream)
    }

    /// Folds one module's symbols into the global table.
    ///
    /// Objects without linking metadata still take part in resolution: their
    /// imports count as references and their exports as strong, exported
    /// definitions.
    fn register_symbols(
        &self,
        table: &mut SymbolTable,
        index: usize,
        module: &InputModule,
    ) -> Result<()> {
        if module.symbols.is_empty() {
            for (import_index, import) in module.func_imports.iter().enumerate() {
                table.resolve(Symbol {
                    name: import.field.clone(),
                    kind: SymbolKind::Function,
                    flags: SymbolFlags::UNDEFINED,
                    target: SymbolTarget::Undefined {
                        module: index,
                        index: import_index as u32,
                    },
                })?;
            }
            for export in &module.exports {
                let kind = match export.kind {
                    ExternalKind::Func => SymbolKind::Function,
                    ExternalKind::Global => SymbolKind::Global,
                    ExternalKind::Table | ExternalKind::Memory => continue,
                };
                // A re-exported import defines nothing.
                let imports = match kind {
                    SymbolKind::Function => module.func_imports.len(),
                    _ => module.global_imports.len(),
                };
                if (export.index as usize) < imports {
                    continue;
                }
                table.resolve(Symbol {
                    name: export.name.clone(),
                    kind,
                    flags: SymbolFlags::EXPORTED,
                    target: SymbolTarget::Defined {
                        module: index,
                        index: export.index,
                    },
                })?;
            }
            return Ok(());
        }

        for object_symbol in &module.symbols {
            // Local symbols stay private to their module; memory relocations
            // reach them through the module's own symbol vector.
            if object_symbol.flags().contains(SymbolFlags::LOCAL) {
                continue;
            }
            table.resolve(Symbol::from_object(index, object_symbol))?;
        }
        Ok(())
    }
}
