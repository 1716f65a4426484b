//! The global symbol table and its resolution rules.
//!
//! Symbols from every input are folded into one [`SymbolTable`] keyed by name.
//! Resolution follows the usual static-linking rules: a definition satisfies
//! any number of references, strong definitions override weak ones, and two
//! strong definitions of the same name are an error.
//!
//! After resolution, [`synthesize`] fills in the definitions the linker itself
//! provides: the initializer-calling function, stub bodies for unresolved weak
//! references, segment boundary markers and the shadow stack pointer.

use bitflags::bitflags;
use indexmap::IndexMap;
use log::debug;

use crate::layout::DataLayout;
use crate::module::{InputModule, ObjectSymbol};
use crate::reader::DataDef;
use crate::{LinkError, Result};

bitflags! {
    /// Symbol flags from the tool-conventions linking metadata.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SymbolFlags: u32 {
        /// May be overridden by a strong definition elsewhere.
        const WEAK = 0x01;
        /// Local to its object; never participates in resolution.
        const LOCAL = 0x02;
        /// Not visible outside the linked module.
        const HIDDEN = 0x04;
        /// A reference, not a definition.
        const UNDEFINED = 0x10;
        /// Must appear in the output's export section.
        const EXPORTED = 0x20;
        /// An undefined symbol whose name differs from its import field.
        const EXPLICIT_NAME = 0x40;
        /// Must be retained even if unreferenced.
        const NO_STRIP = 0x80;
    }
}

/// The namespace a symbol lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Global,
    Data,
}

/// A value the linker itself defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntheticValue {
    /// A linker-generated function, by slot in the synthetic list.
    Function(u32),
    /// The shadow stack pointer global.
    StackPointer,
    /// An absolute address in linear memory.
    DataAddress(u32),
}

/// Where a symbol's definition (or reference) lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolTarget {
    /// Defined at `index` in `module`'s function or global index space.
    Defined { module: usize, index: u32 },
    /// Defined at a location within one of `module`'s data segments.
    DefinedData {
        module: usize,
        segment: u32,
        offset: u32,
        size: u32,
    },
    /// Referenced through import `index` of `module`, not yet defined.
    Undefined { module: usize, index: u32 },
    /// Defined by the linker.
    Synthetic(SyntheticValue),
}

/// One resolved symbol of the output.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub flags: SymbolFlags,
    pub target: SymbolTarget,
}

impl Symbol {
    /// Builds a table entry from one object's symbol. `module` is the index of
    /// the contributing input.
    pub fn from_object(module: usize, symbol: &ObjectSymbol) -> Symbol {
        let (kind, target) = match symbol {
            ObjectSymbol::Function { flags, index, .. } => {
                let target = if flags.contains(SymbolFlags::UNDEFINED) {
                    SymbolTarget::Undefined {
                        module,
                        index: *index,
                    }
                } else {
                    SymbolTarget::Defined {
                        module,
                        index: *index,
                    }
                };
                (SymbolKind::Function, target)
            }
            ObjectSymbol::Global { flags, index, .. } => {
                let target = if flags.contains(SymbolFlags::UNDEFINED) {
                    SymbolTarget::Undefined {
                        module,
                        index: *index,
                    }
                } else {
                    SymbolTarget::Defined {
                        module,
                        index: *index,
                    }
                };
                (SymbolKind::Global, target)
            }
            ObjectSymbol::Data {
                definition: Some(DataDef {
                    segment,
                    offset,
                    size,
                }),
                ..
            } => (
                SymbolKind::Data,
                SymbolTarget::DefinedData {
                    module,
                    segment: *segment,
                    offset: *offset,
                    size: *size,
                },
            ),
            ObjectSymbol::Data { .. } => (
                SymbolKind::Data,
                SymbolTarget::Undefined { module, index: 0 },
            ),
        };
        Symbol {
            name: symbol.name().to_string(),
            kind,
            flags: symbol.flags(),
            target,
        }
    }

    pub fn is_weak(&self) -> bool {
        self.flags.contains(SymbolFlags::WEAK)
    }

    pub fn is_defined(&self) -> bool {
        !matches!(self.target, SymbolTarget::Undefined { .. })
    }

    pub fn is_exported(&self) -> bool {
        self.flags.contains(SymbolFlags::EXPORTED)
    }
}

/// The global symbol table, in first-seen order.
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: IndexMap<String, Symbol>,
}

impl SymbolTable {
    pub fn new() -> SymbolTable {
        SymbolTable::default()
    }

    /// Folds `symbol` into the table.
    ///
    /// A definition replaces a reference, a strong definition replaces a weak
    /// one, and the first definition wins among equals. Two strong definitions
    /// of the same name fail with [`LinkError::DuplicateSymbol`].
    pub fn resolve(&mut self, symbol: Symbol) -> Result<()> {
        use indexmap::map::Entry;
        match self.symbols.entry(symbol.name.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(symbol);
            }
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                let exported = (existing.flags | symbol.flags) & SymbolFlags::EXPORTED;
                match (existing.is_defined(), symbol.is_defined()) {
                    (false, true) => {
                        debug!("symbol {} resolved by definition", symbol.name);
                        *existing = symbol;
                    }
                    (true, false) => {}
                    (false, false) => {
                        // A strong reference to a weak-referenced name keeps
                        // the name strongly required.
                        if !symbol.is_weak() {
                            existing.flags.remove(SymbolFlags::WEAK);
                        }
                    }
                    (true, true) => {
                        if existing.is_weak() && !symbol.is_weak() {
                            debug!("strong definition of {} overrides weak", symbol.name);
                            *existing = symbol;
                        } else if existing.is_weak() || symbol.is_weak() {
                            // First definition stays.
                        } else {
                            return Err(LinkError::DuplicateSymbol { name: symbol.name });
                        }
                    }
                }
                entry.get_mut().flags.insert(exported);
            }
        }
        Ok(())
    }

    /// Looks up a symbol by name.
    pub fn find(&self, name: &str) -> Option<&Symbol> {
        self.symbols.get(name)
    }

    /// All symbols, in first-seen order.
    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.values()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    fn define_synthetic(&mut self, name: &str, kind: SymbolKind, value: SyntheticValue) {
        let entry = self
            .symbols
            .entry(name.to_string())
            .or_insert_with(|| Symbol {
                name: name.to_string(),
                kind,
                flags: SymbolFlags::HIDDEN,
                target: SymbolTarget::Synthetic(value),
            });
        if !entry.is_defined() {
            entry.target = SymbolTarget::Synthetic(value);
            entry.flags.remove(SymbolFlags::UNDEFINED);
        }
    }
}

/// The type signature of a linker-generated function.
#[derive(Debug, Clone, Copy)]
pub enum SyntheticSignature {
    /// `() -> ()`; uses the type entry the linker appends.
    Void,
    /// The signature of import `type_index` as declared by `module`.
    Imported { module: usize, type_index: u32 },
}

/// The body of a linker-generated function.
#[derive(Debug, Clone)]
pub enum SyntheticBody {
    /// Calls each constructor in priority order.
    CallCtors(Vec<CtorCall>),
    /// A single `unreachable`, standing in for an absent weak definition.
    UnreachableStub,
}

/// One constructor invocation of the initializer caller.
#[derive(Debug, Clone, Copy)]
pub struct CtorCall {
    pub priority: u32,
    pub module: usize,
    /// Index in `module`'s function space, imports included.
    pub index: u32,
}

/// A function the linker defines itself.
#[derive(Debug, Clone)]
pub struct SyntheticFunction {
    pub name: String,
    pub signature: SyntheticSignature,
    pub body: SyntheticBody,
}

/// The name of the generated function that runs static initializers.
pub const CALL_CTORS: &str = "__wasm_call_ctors";

const STACK_POINTER: &str = "__stack_pointer";
const DSO_HANDLE: &str = "__dso_handle";

/// Creates linker-provided definitions once resolution and data layout are
/// complete. Returns the generated functions in output order.
pub fn synthesize(
    table: &mut SymbolTable,
    modules: &[InputModule],
    layout: &DataLayout,
) -> Result<Vec<SyntheticFunction>> {
    let mut synthetic = Vec::new();

    // The initializer caller, only when some input registered init functions.
    let mut ctors = Vec::new();
    for (index, module) in modules.iter().enumerate() {
        for init in &module.init_funcs {
            let local = match &module.symbols[init.symbol as usize] {
                ObjectSymbol::Function { index, .. } => *index,
                _ => unreachable!("validated when the module was decoded"),
            };
            ctors.push(CtorCall {
                priority: init.priority,
                module: index,
                index: local,
            });
        }
    }
    if !ctors.is_empty() {
        // Stable sort keeps input order among equal priorities.
        ctors.sort_by_key(|c| c.priority);
        debug!("synthesizing {} with {} calls", CALL_CTORS, ctors.len());
        table.define_synthetic(
            CALL_CTORS,
            SymbolKind::Function,
            SyntheticValue::Function(synthetic.len() as u32),
        );
        synthetic.push(SyntheticFunction {
            name: CALL_CTORS.to_string(),
            signature: SyntheticSignature::Void,
            body: SyntheticBody::CallCtors(ctors),
        });
    }

    // Weak references that never found a definition get inert stub bodies so
    // no import for them appears in the output.
    let stubs: Vec<(String, usize, u32)> = table
        .iter()
        .filter(|s| !s.is_defined() && s.is_weak() && s.kind == SymbolKind::Function)
        .filter_map(|s| match s.target {
            SymbolTarget::Undefined { module, index } => Some((s.name.clone(), module, index)),
            _ => None,
        })
        .collect();
    for (name, module, index) in stubs {
        let type_index = modules[module]
            .func_imports
            .get(index as usize)
            .map(|import| import.type_index)
            .ok_or_else(|| LinkError::undefined(&*name))?;
        debug!("synthesizing unreachable stub for weak symbol {name}");
        table.define_synthetic(
            &name,
            SymbolKind::Function,
            SyntheticValue::Function(synthetic.len() as u32),
        );
        synthetic.push(SyntheticFunction {
            name,
            signature: SyntheticSignature::Imported { module, type_index },
            body: SyntheticBody::UnreachableStub,
        });
    }

    // Boundary markers for every output segment, plus __dso_handle, resolve
    // to absolute addresses.
    for segment in &layout.segments {
        table.define_synthetic(
            &format!("__start_{}", segment.name),
            SymbolKind::Data,
            SyntheticValue::DataAddress(segment.start),
        );
        table.define_synthetic(
            &format!("__stop_{}", segment.name),
            SymbolKind::Data,
            SyntheticValue::DataAddress(segment.start + segment.size),
        );
    }
    table.define_synthetic(DSO_HANDLE, SymbolKind::Data, SyntheticValue::DataAddress(0));

    // The shadow stack pointer global the output always carries.
    table.define_synthetic(
        STACK_POINTER,
        SymbolKind::Global,
        SyntheticValue::StackPointer,
    );

    Ok(synthetic)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defined(name: &str, flags: SymbolFlags) -> Symbol {
        Symbol {
            name: name.to_string(),
            kind: SymbolKind::Function,
            flags,
            target: SymbolTarget::Defined { module: 0, index: 0 },
        }
    }

    fn undefined(name: &str, flags: SymbolFlags) -> Symbol {
        Symbol {
            name: name.to_string(),
            kind: SymbolKind::Function,
            flags: flags | SymbolFlags::UNDEFINED,
            target: SymbolTarget::Undefined { module: 1, index: 0 },
        }
    }

    #[test]
    fn definition_satisfies_reference() {
        let mut table = SymbolTable::new();
        table.resolve(undefined("f", SymbolFlags::empty())).unwrap();
        table.resolve(defined("f", SymbolFlags::empty())).unwrap();
        assert!(table.find("f").unwrap().is_defined());

        let mut table = SymbolTable::new();
        table.resolve(defined("f", SymbolFlags::empty())).unwrap();
        table.resolve(undefined("f", SymbolFlags::empty())).unwrap();
        assert!(table.find("f").unwrap().is_defined());
    }

    #[test]
    fn strong_definition_overrides_weak() {
        let mut table = SymbolTable::new();
        table.resolve(defined("f", SymbolFlags::WEAK)).unwrap();
        table.resolve(defined("f", SymbolFlags::empty())).unwrap();
        let symbol = table.find("f").unwrap();
        assert!(!symbol.is_weak());
        assert_eq!(symbol.target, SymbolTarget::Defined { module: 0, index: 0 });
    }

    #[test]
    fn first_weak_definition_wins() {
        let mut table = SymbolTable::new();
        let mut first = defined("f", SymbolFlags::WEAK);
        first.target = SymbolTarget::Defined { module: 0, index: 7 };
        table.resolve(first).unwrap();
        table.resolve(defined("f", SymbolFlags::WEAK)).unwrap();
        assert_eq!(
            table.find("f").unwrap().target,
            SymbolTarget::Defined { module: 0, index: 7 }
        );
    }

    #[test]
    fn duplicate_strong_definitions_fail() {
        let mut table = SymbolTable::new();
        table.resolve(defined("f", SymbolFlags::empty())).unwrap();
        let err = table.resolve(defined("f", SymbolFlags::empty())).unwrap_err();
        assert!(matches!(err, LinkError::DuplicateSymbol { name } if name == "f"));
    }

    #[test]
    fn strong_reference_clears_weakness() {
        let mut table = SymbolTable::new();
        table.resolve(undefined("f", SymbolFlags::WEAK)).unwrap();
        table.resolve(undefined("f", SymbolFlags::empty())).unwrap();
        assert!(!table.find("f").unwrap().is_weak());
    }

    #[test]
    fn exported_flag_accumulates() {
        let mut table = SymbolTable::new();
        table.resolve(undefined("f", SymbolFlags::EXPORTED)).unwrap();
        table.resolve(defined("f", SymbolFlags::empty())).unwrap();
        assert!(table.find("f").unwrap().is_exported());
    }

    #[test]
    fn synthesizes_markers_and_stack_pointer() {
        let mut table = SymbolTable::new();
        let layout = DataLayout::default();
        let funcs = synthesize(&mut table, &[], &layout).unwrap();
        assert!(funcs.is_empty());
        assert!(table.find("__stack_pointer").unwrap().is_defined());
        assert_eq!(
            table.find("__dso_handle").unwrap().target,
            SymbolTarget::Synthetic(SyntheticValue::DataAddress(0))
        );
    }
}
