//! A World defines all modules that a program is allowed to reference,
//! and resolves global symbols to the locations that hold their values
//!
//! A module maps symbols to global locations (glocs). The mapping is
//! resolved when code references a global, in a fixed order: the module's
//! own table first; then each directly imported module's own table, but
//! only for symbols that module exports, in import order; then the
//! ancestor chain, own tables only. Imports are not transitive in either
//! direction — an imported module's imports and ancestors are never
//! searched. That is the observed behavior of the system this models and
//! it is preserved as-is.

use core::fmt;
use std::collections::HashMap;

use gc_arena::{Collect, Gc, Mutation, RefLock};

use crate::runtime::value::{Symbol, Value};

pub type ModulePtr<'gc> = Gc<'gc, RefLock<Module<'gc>>>;
pub type GlocPtr<'gc> = Gc<'gc, RefLock<Gloc<'gc>>>;

/// A global namespace: its own bindings plus links to the modules it
/// imports and the single ancestor it inherits from.
#[derive(Collect)]
#[collect(no_drop)]
pub struct Module<'gc> {
    pub name: Symbol,
    pub parent: Option<ModulePtr<'gc>>,
    pub imported: Vec<ModulePtr<'gc>>,
    pub exported: Vec<Symbol>,
    pub(crate) table: HashMap<Symbol, GlocPtr<'gc>>,
}

impl<'gc> fmt::Debug for Module<'gc> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A named storage location bound in a module's table, separate from the
/// symbol that names it.
#[derive(Collect)]
#[collect(no_drop)]
pub struct Gloc<'gc> {
    pub name: Symbol,
    pub owner: ModulePtr<'gc>,
    pub value: Value<'gc>,
}

impl<'gc> fmt::Debug for Gloc<'gc> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gloc")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[derive(Collect, Default)]
#[collect(require_static)]
struct Interner(lasso::Rodeo);

/// All modules of one execution context, plus the symbol interner.
///
/// The table is global mutable state; exclusive ownership of the World
/// (one `&mut` holder per context) is the locking discipline here. A
/// multi-context embedding must not share a World across contexts.
#[derive(Collect)]
#[collect(no_drop)]
pub struct World<'gc> {
    /// interner
    rodeo: Interner,
    /// every module, by name
    modules: HashMap<Symbol, ModulePtr<'gc>>,
    null_module: ModulePtr<'gc>,
    scheme_module: ModulePtr<'gc>,
    core_module: ModulePtr<'gc>,
    user_module: ModulePtr<'gc>,
}

fn raw_module<'gc>(
    mc: &Mutation<'gc>,
    name: Symbol,
    parent: Option<ModulePtr<'gc>>,
) -> ModulePtr<'gc> {
    Gc::new(
        mc,
        RefLock::new(Module {
            name,
            parent,
            imported: Vec::new(),
            exported: Vec::new(),
            table: HashMap::new(),
        }),
    )
}

impl<'gc> World<'gc> {
    /// Builds the predefined module chain:
    /// `(null)` ← `(scheme)` ← `(magpie)` ← `(user)`.
    pub fn new(mc: &Mutation<'gc>) -> Self {
        let mut rodeo = Interner::default();
        let null_name = Symbol(rodeo.0.get_or_intern("null"));
        let scheme_name = Symbol(rodeo.0.get_or_intern("scheme"));
        let core_name = Symbol(rodeo.0.get_or_intern("magpie"));
        let user_name = Symbol(rodeo.0.get_or_intern("user"));

        let null_module = raw_module(mc, null_name, None);
        let scheme_module = raw_module(mc, scheme_name, Some(null_module));
        let core_module = raw_module(mc, core_name, Some(scheme_module));
        let user_module = raw_module(mc, user_name, Some(core_module));

        let mut modules = HashMap::new();
        for m in [null_module, scheme_module, core_module, user_module] {
            modules.insert(m.borrow().name, m);
        }
        World {
            rodeo,
            modules,
            null_module,
            scheme_module,
            core_module,
            user_module,
        }
    }

    pub fn intern(&mut self, name: &str) -> Symbol {
        Symbol(self.rodeo.0.get_or_intern(name))
    }

    pub(crate) fn intern_raw(&mut self, name: &str) -> lasso::Spur {
        self.rodeo.0.get_or_intern(name)
    }

    pub fn resolve(&self, symbol: Symbol) -> &str {
        self.rodeo.0.resolve(&symbol.0)
    }

    pub fn rodeo(&self) -> &lasso::Rodeo {
        &self.rodeo.0
    }

    pub fn null_module(&self) -> ModulePtr<'gc> {
        self.null_module
    }

    pub fn scheme_module(&self) -> ModulePtr<'gc> {
        self.scheme_module
    }

    pub fn core_module(&self) -> ModulePtr<'gc> {
        self.core_module
    }

    pub fn user_module(&self) -> ModulePtr<'gc> {
        self.user_module
    }

    /// Creates and registers a module. Without an explicit parent the new
    /// module chains under the core module.
    pub fn make_module(
        &mut self,
        mc: &Mutation<'gc>,
        name: Symbol,
        parent: Option<ModulePtr<'gc>>,
    ) -> ModulePtr<'gc> {
        let parent = parent.or(Some(self.core_module));
        let module = raw_module(mc, name, parent);
        self.modules.insert(name, module);
        module
    }

    pub fn find_module(&self, name: Symbol) -> Option<ModulePtr<'gc>> {
        self.modules.get(&name).copied()
    }

    pub fn all_modules(&self) -> Vec<ModulePtr<'gc>> {
        self.modules.values().copied().collect()
    }

    /// Resolves `symbol` in `module`: own table; then, unless
    /// `stay_local`, each directly imported module's own table filtered
    /// by its export list, in import order; then the ancestor chain.
    pub fn find_binding(
        &self,
        module: ModulePtr<'gc>,
        symbol: Symbol,
        stay_local: bool,
    ) -> Option<GlocPtr<'gc>> {
        if let Some(gloc) = module.borrow().table.get(&symbol) {
            return Some(*gloc);
        }
        if stay_local {
            return None;
        }
        // deliberately shallow: an import exposes only what the imported
        // module itself owns and exports
        let imported: Vec<_> = module.borrow().imported.clone();
        for m in imported {
            let mb = m.borrow();
            if let Some(gloc) = mb.table.get(&symbol) {
                if mb.exported.contains(&symbol) {
                    return Some(*gloc);
                }
            }
        }
        let mut parent = module.borrow().parent;
        while let Some(m) = parent {
            if let Some(gloc) = m.borrow().table.get(&symbol) {
                return Some(*gloc);
            }
            parent = m.borrow().parent;
        }
        tracing::trace!("global resolution miss");
        None
    }

    /// The value a symbol resolves to from `module`, if any.
    pub fn symbol_value(&self, module: ModulePtr<'gc>, symbol: Symbol) -> Option<Value<'gc>> {
        self.find_binding(module, symbol, false)
            .map(|gloc| gloc.borrow().value)
    }

    /// Creates or updates the gloc for `symbol` in `module` itself.
    pub fn define(
        &self,
        mc: &Mutation<'gc>,
        module: ModulePtr<'gc>,
        symbol: Symbol,
        value: Value<'gc>,
    ) -> GlocPtr<'gc> {
        if let Some(gloc) = self.find_binding(module, symbol, true) {
            gloc.borrow_mut(mc).value = value;
            return gloc;
        }
        let gloc = Gc::new(
            mc,
            RefLock::new(Gloc {
                name: symbol,
                owner: module,
                value,
            }),
        );
        module.borrow_mut(mc).table.insert(symbol, gloc);
        gloc
    }

    /// Appends each module in `list` to `module`'s import list, keeping
    /// order and skipping modules already imported.
    pub fn import_modules(
        &self,
        mc: &Mutation<'gc>,
        module: ModulePtr<'gc>,
        list: &[ModulePtr<'gc>],
    ) {
        let mut mb = module.borrow_mut(mc);
        for m in list {
            if !mb.imported.iter().any(|known| Gc::ptr_eq(*known, *m)) {
                mb.imported.push(*m);
            }
        }
    }

    /// Appends each symbol in `list` to `module`'s export list, keeping
    /// order and skipping symbols already exported.
    pub fn export_symbols(&self, mc: &Mutation<'gc>, module: ModulePtr<'gc>, list: &[Symbol]) {
        let mut mb = module.borrow_mut(mc);
        for symbol in list {
            if !mb.exported.contains(symbol) {
                mb.exported.push(*symbol);
            }
        }
    }
}
