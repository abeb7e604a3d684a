//! Symbol lookup inside the kernel and loaded modules.

use crate::types::{Address, ExportInfo, HookError, ModuleInfo, Scope};
use std::collections::HashMap;
use std::sync::Mutex;

/// Resolves a symbol name to its runtime address within a scope.
///
/// Implemented by the host (its kernel symbol table, or a module's own
/// symbol table mapped at `base..base+size`).
pub trait SymbolResolver: Send + Sync {
    fn resolve(&self, scope: Scope, name: &str) -> Result<Address, HookError>;
}

/// Key used to look up exports: the kernel, or a module by load index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TableKey {
    Kernel,
    Module(usize),
}

impl From<Scope> for TableKey {
    fn from(scope: Scope) -> Self {
        match scope {
            Scope::Kernel => TableKey::Kernel,
            Scope::Module { load_index, .. } => TableKey::Module(load_index),
        }
    }
}

/// In-memory export table for hosts that hand over symbol tables eagerly.
///
/// Lookups are bounds-checked against the scope passed by the caller, so a
/// stale entry from a previous mapping of the same load index is rejected
/// instead of being patched.
#[derive(Default)]
pub struct ExportTable {
    exports: Mutex<HashMap<TableKey, HashMap<String, Address>>>,
}

impl ExportTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register exports of the kernel image.
    pub fn add_kernel_exports(&self, exports: impl IntoIterator<Item = ExportInfo>) {
        self.insert(TableKey::Kernel, exports);
    }

    /// Register exports of a loaded module.
    pub fn add_module_exports(
        &self,
        module: &ModuleInfo,
        exports: impl IntoIterator<Item = ExportInfo>,
    ) {
        self.insert(TableKey::Module(module.load_index), exports);
    }

    fn insert(&self, key: TableKey, exports: impl IntoIterator<Item = ExportInfo>) {
        let mut map = self.exports.lock().unwrap_or_else(|e| e.into_inner());
        let symbols = map.entry(key).or_default();
        for export in exports {
            symbols.insert(export.name, export.address);
        }
    }
}

impl SymbolResolver for ExportTable {
    fn resolve(&self, scope: Scope, name: &str) -> Result<Address, HookError> {
        let map = self.exports.lock().unwrap_or_else(|e| e.into_inner());
        let address = map
            .get(&TableKey::from(scope))
            .and_then(|symbols| symbols.get(name))
            .copied()
            .ok_or_else(|| HookError::SymbolNotFound(name.to_string()))?;

        if !scope.contains(address) {
            return Err(HookError::OutOfRange {
                name: name.to_string(),
                address,
            });
        }
        Ok(address)
    }
}
