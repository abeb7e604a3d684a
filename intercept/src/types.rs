use thiserror::Error;

/// Runtime address inside the kernel or a loaded module.
pub type Address = usize;

/// Where a symbol lookup or a redirection is performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// The kernel image itself.
    Kernel,
    /// A module loaded by the host, identified by its load index and mapped range.
    Module {
        load_index: usize,
        base: Address,
        size: usize,
    },
}

impl Scope {
    pub fn module(load_index: usize, base: Address, size: usize) -> Self {
        Scope::Module {
            load_index,
            base,
            size,
        }
    }

    /// Returns true if `address` lies inside the mapped range of this scope.
    ///
    /// The kernel scope has no recorded bounds and accepts every non-null address.
    pub fn contains(&self, address: Address) -> bool {
        match *self {
            Scope::Kernel => address != 0,
            Scope::Module { base, size, .. } => {
                address >= base && address - base < size
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("symbol {name} resolved to {address:#x}, outside of its module")]
    OutOfRange { name: String, address: Address },

    #[error("function at {0:#x} is already redirected")]
    AlreadyAttached(Address),

    #[error("null address passed for redirection")]
    NullAddress,

    #[error("redirection failed: {0}")]
    Backend(String),

    #[error("operation unsupported by the host")]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub path: String,
    pub load_index: usize,
    pub base_address: Address,
    pub size: usize,
}

impl ModuleInfo {
    pub fn scope(&self) -> Scope {
        Scope::module(self.load_index, self.base_address, self.size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportInfo {
    pub name: String,
    pub address: Address,
}
