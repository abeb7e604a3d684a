//! brcmfx-intercept: symbol resolution and function redirection for loaded kernel modules.
//!
//! The host kernel owns the actual symbol tables and the code-redirection
//! primitive. This crate defines the seams to them ([`SymbolResolver`],
//! [`RouteBackend`]) and the bookkeeping layered on top ([`Interceptor`],
//! [`ExportTable`]).

pub mod interceptor;
pub mod module;
pub mod types;

// Re-exports for convenience (flattened imports)
pub use interceptor::{Interceptor, RouteBackend};
pub use module::{ExportTable, SymbolResolver};
pub use types::{Address, ExportInfo, HookError, ModuleInfo, Scope};
