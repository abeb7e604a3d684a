use crate::types::{Address, HookError, Scope};
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Host primitive that redirects a function to a replacement.
///
/// On success it returns the address of a callable trampoline that runs the
/// original implementation.
pub trait RouteBackend: Send + Sync {
    fn route(
        &self,
        scope: Scope,
        function: Address,
        replacement: Address,
    ) -> Result<Address, HookError>;
}

/// One entry of a batch redirection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteRequest {
    pub function: Address,
    pub replacement: Address,
}

struct ReplacementEntry {
    scope: Scope,
    replacement: Address,
}

/// Tracks every redirection installed through a [`RouteBackend`].
///
/// A function is redirected at most once; redirections are never reverted.
pub struct Interceptor {
    backend: Arc<dyn RouteBackend>,
    replace_map: Mutex<HashMap<Address, ReplacementEntry>>,
}

impl Interceptor {
    pub fn new(backend: Arc<dyn RouteBackend>) -> Self {
        Self {
            backend,
            replace_map: Mutex::new(HashMap::new()),
        }
    }

    /// Redirect `function` to `replacement` and return the handle of the original.
    pub fn replace(
        &self,
        scope: Scope,
        function: Address,
        replacement: Address,
    ) -> Result<Address, HookError> {
        if function == 0 || replacement == 0 {
            return Err(HookError::NullAddress);
        }

        // Held across the backend call so two racing callers cannot both patch.
        let mut map = self.replace_map.lock().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(&function) {
            return Err(HookError::AlreadyAttached(function));
        }

        let trampoline = self.backend.route(scope, function, replacement)?;
        debug!(
            "routed {:#x} -> {:#x} (original at {:#x})",
            function, replacement, trampoline
        );
        map.insert(
            function,
            ReplacementEntry { scope, replacement },
        );
        Ok(trampoline)
    }

    /// Best-effort batch: every request is attempted, results keep request order.
    pub fn route_multiple(
        &self,
        scope: Scope,
        requests: &[RouteRequest],
    ) -> Vec<Result<Address, HookError>> {
        requests
            .iter()
            .map(|r| self.replace(scope, r.function, r.replacement))
            .collect()
    }

    /// Replacement currently installed for `function`, if any.
    pub fn replacement_of(&self, function: Address) -> Option<Address> {
        let map = self.replace_map.lock().unwrap_or_else(|e| e.into_inner());
        map.get(&function).map(|e| e.replacement)
    }

    /// Number of redirections installed into `scope`.
    pub fn count_in(&self, scope: Scope) -> usize {
        let map = self.replace_map.lock().unwrap_or_else(|e| e.into_inner());
        map.values().filter(|e| e.scope == scope).count()
    }
}
