//! Best-effort batch symbol resolution.

use brcmfx_intercept::{Address, HookError, Scope, SymbolResolver};
use log::{debug, warn};

/// Outcome of a batch: every request lands in exactly one of the two lists,
/// in request order.
#[derive(Debug)]
pub struct BatchResolution<P> {
    pub resolved: Vec<(P, &'static str, Address)>,
    pub failed: Vec<(P, &'static str, HookError)>,
}

impl<P: Copy + PartialEq> BatchResolution<P> {
    pub fn address_of(&self, purpose: P) -> Option<Address> {
        self.resolved
            .iter()
            .find(|(p, _, _)| *p == purpose)
            .map(|(_, _, address)| *address)
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Resolve every `(name, purpose)` pair independently; a failure never stops the batch.
pub fn resolve_batch<P: Copy>(
    resolver: &dyn SymbolResolver,
    scope: Scope,
    requests: &[(&'static str, P)],
) -> BatchResolution<P> {
    let mut batch = BatchResolution {
        resolved: Vec::with_capacity(requests.len()),
        failed: Vec::new(),
    };

    for &(name, purpose) in requests {
        match resolver.resolve(scope, name) {
            Ok(address) => {
                debug!("resolved {} at {:#x}", name, address);
                batch.resolved.push((purpose, name, address));
            }
            Err(e) => {
                warn!("failed to resolve {}: {}", name, e);
                batch.failed.push((purpose, name, e));
            }
        }
    }
    batch
}
