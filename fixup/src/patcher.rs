//! Load-notification handling: decides whether a module gets patched and installs the hooks.

use std::sync::Arc;

use brcmfx_intercept::interceptor::RouteRequest;
use brcmfx_intercept::{Address, Scope};
use log::{debug, error, info, warn};

use crate::catalog::{
    self, LifecycleState, PatchPoint, BRCM_4360, PCI_FAMILY_IDENTIFIER, SET_ASPM_STATE_SYMBOL,
    WHITELIST_SYMBOL,
};
use crate::config::Config;
use crate::engine::{Engine, KernelHelpers, Whitelist};
use crate::resolve::resolve_batch;
use crate::scheduler::TimerCallback;
use crate::trampolines;

const START_MATCHING_SYMBOL: &str = "__ZN11IOCatalogue13startMatchingEPK8OSSymbol";
const START_MATCHING_DICTIONARY: &str = "__ZN11IOCatalogue13startMatchingEP12OSDictionary";
const REMOVE_DRIVERS: &str = "__ZN11IOCatalogue13removeDriversEP12OSDictionaryb";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KernelHelper {
    StartMatchingSymbol,
    StartMatchingDictionary,
    RemoveDrivers,
}

impl Engine {
    /// Resolve the kernel's device-matching helpers. Only the first call has an effect.
    pub fn on_kernel_loaded(&self) {
        if self.kernel.get().is_some() {
            return;
        }

        let batch = resolve_batch(
            &*self.resolver,
            Scope::Kernel,
            &[
                (START_MATCHING_SYMBOL, KernelHelper::StartMatchingSymbol),
                (START_MATCHING_DICTIONARY, KernelHelper::StartMatchingDictionary),
                (REMOVE_DRIVERS, KernelHelper::RemoveDrivers),
            ],
        );
        let helpers = KernelHelpers {
            start_matching_symbol: batch.address_of(KernelHelper::StartMatchingSymbol),
            start_matching_dictionary: batch.address_of(KernelHelper::StartMatchingDictionary),
            remove_drivers: batch.address_of(KernelHelper::RemoveDrivers),
        };
        if helpers.start_matching_symbol.is_none() && helpers.start_matching_dictionary.is_none() {
            error!("failed to resolve IOCatalogue::startMatching, matching will not be retried");
        }
        let _ = self.kernel.set(helpers);
    }

    /// Entry point for the host's module-load notification.
    pub fn on_module_loaded(&self, identifier: &str, base: Address, size: usize, load_index: usize) {
        let scope = Scope::module(load_index, base, size);

        if identifier == PCI_FAMILY_IDENTIFIER {
            self.process_pci_family(scope);
            return;
        }

        match catalog::index_of(identifier) {
            Some(index) => self.process_target(index, scope),
            None => debug!("ignoring load of unrelated module {}", identifier),
        }
    }

    fn process_pci_family(&self, scope: Scope) {
        if self.set_aspm_state.get().is_some() {
            return;
        }
        match self.resolver.resolve(scope, SET_ASPM_STATE_SYMBOL) {
            Ok(address) => {
                let _ = self.set_aspm_state.set(address);
                debug!("resolved IOPCIDevice::setASPMState at {:#x}", address);
            }
            Err(e) => warn!("failed to resolve {}: {}", SET_ASPM_STATE_SYMBOL, e),
        }
    }

    fn process_target(&self, index: usize, scope: Scope) {
        let Some(entry) = self.catalog.entry(index) else {
            return;
        };
        let id = entry.descriptor.identifier;

        if entry.state() == LifecycleState::Disabled {
            debug!("{} is switched off, ignoring load", id);
            return;
        }
        if !entry.claim() {
            debug!("{} was already processed, ignoring duplicate load", id);
            return;
        }

        let config = self.snapshot(None);
        if config.off || !catalog::is_enabled(index, &config) {
            entry.set_state(LifecycleState::Disabled);
            info!("{} is disabled by configuration", id);
            return;
        }
        entry.set_state(LifecycleState::Resolved);
        debug!("found {}", id);

        // A started driver is already registered under its class name.
        if self.registry.find_service(entry.descriptor.service_name).is_some() {
            info!(
                "{} driver is already loaded, too late to do patching",
                entry.descriptor.service_name
            );
        } else {
            self.install_patches(index, scope, &config);
            entry.set_state(LifecycleState::Patched);
            info!("{} is patched", id);
        }

        self.arm_matching();
    }

    /// Resolve and route every patch point of target `index`. Best effort.
    fn install_patches(&self, index: usize, scope: Scope, config: &Config) {
        let Some(entry) = self.catalog.entry(index) else {
            return;
        };
        let descriptor = entry.descriptor;

        let requests: Vec<(&'static str, PatchPoint)> = PatchPoint::ALL
            .iter()
            .filter(|p| !(p.is_power_feature() && config.wake_on_wireless))
            .map(|&p| (descriptor.symbol(p), p))
            .collect();

        let batch = resolve_batch(&*self.resolver, scope, &requests);
        let routes: Vec<RouteRequest> = batch
            .resolved
            .iter()
            .map(|&(point, _, function)| RouteRequest {
                function,
                replacement: trampolines::replacement(index, point),
            })
            .collect();
        let results = self.interceptor.route_multiple(scope, &routes);

        let mut installed = 0;
        for (&(point, name, _), result) in batch.resolved.iter().zip(results) {
            match result {
                Ok(original) => {
                    if !entry.originals.capture(point, original) {
                        warn!("original of {} in {} was already captured", name, descriptor.identifier);
                    }
                    installed += 1;
                }
                Err(e) => warn!("failed to route {} in {}: {}", name, descriptor.identifier, e),
            }
        }

        if installed == requests.len() {
            debug!("all patches are successfully applied to {}", descriptor.identifier);
        } else {
            warn!(
                "{} of {} patches applied to {}",
                installed,
                requests.len(),
                descriptor.identifier
            );
        }

        if index == BRCM_4360 {
            self.resolve_whitelist(scope);
        }
    }

    fn resolve_whitelist(&self, scope: Scope) {
        if self.whitelist.get().is_some() {
            return;
        }
        match self.resolver.resolve(scope, WHITELIST_SYMBOL) {
            Ok(address) => {
                // SAFETY: the symbol names the module's null-terminated board-id table.
                let list = unsafe { Whitelist::from_raw(address) };
                debug!("{} resolved with {} entries", WHITELIST_SYMBOL, list.len());
                let _ = self.whitelist.set(list);
            }
            Err(e) => debug!("no whitelist available: {}", e),
        }
    }

    /// Arm the matching timer, debouncing successive loads.
    fn arm_matching(&self) {
        let me = self.me.clone();
        let armed = self.scheduler.arm(&*self.timers, move || {
            let callback: TimerCallback = Arc::new(move || {
                if let Some(engine) = me.upgrade() {
                    engine.start_matching();
                }
            });
            callback
        });
        if let Err(e) = armed {
            error!("failed to set up the matching timer, matching will not be retried: {}", e);
        }
    }
}
