//! Process-wide engine state shared by the load callbacks and every hook.

use core::ffi::{c_char, CStr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use brcmfx_intercept::{Address, Interceptor, RouteBackend, SymbolResolver};
use log::debug;

use crate::catalog::{
    self, Catalog, Descriptor, LifecycleState, TargetEntry, PCI_FAMILY_IDENTIFIER,
    PCI_FAMILY_PATHS, TARGET_COUNT,
};
use crate::config::{Config, ConfigSource};
use crate::host::{DeviceRegistry, ObjectRef, Platform};
use crate::scheduler::{MatchingScheduler, TimerQueue, MATCHING_ATTEMPTS};

/// Upper bound on whitelist entries read from module data.
const MAX_WHITELIST_ENTRIES: usize = 256;

/// Host collaborators handed to [`Engine::new`].
pub struct HostServices {
    pub resolver: Arc<dyn SymbolResolver>,
    pub router: Arc<dyn RouteBackend>,
    pub registry: Arc<dyn DeviceRegistry>,
    pub platform: Arc<dyn Platform>,
    pub timers: Arc<dyn TimerQueue>,
}

/// Kernel entry points used by the matching scheduler.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KernelHelpers {
    pub start_matching_symbol: Option<Address>,
    pub start_matching_dictionary: Option<Address>,
    pub remove_drivers: Option<Address>,
}

/// Board identifiers exempt from the channel-switch restriction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Whitelist(Vec<String>);

impl Whitelist {
    pub fn new(entries: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Whitelist(entries.into_iter().map(Into::into).collect())
    }

    /// Read a null-terminated array of C strings.
    ///
    /// # Safety
    /// `address` must point to a readable array of `*const c_char` terminated
    /// by a null entry, each non-null entry pointing to a valid C string.
    pub unsafe fn from_raw(address: Address) -> Self {
        let mut entries = Vec::new();
        let mut cursor = address as *const *const c_char;
        while entries.len() < MAX_WHITELIST_ENTRIES {
            let entry = *cursor;
            if entry.is_null() {
                break;
            }
            entries.push(CStr::from_ptr(entry).to_string_lossy().into_owned());
            cursor = cursor.add(1);
        }
        Whitelist(entries)
    }

    pub fn contains(&self, board_id: &str) -> bool {
        self.0.iter().any(|b| b == board_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The shared context every callback and hook handler runs against.
pub struct Engine {
    pub(crate) me: Weak<Engine>,
    pub(crate) catalog: Catalog,
    pub(crate) interceptor: Interceptor,
    pub(crate) resolver: Arc<dyn SymbolResolver>,
    pub(crate) registry: Arc<dyn DeviceRegistry>,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) timers: Arc<dyn TimerQueue>,
    pub(crate) scheduler: MatchingScheduler,
    pub(crate) start_called: [AtomicBool; TARGET_COUNT],
    any_started: AtomicBool,
    /// Last wireless provider seen by start/probe, for device-property lookups.
    provider: AtomicUsize,
    pub(crate) whitelist: OnceLock<Whitelist>,
    pub(crate) kernel: OnceLock<KernelHelpers>,
    pub(crate) set_aspm_state: OnceLock<Address>,
}

impl Engine {
    pub fn new(services: HostServices) -> Arc<Self> {
        Self::with_attempts(services, MATCHING_ATTEMPTS)
    }

    /// Like [`Engine::new`] with a custom matching retry budget.
    pub fn with_attempts(services: HostServices, attempts: u32) -> Arc<Self> {
        Arc::new_cyclic(|me| Engine {
            me: me.clone(),
            catalog: Catalog::new(),
            interceptor: Interceptor::new(services.router),
            resolver: services.resolver,
            registry: services.registry,
            platform: services.platform,
            timers: services.timers,
            scheduler: MatchingScheduler::new(attempts),
            start_called: std::array::from_fn(|_| AtomicBool::new(false)),
            any_started: AtomicBool::new(false),
            provider: AtomicUsize::new(0),
            whitelist: OnceLock::new(),
            kernel: OnceLock::new(),
            set_aspm_state: OnceLock::new(),
        })
    }

    /// Current configuration: device properties of `provider` (or of the last
    /// provider seen) overridden by boot arguments.
    pub fn snapshot(&self, provider: Option<ObjectRef>) -> Config {
        let provider = provider
            .filter(|p| !p.is_null())
            .or_else(|| match self.provider.load(Ordering::Acquire) {
                0 => None,
                raw => Some(ObjectRef(raw)),
            });
        let properties = provider.and_then(|p| self.platform.device_properties(p));
        let boot_args = self.platform.boot_args();

        let mut sources: Vec<&dyn ConfigSource> = Vec::with_capacity(2);
        if let Some(properties) = properties.as_ref() {
            sources.push(properties);
        }
        sources.push(&boot_args);
        Config::from_sources(&sources)
    }

    pub(crate) fn remember_provider(&self, provider: ObjectRef) {
        if !provider.is_null() {
            self.provider.store(provider.0, Ordering::Release);
        }
    }

    /// Modules to subscribe load notifications for.
    ///
    /// Targets disabled by the boot configuration are switched off here and
    /// never patched.
    pub fn watch_list(&self) -> Vec<(&'static str, &'static [&'static str])> {
        let config = self.snapshot(None);
        if config.off {
            debug!("disabled by boot arguments, watching nothing");
            return Vec::new();
        }

        let mut modules = Vec::with_capacity(TARGET_COUNT + 1);
        for (index, entry) in self.catalog.entries() {
            if catalog::is_enabled(index, &config) {
                modules.push((entry.descriptor.identifier, entry.descriptor.paths));
            } else if entry.state() == LifecycleState::Unloaded {
                debug!("switching off {}", entry.descriptor.identifier);
                entry.set_state(LifecycleState::Disabled);
            }
        }
        modules.push((PCI_FAMILY_IDENTIFIER, PCI_FAMILY_PATHS));
        modules
    }

    pub fn descriptor_for(&self, identifier: &str) -> Option<&'static Descriptor> {
        self.catalog.descriptor_for(identifier)
    }

    pub fn target(&self, index: usize) -> Option<&TargetEntry> {
        self.catalog.entry(index)
    }

    pub fn state(&self, index: usize) -> Option<LifecycleState> {
        self.catalog.entry(index).map(TargetEntry::state)
    }

    pub fn interceptor(&self) -> &Interceptor {
        &self.interceptor
    }

    pub fn scheduler(&self) -> &MatchingScheduler {
        &self.scheduler
    }

    pub fn any_service_started(&self) -> bool {
        self.any_started.load(Ordering::Acquire)
    }

    pub(crate) fn mark_service_started(&self) {
        self.any_started.store(true, Ordering::Release);
    }

    pub fn whitelist(&self) -> Option<&Whitelist> {
        self.whitelist.get()
    }

    pub fn kernel_helpers(&self) -> KernelHelpers {
        self.kernel.get().copied().unwrap_or_default()
    }
}
