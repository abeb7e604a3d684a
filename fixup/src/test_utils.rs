//! Mock host shared by the engine scenario tests.

use core::ffi::{c_char, c_void, CStr};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use brcmfx_intercept::{Address, ExportInfo, ExportTable, HookError, ModuleInfo, RouteBackend, Scope, SymbolResolver};

use crate::catalog::{
    CountryCodeAbi, PatchPoint, PCI_FAMILY_IDENTIFIER, SET_ASPM_STATE_SYMBOL, TARGETS, TARGET_COUNT,
    WHITELIST_SYMBOL,
};
use crate::config::{BootArgs, DeviceProperties};
use crate::engine::{Engine, HostServices};
use crate::host::{DeviceRegistry, ObjectRef, Platform, RegistryError, ServiceHandle};
use crate::originals::{
    BoardIdCheckFn, ChipRevisionFn, CountryCode4331Fn, CountryCodeFn, ProbeFn, SetAspmStateFn, StartFn,
};
use crate::scheduler::{SchedulerError, TimerCallback, TimerQueue, TimerSource};

/// Serialize tests that share the fake originals and the trampoline context.
pub(crate) fn lock_engine_tests() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let guard = LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner());
    let _ = env_logger::builder().is_test(true).try_init();
    reset_fakes();
    guard
}

pub(crate) const MODULE_SIZE: usize = 0x10000;
pub(crate) const KERNEL_HELPER_BASE: Address = 0xffff_0000;
pub(crate) const PCI_FAMILY_LOAD_INDEX: usize = 90;
pub(crate) const PROVIDER: ObjectRef = ObjectRef(0x5000);
pub(crate) const SERVICE: ObjectRef = ObjectRef(0x6000);
pub(crate) const VENDOR_SYMBOL: ObjectRef = ObjectRef(0xa11e);

pub(crate) fn module_base(index: usize) -> Address {
    0x10_0000 * (index + 1)
}

pub(crate) fn load_index(index: usize) -> usize {
    10 + index
}

pub(crate) fn module_scope(index: usize) -> Scope {
    Scope::module(load_index(index), module_base(index), MODULE_SIZE)
}

/// Address at which `point` of target `index` is exported.
pub(crate) fn symbol_address(index: usize, point: PatchPoint) -> Address {
    module_base(index) + 0x100 * (point.slot() + 1)
}

// Fake originals. Their observations go to statics reset by `lock_engine_tests`.

pub(crate) static START_CALLS: AtomicUsize = AtomicUsize::new(0);
pub(crate) static START_RESULT: AtomicBool = AtomicBool::new(true);
pub(crate) static PROBE_CALLS: AtomicUsize = AtomicUsize::new(0);
pub(crate) static CHIP_ID_SEEN: AtomicU32 = AtomicU32::new(0);
pub(crate) static COUNTRY_CALLS: Mutex<Vec<(String, i32)>> = Mutex::new(Vec::new());
pub(crate) static COUNTRY_4331_CNTRY: AtomicUsize = AtomicUsize::new(0);
pub(crate) static BOARD_CHECK_CALLS: AtomicUsize = AtomicUsize::new(0);
pub(crate) static ASPM_CALLS: Mutex<Vec<u32>> = Mutex::new(Vec::new());
pub(crate) static ASPM_RESULT: AtomicI32 = AtomicI32::new(0);

pub(crate) const COUNTRY_RESULT: i64 = 7;

fn reset_fakes() {
    START_CALLS.store(0, Ordering::SeqCst);
    START_RESULT.store(true, Ordering::SeqCst);
    PROBE_CALLS.store(0, Ordering::SeqCst);
    CHIP_ID_SEEN.store(0, Ordering::SeqCst);
    COUNTRY_CALLS.lock().unwrap_or_else(|e| e.into_inner()).clear();
    COUNTRY_4331_CNTRY.store(0, Ordering::SeqCst);
    BOARD_CHECK_CALLS.store(0, Ordering::SeqCst);
    ASPM_CALLS.lock().unwrap_or_else(|e| e.into_inner()).clear();
    ASPM_RESULT.store(0, Ordering::SeqCst);
}

unsafe extern "C" fn fake_start(_service: *mut c_void, _provider: *mut c_void) -> bool {
    START_CALLS.fetch_add(1, Ordering::SeqCst);
    // Widen the window for racing callers.
    std::thread::sleep(Duration::from_millis(20));
    START_RESULT.load(Ordering::SeqCst)
}

unsafe extern "C" fn fake_probe(service: *mut c_void, _provider: *mut c_void, _score: *mut i32) -> *mut c_void {
    PROBE_CALLS.fetch_add(1, Ordering::SeqCst);
    service
}

unsafe extern "C" fn fake_chip_revision(chip: *mut u32, a2: i64, a3: i64) -> i64 {
    CHIP_ID_SEEN.store(chip.add(15).read(), Ordering::SeqCst);
    a2 + a3
}

unsafe extern "C" fn fake_country_code(_wlc: i64, code: *const c_char, rev: i32) -> i64 {
    let code = CStr::from_ptr(code).to_string_lossy().into_owned();
    COUNTRY_CALLS.lock().unwrap_or_else(|e| e.into_inner()).push((code, rev));
    COUNTRY_RESULT
}

unsafe extern "C" fn fake_country_code_4331(_wlc: i64, cntry: i64, code: *const c_char, rev: i32) -> i64 {
    COUNTRY_4331_CNTRY.store(cntry as usize, Ordering::SeqCst);
    fake_country_code(0, code, rev)
}

unsafe extern "C" fn fake_board_id_check(_this: *mut c_void, _board_id: *const c_char) -> bool {
    BOARD_CHECK_CALLS.fetch_add(1, Ordering::SeqCst);
    false
}

unsafe extern "C" fn fake_set_aspm_state(_device: *mut c_void, _client: *mut c_void, state: u32) -> i32 {
    ASPM_CALLS.lock().unwrap_or_else(|e| e.into_inner()).push(state);
    ASPM_RESULT.load(Ordering::SeqCst)
}

unsafe extern "C" fn fake_unreachable() {
    panic!("original of a never-delegating hook was called");
}

fn fake_original(index: usize, point: PatchPoint) -> Address {
    match point {
        PatchPoint::Start => fake_start as StartFn as Address,
        PatchPoint::Probe => fake_probe as ProbeFn as Address,
        PatchPoint::ChipRevision => fake_chip_revision as ChipRevisionFn as Address,
        PatchPoint::CountryCode => match TARGETS[index].country_code_abi {
            CountryCodeAbi::Rev => fake_country_code as CountryCodeFn as Address,
            CountryCodeAbi::Rev4331 => fake_country_code_4331 as CountryCode4331Fn as Address,
        },
        PatchPoint::BoardIdCheck => fake_board_id_check as BoardIdCheckFn as Address,
        _ => fake_unreachable as unsafe extern "C" fn() as Address,
    }
}

/// One object playing every host role.
pub(crate) struct MockHost {
    exports: ExportTable,
    whitelist: Mutex<Option<Address>>,
    missing: Mutex<HashSet<(usize, PatchPoint)>>,
    pub routes: Mutex<Vec<(Scope, Address, Address)>>,
    pub fail_routes: Mutex<HashSet<Address>>,
    pub services: Mutex<Vec<ServiceHandle>>,
    pub terminate_result: AtomicBool,
    pub terminated: Mutex<Vec<String>>,
    pub match_by_name: Mutex<Vec<String>>,
    pub match_by_class: Mutex<Vec<String>>,
    pub removed_bindings: Mutex<Vec<(String, String)>>,
    pub names: Mutex<HashMap<ObjectRef, String>>,
    pub renamed: Mutex<Vec<(ObjectRef, String)>>,
    pub interned: Mutex<Vec<String>>,
    pub boot_args: Mutex<String>,
    pub properties: Mutex<HashMap<ObjectRef, DeviceProperties>>,
    pub sleeps: Mutex<Vec<Duration>>,
    /// Runs inside `sleep`, i.e. while a matching fire is settling.
    pub on_sleep: Mutex<Option<Box<dyn Fn() + Send>>>,
}

impl MockHost {
    /// Host exporting every kernel helper, every patch point of every target
    /// and `setASPMState`.
    pub fn new() -> Arc<Self> {
        let host = MockHost {
            exports: ExportTable::new(),
            whitelist: Mutex::new(None),
            missing: Mutex::new(HashSet::new()),
            routes: Mutex::new(Vec::new()),
            fail_routes: Mutex::new(HashSet::new()),
            services: Mutex::new(Vec::new()),
            terminate_result: AtomicBool::new(true),
            terminated: Mutex::new(Vec::new()),
            match_by_name: Mutex::new(Vec::new()),
            match_by_class: Mutex::new(Vec::new()),
            removed_bindings: Mutex::new(Vec::new()),
            names: Mutex::new(HashMap::new()),
            renamed: Mutex::new(Vec::new()),
            interned: Mutex::new(Vec::new()),
            boot_args: Mutex::new(String::new()),
            properties: Mutex::new(HashMap::new()),
            sleeps: Mutex::new(Vec::new()),
            on_sleep: Mutex::new(None),
        };

        host.exports.add_kernel_exports(
            [
                "__ZN11IOCatalogue13startMatchingEPK8OSSymbol",
                "__ZN11IOCatalogue13startMatchingEP12OSDictionary",
                "__ZN11IOCatalogue13removeDriversEP12OSDictionaryb",
            ]
            .iter()
            .enumerate()
            .map(|(i, name)| export(name, KERNEL_HELPER_BASE + 0x10 * i)),
        );
        for index in 0..TARGET_COUNT {
            let exports = PatchPoint::ALL
                .iter()
                .map(|&p| export(TARGETS[index].symbol(p), symbol_address(index, p)));
            host.exports.add_module_exports(&module_info(index), exports);
        }
        host.exports.add_module_exports(
            &ModuleInfo {
                name: PCI_FAMILY_IDENTIFIER.to_string(),
                path: String::new(),
                load_index: PCI_FAMILY_LOAD_INDEX,
                base_address: fake_set_aspm_state as SetAspmStateFn as Address,
                size: 1,
            },
            [export(SET_ASPM_STATE_SYMBOL, fake_set_aspm_state as SetAspmStateFn as Address)],
        );
        host.names.lock().unwrap().insert(PROVIDER, "pci14e4,43a0".to_string());
        host.names.lock().unwrap().insert(SERVICE, "AirPort_BrcmNIC".to_string());
        Arc::new(host)
    }

    /// Drop the export of `point` in target `index`.
    pub fn remove_export(&self, index: usize, point: PatchPoint) {
        self.missing.lock().unwrap().insert((index, point));
    }

    /// Export a whitelist for the Brcm4360 module. The array is leaked.
    pub fn export_whitelist(&self, entries: &[&'static CStr]) {
        let mut raw: Vec<*const c_char> = entries.iter().map(|e| e.as_ptr()).collect();
        raw.push(core::ptr::null());
        let raw: &'static [*const c_char] = Box::leak(raw.into_boxed_slice());
        *self.whitelist.lock().unwrap() = Some(raw.as_ptr() as Address);
    }

    pub fn add_service(&self, name: &str, has_provider: bool) {
        self.services.lock().unwrap().push(ServiceHandle {
            object: ObjectRef(0x7000),
            name: name.to_string(),
            bundle_identifier: Some("as.lvs1974.AirportBrcmFixup".to_string()),
            io_class: Some(name.to_string()),
            has_provider,
        });
    }

    pub fn set_boot_args(&self, args: &str) {
        *self.boot_args.lock().unwrap() = args.to_string();
    }

    pub fn set_properties(&self, provider: ObjectRef, json: &str) {
        let properties = DeviceProperties::from_json(json).unwrap();
        self.properties.lock().unwrap().insert(provider, properties);
    }

    pub fn fail_route(&self, function: Address) {
        self.fail_routes.lock().unwrap().insert(function);
    }

    pub fn routes_in(&self, index: usize) -> Vec<Address> {
        let scope = module_scope(index);
        self.routes
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _, _)| *s == scope)
            .map(|(_, function, _)| *function)
            .collect()
    }

    pub fn slept(&self, duration: Duration) -> usize {
        self.sleeps.lock().unwrap().iter().filter(|d| **d == duration).count()
    }
}

fn export(name: &str, address: Address) -> ExportInfo {
    ExportInfo {
        name: name.to_string(),
        address,
    }
}

fn module_info(index: usize) -> ModuleInfo {
    ModuleInfo {
        name: TARGETS[index].identifier.to_string(),
        path: TARGETS[index].paths[0].to_string(),
        load_index: load_index(index),
        base_address: module_base(index),
        size: MODULE_SIZE,
    }
}

fn target_of(scope: Scope) -> Option<usize> {
    match scope {
        Scope::Module { load_index: loaded, .. } => (0..TARGET_COUNT).find(|&i| load_index(i) == loaded),
        Scope::Kernel => None,
    }
}

impl SymbolResolver for MockHost {
    fn resolve(&self, scope: Scope, name: &str) -> Result<Address, HookError> {
        if name == WHITELIST_SYMBOL {
            if let Some(address) = *self.whitelist.lock().unwrap() {
                return Ok(address);
            }
        }
        if let Some(index) = target_of(scope) {
            let missing = self.missing.lock().unwrap();
            if missing.iter().any(|&(i, p)| i == index && TARGETS[index].symbol(p) == name) {
                return Err(HookError::SymbolNotFound(name.to_string()));
            }
        }
        self.exports.resolve(scope, name)
    }
}

impl RouteBackend for MockHost {
    fn route(&self, scope: Scope, function: Address, replacement: Address) -> Result<Address, HookError> {
        if self.fail_routes.lock().unwrap().contains(&function) {
            return Err(HookError::Backend("page is write protected".to_string()));
        }
        let index = target_of(scope).ok_or(HookError::Unsupported)?;
        let point = PatchPoint::ALL
            .into_iter()
            .find(|&p| symbol_address(index, p) == function)
            .ok_or(HookError::Unsupported)?;
        self.routes.lock().unwrap().push((scope, function, replacement));
        Ok(fake_original(index, point))
    }
}

impl DeviceRegistry for MockHost {
    fn find_service(&self, name_prefix: &str) -> Option<ServiceHandle> {
        self.services
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.name.starts_with(name_prefix))
            .cloned()
    }

    fn terminate(&self, service: &ServiceHandle) -> bool {
        self.terminated.lock().unwrap().push(service.name.clone());
        self.terminate_result.load(Ordering::SeqCst)
    }

    fn request_match_by_name(&self, bundle_identifier: &str) -> Result<(), RegistryError> {
        self.match_by_name.lock().unwrap().push(bundle_identifier.to_string());
        Ok(())
    }

    fn request_match_by_provider_class(&self, class_name: &str) -> Result<(), RegistryError> {
        self.match_by_class.lock().unwrap().push(class_name.to_string());
        Ok(())
    }

    fn remove_driver_binding(&self, bundle_identifier: &str, class_name: &str) -> Result<(), RegistryError> {
        self.removed_bindings
            .lock()
            .unwrap()
            .push((bundle_identifier.to_string(), class_name.to_string()));
        Ok(())
    }
}

impl Platform for MockHost {
    fn object_name(&self, object: ObjectRef) -> Option<String> {
        self.names.lock().unwrap().get(&object).cloned()
    }

    fn rename_object(&self, object: ObjectRef, name: &str) {
        self.renamed.lock().unwrap().push((object, name.to_string()));
        self.names.lock().unwrap().insert(object, name.to_string());
    }

    fn intern_symbol(&self, value: &str) -> ObjectRef {
        self.interned.lock().unwrap().push(value.to_string());
        VENDOR_SYMBOL
    }

    fn boot_args(&self) -> BootArgs {
        BootArgs::parse(&self.boot_args.lock().unwrap())
    }

    fn device_properties(&self, provider: ObjectRef) -> Option<DeviceProperties> {
        self.properties.lock().unwrap().get(&provider).cloned()
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
        let hook = self.on_sleep.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn fatal(&self, message: &str) -> ! {
        panic!("fatal: {message}");
    }
}

#[derive(Default)]
struct ManualTimerState {
    callback: Mutex<Option<TimerCallback>>,
    pending: Mutex<Option<Duration>>,
    history: Mutex<Vec<Duration>>,
}

/// Timer queue fired by hand.
#[derive(Default)]
pub(crate) struct ManualTimerQueue {
    state: Arc<ManualTimerState>,
    pub created: AtomicUsize,
    pub unavailable: AtomicBool,
}

struct ManualTimer {
    state: Arc<ManualTimerState>,
}

impl TimerSource for ManualTimer {
    fn set_timeout(&self, delay: Duration) {
        *self.state.pending.lock().unwrap() = Some(delay);
        self.state.history.lock().unwrap().push(delay);
    }

    fn cancel(&self) {
        *self.state.pending.lock().unwrap() = None;
    }
}

impl TimerQueue for ManualTimerQueue {
    fn create_timer(&self, callback: TimerCallback) -> Result<Box<dyn TimerSource>, SchedulerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SchedulerError::WorkLoopUnavailable);
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        *self.state.callback.lock().unwrap() = Some(callback);
        Ok(Box::new(ManualTimer {
            state: self.state.clone(),
        }))
    }
}

impl ManualTimerQueue {
    pub fn pending(&self) -> Option<Duration> {
        *self.state.pending.lock().unwrap()
    }

    /// Every delay the timer was armed with, in order.
    pub fn history(&self) -> Vec<Duration> {
        self.state.history.lock().unwrap().clone()
    }

    /// Run the pending timeout, if any.
    pub fn fire(&self) -> bool {
        if self.state.pending.lock().unwrap().take().is_none() {
            return false;
        }
        let callback = self.state.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback();
        }
        true
    }

    /// Fire until nothing is pending; returns the number of fires.
    pub fn run_until_idle(&self) -> usize {
        let mut fires = 0;
        while self.fire() {
            fires += 1;
            assert!(fires < 100, "timer never went idle");
        }
        fires
    }
}

/// Engine wired to `host` with a manual timer queue.
pub(crate) fn engine_with(host: &Arc<MockHost>, attempts: u32) -> (Arc<Engine>, Arc<ManualTimerQueue>) {
    let timers = Arc::new(ManualTimerQueue::default());
    let engine = Engine::with_attempts(
        HostServices {
            resolver: host.clone(),
            router: host.clone(),
            registry: host.clone(),
            platform: host.clone(),
            timers: timers.clone(),
        },
        attempts,
    );
    (engine, timers)
}

/// Deliver the load notification of target `index`.
pub(crate) fn load_target(engine: &Engine, index: usize) {
    engine.on_module_loaded(
        TARGETS[index].identifier,
        module_base(index),
        MODULE_SIZE,
        load_index(index),
    );
}

pub(crate) fn load_pci_family(engine: &Engine) {
    engine.on_module_loaded(
        PCI_FAMILY_IDENTIFIER,
        fake_set_aspm_state as SetAspmStateFn as Address,
        1,
        PCI_FAMILY_LOAD_INDEX,
    );
}
