//! C entry points installed as replacements.
//!
//! Every function is instantiated once per target index so the replacement
//! knows which target it belongs to without inspecting its arguments. The
//! body only fetches the installed engine and forwards to the handler.

use core::ffi::{c_char, c_void, CStr};
use std::sync::{Arc, RwLock};

use brcmfx_intercept::Address;
use log::{debug, error};

use crate::catalog::{CountryCodeAbi, PatchPoint, TARGETS, TARGET_COUNT};
use crate::engine::Engine;
use crate::handlers::is_ignored_panic;
use crate::host::ObjectRef;
use crate::originals::{
    BoardIdCheckFn, ChipRevisionFn, CountryCode4331Fn, CountryCodeFn, ProbeFn, StartFn,
};

type VendorStringFn = unsafe extern "C" fn(this: *mut c_void) -> *mut c_void;
type PanicFn = unsafe extern "C" fn(format: *const c_char);
type WowCapableFn = unsafe extern "C" fn(this: *mut c_void) -> bool;
type WowlEnableFn = unsafe extern "C" fn(wlc: *mut c_void) -> bool;

static CONTEXT: RwLock<Option<Arc<Engine>>> = RwLock::new(None);

/// Make `engine` the target of every replacement entry point.
pub fn install_context(engine: Arc<Engine>) {
    let mut context = CONTEXT.write().unwrap_or_else(|e| e.into_inner());
    if context.replace(engine).is_some() {
        debug!("replacing previously installed engine context");
    }
}

fn context() -> Option<Arc<Engine>> {
    CONTEXT.read().unwrap_or_else(|e| e.into_inner()).clone()
}

unsafe extern "C" fn start<const I: usize>(service: *mut c_void, provider: *mut c_void) -> bool {
    context().is_some_and(|engine| {
        engine.start(I, ObjectRef::from_ptr(service), ObjectRef::from_ptr(provider))
    })
}

unsafe extern "C" fn probe<const I: usize>(
    service: *mut c_void,
    provider: *mut c_void,
    score: *mut i32,
) -> *mut c_void {
    match context() {
        Some(engine) => engine
            .probe(I, ObjectRef::from_ptr(service), ObjectRef::from_ptr(provider), score)
            .as_ptr(),
        None => core::ptr::null_mut(),
    }
}

unsafe extern "C" fn chip_revision<const I: usize>(chip: *mut u32, a2: i64, a3: i64) -> i64 {
    match context() {
        Some(engine) => engine.chip_revision(I, chip, a2, a3),
        None => 0,
    }
}

unsafe extern "C" fn country_code<const I: usize>(wlc: i64, code: *const c_char, rev: i32) -> i64 {
    match context() {
        Some(engine) => engine.set_country_code(I, wlc, code, rev),
        None => -1,
    }
}

unsafe extern "C" fn country_code_4331<const I: usize>(
    wlc: i64,
    cntry: i64,
    code: *const c_char,
    rev: i32,
) -> i64 {
    match context() {
        Some(engine) => engine.set_country_code_4331(I, wlc, cntry, code, rev),
        None => -1,
    }
}

unsafe extern "C" fn vendor_string<const I: usize>(_this: *mut c_void) -> *mut c_void {
    match context() {
        Some(engine) => engine.vendor_string(I).as_ptr(),
        None => core::ptr::null_mut(),
    }
}

unsafe extern "C" fn check_board_id<const I: usize>(
    this: *mut c_void,
    board_id: *const c_char,
) -> bool {
    context().map_or(true, |engine| engine.check_board_id(I, this, board_id))
}

/// Only the format string is inspected; the variadic arguments are not read.
/// Anything but the known clock panic stays fatal, with or without an engine.
unsafe extern "C" fn osl_panic<const I: usize>(format: *const c_char) {
    let format = panic_format(format);
    match context() {
        Some(engine) => engine.osl_panic(format, || panic_message(format)),
        None if is_ignored_panic(format) => {}
        None => {
            error!("driver panic before initialization: {}", panic_message(format));
            std::process::abort();
        }
    }
}

unsafe fn panic_format<'a>(format: *const c_char) -> &'a CStr {
    if format.is_null() {
        c""
    } else {
        CStr::from_ptr(format)
    }
}

fn panic_message(format: &CStr) -> String {
    if format.is_empty() {
        "driver panic without a message".to_string()
    } else {
        format.to_string_lossy().into_owned()
    }
}

unsafe extern "C" fn wow_capable_platform<const I: usize>(_this: *mut c_void) -> bool {
    context().is_some_and(|engine| engine.wow_capable_platform(I))
}

unsafe extern "C" fn wowl_enable<const I: usize>(_wlc: *mut c_void) -> bool {
    context().is_some_and(|engine| engine.wowl_enable(I))
}

macro_rules! per_target {
    ($name:ident: $ty:ty = $f:ident) => {
        static $name: [$ty; TARGET_COUNT] = [$f::<0>, $f::<1>, $f::<2>, $f::<3>];
    };
}

per_target!(START: StartFn = start);
per_target!(PROBE: ProbeFn = probe);
per_target!(CHIP_REVISION: ChipRevisionFn = chip_revision);
per_target!(COUNTRY_CODE: CountryCodeFn = country_code);
per_target!(COUNTRY_CODE_4331: CountryCode4331Fn = country_code_4331);
per_target!(VENDOR_STRING: VendorStringFn = vendor_string);
per_target!(CHECK_BOARD_ID: BoardIdCheckFn = check_board_id);
per_target!(OSL_PANIC: PanicFn = osl_panic);
per_target!(WOW_CAPABLE: WowCapableFn = wow_capable_platform);
per_target!(WOWL_ENABLE: WowlEnableFn = wowl_enable);

/// Address of the replacement for `point` of target `index`, or 0 for an unknown index.
pub fn replacement(index: usize, point: PatchPoint) -> Address {
    let Some(descriptor) = TARGETS.get(index) else {
        return 0;
    };
    match point {
        PatchPoint::Start => START[index] as Address,
        PatchPoint::Probe => PROBE[index] as Address,
        PatchPoint::ChipRevision => CHIP_REVISION[index] as Address,
        PatchPoint::CountryCode => match descriptor.country_code_abi {
            CountryCodeAbi::Rev => COUNTRY_CODE[index] as Address,
            CountryCodeAbi::Rev4331 => COUNTRY_CODE_4331[index] as Address,
        },
        PatchPoint::VendorString => VENDOR_STRING[index] as Address,
        PatchPoint::BoardIdCheck => CHECK_BOARD_ID[index] as Address,
        PatchPoint::PanicFilter => OSL_PANIC[index] as Address,
        PatchPoint::WowCapable => WOW_CAPABLE[index] as Address,
        PatchPoint::WowlEnable => WOWL_ENABLE[index] as Address,
    }
}
