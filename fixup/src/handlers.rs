//! Replacement bodies for every patch point.
//!
//! Each handler takes the target index explicitly; the per-index C entry
//! points in [`crate::trampolines`] only forward here.

use core::ffi::{c_char, c_void, CStr};
use std::borrow::Cow;
use std::ffi::CString;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::catalog::{self, BRCM_4360, PROVIDER_NAME, VENDOR_NAME};
use crate::config::Config;
use crate::engine::Engine;
use crate::host::ObjectRef;
use crate::originals::SetAspmStateFn;

/// Byte offset of the chip identifier inside the chip-info buffer.
pub const CHIP_ID_OFFSET: usize = 0x3c;
/// BCM43602, the only chip the PLL setup code accepts on older releases.
pub const SPOOFED_CHIP_ID: u32 = 0xaa52;
/// Panic raised by the drivers on boards without an external 32 kHz clock.
pub const IGNORED_PANIC: &str = "32KHz LPO Clock not running";
/// Revision passed along with the substituted country code.
pub const COUNTRY_REVISION: i32 = -1;
/// Time the firmware needs to apply a new regulatory domain.
pub const COUNTRY_SETTLE_DELAY: Duration = Duration::from_millis(300);
/// `BCME_ERROR`, reported when no original setter is available.
const BCME_ERROR: i64 = -1;

pub fn is_ignored_panic(format: &CStr) -> bool {
    format.to_bytes() == IGNORED_PANIC.as_bytes()
}

impl Engine {
    /// Lifecycle-start guard: at most one delegation per target.
    pub fn start(&self, index: usize, service: ObjectRef, provider: ObjectRef) -> bool {
        let service_name = self.describe(service);
        debug!(
            "start is called, service name is {}, provider name is {}",
            service_name,
            self.describe(provider)
        );

        self.remember_provider(provider);
        let config = self.snapshot(Some(provider));
        if config.off || !catalog::is_enabled(index, &config) {
            debug!("start: disable service {}", service_name);
            return false;
        }

        self.prepare_provider(provider, &config, true);

        let Some(guard) = self.start_called.get(index) else {
            return false;
        };
        if guard
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("start was already called for service {}", service_name);
            return false;
        }

        let Some(original) = self.target(index).and_then(|t| t.originals.start()) else {
            error!("no original start for {}", service_name);
            return false;
        };

        if config.start_delay_ms > 0 {
            self.platform.sleep(config.start_delay());
        }
        // SAFETY: the original was captured from the route backend for this
        // target's start method and receives the caller's own arguments.
        let result = unsafe { original(service.as_ptr(), provider.as_ptr()) };
        debug!("start is finished with result {}", result);
        if result {
            self.mark_service_started();
        }
        result
    }

    /// Probe wrapper: refuses disabled targets, otherwise delegates.
    ///
    /// # Safety
    /// `score` is forwarded untouched to the original probe.
    pub unsafe fn probe(
        &self,
        index: usize,
        service: ObjectRef,
        provider: ObjectRef,
        score: *mut i32,
    ) -> ObjectRef {
        let service_name = self.describe(service);
        debug!(
            "probe is called, service name is {}, provider name is {}",
            service_name,
            self.describe(provider)
        );

        self.remember_provider(provider);
        let config = self.snapshot(Some(provider));
        if config.off || !catalog::is_enabled(index, &config) {
            debug!("probe: disable service {}", service_name);
            return ObjectRef::NULL;
        }

        self.prepare_provider(provider, &config, false);

        let Some(original) = self.target(index).and_then(|t| t.originals.probe()) else {
            error!("no original probe for {}", service_name);
            return ObjectRef::NULL;
        };
        let result = ObjectRef::from_ptr(original(service.as_ptr(), provider.as_ptr(), score));
        debug!(
            "probe is finished with result {}",
            if result.is_null() { "failed" } else { "success" }
        );
        result
    }

    /// Present the chip as BCM43602 for the duration of the original call.
    ///
    /// # Safety
    /// `chip` must point to a chip-info buffer of at least
    /// `CHIP_ID_OFFSET + 4` bytes.
    pub unsafe fn chip_revision(&self, index: usize, chip: *mut u32, a2: i64, a3: i64) -> i64 {
        let Some(original) = self.target(index).and_then(|t| t.originals.chip_revision()) else {
            error!("no original chip revision check for target {}", index);
            return 0;
        };

        let slot = chip.add(CHIP_ID_OFFSET / 4);
        let saved = slot.read_unaligned();
        slot.write_unaligned(SPOOFED_CHIP_ID);
        debug!("chip revision check {}, original chip id = {:04x}", index, saved);

        let result = original(chip, a2, a3);
        slot.write_unaligned(saved);
        result
    }

    /// Country-code override for the three-argument setter.
    ///
    /// # Safety
    /// `code` must be null or a valid C string.
    pub unsafe fn set_country_code(&self, index: usize, wlc: i64, code: *const c_char, rev: i32) -> i64 {
        let Some(original) = self.target(index).and_then(|t| t.originals.country_code()) else {
            error!("no original country code setter for target {}", index);
            return BCME_ERROR;
        };
        let replacement = self.country_code(index, code, rev);

        let result = original(wlc, replacement.as_ptr(), COUNTRY_REVISION);
        self.settle_country_code(&replacement, result)
    }

    /// Country-code override for the four-argument setter of the 4331 driver.
    ///
    /// # Safety
    /// `code` must be null or a valid C string.
    pub unsafe fn set_country_code_4331(
        &self,
        index: usize,
        wlc: i64,
        cntry: i64,
        code: *const c_char,
        rev: i32,
    ) -> i64 {
        let Some(original) = self.target(index).and_then(|t| t.originals.country_code_4331()) else {
            error!("no original country code setter for target {}", index);
            return BCME_ERROR;
        };
        let replacement = self.country_code(index, code, rev);

        let result = original(wlc, cntry, replacement.as_ptr(), COUNTRY_REVISION);
        self.settle_country_code(&replacement, result)
    }

    unsafe fn country_code(&self, index: usize, code: *const c_char, rev: i32) -> CString {
        let requested = if code.is_null() {
            Cow::Borrowed("(null)")
        } else {
            CStr::from_ptr(code).to_string_lossy()
        };
        let configured = self.snapshot(None).country_code;
        debug!(
            "country code setter {} is called, rev = {}, country_code = {}, replacing with {}",
            index, rev, requested, configured
        );
        // Parsed codes are short alphanumerics, never containing NUL.
        CString::new(configured).unwrap_or_default()
    }

    fn settle_country_code(&self, code: &CStr, result: i64) -> i64 {
        debug!("country code is changed to {:?}, result = {}", code, result);
        self.platform.sleep(COUNTRY_SETTLE_DELAY);
        result
    }

    /// Vendor name reported instead of the driver's own.
    pub fn vendor_string(&self, index: usize) -> ObjectRef {
        debug!("vendor string of target {} is requested, returning {}", index, VENDOR_NAME);
        self.platform.intern_symbol(VENDOR_NAME)
    }

    /// Returns true when the board is restricted.
    ///
    /// # Safety
    /// `board_id` must be null or a valid C string; `this` is forwarded untouched.
    pub unsafe fn check_board_id(&self, index: usize, this: *mut c_void, board_id: *const c_char) -> bool {
        let board = if board_id.is_null() {
            None
        } else {
            Some(CStr::from_ptr(board_id).to_string_lossy())
        };

        if index == BRCM_4360 {
            if let (Some(list), Some(board)) = (self.whitelist(), board.as_deref()) {
                if list.contains(board) {
                    debug!("board id {} is whitelisted", board);
                    return false;
                }
            }
        }

        match self.target(index).and_then(|t| t.originals.board_id_check()) {
            Some(original) => original(this, board_id),
            None => true,
        }
    }

    pub fn wow_capable_platform(&self, index: usize) -> bool {
        debug!("wowCapablePlatform of target {} is called, reporting false", index);
        false
    }

    pub fn wowl_enable(&self, index: usize) -> bool {
        debug!("wlc_wowl_enable of target {} is called, reporting false", index);
        false
    }

    /// Driver panic hook. Only the LPO clock panic is swallowed.
    ///
    /// `message` renders the full panic text and is only evaluated when fatal.
    pub fn osl_panic(&self, format: &CStr, message: impl FnOnce() -> String) {
        if is_ignored_panic(format) {
            info!("ignoring driver panic: {}", IGNORED_PANIC);
            return;
        }
        let message = message();
        error!("driver panic: {}", message);
        self.platform.fatal(&message);
    }

    fn prepare_provider(&self, provider: ObjectRef, config: &Config, rename: bool) {
        if provider.is_null() {
            return;
        }

        if rename && self.platform.object_name(provider).as_deref() != Some(PROVIDER_NAME) {
            debug!("renaming provider to {}", PROVIDER_NAME);
            self.platform.rename_object(provider, PROVIDER_NAME);
        }

        if !config.override_aspm {
            return;
        }
        let Some(&address) = self.set_aspm_state.get() else {
            debug!("setASPMState is not resolved, keeping link state");
            return;
        };
        // SAFETY: resolved from IOPCIFamily under the setASPMState symbol.
        let set_aspm_state = unsafe { core::mem::transmute::<usize, SetAspmStateFn>(address) };
        let result = unsafe { set_aspm_state(provider.as_ptr(), provider.as_ptr(), config.aspm as u32) };
        if result != 0 {
            warn!("setASPMState has failed with code {:#x}", result);
        }
    }

    fn describe(&self, object: ObjectRef) -> String {
        if object.is_null() {
            return "(null)".to_string();
        }
        self.platform
            .object_name(object)
            .unwrap_or_else(|| "(unnamed)".to_string())
    }
}
