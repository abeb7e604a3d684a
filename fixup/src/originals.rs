//! Preserved original implementations of redirected functions.

use core::ffi::{c_char, c_void};
use std::sync::OnceLock;

use brcmfx_intercept::Address;

use crate::catalog::{PatchPoint, PATCH_POINT_COUNT};

pub type StartFn = unsafe extern "C" fn(service: *mut c_void, provider: *mut c_void) -> bool;
pub type ProbeFn = unsafe extern "C" fn(
    service: *mut c_void,
    provider: *mut c_void,
    score: *mut i32,
) -> *mut c_void;
pub type ChipRevisionFn = unsafe extern "C" fn(chip: *mut u32, a2: i64, a3: i64) -> i64;
pub type CountryCodeFn = unsafe extern "C" fn(wlc: i64, code: *const c_char, rev: i32) -> i64;
pub type CountryCode4331Fn =
    unsafe extern "C" fn(wlc: i64, cntry: i64, code: *const c_char, rev: i32) -> i64;
pub type BoardIdCheckFn = unsafe extern "C" fn(this: *mut c_void, board_id: *const c_char) -> bool;
pub type SetAspmStateFn =
    unsafe extern "C" fn(device: *mut c_void, client: *mut c_void, state: u32) -> i32;

/// One set-once cell per patch point.
///
/// A captured address is never replaced, so handlers may read it without locking.
pub struct OriginalTable {
    slots: [OnceLock<Address>; PATCH_POINT_COUNT],
}

macro_rules! typed_original {
    ($(#[$meta:meta])* $name:ident, $point:expr, $ty:ty) => {
        $(#[$meta])*
        pub fn $name(&self) -> Option<$ty> {
            // SAFETY: the slot only holds addresses returned by the route
            // backend for this patch point, whose ABI is `$ty`.
            self.get($point)
                .map(|address| unsafe { core::mem::transmute::<Address, $ty>(address) })
        }
    };
}

impl OriginalTable {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| OnceLock::new()),
        }
    }

    /// Store the original for `point`. Returns false if one was already captured.
    pub fn capture(&self, point: PatchPoint, address: Address) -> bool {
        self.slots[point.slot()].set(address).is_ok()
    }

    pub fn get(&self, point: PatchPoint) -> Option<Address> {
        self.slots[point.slot()].get().copied()
    }

    pub fn captured(&self) -> usize {
        self.slots.iter().filter(|s| s.get().is_some()).count()
    }

    typed_original!(start, PatchPoint::Start, StartFn);
    typed_original!(probe, PatchPoint::Probe, ProbeFn);
    typed_original!(chip_revision, PatchPoint::ChipRevision, ChipRevisionFn);
    typed_original!(country_code, PatchPoint::CountryCode, CountryCodeFn);
    typed_original!(
        /// Same slot as [`Self::country_code`], for the 4331 calling convention.
        country_code_4331,
        PatchPoint::CountryCode,
        CountryCode4331Fn
    );
    typed_original!(board_id_check, PatchPoint::BoardIdCheck, BoardIdCheckFn);
}

impl Default for OriginalTable {
    fn default() -> Self {
        Self::new()
    }
}
