//! Static catalog of the driver modules that get patched.
//!
//! The descriptors are immutable. The per-target runtime fields (lifecycle
//! state, processed flag, captured originals) live in [`TargetEntry`].

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::config::{Config, DriverSelection};
use crate::originals::OriginalTable;

/// Number of patchable driver families.
pub const TARGET_COUNT: usize = 4;

pub const BRCM_NIC_MFG: usize = 0;
pub const BRCM_4360: usize = 1;
pub const BRCM_NIC: usize = 2;
pub const BRCM_4331: usize = 3;

/// Interned name the vendor-string hook reports.
pub const VENDOR_NAME: &str = "Apple";

/// Name the wireless provider must carry so only one driver claims it.
pub const PROVIDER_NAME: &str = "ARPT";

/// Provider class used to broaden device matching.
pub const PCI_PROVIDER_CLASS: &str = "IOPCIDevice";

/// Synthetic placeholder service that holds the device until a real driver starts.
pub const PLACEHOLDER_SERVICE: &str = "FakeBrcm";

/// Symbol exporting the board-id whitelist inside the Brcm4360 module.
pub const WHITELIST_SYMBOL: &str = "__cpmChanSwitchWhitelist";

/// Number of interceptable functions per target.
pub const PATCH_POINT_COUNT: usize = 9;

/// One interceptable function of a target module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchPoint {
    Start,
    Probe,
    ChipRevision,
    CountryCode,
    VendorString,
    BoardIdCheck,
    PanicFilter,
    WowCapable,
    WowlEnable,
}

impl PatchPoint {
    pub const ALL: [PatchPoint; PATCH_POINT_COUNT] = [
        PatchPoint::Start,
        PatchPoint::Probe,
        PatchPoint::ChipRevision,
        PatchPoint::CountryCode,
        PatchPoint::VendorString,
        PatchPoint::BoardIdCheck,
        PatchPoint::PanicFilter,
        PatchPoint::WowCapable,
        PatchPoint::WowlEnable,
    ];

    /// Position in a target's symbol table.
    pub const fn slot(self) -> usize {
        self as usize
    }

    /// Power-management points, only patched when wake-on-wireless is off.
    pub fn is_power_feature(self) -> bool {
        matches!(self, PatchPoint::WowCapable | PatchPoint::WowlEnable)
    }
}

/// Calling convention of the module's country-code setter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountryCodeAbi {
    /// `wlc_set_countrycode_rev(wlc, code, rev)`
    Rev,
    /// `wlc_set_countrycode_rev(wlc, cntry, code, rev)` as built into the 4331 driver.
    Rev4331,
}

#[derive(Debug)]
pub struct Descriptor {
    pub identifier: &'static str,
    pub paths: &'static [&'static str],
    pub service_name: &'static str,
    pub symbols: [&'static str; PATCH_POINT_COUNT],
    pub country_code_abi: CountryCodeAbi,
    /// Manufacturing-test build, skipped unless explicitly selected.
    pub manufacturing_only: bool,
}

impl Descriptor {
    pub fn symbol(&self, point: PatchPoint) -> &'static str {
        self.symbols[point.slot()]
    }

    pub fn patch_point_count(&self) -> usize {
        self.symbols.len()
    }
}

/// Module that exports `IOPCIDevice::setASPMState`.
pub const PCI_FAMILY_IDENTIFIER: &str = "com.apple.iokit.IOPCIFamily";
pub const PCI_FAMILY_PATHS: &[&str] =
    &["/System/Library/Extensions/IOPCIFamily.kext/IOPCIFamily"];
pub const SET_ASPM_STATE_SYMBOL: &str = "__ZN11IOPCIDevice12setASPMStateEP9IOServicej";

pub static TARGETS: [Descriptor; TARGET_COUNT] = [
    Descriptor {
        identifier: "com.apple.driver.AirPort.BrcmNIC-MFG",
        paths: &["/System/Library/Extensions/IO80211Family.kext/Contents/PlugIns/AirPortBrcmNIC-MFG.kext/Contents/MacOS/AirPortBrcmNIC-MFG"],
        service_name: "AirPort_BrcmNIC_MFG",
        symbols: [
            "__ZN19AirPort_BrcmNIC_MFG5startEP9IOService",
            "__ZN19AirPort_BrcmNIC_MFG5probeEP9IOServicePi",
            "_si_pmu_fvco_pllreg",
            "_wlc_set_countrycode_rev",
            "__ZN19AirPort_BrcmNIC_MFG15newVendorStringEv",
            "__ZN19AirPort_BrcmNIC_MFG12checkBoardIdEPKc",
            "_osl_panic",
            "__ZN19AirPort_BrcmNIC_MFG18wowCapablePlatformEv",
            "_wlc_wowl_enable",
        ],
        country_code_abi: CountryCodeAbi::Rev,
        manufacturing_only: true,
    },
    Descriptor {
        identifier: "com.apple.driver.AirPort.Brcm4360",
        paths: &["/System/Library/Extensions/IO80211Family.kext/Contents/PlugIns/AirPortBrcm4360.kext/Contents/MacOS/AirPortBrcm4360"],
        service_name: "AirPort_Brcm4360",
        symbols: [
            "__ZN16AirPort_Brcm43605startEP9IOService",
            "__ZN16AirPort_Brcm43605probeEP9IOServicePi",
            "_si_pmu_fvco_pllreg",
            "_wlc_set_countrycode_rev",
            "__ZN16AirPort_Brcm436015newVendorStringEv",
            "__ZN16AirPort_Brcm436012checkBoardIdEPKc",
            "_osl_panic",
            "__ZN16AirPort_Brcm436018wowCapablePlatformEv",
            "_wlc_wowl_enable",
        ],
        country_code_abi: CountryCodeAbi::Rev,
        manufacturing_only: false,
    },
    Descriptor {
        identifier: "com.apple.driver.AirPort.BrcmNIC",
        paths: &[
            "/System/Library/Extensions/IO80211Family.kext/Contents/PlugIns/AirPortBrcmNIC.kext/Contents/MacOS/AirPortBrcmNIC",
            "/System/Library/Extensions/IO80211FamilyLegacy.kext/Contents/PlugIns/AirPortBrcmNIC.kext/Contents/MacOS/AirPortBrcmNIC",
        ],
        service_name: "AirPort_BrcmNIC",
        symbols: [
            "__ZN15AirPort_BrcmNIC5startEP9IOService",
            "__ZN15AirPort_BrcmNIC5probeEP9IOServicePi",
            "_si_pmu_fvco_pllreg",
            "_wlc_set_countrycode_rev",
            "__ZN15AirPort_BrcmNIC15newVendorStringEv",
            "__ZN15AirPort_BrcmNIC12checkBoardIdEPKc",
            "_osl_panic",
            "__ZN15AirPort_BrcmNIC18wowCapablePlatformEv",
            "_wlc_wowl_enable",
        ],
        country_code_abi: CountryCodeAbi::Rev,
        manufacturing_only: false,
    },
    Descriptor {
        identifier: "com.apple.driver.AirPort.Brcm4331",
        paths: &["/System/Library/Extensions/IO80211Family.kext/Contents/PlugIns/AirPortBrcm4331.kext/Contents/MacOS/AirPortBrcm4331"],
        service_name: "AirPort_Brcm4331",
        symbols: [
            "__ZN16AirPort_Brcm43315startEP9IOService",
            "__ZN16AirPort_Brcm43315probeEP9IOServicePi",
            "_si_pmu_fvco_pllreg",
            "_wlc_set_countrycode_rev",
            "__ZN16AirPort_Brcm433115newVendorStringEv",
            "__ZN16AirPort_Brcm433112checkBoardIdEPKc",
            "_osl_panic",
            "__ZN16AirPort_Brcm433118wowCapablePlatformEv",
            "_wlc_wowl_enable",
        ],
        country_code_abi: CountryCodeAbi::Rev4331,
        manufacturing_only: false,
    },
];

pub fn descriptor_for(identifier: &str) -> Option<&'static Descriptor> {
    TARGETS.iter().find(|d| d.identifier == identifier)
}

pub fn index_of(identifier: &str) -> Option<usize> {
    TARGETS.iter().position(|d| d.identifier == identifier)
}

/// Whether target `index` may be patched and started under `config`.
///
/// A pinned selection disables every other target; with automatic selection
/// only the manufacturing build is left out.
pub fn is_enabled(index: usize, config: &Config) -> bool {
    let Some(descriptor) = TARGETS.get(index) else {
        return false;
    };
    match config.driver {
        DriverSelection::Pinned(selected) => selected == index,
        DriverSelection::Auto => !descriptor.manufacturing_only,
    }
}

/// Lifecycle of a target within the current boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Unloaded = 0,
    Resolved = 1,
    Patched = 2,
    Disabled = 3,
}

impl LifecycleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => LifecycleState::Resolved,
            2 => LifecycleState::Patched,
            3 => LifecycleState::Disabled,
            _ => LifecycleState::Unloaded,
        }
    }
}

/// Runtime state attached to one catalog descriptor.
pub struct TargetEntry {
    pub descriptor: &'static Descriptor,
    state: AtomicU8,
    processed: AtomicBool,
    pub originals: OriginalTable,
}

impl TargetEntry {
    fn new(descriptor: &'static Descriptor) -> Self {
        Self {
            descriptor,
            state: AtomicU8::new(LifecycleState::Unloaded as u8),
            processed: AtomicBool::new(false),
            originals: OriginalTable::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: LifecycleState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Claim the one-time processing of this target. Returns false if already claimed.
    pub(crate) fn claim(&self) -> bool {
        self.processed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_processed(&self) -> bool {
        self.processed.load(Ordering::Acquire)
    }
}

/// The fixed-size table of targets with their runtime state.
pub struct Catalog {
    entries: [TargetEntry; TARGET_COUNT],
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            entries: std::array::from_fn(|i| TargetEntry::new(&TARGETS[i])),
        }
    }

    pub fn entry(&self, index: usize) -> Option<&TargetEntry> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> impl Iterator<Item = (usize, &TargetEntry)> {
        self.entries.iter().enumerate()
    }

    pub fn descriptor_for(&self, identifier: &str) -> Option<&'static Descriptor> {
        descriptor_for(identifier)
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}
