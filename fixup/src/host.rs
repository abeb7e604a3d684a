//! Interfaces to the host kernel services the engine consumes.

use core::ffi::c_void;
use std::time::Duration;

use thiserror::Error;

use crate::config::{BootArgs, DeviceProperties};

/// Opaque reference to a host object (service, provider, interned symbol).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef(pub usize);

impl ObjectRef {
    pub const NULL: ObjectRef = ObjectRef(0);

    pub fn from_ptr(ptr: *const c_void) -> Self {
        ObjectRef(ptr as usize)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0 as *mut c_void
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// A service found in the registry's service plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    pub object: ObjectRef,
    pub name: String,
    pub bundle_identifier: Option<String>,
    pub io_class: Option<String>,
    pub has_provider: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("catalogue rejected matching request for {0}")]
    MatchRejected(String),

    #[error("catalogue failed to remove drivers for {bundle}/{class}")]
    RemoveFailed { bundle: String, class: String },

    #[error("registry operation unsupported")]
    Unsupported,
}

/// The device-matching registry (service plane + driver catalogue).
pub trait DeviceRegistry: Send + Sync {
    /// First service whose name starts with `name_prefix`.
    fn find_service(&self, name_prefix: &str) -> Option<ServiceHandle>;

    /// Detach `service` from its provider. Returns true on success.
    fn terminate(&self, service: &ServiceHandle) -> bool;

    fn request_match_by_name(&self, bundle_identifier: &str) -> Result<(), RegistryError>;

    fn request_match_by_provider_class(&self, class_name: &str) -> Result<(), RegistryError>;

    fn remove_driver_binding(&self, bundle_identifier: &str, class_name: &str)
        -> Result<(), RegistryError>;
}

/// Miscellaneous kernel services used by the hook handlers.
pub trait Platform: Send + Sync {
    fn object_name(&self, object: ObjectRef) -> Option<String>;

    fn rename_object(&self, object: ObjectRef, name: &str);

    /// Intern a string as a kernel symbol object.
    fn intern_symbol(&self, value: &str) -> ObjectRef;

    fn boot_args(&self) -> BootArgs;

    /// Properties injected on `provider`, if any.
    fn device_properties(&self, provider: ObjectRef) -> Option<DeviceProperties>;

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    /// Abort the kernel with `message`. Never returns.
    fn fatal(&self, message: &str) -> !;
}
