//! Runtime fixups for Broadcom AirPort driver modules.
//!
//! The host notifies the [`Engine`] about kernel and module loads. Matching
//! driver modules get a fixed set of functions redirected to the handlers in
//! [`handlers`], and a deferred matching timer makes the device registry
//! retry attaching a driver to the wireless provider.

pub mod catalog;
pub mod config;
pub mod engine;
pub mod handlers;
pub mod host;
pub mod logging;
pub mod originals;
pub mod patcher;
pub mod resolve;
pub mod scheduler;
pub mod trampolines;

#[cfg(test)]
mod test_utils;

use std::sync::Arc;

use log::info;

pub use catalog::{Descriptor, LifecycleState, PatchPoint, TARGETS, TARGET_COUNT};
pub use config::{AspmState, BootArgs, Config, ConfigError, ConfigSource, DeviceProperties, DriverSelection};
pub use engine::{Engine, HostServices, KernelHelpers, Whitelist};
pub use host::{DeviceRegistry, ObjectRef, Platform, RegistryError, ServiceHandle};
pub use scheduler::{FireOutcome, SchedulerError, ThreadWorkLoop, TimerQueue, TimerSource};

/// Bring the engine up: read the boot configuration, set up logging and
/// install the engine as the context of every replacement entry point.
pub fn init(services: HostServices) -> Arc<Engine> {
    let boot_args = services.platform.boot_args();
    let config = Config::from_sources(&[&boot_args as &dyn ConfigSource]);
    logging::init(&config);

    let engine = Engine::new(services);
    trampolines::install_context(engine.clone());
    if config.off {
        info!("brcmfx is disabled by boot arguments");
    } else {
        info!("brcmfx {} initialized", env!("CARGO_PKG_VERSION"));
    }
    engine
}
