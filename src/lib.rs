//! Process locator, remote memory engine and sandboxed script host.
//!
//! This crate re-exports the member crates behind features and provides the
//! [`Orchestrator`], which wires a process injector and a script engine
//! together.

pub use tether_core::*;

/// Architecture implementations.
pub mod arch {
    pub use tether_core::arch::*;

    #[cfg(feature = "arch-aarch64")]
    pub use tether_arch_aarch64 as aarch64;

    #[cfg(feature = "arch-amd64")]
    pub use tether_arch_amd64 as amd64;
}

/// Memory drivers.
pub mod driver {
    #[cfg(feature = "driver-procfs")]
    pub use tether_driver_procfs as procfs;
}

/// Operating system support.
pub mod os {
    #[cfg(feature = "os-linux")]
    pub use tether_os_linux as linux;
}

#[cfg(feature = "script")]
pub use tether_script as script;

#[cfg(feature = "utils")]
pub use tether_utils as utils;

/// Architecture of the running process.
#[cfg(all(feature = "arch-amd64", target_arch = "x86_64"))]
pub type HostArch = tether_arch_amd64::Amd64;

/// Architecture of the running process.
#[cfg(all(feature = "arch-aarch64", target_arch = "aarch64"))]
pub type HostArch = tether_arch_aarch64::Aarch64;

#[cfg(all(feature = "os-linux", feature = "script", feature = "utils"))]
mod orchestrator;

#[cfg(all(feature = "os-linux", feature = "script", feature = "utils"))]
pub use self::orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorError, Route};

#[cfg(all(
    feature = "driver-procfs",
    feature = "os-linux",
    feature = "script",
    feature = "utils",
    any(
        all(feature = "arch-amd64", target_arch = "x86_64"),
        all(feature = "arch-aarch64", target_arch = "aarch64")
    )
))]
pub use self::orchestrator::LinuxOrchestrator;
