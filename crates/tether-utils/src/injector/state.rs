use serde::{Deserialize, Serialize};
use tether_core::Va;

/// State of the injection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InjectionState {
    /// Nothing is attached and no scan is running.
    Idle,

    /// Looking for the target process.
    Scanning,

    /// The target was found but not attached to yet.
    Found,

    /// Opening the target's memory.
    Attaching,

    /// Attached to the target.
    Injected,

    /// Detached from the target on request.
    Detached,

    /// The last attach attempt failed.
    Failed,

    /// Attached, and a script is being delivered.
    Executing,
}

impl InjectionState {
    /// Checks whether a memory handle is held in this state.
    pub fn is_attached(self) -> bool {
        matches!(self, Self::Injected | Self::Executing)
    }

    /// Checks whether a scan may start from this state.
    pub fn can_scan(self) -> bool {
        matches!(
            self,
            Self::Idle | Self::Found | Self::Detached | Self::Failed
        )
    }
}

impl std::fmt::Display for InjectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Found => "found",
            Self::Attaching => "attaching",
            Self::Injected => "injected",
            Self::Detached => "detached",
            Self::Failed => "failed",
            Self::Executing => "executing",
        };

        f.write_str(name)
    }
}

/// What an attached injector can do.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InjectionMode {
    /// The guest VM was not located; scripts run in the local engine.
    #[default]
    LocalOnly,

    /// The guest VM was located inside the target.
    Full,
}

/// Best-guess reason of the last failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    /// No process matched any discovery step.
    NotFound,

    /// The process was found, but its memory could not be opened or
    /// enumerated.
    FoundButInaccessible,

    /// Attached, but the guest VM signature was not found.
    VmNotLocated,
}

/// Where the guest VM was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmLocateResult {
    /// Address of the signature hit.
    pub address: Va,

    /// Start of the region containing the hit.
    pub region_start: Va,

    /// Backing path of the region containing the hit.
    pub region_path: Option<String>,

    /// Number of regions scanned, including the one with the hit.
    pub regions_scanned: usize,

    /// Number of bytes covered by the scanned regions.
    pub bytes_scanned: u64,

    /// Whether the hit was confirmed by a second, independent check.
    ///
    /// The signature is short, so the first hit is taken as-is and this is
    /// currently always `false`.
    pub validated: bool,
}
