use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default number of VM instructions between two checks of the stop flag.
pub const DEFAULT_INSTRUCTION_INTERVAL: u32 = 1000;

/// Configuration of a [`ScriptEngine`].
///
/// [`ScriptEngine`]: crate::ScriptEngine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name reported by `identifyexecutor()`.
    pub name: String,

    /// Version reported by `identifyexecutor()`.
    pub version: String,

    /// Whether this engine is the real, user-facing one.
    ///
    /// `checkcaller()` falls back to this value when no frame on the stack
    /// decides the answer.
    pub primary: bool,

    /// Number of VM instructions between two checks of the stop flag.
    pub instruction_interval: u32,

    /// Root directory of the filesystem sandbox.
    pub workspace: PathBuf,

    /// Guest source executed once at init, after the hardening bootstrap.
    pub environment_bootstrap: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: String::from("Tether"),
            version: String::from(env!("CARGO_PKG_VERSION")),
            primary: true,
            instruction_interval: DEFAULT_INSTRUCTION_INTERVAL,
            workspace: PathBuf::from("workspace"),
            environment_bootstrap: None,
        }
    }
}

impl EngineConfig {
    /// Sets the sandbox root.
    pub fn with_workspace(self, workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            ..self
        }
    }

    /// Sets the environment bootstrap source.
    pub fn with_environment_bootstrap(self, source: impl Into<String>) -> Self {
        Self {
            environment_bootstrap: Some(source.into()),
            ..self
        }
    }

    /// Sets whether this engine is the primary one.
    pub fn with_primary(self, primary: bool) -> Self {
        Self { primary, ..self }
    }
}
