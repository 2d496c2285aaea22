//! Sandboxed Lua script host.
//!
//! A [`ScriptEngine`] owns one Lua 5.4 VM. Scripts run inside coroutines
//! driven by a cooperative [`scheduler`], talk to each other over a
//! [`signal`] bus, and can hook, clone and inspect functions through the
//! [`ClosureRegistry`]. File access is confined to a [`Workspace`].
//!
//! The [`bridge`] module feeds scripts into an engine living in another
//! process.

pub mod bridge;
mod closure;
mod config;
mod engine;
mod error;
mod globals;
mod observer;
pub mod scheduler;
pub mod signal;
mod workspace;

pub use self::{
    bridge::{ChannelConfig, DeliveryChannel, deliver},
    closure::{ClosureRegistry, SourceTag, expect_function, is_native},
    config::{DEFAULT_INSTRUCTION_INTERVAL, EngineConfig},
    engine::ScriptEngine,
    error::{
        BridgeError, Cancelled, EngineError, ScriptError, ScriptErrorKind, TypeMismatch,
        WorkspaceError,
    },
    observer::{EngineObserver, TracingObserver},
    workspace::Workspace,
};
