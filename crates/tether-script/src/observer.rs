use crate::ScriptError;

/// Receives everything a [`ScriptEngine`] reports outward.
///
/// The default methods forward to `tracing`.
///
/// [`ScriptEngine`]: crate::ScriptEngine
pub trait EngineObserver: Send + Sync {
    /// Called with text printed by a script.
    fn output(&self, text: &str) {
        tracing::info!(target: "tether::script", "{text}");
    }

    /// Called when a script, task or signal callback fails.
    fn error(&self, error: &ScriptError) {
        tracing::error!(
            target: "tether::script",
            kind = %error.kind,
            source = %error.source_name,
            line = ?error.line,
            context = error.context,
            "{}", error.message
        );
    }
}

/// Observer that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl EngineObserver for TracingObserver {}
