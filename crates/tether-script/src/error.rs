use std::path::PathBuf;

/// Kind of a script failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptErrorKind {
    /// The source did not compile; nothing ran.
    Compile,

    /// The script raised an error while running.
    Runtime,

    /// The script was aborted by a stop request.
    Cancelled,

    /// A primitive was called with an argument of the wrong type.
    Type,
}

impl std::fmt::Display for ScriptErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Self::Compile => "compile error",
            Self::Runtime => "runtime error",
            Self::Cancelled => "cancelled",
            Self::Type => "type error",
        };

        f.write_str(name)
    }
}

/// A structured script failure, as reported to an [`EngineObserver`].
///
/// [`EngineObserver`]: crate::EngineObserver
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{source_name}: {kind}: {message}")]
pub struct ScriptError {
    /// What went wrong.
    pub kind: ScriptErrorKind,

    /// Message without the stack traceback.
    pub message: String,

    /// Best-effort line number.
    pub line: Option<u32>,

    /// Name of the script the error belongs to.
    pub source_name: String,

    /// Where the error surfaced, e.g. `task` or `signal`.
    pub context: Option<&'static str>,
}

impl ScriptError {
    /// Builds a script error from a VM error.
    pub fn from_lua(kind: ScriptErrorKind, error: &mlua::Error, source_name: &str) -> Self {
        let kind = if is_cancellation(error) {
            ScriptErrorKind::Cancelled
        }
        else if is_type_mismatch(error) {
            ScriptErrorKind::Type
        }
        else {
            kind
        };

        let message = root_message(error);
        let line = parse_line(&message);

        Self {
            kind,
            message,
            line,
            source_name: source_name.into(),
            context: None,
        }
    }

    /// Attaches the place the error surfaced.
    pub fn with_context(self, context: &'static str) -> Self {
        Self {
            context: Some(context),
            ..self
        }
    }
}

/// Raised from the instruction hook when a stop was requested.
#[derive(thiserror::Error, Debug)]
#[error("script execution was cancelled")]
pub struct Cancelled;

/// Checks whether a VM error originates from a stop request.
pub(crate) fn is_cancellation(error: &mlua::Error) -> bool {
    match error {
        mlua::Error::ExternalError(inner) => inner.downcast_ref::<Cancelled>().is_some(),
        mlua::Error::CallbackError { cause, .. } => is_cancellation(cause),
        mlua::Error::WithContext { cause, .. } => is_cancellation(cause),
        // Rethrown by guest code as a plain string.
        mlua::Error::RuntimeError(message) => message.contains("script execution was cancelled"),
        _ => false,
    }
}

/// Raised when a primitive receives an argument of the wrong type.
#[derive(thiserror::Error, Debug)]
#[error("bad argument #{position} to '{function}' ({expected} expected, got {got})")]
pub struct TypeMismatch {
    /// Name of the primitive.
    pub function: &'static str,

    /// One-based argument position.
    pub position: usize,

    /// Expected type name.
    pub expected: &'static str,

    /// Received type name.
    pub got: &'static str,
}

fn is_type_mismatch(error: &mlua::Error) -> bool {
    match error {
        mlua::Error::ExternalError(inner) => inner.downcast_ref::<TypeMismatch>().is_some(),
        mlua::Error::CallbackError { cause, .. } => is_type_mismatch(cause),
        mlua::Error::WithContext { cause, .. } => is_type_mismatch(cause),
        _ => false,
    }
}

fn root_message(error: &mlua::Error) -> String {
    let message = match error {
        mlua::Error::CallbackError { cause, .. } => return root_message(cause),
        mlua::Error::WithContext { cause, .. } => return root_message(cause),
        mlua::Error::SyntaxError { message, .. } => message.clone(),
        mlua::Error::RuntimeError(message) => message.clone(),
        other => other.to_string(),
    };

    match message.find("\nstack traceback:") {
        Some(end) => message[..end].to_owned(),
        None => message,
    }
}

/// Extracts the line number from a `chunk:line: message` string.
fn parse_line(message: &str) -> Option<u32> {
    message
        .split(':')
        .skip(1)
        .find(|part| !part.is_empty() && part.bytes().all(|byte| byte.is_ascii_digit()))
        .and_then(|part| part.parse().ok())
}

/// An error of the engine itself, as opposed to a script failure.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// The engine is not initialized.
    #[error("Engine is not running")]
    NotRunning,

    /// A script failed.
    #[error(transparent)]
    Script(#[from] ScriptError),

    /// The VM failed outside of a script.
    #[error(transparent)]
    Lua(#[from] mlua::Error),

    /// The workspace could not be prepared.
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}

/// An error of the filesystem sandbox.
#[derive(thiserror::Error, Debug)]
pub enum WorkspaceError {
    /// The path resolves outside of the workspace root.
    #[error("Path escapes the workspace: {0}")]
    Escape(String),

    /// The path does not exist.
    #[error("No such file or folder: {0}")]
    NotFound(String),

    /// An I/O error occurred.
    #[error("Workspace I/O error on {path}: {source}")]
    Io {
        /// Offending path.
        path: PathBuf,

        /// Underlying error.
        source: std::io::Error,
    },
}

/// An error of the delivery channel.
#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    /// The socket could not be bound, connected or written.
    #[error("Socket error on {path}: {source}")]
    Socket {
        /// Socket path.
        path: PathBuf,

        /// Underlying error.
        source: std::io::Error,
    },

    /// The payload engine could not be started.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_is_parsed_after_chunk_name() {
        assert_eq!(parse_line("[tether:input] main:3: boom"), Some(3));
        assert_eq!(parse_line("@scripts/a.lua:17: attempt to call a nil value"), Some(17));
        assert_eq!(parse_line("no location here"), None);
    }

    #[test]
    fn traceback_is_stripped() {
        let error = mlua::Error::RuntimeError(String::from(
            "[tether:input] main:1: boom\nstack traceback:\n\t[C]: in ?",
        ));

        let error = ScriptError::from_lua(ScriptErrorKind::Runtime, &error, "main");
        assert_eq!(error.message, "[tether:input] main:1: boom");
        assert_eq!(error.line, Some(1));
        assert_eq!(error.kind, ScriptErrorKind::Runtime);
    }

    #[test]
    fn type_mismatch_is_recognized() {
        let error = mlua::Error::external(TypeMismatch {
            function: "hookfunction",
            position: 1,
            expected: "function",
            got: "number",
        });

        let error = ScriptError::from_lua(ScriptErrorKind::Runtime, &error, "main");
        assert_eq!(error.kind, ScriptErrorKind::Type);
        assert_eq!(
            error.message,
            "bad argument #1 to 'hookfunction' (function expected, got number)"
        );
    }

    #[test]
    fn cancellation_is_recognized() {
        let error = mlua::Error::external(Cancelled);
        let error = ScriptError::from_lua(ScriptErrorKind::Runtime, &error, "main");
        assert_eq!(error.kind, ScriptErrorKind::Cancelled);
    }
}
