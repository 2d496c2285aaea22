//! Natives installed into the guest VM.

use std::{
    io::Write as _,
    process::{Command, Stdio},
    sync::Arc,
    time::{Duration, Instant},
};

use mlua::{
    ChunkMode, Function, Lua, MultiValue, Table, UserData, UserDataFields, UserDataMethods, Value,
    Variadic,
};
use parking_lot::Mutex;

use crate::{
    ClosureRegistry, EngineConfig, EngineObserver, ScriptError, ScriptErrorKind, TypeMismatch,
    Workspace,
    closure::{SourceTag, expect_function},
    engine,
    scheduler::{Scheduler, TaskBody, TaskId, TaskKind},
    signal::{self, ConnectionHandle, SignalBus, SignalId},
};

/// Scheduler holding guest coroutines.
pub(crate) type LuaScheduler = Scheduler<mlua::Thread, Function, Value>;

/// Signal bus holding guest callbacks.
pub(crate) type LuaSignalBus = SignalBus<Function>;

/// Upper bound of a guest delay, in seconds.
const MAX_DELAY: f64 = 365.0 * 24.0 * 60.0 * 60.0;

const CLIPBOARD_COMMANDS: &[&[&str]] = &[
    &["wl-copy"],
    &["xclip", "-selection", "clipboard"],
    &["xsel", "--clipboard", "--input"],
];

/// Everything the natives of one VM share.
#[derive(Clone)]
pub(crate) struct Host {
    pub config: Arc<EngineConfig>,
    pub observer: Arc<dyn EngineObserver>,
    pub scheduler: Arc<Mutex<LuaScheduler>>,
    pub signals: Arc<Mutex<LuaSignalBus>>,
    pub closures: Arc<ClosureRegistry>,
    pub workspace: Arc<Workspace>,
}

struct Connection {
    signals: Arc<Mutex<LuaSignalBus>>,
    handle: ConnectionHandle,
}

impl UserData for Connection {
    fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("Connected", |_, this| {
            Ok(this.signals.lock().is_connected(this.handle))
        });
    }

    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("Disconnect", |_, this, ()| {
            this.signals.lock().disconnect(this.handle);
            Ok(())
        });
    }
}

/// Converts guest seconds into a delay.
fn delay(seconds: f64) -> Duration {
    if seconds.is_nan() || seconds <= 0.0 {
        return Duration::ZERO;
    }

    Duration::from_secs_f64(seconds.min(MAX_DELAY))
}

fn task_body(
    value: Value,
    primitive: &'static str,
    position: usize,
) -> mlua::Result<TaskBody<mlua::Thread, Function>> {
    match value {
        Value::Function(function) => Ok(TaskBody::Function(function)),
        Value::Thread(thread) => Ok(TaskBody::Thread(thread)),
        other => Err(mlua::Error::external(TypeMismatch {
            function: primitive,
            position,
            expected: "function or thread",
            got: other.type_name(),
        })),
    }
}

/// Creates the natives handed to the hardening bootstrap.
pub(crate) fn bootstrap_natives(lua: &Lua, host: &Host) -> mlua::Result<Table> {
    let natives = lua.create_table()?;
    let closures = &host.closures;

    natives.set(
        "task_schedule",
        closures.create_native(lua, {
            let scheduler = host.scheduler.clone();
            move |_, (kind, seconds, body, args): (String, f64, Value, MultiValue)| {
                let (kind, name, position) = match kind.as_str() {
                    "spawn" => (TaskKind::Spawn, "task.spawn", 1),
                    "defer" => (TaskKind::Defer, "task.defer", 1),
                    _ => (TaskKind::Delay, "task.delay", 2),
                };

                let body = task_body(body, name, position)?;
                let id = scheduler.lock().schedule(
                    kind,
                    body,
                    args.into_vec(),
                    Instant::now(),
                    delay(seconds),
                );

                Ok(id.0)
            }
        })?,
    )?;

    natives.set(
        "task_wait",
        closures.create_native(lua, {
            let scheduler = host.scheduler.clone();
            move |_, (thread, seconds): (mlua::Thread, f64)| {
                scheduler.lock().delay(
                    TaskBody::Thread(thread),
                    Vec::new(),
                    Instant::now(),
                    delay(seconds),
                );
                Ok(())
            }
        })?,
    )?;

    natives.set(
        "task_cancel",
        closures.create_native(lua, {
            let scheduler = host.scheduler.clone();
            move |_, id: u64| Ok(scheduler.lock().cancel(TaskId(id)))
        })?,
    )?;

    // Shared by `task.wait` outside coroutines and the `sleep` global.
    let sleep = closures.create_native(lua, |_, seconds: Option<f64>| {
        std::thread::sleep(delay(seconds.unwrap_or(0.0)));
        Ok(())
    })?;
    natives.set("sleep", sleep.clone())?;
    lua.globals().set("sleep", sleep)?;

    natives.set(
        "signal_create",
        closures.create_native(lua, {
            let signals = host.signals.clone();
            move |_, name: String| Ok(signals.lock().create(name).0)
        })?,
    )?;

    natives.set(
        "signal_connect",
        closures.create_native(lua, {
            let signals = host.signals.clone();
            move |_, (id, callback): (u64, Value)| {
                let callback = expect_function(callback, "Signal:Connect", 1)?;
                let handle = signals
                    .lock()
                    .connect(SignalId(id), callback)
                    .ok_or_else(|| mlua::Error::runtime("signal was destroyed"))?;

                Ok(Connection {
                    signals: signals.clone(),
                    handle,
                })
            }
        })?,
    )?;

    natives.set(
        "signal_fire",
        closures.create_native(lua, {
            let signals = host.signals.clone();
            let observer = host.observer.clone();
            move |lua, (id, args): (u64, MultiValue)| {
                let id = SignalId(id);
                let name = signals
                    .lock()
                    .name(id)
                    .map(String::from)
                    .unwrap_or_default();

                let invoked = signal::fire(&signals, id, |callback| {
                    let result = engine::create_thread(lua, callback)
                        .and_then(|thread| thread.resume::<()>(args.clone()));

                    if let Err(err) = result {
                        let error = ScriptError::from_lua(ScriptErrorKind::Runtime, &err, &name)
                            .with_context("signal");

                        tracing::warn!(context = "signal", signal = %name, "{}", error.message);
                        observer.error(&error);
                    }
                });

                Ok(invoked)
            }
        })?,
    )?;

    natives.set(
        "signal_destroy",
        closures.create_native(lua, {
            let signals = host.signals.clone();
            move |_, id: u64| Ok(signals.lock().destroy(SignalId(id)))
        })?,
    )?;

    Ok(natives)
}

/// Installs the guest surface into the globals table.
pub(crate) fn install(lua: &Lua, host: &Host) -> mlua::Result<()> {
    let globals = lua.globals();
    let closures = &host.closures;

    //
    // Output
    //

    globals.set(
        "print",
        closures.create_native(lua, {
            let observer = host.observer.clone();
            move |_, values: Variadic<Value>| {
                let text = values
                    .iter()
                    .map(Value::to_string)
                    .collect::<mlua::Result<Vec<_>>>()?
                    .join("\t");

                observer.output(&text);
                Ok(())
            }
        })?,
    )?;

    globals.set(
        "warn",
        closures.create_native(lua, {
            let observer = host.observer.clone();
            move |_, values: Variadic<Value>| {
                let text = values
                    .iter()
                    .map(Value::to_string)
                    .collect::<mlua::Result<String>>()?;

                observer.output(&format!("warning: {text}"));
                Ok(())
            }
        })?,
    )?;

    //
    // Closures
    //

    let hookfunction = closures.create_native(lua, {
        let closures = closures.clone();
        move |lua, (original, replacement): (Value, Value)| {
            let original = expect_function(original, "hookfunction", 1)?;
            let replacement = expect_function(replacement, "hookfunction", 2)?;
            closures.hook(lua, &original, &replacement)
        }
    })?;
    globals.set("hookfunction", hookfunction.clone())?;
    globals.set("replaceclosure", hookfunction)?;

    globals.set(
        "newcclosure",
        closures.create_native(lua, {
            let closures = closures.clone();
            move |lua, function: Value| {
                let function = expect_function(function, "newcclosure", 1)?;
                closures.wrap(lua, function)
            }
        })?,
    )?;

    globals.set(
        "clonefunction",
        closures.create_native(lua, {
            let closures = closures.clone();
            move |lua, function: Value| {
                let function = expect_function(function, "clonefunction", 1)?;
                closures.clone_function(lua, &function)
            }
        })?,
    )?;

    let isourclosure = closures.create_native(lua, {
        let closures = closures.clone();
        move |_, function: Value| {
            let function = expect_function(function, "isourclosure", 1)?;
            Ok(closures.is_ours(&function))
        }
    })?;
    globals.set("isourclosure", isourclosure.clone())?;
    globals.set("isexecutorclosure", isourclosure)?;

    globals.set(
        "checkcaller",
        closures.create_native(lua, {
            let closures = closures.clone();
            move |lua, ()| Ok(closures.caller_is_host(lua))
        })?,
    )?;

    globals.set(
        "loadstring",
        closures.create_native(lua, |lua, (source, name): (mlua::String, Option<String>)| {
            let name = name.unwrap_or_else(|| String::from("loadstring"));
            let chunk = lua
                .load(source.as_bytes().to_vec())
                .set_name(SourceTag::Load.named_chunk(&name))
                .set_mode(ChunkMode::Text)
                .into_function();

            match chunk {
                Ok(function) => Ok((Value::Function(function), None)),
                Err(err) => Ok((Value::Nil, Some(err.to_string()))),
            }
        })?,
    )?;

    //
    // Workspace
    //

    let workspace = &host.workspace;

    globals.set(
        "readfile",
        closures.create_native(lua, {
            let workspace = workspace.clone();
            move |lua, path: String| {
                let content = workspace.read(&path).map_err(mlua::Error::external)?;
                lua.create_string(content)
            }
        })?,
    )?;

    globals.set(
        "writefile",
        closures.create_native(lua, {
            let workspace = workspace.clone();
            move |_, (path, content): (String, mlua::String)| {
                workspace
                    .write(&path, &content.as_bytes())
                    .map_err(mlua::Error::external)
            }
        })?,
    )?;

    globals.set(
        "appendfile",
        closures.create_native(lua, {
            let workspace = workspace.clone();
            move |_, (path, content): (String, mlua::String)| {
                workspace
                    .append(&path, &content.as_bytes())
                    .map_err(mlua::Error::external)
            }
        })?,
    )?;

    globals.set(
        "isfile",
        closures.create_native(lua, {
            let workspace = workspace.clone();
            move |_, path: String| Ok(workspace.is_file(&path))
        })?,
    )?;

    globals.set(
        "isfolder",
        closures.create_native(lua, {
            let workspace = workspace.clone();
            move |_, path: String| Ok(workspace.is_folder(&path))
        })?,
    )?;

    globals.set(
        "makefolder",
        closures.create_native(lua, {
            let workspace = workspace.clone();
            move |_, path: String| workspace.make_folder(&path).map_err(mlua::Error::external)
        })?,
    )?;

    globals.set(
        "listfiles",
        closures.create_native(lua, {
            let workspace = workspace.clone();
            move |_, path: Option<String>| {
                workspace
                    .list(path.as_deref().unwrap_or(""))
                    .map_err(mlua::Error::external)
            }
        })?,
    )?;

    globals.set(
        "delfile",
        closures.create_native(lua, {
            let workspace = workspace.clone();
            move |_, path: String| workspace.delete_file(&path).map_err(mlua::Error::external)
        })?,
    )?;

    globals.set(
        "delfolder",
        closures.create_native(lua, {
            let workspace = workspace.clone();
            move |_, path: String| workspace.delete_folder(&path).map_err(mlua::Error::external)
        })?,
    )?;

    let loadfile = closures.create_native(lua, {
        let workspace = workspace.clone();
        move |lua, path: String| match compile_file(lua, &workspace, &path) {
            Ok(function) => Ok((Value::Function(function), None)),
            Err(err) => Ok((Value::Nil, Some(err.to_string()))),
        }
    })?;
    globals.set("loadfile", loadfile)?;

    globals.set(
        "dofile",
        closures.create_native(lua, {
            let workspace = workspace.clone();
            move |lua, path: String| {
                let function = compile_file(lua, &workspace, &path)?;
                function.call::<MultiValue>(())
            }
        })?,
    )?;

    //
    // Environment
    //

    globals.set(
        "setclipboard",
        closures.create_native(lua, |_, text: mlua::String| {
            Ok(set_clipboard(&text.as_bytes()))
        })?,
    )?;

    globals.set(
        "identifyexecutor",
        closures.create_native(lua, {
            let config = host.config.clone();
            move |_, ()| Ok((config.name.clone(), config.version.clone()))
        })?,
    )?;

    globals.set(
        "getgenv",
        closures.create_native(lua, |lua, ()| Ok(lua.globals()))?,
    )?;

    Ok(())
}

/// Compiles a workspace file under its `@`-prefixed relative path.
fn compile_file(lua: &Lua, workspace: &Workspace, path: &str) -> mlua::Result<Function> {
    let content = workspace.read(path).map_err(mlua::Error::external)?;
    let resolved = workspace.resolve(path).map_err(mlua::Error::external)?;

    lua.load(content)
        .set_name(format!("@{}", workspace.relative(&resolved)))
        .set_mode(ChunkMode::Text)
        .into_function()
}

/// Pipes text into the first clipboard tool that accepts it.
fn set_clipboard(text: &[u8]) -> bool {
    for command in CLIPBOARD_COMMANDS {
        let Some((program, args)) = command.split_first()
        else {
            continue;
        };

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        let Ok(mut child) = child
        else {
            continue;
        };

        let written = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(text).is_ok(),
            None => false,
        };

        match child.wait() {
            Ok(status) if written && status.success() => return true,
            Ok(status) => tracing::debug!(program, %status, "clipboard tool failed"),
            Err(err) => tracing::debug!(program, %err, "clipboard tool failed"),
        }
    }

    tracing::warn!("no clipboard tool available");
    false
}
