use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use mlua::{
    ChunkMode, Function, HookTriggers, Lua, LuaOptions, MultiValue, StdLib, Table, Thread,
    ThreadStatus, Value, VmState,
};
use parking_lot::Mutex;

use crate::{
    Cancelled, ClosureRegistry, EngineConfig, EngineError, EngineObserver, ScriptError,
    ScriptErrorKind, TracingObserver, Workspace,
    closure::{DEBUG_REGISTRY_KEY, SourceTag},
    globals::{self, Host, LuaScheduler, LuaSignalBus},
    scheduler::{self, Coroutines, Resume},
};

const BOOTSTRAP: &str = include_str!("bootstrap.lua");

/// Adapts the scheduler to guest coroutines.
struct LuaCoroutines<'lua> {
    lua: &'lua Lua,
}

impl Coroutines for LuaCoroutines<'_> {
    type Thread = Thread;
    type Function = Function;
    type Value = Value;
    type Error = mlua::Error;

    fn create(&mut self, function: Function) -> mlua::Result<Thread> {
        create_thread(self.lua, function)
    }

    fn is_resumable(&self, thread: &Thread) -> bool {
        thread.status() == ThreadStatus::Resumable
    }

    fn resume(&mut self, thread: &Thread, args: Vec<Value>) -> mlua::Result<Resume> {
        thread.resume::<()>(MultiValue::from_vec(args))?;

        match thread.status() {
            ThreadStatus::Resumable => Ok(Resume::Yielded),
            _ => Ok(Resume::Finished),
        }
    }

    fn elapsed(&mut self, elapsed: Duration) -> Value {
        Value::Number(elapsed.as_secs_f64())
    }
}

/// Stop flag checked by the instruction hook of every guest thread.
struct StopGuard {
    flag: Arc<AtomicBool>,
    interval: u32,
}

impl StopGuard {
    fn triggers(&self) -> HookTriggers {
        HookTriggers::new().every_nth_instruction(self.interval.max(1))
    }

    fn callback(&self) -> impl Fn(&Lua, mlua::Debug) -> mlua::Result<VmState> + Send + 'static {
        let flag = self.flag.clone();
        move |_, _| {
            if flag.load(Ordering::Relaxed) {
                return Err(mlua::Error::external(Cancelled));
            }

            Ok(VmState::Continue)
        }
    }
}

/// Creates a guest thread that honors [`ScriptEngine::request_stop`].
///
/// Threads created from the host do not inherit the hook of the main
/// state, so every host-created thread gets its own.
pub(crate) fn create_thread(lua: &Lua, function: Function) -> mlua::Result<Thread> {
    let thread = lua.create_thread(function)?;

    if let Some(guard) = lua.app_data_ref::<StopGuard>() {
        thread.set_hook(guard.triggers(), guard.callback());
    }

    Ok(thread)
}

/// One live guest VM and everything its natives share.
struct Runtime {
    lua: Lua,
    scheduler: Arc<Mutex<LuaScheduler>>,
    signals: Arc<Mutex<LuaSignalBus>>,
    closures: Arc<ClosureRegistry>,
}

impl Runtime {
    fn new(
        config: &Arc<EngineConfig>,
        observer: &Arc<dyn EngineObserver>,
        stop: &Arc<AtomicBool>,
    ) -> Result<Self, EngineError> {
        let libraries = StdLib::COROUTINE
            | StdLib::TABLE
            | StdLib::STRING
            | StdLib::UTF8
            | StdLib::MATH
            | StdLib::OS
            | StdLib::DEBUG;

        // SAFETY: The `debug` library is moved into the registry below and
        //         removed from the guest globals by the bootstrap.
        let lua = unsafe { Lua::unsafe_new_with(libraries, LuaOptions::new()) };

        let debug: Table = lua.globals().get("debug")?;
        lua.set_named_registry_value(DEBUG_REGISTRY_KEY, debug)?;

        let host = Host {
            config: config.clone(),
            observer: observer.clone(),
            scheduler: Arc::new(Mutex::new(LuaScheduler::new())),
            signals: Arc::new(Mutex::new(LuaSignalBus::new())),
            closures: Arc::new(ClosureRegistry::new(config.primary)),
            workspace: Arc::new(Workspace::open(&config.workspace)?),
        };

        let natives = globals::bootstrap_natives(&lua, &host)?;
        lua.load(BOOTSTRAP)
            .set_name(SourceTag::Sandbox.chunk_name())
            .set_mode(ChunkMode::Text)
            .call::<()>(natives)?;

        globals::install(&lua, &host)?;

        let guard = StopGuard {
            flag: stop.clone(),
            interval: config.instruction_interval,
        };

        lua.set_hook(guard.triggers(), guard.callback());
        lua.set_app_data(guard);

        if let Some(source) = &config.environment_bootstrap {
            let result = lua
                .load(source.as_str())
                .set_name(SourceTag::Environment.chunk_name())
                .set_mode(ChunkMode::Text)
                .exec();

            if let Err(err) = result {
                let error = ScriptError::from_lua(ScriptErrorKind::Runtime, &err, "environment")
                    .with_context("bootstrap");

                tracing::error!(context = "bootstrap", "{}", error.message);
                observer.error(&error);
            }
        }

        Ok(Self {
            lua,
            scheduler: host.scheduler,
            signals: host.signals,
            closures: host.closures,
        })
    }

    fn release(self) {
        self.scheduler.lock().clear();
        self.signals.lock().clear();
        self.closures.clear();
    }
}

/// Host of one sandboxed guest VM.
///
/// Every entry point takes the same lock, so scripts, ticks and lifecycle
/// changes never overlap. Only [`request_stop`] bypasses it.
///
/// [`request_stop`]: Self::request_stop
pub struct ScriptEngine {
    config: Arc<EngineConfig>,
    observer: Arc<dyn EngineObserver>,
    stop: Arc<AtomicBool>,
    runtime: Mutex<Option<Runtime>>,
}

impl ScriptEngine {
    /// Creates an engine. The VM is created by [`init`](Self::init).
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config: Arc::new(config),
            observer: Arc::new(TracingObserver),
            stop: Arc::new(AtomicBool::new(false)),
            runtime: Mutex::new(None),
        }
    }

    /// Sets the observer receiving output and errors.
    pub fn with_observer(self, observer: impl EngineObserver + 'static) -> Self {
        Self {
            observer: Arc::new(observer),
            ..self
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Creates the VM, installs the guest surface and runs the bootstraps.
    ///
    /// Does nothing if the engine is already running.
    pub fn init(&self) -> Result<(), EngineError> {
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            return Ok(());
        }

        *runtime = Some(Runtime::new(&self.config, &self.observer, &self.stop)?);
        tracing::debug!(name = %self.config.name, "engine running");

        Ok(())
    }

    /// Checks whether the VM exists.
    pub fn is_running(&self) -> bool {
        self.runtime.lock().is_some()
    }

    /// Releases all tasks, signals and the VM.
    pub fn shutdown(&self) {
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.release();
            tracing::debug!(name = %self.config.name, "engine stopped");
        }
    }

    /// Shuts the engine down and starts it again.
    pub fn reset(&self) -> Result<(), EngineError> {
        self.shutdown();
        self.init()
    }

    /// Asks the running script to stop.
    ///
    /// The request is noticed at the next instruction check and stays in
    /// effect until the next [`execute`](Self::execute).
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Compiles and runs a script.
    ///
    /// The top-level chunk runs inside a coroutine; if it waits, the rest of
    /// it runs from later ticks. Failures are reported to the observer and
    /// returned.
    pub fn execute(&self, source: &str, name: &str) -> Result<(), EngineError> {
        let runtime = self.runtime.lock();
        let Some(runtime) = runtime.as_ref()
        else {
            return Err(EngineError::NotRunning);
        };

        self.stop.store(false, Ordering::Relaxed);

        let function = runtime
            .lua
            .load(source)
            .set_name(SourceTag::Input.named_chunk(name))
            .set_mode(ChunkMode::Text)
            .into_function();

        let function = match function {
            Ok(function) => function,
            Err(err) => {
                let error = ScriptError::from_lua(ScriptErrorKind::Compile, &err, name);
                return Err(self.report(error).into());
            }
        };

        let thread = create_thread(&runtime.lua, function)?;

        match thread.resume::<()>(()) {
            Ok(()) => {
                tracing::debug!(
                    name,
                    suspended = thread.status() == ThreadStatus::Resumable,
                    "script returned"
                );

                Ok(())
            }
            Err(err) => {
                let error = ScriptError::from_lua(ScriptErrorKind::Runtime, &err, name);
                Err(self.report(error).into())
            }
        }
    }

    /// Runs every task that is due now.
    ///
    /// Returns the number of tasks resumed.
    pub fn tick(&self) -> usize {
        self.tick_at(Instant::now())
    }

    /// Runs every task that is due at `now`.
    pub fn tick_at(&self, now: Instant) -> usize {
        let runtime = self.runtime.lock();
        let Some(runtime) = runtime.as_ref()
        else {
            return 0;
        };

        let mut coroutines = LuaCoroutines { lua: &runtime.lua };
        let report = scheduler::run_ready(&runtime.scheduler, &mut coroutines, now);

        for failure in report.failures {
            let error = ScriptError::from_lua(ScriptErrorKind::Runtime, &failure.error, "task")
                .with_context("task");

            tracing::warn!(context = "task", id = %failure.id, "{}", error.message);
            self.observer.error(&error);
        }

        report.resumed
    }

    /// Returns the number of scheduled tasks.
    pub fn pending_tasks(&self) -> usize {
        self.runtime
            .lock()
            .as_ref()
            .map_or(0, |runtime| runtime.scheduler.lock().len())
    }

    /// Returns the earliest due time of a scheduled task.
    pub fn next_due(&self) -> Option<Instant> {
        self.runtime
            .lock()
            .as_ref()
            .and_then(|runtime| runtime.scheduler.lock().next_due())
    }

    /// Returns the number of functions hooked by scripts.
    pub fn hook_count(&self) -> usize {
        self.runtime
            .lock()
            .as_ref()
            .map_or(0, |runtime| runtime.closures.hook_count())
    }

    fn report(&self, error: ScriptError) -> ScriptError {
        tracing::debug!(kind = %error.kind, source = %error.source_name, "{}", error.message);
        self.observer.error(&error);
        error
    }
}
