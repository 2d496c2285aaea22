//! Composition root.
//!
//! The orchestrator owns the injector, the local script engine and the
//! inline hook manager. A worker thread drains submitted scripts and ticks
//! the engine while idle. Scripts go to the payload over the delivery socket
//! when the guest VM was located and the socket exists, and to the local
//! engine otherwise.

#[cfg(all(test, feature = "arch-amd64"))]
mod orchestrator_tests;

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tether_core::{Architecture, MemoryDriver, TetherError};
use tether_os_linux::{LocatorConfig, ProcessSource};
use tether_script::{
    BridgeError, EngineConfig, EngineError, ScriptEngine,
    bridge::{DEFAULT_SOCKET_PATH, deliver},
};
use tether_utils::{
    injector::{InjectionMode, Injector, InjectorConfig},
    interceptor::Interceptor,
};

/// Configuration of an [`Orchestrator`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// How the target is found.
    pub locator: LocatorConfig,

    /// How the target is attached to.
    pub injector: InjectorConfig,

    /// Configuration of the local engine.
    pub engine: EngineConfig,

    /// Socket path of the payload's delivery channel.
    pub socket_path: PathBuf,

    /// How long the worker waits for a script before ticking the engine.
    pub idle_tick: Duration,

    /// Whether to start the injector's background scan.
    pub background_scan: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            locator: LocatorConfig::default(),
            injector: InjectorConfig::default(),
            engine: EngineConfig::default(),
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            idle_tick: Duration::from_millis(16),
            background_scan: true,
        }
    }
}

/// An error of the orchestrator.
#[derive(thiserror::Error, Debug)]
pub enum OrchestratorError {
    /// The local engine failed.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The injector could not be created.
    #[error(transparent)]
    Tether(#[from] TetherError),

    /// The delivery channel failed.
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// The worker thread could not be spawned.
    #[error("Failed to spawn the worker: {0}")]
    Spawn(std::io::Error),
}

/// Where a script was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// Delivered to the payload inside the target.
    Remote,

    /// Executed by the local engine.
    Local,
}

struct Job {
    source: String,
    name: String,
}

struct Queue {
    jobs: Mutex<VecDeque<Job>>,
    ready: Condvar,
    running: AtomicBool,
}

struct Dispatcher<Source, Driver>
where
    Source: ProcessSource + Send + 'static,
    Driver: MemoryDriver + Send + 'static,
{
    injector: Injector<Source, Driver>,
    engine: ScriptEngine,
    socket_path: PathBuf,
}

impl<Source, Driver> Dispatcher<Source, Driver>
where
    Source: ProcessSource + Send + 'static,
    Driver: MemoryDriver + Send + 'static,
{
    fn route(&self) -> Route {
        if self.injector.mode() == InjectionMode::Full && self.socket_path.exists() {
            Route::Remote
        }
        else {
            Route::Local
        }
    }

    fn dispatch(&self, source: &str, name: &str) -> Result<Route, OrchestratorError> {
        if self.route() == Route::Remote && self.injector.begin_execution() {
            let result = deliver(&self.socket_path, source);
            self.injector.end_execution();

            match result {
                Ok(()) => {
                    tracing::debug!(name, "script delivered");
                    return Ok(Route::Remote);
                }
                Err(err) => tracing::warn!(name, %err, "delivery failed, running locally"),
            }
        }

        self.engine.execute(source, name)?;
        Ok(Route::Local)
    }
}

/// Wires an injector, a local script engine and an inline hook manager.
pub struct Orchestrator<Source, Driver, Arch>
where
    Source: ProcessSource + Send + 'static,
    Driver: MemoryDriver + Send + 'static,
    Arch: Architecture,
{
    dispatcher: Arc<Dispatcher<Source, Driver>>,
    interceptor: Mutex<Interceptor<Arch>>,
    queue: Arc<Queue>,
    worker: Option<JoinHandle<()>>,
}

impl<Source, Driver, Arch> Orchestrator<Source, Driver, Arch>
where
    Source: ProcessSource + Send + 'static,
    Driver: MemoryDriver + Send + 'static,
    Arch: Architecture,
{
    /// Starts the engine, the worker thread and, if configured, the
    /// background scan.
    pub fn new(
        injector: Injector<Source, Driver>,
        engine: ScriptEngine,
        config: &OrchestratorConfig,
    ) -> Result<Self, OrchestratorError> {
        engine.init()?;

        if config.background_scan {
            injector.start_background_scan();
        }

        let dispatcher = Arc::new(Dispatcher {
            injector,
            engine,
            socket_path: config.socket_path.clone(),
        });

        let queue = Arc::new(Queue {
            jobs: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            running: AtomicBool::new(true),
        });

        let worker = std::thread::Builder::new()
            .name(String::from("tether-worker"))
            .spawn({
                let dispatcher = dispatcher.clone();
                let queue = queue.clone();
                let idle_tick = config.idle_tick;
                move || worker_loop(&dispatcher, &queue, idle_tick)
            })
            .map_err(OrchestratorError::Spawn)?;

        Ok(Self {
            dispatcher,
            interceptor: Mutex::new(Interceptor::new()),
            queue,
            worker: Some(worker),
        })
    }

    /// Queues a script for the worker.
    pub fn submit(&self, source: impl Into<String>, name: impl Into<String>) {
        self.queue.jobs.lock().push_back(Job {
            source: source.into(),
            name: name.into(),
        });

        self.queue.ready.notify_one();
    }

    /// Runs a script right away on the calling thread.
    pub fn execute(&self, source: &str, name: &str) -> Result<Route, OrchestratorError> {
        self.dispatcher.dispatch(source, name)
    }

    /// Returns where a script would be sent now.
    pub fn route(&self) -> Route {
        self.dispatcher.route()
    }

    /// Returns the injector.
    pub fn injector(&self) -> &Injector<Source, Driver> {
        &self.dispatcher.injector
    }

    /// Returns the local engine.
    pub fn engine(&self) -> &ScriptEngine {
        &self.dispatcher.engine
    }

    /// Returns the inline hook manager of this process.
    pub fn interceptor(&self) -> &Mutex<Interceptor<Arch>> {
        &self.interceptor
    }

    /// Returns the payload socket path.
    pub fn socket_path(&self) -> &Path {
        &self.dispatcher.socket_path
    }

    /// Stops the worker and the background scan, and shuts the engine
    /// down. A running script is asked to stop; queued scripts that did not
    /// run are dropped.
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take()
        else {
            return;
        };

        self.queue.running.store(false, Ordering::SeqCst);
        self.queue.ready.notify_all();

        // A script started after the first request clears the stop flag.
        while !worker.is_finished() {
            self.dispatcher.engine.request_stop();
            std::thread::sleep(Duration::from_millis(5));
        }

        if worker.join().is_err() {
            tracing::error!("worker thread panicked");
        }

        let dropped = std::mem::take(&mut *self.queue.jobs.lock()).len();
        if dropped > 0 {
            tracing::warn!(dropped, "queued scripts dropped");
        }

        self.dispatcher.injector.stop_background_scan();
        self.dispatcher.engine.shutdown();
    }
}

impl<Source, Driver, Arch> Drop for Orchestrator<Source, Driver, Arch>
where
    Source: ProcessSource + Send + 'static,
    Driver: MemoryDriver + Send + 'static,
    Arch: Architecture,
{
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<Source, Driver>(
    dispatcher: &Dispatcher<Source, Driver>,
    queue: &Queue,
    idle_tick: Duration,
) where
    Source: ProcessSource + Send + 'static,
    Driver: MemoryDriver + Send + 'static,
{
    loop {
        let job = {
            let mut jobs = queue.jobs.lock();

            if jobs.is_empty() && queue.running.load(Ordering::SeqCst) {
                queue.ready.wait_for(&mut jobs, idle_tick);
            }

            if !queue.running.load(Ordering::SeqCst) {
                return;
            }

            jobs.pop_front()
        };

        if let Some(job) = job {
            // The engine reports script errors to its observer.
            if let Err(err) = dispatcher.dispatch(&job.source, &job.name) {
                tracing::debug!(name = %job.name, %err, "script failed");
            }
        }

        dispatcher.engine.tick();
    }
}

#[cfg(all(
    feature = "driver-procfs",
    any(
        all(feature = "arch-amd64", target_arch = "x86_64"),
        all(feature = "arch-aarch64", target_arch = "aarch64")
    )
))]
mod linux {
    use tether_driver_procfs::ProcfsDriver;
    use tether_os_linux::{ProcessLocator, ProcfsSource};
    use tether_script::ScriptEngine;
    use tether_utils::injector::Injector;

    use super::{Orchestrator, OrchestratorConfig, OrchestratorError};
    use crate::HostArch;

    /// Orchestrator over `/proc` and the architecture of this process.
    pub type LinuxOrchestrator = Orchestrator<ProcfsSource, ProcfsDriver, HostArch>;

    impl LinuxOrchestrator {
        /// Creates an orchestrator for the live system.
        pub fn linux(config: OrchestratorConfig) -> Result<Self, OrchestratorError> {
            let locator = ProcessLocator::new(ProcfsSource::new(), config.locator.clone());
            let injector = Injector::new(locator, ProcfsDriver::attach, config.injector.clone())?;
            let engine = ScriptEngine::new(config.engine.clone());

            Self::new(injector, engine, &config)
        }
    }
}

#[cfg(all(
    feature = "driver-procfs",
    any(
        all(feature = "arch-amd64", target_arch = "x86_64"),
        all(feature = "arch-aarch64", target_arch = "aarch64")
    )
))]
pub use self::linux::LinuxOrchestrator;
