//! Injection state machine.
//!
//! The [`Injector`] owns the whole lifecycle of a target: discovery through a
//! [`ProcessLocator`], opening its memory, locating the guest VM inside it
//! and noticing when the handle goes away.
//!
//! ```text
//! Idle ──scan──▶ Scanning ──found──▶ Found ──attach──▶ Attaching ──ok──▶ Injected ◀──▶ Executing
//!  ▲                │                                      │                 │
//!  └───not found────┘                                   fail ▼              detach ▼
//!                                                        Failed           Detached
//! ```
//!
//! `Failed` and `Detached` go back to `Scanning` on the next scan. Losing the
//! handle resets to `Idle` from any state.
//!
//! Errors never cross the public boundary: operations return `bool`, and
//! every transition is reported to the status callback with a message.

mod state;

#[cfg(test)]
mod injector_tests;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tether_core::{BytePattern, MemoryDriver, ProcessId, ProcessMemory, TetherError};
use tether_os_linux::{ProcessDescriptor, ProcessLocator, ProcessSource};

pub use self::state::{FailureReason, InjectionMode, InjectionState, VmLocateResult};

/// Receives every state transition together with a human readable message.
pub type StatusCallback = Arc<dyn Fn(InjectionState, &str) + Send + Sync>;

/// Opens a memory driver for a process.
pub type DriverOpener<Driver> = Box<dyn Fn(ProcessId) -> Result<Driver, TetherError> + Send>;

/// Configuration of an [`Injector`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectorConfig {
    /// Interval of the background scan.
    pub scan_interval: Duration,

    /// Signature of the guest VM, in IDA notation.
    pub vm_signature: String,

    /// Code regions larger than this are not scanned for the guest VM.
    pub max_region_size: u64,

    /// Whether the background scan attaches as soon as the target is found.
    pub auto_attach: bool,
}

impl Default for InjectorConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(2),
            vm_signature: String::from("1B 4C 75"),
            max_region_size: 512 * 1024 * 1024,
            auto_attach: true,
        }
    }
}

struct Inner<Source, Driver>
where
    Source: ProcessSource,
    Driver: MemoryDriver,
{
    locator: ProcessLocator<Source>,
    opener: DriverOpener<Driver>,
    memory: ProcessMemory<Driver>,
    signature: BytePattern,
    config: InjectorConfig,

    state: InjectionState,
    mode: InjectionMode,
    target: Option<ProcessDescriptor>,
    vm: Option<VmLocateResult>,
    last_failure: Option<FailureReason>,

    events: Vec<(InjectionState, String)>,
}

impl<Source, Driver> Inner<Source, Driver>
where
    Source: ProcessSource,
    Driver: MemoryDriver,
{
    fn transition(&mut self, state: InjectionState, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(from = %self.state, to = %state, %message, "state transition");

        self.state = state;
        self.events.push((state, message));
    }

    fn fail(&mut self, reason: FailureReason, message: String) {
        tracing::warn!(?reason, %message, "attach failed");

        self.last_failure = Some(reason);
        self.transition(InjectionState::Failed, message);
    }

    fn scan(&mut self) -> bool {
        if !self.state.can_scan() {
            tracing::debug!(state = %self.state, "scan ignored");
            return false;
        }

        self.transition(InjectionState::Scanning, "scanning for target");

        let message = match self.locator.locate() {
            Ok(Some(located)) => {
                let message = format!(
                    "found {} (pid {}, {:?})",
                    located.process.name, located.process.pid, located.method
                );

                self.target = Some(located.process);
                self.last_failure = None;
                self.transition(InjectionState::Found, message);
                return true;
            }
            Ok(None) => String::from("target not found"),
            Err(err) => {
                tracing::warn!(%err, "process enumeration failed");
                format!("target not found: {err}")
            }
        };

        self.target = None;
        self.last_failure = Some(FailureReason::NotFound);
        self.transition(InjectionState::Idle, message);
        false
    }

    fn attach(&mut self) -> bool {
        if self.state.is_attached() {
            return true;
        }

        if self.state != InjectionState::Found && !self.scan() {
            return false;
        }

        let Some(pid) = self.target.as_ref().map(|target| target.pid)
        else {
            return false;
        };

        self.transition(InjectionState::Attaching, format!("attaching to pid {pid}"));

        let driver = match (self.opener)(pid) {
            Ok(driver) => driver,
            Err(err) => {
                self.fail(
                    FailureReason::FoundButInaccessible,
                    format!("cannot open process {pid}: {err}"),
                );
                return false;
            }
        };

        self.memory.attach(driver);

        if let Err(err) = self.memory.regions(true) {
            self.memory.detach();
            self.fail(
                FailureReason::FoundButInaccessible,
                format!("cannot enumerate regions of process {pid}: {err}"),
            );
            return false;
        }

        let message = match self.locate_vm() {
            Some(vm) => {
                let message = format!("attached to pid {pid}, guest VM at {}", vm.address);
                self.mode = InjectionMode::Full;
                self.vm = Some(vm);
                self.last_failure = None;
                message
            }
            None => {
                self.mode = InjectionMode::LocalOnly;
                self.vm = None;
                self.last_failure = Some(FailureReason::VmNotLocated);
                format!("attached to pid {pid}, guest VM not located, local execution only")
            }
        };

        self.transition(InjectionState::Injected, message);
        true
    }

    /// Scans readable and executable regions for the guest VM signature and
    /// takes the first hit.
    fn locate_vm(&self) -> Option<VmLocateResult> {
        let regions = self.memory.regions(false).ok()?;

        let mut regions_scanned = 0;
        let mut bytes_scanned = 0;

        for region in regions.iter().filter(|region| region.is_code()) {
            if region.len() > self.config.max_region_size {
                tracing::trace!(start = %region.start, len = region.len(), "region too large");
                continue;
            }

            regions_scanned += 1;
            bytes_scanned += region.len();

            match self
                .memory
                .pattern_scan(&self.signature, region.start, region.len())
            {
                Ok(Some(address)) => {
                    tracing::debug!(
                        %address,
                        region = %region.start,
                        path = ?region.path,
                        regions_scanned,
                        bytes_scanned,
                        "guest VM signature found"
                    );

                    return Some(VmLocateResult {
                        address,
                        region_start: region.start,
                        region_path: region.path.clone(),
                        regions_scanned,
                        bytes_scanned,
                        validated: false,
                    });
                }
                Ok(None) => {}
                Err(err) => tracing::debug!(start = %region.start, %err, "region scan failed"),
            }
        }

        tracing::debug!(regions_scanned, bytes_scanned, "guest VM signature not found");
        None
    }

    fn detach(&mut self) -> bool {
        if !self.state.is_attached() {
            return false;
        }

        self.memory.detach();
        self.vm = None;
        self.mode = InjectionMode::LocalOnly;
        self.transition(InjectionState::Detached, "detached");
        true
    }

    fn handle_lost(&mut self) {
        self.memory.invalidate();
        self.vm = None;
        self.mode = InjectionMode::LocalOnly;
        self.target = None;

        if self.state != InjectionState::Idle {
            self.transition(InjectionState::Idle, "process handle lost");
        }
    }

    fn check_handle(&mut self) -> bool {
        if !self.state.is_attached() {
            return false;
        }

        match self.memory.regions(true) {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(%err, "process handle no longer usable");
                self.handle_lost();
                false
            }
        }
    }

    fn set_executing(&mut self, executing: bool) -> bool {
        match (self.state, executing) {
            (InjectionState::Injected, true) => {
                self.transition(InjectionState::Executing, "executing");
                true
            }
            (InjectionState::Executing, false) => {
                self.transition(InjectionState::Injected, "execution finished");
                true
            }
            _ => false,
        }
    }
}

struct Shared<Source, Driver>
where
    Source: ProcessSource,
    Driver: MemoryDriver,
{
    inner: Mutex<Inner<Source, Driver>>,
    callback: Mutex<Option<StatusCallback>>,
    stop: AtomicBool,
}

impl<Source, Driver> Shared<Source, Driver>
where
    Source: ProcessSource,
    Driver: MemoryDriver,
{
    /// Runs `f` under the state lock, then reports the transitions it made.
    ///
    /// The callback runs after the lock is released, so it may query the
    /// injector.
    fn run<R>(&self, f: impl FnOnce(&mut Inner<Source, Driver>) -> R) -> R {
        let (result, events) = {
            let mut inner = self.inner.lock();
            let result = f(&mut inner);
            (result, std::mem::take(&mut inner.events))
        };

        if events.is_empty() {
            return result;
        }

        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            for (state, message) in &events {
                callback(*state, message);
            }
        }

        result
    }

    fn background_loop(&self) {
        let interval = self.inner.lock().config.scan_interval;
        tracing::debug!(?interval, "background scan started");

        while !self.stop.load(Ordering::Acquire) {
            self.run(|inner| {
                if inner.state.is_attached() {
                    inner.check_handle();
                }
                else if inner.config.auto_attach {
                    inner.attach();
                }
                else if inner.state != InjectionState::Found {
                    inner.scan();
                }
            });

            if self.stop.load(Ordering::Acquire) {
                break;
            }

            std::thread::park_timeout(interval);
        }

        tracing::debug!("background scan stopped");
    }
}

/// Drives discovery, attachment and guest VM location of one target.
pub struct Injector<Source, Driver>
where
    Source: ProcessSource + Send + 'static,
    Driver: MemoryDriver + Send + 'static,
{
    shared: Arc<Shared<Source, Driver>>,
    scanner: Mutex<Option<JoinHandle<()>>>,
}

impl<Source, Driver> Injector<Source, Driver>
where
    Source: ProcessSource + Send + 'static,
    Driver: MemoryDriver + Send + 'static,
{
    /// Creates a new injector.
    ///
    /// `opener` is called with the pid of the located target to open its
    /// memory. Fails only if the VM signature in `config` is malformed.
    pub fn new(
        locator: ProcessLocator<Source>,
        opener: impl Fn(ProcessId) -> Result<Driver, TetherError> + Send + 'static,
        config: InjectorConfig,
    ) -> Result<Self, TetherError> {
        let signature = BytePattern::from_ida(&config.vm_signature)?;

        Ok(Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    locator,
                    opener: Box::new(opener),
                    memory: ProcessMemory::new(),
                    signature,
                    config,
                    state: InjectionState::Idle,
                    mode: InjectionMode::LocalOnly,
                    target: None,
                    vm: None,
                    last_failure: None,
                    events: Vec::new(),
                }),
                callback: Mutex::new(None),
                stop: AtomicBool::new(false),
            }),
            scanner: Mutex::new(None),
        })
    }

    /// Sets the status callback.
    pub fn with_status_callback(
        self,
        callback: impl Fn(InjectionState, &str) + Send + Sync + 'static,
    ) -> Self {
        *self.shared.callback.lock() = Some(Arc::new(callback));
        self
    }

    /// Returns the current state.
    pub fn state(&self) -> InjectionState {
        self.shared.inner.lock().state
    }

    /// Returns the current mode.
    pub fn mode(&self) -> InjectionMode {
        self.shared.inner.lock().mode
    }

    /// Returns the located target.
    pub fn target(&self) -> Option<ProcessDescriptor> {
        self.shared.inner.lock().target.clone()
    }

    /// Returns where the guest VM was found, if attached in full mode.
    pub fn vm(&self) -> Option<VmLocateResult> {
        self.shared.inner.lock().vm.clone()
    }

    /// Returns the reason of the last failure.
    pub fn last_failure(&self) -> Option<FailureReason> {
        self.shared.inner.lock().last_failure
    }

    /// Looks for the target once.
    ///
    /// Returns `true` if the target was found.
    pub fn scan(&self) -> bool {
        self.shared.run(Inner::scan)
    }

    /// Attaches to the target, scanning first if it was not found yet.
    ///
    /// Returns `true` if attached. A missing guest VM does not make the
    /// attach fail; it only keeps the injector in
    /// [`InjectionMode::LocalOnly`].
    pub fn attach(&self) -> bool {
        self.shared.run(Inner::attach)
    }

    /// Closes the memory handle.
    ///
    /// Returns `false` if nothing was attached.
    pub fn detach(&self) -> bool {
        self.shared.run(Inner::detach)
    }

    /// Checks that the memory handle is still usable.
    ///
    /// A dead handle resets the injector to [`InjectionState::Idle`].
    pub fn check_handle(&self) -> bool {
        self.shared.run(Inner::check_handle)
    }

    /// Marks the start of a script delivery.
    pub fn begin_execution(&self) -> bool {
        self.shared.run(|inner| inner.set_executing(true))
    }

    /// Marks the end of a script delivery.
    pub fn end_execution(&self) -> bool {
        self.shared.run(|inner| inner.set_executing(false))
    }

    /// Runs `f` with the process memory of the target.
    pub fn with_memory<R>(&self, f: impl FnOnce(&ProcessMemory<Driver>) -> R) -> R {
        f(&self.shared.inner.lock().memory)
    }

    /// Starts the background scan thread.
    ///
    /// Returns `false` if it is already running.
    pub fn start_background_scan(&self) -> bool {
        let mut scanner = self.scanner.lock();
        if scanner.is_some() {
            return false;
        }

        self.shared.stop.store(false, Ordering::Release);
        let shared = Arc::clone(&self.shared);

        match std::thread::Builder::new()
            .name(String::from("tether-scan"))
            .spawn(move || shared.background_loop())
        {
            Ok(handle) => {
                *scanner = Some(handle);
                true
            }
            Err(err) => {
                tracing::error!(%err, "cannot spawn background scan");
                false
            }
        }
    }

    /// Stops the background scan thread and waits for it to finish.
    pub fn stop_background_scan(&self) {
        let Some(handle) = self.scanner.lock().take()
        else {
            return;
        };

        self.shared.stop.store(true, Ordering::Release);
        handle.thread().unpark();

        if handle.join().is_err() {
            tracing::error!("background scan panicked");
        }
    }

    /// Checks whether the background scan thread is running.
    pub fn is_background_scanning(&self) -> bool {
        self.scanner.lock().is_some()
    }
}

impl<Source, Driver> Drop for Injector<Source, Driver>
where
    Source: ProcessSource + Send + 'static,
    Driver: MemoryDriver + Send + 'static,
{
    fn drop(&mut self) {
        self.stop_background_scan();
    }
}
