use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tether_arch_amd64::Amd64;
use tether_core::{MemoryAccess, MemoryDriver, MemoryRegion, ProcessId, TetherError, Va};
use tether_os_linux::{
    HostingFlags, LinuxError, LocatorConfig, ProcessDescriptor, ProcessLocator, ProcessSource,
};
use tether_script::{
    ChannelConfig, DeliveryChannel, EngineConfig, EngineObserver, ScriptEngine, ScriptError,
};
use tether_utils::injector::{InjectionMode, InjectionState, Injector, InjectorConfig};

use super::{Orchestrator, OrchestratorConfig, Route};

///////////////////////////////////////////////////////////////////////////////
// Mocks
///////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Default)]
struct MockSource {
    processes: Arc<Mutex<Vec<ProcessDescriptor>>>,
}

impl MockSource {
    fn spawn(&self, pid: u32, name: &str) {
        self.processes.lock().push(ProcessDescriptor {
            pid: ProcessId(pid),
            name: name.into(),
            cmdline: vec![name.into()],
            exe: None,
            parent: Some(ProcessId(1)),
            hosting: HostingFlags::empty(),
        });
    }
}

impl ProcessSource for MockSource {
    fn processes(&self) -> Result<Vec<ProcessDescriptor>, LinuxError> {
        Ok(self.processes.lock().clone())
    }

    fn regions(&self, _pid: ProcessId) -> Result<Vec<MemoryRegion>, LinuxError> {
        Ok(Vec::new())
    }
}

const CODE_BASE: u64 = 0x40000;

struct MockDriver {
    pid: ProcessId,
    code: Vec<u8>,
}

impl MemoryDriver for MockDriver {
    fn process_id(&self) -> ProcessId {
        self.pid
    }

    fn is_writable(&self) -> bool {
        false
    }

    fn read(&self, address: Va, buffer: &mut [u8]) -> Result<(), TetherError> {
        let end = CODE_BASE + self.code.len() as u64;
        if address.0 < CODE_BASE || address.0 + buffer.len() as u64 > end {
            return Err(TetherError::transfer(address, buffer.len(), 0));
        }

        let offset = (address.0 - CODE_BASE) as usize;
        buffer.copy_from_slice(&self.code[offset..offset + buffer.len()]);
        Ok(())
    }

    fn write(&self, _address: Va, _content: &[u8]) -> Result<(), TetherError> {
        Err(TetherError::NotSupported)
    }

    fn regions(&self) -> Result<Vec<MemoryRegion>, TetherError> {
        Ok(vec![MemoryRegion {
            start: Va(CODE_BASE),
            end: Va(CODE_BASE + self.code.len() as u64),
            protection: MemoryAccess::RX,
            shared: false,
            offset: 0,
            path: Some(String::from("/opt/game/game.bin")),
        }])
    }
}

#[derive(Clone, Default)]
struct Recorder {
    output: Arc<Mutex<Vec<String>>>,
}

impl EngineObserver for Recorder {
    fn output(&self, text: &str) {
        self.output.lock().push(text.into());
    }

    fn error(&self, error: &ScriptError) {
        self.output.lock().push(format!("error: {}", error.message));
    }
}

///////////////////////////////////////////////////////////////////////////////
// Test Helpers
///////////////////////////////////////////////////////////////////////////////

type TestOrchestrator = Orchestrator<MockSource, MockDriver, Amd64>;

fn scratch(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "tether-orchestrator-{}-{name}",
        std::process::id()
    ))
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }

        std::thread::sleep(Duration::from_millis(5));
    }

    false
}

fn orchestrator(name: &str, source: &MockSource, recorder: &Recorder) -> TestOrchestrator {
    let mut code = vec![0x90u8; 0x1000];
    code[0x123..0x127].copy_from_slice(b"\x1bLua");

    let opener = move |pid: ProcessId| {
        Ok(MockDriver {
            pid,
            code: code.clone(),
        })
    };

    let locator = ProcessLocator::new(source.clone(), LocatorConfig::new("game"));
    let injector = Injector::new(locator, opener, InjectorConfig::default()).unwrap();

    let config = OrchestratorConfig {
        engine: EngineConfig::default().with_workspace(scratch(&format!("{name}-workspace"))),
        socket_path: scratch(&format!("{name}.sock")),
        idle_tick: Duration::from_millis(5),
        background_scan: false,
        ..OrchestratorConfig::default()
    };

    let _ = std::fs::remove_file(&config.socket_path);

    let engine = ScriptEngine::new(config.engine.clone()).with_observer(recorder.clone());
    Orchestrator::new(injector, engine, &config).unwrap()
}

///////////////////////////////////////////////////////////////////////////////
// Tests
///////////////////////////////////////////////////////////////////////////////

#[test]
fn scripts_run_locally_without_a_target() {
    let recorder = Recorder::default();
    let orchestrator = orchestrator("local", &MockSource::default(), &recorder);

    assert_eq!(orchestrator.route(), Route::Local);
    assert!(orchestrator.engine().is_running());

    orchestrator.submit("print('queued')", "queued");
    assert!(wait_for(|| recorder.output.lock().len() == 1));
    assert_eq!(recorder.output.lock()[0], "queued");

    let route = orchestrator.execute("print('direct')", "direct").unwrap();
    assert_eq!(route, Route::Local);
    assert_eq!(recorder.output.lock()[1], "direct");
}

#[test]
fn idle_worker_resumes_waiting_scripts() {
    let recorder = Recorder::default();
    let orchestrator = orchestrator("idle", &MockSource::default(), &recorder);

    orchestrator.submit("task.wait(0.01) print('resumed')", "waiting");
    assert!(wait_for(|| !recorder.output.lock().is_empty()));
    assert_eq!(recorder.output.lock()[0], "resumed");
    assert_eq!(orchestrator.engine().pending_tasks(), 0);
}

#[test]
fn script_errors_do_not_stop_the_worker() {
    let recorder = Recorder::default();
    let orchestrator = orchestrator("errors", &MockSource::default(), &recorder);

    orchestrator.submit("error('boom')", "broken");
    orchestrator.submit("print('after')", "after");

    assert!(wait_for(|| recorder.output.lock().len() == 2));
    assert!(recorder.output.lock()[0].contains("boom"));
    assert_eq!(recorder.output.lock()[1], "after");
}

#[test]
fn attached_target_receives_scripts() {
    let recorder = Recorder::default();
    let source = MockSource::default();
    source.spawn(1234, "game");

    let orchestrator = orchestrator("remote", &source, &recorder);
    assert!(orchestrator.injector().attach());
    assert_eq!(orchestrator.injector().mode(), InjectionMode::Full);

    // Without a listening payload the script still runs locally.
    assert_eq!(orchestrator.route(), Route::Local);

    let payload = Recorder::default();
    let channel = DeliveryChannel::start(
        ChannelConfig {
            path: orchestrator.socket_path().to_owned(),
            tick_interval: Duration::from_millis(5),
            ..ChannelConfig::default()
        },
        ScriptEngine::new(EngineConfig::default().with_workspace(scratch("remote-payload")))
            .with_observer(payload.clone()),
    )
    .unwrap();

    assert_eq!(orchestrator.route(), Route::Remote);
    let route = orchestrator.execute("print('inside')", "remote").unwrap();
    assert_eq!(route, Route::Remote);
    assert_eq!(orchestrator.injector().state(), InjectionState::Injected);

    assert!(wait_for(|| !payload.output.lock().is_empty()));
    assert_eq!(payload.output.lock()[0], "inside");
    assert!(recorder.output.lock().is_empty());

    drop(channel);
    assert_eq!(orchestrator.route(), Route::Local);
}

#[test]
fn shutdown_stops_the_engine() {
    let recorder = Recorder::default();
    let mut orchestrator = orchestrator("shutdown", &MockSource::default(), &recorder);

    orchestrator.shutdown();
    assert!(!orchestrator.engine().is_running());

    orchestrator.shutdown();
}

#[test]
fn shutdown_stops_a_running_script() {
    let recorder = Recorder::default();
    let mut orchestrator = orchestrator("busy", &MockSource::default(), &recorder);

    orchestrator.submit("while true do end", "busy");
    std::thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    orchestrator.shutdown();
    assert!(started.elapsed() < Duration::from_secs(3));

    let output = recorder.output.lock();
    assert_eq!(output.len(), 1);
    assert!(output[0].contains("cancelled"), "{output:?}");
}
