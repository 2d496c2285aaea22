use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tether_core::{MemoryAccess, MemoryDriver, MemoryRegion, ProcessId, TetherError, Va};
use tether_os_linux::{
    HostingFlags, LinuxError, LocatorConfig, ProcessDescriptor, ProcessLocator, ProcessSource,
};

use super::{FailureReason, InjectionMode, InjectionState, Injector, InjectorConfig};

///////////////////////////////////////////////////////////////////////////////
// Mock Source
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

///////////////////////////////////////////////////////////////////////////////
// Mock Driver
///////////////////////////////////////////////////////////////////////////////

const DATA_BASE: u64 = 0x10000;
const CODE_BASE: u64 = 0x40000;

struct MockDriver {
    pid: ProcessId,
    data: Vec<u8>,
    code: Vec<u8>,
    alive: Arc<AtomicBool>,
}

impl MockDriver {
    fn region(&self, address: Va, len: usize) -> Option<&[u8]> {
        for (base, content) in [(DATA_BASE, &self.data), (CODE_BASE, &self.code)] {
            if address.0 >= base && address.0 + len as u64 <= base + content.len() as u64 {
                let offset = (address.0 - base) as usize;
                return Some(&content[offset..offset + len]);
            }
        }

        None
    }
}

impl MemoryDriver for MockDriver {
    fn process_id(&self) -> ProcessId {
        self.pid
    }

    fn is_writable(&self) -> bool {
        false
    }

    fn read(&self, address: Va, buffer: &mut [u8]) -> Result<(), TetherError> {
        let content = self
            .region(address, buffer.len())
            .ok_or(TetherError::transfer(address, buffer.len(), 0))?;

        buffer.copy_from_slice(content);
        Ok(())
    }

    fn write(&self, _address: Va, _content: &[u8]) -> Result<(), TetherError> {
        Err(TetherError::NotSupported)
    }

    fn regions(&self) -> Result<Vec<MemoryRegion>, TetherError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(std::io::Error::from(std::io::ErrorKind::NotFound).into());
        }

        let region = |base: u64, len: usize, protection| MemoryRegion {
            start: Va(base),
            end: Va(base + len as u64),
            protection,
            shared: false,
            offset: 0,
            path: Some(String::from("/opt/game/game.bin")),
        };

        Ok(vec![
            region(DATA_BASE, self.data.len(), MemoryAccess::RW),
            region(CODE_BASE, self.code.len(), MemoryAccess::RX),
        ])
    }
}

///////////////////////////////////////////////////////////////////////////////
// Test Helpers
///////////////////////////////////////////////////////////////////////////////

struct Fixture {
    source: MockSource,
    alive: Arc<AtomicBool>,
    accessible: Arc<AtomicBool>,
    transitions: Arc<Mutex<Vec<InjectionState>>>,
    injector: Injector<MockSource, MockDriver>,
}

fn fixture(with_vm: bool, config: InjectorConfig) -> Fixture {
    let source = MockSource::default();
    let alive = Arc::new(AtomicBool::new(true));
    let accessible = Arc::new(AtomicBool::new(true));
    let transitions = Arc::new(Mutex::new(Vec::new()));

    // The signature also appears in the data region, which must be ignored.
    let mut data = vec![0u8; 0x100];
    data[0x10..0x13].copy_from_slice(&[0x1B, 0x4C, 0x75]);

    let mut code = vec![0x90u8; 0x3000];
    if with_vm {
        code[0x2345..0x2349].copy_from_slice(b"\x1bLua");
    }

    let opener = {
        let alive = alive.clone();
        let accessible = accessible.clone();

        move |pid: ProcessId| {
            if !accessible.load(Ordering::SeqCst) {
                return Err(TetherError::AccessDenied(pid));
            }

            Ok(MockDriver {
                pid,
                data: data.clone(),
                code: code.clone(),
                alive: alive.clone(),
            })
        }
    };

    let locator = ProcessLocator::new(source.clone(), LocatorConfig::new("game"));
    let injector = Injector::new(locator, opener, config)
        .unwrap()
        .with_status_callback({
            let transitions = transitions.clone();
            move |state, _message| transitions.lock().push(state)
        });

    Fixture {
        source,
        alive,
        accessible,
        transitions,
        injector,
    }
}

///////////////////////////////////////////////////////////////////////////////
// Tests
///////////////////////////////////////////////////////////////////////////////

#[test]
fn full_lifecycle() {
    let f = fixture(true, InjectorConfig::default());
    f.source.spawn(1234, "game");

    assert!(f.injector.scan());
    assert_eq!(f.injector.state(), InjectionState::Found);
    assert_eq!(f.injector.target().map(|target| target.pid), Some(ProcessId(1234)));

    assert!(f.injector.attach());
    assert_eq!(f.injector.state(), InjectionState::Injected);
    assert_eq!(f.injector.mode(), InjectionMode::Full);
    assert_eq!(f.injector.last_failure(), None);
    assert!(f.injector.with_memory(|memory| memory.regions_enumerated()));

    let vm = f.injector.vm().unwrap();
    assert_eq!(vm.address, Va(CODE_BASE + 0x2345));
    assert_eq!(vm.region_start, Va(CODE_BASE));
    assert_eq!(vm.regions_scanned, 1);
    assert_eq!(vm.bytes_scanned, 0x3000);
    assert!(!vm.validated);

    assert!(f.injector.begin_execution());
    assert!(!f.injector.begin_execution());
    assert!(f.injector.end_execution());

    assert!(f.injector.detach());
    assert!(!f.injector.detach());
    assert_eq!(f.injector.vm(), None);
    assert!(!f.injector.with_memory(|memory| memory.is_attached()));

    assert!(f.injector.scan());

    assert_eq!(
        *f.transitions.lock(),
        vec![
            InjectionState::Scanning,
            InjectionState::Found,
            InjectionState::Attaching,
            InjectionState::Injected,
            InjectionState::Executing,
            InjectionState::Injected,
            InjectionState::Detached,
            InjectionState::Scanning,
            InjectionState::Found,
        ]
    );
}

#[test]
fn missing_vm_keeps_local_mode() {
    let f = fixture(false, InjectorConfig::default());
    f.source.spawn(1234, "game");

    assert!(f.injector.attach());
    assert_eq!(f.injector.state(), InjectionState::Injected);
    assert_eq!(f.injector.mode(), InjectionMode::LocalOnly);
    assert_eq!(f.injector.vm(), None);
    assert_eq!(f.injector.last_failure(), Some(FailureReason::VmNotLocated));
}

#[test]
fn inaccessible_target_fails() {
    let f = fixture(true, InjectorConfig::default());
    f.source.spawn(1234, "game");
    f.accessible.store(false, Ordering::SeqCst);

    assert!(!f.injector.attach());
    assert_eq!(f.injector.state(), InjectionState::Failed);
    assert_eq!(
        f.injector.last_failure(),
        Some(FailureReason::FoundButInaccessible)
    );
    assert!(!f.injector.with_memory(|memory| memory.is_attached()));

    f.accessible.store(true, Ordering::SeqCst);
    assert!(f.injector.scan());
    assert!(f.injector.attach());
}

#[test]
fn missing_target_returns_to_idle() {
    let f = fixture(true, InjectorConfig::default());

    assert!(!f.injector.scan());
    assert_eq!(f.injector.state(), InjectionState::Idle);
    assert_eq!(f.injector.last_failure(), Some(FailureReason::NotFound));

    assert!(!f.injector.attach());
    assert_eq!(f.injector.state(), InjectionState::Idle);
}

#[test]
fn handle_loss_resets_to_idle() {
    let f = fixture(true, InjectorConfig::default());
    f.source.spawn(1234, "game");

    assert!(f.injector.attach());
    assert!(f.injector.check_handle());

    f.alive.store(false, Ordering::SeqCst);
    assert!(!f.injector.check_handle());
    assert_eq!(f.injector.state(), InjectionState::Idle);
    assert_eq!(f.injector.target(), None);
    assert_eq!(f.injector.mode(), InjectionMode::LocalOnly);
    assert!(!f.injector.with_memory(|memory| memory.is_attached()));
}

#[test]
fn background_scan_attaches_and_stops() {
    let f = fixture(
        true,
        InjectorConfig {
            scan_interval: Duration::from_millis(10),
            ..InjectorConfig::default()
        },
    );

    assert!(f.injector.start_background_scan());
    assert!(!f.injector.start_background_scan());

    std::thread::sleep(Duration::from_millis(30));
    f.source.spawn(4321, "game");

    let deadline = Instant::now() + Duration::from_secs(5);
    while f.injector.state() != InjectionState::Injected && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(f.injector.state(), InjectionState::Injected);
    assert_eq!(f.injector.target().map(|target| target.pid), Some(ProcessId(4321)));

    f.injector.stop_background_scan();
    assert!(!f.injector.is_background_scanning());
    assert!(f.injector.start_background_scan());
}
