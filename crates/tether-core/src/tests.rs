use std::{cell::Cell, collections::BTreeMap};

use super::*;

struct MockDriver {
    pid: ProcessId,
    memory: BTreeMap<u64, Vec<u8>>,
    max_read: Cell<Option<usize>>,
    region_queries: Cell<usize>,
}

impl MockDriver {
    fn new() -> Self {
        Self {
            pid: ProcessId(42),
            memory: BTreeMap::new(),
            max_read: Cell::new(None),
            region_queries: Cell::new(0),
        }
    }

    fn with_region(mut self, start: u64, content: Vec<u8>) -> Self {
        self.memory.insert(start, content);
        self
    }

    fn backing(&self, address: Va, len: usize) -> Option<(&Vec<u8>, usize)> {
        let (&start, content) = self.memory.range(..=address.0).next_back()?;
        let offset = (address.0 - start) as usize;

        if offset + len > content.len() {
            return None;
        }

        Some((content, offset))
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
        if let Some(max_read) = self.max_read.get()
            && buffer.len() > max_read
        {
            return Err(TetherError::transfer(address, buffer.len(), 0));
        }

        let (content, offset) = self
            .backing(address, buffer.len())
            .ok_or(TetherError::transfer(address, buffer.len(), 0))?;

        buffer.copy_from_slice(&content[offset..offset + buffer.len()]);
        Ok(())
    }

    fn write(&self, _address: Va, _content: &[u8]) -> Result<(), TetherError> {
        Err(TetherError::NotSupported)
    }

    fn regions(&self) -> Result<Vec<MemoryRegion>, TetherError> {
        self.region_queries.set(self.region_queries.get() + 1);

        Ok(self
            .memory
            .iter()
            .map(|(&start, content)| MemoryRegion {
                start: Va(start),
                end: Va(start + content.len() as u64),
                protection: MemoryAccess::RX,
                shared: false,
                offset: 0,
                path: Some(String::from("/opt/target/bin/target")),
            })
            .collect())
    }
}

fn attached(driver: MockDriver) -> ProcessMemory<MockDriver> {
    let mut memory = ProcessMemory::new();
    memory.attach(driver);
    memory
}

#[test]
fn pattern_straddling_windows_is_found_once() {
    let mut content = vec![0u8; 64];
    content[0..4].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
    content[14..18].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
    content[60..64].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);

    let memory = attached(MockDriver::new().with_region(0x1000, content)).with_scan_chunk_size(16);
    let pattern = BytePattern::from_ida("DE AD ?? EF").unwrap();

    let matches = memory.scan_all(&pattern, Va(0x1000), 64).unwrap();
    assert_eq!(matches, vec![Va(0x1000), Va(0x100E), Va(0x103C)]);

    let first = memory.pattern_scan(&pattern, Va(0x1004), 60).unwrap();
    assert_eq!(first, Some(Va(0x100E)));
}

#[test]
fn failed_window_is_halved_and_retried() {
    let mut content = vec![0u8; 128];
    content[100..103].copy_from_slice(&[0x1B, 0x4C, 0x75]);

    let driver = MockDriver::new().with_region(0x4000, content);
    driver.max_read.set(Some(20));

    let memory = attached(driver).with_scan_chunk_size(64);
    let pattern = BytePattern::from_bytes(&[0x1B, 0x4C, 0x75]).unwrap();

    assert_eq!(
        memory.pattern_scan(&pattern, Va(0x4000), 128).unwrap(),
        Some(Va(0x4064))
    );
}

#[test]
fn unreadable_windows_are_skipped() {
    let mut content = vec![0u8; 32];
    content[4..6].copy_from_slice(&[0xAA, 0xBB]);

    let memory = attached(MockDriver::new().with_region(0x1000, content)).with_scan_chunk_size(16);
    let pattern = BytePattern::from_ida("AA BB").unwrap();

    assert_eq!(
        memory.scan_all(&pattern, Va(0x0FC0), 0x60).unwrap(),
        vec![Va(0x1004)]
    );
}

#[test]
fn pointer_chain_resolution() {
    let mut first = vec![0u8; 0x20];
    first[0x08..0x10].copy_from_slice(&0x2000u64.to_le_bytes());

    let mut second = vec![0u8; 0x20];
    second[0x10..0x18].copy_from_slice(&0x3000u64.to_le_bytes());

    let memory = attached(
        MockDriver::new()
            .with_region(0x1000, first)
            .with_region(0x2000, second),
    );

    assert_eq!(
        memory.resolve_pointer_chain(Va(0x1000), &[]).unwrap(),
        Va(0x1000)
    );
    assert_eq!(
        memory
            .resolve_pointer_chain(Va(0x1000), &[0x08, 0x10, 0x20])
            .unwrap(),
        Va(0x3020)
    );
    assert_eq!(
        memory.resolve_pointer_chain(Va(0x1010), &[-0x08, -0x10]).unwrap(),
        Va(0x1FF0)
    );

    // Null intermediate pointer.
    assert!(matches!(
        memory.resolve_pointer_chain(Va(0x1000), &[0x18, 0]),
        Err(TetherError::NullDeref {
            address: Va(0x1018),
            index: 0,
        })
    ));

    // Unreadable second hop.
    assert!(matches!(
        memory.resolve_pointer_chain(Va(0x1000), &[0x08, 0x100, 0]),
        Err(TetherError::NullDeref {
            address: Va(0x2100),
            index: 1,
        })
    ));
}

#[test]
fn batch_read_falls_back_per_entry() {
    let memory = attached(
        MockDriver::new()
            .with_region(0x1000, vec![0x11; 16])
            .with_region(0x3000, vec![0x33; 16]),
    );

    let results = memory
        .batch_read(&[(Va(0x1000), 4), (Va(0x2000), 4), (Va(0x3000), 2)])
        .unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].as_ref().unwrap(), &vec![0x11; 4]);
    assert!(results[1].is_err());
    assert_eq!(results[2].as_ref().unwrap(), &vec![0x33; 2]);

    let results = memory
        .batch_read(&[(Va(0x1000), 16), (Va(0x3008), 8)])
        .unwrap();
    assert!(results.iter().all(Result::is_ok));
}

#[test]
fn read_string_stops_at_terminator_or_limit() {
    let mut content = b"hello, world\0garbage".to_vec();
    content.resize(24, b'z');

    let memory = attached(MockDriver::new().with_region(0x1000, content)).with_string_chunk_size(4);

    assert_eq!(memory.read_string(Va(0x1000), 256).unwrap(), "hello, world");
    assert_eq!(memory.read_string(Va(0x1000), 5).unwrap(), "hello");
    assert_eq!(memory.read_string(Va(0x100D), 256).unwrap(), "garbagez");

    assert!(matches!(
        memory.read_string(Va(0x9000), 16),
        Err(TetherError::NotFound(Va(0x9000)))
    ));
}

#[test]
fn handle_change_invalidates_region_cache() {
    let mut memory = attached(MockDriver::new().with_region(0x1000, vec![0; 16]));
    assert!(!memory.regions_enumerated());

    let regions = memory.regions(false).unwrap();
    assert_eq!(regions.len(), 1);
    assert!(memory.regions_enumerated());

    memory.regions(false).unwrap();
    assert_eq!(memory.driver().unwrap().region_queries.get(), 1);

    memory.regions(true).unwrap();
    assert_eq!(memory.driver().unwrap().region_queries.get(), 2);

    let generation = memory.generation();
    memory.attach(MockDriver::new().with_region(0x5000, vec![0; 16]));
    assert!(memory.generation() > generation);
    assert!(!memory.regions_enumerated());
    assert_eq!(
        memory.find_region(Va(0x5008)).unwrap().map(|region| region.start),
        Some(Va(0x5000))
    );
    assert_eq!(
        memory.module_base("target").unwrap(),
        Some(Va(0x5000))
    );

    memory.invalidate();
    assert!(matches!(memory.read_u8(Va(0x5000)), Err(TetherError::HandleInvalidated)));

    memory.detach();
    let fresh = ProcessMemory::<MockDriver>::new();
    assert!(matches!(fresh.regions(false), Err(TetherError::NotAttached)));
}

#[test]
fn typed_reads_are_little_endian() {
    let memory = attached(
        MockDriver::new().with_region(0x1000, vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]),
    );

    assert_eq!(memory.read_u8(Va(0x1000)).unwrap(), 0x01);
    assert_eq!(memory.read_u16(Va(0x1000)).unwrap(), 0x0201);
    assert_eq!(memory.read_u32(Va(0x1004)).unwrap(), 0x0807_0605);
    assert_eq!(memory.read_u64(Va(0x1000)).unwrap(), 0x0807_0605_0403_0201);
    assert_eq!(memory.read_struct::<[u8; 2]>(Va(0x1006)).unwrap(), [0x07, 0x08]);
}
