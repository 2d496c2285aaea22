//! Core remote memory functionality.

pub mod arch;
mod core;
mod driver;
mod error;
pub mod pattern;

#[cfg(test)]
mod tests;

use std::cell::RefCell;

use zerocopy::{FromBytes, Immutable, IntoBytes};

pub use self::{
    arch::{Architecture, JumpBytes},
    core::{MemoryAccess, MemoryRegion, ProcessId, Va},
    driver::MemoryDriver,
    error::TetherError,
    pattern::{BytePattern, PatternError},
};

/// Remote memory access to a single target process.
///
/// `ProcessMemory` owns at most one [`MemoryDriver`] at a time. Replacing the
/// driver with [`attach`] closes the previous handle first and invalidates
/// every cache tied to it, so nothing read through the old handle can leak
/// into operations on the new one.
///
/// [`attach`]: Self::attach
pub struct ProcessMemory<Driver>
where
    Driver: MemoryDriver,
{
    driver: Option<Driver>,
    invalidated: bool,
    generation: u64,
    regions: RefCell<Option<Vec<MemoryRegion>>>,

    scan_chunk_size: usize,
    string_chunk_size: usize,
}

impl<Driver> Default for ProcessMemory<Driver>
where
    Driver: MemoryDriver,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<Driver> ProcessMemory<Driver>
where
    Driver: MemoryDriver,
{
    /// Default size of a signature scan window.
    pub const DEFAULT_SCAN_CHUNK_SIZE: usize = 0x10000;

    /// Default size of a string read chunk.
    pub const DEFAULT_STRING_CHUNK_SIZE: usize = 256;

    /// Creates a new, detached `ProcessMemory` instance.
    pub fn new() -> Self {
        Self {
            driver: None,
            invalidated: false,
            generation: 0,
            regions: RefCell::new(None),
            scan_chunk_size: Self::DEFAULT_SCAN_CHUNK_SIZE,
            string_chunk_size: Self::DEFAULT_STRING_CHUNK_SIZE,
        }
    }

    /// Sets the size of the window used by [`pattern_scan`] and
    /// [`scan_all`].
    ///
    /// The effective window is never smaller than the pattern itself.
    ///
    /// [`pattern_scan`]: Self::pattern_scan
    /// [`scan_all`]: Self::scan_all
    pub fn with_scan_chunk_size(self, size: usize) -> Self {
        Self {
            scan_chunk_size: size.max(1),
            ..self
        }
    }

    /// Sets the size of the chunks read by [`read_string`].
    ///
    /// [`read_string`]: Self::read_string
    pub fn with_string_chunk_size(self, size: usize) -> Self {
        Self {
            string_chunk_size: size.max(1),
            ..self
        }
    }

    /// Attaches to a process through `driver`.
    ///
    /// Any previously attached driver is dropped, closing its handle,
    /// before the new one is stored.
    pub fn attach(&mut self, driver: Driver) {
        if let Some(previous) = self.detach() {
            tracing::debug!(pid = %previous.process_id(), "closed previous handle");
        }

        tracing::debug!(
            pid = %driver.process_id(),
            writable = driver.is_writable(),
            "attached"
        );

        self.driver = Some(driver);
        self.invalidated = false;
        self.generation += 1;
    }

    /// Detaches from the current process and returns the driver.
    pub fn detach(&mut self) -> Option<Driver> {
        self.regions.borrow_mut().take();
        self.driver.take()
    }

    /// Drops the current handle.
    ///
    /// Subsequent operations fail with [`TetherError::HandleInvalidated`]
    /// until a new driver is attached.
    pub fn invalidate(&mut self) {
        if let Some(driver) = self.detach() {
            tracing::debug!(pid = %driver.process_id(), "handle invalidated");
            self.invalidated = true;
        }
    }

    /// Checks whether a process is attached.
    pub fn is_attached(&self) -> bool {
        self.driver.is_some()
    }

    /// Returns the identifier of the attached process.
    pub fn process_id(&self) -> Option<ProcessId> {
        self.driver.as_ref().map(MemoryDriver::process_id)
    }

    /// Returns a counter that changes every time a new handle is attached.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the attached driver.
    pub fn driver(&self) -> Result<&Driver, TetherError> {
        match &self.driver {
            Some(driver) => Ok(driver),
            None if self.invalidated => Err(TetherError::HandleInvalidated),
            None => Err(TetherError::NotAttached),
        }
    }

    /// Returns the memory regions of the attached process.
    ///
    /// The mapping table is parsed on first use and cached for the current
    /// handle; pass `refresh` to force a re-enumeration.
    pub fn regions(&self, refresh: bool) -> Result<Vec<MemoryRegion>, TetherError> {
        let driver = self.driver()?;

        let mut cache = self.regions.borrow_mut();
        if let Some(regions) = &*cache
            && !refresh
        {
            return Ok(regions.clone());
        }

        let regions = driver.regions()?;
        tracing::debug!(
            pid = %driver.process_id(),
            count = regions.len(),
            "enumerated regions"
        );

        *cache = Some(regions.clone());
        Ok(regions)
    }

    /// Checks whether the regions of the current handle were enumerated at
    /// least once.
    pub fn regions_enumerated(&self) -> bool {
        self.driver.is_some() && self.regions.borrow().is_some()
    }

    /// Finds the region containing `address`.
    pub fn find_region(&self, address: Va) -> Result<Option<MemoryRegion>, TetherError> {
        Ok(self
            .regions(false)?
            .into_iter()
            .find(|region| region.contains(address)))
    }

    /// Returns the lowest address mapped from a path containing `fragment`.
    pub fn module_base(&self, fragment: &str) -> Result<Option<Va>, TetherError> {
        Ok(self
            .regions(false)?
            .iter()
            .filter(|region| region.path_contains(fragment))
            .map(|region| region.start)
            .min())
    }

    /// Reads memory from the process.
    pub fn read(&self, address: Va, buffer: &mut [u8]) -> Result<(), TetherError> {
        self.driver()?.read(address, buffer)
    }

    /// Reads `size` bytes from the process into a new vector.
    pub fn read_vec(&self, address: Va, size: usize) -> Result<Vec<u8>, TetherError> {
        let mut buffer = vec![0u8; size];
        self.read(address, &mut buffer)?;
        Ok(buffer)
    }

    /// Writes memory to the process.
    pub fn write(&self, address: Va, content: &[u8]) -> Result<(), TetherError> {
        self.driver()?.write(address, content)
    }

    /// Reads a single byte from the process.
    pub fn read_u8(&self, address: Va) -> Result<u8, TetherError> {
        let mut buffer = [0u8; 1];
        self.read(address, &mut buffer)?;
        Ok(buffer[0])
    }

    /// Reads a 16-bit unsigned integer from the process.
    pub fn read_u16(&self, address: Va) -> Result<u16, TetherError> {
        let mut buffer = [0u8; 2];
        self.read(address, &mut buffer)?;
        Ok(u16::from_le_bytes(buffer))
    }

    /// Reads a 32-bit unsigned integer from the process.
    pub fn read_u32(&self, address: Va) -> Result<u32, TetherError> {
        let mut buffer = [0u8; 4];
        self.read(address, &mut buffer)?;
        Ok(u32::from_le_bytes(buffer))
    }

    /// Reads a 64-bit unsigned integer from the process.
    pub fn read_u64(&self, address: Va) -> Result<u64, TetherError> {
        let mut buffer = [0u8; 8];
        self.read(address, &mut buffer)?;
        Ok(u64::from_le_bytes(buffer))
    }

    /// Reads a 64-bit pointer from the process.
    pub fn read_va(&self, address: Va) -> Result<Va, TetherError> {
        self.read_u64(address).map(Va)
    }

    /// Reads a struct from the process.
    pub fn read_struct<T>(&self, address: Va) -> Result<T, TetherError>
    where
        T: FromBytes + IntoBytes,
    {
        let mut result = T::new_zeroed();
        self.read(address, result.as_mut_bytes())?;
        Ok(result)
    }

    /// Writes a 32-bit unsigned integer to the process.
    pub fn write_u32(&self, address: Va, value: u32) -> Result<(), TetherError> {
        self.write(address, &value.to_le_bytes())
    }

    /// Writes a 64-bit unsigned integer to the process.
    pub fn write_u64(&self, address: Va, value: u64) -> Result<(), TetherError> {
        self.write(address, &value.to_le_bytes())
    }

    /// Writes a struct to the process.
    pub fn write_struct<T>(&self, address: Va, value: T) -> Result<(), TetherError>
    where
        T: IntoBytes + Immutable,
    {
        self.write(address, value.as_bytes())
    }

    /// Reads a null-terminated string of at most `max_len` bytes.
    ///
    /// The string is read in chunks until a terminator is found. Fails with
    /// [`TetherError::NotFound`] if the first chunk cannot be read; a later
    /// failing chunk ends the string at what was read so far.
    pub fn read_string(&self, address: Va, max_len: usize) -> Result<String, TetherError> {
        let driver = self.driver()?;

        let mut result = Vec::new();
        let mut current = address;

        while result.len() < max_len {
            let size = self.string_chunk_size.min(max_len - result.len());
            let mut chunk = vec![0u8; size];

            if driver.read(current, &mut chunk).is_err() {
                if current == address {
                    return Err(TetherError::NotFound(address));
                }
                break;
            }

            if let Some(position) = memchr::memchr(0, &chunk) {
                result.extend_from_slice(&chunk[..position]);
                break;
            }

            result.extend_from_slice(&chunk);
            current += size as u64;
        }

        Ok(String::from_utf8_lossy(&result).into_owned())
    }

    /// Follows a chain of pointer offsets starting at `base`.
    ///
    /// Every offset but the last is added to the current address and the
    /// result is dereferenced; the last offset is added without
    /// dereferencing. An empty chain returns `base` unchanged.
    pub fn resolve_pointer_chain(&self, base: Va, offsets: &[i64]) -> Result<Va, TetherError> {
        self.driver()?;

        let Some((last, intermediate)) = offsets.split_last()
        else {
            return Ok(base);
        };

        let mut address = base;
        for (index, &offset) in intermediate.iter().enumerate() {
            let slot = address.offset(offset);

            address = match self.read_va(slot) {
                Ok(pointer) if !pointer.is_null() => pointer,
                _ => return Err(TetherError::NullDeref { address: slot, index }),
            };
        }

        Ok(address.offset(*last))
    }

    /// Reads several ranges at once.
    ///
    /// The whole batch is first attempted as a single vectored transfer.
    /// If that transfer comes up short, every entry is retried on its own so
    /// that entries which can be read are not lost to the ones that can't.
    pub fn batch_read(
        &self,
        requests: &[(Va, usize)],
    ) -> Result<Vec<Result<Vec<u8>, TetherError>>, TetherError> {
        let driver = self.driver()?;

        let expected = requests.iter().map(|&(_, size)| size).sum::<usize>();
        let mut buffers = requests
            .iter()
            .map(|&(_, size)| vec![0u8; size])
            .collect::<Vec<_>>();

        let transferred = {
            let mut slices = requests
                .iter()
                .zip(buffers.iter_mut())
                .map(|(&(address, _), buffer)| (address, buffer.as_mut_slice()))
                .collect::<Vec<_>>();

            driver.read_vectored(&mut slices)
        };

        match transferred {
            Ok(transferred) if transferred == expected => {
                Ok(buffers.into_iter().map(Ok).collect())
            }
            result => {
                tracing::debug!(?result, expected, "vectored read fell short, retrying entries");

                Ok(requests
                    .iter()
                    .map(|&(address, size)| {
                        let mut buffer = vec![0u8; size];
                        driver.read(address, &mut buffer).map(|()| buffer)
                    })
                    .collect())
            }
        }
    }

    /// Writes several ranges at once.
    ///
    /// Mirrors [`batch_read`]: one vectored transfer, then per-entry writes
    /// if it comes up short.
    ///
    /// [`batch_read`]: Self::batch_read
    pub fn batch_write(
        &self,
        requests: &[(Va, &[u8])],
    ) -> Result<Vec<Result<(), TetherError>>, TetherError> {
        let driver = self.driver()?;

        let expected = requests.iter().map(|(_, content)| content.len()).sum::<usize>();

        match driver.write_vectored(requests) {
            Ok(transferred) if transferred == expected => {
                Ok(requests.iter().map(|_| Ok(())).collect())
            }
            result => {
                tracing::debug!(?result, expected, "vectored write fell short, retrying entries");

                Ok(requests
                    .iter()
                    .map(|&(address, content)| driver.write(address, content))
                    .collect())
            }
        }
    }

    /// Returns the first match of `pattern` in `[start, start + length)`.
    pub fn pattern_scan(
        &self,
        pattern: &BytePattern,
        start: Va,
        length: u64,
    ) -> Result<Option<Va>, TetherError> {
        Ok(self.scan(pattern, start, length, true)?.into_iter().next())
    }

    /// Returns every match of `pattern` in `[start, start + length)`, in
    /// ascending order.
    pub fn scan_all(
        &self,
        pattern: &BytePattern,
        start: Va,
        length: u64,
    ) -> Result<Vec<Va>, TetherError> {
        self.scan(pattern, start, length, false)
    }

    fn scan(
        &self,
        pattern: &BytePattern,
        start: Va,
        length: u64,
        first_only: bool,
    ) -> Result<Vec<Va>, TetherError> {
        let driver = self.driver()?;

        let pattern_len = pattern.len() as u64;
        let overlap = pattern_len - 1;
        let chunk = (self.scan_chunk_size as u64).max(pattern_len);

        let mut result = Vec::new();
        let mut offset = 0u64;

        // Each window reads `step + overlap` bytes, so a match starting in the
        // last `overlap` bytes is reported by the next window, never twice.
        'windows: while offset + pattern_len <= length {
            let window = chunk.min(length - offset);
            let mut step = window;

            loop {
                let size = (step + overlap).min(length - offset);
                let mut buffer = vec![0u8; size as usize];

                if driver.read(start + offset, &mut buffer).is_ok() {
                    for position in pattern.find_iter(&buffer) {
                        result.push(start + offset + position as u64);

                        if first_only {
                            return Ok(result);
                        }
                    }

                    offset += step;
                    continue 'windows;
                }

                if step / 2 < pattern_len {
                    tracing::trace!(address = %(start + offset), window, "skipping unreadable window");

                    offset += window;
                    continue 'windows;
                }

                step /= 2;
            }
        }

        Ok(result)
    }
}
