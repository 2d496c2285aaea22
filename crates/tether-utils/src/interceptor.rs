//! Inline hooks in the current process.
//!
//! When a hook is installed, the `Interceptor`:
//! - Saves the first [`JUMP_SIZE`] bytes of the target
//! - Builds a trampoline page holding those bytes followed by a jump back to
//!   the rest of the target
//! - Overwrites the target with a jump to the detour
//!
//! Calling the trampoline runs the original code. Instructions are copied
//! verbatim, so a target whose first bytes contain position-dependent
//! instructions cannot be hooked safely.
//!
//! Patching is not synchronized with execution: callers must make sure no
//! thread runs the target while a hook is installed or removed.
//!
//! [`JUMP_SIZE`]: tether_core::Architecture::JUMP_SIZE

use std::collections::{HashMap, hash_map::Entry};

use memmap2::{Mmap, MmapMut};
use tether_core::{Architecture, MemoryAccess, MemoryRegion, ProcessId, Va};
use tether_os_linux::{ProcessSource as _, ProcfsSource};

/// Error type for the interceptor.
#[derive(thiserror::Error, Debug)]
pub enum InterceptorError {
    /// The target is already hooked.
    #[error("Address {0} is already hooked")]
    AlreadyHooked(Va),

    /// The trampoline page could not be allocated.
    #[error("Cannot allocate trampoline: {0}")]
    Allocation(#[source] std::io::Error),

    /// The protection of the target page could not be changed.
    #[error("Cannot change protection at {address}: {source}")]
    Protection {
        /// Start of the page range.
        address: Va,

        /// The underlying error.
        source: std::io::Error,
    },
}

/// Opaque handle to a trampoline owned by an [`Interceptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Trampoline(u64);

/// An installed hook.
struct HookRecord {
    detour: Va,
    original: Vec<u8>,
    trampoline: Trampoline,

    /// Protection of every page the patch spans, in address order.
    protections: Vec<(Va, MemoryAccess)>,
}

/// Installs and removes inline hooks in the current process.
pub struct Interceptor<Arch>
where
    Arch: Architecture,
{
    hooks: HashMap<Va, HookRecord>,
    trampolines: HashMap<Trampoline, Mmap>,
    next_trampoline: u64,
    _marker: std::marker::PhantomData<Arch>,
}

impl<Arch> Default for Interceptor<Arch>
where
    Arch: Architecture,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<Arch> Interceptor<Arch>
where
    Arch: Architecture,
{
    /// Creates a new `Interceptor`.
    pub fn new() -> Self {
        Self {
            hooks: HashMap::new(),
            trampolines: HashMap::new(),
            next_trampoline: 0,
            _marker: std::marker::PhantomData,
        }
    }

    /// Redirects execution of `target` to `detour`.
    ///
    /// Returns a handle to the trampoline; its callable address is returned
    /// by [`entry`]. If an error is returned, no byte of the target has been
    /// touched.
    ///
    /// # Safety
    ///
    /// `target` must point to at least [`Architecture::JUMP_SIZE`] bytes of
    /// mapped code in the current process, and no thread may execute those
    /// bytes while the hook is being installed.
    ///
    /// [`entry`]: Self::entry
    pub unsafe fn install(&mut self, target: Va, detour: Va) -> Result<Trampoline, InterceptorError> {
        let entry = match self.hooks.entry(target) {
            Entry::Occupied(_) => return Err(InterceptorError::AlreadyHooked(target)),
            Entry::Vacant(entry) => entry,
        };

        // SAFETY: Guaranteed by the caller.
        let original =
            unsafe { std::slice::from_raw_parts(target.0 as *const u8, Arch::JUMP_SIZE) }.to_vec();

        // Trampoline: original bytes, then a jump to the first instruction
        // after the overwritten window.
        let mut page =
            MmapMut::map_anon(Arch::PAGE_SIZE as usize).map_err(InterceptorError::Allocation)?;
        let resume = Arch::absolute_jump(target + Arch::JUMP_SIZE as u64);
        page[..original.len()].copy_from_slice(&original);
        page[original.len()..original.len() + resume.len()].copy_from_slice(&resume);

        let page = page.make_exec().map_err(InterceptorError::Allocation)?;
        Arch::flush_instruction_cache(Va(page.as_ptr() as u64), original.len() + resume.len());

        let jump = Arch::absolute_jump(detour);
        let protections = current_protections::<Arch>(target, jump.len());

        // SAFETY: Guaranteed by the caller.
        unsafe { patch::<Arch>(target, &jump, &protections)? };

        let trampoline = Trampoline(self.next_trampoline);
        self.next_trampoline += 1;
        self.trampolines.insert(trampoline, page);

        entry.insert(HookRecord {
            detour,
            original,
            trampoline,
            protections,
        });

        tracing::debug!(%target, %detour, ?trampoline, "hook installed");
        Ok(trampoline)
    }

    /// Restores the original bytes of `target` and releases its trampoline.
    ///
    /// Returns `false` if `target` was not hooked.
    ///
    /// # Safety
    ///
    /// No thread may execute `target` or its trampoline while the hook is
    /// being removed.
    pub unsafe fn remove(&mut self, target: Va) -> Result<bool, InterceptorError> {
        let Some(record) = self.hooks.get(&target)
        else {
            return Ok(false);
        };

        // SAFETY: `target` was readable and writable when the hook was
        // installed; the rest is guaranteed by the caller.
        unsafe { patch::<Arch>(target, &record.original, &record.protections)? };

        if let Some(record) = self.hooks.remove(&target) {
            self.trampolines.remove(&record.trampoline);
            tracing::debug!(%target, detour = %record.detour, "hook removed");
        }

        Ok(true)
    }

    /// Removes every installed hook.
    ///
    /// # Safety
    ///
    /// See [`remove`](Self::remove).
    pub unsafe fn remove_all(&mut self) -> Result<(), InterceptorError> {
        let targets = self.hooks.keys().copied().collect::<Vec<_>>();

        for target in targets {
            // SAFETY: Guaranteed by the caller.
            unsafe { self.remove(target)? };
        }

        Ok(())
    }

    /// Returns the callable address of a trampoline.
    pub fn entry(&self, trampoline: Trampoline) -> Option<Va> {
        self.trampolines
            .get(&trampoline)
            .map(|page| Va(page.as_ptr() as u64))
    }

    /// Returns the trampoline of the hook at `target`.
    pub fn trampoline(&self, target: Va) -> Option<Trampoline> {
        self.hooks.get(&target).map(|record| record.trampoline)
    }

    /// Checks whether `target` is hooked.
    pub fn is_hooked(&self, target: Va) -> bool {
        self.hooks.contains_key(&target)
    }

    /// Returns the number of installed hooks.
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Checks whether no hook is installed.
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl<Arch> Drop for Interceptor<Arch>
where
    Arch: Architecture,
{
    fn drop(&mut self) {
        // SAFETY: Every hooked target was valid at install time.
        if let Err(err) = unsafe { self.remove_all() } {
            tracing::error!(%err, "failed to restore hooked code");
        }
    }
}

/// Returns the protection of every page covered by `len` bytes at
/// `address`, as currently mapped in this process.
fn current_protections<Arch>(address: Va, len: usize) -> Vec<(Va, MemoryAccess)>
where
    Arch: Architecture,
{
    let (start, end) = Arch::page_span(address, len);
    let pid = ProcessId(std::process::id());

    let regions = match ProcfsSource::new().regions(pid) {
        Ok(regions) => regions,
        Err(err) => {
            tracing::warn!(%address, %err, "cannot read own maps, assuming r-x");
            Vec::new()
        }
    };

    page_protections(&regions, start, end, Arch::PAGE_SIZE)
}

/// Maps each page in `[start, end)` to the protection of the region that
/// contains it. Pages outside every region are assumed to be `r-x`.
fn page_protections(
    regions: &[MemoryRegion],
    start: Va,
    end: Va,
    page_size: u64,
) -> Vec<(Va, MemoryAccess)> {
    let mut result = Vec::new();
    let mut page = start;

    while page < end {
        let protection = regions
            .iter()
            .find(|region| region.contains(page))
            .map_or(MemoryAccess::RX, |region| region.protection);

        result.push((page, protection));
        page += page_size;
    }

    result
}

/// Writes `content` at `target`, then puts back the protection of each
/// page.
unsafe fn patch<Arch>(
    target: Va,
    content: &[u8],
    protections: &[(Va, MemoryAccess)],
) -> Result<(), InterceptorError>
where
    Arch: Architecture,
{
    let (start, end) = Arch::page_span(target, content.len());
    let len = (end - start) as usize;

    // SAFETY: The range is page aligned and covers mapped memory.
    let result = unsafe {
        libc::mprotect(
            start.0 as *mut libc::c_void,
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        )
    };

    if result != 0 {
        return Err(InterceptorError::Protection {
            address: start,
            source: std::io::Error::last_os_error(),
        });
    }

    // SAFETY: The range is now writable.
    unsafe {
        std::ptr::copy_nonoverlapping(content.as_ptr(), target.0 as *mut u8, content.len());
    }

    for &(page, protection) in protections {
        // SAFETY: `page` is one of the pages made writable above.
        let result = unsafe {
            libc::mprotect(
                page.0 as *mut libc::c_void,
                Arch::PAGE_SIZE as usize,
                prot(protection),
            )
        };

        if result != 0 {
            tracing::warn!(
                address = %page,
                err = %std::io::Error::last_os_error(),
                "cannot restore page protection"
            );
        }
    }

    Arch::flush_instruction_cache(target, content.len());
    Ok(())
}

fn prot(access: MemoryAccess) -> libc::c_int {
    let mut result = libc::PROT_NONE;

    if access.contains(MemoryAccess::R) {
        result |= libc::PROT_READ;
    }
    if access.contains(MemoryAccess::W) {
        result |= libc::PROT_WRITE;
    }
    if access.contains(MemoryAccess::X) {
        result |= libc::PROT_EXEC;
    }

    result
}

#[cfg(test)]
mod tests {
    use tether_arch_amd64::Amd64;

    use super::*;

    fn code_page() -> MmapMut {
        let mut page = MmapMut::map_anon(0x2000).unwrap();
        for (index, byte) in page.iter_mut().enumerate() {
            *byte = (index % 251) as u8;
        }
        page
    }

    fn snapshot(page: &MmapMut) -> Vec<u8> {
        std::hint::black_box(page.to_vec())
    }

    #[test]
    fn install_then_remove_restores_bytes() {
        let page = code_page();
        let before = snapshot(&page);

        // Straddle the page boundary to exercise multi-page protection.
        let target = Va(page.as_ptr() as u64 + 0x1000 - 6);
        let detour = Va(0x7fff_dead_b000);

        let mut interceptor = Interceptor::<Amd64>::new();
        let trampoline = unsafe { interceptor.install(target, detour) }.unwrap();

        let patched = snapshot(&page);
        assert_eq!(
            &patched[0x1000 - 6..0x1000 - 6 + Amd64::JUMP_SIZE],
            Amd64::absolute_jump(detour).as_slice()
        );

        let entry = interceptor.entry(trampoline).unwrap();
        let code = unsafe { std::slice::from_raw_parts(entry.0 as *const u8, 2 * Amd64::JUMP_SIZE) };
        assert_eq!(&code[..Amd64::JUMP_SIZE], &before[0x1000 - 6..0x1000 - 6 + Amd64::JUMP_SIZE]);
        assert_eq!(
            &code[Amd64::JUMP_SIZE..],
            Amd64::absolute_jump(target + Amd64::JUMP_SIZE as u64).as_slice()
        );

        assert!(unsafe { interceptor.remove(target) }.unwrap());
        assert_eq!(snapshot(&page), before);
        assert_eq!(interceptor.entry(trampoline), None);
        assert!(interceptor.is_empty());
    }

    #[test]
    fn protection_is_kept_per_page() {
        let region = |start: u64, end: u64, protection| MemoryRegion {
            start: Va(start),
            end: Va(end),
            protection,
            shared: false,
            offset: 0,
            path: None,
        };

        let regions = [
            region(0x10000, 0x11000, MemoryAccess::RX),
            region(0x11000, 0x13000, MemoryAccess::R),
        ];

        assert_eq!(
            page_protections(&regions, Va(0x10000), Va(0x13000), 0x1000),
            vec![
                (Va(0x10000), MemoryAccess::RX),
                (Va(0x11000), MemoryAccess::R),
                (Va(0x12000), MemoryAccess::R),
            ]
        );

        assert_eq!(
            page_protections(&regions, Va(0x20000), Va(0x21000), 0x1000),
            vec![(Va(0x20000), MemoryAccess::RX)]
        );
    }

    #[test]
    fn straddling_hook_restores_each_page_protection() {
        let page = code_page();
        let before = snapshot(&page);
        let second = Va(page.as_ptr() as u64 + 0x1000);

        // SAFETY: The second page belongs to `page`.
        let result =
            unsafe { libc::mprotect(second.0 as *mut libc::c_void, 0x1000, libc::PROT_READ) };
        assert_eq!(result, 0);

        let protection_at = |address: Va| {
            current_protections::<Amd64>(address, 1)
                .first()
                .map(|&(_, protection)| protection)
        };

        assert_eq!(protection_at(second), Some(MemoryAccess::R));

        let target = second - 6;
        let mut interceptor = Interceptor::<Amd64>::new();
        unsafe { interceptor.install(target, Va(0x4000)) }.unwrap();

        assert_eq!(protection_at(target), Some(MemoryAccess::RW));
        assert_eq!(protection_at(second), Some(MemoryAccess::R));

        assert!(unsafe { interceptor.remove(target) }.unwrap());
        assert_eq!(protection_at(second), Some(MemoryAccess::R));
        assert_eq!(snapshot(&page), before);
    }

    #[test]
    fn double_install_is_rejected() {
        let page = code_page();
        let target = Va(page.as_ptr() as u64 + 0x40);

        let mut interceptor = Interceptor::<Amd64>::new();
        unsafe { interceptor.install(target, Va(0x1000)) }.unwrap();
        let patched = snapshot(&page);

        assert!(matches!(
            unsafe { interceptor.install(target, Va(0x2000)) },
            Err(InterceptorError::AlreadyHooked(_))
        ));
        assert_eq!(snapshot(&page), patched);
        assert_eq!(interceptor.len(), 1);
    }

    #[test]
    fn drop_restores_all_hooks() {
        let page = code_page();
        let before = snapshot(&page);

        {
            let mut interceptor = Interceptor::<Amd64>::new();
            for offset in [0x10, 0x100, 0x1800] {
                let target = Va(page.as_ptr() as u64 + offset);
                unsafe { interceptor.install(target, Va(0x4000)) }.unwrap();
            }
            assert_ne!(snapshot(&page), before);
        }

        assert_eq!(snapshot(&page), before);
        assert!(!unsafe { Interceptor::<Amd64>::new().remove(Va(0x1234)) }.unwrap());
    }
}
