use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt as _,
    path::{Path, PathBuf},
};

use tether_core::{MemoryRegion, ProcessId, Va};

use crate::{AccessMode, Error};

/// Linux limit on the number of `iovec` entries per call (`UIO_MAXIOV`).
const IOV_MAX: usize = 1024;

pub(crate) struct ProcfsHandle {
    pid: ProcessId,
    mem: File,
    mode: AccessMode,
    maps: PathBuf,
}

impl ProcfsHandle {
    pub fn open(root: &Path, pid: ProcessId) -> Result<Self, Error> {
        let directory = root.join(pid.0.to_string());
        let path = directory.join("mem");

        let (mem, mode) = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(mem) => (mem, AccessMode::ReadWrite),
            Err(err) => {
                tracing::warn!(%pid, %err, "read-write open failed, retrying read-only");

                match File::open(&path) {
                    Ok(mem) => (mem, AccessMode::ReadOnly),
                    Err(source) => {
                        tracing::warn!(%pid, err = %source, "read-only open failed");
                        return Err(Error::AccessDenied { pid, source });
                    }
                }
            }
        };

        Ok(Self {
            pid,
            mem,
            mode,
            maps: directory.join("maps"),
        })
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn read(&self, address: Va, buffer: &mut [u8]) -> Result<(), Error> {
        if buffer.is_empty() {
            return Ok(());
        }

        if let Ok(transferred) = self.mem.read_at(buffer, address.0)
            && transferred == buffer.len()
        {
            return Ok(());
        }

        let expected = buffer.len();
        let transferred = self.read_vectored(&mut [(address, buffer)])?;
        if transferred != expected {
            return Err(Error::Transfer {
                address,
                expected,
                transferred,
            });
        }

        Ok(())
    }

    pub fn write(&self, address: Va, content: &[u8]) -> Result<(), Error> {
        if content.is_empty() {
            return Ok(());
        }

        if self.mode == AccessMode::ReadWrite
            && let Ok(transferred) = self.mem.write_at(content, address.0)
            && transferred == content.len()
        {
            return Ok(());
        }

        let transferred = self.write_vectored(&[(address, content)])?;
        if transferred != content.len() {
            return Err(Error::Transfer {
                address,
                expected: content.len(),
                transferred,
            });
        }

        Ok(())
    }

    /// Reads all requests with `process_vm_readv`, at most [`IOV_MAX`]
    /// entries per call.
    ///
    /// Stops at the first call that comes up short.
    pub fn read_vectored(&self, requests: &mut [(Va, &mut [u8])]) -> Result<usize, Error> {
        let mut total = 0;

        for batch in requests.chunks_mut(IOV_MAX) {
            let local = batch
                .iter_mut()
                .map(|(_, buffer)| libc::iovec {
                    iov_base: buffer.as_mut_ptr().cast(),
                    iov_len: buffer.len(),
                })
                .collect::<Vec<_>>();

            let remote = batch
                .iter()
                .map(|(address, buffer)| libc::iovec {
                    iov_base: address.0 as *mut libc::c_void,
                    iov_len: buffer.len(),
                })
                .collect::<Vec<_>>();

            let expected = batch.iter().map(|(_, buffer)| buffer.len()).sum::<usize>();

            // SAFETY: Every local iovec points into a live, exclusively
            // borrowed buffer of the stated length. Remote iovecs are only
            // interpreted by the kernel in the target's address space.
            let result = unsafe {
                libc::process_vm_readv(
                    self.pid.0 as libc::pid_t,
                    local.as_ptr(),
                    local.len() as libc::c_ulong,
                    remote.as_ptr(),
                    remote.len() as libc::c_ulong,
                    0,
                )
            };

            match usize::try_from(result) {
                Ok(transferred) => {
                    total += transferred;
                    if transferred != expected {
                        break;
                    }
                }
                Err(_) if total == 0 => return Err(std::io::Error::last_os_error().into()),
                Err(_) => break,
            }
        }

        Ok(total)
    }

    /// Writes all requests with `process_vm_writev`, at most [`IOV_MAX`]
    /// entries per call.
    pub fn write_vectored(&self, requests: &[(Va, &[u8])]) -> Result<usize, Error> {
        let mut total = 0;

        for batch in requests.chunks(IOV_MAX) {
            let local = batch
                .iter()
                .map(|(_, content)| libc::iovec {
                    iov_base: content.as_ptr() as *mut libc::c_void,
                    iov_len: content.len(),
                })
                .collect::<Vec<_>>();

            let remote = batch
                .iter()
                .map(|(address, content)| libc::iovec {
                    iov_base: address.0 as *mut libc::c_void,
                    iov_len: content.len(),
                })
                .collect::<Vec<_>>();

            let expected = batch.iter().map(|(_, content)| content.len()).sum::<usize>();

            // SAFETY: The kernel only reads from the local iovecs, which
            // point into live buffers of the stated length.
            let result = unsafe {
                libc::process_vm_writev(
                    self.pid.0 as libc::pid_t,
                    local.as_ptr(),
                    local.len() as libc::c_ulong,
                    remote.as_ptr(),
                    remote.len() as libc::c_ulong,
                    0,
                )
            };

            match usize::try_from(result) {
                Ok(transferred) => {
                    total += transferred;
                    if transferred != expected {
                        break;
                    }
                }
                Err(_) if total == 0 => return Err(std::io::Error::last_os_error().into()),
                Err(_) => break,
            }
        }

        Ok(total)
    }

    pub fn regions(&self) -> Result<Vec<MemoryRegion>, Error> {
        let maps = std::fs::read_to_string(&self.maps)?;
        Ok(tether_os_linux::maps::parse_maps(&maps)?)
    }
}
