//! Linux process discovery.
//!
//! Everything here is read from procfs: the process table, the memory maps
//! of a process and the hints used to classify how a process is hosted
//! (compatibility layer, sandboxed runtime, container).

mod error;
mod locator;
pub mod maps;
mod process;
mod source;

pub use self::{
    error::LinuxError,
    locator::{DiscoveryMethod, LocatedProcess, LocatorConfig, ProcessLocator},
    process::{HostingFlags, ProcessDescriptor, ProcessTable},
    source::{ProcessSource, ProcfsSource, parse_cmdline, parse_stat},
};
