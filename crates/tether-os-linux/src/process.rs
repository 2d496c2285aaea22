use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tether_core::ProcessId;

bitflags::bitflags! {
    /// How a process is hosted on the machine.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct HostingFlags: u8 {
        /// Runs under a compatibility layer (e.g. Wine).
        const COMPAT_LAYER = 0b00000001;

        /// Runs inside a sandboxed runtime (e.g. Flatpak, bubblewrap).
        const SANDBOXED = 0b00000010;

        /// Runs inside a container.
        const CONTAINERIZED = 0b00000100;
    }
}

/// A snapshot of a single process.
///
/// Descriptors are immutable; a re-scan produces a new set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDescriptor {
    /// The process ID.
    pub pid: ProcessId,

    /// The short process name (`comm`, at most 15 bytes).
    pub name: String,

    /// The command line arguments.
    pub cmdline: Vec<String>,

    /// The executable path, if it could be resolved.
    pub exe: Option<PathBuf>,

    /// The parent process ID.
    pub parent: Option<ProcessId>,

    /// How the process is hosted.
    pub hosting: HostingFlags,
}

impl ProcessDescriptor {
    /// Maximum length of a kernel task name.
    pub const COMM_LEN: usize = 15;

    /// Returns the basename of the executable path.
    pub fn exe_name(&self) -> Option<&str> {
        self.exe
            .as_deref()
            .and_then(Path::file_name)
            .and_then(|name| name.to_str())
    }

    /// Returns the basename of `argv[0]`.
    ///
    /// Both `/` and `\` are treated as separators, so Windows-style paths
    /// passed through a compatibility layer are handled.
    pub fn argv0_name(&self) -> Option<&str> {
        let argv0 = self.cmdline.first()?;
        argv0.rsplit(['/', '\\']).next()
    }

    /// Returns the command line joined by spaces.
    pub fn cmdline_joined(&self) -> String {
        self.cmdline.join(" ")
    }

    /// Checks whether any of the process names equals `expected`,
    /// ignoring ASCII case.
    ///
    /// The kernel truncates `comm`, so a full-length `comm` also matches a
    /// longer name it is a prefix of.
    pub fn is_named(&self, expected: &str) -> bool {
        let comm_matches = self.name.eq_ignore_ascii_case(expected)
            || (self.name.len() == Self::COMM_LEN
                && expected.len() > Self::COMM_LEN
                && expected
                    .get(..Self::COMM_LEN)
                    .is_some_and(|prefix| prefix.eq_ignore_ascii_case(&self.name)));

        comm_matches
            || self
                .exe_name()
                .is_some_and(|name| name.eq_ignore_ascii_case(expected))
            || self
                .argv0_name()
                .is_some_and(|name| name.eq_ignore_ascii_case(expected))
    }

    /// Checks whether the command line mentions `fragment`, ignoring ASCII
    /// case.
    pub fn cmdline_mentions(&self, fragment: &str) -> bool {
        let fragment = fragment.to_ascii_lowercase();
        self.cmdline
            .iter()
            .any(|arg| arg.to_ascii_lowercase().contains(&fragment))
    }
}

/// A consistent view of all processes taken at one point in time.
#[derive(Debug, Default)]
pub struct ProcessTable {
    processes: Vec<ProcessDescriptor>,
    children: HashMap<ProcessId, Vec<usize>>,
    index: HashMap<ProcessId, usize>,
}

impl ProcessTable {
    /// Builds a table from a list of descriptors.
    pub fn new(processes: Vec<ProcessDescriptor>) -> Self {
        let mut children = HashMap::<ProcessId, Vec<usize>>::new();
        let mut index = HashMap::new();

        for (position, process) in processes.iter().enumerate() {
            index.insert(process.pid, position);

            if let Some(parent) = process.parent {
                children.entry(parent).or_default().push(position);
            }
        }

        Self {
            processes,
            children,
            index,
        }
    }

    /// Returns all processes.
    pub fn processes(&self) -> &[ProcessDescriptor] {
        &self.processes
    }

    /// Returns the process with the given ID.
    pub fn get(&self, pid: ProcessId) -> Option<&ProcessDescriptor> {
        self.index.get(&pid).map(|&position| &self.processes[position])
    }

    /// Returns all descendants of `pid`, breadth first.
    pub fn descendants(&self, pid: ProcessId) -> Vec<&ProcessDescriptor> {
        let mut result = Vec::new();
        let mut queue = std::collections::VecDeque::from([pid]);

        while let Some(current) = queue.pop_front() {
            for &position in self.children.get(&current).into_iter().flatten() {
                let child = &self.processes[position];

                // Guard against reused pids forming a cycle.
                if child.pid == pid || result.iter().any(|p: &&ProcessDescriptor| p.pid == child.pid) {
                    continue;
                }

                result.push(child);
                queue.push_back(child.pid);
            }
        }

        result
    }

    /// Returns the ancestors of `pid`, nearest first.
    pub fn ancestors(&self, pid: ProcessId) -> Vec<&ProcessDescriptor> {
        let mut result = Vec::<&ProcessDescriptor>::new();
        let mut current = self.get(pid).and_then(|process| process.parent);

        while let Some(parent) = current {
            let Some(process) = self.get(parent)
            else {
                break;
            };

            if process.pid == pid || result.iter().any(|p| p.pid == process.pid) {
                break;
            }

            result.push(process);
            current = process.parent;
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process(pid: u32, parent: u32, name: &str, cmdline: &[&str]) -> ProcessDescriptor {
        ProcessDescriptor {
            pid: ProcessId(pid),
            name: name.into(),
            cmdline: cmdline.iter().map(|arg| arg.to_string()).collect(),
            exe: None,
            parent: Some(ProcessId(parent)),
            hosting: HostingFlags::empty(),
        }
    }

    #[test]
    fn names_match_truncated_comm_and_windows_paths() {
        let target = process(
            10,
            1,
            "RobloxPlayerBet",
            &["C:\\Program Files\\Roblox\\RobloxPlayerBeta.exe", "--app"],
        );

        assert!(target.is_named("robloxplayerbeta.exe"));
        assert!(target.is_named("RobloxPlayerBeta"));
        assert!(!target.is_named("Roblox"));
        assert_eq!(target.argv0_name(), Some("RobloxPlayerBeta.exe"));
        assert!(target.cmdline_mentions("program files\\roblox"));
    }

    #[test]
    fn tree_walks() {
        let table = ProcessTable::new(vec![
            process(1, 0, "init", &[]),
            process(2, 1, "wineserver", &[]),
            process(3, 2, "wine", &[]),
            process(4, 3, "child", &[]),
            process(5, 1, "other", &[]),
        ]);

        let descendants = table
            .descendants(ProcessId(2))
            .iter()
            .map(|process| process.pid.0)
            .collect::<Vec<_>>();
        assert_eq!(descendants, vec![3, 4]);

        let ancestors = table
            .ancestors(ProcessId(4))
            .iter()
            .map(|process| process.pid.0)
            .collect::<Vec<_>>();
        assert_eq!(ancestors, vec![3, 2, 1]);
    }
}
