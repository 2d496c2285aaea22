use std::{
    fs,
    path::{Path, PathBuf},
};

use tether_core::{MemoryRegion, ProcessId};

use crate::{HostingFlags, LinuxError, ProcessDescriptor, maps::parse_maps};

/// A source of process snapshots.
pub trait ProcessSource {
    /// Enumerates all visible processes.
    ///
    /// Processes that disappear while being enumerated are skipped.
    fn processes(&self) -> Result<Vec<ProcessDescriptor>, LinuxError>;

    /// Enumerates the memory regions of a process.
    fn regions(&self, pid: ProcessId) -> Result<Vec<MemoryRegion>, LinuxError>;
}

/// Reads process information from a mounted procfs.
#[derive(Debug, Clone)]
pub struct ProcfsSource {
    root: PathBuf,
    container_markers: Vec<String>,
}

impl Default for ProcfsSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcfsSource {
    /// Creates a source reading from `/proc`.
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/proc"),
            container_markers: ["docker", "containerd", "podman", "libpod", "lxc", "kubepods"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }

    /// Reads from a different procfs mount point.
    pub fn with_root(self, root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..self
        }
    }

    /// Sets the cgroup path fragments that mark a process as containerized.
    pub fn with_container_markers(self, markers: Vec<String>) -> Self {
        Self {
            container_markers: markers,
            ..self
        }
    }

    /// Returns the procfs mount point.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reads a single process.
    pub fn process(&self, pid: ProcessId) -> Result<ProcessDescriptor, LinuxError> {
        let directory = self.root.join(pid.0.to_string());

        let stat = fs::read_to_string(directory.join("stat"))?;
        let (name, parent) = parse_stat(&stat).ok_or(LinuxError::MalformedStat(pid))?;

        let cmdline = fs::read(directory.join("cmdline"))
            .map(|content| parse_cmdline(&content))
            .unwrap_or_default();

        let exe = fs::read_link(directory.join("exe")).ok();

        let mut hosting = HostingFlags::empty();
        if let Ok(cgroup) = fs::read_to_string(directory.join("cgroup"))
            && self
                .container_markers
                .iter()
                .any(|marker| cgroup.contains(marker.as_str()))
        {
            hosting |= HostingFlags::CONTAINERIZED;
        }

        Ok(ProcessDescriptor {
            pid,
            name,
            cmdline,
            exe,
            parent: (parent != 0).then_some(ProcessId(parent)),
            hosting,
        })
    }
}

impl ProcessSource for ProcfsSource {
    fn processes(&self) -> Result<Vec<ProcessDescriptor>, LinuxError> {
        let mut result = Vec::new();

        for entry in fs::read_dir(&self.root)? {
            let Ok(entry) = entry
            else {
                continue;
            };

            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };

            match self.process(ProcessId(pid)) {
                Ok(process) => result.push(process),
                Err(err) => tracing::trace!(pid, %err, "skipping process"),
            }
        }

        result.sort_by_key(|process| process.pid);
        Ok(result)
    }

    fn regions(&self, pid: ProcessId) -> Result<Vec<MemoryRegion>, LinuxError> {
        let maps = fs::read_to_string(self.root.join(pid.0.to_string()).join("maps"))?;
        parse_maps(&maps)
    }
}

/// Extracts the name and parent pid from the content of `/proc/<pid>/stat`.
///
/// The name is enclosed in parentheses and may itself contain spaces and
/// parentheses, so the fields after it are located from the last `)`.
pub fn parse_stat(stat: &str) -> Option<(String, u32)> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let name = stat.get(open + 1..close)?;

    let mut fields = stat.get(close + 1..)?.split_ascii_whitespace();
    let _state = fields.next()?;
    let parent = fields.next()?.parse().ok()?;

    Some((name.to_owned(), parent))
}

/// Splits the NUL-separated content of `/proc/<pid>/cmdline`.
pub fn parse_cmdline(content: &[u8]) -> Vec<String> {
    content
        .split(|&byte| byte == 0)
        .filter(|arg| !arg.is_empty())
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_with_tricky_name() {
        let stat = "1234 (Web Content (x)) S 1200 1234 1234 0 -1 4194560 2048";
        assert_eq!(
            parse_stat(stat),
            Some((String::from("Web Content (x)"), 1200))
        );
        assert_eq!(parse_stat("garbage"), None);
    }

    #[test]
    fn cmdline_splitting() {
        assert_eq!(
            parse_cmdline(b"wine\0C:\\game.exe\0--flag\0"),
            vec!["wine", "C:\\game.exe", "--flag"]
        );
        assert!(parse_cmdline(b"").is_empty());
    }

    #[test]
    fn reads_fake_procfs() {
        let root = std::env::temp_dir().join(format!("tether-procfs-{}", std::process::id()));
        let directory = root.join("77");
        fs::create_dir_all(&directory).unwrap();

        fs::write(directory.join("stat"), "77 (game) S 1 77 77 0").unwrap();
        fs::write(directory.join("cmdline"), b"/opt/game\0-v\0").unwrap();
        fs::write(directory.join("cgroup"), "0::/system.slice/docker-abc.scope\n").unwrap();
        fs::write(
            directory.join("maps"),
            "1000-2000 r-xp 00000000 08:01 1 /opt/game\n",
        )
        .unwrap();
        fs::create_dir_all(root.join("self")).unwrap();

        let source = ProcfsSource::new().with_root(&root);
        let processes = source.processes().unwrap();

        assert_eq!(processes.len(), 1);
        assert_eq!(processes[0].name, "game");
        assert_eq!(processes[0].parent, Some(ProcessId(1)));
        assert_eq!(processes[0].cmdline, vec!["/opt/game", "-v"]);
        assert!(processes[0].hosting.contains(HostingFlags::CONTAINERIZED));
        assert_eq!(source.regions(ProcessId(77)).unwrap().len(), 1);

        fs::remove_dir_all(&root).unwrap();
    }
}
