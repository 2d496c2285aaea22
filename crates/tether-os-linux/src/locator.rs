use serde::{Deserialize, Serialize};

use crate::{HostingFlags, LinuxError, ProcessDescriptor, ProcessSource, ProcessTable};

/// Configuration of a [`ProcessLocator`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocatorConfig {
    /// Names the target is known by: process name, executable basename or
    /// `argv[0]` basename. The first entry is the canonical name; the rest
    /// are aliases.
    pub names: Vec<String>,

    /// Fragment of the module path looked for in the memory maps of
    /// compatibility-layer processes. Defaults to the names when unset.
    pub module_fragment: Option<String>,

    /// Names of compatibility-layer host processes.
    pub compat_hosts: Vec<String>,

    /// Names of sandboxed-runtime wrapper processes.
    pub sandbox_wrappers: Vec<String>,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            names: Vec::new(),
            module_fragment: None,
            compat_hosts: ["wine", "wine64", "wine-preloader", "wine64-preloader", "wineserver"]
                .into_iter()
                .map(String::from)
                .collect(),
            sandbox_wrappers: ["bwrap", "flatpak", "flatpak-session-helper"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl LocatorConfig {
    /// Creates a configuration looking for `name` and its aliases.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            names: vec![name.into()],
            ..Self::default()
        }
    }

    /// Adds an alias of the target.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.names.push(alias.into());
        self
    }

    /// Sets the module path fragment searched in mapped regions.
    pub fn with_module_fragment(self, fragment: impl Into<String>) -> Self {
        Self {
            module_fragment: Some(fragment.into()),
            ..self
        }
    }
}

/// Which discovery step found the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiscoveryMethod {
    /// Process name, executable or `argv[0]` matched directly.
    DirectName,

    /// Command line of a compatibility-layer process (or a descendant)
    /// mentioned the target.
    CompatCommandLine,

    /// Memory maps of a compatibility-layer process contained the target's
    /// module.
    CompatModule,

    /// A sandboxed-runtime wrapper (or a descendant) was running the
    /// target.
    Sandbox,
}

/// A located target process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedProcess {
    /// The target process, with hosting flags classified.
    pub process: ProcessDescriptor,

    /// How it was found.
    pub method: DiscoveryMethod,
}

/// Finds the target process among all processes of a [`ProcessSource`].
pub struct ProcessLocator<Source>
where
    Source: ProcessSource,
{
    source: Source,
    config: LocatorConfig,
}

impl<Source> ProcessLocator<Source>
where
    Source: ProcessSource,
{
    /// Creates a new locator.
    pub fn new(source: Source, config: LocatorConfig) -> Self {
        Self { source, config }
    }

    /// Returns the process source.
    pub fn source(&self) -> &Source {
        &self.source
    }

    /// Returns the configuration.
    pub fn config(&self) -> &LocatorConfig {
        &self.config
    }

    /// Runs discovery once.
    ///
    /// Discovery steps are tried in order and the first match wins:
    ///
    /// 1. a process whose name matches one of the target names,
    /// 2. a compatibility-layer process (or a descendant) whose command line
    ///    mentions the target,
    /// 3. a compatibility-layer process (or a descendant) that has the
    ///    target's module mapped,
    /// 4. a sandboxed-runtime wrapper (or a descendant) running the target.
    pub fn locate(&self) -> Result<Option<LocatedProcess>, LinuxError> {
        if self.config.names.is_empty() {
            return Ok(None);
        }

        let table = ProcessTable::new(self.source.processes()?);

        let found = self
            .by_name(&table)
            .map(|process| (process, DiscoveryMethod::DirectName))
            .or_else(|| {
                self.by_compat_cmdline(&table)
                    .map(|process| (process, DiscoveryMethod::CompatCommandLine))
            })
            .or_else(|| {
                self.by_compat_module(&table)
                    .map(|process| (process, DiscoveryMethod::CompatModule))
            })
            .or_else(|| {
                self.by_sandbox(&table)
                    .map(|process| (process, DiscoveryMethod::Sandbox))
            });

        let Some((process, method)) = found
        else {
            tracing::trace!(names = ?self.config.names, "target not found");
            return Ok(None);
        };

        let process = ProcessDescriptor {
            hosting: self.hosting(&table, process, method),
            ..process.clone()
        };

        tracing::debug!(
            pid = %process.pid,
            name = %process.name,
            ?method,
            hosting = ?process.hosting,
            "located target"
        );

        Ok(Some(LocatedProcess { process, method }))
    }

    fn is_target(&self, process: &ProcessDescriptor) -> bool {
        self.config.names.iter().any(|name| process.is_named(name))
    }

    fn mentions_target(&self, process: &ProcessDescriptor) -> bool {
        self.config
            .names
            .iter()
            .any(|name| process.cmdline_mentions(name))
    }

    fn is_compat_host(&self, process: &ProcessDescriptor) -> bool {
        self.config
            .compat_hosts
            .iter()
            .any(|host| process.is_named(host))
    }

    fn is_sandbox_wrapper(&self, process: &ProcessDescriptor) -> bool {
        self.config
            .sandbox_wrappers
            .iter()
            .any(|wrapper| process.is_named(wrapper))
    }

    /// Returns every compatibility-layer process followed by its
    /// descendants.
    fn compat_family<'a>(&self, table: &'a ProcessTable) -> Vec<&'a ProcessDescriptor> {
        let mut result = Vec::<&ProcessDescriptor>::new();

        for host in table.processes().iter().filter(|p| self.is_compat_host(p)) {
            for process in std::iter::once(host).chain(table.descendants(host.pid)) {
                if !result.iter().any(|p| p.pid == process.pid) {
                    result.push(process);
                }
            }
        }

        result
    }

    fn by_name<'a>(&self, table: &'a ProcessTable) -> Option<&'a ProcessDescriptor> {
        table.processes().iter().find(|process| self.is_target(process))
    }

    fn by_compat_cmdline<'a>(&self, table: &'a ProcessTable) -> Option<&'a ProcessDescriptor> {
        self.compat_family(table)
            .into_iter()
            .find(|process| self.mentions_target(process))
    }

    fn by_compat_module<'a>(&self, table: &'a ProcessTable) -> Option<&'a ProcessDescriptor> {
        let fragments = match &self.config.module_fragment {
            Some(fragment) => vec![fragment.to_ascii_lowercase()],
            None => self
                .config
                .names
                .iter()
                .map(|name| name.to_ascii_lowercase())
                .collect(),
        };

        self.compat_family(table).into_iter().find(|process| {
            let regions = match self.source.regions(process.pid) {
                Ok(regions) => regions,
                Err(err) => {
                    tracing::trace!(pid = %process.pid, %err, "cannot read maps");
                    return false;
                }
            };

            regions.iter().any(|region| {
                region.path.as_deref().is_some_and(|path| {
                    let path = path.to_ascii_lowercase();
                    fragments.iter().any(|fragment| path.contains(fragment))
                })
            })
        })
    }

    fn by_sandbox<'a>(&self, table: &'a ProcessTable) -> Option<&'a ProcessDescriptor> {
        for wrapper in table.processes().iter().filter(|p| self.is_sandbox_wrapper(p)) {
            let descendants = table.descendants(wrapper.pid);

            if let Some(process) = descendants
                .iter()
                .copied()
                .find(|process| self.is_target(process) || self.mentions_target(process))
            {
                return Some(process);
            }

            if self.mentions_target(wrapper) {
                return Some(descendants.last().copied().unwrap_or(wrapper));
            }
        }

        None
    }

    fn hosting(
        &self,
        table: &ProcessTable,
        process: &ProcessDescriptor,
        method: DiscoveryMethod,
    ) -> HostingFlags {
        let lineage = std::iter::once(process)
            .chain(table.ancestors(process.pid))
            .collect::<Vec<_>>();

        let mut result = process.hosting;

        if matches!(
            method,
            DiscoveryMethod::CompatCommandLine | DiscoveryMethod::CompatModule
        ) || lineage.iter().any(|p| self.is_compat_host(p))
        {
            result |= HostingFlags::COMPAT_LAYER;
        }

        if method == DiscoveryMethod::Sandbox || lineage.iter().any(|p| self.is_sandbox_wrapper(p))
        {
            result |= HostingFlags::SANDBOXED;
        }

        result
    }
}
