//! Filesystem sandbox.

use std::{
    io::Write as _,
    path::{Component, Path, PathBuf},
};

use crate::WorkspaceError;

/// A directory that guest file primitives are confined to.
///
/// Every path is resolved against the root. The nearest existing ancestor
/// of the result is canonicalized, the remaining components are applied
/// lexically, and the outcome must still lie under the canonical root.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Opens a workspace, creating the root directory if needed.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, WorkspaceError> {
        let root = root.as_ref();

        std::fs::create_dir_all(root).map_err(|source| io_error(root, source))?;
        let root = root
            .canonicalize()
            .map_err(|source| io_error(root, source))?;

        Ok(Self { root })
    }

    /// Returns the canonical root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a guest path to a host path inside the workspace.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, WorkspaceError> {
        let mut normalized = PathBuf::new();
        for component in self.root.join(path).components() {
            match component {
                Component::ParentDir => {
                    normalized.pop();
                }
                Component::CurDir => {}
                other => normalized.push(other),
            }
        }

        // Canonicalize the nearest ancestor that exists.
        let mut existing = normalized.as_path();
        let mut rest = Vec::new();
        let mut resolved = loop {
            if let Ok(base) = existing.canonicalize() {
                break base;
            }

            let (Some(parent), Some(name)) = (existing.parent(), existing.file_name())
            else {
                return Err(WorkspaceError::Escape(path.into()));
            };

            rest.push(name);
            existing = parent;
        };

        resolved.extend(rest.iter().rev());

        if !resolved.starts_with(&self.root) {
            tracing::warn!(path, resolved = %resolved.display(), "workspace escape rejected");
            return Err(WorkspaceError::Escape(path.into()));
        }

        Ok(resolved)
    }

    /// Reads a file.
    pub fn read(&self, path: &str) -> Result<Vec<u8>, WorkspaceError> {
        let resolved = self.resolve(path)?;
        if !resolved.is_file() {
            return Err(WorkspaceError::NotFound(path.into()));
        }

        std::fs::read(&resolved).map_err(|source| io_error(&resolved, source))
    }

    /// Writes a file, creating missing parent folders.
    pub fn write(&self, path: &str, content: &[u8]) -> Result<(), WorkspaceError> {
        let resolved = self.resolve_creatable(path)?;
        std::fs::write(&resolved, content).map_err(|source| io_error(&resolved, source))
    }

    /// Appends to a file, creating it if needed.
    pub fn append(&self, path: &str, content: &[u8]) -> Result<(), WorkspaceError> {
        let resolved = self.resolve_creatable(path)?;

        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&resolved)
            .and_then(|mut file| file.write_all(content))
            .map_err(|source| io_error(&resolved, source))
    }

    /// Checks whether a path is an existing file.
    pub fn is_file(&self, path: &str) -> bool {
        self.resolve(path).is_ok_and(|resolved| resolved.is_file())
    }

    /// Checks whether a path is an existing folder.
    pub fn is_folder(&self, path: &str) -> bool {
        self.resolve(path).is_ok_and(|resolved| resolved.is_dir())
    }

    /// Creates a folder and its parents.
    pub fn make_folder(&self, path: &str) -> Result<(), WorkspaceError> {
        let resolved = self.resolve(path)?;
        std::fs::create_dir_all(&resolved).map_err(|source| io_error(&resolved, source))
    }

    /// Lists a folder, returning paths relative to the root, sorted.
    pub fn list(&self, path: &str) -> Result<Vec<String>, WorkspaceError> {
        let resolved = self.resolve(path)?;
        if !resolved.is_dir() {
            return Err(WorkspaceError::NotFound(path.into()));
        }

        let entries = std::fs::read_dir(&resolved).map_err(|source| io_error(&resolved, source))?;

        let mut result = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| io_error(&resolved, source))?;
            let entry = entry.path();

            if let Ok(relative) = entry.strip_prefix(&self.root) {
                result.push(relative.to_string_lossy().into_owned());
            }
        }

        result.sort();
        Ok(result)
    }

    /// Deletes a file.
    pub fn delete_file(&self, path: &str) -> Result<(), WorkspaceError> {
        let resolved = self.resolve(path)?;
        if !resolved.is_file() {
            return Err(WorkspaceError::NotFound(path.into()));
        }

        std::fs::remove_file(&resolved).map_err(|source| io_error(&resolved, source))
    }

    /// Deletes a folder and everything in it.
    ///
    /// The root itself cannot be deleted.
    pub fn delete_folder(&self, path: &str) -> Result<(), WorkspaceError> {
        let resolved = self.resolve(path)?;
        if resolved == self.root {
            return Err(WorkspaceError::Escape(path.into()));
        }

        if !resolved.is_dir() {
            return Err(WorkspaceError::NotFound(path.into()));
        }

        std::fs::remove_dir_all(&resolved).map_err(|source| io_error(&resolved, source))
    }

    /// Returns the path of a file relative to the root.
    pub fn relative(&self, resolved: &Path) -> String {
        resolved
            .strip_prefix(&self.root)
            .unwrap_or(resolved)
            .to_string_lossy()
            .into_owned()
    }

    fn resolve_creatable(&self, path: &str) -> Result<PathBuf, WorkspaceError> {
        let resolved = self.resolve(path)?;

        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent).map_err(|source| io_error(parent, source))?;
        }

        Ok(resolved)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> WorkspaceError {
    WorkspaceError::Io {
        path: path.to_owned(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace(name: &str) -> Workspace {
        let root = std::env::temp_dir().join(format!(
            "tether-workspace-{}-{name}",
            std::process::id()
        ));

        let _ = std::fs::remove_dir_all(&root);
        Workspace::open(&root).unwrap()
    }

    #[test]
    fn files_round_trip_inside_the_root() {
        let workspace = workspace("files");

        workspace.write("notes/a.txt", b"hello").unwrap();
        workspace.append("notes/a.txt", b", world").unwrap();
        assert_eq!(workspace.read("notes/a.txt").unwrap(), b"hello, world");

        assert!(workspace.is_file("notes/a.txt"));
        assert!(workspace.is_folder("notes"));
        assert!(!workspace.is_file("notes"));

        workspace.make_folder("notes/deep/er").unwrap();
        assert_eq!(
            workspace.list("notes").unwrap(),
            vec![String::from("notes/a.txt"), String::from("notes/deep")]
        );

        workspace.delete_file("notes/a.txt").unwrap();
        assert!(!workspace.is_file("notes/a.txt"));
        assert!(matches!(
            workspace.read("notes/a.txt"),
            Err(WorkspaceError::NotFound(_))
        ));

        workspace.delete_folder("notes").unwrap();
        assert!(!workspace.is_folder("notes"));
    }

    #[test]
    fn escapes_are_rejected() {
        let workspace = workspace("escape");

        for path in [
            "../outside.txt",
            "a/../../outside.txt",
            "missing/../../../etc/passwd",
            "/etc/passwd",
        ] {
            assert!(
                matches!(workspace.resolve(path), Err(WorkspaceError::Escape(_))),
                "{path} was not rejected"
            );
        }

        assert!(matches!(
            workspace.write("../outside.txt", b"x"),
            Err(WorkspaceError::Escape(_))
        ));
        assert!(matches!(
            workspace.delete_folder("."),
            Err(WorkspaceError::Escape(_))
        ));

        // Parent components that stay inside are fine.
        assert_eq!(
            workspace.resolve("a/../b.txt").unwrap(),
            workspace.root().join("b.txt")
        );
    }

    #[test]
    fn symlinks_out_of_the_root_are_rejected() {
        let workspace = workspace("symlink");
        let target = std::env::temp_dir();

        std::os::unix::fs::symlink(&target, workspace.root().join("link")).unwrap();
        assert!(matches!(
            workspace.resolve("link/file.txt"),
            Err(WorkspaceError::Escape(_))
        ));
    }
}
