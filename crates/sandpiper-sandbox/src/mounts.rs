//! Virtual filesystem mount table.
//!
//! A spawned guest sees the world through an ordered list of [`MountPoint`]s:
//! a pass-through view of the real workspace plus private in-memory
//! directories for scratch, home, and server data.  [`MemoryFs`] trees are
//! staged into process-private temp directories at spawn time and preopened
//! for the guest; the staging directories live exactly as long as the
//! process.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use crate::error::{Result, SandboxError};

/// Guest path the workspace pass-through is bound to.
pub const GUEST_WORKSPACE: &str = "/workspace";

/// Guest path of the scratch mount.
pub const GUEST_TMP: &str = "/tmp";

/// Guest path of the private home mount.
pub const GUEST_HOME: &str = "/home/user";

/// An exclusively-owned in-memory file tree.
///
/// Files are keyed by guest-relative path (`"share/config"`).  The tree may
/// be pre-populated before it is attached to a mount table; once a process
/// is spawned from the table the tree's contents are fixed for that process.
#[derive(Debug, Default, Clone)]
pub struct MemoryFs {
    files: BTreeMap<String, Vec<u8>>,
}

impl MemoryFs {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) a file at a guest-relative path.
    pub fn insert_file(&mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) {
        self.files.insert(path.into(), contents.into());
    }

    /// Number of files in the tree.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the tree holds no files.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Materialize the tree under `root` on the host filesystem.
    ///
    /// Paths must be relative and must not traverse upward; anything else is
    /// rejected before a single byte is written.
    pub(crate) fn stage(&self, root: &Path) -> std::io::Result<()> {
        for (rel, contents) in &self.files {
            let rel_path = Path::new(rel);
            let traversal = rel_path
                .components()
                .any(|c| !matches!(c, Component::Normal(_)));
            if rel_path.is_absolute() || traversal {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("invalid memory filesystem path: {rel}"),
                ));
            }

            let target = root.join(rel_path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(target, contents)?;
        }
        Ok(())
    }
}

/// A single binding of a guest-visible path to a filesystem backing.
#[derive(Debug, Clone)]
pub enum MountPoint {
    /// Pass-through of the real workspace directory at [`GUEST_WORKSPACE`].
    Workspace {
        /// Host directory the workspace lives in.
        host_dir: PathBuf,
    },

    /// A private in-memory tree bound to a fixed guest path.
    Memory {
        /// The tree staged for the guest at spawn time.
        fs: MemoryFs,
        /// Absolute guest path the tree is mounted at.
        guest_path: String,
    },

    /// An arbitrary host directory bound to a guest path.
    Host {
        /// Host directory to expose.
        host_dir: PathBuf,
        /// Absolute guest path the directory is mounted at.
        guest_path: String,
    },
}

impl MountPoint {
    /// The guest path this mount is bound to.
    pub fn guest_path(&self) -> &str {
        match self {
            Self::Workspace { .. } => GUEST_WORKSPACE,
            Self::Memory { guest_path, .. } | Self::Host { guest_path, .. } => guest_path,
        }
    }
}

/// An ordered list of mount points with unique guest paths.
///
/// Order matters: the workspace pass-through, if present, comes first and may
/// be shadowed by later exact-path mounts.  Construction is deterministic --
/// the same inputs always produce the same order and guest-path bindings.
#[derive(Debug, Default, Clone)]
pub struct MountTable {
    mounts: Vec<MountPoint>,
}

impl MountTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a mount point, rejecting duplicate guest paths.
    pub fn push(&mut self, mount: MountPoint) -> Result<()> {
        let guest_path = mount.guest_path();
        if self.mounts.iter().any(|m| m.guest_path() == guest_path) {
            return Err(SandboxError::Creation(format!(
                "duplicate guest mount path: {guest_path}"
            )));
        }
        self.mounts.push(mount);
        Ok(())
    }

    /// The mount points in evaluation order.
    pub fn mounts(&self) -> &[MountPoint] {
        &self.mounts
    }

    /// Build the standard table for hosting a language server.
    ///
    /// Produces, in order: the workspace pass-through, a scratch mount at
    /// [`GUEST_TMP`] (when `include_temp_mount` is set), an empty home tree
    /// at [`GUEST_HOME`], and `data_fs` at `data_guest_path`.  Seeding
    /// `data_fs` with static assets is the caller's concern; the table only
    /// attaches the handle.
    pub fn for_server(
        workspace_dir: &Path,
        data_guest_path: &str,
        data_fs: MemoryFs,
        include_temp_mount: bool,
    ) -> Result<Self> {
        let mut table = Self::new();
        table.push(MountPoint::Workspace {
            host_dir: workspace_dir.to_path_buf(),
        })?;
        if include_temp_mount {
            table.push(MountPoint::Memory {
                fs: MemoryFs::new(),
                guest_path: GUEST_TMP.to_owned(),
            })?;
        }
        table.push(MountPoint::Memory {
            fs: MemoryFs::new(),
            guest_path: GUEST_HOME.to_owned(),
        })?;
        table.push(MountPoint::Memory {
            fs: data_fs,
            guest_path: data_guest_path.to_owned(),
        })?;
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_fs_insert_and_len() {
        let mut fs = MemoryFs::new();
        assert!(fs.is_empty());
        fs.insert_file("lib/prim.txt", b"prim".to_vec());
        fs.insert_file("lib/prim.txt", b"prim2".to_vec());
        assert_eq!(fs.len(), 1);
    }

    #[test]
    fn stage_writes_nested_files() {
        let tmp = tempfile::tempdir().expect("tempdir creation must succeed in tests");
        let mut fs = MemoryFs::new();
        fs.insert_file("share/lib/base.txt", b"base".to_vec());
        fs.insert_file("top.txt", b"top".to_vec());

        fs.stage(tmp.path()).expect("staging must succeed");

        let nested = std::fs::read(tmp.path().join("share/lib/base.txt")).expect("read");
        assert_eq!(nested, b"base");
        let top = std::fs::read(tmp.path().join("top.txt")).expect("read");
        assert_eq!(top, b"top");
    }

    #[test]
    fn stage_rejects_traversal() {
        let tmp = tempfile::tempdir().expect("tempdir creation must succeed in tests");
        let mut fs = MemoryFs::new();
        fs.insert_file("../escape.txt", b"x".to_vec());
        assert!(fs.stage(tmp.path()).is_err());
    }

    #[test]
    fn stage_rejects_absolute_paths() {
        let tmp = tempfile::tempdir().expect("tempdir creation must succeed in tests");
        let mut fs = MemoryFs::new();
        fs.insert_file("/etc/passwd", b"x".to_vec());
        assert!(fs.stage(tmp.path()).is_err());
    }

    #[test]
    fn for_server_order_is_deterministic() {
        let table = MountTable::for_server(
            Path::new("/srv/project"),
            "/opt/sandpiper",
            MemoryFs::new(),
            true,
        )
        .expect("table construction must succeed");

        let paths: Vec<&str> = table.mounts().iter().map(MountPoint::guest_path).collect();
        assert_eq!(
            paths,
            vec![GUEST_WORKSPACE, GUEST_TMP, GUEST_HOME, "/opt/sandpiper"]
        );

        // Same inputs, same bindings.
        let again = MountTable::for_server(
            Path::new("/srv/project"),
            "/opt/sandpiper",
            MemoryFs::new(),
            true,
        )
        .expect("table construction must succeed");
        let again_paths: Vec<&str> =
            again.mounts().iter().map(MountPoint::guest_path).collect();
        assert_eq!(paths, again_paths);
    }

    #[test]
    fn for_server_without_temp_mount() {
        let table = MountTable::for_server(
            Path::new("/srv/project"),
            "/opt/sandpiper",
            MemoryFs::new(),
            false,
        )
        .expect("table construction must succeed");

        let paths: Vec<&str> = table.mounts().iter().map(MountPoint::guest_path).collect();
        assert_eq!(paths, vec![GUEST_WORKSPACE, GUEST_HOME, "/opt/sandpiper"]);
    }

    #[test]
    fn duplicate_guest_path_rejected() {
        let result = MountTable::for_server(
            Path::new("/srv/project"),
            GUEST_HOME,
            MemoryFs::new(),
            true,
        );
        assert!(matches!(result, Err(SandboxError::Creation(_))));
    }

    #[test]
    fn workspace_is_evaluated_first() {
        let table = MountTable::for_server(
            Path::new("/srv/project"),
            "/opt/sandpiper",
            MemoryFs::new(),
            true,
        )
        .expect("table construction must succeed");
        assert!(matches!(
            table.mounts()[0],
            MountPoint::Workspace { .. }
        ));
    }
}
