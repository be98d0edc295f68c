//! # net_cls CGroup Controller
//!
//! Manages `net_cls` cgroups for processing units launched outside a
//! container runtime: creates groups, assigns class ids and moves pids
//! in and out. The class id mark is what ties a process's traffic to
//! the iptables rules the supervisor installs for it.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

/// Default mount point of the `net_cls` hierarchy.
pub const BASE_PATH: &str = "/sys/fs/cgroup/net_cls/";

/// File holding a group's class id.
const MARK_FILE: &str = "net_cls.classid";

/// File holding a group's member pids.
const PROCS_FILE: &str = "cgroup.procs";

/// Errors from cgroup operations.
#[derive(Debug, Error)]
pub enum CgroupError {
    /// The named cgroup does not exist.
    #[error("Cgroup {0} does not exist")]
    NotFound(String),

    /// Mounting the net_cls hierarchy failed.
    #[error("Cannot mount net_cls hierarchy: {0}")]
    MountFailed(String),

    /// A filesystem operation failed.
    #[error("Cgroup io failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Controller over one `net_cls` hierarchy.
///
/// All writes are idempotent: re-creating an existing group, re-writing
/// an identical mark or re-adding a member pid succeed.
pub struct CgroupNetCls {
    base_path: PathBuf,
}

impl CgroupNetCls {
    /// Controller over the system hierarchy at [`BASE_PATH`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            base_path: PathBuf::from(BASE_PATH),
        }
    }

    /// Controller over an alternate hierarchy root. Tests point this at
    /// a scratch directory.
    #[must_use]
    pub fn with_base_path(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Create the cgroup directory, mounting the hierarchy first if the
    /// base path is not present.
    pub fn create_group(&self, name: &str) -> Result<(), CgroupError> {
        if !self.base_path.is_dir() {
            fs::create_dir_all(&self.base_path)?;
            nix::mount::mount(
                Some("cgroup"),
                &self.base_path,
                Some("cgroup"),
                nix::mount::MsFlags::empty(),
                Some("net_cls"),
            )
            .map_err(|e| CgroupError::MountFailed(e.to_string()))?;
        }
        fs::create_dir_all(self.group_path(name))?;
        debug!(group = name, "Created net_cls cgroup");
        Ok(())
    }

    /// Write the class id for a group, in hexadecimal with the `0x`
    /// prefix as the kernel tooling expects.
    pub fn assign_mark(&self, name: &str, mark: u64) -> Result<(), CgroupError> {
        let group = self.existing_group(name)?;
        fs::write(group.join(MARK_FILE), format!("{mark:#x}"))?;
        debug!(group = name, mark = format!("{mark:#x}"), "Assigned class id");
        Ok(())
    }

    /// Move a process into the group.
    pub fn add_process(&self, name: &str, pid: i32) -> Result<(), CgroupError> {
        let group = self.existing_group(name)?;
        write_pid(&group.join(PROCS_FILE), pid)?;
        Ok(())
    }

    /// Move a process back to the hierarchy root, removing it from its
    /// group.
    pub fn remove_process(&self, name: &str, pid: i32) -> Result<(), CgroupError> {
        self.existing_group(name)?;
        write_pid(&self.base_path.join(PROCS_FILE), pid)?;
        Ok(())
    }

    /// Remove the cgroup directory. Member processes must have been
    /// moved out first.
    pub fn delete_cgroup(&self, name: &str) -> Result<(), CgroupError> {
        let group = self.existing_group(name)?;
        if let Err(e) = fs::remove_dir(&group) {
            warn!(group = name, error = %e, "Failed to remove cgroup directory");
            return Err(e.into());
        }
        Ok(())
    }

    fn group_path(&self, name: &str) -> PathBuf {
        self.base_path.join(name)
    }

    fn existing_group(&self, name: &str) -> Result<PathBuf, CgroupError> {
        let path = self.group_path(name);
        if !path.is_dir() {
            return Err(CgroupError::NotFound(name.to_string()));
        }
        Ok(path)
    }
}

impl Default for CgroupNetCls {
    fn default() -> Self {
        Self::new()
    }
}

// Decimal ASCII with a trailing newline, the form standard cgroup
// tooling writes.
fn write_pid(path: &Path, pid: i32) -> Result<(), CgroupError> {
    let mut file = fs::OpenOptions::new().write(true).create(true).open(path)?;
    writeln!(file, "{pid}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> (tempfile::TempDir, CgroupNetCls) {
        let dir = tempfile::tempdir().unwrap();
        let ctl = CgroupNetCls::with_base_path(dir.path());
        (dir, ctl)
    }

    #[test]
    fn test_create_group_is_idempotent() {
        let (_dir, ctl) = controller();
        ctl.create_group("svcA").unwrap();
        ctl.create_group("svcA").unwrap();
    }

    #[test]
    fn test_assign_mark_writes_hex() {
        let (dir, ctl) = controller();
        ctl.create_group("svcA").unwrap();
        ctl.assign_mark("svcA", 0x3e8).unwrap();
        let written = fs::read_to_string(dir.path().join("svcA").join("net_cls.classid")).unwrap();
        assert_eq!(written, "0x3e8");
    }

    #[test]
    fn test_add_process_writes_decimal_pid() {
        let (dir, ctl) = controller();
        ctl.create_group("svcA").unwrap();
        ctl.add_process("svcA", 1234).unwrap();
        let written = fs::read_to_string(dir.path().join("svcA").join("cgroup.procs")).unwrap();
        assert_eq!(written, "1234\n");
    }

    #[test]
    fn test_remove_process_writes_to_root() {
        let (dir, ctl) = controller();
        ctl.create_group("svcA").unwrap();
        ctl.remove_process("svcA", 1234).unwrap();
        let written = fs::read_to_string(dir.path().join("cgroup.procs")).unwrap();
        assert_eq!(written, "1234\n");
    }

    #[test]
    fn test_missing_group_is_not_found() {
        let (_dir, ctl) = controller();
        assert!(matches!(
            ctl.assign_mark("nope", 1),
            Err(CgroupError::NotFound(_))
        ));
        assert!(matches!(
            ctl.add_process("nope", 1),
            Err(CgroupError::NotFound(_))
        ));
        assert!(matches!(
            ctl.delete_cgroup("nope"),
            Err(CgroupError::NotFound(_))
        ));
    }

    #[test]
    fn test_delete_cgroup() {
        let (dir, ctl) = controller();
        ctl.create_group("svcA").unwrap();
        ctl.delete_cgroup("svcA").unwrap();
        assert!(!dir.path().join("svcA").exists());
    }
}
