use std::path::PathBuf;

use nix::errno::Errno;

#[derive(Debug, thiserror::Error)]
pub enum PoofError {
    #[error("cgroup setup failed: {0}")]
    SetupCgroup(String),

    #[error("resource limits requested but cgroups v2 is not available (no /sys/fs/cgroup/cgroup.controllers)")]
    CgroupsUnavailable,

    #[error("failed to create temp directory {}: {}", .path.display(), .source)]
    MakeTempDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unshare denied: {0}\nhint: inside Docker, try --security-opt seccomp=unconfined; on the host, check kernel.unprivileged_userns_clone")]
    UnshareDenied(Errno),

    #[error("failed to write {path}: {source}")]
    UidMap {
        path: &'static str,
        source: std::io::Error,
    },

    #[error("overlay mount denied: {0}\nhint: run as root, or install fuse-overlayfs for the unprivileged path")]
    OverlayMountDenied(Errno),

    #[error("overlay mount rejected: the host root is already an overlay and the kernel supports at most 2 stacked levels")]
    OverlayStackingLimit,

    #[error("fuse-overlayfs not found at {}\nhint: install the fuse-overlayfs package", .0.display())]
    FuseNotInstalled(PathBuf),

    #[error("fuse-overlayfs exited during startup with code {0}")]
    FuseStartupFailed(i32),

    #[error("fuse-overlayfs started but the merged directory never materialized")]
    FuseVerifyFailed,

    #[error("mount {what} failed: {errno}")]
    MountFailed { what: String, errno: Errno },

    #[error("root transition failed ({what}): {errno}")]
    PivotOrChrootFailed { what: &'static str, errno: Errno },

    #[error("failed to execute {0}: {1}")]
    ExecFailed(String, Errno),

    #[error("command timed out after {0} seconds")]
    Timeout(u64),

    #[error("{0}")]
    InvalidMode(String),

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PoofError>;
