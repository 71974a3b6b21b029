//! fuse-overlayfs helper process management.
//!
//! The unprivileged path cannot ask the kernel for an overlay mount, so a
//! `fuse-overlayfs` helper provides one from userspace. It runs in
//! foreground mode (`-f`) to stay alive for the lifetime of the sandbox;
//! being forked after the PID namespace exists, it dies with the namespace.

use std::process::{Child, Command, Stdio};
use std::time::Duration;

use tracing::debug;

use crate::config::Config;
use crate::error::{PoofError, Result};
use crate::paths::OverlayPlan;

/// Grace period before checking whether the helper survived startup.
const STARTUP_GRACE: Duration = Duration::from_millis(100);

/// Launch fuse-overlayfs over the plan's directories and verify the merged
/// mount materialized. The returned handle must be kept alive until exec.
pub fn spawn(config: &Config, plan: &OverlayPlan) -> Result<Child> {
    let opts = format!(
        "lowerdir=/,upperdir={},workdir={},squash_to_root",
        plan.upper.display(),
        plan.work.display()
    );

    let mut helper = Command::new(&config.fuse_overlayfs)
        .arg("-f")
        .arg("-o")
        .arg(&opts)
        .arg(&plan.merged)
        .stdin(Stdio::null())
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PoofError::FuseNotInstalled(config.fuse_overlayfs.clone())
            } else {
                PoofError::IoError(e)
            }
        })?;

    debug!("fuse-overlayfs started as pid {}", helper.id());

    // The helper reports option and permission errors by exiting almost
    // immediately; give it a moment, then look.
    std::thread::sleep(STARTUP_GRACE);
    if let Some(status) = helper.try_wait()? {
        let code = status.code().unwrap_or(1);
        if code == 127 {
            return Err(PoofError::FuseNotInstalled(config.fuse_overlayfs.clone()));
        }
        return Err(PoofError::FuseStartupFailed(code));
    }

    // Still running; the mount is good iff the merged view shows the host
    // root. An empty directory means the mount never happened.
    let mut entries = std::fs::read_dir(&plan.merged)?;
    if entries.next().is_none() {
        let _ = helper.kill();
        let _ = helper.wait();
        return Err(PoofError::FuseVerifyFailed);
    }

    Ok(helper)
}
