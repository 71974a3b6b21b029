//! Overlay bring-up inside the child's namespaces.
//!
//! Runs after unshare (and uid/gid mapping, when applicable), as PID 1 of
//! the new PID namespace. The ordering here is load-bearing: the mount tree
//! must be private before the overlay mount, /dev must be populated before
//! the root transition (overlay cannot synthesize character devices), and
//! /proc can only be remounted once the new root is in place.

use std::os::unix::fs::symlink;
use std::path::Path;
use std::process::Child;

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd::{chdir, chroot, pivot_root};
use tracing::debug;

use crate::config::{Config, Mode};
use crate::error::{PoofError, Result};
use crate::paths::OverlayPlan;
use crate::sandbox::{fuse, host_root_is_overlay, Backend};

/// Character devices bind-mounted from the host into the minimal /dev.
/// Disk and memory devices are deliberately absent.
const DEV_NODES: &[&str] = &["null", "zero", "full", "random", "urandom", "tty"];

/// Mount the overlay, build /dev, and move the process root into the
/// merged view. Returns the fuse-overlayfs handle on the FUSE path so the
/// caller keeps it alive until exec.
pub fn bring_up(config: &Config, plan: &OverlayPlan, backend: Backend) -> Result<Option<Child>> {
    let host_overlay = host_root_is_overlay();
    if host_overlay && config.mode == Mode::Persistent {
        return Err(PoofError::InvalidMode(
            "the host root is itself an overlay; a persistent upper cannot be layered on it \
             (use exec instead)"
                .to_string(),
        ));
    }

    // Ephemeral runs write to RAM only: tmpfs over the temp base keeps the
    // upper off the host disk entirely.
    if plan.is_tmpfs_base {
        if let Some(base) = &plan.temp_base {
            mount(
                Some("tmpfs"),
                base,
                Some("tmpfs"),
                MsFlags::empty(),
                None::<&str>,
            )
            .map_err(|errno| PoofError::MountFailed {
                what: format!("tmpfs on {}", base.display()),
                errno,
            })?;
        }
    }

    for dir in [&plan.upper, &plan.work, &plan.merged] {
        std::fs::create_dir_all(dir)?;
    }

    // Stop mount events propagating back to the host before anything is
    // mounted in this namespace.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|errno| PoofError::MountFailed {
        what: "private propagation on /".to_string(),
        errno,
    })?;

    let helper = match backend {
        Backend::KernelOverlay => {
            mount_kernel_overlay(plan, host_overlay)?;
            None
        }
        Backend::FuseOverlay => Some(fuse::spawn(config, plan)?),
    };

    // Must precede pivot/chroot: the bind sources live in the host /dev.
    setup_dev(&plan.merged);

    match backend {
        Backend::KernelOverlay => enter_root_pivot(&plan.merged, &config.cwd)?,
        Backend::FuseOverlay => enter_root_chroot(&plan.merged, &config.cwd)?,
    }

    // Fresh procfs for the new PID namespace; without it the command sees
    // the host's process list.
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|errno| PoofError::MountFailed {
        what: "proc on /proc".to_string(),
        errno,
    })?;

    // Writable /tmp no matter what the host mounts there.
    mount(
        Some("tmpfs"),
        "/tmp",
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None::<&str>,
    )
    .map_err(|errno| PoofError::MountFailed {
        what: "tmpfs on /tmp".to_string(),
        errno,
    })?;

    if backend == Backend::FuseOverlay {
        // squash_to_root drops these; shells expect them.
        link_dev_fds();
    }

    Ok(helper)
}

fn mount_kernel_overlay(plan: &OverlayPlan, host_overlay: bool) -> Result<()> {
    let data = format!(
        "lowerdir=/,upperdir={},workdir={}",
        plan.upper.display(),
        plan.work.display()
    );
    mount(
        Some("overlay"),
        &plan.merged,
        Some("overlay"),
        MsFlags::empty(),
        Some(data.as_str()),
    )
    .map_err(|errno| match errno {
        nix::errno::Errno::EINVAL if host_overlay => PoofError::OverlayStackingLimit,
        nix::errno::Errno::EPERM => PoofError::OverlayMountDenied(errno),
        _ => PoofError::MountFailed {
            what: format!("overlay on {}", plan.merged.display()),
            errno,
        },
    })
}

/// pivot_root into the merged view and detach the old root.
fn enter_root_pivot(merged: &Path, cwd: &Path) -> Result<()> {
    let old_root = merged.join(".oldroot");
    std::fs::create_dir_all(&old_root)?;

    pivot_root(merged, &old_root).map_err(|errno| PoofError::PivotOrChrootFailed {
        what: "pivot_root",
        errno,
    })?;

    if chdir(cwd).is_err() {
        let _ = chdir("/");
    }

    let _ = umount2("/.oldroot", MntFlags::MNT_DETACH);
    let _ = std::fs::remove_dir("/.oldroot");
    Ok(())
}

/// chroot variant for the FUSE backend: pivot_root cannot detach a root
/// that the helper process still serves from outside.
fn enter_root_chroot(merged: &Path, cwd: &Path) -> Result<()> {
    chroot(merged).map_err(|errno| PoofError::PivotOrChrootFailed {
        what: "chroot",
        errno,
    })?;
    if chdir(cwd).is_err() {
        let _ = chdir("/");
    }
    Ok(())
}

/// Build a minimal /dev inside the merged tree.
///
/// The overlay cannot carry the host's device nodes (character devices in
/// the upper would read as whiteouts), so a small tmpfs is populated with
/// bind mounts of the handful of devices programs actually need. Every
/// step is best-effort: a sandbox with a partial /dev beats no sandbox.
fn setup_dev(merged: &Path) {
    let dev = merged.join("dev");
    if let Err(e) = std::fs::create_dir_all(&dev) {
        debug!("skipping /dev setup: {}", e);
        return;
    }
    if let Err(e) = mount(
        Some("tmpfs"),
        &dev,
        Some("tmpfs"),
        MsFlags::empty(),
        Some("mode=755,size=64k"),
    ) {
        debug!("tmpfs on {} failed: {}", dev.display(), e);
        return;
    }

    for sub in ["pts", "shm"] {
        if let Err(e) = std::fs::create_dir(dev.join(sub)) {
            debug!("mkdir /dev/{} failed: {}", sub, e);
        }
    }

    for name in DEV_NODES {
        let host = Path::new("/dev").join(name);
        let node = dev.join(name);
        if !host.exists() {
            continue;
        }
        if let Err(e) = std::fs::write(&node, b"") {
            debug!("touch {} failed: {}", node.display(), e);
            continue;
        }
        if let Err(e) = mount(
            Some(&host),
            &node,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        ) {
            debug!("bind {} failed: {}", node.display(), e);
        }
    }

    if let Err(e) = mount(
        Some("devpts"),
        &dev.join("pts"),
        Some("devpts"),
        MsFlags::empty(),
        Some("newinstance,ptmxmode=0666"),
    ) {
        debug!("devpts mount failed: {}", e);
    }
    if let Err(e) = symlink("pts/ptmx", dev.join("ptmx")) {
        debug!("ptmx symlink failed: {}", e);
    }
}

/// /dev/fd and friends, created after chroot on the FUSE path.
fn link_dev_fds() {
    for (target, link) in [
        ("/proc/self/fd", "/dev/fd"),
        ("/proc/self/fd/0", "/dev/stdin"),
        ("/proc/self/fd/1", "/dev/stdout"),
        ("/proc/self/fd/2", "/dev/stderr"),
    ] {
        if let Err(e) = symlink(target, link) {
            debug!("symlink {} failed: {}", link, e);
        }
    }
}
