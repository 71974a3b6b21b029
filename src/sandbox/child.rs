//! Child-side entry point: namespace negotiation and exec.
//!
//! Architecture (double fork for the PID namespace):
//!
//! ```text
//! Supervisor
//!  └─ fork() ──> Child:
//!                  prctl(PR_SET_PDEATHSIG, SIGKILL)
//!                  unshare(NEWNS | NEWPID | NEWUTS | NEWIPC [| NEWUSER])
//!                  write uid/gid maps when a user namespace is in play
//!                  fork() ──> Inner child (PID 1 in the new PID namespace):
//!                               overlay bring-up (mounts, /dev, pivot/chroot)
//!                               IS_SANDBOX=1, execvp(command)
//!                  waitpid(inner) -> forward exit status
//! ```
//!
//! `unshare(CLONE_NEWPID)` only moves *children* into the new namespace,
//! so the next fork has to become PID 1. The intermediate process is a
//! pure waiter and status forwarder.

use std::ffi::CString;

use nix::errno::Errno;
use nix::sched::{unshare, CloneFlags};
use nix::sys::prctl::set_pdeathsig;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execvp, fork, getgid, getuid, ForkResult, Pid};

use crate::config::Config;
use crate::error::{PoofError, Result};
use crate::paths::OverlayPlan;
use crate::sandbox::{overlay, Backend};

/// Run the sandboxed command. Never returns; all failures are reported on
/// stderr and end in exit 1 (the supervisor reads the wait status). Errors
/// after pivot_root cannot travel any other way.
pub fn run(config: &Config, plan: &OverlayPlan) -> ! {
    let code = match setup_and_exec(config, plan) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("poof: {}", e);
            1
        }
    };
    // _exit: this is a forked child sharing the parent's stdio buffers.
    unsafe { libc::_exit(code) }
}

fn setup_and_exec(config: &Config, plan: &OverlayPlan) -> Result<i32> {
    // Parent death must not leave an orphaned sandbox behind.
    let _ = set_pdeathsig(Signal::SIGKILL);

    let uid = getuid();
    let gid = getgid();

    let base_flags = CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWIPC;

    // Root keeps the kernel overlay; everyone else needs a user namespace
    // to unshare at all. Root inside a container may lack CAP_SYS_ADMIN
    // too, so EPERM triggers one retry with NEWUSER added.
    let mut using_user_ns = !uid.is_root();
    let flags = if using_user_ns {
        base_flags | CloneFlags::CLONE_NEWUSER
    } else {
        base_flags
    };

    match unshare(flags) {
        Ok(()) => {}
        Err(Errno::EPERM) if !using_user_ns => {
            unshare(base_flags | CloneFlags::CLONE_NEWUSER)
                .map_err(PoofError::UnshareDenied)?;
            using_user_ns = true;
        }
        Err(errno) => return Err(PoofError::UnshareDenied(errno)),
    }

    if using_user_ns {
        write_id_maps(uid.as_raw(), gid.as_raw())?;
    }

    let backend = if using_user_ns {
        Backend::FuseOverlay
    } else {
        Backend::KernelOverlay
    };

    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            // Intermediate process: wait and forward.
            let code = wait_for_raw_status(child).unwrap_or(1);
            unsafe { libc::_exit(code) }
        }
        Ok(ForkResult::Child) => {}
        Err(_) => unsafe { libc::_exit(1) },
    }

    // PID 1 of the new namespace from here on. PDEATHSIG is cleared by
    // fork, so arm it again.
    let _ = set_pdeathsig(Signal::SIGKILL);

    // The helper handle (FUSE path) stays alive until exec; after exec the
    // helper is a child of the target program and dies with the namespace.
    let _helper = overlay::bring_up(config, plan, backend)?;

    std::env::set_var("IS_SANDBOX", "1");

    let program = &config.command[0];
    let c_program = CString::new(program.as_str())
        .map_err(|_| PoofError::ExecFailed(program.clone(), Errno::EINVAL))?;
    let mut c_args = Vec::with_capacity(config.command.len());
    for arg in &config.command {
        c_args.push(
            CString::new(arg.as_str())
                .map_err(|_| PoofError::ExecFailed(program.clone(), Errno::EINVAL))?,
        );
    }

    match execvp(&c_program, &c_args) {
        Ok(infallible) => match infallible {},
        Err(errno) => {
            eprintln!("poof: failed to execute {}: {}", program, errno);
            Ok(127)
        }
    }
}

/// Map the invoking uid/gid onto root inside the namespace. setgroups must
/// be denied between the two map writes; an unprivileged process cannot
/// write gid_map otherwise.
fn write_id_maps(uid: u32, gid: u32) -> Result<()> {
    std::fs::write("/proc/self/uid_map", format!("0 {} 1\n", uid)).map_err(|source| {
        PoofError::UidMap {
            path: "/proc/self/uid_map",
            source,
        }
    })?;
    std::fs::write("/proc/self/setgroups", "deny").map_err(|source| PoofError::UidMap {
        path: "/proc/self/setgroups",
        source,
    })?;
    std::fs::write("/proc/self/gid_map", format!("0 {} 1\n", gid)).map_err(|source| {
        PoofError::UidMap {
            path: "/proc/self/gid_map",
            source,
        }
    })?;
    Ok(())
}

/// Wait for the inner child and fold its status into an exit code.
fn wait_for_raw_status(pid: Pid) -> std::result::Result<i32, ()> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code & 0xff),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(128 + sig as i32),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(_) => return Err(()),
        }
    }
}
