//! Parent-side supervision: fork, signals, timeout, cleanup.
//!
//! Ordering contract: the cgroup is created and joined before the fork so
//! the child inherits membership; cleanup slots and signal handlers are in
//! place before the fork so every exit path (normal, signaled, timed out)
//! converges on the same teardown. After the wait: cgroup teardown, then
//! the interactive review (which may decide the upper must survive), then
//! directory cleanup.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{
    kill, raise, sigaction, signal, sigprocmask, SaFlags, SigAction, SigHandler, SigSet,
    SigmaskHow, Signal,
};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getpgrp, tcsetpgrp, ForkResult, Pid};
use tracing::{debug, warn};

use crate::cgroup::{self, CgroupHandle};
use crate::config::Config;
use crate::error::Result;
use crate::paths::{self, OverlayPlan};
use crate::review::{self, ReviewOutcome};
use crate::sandbox::child;

/// Exit code for a command killed by the timeout (matches timeout(1)).
const TIMEOUT_EXIT_CODE: i32 = 124;

/// Poll interval of the timeout wait loop.
const WAIT_POLL: Duration = Duration::from_millis(10);

/// Everything the cleanup pass may have to undo.
///
/// Populated once before the fork; the signal handler and the normal exit
/// path both drain it, whichever runs first. This is the only process-wide
/// state in the crate: a C signal handler cannot reach anything scoped.
#[derive(Debug, Default)]
struct CleanupSlots {
    temp_base: Option<PathBuf>,
    work_dir: Option<PathBuf>,
    merged_dir: Option<PathBuf>,
    cgroup: Option<CgroupHandle>,
}

static SLOTS: Mutex<Option<CleanupSlots>> = Mutex::new(None);
static CHILD_PID: AtomicI32 = AtomicI32::new(0);

/// Run the configured command in the sandbox and return its exit code.
pub fn run(config: &Config) -> Result<i32> {
    // Before fork, in this order: cgroup membership, cleanup slots,
    // signal handlers.
    let cgroup = cgroup::setup(config)?;
    let plan = match paths::plan(config) {
        Ok(plan) => plan,
        Err(e) => {
            if let Some(handle) = &cgroup {
                cgroup::teardown(handle);
            }
            return Err(e);
        }
    };
    populate_slots(&plan, cgroup);
    install_forwarding_handlers();

    let child_pid = match unsafe { fork() } {
        Ok(ForkResult::Child) => child::run(config, &plan),
        Ok(ForkResult::Parent { child }) => child,
        Err(errno) => {
            run_cleanup();
            return Err(std::io::Error::from_raw_os_error(errno as i32).into());
        }
    };
    CHILD_PID.store(child_pid.as_raw(), Ordering::SeqCst);

    let exit_code = wait_for_child(child_pid, config.timeout);
    CHILD_PID.store(0, Ordering::SeqCst);
    debug!("child exited with code {}", exit_code);

    // Cgroup teardown happens first so a long review cannot hold the
    // group open.
    teardown_cgroup_slot();

    if let Some(target) = &config.interactive_target {
        reclaim_terminal();
        match review::run(config, &plan, target) {
            Ok(ReviewOutcome::Discarded) => preserve_upper(),
            Ok(_) => {}
            Err(e) => warn!("review failed: {}", e),
        }
    }

    run_cleanup();
    Ok(exit_code)
}

fn populate_slots(plan: &OverlayPlan, cgroup: Option<CgroupHandle>) {
    let slots = CleanupSlots {
        temp_base: plan.temp_base.clone(),
        // Temp-based runs hold work/merged inside temp_base; persistent
        // runs need the siblings removed individually (never the upper).
        work_dir: plan.temp_base.is_none().then(|| plan.work.clone()),
        merged_dir: plan.temp_base.is_none().then(|| plan.merged.clone()),
        cgroup,
    };
    if let Ok(mut guard) = SLOTS.lock() {
        *guard = Some(slots);
    }
}

fn teardown_cgroup_slot() {
    if let Ok(mut guard) = SLOTS.lock() {
        if let Some(slots) = guard.as_mut() {
            if let Some(handle) = slots.cgroup.take() {
                cgroup::teardown(&handle);
            }
        }
    }
}

/// Interactive decline: the upper tree outlives the run, so drop the temp
/// slots before the cleanup pass sees them.
fn preserve_upper() {
    if let Ok(mut guard) = SLOTS.lock() {
        if let Some(slots) = guard.as_mut() {
            slots.temp_base = None;
            slots.work_dir = None;
            slots.merged_dir = None;
        }
    }
}

/// Drain the slots. Idempotent; failures are silent (leaked `poof-<hex>`
/// temp dirs are recoverable out of band).
fn run_cleanup() {
    let slots = match SLOTS.try_lock() {
        Ok(mut guard) => guard.take(),
        Err(_) => return,
    };
    let Some(slots) = slots else { return };
    if let Some(handle) = &slots.cgroup {
        cgroup::teardown(handle);
    }
    for dir in [&slots.temp_base, &slots.work_dir, &slots.merged_dir]
        .into_iter()
        .flatten()
    {
        let _ = std::fs::remove_dir_all(dir);
    }
}

fn install_forwarding_handlers() {
    let action = SigAction::new(
        SigHandler::Handler(forward_and_die),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
        if let Err(e) = unsafe { sigaction(sig, &action) } {
            warn!("failed to install {} handler: {}", sig, e);
        }
    }
}

/// Forward the signal to the child, wait it out, clean up, then die of the
/// same signal with its default disposition.
extern "C" fn forward_and_die(signum: libc::c_int) {
    let Ok(sig) = Signal::try_from(signum) else {
        return;
    };
    let pid = CHILD_PID.load(Ordering::SeqCst);
    if pid > 0 {
        let child = Pid::from_raw(pid);
        let _ = kill(child, sig);
        while let Err(Errno::EINTR) = waitpid(child, None) {}
    }
    run_cleanup();
    unsafe {
        let _ = signal(sig, SigHandler::SigDfl);
    }
    let _ = raise(sig);
}

/// Wait for the child, enforcing the timeout when one is set.
fn wait_for_child(child: Pid, timeout: Option<u64>) -> i32 {
    let Some(secs) = timeout else {
        loop {
            match waitpid(child, None) {
                Ok(status) => {
                    if let Some(code) = translate_status(status) {
                        return code;
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(_) => return 1,
            }
        }
    };

    let deadline = Instant::now() + Duration::from_secs(secs);
    loop {
        match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if Instant::now() >= deadline {
                    warn!("timeout after {}s, killing child", secs);
                    let _ = kill(child, Signal::SIGKILL);
                    while let Err(Errno::EINTR) = waitpid(child, None) {}
                    return TIMEOUT_EXIT_CODE;
                }
                std::thread::sleep(WAIT_POLL);
            }
            Ok(status) => {
                if let Some(code) = translate_status(status) {
                    return code;
                }
            }
            Err(Errno::EINTR) => continue,
            Err(_) => return 1,
        }
    }
}

/// Normal exit propagates the code, a fatal signal maps to 128+N, anything
/// else (stop/continue events) keeps waiting.
fn translate_status(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code & 0xff),
        WaitStatus::Signaled(_, sig, _) => Some(128 + sig as i32),
        _ => None,
    }
}

/// Take the controlling terminal back before prompting. The child shell
/// ran as the foreground process group; without this, reading stdin stops
/// us with SIGTTIN.
fn reclaim_terminal() {
    use std::io::IsTerminal;

    let stdin = std::io::stdin();
    if !stdin.is_terminal() {
        return;
    }
    let mut block = SigSet::empty();
    block.add(Signal::SIGTTOU);
    block.add(Signal::SIGTTIN);
    let mut previous = SigSet::empty();
    let _ = sigprocmask(SigmaskHow::SIG_BLOCK, Some(&block), Some(&mut previous));
    let _ = tcsetpgrp(&stdin, getpgrp());
    let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&previous), None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_exit_code() {
        assert_eq!(
            translate_status(WaitStatus::Exited(Pid::from_raw(1), 42)),
            Some(42)
        );
        assert_eq!(
            translate_status(WaitStatus::Exited(Pid::from_raw(1), 0)),
            Some(0)
        );
    }

    #[test]
    fn test_translate_signal_is_128_plus() {
        assert_eq!(
            translate_status(WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGKILL, false)),
            Some(128 + 9)
        );
        assert_eq!(
            translate_status(WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGTERM, false)),
            Some(128 + 15)
        );
    }

    #[test]
    fn test_translate_stop_keeps_waiting() {
        assert_eq!(
            translate_status(WaitStatus::Stopped(Pid::from_raw(1), Signal::SIGSTOP)),
            None
        );
    }
}
