//! Cgroups v2 resource limits.
//!
//! The supervisor enrolls itself in a fresh `poof-<hex>` group before
//! forking so the sandbox child inherits membership; on exit it moves
//! itself back and removes the group. Teardown is best-effort and
//! idempotent because the signal handler may race the normal exit path.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{PoofError, Result};

const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Paths the cleanup pass needs to undo the enrollment.
#[derive(Debug, Clone)]
pub struct CgroupHandle {
    /// The created `/sys/fs/cgroup/poof-<hex>` directory.
    pub path: PathBuf,
    /// `cgroup.procs` of the group the supervisor started in.
    pub original_procs: PathBuf,
}

/// Create the cgroup and apply the requested limits.
///
/// Returns `Ok(None)` when no limits were requested. Errors with
/// `CgroupsUnavailable` only when limits were requested but the v2
/// hierarchy is absent. Individual limit writes soft-fail with a warning;
/// failing to enroll the supervisor is fatal.
pub fn setup(config: &Config) -> Result<Option<CgroupHandle>> {
    if !config.limits_requested() {
        return Ok(None);
    }
    if !Path::new(CGROUP_ROOT).join("cgroup.controllers").exists() {
        return Err(PoofError::CgroupsUnavailable);
    }

    let original_procs = current_cgroup_procs()?;

    let path = Path::new(CGROUP_ROOT).join(format!("poof-{:016x}", rand::random::<u64>()));
    fs::create_dir(&path).map_err(|e| {
        PoofError::SetupCgroup(format!("failed to create {}: {}", path.display(), e))
    })?;

    if let Some(bytes) = config.memory_limit {
        if let Err(e) = fs::write(path.join("memory.max"), bytes.to_string()) {
            warn!("failed to set memory.max: {}", e);
        }
    }
    if let Some(pids) = config.pids_limit {
        if let Err(e) = fs::write(path.join("pids.max"), pids.to_string()) {
            warn!("failed to set pids.max: {}", e);
        }
    }

    // Enroll now so the fork below inherits membership.
    let pid = std::process::id();
    fs::write(path.join("cgroup.procs"), pid.to_string()).map_err(|e| {
        let _ = fs::remove_dir(&path);
        PoofError::SetupCgroup(format!("failed to join {}: {}", path.display(), e))
    })?;

    debug!("created cgroup {}", path.display());
    Ok(Some(CgroupHandle {
        path,
        original_procs,
    }))
}

/// Move the supervisor back to its original group and remove ours.
/// Safe to call twice and from the signal handler.
pub fn teardown(handle: &CgroupHandle) {
    let _ = fs::write(&handle.original_procs, std::process::id().to_string());
    let _ = fs::remove_dir(&handle.path);
}

fn current_cgroup_procs() -> Result<PathBuf> {
    let content = fs::read_to_string("/proc/self/cgroup")
        .map_err(|e| PoofError::SetupCgroup(format!("failed to read /proc/self/cgroup: {}", e)))?;
    let rel = parse_cgroup_line(&content).ok_or_else(|| {
        PoofError::SetupCgroup("no cgroup v2 entry in /proc/self/cgroup".to_string())
    })?;
    Ok(Path::new(CGROUP_ROOT)
        .join(rel.trim_start_matches('/'))
        .join("cgroup.procs"))
}

/// Extract the path from the unified-hierarchy `0::<path>` line.
fn parse_cgroup_line(content: &str) -> Option<String> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("0::"))
        .map(|p| p.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cgroup_line() {
        let content = "0::/user.slice/user-1000.slice/session-2.scope\n";
        assert_eq!(
            parse_cgroup_line(content).unwrap(),
            "/user.slice/user-1000.slice/session-2.scope"
        );
    }

    #[test]
    fn test_parse_cgroup_line_skips_v1_entries() {
        let content = "12:memory:/foo\n1:name=systemd:/bar\n0::/baz\n";
        assert_eq!(parse_cgroup_line(content).unwrap(), "/baz");
    }

    #[test]
    fn test_parse_cgroup_line_root_group() {
        assert_eq!(parse_cgroup_line("0::/\n").unwrap(), "/");
    }

    #[test]
    fn test_parse_cgroup_line_missing() {
        assert!(parse_cgroup_line("12:memory:/foo\n").is_none());
    }

    #[test]
    fn test_no_limits_no_cgroup() {
        let config = Config {
            mode: crate::config::Mode::Ephemeral,
            command: vec!["true".to_string()],
            upper_dir: None,
            memory_limit: None,
            pids_limit: None,
            timeout: None,
            cwd: PathBuf::from("/"),
            interactive_target: None,
            fuse_overlayfs: PathBuf::from("/usr/bin/fuse-overlayfs"),
            diff_tool: "git".to_string(),
        };
        assert!(setup(&config).unwrap().is_none());
    }
}
