use std::path::{Path, PathBuf};

use nix::unistd::{access, AccessFlags};
use serde::Deserialize;
use tracing::warn;

use crate::error::{PoofError, Result};

/// How the overlay upper layer is disposed of after the command exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Upper on tmpfs, discarded with the namespace.
    Ephemeral,
    /// Upper is a real directory that outlives the run.
    Persistent,
    /// Upper on a per-run temp dir, reviewed on exit.
    Interactive,
}

/// Immutable run configuration, fixed after CLI + config-file resolution.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    /// Program and arguments. Non-empty; `enter` injects the user shell.
    pub command: Vec<String>,
    /// Explicit upper directory (`run --upper=`).
    pub upper_dir: Option<PathBuf>,
    /// memory.max in bytes.
    pub memory_limit: Option<u64>,
    /// pids.max.
    pub pids_limit: Option<u64>,
    /// Wall-clock limit in seconds.
    pub timeout: Option<u64>,
    /// Working directory for the sandboxed command.
    pub cwd: PathBuf,
    /// When set, the change reviewer runs against this directory on exit.
    pub interactive_target: Option<PathBuf>,
    /// Path of the fuse-overlayfs helper binary.
    pub fuse_overlayfs: PathBuf,
    /// External diff tool invoked from the review prompt.
    pub diff_tool: String,
}

impl Config {
    pub fn limits_requested(&self) -> bool {
        self.memory_limit.is_some() || self.pids_limit.is_some()
    }
}

/// Optional on-disk defaults, merged in ascending priority:
/// `/etc/poof/poof.toml` < `$XDG_CONFIG_HOME/poof/poof.toml` < `./poof.toml`.
/// Higher layers only need the keys they override.
#[derive(Debug, Default, Deserialize, Clone)]
pub struct FileConfig {
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct LimitsConfig {
    /// Size string with optional k/M/G suffix, e.g. "512M".
    pub memory: Option<String>,
    pub pids: Option<u64>,
    pub timeout: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ToolsConfig {
    #[serde(default = "default_fuse_overlayfs")]
    pub fuse_overlayfs: PathBuf,
    #[serde(default = "default_diff_tool")]
    pub diff: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            fuse_overlayfs: default_fuse_overlayfs(),
            diff: default_diff_tool(),
        }
    }
}

fn default_fuse_overlayfs() -> PathBuf {
    PathBuf::from("/usr/bin/fuse-overlayfs")
}

fn default_diff_tool() -> String {
    "git".to_string()
}

fn xdg_config_path() -> Option<PathBuf> {
    let uid = unsafe { libc::getuid() };
    if uid == 0 {
        return None;
    }

    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .ok()
        .or_else(|| {
            std::env::var("HOME")
                .map(|h| PathBuf::from(h).join(".config"))
                .ok()
        })
        .map(|p| p.join("poof/poof.toml"))
}

/// Lay `upper` over `lower`. Tables combine key by key with the upper
/// layer winning; any other value kind replaces the lower one outright.
fn overlay_value(lower: toml::Value, upper: toml::Value) -> toml::Value {
    match (lower, upper) {
        (toml::Value::Table(lower_tab), toml::Value::Table(mut upper_tab)) => {
            let mut combined = toml::map::Map::new();
            for (key, low) in lower_tab {
                let value = match upper_tab.remove(&key) {
                    Some(high) => overlay_value(low, high),
                    None => low,
                };
                combined.insert(key, value);
            }
            // Keys the lower layer never mentioned.
            for (key, high) in upper_tab {
                combined.insert(key, high);
            }
            toml::Value::Table(combined)
        }
        (_, replacement) => replacement,
    }
}

impl FileConfig {
    pub fn load() -> Result<Self> {
        let mut layers: Vec<PathBuf> = vec![PathBuf::from("/etc/poof/poof.toml")];
        if let Some(xdg) = xdg_config_path() {
            layers.push(xdg);
        }
        layers.push(PathBuf::from("./poof.toml"));

        let mut merged: Option<toml::Value> = None;
        for layer_path in &layers {
            if !layer_path.exists() {
                continue;
            }
            let content = std::fs::read_to_string(layer_path)?;
            let val: toml::Value = toml::from_str(&content).map_err(|e| {
                PoofError::InvalidOption(format!("{}: {}", layer_path.display(), e))
            })?;
            merged = Some(match merged {
                Some(lower) => overlay_value(lower, val),
                None => val,
            });
        }

        match merged {
            None => Ok(Self::default()),
            Some(val) => FileConfig::deserialize(val)
                .map_err(|e| PoofError::InvalidOption(format!("poof.toml: {}", e))),
        }
    }
}

/// Parse `N[kKmMgG]` into bytes.
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(PoofError::InvalidOption("empty size".to_string()));
    }
    let (digits, multiplier) = match s.chars().next_back() {
        Some('k' | 'K') => (&s[..s.len() - 1], 1024u64),
        Some('m' | 'M') => (&s[..s.len() - 1], 1024 * 1024),
        Some('g' | 'G') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| PoofError::InvalidOption(format!("invalid size '{}'", s)))?;
    n.checked_mul(multiplier)
        .ok_or_else(|| PoofError::InvalidOption(format!("size '{}' overflows", s)))
}

/// Parse a plain decimal count (`--pids`, `--timeout`).
pub fn parse_count(opt: &str, s: &str) -> Result<u64> {
    s.trim()
        .parse()
        .map_err(|_| PoofError::InvalidOption(format!("{}={} is not a number", opt, s)))
}

/// Resolve the shell `enter` should run. `$SHELL` wins when it points at
/// something executable; otherwise fall back to /bin/sh.
pub fn resolve_shell() -> String {
    match std::env::var("SHELL") {
        Ok(shell) if !shell.is_empty() => {
            if access(Path::new(&shell), AccessFlags::X_OK).is_ok() {
                shell
            } else {
                warn!("$SHELL ({}) is not executable, falling back to /bin/sh", shell);
                "/bin/sh".to_string()
            }
        }
        _ => "/bin/sh".to_string(),
    }
}

/// Shell names that make a bare `poof <shell>` default to `exec`.
pub const KNOWN_SHELLS: &[&str] = &["bash", "zsh", "fish", "sh"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_plain_bytes() {
        assert_eq!(parse_size("1048576").unwrap(), 1048576);
    }

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("4k").unwrap(), 4096);
        assert_eq!(parse_size("4K").unwrap(), 4096);
        assert_eq!(parse_size("512M").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_size("2g").unwrap(), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_parse_size_rejects_garbage() {
        assert!(parse_size("invalid").is_err());
        assert!(parse_size("").is_err());
        assert!(parse_size("12T").is_err());
        assert!(parse_size("M").is_err());
    }

    #[test]
    fn test_parse_count_rejects_garbage() {
        assert!(parse_count("--pids", "abc").is_err());
        assert!(parse_count("--timeout", "1.5").is_err());
        assert_eq!(parse_count("--pids", "128").unwrap(), 128);
    }

    #[test]
    fn test_overlay_value_upper_layer_wins() {
        let lower: toml::Value = toml::from_str("[limits]\npids = 10\ntimeout = 5").unwrap();
        let upper: toml::Value = toml::from_str("[limits]\npids = 20").unwrap();
        let cfg = FileConfig::deserialize(overlay_value(lower, upper)).unwrap();
        assert_eq!(cfg.limits.pids, Some(20));
        assert_eq!(cfg.limits.timeout, Some(5));
    }

    #[test]
    fn test_overlay_value_keeps_unshadowed_tables() {
        let lower: toml::Value = toml::from_str("[tools]\ndiff = \"git\"").unwrap();
        let upper: toml::Value = toml::from_str("[limits]\npids = 4").unwrap();
        let cfg = FileConfig::deserialize(overlay_value(lower, upper)).unwrap();
        assert_eq!(cfg.tools.diff, "git");
        assert_eq!(cfg.limits.pids, Some(4));
    }
}
