//! Temp/path planning for the overlay directories.
//!
//! The supervisor computes every path before forking so it can delete them
//! afterwards no matter where the child died. The child only ever creates
//! directories at paths recorded here.

use std::path::{Path, PathBuf};

use crate::config::{Config, Mode};
use crate::error::{PoofError, Result};

/// The three overlay directories plus where they live.
///
/// `upper` and `work` must share a filesystem (kernel overlay requirement),
/// which is why persistent runs derive `.work`/`.merged` as siblings of the
/// upper directory instead of using /tmp.
#[derive(Debug, Clone)]
pub struct OverlayPlan {
    pub upper: PathBuf,
    pub work: PathBuf,
    pub merged: PathBuf,
    /// Set for ephemeral/interactive runs: the `/tmp/poof-<hex>` base that
    /// holds all three directories and is deleted (or kept) as a unit.
    pub temp_base: Option<PathBuf>,
    /// Ephemeral runs mount tmpfs over `temp_base` inside the namespace so
    /// the upper never touches the host disk.
    pub is_tmpfs_base: bool,
}

/// Compute (and for temp-based modes, create) the overlay directories.
pub fn plan(config: &Config) -> Result<OverlayPlan> {
    match config.mode {
        Mode::Ephemeral | Mode::Interactive => {
            let base = PathBuf::from(format!("/tmp/poof-{:016x}", rand::random::<u64>()));
            std::fs::create_dir_all(&base).map_err(|source| PoofError::MakeTempDir {
                path: base.clone(),
                source,
            })?;
            Ok(OverlayPlan {
                upper: base.join("upper"),
                work: base.join("work"),
                merged: base.join("merged"),
                temp_base: Some(base),
                is_tmpfs_base: config.mode == Mode::Ephemeral,
            })
        }
        Mode::Persistent => {
            let upper = match &config.upper_dir {
                Some(dir) => absolutize(dir, &config.cwd),
                None => auto_upper_name(config),
            };
            Ok(OverlayPlan {
                work: sibling(&upper, ".work"),
                merged: sibling(&upper, ".merged"),
                upper,
                temp_base: None,
                is_tmpfs_base: false,
            })
        }
    }
}

fn absolutize(path: &Path, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

/// `<cwd>/<basename(program)>`, with a `.YYYYMMDDhhmmss` suffix appended
/// only when the base path is already taken.
fn auto_upper_name(config: &Config) -> PathBuf {
    let program = config.command.first().map(String::as_str).unwrap_or("poof");
    let base_name = Path::new(program)
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "poof".into());
    let base = config.cwd.join(&base_name);
    if !base.exists() {
        return base;
    }
    let stamp = chrono::Local::now().format("%Y%m%d%H%M%S");
    sibling(&base, &format!(".{}", stamp))
}

/// Append a literal suffix to the final path component.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}
