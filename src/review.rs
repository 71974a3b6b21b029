//! Post-exit change review.
//!
//! After an interactive run the overlay upper layer holds everything the
//! command wrote under the target directory. This module classifies those
//! entries, shows a summary, and either copies the shadow tree over the
//! target or leaves it stashed for later inspection.

use std::io::{BufRead, Write};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::Result;
use crate::paths::OverlayPlan;

/// Hard ceiling on the rendered change list. Anything beyond it is counted
/// but not shown.
pub const MAX_CHANGES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Edited,
    Deleted,
    AddedDir,
}

/// One entry of the upper layer, relative to the review target.
#[derive(Debug, Clone)]
pub struct Change {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewOutcome {
    /// Shadow tree copied over the target; temp dirs can be cleaned.
    Applied,
    /// Changes declined; the upper tree must survive cleanup.
    Discarded,
    /// Upper layer held nothing under the target.
    NoChanges,
}

/// Drive the review: scan, summarize, prompt, apply or stash.
pub fn run(config: &Config, plan: &OverlayPlan, target: &Path) -> Result<ReviewOutcome> {
    let shadow = shadow_path(&plan.upper, target);
    if !shadow.is_dir() {
        println!("poof: no changes under {}", target.display());
        return Ok(ReviewOutcome::NoChanges);
    }

    let (changes, suppressed) = scan(&shadow, target)?;
    if changes.is_empty() {
        println!("poof: no changes under {}", target.display());
        return Ok(ReviewOutcome::NoChanges);
    }

    let color = use_color();
    println!("changes under {}:", target.display());
    for change in &changes {
        println!("  {}", render_change(change, color));
    }
    if suppressed > 0 {
        println!("  ... ({} more changes not shown)", suppressed);
    }
    if changes.iter().any(|c| c.kind == ChangeKind::Deleted) {
        println!("note: '-' deletions are reported only; applying does not remove files");
    }

    let mut allow_diff = true;
    loop {
        match prompt(target, allow_diff)? {
            PromptAction::Apply => {
                apply(&shadow, target)?;
                println!("applied to {}", target.display());
                return Ok(ReviewOutcome::Applied);
            }
            PromptAction::Diff => {
                show_diff(config, target, &shadow);
                allow_diff = false;
            }
            PromptAction::Discard => {
                println!("changes kept at {}", plan.upper.display());
                return Ok(ReviewOutcome::Discarded);
            }
        }
    }
}

/// `<upper>/<target-relative-to-root>`: the part of the upper layer that
/// shadows the review target.
pub fn shadow_path(upper: &Path, target: &Path) -> PathBuf {
    match target.strip_prefix("/") {
        Ok(rel) => upper.join(rel),
        Err(_) => upper.join(target),
    }
}

/// Walk the shadow tree and classify every entry.
///
/// Returns the collected changes plus the number suppressed by the
/// `MAX_CHANGES` ceiling.
pub fn scan(shadow: &Path, target: &Path) -> Result<(Vec<Change>, usize)> {
    let mut changes = Vec::new();
    let mut suppressed = 0usize;

    let walker = WalkDir::new(shadow).min_depth(1).sort_by_file_name();
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                debug!("skipping unreadable entry: {}", e);
                continue;
            }
        };
        let rel = match entry.path().strip_prefix(shadow) {
            Ok(r) => r.to_path_buf(),
            Err(_) => continue,
        };

        let kind = if entry.file_type().is_dir() {
            // Non-empty directories are structure, not changes; an empty
            // directory in the upper is a directory the command created.
            if dir_has_children(entry.path()) {
                continue;
            }
            ChangeKind::AddedDir
        } else if entry.file_type().is_char_device() {
            // Overlay whiteout: the command deleted this path.
            ChangeKind::Deleted
        } else if target.join(&rel).exists() {
            ChangeKind::Edited
        } else {
            ChangeKind::Added
        };

        if changes.len() >= MAX_CHANGES {
            suppressed += 1;
            continue;
        }
        changes.push(Change { path: rel, kind });
    }

    Ok((changes, suppressed))
}

fn dir_has_children(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// `+ path`, `~ path`, `- path`; added directories get a trailing slash.
pub fn render_change(change: &Change, color: bool) -> String {
    let (marker, code) = match change.kind {
        ChangeKind::Added | ChangeKind::AddedDir => ('+', "\x1b[32m"),
        ChangeKind::Edited => ('~', "\x1b[33m"),
        ChangeKind::Deleted => ('-', "\x1b[31m"),
    };
    let suffix = if change.kind == ChangeKind::AddedDir {
        "/"
    } else {
        ""
    };
    if color {
        format!("{}{} {}{}\x1b[0m", code, marker, change.path.display(), suffix)
    } else {
        format!("{} {}{}", marker, change.path.display(), suffix)
    }
}

fn use_color() -> bool {
    use std::io::IsTerminal;

    std::env::var_os("NO_COLOR").is_none() && std::io::stdout().is_terminal()
}

enum PromptAction {
    Apply,
    Discard,
    Diff,
}

/// Read the decision. Empty or unrecognized input discards (capital-N
/// default); `d` is offered once, before the diff has been shown.
fn prompt(target: &Path, allow_diff: bool) -> Result<PromptAction> {
    let choices = if allow_diff { "[y/N/d]" } else { "[y/N]" };
    print!("apply changes to {}? {} ", target.display(), choices);
    std::io::stdout().flush()?;

    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(match line.trim() {
        "y" | "Y" | "yes" => PromptAction::Apply,
        "d" | "D" if allow_diff => PromptAction::Diff,
        _ => PromptAction::Discard,
    })
}

fn show_diff(config: &Config, target: &Path, shadow: &Path) {
    // --no-index exits 1 whenever the trees differ; that is the expected
    // outcome, not a failure.
    let result = Command::new(&config.diff_tool)
        .args(["--no-pager", "diff", "--no-index"])
        .arg(target)
        .arg(shadow)
        .status();
    if let Err(e) = result {
        eprintln!("poof: failed to run {}: {}", config.diff_tool, e);
    }
}

/// Copy the shadow tree over the target, overwriting existing files.
/// Whiteouts are not translated into deletions.
fn apply(shadow: &Path, target: &Path) -> Result<()> {
    let status = Command::new("cp")
        .arg("-r")
        .arg("-T")
        .arg(shadow)
        .arg(target)
        .status()?;
    if !status.success() {
        return Err(std::io::Error::other(format!("cp -r -T exited with {}", status)).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shadow_path_joins_under_upper() {
        assert_eq!(
            shadow_path(Path::new("/tmp/poof-1/upper"), Path::new("/home/me/src")),
            PathBuf::from("/tmp/poof-1/upper/home/me/src")
        );
    }

    #[test]
    fn test_render_plain() {
        let c = Change {
            path: PathBuf::from("a/b.txt"),
            kind: ChangeKind::Edited,
        };
        assert_eq!(render_change(&c, false), "~ a/b.txt");
    }

    #[test]
    fn test_render_added_dir_has_trailing_slash() {
        let c = Change {
            path: PathBuf::from("newdir"),
            kind: ChangeKind::AddedDir,
        };
        assert_eq!(render_change(&c, false), "+ newdir/");
    }

    #[test]
    fn test_render_deleted() {
        let c = Change {
            path: PathBuf::from("gone.txt"),
            kind: ChangeKind::Deleted,
        };
        assert_eq!(render_change(&c, false), "- gone.txt");
    }
}
