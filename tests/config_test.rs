use std::path::PathBuf;

use poof::config::{self, Config, Mode};
use poof::paths;

fn base_config(mode: Mode, cwd: PathBuf) -> Config {
    Config {
        mode,
        command: vec!["sh".to_string(), "-c".to_string(), "true".to_string()],
        upper_dir: None,
        memory_limit: None,
        pids_limit: None,
        timeout: None,
        cwd,
        interactive_target: None,
        fuse_overlayfs: PathBuf::from("/usr/bin/fuse-overlayfs"),
        diff_tool: "git".to_string(),
    }
}

#[test]
fn test_size_parsing_round_numbers() {
    assert_eq!(config::parse_size("100").unwrap(), 100);
    assert_eq!(config::parse_size("1k").unwrap(), 1024);
    assert_eq!(config::parse_size("100M").unwrap(), 100 * 1024 * 1024);
    assert_eq!(config::parse_size("1G").unwrap(), 1024 * 1024 * 1024);
}

#[test]
fn test_bad_numeric_options_are_rejected() {
    // These must fail during parsing, long before any fork happens.
    assert!(config::parse_size("invalid").is_err());
    assert!(config::parse_count("--timeout", "abc").is_err());
    assert!(config::parse_count("--pids", "abc").is_err());
    assert!(config::parse_count("--pids", "-3").is_err());
}

#[test]
fn test_ephemeral_plan_allocates_and_cleans() {
    let config = base_config(Mode::Ephemeral, PathBuf::from("/"));
    let plan = paths::plan(&config).unwrap();
    let base = plan.temp_base.clone().unwrap();
    assert!(base.exists());
    assert!(plan.is_tmpfs_base);

    // Two runs never collide.
    let plan2 = paths::plan(&config).unwrap();
    assert_ne!(plan2.temp_base.as_ref().unwrap(), &base);

    std::fs::remove_dir_all(&base).unwrap();
    std::fs::remove_dir_all(plan2.temp_base.unwrap()).unwrap();
}

#[test]
fn test_persistent_plan_sibling_layout() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = base_config(Mode::Persistent, tmp.path().to_path_buf());
    config.upper_dir = Some(tmp.path().join("stash"));

    let plan = paths::plan(&config).unwrap();
    assert_eq!(plan.upper, tmp.path().join("stash"));
    assert_eq!(plan.work, tmp.path().join("stash.work"));
    assert_eq!(plan.merged, tmp.path().join("stash.merged"));
    assert!(!plan.is_tmpfs_base);
    assert!(plan.temp_base.is_none());
}

#[test]
fn test_persistent_auto_name_from_command() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = base_config(Mode::Persistent, tmp.path().to_path_buf());
    config.command = vec!["/usr/bin/cargo".to_string(), "build".to_string()];

    let plan = paths::plan(&config).unwrap();
    assert_eq!(plan.upper, tmp.path().join("cargo"));
}

#[test]
fn test_limits_requested() {
    let mut config = base_config(Mode::Ephemeral, PathBuf::from("/"));
    assert!(!config.limits_requested());
    config.pids_limit = Some(64);
    assert!(config.limits_requested());
}
