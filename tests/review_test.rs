use std::path::PathBuf;

use poof::review::{scan, shadow_path, ChangeKind, MAX_CHANGES};

/// Lay out a shadow tree the way the overlay upper layer would after a run.
fn setup_trees() -> (tempfile::TempDir, PathBuf, PathBuf) {
    let tmp = tempfile::tempdir().unwrap();
    let target = tmp.path().join("target");
    let shadow = tmp.path().join("upper").join(
        target
            .strip_prefix("/")
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|_| target.clone()),
    );
    std::fs::create_dir_all(&target).unwrap();
    std::fs::create_dir_all(&shadow).unwrap();
    (tmp, shadow, target)
}

#[test]
fn test_new_file_is_added() {
    let (_tmp, shadow, target) = setup_trees();
    std::fs::write(shadow.join("new.txt"), "x").unwrap();

    let (changes, suppressed) = scan(&shadow, &target).unwrap();
    assert_eq!(suppressed, 0);
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].path, PathBuf::from("new.txt"));
    assert_eq!(changes[0].kind, ChangeKind::Added);
}

#[test]
fn test_existing_file_is_edited() {
    let (_tmp, shadow, target) = setup_trees();
    std::fs::write(target.join("config.ini"), "old").unwrap();
    std::fs::write(shadow.join("config.ini"), "new").unwrap();

    let (changes, _) = scan(&shadow, &target).unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].kind, ChangeKind::Edited);
}

#[test]
fn test_empty_directory_is_added_dir() {
    let (_tmp, shadow, target) = setup_trees();
    std::fs::create_dir(shadow.join("fresh")).unwrap();

    let (changes, _) = scan(&shadow, &target).unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].path, PathBuf::from("fresh"));
    assert_eq!(changes[0].kind, ChangeKind::AddedDir);
}

#[test]
fn test_populated_directory_reports_contents_not_itself() {
    let (_tmp, shadow, target) = setup_trees();
    std::fs::create_dir(shadow.join("sub")).unwrap();
    std::fs::write(shadow.join("sub/a.txt"), "a").unwrap();
    std::fs::write(shadow.join("sub/b.txt"), "b").unwrap();

    let (changes, _) = scan(&shadow, &target).unwrap();
    let paths: Vec<_> = changes.iter().map(|c| c.path.clone()).collect();
    assert_eq!(paths, vec![PathBuf::from("sub/a.txt"), PathBuf::from("sub/b.txt")]);
    assert!(changes.iter().all(|c| c.kind == ChangeKind::Added));
}

#[test]
fn test_whiteout_is_deleted() {
    // Whiteouts are character devices; creating one needs mknod rights.
    // Under an unprivileged test runner this silently opts out.
    let (_tmp, shadow, target) = setup_trees();
    let whiteout = shadow.join("removed.txt");
    if nix::sys::stat::mknod(
        &whiteout,
        nix::sys::stat::SFlag::S_IFCHR,
        nix::sys::stat::Mode::empty(),
        0,
    )
    .is_err()
    {
        return;
    }
    std::fs::write(target.join("removed.txt"), "was here").unwrap();

    let (changes, _) = scan(&shadow, &target).unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].kind, ChangeKind::Deleted);
}

#[test]
fn test_scan_truncates_at_ceiling() {
    let (_tmp, shadow, target) = setup_trees();
    for i in 0..(MAX_CHANGES + 7) {
        std::fs::write(shadow.join(format!("f{:05}", i)), "x").unwrap();
    }

    let (changes, suppressed) = scan(&shadow, &target).unwrap();
    assert_eq!(changes.len(), MAX_CHANGES);
    assert_eq!(suppressed, 7);
}

#[test]
fn test_shadow_path_prefixes_target() {
    let shadow = shadow_path(
        std::path::Path::new("/tmp/poof-abc/upper"),
        std::path::Path::new("/home/dev/project"),
    );
    assert_eq!(shadow, PathBuf::from("/tmp/poof-abc/upper/home/dev/project"));
}
