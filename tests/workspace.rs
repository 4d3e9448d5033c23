// Path safety: every client-supplied path either resolves inside the
// workspace or is rejected. Plus listing behavior.

use proptest::prelude::*;
use std::fs;
use tempfile::TempDir;
use stratus::workspace::{ensure_is_subpath, list_dir, tree, WorkspaceManager};

#[test]
fn workspace_layout() {
    let tmp = TempDir::new().unwrap();
    let manager = WorkspaceManager::new(tmp.path()).unwrap();

    let ws = manager.workspace_for("alice", 7);
    assert!(ws.is_absolute());
    assert!(ws.ends_with("alice/task_7"));
}

#[test]
fn accepts_paths_inside_the_base() {
    let tmp = TempDir::new().unwrap();
    let base = tmp.path().join("ws");
    fs::create_dir_all(base.join("sub")).unwrap();
    fs::write(base.join("sub/out.txt"), b"hi").unwrap();

    let resolved = ensure_is_subpath(&base, "sub/out.txt").unwrap();
    assert!(resolved.ends_with("sub/out.txt"));
    assert!(resolved.is_file());

    // Paths that do not exist yet still resolve, as long as they stay in.
    let fresh = ensure_is_subpath(&base, "sub/newdir/artifact.bin").unwrap();
    assert!(fresh.starts_with(fs::canonicalize(&base).unwrap()));

    // Empty input is the base itself.
    let root = ensure_is_subpath(&base, "").unwrap();
    assert_eq!(root, fs::canonicalize(&base).unwrap());
}

#[test]
fn rejects_parent_traversal() {
    let tmp = TempDir::new().unwrap();
    let base = tmp.path().join("ws");
    fs::create_dir_all(&base).unwrap();

    assert!(ensure_is_subpath(&base, "..").is_err());
    assert!(ensure_is_subpath(&base, "../etc").is_err());
    assert!(ensure_is_subpath(&base, "../../etc").is_err());
    assert!(ensure_is_subpath(&base, "a/../../etc").is_err());
}

#[test]
fn rejects_absolute_input() {
    let tmp = TempDir::new().unwrap();
    let base = tmp.path().join("ws");
    fs::create_dir_all(&base).unwrap();

    assert!(ensure_is_subpath(&base, "/etc/passwd").is_err());
}

#[cfg(unix)]
#[test]
fn rejects_symlink_escape() {
    let tmp = TempDir::new().unwrap();
    let base = tmp.path().join("ws");
    let outside = tmp.path().join("outside");
    fs::create_dir_all(&base).unwrap();
    fs::create_dir_all(&outside).unwrap();
    fs::write(outside.join("secret.txt"), b"secret").unwrap();

    std::os::unix::fs::symlink(&outside, base.join("link")).unwrap();

    assert!(ensure_is_subpath(&base, "link/secret.txt").is_err());
    assert!(ensure_is_subpath(&base, "link").is_err());
}

proptest! {
    /// For arbitrary component soup the resolver either fails or stays
    /// under the base.
    #[test]
    fn resolution_never_escapes(
        parts in proptest::collection::vec(
            prop_oneof![
                Just("..".to_string()),
                Just(".".to_string()),
                "[a-z]{1,8}",
            ],
            1..8,
        )
    ) {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("ws");
        fs::create_dir_all(&base).unwrap();
        let base_real = fs::canonicalize(&base).unwrap();

        let user_path = parts.join("/");
        if let Ok(resolved) = ensure_is_subpath(&base, &user_path) {
            prop_assert!(resolved.starts_with(&base_real));
        }
    }
}

#[test]
fn list_dir_of_missing_path_is_empty() {
    let tmp = TempDir::new().unwrap();
    assert!(list_dir(&tmp.path().join("nope")).is_empty());
}

#[test]
fn list_dir_reports_sizes_for_files_only() {
    let tmp = TempDir::new().unwrap();
    fs::create_dir_all(tmp.path().join("sub")).unwrap();
    fs::write(tmp.path().join("out.txt"), b"hello").unwrap();

    let mut nodes = list_dir(tmp.path());
    nodes.sort_by(|a, b| a.name.cmp(&b.name));

    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[0].name, "out.txt");
    assert!(!nodes[0].is_dir);
    assert_eq!(nodes[0].size, Some(5));
    assert_eq!(nodes[1].name, "sub");
    assert!(nodes[1].is_dir);
    assert_eq!(nodes[1].size, None);
}

#[test]
fn tree_respects_depth_limit() {
    let tmp = TempDir::new().unwrap();
    fs::create_dir_all(tmp.path().join("a/b/c")).unwrap();
    fs::write(tmp.path().join("top.txt"), b"1").unwrap();
    fs::write(tmp.path().join("a/b/mid.txt"), b"2").unwrap();
    fs::write(tmp.path().join("a/b/c/deep.txt"), b"3").unwrap();

    let nodes = tree(tmp.path(), 2);
    let paths: Vec<&str> = nodes.iter().map(|n| n.path.as_str()).collect();

    assert!(paths.contains(&"top.txt"));
    assert!(paths.contains(&"a"));
    assert!(paths.contains(&"a/b"));
    assert!(paths.contains(&"a/b/mid.txt"));
    assert!(paths.contains(&"a/b/c"));
    // Below the depth limit.
    assert!(!paths.contains(&"a/b/c/deep.txt"));
}
