use std::path::{Path, PathBuf};

use crate::error::Result;

/// Directory/file name suffix marking private test artefacts that survive
/// a refresh (SPEC_FULL.md §4.5).
const PRIV_TEST_SUFFIX: &str = "_priv_test";
const PRIV_TEST_FILE_SUFFIX: &str = "_priv_test.mbt";

/// Names ignored when copying the source tree on top of the destination.
const IGNORED_NAMES: &[&str] = &[".git", "target", "_build", ".mooncakes"];

/// Materialises `src_dir` into `dst_dir`: scrubs everything in the
/// destination except private-test artefacts, then copies the source tree
/// on top. Errors are logged and swallowed — the pipeline proceeds and
/// fails later in the build phase if required files ended up missing,
/// exactly as the reference deployment's `copy_project` does.
pub fn materialize(src_dir: &Path, dst_dir: &Path) {
    if dst_dir.exists() {
        if let Err(e) = scrub_destination(dst_dir) {
            tracing::warn!(dst = %dst_dir.display(), "error scrubbing destination (continuing anyway): {e}");
        }
    }
    if let Err(e) = copy_tree(src_dir, dst_dir) {
        tracing::warn!(src = %src_dir.display(), dst = %dst_dir.display(), "error copying project (continuing anyway): {e}");
    }
}

fn is_under_priv_test_dir(path: &Path, root: &Path) -> bool {
    let mut cur = path;
    loop {
        if cur
            .file_name()
            .is_some_and(|n| n.to_string_lossy().ends_with(PRIV_TEST_SUFFIX))
        {
            return true;
        }
        if cur == root {
            return false;
        }
        match cur.parent() {
            Some(parent) if parent != cur => cur = parent,
            _ => return false,
        }
    }
}

fn scrub_destination(dst_dir: &Path) -> Result<()> {
    // Pass 1: delete files, skipping private-test files and anything under
    // a `*_priv_test/` subtree.
    delete_files_recursive(dst_dir, dst_dir)?;
    // Pass 2: prune now-empty directories, bottom-up, same exclusions.
    prune_empty_dirs(dst_dir, dst_dir)?;
    Ok(())
}

fn delete_files_recursive(dir: &Path, root: &Path) -> Result<()> {
    if dir != root && is_under_priv_test_dir(dir, root) {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            delete_files_recursive(&path, root)?;
        } else if !path
            .file_name()
            .is_some_and(|n| n.to_string_lossy().ends_with(PRIV_TEST_FILE_SUFFIX))
        {
            let _ = std::fs::remove_file(&path);
        }
    }
    Ok(())
}

fn prune_empty_dirs(dir: &Path, root: &Path) -> Result<()> {
    if dir != root && is_under_priv_test_dir(dir, root) {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            if is_under_priv_test_dir(&path, root) {
                continue;
            }
            prune_empty_dirs(&path, root)?;
            if std::fs::read_dir(&path).map(|mut d| d.next().is_none()).unwrap_or(false) {
                let _ = std::fs::remove_dir(&path);
            }
        }
    }
    Ok(())
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if IGNORED_NAMES.iter().any(|ignored| name == *ignored) {
            continue;
        }
        let src_path = entry.path();
        let dst_path = dst.join(&name);
        if src_path.is_dir() {
            copy_tree(&src_path, &dst_path)?;
        } else {
            std::fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

/// Whether a marker file selecting the incremental test runner is present
/// in the materialised project (SPEC_FULL.md §4.4/§6).
pub fn has_incremental_runner(project_dir: &Path, marker: &str) -> bool {
    project_dir.join(marker).is_file()
}

/// Best-effort locate a test's source file, trying `<package>/<filename>`,
/// then `<filename>` at the project root, then a recursive search —
/// mirrors the reference deployment's `_find_test_file`.
pub fn find_test_file(project_dir: &Path, filename: &str, package: Option<&str>) -> Option<PathBuf> {
    if let Some(package) = package {
        let candidate = project_dir.join(package).join(filename);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    let candidate = project_dir.join(filename);
    if candidate.exists() {
        return Some(candidate);
    }
    find_recursive(project_dir, filename)
}

fn find_recursive(dir: &Path, filename: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Some(found) = find_recursive(&path, filename) {
                return Some(found);
            }
        } else if path.file_name().map(|n| n.to_string_lossy().into_owned()) == Some(filename.to_string()) {
            return Some(path);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn preserves_priv_test_files_and_dirs_across_refresh() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();

        fs::write(dst.path().join("a.mbt"), "old").unwrap();
        fs::write(dst.path().join("a_priv_test.mbt"), "secret").unwrap();
        fs::create_dir(dst.path().join("pkg_priv_test")).unwrap();
        fs::write(dst.path().join("pkg_priv_test").join("hidden.mbt"), "secret2").unwrap();

        fs::write(src.path().join("a.mbt"), "new").unwrap();

        materialize(src.path(), dst.path());

        assert_eq!(fs::read_to_string(dst.path().join("a.mbt")).unwrap(), "new");
        assert_eq!(
            fs::read_to_string(dst.path().join("a_priv_test.mbt")).unwrap(),
            "secret"
        );
        assert_eq!(
            fs::read_to_string(dst.path().join("pkg_priv_test").join("hidden.mbt")).unwrap(),
            "secret2"
        );
    }

    #[test]
    fn ignores_vcs_and_build_artifact_dirs() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        fs::create_dir(src.path().join(".git")).unwrap();
        fs::write(src.path().join(".git").join("HEAD"), "ref").unwrap();
        fs::create_dir(src.path().join("target")).unwrap();
        fs::write(src.path().join("target").join("out"), "bin").unwrap();
        fs::write(src.path().join("real.mbt"), "code").unwrap();

        materialize(src.path(), dst.path());

        assert!(!dst.path().join(".git").exists());
        assert!(!dst.path().join("target").exists());
        assert!(dst.path().join("real.mbt").exists());
    }

    #[test]
    fn prunes_emptied_directories_but_not_priv_test_ones() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        fs::create_dir(dst.path().join("stale")).unwrap();
        fs::write(dst.path().join("stale").join("old.mbt"), "x").unwrap();
        fs::create_dir(dst.path().join("keep_priv_test")).unwrap();
        fs::write(dst.path().join("keep_priv_test").join("t.mbt"), "y").unwrap();

        materialize(src.path(), dst.path());

        assert!(!dst.path().join("stale").exists());
        assert!(dst.path().join("keep_priv_test").join("t.mbt").exists());
    }

    #[test]
    fn detects_incremental_runner_marker() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!has_incremental_runner(dir.path(), "try.py"));
        fs::write(dir.path().join("try.py"), "# runner").unwrap();
        assert!(has_incremental_runner(dir.path(), "try.py"));
    }
}
