// siterestore/src/restore/scanner.rs
use std::path::Path;
use std::time::Duration;
use walkdir::{DirEntry, WalkDir};

use super::archive::{MANIFEST_FILE, README_FILE};
use crate::errors::{RestoreError, Result};
use crate::state::{EntryKind, FsEntry};

pub const SCAN_ATTEMPTS: u32 = 3;
pub const SCAN_RETRY_DELAY: Duration = Duration::from_millis(500);

const PROBE_PREFIX: &str = ".restore-probe";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanResult {
    /// Shallowest first, then by path.
    pub directories: Vec<FsEntry>,
    pub files: Vec<FsEntry>,
    pub total_size: u64,
}

/// Backup markers and write-check leftovers only live at the top of the tree; the same
/// names deeper down are ordinary site files.
fn is_excluded(entry: &DirEntry) -> bool {
    if entry.depth() != 1 {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name == README_FILE || name == MANIFEST_FILE || name.starts_with(PROBE_PREFIX)
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

/// Walks `root` once and classifies its entries. Symlinks are skipped.
pub fn scan(root: &Path) -> Result<ScanResult> {
    if !root.is_dir() {
        return Err(RestoreError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("source tree {} is not a directory", root.display()),
        )));
    }

    let mut result = ScanResult::default();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !is_excluded(e));
    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            log::debug!("Skipping symlink {}", entry.path().display());
            continue;
        }
        let Some(path) = relative_path(root, entry.path()) else {
            continue;
        };
        if file_type.is_dir() {
            result.directories.push(FsEntry {
                path,
                kind: EntryKind::Directory,
                depth: entry.depth(),
                size: 0,
            });
        } else if file_type.is_file() {
            let size = entry.metadata().map_err(std::io::Error::from)?.len();
            result.total_size += size;
            result.files.push(FsEntry {
                path,
                kind: EntryKind::File,
                depth: entry.depth(),
                size,
            });
        }
    }

    result
        .directories
        .sort_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.path.cmp(&b.path)));
    Ok(result)
}

/// [`scan`] with up to `attempts` tries, sleeping `delay` between them.
pub async fn scan_with_retry(root: &Path, attempts: u32, delay: Duration) -> Result<ScanResult> {
    let mut attempt = 1;
    loop {
        match scan(root) {
            Ok(result) => return Ok(result),
            Err(e) if attempt < attempts => {
                log::warn!(
                    "Scan of {} failed (attempt {}/{}): {}",
                    root.display(),
                    attempt,
                    attempts,
                    e
                );
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_scan_orders_directories_and_excludes_markers() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path();
        fs::create_dir_all(root.join("b/c"))?;
        fs::create_dir_all(root.join("a"))?;
        fs::create_dir_all(root.join(".restore-probe-1"))?;
        fs::write(root.join("b/c/deep.txt"), b"12345")?;
        fs::write(root.join("top.txt"), b"abc")?;
        fs::write(root.join(README_FILE), b"readme")?;
        fs::write(root.join(MANIFEST_FILE), b"Backup Type: full")?;
        fs::write(root.join(".restore-probe-1/probe.txt"), b"x")?;

        let result = scan(root)?;
        let dirs: Vec<_> = result.directories.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(dirs, vec!["a", "b", "b/c"]);
        assert_eq!(result.directories[2].depth, 2);

        let mut files: Vec<_> = result.files.iter().map(|f| f.path.as_str()).collect();
        files.sort();
        assert_eq!(files, vec!["b/c/deep.txt", "top.txt"]);
        assert_eq!(result.total_size, 8);
        Ok(())
    }

    #[test]
    fn test_marker_names_below_the_root_are_kept() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path();
        fs::create_dir_all(root.join("docs"))?;
        fs::write(root.join(MANIFEST_FILE), b"Backup Type: full")?;
        fs::write(root.join("docs").join(MANIFEST_FILE), b"site notes")?;
        fs::write(root.join("docs").join(README_FILE), b"site readme")?;

        let result = scan(root)?;
        let mut files: Vec<_> = result.files.iter().map(|f| f.path.clone()).collect();
        files.sort();
        assert_eq!(
            files,
            vec![format!("docs/{}", README_FILE), format!("docs/{}", MANIFEST_FILE)]
        );
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_skipped() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("real.txt"), b"x")?;
        std::os::unix::fs::symlink(dir.path().join("real.txt"), dir.path().join("link.txt"))?;

        let result = scan(dir.path())?;
        assert_eq!(result.files.len(), 1);
        assert_eq!(result.files[0].path, "real.txt");
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_root_fails_after_retries() {
        let result = scan_with_retry(
            Path::new("/nonexistent/siterestore/files"),
            SCAN_ATTEMPTS,
            Duration::ZERO,
        )
        .await;
        assert!(result.is_err());
    }
}
