// siterestore/src/restore/archive.rs
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

/// Manifest written at the root of every backup archive.
pub const MANIFEST_FILE: &str = "backup-info.txt";
/// Marker file the backup side drops next to the manifest.
pub const README_FILE: &str = "README-BACKUP.txt";
pub const COMBINED_SQL_FILE: &str = "backup.sql";
pub const DATABASE_DIR: &str = "database";
pub const FILES_DIR: &str = "files";

/// Entries unpacked between two progress reports.
pub const EXTRACT_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_ascii_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else {
            None
        }
    }
}

/// Extraction progress. `total` is 0 when the container does not know its
/// entry count up front (tar.gz).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractProgress {
    pub done: usize,
    pub total: usize,
}

/// Unpacks `archive_path` into `extract_to_dir`, calling `on_progress` after
/// every [`EXTRACT_BATCH_SIZE`] entries and once at the end.
///
/// # Arguments
/// * `archive_path` - Path to a `.zip` or `.tar.gz` backup archive.
/// * `extract_to_dir` - Directory the contents are unpacked into; created if missing.
/// * `on_progress` - Progress callback, used by the orchestrator to persist status.
///
/// # Returns
/// The number of entries unpacked.
pub fn extract_archive(
    archive_path: &Path,
    extract_to_dir: &Path,
    on_progress: &mut dyn FnMut(ExtractProgress),
) -> Result<usize> {
    if !archive_path.is_file() {
        return Err(anyhow::anyhow!(
            "Archive for extraction is not a file: {}",
            archive_path.display()
        ));
    }
    if !extract_to_dir.exists() {
        fs::create_dir_all(extract_to_dir).with_context(|| {
            format!(
                "Failed to create extraction directory: {}",
                extract_to_dir.display()
            )
        })?;
    } else if !extract_to_dir.is_dir() {
        return Err(anyhow::anyhow!(
            "Extraction path exists but is not a directory: {}",
            extract_to_dir.display()
        ));
    }

    let format = ArchiveFormat::from_path(archive_path).with_context(|| {
        format!(
            "Unsupported archive type (expected .zip or .tar.gz): {}",
            archive_path.display()
        )
    })?;
    log::info!(
        "📦 Extracting {:?} archive {} to {}",
        format,
        archive_path.display(),
        extract_to_dir.display()
    );

    let unpacked = match format {
        ArchiveFormat::Zip => extract_zip(archive_path, extract_to_dir, on_progress)?,
        ArchiveFormat::TarGz => extract_tar_gz(archive_path, extract_to_dir, on_progress)?,
    };

    log::info!(
        "✓ Archive extracted: {} entries in {}",
        unpacked,
        extract_to_dir.display()
    );
    Ok(unpacked)
}

fn extract_zip(
    archive_path: &Path,
    extract_to_dir: &Path,
    on_progress: &mut dyn FnMut(ExtractProgress),
) -> Result<usize> {
    let archive_file = File::open(archive_path)
        .with_context(|| format!("Failed to open archive file: {}", archive_path.display()))?;
    let mut archive = zip::ZipArchive::new(archive_file)
        .with_context(|| format!("Corrupt or unreadable zip archive: {}", archive_path.display()))?;
    let total = archive.len();
    on_progress(ExtractProgress { done: 0, total });

    for batch_start in (0..total).step_by(EXTRACT_BATCH_SIZE) {
        let batch_end = (batch_start + EXTRACT_BATCH_SIZE).min(total);
        for index in batch_start..batch_end {
            let mut entry = archive
                .by_index(index)
                .with_context(|| format!("Failed to read zip entry #{}", index))?;
            let outpath = match entry.enclosed_name() {
                Some(rel) => extract_to_dir.join(rel),
                None => {
                    return Err(anyhow::anyhow!(
                        "Zip entry '{}' escapes the extraction directory",
                        entry.name()
                    ));
                }
            };

            if entry.is_dir() {
                fs::create_dir_all(&outpath).with_context(|| {
                    format!("Failed to create directory {}", outpath.display())
                })?;
                continue;
            }
            if let Some(parent) = outpath.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {}", parent.display()))?;
            }
            let mut out = File::create(&outpath)
                .with_context(|| format!("Failed to create {}", outpath.display()))?;
            io::copy(&mut entry, &mut out)
                .with_context(|| format!("Failed to unpack {}", outpath.display()))?;
        }
        log::debug!("Unpacked zip entries {}..{} of {}", batch_start, batch_end, total);
        on_progress(ExtractProgress {
            done: batch_end,
            total,
        });
    }
    Ok(total)
}

fn extract_tar_gz(
    archive_path: &Path,
    extract_to_dir: &Path,
    on_progress: &mut dyn FnMut(ExtractProgress),
) -> Result<usize> {
    let archive_file = File::open(archive_path)
        .with_context(|| format!("Failed to open archive file: {}", archive_path.display()))?;
    let gz_decoder = flate2::read::GzDecoder::new(archive_file);
    let mut archive = tar::Archive::new(gz_decoder);

    let mut done = 0;
    on_progress(ExtractProgress { done, total: 0 });
    let entries = archive
        .entries()
        .with_context(|| format!("Corrupt or unreadable tar.gz archive: {}", archive_path.display()))?;
    for entry in entries {
        let mut entry = entry.context("Failed to read tar entry")?;
        let name = entry.path().map(|p| p.display().to_string()).unwrap_or_default();
        let inside = entry
            .unpack_in(extract_to_dir)
            .with_context(|| format!("Failed to unpack tar entry '{}'", name))?;
        if !inside {
            return Err(anyhow::anyhow!(
                "Tar entry '{}' escapes the extraction directory",
                name
            ));
        }
        done += 1;
        if done % EXTRACT_BATCH_SIZE == 0 {
            on_progress(ExtractProgress { done, total: 0 });
        }
    }
    on_progress(ExtractProgress { done, total: done });
    Ok(done)
}

/// Parsed `backup-info.txt`. Unknown keys are kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    pub backup_type: Option<String>,
    pub created: Option<String>,
    pub tables: Option<usize>,
    pub files: Option<usize>,
    pub critical_errors: Option<usize>,
    pub extra: BTreeMap<String, String>,
}

pub fn parse_manifest(text: &str) -> Manifest {
    let mut manifest = Manifest::default();
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        let normalized = key.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        let count = || value.split_whitespace().next().and_then(|v| v.parse().ok());
        match normalized.as_str() {
            "backup_type" | "type" => manifest.backup_type = Some(value.to_string()),
            "created" | "creation_date" | "date" | "created_at" => {
                manifest.created = Some(value.to_string())
            }
            "tables" | "table_count" | "database_tables" => manifest.tables = count(),
            "files" | "file_count" | "total_files" => manifest.files = count(),
            "critical_errors" => manifest.critical_errors = count(),
            "" => {}
            _ => {
                manifest.extra.insert(normalized, value.to_string());
            }
        }
    }
    manifest
}

/// Where the SQL of a backup lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlLayout {
    /// One `backup.sql` holding every table.
    Combined(PathBuf),
    /// A `database/` directory with one `<table>.sql` per table.
    PerTable(PathBuf),
    Absent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveLayout {
    pub manifest: Manifest,
    pub sql: SqlLayout,
    pub files_root: Option<PathBuf>,
}

impl ArchiveLayout {
    pub fn has_db(&self) -> bool {
        self.sql != SqlLayout::Absent
    }

    pub fn has_files(&self) -> bool {
        self.files_root.is_some()
    }
}

/// Checks an extraction directory for the manifest and at least one of the
/// database or files sections.
pub fn inspect_layout(extract_dir: &Path) -> Result<ArchiveLayout> {
    let manifest_path = extract_dir.join(MANIFEST_FILE);
    let manifest_text = fs::read_to_string(&manifest_path).with_context(|| {
        format!(
            "Backup manifest {} missing from archive",
            MANIFEST_FILE
        )
    })?;
    let manifest = parse_manifest(&manifest_text);

    let combined = extract_dir.join(COMBINED_SQL_FILE);
    let per_table = extract_dir.join(DATABASE_DIR);
    let sql = if combined.is_file() {
        SqlLayout::Combined(combined)
    } else if per_table.is_dir() && dir_has_sql(&per_table)? {
        SqlLayout::PerTable(per_table)
    } else {
        SqlLayout::Absent
    };

    let files_dir = extract_dir.join(FILES_DIR);
    let files_root = files_dir.is_dir().then_some(files_dir);

    let layout = ArchiveLayout {
        manifest,
        sql,
        files_root,
    };
    if !layout.has_db() && !layout.has_files() {
        return Err(anyhow::anyhow!(
            "Archive contains neither {} / {}/ nor {}/",
            COMBINED_SQL_FILE,
            DATABASE_DIR,
            FILES_DIR
        ));
    }
    if let Some(expected) = layout.manifest.critical_errors.filter(|n| *n > 0) {
        log::warn!(
            "Backup manifest reports {} critical errors during backup; restored data may be incomplete",
            expected
        );
    }
    Ok(layout)
}

fn dir_has_sql(dir: &Path) -> Result<bool> {
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "sql") {
            return Ok(true);
        }
    }
    Ok(false)
}
