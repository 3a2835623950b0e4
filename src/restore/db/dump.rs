// siterestore/src/restore/db/dump.rs
use regex::Regex;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use super::splitter::StatementSplitter;
use crate::errors::{RestoreError, Result};
use crate::restore::archive::{COMBINED_SQL_FILE, DATABASE_DIR};
use crate::state::TableItem;

const PREAMBLE_FILE: &str = "000_preamble.sql";

/// Tables to restore, in order, plus the statements that precede the first
/// table of a combined dump.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableQueue {
    pub tables: Vec<TableItem>,
    pub preamble: Option<PathBuf>,
    pub total_size: u64,
}

fn drop_table_pattern() -> Result<Regex> {
    Regex::new(r"(?i)^\s*DROP\s+TABLE\s+IF\s+EXISTS\s+`?([^`\s;]+)`?")
        .map_err(|e| RestoreError::Anyhow(e.into()))
}

/// Table name introduced by a `DROP TABLE IF EXISTS` line.
pub fn table_from_drop(pattern: &Regex, line: &str) -> Option<String> {
    pattern
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Finds the SQL in an extraction directory and builds the table queue.
///
/// A combined `backup.sql` is split once into per-table chunk files under
/// `work_dir`. The dump does not record per-table sizes, so its size is
/// spread evenly over the tables found; that figure only feeds progress.
pub fn discover_tables(extract_dir: &Path, work_dir: &Path) -> Result<TableQueue> {
    let combined = extract_dir.join(COMBINED_SQL_FILE);
    if combined.is_file() {
        return split_combined_dump(&combined, work_dir);
    }
    let per_table = extract_dir.join(DATABASE_DIR);
    if per_table.is_dir() {
        return per_table_files(&per_table);
    }
    Err(RestoreError::Extraction(format!(
        "no {} or {}/ found in {}",
        COMBINED_SQL_FILE,
        DATABASE_DIR,
        extract_dir.display()
    )))
}

fn per_table_files(dir: &Path) -> Result<TableQueue> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "sql"))
        .collect();
    paths.sort();

    let mut queue = TableQueue::default();
    for path in paths {
        let Some(name) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
            continue;
        };
        let size = fs::metadata(&path)?.len();
        queue.total_size += size;
        queue.tables.push(TableItem {
            name,
            sql_path: path,
            size,
            verify: true,
        });
    }
    log::info!(
        "Found {} per-table SQL files in {}",
        queue.tables.len(),
        dir.display()
    );
    Ok(queue)
}

struct Chunk {
    name: String,
    path: PathBuf,
    writer: BufWriter<File>,
}

fn open_chunk(work_dir: &Path, index: usize, name: &str) -> Result<Chunk> {
    let safe: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    let path = work_dir.join(format!("{:04}_{}.sql", index, safe));
    Ok(Chunk {
        name: name.to_string(),
        writer: BufWriter::new(File::create(&path)?),
        path,
    })
}

fn split_combined_dump(dump: &Path, work_dir: &Path) -> Result<TableQueue> {
    fs::create_dir_all(work_dir)?;
    let total_size = fs::metadata(dump)?.len();
    log::info!(
        "Splitting combined dump {} into per-table files",
        dump.display()
    );

    let pattern = drop_table_pattern()?;
    let reader = BufReader::new(File::open(dump)?);
    let mut splitter = StatementSplitter::new();
    let preamble_path = work_dir.join(PREAMBLE_FILE);
    let mut preamble = BufWriter::new(File::create(&preamble_path)?);
    let mut preamble_has_sql = false;
    let mut current: Option<Chunk> = None;
    let mut finished: Vec<(String, PathBuf)> = Vec::new();

    for line in reader.lines() {
        let line = line?;
        if splitter.at_statement_start() {
            if let Some(table) = table_from_drop(&pattern, &line) {
                if let Some(mut chunk) = current.take() {
                    chunk.writer.flush()?;
                    finished.push((chunk.name, chunk.path));
                }
                current = Some(open_chunk(work_dir, finished.len() + 1, &table)?);
            }
        }
        splitter.push_line(&line);

        match current.as_mut() {
            Some(chunk) => writeln!(chunk.writer, "{}", line)?,
            None => {
                preamble_has_sql |= !line.trim().is_empty();
                writeln!(preamble, "{}", line)?;
            }
        }
    }
    if let Some(mut chunk) = current.take() {
        chunk.writer.flush()?;
        finished.push((chunk.name, chunk.path));
    }
    preamble.flush()?;
    drop(preamble);

    if finished.is_empty() {
        // No table boundaries: replay the whole dump as one unit.
        fs::remove_file(&preamble_path)?;
        log::warn!(
            "No DROP TABLE IF EXISTS markers in {}; restoring it as a single unit",
            dump.display()
        );
        return Ok(TableQueue {
            tables: vec![TableItem {
                name: "backup".to_string(),
                sql_path: dump.to_path_buf(),
                size: total_size,
                verify: false,
            }],
            preamble: None,
            total_size,
        });
    }

    let count = finished.len() as u64;
    let share = total_size / count;
    let remainder = total_size % count;
    let tables = finished
        .into_iter()
        .enumerate()
        .map(|(i, (name, sql_path))| TableItem {
            name,
            sql_path,
            size: share + if (i as u64) < remainder { 1 } else { 0 },
            verify: true,
        })
        .collect::<Vec<_>>();
    log::info!("Combined dump holds {} tables", tables.len());

    let preamble = if preamble_has_sql {
        Some(preamble_path)
    } else {
        fs::remove_file(&preamble_path)?;
        None
    };
    Ok(TableQueue {
        tables,
        preamble,
        total_size,
    })
}
