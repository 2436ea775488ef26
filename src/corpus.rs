//! Discovery, loading, and writing of JSONL record files.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use walkdir::WalkDir;

use crate::error::{Result, SftpackError};
use crate::record::RawRecord;

const RECORD_EXTENSIONS: [&str; 2] = ["jsonl", "json"];

/// Controls how input paths are expanded into record files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// Descend into subdirectories.
    pub recursive: bool,
    /// Follow symbolic links while walking directories.
    pub follow_symlinks: bool,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            follow_symlinks: false,
        }
    }
}

fn is_record_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| RECORD_EXTENSIONS.contains(&ext))
}

/// Expands files and directories into a sorted list of `.jsonl`/`.json` files.
///
/// Files named explicitly are kept regardless of extension; directory entries are filtered.
pub fn collect_record_files<P: AsRef<Path>>(
    inputs: &[P],
    opts: DiscoveryOptions,
) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        let path = input.as_ref();
        let metadata = path
            .metadata()
            .map_err(|err| SftpackError::io(err, Some(path.to_path_buf())))?;
        if metadata.is_file() {
            files.push(path.to_path_buf());
            continue;
        }
        let mut walker = WalkDir::new(path)
            .follow_links(opts.follow_symlinks)
            .sort_by_file_name();
        if !opts.recursive {
            walker = walker.max_depth(1);
        }
        for entry in walker {
            let entry = entry.map_err(|err| SftpackError::Internal(err.to_string()))?;
            if entry.file_type().is_file() && is_record_file(entry.path()) {
                files.push(entry.into_path());
            }
        }
    }
    if files.is_empty() {
        return Err(SftpackError::InvalidConfig(
            "no record files discovered in provided inputs".into(),
        ));
    }
    Ok(files)
}

/// Reads one JSON value per non-blank line.
pub fn read_jsonl<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<Vec<T>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|err| SftpackError::io(err, Some(path.to_path_buf())))?;
    let mut items = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|err| SftpackError::io(err, Some(path.to_path_buf())))?;
        if line.trim().is_empty() {
            continue;
        }
        let item = serde_json::from_str(&line).map_err(|err| {
            SftpackError::Serialization(format!("{}:{}: {err}", path.display(), line_no + 1))
        })?;
        items.push(item);
    }
    Ok(items)
}

/// Loads records from a single file. `.json` files hold an array; anything else is JSONL.
pub fn load_record_file<P: AsRef<Path>>(path: P) -> Result<Vec<RawRecord>> {
    let path = path.as_ref();
    if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
        let file =
            File::open(path).map_err(|err| SftpackError::io(err, Some(path.to_path_buf())))?;
        return serde_json::from_reader(BufReader::new(file)).map_err(|err| {
            SftpackError::Serialization(format!("{}: {err}", path.display()))
        });
    }
    read_jsonl(path)
}

/// Discovers and loads every record under `inputs`, preserving file order.
pub fn load_records<P: AsRef<Path>>(inputs: &[P], opts: DiscoveryOptions) -> Result<Vec<RawRecord>> {
    let mut records = Vec::new();
    for path in collect_record_files(inputs, opts)? {
        let loaded = load_record_file(&path)?;
        debug!("loaded {} records from {}", loaded.len(), path.display());
        records.extend(loaded);
    }
    Ok(records)
}

/// Serialises `items` as JSON lines into `writer`.
pub fn write_jsonl<T: Serialize, W: Write>(writer: W, items: &[T]) -> Result<()> {
    let mut writer = BufWriter::new(writer);
    for item in items {
        serde_json::to_writer(&mut writer, item)?;
        writer
            .write_all(b"\n")
            .map_err(|err| SftpackError::io(err, None))?;
    }
    writer.flush().map_err(|err| SftpackError::io(err, None))
}

/// Creates `path` and writes `items` to it as JSON lines.
pub fn write_jsonl_file<T: Serialize, P: AsRef<Path>>(path: P, items: &[T]) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|err| SftpackError::io(err, Some(path.to_path_buf())))?;
    write_jsonl(file, items).map_err(|err| match err {
        SftpackError::Io { source, path: None } => SftpackError::io(source, Some(path.to_path_buf())),
        other => other,
    })
}
