//! JSONL record streams and atomically replaced files.
//!
//! Appends are flushed per record. A crash can leave at most one partial
//! trailing line: readers skip it with a warning, and reopening for append
//! cuts it off so the next record starts on a fresh line.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;

/// Append-only JSONL writer.
#[derive(Debug)]
pub struct JsonlAppender {
    path: PathBuf,
    file: File,
}

impl JsonlAppender {
    /// Open `path` for appending, creating it and its parent directory.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        ensure_parent(path)?;
        truncate_partial_tail(path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| StoreError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize one record as a single line and flush it.
    pub fn append<T: Serialize>(&mut self, record: &T) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .and_then(|_| self.file.flush())
            .map_err(|e| StoreError::io(&self.path, e))
    }

    /// Force appended data to disk. Called before a checkpoint is committed.
    pub fn sync(&mut self) -> Result<(), StoreError> {
        self.file
            .sync_data()
            .map_err(|e| StoreError::io(&self.path, e))
    }
}

/// Drop an unterminated last line left behind by an interrupted append.
fn truncate_partial_tail(path: &Path) -> Result<(), StoreError> {
    let io_err = |e: std::io::Error| StoreError::io(path, e);
    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(io_err(e)),
    };
    let len = file.metadata().map_err(io_err)?.len();
    if len == 0 {
        return Ok(());
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1)).map_err(io_err)?;
    file.read_exact(&mut last).map_err(io_err)?;
    if last[0] == b'\n' {
        return Ok(());
    }

    file.seek(SeekFrom::Start(0)).map_err(io_err)?;
    let mut bytes = Vec::with_capacity(len as usize);
    file.read_to_end(&mut bytes).map_err(io_err)?;
    let keep = bytes
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |idx| idx + 1);
    tracing::warn!(
        path = %path.display(),
        dropped_bytes = len - keep as u64,
        "Truncating partial trailing JSONL line"
    );
    file.set_len(keep as u64).map_err(io_err)?;
    file.sync_all().map_err(io_err)
}

/// Records read from a JSONL file.
#[derive(Debug)]
pub struct JsonlRead<T> {
    pub records: Vec<T>,
    /// 1-based numbers of lines that failed to parse.
    pub malformed_lines: Vec<usize>,
}

/// Read every parseable record of `path`. A missing file reads as empty.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<JsonlRead<T>, StoreError> {
    let mut out = JsonlRead {
        records: Vec::new(),
        malformed_lines: Vec::new(),
    };

    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| StoreError::io(path, e))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(trimmed) {
            Ok(record) => out.records.push(record),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    line = idx + 1,
                    error = %e,
                    "Skipping malformed JSONL line"
                );
                out.malformed_lines.push(idx + 1);
            }
        }
    }

    Ok(out)
}

/// Replace `path` with `records` via a temporary file and rename.
pub fn write_jsonl_atomic<T: Serialize>(path: &Path, records: &[T]) -> Result<(), StoreError> {
    let mut buf = Vec::new();
    for record in records {
        serde_json::to_writer(&mut buf, record)?;
        buf.push(b'\n');
    }
    write_bytes_atomic(path, &buf)
}

/// Replace `path` with pretty-printed JSON via a temporary file and rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let buf = serde_json::to_vec_pretty(value)?;
    write_bytes_atomic(path, &buf)
}

/// Read a JSON document, `None` if the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

pub(crate) fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    ensure_parent(path)?;
    let tmp = partial_path(path);
    {
        let mut file = File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
        file.write_all(bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| StoreError::io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

fn ensure_parent(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        key: String,
        value: u32,
    }

    fn row(key: &str, value: u32) -> Row {
        Row {
            key: key.to_string(),
            value,
        }
    }

    #[test]
    fn test_append_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/rows.jsonl");

        let mut appender = JsonlAppender::open(&path).unwrap();
        appender.append(&row("a", 1)).unwrap();
        appender.append(&row("b", 2)).unwrap();
        appender.sync().unwrap();
        drop(appender);

        let mut appender = JsonlAppender::open(&path).unwrap();
        appender.append(&row("c", 3)).unwrap();

        let read: JsonlRead<Row> = read_jsonl(&path).unwrap();
        assert_eq!(read.records, vec![row("a", 1), row("b", 2), row("c", 3)]);
        assert!(read.malformed_lines.is_empty());
    }

    #[test]
    fn test_read_skips_truncated_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.jsonl");
        fs::write(&path, "{\"key\":\"a\",\"value\":1}\n\n{\"key\":\"b\",\"va").unwrap();

        let read: JsonlRead<Row> = read_jsonl(&path).unwrap();
        assert_eq!(read.records, vec![row("a", 1)]);
        assert_eq!(read.malformed_lines, vec![3]);
    }

    #[test]
    fn test_reopen_cuts_partial_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.jsonl");
        fs::write(&path, "{\"key\":\"a\",\"value\":1}\n{\"key\":\"b\",\"va").unwrap();

        let mut appender = JsonlAppender::open(&path).unwrap();
        appender.append(&row("c", 3)).unwrap();
        drop(appender);

        let read: JsonlRead<Row> = read_jsonl(&path).unwrap();
        assert_eq!(read.records, vec![row("a", 1), row("c", 3)]);
        assert!(read.malformed_lines.is_empty());
    }

    #[test]
    fn test_reopen_without_any_newline_starts_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.jsonl");
        fs::write(&path, "{\"key\":\"a\"").unwrap();

        let mut appender = JsonlAppender::open(&path).unwrap();
        appender.append(&row("b", 2)).unwrap();
        drop(appender);

        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"key\":\"b\",\"value\":2}\n");
    }

    #[test]
    fn test_read_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let read: JsonlRead<Row> = read_jsonl(&dir.path().join("absent.jsonl")).unwrap();
        assert!(read.records.is_empty());
    }

    #[test]
    fn test_atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        write_jsonl_atomic(&path, &[row("a", 1), row("b", 2)]).unwrap();
        write_jsonl_atomic(&path, &[row("c", 3)]).unwrap();

        let read: JsonlRead<Row> = read_jsonl(&path).unwrap();
        assert_eq!(read.records, vec![row("c", 3)]);
        assert!(!dir.path().join("out.jsonl.partial").exists());
    }

    #[test]
    fn test_json_roundtrip_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor.json");
        assert!(read_json::<Row>(&path).unwrap().is_none());
        write_json_atomic(&path, &row("x", 9)).unwrap();
        assert_eq!(read_json::<Row>(&path).unwrap(), Some(row("x", 9)));
    }
}
