//! Filesystem helpers shared by the stores.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use serde::Serialize;

use crate::error::{Result, StratumError};

/// Maximum file size that can be read into memory (64 MB).
///
/// Outcome partitions are per day, and the layer snapshot is pruned by
/// retention; under normal usage both stay well under this limit.
pub const MAX_FILE_SIZE: u64 = 64 * 1024 * 1024;

/// Read a file into a string, refusing files larger than [`MAX_FILE_SIZE`].
pub fn read_to_string_limited(path: &Path) -> Result<String> {
    read_to_string_with_limit(path, MAX_FILE_SIZE)
}

/// Read a file into a string with a custom size limit.
pub fn read_to_string_with_limit(path: &Path, max_size: u64) -> Result<String> {
    let metadata = fs::metadata(path).map_err(|e| StratumError::storage(path, e))?;

    let size = metadata.len();
    if size > max_size {
        return Err(StratumError::invalid_state(format!(
            "file {} is too large ({} bytes, max {} bytes)",
            path.display(),
            size,
            max_size
        )));
    }

    fs::read_to_string(path).map_err(|e| StratumError::storage(path, e))
}

/// Serialize a value as pretty JSON and write it atomically.
///
/// Writes to a dot-prefixed temp file next to `path`, fsyncs, then renames.
/// Readers see either the old content or the new content, never a mix.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    write_atomic(path, json.as_bytes())
}

/// Write bytes atomically via temp file + fsync + rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StratumError::invalid_state(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(parent).map_err(|e| StratumError::storage(parent, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = parent.join(format!(".{}.tmp", file_name));

    {
        let mut file =
            fs::File::create(&temp_path).map_err(|e| StratumError::storage(&temp_path, e))?;
        file.write_all(bytes)
            .map_err(|e| StratumError::storage(&temp_path, e))?;
        file.sync_all()
            .map_err(|e| StratumError::storage(&temp_path, e))?;
    }

    fs::rename(&temp_path, path).map_err(|e| StratumError::storage(path, e))?;
    Ok(())
}

/// Append serialized records to a JSONL file, one per line, then fsync.
///
/// Returns the file length before the append, the point to hand to
/// [`truncate_jsonl`] to undo it. A failed write or sync truncates the
/// partial lines away before the error is returned.
pub fn append_jsonl<T: Serialize>(path: &Path, records: &[T]) -> Result<u64> {
    if records.is_empty() {
        return Ok(fs::metadata(path).map(|m| m.len()).unwrap_or(0));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StratumError::storage(parent, e))?;
    }

    let mut buf = String::new();
    for record in records {
        buf.push_str(&serde_json::to_string(record)?);
        buf.push('\n');
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StratumError::storage(path, e))?;
    let start = file
        .metadata()
        .map_err(|e| StratumError::storage(path, e))?
        .len();

    let written = file
        .write_all(buf.as_bytes())
        .and_then(|()| file.sync_data());
    if let Err(e) = written {
        if let Err(undo) = file.set_len(start).and_then(|()| file.sync_data()) {
            tracing::error!(
                path = %path.display(),
                error = %undo,
                "could not truncate a failed append"
            );
        }
        return Err(StratumError::storage(path, e));
    }
    Ok(start)
}

/// Cut a JSONL file back to `len` bytes and fsync.
pub fn truncate_jsonl(path: &Path, len: u64) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| StratumError::storage(path, e))?;
    file.set_len(len)
        .and_then(|()| file.sync_data())
        .map_err(|e| StratumError::storage(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_to_string_limited_success() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("test.txt");
        fs::write(&path, "Hello, world!").unwrap();
        assert_eq!(read_to_string_limited(&path).unwrap(), "Hello, world!");
    }

    #[test]
    fn test_read_to_string_limited_nonexistent() {
        let temp = TempDir::new().unwrap();
        let result = read_to_string_limited(&temp.path().join("missing.txt"));
        assert!(matches!(result, Err(StratumError::Storage { .. })));
    }

    #[test]
    fn test_read_to_string_with_limit_boundary() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("boundary.txt");
        fs::write(&path, "x".repeat(100)).unwrap();

        assert!(read_to_string_with_limit(&path, 100).is_ok());
        let err = read_to_string_with_limit(&path, 99).unwrap_err().to_string();
        assert!(err.contains("too large"));
    }

    #[test]
    fn test_write_json_atomic_replaces_and_cleans_up() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("state.json");

        write_json_atomic(&path, &vec![1, 2, 3]).unwrap();
        write_json_atomic(&path, &vec![4]).unwrap();

        let back: Vec<i32> = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back, vec![4]);
        assert!(!temp.path().join("nested").join(".state.json.tmp").exists());
    }

    #[test]
    fn test_append_jsonl_appends_lines() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("log.jsonl");

        assert_eq!(append_jsonl(&path, &["a", "b"]).unwrap(), 0);
        assert_eq!(append_jsonl(&path, &["c"]).unwrap(), 8);
        assert_eq!(append_jsonl::<&str>(&path, &[]).unwrap(), 12);

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "\"a\"\n\"b\"\n\"c\"\n");
    }

    #[test]
    fn test_truncate_jsonl_undoes_append() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("log.jsonl");

        append_jsonl(&path, &["a"]).unwrap();
        let mark = append_jsonl(&path, &["b", "c"]).unwrap();
        truncate_jsonl(&path, mark).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "\"a\"\n");
    }
}
