use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use txsum_mem::error::{Error as MemError, Result as MemResult};
use txsum_mem::Storage;

fn storage_err(op: &str, path: &str, e: impl std::fmt::Display) -> MemError {
    MemError::Storage(format!("{op} '{path}': {e}"))
}

/// Local filesystem storage (rooted at the host filesystem).
#[derive(Debug, Clone, Default)]
pub struct FsStorage;

impl FsStorage {
    pub fn new() -> Self {
        Self
    }
}

impl Storage for FsStorage {
    /// Temp file in the target directory, fsync, then rename over the target.
    /// A missing directory is an error, never recreated.
    fn write(&self, path: &str, bytes: &[u8]) -> MemResult<()> {
        let p = Path::new(path);
        let parent = match p.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };

        let mut tmp = NamedTempFile::new_in(parent).map_err(|e| storage_err("tempfile", path, e))?;
        tmp.write_all(bytes)
            .map_err(|e| storage_err("write", path, e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| storage_err("fsync", path, e))?;
        tmp.persist(p)
            .map_err(|e| storage_err("rename", path, e.error))?;
        Ok(())
    }

    fn create_dir(&self, path: &str) -> MemResult<()> {
        fs::create_dir_all(path).map_err(|e| storage_err("mkdir", path, e))
    }

    fn read_range(&self, path: &str, offset: u64, len: usize) -> MemResult<Vec<u8>> {
        let mut f = File::open(Path::new(path)).map_err(|e| storage_err("open", path, e))?;
        f.seek(SeekFrom::Start(offset))
            .map_err(|e| storage_err("seek", path, e))?;
        let mut buf = vec![0u8; len];
        f.read_exact(&mut buf)
            .map_err(|e| storage_err("read", path, e))?;
        Ok(buf)
    }

    fn delete(&self, path: &str) -> MemResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_err("delete", path, e)),
        }
    }

    fn list(&self, prefix: &str) -> MemResult<Vec<String>> {
        let prefix_path = Path::new(prefix);
        let mut results = Vec::new();

        if !prefix_path.exists() {
            return Ok(results);
        }

        if prefix_path.is_file() {
            results.push(prefix.to_string());
            return Ok(results);
        }

        fn visit_dirs(dir: &Path, results: &mut Vec<String>) -> std::io::Result<()> {
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    visit_dirs(&path, results)?;
                } else if let Some(s) = path.to_str() {
                    results.push(s.to_string());
                }
            }
            Ok(())
        }

        visit_dirs(prefix_path, &mut results).map_err(|e| storage_err("list", prefix, e))?;
        results.sort();
        Ok(results)
    }

    fn size(&self, path: &str) -> MemResult<u64> {
        fs::metadata(path)
            .map(|m| m.len())
            .map_err(|e| storage_err("stat", path, e))
    }

    fn remove_prefix(&self, prefix: &str) -> MemResult<()> {
        let p = Path::new(prefix);
        let result = if p.is_dir() {
            fs::remove_dir_all(p)
        } else if p.exists() {
            fs::remove_file(p)
        } else {
            Ok(())
        };
        result.map_err(|e| storage_err("remove", prefix, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_is_visible_whole_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("run-1");
        let path = root.join("segment-000000.seg");
        let path = path.to_str().unwrap();

        let fs = FsStorage::new();
        fs.create_dir(root.to_str().unwrap()).unwrap();
        fs.write(path, b"hello segment").unwrap();
        assert_eq!(fs.read_range(path, 6, 7).unwrap(), b"segment");
        assert_eq!(fs.size(path).unwrap(), 13);
        assert_eq!(fs.list(root.to_str().unwrap()).unwrap(), vec![path.to_string()]);
    }

    #[test]
    fn short_reads_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.seg");
        let path = path.to_str().unwrap();
        let fs = FsStorage::new();
        fs.write(path, b"abc").unwrap();
        assert!(fs.read_range(path, 0, 10).is_err());
    }

    #[test]
    fn delete_and_remove_prefix_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("spill");
        let seg = root.join("a.seg");
        let fs = FsStorage::new();
        fs.create_dir(root.to_str().unwrap()).unwrap();
        fs.write(seg.to_str().unwrap(), b"1").unwrap();

        fs.delete(seg.to_str().unwrap()).unwrap();
        fs.delete(seg.to_str().unwrap()).unwrap();
        fs.remove_prefix(root.to_str().unwrap()).unwrap();
        assert!(!root.exists());
        fs.remove_prefix(root.to_str().unwrap()).unwrap();
    }

    #[test]
    fn write_into_a_removed_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("run-gone");
        let fs = FsStorage::new();
        fs.create_dir(root.to_str().unwrap()).unwrap();
        fs.remove_prefix(root.to_str().unwrap()).unwrap();

        let seg = root.join("segment-000000.seg");
        assert!(fs.write(seg.to_str().unwrap(), b"late").is_err());
        assert!(!root.exists());
    }
}
