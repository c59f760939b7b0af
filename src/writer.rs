//! Mutually exclusive line output.
//!
//! Workers append whole result lines; a call writes its buffer atomically
//! under a process-internal mutex, so lines never interleave, while the
//! ordering of lines across threads stays unspecified.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Result, SkuaError};

#[derive(Debug)]
pub struct SyncWriter {
    file: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl SyncWriter {
    /// Create (truncate) the output file.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|e| SkuaError::io(path, "create", e))?;
        Ok(Self {
            file: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    /// Append one full record line.
    pub fn write(&self, data: &str) -> Result<()> {
        let mut guard = self
            .file
            .lock()
            .map_err(|_| SkuaError::validation("output writer mutex poisoned"))?;
        guard
            .write_all(data.as_bytes())
            .map_err(|e| SkuaError::io(&self.path, "write", e))
    }

    /// Flush buffered output. Call once after the last chunk.
    pub fn finish(&self) -> Result<()> {
        let mut guard = self
            .file
            .lock()
            .map_err(|_| SkuaError::validation("output writer mutex poisoned"))?;
        guard
            .flush()
            .map_err(|e| SkuaError::io(&self.path, "flush", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_lines_never_interleave() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let writer = Arc::new(SyncWriter::create(&path).unwrap());

        std::thread::scope(|scope| {
            for t in 0..4 {
                let writer = Arc::clone(&writer);
                scope.spawn(move || {
                    for i in 0..50 {
                        writer.write(&format!("t{}r{}\tdata\n", t, i)).unwrap();
                    }
                });
            }
        });
        writer.finish().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 200);
        for line in lines {
            // Every line must be exactly one worker's record.
            assert!(line.starts_with('t'));
            assert!(line.ends_with("\tdata"));
        }
    }

    #[test]
    fn test_create_in_missing_directory_fails() {
        let err = SyncWriter::create(Path::new("/nonexistent/dir/out.txt")).unwrap_err();
        assert!(matches!(err, SkuaError::Io { .. }), "{}", err);
    }
}
