//! Line-capped append-only log files for downstream server stderr.
//!
//! Each server gets `logs/<server>.stderr.log`. When a file exceeds the line
//! cap it is rotated to `<name>.1` and a fresh file is started; one rotation
//! is kept.

use anyhow::Result;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

const DEFAULT_LINE_CAP: usize = 2000;

pub struct LogSink {
    path: PathBuf,
    line_cap: usize,
    lines_written: usize,
}

impl LogSink {
    pub fn new(path: PathBuf) -> Self {
        Self::with_cap(path, DEFAULT_LINE_CAP)
    }

    pub fn with_cap(path: PathBuf, line_cap: usize) -> Self {
        // Count existing lines so the cap survives reopening the sink
        let lines_written = std::fs::read_to_string(&path)
            .map(|c| c.lines().count())
            .unwrap_or(0);
        Self {
            path,
            line_cap,
            lines_written,
        }
    }

    pub fn append(&mut self, line: &str) -> Result<()> {
        if self.lines_written >= self.line_cap {
            self.rotate()?;
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;
        self.lines_written += 1;
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        let rotated = self.path.with_extension("log.1");
        // Best effort: a missing current file just means we start fresh
        let _ = std::fs::rename(&self.path, &rotated);
        self.lines_written = 0;
        Ok(())
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_read_back() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut sink = LogSink::new(tmp.path().join("alpha.stderr.log"));
        sink.append("line one").unwrap();
        sink.append("line two").unwrap();
        let content = std::fs::read_to_string(sink.path()).unwrap();
        assert_eq!(content, "line one\nline two\n");
    }

    #[test]
    fn test_rotation_at_cap() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("beta.stderr.log");
        let mut sink = LogSink::with_cap(path.clone(), 2);
        sink.append("1").unwrap();
        sink.append("2").unwrap();
        sink.append("3").unwrap();

        let current = std::fs::read_to_string(&path).unwrap();
        assert_eq!(current, "3\n");
        let rotated = std::fs::read_to_string(path.with_extension("log.1")).unwrap();
        assert_eq!(rotated, "1\n2\n");
    }

    #[test]
    fn test_reopen_counts_existing_lines() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("gamma.stderr.log");
        {
            let mut sink = LogSink::with_cap(path.clone(), 3);
            sink.append("a").unwrap();
            sink.append("b").unwrap();
        }
        let mut sink = LogSink::with_cap(path.clone(), 3);
        sink.append("c").unwrap();
        sink.append("d").unwrap(); // triggers rotation
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "d\n");
    }
}
