//! Rolling scheduler log. Grounded on `td/src/events/logger.rs`'s
//! `BufWriter<File>`-per-stream pattern, generalized with byte-size
//! rotation and a bounded archive count instead of one file per
//! execution.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

pub struct RollingLog {
    path: PathBuf,
    writer: BufWriter<File>,
    written_bytes: u64,
    max_bytes: u64,
    max_archives: u32,
}

impl RollingLog {
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64, max_archives: u32) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written_bytes = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self { path, writer: BufWriter::new(file), written_bytes, max_bytes, max_archives })
    }

    pub fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        writeln!(self.writer, "{line}")?;
        self.writer.flush()?;
        self.written_bytes += line.len() as u64 + 1;
        if self.written_bytes >= self.max_bytes {
            self.rotate()?;
        }
        Ok(())
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        self.writer.flush()?;
        debug!(path = %self.path.display(), "rotating scheduler log");

        let oldest = archive_path(&self.path, self.max_archives);
        if oldest.exists() {
            if let Err(e) = fs::remove_file(&oldest) {
                warn!(error = %e, path = %oldest.display(), "failed to drop oldest archived log");
            }
        }
        for index in (1..self.max_archives).rev() {
            let from = archive_path(&self.path, index);
            let to = archive_path(&self.path, index + 1);
            if from.exists() {
                fs::rename(&from, &to)?;
            }
        }
        fs::rename(&self.path, archive_path(&self.path, 1))?;

        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.written_bytes = 0;
        Ok(())
    }
}

fn archive_path(base: &Path, index: u32) -> PathBuf {
    let mut name = base.file_name().and_then(|n| n.to_str()).unwrap_or("log").to_string();
    name.push('.');
    name.push_str(&index.to_string());
    base.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn rotates_once_byte_threshold_is_crossed() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("scheduler").join("log");
        let mut log = RollingLog::open(&path, 20, 3).unwrap();

        log.write_line("0123456789").unwrap();
        assert!(!archive_path(&path, 1).exists());
        log.write_line("0123456789").unwrap();
        assert!(archive_path(&path, 1).exists());
    }

    #[test]
    fn archive_count_is_bounded() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("scheduler").join("log");
        let mut log = RollingLog::open(&path, 5, 2).unwrap();

        for _ in 0..10 {
            log.write_line("0123456789").unwrap();
        }
        assert!(archive_path(&path, 2).exists());
        assert!(!archive_path(&path, 3).exists());
    }
}
