//! Raw sentence log file

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{Result, TelemetryError};

/// Appends every raw line the reader sees to a file, flushed per line
pub struct TrackLogger {
    path: PathBuf,
    writer: BufWriter<File>,
    lines_written: u64,
}

impl TrackLogger {
    /// Create (truncate) the file and write the header
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|e| TelemetryError::from_open(&path.display().to_string(), e))?;
        let mut writer = BufWriter::new(file);
        writeln!(
            writer,
            "# GPS Log - Started {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.6f")
        )?;
        writer.flush()?;

        info!("GPS track logging to {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            lines_written: 0,
        })
    }

    pub fn write_line(&mut self, line: &str) {
        let result = writeln!(self.writer, "{}", line).and_then(|_| self.writer.flush());
        match result {
            Ok(()) => self.lines_written += 1,
            Err(e) => warn!("Failed to write GPS log {}: {}", self.path.display(), e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lines_written(&self) -> u64 {
        self.lines_written
    }
}

impl Drop for TrackLogger {
    fn drop(&mut self) {
        let _ = self.writer.flush();
        info!(
            "GPS track log closed: {} ({} lines)",
            self.path.display(),
            self.lines_written
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_and_lines() {
        let path = std::env::temp_dir().join(format!("gps-track-{}.nmea", std::process::id()));
        {
            let mut logger = TrackLogger::create(&path).unwrap();
            logger.write_line("$GPGGA,1");
            logger.write_line("$GPRMC,2");
            assert_eq!(logger.lines_written(), 2);
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert!(lines[0].starts_with("# GPS Log - Started "));
        assert_eq!(&lines[1..], &["$GPGGA,1", "$GPRMC,2"]);
        let _ = std::fs::remove_file(&path);
    }
}
