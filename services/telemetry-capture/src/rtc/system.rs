//! System clock backend - delegates to an external clock tool
//!
//! The tool is always run with an explicit argument vector, never through a shell.

use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, NaiveDateTime};
use tracing::{debug, info};

use crate::error::{Result, TelemetryError};

pub struct SystemClock {
    tool: PathBuf,
}

impl SystemClock {
    pub fn new(tool: &Path) -> Self {
        Self {
            tool: tool.to_path_buf(),
        }
    }

    pub fn tool(&self) -> &Path {
        &self.tool
    }

    /// Current hardware clock time
    pub fn read(&self) -> Result<NaiveDateTime> {
        let output = self.run(&["--get-current"])?;
        parse_clock_output(&output).ok_or_else(|| {
            TelemetryError::Connect(format!(
                "unrecognized output from {}: {:?}",
                self.tool.display(),
                output.trim()
            ))
        })
    }

    pub fn set(&self, dt: &NaiveDateTime) -> Result<()> {
        let date_arg = format!("--date={}", dt.format("%Y-%m-%dT%H:%M:%S"));
        self.run(&["--set", &date_arg])?;
        info!("Hardware clock set to {}", dt);
        Ok(())
    }

    /// Copy the system time into the hardware clock
    pub fn sync_from_system(&self) -> Result<()> {
        self.run(&["--systohc"])?;
        info!("Hardware clock synced from system time");
        Ok(())
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        debug!("Running {} {:?}", self.tool.display(), args);

        let output = Command::new(&self.tool)
            .args(args)
            .output()
            .map_err(|e| TelemetryError::from_open(&self.tool.display().to_string(), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TelemetryError::Connect(format!(
                "{} {:?} failed ({}): {}",
                self.tool.display(),
                args,
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Accepts the timestamp shapes common clock tools print, with or without
/// a UTC offset and fractional seconds
pub fn parse_clock_output(output: &str) -> Option<NaiveDateTime> {
    let text = output.lines().map(str::trim).find(|l| !l.is_empty())?;

    const WITH_OFFSET: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%dT%H:%M:%S%.f%:z"];
    for format in WITH_OFFSET {
        if let Ok(dt) = DateTime::parse_from_str(text, format) {
            return Some(dt.naive_local());
        }
    }

    const NAIVE: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];
    NAIVE
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_parse_clock_output() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 15)
            .unwrap()
            .and_hms_opt(13, 45, 30)
            .unwrap();

        assert_eq!(parse_clock_output("2024-03-15 13:45:30\n"), Some(expected));
        assert_eq!(parse_clock_output("2024-03-15T13:45:30"), Some(expected));

        let with_offset = parse_clock_output("2024-03-15 13:45:30.512345+01:00").unwrap();
        assert_eq!(with_offset.date(), expected.date());
        assert_eq!(with_offset.format("%H:%M:%S").to_string(), "13:45:30");

        assert_eq!(parse_clock_output("garbage"), None);
        assert_eq!(parse_clock_output(""), None);
    }

    #[test]
    fn test_missing_tool_is_unavailable() {
        let clock = SystemClock::new(Path::new("/nonexistent/rtc-clock-tool"));
        assert!(clock.read().unwrap_err().is_unavailable());
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_tool_is_error() {
        let clock = SystemClock::new(Path::new("false"));
        assert!(matches!(clock.sync_from_system(), Err(TelemetryError::Connect(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_unparseable_output_is_error() {
        // echo prints its arguments back, which is not a timestamp
        let clock = SystemClock::new(Path::new("echo"));
        assert!(matches!(clock.read(), Err(TelemetryError::Connect(_))));
    }
}
