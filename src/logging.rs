//! Logging utilities for sqlfluff_ls.
//!
//! Provides timestamp generation, log directory management, logger setup and
//! the output log that records every sqlfluff command line and its raw output.

use log::{debug, warn};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

// ============================================================================
// Timestamps
// ============================================================================

/// Local wall-clock time as `YYYY-MM-DD HH:MM:SS.mmm`, formatted through libc.
pub fn timestamp() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    format!(
        "{}.{:03}",
        format_local_seconds(elapsed.as_secs()),
        elapsed.subsec_millis()
    )
}

fn format_local_seconds(secs: u64) -> String {
    use libc::{c_char, localtime_r, strftime, time_t, tm};

    let clock = secs as time_t;
    // SAFETY: an all-zero tm is a valid value; localtime_r only writes into it.
    let mut broken_down: tm = unsafe { std::mem::zeroed() };
    // SAFETY: both pointers refer to live locals for the duration of the call.
    unsafe { localtime_r(&clock, &mut broken_down) };

    let mut out = [0u8; 32];
    const PATTERN: &[u8] = b"%Y-%m-%d %H:%M:%S\0";
    // SAFETY: PATTERN is NUL-terminated and `out.len()` bounds the write.
    let written = unsafe {
        strftime(
            out.as_mut_ptr().cast::<c_char>(),
            out.len(),
            PATTERN.as_ptr().cast::<c_char>(),
            &broken_down,
        )
    };
    String::from_utf8_lossy(&out[..written]).into_owned()
}

// ============================================================================
// Log Directory & Configuration
// ============================================================================

/// Directory for the output log: `SQLFLUFF_LS_TMP_DIR`, else `TMPDIR`, else the
/// platform temp dir.
pub fn log_dir() -> PathBuf {
    std::env::var_os("SQLFLUFF_LS_TMP_DIR")
        .or_else(|| std::env::var_os("TMPDIR"))
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}

/// The output log is written to disk unless `SQLFLUFF_LS_OUTPUT_LOG=0`.
pub fn output_log_enabled() -> bool {
    std::env::var("SQLFLUFF_LS_OUTPUT_LOG")
        .map_or(true, |v| v != "0")
}

/// Path of the output log file.
pub fn output_log_path() -> PathBuf {
    log_dir().join("sqlfluff_ls_output.log")
}

/// Initialise env_logger on stderr; stdout is reserved for LSP frames.
pub fn init_logger(level: Option<&str>) {
    let env = env_logger::Env::default().default_filter_or(level.unwrap_or("warn"));
    let _ = env_logger::Builder::from_env(env)
        .target(env_logger::Target::Stderr)
        .try_init();
}

// ============================================================================
// Output Log
// ============================================================================

const HYPHENATED_LINE: &str = "------------------------------------------------------------";

/// Where output log lines end up.
enum OutputSink {
    File(Option<File>),
    Memory(Vec<String>),
}

/// Timestamped record of command lines, raw stdout and raw stderr.
///
/// Every line is mirrored to `log::debug!`. The file-backed variant appends to
/// [`output_log_path`]; the in-memory variant keeps lines for inspection.
pub struct OutputLog {
    path: Option<PathBuf>,
    sink: Mutex<OutputSink>,
}

impl OutputLog {
    /// Open the output log under the log directory, or a log-facade-only sink when disabled.
    pub fn open() -> Self {
        if !output_log_enabled() {
            return Self {
                path: None,
                sink: Mutex::new(OutputSink::File(None)),
            };
        }

        let path = output_log_path();
        let file = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => {
                debug!("output log -> {}", path.display());
                Some(f)
            }
            Err(err) => {
                warn!("failed to open output log at {}: {}", path.display(), err);
                None
            }
        };
        Self {
            path: file.as_ref().map(|_| path),
            sink: Mutex::new(OutputSink::File(file)),
        }
    }

    /// An output log that keeps its lines in memory.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            sink: Mutex::new(OutputSink::Memory(Vec::new())),
        }
    }

    /// File backing this log, if any.
    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    pub fn append_line(&self, line: &str) {
        debug!("[output] {}", line);
        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *sink {
            OutputSink::File(Some(f)) => {
                let _ = writeln!(f, "[{}] {}", timestamp(), line);
            }
            OutputSink::File(None) => {}
            OutputSink::Memory(lines) => lines.push(line.to_string()),
        }
    }

    pub fn append_hyphenated_line(&self) {
        self.append_line(HYPHENATED_LINE);
    }

    /// Append a titled section header, e.g. "Executing Command".
    pub fn append_section(&self, title: &str) {
        self.append_line(&format!("--------------------{title}--------------------"));
    }

    /// Lines captured by an in-memory log (empty for file-backed logs).
    pub fn lines(&self) -> Vec<String> {
        let sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        match &*sink {
            OutputSink::Memory(lines) => lines.clone(),
            OutputSink::File(_) => Vec::new(),
        }
    }

    /// Whether any captured line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_shape() {
        let ts = timestamp();
        let (clock, millis) = ts.rsplit_once('.').expect("millisecond suffix");
        assert_eq!(millis.len(), 3, "{ts}");
        assert_eq!(clock.len(), 19, "{ts}");
        assert_eq!(&clock[4..5], "-");
        assert_eq!(&clock[13..14], ":");
    }

    #[test]
    fn test_epoch_formats_to_full_date() {
        assert_eq!(format_local_seconds(0).len(), 19);
    }

    #[test]
    fn test_log_dir_is_not_empty() {
        assert!(!log_dir().as_os_str().is_empty());
    }

    #[test]
    fn test_output_log_path_file_name() {
        assert!(output_log_path().ends_with("sqlfluff_ls_output.log"));
    }

    #[test]
    fn test_in_memory_log_captures_lines() {
        let log = OutputLog::in_memory();
        log.append_section("Executing Command");
        log.append_line("sqlfluff lint --format json -");
        log.append_hyphenated_line();

        let lines = log.lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("Executing Command"));
        assert!(log.contains("--format json"));
        assert!(log.path().is_none());
    }
}
