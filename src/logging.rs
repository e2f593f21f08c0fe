//! Diagnostic file logger for the dispatch loop and termination sequence.
//!
//! Independent of the `tracing` subscriber in [`crate::telemetry`] so
//! tests can flip it on without installing a global subscriber. Gated by
//! the `SUBJECTPTY_DEBUG_LOG` environment variable rather than a config
//! struct, since this crate has no CLI layer of its own.

use std::env;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

const LOG_MAX_BYTES: u64 = 5 * 1024 * 1024;
static LOG_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_STATE: OnceLock<Mutex<LogState>> = OnceLock::new();
static INIT: OnceLock<()> = OnceLock::new();

pub fn log_file_path() -> PathBuf {
    env::temp_dir().join("subjectpty_debug.log")
}

struct LogWriter {
    path: PathBuf,
    file: fs::File,
    bytes_written: u64,
}

impl LogWriter {
    fn new(path: PathBuf) -> Option<Self> {
        let mut bytes_written = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        if bytes_written > LOG_MAX_BYTES {
            let _ = fs::remove_file(&path);
            bytes_written = 0;
        }
        let file = fs::OpenOptions::new().create(true).append(true).open(&path).ok()?;
        Some(Self { path, file, bytes_written })
    }

    fn rotate_if_needed(&mut self, next_len: usize) {
        if self.bytes_written.saturating_add(next_len as u64) <= LOG_MAX_BYTES {
            return;
        }
        if let Ok(file) = fs::OpenOptions::new().create(true).write(true).truncate(true).open(&self.path) {
            self.file = file;
            self.bytes_written = 0;
        }
    }

    fn write_line(&mut self, line: &str) {
        self.rotate_if_needed(line.len());
        if self.file.write_all(line.as_bytes()).is_ok() {
            self.bytes_written = self.bytes_written.saturating_add(line.len() as u64);
        }
    }
}

#[derive(Default)]
struct LogState {
    writer: Option<LogWriter>,
}

fn log_state() -> &'static Mutex<LogState> {
    LOG_STATE.get_or_init(|| Mutex::new(LogState::default()))
}

fn ensure_init() {
    INIT.get_or_init(|| {
        let enabled = env::var_os("SUBJECTPTY_DEBUG_LOG").is_some();
        LOG_ENABLED.store(enabled, Ordering::Relaxed);
        if enabled {
            let mut state = log_state().lock().unwrap_or_else(|p| p.into_inner());
            state.writer = LogWriter::new(log_file_path());
        }
    });
}

/// Append a timestamped line to the debug log, a no-op unless
/// `SUBJECTPTY_DEBUG_LOG` is set.
pub fn log_debug(msg: &str) {
    ensure_init();
    if !LOG_ENABLED.load(Ordering::Relaxed) {
        return;
    }
    let timestamp = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    let line = format!("[{timestamp}] {msg}\n");
    let mut state = log_state().lock().unwrap_or_else(|p| p.into_inner());
    if let Some(writer) = state.writer.as_mut() {
        writer.write_line(&line);
    }
}

#[cfg(test)]
pub(crate) fn set_enabled_for_tests(enabled: bool) {
    LOG_ENABLED.store(enabled, Ordering::Relaxed);
    let mut state = log_state().lock().unwrap_or_else(|p| p.into_inner());
    state.writer = if enabled { LogWriter::new(log_file_path()) } else { None };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_debug_is_a_silent_no_op_when_disabled() {
        set_enabled_for_tests(false);
        log_debug("should not panic or write anything");
    }
}
