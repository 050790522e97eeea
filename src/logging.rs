use chrono::Utc;
use once_cell::sync::Lazy;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Global file logger instance
static FILE_LOGGER: Lazy<Mutex<Option<FileLogger>>> = Lazy::new(|| Mutex::new(None));

/// File logger for engine diagnostics. Console output always happens;
/// file output starts once `init` has run.
pub struct FileLogger {
    log_file_path: PathBuf,
    error_file_path: PathBuf,
}

impl FileLogger {
    /// Initialize the file logger inside the given log directory.
    pub fn init(log_dir: &Path) -> Result<(), String> {
        let logger = FileLogger {
            log_file_path: log_dir.join("tunestash.log"),
            error_file_path: log_dir.join("tunestash.err.log"),
        };

        logger.ensure_files_writable()?;

        *FILE_LOGGER.lock().unwrap() = Some(logger);

        log_info("file logger initialized");

        Ok(())
    }

    /// Ensure log files are writable
    fn ensure_files_writable(&self) -> Result<(), String> {
        if let Some(parent) = self.log_file_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create log directory: {}", e))?;
        }

        for path in [&self.log_file_path, &self.error_file_path] {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| format!("Cannot write to log file {}: {}", path.display(), e))?;
        }

        Ok(())
    }

    /// Write a log entry to the log file
    fn write_log(&self, level: &str, message: &str) {
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
        let log_entry = format!("[{}] [{}] {}\n", timestamp, level, message);

        let file_path = match level {
            "ERROR" | "WARN" => &self.error_file_path,
            _ => &self.log_file_path,
        };

        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(file_path) {
            let _ = file.write_all(log_entry.as_bytes());
            let _ = file.flush();
        }
    }
}

/// Log an info message
pub fn log_info(message: &str) {
    println!("[INFO] {}", message);

    if let Ok(logger_guard) = FILE_LOGGER.lock() {
        if let Some(logger) = logger_guard.as_ref() {
            logger.write_log("INFO", message);
        }
    }
}

/// Log a warning message
pub fn log_warn(message: &str) {
    eprintln!("[WARN] {}", message);

    if let Ok(logger_guard) = FILE_LOGGER.lock() {
        if let Some(logger) = logger_guard.as_ref() {
            logger.write_log("WARN", message);
        }
    }
}

/// Log an error message
pub fn log_error(message: &str) {
    eprintln!("[ERROR] {}", message);

    if let Ok(logger_guard) = FILE_LOGGER.lock() {
        if let Some(logger) = logger_guard.as_ref() {
            logger.write_log("ERROR", message);
        }
    }
}

/// Log a debug message
pub fn log_debug(message: &str) {
    println!("[DEBUG] {}", message);

    if let Ok(logger_guard) = FILE_LOGGER.lock() {
        if let Some(logger) = logger_guard.as_ref() {
            logger.write_log("DEBUG", message);
        }
    }
}

/// Write a crash artifact. This is the single fatal path: every other
/// failure is absorbed at its tier boundary, but an unhandled panic is
/// recorded here before the process exits.
pub fn log_crash(crash_file: &Path, details: &str) {
    eprintln!("[CRASH] {}", details);

    if let Some(parent) = crash_file.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
    let entry = format!("[{}] [CRASH] {}\n", timestamp, details);
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(crash_file) {
        let _ = file.write_all(entry.as_bytes());
        let _ = file.flush();
    }
}

/// Convenience macro for logging with format arguments
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logging::log_info(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logging::log_warn(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logging::log_error(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logging::log_debug(&format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_artifact_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let crash_file = dir.path().join("crash.log");

        log_crash(&crash_file, "panicked at 'boom'");

        let contents = std::fs::read_to_string(&crash_file).unwrap();
        assert!(contents.contains("[CRASH] panicked at 'boom'"));
    }
}
