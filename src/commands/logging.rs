use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;

const LOG_FILE_NAME: &str = "freqlab-preview.log";

static LOG_FILE: OnceCell<PathBuf> = OnceCell::new();

/// Default log directory (in user's home directory)
fn default_log_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("VSTWorkshop")
        .join("logs")
}

/// Get the log file path. Fixed by the first `init_logging` call.
pub fn log_file_path() -> PathBuf {
    LOG_FILE
        .get()
        .cloned()
        .unwrap_or_else(|| default_log_dir().join(LOG_FILE_NAME))
}

/// Install the `log` backend and prepare the diagnostics log file.
///
/// `RUST_LOG` overrides the default `info` filter. Safe to call more than once.
pub fn init_logging(dir: Option<&Path>) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();

    let dir = dir.map(Path::to_path_buf).unwrap_or_else(default_log_dir);
    if let Err(e) = fs::create_dir_all(&dir) {
        log::warn!("Could not create log directory {:?}: {}", dir, e);
    }
    let _ = LOG_FILE.set(dir.join(LOG_FILE_NAME));

    log_message("INFO", "freqlab-preview", "Preview core started");
}

/// Append a line to the diagnostics log file
pub fn log_message(level: &str, module: &str, message: &str) {
    let log_path = log_file_path();

    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&log_path) {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let _ = writeln!(file, "[{}] [{}] [{}] {}", timestamp, level, module, message);
    }
}

/// Get the log file contents
pub fn read_log_file() -> io::Result<String> {
    let log_path = log_file_path();

    if !log_path.exists() {
        return Ok(String::new());
    }

    fs::read_to_string(&log_path)
}

/// Clear the log file
pub fn clear_log_file() -> io::Result<()> {
    let log_path = log_file_path();

    if log_path.exists() {
        fs::write(&log_path, "")?;
    }

    log_message("INFO", "freqlab-preview", "Log file cleared");
    Ok(())
}

/// Get log file size in bytes
pub fn log_file_size() -> io::Result<u64> {
    let log_path = log_file_path();

    if !log_path.exists() {
        return Ok(0);
    }

    fs::metadata(&log_path).map(|m| m.len())
}
