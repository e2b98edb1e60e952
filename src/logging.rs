//! Logging Module
//!
//! Structured logging with levels, file output, and secure handling.
//! Ensures sensitive data is never logged.

#![allow(dead_code)]

use log::{Level, LevelFilter, Metadata, Record, SetLoggerError};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

/// Logger configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LevelFilter,
    pub console_output: bool,
    pub file_path: Option<PathBuf>,
    pub include_timestamps: bool,
    pub include_module: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: LevelFilter::Info, console_output: true, file_path: None, include_timestamps: true, include_module: true }
    }
}

impl LogConfig {
    pub fn debug() -> Self {
        Self { level: LevelFilter::Debug, ..Default::default() }
    }

    pub fn production(file_path: PathBuf) -> Self {
        Self { level: LevelFilter::Info, console_output: false, file_path: Some(file_path), include_timestamps: true, include_module: false }
    }

    pub fn from_config() -> Self {
        let config = crate::config::get_config();
        let level = match config.general.log_level.to_lowercase().as_str() {
            "error" => LevelFilter::Error,
            "warn" => LevelFilter::Warn,
            "info" => LevelFilter::Info,
            "debug" => LevelFilter::Debug,
            "trace" => LevelFilter::Trace,
            _ => LevelFilter::Info,
        };

        let file_path = if config.general.enable_logging { Some(get_log_file_path()) } else { None };

        Self { level, console_output: cfg!(debug_assertions), file_path, include_timestamps: true, include_module: true }
    }
}

/// Default log file path, under the same `~/.pass-cli` tree as the config
/// and vault files.
pub fn get_log_file_path() -> PathBuf {
    let log_dir = crate::config::Config::app_dir().join("logs");
    let _ = std::fs::create_dir_all(&log_dir);
    let date = chrono::Local::now().format("%Y-%m-%d");
    log_dir.join(format!("pass-cli_{date}.log"))
}

struct VaultLogger {
    config: LogConfig,
    file: Option<Mutex<File>>,
}

impl VaultLogger {
    fn new(config: LogConfig) -> Self {
        let file = config.file_path.as_ref().and_then(|path| OpenOptions::new().create(true).append(true).open(path).ok().map(Mutex::new));
        Self { config, file }
    }

    fn format_record(&self, record: &Record) -> String {
        let mut parts = Vec::new();

        if self.config.include_timestamps {
            let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            parts.push(format!("[{timestamp}]"));
        }

        parts.push(format!("[{:5}]", record.level()));

        if self.config.include_module {
            if let Some(module) = record.module_path() {
                let short_module = module.split("::").last().unwrap_or(module);
                parts.push(format!("[{short_module}]"));
            }
        }

        parts.push(record.args().to_string());
        parts.join(" ")
    }
}

impl log::Log for VaultLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.config.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // Never emit trace-level detail from the crypto module — even
        // argument values at that verbosity risk echoing key material back
        // through a debug build's log sink.
        if let Some(module) = record.module_path() {
            if module.contains("crypto") && record.level() == Level::Trace {
                return;
            }
        }

        let formatted = self.format_record(record);

        if self.config.console_output {
            let color = match record.level() {
                Level::Error => "\x1b[31m",
                Level::Warn => "\x1b[33m",
                Level::Info => "\x1b[32m",
                Level::Debug => "\x1b[36m",
                Level::Trace => "\x1b[90m",
            };
            eprintln!("{color}{formatted}\x1b[0m");
        }

        if let Some(ref file_mutex) = self.file {
            if let Ok(mut file) = file_mutex.lock() {
                let _ = writeln!(file, "{formatted}");
            }
        }
    }

    fn flush(&self) {
        if let Some(ref file_mutex) = self.file {
            if let Ok(mut file) = file_mutex.lock() {
                let _ = file.flush();
            }
        }
    }
}

pub fn init(config: LogConfig) -> Result<(), SetLoggerError> {
    let logger = VaultLogger::new(config.clone());
    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(config.level);
    Ok(())
}

pub fn init_from_config() -> Result<(), SetLoggerError> {
    init(LogConfig::from_config())
}

pub fn init_debug() -> Result<(), SetLoggerError> {
    init(LogConfig::debug())
}

/// Log a security-relevant event (unlock attempts, lockouts, recovery use).
#[macro_export]
macro_rules! log_security {
    ($($arg:tt)*) => {
        log::info!(target: "security", $($arg)*)
    };
}

/// Log a vault-service state transition or CRUD operation.
#[macro_export]
macro_rules! log_vault {
    ($($arg:tt)*) => {
        log::debug!(target: "vault", $($arg)*)
    };
}

/// Log a cryptographic operation without any sensitive data.
#[macro_export]
macro_rules! log_crypto {
    ($($arg:tt)*) => {
        log::debug!(target: "crypto", $($arg)*)
    };
}

/// Mask sensitive data for logging: shows only the first and last
/// character.
pub fn mask_sensitive(data: &str) -> String {
    let chars: Vec<char> = data.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let first = chars[0];
    let last = chars[chars.len() - 1];
    format!("{first}{}{last}", "*".repeat(chars.len() - 2))
}

/// Create a safe identifier for logging: strips anything that isn't
/// alphanumeric, `_`, or `-`, and truncates to 50 characters.
pub fn safe_log_id(id: &str) -> String {
    id.chars().take(50).filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-').collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_sensitive_keeps_only_first_and_last_char() {
        assert_eq!(mask_sensitive(""), "");
        assert_eq!(mask_sensitive("a"), "*");
        assert_eq!(mask_sensitive("abcd"), "****");
        assert_eq!(mask_sensitive("abcde"), "a***e");
        assert_eq!(mask_sensitive("password123"), "p*********3");
    }

    #[test]
    fn safe_log_id_strips_path_separators() {
        assert_eq!(safe_log_id("test-entry_1"), "test-entry_1");
        assert_eq!(safe_log_id("entry with spaces"), "entrywithspaces");
        assert_eq!(safe_log_id("../../../etc/passwd"), "etcpasswd");
    }
}
