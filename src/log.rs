//! Structured logging for baton.
//!
//! Log levels:
//! - ERROR: Critical failures that prevent operations from completing
//! - WARN: Unexpected conditions that are recoverable (permanent task failures, discarded results)
//! - INFO: High-level notifications (plan accepted, retries, fallbacks, plan finished)
//! - DEBUG: Scheduling decisions and dispatches
//! - TRACE: Very detailed traces (state slot updates)
//!
//! Debug mode can be enabled with `--debug` flag or `BATON_DEBUG=1` env var.
//! `BATON_LOG` takes an `EnvFilter` directive (e.g. `baton=trace`) and wins
//! over both.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Log levels for filtering messages and for log alert actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    #[default]
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

fn env_debug() -> bool {
    std::env::var("BATON_DEBUG")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

/// Build the filter: `BATON_LOG` if set, otherwise debug or info.
fn build_filter(debug: bool) -> EnvFilter {
    let default = if debug || env_debug() {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    EnvFilter::try_from_env("BATON_LOG").unwrap_or_else(|_| EnvFilter::new(default.as_filter()))
}

/// Initialize logging with explicit debug mode setting.
///
/// The log file is truncated on startup. Without a home directory logs go
/// to stderr. Calling this more than once is harmless.
pub fn init_with_debug(debug: bool) {
    let filter = build_filter(debug);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false);

    let log_file = dirs::home_dir()
        .map(|h| h.join(".baton"))
        .and_then(|dir| std::fs::create_dir_all(&dir).ok().map(|_| dir.join("baton.log")))
        .and_then(|path| File::create(path).ok());

    let _ = match log_file {
        Some(file) => builder
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
}
