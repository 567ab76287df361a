use crate::util::parse_bool_flag;
use anyhow::{Context, Result};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_PATH: &str = "/tmp/quill.log";
const DEBUG_PAYLOAD_ENV: &str = "QUILL_DEBUG_PAYLOAD";
const LOG_PATH_ENV: &str = "QUILL_LOG_PATH";
const LOG_FILTER_ENV: &str = "QUILL_LOG";

pub fn debug_payload_enabled() -> bool {
    std::env::var(DEBUG_PAYLOAD_ENV)
        .ok()
        .and_then(parse_bool_flag)
        .unwrap_or(false)
}

pub fn emit_debug_payload(request_url: &str, payload: &Value) {
    let formatted_payload = serde_json::to_string_pretty(payload)
        .unwrap_or_else(|_| "<payload serialization error>".to_string());
    tracing::debug!(url = request_url, payload = %formatted_payload, "payload_request");
}

/// Installs the global subscriber. Logs go to a file while stderr is an
/// interactive terminal so they never interleave with streamed replies.
pub fn init_logging() -> Result<()> {
    let filter = std::env::var(LOG_FILTER_ENV)
        .ok()
        .and_then(|raw| EnvFilter::try_new(raw).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match resolve_log_path() {
        Some(path) => {
            let file = open_log_file(&path)?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
                .map_err(|error| anyhow::anyhow!("failed to install logger: {error}"))?;
        }
        None => {
            builder
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|error| anyhow::anyhow!("failed to install logger: {error}"))?;
        }
    }
    Ok(())
}

fn resolve_log_path() -> Option<PathBuf> {
    std::env::var(LOG_PATH_ENV)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            if std::io::stderr().is_terminal() {
                Some(PathBuf::from(DEFAULT_LOG_PATH))
            } else {
                None
            }
        })
}

fn open_log_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file '{}'", path.display()))
}
