use crate::api::stream::{SentinelPair, DEFAULT_META_END, DEFAULT_META_START};
use crate::util::{is_local_endpoint_url, parse_positive_usize};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_API_URL: &str = "http://localhost:8080/api";
const DEFAULT_USER_ID: &str = "default-user";
const DEFAULT_MODEL: &str = "openai";
const DEFAULT_PAGE_SIZE: usize = 20;
const DEFAULT_REFETCH_DELAY_MS: u64 = 1500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api_url: String,
    pub api_token: Option<String>,
    pub user_id: String,
    pub model: String,
    pub page_size: usize,
    /// Delay before re-reading a context after switching to it. Zero disables
    /// the re-read.
    pub refetch_delay: Duration,
    pub meta_start: String,
    pub meta_end: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        let api_url = env_or("QUILL_API_URL", DEFAULT_API_URL);
        let api_token = std::env::var("QUILL_API_TOKEN").ok().and_then(|v| {
            if v.trim().is_empty() {
                None
            } else {
                Some(v)
            }
        });
        let page_size = match std::env::var("QUILL_PAGE_SIZE") {
            Ok(raw) => match parse_positive_usize(&raw) {
                Some(value) => value,
                None => bail!("Invalid QUILL_PAGE_SIZE '{raw}': expected a positive integer"),
            },
            Err(_) => DEFAULT_PAGE_SIZE,
        };
        let refetch_delay_ms = match std::env::var("QUILL_REFETCH_DELAY_MS") {
            Ok(raw) => match raw.trim().parse::<u64>() {
                Ok(value) => value,
                Err(_) => bail!("Invalid QUILL_REFETCH_DELAY_MS '{raw}': expected milliseconds"),
            },
            Err(_) => DEFAULT_REFETCH_DELAY_MS,
        };

        Ok(Self {
            api_url,
            api_token,
            user_id: env_or("QUILL_USER_ID", DEFAULT_USER_ID),
            model: env_or("QUILL_MODEL", DEFAULT_MODEL),
            page_size,
            refetch_delay: Duration::from_millis(refetch_delay_ms),
            meta_start: env_or("QUILL_META_START", DEFAULT_META_START),
            meta_end: env_or("QUILL_META_END", DEFAULT_META_END),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            bail!(
                "Invalid QUILL_API_URL '{}': expected http:// or https:// URL",
                self.api_url
            );
        }

        if self.api_url.starts_with("http://") && !self.is_local_endpoint() {
            bail!(
                "Refusing plain http:// for non-local backend '{}'; use https://",
                self.api_url
            );
        }

        if self.page_size == 0 {
            bail!("QUILL_PAGE_SIZE must be at least 1");
        }

        if self.user_id.trim().is_empty() {
            bail!("QUILL_USER_ID must not be empty");
        }

        if self.model.trim().is_empty() {
            bail!("QUILL_MODEL must not be empty");
        }

        self.sentinels()?;
        Ok(())
    }

    pub fn sentinels(&self) -> Result<SentinelPair> {
        SentinelPair::new(self.meta_start.clone(), self.meta_end.clone())
    }

    fn is_local_endpoint(&self) -> bool {
        is_local_endpoint_url(&self.api_url)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}
