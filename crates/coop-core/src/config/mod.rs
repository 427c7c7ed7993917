//! Sync configuration.
//!
//! One `SyncConfig` is shared by every synced collection of a client app. It is
//! usually embedded as JSON at build time or fetched alongside other client
//! settings; every field is optional and falls back to a conservative default.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sync::RetryPolicy;
use crate::util::{is_http_url, normalize_text_option};

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;
const DEFAULT_MAX_SYNC_ATTEMPTS: u32 = 5;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 5 * 60 * 1000;
const DEFAULT_STALE_AFTER_SECS: u64 = 5 * 60;

/// Client-side sync settings.
///
/// No secrets belong here; bearer tokens are handed to the remote client at
/// runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct SyncConfig {
    /// Base URL of the record API, e.g. `https://api.example.com/v1`
    pub api_base_url: Option<String>,
    pub request_timeout_secs: u64,
    /// Give up on a failing record after this many API errors; `None` retries forever
    pub max_sync_attempts: Option<u32>,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Age after which cached data counts as stale
    pub stale_after_secs: u64,
    /// Ask the server only for records changed since the stored cursor
    pub incremental_fetch: bool,
    /// Remove local `Synced` records missing from a full download
    pub full_snapshot_deletes: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_sync_attempts: Some(DEFAULT_MAX_SYNC_ATTEMPTS),
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
            incremental_fetch: false,
            full_snapshot_deletes: false,
        }
    }
}

impl SyncConfig {
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub const fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    /// Retry policy described by the `max_sync_attempts` and `retry_*` fields
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_sync_attempts,
            base_delay_ms: self.retry_base_delay_ms,
            max_delay_ms: self.retry_max_delay_ms,
        }
    }

    fn validate(mut self) -> Result<Self> {
        self.api_base_url = match normalize_text_option(self.api_base_url) {
            Some(url) if is_http_url(&url) => Some(url.trim_end_matches('/').to_string()),
            Some(_) => {
                return Err(Error::Config(
                    "api_base_url must include http:// or https://".to_string(),
                ))
            }
            None => None,
        };
        if self.request_timeout_secs == 0 {
            return Err(Error::Config(
                "request_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.max_sync_attempts == Some(0) {
            return Err(Error::Config(
                "max_sync_attempts must be greater than zero (omit it to retry forever)"
                    .to_string(),
            ));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(Error::Config(format!(
                "retry_max_delay_ms ({}) must not be below retry_base_delay_ms ({})",
                self.retry_max_delay_ms, self.retry_base_delay_ms
            )));
        }
        Ok(self)
    }
}

/// Parse and validate a sync configuration from JSON.
///
/// Public for testability; callers can exercise parsing without touching disk.
pub fn parse_sync_config(payload: &str) -> Result<SyncConfig> {
    let config: SyncConfig = serde_json::from_str(payload)
        .map_err(|error| Error::Config(format!("invalid sync config JSON: {error}")))?;
    config.validate()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_uses_defaults() {
        let config = parse_sync_config("{}").unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.max_sync_attempts, Some(5));
        assert_eq!(config.request_timeout(), Duration::from_secs(15));
        assert!(!config.full_snapshot_deletes);
    }

    #[test]
    fn parse_rejects_unknown_fields() {
        let error = parse_sync_config(r#"{ "sync_token_endpoint": "x" }"#).unwrap_err();
        assert!(error.to_string().contains("unknown field"));
    }

    #[test]
    fn parse_normalizes_base_url() {
        let config = parse_sync_config(
            r#"
            {
              "api_base_url": " https://api.example.com/v1/ ",
              "incremental_fetch": true,
              "stale_after_secs": 30
            }
            "#,
        )
        .unwrap();
        assert_eq!(
            config.api_base_url.as_deref(),
            Some("https://api.example.com/v1")
        );
        assert!(config.incremental_fetch);
        assert_eq!(config.stale_after(), Duration::from_secs(30));
    }

    #[test]
    fn parse_treats_blank_base_url_as_missing() {
        let config = parse_sync_config(r#"{ "api_base_url": "   " }"#).unwrap();
        assert!(config.api_base_url.is_none());
    }

    #[test]
    fn parse_rejects_invalid_values() {
        assert!(parse_sync_config(r#"{ "api_base_url": "api.example.com" }"#).is_err());
        assert!(parse_sync_config(r#"{ "request_timeout_secs": 0 }"#).is_err());
        assert!(parse_sync_config(r#"{ "max_sync_attempts": 0 }"#).is_err());
        assert!(parse_sync_config(
            r#"{ "retry_base_delay_ms": 1000, "retry_max_delay_ms": 10 }"#
        )
        .is_err());
    }

    #[test]
    fn null_attempt_cap_retries_forever() {
        let config = parse_sync_config(r#"{ "max_sync_attempts": null }"#).unwrap();
        assert_eq!(config.retry_policy().max_attempts, None);
    }
}
