use std::time::Duration;

use thiserror::Error;

use crate::capabilities::{StorageKeyStyle, ValidatedUrl, MAX_TIMEOUT_MS};
use crate::{
    AppError, ErrorKind, DEFAULT_CACHE_CAPACITY, DEFAULT_REQUEST_TIMEOUT, DEFAULT_RETRIES, POST_SAVE_UNDO_WINDOW,
    SEARCH_DEBOUNCE, UNDO_WINDOW, USERNAME_DEBOUNCE,
};

/// Baked in at build time; shells never set it at runtime.
pub const API_BASE_URL: &str = match option_env!("CONTACTS_API_BASE_URL") {
    Some(url) => url,
    None => "http://localhost:8000/api",
};

pub const ASSET_BASE_URL: &str = match option_env!("CONTACTS_ASSET_BASE_URL") {
    Some(url) => url,
    None => "http://localhost:8000/media",
};

pub const MAX_RETRIES: u32 = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    InvalidUrl { field: &'static str, reason: String },

    #[error("request timeout must be between 1ms and {max_ms}ms")]
    InvalidTimeout { max_ms: u64 },

    #[error("retries must be between 1 and {max}")]
    InvalidRetries { max: u32 },

    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },

    #[error("cache capacity must be greater than zero")]
    ZeroCacheCapacity,
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        AppError::new(ErrorKind::InvalidState, "invalid configuration").with_internal(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreConfig {
    pub api_base_url: String,
    pub asset_base_url: String,
    pub request_timeout: Duration,
    pub retries: u32,
    pub undo_window: Duration,
    pub post_save_undo_window: Duration,
    pub search_debounce: Duration,
    pub username_debounce: Duration,
    pub storage_key_style: StorageKeyStyle,
    pub cache_capacity: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            api_base_url: API_BASE_URL.to_string(),
            asset_base_url: ASSET_BASE_URL.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retries: DEFAULT_RETRIES,
            undo_window: UNDO_WINDOW,
            post_save_undo_window: POST_SAVE_UNDO_WINDOW,
            search_debounce: SEARCH_DEBOUNCE,
            username_debounce: USERNAME_DEBOUNCE,
            storage_key_style: StorageKeyStyle::for_target(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl CoreConfig {
    #[must_use]
    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }

    #[must_use]
    pub fn with_asset_base_url(mut self, url: impl Into<String>) -> Self {
        self.asset_base_url = url.into();
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    #[must_use]
    pub fn with_undo_windows(mut self, typing: Duration, after_save: Duration) -> Self {
        self.undo_window = typing;
        self.post_save_undo_window = after_save;
        self
    }

    #[must_use]
    pub fn with_debounce(mut self, search: Duration, username: Duration) -> Self {
        self.search_debounce = search;
        self.username_debounce = username;
        self
    }

    #[must_use]
    pub fn with_storage_key_style(mut self, style: StorageKeyStyle) -> Self {
        self.storage_key_style = style;
        self
    }

    #[must_use]
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("api_base_url", &self.api_base_url),
            ("asset_base_url", &self.asset_base_url),
        ] {
            ValidatedUrl::new(value.as_str()).map_err(|e| ConfigError::InvalidUrl {
                field,
                reason: e.to_string(),
            })?;
        }

        let timeout_ms = u64::try_from(self.request_timeout.as_millis()).unwrap_or(u64::MAX);
        if timeout_ms == 0 || timeout_ms > MAX_TIMEOUT_MS {
            return Err(ConfigError::InvalidTimeout {
                max_ms: MAX_TIMEOUT_MS,
            });
        }
        if self.retries == 0 || self.retries > MAX_RETRIES {
            return Err(ConfigError::InvalidRetries { max: MAX_RETRIES });
        }
        for (field, value) in [
            ("undo_window", self.undo_window),
            ("post_save_undo_window", self.post_save_undo_window),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration { field });
            }
        }
        if self.cache_capacity == 0 {
            return Err(ConfigError::ZeroCacheCapacity);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CoreConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.retries, 3);
        assert_eq!(config.undo_window, Duration::from_secs(5));
        assert_eq!(config.post_save_undo_window, Duration::from_secs(2));
        assert_eq!(config.search_debounce, Duration::from_millis(300));
        assert_eq!(config.username_debounce, Duration::from_millis(500));
    }

    #[test]
    fn rejects_bad_values() {
        let bad_url = CoreConfig::default().with_api_base_url("ftp://x");
        assert!(matches!(
            bad_url.validate(),
            Err(ConfigError::InvalidUrl {
                field: "api_base_url",
                ..
            })
        ));
        assert!(matches!(
            CoreConfig::default()
                .with_request_timeout(Duration::ZERO)
                .validate(),
            Err(ConfigError::InvalidTimeout { .. })
        ));
        assert!(matches!(
            CoreConfig::default().with_retries(0).validate(),
            Err(ConfigError::InvalidRetries { .. })
        ));
        assert_eq!(
            CoreConfig::default().with_cache_capacity(0).validate(),
            Err(ConfigError::ZeroCacheCapacity)
        );
        assert_eq!(
            CoreConfig::default()
                .with_undo_windows(Duration::ZERO, Duration::from_secs(2))
                .validate(),
            Err(ConfigError::ZeroDuration {
                field: "undo_window"
            })
        );
    }
}
