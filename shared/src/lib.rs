// lib.rs - shared core for the contacts client (web + native shells)

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod app;
pub mod auth;
pub mod capabilities;
pub mod client;
pub mod config;
pub mod debounce;
pub mod editor;
pub mod event;
#[cfg(feature = "logging")]
pub mod logging;
pub mod media;
pub mod model;
pub mod query;
pub mod resources;
pub mod view;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{error, warn};

pub use app::ContactsCore;
pub use client::{ApiClient, ApiError, Body, FetchOptions, Validated, ValidationFailure};
pub use config::CoreConfig;
pub use editor::{EditableForm, FieldEditor, FieldSaver, SaveError, SaveOutcome};
pub use event::EditorEvent;
pub use model::{FieldId, UserKey};
pub use query::{QueryCache, QueryKey};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRIES: u32 = 3;
pub const UNDO_WINDOW: Duration = Duration::from_secs(5);
pub const POST_SAVE_UNDO_WINDOW: Duration = Duration::from_secs(2);
pub const SEARCH_DEBOUNCE: Duration = Duration::from_millis(300);
pub const USERNAME_DEBOUNCE: Duration = Duration::from_millis(500);
pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;
pub const DEFAULT_CACHE_CAPACITY: usize = 256;
pub const CURRENT_USER_KEY: &str = "current_user";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    Authentication,
    Authorization,
    Validation,
    NotFound,
    Conflict,
    RateLimited,
    Storage,
    Serialization,
    Media,
    InvalidState,
    Internal,
    Unknown,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Authentication => "AUTH_ERROR",
            Self::Authorization => "FORBIDDEN",
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::RateLimited => "RATE_LIMITED",
            Self::Storage => "STORAGE_ERROR",
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::Media => "MEDIA_ERROR",
            Self::InvalidState => "INVALID_STATE",
            Self::Internal => "INTERNAL_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Network | Self::Timeout | Self::Conflict | Self::RateLimited | Self::Storage => {
                ErrorSeverity::Transient
            }

            Self::Serialization | Self::Internal | Self::InvalidState => ErrorSeverity::Fatal,

            Self::Authentication
            | Self::Authorization
            | Self::Validation
            | Self::NotFound
            | Self::Media
            | Self::Unknown => ErrorSeverity::Permanent,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::RateLimited | Self::Storage | Self::Conflict
        )
    }
}

/// User-facing error produced by the resource layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub internal_message: Option<String>,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            internal_message: None,
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal_message = Some(internal.into());
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable() && !matches!(self.severity, ErrorSeverity::Fatal)
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::Network => {
                "Unable to connect. Please check your internet connection and try again.".into()
            }
            ErrorKind::Timeout => "The request timed out. Please try again.".into(),
            ErrorKind::Authentication => "Your session has expired. Please sign in again.".into(),
            ErrorKind::Authorization => "You don't have permission to perform this action.".into(),
            ErrorKind::Validation | ErrorKind::Media => self.message.clone(),
            ErrorKind::NotFound => "The requested item could not be found.".into(),
            ErrorKind::Conflict => {
                "This action conflicts with a recent change. Please refresh and try again.".into()
            }
            ErrorKind::RateLimited => "Too many requests. Please wait a moment and try again.".into(),
            ErrorKind::Storage => "Unable to save data on this device.".into(),
            ErrorKind::Serialization => {
                "The server sent data this app could not read. Please try again later.".into()
            }
            ErrorKind::InvalidState => "Something went wrong. Please reload and try again.".into(),
            ErrorKind::Internal | ErrorKind::Unknown => {
                "An unexpected error occurred. Please try again or contact support.".into()
            }
        }
    }

    #[must_use]
    pub fn from_http_status(status: u16, body: Option<&[u8]>) -> Self {
        let kind = match status {
            400 | 422 => ErrorKind::Validation,
            401 => ErrorKind::Authentication,
            403 => ErrorKind::Authorization,
            404 => ErrorKind::NotFound,
            408 => ErrorKind::Timeout,
            409 => ErrorKind::Conflict,
            429 => ErrorKind::RateLimited,
            500..=599 => ErrorKind::Internal,
            _ => ErrorKind::Unknown,
        };

        let message = body
            .and_then(|b| serde_json::from_slice::<ApiErrorResponse>(b).ok())
            .and_then(|e| e.message.or(e.detail))
            .unwrap_or_else(|| format!("HTTP error: {status}"));

        Self::new(kind, message).with_context("http_status", status.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {internal})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiErrorResponse {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

pub type AppResult<T> = Result<T, AppError>;

/// Error-tracking collaborator. Shells plug in their crash/analytics SDK.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, action: &str, error: &AppError);
}

/// Default reporter: logs through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, action: &str, error: &AppError) {
        match error.severity {
            ErrorSeverity::Fatal => error!(action, code = error.code(), context = ?error.context, "{}", error),
            _ => warn!(action, code = error.code(), context = ?error.context, "{}", error),
        }
    }
}

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        let ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Self(ms)
    }

    #[must_use]
    pub const fn as_secs(self) -> u64 {
        self.0 / 1000
    }

    #[must_use]
    pub fn elapsed_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}
