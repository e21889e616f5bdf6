//! Validated fetch client.
//!
//! Every request goes through one loop: attach the bearer token, apply the
//! timeout, refresh once on 401, then check the body against the response
//! type's [`Schema`]. Schema failures are data, not errors: callers get a
//! [`Validated::Invalid`] and must branch on it.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::auth::TokenService;
use crate::capabilities::{HttpError, HttpMethod, HttpRequest, HttpResponse, Transport};
use crate::model::{Schema, SchemaIssue, UserKey};
use crate::{AppError, AppResult, ErrorKind, DEFAULT_REQUEST_TIMEOUT, DEFAULT_RETRIES};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("authentication required")]
    Authentication,

    #[error("request timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {message}")]
    Status {
        status: u16,
        message: String,
        body: Vec<u8>,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

impl From<HttpError> for ApiError {
    fn from(e: HttpError) -> Self {
        match e {
            HttpError::Timeout { timeout_ms, .. } => ApiError::Timeout {
                after_ms: timeout_ms,
            },
            HttpError::ConnectionError { .. } | HttpError::Cancelled { .. } => {
                ApiError::Network(e.to_string())
            }
            HttpError::InvalidResponse { .. } | HttpError::ResponseTooLarge { .. } => {
                ApiError::InvalidResponse(e.to_string())
            }
            HttpError::InvalidUrl { .. }
            | HttpError::InvalidHeader { .. }
            | HttpError::TooManyHeaders { .. }
            | HttpError::BodyTooLarge { .. }
            | HttpError::InvalidRequest { .. }
            | HttpError::SerializationError { .. } => ApiError::InvalidRequest(e.to_string()),
        }
    }
}

impl From<ApiError> for AppError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Authentication => {
                AppError::new(ErrorKind::Authentication, "authentication required")
            }
            ApiError::Timeout { after_ms } => AppError::new(ErrorKind::Timeout, "request timed out")
                .with_context("after_ms", after_ms.to_string()),
            ApiError::Network(msg) => {
                AppError::new(ErrorKind::Network, "network error").with_internal(msg)
            }
            ApiError::Status { status, body, .. } => {
                AppError::from_http_status(status, Some(&body))
            }
            ApiError::InvalidRequest(msg) => {
                AppError::new(ErrorKind::Internal, "invalid request").with_internal(msg)
            }
            ApiError::InvalidResponse(msg) => {
                AppError::new(ErrorKind::Serialization, "invalid response").with_internal(msg)
            }
            ApiError::Storage(msg) => {
                AppError::new(ErrorKind::Storage, "storage error").with_internal(msg)
            }
        }
    }
}

/// Schema check failure for a 2xx response.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationFailure {
    pub issues: Vec<SchemaIssue>,
    pub raw: Value,
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "response failed validation")?;
        for issue in &self.issues {
            write!(f, "; {issue}")?;
        }
        Ok(())
    }
}

impl From<ValidationFailure> for AppError {
    fn from(failure: ValidationFailure) -> Self {
        let paths = failure
            .issues
            .iter()
            .map(|i| i.path.as_str())
            .collect::<Vec<_>>()
            .join(",");
        AppError::new(ErrorKind::Serialization, "response failed validation")
            .with_internal(failure.to_string())
            .with_context("paths", paths)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Validated<T> {
    Valid(T),
    Invalid(ValidationFailure),
}

impl<T> Validated<T> {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validated::Valid(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Validated::Valid(v) => Some(v),
            Validated::Invalid(_) => None,
        }
    }

    pub fn into_result(self) -> Result<T, ValidationFailure> {
        match self {
            Validated::Valid(v) => Ok(v),
            Validated::Invalid(f) => Err(f),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Validated<U> {
        match self {
            Validated::Valid(v) => Validated::Valid(f(v)),
            Validated::Invalid(e) => Validated::Invalid(e),
        }
    }
}

/// Collapses a validated response into an [`AppResult`], treating a schema
/// failure as a serialization error.
pub(crate) fn valid<T>(v: Validated<T>) -> AppResult<T> {
    v.into_result().map_err(AppError::from)
}

#[derive(Debug, Clone)]
pub enum Body {
    Json(Value),
    Raw { bytes: Vec<u8>, content_type: String },
}

impl Body {
    pub fn json<T: serde::Serialize + ?Sized>(value: &T) -> Result<Self, ApiError> {
        serde_json::to_value(value)
            .map(Body::Json)
            .map_err(|e| ApiError::InvalidRequest(format!("body serialization failed: {e}")))
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub user: Option<UserKey>,
    pub skip_auth: bool,
    pub skip_validation: bool,
    pub retries: Option<u32>,
    pub timeout: Option<Duration>,
    pub query: Vec<(String, String)>,
}

impl FetchOptions {
    pub fn authed(user: impl Into<UserKey>) -> Self {
        Self {
            user: Some(user.into()),
            ..Self::default()
        }
    }

    pub fn public() -> Self {
        Self {
            skip_auth: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    #[must_use]
    pub fn skip_validation(mut self) -> Self {
        self.skip_validation = true;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

pub struct ApiClient {
    transport: Arc<dyn Transport>,
    tokens: Arc<TokenService>,
    base_url: String,
    timeout: Duration,
    retries: u32,
}

impl ApiClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        tokens: Arc<TokenService>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            tokens,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            retries: DEFAULT_RETRIES,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn tokens(&self) -> &Arc<TokenService> {
        &self.tokens
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get<T: Schema>(
        &self,
        path: &str,
        opts: FetchOptions,
    ) -> Result<Validated<T>, ApiError> {
        self.request(HttpMethod::Get, path, None, opts).await
    }

    pub async fn delete<T: Schema>(
        &self,
        path: &str,
        opts: FetchOptions,
    ) -> Result<Validated<T>, ApiError> {
        self.request(HttpMethod::Delete, path, None, opts).await
    }

    pub async fn post<T: Schema>(
        &self,
        path: &str,
        body: Body,
        opts: FetchOptions,
    ) -> Result<Validated<T>, ApiError> {
        self.request(HttpMethod::Post, path, Some(body), opts).await
    }

    pub async fn patch<T: Schema>(
        &self,
        path: &str,
        body: Body,
        opts: FetchOptions,
    ) -> Result<Validated<T>, ApiError> {
        self.request(HttpMethod::Patch, path, Some(body), opts).await
    }

    pub async fn put<T: Schema>(
        &self,
        path: &str,
        body: Body,
        opts: FetchOptions,
    ) -> Result<Validated<T>, ApiError> {
        self.request(HttpMethod::Put, path, Some(body), opts).await
    }

    /// For endpoints answering `204 No Content`.
    pub async fn send_empty(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<Body>,
        opts: FetchOptions,
    ) -> Result<(), ApiError> {
        self.send(method, path, body.as_ref(), &opts).await.map(|_| ())
    }

    pub async fn delete_empty(&self, path: &str, opts: FetchOptions) -> Result<(), ApiError> {
        self.send_empty(HttpMethod::Delete, path, None, opts).await
    }

    pub async fn request<T: Schema>(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<Body>,
        opts: FetchOptions,
    ) -> Result<Validated<T>, ApiError> {
        let response = self.send(method, path, body.as_ref(), &opts).await?;
        decode(path, &response, opts.skip_validation)
    }

    #[instrument(skip(self, method, body, opts), fields(method = method.as_str(), user = ?opts.user))]
    async fn send(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<&Body>,
        opts: &FetchOptions,
    ) -> Result<HttpResponse, ApiError> {
        let retries = opts.retries.unwrap_or(self.retries).max(1);
        let auth_user = opts.user.as_ref().filter(|_| !opts.skip_auth);
        let mut refreshed = false;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let (request, refreshed_token) = self.build(method, path, body, opts, auth_user).await?;
            refreshed |= refreshed_token;
            let response = self.execute(request, opts).await?;

            if response.status() == 401 {
                if let Some(user) = auth_user {
                    if refreshed || attempt >= retries {
                        warn!(attempt, "unauthorized after token refresh");
                        return Err(ApiError::Authentication);
                    }
                    if !self.tokens.refresh_token(user).await {
                        warn!("unauthorized and token refresh failed");
                        return Err(ApiError::Authentication);
                    }
                    refreshed = true;
                    debug!("token refreshed, retrying");
                    continue;
                }
            }

            if !response.is_success() {
                return Err(status_error(&response));
            }
            return Ok(response);
        }
    }

    async fn build(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<&Body>,
        opts: &FetchOptions,
        auth_user: Option<&UserKey>,
    ) -> Result<(HttpRequest, bool), ApiError> {
        let mut url = Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|e| ApiError::InvalidRequest(format!("{path}: {e}")))?;
        if !opts.query.is_empty() {
            url.query_pairs_mut().extend_pairs(opts.query.iter());
        }

        let mut request = HttpRequest::new(method, crate::capabilities::ValidatedUrl::new(url)?)
            .with_timeout(opts.timeout.unwrap_or(self.timeout))?
            .with_header("Accept", "application/json")?;

        let mut refreshed = false;
        if let Some(user) = auth_user {
            let lookup = self.tokens.lookup(user).await;
            refreshed = lookup.refreshed;
            if let Some(token) = lookup.token {
                request = request.with_header("Authorization", format!("Bearer {}", token.expose()))?;
            }
        }

        request = match body {
            Some(Body::Json(value)) => request.with_json(value)?,
            Some(Body::Raw {
                bytes,
                content_type,
            }) => request.with_body(bytes.clone(), content_type)?,
            None => request,
        };
        Ok((request, refreshed))
    }

    async fn execute(
        &self,
        request: HttpRequest,
        opts: &FetchOptions,
    ) -> Result<HttpResponse, ApiError> {
        let limit = opts.timeout.unwrap_or(self.timeout);
        match tokio::time::timeout(limit, self.transport.execute(request)).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                let after_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
                warn!(after_ms, "request aborted");
                Err(ApiError::Timeout { after_ms })
            }
        }
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("retries", &self.retries)
            .finish_non_exhaustive()
    }
}

fn status_error(response: &HttpResponse) -> ApiError {
    let app = AppError::from_http_status(response.status(), Some(response.body()));
    ApiError::Status {
        status: response.status(),
        message: app.message,
        body: response.body().to_vec(),
    }
}

fn decode<T: Schema>(
    path: &str,
    response: &HttpResponse,
    skip_validation: bool,
) -> Result<Validated<T>, ApiError> {
    let raw: Value = if response.body().is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(response.body())
            .map_err(|e| ApiError::InvalidResponse(format!("{path}: body is not JSON: {e}")))?
    };

    if skip_validation {
        return serde_json::from_value(raw)
            .map(Validated::Valid)
            .map_err(|e| ApiError::InvalidResponse(format!("{path}: {e}")));
    }

    let issues = match serde_json::from_value::<T>(raw.clone()) {
        Ok(value) => {
            let issues = value.validate();
            if issues.is_empty() {
                return Ok(Validated::Valid(value));
            }
            issues
        }
        Err(e) => vec![SchemaIssue::new("", e.to_string())],
    };

    for issue in &issues {
        warn!(path, issue_path = %issue.path, "{}", issue.message);
    }
    Ok(Validated::Invalid(ValidationFailure { issues, raw }))
}
