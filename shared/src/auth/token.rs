use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::capabilities::{
    HttpError, HttpRequest, KeyValueStore, KvError, KvKey, StorageKeyStyle, Transport,
};
use crate::model::{Schema, Secret, TokenPair, UserKey};
use crate::{AppError, ErrorKind, UnixTimeMs, DEFAULT_REQUEST_TIMEOUT};

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token storage failed: {0}")]
    Storage(#[from] KvError),

    #[error("refresh request failed: {0}")]
    Http(#[from] HttpError),
}

impl From<TokenError> for AppError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Storage(inner) => AppError::new(ErrorKind::Storage, "could not access token storage")
                .with_internal(inner.to_string()),
            TokenError::Http(inner) => {
                AppError::new(ErrorKind::Network, "token refresh failed").with_internal(inner.to_string())
            }
        }
    }
}

/// `true` when the token's `exp` claim is in the past. Anything that cannot
/// be decoded counts as valid; the server's 401 is the backstop.
#[allow(clippy::cast_precision_loss)]
pub fn is_token_expired(token: &str, now_secs: u64) -> bool {
    let Some(payload) = token.split('.').nth(1) else {
        return false;
    };

    let mut padded = payload.to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }

    let Ok(bytes) = URL_SAFE.decode(padded) else {
        return false;
    };
    let Ok(claims) = serde_json::from_slice::<serde_json::Value>(&bytes) else {
        return false;
    };

    match claims.get("exp").and_then(serde_json::Value::as_f64) {
        Some(exp) => exp < now_secs as f64,
        None => false,
    }
}

/// Result of [`TokenService::lookup`].
#[derive(Debug, Default)]
pub struct TokenLookup {
    pub token: Option<Secret>,
    /// A refresh was attempted, whether or not it succeeded.
    pub refreshed: bool,
}

/// Access/refresh token pairs per user key, persisted through the platform
/// store.
pub struct TokenService {
    store: Arc<dyn KeyValueStore>,
    transport: Arc<dyn Transport>,
    base_url: String,
    key_style: StorageKeyStyle,
    timeout: Duration,
    refresh_locks: Mutex<HashMap<UserKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl TokenService {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn Transport>,
        base_url: impl Into<String>,
        key_style: StorageKeyStyle,
    ) -> Self {
        Self {
            store,
            transport,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            key_style,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn access_key(&self, user: &UserKey) -> Result<String, TokenError> {
        Ok(KvKey::access_token(user.as_str())?.render(self.key_style))
    }

    fn refresh_key(&self, user: &UserKey) -> Result<String, TokenError> {
        Ok(KvKey::refresh_token(user.as_str())?.render(self.key_style))
    }

    #[instrument(skip(self, access, refresh))]
    pub async fn store_tokens(
        &self,
        access: &Secret,
        refresh: &Secret,
        user: &UserKey,
    ) -> Result<(), TokenError> {
        self.store
            .set(&self.access_key(user)?, access.expose())
            .await?;
        self.store
            .set(&self.refresh_key(user)?, refresh.expose())
            .await?;
        debug!("tokens stored");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn remove_tokens(&self, user: &UserKey) -> Result<(), TokenError> {
        self.store.delete(&self.access_key(user)?).await?;
        self.store.delete(&self.refresh_key(user)?).await?;
        debug!("tokens removed");
        Ok(())
    }

    pub async fn access_token(&self, user: &UserKey) -> Result<Option<Secret>, TokenError> {
        Ok(self
            .store
            .get(&self.access_key(user)?)
            .await?
            .map(Secret::new))
    }

    pub async fn has_tokens(&self, user: &UserKey) -> bool {
        matches!(self.access_token(user).await, Ok(Some(_)))
    }

    /// A usable access token, refreshing once if the stored one expired.
    pub async fn get_valid_token(&self, user: &UserKey) -> Option<Secret> {
        self.lookup(user).await.token
    }

    /// Like [`get_valid_token`](Self::get_valid_token), but also reports
    /// whether a refresh was attempted on the way.
    #[instrument(skip(self))]
    pub async fn lookup(&self, user: &UserKey) -> TokenLookup {
        let token = match self.access_token(user).await {
            Ok(Some(token)) => token,
            Ok(None) => return TokenLookup::default(),
            Err(e) => {
                warn!(error = %e, "could not read access token");
                return TokenLookup::default();
            }
        };

        if !is_token_expired(token.expose(), UnixTimeMs::now().as_secs()) {
            return TokenLookup {
                token: Some(token),
                refreshed: false,
            };
        }

        debug!("access token expired, refreshing");
        let token = if self.refresh_token(user).await {
            self.access_token(user).await.ok().flatten()
        } else {
            None
        };
        TokenLookup {
            token,
            refreshed: true,
        }
    }

    /// Exchanges the stored refresh token for a new pair. Concurrent calls
    /// for one user share a single request.
    #[instrument(skip(self))]
    pub async fn refresh_token(&self, user: &UserKey) -> bool {
        let seen = self.access_token(user).await.ok().flatten();

        let lock = {
            let mut locks = self
                .refresh_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(user.clone()).or_default())
        };
        let _guard = lock.lock().await;

        let current = self.access_token(user).await.ok().flatten();
        if let Some(current) = &current {
            let rotated = seen.as_ref().map_or(true, |s| s != current);
            if rotated && !is_token_expired(current.expose(), UnixTimeMs::now().as_secs()) {
                debug!("token already refreshed by a concurrent request");
                return true;
            }
        }

        match self.exchange(user).await {
            Ok(true) => true,
            Ok(false) => false,
            Err(e) => {
                warn!(error = %e, "token refresh failed");
                false
            }
        }
    }

    async fn exchange(&self, user: &UserKey) -> Result<bool, TokenError> {
        let Some(refresh) = self.store.get(&self.refresh_key(user)?).await? else {
            debug!("no refresh token stored");
            return Ok(false);
        };

        let request = HttpRequest::post(format!("{}/auth/refresh", self.base_url))?
            .with_json(&json!({ "refresh": refresh }))?
            .with_timeout(self.timeout)?;

        let response = self.transport.execute(request).await?;
        if !response.is_success() {
            warn!(status = response.status(), "refresh rejected");
            return Ok(false);
        }

        let pair: TokenPair = response.json()?;
        let issues = pair.validate();
        if !issues.is_empty() {
            warn!(?issues, "refresh response failed validation");
            return Ok(false);
        }

        self.store_tokens(&pair.access, &pair.refresh, user).await?;
        Ok(true)
    }
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("base_url", &self.base_url)
            .field("key_style", &self.key_style)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capabilities::testing::{MemoryKv, MockReply, MockTransport};
    use crate::capabilities::HttpMethod;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    pub(crate) fn jwt_with_exp(exp: u64) -> String {
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"u1","exp":{exp}}}"#));
        format!("eyJhbGciOiJIUzI1NiJ9.{payload}.sig")
    }

    pub(crate) fn fresh_jwt() -> String {
        jwt_with_exp(UnixTimeMs::now().as_secs() + 3600)
    }

    pub(crate) fn stale_jwt() -> String {
        jwt_with_exp(1_000)
    }

    fn service(kv: Arc<MemoryKv>, mock: Arc<MockTransport>) -> TokenService {
        TokenService::new(kv, mock, "https://api.test/", StorageKeyStyle::Sanitized)
    }

    #[test]
    fn expiry_is_read_from_payload() {
        assert!(is_token_expired(&jwt_with_exp(100), 200));
        assert!(!is_token_expired(&jwt_with_exp(300), 200));
    }

    #[test]
    fn undecodable_tokens_are_not_expired() {
        assert!(!is_token_expired("opaque", 200));
        assert!(!is_token_expired("a.!!!.c", 200));
        let no_exp = format!("h.{}.s", URL_SAFE_NO_PAD.encode(r#"{"sub":"x"}"#));
        assert!(!is_token_expired(&no_exp, 200));
        let string_exp = format!("h.{}.s", URL_SAFE_NO_PAD.encode(r#"{"exp":"100"}"#));
        assert!(!is_token_expired(&string_exp, 200));
    }

    #[tokio::test]
    async fn store_and_remove_use_namespaced_keys() {
        let kv = Arc::new(MemoryKv::new());
        let svc = service(kv.clone(), Arc::new(MockTransport::new()));
        let user = UserKey::from("current_user");

        svc.store_tokens(&Secret::new("a"), &Secret::new("r"), &user)
            .await
            .unwrap();
        assert_eq!(
            kv.keys().await,
            vec!["jwt_current_user_access", "jwt_current_user_refresh"]
        );

        svc.remove_tokens(&user).await.unwrap();
        assert!(kv.keys().await.is_empty());
    }

    #[tokio::test]
    async fn valid_token_is_returned_without_network() {
        let kv = Arc::new(MemoryKv::new());
        let mock = Arc::new(MockTransport::new());
        let svc = service(kv, mock.clone());
        let user = UserKey::from("u");
        let token = fresh_jwt();
        svc.store_tokens(&Secret::new(token.clone()), &Secret::new("r"), &user)
            .await
            .unwrap();

        assert_eq!(svc.get_valid_token(&user).await.unwrap().expose(), token);
        assert!(mock.requests().is_empty());
    }

    #[tokio::test]
    async fn expired_token_triggers_one_refresh() {
        let kv = Arc::new(MemoryKv::new());
        let mock = Arc::new(MockTransport::new());
        let new_access = fresh_jwt();
        mock.on(
            HttpMethod::Post,
            "/auth/refresh",
            MockReply::ok(json!({"access": new_access, "refresh": "r2"})),
        );
        let svc = service(kv.clone(), mock.clone());
        let user = UserKey::from("u");
        svc.store_tokens(&Secret::new(stale_jwt()), &Secret::new("r1"), &user)
            .await
            .unwrap();

        let token = svc.get_valid_token(&user).await.unwrap();
        assert_eq!(token.expose(), new_access);
        assert_eq!(kv.get("jwt_u_refresh").await.unwrap().as_deref(), Some("r2"));

        let sent = mock.last(HttpMethod::Post, "/auth/refresh").unwrap();
        assert_eq!(sent.json_body(), Some(json!({"refresh": "r1"})));
    }

    #[tokio::test]
    async fn failed_refresh_yields_no_token() {
        let kv = Arc::new(MemoryKv::new());
        let mock = Arc::new(MockTransport::new());
        mock.on(
            HttpMethod::Post,
            "/auth/refresh",
            MockReply::Json(401, json!({"detail": "token blacklisted"})),
        );
        let svc = service(kv, mock.clone());
        let user = UserKey::from("u");
        svc.store_tokens(&Secret::new(stale_jwt()), &Secret::new("r1"), &user)
            .await
            .unwrap();

        assert!(svc.get_valid_token(&user).await.is_none());
        assert_eq!(mock.count(HttpMethod::Post, "/auth/refresh"), 1);
    }

    #[tokio::test]
    async fn refresh_without_refresh_token_is_false() {
        let mock = Arc::new(MockTransport::new());
        let svc = service(Arc::new(MemoryKv::new()), mock.clone());
        assert!(!svc.refresh_token(&UserKey::from("nobody")).await);
        assert!(mock.requests().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_refreshes_are_coalesced() {
        let kv = Arc::new(MemoryKv::new());
        let mock = Arc::new(MockTransport::new());
        mock.on(
            HttpMethod::Post,
            "/auth/refresh",
            MockReply::ok(json!({"access": fresh_jwt(), "refresh": "r2"}))
                .delayed(Duration::from_millis(50)),
        );
        let svc = Arc::new(service(kv, mock.clone()));
        let user = UserKey::from("u");
        svc.store_tokens(&Secret::new(stale_jwt()), &Secret::new("r1"), &user)
            .await
            .unwrap();

        let (a, b) = tokio::join!(svc.refresh_token(&user), svc.refresh_token(&user));
        assert!(a && b);
        assert_eq!(mock.count(HttpMethod::Post, "/auth/refresh"), 1);
    }
}
