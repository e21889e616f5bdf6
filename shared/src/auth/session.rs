use std::sync::Arc;

use serde_json::json;
use tracing::{info, instrument, warn};

use crate::client::{valid, ApiClient, Body, FetchOptions};
use crate::model::{Ack, Credentials, SignupRequest, TokenPair, User, UserKey};
use crate::query::{QueryCache, QueryKey};
use crate::{AppError, AppResult, CURRENT_USER_KEY};

/// The signed-in user. Tokens live under the fixed `current_user` key and
/// the profile under the `["current_user"]` query.
#[derive(Debug, Clone)]
pub struct Session {
    client: Arc<ApiClient>,
    cache: Arc<QueryCache>,
    user: UserKey,
}

impl Session {
    pub fn new(client: Arc<ApiClient>, cache: Arc<QueryCache>) -> Self {
        Self {
            client,
            cache,
            user: UserKey::from(CURRENT_USER_KEY),
        }
    }

    pub fn user_key(&self) -> &UserKey {
        &self.user
    }

    pub fn query_key() -> QueryKey {
        QueryKey::new([CURRENT_USER_KEY])
    }

    pub fn authed(&self) -> FetchOptions {
        FetchOptions::authed(self.user.clone())
    }

    pub async fn is_authenticated(&self) -> bool {
        self.client.tokens().has_tokens(&self.user).await
    }

    #[instrument(skip_all, fields(email = %credentials.email))]
    pub async fn login(&self, credentials: &Credentials) -> AppResult<User> {
        let pair: TokenPair = valid(
            self.client
                .post("/auth/login", Body::json(credentials)?, FetchOptions::public())
                .await?,
        )?;
        self.start(pair).await
    }

    #[instrument(skip_all, fields(email = %request.email, username = %request.username))]
    pub async fn signup(&self, request: &SignupRequest) -> AppResult<User> {
        let pair: TokenPair = valid(
            self.client
                .post("/auth/signup", Body::json(request)?, FetchOptions::public())
                .await?,
        )?;
        self.start(pair).await
    }

    async fn start(&self, pair: TokenPair) -> AppResult<User> {
        let tokens = self.client.tokens();
        tokens
            .store_tokens(&pair.access, &pair.refresh, &self.user)
            .await?;

        let user = self.fetch_current_user().await?;
        info!(user_id = %user.id, "signed in");
        Ok(user)
    }

    /// Refetches the profile and writes it to the `["current_user"]` query.
    pub async fn fetch_current_user(&self) -> AppResult<User> {
        let user: User = valid(self.client.get("/users/me", self.authed()).await?)?;
        if let Err(e) = self.cache.set_query_data(Self::query_key(), &user) {
            warn!(error = %e, "could not cache current user");
        }
        Ok(user)
    }

    #[instrument(skip_all)]
    pub async fn verify_email(&self, token: &str) -> AppResult<Ack> {
        valid(
            self.client
                .post("/auth/verify", Body::Json(json!({ "token": token })), FetchOptions::public())
                .await?,
        )
    }

    #[instrument(skip_all)]
    pub async fn request_password_reset(&self, email: &str) -> AppResult<Ack> {
        if let Some(msg) = crate::model::email_issue(email) {
            return Err(AppError::new(crate::ErrorKind::Validation, format!("Email {msg}")));
        }
        valid(
            self.client
                .post(
                    "/auth/password-reset",
                    Body::Json(json!({ "email": email })),
                    FetchOptions::public(),
                )
                .await?,
        )
    }

    #[instrument(skip_all)]
    pub async fn confirm_password_reset(&self, token: &str, password: &str) -> AppResult<Ack> {
        valid(
            self.client
                .post(
                    "/auth/password-reset/confirm",
                    Body::Json(json!({ "token": token, "password": password })),
                    FetchOptions::public(),
                )
                .await?,
        )
    }

    /// Drops tokens and every cached query. Nothing is sent to the server.
    #[instrument(skip_all)]
    pub async fn logout(&self) -> AppResult<()> {
        let result = self.client.tokens().remove_tokens(&self.user).await;
        self.cache.clear();
        result?;
        info!("signed out");
        Ok(())
    }

    /// Logout for error paths: failures are logged, not returned.
    pub async fn clear_local(&self) {
        if let Err(e) = self.logout().await {
            warn!(error = %e, "failed to clear local session");
        }
    }
}
