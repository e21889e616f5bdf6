use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use super::{keys, ResourceContext};
use crate::client::{valid, Body};
use crate::debounce::{username_issue, AvailabilityCheck, UsernameChecker};
use crate::editor::{FieldConfig, FieldKind, FieldSaver, SaveError, Validator};
use crate::media::prepare_avatar;
use crate::model::{FieldId, User, UserUpdate, UsernameAvailability};
use crate::{AppError, AppResult, ErrorKind};

pub const BIO_MAX_LEN: usize = 500;

/// Builds the PATCH body for one edited profile field.
pub fn profile_patch(field: &FieldId, value: &str) -> AppResult<UserUpdate> {
    let value = value.trim().to_string();
    let mut update = UserUpdate::default();
    match field.as_str() {
        "username" => {
            if let Some(issue) = username_issue(&value) {
                return Err(AppError::new(ErrorKind::Validation, issue));
            }
            update.username = Some(value);
        }
        "first_name" => update.first_name = Some(value),
        "last_name" => update.last_name = Some(value),
        "bio" => update.bio = Some(value),
        other => {
            return Err(AppError::new(
                ErrorKind::Validation,
                format!("Profiles have no editable field '{other}'"),
            ))
        }
    }
    Ok(update)
}

pub fn profile_fields() -> Vec<FieldConfig> {
    vec![
        FieldConfig::new("username", "Username", FieldKind::Username)
            .required()
            .validator(Validator::custom(username_issue)),
        FieldConfig::new("first_name", "First name", FieldKind::Text).validator(Validator::MaxLength(100)),
        FieldConfig::new("last_name", "Last name", FieldKind::Text).validator(Validator::MaxLength(100)),
        FieldConfig::new("bio", "Bio", FieldKind::Multiline).validator(Validator::MaxLength(BIO_MAX_LEN)),
    ]
}

pub fn profile_values(user: &User) -> HashMap<FieldId, String> {
    HashMap::from([
        (FieldId::from("username"), user.username.clone()),
        (FieldId::from("first_name"), user.first_name.clone()),
        (FieldId::from("last_name"), user.last_name.clone()),
        (FieldId::from("bio"), user.bio.clone().unwrap_or_default()),
    ])
}

/// The signed-in user's own profile.
#[derive(Debug, Clone)]
pub struct UserProfile {
    ctx: ResourceContext,
}

impl UserProfile {
    pub fn new(ctx: ResourceContext) -> Self {
        Self { ctx }
    }

    fn remember(&self, user: &User) {
        if let Err(e) = self.ctx.cache.set_query_data(keys::current_user(), user) {
            warn!(error = %e, "could not cache current user");
        }
    }

    /// `Ok(None)` when nobody is signed in or the account no longer exists.
    #[instrument(skip(self))]
    pub async fn current_user(&self) -> AppResult<Option<User>> {
        if !self.ctx.session.is_authenticated().await {
            return Ok(None);
        }
        let client = &self.ctx.client;
        let opts = self.ctx.authed();
        let result = self
            .ctx
            .cache
            .fetch_query(&keys::current_user(), || async move {
                valid(client.get::<User>("/users/me", opts).await?)
            })
            .await;
        match result {
            Ok(user) => Ok(Some(user)),
            Err(e) if e.kind == ErrorKind::NotFound => {
                debug!("current user not found");
                self.ctx.cache.remove(&keys::current_user());
                Ok(None)
            }
            Err(e) => Err(self.ctx.fail("current_user", e).await),
        }
    }

    #[instrument(skip_all)]
    pub async fn update_profile(&self, update: &UserUpdate) -> AppResult<User> {
        self.ctx
            .guard("update_profile", async {
                let user: User = valid(
                    self.ctx
                        .client
                        .patch("/users/me", Body::json(update)?, self.ctx.authed())
                        .await?,
                )?;
                self.remember(&user);
                Ok(user)
            })
            .await
    }

    pub async fn update_field(&self, field: &FieldId, value: &str) -> AppResult<User> {
        let update = match profile_patch(field, value) {
            Ok(update) => update,
            Err(e) => return Err(self.ctx.fail("update_profile", e).await),
        };
        self.update_profile(&update).await
    }

    #[instrument(skip(self, image), fields(bytes = image.len()))]
    pub async fn upload_avatar(&self, image: Vec<u8>) -> AppResult<User> {
        self.ctx
            .guard("upload_user_avatar", async {
                let prepared = prepare_avatar(image).await?;
                let user: User = valid(
                    self.ctx
                        .client
                        .post("/users/me/avatar", prepared.into_multipart("avatar"), self.ctx.authed())
                        .await?,
                )?;
                self.remember(&user);
                Ok(user)
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn check_username(&self, username: &str) -> AppResult<bool> {
        self.ctx
            .guard("check_username", async {
                let opts = self.ctx.authed().query("username", username);
                let answer: UsernameAvailability =
                    valid(self.ctx.client.get("/users/check-username", opts).await?)?;
                Ok(answer.available)
            })
            .await
    }

    /// A debounced checker that treats the cached username as unchanged.
    pub fn username_checker(self: &Arc<Self>, delay: Duration) -> UsernameChecker {
        let checker = UsernameChecker::new(self.clone(), delay);
        match self.ctx.cache.get_query_data::<User>(&keys::current_user()) {
            Some(user) => checker.with_current(user.username),
            None => checker,
        }
    }
}

#[async_trait::async_trait]
impl AvailabilityCheck for UserProfile {
    async fn is_available(&self, username: &str) -> AppResult<bool> {
        self.check_username(username).await
    }
}

pub struct ProfileFieldSaver {
    profile: UserProfile,
}

impl ProfileFieldSaver {
    pub fn new(profile: UserProfile) -> Self {
        Self { profile }
    }
}

#[async_trait::async_trait]
impl FieldSaver for ProfileFieldSaver {
    async fn save(&self, field: &FieldId, value: &str) -> Result<(), SaveError> {
        self.profile
            .update_field(field, value)
            .await
            .map(|_| ())
            .map_err(|e| SaveError::for_field(field, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::MockReply;
    use crate::capabilities::HttpMethod;
    use crate::capabilities::KeyValueStore;
    use crate::debounce::UsernameStatus;
    use crate::resources::testing::fixture;
    use serde_json::{json, Value};

    fn ada() -> Value {
        json!({"id": "u1", "username": "ada", "email": "ada@example.com", "first_name": "Ada"})
    }

    #[tokio::test]
    async fn current_user_is_cached() {
        let f = fixture().await;
        f.mock.on(HttpMethod::Get, "/users/me", MockReply::ok(ada()));
        let profile = UserProfile::new(f.ctx.clone());

        let first = profile.current_user().await.unwrap().unwrap();
        let second = profile.current_user().await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(f.mock.count(HttpMethod::Get, "/users/me"), 1);
    }

    #[tokio::test]
    async fn signed_out_has_no_user() {
        let f = fixture().await;
        f.kv.delete("jwt_current_user_access").await.unwrap();
        f.kv.delete("jwt_current_user_refresh").await.unwrap();

        assert_eq!(UserProfile::new(f.ctx.clone()).current_user().await.unwrap(), None);
        assert!(f.mock.requests().is_empty());
    }

    #[tokio::test]
    async fn deleted_account_reads_as_none() {
        let f = fixture().await;
        f.mock
            .on(HttpMethod::Get, "/users/me", MockReply::status(404, json!({})));
        assert_eq!(UserProfile::new(f.ctx.clone()).current_user().await.unwrap(), None);
        assert!(f.reporter.reports.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn field_save_patches_one_field() {
        let f = fixture().await;
        let mut updated = ada();
        updated["bio"] = json!("Analyst");
        f.mock.on(HttpMethod::Patch, "/users/me", MockReply::ok(updated));
        let saver = ProfileFieldSaver::new(UserProfile::new(f.ctx.clone()));

        saver.save(&FieldId::from("bio"), " Analyst ").await.unwrap();

        let sent = f.mock.last(HttpMethod::Patch, "/users/me").unwrap();
        assert_eq!(sent.json_body(), Some(json!({"bio": "Analyst"})));
        let cached: User = f.ctx.cache.get_query_data(&keys::current_user()).unwrap();
        assert_eq!(cached.bio.as_deref(), Some("Analyst"));
    }

    #[tokio::test]
    async fn bad_username_is_an_inline_error() {
        let f = fixture().await;
        let saver = ProfileFieldSaver::new(UserProfile::new(f.ctx.clone()));
        let err = saver.save(&FieldId::from("username"), "a b").await.unwrap_err();
        assert!(matches!(err, SaveError::Invalid { .. }));
        assert!(f.mock.requests().is_empty());
    }

    #[tokio::test]
    async fn check_username_sends_query() {
        let f = fixture().await;
        f.mock.on(
            HttpMethod::Get,
            "/users/check-username",
            MockReply::ok(json!({"available": false})),
        );
        let profile = UserProfile::new(f.ctx.clone());
        assert!(!profile.check_username("grace").await.unwrap());
        let sent = f.mock.last(HttpMethod::Get, "/users/check-username").unwrap();
        assert_eq!(sent.url().as_str(), "https://api.test/users/check-username?username=grace");
    }

    #[tokio::test(start_paused = true)]
    async fn checker_knows_own_username() {
        let f = fixture().await;
        f.ctx.cache.set_raw(keys::current_user(), ada());
        let profile = Arc::new(UserProfile::new(f.ctx.clone()));
        let checker = profile.username_checker(Duration::from_millis(500));
        assert_eq!(checker.check("ada").await, Some(Ok(UsernameStatus::Unchanged)));
        assert!(f.mock.requests().is_empty());
    }
}
