//! The facade shells hold: one per signed-in device.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::auth::{Session, TokenService};
use crate::capabilities::{KeyValueStore, Transport};
use crate::client::ApiClient;
use crate::config::{ConfigError, CoreConfig};
use crate::debounce::UsernameChecker;
use crate::editor::{EditableForm, EditorTiming};
use crate::media::resolve_asset_url;
use crate::model::{Contact, Credentials, SignupRequest, User};
use crate::query::QueryCache;
use crate::resources::contacts::{contact_fields, contact_values};
use crate::resources::user::{profile_fields, profile_values};
use crate::resources::{
    ContactFieldSaver, ContactListQuery, ContactSearch, Contacts, Images, ProfileFieldSaver,
    ResourceContext, TagSelection, Tags, UserProfile,
};
use crate::view::{ContactDetailView, ContactListView, ProfileView, Screen};
use crate::{AppResult, ErrorReporter, TracingReporter};

/// Wires configuration, the shell capabilities and every resource around a
/// single query cache. Cloning shares that cache.
#[derive(Debug, Clone)]
pub struct ContactsCore {
    config: CoreConfig,
    ctx: ResourceContext,
    contacts: Contacts,
    tags: Tags,
    images: Images,
    profile: Arc<UserProfile>,
}

impl ContactsCore {
    pub fn new(
        config: CoreConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self, ConfigError> {
        Self::with_reporter(config, transport, store, Arc::new(TracingReporter))
    }

    pub fn with_reporter(
        config: CoreConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn KeyValueStore>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let tokens = Arc::new(
            TokenService::new(
                store,
                transport.clone(),
                config.api_base_url.as_str(),
                config.storage_key_style,
            )
            .with_timeout(config.request_timeout),
        );
        let client = Arc::new(
            ApiClient::new(transport, tokens, config.api_base_url.as_str())
                .with_timeout(config.request_timeout)
                .with_retries(config.retries),
        );
        let cache = Arc::new(QueryCache::new(config.cache_capacity));
        let ctx = ResourceContext::new(client, cache, reporter, config.asset_base_url.as_str());
        debug!(api = %config.api_base_url, "core ready");

        Ok(Self {
            contacts: Contacts::new(ctx.clone()),
            tags: Tags::new(ctx.clone()),
            images: Images::new(ctx.clone()),
            profile: Arc::new(UserProfile::new(ctx.clone())),
            config,
            ctx,
        })
    }

    /// Native shells: reqwest for HTTP and a SQLite file for tokens.
    #[cfg(all(feature = "native-http", not(target_arch = "wasm32")))]
    pub fn native(config: CoreConfig, db_path: impl AsRef<std::path::Path>) -> AppResult<Self> {
        let store = Arc::new(crate::capabilities::SqliteKv::open(db_path)?);
        let transport = Arc::new(crate::capabilities::ReqwestTransport::default());
        Ok(Self::new(config, transport, store)?)
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn cache(&self) -> &QueryCache {
        &self.ctx.cache
    }

    pub fn session(&self) -> &Session {
        &self.ctx.session
    }

    pub fn contacts(&self) -> &Contacts {
        &self.contacts
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn images(&self) -> &Images {
        &self.images
    }

    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }

    pub fn asset_url(&self, path: Option<&str>) -> Option<String> {
        resolve_asset_url(path, &self.config.asset_base_url)
    }

    pub async fn is_authenticated(&self) -> bool {
        self.ctx.session.is_authenticated().await
    }

    pub async fn login(&self, credentials: &Credentials) -> AppResult<User> {
        self.ctx.guard("login", self.ctx.session.login(credentials)).await
    }

    pub async fn signup(&self, request: &SignupRequest) -> AppResult<User> {
        self.ctx.guard("signup", self.ctx.session.signup(request)).await
    }

    #[instrument(skip(self))]
    pub async fn logout(&self) -> AppResult<()> {
        let result = self.ctx.session.logout().await;
        info!(ok = result.is_ok(), "logout finished");
        result
    }

    pub fn contact_search(&self) -> ContactSearch {
        ContactSearch::new(self.contacts.clone(), self.config.search_debounce)
    }

    pub fn username_checker(&self) -> UsernameChecker {
        self.profile.username_checker(self.config.username_debounce)
    }

    fn timing(&self) -> EditorTiming {
        EditorTiming {
            undo_window: self.config.undo_window,
            post_save_undo_window: self.config.post_save_undo_window,
        }
    }

    /// Inline-editable detail form; every committed field is PATCHed.
    pub fn contact_form(&self, contact: &Contact) -> EditableForm {
        let saver = Arc::new(ContactFieldSaver::new(self.contacts.clone(), contact.slug.as_str()));
        EditableForm::new(contact_fields(), &contact_values(contact), saver).with_timing(self.timing())
    }

    pub fn profile_form(&self, user: &User) -> EditableForm {
        let saver = Arc::new(ProfileFieldSaver::new((*self.profile).clone()));
        EditableForm::new(profile_fields(), &profile_values(user), saver).with_timing(self.timing())
    }

    pub fn tag_selection(&self, contact: &Contact) -> TagSelection {
        TagSelection::new(self.tags.clone(), contact, self.config.undo_window)
    }

    pub async fn contact_list_screen(&self, query: &ContactListQuery) -> Screen<ContactListView> {
        let result = self.contacts.list(query).await;
        let known = self.tags.list().await.unwrap_or_default();
        ContactListView::screen(&result, query, &known, &self.config.asset_base_url)
    }

    pub async fn contact_screen(&self, slug: &str) -> Screen<ContactDetailView> {
        let result = self.contacts.get(slug).await;
        let known = self.tags.list().await.unwrap_or_default();
        ContactDetailView::screen(&result, &known, &self.config.asset_base_url)
    }

    pub async fn profile_screen(&self) -> Screen<ProfileView> {
        let result = self.profile.current_user().await;
        ProfileView::screen(&result, &self.config.asset_base_url)
    }
}
