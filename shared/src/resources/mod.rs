//! Entity queries and mutations on top of the fetch client and the shared
//! query cache.

pub mod contacts;
pub mod images;
pub mod tags;
pub mod user;

use std::future::Future;
use std::sync::Arc;

use crate::auth::Session;
use crate::client::{ApiClient, FetchOptions};
use crate::query::QueryCache;
use crate::{AppError, AppResult, ErrorKind, ErrorReporter};

pub use self::contacts::{ContactFieldSaver, ContactListQuery, ContactSearch, Contacts, SortField, SortOrder};
pub use self::images::{ImageTarget, Images};
pub use self::tags::{TagSelection, Tags};
pub use self::user::{ProfileFieldSaver, UserProfile};

/// Cache keys. Each family shares a prefix so one invalidation or
/// optimistic rewrite reaches every parameter variant.
pub mod keys {
    use super::contacts::ContactListQuery;
    use super::images::ImageTarget;
    use crate::auth::Session;
    use crate::query::QueryKey;

    pub fn contacts() -> QueryKey {
        QueryKey::new(["contacts"])
    }

    pub fn contact_lists() -> QueryKey {
        contacts().child("list")
    }

    pub fn contact_list(query: &ContactListQuery) -> QueryKey {
        contact_lists().child(query.cache_segment())
    }

    pub fn contact(slug: &str) -> QueryKey {
        contacts().child("detail").child(slug)
    }

    pub fn tags() -> QueryKey {
        QueryKey::new(["tags"])
    }

    pub fn images(target: ImageTarget, id: &str) -> QueryKey {
        QueryKey::new(["images", target.as_str(), id])
    }

    pub fn current_user() -> QueryKey {
        Session::query_key()
    }
}

/// Rejects ids that would change the shape of a request path.
pub(crate) fn segment<'a>(what: &str, value: &'a str) -> AppResult<&'a str> {
    if value.is_empty()
        || value
            .chars()
            .any(|c| matches!(c, '/' | '?' | '#' | '%') || c.is_whitespace() || c.is_control())
    {
        return Err(AppError::new(ErrorKind::Validation, format!("Invalid {what}")));
    }
    Ok(value)
}

/// Everything a resource wrapper needs. Cloning is cheap.
#[derive(Clone)]
pub struct ResourceContext {
    pub client: Arc<ApiClient>,
    pub cache: Arc<QueryCache>,
    pub session: Session,
    pub reporter: Arc<dyn ErrorReporter>,
    pub asset_base_url: String,
}

impl ResourceContext {
    pub fn new(
        client: Arc<ApiClient>,
        cache: Arc<QueryCache>,
        reporter: Arc<dyn ErrorReporter>,
        asset_base_url: impl Into<String>,
    ) -> Self {
        let session = Session::new(client.clone(), cache.clone());
        Self {
            client,
            cache,
            session,
            reporter,
            asset_base_url: asset_base_url.into(),
        }
    }

    pub fn authed(&self) -> FetchOptions {
        self.session.authed()
    }

    /// Reports a failed operation. An authentication failure also ends the
    /// local session.
    pub async fn fail(&self, action: &'static str, error: impl Into<AppError>) -> AppError {
        let error = error.into().with_context("action", action);
        self.reporter.report(action, &error);
        if error.kind == ErrorKind::Authentication {
            self.session.clear_local().await;
        }
        error
    }

    /// Runs `op`, routing any error through [`fail`](Self::fail).
    pub async fn guard<T, F>(&self, action: &'static str, op: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>>,
    {
        match op.await {
            Ok(value) => Ok(value),
            Err(e) => Err(self.fail(action, e).await),
        }
    }
}

impl std::fmt::Debug for ResourceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceContext")
            .field("client", &self.client)
            .field("session", &self.session)
            .field("asset_base_url", &self.asset_base_url)
            .finish_non_exhaustive()
    }
}
