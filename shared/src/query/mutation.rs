use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use super::cache::{QueryCache, QueryKey, Snapshot};
use crate::client::ApiError;

/// A server write whose expected result is applied to the cache before the
/// request is sent.
///
/// Implementors describe *what* changes; [`run_optimistic`] owns the
/// lifecycle. Every cached entry under [`affected`](Self::affected) whose
/// data deserializes as [`Data`](Self::Data) is rewritten with
/// [`apply`](Self::apply), so all parameter variants of a list move
/// together and roll back together.
#[async_trait::async_trait]
pub trait OptimisticMutation: Send + Sync {
    type Output: Send;
    type Data: Serialize + DeserializeOwned;

    fn name(&self) -> &'static str;

    fn affected(&self) -> QueryKey;

    /// Refetched once the mutation settles. Defaults to the affected prefix.
    fn settles(&self) -> QueryKey {
        self.affected()
    }

    fn apply(&self, key: &QueryKey, data: Self::Data) -> Self::Data;

    async fn execute(&self) -> Result<Self::Output, ApiError>;

    fn on_mutate(&self, cache: &QueryCache) -> Snapshot {
        let prefix = self.affected();
        cache.cancel_queries(&prefix);
        let snapshot = cache.snapshot(&prefix);
        let rewritten = cache.update_query_data(&prefix, |key, data| self.apply(key, data));
        debug!(mutation = self.name(), %prefix, rewritten, "optimistic update applied");
        snapshot
    }

    fn on_error(&self, cache: &QueryCache, snapshot: Snapshot, error: &ApiError) {
        warn!(
            mutation = self.name(),
            restored = snapshot.len(),
            %error,
            "mutation failed, rolling back"
        );
        cache.restore(snapshot);
    }

    fn on_settled(&self, cache: &QueryCache) {
        cache.invalidate(&self.settles());
    }
}

#[instrument(skip_all, fields(mutation = mutation.name()))]
pub async fn run_optimistic<M: OptimisticMutation>(
    cache: &QueryCache,
    mutation: &M,
) -> Result<M::Output, ApiError> {
    let snapshot = mutation.on_mutate(cache);
    let result = mutation.execute().await;
    if let Err(e) = &result {
        mutation.on_error(cache, snapshot, e);
    }
    mutation.on_settled(cache);
    result
}
