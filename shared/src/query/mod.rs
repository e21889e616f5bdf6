//! Shared server-state cache and the optimistic mutation lifecycle.

mod cache;
mod mutation;

pub use self::cache::{CacheEntry, CacheError, FetchTicket, QueryCache, QueryKey, Snapshot};
pub use self::mutation::{run_optimistic, OptimisticMutation};
