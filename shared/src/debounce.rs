use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::AppResult;

pub const USERNAME_MIN_LEN: usize = 3;
pub const USERNAME_MAX_LEN: usize = 30;

/// Trailing-edge debounce. Every call to [`settle`](Self::settle) waits out
/// the delay; only the most recent caller gets its value back.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    generation: AtomicU64,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            generation: AtomicU64::new(0),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// `Some(value)` if no newer call arrived during the delay.
    pub async fn settle<T>(&self, value: T) -> Option<T> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.delay).await;
        (self.generation.load(Ordering::SeqCst) == generation).then_some(value)
    }

    /// Makes every pending `settle` return `None`.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
pub trait AvailabilityCheck: Send + Sync {
    async fn is_available(&self, username: &str) -> AppResult<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UsernameStatus {
    Empty,
    Invalid(String),
    /// The user's own current username.
    Unchanged,
    Available,
    Taken,
}

impl UsernameStatus {
    pub fn can_submit(&self) -> bool {
        matches!(self, UsernameStatus::Available | UsernameStatus::Unchanged)
    }
}

/// Local rules checked before asking the server.
pub fn username_issue(username: &str) -> Option<String> {
    let len = username.chars().count();
    if len < USERNAME_MIN_LEN {
        return Some(format!("Username must be at least {USERNAME_MIN_LEN} characters"));
    }
    if len > USERNAME_MAX_LEN {
        return Some(format!("Username must be at most {USERNAME_MAX_LEN} characters"));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Some("Username may only contain letters, numbers, '.', '_' and '-'".into());
    }
    None
}

/// Debounced username availability. Repeating the last checked value
/// answers from memory without waiting or calling the server.
pub struct UsernameChecker {
    check: Arc<dyn AvailabilityCheck>,
    debouncer: Debouncer,
    own: Option<String>,
    last: Mutex<Option<(String, bool)>>,
}

impl UsernameChecker {
    pub fn new(check: Arc<dyn AvailabilityCheck>, delay: Duration) -> Self {
        Self {
            check,
            debouncer: Debouncer::new(delay),
            own: None,
            last: Mutex::new(None),
        }
    }

    /// The signed-in user's username, reported as `Unchanged`.
    #[must_use]
    pub fn with_current(mut self, username: impl Into<String>) -> Self {
        self.own = Some(username.into());
        self
    }

    /// `None` when a newer input superseded this one.
    pub async fn check(&self, input: &str) -> Option<AppResult<UsernameStatus>> {
        let username = input.trim();
        if username.is_empty() {
            self.debouncer.cancel();
            return Some(Ok(UsernameStatus::Empty));
        }
        if let Some(issue) = username_issue(username) {
            self.debouncer.cancel();
            return Some(Ok(UsernameStatus::Invalid(issue)));
        }
        if self.own.as_deref().is_some_and(|own| own.eq_ignore_ascii_case(username)) {
            self.debouncer.cancel();
            return Some(Ok(UsernameStatus::Unchanged));
        }
        if let Some(available) = self.cached(username) {
            self.debouncer.cancel();
            debug!(username, "username answered from last check");
            return Some(Ok(status(available)));
        }

        let username = self.debouncer.settle(username.to_string()).await?;
        let result = self.check.is_available(&username).await;
        if let Ok(available) = result {
            *self.last.lock().unwrap_or_else(PoisonError::into_inner) =
                Some((username, available));
        }
        Some(result.map(status))
    }

    fn cached(&self, username: &str) -> Option<bool> {
        let last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        last.as_ref()
            .filter(|(checked, _)| checked == username)
            .map(|(_, available)| *available)
    }
}

fn status(available: bool) -> UsernameStatus {
    if available {
        UsernameStatus::Available
    } else {
        UsernameStatus::Taken
    }
}

impl std::fmt::Debug for UsernameChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsernameChecker")
            .field("debouncer", &self.debouncer)
            .field("own", &self.own)
            .finish_non_exhaustive()
    }
}
