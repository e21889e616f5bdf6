use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;
pub const MAX_PREFIX_LENGTH: usize = 64;

/// How keys are rendered before they reach the platform store. Web storage
/// accepts anything; native secure stores only accept a restricted alphabet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageKeyStyle {
    #[default]
    Raw,
    Sanitized,
}

impl StorageKeyStyle {
    pub fn apply(self, key: &str) -> String {
        match self {
            StorageKeyStyle::Raw => key.to_string(),
            StorageKeyStyle::Sanitized => key
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                        c
                    } else {
                        '_'
                    }
                })
                .collect(),
        }
    }

    /// The style native shells get by default.
    pub fn for_target() -> Self {
        if cfg!(target_arch = "wasm32") {
            StorageKeyStyle::Raw
        } else {
            StorageKeyStyle::Sanitized
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvKey {
    namespace: KeyNamespace,
    key: String,
}

impl KvKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self { namespace, key })
    }

    /// `jwt_{user}_access`
    pub fn access_token(user: &str) -> Result<Self, KvError> {
        Self::new(KeyNamespace::Jwt, format!("{user}_access"))
    }

    /// `jwt_{user}_refresh`
    pub fn refresh_token(user: &str) -> Result<Self, KvError> {
        Self::new(KeyNamespace::Jwt, format!("{user}_refresh"))
    }

    pub fn raw(&self) -> String {
        format!("{}_{}", self.namespace.prefix(), self.key)
    }

    pub fn render(&self, style: StorageKeyStyle) -> String {
        style.apply(&self.raw())
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn validate_key(key: &str) -> Result<(), KvError> {
        if key.trim().is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(KvError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {MAX_KEY_LENGTH} bytes"),
            });
        }

        if key.contains('\0') {
            return Err(KvError::InvalidKey {
                key: key.replace('\0', "\\0"),
                reason: "key cannot contain null bytes".to_string(),
            });
        }

        if key.contains("..") {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot contain path traversal sequences".to_string(),
            });
        }

        if key.starts_with('/') || key.starts_with('\\') {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot start with path separator".to_string(),
            });
        }

        if key.chars().any(char::is_control) {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key contains invalid control characters".to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    Jwt,
    Settings,
    Custom(String),
}

impl KeyNamespace {
    pub fn prefix(&self) -> &str {
        match self {
            KeyNamespace::Jwt => "jwt",
            KeyNamespace::Settings => "settings",
            KeyNamespace::Custom(s) => s.as_str(),
        }
    }

    pub fn custom(prefix: impl Into<String>) -> Result<Self, KvError> {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return Err(KvError::InvalidKey {
                key: prefix,
                reason: "custom namespace cannot be empty".to_string(),
            });
        }
        if prefix.len() > MAX_PREFIX_LENGTH {
            return Err(KvError::InvalidKey {
                key: prefix,
                reason: format!("custom namespace exceeds maximum length of {MAX_PREFIX_LENGTH} bytes"),
            });
        }
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(KvError::InvalidKey {
                key: prefix,
                reason: "custom namespace contains invalid characters".to_string(),
            });
        }
        Ok(KeyNamespace::Custom(prefix))
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {message}")]
    Storage { message: String, retryable: bool },
}

impl From<KvError> for crate::AppError {
    fn from(e: KvError) -> Self {
        let kind = match &e {
            KvError::InvalidKey { .. } | KvError::ValueTooLarge { .. } => crate::ErrorKind::InvalidState,
            KvError::Storage { .. } => crate::ErrorKind::Storage,
        };
        crate::AppError::new(kind, "local storage failed").with_internal(e.to_string())
    }
}

impl KvError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, KvError::Storage { retryable: true, .. })
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            retryable: false,
        }
    }
}

pub type KvResult<T> = Result<T, KvError>;

/// Platform key/value storage: `localStorage` on web, the secure store on
/// native. Keys arrive already rendered.
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> KvResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> KvResult<()>;
    async fn delete(&self, key: &str) -> KvResult<()>;
}

fn check_value(value: &str) -> KvResult<()> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

/// In-process store. Used by web shells that sync to `localStorage`
/// themselves, and by tests.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryKv {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> KvResult<()> {
        check_value(value)?;
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use self::sqlite::SqliteKv;

#[cfg(not(target_arch = "wasm32"))]
mod sqlite {
    use super::{check_value, KeyValueStore, KvError, KvResult};
    use rusqlite::{params, Connection, OptionalExtension};
    use std::path::Path;
    use std::sync::{Arc, Mutex, PoisonError};

    /// SQLite-backed store for desktop shells without a keychain.
    #[derive(Clone)]
    pub struct SqliteKv {
        conn: Arc<Mutex<Connection>>,
    }

    impl SqliteKv {
        pub fn open(path: impl AsRef<Path>) -> KvResult<Self> {
            let conn = Connection::open(path).map_err(to_kv_error)?;
            Self::init(conn)
        }

        pub fn open_in_memory() -> KvResult<Self> {
            let conn = Connection::open_in_memory().map_err(to_kv_error)?;
            Self::init(conn)
        }

        fn init(conn: Connection) -> KvResult<Self> {
            conn.execute_batch(
                r"
                CREATE TABLE IF NOT EXISTS kv (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                ",
            )
            .map_err(to_kv_error)?;
            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            })
        }

        async fn with_conn<T, F>(&self, f: F) -> KvResult<T>
        where
            T: Send + 'static,
            F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        {
            let conn = Arc::clone(&self.conn);
            tokio::task::spawn_blocking(move || {
                let guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
                f(&guard).map_err(to_kv_error)
            })
            .await
            .map_err(|e| KvError::storage(format!("storage task failed: {e}")))?
        }
    }

    fn to_kv_error(e: rusqlite::Error) -> KvError {
        let retryable = matches!(
            e.sqlite_error_code(),
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
        );
        KvError::Storage {
            message: e.to_string(),
            retryable,
        }
    }

    #[async_trait::async_trait]
    impl KeyValueStore for SqliteKv {
        async fn get(&self, key: &str) -> KvResult<Option<String>> {
            let key = key.to_string();
            self.with_conn(move |conn| {
                conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                    row.get(0)
                })
                .optional()
            })
            .await
        }

        async fn set(&self, key: &str, value: &str) -> KvResult<()> {
            check_value(value)?;
            let key = key.to_string();
            let value = value.to_string();
            let now = i64::try_from(crate::UnixTimeMs::now().0).unwrap_or(i64::MAX);
            self.with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                    params![key, value, now],
                )
                .map(|_| ())
            })
            .await
        }

        async fn delete(&self, key: &str) -> KvResult<()> {
            let key = key.to_string();
            self.with_conn(move |conn| {
                conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
                    .map(|_| ())
            })
            .await
        }
    }
}
