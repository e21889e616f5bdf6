#![allow(dead_code)]

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use contacts_shared::capabilities::testing::{MemoryKv, MockTransport};
use contacts_shared::capabilities::StorageKeyStyle;
use contacts_shared::{ContactsCore, CoreConfig};

pub const ACCESS_KEY: &str = "jwt_current_user_access";
pub const REFRESH_KEY: &str = "jwt_current_user_refresh";

pub fn jwt_expiring_in(secs: i64) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"u1","exp":{}}}"#, now + secs));
    format!("eyJhbGciOiJIUzI1NiJ9.{payload}.sig")
}

pub struct Harness {
    pub mock: Arc<MockTransport>,
    pub kv: Arc<MemoryKv>,
    pub core: ContactsCore,
}

pub fn harness() -> Harness {
    let mock = Arc::new(MockTransport::new());
    let kv = Arc::new(MemoryKv::new());
    let config = CoreConfig::default()
        .with_api_base_url("https://api.test")
        .with_asset_base_url("https://cdn.test/media")
        .with_storage_key_style(StorageKeyStyle::Raw);
    let core = ContactsCore::new(config, mock.clone(), kv.clone()).unwrap();
    Harness { mock, kv, core }
}
