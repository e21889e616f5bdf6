mod common;

use common::{harness, jwt_expiring_in, ACCESS_KEY, REFRESH_KEY};
use contacts_shared::capabilities::testing::MockReply;
use contacts_shared::capabilities::{HttpMethod, KeyValueStore};
use contacts_shared::model::{Credentials, User};
use contacts_shared::resources::keys;
use contacts_shared::view::Screen;
use contacts_shared::ErrorKind;
use serde_json::json;

fn ada() -> serde_json::Value {
    json!({"id": "u1", "username": "ada", "email": "ada@example.com", "first_name": "Ada", "last_name": "Lovelace"})
}

fn credentials() -> Credentials {
    Credentials {
        email: "ada@example.com".into(),
        password: "correct horse".into(),
    }
}

#[tokio::test]
async fn login_then_logout() {
    let h = harness();
    let access = jwt_expiring_in(3600);
    h.mock
        .on(
            HttpMethod::Post,
            "/auth/login",
            MockReply::ok(json!({"access": access, "refresh": "r1"})),
        )
        .on(HttpMethod::Get, "/users/me", MockReply::ok(ada()));

    assert!(!h.core.is_authenticated().await);
    let user = h.core.login(&credentials()).await.unwrap();
    assert_eq!(user.username, "ada");

    assert_eq!(h.kv.get(ACCESS_KEY).await.unwrap(), Some(access.clone()));
    assert_eq!(h.kv.get(REFRESH_KEY).await.unwrap().as_deref(), Some("r1"));
    let cached: User = h.core.cache().get_query_data(&keys::current_user()).unwrap();
    assert_eq!(cached, user);

    let me = h.mock.last(HttpMethod::Get, "/users/me").unwrap();
    assert_eq!(
        me.headers().get("Authorization"),
        Some(format!("Bearer {access}").as_str())
    );

    match h.core.profile_screen().await {
        Screen::Ready(view) => assert_eq!(view.name, "Ada Lovelace"),
        other => panic!("unexpected screen {other:?}"),
    }
    assert_eq!(h.mock.count(HttpMethod::Get, "/users/me"), 1);

    h.core.logout().await.unwrap();
    assert_eq!(h.kv.get(ACCESS_KEY).await.unwrap(), None);
    assert_eq!(h.kv.get(REFRESH_KEY).await.unwrap(), None);
    assert!(!h.core.cache().contains(&keys::current_user()));
    assert_eq!(h.core.profile_screen().await, Screen::UserNotFound);
}

#[tokio::test]
async fn wrong_password_stays_signed_out() {
    let h = harness();
    h.mock.on(
        HttpMethod::Post,
        "/auth/login",
        MockReply::status(401, json!({"detail": "Invalid credentials"})),
    );

    let err = h.core.login(&credentials()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Authentication);
    assert!(!h.core.is_authenticated().await);
    assert_eq!(h.mock.count(HttpMethod::Post, "/auth/refresh"), 0);
}

#[tokio::test]
async fn expired_token_is_refreshed_once() {
    let h = harness();
    let renewed = jwt_expiring_in(3600);
    h.kv.set(ACCESS_KEY, &jwt_expiring_in(-60)).await.unwrap();
    h.kv.set(REFRESH_KEY, "r1").await.unwrap();
    h.mock
        .on(
            HttpMethod::Post,
            "/auth/refresh",
            MockReply::ok(json!({"access": renewed, "refresh": "r2"})),
        )
        .on(HttpMethod::Get, "/users/me", MockReply::ok(ada()));

    let user = h.core.profile().current_user().await.unwrap().unwrap();
    assert_eq!(user.id, "u1");
    assert_eq!(h.mock.count(HttpMethod::Post, "/auth/refresh"), 1);
    assert_eq!(h.kv.get(ACCESS_KEY).await.unwrap(), Some(renewed));
    assert_eq!(h.kv.get(REFRESH_KEY).await.unwrap().as_deref(), Some("r2"));
}

#[tokio::test]
async fn rejected_refresh_ends_the_session() {
    let h = harness();
    h.kv.set(ACCESS_KEY, &jwt_expiring_in(3600)).await.unwrap();
    h.kv.set(REFRESH_KEY, "revoked").await.unwrap();
    h.mock
        .on(HttpMethod::Get, "/contacts/ada", MockReply::status(401, json!({})))
        .on(HttpMethod::Post, "/auth/refresh", MockReply::status(401, json!({})));

    let err = h.core.contacts().get("ada").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Authentication);
    assert_eq!(h.mock.count(HttpMethod::Get, "/contacts/ada"), 1);
    assert!(!h.core.is_authenticated().await);
}
