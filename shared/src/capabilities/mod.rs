//! Shell boundary. The core never touches sockets or platform storage
//! directly: it builds [`HttpRequest`]s for a [`Transport`] and rendered
//! keys for a [`KeyValueStore`].

mod http;
mod kv;

pub use self::http::{
    ContentType, HttpError, HttpHeaders, HttpMethod, HttpRequest, HttpResponse, HttpResult,
    Transport, ValidatedUrl, DEFAULT_TIMEOUT_MS, MAX_REQUEST_BODY_SIZE, MAX_TIMEOUT_MS,
    MAX_URL_LENGTH,
};
pub use self::kv::{
    KeyNamespace, KeyValueStore, KvError, KvKey, KvResult, MemoryKv, StorageKeyStyle,
    MAX_KEY_LENGTH, MAX_VALUE_SIZE,
};

#[cfg(all(feature = "native-http", not(target_arch = "wasm32")))]
pub use self::http::ReqwestTransport;

#[cfg(not(target_arch = "wasm32"))]
pub use self::kv::SqliteKv;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    use super::{HttpError, HttpHeaders, HttpMethod, HttpRequest, HttpResponse, HttpResult};
    use super::Transport;
    use serde_json::Value;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;

    pub use super::MemoryKv;

    /// A scripted server answer.
    #[derive(Debug, Clone)]
    pub enum MockReply {
        Json(u16, Value),
        Empty(u16),
        Error(HttpError),
        Delay(Duration, Box<MockReply>),
    }

    impl MockReply {
        pub fn ok(body: Value) -> Self {
            MockReply::Json(200, body)
        }

        pub fn status(status: u16, body: Value) -> Self {
            MockReply::Json(status, body)
        }

        pub fn delayed(self, by: Duration) -> Self {
            MockReply::Delay(by, Box::new(self))
        }
    }

    /// Replies are matched on method and URL path. Each route plays its
    /// queue in order and repeats the last reply forever. Unscripted routes
    /// fail with a connection error.
    #[derive(Debug, Default)]
    pub struct MockTransport {
        routes: Mutex<HashMap<(HttpMethod, String), VecDeque<MockReply>>>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn on(&self, method: HttpMethod, path: &str, reply: MockReply) -> &Self {
            self.routes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry((method, path.to_string()))
                .or_default()
                .push_back(reply);
            self
        }

        /// Drops every scripted reply for a route.
        pub fn clear_route(&self, method: HttpMethod, path: &str) {
            self.routes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&(method, path.to_string()));
        }

        pub fn requests(&self) -> Vec<HttpRequest> {
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        pub fn count(&self, method: HttpMethod, path: &str) -> usize {
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .filter(|r| r.method() == method && r.url().path() == path)
                .count()
        }

        pub fn last(&self, method: HttpMethod, path: &str) -> Option<HttpRequest> {
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .rev()
                .find(|r| r.method() == method && r.url().path() == path)
                .cloned()
        }

        fn next_reply(&self, method: HttpMethod, path: &str) -> Option<MockReply> {
            let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
            let queue = routes.get_mut(&(method, path.to_string()))?;
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        }
    }

    #[async_trait::async_trait]
    impl Transport for MockTransport {
        async fn execute(&self, request: HttpRequest) -> HttpResult {
            let method = request.method();
            let path = request.url().path().to_string();
            let request_id = request.request_id().to_string();
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(request);

            let Some(mut reply) = self.next_reply(method, &path) else {
                return Err(HttpError::ConnectionError {
                    host: "mock".to_string(),
                    message: format!("no reply scripted for {} {path}", method.as_str()),
                });
            };

            let mut delay = Duration::ZERO;
            while let MockReply::Delay(by, inner) = reply {
                delay += by;
                reply = *inner;
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match reply {
                MockReply::Json(status, body) => {
                    let mut headers = HttpHeaders::new();
                    headers.insert("Content-Type", "application/json")?;
                    let body = serde_json::to_vec(&body).map_err(|e| {
                        HttpError::SerializationError {
                            message: e.to_string(),
                        }
                    })?;
                    Ok(HttpResponse::new(status, headers, body, request_id))
                }
                MockReply::Empty(status) => Ok(HttpResponse::new(
                    status,
                    HttpHeaders::new(),
                    Vec::new(),
                    request_id,
                )),
                MockReply::Error(err) => Err(err),
                MockReply::Delay(..) => unreachable!("delays are unwrapped above"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{MockReply, MockTransport};
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn mock_plays_queue_then_repeats_last() {
        let mock = MockTransport::new();
        mock.on(HttpMethod::Get, "/tags", MockReply::Json(500, json!({})))
            .on(HttpMethod::Get, "/tags", MockReply::ok(json!([])));

        let req = || HttpRequest::get("https://api.test/tags").unwrap();
        assert_eq!(mock.execute(req()).await.unwrap().status(), 500);
        assert_eq!(mock.execute(req()).await.unwrap().status(), 200);
        assert_eq!(mock.execute(req()).await.unwrap().status(), 200);
        assert_eq!(mock.count(HttpMethod::Get, "/tags"), 3);
    }

    #[tokio::test]
    async fn mock_unscripted_route_is_connection_error() {
        let mock = MockTransport::new();
        let err = mock
            .execute(HttpRequest::delete("https://api.test/tags/1").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::ConnectionError { .. }));
        assert!(mock.last(HttpMethod::Delete, "/tags/1").is_some());
    }

    #[test]
    fn storage_failures_become_storage_app_errors() {
        let err: crate::AppError = KvError::storage("disk full").into();
        assert_eq!(err.kind, crate::ErrorKind::Storage);
        assert!(err.internal_message.unwrap().contains("disk full"));
    }
}
