//! Last.fm REST client.
//!
//! Every call goes through [`LastfmClient::call`], which classifies the
//! response and retries transient failures a bounded number of times with a
//! fixed delay. Rate limits and entity-level errors are returned at once.

use std::time::Duration;

use scrobble_proto::config::{LastfmConfig, RetryConfig};
use scrobble_proto::error::ApiError;
use scrobble_proto::lastfm::{
    classify_response, decode, parse_top, FriendsPage, RecentTracks, TopItem, TopKind,
    TrackDetail, UserInfo,
};
use serde_json::Value;
use tracing::{debug, warn};

/// Safety bound on `user.getFriends` pagination.
const MAX_FRIEND_PAGES: u64 = 50;
const FRIENDS_PAGE_LIMIT: u32 = 200;

#[derive(Clone)]
pub struct LastfmClient {
    http: reqwest::Client,
    base_url: String,
    retry: RetryConfig,
}

impl LastfmClient {
    pub fn new(lastfm: &LastfmConfig, retry: RetryConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(lastfm.request_timeout_secs))
            .user_agent(concat!("scrobbled/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: lastfm.api_base_url.clone(),
            retry,
        })
    }

    /// Invoke one API method, retrying network failures, non-JSON bodies and
    /// error code 8 up to `max_retries` times.
    pub async fn call(
        &self,
        method: &str,
        params: &[(&str, String)],
        credential: &str,
    ) -> Result<Value, ApiError> {
        let mut attempt = 0u32;
        loop {
            match self.call_once(method, params, credential).await {
                Ok(json) => return Ok(json),
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    debug!(
                        "lastfm: {} failed ({}), retry {}/{}",
                        method, e, attempt, self.retry.max_retries
                    );
                    tokio::time::sleep(self.retry.delay()).await;
                }
                Err(e) => {
                    if e.is_retryable() {
                        warn!("lastfm: {} gave up after {} retries: {}", method, attempt, e);
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn call_once(
        &self,
        method: &str,
        params: &[(&str, String)],
        credential: &str,
    ) -> Result<Value, ApiError> {
        let mut query: Vec<(&str, String)> = vec![
            ("method", method.to_string()),
            ("api_key", credential.to_string()),
            ("format", "json".to_string()),
        ];
        query.extend(params.iter().cloned());

        let response = self
            .http
            .get(&self.base_url)
            .query(&query)
            .send()
            .await
            .map_err(ApiError::network)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(ApiError::network)?;
        classify_response(status, &body)
    }

    // ── typed methods ─────────────────────────────────────────────────────────

    pub async fn user_info(&self, user: &str, credential: &str) -> Result<UserInfo, ApiError> {
        let json = self
            .call("user.getinfo", &[("user", user.to_string())], credential)
            .await?;
        decode(&json, "user")
    }

    /// All pages of the user's friend list.
    pub async fn friends(&self, user: &str, credential: &str) -> Result<Vec<UserInfo>, ApiError> {
        let mut out = Vec::new();
        let mut page = 1u64;
        loop {
            let json = self
                .call(
                    "user.getfriends",
                    &[
                        ("user", user.to_string()),
                        ("limit", FRIENDS_PAGE_LIMIT.to_string()),
                        ("page", page.to_string()),
                    ],
                    credential,
                )
                .await?;
            let parsed: FriendsPage = decode(&json, "friends")?;
            let total = parsed.attr.total_pages;
            out.extend(parsed.user);
            if page >= total || page >= MAX_FRIEND_PAGES {
                break;
            }
            page += 1;
        }
        Ok(out)
    }

    /// The latest scrobble (or now-playing track) since `from_secs`.
    pub async fn recent_tracks(
        &self,
        user: &str,
        from_secs: i64,
        credential: &str,
    ) -> Result<Value, ApiError> {
        self.call(
            "user.getrecenttracks",
            &[
                ("user", user.to_string()),
                ("limit", "1".to_string()),
                ("from", from_secs.to_string()),
                ("extended", "1".to_string()),
            ],
            credential,
        )
        .await
    }

    pub async fn top(
        &self,
        kind: TopKind,
        user: &str,
        period: &str,
        limit: u32,
        credential: &str,
    ) -> Result<Vec<TopItem>, ApiError> {
        let json = self
            .call(
                kind.method(),
                &[
                    ("user", user.to_string()),
                    ("period", period.to_string()),
                    ("limit", limit.to_string()),
                ],
                credential,
            )
            .await?;
        parse_top(kind, &json)
    }

    /// How often `user` has played the given track.
    pub async fn track_playcount(
        &self,
        artist: &str,
        track: &str,
        user: &str,
        credential: &str,
    ) -> Result<u64, ApiError> {
        let json = self
            .call(
                "track.getinfo",
                &[
                    ("artist", artist.to_string()),
                    ("track", track.to_string()),
                    ("username", user.to_string()),
                    ("autocorrect", "1".to_string()),
                ],
                credential,
            )
            .await?;
        let detail: TrackDetail = decode(&json, "track")?;
        Ok(detail.userplaycount)
    }
}

/// Decode a cached or fresh `user.getrecenttracks` payload.
pub fn decode_recent(json: &Value) -> Result<RecentTracks, ApiError> {
    decode(json, "recenttracks")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::extract::{Query, State};
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    pub(crate) type Handler =
        Arc<dyn Fn(&HashMap<String, String>, usize) -> (StatusCode, String) + Send + Sync>;

    #[derive(Clone)]
    pub(crate) struct Mock {
        pub hits: Arc<AtomicUsize>,
        handler: Handler,
    }

    async fn serve(
        State(mock): State<Mock>,
        Query(q): Query<HashMap<String, String>>,
    ) -> (StatusCode, String) {
        let n = mock.hits.fetch_add(1, Ordering::SeqCst);
        (mock.handler)(&q, n)
    }

    /// Start a local API stand-in and return its base URL and hit counter.
    pub(crate) async fn spawn_mock(handler: Handler) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let mock = Mock {
            hits: hits.clone(),
            handler,
        };
        let app = Router::new().route("/2.0/", get(serve)).with_state(mock);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/2.0/", addr), hits)
    }

    pub(crate) fn client_for(base_url: &str) -> LastfmClient {
        let lastfm = LastfmConfig {
            api_base_url: base_url.to_string(),
            request_timeout_secs: 5,
            ..LastfmConfig::default()
        };
        let retry = RetryConfig {
            max_retries: 3,
            delay_ms: 10,
        };
        LastfmClient::new(&lastfm, retry).unwrap()
    }

    #[tokio::test]
    async fn test_transient_code_retried_until_success() {
        let (url, hits) = spawn_mock(Arc::new(|_, n| {
            if n < 2 {
                (StatusCode::OK, r#"{"error":8,"message":"Operation failed"}"#.into())
            } else {
                (StatusCode::OK, r#"{"user":{"name":"alice","realname":"Alice"}}"#.into())
            }
        }))
        .await;
        let info = client_for(&url).user_info("alice", "k").await.unwrap();
        assert_eq!(info.display_name(), "Alice");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_json_gives_up_after_bounded_retries() {
        let (url, hits) = spawn_mock(Arc::new(|_, _| {
            (StatusCode::BAD_GATEWAY, "<html>bad gateway</html>".into())
        }))
        .await;
        let err = client_for(&url).user_info("alice", "k").await.unwrap_err();
        assert_eq!(err, ApiError::NonJsonResponse { status: 502 });
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_rate_limit_and_private_are_not_retried() {
        let (url, hits) = spawn_mock(Arc::new(|q, _| {
            if q.get("user").map(String::as_str) == Some("busy") {
                (StatusCode::OK, r#"{"error":29,"message":"Rate Limit Exceeded"}"#.into())
            } else {
                (StatusCode::OK, r#"{"error":17,"message":"Login: User required to be logged in"}"#.into())
            }
        }))
        .await;
        let client = client_for(&url);

        let err = client.recent_tracks("busy", 0, "k").await.unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let err = client.recent_tracks("hidden", 0, "k").await.unwrap_err();
        assert!(err.is_entity_terminal());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_friends_follows_pagination() {
        let (url, hits) = spawn_mock(Arc::new(|q, _| {
            let page = q.get("page").cloned().unwrap_or_default();
            let body = if page == "1" {
                r#"{"friends":{"user":[{"name":"bob"},{"name":"carol"}],"@attr":{"page":"1","totalPages":"2"}}}"#
            } else {
                r#"{"friends":{"user":{"name":"dave"},"@attr":{"page":"2","totalPages":"2"}}}"#
            };
            (StatusCode::OK, body.into())
        }))
        .await;
        let friends = client_for(&url).friends("alice", "k").await.unwrap();
        let names: Vec<&str> = friends.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["bob", "carol", "dave"]);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_query_carries_method_and_credential() {
        let (url, _) = spawn_mock(Arc::new(|q, _| {
            let ok = q.get("method").map(String::as_str) == Some("track.getinfo")
                && q.get("api_key").map(String::as_str) == Some("secret")
                && q.get("format").map(String::as_str) == Some("json")
                && q.get("username").map(String::as_str) == Some("bob");
            if ok {
                (StatusCode::OK, r#"{"track":{"name":"Xtal","userplaycount":"12"}}"#.into())
            } else {
                (StatusCode::BAD_REQUEST, r#"{"error":6,"message":"Track not found"}"#.into())
            }
        }))
        .await;
        let plays = client_for(&url)
            .track_playcount("Aphex Twin", "Xtal", "bob", "secret")
            .await
            .unwrap();
        assert_eq!(plays, 12);
    }
}
