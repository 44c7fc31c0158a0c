//! Refresh cycles against the upstream.
//!
//! These functions run in spawned tasks and never touch the live collection;
//! they return their results to the core as events. All per-friend fan-out
//! goes through [`run_chunked`], which splits the roster by chunk size,
//! staggers chunk starts, and emits at most one rate-limit signal per chunk.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use futures_util::future::join_all;
use scrobble_proto::cache::{page_key, track_key, Resource, ResponseCache};
use scrobble_proto::charts::{aggregate, ChartEntry};
use scrobble_proto::chunk::{plan_chunks, CredentialPool};
use scrobble_proto::config::Config;
use scrobble_proto::error::ApiError;
use scrobble_proto::lastfm::{pick_image, TopItem, TopKind, UserInfo};
use scrobble_proto::model::{id_key, FreshEntity, ListenerCount};
use scrobble_proto::reconcile::FetchOutcome;
use scrobble_proto::store::{set_with_recovery, PersistentStore, ESSENTIAL_PARTITIONS, PARTITION_ROSTER};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{decode_recent, LastfmClient};
use crate::Signal;

pub type Charts = HashMap<TopKind, Vec<ChartEntry>>;

/// Shared, read-only dependencies of every refresh task.
pub struct SyncContext {
    pub config: Config,
    pub client: LastfmClient,
    pub cache: ResponseCache,
    pub credentials: CredentialPool,
    pub signal_tx: broadcast::Sender<Signal>,
}

impl SyncContext {
    pub fn new(
        config: Config,
        store: Arc<PersistentStore>,
        signal_tx: broadcast::Sender<Signal>,
    ) -> anyhow::Result<Self> {
        let client = LastfmClient::new(&config.lastfm, config.retry.clone())?;
        let cache = ResponseCache::new(store, config.cache.max_entries);
        let credentials = CredentialPool::new(
            config.lastfm.api_keys.clone(),
            config.lastfm.rotate_threshold,
        );
        Ok(Self {
            config,
            client,
            cache,
            credentials,
            signal_tx,
        })
    }

    pub fn store(&self) -> &Arc<PersistentStore> {
        self.cache.store()
    }

    fn ttl(&self, secs: u64) -> Duration {
        Duration::from_secs(secs)
    }
}

// ── roster ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterMember {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub image: Option<String>,
}

impl From<&UserInfo> for RosterMember {
    fn from(info: &UserInfo) -> Self {
        Self {
            id: info.name.clone(),
            display_name: info.display_name(),
            image: pick_image(&info.image),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterSnapshot {
    pub hash: String,
    pub members: Vec<RosterMember>,
    pub fetched_at_ms: i64,
}

impl RosterSnapshot {
    pub fn new(members: Vec<RosterMember>, fetched_at_ms: i64) -> Self {
        Self {
            hash: roster_hash(&members),
            members,
            fetched_at_ms,
        }
    }

    pub fn load(store: &PersistentStore, username: &str) -> Option<Self> {
        let raw = store.get(PARTITION_ROSTER, &id_key(username))?;
        match serde_json::from_str(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("roster: unreadable snapshot for {}: {}", username, e);
                None
            }
        }
    }

    pub fn save(&self, store: &PersistentStore, username: &str) -> anyhow::Result<()> {
        let raw = serde_json::to_string(self)?;
        set_with_recovery(store, ESSENTIAL_PARTITIONS, PARTITION_ROSTER, &id_key(username), raw)?;
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        let key = id_key(id);
        self.members.iter().any(|m| id_key(&m.id) == key)
    }
}

/// Order- and case-insensitive fingerprint of the member ids (FNV-1a).
pub fn roster_hash(members: &[RosterMember]) -> String {
    let mut ids: Vec<String> = members.iter().map(|m| id_key(&m.id)).collect();
    ids.sort();
    ids.dedup();
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in ids.join("\n").bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    format!("{:016x}", hash)
}

/// Fetch the tracked user and all of their friends.
pub async fn refresh_roster(ctx: Arc<SyncContext>, now_ms: i64) -> anyhow::Result<RosterSnapshot> {
    let username = ctx.config.lastfm.username.trim();
    if username.is_empty() {
        bail!("no lastfm.username configured");
    }
    let credential = ctx
        .credentials
        .primary()
        .context("no lastfm.api_keys configured")?;

    let owner = ctx.client.user_info(username, credential).await?;
    let friends = ctx.client.friends(username, credential).await?;

    let mut seen = HashSet::new();
    let members: Vec<RosterMember> = std::iter::once(&owner)
        .chain(friends.iter())
        .map(RosterMember::from)
        .filter(|m| seen.insert(id_key(&m.id)))
        .collect();

    let snapshot = RosterSnapshot::new(members, now_ms);
    snapshot.save(ctx.store(), username)?;
    info!(
        "roster: {} members (hash {})",
        snapshot.members.len(),
        snapshot.hash
    );
    Ok(snapshot)
}

// ── chunked fan-out ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ChunkPolicy<'a> {
    pub chunk_size: usize,
    pub inter_chunk_delay: Duration,
    pub credentials: &'a CredentialPool,
}

impl<'a> ChunkPolicy<'a> {
    pub fn from_context(ctx: &'a SyncContext) -> Self {
        Self {
            chunk_size: ctx.config.lastfm.chunk_size,
            inter_chunk_delay: ctx.config.lastfm.inter_chunk_delay(),
            credentials: &ctx.credentials,
        }
    }
}

/// Run `fetch` for every member, one chunk at a time.
///
/// Fetches inside a chunk run concurrently under the chunk's credential.
/// Chunk `n` starts no earlier than `n * inter_chunk_delay` after the first.
pub async fn run_chunked<T, F, Fut>(
    source: &str,
    members: &[RosterMember],
    policy: ChunkPolicy<'_>,
    signal_tx: &broadcast::Sender<Signal>,
    fetch: F,
) -> Vec<(RosterMember, Result<T, ApiError>)>
where
    F: Fn(RosterMember, String) -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    if policy.credentials.is_empty() {
        warn!("{}: no API key configured, skipping {} members", source, members.len());
        return Vec::new();
    }

    let ids: Vec<String> = members.iter().map(|m| m.id.clone()).collect();
    let by_id: HashMap<&str, &RosterMember> = members.iter().map(|m| (m.id.as_str(), m)).collect();
    let chunks = plan_chunks(
        &ids,
        policy.chunk_size,
        policy.credentials,
        policy.inter_chunk_delay,
    );

    let started = Instant::now();
    let mut out = Vec::with_capacity(members.len());
    for chunk in chunks {
        tokio::time::sleep_until(started + chunk.start_offset).await;
        debug!(
            "{}: chunk {} with {} members",
            source,
            chunk.index,
            chunk.members.len()
        );

        let batch: Vec<RosterMember> = chunk
            .members
            .iter()
            .filter_map(|id| by_id.get(id.as_str()).map(|m| (*m).clone()))
            .collect();
        let results = join_all(
            batch
                .iter()
                .cloned()
                .map(|m| fetch(m, chunk.credential.clone())),
        )
        .await;

        let limited = results
            .iter()
            .filter(|r| matches!(r, Err(e) if e.is_rate_limited()))
            .count();
        if limited > 0 {
            warn!(
                "{}: rate limited on {} of {} members in chunk {}",
                source,
                limited,
                batch.len(),
                chunk.index
            );
            let _ = signal_tx.send(Signal::RateLimited {
                source: source.to_string(),
                chunk: chunk.index,
                entities: limited,
            });
        }

        out.extend(batch.into_iter().zip(results));
    }
    out
}

// ── activity ──────────────────────────────────────────────────────────────────

pub async fn fetch_activity(
    ctx: &SyncContext,
    member: &RosterMember,
    credential: &str,
    now_ms: i64,
) -> Result<Option<FreshEntity>, ApiError> {
    let key = page_key(&member.id, 1);
    let json = match ctx.cache.get::<Value>(Resource::Recent, &key, now_ms) {
        Some(cached) => cached,
        None => {
            let from = now_ms / 1000 - ctx.config.streams.lookback_secs as i64;
            let fresh = ctx.client.recent_tracks(&member.id, from, credential).await?;
            let ttl = ctx.ttl(ctx.config.cache.recent_ttl_secs);
            if let Err(e) = ctx.cache.put(Resource::Recent, &key, &fresh, ttl, now_ms) {
                warn!("activity: failed to cache {}: {}", member.id, e);
            }
            fresh
        }
    };

    let recent = decode_recent(&json)?;
    Ok(recent.to_fresh(None).map(|mut fresh| {
        fresh.display_name = Some(member.display_name.clone());
        fresh.profile_image = member.image.clone();
        fresh
    }))
}

/// Latest activity for each member, as reconciler input.
pub async fn refresh_activity(
    ctx: Arc<SyncContext>,
    members: Vec<RosterMember>,
    now_ms: i64,
) -> Vec<(String, FetchOutcome)> {
    let results = run_chunked(
        "activity",
        &members,
        ChunkPolicy::from_context(&ctx),
        &ctx.signal_tx,
        |member, credential| {
            let ctx = ctx.clone();
            async move { fetch_activity(&ctx, &member, &credential, now_ms).await }
        },
    )
    .await;

    results
        .into_iter()
        .map(|(member, result)| {
            let outcome = match result {
                Ok(Some(fresh)) => FetchOutcome::Fresh(fresh),
                Ok(None) => FetchOutcome::NoActivity,
                Err(e) => FetchOutcome::Failed(e),
            };
            (member.id, outcome)
        })
        .collect()
}

// ── statistics ────────────────────────────────────────────────────────────────

fn top_resource(kind: TopKind) -> Resource {
    match kind {
        TopKind::Artists => Resource::TopArtists,
        TopKind::Albums => Resource::TopAlbums,
        TopKind::Tracks => Resource::TopTracks,
    }
}

async fn fetch_top_lists(
    ctx: &SyncContext,
    member: &RosterMember,
    credential: &str,
    now_ms: i64,
) -> Result<Vec<(TopKind, Vec<TopItem>)>, ApiError> {
    let period = ctx.config.statistics.period.as_str();
    let key = page_key(&member.id, period);
    let mut lists = Vec::with_capacity(TopKind::ALL.len());
    for kind in TopKind::ALL {
        let resource = top_resource(kind);
        let items = match ctx.cache.get::<Vec<TopItem>>(resource, &key, now_ms) {
            Some(items) => items,
            None => {
                let items = ctx
                    .client
                    .top(kind, &member.id, period, ctx.config.statistics.limit, credential)
                    .await?;
                let ttl = ctx.ttl(ctx.config.cache.top_ttl_secs);
                if let Err(e) = ctx.cache.put(resource, &key, &items, ttl, now_ms) {
                    warn!("statistics: failed to cache {}: {}", member.id, e);
                }
                items
            }
        };
        lists.push((kind, items));
    }
    Ok(lists)
}

/// Aggregated top artists, albums and tracks across the roster.
///
/// Fails only when every member failed; partial results still chart.
pub async fn refresh_statistics(
    ctx: Arc<SyncContext>,
    members: Vec<RosterMember>,
    now_ms: i64,
) -> anyhow::Result<Charts> {
    let results = run_chunked(
        "statistics",
        &members,
        ChunkPolicy::from_context(&ctx),
        &ctx.signal_tx,
        |member, credential| {
            let ctx = ctx.clone();
            async move { fetch_top_lists(&ctx, &member, &credential, now_ms).await }
        },
    )
    .await;

    let mut per_kind: HashMap<TopKind, Vec<(String, Vec<TopItem>)>> = HashMap::new();
    let mut failures = 0usize;
    let mut last_error = None;
    for (member, result) in &results {
        match result {
            Ok(lists) => {
                for (kind, items) in lists {
                    per_kind
                        .entry(*kind)
                        .or_default()
                        .push((member.id.clone(), items.clone()));
                }
            }
            Err(e) => {
                debug!("statistics: {} skipped: {}", member.id, e);
                failures += 1;
                last_error = Some(e.clone());
            }
        }
    }

    if failures > 0 && failures == results.len() {
        if let Some(e) = last_error {
            return Err(e).context("every statistics fetch failed");
        }
    }

    Ok(TopKind::ALL
        .into_iter()
        .map(|kind| {
            let lists = per_kind.remove(&kind).unwrap_or_default();
            (kind, aggregate(&lists))
        })
        .collect())
}

// ── listeners ─────────────────────────────────────────────────────────────────

async fn fetch_listener_count(
    ctx: &SyncContext,
    friend: &RosterMember,
    artist: &str,
    track: &str,
    credential: &str,
    now_ms: i64,
) -> Result<u64, ApiError> {
    let key = track_key(&friend.id, artist, track);
    if let Some(plays) = ctx.cache.get::<u64>(Resource::Listeners, &key, now_ms) {
        return Ok(plays);
    }
    let plays = ctx
        .client
        .track_playcount(artist, track, &friend.id, credential)
        .await?;
    let ttl = ctx.ttl(ctx.config.cache.listeners_ttl_secs);
    if let Err(e) = ctx.cache.put(Resource::Listeners, &key, &plays, ttl, now_ms) {
        warn!("listeners: failed to cache {}: {}", key, e);
    }
    Ok(plays)
}

/// Which friends have played this track, most plays first.
pub async fn fetch_listeners(
    ctx: Arc<SyncContext>,
    friends: Vec<RosterMember>,
    artist: String,
    track: String,
    now_ms: i64,
) -> Vec<ListenerCount> {
    let results = run_chunked(
        "listeners",
        &friends,
        ChunkPolicy::from_context(&ctx),
        &ctx.signal_tx,
        |friend, credential| {
            let ctx = ctx.clone();
            let artist = artist.clone();
            let track = track.clone();
            async move {
                fetch_listener_count(&ctx, &friend, &artist, &track, &credential, now_ms).await
            }
        },
    )
    .await;

    let mut counts: Vec<ListenerCount> = results
        .into_iter()
        .filter_map(|(friend, result)| match result {
            Ok(plays) if plays > 0 => Some(ListenerCount {
                friend: friend.id,
                plays,
            }),
            Ok(_) => None,
            Err(e) => {
                debug!("listeners: {} skipped: {}", friend.id, e);
                None
            }
        })
        .collect();
    counts.sort_by(|a, b| b.plays.cmp(&a.plays).then_with(|| a.friend.cmp(&b.friend)));
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::spawn_mock;
    use axum::http::StatusCode;
    use scrobble_proto::model::Entity;
    use scrobble_proto::reconcile::reconcile_into;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    fn member(id: &str) -> RosterMember {
        RosterMember {
            id: id.to_string(),
            display_name: id.to_uppercase(),
            image: None,
        }
    }

    fn roster(n: usize) -> Vec<RosterMember> {
        (0..n).map(|i| member(&format!("friend{:03}", i))).collect()
    }

    fn context(base_url: &str) -> (Arc<SyncContext>, broadcast::Receiver<Signal>) {
        let mut config = Config::default();
        config.lastfm.username = "alice".into();
        config.lastfm.api_keys = vec!["k1".into()];
        config.lastfm.api_base_url = base_url.to_string();
        config.retry.delay_ms = 10;
        let store = Arc::new(PersistentStore::in_memory(1024 * 1024));
        let (tx, rx) = broadcast::channel(64);
        (Arc::new(SyncContext::new(config, store, tx).unwrap()), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_chunk_waits_for_delay() {
        let pool = CredentialPool::new(vec!["k1".into(), "k2".into()], 100);
        let policy = ChunkPolicy {
            chunk_size: 200,
            inter_chunk_delay: Duration::from_secs(2),
            credentials: &pool,
        };
        let (tx, _rx) = broadcast::channel(8);
        let calls: Mutex<Vec<(String, String, Instant)>> = Mutex::new(Vec::new());
        let start = Instant::now();

        let out = run_chunked("activity", &roster(300), policy, &tx, |m, cred| {
            calls.lock().unwrap().push((m.id.clone(), cred, Instant::now()));
            async { Ok::<_, ApiError>(()) }
        })
        .await;

        assert_eq!(out.len(), 300);
        let calls = calls.into_inner().unwrap();
        let (first, second): (Vec<_>, Vec<_>) = calls.iter().partition(|(_, cred, _)| cred == "k1");
        assert_eq!(first.len(), 200);
        assert_eq!(second.len(), 100);
        assert!(first.iter().all(|(_, _, at)| *at - start < Duration::from_secs(2)));
        assert!(second.iter().all(|(_, _, at)| *at - start >= Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_partial_rate_limit_signals_once_and_updates_the_rest() {
        let pool = CredentialPool::new(vec!["k1".into()], 100);
        let policy = ChunkPolicy {
            chunk_size: 200,
            inter_chunk_delay: Duration::ZERO,
            credentials: &pool,
        };
        let (tx, mut rx) = broadcast::channel(8);
        let members = roster(50);
        let limited: HashSet<&str> = ["friend007", "friend021", "friend042"].into();

        let out = run_chunked("activity", &members, policy, &tx, |m, _| {
            let is_limited = limited.contains(m.id.as_str());
            async move {
                if is_limited {
                    Err(ApiError::RateLimited {
                        message: "Rate Limit Exceeded".into(),
                    })
                } else {
                    Ok(FreshEntity {
                        display_name: None,
                        profile_image: None,
                        current_track: Some(scrobble_proto::model::TrackInfo {
                            title: "Windowlicker".into(),
                            artist: "Aphex Twin".into(),
                            art_url: None,
                            is_now_playing: true,
                            timestamp_secs: None,
                            loved: false,
                        }),
                    })
                }
            }
        })
        .await;

        match rx.try_recv() {
            Ok(Signal::RateLimited { chunk, entities, .. }) => {
                assert_eq!(chunk, 0);
                assert_eq!(entities, 3);
            }
            other => panic!("expected one rate limit signal, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());

        let mut collection: Vec<Entity> = members.iter().map(|m| Entity::new(m.id.clone())).collect();
        let outcomes = out
            .into_iter()
            .map(|(m, r)| {
                let outcome = match r {
                    Ok(fresh) => FetchOutcome::Fresh(fresh),
                    Err(e) => FetchOutcome::Failed(e),
                };
                (m.id, outcome)
            })
            .collect();
        let report = reconcile_into(&mut collection, outcomes);
        assert_eq!(report.rate_limited, 3);
        assert_eq!(report.track_changed.len(), 47);
        assert_eq!(collection.iter().filter(|e| e.is_playing()).count(), 47);
        assert!(collection
            .iter()
            .filter(|e| limited.contains(e.id.as_str()))
            .all(|e| e.current_track.is_none()));
    }

    #[tokio::test]
    async fn test_fetch_activity_uses_recent_cache() {
        let (url, hits) = spawn_mock(Arc::new(|q, _| {
            assert_eq!(q.get("limit").map(String::as_str), Some("1"));
            assert_eq!(q.get("extended").map(String::as_str), Some("1"));
            (
                StatusCode::OK,
                r#"{"recenttracks":{"track":{"name":"Avril 14th","artist":{"name":"Aphex Twin"},"@attr":{"nowplaying":"true"}}}}"#.into(),
            )
        }))
        .await;
        let (ctx, _rx) = context(&url);
        let bob = member("bob");

        let fresh = fetch_activity(&ctx, &bob, "k1", 1_000_000).await.unwrap().unwrap();
        assert_eq!(fresh.display_name.as_deref(), Some("BOB"));
        let track = fresh.current_track.unwrap();
        assert_eq!(track.title, "Avril 14th");
        assert!(track.is_now_playing);

        fetch_activity(&ctx, &bob, "k1", 1_010_000).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        fetch_activity(&ctx, &bob, "k1", 1_100_000).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_window_is_no_activity() {
        let (url, _) = spawn_mock(Arc::new(|_, _| {
            (StatusCode::OK, r#"{"recenttracks":{"track":[]}}"#.into())
        }))
        .await;
        let (ctx, _rx) = context(&url);
        let outcomes = refresh_activity(ctx, vec![member("quiet")], 5_000_000).await;
        assert!(matches!(outcomes[0].1, FetchOutcome::NoActivity));
    }

    #[tokio::test]
    async fn test_refresh_roster_persists_snapshot() {
        let (url, _) = spawn_mock(Arc::new(|q, _| {
            let body = match q.get("method").map(String::as_str) {
                Some("user.getinfo") => r#"{"user":{"name":"alice"}}"#,
                _ => r#"{"friends":{"user":[{"name":"Bob","realname":"Bob B"},{"name":"bob"}],"@attr":{"page":"1","totalPages":"1"}}}"#,
            };
            (StatusCode::OK, body.into())
        }))
        .await;
        let (ctx, _rx) = context(&url);
        let snapshot = refresh_roster(ctx.clone(), 77).await.unwrap();
        let ids: Vec<&str> = snapshot.members.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["alice", "Bob"]);
        assert_eq!(snapshot.members[1].display_name, "Bob B");
        assert_eq!(RosterSnapshot::load(ctx.store(), "ALICE"), Some(snapshot));
    }

    #[tokio::test]
    async fn test_listeners_sorted_and_cached() {
        let (url, hits) = spawn_mock(Arc::new(|q, _| {
            let plays = match q.get("username").map(String::as_str) {
                Some("bob") => "3",
                Some("carol") => "9",
                _ => "0",
            };
            (
                StatusCode::OK,
                format!(r#"{{"track":{{"name":"Xtal","userplaycount":"{}"}}}}"#, plays),
            )
        }))
        .await;
        let (ctx, _rx) = context(&url);
        let friends = vec![member("bob"), member("carol"), member("dave")];

        let counts = fetch_listeners(ctx.clone(), friends.clone(), "Aphex Twin".into(), "Xtal".into(), 0).await;
        let pairs: Vec<(&str, u64)> = counts.iter().map(|c| (c.friend.as_str(), c.plays)).collect();
        assert_eq!(pairs, vec![("carol", 9), ("bob", 3)]);

        fetch_listeners(ctx, friends, "Aphex Twin".into(), "Xtal".into(), 1_000).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_roster_hash_ignores_order_and_case() {
        let a = roster_hash(&[member("Bob"), member("alice")]);
        let b = roster_hash(&[member("alice"), member("bob")]);
        let c = roster_hash(&[member("alice"), member("bob"), member("carol")]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
