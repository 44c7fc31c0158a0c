//! Audio preview channel.
//!
//! There is one playback channel. Hovering (or scrolling to) a friend starts
//! a lookup for their current track; any newer request advances the channel's
//! generation, so a lookup that resolves late is dropped without touching the
//! channel. Playback positions are remembered per friend and resumed while
//! they are still inside the clip.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use scrobble_proto::cache::{track_key, Resource, ResponseCache};
use scrobble_proto::config::PreviewConfig;
use scrobble_proto::error::ApiError;
use scrobble_proto::generation::{Generation, GenerationToken};
use scrobble_proto::model::{id_key, TrackInfo};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::sync::SyncContext;

// ── lookup ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewClip {
    pub url: String,
    #[serde(default)]
    pub track_time_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResult {
    #[serde(default)]
    preview_url: Option<String>,
    #[serde(default)]
    track_time_millis: Option<u64>,
}

/// Searches a public catalogue for a short clip of a track.
#[derive(Clone)]
pub struct PreviewLookup {
    http: reqwest::Client,
    search_url: String,
}

impl PreviewLookup {
    pub fn new(config: &PreviewConfig, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            search_url: config.search_url.clone(),
        })
    }

    pub async fn search(&self, artist: &str, title: &str) -> Result<Option<PreviewClip>, ApiError> {
        let term = format!("{} {}", artist.trim(), title.trim());
        let response = self
            .http
            .get(&self.search_url)
            .query(&[
                ("term", term.as_str()),
                ("media", "music"),
                ("entity", "song"),
                ("limit", "1"),
            ])
            .send()
            .await
            .map_err(ApiError::network)?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(ApiError::NonJsonResponse { status });
        }
        let body = response.text().await.map_err(ApiError::network)?;
        let parsed: SearchResponse =
            serde_json::from_str(&body).map_err(|_| ApiError::NonJsonResponse { status })?;

        Ok(parsed.results.into_iter().find_map(|r| {
            let url = r.preview_url.filter(|u| !u.trim().is_empty())?;
            Some(PreviewClip {
                url,
                track_time_ms: r.track_time_millis,
            })
        }))
    }
}

/// Cache-first clip lookup. Misses are cached as `None` too.
pub async fn resolve_clip(
    lookup: &PreviewLookup,
    cache: &ResponseCache,
    ttl: Duration,
    entity_id: &str,
    track: &TrackInfo,
    now_ms: i64,
) -> Option<PreviewClip> {
    let (title, artist) = track.identity();
    let key = track_key(entity_id, artist, title);
    if let Some(cached) = cache.get::<Option<PreviewClip>>(Resource::Previews, &key, now_ms) {
        debug!("preview: cache hit for {}", key);
        return cached;
    }
    match lookup.search(artist, title).await {
        Ok(clip) => {
            if let Err(e) = cache.put(Resource::Previews, &key, &clip, ttl, now_ms) {
                warn!("preview: failed to cache {}: {}", key, e);
            }
            clip
        }
        Err(e) => {
            warn!("preview: lookup for {} - {} failed: {}", artist, title, e);
            None
        }
    }
}

// ── controller ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Mouse-over; debounced.
    Hover,
    /// Scrolled into view; immediate.
    Scroll,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackCommand {
    Play { url: String, start_secs: f64 },
    Pause,
}

/// A lookup the caller should run after `delay`, unless the token went stale.
#[derive(Debug, Clone)]
pub struct LookupTicket {
    pub token: GenerationToken,
    pub entity_id: String,
    pub track: TrackInfo,
    pub delay: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelState {
    Idle,
    Searching { entity_id: String },
    Playing { entity_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// A newer request owns the channel; nothing changed.
    Superseded,
    NoPreview,
    Play(PlaybackCommand),
}

/// Outcome of the pointer leaving a friend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeaveOutcome {
    pub commands: Vec<PlaybackCommand>,
    /// Position to show on the friend's panel.
    pub remembered: Option<f64>,
}

pub struct PreviewController {
    generation: Generation,
    state: ChannelState,
    positions: HashMap<String, f64>,
    resume_limit_secs: f64,
    hover_debounce: Duration,
}

impl PreviewController {
    pub fn new(config: &PreviewConfig) -> Self {
        Self {
            generation: Generation::new(),
            state: ChannelState::Idle,
            positions: HashMap::new(),
            resume_limit_secs: config.resume_limit_secs,
            hover_debounce: Duration::from_millis(config.hover_debounce_ms),
        }
    }

    /// Shared with lookup tasks so they can bail out early.
    pub fn generation(&self) -> Generation {
        self.generation.clone()
    }

    pub fn state(&self) -> &ChannelState {
        &self.state
    }

    pub fn position(&self, entity_id: &str) -> Option<f64> {
        self.positions.get(&id_key(entity_id)).copied()
    }

    /// Position set from outside the channel (the renderer's transient
    /// state). Zero forgets it.
    pub fn remember(&mut self, entity_id: &str, position_secs: f64) {
        if position_secs > 0.0 {
            self.positions.insert(id_key(entity_id), position_secs);
        } else {
            self.positions.remove(&id_key(entity_id));
        }
    }

    fn subject(&self) -> Option<&str> {
        match &self.state {
            ChannelState::Idle => None,
            ChannelState::Searching { entity_id } | ChannelState::Playing { entity_id } => {
                Some(entity_id)
            }
        }
    }

    /// Claim the channel for `entity_id`. `position` is the current playback
    /// position of whatever is playing now, so it can be resumed later.
    pub fn request(
        &mut self,
        entity_id: &str,
        track: &TrackInfo,
        trigger: Trigger,
        position: Option<f64>,
    ) -> (LookupTicket, Vec<PlaybackCommand>) {
        let token = self.generation.advance();
        let mut commands = Vec::new();
        if let ChannelState::Playing { entity_id: playing } = &self.state {
            if let Some(pos) = position {
                self.positions.insert(id_key(playing), pos);
            }
            commands.push(PlaybackCommand::Pause);
        }
        self.state = ChannelState::Searching {
            entity_id: entity_id.to_string(),
        };
        let delay = match trigger {
            Trigger::Hover => self.hover_debounce,
            Trigger::Scroll => Duration::ZERO,
        };
        debug!("preview: {} requested {:?} token={}", entity_id, trigger, token.value());
        (
            LookupTicket {
                token,
                entity_id: entity_id.to_string(),
                track: track.clone(),
                delay,
            },
            commands,
        )
    }

    /// Apply a finished lookup, unless a newer request superseded it.
    pub fn resolve(
        &mut self,
        token: GenerationToken,
        entity_id: &str,
        clip: Option<PreviewClip>,
    ) -> Resolution {
        if !self.generation.is_current(token) {
            debug!("preview: dropping stale lookup for {} token={}", entity_id, token.value());
            return Resolution::Superseded;
        }
        let Some(clip) = clip else {
            self.state = ChannelState::Idle;
            return Resolution::NoPreview;
        };
        let start_secs = self
            .position(entity_id)
            .filter(|p| *p > 0.0 && *p <= self.resume_limit_secs)
            .unwrap_or(0.0);
        self.state = ChannelState::Playing {
            entity_id: entity_id.to_string(),
        };
        Resolution::Play(PlaybackCommand::Play {
            url: clip.url,
            start_secs,
        })
    }

    /// The pointer left `entity_id`. Only acts if it owns the channel.
    pub fn leave(&mut self, entity_id: &str, position: Option<f64>) -> LeaveOutcome {
        let owns = self.subject().map(id_key) == Some(id_key(entity_id));
        if !owns {
            return LeaveOutcome::default();
        }
        self.generation.advance();
        let mut outcome = LeaveOutcome::default();
        if matches!(self.state, ChannelState::Playing { .. }) {
            outcome.commands.push(PlaybackCommand::Pause);
            if let Some(pos) = position {
                self.positions.insert(id_key(entity_id), pos);
                outcome.remembered = Some(pos);
            }
        }
        self.state = ChannelState::Idle;
        outcome
    }

    /// The friend moved to another track; their old clip no longer applies.
    pub fn track_changed(&mut self, entity_id: &str) -> Vec<PlaybackCommand> {
        self.positions.remove(&id_key(entity_id));
        let owns = self.subject().map(id_key) == Some(id_key(entity_id));
        if !owns {
            return Vec::new();
        }
        self.generation.advance();
        let was_playing = matches!(self.state, ChannelState::Playing { .. });
        self.state = ChannelState::Idle;
        if was_playing {
            vec![PlaybackCommand::Pause]
        } else {
            Vec::new()
        }
    }

    /// The clip ran to its end; the next hover starts from zero.
    pub fn playback_ended(&mut self) -> Option<String> {
        let ChannelState::Playing { entity_id } = &self.state else {
            return None;
        };
        let entity_id = entity_id.clone();
        self.positions.remove(&id_key(&entity_id));
        self.state = ChannelState::Idle;
        Some(entity_id)
    }
}

/// Run a lookup ticket: wait out the debounce, then resolve the clip unless
/// the ticket went stale in the meantime. `None` means superseded.
pub async fn run_ticket(
    ticket: LookupTicket,
    generation: Generation,
    lookup: PreviewLookup,
    ctx: Arc<SyncContext>,
) -> Option<Option<PreviewClip>> {
    if !ticket.delay.is_zero() {
        tokio::time::sleep(ticket.delay).await;
    }
    if !generation.is_current(ticket.token) {
        debug!("preview: {} superseded before lookup", ticket.entity_id);
        return None;
    }
    let ttl = Duration::from_secs(ctx.config.cache.preview_ttl_secs);
    let now_ms = chrono::Utc::now().timestamp_millis();
    Some(resolve_clip(&lookup, &ctx.cache, ttl, &ticket.entity_id, &ticket.track, now_ms).await)
}
