//! Friend entities as held in the live collection.
//!
//! Everything a fetch produces lives directly on [`Entity`]; state owned by the
//! renderer (preview playback, panel expansion, scroll offset, listener panel)
//! lives in the [`Transient`] bag and is carried across refreshes by the
//! reconciler.

use serde::{Deserialize, Serialize};

/// Case-folded form of an entity id, used for every comparison and map key.
pub fn id_key(id: &str) -> String {
    id.to_lowercase()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    #[default]
    Active,
    /// Upstream answered "private/unauthorized"; skipped until a full resync.
    Private,
    Removed,
}

impl EntityStatus {
    pub fn is_refreshable(&self) -> bool {
        matches!(self, Self::Active)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub art_url: Option<String>,
    #[serde(default)]
    pub is_now_playing: bool,
    /// Unix seconds of the scrobble. Absent while a track is now-playing.
    #[serde(default)]
    pub timestamp_secs: Option<i64>,
    #[serde(default)]
    pub loved: bool,
}

impl TrackInfo {
    /// Trimmed `(title, artist)` pair that defines "the same track".
    pub fn identity(&self) -> (&str, &str) {
        (self.title.trim(), self.artist.trim())
    }

    pub fn same_subject(&self, other: &TrackInfo) -> bool {
        self.identity() == other.identity()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PanelState {
    #[default]
    Collapsed,
    Expanded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenersState {
    #[default]
    None,
    Loading,
    Loaded,
}

/// How often one friend has played another friend's current track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerCount {
    pub friend: String,
    pub plays: u64,
}

/// Fields no fetch ever produces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transient {
    pub preview_playing: bool,
    pub preview_position_secs: f64,
    pub expanded: PanelState,
    pub scroll_offset: u32,
    pub listeners: ListenersState,
    #[serde(default)]
    pub listener_counts: Vec<ListenerCount>,
}

/// Partial update of the transient bag, as sent by the renderer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransientPatch {
    pub preview_playing: Option<bool>,
    pub preview_position_secs: Option<f64>,
    pub expanded: Option<PanelState>,
    pub scroll_offset: Option<u32>,
}

impl Transient {
    pub fn apply(&mut self, patch: TransientPatch) {
        if let Some(v) = patch.preview_playing {
            self.preview_playing = v;
        }
        if let Some(v) = patch.preview_position_secs {
            self.preview_position_secs = v.max(0.0);
        }
        if let Some(v) = patch.expanded {
            self.expanded = v;
        }
        if let Some(v) = patch.scroll_offset {
            self.scroll_offset = v;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub profile_image: Option<String>,
    #[serde(default)]
    pub current_track: Option<TrackInfo>,
    #[serde(default)]
    pub transient: Transient,
    #[serde(default)]
    pub status: EntityStatus,
}

impl Entity {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            profile_image: None,
            current_track: None,
            transient: Transient::default(),
            status: EntityStatus::Active,
        }
    }

    pub fn key(&self) -> String {
        id_key(&self.id)
    }

    pub fn is_playing(&self) -> bool {
        self.current_track
            .as_ref()
            .map(|t| t.is_now_playing)
            .unwrap_or(false)
    }

    /// Last-activity timestamp for ordering; `0` when unknown.
    pub fn last_activity_secs(&self) -> i64 {
        self.current_track
            .as_ref()
            .and_then(|t| t.timestamp_secs)
            .unwrap_or(0)
    }
}

/// What one successful activity fetch knows about a friend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FreshEntity {
    pub display_name: Option<String>,
    pub profile_image: Option<String>,
    pub current_track: Option<TrackInfo>,
}
