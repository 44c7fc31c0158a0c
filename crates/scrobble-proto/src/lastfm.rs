//! Typed Last.fm payloads and the response classification rules.
//!
//! Everything the daemon reads from the upstream passes through here, so the
//! reconciler and chart builder only ever see validated structs. Known quirks:
//! single-item lists arrive as a bare object, counts arrive as strings, and the
//! artist of a recent track is `{"#text": ..}` or `{"name": ..}` depending on
//! `extended`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::ApiError;
use crate::model::{FreshEntity, TrackInfo};

// ── response classification ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    error: i64,
    #[serde(default)]
    message: String,
}

/// Turn an HTTP status and raw body into a JSON document or a classified error.
///
/// A decodable `{"error": code}` payload wins over the HTTP status; any other
/// non-2xx, and any body that is not JSON, is a `NonJsonResponse`.
pub fn classify_response(status: u16, body: &str) -> Result<Value, ApiError> {
    let json: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => return Err(ApiError::NonJsonResponse { status }),
    };

    if json.get("error").is_some() {
        if let Ok(err) = serde_json::from_value::<ErrorPayload>(json.clone()) {
            return Err(ApiError::from_code(err.error, err.message));
        }
    }

    if !(200..300).contains(&status) {
        return Err(ApiError::NonJsonResponse { status });
    }

    Ok(json)
}

/// Decode one top-level member of a payload into a typed struct.
pub fn decode<T: DeserializeOwned>(json: &Value, member: &str) -> Result<T, ApiError> {
    let inner = json
        .get(member)
        .ok_or_else(|| ApiError::malformed(format!("missing `{}`", member)))?;
    serde_json::from_value(inner.clone()).map_err(|e| ApiError::malformed(format!("{}: {}", member, e)))
}

// ── serde helpers ─────────────────────────────────────────────────────────────

fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        Many(Vec<T>),
        One(T),
    }

    Ok(match Option::<OneOrMany<T>>::deserialize(deserializer)? {
        Some(OneOrMany::Many(v)) => v,
        Some(OneOrMany::One(t)) => vec![t],
        None => Vec::new(),
    })
}

fn lenient_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StrOrNum {
        Num(u64),
        Str(String),
    }

    Ok(match Option::<StrOrNum>::deserialize(deserializer)? {
        Some(StrOrNum::Num(n)) => n,
        Some(StrOrNum::Str(s)) => s.trim().parse().unwrap_or(0),
        None => 0,
    })
}

// ── shared pieces ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Image {
    #[serde(rename = "#text", default)]
    pub url: String,
    #[serde(default)]
    pub size: String,
}

/// Largest non-empty image; Last.fm lists sizes smallest first.
pub fn pick_image(images: &[Image]) -> Option<String> {
    images
        .iter()
        .rev()
        .find(|i| !i.url.trim().is_empty())
        .map(|i| i.url.clone())
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArtistRef {
    #[serde(rename = "#text")]
    pub text: Option<String>,
    pub name: Option<String>,
}

impl ArtistRef {
    pub fn name(&self) -> String {
        self.name
            .as_deref()
            .or(self.text.as_deref())
            .unwrap_or_default()
            .to_string()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageAttr {
    #[serde(default, deserialize_with = "lenient_u64")]
    pub page: u64,
    #[serde(rename = "totalPages", default, deserialize_with = "lenient_u64")]
    pub total_pages: u64,
}

// ── user.getInfo / user.getFriends ────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    pub name: String,
    #[serde(default)]
    pub realname: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub image: Vec<Image>,
}

impl UserInfo {
    pub fn display_name(&self) -> String {
        self.realname
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(self.name.as_str())
            .to_string()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FriendsPage {
    #[serde(default, deserialize_with = "one_or_many")]
    pub user: Vec<UserInfo>,
    #[serde(rename = "@attr", default)]
    pub attr: PageAttr,
}

// ── user.getRecentTracks ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NowPlayingAttr {
    #[serde(default)]
    pub nowplaying: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScrobbleDate {
    #[serde(default, deserialize_with = "lenient_u64")]
    pub uts: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecentTrack {
    pub name: String,
    #[serde(default)]
    pub artist: ArtistRef,
    #[serde(default, deserialize_with = "one_or_many")]
    pub image: Vec<Image>,
    #[serde(default)]
    pub date: Option<ScrobbleDate>,
    #[serde(rename = "@attr", default)]
    pub attr: NowPlayingAttr,
    #[serde(default)]
    pub loved: Option<String>,
}

impl RecentTrack {
    pub fn to_track_info(&self) -> TrackInfo {
        TrackInfo {
            title: self.name.clone(),
            artist: self.artist.name(),
            art_url: pick_image(&self.image),
            is_now_playing: self.attr.nowplaying.as_deref() == Some("true"),
            timestamp_secs: self.date.as_ref().map(|d| d.uts as i64).filter(|t| *t > 0),
            loved: self.loved.as_deref() == Some("1"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecentTracks {
    #[serde(default, deserialize_with = "one_or_many")]
    pub track: Vec<RecentTrack>,
}

impl RecentTracks {
    /// `None` when the friend scrobbled nothing inside the requested window.
    pub fn to_fresh(&self, info: Option<&UserInfo>) -> Option<FreshEntity> {
        let latest = self.track.first()?;
        Some(FreshEntity {
            display_name: info.map(UserInfo::display_name),
            profile_image: info.and_then(|i| pick_image(&i.image)),
            current_track: Some(latest.to_track_info()),
        })
    }
}

// ── user.getTop* ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopKind {
    Artists,
    Albums,
    Tracks,
}

impl TopKind {
    pub const ALL: [TopKind; 3] = [TopKind::Artists, TopKind::Albums, TopKind::Tracks];

    pub fn method(&self) -> &'static str {
        match self {
            Self::Artists => "user.gettopartists",
            Self::Albums => "user.gettopalbums",
            Self::Tracks => "user.gettoptracks",
        }
    }

    fn members(&self) -> (&'static str, &'static str) {
        match self {
            Self::Artists => ("topartists", "artist"),
            Self::Albums => ("topalbums", "album"),
            Self::Tracks => ("toptracks", "track"),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Artists => "artists",
            Self::Albums => "albums",
            Self::Tracks => "tracks",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.label() == label)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, Deserialize)]
pub struct TopItem {
    pub name: String,
    /// Owning artist for albums and tracks.
    #[serde(default)]
    pub artist: Option<String>,
    pub playcount: u64,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct RawTopItem {
    name: String,
    #[serde(default)]
    artist: Option<ArtistRef>,
    #[serde(default, deserialize_with = "lenient_u64")]
    playcount: u64,
    #[serde(default)]
    url: String,
}

pub fn parse_top(kind: TopKind, json: &Value) -> Result<Vec<TopItem>, ApiError> {
    let (outer, inner) = kind.members();
    let list = json
        .get(outer)
        .ok_or_else(|| ApiError::malformed(format!("missing `{}`", outer)))?;

    #[derive(Deserialize)]
    struct Wrapper {
        #[serde(default, deserialize_with = "one_or_many")]
        items: Vec<RawTopItem>,
    }

    let items = match list.get(inner) {
        Some(v) => serde_json::from_value::<Wrapper>(serde_json::json!({ "items": v }))
            .map_err(|e| ApiError::malformed(format!("{}: {}", outer, e)))?
            .items,
        None => Vec::new(),
    };

    Ok(items
        .into_iter()
        .map(|raw| TopItem {
            name: raw.name,
            artist: raw.artist.map(|a| a.name()).filter(|a| !a.is_empty()),
            playcount: raw.playcount,
            url: raw.url,
        })
        .collect())
}

// ── track.getInfo ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct TrackDetail {
    pub name: String,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub userplaycount: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_error_payload_beats_status() {
        let err = classify_response(403, r#"{"error":29,"message":"Rate Limit Exceeded"}"#)
            .unwrap_err();
        assert!(err.is_rate_limited());
    }

    #[test]
    fn test_classify_non_json_carries_status() {
        let err = classify_response(502, "<html>Bad Gateway</html>").unwrap_err();
        assert_eq!(err, ApiError::NonJsonResponse { status: 502 });
    }

    #[test]
    fn test_classify_non_2xx_json_without_error() {
        let err = classify_response(500, r#"{"ok":false}"#).unwrap_err();
        assert_eq!(err, ApiError::NonJsonResponse { status: 500 });
    }

    #[test]
    fn test_recent_tracks_single_object() {
        let payload = json!({
            "recenttracks": {
                "track": {
                    "name": "Windowlicker",
                    "artist": { "#text": "Aphex Twin" },
                    "image": [
                        { "#text": "small.png", "size": "small" },
                        { "#text": "", "size": "extralarge" }
                    ],
                    "@attr": { "nowplaying": "true" }
                }
            }
        });
        let recent: RecentTracks = decode(&payload, "recenttracks").unwrap();
        assert_eq!(recent.track.len(), 1);
        let info = recent.track[0].to_track_info();
        assert!(info.is_now_playing);
        assert_eq!(info.artist, "Aphex Twin");
        assert_eq!(info.art_url.as_deref(), Some("small.png"));
        assert_eq!(info.timestamp_secs, None);
    }

    #[test]
    fn test_recent_tracks_extended_artist_and_date() {
        let payload = json!({
            "recenttracks": {
                "track": [{
                    "name": "Xtal",
                    "artist": { "name": "Aphex Twin", "url": "https://www.last.fm/music/Aphex+Twin" },
                    "date": { "uts": "1700000000", "#text": "14 Nov 2023" },
                    "loved": "1"
                }]
            }
        });
        let recent: RecentTracks = decode(&payload, "recenttracks").unwrap();
        let info = recent.track[0].to_track_info();
        assert_eq!(info.artist, "Aphex Twin");
        assert_eq!(info.timestamp_secs, Some(1_700_000_000));
        assert!(info.loved);
        assert!(!info.is_now_playing);
    }

    #[test]
    fn test_empty_window_has_no_fresh_state() {
        let payload = json!({ "recenttracks": { "track": [], "@attr": { "total": "0" } } });
        let recent: RecentTracks = decode(&payload, "recenttracks").unwrap();
        assert!(recent.to_fresh(None).is_none());
    }

    #[test]
    fn test_friends_page_attr() {
        let payload = json!({
            "friends": {
                "user": [{ "name": "bob", "realname": "", "image": [] }],
                "@attr": { "page": "1", "totalPages": "3" }
            }
        });
        let page: FriendsPage = decode(&payload, "friends").unwrap();
        assert_eq!(page.attr.total_pages, 3);
        assert_eq!(page.user[0].display_name(), "bob");
    }

    #[test]
    fn test_parse_top_albums() {
        let payload = json!({
            "topalbums": {
                "album": [
                    { "name": "Selected Ambient Works", "playcount": "42",
                      "url": "https://www.last.fm/music/Aphex+Twin/SAW",
                      "artist": { "name": "Aphex Twin" } }
                ]
            }
        });
        let items = parse_top(TopKind::Albums, &payload).unwrap();
        assert_eq!(items[0].playcount, 42);
        assert_eq!(items[0].artist.as_deref(), Some("Aphex Twin"));
    }

    #[test]
    fn test_missing_member_is_malformed() {
        let err = decode::<RecentTracks>(&json!({}), "recenttracks").unwrap_err();
        assert!(matches!(err, ApiError::MalformedPayload { .. }));
    }
}
