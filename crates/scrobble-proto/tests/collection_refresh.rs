//! Two refresh cycles over a small roster, from raw upstream bodies to the
//! ordered collection the renderer reads.

use scrobble_proto::error::ApiError;
use scrobble_proto::lastfm::{classify_response, decode, RecentTracks};
use scrobble_proto::model::{Entity, EntityStatus, PanelState, TransientPatch};
use scrobble_proto::reconcile::{reconcile_into, FetchOutcome};
use scrobble_proto::sort::sort_entities;

fn now_playing(title: &str, artist: &str) -> String {
    serde_json::json!({
        "recenttracks": {
            "track": {
                "name": title,
                "artist": { "name": artist },
                "@attr": { "nowplaying": "true" }
            }
        }
    })
    .to_string()
}

fn scrobbled(title: &str, artist: &str, uts: u64) -> String {
    serde_json::json!({
        "recenttracks": {
            "track": [{
                "name": title,
                "artist": { "#text": artist },
                "date": { "uts": uts.to_string() }
            }]
        }
    })
    .to_string()
}

const EMPTY_WINDOW: &str = r#"{"recenttracks":{"track":[],"@attr":{"total":"0"}}}"#;

/// Map one raw response the way the activity refresh does.
fn outcome(status: u16, body: &str) -> FetchOutcome {
    let json = match classify_response(status, body) {
        Ok(json) => json,
        Err(e) => return FetchOutcome::Failed(e),
    };
    match decode::<RecentTracks>(&json, "recenttracks") {
        Ok(recent) => match recent.to_fresh(None) {
            Some(fresh) => FetchOutcome::Fresh(fresh),
            None => FetchOutcome::NoActivity,
        },
        Err(e) => FetchOutcome::Failed(e),
    }
}

fn ids(collection: &[Entity]) -> Vec<&str> {
    collection.iter().map(|e| e.id.as_str()).collect()
}

#[test]
fn test_two_cycles_keep_order_and_transient_state() {
    let mut collection: Vec<Entity> = Vec::new();

    let report = reconcile_into(
        &mut collection,
        vec![
            ("bob".into(), outcome(200, &scrobbled("Roygbiv", "Boards of Canada", 100))),
            ("Carol".into(), outcome(200, &scrobbled("Windowlicker", "Aphex Twin", 200))),
            ("alice".into(), outcome(200, &now_playing("Halcyon", "Orbital"))),
            ("dave".into(), outcome(200, r#"{"error":17,"message":"Login: User required to be logged in"}"#)),
            ("erin".into(), outcome(200, r#"{"error":6,"message":"User not found"}"#)),
            ("frank".into(), outcome(200, EMPTY_WINDOW)),
        ],
    );
    sort_entities(&mut collection, None);

    // erin is skipped, frank had nothing in the window
    assert_eq!(ids(&collection), vec!["alice", "Carol", "bob", "dave"]);
    assert_eq!(report.marked_private, vec!["dave".to_string()]);
    assert!(report.removed.is_empty());
    assert_eq!(collection[3].status, EntityStatus::Private);

    // renderer opens bob's panel between cycles
    let bob = collection.iter_mut().find(|e| e.id == "bob").unwrap();
    bob.transient.apply(TransientPatch {
        expanded: Some(PanelState::Expanded),
        scroll_offset: Some(3),
        ..Default::default()
    });

    let report = reconcile_into(
        &mut collection,
        vec![
            ("bob".into(), outcome(200, &scrobbled(" Roygbiv ", "Boards of Canada", 100))),
            ("carol".into(), outcome(200, &now_playing("Xtal", "Aphex Twin"))),
            ("alice".into(), outcome(200, EMPTY_WINDOW)),
            ("frank".into(), outcome(200, r#"{"error":29,"message":"Rate Limit Exceeded"}"#)),
        ],
    );
    sort_entities(&mut collection, Some("CAROL"));

    assert_eq!(ids(&collection), vec!["Carol", "bob", "dave"]);
    assert_eq!(report.removed, vec!["alice".to_string()]);
    assert_eq!(report.track_changed, vec!["Carol".to_string()]);
    assert_eq!(report.rate_limited, 1);

    let bob = &collection[1];
    assert_eq!(bob.transient.expanded, PanelState::Expanded);
    assert_eq!(bob.transient.scroll_offset, 3);
}

#[test]
fn test_upstream_failures_leave_previous_state() {
    let mut collection = Vec::new();
    reconcile_into(
        &mut collection,
        vec![("bob".into(), outcome(200, &scrobbled("Roygbiv", "Boards of Canada", 100)))],
    );
    let before = collection.clone();

    let report = reconcile_into(
        &mut collection,
        vec![
            ("bob".into(), outcome(502, "<html>Bad Gateway</html>")),
            ("bob".into(), outcome(200, r#"{"error":8,"message":"Operation failed"}"#)),
            ("bob".into(), outcome(200, r#"{"recenttracks":"nope"}"#)),
        ],
    );

    assert_eq!(collection, before);
    assert_eq!(report.rate_limited, 0);
    assert!(matches!(
        outcome(502, "<html>Bad Gateway</html>"),
        FetchOutcome::Failed(ApiError::NonJsonResponse { status: 502 })
    ));
}
