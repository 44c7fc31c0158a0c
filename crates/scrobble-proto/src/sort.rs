//! Deterministic ordering of the live collection.
//!
//! Playing friends come first (the focused one at the very top), ordered by
//! case-insensitive id. Everyone else follows by last scrobble, newest first,
//! with unknown timestamps treated as 0. Remaining ties fall back to the
//! folded id and then the raw id, so the order is total.

use std::cmp::Ordering;

use crate::model::{id_key, Entity};

fn tier(entity: &Entity, focus: Option<&str>) -> u8 {
    if !entity.is_playing() {
        return 2;
    }
    match focus {
        Some(f) if entity.key() == f => 0,
        _ => 1,
    }
}

pub fn compare(a: &Entity, b: &Entity, focus_key: Option<&str>) -> Ordering {
    let (ta, tb) = (tier(a, focus_key), tier(b, focus_key));
    ta.cmp(&tb)
        .then_with(|| {
            if ta == 2 {
                b.last_activity_secs().cmp(&a.last_activity_secs())
            } else {
                Ordering::Equal
            }
        })
        .then_with(|| a.key().cmp(&b.key()))
        .then_with(|| a.id.cmp(&b.id))
}

pub fn sort_entities(entities: &mut [Entity], focus_id: Option<&str>) {
    let focus_key = focus_id.map(id_key);
    entities.sort_by(|a, b| compare(a, b, focus_key.as_deref()));
}

pub fn sorted(mut entities: Vec<Entity>, focus_id: Option<&str>) -> Vec<Entity> {
    sort_entities(&mut entities, focus_id);
    entities
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TrackInfo;

    fn entity(id: &str, playing: bool, ts: Option<i64>) -> Entity {
        let mut e = Entity::new(id);
        e.current_track = Some(TrackInfo {
            title: "t".into(),
            artist: "a".into(),
            art_url: None,
            is_now_playing: playing,
            timestamp_secs: ts,
            loved: false,
        });
        e
    }

    fn ids(v: &[Entity]) -> Vec<&str> {
        v.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn test_tiers() {
        let out = sorted(
            vec![
                entity("zed", false, Some(100)),
                entity("Bob", true, None),
                entity("amy", true, None),
                entity("carl", false, Some(300)),
                entity("Focus", true, None),
                entity("dan", false, None),
            ],
            Some("focus"),
        );
        assert_eq!(ids(&out), vec!["Focus", "amy", "Bob", "carl", "zed", "dan"]);
    }

    #[test]
    fn test_focus_not_playing_gets_no_boost() {
        let out = sorted(
            vec![entity("amy", false, Some(5)), entity("bob", false, Some(10))],
            Some("amy"),
        );
        assert_eq!(ids(&out), vec!["bob", "amy"]);
    }

    #[test]
    fn test_ties_are_total() {
        let a = sorted(
            vec![
                entity("b", false, Some(1)),
                entity("B", false, Some(1)),
                entity("a", false, Some(1)),
            ],
            None,
        );
        let b = sorted(
            vec![
                entity("a", false, Some(1)),
                entity("B", false, Some(1)),
                entity("b", false, Some(1)),
            ],
            None,
        );
        assert_eq!(ids(&a), vec!["a", "B", "b"]);
        assert_eq!(ids(&a), ids(&b));
    }

    #[test]
    fn test_idempotent() {
        let once = sorted(
            vec![
                entity("x", true, None),
                entity("y", false, Some(9)),
                entity("z", false, None),
                entity("w", true, None),
            ],
            Some("y"),
        );
        let twice = sorted(once.clone(), Some("y"));
        assert_eq!(once, twice);
    }
}
