//! Aggregate chart datasets across friends.

use std::collections::HashMap;

use serde::Serialize;

use crate::lastfm::TopItem;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contributor {
    pub friend: String,
    pub plays: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartEntry {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    pub plays: u64,
    pub user_count: usize,
    pub url: String,
    pub contributors: Vec<Contributor>,
}

fn group_key(item: &TopItem) -> String {
    match &item.artist {
        Some(a) => format!("{}\u{1f}{}", a.trim().to_lowercase(), item.name.trim().to_lowercase()),
        None => item.name.trim().to_lowercase(),
    }
}

/// Fold per-friend top lists into one dataset.
///
/// Items are grouped by case-insensitive name (and artist, for albums and
/// tracks). Sorted by plays, then number of friends, then name.
pub fn aggregate(per_friend: &[(String, Vec<TopItem>)]) -> Vec<ChartEntry> {
    let mut groups: HashMap<String, ChartEntry> = HashMap::new();

    for (friend, items) in per_friend {
        for item in items {
            let entry = groups.entry(group_key(item)).or_insert_with(|| ChartEntry {
                name: item.name.trim().to_string(),
                artist: item.artist.clone(),
                plays: 0,
                user_count: 0,
                url: item.url.clone(),
                contributors: Vec::new(),
            });
            if entry.url.is_empty() {
                entry.url = item.url.clone();
            }
            entry.plays += item.playcount;
            match entry.contributors.iter_mut().find(|c| c.friend == *friend) {
                Some(c) => c.plays += item.playcount,
                None => entry.contributors.push(Contributor {
                    friend: friend.clone(),
                    plays: item.playcount,
                }),
            }
            entry.user_count = entry.contributors.len();
        }
    }

    let mut out: Vec<ChartEntry> = groups.into_values().collect();
    for entry in &mut out {
        entry
            .contributors
            .sort_by(|a, b| b.plays.cmp(&a.plays).then_with(|| a.friend.cmp(&b.friend)));
    }
    out.sort_by(|a, b| {
        b.plays
            .cmp(&a.plays)
            .then_with(|| b.user_count.cmp(&a.user_count))
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
            .then_with(|| a.artist.cmp(&b.artist))
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str, plays: u64, url: &str) -> TopItem {
        TopItem {
            name: name.into(),
            artist: None,
            playcount: plays,
            url: url.into(),
        }
    }

    #[test]
    fn test_aggregate_merges_case_insensitively() {
        let charts = aggregate(&[
            ("alice".into(), vec![item("Autechre", 10, "u1"), item("Burial", 4, "u2")]),
            ("bob".into(), vec![item("autechre", 5, ""), item("Plaid", 14, "u3")]),
        ]);
        assert_eq!(charts[0].name, "Autechre");
        assert_eq!(charts[0].plays, 15);
        assert_eq!(charts[0].user_count, 2);
        assert_eq!(charts[0].url, "u1");
        assert_eq!(charts[0].contributors[0].friend, "alice");
        assert_eq!(charts[1].name, "Plaid");
        assert_eq!(charts[2].name, "Burial");
    }

    #[test]
    fn test_tie_breaks_on_user_count_then_name() {
        let charts = aggregate(&[
            ("a".into(), vec![item("Zeta", 6, ""), item("Beta", 3, ""), item("Alpha", 6, "")]),
            ("b".into(), vec![item("Beta", 3, "")]),
        ]);
        let names: Vec<&str> = charts.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Beta", "Alpha", "Zeta"]);
    }

    #[test]
    fn test_same_title_different_artist_stays_apart() {
        let mut a = item("Intro", 2, "");
        a.artist = Some("The xx".into());
        let mut b = item("Intro", 3, "");
        b.artist = Some("M83".into());
        let charts = aggregate(&[("alice".into(), vec![a, b])]);
        assert_eq!(charts.len(), 2);
    }
}
