//! Merge freshly fetched friend state into the live collection.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::ApiError;
use crate::model::{id_key, Entity, EntityStatus, FreshEntity, TrackInfo, Transient};

/// Result of one per-entity activity fetch.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Fresh(FreshEntity),
    /// Nothing scrobbled inside the lookback window.
    NoActivity,
    Failed(ApiError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    Merged { entity: Entity, track_changed: bool },
    /// Drop from the live collection; it may come back in a later window.
    Remove,
    /// Keep, but stop refreshing until a full resync.
    MarkedPrivate(Entity),
    /// Leave the previous state in place.
    Kept,
}

/// True when `fresh` names a different track than `previous`.
///
/// A fetch that carries no track at all is not a change.
pub fn track_changed(previous: Option<&TrackInfo>, fresh: Option<&TrackInfo>) -> bool {
    match (previous, fresh) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(p), Some(f)) => !p.same_subject(f),
    }
}

pub fn merge(previous: &Entity, fresh: FreshEntity) -> Entity {
    let changed = track_changed(previous.current_track.as_ref(), fresh.current_track.as_ref());
    let transient = if changed {
        Transient::default()
    } else {
        previous.transient.clone()
    };

    Entity {
        id: previous.id.clone(),
        display_name: fresh
            .display_name
            .unwrap_or_else(|| previous.display_name.clone()),
        profile_image: fresh.profile_image.or_else(|| previous.profile_image.clone()),
        current_track: fresh.current_track.or_else(|| previous.current_track.clone()),
        transient,
        status: EntityStatus::Active,
    }
}

pub fn reconcile(previous: &Entity, outcome: FetchOutcome) -> Reconciled {
    match outcome {
        FetchOutcome::Fresh(fresh) => {
            let track_changed =
                track_changed(previous.current_track.as_ref(), fresh.current_track.as_ref());
            Reconciled::Merged {
                entity: merge(previous, fresh),
                track_changed,
            }
        }
        FetchOutcome::NoActivity => {
            debug!("reconcile: {} has no activity in window", previous.id);
            Reconciled::Remove
        }
        FetchOutcome::Failed(err) if err.is_entity_terminal() => {
            debug!("reconcile: {} is private: {}", previous.id, err);
            let mut entity = previous.clone();
            entity.status = EntityStatus::Private;
            Reconciled::MarkedPrivate(entity)
        }
        FetchOutcome::Failed(ApiError::NotFound { message }) => {
            debug!("reconcile: {} not found, skipping: {}", previous.id, message);
            Reconciled::Kept
        }
        FetchOutcome::Failed(err) => {
            warn!("reconcile: keeping stale state for {}: {}", previous.id, err);
            Reconciled::Kept
        }
    }
}

/// What one pass over the collection changed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconcileReport {
    pub track_changed: Vec<String>,
    pub removed: Vec<String>,
    pub marked_private: Vec<String>,
    pub rate_limited: usize,
}

/// Apply a batch of fetch outcomes to `collection` in place.
///
/// Entities absent from `collection` start from `Entity::new`; entities with
/// no outcome in the batch are left untouched.
pub fn reconcile_into(
    collection: &mut Vec<Entity>,
    outcomes: Vec<(String, FetchOutcome)>,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();
    let mut index: HashMap<String, usize> = collection
        .iter()
        .enumerate()
        .map(|(i, e)| (e.key(), i))
        .collect();
    let mut removed: Vec<String> = Vec::new();

    for (id, outcome) in outcomes {
        if let FetchOutcome::Failed(err) = &outcome {
            if err.is_rate_limited() {
                report.rate_limited += 1;
            }
        }

        let key = id_key(&id);
        let slot = index.get(&key).copied();
        let previous = match slot {
            Some(i) => collection[i].clone(),
            None => Entity::new(id.clone()),
        };

        match reconcile(&previous, outcome) {
            Reconciled::Merged {
                entity,
                track_changed,
            } => {
                if track_changed {
                    report.track_changed.push(entity.id.clone());
                }
                match slot {
                    Some(i) => collection[i] = entity,
                    None => {
                        index.insert(key, collection.len());
                        collection.push(entity);
                    }
                }
            }
            Reconciled::MarkedPrivate(entity) => {
                report.marked_private.push(entity.id.clone());
                match slot {
                    Some(i) => collection[i] = entity,
                    None => {
                        index.insert(key, collection.len());
                        collection.push(entity);
                    }
                }
            }
            Reconciled::Remove => {
                if slot.is_some() {
                    report.removed.push(previous.id.clone());
                    removed.push(key);
                }
            }
            Reconciled::Kept => {}
        }
    }

    if !removed.is_empty() {
        collection.retain(|e| !removed.contains(&e.key()));
    }
    report
}
