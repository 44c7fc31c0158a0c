//! Domain logic shared by the scrobble daemon: friend entities, the upstream
//! payload boundary, the persistent response cache, reconciliation and
//! ordering of the live collection.

pub mod cache;
pub mod charts;
pub mod chunk;
pub mod config;
pub mod error;
pub mod generation;
pub mod lastfm;
pub mod model;
pub mod platform;
pub mod reconcile;
pub mod sort;
pub mod store;
