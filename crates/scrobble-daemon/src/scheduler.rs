//! Per-stream refresh timers.
//!
//! Each stream (roster, activity, statistics) has its own interval and last
//! completion time. A scheduling pass either declares a stream due, or arms a
//! single timer task that sends the stream back into the core's event loop
//! when it expires. Re-arming always aborts the previous timer first, so a
//! stream never has more than one live timer.
//!
//! While the renderer is hidden every timer is cancelled; becoming visible
//! runs a pass, which refreshes whatever went stale in the meantime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use scrobble_proto::store::{set_with_recovery, PersistentStore, ESSENTIAL_PARTITIONS, PARTITION_SCHEDULE};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const SNAPSHOT_KEY: &str = "streams";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Roster,
    Activity,
    Statistics,
}

impl StreamKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Roster => "roster",
            Self::Activity => "activity",
            Self::Statistics => "statistics",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    /// A timer is armed.
    Pending,
    /// A refresh is in flight; no timer may be armed.
    Running,
}

struct UpdateStream {
    kind: StreamKind,
    interval: Duration,
    last_update_at_ms: Option<i64>,
    state: StreamState,
    timer: Option<JoinHandle<()>>,
}

impl UpdateStream {
    fn cancel_timer(&mut self) {
        if let Some(handle) = self.timer.take() {
            handle.abort();
        }
    }
}

pub struct UpdateScheduler {
    streams: Vec<UpdateStream>,
    due_tx: mpsc::Sender<StreamKind>,
    store: Arc<PersistentStore>,
    visible: bool,
}

impl UpdateScheduler {
    /// `due_tx` receives a stream whenever one of its timers expires.
    pub fn new(due_tx: mpsc::Sender<StreamKind>, store: Arc<PersistentStore>) -> Self {
        Self {
            streams: Vec::new(),
            due_tx,
            store,
            visible: true,
        }
    }

    /// Register a stream, restoring its last completion time from the store.
    pub fn add_stream(&mut self, kind: StreamKind, interval: Duration) {
        let last = self.load_snapshot().get(kind.name()).copied();
        self.streams.retain(|s| s.kind != kind);
        self.streams.push(UpdateStream {
            kind,
            interval,
            last_update_at_ms: last,
            state: StreamState::Idle,
            timer: None,
        });
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn state(&self, kind: StreamKind) -> Option<StreamState> {
        self.stream(kind).map(|s| s.state)
    }

    pub fn last_update_at_ms(&self, kind: StreamKind) -> Option<i64> {
        self.stream(kind).and_then(|s| s.last_update_at_ms)
    }

    /// Number of timers that have not yet fired or been aborted.
    #[cfg(test)]
    pub fn live_timers(&self, kind: StreamKind) -> usize {
        self.stream(kind)
            .and_then(|s| s.timer.as_ref())
            .map_or(0, |t| usize::from(!t.is_finished()))
    }

    /// Schedule every stream; returns the streams that are due now, in
    /// registration order. Each returned stream is marked running.
    pub fn pass(&mut self, now_ms: i64) -> Vec<StreamKind> {
        let kinds: Vec<StreamKind> = self.streams.iter().map(|s| s.kind).collect();
        let due = kinds
            .into_iter()
            .filter(|k| self.schedule_one(*k, now_ms))
            .collect();
        self.persist();
        due
    }

    /// Schedule one stream; `true` means it is due and is now running.
    pub fn schedule(&mut self, kind: StreamKind, now_ms: i64) -> bool {
        let due = self.schedule_one(kind, now_ms);
        self.persist();
        due
    }

    fn schedule_one(&mut self, kind: StreamKind, now_ms: i64) -> bool {
        let visible = self.visible;
        let Some(stream) = self.stream_mut(kind) else {
            return false;
        };
        if stream.state == StreamState::Running {
            return false;
        }
        stream.cancel_timer();
        stream.state = StreamState::Idle;
        if !visible {
            return false;
        }

        let delay_ms = match stream.last_update_at_ms {
            None => 0,
            Some(last) => last + stream.interval.as_millis() as i64 - now_ms,
        };
        if delay_ms <= 0 {
            debug!("scheduler: {} due", kind.name());
            stream.state = StreamState::Running;
            return true;
        }
        self.arm(kind, Duration::from_millis(delay_ms as u64));
        false
    }

    /// A refresh finished (successfully or not): record it and re-arm for a
    /// full interval.
    pub fn complete(&mut self, kind: StreamKind, now_ms: i64) {
        let visible = self.visible;
        let Some(stream) = self.stream_mut(kind) else {
            return;
        };
        stream.last_update_at_ms = Some(now_ms);
        stream.state = StreamState::Idle;
        let interval = stream.interval;
        if visible {
            self.arm(kind, interval);
        }
        self.persist();
    }

    /// Refresh now regardless of the interval; `false` if already running.
    pub fn force(&mut self, kind: StreamKind) -> bool {
        let Some(stream) = self.stream_mut(kind) else {
            return false;
        };
        if stream.state == StreamState::Running {
            return false;
        }
        stream.cancel_timer();
        stream.state = StreamState::Running;
        true
    }

    /// Drop a due stream back to idle with no timer; it waits for `force`
    /// or the next pass.
    pub fn release(&mut self, kind: StreamKind) {
        if let Some(stream) = self.stream_mut(kind) {
            stream.cancel_timer();
            stream.state = StreamState::Idle;
        }
    }

    /// Put a due stream back to sleep for `delay` without touching its last
    /// completion time. Used while another fetch holds a guard.
    pub fn defer(&mut self, kind: StreamKind, delay: Duration) {
        if !self.visible {
            if let Some(stream) = self.stream_mut(kind) {
                stream.state = StreamState::Idle;
            }
            return;
        }
        self.arm(kind, delay);
    }

    /// Hidden: cancel every timer. Visible: run a pass and return what is due.
    pub fn set_visible(&mut self, visible: bool, now_ms: i64) -> Vec<StreamKind> {
        if visible == self.visible {
            return Vec::new();
        }
        self.visible = visible;
        if !visible {
            debug!("scheduler: hidden, cancelling timers");
            for stream in &mut self.streams {
                stream.cancel_timer();
                if stream.state == StreamState::Pending {
                    stream.state = StreamState::Idle;
                }
            }
            return Vec::new();
        }
        debug!("scheduler: visible, rescheduling");
        self.pass(now_ms)
    }

    fn arm(&mut self, kind: StreamKind, delay: Duration) {
        let tx = self.due_tx.clone();
        let Some(stream) = self.stream_mut(kind) else {
            return;
        };
        stream.cancel_timer();
        debug!("scheduler: {} armed in {:?}", kind.name(), delay);
        stream.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(kind).await;
        }));
        stream.state = StreamState::Pending;
    }

    fn stream(&self, kind: StreamKind) -> Option<&UpdateStream> {
        self.streams.iter().find(|s| s.kind == kind)
    }

    fn stream_mut(&mut self, kind: StreamKind) -> Option<&mut UpdateStream> {
        self.streams.iter_mut().find(|s| s.kind == kind)
    }

    fn load_snapshot(&self) -> HashMap<String, i64> {
        self.store
            .get(PARTITION_SCHEDULE, SNAPSHOT_KEY)
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn persist(&self) {
        let snapshot: HashMap<&str, i64> = self
            .streams
            .iter()
            .filter_map(|s| s.last_update_at_ms.map(|t| (s.kind.name(), t)))
            .collect();
        let raw = match serde_json::to_string(&snapshot) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("scheduler: failed to encode snapshot: {}", e);
                return;
            }
        };
        if let Err(e) = set_with_recovery(
            &self.store,
            ESSENTIAL_PARTITIONS,
            PARTITION_SCHEDULE,
            SNAPSHOT_KEY,
            raw,
        ) {
            warn!("scheduler: failed to persist snapshot: {}", e);
        }
    }
}

impl Drop for UpdateScheduler {
    fn drop(&mut self) {
        for stream in &mut self.streams {
            stream.cancel_timer();
        }
    }
}
