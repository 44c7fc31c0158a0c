/// SyncCore: single-owner event loop for the live collection.
///
/// Every refresh runs in a spawned task and reports back as a `CoreEvent`;
/// HTTP commands, scheduler timers and mpv events arrive the same way. Only
/// this loop mutates the collection, the roster, the charts and the preview
/// channel, so a reconciliation pass never interleaves with another.
///
/// After each mutation the loop publishes a fresh `ViewState` snapshot for
/// the HTTP readers and broadcasts a `Signal` to subscribers.
use std::sync::Arc;
use std::time::Duration;

use scrobble_proto::config::Config;
use scrobble_proto::generation::GenerationToken;
use scrobble_proto::model::{id_key, Entity, EntityStatus, ListenerCount, ListenersState, PanelState, TrackInfo, TransientPatch};
use scrobble_proto::reconcile::{reconcile_into, FetchOutcome};
use scrobble_proto::sort::sort_entities;
use scrobble_proto::store::PersistentStore;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::mpv::{MpvEvent, PreviewPlayer};
use crate::preview::{
    run_ticket, ChannelState, PlaybackCommand, PreviewClip, PreviewController, PreviewLookup, Resolution, Trigger,
};
use crate::scheduler::{StreamKind, StreamState, UpdateScheduler};
use crate::sync::{
    fetch_listeners, refresh_activity, refresh_roster, refresh_statistics, Charts, RosterMember,
    RosterSnapshot, SyncContext,
};
use crate::Signal;

// ── events ────────────────────────────────────────────────────────────────────

/// A request from the renderer (via the HTTP API).
#[derive(Debug, Clone)]
pub enum Command {
    SetVisible(bool),
    Focus(Option<String>),
    Hover(String),
    ScrollIntoView(String),
    Leave(String),
    UpdateTransient { id: String, patch: TransientPatch },
    Resync,
}

/// All inputs into the SyncCore loop.
#[derive(Debug)]
pub enum CoreEvent {
    Command(Command),
    StreamDue(StreamKind),
    RosterFetched(anyhow::Result<RosterSnapshot>),
    /// One activity cycle, tagged with the roster it was fetched for.
    ActivityFetched {
        roster_hash: String,
        outcomes: Vec<(String, FetchOutcome)>,
    },
    StatisticsFetched(anyhow::Result<Charts>),
    ListenersFetched {
        entity_id: String,
        track: TrackInfo,
        counts: Vec<ListenerCount>,
    },
    PreviewResolved {
        token: GenerationToken,
        entity_id: String,
        clip: Option<PreviewClip>,
    },
    Mpv(MpvEvent),
    Shutdown,
}

// ── published view ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub stream: StreamKind,
    pub state: Option<StreamState>,
    pub last_update_at_ms: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusView {
    pub visible: bool,
    pub focus: Option<String>,
    pub roster_size: usize,
    pub roster_hash: Option<String>,
    pub streams: Vec<StreamStatus>,
    pub listener_fetch_active: bool,
    /// Friend currently owning the preview channel.
    pub preview: Option<String>,
    pub store_used_bytes: usize,
    pub store_capacity_bytes: usize,
}

/// What the HTTP readers see; replaced wholesale after every mutation.
#[derive(Debug, Default)]
pub struct ViewState {
    pub entities: Vec<Entity>,
    pub charts: Charts,
    pub status: StatusView,
}

pub type SharedView = Arc<RwLock<ViewState>>;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ── SyncCore ──────────────────────────────────────────────────────────────────

pub struct SyncCore {
    config: Config,
    ctx: Arc<SyncContext>,
    scheduler: UpdateScheduler,
    roster: Option<RosterSnapshot>,
    /// The live collection, always sorted.
    entities: Vec<Entity>,
    focus: Option<String>,
    charts: Charts,
    /// While set, a due activity refresh re-arms at the busy-poll interval.
    listener_fetch_active: bool,
    resync_requested: bool,
    preview: PreviewController,
    lookup: PreviewLookup,
    player: PreviewPlayer,
    event_tx: mpsc::Sender<CoreEvent>,
    signal_tx: broadcast::Sender<Signal>,
    view: SharedView,
}

impl SyncCore {
    pub async fn new(
        config: Config,
        store: Arc<PersistentStore>,
        signal_tx: broadcast::Sender<Signal>,
        event_tx: mpsc::Sender<CoreEvent>,
    ) -> anyhow::Result<Self> {
        let ctx = Arc::new(SyncContext::new(config.clone(), store.clone(), signal_tx.clone())?);

        let (due_tx, mut due_rx) = mpsc::channel::<StreamKind>(16);
        let core_tx = event_tx.clone();
        tokio::spawn(async move {
            while let Some(kind) = due_rx.recv().await {
                if core_tx.send(CoreEvent::StreamDue(kind)).await.is_err() {
                    break;
                }
            }
        });

        let (mpv_tx, mut mpv_rx) = mpsc::channel::<MpvEvent>(64);
        let core_tx = event_tx.clone();
        tokio::spawn(async move {
            while let Some(evt) = mpv_rx.recv().await {
                if core_tx.send(CoreEvent::Mpv(evt)).await.is_err() {
                    break;
                }
            }
        });

        let streams = &config.streams;
        let mut scheduler = UpdateScheduler::new(due_tx, store.clone());
        scheduler.add_stream(StreamKind::Roster, Duration::from_secs(streams.roster_interval_secs));
        scheduler.add_stream(StreamKind::Activity, Duration::from_secs(streams.activity_interval_secs));
        scheduler.add_stream(
            StreamKind::Statistics,
            Duration::from_secs(streams.statistics_interval_secs),
        );

        let roster = RosterSnapshot::load(&store, &config.lastfm.username);
        if let Some(r) = &roster {
            info!("SyncCore: restored roster of {} members", r.members.len());
        }

        let lookup = PreviewLookup::new(
            &config.preview,
            Duration::from_secs(config.lastfm.request_timeout_secs),
        )?;

        Ok(Self {
            preview: PreviewController::new(&config.preview),
            lookup,
            player: PreviewPlayer::new(mpv_tx),
            config,
            ctx,
            scheduler,
            roster,
            entities: Vec::new(),
            focus: None,
            charts: Charts::new(),
            listener_fetch_active: false,
            resync_requested: false,
            event_tx,
            signal_tx,
            view: SharedView::default(),
        })
    }

    /// Shared snapshot for the HTTP server.
    pub fn view(&self) -> SharedView {
        Arc::clone(&self.view)
    }

    /// Run the event loop until `Shutdown` or until every sender is gone.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<CoreEvent>) -> anyhow::Result<()> {
        info!("SyncCore: starting event loop");
        for kind in self.scheduler.pass(now_ms()) {
            self.start_refresh(kind);
        }
        self.publish().await;

        while let Some(evt) = event_rx.recv().await {
            if !self.handle_event(evt).await {
                break;
            }
        }

        self.cleanup().await;
        Ok(())
    }

    /// Returns `false` when the loop should stop.
    async fn handle_event(&mut self, evt: CoreEvent) -> bool {
        match evt {
            CoreEvent::Shutdown => {
                info!("SyncCore: shutdown requested");
                return false;
            }
            CoreEvent::Command(cmd) => {
                debug!("SyncCore: command {:?}", cmd);
                self.handle_command(cmd).await;
            }
            CoreEvent::StreamDue(kind) => {
                if self.scheduler.schedule(kind, now_ms()) {
                    self.start_refresh(kind);
                }
            }
            CoreEvent::RosterFetched(result) => self.on_roster(result).await,
            CoreEvent::ActivityFetched {
                roster_hash,
                outcomes,
            } => self.on_activity(roster_hash, outcomes).await,
            CoreEvent::StatisticsFetched(result) => self.on_statistics(result).await,
            CoreEvent::ListenersFetched {
                entity_id,
                track,
                counts,
            } => self.on_listeners(entity_id, track, counts).await,
            CoreEvent::PreviewResolved {
                token,
                entity_id,
                clip,
            } => self.on_preview_resolved(token, entity_id, clip).await,
            CoreEvent::Mpv(evt) => self.on_mpv_event(evt).await,
        }
        true
    }

    // ── refresh cycles ────────────────────────────────────────────────────────

    /// Members whose activity is still worth fetching.
    fn refreshable_members(&self) -> Vec<RosterMember> {
        let Some(roster) = &self.roster else {
            return Vec::new();
        };
        roster
            .members
            .iter()
            .filter(|m| {
                let key = id_key(&m.id);
                self.entities
                    .iter()
                    .find(|e| e.key() == key)
                    .map_or(true, |e| e.status.is_refreshable())
            })
            .cloned()
            .collect()
    }

    /// Spawn the fetch for a stream the scheduler just marked running.
    fn start_refresh(&mut self, kind: StreamKind) {
        let now = now_ms();
        let ctx = self.ctx.clone();
        let tx = self.event_tx.clone();

        match kind {
            StreamKind::Roster => {
                info!("SyncCore: refreshing roster");
                tokio::spawn(async move {
                    let result = refresh_roster(ctx, now).await;
                    let _ = tx.send(CoreEvent::RosterFetched(result)).await;
                });
            }
            StreamKind::Activity => {
                if self.listener_fetch_active {
                    debug!("SyncCore: listener fetch active, deferring activity");
                    let poll = Duration::from_millis(self.config.streams.busy_poll_ms);
                    self.scheduler.defer(kind, poll);
                    return;
                }
                let Some(roster_hash) = self.roster.as_ref().map(|r| r.hash.clone()) else {
                    debug!("SyncCore: no roster yet, activity waits");
                    self.scheduler.release(kind);
                    return;
                };
                let members = self.refreshable_members();
                debug!("SyncCore: refreshing activity for {} members", members.len());
                tokio::spawn(async move {
                    let outcomes = refresh_activity(ctx, members, now).await;
                    let _ = tx
                        .send(CoreEvent::ActivityFetched {
                            roster_hash,
                            outcomes,
                        })
                        .await;
                });
            }
            StreamKind::Statistics => {
                if self.roster.is_none() {
                    debug!("SyncCore: no roster yet, statistics waits");
                    self.scheduler.release(kind);
                    return;
                }
                let members = self.refreshable_members();
                info!("SyncCore: refreshing statistics for {} members", members.len());
                tokio::spawn(async move {
                    let result = refresh_statistics(ctx, members, now).await;
                    let _ = tx.send(CoreEvent::StatisticsFetched(result)).await;
                });
            }
        }
    }

    fn force_refresh(&mut self, kind: StreamKind) {
        if self.scheduler.force(kind) {
            self.start_refresh(kind);
        }
    }

    /// A cycle failed as a whole: drop every persisted entry so the next
    /// start is clean, then wait for the next interval.
    fn stream_failed(&mut self, kind: StreamKind, err: anyhow::Error) {
        error!("SyncCore: {} refresh failed: {:#}", kind.name(), err);
        self.ctx.store().clear_all();
        let _ = self.signal_tx.send(Signal::StreamFailed {
            stream: kind,
            message: format!("{:#}", err),
        });
        self.scheduler.complete(kind, now_ms());
    }

    async fn on_roster(&mut self, result: anyhow::Result<RosterSnapshot>) {
        let snapshot = match result {
            Ok(s) => s,
            Err(e) => {
                self.stream_failed(StreamKind::Roster, e);
                self.publish().await;
                return;
            }
        };

        let changed = self
            .roster
            .as_ref()
            .map_or(true, |r| r.hash != snapshot.hash);
        let resync = changed || self.resync_requested;
        if resync {
            info!(
                "SyncCore: full resync ({} members, hash {})",
                snapshot.members.len(),
                snapshot.hash
            );
            self.entities.retain(|e| snapshot.contains(&e.id));
            for entity in &mut self.entities {
                if entity.status == EntityStatus::Private {
                    entity.status = EntityStatus::Active;
                }
            }
            self.resync_requested = false;
        }
        self.roster = Some(snapshot);
        self.scheduler.complete(StreamKind::Roster, now_ms());
        self.flush_store();

        if resync {
            self.force_refresh(StreamKind::Activity);
            self.force_refresh(StreamKind::Statistics);
        }
        self.publish().await;
        let _ = self.signal_tx.send(Signal::CollectionUpdated);
    }

    async fn on_activity(&mut self, roster_hash: String, mut outcomes: Vec<(String, FetchOutcome)>) {
        let Some(roster) = &self.roster else {
            self.scheduler.release(StreamKind::Activity);
            return;
        };
        if roster.hash != roster_hash {
            // fetched for a roster a resync has since replaced; the stream is
            // still running, so fetch again for the current one
            info!(
                "SyncCore: dropping activity for superseded roster {}",
                roster_hash
            );
            self.start_refresh(StreamKind::Activity);
            return;
        }
        outcomes.retain(|(id, _)| roster.contains(id));

        let report = reconcile_into(&mut self.entities, outcomes);
        if report.rate_limited > 0 {
            warn!("SyncCore: {} friends rate limited this cycle", report.rate_limited);
        }
        for id in &report.track_changed {
            let commands = self.preview.track_changed(id);
            self.execute(commands).await;
        }
        if !report.removed.is_empty() || !report.marked_private.is_empty() {
            debug!(
                "SyncCore: removed {:?}, marked private {:?}",
                report.removed, report.marked_private
            );
        }
        sort_entities(&mut self.entities, self.focus.as_deref());

        self.scheduler.complete(StreamKind::Activity, now_ms());
        self.flush_store();
        self.publish().await;
        let _ = self.signal_tx.send(Signal::CollectionUpdated);
        self.maybe_fetch_listeners();
    }

    async fn on_statistics(&mut self, result: anyhow::Result<Charts>) {
        match result {
            Ok(charts) => {
                self.charts = charts;
                self.scheduler.complete(StreamKind::Statistics, now_ms());
                self.flush_store();
                let _ = self.signal_tx.send(Signal::ChartsUpdated);
            }
            Err(e) => self.stream_failed(StreamKind::Statistics, e),
        }
        self.publish().await;
    }

    // ── listeners ─────────────────────────────────────────────────────────────

    /// Start a listener fetch for the first expanded panel that needs one.
    fn maybe_fetch_listeners(&mut self) {
        if self.listener_fetch_active {
            return;
        }
        let Some(roster) = &self.roster else {
            return;
        };
        let Some(entity) = self.entities.iter_mut().find(|e| {
            e.transient.expanded == PanelState::Expanded
                && e.transient.listeners == ListenersState::None
                && e.current_track.is_some()
        }) else {
            return;
        };
        let Some(track) = entity.current_track.clone() else {
            return;
        };

        entity.transient.listeners = ListenersState::Loading;
        let entity_id = entity.id.clone();
        let owner = entity.key();
        let friends: Vec<RosterMember> = roster
            .members
            .iter()
            .filter(|m| id_key(&m.id) != owner)
            .cloned()
            .collect();
        self.listener_fetch_active = true;
        debug!("SyncCore: fetching listeners of {} - {}", track.artist, track.title);

        let ctx = self.ctx.clone();
        let tx = self.event_tx.clone();
        let now = now_ms();
        tokio::spawn(async move {
            let counts =
                fetch_listeners(ctx, friends, track.artist.clone(), track.title.clone(), now).await;
            let _ = tx
                .send(CoreEvent::ListenersFetched {
                    entity_id,
                    track,
                    counts,
                })
                .await;
        });
    }

    async fn on_listeners(&mut self, entity_id: String, track: TrackInfo, counts: Vec<ListenerCount>) {
        self.listener_fetch_active = false;
        if let Some(entity) = self.entity_mut(&entity_id) {
            let current = entity
                .current_track
                .as_ref()
                .map_or(false, |t| t.same_subject(&track));
            if current {
                entity.transient.listener_counts = counts;
                entity.transient.listeners = ListenersState::Loaded;
            } else {
                entity.transient.listeners = ListenersState::None;
            }
        }
        self.flush_store();
        self.publish().await;
        let _ = self.signal_tx.send(Signal::CollectionUpdated);
        self.maybe_fetch_listeners();
    }

    // ── commands ──────────────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SetVisible(visible) => {
                info!("SyncCore: visible={}", visible);
                for kind in self.scheduler.set_visible(visible, now_ms()) {
                    self.start_refresh(kind);
                }
            }
            Command::Focus(id) => {
                self.focus = id;
                sort_entities(&mut self.entities, self.focus.as_deref());
                let _ = self.signal_tx.send(Signal::CollectionUpdated);
            }
            Command::UpdateTransient { id, patch } => {
                let position = match self.entity_mut(&id) {
                    Some(entity) => {
                        let touched = patch.preview_position_secs.is_some();
                        entity.transient.apply(patch);
                        touched.then_some(entity.transient.preview_position_secs)
                    }
                    None => {
                        debug!("SyncCore: transient update for unknown {}", id);
                        return;
                    }
                };
                if let Some(pos) = position {
                    self.preview.remember(&id, pos);
                }
                self.maybe_fetch_listeners();
                let _ = self.signal_tx.send(Signal::CollectionUpdated);
            }
            Command::Hover(id) => self.request_preview(&id, Trigger::Hover).await,
            Command::ScrollIntoView(id) => self.request_preview(&id, Trigger::Scroll).await,
            Command::Leave(id) => self.leave_preview(&id).await,
            Command::Resync => {
                info!("SyncCore: resync requested");
                self.resync_requested = true;
                self.force_refresh(StreamKind::Roster);
            }
        }
        self.publish().await;
    }

    // ── preview ───────────────────────────────────────────────────────────────

    async fn current_position(&mut self) -> Option<f64> {
        let handle = self.player.handle()?;
        handle.time_pos().await
    }

    async fn request_preview(&mut self, id: &str, trigger: Trigger) {
        if !self.config.preview.enabled {
            return;
        }
        let Some(track) = self.entity_mut(id).and_then(|e| e.current_track.clone()) else {
            debug!("SyncCore: no track to preview for {}", id);
            return;
        };
        let position = self.current_position().await;
        let (ticket, commands) = self.preview.request(id, &track, trigger, position);
        self.execute(commands).await;

        let generation = self.preview.generation();
        let lookup = self.lookup.clone();
        let ctx = self.ctx.clone();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let token = ticket.token;
            let entity_id = ticket.entity_id.clone();
            if let Some(clip) = run_ticket(ticket, generation, lookup, ctx).await {
                let _ = tx
                    .send(CoreEvent::PreviewResolved {
                        token,
                        entity_id,
                        clip,
                    })
                    .await;
            }
        });
    }

    async fn leave_preview(&mut self, id: &str) {
        let position = self.current_position().await;
        let outcome = self.preview.leave(id, position);
        self.execute(outcome.commands).await;
        if let Some(pos) = outcome.remembered {
            if let Some(entity) = self.entity_mut(id) {
                entity.transient.preview_position_secs = pos;
            }
        }
    }

    async fn on_preview_resolved(
        &mut self,
        token: GenerationToken,
        entity_id: String,
        clip: Option<PreviewClip>,
    ) {
        match self.preview.resolve(token, &entity_id, clip) {
            Resolution::Superseded => return,
            Resolution::NoPreview => {
                debug!("SyncCore: no preview for {}", entity_id);
                let _ = self.signal_tx.send(Signal::Preview {
                    entity_id,
                    playing: false,
                });
            }
            Resolution::Play(command) => {
                self.execute(vec![command]).await;
                if let Some(entity) = self.entity_mut(&entity_id) {
                    entity.transient.preview_playing = true;
                }
                let _ = self.signal_tx.send(Signal::Preview {
                    entity_id,
                    playing: true,
                });
            }
        }
        self.publish().await;
    }

    async fn on_mpv_event(&mut self, evt: MpvEvent) {
        if !evt.is_eof() {
            return;
        }
        if let Some(id) = self.preview.playback_ended() {
            if let Some(entity) = self.entity_mut(&id) {
                entity.transient.preview_playing = false;
                entity.transient.preview_position_secs = 0.0;
            }
            let _ = self.signal_tx.send(Signal::Preview {
                entity_id: id,
                playing: false,
            });
            self.publish().await;
        }
    }

    async fn execute(&mut self, commands: Vec<PlaybackCommand>) {
        for command in commands {
            match command {
                PlaybackCommand::Pause => {
                    for entity in &mut self.entities {
                        entity.transient.preview_playing = false;
                    }
                    if let Some(handle) = self.player.handle() {
                        if let Err(e) = handle.set_pause(true).await {
                            warn!("SyncCore: failed to pause preview: {}", e);
                        }
                    }
                }
                PlaybackCommand::Play { url, start_secs } => match self.player.ensure().await {
                    Ok(handle) => {
                        info!("SyncCore: preview {} from {:.1}s", url, start_secs);
                        if let Err(e) = handle.load_clip(&url, start_secs).await {
                            warn!("SyncCore: failed to play preview: {}", e);
                        }
                    }
                    Err(e) => warn!("SyncCore: preview player unavailable: {}", e),
                },
            }
        }
    }

    // ── helpers ───────────────────────────────────────────────────────────────

    fn entity_mut(&mut self, id: &str) -> Option<&mut Entity> {
        let key = id_key(id);
        self.entities.iter_mut().find(|e| e.key() == key)
    }

    fn flush_store(&self) {
        if let Err(e) = self.ctx.store().flush() {
            warn!("SyncCore: failed to flush store: {}", e);
        }
    }

    fn status(&self) -> StatusView {
        let store = self.ctx.store();
        StatusView {
            visible: self.scheduler.is_visible(),
            focus: self.focus.clone(),
            roster_size: self.roster.as_ref().map_or(0, |r| r.members.len()),
            roster_hash: self.roster.as_ref().map(|r| r.hash.clone()),
            streams: [StreamKind::Roster, StreamKind::Activity, StreamKind::Statistics]
                .into_iter()
                .map(|stream| StreamStatus {
                    stream,
                    state: self.scheduler.state(stream),
                    last_update_at_ms: self.scheduler.last_update_at_ms(stream),
                })
                .collect(),
            listener_fetch_active: self.listener_fetch_active,
            preview: match self.preview.state() {
                ChannelState::Idle => None,
                ChannelState::Searching { entity_id } | ChannelState::Playing { entity_id } => {
                    Some(entity_id.clone())
                }
            },
            store_used_bytes: store.used_bytes(),
            store_capacity_bytes: store.capacity_bytes(),
        }
    }

    async fn publish(&self) {
        let mut view = self.view.write().await;
        view.entities = self.entities.clone();
        view.charts = self.charts.clone();
        view.status = self.status();
    }

    async fn cleanup(&mut self) {
        info!("SyncCore: cleanup");
        self.player.shutdown().await;
        self.flush_store();
    }
}
