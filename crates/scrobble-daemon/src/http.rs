use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::Json,
    routing::{get, post, put},
    Router,
};
use futures_util::stream::{self, Stream};
use scrobble_proto::charts::ChartEntry;
use scrobble_proto::lastfm::TopKind;
use scrobble_proto::model::{Entity, TransientPatch};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info};

use crate::core::{Command, CoreEvent, SharedView, StatusView};
use crate::Signal;

#[derive(Clone)]
struct HttpState {
    view: SharedView,
    event_tx: mpsc::Sender<CoreEvent>,
    signal_tx: broadcast::Sender<Signal>,
}

pub fn start_server(
    bind_address: String,
    port: u16,
    view: SharedView,
    event_tx: mpsc::Sender<CoreEvent>,
    signal_tx: broadcast::Sender<Signal>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(view, event_tx, signal_tx);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

fn router(
    view: SharedView,
    event_tx: mpsc::Sender<CoreEvent>,
    signal_tx: broadcast::Sender<Signal>,
) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/friends", get(get_friends))
        .route("/api/friends/:id/transient", put(update_transient))
        .route("/api/charts/:kind", get(get_chart))
        .route("/api/status", get(get_status))
        .route("/api/signals", get(signals))
        .route("/api/focus/:id", post(set_focus).delete(clear_focus))
        .route("/api/preview/hover/:id", post(hover))
        .route("/api/preview/scroll/:id", post(scroll_into_view))
        .route("/api/preview/leave/:id", post(leave))
        .route("/api/visibility/:visible", post(set_visibility))
        .route("/api/resync", post(resync))
        .layer(cors)
        .with_state(HttpState {
            view,
            event_tx,
            signal_tx,
        })
}

async fn forward(state: &HttpState, cmd: Command) -> StatusCode {
    if state.event_tx.send(CoreEvent::Command(cmd)).await.is_err() {
        error!("Failed to forward command: core is gone");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::ACCEPTED
}

async fn get_friends(State(state): State<HttpState>) -> Json<Vec<Entity>> {
    Json(state.view.read().await.entities.clone())
}

async fn get_chart(
    State(state): State<HttpState>,
    Path(kind): Path<String>,
) -> Result<Json<Vec<ChartEntry>>, StatusCode> {
    let kind = TopKind::from_label(&kind).ok_or(StatusCode::NOT_FOUND)?;
    let view = state.view.read().await;
    Ok(Json(view.charts.get(&kind).cloned().unwrap_or_default()))
}

async fn get_status(State(state): State<HttpState>) -> Json<StatusView> {
    Json(state.view.read().await.status.clone())
}

async fn update_transient(
    State(state): State<HttpState>,
    Path(id): Path<String>,
    Json(patch): Json<TransientPatch>,
) -> StatusCode {
    forward(&state, Command::UpdateTransient { id, patch }).await
}

async fn set_focus(State(state): State<HttpState>, Path(id): Path<String>) -> StatusCode {
    info!("HTTP API: focus {}", id);
    forward(&state, Command::Focus(Some(id))).await
}

async fn clear_focus(State(state): State<HttpState>, Path(_id): Path<String>) -> StatusCode {
    forward(&state, Command::Focus(None)).await
}

async fn hover(State(state): State<HttpState>, Path(id): Path<String>) -> StatusCode {
    forward(&state, Command::Hover(id)).await
}

async fn scroll_into_view(State(state): State<HttpState>, Path(id): Path<String>) -> StatusCode {
    forward(&state, Command::ScrollIntoView(id)).await
}

async fn leave(State(state): State<HttpState>, Path(id): Path<String>) -> StatusCode {
    forward(&state, Command::Leave(id)).await
}

async fn set_visibility(State(state): State<HttpState>, Path(visible): Path<bool>) -> StatusCode {
    info!("HTTP API: visibility {}", visible);
    forward(&state, Command::SetVisible(visible)).await
}

async fn resync(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: resync");
    forward(&state, Command::Resync).await
}

/// Server-sent stream of every `Signal`.
async fn signals(
    State(state): State<HttpState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.signal_tx.subscribe();
    let events = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(signal) => {
                    let data = serde_json::to_string(&signal).unwrap_or_default();
                    let event = Event::default().event(signal.name()).data(data);
                    return Some((Ok(event), rx));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("HTTP API: signal subscriber lagged by {}", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ViewState;
    use scrobble_proto::model::PanelState;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    async fn serve() -> (String, mpsc::Receiver<CoreEvent>, SharedView) {
        let view: SharedView = Arc::new(RwLock::new(ViewState::default()));
        let (event_tx, event_rx) = mpsc::channel(8);
        let (signal_tx, _) = broadcast::channel(8);
        let app = router(view.clone(), event_tx, signal_tx);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), event_rx, view)
    }

    #[tokio::test]
    async fn test_friends_reads_published_view() {
        let (base, _rx, view) = serve().await;
        view.write().await.entities = vec![Entity::new("amy"), Entity::new("bob")];

        let body: Vec<Entity> = reqwest::get(format!("{}/api/friends", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body.len(), 2);
        assert_eq!(body[0].id, "amy");
    }

    #[tokio::test]
    async fn test_unknown_chart_is_404() {
        let (base, _rx, _view) = serve().await;
        let resp = reqwest::get(format!("{}/api/charts/genres", base)).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
        let resp = reqwest::get(format!("{}/api/charts/artists", base)).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
    }

    #[tokio::test]
    async fn test_transient_patch_is_forwarded() {
        let (base, mut rx, _view) = serve().await;
        let resp = reqwest::Client::new()
            .put(format!("{}/api/friends/amy/transient", base))
            .json(&serde_json::json!({ "expanded": "expanded", "scroll_offset": 2 }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);

        match rx.recv().await {
            Some(CoreEvent::Command(Command::UpdateTransient { id, patch })) => {
                assert_eq!(id, "amy");
                assert_eq!(patch.expanded, Some(PanelState::Expanded));
                assert_eq!(patch.scroll_offset, Some(2));
                assert_eq!(patch.preview_playing, None);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_visibility_route_parses_bool() {
        let (base, mut rx, _view) = serve().await;
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{}/api/visibility/false", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
        assert!(matches!(
            rx.recv().await,
            Some(CoreEvent::Command(Command::SetVisible(false)))
        ));

        let resp = client
            .post(format!("{}/api/visibility/maybe", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    }
}
