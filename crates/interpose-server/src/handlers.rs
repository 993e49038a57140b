//! API route handlers.

use axum::body::Bytes;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::stream::{self, Stream};
use interpose_core::{ProxyState, StateEvent};
use tracing::{debug, info};

use crate::error::{ApiError, Result};
use crate::models::{SettingsResponse, StartRequest};
use crate::state::AppState;

/// GET /api/state - Last broadcast proxy state.
pub async fn get_state(State(state): State<AppState>) -> Json<ProxyState> {
    Json(state.coordinator.current_state())
}

/// GET /api/settings - Saved target used to pre-fill START.
pub async fn get_settings(State(state): State<AppState>) -> Json<SettingsResponse> {
    Json(state.coordinator.saved_target().into())
}

/// POST /api/start - Enable redirection. The body is optional.
pub async fn start(State(state): State<AppState>, body: Bytes) -> Result<Json<ProxyState>> {
    let req: StartRequest = if body.iter().all(u8::is_ascii_whitespace) {
        StartRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };

    let action = req.into_action(state.coordinator.saved_target());
    info!(?action, "start requested");
    let new_state = state.coordinator.dispatch(action).await?;
    Ok(Json(new_state))
}

/// POST /api/stop - Disable redirection.
pub async fn stop(State(state): State<AppState>) -> Result<Json<ProxyState>> {
    info!("stop requested");
    Ok(Json(state.coordinator.request_disable().await?))
}

/// POST /api/toggle - Quick toggle. Concurrent toggles run in arrival order
/// and alternate.
pub async fn toggle(State(state): State<AppState>) -> Result<Json<ProxyState>> {
    info!("toggle requested");
    Ok(Json(state.coordinator.request_toggle().await?))
}

/// GET /api/events - Subscription stream as Server-Sent Events.
///
/// The first event is the current snapshot. The stream ends when the
/// coordinator shuts down.
pub async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, axum::Error>>> {
    debug!("event stream attached");
    let subscription = state.coordinator.subscribe();

    let stream = stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        let sse = Event::default().event(event_name(&event)).json_data(&event);
        Some((sse, subscription))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn event_name(event: &StateEvent) -> &'static str {
    match event {
        StateEvent::Snapshot { .. } => "snapshot",
        StateEvent::Progress { .. } => "progress",
        StateEvent::Failed { .. } => "failed",
    }
}
