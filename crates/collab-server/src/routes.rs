//! HTTP surface of the relay.
//!
//! - `POST <base>?roomId=..` with a text body publishes one frame
//! - `GET <base>?roomId=..` opens an SSE stream of the room's frames
//! - `GET /healthz` reports registry counters

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use collab_core::{Delivery, Frame, RoomId};
use futures::{Stream, StreamExt, stream};
use serde::Deserialize;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct RoomQuery {
    #[serde(rename = "roomId")]
    pub room_id: Option<String>,
}

impl RoomQuery {
    fn room(&self) -> Result<RoomId, Response> {
        let raw = self.room_id.as_deref().unwrap_or_default();
        RoomId::new(raw).map_err(|_| bad_request("missing roomId"))
    }
}

fn bad_request(reason: &'static str) -> Response {
    (StatusCode::BAD_REQUEST, reason).into_response()
}

/// Publish handler: forward the body to every subscriber of the room
pub async fn publish(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RoomQuery>,
    body: String,
) -> Response {
    let room = match query.room() {
        Ok(room) => room,
        Err(response) => return response,
    };
    if body.is_empty() {
        return bad_request("empty body");
    }

    let len = body.len();
    match state.relay.accept(&room, body) {
        Ok(reached) => {
            tracing::debug!("Published {} bytes to room {} ({} subscribers)", len, room, reached);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) if e.is_client_error() => {
            tracing::debug!("Rejected frame for room {}: {}", room, e);
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        Err(e) => {
            tracing::error!("Failed to relay frame for room {}: {}", room, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Subscribe handler: stream the room's frames as SSE `data:` events
pub async fn subscribe(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RoomQuery>,
) -> Response {
    let room = match query.room() {
        Ok(room) => room,
        Err(response) => return response,
    };

    tracing::debug!("SSE subscriber joined room {}", room);
    let events = room_events(&state, &room);
    let keep_alive = KeepAlive::new().interval(Duration::from_secs(state.config.keep_alive_secs));

    (
        [(header::CACHE_CONTROL, "no-cache")],
        Sse::new(events).keep_alive(keep_alive),
    )
        .into_response()
}

/// Subscribe now and turn the subscription into an event stream.
///
/// The stream owns the subscription, so the room is left as soon as the
/// client disconnects and axum drops the response body.
fn room_events(
    state: &AppState,
    room: &RoomId,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    let (tx, rx) = mpsc::channel::<Frame>(state.config.subscriber_buffer);
    let subscription = state
        .relay
        .registry()
        .subscribe(room, move |frame: &Frame| match tx.try_send(Arc::clone(frame)) {
            Ok(()) => Delivery::Accepted,
            Err(TrySendError::Full(_)) => Delivery::Dropped,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        });

    let frames = stream::unfold((rx, subscription), |(mut rx, subscription)| async move {
        let frame = rx.recv().await?;
        let event = Event::default().data(&*frame);
        Some((Ok(event), (rx, subscription)))
    });

    stream::once(async { Ok(Event::default().comment("connected")) }).chain(frames)
}

/// Health handler: registry counters as JSON
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.relay.registry().stats())
}
