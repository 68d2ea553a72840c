//! Route handlers.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{RawQuery, State};
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::future;
use futures::{SinkExt, StreamExt};

use super::AppState;
use crate::engine::ContainerEngine;
use crate::error::RelayError;
use crate::session::relay::{BrowserSink, BrowserStream};
use crate::session::{ProfileQuery, RelayMessage};

/// Liveness probe.
pub async fn ping(method: Method) -> Response {
    if method != Method::GET {
        return StatusCode::NOT_FOUND.into_response();
    }
    (StatusCode::OK, "pong").into_response()
}

/// Information about the standard engine.
pub async fn info(method: Method, State(state): State<AppState>) -> Response {
    if method != Method::GET {
        return StatusCode::NOT_FOUND.into_response();
    }
    engine_info(state.sessions.engines().standard()).await
}

/// Information about the user-namespaced engine.
pub async fn info_userns(method: Method, State(state): State<AppState>) -> Response {
    if method != Method::GET {
        return StatusCode::NOT_FOUND.into_response();
    }
    engine_info(state.sessions.engines().namespaced()).await
}

async fn engine_info(engine: &Arc<dyn ContainerEngine>) -> Response {
    let info = match engine.info().await {
        Ok(info) => info,
        Err(e) => {
            tracing::error!(endpoint = engine.endpoint(), "getting engine info failed: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    match serde_json::to_string_pretty(&info) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("marshal indent info failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Upgrade to a terminal socket and run one session over it.
pub async fn profiles(
    ws: WebSocketUpgrade,
    RawQuery(query): RawQuery,
    State(state): State<AppState>,
) -> Response {
    // Registered before the upgrade so shutdown cannot miss a pending socket.
    let Some(guard) = state.sessions.tracker().enter() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down").into_response();
    };
    let query = ProfileQuery::from_query_string(query.as_deref().unwrap_or_default());
    ws.on_upgrade(move |socket| async move {
        let (tx, rx) = browser_channel(socket);
        let outcome = state.sessions.serve(&query, tx, rx).await;
        tracing::debug!(?outcome, "Terminal socket finished");
        drop(guard);
    })
}

/// Split a socket into relay-message halves. Outgoing messages are sent as
/// JSON text frames; incoming text or binary frames are decoded as JSON and
/// a close frame ends the stream.
pub fn browser_channel(socket: WebSocket) -> (impl BrowserSink, impl BrowserStream) {
    let (sink, stream) = socket.split();

    let tx = sink
        .sink_map_err(|e| RelayError::Transport(e.to_string()))
        .with(|message: RelayMessage| {
            future::ready(
                message
                    .to_json()
                    .map(|json| Message::Text(json.into()))
                    .map_err(RelayError::from),
            )
        });

    let rx = stream
        .take_while(|frame| future::ready(!matches!(frame, Ok(Message::Close(_)))))
        .filter_map(|frame| future::ready(decode_frame(frame)));

    (tx, rx)
}

fn decode_frame(frame: Result<Message, axum::Error>) -> Option<Result<RelayMessage, RelayError>> {
    match frame {
        Ok(Message::Text(text)) => Some(RelayMessage::from_json(text.as_str()).map_err(Into::into)),
        Ok(Message::Binary(data)) => Some(serde_json::from_slice(&data).map_err(Into::into)),
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Close(_)) => None,
        Err(e) => Some(Err(RelayError::Transport(e.to_string()))),
    }
}
