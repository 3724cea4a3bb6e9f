//! WebSocket upgrade and per-connection handler. Snapshots come from the
//! monitor's cache; only "diagnose" does live I/O. After "subscribe" every
//! newly published snapshot is pushed without being asked for.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::stream::StreamExt;
use tracing::debug;

use crate::state::AppState;

use std::collections::HashMap;
use std::sync::atomic::Ordering;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if let Some(expected) = state.auth_token.as_ref() {
        match q.get("token") {
            Some(t) if t == expected => {}
            _ => return StatusCode::UNAUTHORIZED.into_response(),
        }
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let n = state.client_count.fetch_add(1, Ordering::Relaxed) + 1;
    debug!("ws client connected ({n} total)");

    // Decrement on disconnect (drop).
    struct ClientGuard(AppState);
    impl Drop for ClientGuard {
        fn drop(&mut self) {
            self.0.client_count.fetch_sub(1, Ordering::Relaxed);
        }
    }
    let _guard = ClientGuard(state.clone());

    let mut rx = state.monitor.subscribe();
    let mut push = false;

    loop {
        let reply = tokio::select! {
            msg = socket.next() => match msg {
                Some(Ok(Message::Text(text))) => match text.as_str() {
                    "get_snapshot" => serde_json::to_string(&*state.monitor.get_snapshot()),
                    "diagnose" => {
                        serde_json::to_string(&state.monitor.request_diagnosis_now().await)
                    }
                    "subscribe" => {
                        push = true;
                        let current = rx.borrow_and_update().clone();
                        serde_json::to_string(&*current)
                    }
                    "unsubscribe" => {
                        push = false;
                        continue;
                    }
                    _ => continue,
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            },
            changed = rx.changed(), if push => {
                if changed.is_err() {
                    // monitor dropped; nothing more will be published
                    push = false;
                    continue;
                }
                let snapshot = rx.borrow_and_update().clone();
                serde_json::to_string(&*snapshot)
            }
        };
        match reply {
            Ok(js) => {
                if socket.send(Message::Text(js)).await.is_err() {
                    break;
                }
            }
            Err(e) => debug!("ws reply not serializable: {e}"),
        }
    }
}
