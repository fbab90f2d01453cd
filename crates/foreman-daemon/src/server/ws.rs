//! WebSocket observer connections.
//!
//! On connect an observer gets a `connected` frame and a full snapshot, then
//! every broadcast event in sequence order. An observer that falls behind
//! gets `resync` plus a fresh snapshot in place of the events it lost.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broadcast::{ClientMessage, Envelope, ObserverEvent};

use super::AppState;

type WsSender = SplitSink<WebSocket, Message>;

/// `GET /ws`
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let observer_id = Uuid::new_v4().to_string();
    let hub = state.orchestrator.hub().clone();
    let (mut sender, mut receiver) = socket.split();

    let handle = match hub.subscribe(&observer_id, "websocket") {
        Ok(handle) => handle,
        Err(e) => {
            warn!(observer_id, error = %e, "Observer rejected");
            let _ = send(
                &mut sender,
                &Envelope::direct(ObserverEvent::Error {
                    message: e.to_string(),
                }),
            )
            .await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };
    info!(observer_id, "Observer connected");

    let connected = Envelope::direct(ObserverEvent::Connected {
        observer_id: observer_id.clone(),
        sequence: handle.sequence,
    });
    if send(&mut sender, &connected).await && send_snapshot(&mut sender, &state).await {
        run_connection(&observer_id, &state, handle.events, &mut sender, &mut receiver).await;
    }

    hub.unsubscribe(&observer_id);
    info!(observer_id, "Observer disconnected");
}

async fn run_connection(
    observer_id: &str,
    state: &AppState,
    events: tokio::sync::broadcast::Receiver<Envelope>,
    sender: &mut WsSender,
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
) {
    let hub = state.orchestrator.hub();
    let mut events = BroadcastStream::new(events);
    let mut ping = tokio::time::interval(state.observers.heartbeat_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await;

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(Ok(envelope)) => {
                    if !send(sender, &envelope).await {
                        break;
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                    warn!(observer_id, missed, "Observer lagged, resyncing");
                    let resync = Envelope::direct(ObserverEvent::Resync { missed });
                    if !send(sender, &resync).await || !send_snapshot(sender, state).await {
                        break;
                    }
                }
                None => break,
            },
            message = receiver.next() => {
                let Some(Ok(message)) = message else { break };
                hub.heartbeat(observer_id);
                match message {
                    Message::Text(text) => {
                        if !on_client_message(observer_id, state, sender, text.as_str()).await {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            _ = ping.tick() => {
                if hub.is_stale(observer_id, state.observers.client_timeout) {
                    info!(observer_id, "Observer timed out");
                    break;
                }
                if !send(sender, &Envelope::direct(ObserverEvent::Ping)).await {
                    break;
                }
            }
        }
    }
}

/// Handle one text frame. Returns `false` when the connection is gone.
async fn on_client_message(
    observer_id: &str,
    state: &AppState,
    sender: &mut WsSender,
    text: &str,
) -> bool {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(observer_id, error = %e, "Invalid observer message");
            let reply = Envelope::direct(ObserverEvent::Error {
                message: format!("invalid message: {e}"),
            });
            return send(sender, &reply).await;
        }
    };

    match message {
        ClientMessage::Ping => send(sender, &Envelope::direct(ObserverEvent::Pong)).await,
        ClientMessage::Pong => true,
        ClientMessage::Snapshot => send_snapshot(sender, state).await,
        ClientMessage::Control { action } => {
            info!(observer_id, %action, "Control action from observer");
            state.orchestrator.apply(action).await;
            true
        }
    }
}

async fn send_snapshot(sender: &mut WsSender, state: &AppState) -> bool {
    let event = match state.orchestrator.snapshot().await {
        Ok(snapshot) => ObserverEvent::Snapshot(Box::new(snapshot)),
        Err(e) => ObserverEvent::Error {
            message: format!("snapshot unavailable: {e}"),
        },
    };
    send(sender, &Envelope::direct(event)).await
}

async fn send(sender: &mut WsSender, envelope: &Envelope) -> bool {
    sender
        .send(Message::Text(envelope.to_json().into()))
        .await
        .is_ok()
}
