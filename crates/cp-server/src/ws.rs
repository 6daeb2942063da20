//! The WebSocket wire surface: upgrades a connection, decodes
//! [`ClientMessage`] frames, dispatches them to the [`cp_collab::Gateway`],
//! and relays outbound [`ServerMessage`]s back over the socket. Cross-node
//! fan-out (each node subscribes to `collab:sync:<document_id>`) is wired
//! in here: the first client to register a document on this node spawns
//! the Redis subscriber for it.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use cp_base::{DocumentId, UserId};
use cp_collab::{ClientId, ClientMessage, CollabError, ServerMessage};
use cp_ot::OperationBatch;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};

use crate::state::AppState;

/// WebSocket upgrades can't set an `Authorization` header, so the bearer
/// token travels as a query parameter instead; verified the same way as
/// every HTTP request.
#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: String,
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsAuthQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    match state.token_verifier.verify(&query.token).await {
        Ok(principal) => ws.on_upgrade(move |socket| handle_socket(socket, state, principal.user_id)),
        Err(_) => (StatusCode::UNAUTHORIZED, "invalid or expired token").into_response(),
    }
}

/// Spawns the cross-node Redis subscriber for `document_id` the first
/// time this node sees a client register to it, feeding decoded
/// `OperationBatch`es straight into `Gateway::apply_remote_batch`.
fn ensure_cross_node_sync(state: &AppState, document_id: &DocumentId) {
    let Some(sync) = &state.sync else { return };
    if !state.synced_documents.insert(document_id.clone()) {
        return;
    }
    let (tx, mut rx) = unbounded_channel();
    sync.spawn_subscriber(document_id.clone(), tx);

    let gateway = state.gateway.clone();
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let batch: OperationBatch = match serde_json::from_value(envelope.payload) {
                Ok(batch) => batch,
                Err(err) => {
                    tracing::warn!(%err, "dropping malformed cross-node sync envelope");
                    continue;
                }
            };
            if let Err(err) = gateway.apply_remote_batch(batch) {
                tracing::warn!(%err, "failed to apply cross-node batch");
            }
        }
    });
}

/// Registration state threaded through the per-connection dispatch loop.
/// A client must `register` before anything else is meaningful.
#[derive(Default)]
struct Session {
    client_id: Option<ClientId>,
    document_id: Option<DocumentId>,
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: UserId) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = unbounded_channel::<ServerMessage>();

    let mut forward_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&message) else { continue };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session::default();

    loop {
        tokio::select! {
            _ = &mut forward_task => break,
            incoming = stream.next() => {
                let Some(Ok(message)) = incoming else { break };
                let Message::Text(text) = message else { continue };

                let reply = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_message) => dispatch(&state, client_message, user_id, &mut session, &tx).await,
                    Err(_) => Err(ServerMessage::Error {
                        code: "VALIDATION".to_string(),
                        message: "malformed message".to_string(),
                        retry_after: None,
                    }),
                };
                match reply {
                    Ok(Some(message)) => {
                        let _ = tx.send(message);
                    }
                    Ok(None) => {}
                    Err(error) => {
                        let _ = tx.send(error);
                    }
                }
            }
        }
    }

    if let Some(client_id) = session.client_id {
        state.gateway.disconnect(client_id);
    }
}

/// Dispatches one decoded [`ClientMessage`]. Returns `Ok(Some(reply))`
/// when the sender itself should be told something directly (`register`,
/// `operation`'s `ack`, `sync`, `heartbeat`); peer broadcast is already
/// handled inside the gateway call. `Ok(None)` covers messages with no
/// direct reply (`cursor`).
async fn dispatch(
    state: &AppState,
    message: ClientMessage,
    user_id: UserId,
    session: &mut Session,
    tx: &UnboundedSender<ServerMessage>,
) -> Result<Option<ServerMessage>, ServerMessage> {
    if let ClientMessage::Register { document_id, user_name } = message {
        ensure_cross_node_sync(state, &document_id);
        let (client_id, reply) =
            state.gateway.register(user_id, document_id.clone(), user_name, tx.clone()).map_err(to_error_frame)?;
        session.client_id = Some(client_id);
        session.document_id = Some(document_id);
        return Ok(Some(reply));
    }

    let Some(client_id) = session.client_id else {
        return Err(ServerMessage::Error {
            code: "VALIDATION".to_string(),
            message: "register a document before sending other messages".to_string(),
            retry_after: None,
        });
    };
    let document_id = session.document_id.clone().expect("client_id implies document_id is set");

    match message {
        ClientMessage::Register { .. } => unreachable!("handled above"),
        ClientMessage::Operation { version, operations } => state
            .gateway
            .handle_operation(client_id, user_id, document_id, version, operations)
            .await
            .map(Some)
            .map_err(to_error_frame),
        ClientMessage::Cursor { position, selection } => {
            state.gateway.handle_cursor(client_id, user_id, document_id, position, selection).map_err(to_error_frame)?;
            Ok(None)
        }
        ClientMessage::PresenceJoin | ClientMessage::PresenceLeave => Ok(None),
        ClientMessage::Sync { version } => {
            state.gateway.handle_sync(&document_id, version).map(Some).map_err(to_error_frame)
        }
        ClientMessage::Heartbeat => Ok(Some(state.gateway.handle_heartbeat(&document_id, client_id))),
    }
}

fn to_error_frame(err: CollabError) -> ServerMessage {
    let retry_after = match &err {
        CollabError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
        _ => None,
    };
    let code = match &err {
        CollabError::CircuitOpen => "CIRCUIT_OPEN",
        CollabError::RateLimited { .. } => "RATE_LIMITED",
        CollabError::Ot(_) => "OT_CONFLICT",
        CollabError::MalformedMessage { .. } => "VALIDATION",
        CollabError::ConnectionNotFound { .. } | CollabError::NotInDocument { .. } => "NOT_FOUND",
        CollabError::Redis(_) => "SYNC_UNAVAILABLE",
    };
    ServerMessage::Error { code: code.to_string(), message: err.to_string(), retry_after }
}
