use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use pickline_core::{ClientMessage, Mutation, Role, ServerMessage, SessionId};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::room::{Applied, ClientSeq, Outbound, PackCommand};
use crate::state::AppState;
use crate::telemetry::METRIC_CONNECTIONS;

/// WebSocket upgrade handler
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Session and role this connection holds after a successful join.
#[derive(Debug, Clone, Copy)]
struct Membership {
    session_id: SessionId,
    role: Role,
    client_id: Option<Uuid>,
}

impl Membership {
    fn origin(&self, client_seq: Option<u64>) -> Option<ClientSeq> {
        let client_id = self.client_id?;
        Some(ClientSeq {
            client_id,
            seq: client_seq?,
        })
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let superseded = matches!(msg, ServerMessage::Superseded { .. });
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!(connection = %connection_id, error = %err, "failed to encode frame"),
            }
            if superseded {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        }
        debug!(connection = %connection_id, "writer task ended");
    });

    debug!(connection = %connection_id, "websocket connected");
    let mut membership: Option<Membership> = None;

    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    debug!(connection = %connection_id, "ignoring non-UTF8 binary frame");
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!(connection = %connection_id, error = %err, "websocket error");
                break;
            }
        };

        let message = match serde_json::from_str::<ClientMessage>(&text) {
            Ok(message) => message,
            Err(err) => {
                let error = ApiError::Validation(format!("invalid message format: {err}"));
                let _ = tx.send(error.to_frame(None));
                continue;
            }
        };

        let request_id = message.request_id();
        if let Err(err) =
            handle_client_message(message, connection_id, &mut membership, &state, &tx).await
        {
            let _ = tx.send(err.to_frame(request_id));
        }
    }

    if let Some(Membership {
        session_id, role, ..
    }) = membership
    {
        state.rooms.leave(session_id, role, connection_id).await;
    }
    debug!(connection = %connection_id, "websocket disconnected");
}

async fn handle_client_message(
    message: ClientMessage,
    connection_id: Uuid,
    membership: &mut Option<Membership>,
    state: &AppState,
    tx: &Outbound,
) -> Result<(), ApiError> {
    let joined = match (message, *membership) {
        (ClientMessage::Ping, _) => {
            let _ = tx.send(ServerMessage::Pong);
            return Ok(());
        }
        (
            ClientMessage::JoinSession {
                session_id,
                role,
                token,
                client_id,
            },
            previous,
        ) => {
            let session_id = resolve_join(state, session_id, role, token.as_deref()).await?;
            if let Some(previous) = previous {
                state
                    .rooms
                    .leave(previous.session_id, previous.role, connection_id)
                    .await;
                *membership = None;
            }
            state
                .rooms
                .join_client(session_id, role, connection_id, client_id, tx.clone())
                .await?;
            counter!(METRIC_CONNECTIONS, 1, "role" => role.as_str());
            info!(session = %session_id, %role, connection = %connection_id, "websocket joined session");
            *membership = Some(Membership {
                session_id,
                role,
                client_id,
            });
            return Ok(());
        }
        (_, None) => {
            return Err(ApiError::Validation(
                "join_session must be sent before any other request".into(),
            ))
        }
        (message, Some(joined)) => (message, joined),
    };

    let (message, joined) = joined;
    let Membership {
        session_id, role, ..
    } = joined;
    let outcome = match message {
        ClientMessage::UpdateItemStatus {
            order_item_id,
            action,
            request_id,
            client_seq,
        } => {
            let mutation = Mutation::Item {
                item_id: order_item_id,
                action,
            };
            state
                .rooms
                .mutate_from(session_id, role, mutation, request_id, joined.origin(client_seq))
                .await?
        }
        ClientMessage::MarkOrderPacked {
            order_id,
            packaging_material_id,
            weight,
            send_email,
            request_id,
            client_seq,
        } => {
            let pack = PackCommand {
                order_id,
                packaging_material_id,
                weight,
                send_email,
            };
            state
                .rooms
                .pack_from(session_id, role, pack, request_id, joined.origin(client_seq))
                .await?
        }
        ClientMessage::NavigateOrder {
            order_id,
            request_id,
            client_seq,
        } => {
            let navigate = Mutation::Navigate { order_id };
            state
                .rooms
                .mutate_from(session_id, role, navigate, request_id, joined.origin(client_seq))
                .await?
        }
        ClientMessage::Resync => {
            return state.rooms.resync(session_id, connection_id).await;
        }
        ClientMessage::Ping | ClientMessage::JoinSession { .. } => return Ok(()),
    };

    // Applied events reach the requester through the room broadcast.
    if let Applied::Duplicate(request_id) = outcome {
        let _ = tx.send(ServerMessage::Acknowledged { request_id });
    }
    Ok(())
}

/// Desktops name their session; mobiles present a pairing token and may
/// omit it.
async fn resolve_join(
    state: &AppState,
    session_id: Option<SessionId>,
    role: Role,
    token: Option<&str>,
) -> Result<SessionId, ApiError> {
    match (role, token, session_id) {
        (Role::Mobile, Some(token), Some(session_id)) => {
            state.pairing.redeem_for(token, session_id).await?;
            Ok(session_id)
        }
        (Role::Mobile, Some(token), None) => Ok(state.pairing.redeem(token).await?),
        (Role::Mobile, None, _) => Err(ApiError::Validation(
            "mobile clients must present a pairing token".into(),
        )),
        (Role::Desktop, _, Some(session_id)) => Ok(session_id),
        (Role::Desktop, _, None) => Err(ApiError::Validation(
            "desktop clients must name a session".into(),
        )),
    }
}
