use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::registry::MemberHandle;
use crate::state::AppState;
use crate::ws::{ClientEnvelope, ServerEnvelope};

/// Per-connection session state
#[derive(Debug)]
pub struct WsSession {
    pub conn_id: String,
    pub display_name: String,
    pub room: Option<String>,
    sender: mpsc::UnboundedSender<ServerEnvelope>,
}

impl WsSession {
    pub fn new(conn_id: String, sender: mpsc::UnboundedSender<ServerEnvelope>) -> Self {
        Self {
            conn_id,
            display_name: String::new(),
            room: None,
            sender,
        }
    }

    fn send(&self, env: ServerEnvelope) {
        let _ = self.sender.send(env);
    }
}

/// WebSocket routes
pub fn ws_routes() -> Router<AppState> {
    Router::new().route("/ws", get(ws_upgrade))
}

/// WebSocket upgrade handler
async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id = Uuid::new_v4().to_string();

    tracing::info!(conn_id = %conn_id, "WebSocket connected");

    // Channel for pushing envelopes to this client
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEnvelope>();
    let mut session = WsSession::new(conn_id.clone(), tx);

    // Split socket into sender and receiver
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Task for sending envelopes to the client
    let send_task = tokio::spawn(async move {
        while let Some(env) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&env) {
                if ws_sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
    });

    // Process incoming envelopes
    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientEnvelope>(&text) {
                Ok(env) => handle_envelope(env, &mut session, &state),
                Err(e) => {
                    // Closed union: anything that does not parse is dropped here.
                    tracing::warn!(conn_id = %conn_id, error = %e, "Malformed envelope dropped");
                }
            },
            Ok(Message::Ping(_)) => {
                tracing::trace!(conn_id = %conn_id, "Ping received");
            }
            Ok(Message::Close(_)) => {
                tracing::info!(conn_id = %conn_id, "WebSocket close received");
                break;
            }
            Err(e) => {
                tracing::error!(conn_id = %conn_id, error = %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }

    tracing::info!(conn_id = %conn_id, "WebSocket disconnected, cleaning up");

    // Abrupt-disconnect path: release the room and tell the survivor both
    // that the user left and that any call with them is over.
    if let Some(room) = session.room.take() {
        let departed = state.registry.leave(&room, &conn_id);
        state.registry.broadcast(
            &room,
            ServerEnvelope::UserLeft {
                id: conn_id.clone(),
                display_name: departed
                    .map(|m| m.display_name)
                    .unwrap_or_else(|| session.display_name.clone()),
            },
            None,
        );
        state.registry.broadcast(
            &room,
            ServerEnvelope::CallEnded {
                from: conn_id.clone(),
            },
            None,
        );
    }

    send_task.abort();
}

/// Dispatch one client envelope.
///
/// The router is content-agnostic: signaling payloads are relayed to the
/// addressed member untouched, chat is stamped and broadcast. Only
/// addressing is validated here, never payload semantics.
pub fn handle_envelope(env: ClientEnvelope, session: &mut WsSession, state: &AppState) {
    match env {
        ClientEnvelope::RoomJoin { room, display_name } => {
            handle_join(room, display_name, session, state)
        }
        ClientEnvelope::Leave => handle_leave(session, state),
        ClientEnvelope::Chat { text } => handle_chat(text, session, state),
        ClientEnvelope::Offer { to, sdp } => {
            let env = ServerEnvelope::CallIncoming {
                from: session.conn_id.clone(),
                sdp,
                display_name: session.display_name.clone(),
            };
            relay(session, state, &to, env);
        }
        ClientEnvelope::Answer { to, sdp } => {
            let env = ServerEnvelope::CallAccepted {
                from: session.conn_id.clone(),
                sdp,
                display_name: session.display_name.clone(),
            };
            relay(session, state, &to, env);
        }
        ClientEnvelope::Candidate { to, candidate } => {
            let env = ServerEnvelope::IceCandidate {
                from: session.conn_id.clone(),
                candidate,
            };
            relay(session, state, &to, env);
        }
        ClientEnvelope::CallEnd { to } => {
            let env = ServerEnvelope::CallEnded {
                from: session.conn_id.clone(),
            };
            relay(session, state, &to, env);
        }
        ClientEnvelope::Ping => session.send(ServerEnvelope::Pong),
    }
}

/// Handle room:join
fn handle_join(room: String, display_name: String, session: &mut WsSession, state: &AppState) {
    if session.room.is_some() {
        session.send(ServerEnvelope::error(400, "Already in a room"));
        return;
    }

    let display_str = display_name.trim();
    if display_str.is_empty() {
        session.send(ServerEnvelope::error(400, "Display name is required"));
        return;
    }
    if display_str.len() > 100 {
        session.send(ServerEnvelope::error(
            400,
            "Display name must be at most 100 characters",
        ));
        return;
    }

    let room_id = room.trim().to_string();
    let member = MemberHandle::new(
        session.conn_id.clone(),
        display_str.to_string(),
        session.sender.clone(),
    );

    match state.registry.join(&room_id, member) {
        Ok(members) => {
            session.room = Some(room_id.clone());
            session.display_name = display_str.to_string();

            session.send(ServerEnvelope::RoomJoined {
                room: room_id.clone(),
                you: session.conn_id.clone(),
                members,
                ice_servers: state.ice.servers(),
            });

            state.registry.broadcast(
                &room_id,
                ServerEnvelope::UserJoined {
                    id: session.conn_id.clone(),
                    display_name: display_str.to_string(),
                },
                Some(&session.conn_id),
            );

            tracing::info!(
                room_id = %room_id,
                conn_id = %session.conn_id,
                display_name = %display_str,
                "User joined room via signaling"
            );
        }
        Err(crate::error::AppError::RoomFull) => {
            tracing::info!(room_id = %room_id, conn_id = %session.conn_id, "Join rejected, room full");
            session.send(ServerEnvelope::RoomFull {
                room: room_id,
                reason: "Room is full".to_string(),
            });
        }
        Err(e) => {
            session.send(ServerEnvelope::error(400, &e.to_string()));
        }
    }
}

/// Handle room:leave
fn handle_leave(session: &mut WsSession, state: &AppState) {
    let Some(room) = session.room.take() else {
        return;
    };

    state.registry.leave(&room, &session.conn_id);
    state.registry.broadcast(
        &room,
        ServerEnvelope::UserLeft {
            id: session.conn_id.clone(),
            display_name: session.display_name.clone(),
        },
        None,
    );

    session.display_name.clear();
}

/// Handle chat:message: stamp, store, broadcast to all members including
/// the sender so local echo matches the remote view.
fn handle_chat(text: String, session: &WsSession, state: &AppState) {
    let Some(room) = &session.room else {
        session.send(ServerEnvelope::error(400, "Not in a room"));
        return;
    };

    let text = text.trim().to_string();
    if text.is_empty() {
        return;
    }

    if let Some(msg) = state.registry.append_chat(room, &session.display_name, text) {
        state.registry.broadcast(room, ServerEnvelope::Chat(msg), None);
    }
}

/// Unicast a signaling envelope to the addressed member of the sender's
/// room. Unreachable targets are a silent drop: signaling is best-effort,
/// at-most-once.
fn relay(session: &WsSession, state: &AppState, to: &str, env: ServerEnvelope) {
    let Some(room) = &session.room else {
        tracing::debug!(conn_id = %session.conn_id, "Signal from roomless connection dropped");
        return;
    };

    if !state.registry.unicast(room, to, env) {
        tracing::debug!(
            room_id = %room,
            from = %session.conn_id,
            to = %to,
            "Signal target unreachable, dropped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ws::CandidateInit;

    fn test_state() -> AppState {
        AppState::new(Config {
            server_host: "localhost".to_string(),
            server_port: 8080,
            stun_server: "stun:stun.example.org:3478".to_string(),
            turn_server: None,
            turn_username: None,
            turn_credential: None,
            call_debounce_ms: 500,
            chat_history_limit: 500,
        })
    }

    fn connect(conn_id: &str) -> (WsSession, mpsc::UnboundedReceiver<ServerEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (WsSession::new(conn_id.to_string(), tx), rx)
    }

    fn join(session: &mut WsSession, state: &AppState, room: &str, display: &str) {
        handle_envelope(
            ClientEnvelope::RoomJoin {
                room: room.to_string(),
                display_name: display.to_string(),
            },
            session,
            state,
        );
    }

    #[tokio::test]
    async fn test_join_sequencing() {
        let state = test_state();
        let (mut p1, mut rx1) = connect("p1");
        let (mut p2, mut rx2) = connect("p2");

        join(&mut p1, &state, "r1", "Alice");
        match rx1.try_recv().unwrap() {
            ServerEnvelope::RoomJoined { members, you, .. } => {
                assert_eq!(you, "p1");
                assert_eq!(members.len(), 1);
            }
            other => panic!("expected room:joined, got {:?}", other),
        }

        join(&mut p2, &state, "r1", "Bob");
        match rx2.try_recv().unwrap() {
            ServerEnvelope::RoomJoined { members, .. } => {
                assert_eq!(members.len(), 2);
                assert_eq!(members[0].id, "p1");
                assert_eq!(members[1].id, "p2");
            }
            other => panic!("expected room:joined, got {:?}", other),
        }
        match rx1.try_recv().unwrap() {
            ServerEnvelope::UserJoined { id, display_name } => {
                assert_eq!(id, "p2");
                assert_eq!(display_name, "Bob");
            }
            other => panic!("expected user:joined, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_third_join_gets_room_full() {
        let state = test_state();
        let (mut p1, _rx1) = connect("p1");
        let (mut p2, _rx2) = connect("p2");
        let (mut p3, mut rx3) = connect("p3");

        join(&mut p1, &state, "r1", "Alice");
        join(&mut p2, &state, "r1", "Bob");
        join(&mut p3, &state, "r1", "Carol");

        match rx3.try_recv().unwrap() {
            ServerEnvelope::RoomFull { room, .. } => assert_eq!(room, "r1"),
            other => panic!("expected room:full, got {:?}", other),
        }
        assert!(p3.room.is_none());
        assert_eq!(state.registry.lookup("r1").unwrap().participants_count, 2);
    }

    #[tokio::test]
    async fn test_signal_relay_preserves_order() {
        let state = test_state();
        let (mut p1, _rx1) = connect("p1");
        let (mut p2, mut rx2) = connect("p2");
        join(&mut p1, &state, "r1", "Alice");
        join(&mut p2, &state, "r1", "Bob");
        let _ = rx2.try_recv(); // room:joined

        for i in 0..3 {
            handle_envelope(
                ClientEnvelope::Candidate {
                    to: "p2".to_string(),
                    candidate: CandidateInit {
                        candidate: format!("candidate:{}", i),
                        sdp_mid: None,
                        sdp_mline_index: None,
                    },
                },
                &mut p1,
                &state,
            );
        }

        for i in 0..3 {
            match rx2.try_recv().unwrap() {
                ServerEnvelope::IceCandidate { from, candidate } => {
                    assert_eq!(from, "p1");
                    assert_eq!(candidate.candidate, format!("candidate:{}", i));
                }
                other => panic!("expected ice:candidate, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_signal_to_unreachable_target_is_dropped() {
        let state = test_state();
        let (mut p1, mut rx1) = connect("p1");
        join(&mut p1, &state, "r1", "Alice");
        let _ = rx1.try_recv();

        handle_envelope(
            ClientEnvelope::Offer {
                to: "ghost".to_string(),
                sdp: "v=0".to_string(),
            },
            &mut p1,
            &state,
        );

        // No error surfaces; the sender hears nothing back.
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_chat_echoes_to_sender_and_peer() {
        let state = test_state();
        let (mut p1, mut rx1) = connect("p1");
        let (mut p2, mut rx2) = connect("p2");
        join(&mut p1, &state, "r1", "Alice");
        join(&mut p2, &state, "r1", "Bob");
        let _ = rx1.try_recv();
        let _ = rx1.try_recv(); // user:joined p2
        let _ = rx2.try_recv();

        handle_envelope(
            ClientEnvelope::Chat {
                text: "hello".to_string(),
            },
            &mut p1,
            &state,
        );

        for rx in [&mut rx1, &mut rx2] {
            match rx.try_recv().unwrap() {
                ServerEnvelope::Chat(msg) => {
                    assert_eq!(msg.sender, "Alice");
                    assert_eq!(msg.text, "hello");
                    assert_eq!(msg.id, 0);
                }
                other => panic!("expected chat:message, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_second_join_is_rejected_while_in_room() {
        let state = test_state();
        let (mut p1, mut rx1) = connect("p1");
        join(&mut p1, &state, "r1", "Alice");
        let _ = rx1.try_recv();

        join(&mut p1, &state, "r2", "Alice");
        match rx1.try_recv().unwrap() {
            ServerEnvelope::Error { code, .. } => assert_eq!(code, 400),
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(p1.room.as_deref(), Some("r1"));
    }
}
