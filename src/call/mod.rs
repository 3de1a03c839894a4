use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use crate::models::{ChatMessage, ParticipantInfo};
use crate::peer::{
    is_offerer, MediaConstraints, MediaProvider, MediaTrack, NegotiationCoordinator, PeerError,
    TrackKind, TransportFactory,
};
use crate::ws::{CandidateInit, ClientEnvelope, ServerEnvelope};

/// Local commands accepted by the controller loop.
#[derive(Debug)]
pub enum Command {
    /// Join a room by id under a display name.
    Join { room: String, display_name: String },
    /// Send a chat line to the room.
    SendChat(String),
    /// Add a local track mid-call and renegotiate.
    AddTrack(MediaTrack),
    /// Mute or unmute a local track kind.
    SetTrackEnabled { kind: TrackKind, enabled: bool },
    /// Hang up the current call.
    HangUp,
    /// Hang up and stop the loop.
    Shutdown,
    /// Debounced auto-call firing; stale generations are discarded.
    AutoCall { generation: u64 },
}

/// Notifications for UI observers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    PeerJoined(ParticipantInfo),
    PeerLeft { id: String },
    JoinRejected { room: String, reason: String },
    ChatReceived(ChatMessage),
    CallEnded,
}

/// Client-side session orchestrator.
///
/// Owns the negotiation coordinator and runs the single event loop that
/// serializes server envelopes, local commands and discovered candidates.
/// Role arbitration happens here: on learning of a peer, the total-order
/// smaller connection id schedules a debounced auto-call; the other side
/// waits for the incoming offer.
pub struct CallSessionController {
    coordinator: NegotiationCoordinator,

    room: Option<String>,
    local_id: Option<String>,
    peer: Option<ParticipantInfo>,

    chat: Vec<ChatMessage>,
    seen_chat_ids: HashSet<u64>,
    ended: bool,

    debounce: Duration,
    outbound: mpsc::UnboundedSender<ClientEnvelope>,
    events: broadcast::Sender<SessionEvent>,

    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: Option<mpsc::UnboundedReceiver<Command>>,
    cand_rx: Option<mpsc::UnboundedReceiver<CandidateInit>>,
}

impl CallSessionController {
    pub async fn new(
        factory: Arc<dyn TransportFactory>,
        media: Arc<dyn MediaProvider>,
        constraints: MediaConstraints,
        outbound: mpsc::UnboundedSender<ClientEnvelope>,
        debounce: Duration,
    ) -> Result<Self, PeerError> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (cand_tx, cand_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(32);

        let coordinator = NegotiationCoordinator::new(
            factory,
            media,
            constraints,
            outbound.clone(),
            cand_tx,
        )
        .await?;

        Ok(Self {
            coordinator,
            room: None,
            local_id: None,
            peer: None,
            chat: Vec::new(),
            seen_chat_ids: HashSet::new(),
            ended: false,
            debounce,
            outbound,
            events,
            cmd_tx,
            cmd_rx: Some(cmd_rx),
            cand_rx: Some(cand_rx),
        })
    }

    pub fn commands(&self) -> mpsc::UnboundedSender<Command> {
        self.cmd_tx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn peer(&self) -> Option<&ParticipantInfo> {
        self.peer.as_ref()
    }

    pub fn chat(&self) -> &[ChatMessage] {
        &self.chat
    }

    /// Drive the session until the signaling connection drops or a
    /// `Shutdown` command arrives.
    pub async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<ServerEnvelope>) {
        let mut commands = self.cmd_rx.take().expect("run called twice");
        let mut candidates = self.cand_rx.take().expect("run called twice");

        loop {
            tokio::select! {
                maybe = inbound.recv() => match maybe {
                    Some(env) => self.handle_server_envelope(env).await,
                    None => {
                        tracing::info!("Signaling connection closed, stopping session loop");
                        break;
                    }
                },
                Some(cmd) = commands.recv() => {
                    if self.handle_command(cmd).await {
                        break;
                    }
                },
                Some(candidate) = candidates.recv() => {
                    self.forward_local_candidate(candidate);
                },
            }
        }

        self.coordinator.close().await;
    }

    async fn handle_server_envelope(&mut self, env: ServerEnvelope) {
        match env {
            ServerEnvelope::RoomJoined {
                room,
                you,
                members,
                ice_servers: _,
            } => {
                tracing::info!(room = %room, you = %you, members = members.len(), "Joined room");
                self.room = Some(room);
                self.coordinator.set_local_id(&you);
                self.ended = false;

                let peer = members.into_iter().find(|m| m.id != you);
                self.local_id = Some(you);
                if let Some(peer) = peer {
                    self.adopt_peer(peer);
                }
            }
            ServerEnvelope::RoomFull { room, reason } => {
                tracing::warn!(room = %room, reason = %reason, "Join rejected");
                self.emit(SessionEvent::JoinRejected { room, reason });
            }
            ServerEnvelope::UserJoined { id, display_name } => {
                self.adopt_peer(ParticipantInfo { id, display_name });
            }
            ServerEnvelope::UserLeft { id, .. } => {
                self.teardown_remote(&id).await;
            }
            ServerEnvelope::CallEnded { from } => {
                self.teardown_remote(&from).await;
            }
            ServerEnvelope::CallIncoming {
                from,
                sdp,
                display_name,
            } => {
                if self.peer.is_none() {
                    self.peer = Some(ParticipantInfo {
                        id: from.clone(),
                        display_name,
                    });
                    self.ended = false;
                }
                if let Err(e) = self.coordinator.handle_incoming_offer(&from, sdp).await {
                    tracing::warn!(error = %e, from = %from, "Incoming offer failed");
                }
            }
            ServerEnvelope::CallAccepted { from, sdp, .. } => {
                if let Err(e) = self.coordinator.handle_answer(sdp).await {
                    tracing::warn!(error = %e, from = %from, "Answer failed");
                }
            }
            ServerEnvelope::IceCandidate { from: _, candidate } => {
                self.coordinator.handle_remote_candidate(candidate).await;
            }
            ServerEnvelope::Chat(msg) => {
                // Re-deliveries of an already-seen id leave the log unchanged.
                if self.seen_chat_ids.insert(msg.id) {
                    self.chat.push(msg.clone());
                    self.emit(SessionEvent::ChatReceived(msg));
                } else {
                    tracing::debug!(id = msg.id, "Duplicate chat delivery suppressed");
                }
            }
            ServerEnvelope::Error { code, message } => {
                tracing::warn!(code, message = %message, "Server error envelope");
            }
            ServerEnvelope::Pong => {
                tracing::trace!("Pong received");
            }
        }
    }

    /// Returns true when the loop should stop.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Join { room, display_name } => {
                let _ = self
                    .outbound
                    .send(ClientEnvelope::RoomJoin { room, display_name });
                false
            }
            Command::SendChat(text) => {
                let _ = self.outbound.send(ClientEnvelope::Chat { text });
                false
            }
            Command::AddTrack(track) => {
                if let Err(e) = self.coordinator.renegotiate(track).await {
                    tracing::warn!(error = %e, "Renegotiation command failed");
                }
                false
            }
            Command::SetTrackEnabled { kind, enabled } => {
                self.coordinator.set_track_enabled(kind, enabled);
                false
            }
            Command::AutoCall { generation } => {
                if generation != self.coordinator.generation() {
                    tracing::debug!(generation, "Stale auto-call firing discarded");
                    return false;
                }
                if let Err(e) = self.coordinator.initiate_call().await {
                    tracing::warn!(error = %e, "Auto-call failed");
                }
                false
            }
            Command::HangUp => {
                self.end_call().await;
                false
            }
            Command::Shutdown => {
                self.end_call().await;
                true
            }
        }
    }

    /// Record the peer and, when arbitration picks us as the offerer,
    /// schedule the debounced auto-call. The delay gives both sides time
    /// to finish acquiring local media before the offer lands.
    fn adopt_peer(&mut self, peer: ParticipantInfo) {
        tracing::info!(peer = %peer.id, display = %peer.display_name, "Peer present");
        self.coordinator.set_peer(&peer.id);
        self.ended = false;
        self.emit(SessionEvent::PeerJoined(peer.clone()));

        let offerer = match &self.local_id {
            Some(local) => is_offerer(local, &peer.id),
            None => false,
        };
        self.peer = Some(peer);

        if offerer {
            self.schedule_auto_call();
        }
    }

    fn schedule_auto_call(&self) {
        let generation = self.coordinator.generation();
        let tx = self.cmd_tx.clone();
        let delay = self.debounce;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Command::AutoCall { generation });
        });
    }

    /// Full teardown of the remote leg; safe to run twice (the second
    /// arrival of user:left / call:ended finds no matching peer).
    async fn teardown_remote(&mut self, id: &str) {
        let matches = self.peer.as_ref().is_some_and(|p| p.id == id);
        if !matches {
            tracing::debug!(id = %id, "Teardown for unknown peer ignored");
            return;
        }

        tracing::info!(peer = %id, "Remote leg torn down");
        self.peer = None;
        self.coordinator.clear_peer();

        if let Err(e) = self.coordinator.reset().await {
            tracing::warn!(error = %e, "Coordinator reset failed during teardown");
        }

        self.chat.clear();
        self.seen_chat_ids.clear();
        self.emit(SessionEvent::PeerLeft { id: id.to_string() });
    }

    /// Hang up: stop local media, notify the peer once, leave the room,
    /// reset the coordinator and clear transient state. Reentrant: a
    /// second invocation is a silent no-op.
    pub async fn end_call(&mut self) {
        if self.ended {
            tracing::debug!("end_call already performed");
            return;
        }
        self.ended = true;

        self.coordinator.stop_local_media();

        if let Some(peer) = &self.peer {
            let _ = self.outbound.send(ClientEnvelope::CallEnd {
                to: peer.id.clone(),
            });
        }
        if self.room.take().is_some() {
            let _ = self.outbound.send(ClientEnvelope::Leave);
        }

        if let Err(e) = self.coordinator.reset().await {
            tracing::warn!(error = %e, "Coordinator reset failed during hangup");
        }

        self.peer = None;
        self.coordinator.clear_peer();
        self.chat.clear();
        self.seen_chat_ids.clear();

        self.emit(SessionEvent::CallEnded);
        tracing::info!("Call ended");
    }

    fn forward_local_candidate(&self, candidate: CandidateInit) {
        let Some(peer) = &self.peer else {
            tracing::debug!("Local candidate with no peer, dropped");
            return;
        };
        let _ = self.outbound.send(ClientEnvelope::Candidate {
            to: peer.id.clone(),
            candidate,
        });
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::transport::testing::{FakeFactory, FakeMedia};
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    struct Harness {
        controller: CallSessionController,
        factory: Arc<FakeFactory>,
        outbound_rx: mpsc::UnboundedReceiver<ClientEnvelope>,
    }

    impl Harness {
        async fn new() -> Self {
            let factory = Arc::new(FakeFactory::default());
            let media = Arc::new(FakeMedia::default());
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

            let controller = CallSessionController::new(
                factory.clone(),
                media,
                MediaConstraints::default(),
                outbound_tx,
                Duration::from_millis(100),
            )
            .await
            .unwrap();

            Self {
                controller,
                factory,
                outbound_rx,
            }
        }

        fn sent(&mut self) -> Vec<ClientEnvelope> {
            let mut out = Vec::new();
            while let Ok(env) = self.outbound_rx.try_recv() {
                out.push(env);
            }
            out
        }
    }

    fn participant(id: &str) -> ParticipantInfo {
        ParticipantInfo {
            id: id.to_string(),
            display_name: format!("user-{}", id),
        }
    }

    fn joined(you: &str, members: Vec<ParticipantInfo>) -> ServerEnvelope {
        ServerEnvelope::RoomJoined {
            room: "r1".to_string(),
            you: you.to_string(),
            members,
            ice_servers: Vec::new(),
        }
    }

    fn chat_msg(id: u64, text: &str) -> ServerEnvelope {
        ServerEnvelope::Chat(ChatMessage {
            id,
            sender: "Bob".to_string(),
            text: text.to_string(),
            timestamp: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_end_call_is_idempotent() {
        let mut h = Harness::new().await;
        h.controller
            .handle_server_envelope(joined("aaa", vec![participant("aaa"), participant("zzz")]))
            .await;
        let _ = h.sent();

        h.controller.end_call().await;
        h.controller.end_call().await;

        let ends: Vec<_> = h
            .sent()
            .into_iter()
            .filter(|e| matches!(e, ClientEnvelope::CallEnd { .. }))
            .collect();
        assert_eq!(ends.len(), 1);
    }

    #[tokio::test]
    async fn test_chat_is_deduplicated_by_id() {
        let mut h = Harness::new().await;
        h.controller
            .handle_server_envelope(joined("aaa", vec![participant("aaa")]))
            .await;

        h.controller.handle_server_envelope(chat_msg(0, "hello")).await;
        h.controller.handle_server_envelope(chat_msg(0, "hello")).await;
        h.controller.handle_server_envelope(chat_msg(1, "world")).await;

        assert_eq!(h.controller.chat().len(), 2);
        assert_eq!(h.controller.chat()[0].text, "hello");
        assert_eq!(h.controller.chat()[1].text, "world");
    }

    #[tokio::test]
    async fn test_remote_departure_resets_and_clears() {
        let mut h = Harness::new().await;
        h.controller
            .handle_server_envelope(joined("zzz", vec![participant("aaa"), participant("zzz")]))
            .await;
        h.controller.handle_server_envelope(chat_msg(0, "hi")).await;
        assert_eq!(h.controller.chat().len(), 1);

        h.controller
            .handle_server_envelope(ServerEnvelope::UserLeft {
                id: "aaa".to_string(),
                display_name: "user-aaa".to_string(),
            })
            .await;

        assert!(h.controller.peer().is_none());
        assert!(h.controller.chat().is_empty());
        // Reset published a fresh transport.
        assert_eq!(h.factory.created_count(), 2);

        // The trailing call:ended for the same peer is a no-op.
        h.controller
            .handle_server_envelope(ServerEnvelope::CallEnded {
                from: "aaa".to_string(),
            })
            .await;
        assert_eq!(h.factory.created_count(), 2);
    }

    #[tokio::test]
    async fn test_room_full_surfaces_rejection() {
        let h = Harness::new().await;
        let mut events = h.controller.subscribe();
        let mut h = h;

        h.controller
            .handle_server_envelope(ServerEnvelope::RoomFull {
                room: "r1".to_string(),
                reason: "Room is full".to_string(),
            })
            .await;

        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::JoinRejected { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_offerer_auto_calls_after_debounce() {
        let mut h = Harness::new().await;
        let commands = h.controller.commands();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let factory = h.factory.clone();
        tokio::spawn(h.controller.run(inbound_rx));

        // Smaller id with a peer already present: we are the offerer.
        inbound_tx
            .send(joined("aaa", vec![participant("aaa"), participant("zzz")]))
            .unwrap();

        // Debounce elapses (auto-advanced), the offer goes out.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut saw_offer = false;
        while let Ok(env) = h.outbound_rx.try_recv() {
            if let ClientEnvelope::Offer { to, .. } = env {
                assert_eq!(to, "zzz");
                saw_offer = true;
            }
        }
        assert!(saw_offer);
        assert_eq!(factory.created_count(), 1);

        let _ = commands.send(Command::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_offerer_waits_for_incoming_offer() {
        let mut h = Harness::new().await;
        let commands = h.controller.commands();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(h.controller.run(inbound_rx));

        // Larger id: the other side dials.
        inbound_tx
            .send(joined("zzz", vec![participant("aaa"), participant("zzz")]))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let outbound: Vec<_> = {
            let mut out = Vec::new();
            while let Ok(env) = h.outbound_rx.try_recv() {
                out.push(env);
            }
            out
        };
        assert!(
            !outbound
                .iter()
                .any(|e| matches!(e, ClientEnvelope::Offer { .. })),
            "non-offerer must not dial"
        );

        // The incoming offer is answered.
        inbound_tx
            .send(ServerEnvelope::CallIncoming {
                from: "aaa".to_string(),
                sdp: "v=0 offer".to_string(),
                display_name: "user-aaa".to_string(),
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut saw_answer = false;
        while let Ok(env) = h.outbound_rx.try_recv() {
            if let ClientEnvelope::Answer { to, .. } = env {
                assert_eq!(to, "aaa");
                saw_answer = true;
            }
        }
        assert!(saw_answer);

        let _ = commands.send(Command::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_auto_call_after_reset_is_discarded() {
        let mut h = Harness::new().await;
        h.controller
            .handle_server_envelope(joined("aaa", vec![participant("aaa"), participant("zzz")]))
            .await;
        let _ = h.sent();

        // The peer vanishes before the debounce fires; the teardown reset
        // bumps the generation, so the scheduled firing is now stale.
        h.controller
            .handle_server_envelope(ServerEnvelope::UserLeft {
                id: "zzz".to_string(),
                display_name: "user-zzz".to_string(),
            })
            .await;

        h.controller
            .handle_command(Command::AutoCall { generation: 0 })
            .await;

        assert!(
            !h.sent()
                .iter()
                .any(|e| matches!(e, ClientEnvelope::Offer { .. })),
            "stale auto-call must not dial"
        );
    }

    #[tokio::test]
    async fn test_local_candidates_are_addressed_to_peer() {
        let mut h = Harness::new().await;
        h.controller
            .handle_server_envelope(joined("aaa", vec![participant("aaa"), participant("zzz")]))
            .await;
        let _ = h.sent();

        h.controller.forward_local_candidate(CandidateInit {
            candidate: "candidate:1".to_string(),
            sdp_mid: None,
            sdp_mline_index: None,
        });

        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert!(
            matches!(&sent[0], ClientEnvelope::Candidate { to, .. } if to == "zzz")
        );
    }
}
