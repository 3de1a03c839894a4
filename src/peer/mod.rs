pub mod rtc;
pub mod transport;

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::ws::{CandidateInit, ClientEnvelope};

pub use transport::{
    MediaConstraints, MediaError, MediaProvider, MediaStream, MediaTrack, PeerTransport,
    SdpKind, SessionDescription, TrackKind, TransportError, TransportFactory,
};

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("signaling channel closed")]
    SignalingClosed,
}

/// Handshake state of the local side.
///
/// An incoming offer is consumed and answered in one step, so there is no
/// separately observable have-remote-offer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    Closed,
}

/// Local notifications for observers of the coordinator.
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    /// A fresh transport is in place (emitted by `reset`); observers should
    /// resubscribe to anything tied to the old instance.
    Ready,
    /// An offer/answer round completed and the machine is back in `Stable`.
    NegotiationComplete,
}

/// Deterministic role arbitration: for any id pair exactly one side offers.
pub fn is_offerer(local_id: &str, remote_id: &str) -> bool {
    local_id < remote_id
}

/// Per-session handshake state machine.
///
/// Owned by a single event loop; operations are processed one at a time and
/// the guard flags protect against re-entrant triggers across events. The
/// generation counter invalidates delayed results (debounce firings) that
/// straddle a `reset`.
pub struct NegotiationCoordinator {
    local_id: String,
    peer_id: Option<String>,

    state: SignalingState,
    remote_description_set: bool,
    candidate_queue: VecDeque<CandidateInit>,
    has_initiated_call: bool,
    is_processing_call: bool,
    generation: u64,

    tracks_attached: bool,
    local_stream: Option<MediaStream>,
    constraints: MediaConstraints,

    transport: Arc<dyn PeerTransport>,
    factory: Arc<dyn TransportFactory>,
    media: Arc<dyn MediaProvider>,

    outbound: mpsc::UnboundedSender<ClientEnvelope>,
    local_candidates_tx: mpsc::UnboundedSender<CandidateInit>,
    events: broadcast::Sender<CoordinatorEvent>,
}

impl NegotiationCoordinator {
    pub async fn new(
        factory: Arc<dyn TransportFactory>,
        media: Arc<dyn MediaProvider>,
        constraints: MediaConstraints,
        outbound: mpsc::UnboundedSender<ClientEnvelope>,
        local_candidates_tx: mpsc::UnboundedSender<CandidateInit>,
    ) -> Result<Self, PeerError> {
        let transport = factory.create(local_candidates_tx.clone()).await?;
        let (events, _) = broadcast::channel(16);

        Ok(Self {
            local_id: String::new(),
            peer_id: None,
            state: SignalingState::Stable,
            remote_description_set: false,
            candidate_queue: VecDeque::new(),
            has_initiated_call: false,
            is_processing_call: false,
            generation: 0,
            tracks_attached: false,
            local_stream: None,
            constraints,
            transport,
            factory,
            media,
            outbound,
            local_candidates_tx,
            events,
        })
    }

    pub fn set_local_id(&mut self, id: &str) {
        self.local_id = id.to_string();
    }

    pub fn set_peer(&mut self, id: &str) {
        self.peer_id = Some(id.to_string());
    }

    pub fn clear_peer(&mut self) {
        self.peer_id = None;
    }

    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    pub fn state(&self) -> SignalingState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    /// Start an offer round toward the known peer.
    ///
    /// Only the arbitrated offerer role triggers this automatically. Skipped
    /// (not queued) while another round is in flight or after a call has
    /// already been initiated; on failure the flags roll back so a later
    /// trigger can retry.
    pub async fn initiate_call(&mut self) -> Result<(), PeerError> {
        if self.state == SignalingState::Closed {
            tracing::debug!("initiate_call on closed coordinator, skipped");
            return Ok(());
        }
        if self.is_processing_call || self.has_initiated_call {
            tracing::debug!(state = ?self.state, "initiate_call skipped, negotiation already in flight");
            return Ok(());
        }
        let Some(peer) = self.peer_id.clone() else {
            tracing::debug!("initiate_call skipped, no known peer");
            return Ok(());
        };

        self.is_processing_call = true;
        self.has_initiated_call = true;

        let result = self.send_offer_to(&peer).await;

        self.is_processing_call = false;
        if let Err(e) = &result {
            self.has_initiated_call = false;
            self.state = SignalingState::Stable;
            tracing::warn!(error = %e, peer = %peer, "Call initiation failed");
        }

        result
    }

    async fn send_offer_to(&mut self, peer: &str) -> Result<(), PeerError> {
        self.ensure_local_media().await?;

        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(offer.clone()).await?;
        self.state = SignalingState::HaveLocalOffer;

        self.outbound
            .send(ClientEnvelope::Offer {
                to: peer.to_string(),
                sdp: offer.sdp,
            })
            .map_err(|_| PeerError::SignalingClosed)?;

        tracing::info!(peer = %peer, "Offer sent");
        Ok(())
    }

    /// Consume a remote offer and answer it in one step.
    ///
    /// A competing offer while a round is in flight is dropped, never
    /// queued. Glare (both sides in have-local-offer) resolves
    /// deterministically: the smaller id's offer wins; the larger-id side
    /// discards its own offer and answers the incoming one.
    pub async fn handle_incoming_offer(&mut self, from: &str, sdp: String) -> Result<(), PeerError> {
        if self.state == SignalingState::Closed {
            tracing::debug!(from = %from, "Offer on closed coordinator dropped");
            return Ok(());
        }
        if self.is_processing_call {
            tracing::warn!(from = %from, "Competing offer while busy, dropped");
            return Ok(());
        }

        if self.peer_id.is_none() {
            self.peer_id = Some(from.to_string());
        }

        if self.state == SignalingState::HaveLocalOffer {
            if is_offerer(&self.local_id, from) {
                tracing::warn!(from = %from, "Glare: local offer wins, incoming offer dropped");
                return Ok(());
            }
            tracing::warn!(from = %from, "Glare: remote offer wins, discarding local offer");
            // Candidates already queued belong to the incoming offer and
            // must survive the rollback.
            let pending = std::mem::take(&mut self.candidate_queue);
            self.reset().await?;
            self.candidate_queue = pending;
        }

        self.is_processing_call = true;
        let result = self.answer_offer(from, sdp).await;
        self.is_processing_call = false;

        if let Err(e) = &result {
            tracing::warn!(error = %e, from = %from, "Answering incoming offer failed");
        }
        result
    }

    async fn answer_offer(&mut self, from: &str, sdp: String) -> Result<(), PeerError> {
        self.ensure_local_media().await?;

        self.transport
            .set_remote_description(SessionDescription {
                kind: SdpKind::Offer,
                sdp,
            })
            .await?;

        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;

        self.outbound
            .send(ClientEnvelope::Answer {
                to: from.to_string(),
                sdp: answer.sdp,
            })
            .map_err(|_| PeerError::SignalingClosed)?;

        self.remote_description_set = true;
        self.flush_candidate_queue().await;

        let _ = self.events.send(CoordinatorEvent::NegotiationComplete);
        tracing::info!(from = %from, "Answer sent");
        Ok(())
    }

    /// Apply a remote answer to our outstanding offer.
    ///
    /// Valid only in `HaveLocalOffer`; in `Stable` it is an idempotently
    /// ignored duplicate, anywhere else a dropped protocol violation.
    pub async fn handle_answer(&mut self, sdp: String) -> Result<(), PeerError> {
        match self.state {
            SignalingState::Stable => {
                tracing::debug!("Duplicate answer in stable state ignored");
                Ok(())
            }
            SignalingState::Closed => {
                tracing::warn!("Answer on closed coordinator dropped");
                Ok(())
            }
            SignalingState::HaveLocalOffer => {
                let result = self.apply_answer(sdp).await;
                if let Err(e) = &result {
                    tracing::warn!(error = %e, "Applying answer failed");
                }
                result
            }
        }
    }

    async fn apply_answer(&mut self, sdp: String) -> Result<(), PeerError> {
        self.transport
            .set_remote_description(SessionDescription {
                kind: SdpKind::Answer,
                sdp,
            })
            .await?;

        self.remote_description_set = true;
        self.state = SignalingState::Stable;
        self.flush_candidate_queue().await;

        let _ = self.events.send(CoordinatorEvent::NegotiationComplete);
        tracing::info!("Answer applied, negotiation stable");
        Ok(())
    }

    /// Queue or apply a remote network path.
    ///
    /// Candidates arriving before the remote description queue FIFO and
    /// flush exactly when it lands. A candidate the transport rejects fails
    /// locally and is logged, never propagated.
    pub async fn handle_remote_candidate(&mut self, candidate: CandidateInit) {
        if self.state == SignalingState::Closed {
            return;
        }

        if !self.remote_description_set {
            self.candidate_queue.push_back(candidate);
            tracing::debug!(
                queued = self.candidate_queue.len(),
                "Candidate queued until remote description is set"
            );
            return;
        }

        if let Err(e) = self.transport.add_ice_candidate(candidate).await {
            tracing::warn!(error = %e, "Failed to apply remote candidate");
        }
    }

    async fn flush_candidate_queue(&mut self) {
        while let Some(candidate) = self.candidate_queue.pop_front() {
            if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                tracing::warn!(error = %e, "Failed to apply queued candidate");
            }
        }
    }

    /// Add a track mid-call and run a fresh offer round through the same
    /// channel. The side adding a track always re-offers, regardless of
    /// the original role.
    pub async fn renegotiate(&mut self, track: MediaTrack) -> Result<(), PeerError> {
        if self.state == SignalingState::Closed {
            return Ok(());
        }
        if self.is_processing_call {
            tracing::warn!("renegotiate skipped, negotiation in flight");
            return Ok(());
        }
        let Some(peer) = self.peer_id.clone() else {
            tracing::debug!("renegotiate skipped, no known peer");
            return Ok(());
        };

        self.is_processing_call = true;
        let result = self.renegotiate_inner(&peer, track).await;
        self.is_processing_call = false;

        if let Err(e) = &result {
            self.state = SignalingState::Stable;
            tracing::warn!(error = %e, "Renegotiation failed");
        }
        result
    }

    async fn renegotiate_inner(&mut self, peer: &str, track: MediaTrack) -> Result<(), PeerError> {
        self.transport.add_track(&track).await?;
        if let Some(stream) = &mut self.local_stream {
            stream.tracks.push(track);
        }

        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(offer.clone()).await?;
        self.state = SignalingState::HaveLocalOffer;

        self.outbound
            .send(ClientEnvelope::Offer {
                to: peer.to_string(),
                sdp: offer.sdp,
            })
            .map_err(|_| PeerError::SignalingClosed)?;

        tracing::info!(peer = %peer, "Renegotiation offer sent");
        Ok(())
    }

    /// Tear the transport down and publish a fresh idle instance.
    ///
    /// The old transport is fully decommissioned (senders removed, closed)
    /// before the replacement exists. Every queue and flag is cleared, the
    /// generation is bumped so stale delayed results are discarded, and
    /// `Ready` is emitted so observers can resubscribe. Safe from any state.
    pub async fn reset(&mut self) -> Result<(), PeerError> {
        self.generation = self.generation.wrapping_add(1);

        if let Err(e) = self.transport.remove_all_senders().await {
            tracing::debug!(error = %e, "Removing senders during reset");
        }
        if let Err(e) = self.transport.close().await {
            tracing::debug!(error = %e, "Closing transport during reset");
        }

        self.transport = self.factory.create(self.local_candidates_tx.clone()).await?;

        self.state = SignalingState::Stable;
        self.remote_description_set = false;
        self.candidate_queue.clear();
        self.has_initiated_call = false;
        self.is_processing_call = false;
        self.tracks_attached = false;

        let _ = self.events.send(CoordinatorEvent::Ready);
        tracing::info!("Coordinator reset, fresh transport ready");
        Ok(())
    }

    /// Terminal teardown; the coordinator accepts nothing afterwards.
    pub async fn close(&mut self) {
        self.generation = self.generation.wrapping_add(1);

        let _ = self.transport.remove_all_senders().await;
        let _ = self.transport.close().await;

        self.state = SignalingState::Closed;
        self.remote_description_set = false;
        self.candidate_queue.clear();
        self.has_initiated_call = false;
        self.is_processing_call = false;
        self.tracks_attached = false;
    }

    /// Mute or unmute a local track kind.
    pub fn set_track_enabled(&self, kind: TrackKind, enabled: bool) {
        self.media.set_track_enabled(kind, enabled);
    }

    /// Stop local capture and forget the stream.
    pub fn stop_local_media(&mut self) {
        if self.local_stream.take().is_some() {
            self.media.release();
        }
        self.tracks_attached = false;
    }

    /// Acquire local media lazily and attach its tracks to the current
    /// transport once.
    async fn ensure_local_media(&mut self) -> Result<(), PeerError> {
        if self.local_stream.is_none() {
            let stream = self.media.acquire(self.constraints).await?;
            tracing::debug!(tracks = stream.tracks.len(), "Local media acquired");
            self.local_stream = Some(stream);
        }

        if !self.tracks_attached {
            let tracks = self
                .local_stream
                .as_ref()
                .map(|s| s.tracks.clone())
                .unwrap_or_default();
            for track in &tracks {
                self.transport.add_track(track).await?;
            }
            self.tracks_attached = true;
        }

        Ok(())
    }
}
