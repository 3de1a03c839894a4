use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::ws::CandidateInit;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("WebRTC error: {0}")]
    WebRtc(String),
}

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("media acquisition failed: {0}")]
    Acquire(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A local capture track handed to the transport.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone, Default)]
pub struct MediaStream {
    pub tracks: Vec<MediaTrack>,
}

#[derive(Debug, Clone, Copy)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

/// Media-capability provider consumed by the negotiation coordinator.
///
/// Acquisition may suspend (a permission prompt); the coordinator tolerates
/// other events interleaving while it waits.
#[async_trait]
pub trait MediaProvider: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<MediaStream, MediaError>;

    fn set_track_enabled(&self, kind: TrackKind, enabled: bool);

    /// Stop all capture and release devices.
    fn release(&self);
}

/// One peer transport instance, exclusively owned by a single coordinator.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), TransportError>;

    async fn remove_all_senders(&self) -> Result<(), TransportError>;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Builds transports. Only `NegotiationCoordinator::reset` replaces an
/// instance, and it decommissions the old one first.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Create a fresh transport. Paths the transport discovers locally are
    /// pushed into `local_candidates` as they surface.
    async fn create(
        &self,
        local_candidates: mpsc::UnboundedSender<CandidateInit>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Scripted transport that records every operation in order.
    #[derive(Default)]
    pub struct FakeTransport {
        pub ops: Mutex<Vec<String>>,
        pub fail_create_offer: AtomicBool,
        pub fail_add_candidate: AtomicBool,
    }

    impl FakeTransport {
        pub fn ops(&self) -> Vec<String> {
            self.ops.lock().unwrap().clone()
        }

        fn record(&self, op: String) {
            self.ops.lock().unwrap().push(op);
        }
    }

    #[async_trait]
    impl PeerTransport for FakeTransport {
        async fn add_track(&self, track: &MediaTrack) -> Result<(), TransportError> {
            self.record(format!("add_track:{}", track.id));
            Ok(())
        }

        async fn remove_all_senders(&self) -> Result<(), TransportError> {
            self.record("remove_all_senders".to_string());
            Ok(())
        }

        async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
            if self.fail_create_offer.load(Ordering::SeqCst) {
                return Err(TransportError::WebRtc("offer failed".to_string()));
            }
            self.record("create_offer".to_string());
            Ok(SessionDescription {
                kind: SdpKind::Offer,
                sdp: "v=0 offer".to_string(),
            })
        }

        async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
            self.record("create_answer".to_string());
            Ok(SessionDescription {
                kind: SdpKind::Answer,
                sdp: "v=0 answer".to_string(),
            })
        }

        async fn set_local_description(
            &self,
            desc: SessionDescription,
        ) -> Result<(), TransportError> {
            self.record(format!("set_local:{:?}", desc.kind));
            Ok(())
        }

        async fn set_remote_description(
            &self,
            desc: SessionDescription,
        ) -> Result<(), TransportError> {
            self.record(format!("set_remote:{:?}", desc.kind));
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<(), TransportError> {
            if self.fail_add_candidate.load(Ordering::SeqCst) {
                return Err(TransportError::WebRtc("bad candidate".to_string()));
            }
            self.record(format!("add_candidate:{}", candidate.candidate));
            Ok(())
        }

        async fn close(&self) -> Result<(), TransportError> {
            self.record("close".to_string());
            Ok(())
        }
    }

    /// Factory that retains every transport it hands out so tests can
    /// inspect them after the coordinator moves on.
    #[derive(Default)]
    pub struct FakeFactory {
        pub created: Mutex<Vec<Arc<FakeTransport>>>,
    }

    impl FakeFactory {
        pub fn created_count(&self) -> usize {
            self.created.lock().unwrap().len()
        }

        pub fn transport(&self, index: usize) -> Arc<FakeTransport> {
            self.created.lock().unwrap()[index].clone()
        }
    }

    #[async_trait]
    impl TransportFactory for FakeFactory {
        async fn create(
            &self,
            _local_candidates: mpsc::UnboundedSender<CandidateInit>,
        ) -> Result<Arc<dyn PeerTransport>, TransportError> {
            let transport = Arc::new(FakeTransport::default());
            self.created.lock().unwrap().push(transport.clone());
            Ok(transport)
        }
    }

    /// Media provider with a switchable failure mode.
    #[derive(Default)]
    pub struct FakeMedia {
        pub fail_acquire: AtomicBool,
        pub released: AtomicBool,
    }

    #[async_trait]
    impl MediaProvider for FakeMedia {
        async fn acquire(
            &self,
            constraints: MediaConstraints,
        ) -> Result<MediaStream, MediaError> {
            if self.fail_acquire.load(Ordering::SeqCst) {
                return Err(MediaError::Acquire("permission denied".to_string()));
            }
            let mut tracks = Vec::new();
            if constraints.audio {
                tracks.push(MediaTrack {
                    id: "mic-0".to_string(),
                    kind: TrackKind::Audio,
                });
            }
            if constraints.video {
                tracks.push(MediaTrack {
                    id: "cam-0".to_string(),
                    kind: TrackKind::Video,
                });
            }
            Ok(MediaStream { tracks })
        }

        fn set_track_enabled(&self, _kind: TrackKind, _enabled: bool) {}

        fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }
}
