//! Peer transport abstraction and its webrtc-rs implementation

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::config::IceServerSet;
use super::media::{LocalTrack, MediaKind};
use super::signaling::{ConnectionState, IceCandidate, SdpType, SessionDescription};
use crate::error::{AppError, Result};

/// Label of the data channel a session opens itself
pub const DATA_CHANNEL_LABEL: &str = "kvsDataChannel";

/// Event reported by a peer transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Locally gathered candidate; `None` marks the end of gathering
    LocalCandidate(Option<IceCandidate>),
    /// Remote media track arrived
    Track {
        stream_id: String,
        track_id: String,
        kind: MediaKind,
    },
    /// The remote opened a data channel
    RemoteDataChannel { label: String },
    /// Message received on any data channel
    Message { label: String, data: Bytes },
    StateChanged(ConnectionState),
}

/// Transfer counters of one transport
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Current round trip time of the nominated pair, in seconds
    pub round_trip_time: Option<f64>,
    pub messages_sent: u64,
    pub messages_received: u64,
}

/// Bidirectional message channel on top of a transport
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;
    async fn send(&self, data: Bytes) -> Result<()>;
    async fn close(&self);
}

/// One underlying peer transport
///
/// Events (candidates, tracks, messages, state) are delivered on the
/// sender given to [`PeerTransportFactory::create`].
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<()>;
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>>;
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, description: &SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()>;
    /// Current local description, including gathered candidates
    async fn local_description(&self) -> Option<SessionDescription>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;
    async fn stats(&self) -> Result<TransportStats>;
    async fn close(&self);
}

/// Creates peer transports
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &IceServerSet,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>>;
}

/// Factory backed by webrtc-rs
pub struct RtcTransportFactory {
    api: API,
}

impl RtcTransportFactory {
    pub fn new() -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(|e| {
            AppError::TransportUnavailable(format!("Failed to register codecs: {}", e))
        })?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            AppError::TransportUnavailable(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api })
    }
}

#[async_trait]
impl PeerTransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        ice_servers: &IceServerSet,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>> {
        let pc = self
            .api
            .new_peer_connection(ice_servers.to_rtc_configuration())
            .await
            .map_err(|e| {
                AppError::TransportUnavailable(format!("Failed to create peer connection: {}", e))
            })?;

        let transport = RtcPeerTransport {
            pc: Arc::new(pc),
            events,
        };
        transport.setup_event_handlers();
        Ok(Arc::new(transport))
    }
}

/// Peer transport wrapping an `RTCPeerConnection`
pub struct RtcPeerTransport {
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl RtcPeerTransport {
    fn setup_event_handlers(&self) {
        let events = self.events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let state = match s {
                    RTCPeerConnectionState::New => Some(ConnectionState::New),
                    RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
                    RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
                    RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
                    RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
                    RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
                    _ => None,
                };
                if let Some(state) = state {
                    let _ = events.send(TransportEvent::StateChanged(state));
                }
                Box::pin(async {})
            }));

        let events = self.events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                match candidate.map(|c| c.to_json()) {
                    Some(Ok(json)) => {
                        let _ = events.send(TransportEvent::LocalCandidate(Some(IceCandidate {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid,
                            sdp_mline_index: json.sdp_mline_index,
                        })));
                    }
                    Some(Err(e)) => debug!("Skipping unserializable candidate: {}", e),
                    None => {
                        let _ = events.send(TransportEvent::LocalCandidate(None));
                    }
                }
                Box::pin(async {})
            }));

        let events = self.events.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    _ => MediaKind::Video,
                };
                let _ = events.send(TransportEvent::Track {
                    stream_id: track.stream_id(),
                    track_id: track.id(),
                    kind,
                });
                Box::pin(async {})
            },
        ));

        let events = self.events.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let events = events.clone();
                Box::pin(async move {
                    let label = dc.label().to_string();
                    info!("Remote data channel opened: {}", label);
                    forward_messages(&dc, events.clone());
                    let _ = events.send(TransportEvent::RemoteDataChannel { label });
                })
            }));
    }
}

fn forward_messages(dc: &Arc<RTCDataChannel>, events: mpsc::UnboundedSender<TransportEvent>) {
    let label = dc.label().to_string();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        trace!("DataChannel {} message: {} bytes", label, msg.data.len());
        let _ = events.send(TransportEvent::Message {
            label: label.clone(),
            data: msg.data,
        });
        Box::pin(async {})
    }));
}

fn to_rtc_description(description: &SessionDescription) -> Result<RTCSessionDescription> {
    let result = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp.clone()),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp.clone()),
    };
    result.map_err(|e| AppError::Negotiation(format!("Invalid SDP {:?}: {}", description.sdp_type, e)))
}

fn from_rtc_description(description: RTCSessionDescription) -> Option<SessionDescription> {
    match description.sdp_type {
        RTCSdpType::Offer => Some(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Some(SessionDescription::answer(description.sdp)),
        _ => None,
    }
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let local: Arc<dyn TrackLocal + Send + Sync> = track.sample_track();
        let sender = self.pc.add_track(local).await.map_err(|e| {
            AppError::TransportUnavailable(format!("Failed to add {} track: {}", track.kind, e))
        })?;

        // Drain RTCP so interceptors keep running
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        debug!("{} track {} added", track.kind, track.id);
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let dc = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(|e| AppError::DataChannel(format!("Failed to create data channel: {}", e)))?;
        forward_messages(&dc, self.events.clone());
        info!("Data channel '{}' created", label);
        Ok(Arc::new(RtcDataChannel { dc }))
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to create offer: {}", e)))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to create answer: {}", e)))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: &SessionDescription) -> Result<()> {
        let rtc = to_rtc_description(description)?;
        self.pc
            .set_local_description(rtc)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()> {
        let rtc = to_rtc_description(description)?;
        self.pc
            .set_remote_description(rtc)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to set remote description: {}", e)))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc
            .local_description()
            .await
            .and_then(from_rtc_description)
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| AppError::Candidate(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn stats(&self) -> Result<TransportStats> {
        let report = self.pc.get_stats().await;
        let mut stats = TransportStats::default();

        for entry in report.reports.values() {
            match entry {
                StatsReportType::CandidatePair(pair) if pair.nominated => {
                    stats.packets_sent += pair.packets_sent as u64;
                    stats.packets_received += pair.packets_received as u64;
                    stats.bytes_sent += pair.bytes_sent as u64;
                    stats.bytes_received += pair.bytes_received as u64;
                    stats.round_trip_time = Some(pair.current_round_trip_time);
                }
                StatsReportType::DataChannel(dc) => {
                    stats.messages_sent += dc.messages_sent as u64;
                    stats.messages_received += dc.messages_received as u64;
                }
                _ => {}
            }
        }

        Ok(stats)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!("Peer connection close: {}", e);
        }
    }
}

/// Data channel wrapping an `RTCDataChannel`
pub struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        self.dc.label()
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        self.dc
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|e| AppError::DataChannel(format!("Failed to send on {}: {}", self.dc.label(), e)))
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            debug!("Data channel {} close: {}", self.dc.label(), e);
        }
    }
}
