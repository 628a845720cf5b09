//! WebSocket signaling relay client
//!
//! Speaks the relay's envelope format: every message is a JSON object whose
//! payload is base64-encoded JSON.
//!
//! ```text
//! out: {"action": "SDP_OFFER", "messagePayload": "eyJ0eXBlIjoi...", "recipientClientId": "w1"}
//! in:  {"messageType": "SDP_ANSWER", "messagePayload": "eyJ0eXBlIjoi...", "senderClientId": "w1"}
//! ```

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::directory::ChannelEndpoints;
use super::signaling::{
    IceCandidate, OutboundMessage, OutboundSignal, PeerId, SessionDescription,
    SignalingConnector, SignalingEvent, SignalingTransport,
};
use crate::config::{CredentialCell, Role};
use crate::error::{AppError, Result};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundEnvelope<'a> {
    action: &'static str,
    message_payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    recipient_client_id: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundEnvelope {
    message_type: String,
    #[serde(default)]
    message_payload: String,
    #[serde(default)]
    sender_client_id: Option<String>,
}

/// Encode an outbound message as a relay envelope
pub fn encode_envelope(message: &OutboundMessage) -> Result<String> {
    let (action, payload) = match message.signal {
        OutboundSignal::Offer(ref offer) => ("SDP_OFFER", serde_json::to_vec(offer)?),
        OutboundSignal::Answer(ref answer) => ("SDP_ANSWER", serde_json::to_vec(answer)?),
        OutboundSignal::Candidate(ref candidate) => {
            ("ICE_CANDIDATE", serde_json::to_vec(candidate)?)
        }
    };
    let envelope = OutboundEnvelope {
        action,
        message_payload: BASE64.encode(payload),
        recipient_client_id: message.recipient.as_ref().map(|p| p.as_str()),
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Decode a relay envelope
///
/// Returns `None` for messages that carry no signal (status responses,
/// keepalives, unknown types).
pub fn decode_envelope(text: &str) -> Result<Option<SignalingEvent>> {
    if text.trim().is_empty() {
        return Ok(None);
    }
    let envelope: InboundEnvelope = serde_json::from_str(text)?;
    let peer_id = envelope.sender_client_id.map(PeerId::from);

    let payload = || -> Result<Vec<u8>> {
        BASE64
            .decode(envelope.message_payload.as_bytes())
            .map_err(|e| AppError::Signaling(format!("bad payload encoding: {}", e)))
    };

    let event = match envelope.message_type.as_str() {
        "SDP_OFFER" => SignalingEvent::OfferReceived {
            offer: serde_json::from_slice::<SessionDescription>(&payload()?)?,
            peer_id,
        },
        "SDP_ANSWER" => SignalingEvent::AnswerReceived {
            answer: serde_json::from_slice::<SessionDescription>(&payload()?)?,
            peer_id,
        },
        "ICE_CANDIDATE" => SignalingEvent::CandidateReceived {
            candidate: serde_json::from_slice::<IceCandidate>(&payload()?)?,
            peer_id,
        },
        "STATUS_RESPONSE" => {
            debug!("Relay status: {}", envelope.message_payload);
            return Ok(None);
        }
        other => {
            trace!("Ignoring relay message type {}", other);
            return Ok(None);
        }
    };
    Ok(Some(event))
}

/// Relay endpoint URL for a channel and client
pub fn relay_url(endpoints: &ChannelEndpoints, client_id: Option<&str>) -> String {
    let mut url = format!(
        "{}?X-Amz-ChannelARN={}",
        endpoints.signaling_endpoint,
        urlencoding::encode(&endpoints.channel_id)
    );
    if let Some(client_id) = client_id {
        url.push_str("&X-Amz-ClientId=");
        url.push_str(&urlencoding::encode(client_id));
    }
    url
}

/// Connects [`WsSignalingTransport`]s
#[derive(Default)]
pub struct WsSignalingConnector;

impl WsSignalingConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SignalingConnector for WsSignalingConnector {
    async fn connect(
        &self,
        endpoints: &ChannelEndpoints,
        role: Role,
        client_id: Option<&str>,
        credentials: &CredentialCell,
    ) -> Result<Arc<dyn SignalingTransport>> {
        Ok(Arc::new(WsSignalingTransport {
            url: relay_url(endpoints, client_id),
            role,
            credentials: credentials.clone(),
            outbound: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }))
    }
}

/// Relay connection over one WebSocket
pub struct WsSignalingTransport {
    url: String,
    role: Role,
    credentials: CredentialCell,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

#[async_trait]
impl SignalingTransport for WsSignalingTransport {
    async fn open(&self, events: mpsc::UnboundedSender<SignalingEvent>) -> Result<()> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| AppError::Signaling(format!("invalid relay url: {}", e)))?;
        if let Some(credentials) = self.credentials.get() {
            let value = HeaderValue::from_str(&format!("Bearer {}", credentials.token))
                .map_err(|e| AppError::Credential(format!("unusable token: {}", e)))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| AppError::Signaling(format!("relay connection failed: {}", e)))?;
        info!("Relay connected as {}", self.role);

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        *self.outbound.lock() = Some(out_tx);
        let _ = events.send(SignalingEvent::Opened);

        let cancel = self.cancel.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = ws_write.send(Message::Close(None)).await;
                        break;
                    }
                    message = out_rx.recv() => match message {
                        Some(message) => {
                            if let Err(e) = ws_write.send(message).await {
                                warn!("Relay write failed: {}", e);
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        let cancel = self.cancel.clone();
        let reader = tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = ws_read.next() => message,
                };
                match message {
                    Some(Ok(Message::Text(text))) => match decode_envelope(&text) {
                        Ok(Some(event)) => {
                            if events.send(event).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!("Dropping malformed relay message: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = events.send(SignalingEvent::Closed);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = events.send(SignalingEvent::Failed(e.to_string()));
                        break;
                    }
                }
            }
        });

        self.tasks.lock().extend([writer, reader]);
        Ok(())
    }

    async fn send(&self, message: OutboundMessage) -> Result<()> {
        let text = encode_envelope(&message)?;
        let outbound = self.outbound.lock().clone();
        match outbound {
            Some(tx) => tx
                .send(Message::Text(text.into()))
                .map_err(|_| AppError::Signaling("relay connection closed".to_string())),
            None => Err(AppError::Signaling("relay not open".to_string())),
        }
    }

    async fn close(&self) {
        self.cancel.cancel();
        self.outbound.lock().take();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}
