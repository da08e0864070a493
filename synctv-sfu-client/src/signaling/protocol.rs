//! Signaling wire protocol
//!
//! protoo framing (JSON text frames) plus the typed message set this client
//! speaks. Client requests implement [`SignalingRequest`]; server requests and
//! notifications decode into closed enums with an explicit catch-all variant.

use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::media::{DeviceInfo, RtpCapabilities, RtpParameters, TransportParameters};
use crate::types::{ConsumerId, MediaKind, PeerId, ProducerId, TransportId};

/// Outcome carried by a response frame
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Accepted(Value),
    Rejected { code: u16, reason: String },
}

/// One decoded protoo frame
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Request {
        id: u32,
        method: String,
        data: Value,
    },
    Response {
        id: u32,
        outcome: ResponseOutcome,
    },
    Notification {
        method: String,
        data: Value,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrame {
    #[serde(default)]
    request: bool,
    #[serde(default)]
    response: bool,
    #[serde(default)]
    notification: bool,
    id: Option<u32>,
    method: Option<String>,
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    data: Value,
    error_code: Option<u16>,
    error_reason: Option<String>,
}

impl WireMessage {
    /// Decode a text frame
    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawFrame = serde_json::from_str(text)
            .map_err(|e| Error::MalformedMessage(format!("invalid JSON frame: {e}")))?;

        let missing = |field: &str| Error::MalformedMessage(format!("frame without {field}"));

        if raw.request {
            Ok(Self::Request {
                id: raw.id.ok_or_else(|| missing("id"))?,
                method: raw.method.ok_or_else(|| missing("method"))?,
                data: raw.data,
            })
        } else if raw.response {
            let id = raw.id.ok_or_else(|| missing("id"))?;
            let outcome = if raw.ok {
                ResponseOutcome::Accepted(raw.data)
            } else {
                ResponseOutcome::Rejected {
                    code: raw.error_code.unwrap_or(500),
                    reason: raw.error_reason.unwrap_or_default(),
                }
            };
            Ok(Self::Response { id, outcome })
        } else if raw.notification {
            Ok(Self::Notification {
                method: raw.method.ok_or_else(|| missing("method"))?,
                data: raw.data,
            })
        } else {
            Err(Error::MalformedMessage(
                "frame is neither request, response nor notification".into(),
            ))
        }
    }

    /// Encode as a text frame
    pub fn to_text(&self) -> Result<String> {
        let value = match self {
            Self::Request { id, method, data } => json!({
                "request": true,
                "id": id,
                "method": method,
                "data": data,
            }),
            Self::Response {
                id,
                outcome: ResponseOutcome::Accepted(data),
            } => json!({
                "response": true,
                "id": id,
                "ok": true,
                "data": data,
            }),
            Self::Response {
                id,
                outcome: ResponseOutcome::Rejected { code, reason },
            } => json!({
                "response": true,
                "id": id,
                "ok": false,
                "errorCode": code,
                "errorReason": reason,
            }),
            Self::Notification { method, data } => json!({
                "notification": true,
                "method": method,
                "data": data,
            }),
        };
        Ok(serde_json::to_string(&value)?)
    }
}

/// A typed client-to-server request
pub trait SignalingRequest: Serialize {
    const METHOD: &'static str;
    type Response: DeserializeOwned;
}

/// Plain acknowledgement; any payload is accepted and discarded
pub type Ack = IgnoredAny;

#[derive(Debug, Clone, Default, Serialize)]
pub struct GetRouterRtpCapabilities {}

impl SignalingRequest for GetRouterRtpCapabilities {
    const METHOD: &'static str = "getRouterRtpCapabilities";
    type Response = RtpCapabilities;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWebRtcTransport {
    pub force_tcp: bool,
    pub producing: bool,
    pub consuming: bool,
}

impl SignalingRequest for CreateWebRtcTransport {
    const METHOD: &'static str = "createWebRtcTransport";
    type Response = TransportParameters;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectWebRtcTransport {
    pub transport_id: TransportId,
    pub dtls_parameters: Value,
}

impl SignalingRequest for ConnectWebRtcTransport {
    const METHOD: &'static str = "connectWebRtcTransport";
    type Response = Ack;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Join {
    pub display_name: String,
    pub device: DeviceInfo,
    pub rtp_capabilities: RtpCapabilities,
}

/// Peers already in the room when we joined
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JoinResponse {
    #[serde(default)]
    pub peers: Vec<PeerInfo>,
}

impl SignalingRequest for Join {
    const METHOD: &'static str = "join";
    type Response = JoinResponse;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Produce {
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub app_data: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProduceResponse {
    pub id: ProducerId,
}

impl SignalingRequest for Produce {
    const METHOD: &'static str = "produce";
    type Response = ProduceResponse;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseProducer {
    pub producer_id: ProducerId,
}

impl SignalingRequest for CloseProducer {
    const METHOD: &'static str = "closeProducer";
    type Response = Ack;
}

/// Remote peer description
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: PeerId,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub device: Option<Value>,
}

/// Payload of a `newConsumer` server request
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConsumer {
    pub peer_id: PeerId,
    pub producer_id: ProducerId,
    pub id: ConsumerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    /// `simple`, `simulcast` or `svc`
    #[serde(rename = "type", default)]
    pub consumer_type: String,
    #[serde(default)]
    pub app_data: Value,
    #[serde(default)]
    pub producer_paused: bool,
}

/// Server-initiated request
#[derive(Debug, Clone, PartialEq)]
pub enum ServerRequest {
    NewConsumer(NewConsumer),
    Unknown { method: String, data: Value },
}

impl ServerRequest {
    pub fn from_wire(method: &str, data: Value) -> Result<Self> {
        match method {
            "newConsumer" => Ok(Self::NewConsumer(decode(method, data)?)),
            _ => Ok(Self::Unknown {
                method: method.to_string(),
                data,
            }),
        }
    }

    #[must_use]
    pub fn method(&self) -> &str {
        match self {
            Self::NewConsumer(_) => "newConsumer",
            Self::Unknown { method, .. } => method,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerClosed {
    pub peer_id: PeerId,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerClosed {
    pub consumer_id: ConsumerId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumerTarget {
    consumer_id: ConsumerId,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSpeaker {
    #[serde(default)]
    pub peer_id: Option<PeerId>,
    #[serde(default)]
    pub volume: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerLayers {
    pub consumer_id: ConsumerId,
    #[serde(default)]
    pub spatial_layer: Option<u8>,
    #[serde(default)]
    pub temporal_layer: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerScore {
    pub consumer_id: ConsumerId,
    #[serde(default)]
    pub score: Value,
}

/// Consumer lifecycle notifications other than closure
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerEvent {
    Paused(ConsumerId),
    Resumed(ConsumerId),
    LayersChanged(ConsumerLayers),
    Score(ConsumerScore),
}

impl ConsumerEvent {
    #[must_use]
    pub const fn consumer_id(&self) -> &ConsumerId {
        match self {
            Self::Paused(id) | Self::Resumed(id) => id,
            Self::LayersChanged(layers) => &layers.consumer_id,
            Self::Score(score) => &score.consumer_id,
        }
    }
}

/// Server notification
#[derive(Debug, Clone, PartialEq)]
pub enum ServerNotification {
    NewPeer(PeerInfo),
    PeerClosed(PeerClosed),
    ConsumerClosed(ConsumerClosed),
    ActiveSpeaker(ActiveSpeaker),
    Consumer(ConsumerEvent),
    /// Recognized framing, no handling in this client
    Ignored { method: String },
}

impl ServerNotification {
    pub fn from_wire(method: &str, data: Value) -> Result<Self> {
        let notification = match method {
            "newPeer" => Self::NewPeer(decode(method, data)?),
            "peerClosed" => Self::PeerClosed(decode(method, data)?),
            "consumerClosed" => Self::ConsumerClosed(decode(method, data)?),
            "activeSpeaker" => Self::ActiveSpeaker(decode(method, data)?),
            "consumerPaused" => {
                let target: ConsumerTarget = decode(method, data)?;
                Self::Consumer(ConsumerEvent::Paused(target.consumer_id))
            }
            "consumerResumed" => {
                let target: ConsumerTarget = decode(method, data)?;
                Self::Consumer(ConsumerEvent::Resumed(target.consumer_id))
            }
            "consumerLayersChanged" => {
                Self::Consumer(ConsumerEvent::LayersChanged(decode(method, data)?))
            }
            "consumerScore" => Self::Consumer(ConsumerEvent::Score(decode(method, data)?)),
            _ => Self::Ignored {
                method: method.to_string(),
            },
        };
        Ok(notification)
    }
}

fn decode<T: DeserializeOwned>(method: &str, data: Value) -> Result<T> {
    serde_json::from_value(data)
        .map_err(|e| Error::MalformedMessage(format!("invalid '{method}' payload: {e}")))
}
