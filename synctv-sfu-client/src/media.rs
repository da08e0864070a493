//! Media engine boundary
//!
//! The codec, ICE and DTLS machinery is an external capability. This module
//! defines the data it exchanges with the signaling layer and the traits the
//! orchestrator drives it through:
//!
//! - **`MediaDevice`**: loads router capabilities and builds transports
//! - **`MediaTransport`**: produces and consumes tracks on one transport
//! - **`TransportNegotiator`**: the callbacks the engine suspends on while a
//!   transport finishes DTLS setup or a producer id is assigned
//! - **`MediaCapture`**: local microphone/camera acquisition

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::types::{ConsumerId, MediaKind, ProducerId, TransportId};

/// A live media track owned by the media engine
pub trait MediaTrack: Send + Sync + fmt::Debug {
    /// Engine-local track identifier (not the producer/consumer id)
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    /// Stop the underlying source or sink
    fn stop(&self);
}

/// Shared handle to a live track
pub type TrackHandle = Arc<dyn MediaTrack>;

/// Codec entry of an RTP capability set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rtcp_feedback: Vec<Value>,
}

/// RTP capabilities of a router or a device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
}

/// One RTP encoding (simulcast layer or SVC stream)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncodingParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_resolution_down_by: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scalability_mode: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// RTP send/receive parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(default)]
    pub codecs: Vec<Value>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
    #[serde(default)]
    pub encodings: Vec<RtpEncodingParameters>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub rtcp: Value,
}

/// Transport parameters returned by `createWebRtcTransport`.
///
/// ICE/DTLS/SCTP blocks are kept verbatim so the local transport is built
/// from exactly what the server sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParameters {
    pub id: TransportId,
    pub ice_parameters: Value,
    #[serde(default)]
    pub ice_candidates: Vec<Value>,
    pub dtls_parameters: Value,
    #[serde(default)]
    pub sctp_parameters: Option<Value>,
}

/// Direction of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send => f.write_str("send"),
            Self::Recv => f.write_str("recv"),
        }
    }
}

/// Request to publish a local track
#[derive(Debug, Clone)]
pub struct ProduceOptions {
    pub track: TrackHandle,
    pub codec: Option<RtpCodecCapability>,
    pub encodings: Option<Vec<RtpEncodingParameters>>,
    pub codec_options: Option<Value>,
    pub app_data: Value,
}

/// Request to receive a remote producer
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub app_data: Value,
}

/// Outcome of a successful local production
#[derive(Debug, Clone)]
pub struct ProducedTrack {
    pub id: ProducerId,
    pub kind: MediaKind,
    pub track: TrackHandle,
    pub rtp_parameters: RtpParameters,
}

/// Outcome of a successful consumption
#[derive(Debug, Clone)]
pub struct ConsumedTrack {
    pub id: ConsumerId,
    pub kind: MediaKind,
    pub track: TrackHandle,
    /// Parameters as finalized by the engine
    pub rtp_parameters: RtpParameters,
}

/// Locally captured media
#[derive(Debug, Clone, Default)]
pub struct LocalStream {
    pub audio: Option<TrackHandle>,
    pub video: Option<TrackHandle>,
}

impl LocalStream {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }

    /// Stop every captured track
    pub fn stop(&self) {
        for track in self.audio.iter().chain(self.video.iter()) {
            track.stop();
        }
    }
}

/// Device description sent on `join`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub flag: String,
    pub name: String,
    pub version: String,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            flag: "rust".to_string(),
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Negotiation callbacks a transport suspends on.
///
/// Bound to one transport at creation. The engine calls `connect` before its
/// first produce/consume and `produce` once per local producer; each call
/// completes exactly once with the outcome of the matching signaling request.
#[async_trait]
pub trait TransportNegotiator: Send + Sync {
    /// Finalize DTLS with the server
    async fn connect(&self, dtls_parameters: Value) -> Result<()>;

    /// Obtain a server producer id for a new local producer
    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: Value,
    ) -> Result<ProducerId>;

    /// Report an ICE/DTLS failure detected after the transport connected
    fn connection_failed(&self, reason: &str);
}

/// One negotiated media transport
#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> &TransportId;

    fn direction(&self) -> TransportDirection;

    async fn produce(&self, options: ProduceOptions) -> Result<ProducedTrack>;

    async fn consume(&self, options: ConsumeOptions) -> Result<ConsumedTrack>;

    async fn close_producer(&self, id: &ProducerId);

    async fn close_consumer(&self, id: &ConsumerId);

    async fn close(&self);
}

/// Local media device (codec capabilities and transport factory)
#[async_trait]
pub trait MediaDevice: Send + Sync {
    /// Load the router's RTP capabilities
    async fn load(&self, router_rtp_capabilities: &RtpCapabilities) -> Result<()>;

    /// Capabilities of the loaded device; fails before `load`
    fn rtp_capabilities(&self) -> Result<RtpCapabilities>;

    async fn create_transport(
        &self,
        direction: TransportDirection,
        parameters: TransportParameters,
        negotiator: Arc<dyn TransportNegotiator>,
    ) -> Result<Arc<dyn MediaTransport>>;
}

/// Local capture source
#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn capture(&self, audio: bool, video: bool) -> Result<LocalStream>;
}
