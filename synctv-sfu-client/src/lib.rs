//! `SyncTV` SFU client
//!
//! Client-side signaling and media-session orchestration for conferencing
//! through a mediasoup-style Selective Forwarding Unit. The client speaks the
//! protoo request/response/notification protocol over one WebSocket, drives
//! an external media engine through send and receive transports, and keeps a
//! registry of live tracks for the rendering layer.
//!
//! ## Architecture
//!
//! - **`SignalingChannel`**: request/response correlation, server requests and notifications
//! - **`TransportManager`**: send/receive transports and their DTLS/produce negotiation
//! - **`ProducerManager`**: publishes local audio and video
//! - **`ConsumerManager`**: server-driven consumer lifecycle
//! - **`TrackRegistry`**: track id to live track handle, read by the renderer
//! - **`Session`**: ties the above together and owns teardown
//!
//! The codec/ICE/DTLS machinery stays behind the [`MediaDevice`],
//! [`MediaTransport`] and [`MediaCapture`] traits.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use synctv_sfu_client::{ClientConfig, Session, SessionDeps, WebSocketConnector};
//!
//! let config = ClientConfig::load(Some("sfu-client.toml"))?;
//! let deps = SessionDeps {
//!     connector: Arc::new(WebSocketConnector),
//!     device: Arc::new(my_engine.device()),
//!     capture: Arc::new(my_engine.capture()),
//! };
//!
//! let session = Session::start(config, deps).await?;
//! for entry in session.registry().video_tracks() {
//!     renderer.attach(entry.id, entry.track);
//! }
//! session.closed().await;
//! ```

mod config;
mod consumer;
mod encoding;
mod error;
mod logging;
pub mod media;
mod producer;
mod registry;
mod session;
pub mod signaling;
mod transport;
mod types;

pub use config::{ClientConfig, LoggingConfig, MediaConfig, SignalingConfig};
pub use consumer::{Consumer, ConsumerManager};
pub use encoding::{
    encodings_for, parse_scalability_mode, select_codec, ScalabilityInfo, ScalabilityMode,
    SIMULCAST_DOWNSCALE_FACTORS,
};
pub use error::{Error, Result};
pub use logging::{init_logging, parse_log_level};
pub use media::{
    DeviceInfo, LocalStream, MediaCapture, MediaDevice, MediaTrack, MediaTransport, TrackHandle,
    TransportDirection, TransportNegotiator,
};
pub use producer::{Producer, ProducerManager};
pub use registry::{TrackEntry, TrackRegistry, TrackRole};
pub use session::{RemotePeer, Session, SessionDeps};
pub use signaling::{
    ConnectionState, Connector, Frames, SignalingChannel, SignalingEvent, WebSocketConnector,
};
pub use transport::{
    ManagedTransport, SignalingNegotiator, TransportFailure, TransportManager, TransportState,
};
pub use types::{ConsumerId, MediaKind, PeerId, ProducerId, TrackId, TransportId};
