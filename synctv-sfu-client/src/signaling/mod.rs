//! Signaling with the media server

mod channel;
pub mod protocol;
mod websocket;

pub use channel::{
    ConnectionState, Connector, FrameSink, FrameStream, Frames, IncomingRequest,
    RequestResponder, SignalingChannel, SignalingEvent,
};
pub use protocol::{ServerNotification, ServerRequest, SignalingRequest, WireMessage};
pub use websocket::{WebSocketConnector, PROTOO_SUBPROTOCOL};

#[cfg(test)]
pub(crate) use channel::testing;
