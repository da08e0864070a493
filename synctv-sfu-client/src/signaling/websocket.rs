//! WebSocket connector speaking the `protoo` sub-protocol

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, warn};
use url::Url;

use super::channel::{Connector, Frames};
use crate::error::{Error, Result};

/// WebSocket sub-protocol required by the media server
pub const PROTOO_SUBPROTOCOL: &str = "protoo";

/// Connects over `ws://` or `wss://` with the `protoo` sub-protocol
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<Frames> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(PROTOO_SUBPROTOCOL),
        );

        let (stream, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        debug!(status = %response.status(), "WebSocket handshake complete");

        let (sink, stream) = stream.split();

        let incoming = stream
            .filter_map(|message| async move {
                match message {
                    Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                    Ok(Message::Binary(data)) => {
                        warn!(len = data.len(), "Ignoring binary signaling frame");
                        None
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(frame = ?frame, "WebSocket close frame received");
                        None
                    }
                    Ok(_) => None,
                    Err(e) => Some(Err(Error::ConnectionFailed(e.to_string()))),
                }
            })
            .boxed();

        let outgoing = sink
            .with(|text: String| async move { Ok::<_, tungstenite::Error>(Message::text(text)) })
            .sink_map_err(|e| Error::ConnectionFailed(e.to_string()));

        Ok(Frames {
            incoming,
            outgoing: Box::pin(outgoing),
        })
    }
}
