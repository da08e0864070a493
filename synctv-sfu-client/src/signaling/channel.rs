//! Signaling channel
//!
//! One persistent duplex connection carrying:
//! - client requests, correlated to their responses by request id
//! - server requests, answered through a [`RequestResponder`]
//! - server notifications, delivered in wire order
//!
//! A reader task and a writer task own the two halves of the wire. Server
//! requests and notifications are forwarded to the owner as
//! [`SignalingEvent`]s; the final event is always `Closed`.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Sink, SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use super::protocol::{
    ResponseOutcome, ServerNotification, ServerRequest, SignalingRequest, WireMessage,
};
use crate::error::{Error, Result};

/// Inbound text frames; an `Err` item means the connection failed
pub type FrameStream = BoxStream<'static, Result<String>>;

/// Outbound text frames
pub type FrameSink = Pin<Box<dyn Sink<String, Error = Error> + Send>>;

/// Both halves of an established connection
pub struct Frames {
    pub incoming: FrameStream,
    pub outgoing: FrameSink,
}

/// Opens the wire underneath a [`SignalingChannel`]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Frames>;
}

/// Connection lifecycle: `Disconnected -> Connecting -> Open -> Closed | Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closed,
    Failed,
}

impl ConnectionState {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Something the server sent that the owner must handle
#[derive(Debug)]
pub enum SignalingEvent {
    Request(IncomingRequest),
    Notification(ServerNotification),
    /// The connection ended (`Closed` or `Failed`); no further events follow
    Closed(ConnectionState),
}

/// A server request together with the handle used to answer it
#[derive(Debug)]
pub struct IncomingRequest {
    pub request: ServerRequest,
    pub responder: RequestResponder,
}

/// Answers one server request exactly once.
///
/// Dropping an unanswered responder rejects the request so the server is
/// never left waiting.
pub struct RequestResponder {
    id: u32,
    method: String,
    outbound: mpsc::UnboundedSender<String>,
    answered: bool,
}

impl fmt::Debug for RequestResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestResponder")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("answered", &self.answered)
            .finish()
    }
}

impl RequestResponder {
    fn new(id: u32, method: String, outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id,
            method,
            outbound,
            answered: false,
        }
    }

    #[must_use]
    pub const fn request_id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn accept(mut self, data: Value) {
        self.answer(ResponseOutcome::Accepted(data));
    }

    pub fn reject(mut self, code: u16, reason: impl Into<String>) {
        self.answer(ResponseOutcome::Rejected {
            code,
            reason: reason.into(),
        });
    }

    fn answer(&mut self, outcome: ResponseOutcome) {
        self.answered = true;
        let frame = WireMessage::Response {
            id: self.id,
            outcome,
        };
        match frame.to_text() {
            Ok(text) => {
                if self.outbound.send(text).is_err() {
                    debug!(
                        request_id = self.id,
                        method = %self.method,
                        "Channel closed before server request was answered"
                    );
                }
            }
            Err(e) => error!(request_id = self.id, error = %e, "Failed to encode response"),
        }
    }
}

impl Drop for RequestResponder {
    fn drop(&mut self) {
        if !self.answered {
            warn!(
                request_id = self.id,
                method = %self.method,
                "Server request dropped without an answer, rejecting"
            );
            self.answer(ResponseOutcome::Rejected {
                code: 500,
                reason: "request not handled".to_string(),
            });
        }
    }
}

struct PendingRequest {
    method: String,
    tx: oneshot::Sender<Result<Value>>,
}

struct ChannelInner {
    state: watch::Sender<ConnectionState>,
    pending: Mutex<HashMap<u32, PendingRequest>>,
    outbound: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedSender<SignalingEvent>,
    next_id: AtomicU32,
    request_timeout: Duration,
    cancel: CancellationToken,
}

impl ChannelInner {
    fn dispatch(&self, text: &str) {
        let message = match WireMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping malformed signaling frame");
                return;
            }
        };

        match message {
            WireMessage::Response { id, outcome } => {
                let Some(pending) = self.pending.lock().remove(&id) else {
                    debug!(request_id = id, "Response for unknown request, dropping");
                    return;
                };
                let result = match outcome {
                    ResponseOutcome::Accepted(data) => Ok(data),
                    ResponseOutcome::Rejected { code, reason } => Err(Error::RequestRejected {
                        method: pending.method,
                        code,
                        reason,
                    }),
                };
                // The caller may have timed out already
                let _ = pending.tx.send(result);
            }
            WireMessage::Request { id, method, data } => {
                debug!(request_id = id, method = %method, "Server request");
                let responder = RequestResponder::new(id, method.clone(), self.outbound.clone());
                match ServerRequest::from_wire(&method, data) {
                    Ok(request) => {
                        let _ = self
                            .events
                            .send(SignalingEvent::Request(IncomingRequest { request, responder }));
                    }
                    Err(e) => {
                        warn!(method = %method, error = %e, "Rejecting undecodable server request");
                        responder.reject(400, e.to_string());
                    }
                }
            }
            WireMessage::Notification { method, data } => {
                match ServerNotification::from_wire(&method, data) {
                    Ok(notification) => {
                        debug!(method = %method, "Server notification");
                        let _ = self.events.send(SignalingEvent::Notification(notification));
                    }
                    Err(e) => warn!(method = %method, error = %e, "Dropping undecodable notification"),
                }
            }
        }
    }

    /// Move to a terminal state once; fail every pending request
    fn shutdown(&self, state: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if current.is_terminal() {
                false
            } else {
                *current = state;
                true
            }
        });
        if !changed {
            return;
        }

        self.cancel.cancel();

        let pending: Vec<(u32, PendingRequest)> = self.pending.lock().drain().collect();
        for (id, request) in pending {
            debug!(request_id = id, method = %request.method, "Failing pending request");
            let _ = request.tx.send(Err(Error::ConnectionLost));
        }

        if state == ConnectionState::Failed {
            warn!("Signaling connection failed");
        } else {
            info!("Signaling connection closed");
        }
        let _ = self.events.send(SignalingEvent::Closed(state));
    }
}

/// Handle to the signaling connection; clones share the same connection
#[derive(Clone)]
pub struct SignalingChannel {
    inner: Arc<ChannelInner>,
}

impl SignalingChannel {
    /// Open a connection to `url`
    pub async fn connect(
        connector: &dyn Connector,
        url: &Url,
        request_timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingEvent>)> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        state.send_replace(ConnectionState::Connecting);
        info!(url = %url, "Connecting signaling channel");

        match connector.connect(url).await {
            Ok(frames) => Ok(Self::start(frames, state, request_timeout)),
            Err(e) => {
                state.send_replace(ConnectionState::Failed);
                error!(url = %url, error = %e, "Signaling connection failed");
                Err(match e {
                    Error::ConnectionFailed(_) => e,
                    other => Error::ConnectionFailed(other.to_string()),
                })
            }
        }
    }

    /// Run the channel over an already established connection
    #[must_use]
    pub fn from_frames(
        frames: Frames,
        request_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self::start(frames, state, request_timeout)
    }

    fn start(
        frames: Frames,
        state: watch::Sender<ConnectionState>,
        request_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        state.send_replace(ConnectionState::Open);
        let inner = Arc::new(ChannelInner {
            state,
            pending: Mutex::new(HashMap::new()),
            outbound: outbound_tx,
            events: events_tx,
            next_id: AtomicU32::new(1),
            request_timeout,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(read_loop(Arc::clone(&inner), frames.incoming));
        tokio::spawn(write_loop(Arc::clone(&inner), outbound_rx, frames.outgoing));

        info!("Signaling channel open");
        (Self { inner }, events_rx)
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Number of requests awaiting a response
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Issue a typed request and decode its response
    pub async fn request<R: SignalingRequest + Sync>(&self, request: &R) -> Result<R::Response> {
        let data = serde_json::to_value(request)?;
        let mut response = self.request_raw(R::METHOD, data).await?;
        if response.is_null() {
            response = Value::Object(Map::new());
        }
        serde_json::from_value(response).map_err(|e| {
            Error::MalformedMessage(format!("invalid '{}' response: {e}", R::METHOD))
        })
    }

    /// Issue a request and wait for its response payload
    pub async fn request_raw(&self, method: &str, data: Value) -> Result<Value> {
        let state = self.state();
        if state != ConnectionState::Open {
            return Err(Error::NotConnected(state));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = WireMessage::Request {
            id,
            method: method.to_string(),
            data,
        }
        .to_text()?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(
            id,
            PendingRequest {
                method: method.to_string(),
                tx,
            },
        );

        // The connection may have ended between the state check and registration
        if self.state() != ConnectionState::Open {
            self.inner.pending.lock().remove(&id);
            return Err(Error::ConnectionLost);
        }

        debug!(request_id = id, method = %method, "Sending signaling request");
        if self.inner.outbound.send(frame).is_err() {
            self.inner.pending.lock().remove(&id);
            return Err(Error::ConnectionLost);
        }

        match tokio::time::timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionLost),
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                warn!(request_id = id, method = %method, "Signaling request timed out");
                Err(Error::Timeout {
                    method: method.to_string(),
                    timeout: self.inner.request_timeout,
                })
            }
        }
    }

    /// Close the connection; pending requests fail with `ConnectionLost`
    pub fn close(&self) {
        self.inner.shutdown(ConnectionState::Closed);
    }
}

async fn read_loop(inner: Arc<ChannelInner>, mut incoming: FrameStream) {
    let final_state = loop {
        tokio::select! {
            () = inner.cancel.cancelled() => break ConnectionState::Closed,
            frame = incoming.next() => match frame {
                Some(Ok(text)) => inner.dispatch(&text),
                Some(Err(e)) => {
                    warn!(error = %e, "Signaling read error");
                    break ConnectionState::Failed;
                }
                None => {
                    debug!("Signaling stream ended");
                    break ConnectionState::Closed;
                }
            },
        }
    };
    inner.shutdown(final_state);
}

async fn write_loop(
    inner: Arc<ChannelInner>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    mut sink: FrameSink,
) {
    loop {
        tokio::select! {
            () = inner.cancel.cancelled() => break,
            frame = outbound.recv() => {
                let Some(text) = frame else { break };
                if let Err(e) = sink.send(text).await {
                    error!(error = %e, "Signaling write error");
                    inner.shutdown(ConnectionState::Failed);
                    break;
                }
            }
        }
    }

    // Flush answers queued right before shutdown (e.g. rejections from dropped responders)
    while let Ok(text) = outbound.try_recv() {
        if sink.send(text).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}


#[cfg(test)]
mod tests {
    use super::testing::loopback;
    use super::*;
    use crate::signaling::protocol::{CloseProducer, GetRouterRtpCapabilities};
    use crate::types::ProducerId;
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn request_id(frame: &str) -> u32 {
        match WireMessage::parse(frame).unwrap() {
            WireMessage::Request { id, .. } => id,
            other => panic!("expected request, got {other:?}"),
        }
    }

    fn accept(id: u32, data: Value) -> String {
        WireMessage::Response {
            id,
            outcome: ResponseOutcome::Accepted(data),
        }
        .to_text()
        .unwrap()
    }

    #[tokio::test]
    async fn test_responses_matched_by_id_not_order() {
        let (frames, mut server) = loopback();
        let (channel, _events) = SignalingChannel::from_frames(frames, TIMEOUT);
        assert_eq!(channel.state(), ConnectionState::Open);

        let first = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.request_raw("first", json!({})).await })
        };
        let first_id = request_id(&server.sent.recv().await.unwrap());

        let second = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.request_raw("second", json!({})).await })
        };
        let second_id = request_id(&server.sent.recv().await.unwrap());
        assert_ne!(first_id, second_id);

        server.inject.send(Ok(accept(second_id, json!("two")))).unwrap();
        server.inject.send(Ok(accept(first_id, json!("one")))).unwrap();

        assert_eq!(first.await.unwrap().unwrap(), json!("one"));
        assert_eq!(second.await.unwrap().unwrap(), json!("two"));
        assert_eq!(channel.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_rejection_carries_code_and_reason() {
        let (frames, mut server) = loopback();
        let (channel, _events) = SignalingChannel::from_frames(frames, TIMEOUT);

        let call = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .request(&CloseProducer {
                        producer_id: ProducerId::from("p1"),
                    })
                    .await
            })
        };
        let id = request_id(&server.sent.recv().await.unwrap());
        let reply = WireMessage::Response {
            id,
            outcome: ResponseOutcome::Rejected {
                code: 404,
                reason: "producer not found".into(),
            },
        };
        server.inject.send(Ok(reply.to_text().unwrap())).unwrap();

        match call.await.unwrap() {
            Err(Error::RequestRejected {
                method,
                code,
                reason,
            }) => {
                assert_eq!(method, "closeProducer");
                assert_eq!(code, 404);
                assert_eq!(reason, "producer not found");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_null_response_decodes_as_empty_object() {
        let (frames, mut server) = loopback();
        let (channel, _events) = SignalingChannel::from_frames(frames, TIMEOUT);

        let call = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.request(&GetRouterRtpCapabilities {}).await })
        };
        let id = request_id(&server.sent.recv().await.unwrap());
        server.inject.send(Ok(accept(id, Value::Null))).unwrap();

        let caps = call.await.unwrap().unwrap();
        assert!(caps.codecs.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_clears_pending_entry() {
        let (frames, mut server) = loopback();
        let (channel, _events) = SignalingChannel::from_frames(frames, Duration::from_millis(500));

        let call = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.request_raw("slow", json!({})).await })
        };
        let id = request_id(&server.sent.recv().await.unwrap());

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Timeout { ref method, .. } if method == "slow"));
        assert_eq!(channel.pending_requests(), 0);

        // A late answer is dropped without disturbing the channel
        server.inject.send(Ok(accept(id, json!({})))).unwrap();
        tokio::task::yield_now().await;
        assert_eq!(channel.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_connection_loss_fails_pending_requests() {
        let (frames, mut server) = loopback();
        let (channel, mut events) = SignalingChannel::from_frames(frames, TIMEOUT);

        let call = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.request_raw("join", json!({})).await })
        };
        server.sent.recv().await.unwrap();
        drop(server.inject);

        assert!(matches!(call.await.unwrap(), Err(Error::ConnectionLost)));
        assert!(matches!(
            events.recv().await,
            Some(SignalingEvent::Closed(ConnectionState::Closed))
        ));
        assert!(matches!(
            channel.request_raw("late", json!({})).await,
            Err(Error::NotConnected(ConnectionState::Closed))
        ));
    }

    #[tokio::test]
    async fn test_read_error_marks_channel_failed() {
        let (frames, server) = loopback();
        let (channel, mut events) = SignalingChannel::from_frames(frames, TIMEOUT);

        server
            .inject
            .send(Err(Error::ConnectionFailed("reset by peer".into())))
            .unwrap();

        assert!(matches!(
            events.recv().await,
            Some(SignalingEvent::Closed(ConnectionState::Failed))
        ));
        assert_eq!(channel.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_server_request_answered_once() {
        let (frames, mut server) = loopback();
        let (_channel, mut events) = SignalingChannel::from_frames(frames, TIMEOUT);

        let request = WireMessage::Request {
            id: 77,
            method: "somethingNew".into(),
            data: json!({}),
        };
        server.inject.send(Ok(request.to_text().unwrap())).unwrap();

        let Some(SignalingEvent::Request(incoming)) = events.recv().await else {
            panic!("expected a server request");
        };
        assert_eq!(incoming.request.method(), "somethingNew");
        incoming.responder.accept(json!({"fine": true}));

        let answer = WireMessage::parse(&server.sent.recv().await.unwrap()).unwrap();
        assert_eq!(
            answer,
            WireMessage::Response {
                id: 77,
                outcome: ResponseOutcome::Accepted(json!({"fine": true})),
            }
        );
    }

    #[tokio::test]
    async fn test_dropped_responder_rejects() {
        let (frames, mut server) = loopback();
        let (_channel, mut events) = SignalingChannel::from_frames(frames, TIMEOUT);

        let request = WireMessage::Request {
            id: 5,
            method: "newDataConsumer".into(),
            data: json!({}),
        };
        server.inject.send(Ok(request.to_text().unwrap())).unwrap();

        let Some(SignalingEvent::Request(incoming)) = events.recv().await else {
            panic!("expected a server request");
        };
        drop(incoming);

        let answer = WireMessage::parse(&server.sent.recv().await.unwrap()).unwrap();
        assert!(matches!(
            answer,
            WireMessage::Response {
                id: 5,
                outcome: ResponseOutcome::Rejected { code: 500, .. },
            }
        ));
    }

    #[tokio::test]
    async fn test_malformed_frames_are_skipped() {
        let (frames, server) = loopback();
        let (channel, mut events) = SignalingChannel::from_frames(frames, TIMEOUT);

        server.inject.send(Ok("{not json".into())).unwrap();
        let notification = WireMessage::Notification {
            method: "peerClosed".into(),
            data: json!({"peerId": "bob"}),
        };
        server.inject.send(Ok(notification.to_text().unwrap())).unwrap();

        assert!(matches!(
            events.recv().await,
            Some(SignalingEvent::Notification(ServerNotification::PeerClosed(_)))
        ));
        assert_eq!(channel.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (frames, _server) = loopback();
        let (channel, mut events) = SignalingChannel::from_frames(frames, TIMEOUT);

        channel.close();
        channel.close();

        assert!(matches!(
            events.recv().await,
            Some(SignalingEvent::Closed(ConnectionState::Closed))
        ));
        assert_eq!(channel.state(), ConnectionState::Closed);
    }
}
