//! Shared fixtures: an in-memory protoo server and a fake media engine

#![allow(dead_code, clippy::unwrap_used)]

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::UnboundedReceiverStream;
use url::Url;

use synctv_sfu_client::media::{
    ConsumeOptions, ConsumedTrack, LocalStream, MediaCapture, MediaDevice, MediaTrack,
    MediaTransport, ProduceOptions, ProducedTrack, RtpCapabilities, RtpParameters,
    TransportDirection, TransportNegotiator, TransportParameters,
};
use synctv_sfu_client::signaling::protocol::{ResponseOutcome, WireMessage};
use synctv_sfu_client::signaling::{Connector, Frames};
use synctv_sfu_client::{
    ClientConfig, ConsumerId, Error, MediaKind, ProducerId, Result, SessionDeps, TransportId,
};

pub const WAIT: Duration = Duration::from_secs(5);

/// Await `future`, panicking if it takes longer than [`WAIT`]
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("timed out waiting")
}

/// Poll `condition` until it holds
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn client_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.signaling.host = "sfu.test".to_string();
    config.signaling.room_id = "room-1".to_string();
    config.signaling.peer_id = Some("me000001".to_string());
    config.signaling.secure = false;
    config.signaling.request_timeout_ms = 2_000;
    config
}

pub fn router_capabilities() -> Value {
    json!({
        "codecs": [
            {"kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2},
            {"kind": "video", "mimeType": "video/VP8", "clockRate": 90000},
            {"kind": "video", "mimeType": "video/H264", "clockRate": 90000,
             "parameters": {"packetization-mode": 1, "profile-level-id": "42e01f"}}
        ],
        "headerExtensions": []
    })
}

/// Scripted answer to a client request
#[derive(Debug, Clone)]
pub enum Reply {
    Accept(Value),
    Reject(u16, String),
    /// Never answer
    Silent,
}

#[derive(Default)]
struct ServerState {
    urls: Mutex<Vec<String>>,
    refuse: AtomicBool,
    requests: Mutex<Vec<(String, Value)>>,
    overrides: Mutex<HashMap<String, Reply>>,
    answers: Mutex<HashMap<u32, ResponseOutcome>>,
    to_client: Mutex<Option<mpsc::UnboundedSender<Result<String>>>>,
    next_id: AtomicU32,
}

impl ServerState {
    fn handle(&self, frame: &str) {
        match WireMessage::parse(frame).unwrap() {
            WireMessage::Request { id, method, data } => {
                self.requests.lock().push((method.clone(), data.clone()));
                let reply = self
                    .overrides
                    .lock()
                    .get(&method)
                    .cloned()
                    .unwrap_or_else(|| default_reply(&method, &data));
                let outcome = match reply {
                    Reply::Accept(data) => ResponseOutcome::Accepted(data),
                    Reply::Reject(code, reason) => ResponseOutcome::Rejected { code, reason },
                    Reply::Silent => return,
                };
                self.send(&WireMessage::Response { id, outcome });
            }
            WireMessage::Response { id, outcome } => {
                self.answers.lock().insert(id, outcome);
            }
            WireMessage::Notification { .. } => {}
        }
    }

    fn send(&self, message: &WireMessage) {
        if let Some(tx) = self.to_client.lock().as_ref() {
            let _ = tx.send(Ok(message.to_text().unwrap()));
        }
    }
}

fn default_reply(method: &str, data: &Value) -> Reply {
    match method {
        "getRouterRtpCapabilities" => Reply::Accept(router_capabilities()),
        "createWebRtcTransport" => {
            let id = if data["producing"] == json!(true) {
                "send-transport"
            } else {
                "recv-transport"
            };
            Reply::Accept(json!({
                "id": id,
                "iceParameters": {"usernameFragment": id, "password": "secret", "iceLite": true},
                "iceCandidates": [{"foundation": "udpcandidate", "ip": "10.0.0.1", "port": 40000}],
                "dtlsParameters": {"role": "auto", "fingerprints": []},
                "sctpParameters": null
            }))
        }
        "join" => Reply::Accept(json!({"peers": []})),
        "produce" => Reply::Accept(json!({
            "id": format!("producer-{}", data["kind"].as_str().unwrap_or("unknown"))
        })),
        "connectWebRtcTransport" | "closeProducer" => Reply::Accept(json!({})),
        _ => Reply::Reject(404, format!("unknown method {method}")),
    }
}

/// In-memory protoo server
#[derive(Clone, Default)]
pub struct FakeServer {
    state: Arc<ServerState>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            state: Arc::clone(&self.state),
        })
    }

    /// Override the answer to every request of `method`
    pub fn respond(&self, method: &str, reply: Reply) {
        self.state.overrides.lock().insert(method.to_string(), reply);
    }

    pub fn refuse_connections(&self) {
        self.state.refuse.store(true, Ordering::SeqCst);
    }

    pub fn urls(&self) -> Vec<String> {
        self.state.urls.lock().clone()
    }

    /// Methods of every client request, in arrival order
    pub fn methods(&self) -> Vec<String> {
        self.state
            .requests
            .lock()
            .iter()
            .map(|(method, _)| method.clone())
            .collect()
    }

    /// Bodies of the client requests for `method`
    pub fn requests(&self, method: &str) -> Vec<Value> {
        self.state
            .requests
            .lock()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, data)| data.clone())
            .collect()
    }

    /// Send a server request; returns its id
    pub fn push_request(&self, method: &str, data: Value) -> u32 {
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1000;
        self.state.send(&WireMessage::Request {
            id,
            method: method.to_string(),
            data,
        });
        id
    }

    pub fn notify(&self, method: &str, data: Value) {
        self.state.send(&WireMessage::Notification {
            method: method.to_string(),
            data,
        });
    }

    /// Wait for the client's answer to server request `id`
    pub async fn answer(&self, id: u32) -> ResponseOutcome {
        eventually("answer to server request", || {
            self.state.answers.lock().contains_key(&id)
        })
        .await;
        self.state.answers.lock().remove(&id).unwrap()
    }

    /// Drop the connection from the server side
    pub fn disconnect(&self) {
        self.state.to_client.lock().take();
    }
}

struct FakeConnector {
    state: Arc<ServerState>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, url: &Url) -> Result<Frames> {
        self.state.urls.lock().push(url.to_string());
        if self.state.refuse.load(Ordering::SeqCst) {
            return Err(Error::ConnectionFailed("connection refused".into()));
        }

        let (to_server, mut from_client) = mpsc::unbounded_channel::<String>();
        let (to_client, client_rx) = mpsc::unbounded_channel::<Result<String>>();
        *self.state.to_client.lock() = Some(to_client);

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            while let Some(frame) = from_client.recv().await {
                state.handle(&frame);
            }
        });

        let incoming = UnboundedReceiverStream::new(client_rx).boxed();
        let outgoing = futures::sink::unfold(to_server, |tx, frame: String| async move {
            tx.send(frame).map_err(|_| Error::ConnectionLost)?;
            Ok::<_, Error>(tx)
        });
        Ok(Frames {
            incoming,
            outgoing: Box::pin(outgoing),
        })
    }
}

#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: MediaKind,
    stopped: AtomicBool,
}

impl FakeTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            kind,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Camera and microphone
#[derive(Default)]
pub struct FakeCapture {
    deny: AtomicBool,
    tracks: Mutex<Vec<Arc<FakeTrack>>>,
}

impl FakeCapture {
    pub fn deny(&self) {
        self.deny.store(true, Ordering::SeqCst);
    }

    pub fn tracks(&self) -> Vec<Arc<FakeTrack>> {
        self.tracks.lock().clone()
    }
}

#[async_trait]
impl MediaCapture for FakeCapture {
    async fn capture(&self, audio: bool, video: bool) -> Result<LocalStream> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(Error::LocalMedia("permission denied".into()));
        }
        let mut stream = LocalStream::default();
        if audio {
            let track = FakeTrack::new("mic", MediaKind::Audio);
            self.tracks.lock().push(Arc::clone(&track));
            stream.audio = Some(track);
        }
        if video {
            let track = FakeTrack::new("camera", MediaKind::Video);
            self.tracks.lock().push(Arc::clone(&track));
            stream.video = Some(track);
        }
        Ok(stream)
    }
}

struct EngineFlags {
    fail_consume: AtomicBool,
    drop_ice_on_produce: AtomicBool,
    hold_consume: AtomicBool,
    consume_gate: Semaphore,
    consume_started: AtomicUsize,
}

impl Default for EngineFlags {
    fn default() -> Self {
        Self {
            fail_consume: AtomicBool::new(false),
            drop_ice_on_produce: AtomicBool::new(false),
            hold_consume: AtomicBool::new(false),
            consume_gate: Semaphore::new(0),
            consume_started: AtomicUsize::new(0),
        }
    }
}

/// Media device emulating the engine's callback order: `connect` runs once,
/// before the first produce/consume on a transport
#[derive(Default)]
pub struct FakeDevice {
    loaded: Mutex<Option<RtpCapabilities>>,
    transports: Mutex<Vec<Arc<FakeTransport>>>,
    flags: Arc<EngineFlags>,
}

impl FakeDevice {
    pub fn fail_consumes(&self) {
        self.flags.fail_consume.store(true, Ordering::SeqCst);
    }

    /// Report an ICE failure while the next produce is waiting for its
    /// server id
    pub fn drop_ice_on_produce(&self) {
        self.flags.drop_ice_on_produce.store(true, Ordering::SeqCst);
    }

    /// Park every consume until [`FakeDevice::release_consume`]
    pub fn hold_consumes(&self) {
        self.flags.hold_consume.store(true, Ordering::SeqCst);
    }

    pub fn release_consume(&self) {
        self.flags.consume_gate.add_permits(1);
    }

    pub fn consumes_started(&self) -> usize {
        self.flags.consume_started.load(Ordering::SeqCst)
    }

    pub fn transport(&self, direction: TransportDirection) -> Arc<FakeTransport> {
        self.transports
            .lock()
            .iter()
            .find(|t| t.direction == direction)
            .cloned()
            .unwrap()
    }

    pub fn transports(&self) -> Vec<Arc<FakeTransport>> {
        self.transports.lock().clone()
    }
}

#[async_trait]
impl MediaDevice for FakeDevice {
    async fn load(&self, router_rtp_capabilities: &RtpCapabilities) -> Result<()> {
        *self.loaded.lock() = Some(router_rtp_capabilities.clone());
        Ok(())
    }

    fn rtp_capabilities(&self) -> Result<RtpCapabilities> {
        self.loaded
            .lock()
            .clone()
            .ok_or_else(|| Error::MediaEngine("device not loaded".into()))
    }

    async fn create_transport(
        &self,
        direction: TransportDirection,
        parameters: TransportParameters,
        negotiator: Arc<dyn TransportNegotiator>,
    ) -> Result<Arc<dyn MediaTransport>> {
        let transport = Arc::new(FakeTransport {
            id: parameters.id.clone(),
            direction,
            parameters,
            negotiator,
            flags: Arc::clone(&self.flags),
            connected: tokio::sync::Mutex::new(false),
            produced: Mutex::new(Vec::new()),
            consumed: Mutex::new(Vec::new()),
            closed_producers: Mutex::new(Vec::new()),
            closed_consumers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.transports.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

pub struct FakeTransport {
    id: TransportId,
    pub direction: TransportDirection,
    pub parameters: TransportParameters,
    negotiator: Arc<dyn TransportNegotiator>,
    flags: Arc<EngineFlags>,
    connected: tokio::sync::Mutex<bool>,
    produced: Mutex<Vec<ProduceOptions>>,
    consumed: Mutex<Vec<ConsumeOptions>>,
    closed_producers: Mutex<Vec<ProducerId>>,
    closed_consumers: Mutex<Vec<ConsumerId>>,
    closed: AtomicBool,
}

impl FakeTransport {
    async fn ensure_connected(&self) -> Result<()> {
        let mut connected = self.connected.lock().await;
        if !*connected {
            self.negotiator
                .connect(json!({"role": "client", "fingerprints": []}))
                .await?;
            *connected = true;
        }
        Ok(())
    }

    /// Report an ICE failure the way an engine would after connecting
    pub fn fail_ice(&self, reason: &str) {
        self.negotiator.connection_failed(reason);
    }

    pub fn produced(&self) -> Vec<ProduceOptions> {
        self.produced.lock().clone()
    }

    pub fn consumed(&self) -> Vec<ConsumeOptions> {
        self.consumed.lock().clone()
    }

    pub fn closed_producers(&self) -> Vec<ProducerId> {
        self.closed_producers.lock().clone()
    }

    pub fn closed_consumers(&self) -> Vec<ConsumerId> {
        self.closed_consumers.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    fn direction(&self) -> TransportDirection {
        self.direction
    }

    async fn produce(&self, options: ProduceOptions) -> Result<ProducedTrack> {
        self.ensure_connected().await?;
        self.produced.lock().push(options.clone());

        let kind = options.track.kind();
        let rtp_parameters = RtpParameters {
            codecs: options
                .codec
                .iter()
                .map(|codec| serde_json::to_value(codec).unwrap())
                .collect(),
            encodings: options.encodings.clone().unwrap_or_default(),
            ..RtpParameters::default()
        };
        if self.flags.drop_ice_on_produce.swap(false, Ordering::SeqCst) {
            self.negotiator.connection_failed("ice dropped");
        }
        let id = self
            .negotiator
            .produce(kind, rtp_parameters.clone(), options.app_data.clone())
            .await?;
        Ok(ProducedTrack {
            id,
            kind,
            track: options.track,
            rtp_parameters,
        })
    }

    async fn consume(&self, options: ConsumeOptions) -> Result<ConsumedTrack> {
        self.ensure_connected().await?;
        self.flags.consume_started.fetch_add(1, Ordering::SeqCst);
        self.consumed.lock().push(options.clone());

        if self.flags.hold_consume.load(Ordering::SeqCst) {
            self.flags.consume_gate.acquire().await.unwrap().forget();
        }
        if self.flags.fail_consume.load(Ordering::SeqCst) {
            return Err(Error::MediaEngine("decoder unavailable".into()));
        }

        Ok(ConsumedTrack {
            id: options.id.clone(),
            kind: options.kind,
            track: FakeTrack::new(format!("remote-{}", options.id), options.kind),
            rtp_parameters: options.rtp_parameters,
        })
    }

    async fn close_producer(&self, id: &ProducerId) {
        self.closed_producers.lock().push(id.clone());
    }

    async fn close_consumer(&self, id: &ConsumerId) {
        self.closed_consumers.lock().push(id.clone());
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Server, engine and capture wired together
pub struct Harness {
    pub server: FakeServer,
    pub device: Arc<FakeDevice>,
    pub capture: Arc<FakeCapture>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            server: FakeServer::new(),
            device: Arc::new(FakeDevice::default()),
            capture: Arc::new(FakeCapture::default()),
        }
    }

    pub fn deps(&self) -> SessionDeps {
        SessionDeps {
            connector: self.server.connector(),
            device: Arc::clone(&self.device) as Arc<dyn MediaDevice>,
            capture: Arc::clone(&self.capture) as Arc<dyn MediaCapture>,
        }
    }
}

pub fn new_consumer(id: &str, peer: &str, kind: &str, scalability_mode: Option<&str>) -> Value {
    let mut encoding = json!({"ssrc": 1111});
    if let Some(mode) = scalability_mode {
        encoding["scalabilityMode"] = json!(mode);
    }
    json!({
        "peerId": peer,
        "producerId": format!("{peer}-{kind}"),
        "id": id,
        "kind": kind,
        "rtpParameters": {"codecs": [], "encodings": [encoding]},
        "type": "simple",
        "appData": {"source": "webcam"},
        "producerPaused": false
    })
}
