//! Session orchestration
//!
//! Drives one conference session end to end:
//!
//! 1. capture local media (before any signaling)
//! 2. open the signaling channel and start the event loop
//! 3. load router capabilities, create send and receive transports
//! 4. join the room and publish local tracks
//!
//! The event loop consumes server requests and notifications in wire order.
//! `newConsumer` requests run in their own task so acceptance never blocks
//! the loop. Teardown runs exactly once, on the event loop, whatever
//! triggered it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::consumer::{Consumer, ConsumerManager};
use crate::error::{Error, Result};
use crate::media::{DeviceInfo, LocalStream, MediaCapture, MediaDevice, TransportDirection};
use crate::producer::{Producer, ProducerManager};
use crate::registry::TrackRegistry;
use crate::signaling::protocol::{ActiveSpeaker, GetRouterRtpCapabilities, Join, PeerInfo};
use crate::signaling::{
    ConnectionState, Connector, IncomingRequest, ServerNotification, ServerRequest,
    SignalingChannel, SignalingEvent,
};
use crate::transport::{TransportFailure, TransportManager};
use crate::types::{PeerId, ProducerId};

/// External capabilities a session is built on
#[derive(Clone)]
pub struct SessionDeps {
    pub connector: Arc<dyn Connector>,
    pub device: Arc<dyn MediaDevice>,
    pub capture: Arc<dyn MediaCapture>,
}

/// Another participant in the room
#[derive(Debug, Clone)]
pub struct RemotePeer {
    pub id: PeerId,
    pub display_name: Option<String>,
    pub device: Option<Value>,
    pub joined_at: DateTime<Utc>,
}

impl From<PeerInfo> for RemotePeer {
    fn from(info: PeerInfo) -> Self {
        Self {
            id: info.id,
            display_name: info.display_name,
            device: info.device,
            joined_at: Utc::now(),
        }
    }
}

struct SessionShared {
    peer_id: PeerId,
    config: ClientConfig,
    channel: SignalingChannel,
    transports: TransportManager,
    producers: ProducerManager,
    consumers: Arc<ConsumerManager>,
    registry: Arc<TrackRegistry>,
    peers: DashMap<PeerId, RemotePeer>,
    active_speaker: RwLock<Option<PeerId>>,
    local_stream: LocalStream,
    /// Requests teardown
    shutdown: CancellationToken,
    /// Fired once teardown has finished
    finished: CancellationToken,
}

/// A running conference session
pub struct Session {
    shared: Arc<SessionShared>,
    event_loop: Option<JoinHandle<()>>,
}

impl Session {
    /// Start a session and run it up to published local tracks.
    ///
    /// Any failure before the session is joined (and a missing mandated video
    /// codec) releases everything acquired so far and is returned.
    pub async fn start(config: ClientConfig, deps: SessionDeps) -> Result<Self> {
        config.validate()?;
        let SessionDeps {
            connector,
            device,
            capture,
        } = deps;

        let local_stream = capture
            .capture(config.media.produce_audio, config.media.produce_video)
            .await
            .map_err(|e| match e {
                Error::LocalMedia(_) => e,
                other => Error::LocalMedia(other.to_string()),
            })?;

        let peer_id = config
            .signaling
            .peer_id
            .as_deref()
            .map_or_else(PeerId::generate, PeerId::from);

        let opened = match config.signaling.url(&peer_id) {
            Ok(url) => {
                info!(
                    peer_id = %peer_id,
                    room_id = %config.signaling.room_id,
                    "Starting session"
                );
                SignalingChannel::connect(
                    connector.as_ref(),
                    &url,
                    config.signaling.request_timeout(),
                )
                .await
            }
            Err(e) => Err(e),
        };
        let (channel, events) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                local_stream.stop();
                return Err(e);
            }
        };

        let registry = Arc::new(TrackRegistry::new());
        let shutdown = CancellationToken::new();
        let (transports, failures) = TransportManager::new(
            channel.clone(),
            Arc::clone(&device),
            config.media.force_tcp,
        );
        let producers = ProducerManager::new(
            peer_id.clone(),
            config.media.clone(),
            Arc::clone(&registry),
            shutdown.clone(),
        );
        let consumers = Arc::new(ConsumerManager::new(Arc::clone(&registry), shutdown.clone()));

        let shared = Arc::new(SessionShared {
            peer_id,
            config,
            channel,
            transports,
            producers,
            consumers,
            registry,
            peers: DashMap::new(),
            active_speaker: RwLock::new(None),
            local_stream,
            shutdown,
            finished: CancellationToken::new(),
        });

        let event_loop = tokio::spawn(run_event_loop(Arc::clone(&shared), events, failures));
        let mut session = Self {
            shared,
            event_loop: Some(event_loop),
        };

        if let Err(e) = session.shared.negotiate(device.as_ref()).await {
            error!(peer_id = %session.shared.peer_id, error = %e, "Session startup failed");
            session.shutdown_and_wait().await;
            return Err(e);
        }

        info!(
            peer_id = %session.shared.peer_id,
            producers = session.shared.producers.len(),
            "Session started"
        );
        Ok(session)
    }

    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.shared.peer_id
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.channel.state()
    }

    #[must_use]
    pub fn subscribe_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.channel.subscribe_state()
    }

    /// Tracks for the rendering layer
    #[must_use]
    pub fn registry(&self) -> Arc<TrackRegistry> {
        Arc::clone(&self.shared.registry)
    }

    #[must_use]
    pub fn producers(&self) -> Vec<Producer> {
        self.shared.producers.list()
    }

    #[must_use]
    pub fn consumers(&self) -> Vec<Consumer> {
        self.shared.consumers.list()
    }

    /// Remote peers currently in the room
    #[must_use]
    pub fn peers(&self) -> Vec<RemotePeer> {
        let mut peers: Vec<RemotePeer> =
            self.shared.peers.iter().map(|p| p.value().clone()).collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    #[must_use]
    pub fn active_speaker(&self) -> Option<PeerId> {
        self.shared.active_speaker.read().clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.finished.is_cancelled()
    }

    /// Stop publishing one local track
    pub async fn stop_producer(&self, id: &ProducerId) -> Result<()> {
        if self.shared.shutdown.is_cancelled() {
            return Err(Error::InvalidState("session is closing".to_string()));
        }
        let transport = self
            .shared
            .transports
            .send_transport()
            .ok_or_else(|| Error::InvalidState("no send transport".to_string()))?;
        self.shared
            .producers
            .stop_producer(&transport, &self.shared.channel, id)
            .await
    }

    /// Resolves once the session has been torn down for any reason
    pub async fn closed(&self) {
        self.shared.finished.cancelled().await;
    }

    /// Stop the session and release everything it owns
    pub async fn stop(mut self) {
        info!(peer_id = %self.shared.peer_id, "Stopping session");
        self.shutdown_and_wait().await;
    }

    async fn shutdown_and_wait(&mut self) {
        self.shared.shutdown.cancel();
        if let Some(handle) = self.event_loop.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Session event loop panicked");
                self.shared.teardown("event loop panicked").await;
            }
        }
        self.shared.finished.cancelled().await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // The event loop tears down on its own once cancelled
        self.shared.shutdown.cancel();
    }
}

impl SessionShared {
    async fn negotiate(&self, device: &dyn MediaDevice) -> Result<()> {
        let router_capabilities = self.channel.request(&GetRouterRtpCapabilities {}).await?;
        device.load(&router_capabilities).await?;
        debug!(
            codecs = router_capabilities.codecs.len(),
            "Device loaded router capabilities"
        );

        let send = self
            .transports
            .create_transport(TransportDirection::Send)
            .await?;
        self.transports
            .create_transport(TransportDirection::Recv)
            .await?;

        let rtp_capabilities = device.rtp_capabilities()?;
        let joined = self
            .channel
            .request(&Join {
                display_name: self.config.media.display_name.clone(),
                device: DeviceInfo::default(),
                rtp_capabilities: rtp_capabilities.clone(),
            })
            .await?;
        for peer in joined.peers {
            self.add_peer(peer);
        }
        info!(
            peer_id = %self.peer_id,
            room_id = %self.config.signaling.room_id,
            peers = self.peers.len(),
            "Joined room"
        );

        self.producers
            .publish(&send, &self.local_stream, &rtp_capabilities)
            .await?;
        Ok(())
    }

    fn add_peer(&self, info: PeerInfo) {
        if info.id == self.peer_id {
            return;
        }
        debug!(peer_id = %info.id, "Peer joined");
        let peer = RemotePeer::from(info);
        self.peers.insert(peer.id.clone(), peer);
    }

    fn handle_request(self: &Arc<Self>, incoming: IncomingRequest) {
        let IncomingRequest { request, responder } = incoming;
        match request {
            ServerRequest::NewConsumer(request) => {
                let transport = self.transports.recv_transport();
                self.consumers
                    .handle_new_consumer(transport, request, responder);
            }
            ServerRequest::Unknown { method, .. } => {
                warn!(method = %method, "Rejecting unknown server request");
                responder.reject(404, format!("unknown method '{method}'"));
            }
        }
    }

    async fn handle_notification(&self, notification: ServerNotification) {
        match notification {
            ServerNotification::NewPeer(info) => self.add_peer(info),
            ServerNotification::PeerClosed(closed) => {
                if self.peers.remove(&closed.peer_id).is_some() {
                    debug!(peer_id = %closed.peer_id, "Peer left");
                }
                let mut speaker = self.active_speaker.write();
                if speaker.as_ref() == Some(&closed.peer_id) {
                    *speaker = None;
                }
            }
            ServerNotification::ConsumerClosed(closed) => {
                let transport = self.transports.recv_transport();
                self.consumers
                    .handle_consumer_closed(transport.as_deref(), &closed.consumer_id)
                    .await;
            }
            ServerNotification::ActiveSpeaker(ActiveSpeaker { peer_id, volume }) => {
                debug!(peer_id = ?peer_id, volume = ?volume, "Active speaker");
                *self.active_speaker.write() = peer_id;
            }
            ServerNotification::Consumer(event) => {
                self.consumers.handle_consumer_event(&event);
            }
            ServerNotification::Ignored { method } => {
                debug!(method = %method, "Notification ignored");
            }
        }
    }

    /// Release everything built on a failed transport
    async fn handle_transport_failure(&self, failure: TransportFailure) {
        error!(
            transport_id = %failure.transport_id,
            direction = %failure.direction,
            reason = %failure.reason,
            "Transport failed, releasing its media"
        );
        let transport = self.transports.transport(failure.direction);
        match failure.direction {
            TransportDirection::Send => {
                let closed = self.producers.close_all(transport.as_deref()).await;
                debug!(count = closed.len(), "Producers released");
            }
            TransportDirection::Recv => {
                let closed = self.consumers.close_all(transport.as_deref()).await;
                debug!(count = closed.len(), "Consumers released");
            }
        }
        if let Some(transport) = transport {
            transport.close().await;
        }
    }

    async fn teardown(&self, reason: &str) {
        if self.finished.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        info!(peer_id = %self.peer_id, reason, "Tearing down session");

        let recv = self.transports.recv_transport();
        self.consumers.close_all(recv.as_deref()).await;
        let send = self.transports.send_transport();
        self.producers.close_all(send.as_deref()).await;
        self.transports.close_all().await;

        self.local_stream.stop();
        self.registry.clear();
        self.peers.clear();
        *self.active_speaker.write() = None;
        self.channel.close();

        self.finished.cancel();
        info!(peer_id = %self.peer_id, "Session closed");
    }
}

async fn run_event_loop(
    shared: Arc<SessionShared>,
    mut events: mpsc::UnboundedReceiver<SignalingEvent>,
    mut failures: mpsc::UnboundedReceiver<TransportFailure>,
) {
    let reason = loop {
        tokio::select! {
            biased;
            () = shared.shutdown.cancelled() => break "stopped",
            event = events.recv() => match event {
                Some(SignalingEvent::Request(incoming)) => shared.handle_request(incoming),
                Some(SignalingEvent::Notification(notification)) => {
                    shared.handle_notification(notification).await;
                }
                Some(SignalingEvent::Closed(ConnectionState::Failed)) => {
                    break "signaling connection failed"
                }
                Some(SignalingEvent::Closed(_)) | None => break "signaling connection closed",
            },
            Some(failure) = failures.recv() => shared.handle_transport_failure(failure).await,
        }
    };
    shared.teardown(reason).await;
}
