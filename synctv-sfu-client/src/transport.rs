//! Transport management
//!
//! Creates the send and receive transports from server-issued parameters and
//! binds each one to a [`SignalingNegotiator`]. The negotiator is what the
//! media engine suspends on: DTLS `connect` (once, before the first
//! produce/consume) and producer id assignment.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::media::{
    ConsumeOptions, ConsumedTrack, MediaDevice, MediaTransport, ProduceOptions, ProducedTrack,
    RtpParameters, TransportDirection, TransportNegotiator,
};
use crate::signaling::protocol::{ConnectWebRtcTransport, CreateWebRtcTransport, Produce};
use crate::signaling::SignalingChannel;
use crate::types::{ConsumerId, MediaKind, ProducerId, TransportId};

/// Transport lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Created,
    Connecting,
    Connected,
    Closed,
    Failed,
}

impl TransportState {
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        !matches!(self, Self::Closed | Self::Failed)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A transport that stopped working
#[derive(Debug, Clone)]
pub struct TransportFailure {
    pub transport_id: TransportId,
    pub direction: TransportDirection,
    pub reason: String,
}

/// Answers the media engine's negotiation callbacks over signaling
pub struct SignalingNegotiator {
    transport_id: TransportId,
    direction: TransportDirection,
    channel: SignalingChannel,
    state: RwLock<TransportState>,
    connect_gate: Mutex<()>,
    failures: mpsc::UnboundedSender<TransportFailure>,
}

impl SignalingNegotiator {
    fn new(
        transport_id: TransportId,
        direction: TransportDirection,
        channel: SignalingChannel,
        failures: mpsc::UnboundedSender<TransportFailure>,
    ) -> Self {
        Self {
            transport_id,
            direction,
            channel,
            state: RwLock::new(TransportState::Created),
            connect_gate: Mutex::new(()),
            failures,
        }
    }

    #[must_use]
    pub fn state(&self) -> TransportState {
        *self.state.read()
    }

    fn set_state(&self, state: TransportState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!(
                transport_id = %self.transport_id,
                direction = %self.direction,
                from = %previous,
                to = %state,
                "Transport state changed"
            );
        }
    }

    /// Mark failed and report once
    fn fail(&self, reason: &str) {
        {
            let mut state = self.state.write();
            if !state.is_usable() {
                return;
            }
            *state = TransportState::Failed;
        }
        warn!(
            transport_id = %self.transport_id,
            direction = %self.direction,
            reason,
            "Transport failed"
        );
        let _ = self.failures.send(TransportFailure {
            transport_id: self.transport_id.clone(),
            direction: self.direction,
            reason: reason.to_string(),
        });
    }

    fn mark_closed(&self) {
        self.set_state(TransportState::Closed);
    }
}

#[async_trait]
impl TransportNegotiator for SignalingNegotiator {
    async fn connect(&self, dtls_parameters: Value) -> Result<()> {
        let _gate = self.connect_gate.lock().await;

        match self.state() {
            TransportState::Connected => return Ok(()),
            TransportState::Closed | TransportState::Failed => {
                return Err(Error::Negotiation(format!(
                    "transport {} is {}",
                    self.transport_id,
                    self.state()
                )));
            }
            TransportState::Created | TransportState::Connecting => {}
        }

        self.set_state(TransportState::Connecting);
        let request = ConnectWebRtcTransport {
            transport_id: self.transport_id.clone(),
            dtls_parameters,
        };
        match self.channel.request(&request).await {
            Ok(_) => {
                self.set_state(TransportState::Connected);
                info!(
                    transport_id = %self.transport_id,
                    direction = %self.direction,
                    "Transport connected"
                );
                Ok(())
            }
            Err(e) => {
                self.fail(&e.to_string());
                Err(Error::Negotiation(format!(
                    "connect of transport {} failed: {e}",
                    self.transport_id
                )))
            }
        }
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: Value,
    ) -> Result<ProducerId> {
        if self.direction != TransportDirection::Send {
            return Err(Error::InvalidState(format!(
                "cannot produce on {} transport {}",
                self.direction, self.transport_id
            )));
        }

        let request = Produce {
            transport_id: self.transport_id.clone(),
            kind,
            rtp_parameters,
            app_data,
        };
        let response = self.channel.request(&request).await?;
        debug!(
            transport_id = %self.transport_id,
            producer_id = %response.id,
            kind = %kind,
            "Server assigned producer id"
        );
        Ok(response.id)
    }

    fn connection_failed(&self, reason: &str) {
        self.fail(reason);
    }
}

/// A media transport together with its negotiation state
pub struct ManagedTransport {
    negotiator: Arc<SignalingNegotiator>,
    media: Arc<dyn MediaTransport>,
}

impl ManagedTransport {
    #[must_use]
    pub fn id(&self) -> &TransportId {
        &self.negotiator.transport_id
    }

    #[must_use]
    pub fn direction(&self) -> TransportDirection {
        self.negotiator.direction
    }

    #[must_use]
    pub fn state(&self) -> TransportState {
        self.negotiator.state()
    }

    fn ensure_usable(&self) -> Result<()> {
        let state = self.state();
        if state.is_usable() {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "{} transport {} is {state}",
                self.direction(),
                self.id()
            )))
        }
    }

    pub async fn produce(&self, options: ProduceOptions) -> Result<ProducedTrack> {
        self.ensure_usable()?;
        self.media.produce(options).await
    }

    pub async fn consume(&self, options: ConsumeOptions) -> Result<ConsumedTrack> {
        self.ensure_usable()?;
        self.media.consume(options).await
    }

    pub async fn close_producer(&self, id: &ProducerId) {
        self.media.close_producer(id).await;
    }

    pub async fn close_consumer(&self, id: &ConsumerId) {
        self.media.close_consumer(id).await;
    }

    pub async fn close(&self) {
        if self.state() == TransportState::Closed {
            return;
        }
        self.negotiator.mark_closed();
        self.media.close().await;
        info!(transport_id = %self.id(), direction = %self.direction(), "Transport closed");
    }
}

/// Owns at most one send and one receive transport per session
pub struct TransportManager {
    channel: SignalingChannel,
    device: Arc<dyn MediaDevice>,
    force_tcp: bool,
    send: OnceLock<Arc<ManagedTransport>>,
    recv: OnceLock<Arc<ManagedTransport>>,
    create_lock: Mutex<()>,
    failures: mpsc::UnboundedSender<TransportFailure>,
}

impl TransportManager {
    /// Create a manager; failures of its transports are reported on the returned receiver
    #[must_use]
    pub fn new(
        channel: SignalingChannel,
        device: Arc<dyn MediaDevice>,
        force_tcp: bool,
    ) -> (Self, mpsc::UnboundedReceiver<TransportFailure>) {
        let (failures, failures_rx) = mpsc::unbounded_channel();
        let manager = Self {
            channel,
            device,
            force_tcp,
            send: OnceLock::new(),
            recv: OnceLock::new(),
            create_lock: Mutex::new(()),
            failures,
        };
        (manager, failures_rx)
    }

    const fn slot(&self, direction: TransportDirection) -> &OnceLock<Arc<ManagedTransport>> {
        match direction {
            TransportDirection::Send => &self.send,
            TransportDirection::Recv => &self.recv,
        }
    }

    /// Request server-side parameters and build the local transport from them
    pub async fn create_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<Arc<ManagedTransport>> {
        let _guard = self.create_lock.lock().await;
        let slot = self.slot(direction);
        if slot.get().is_some() {
            return Err(Error::InvalidState(format!(
                "{direction} transport already exists"
            )));
        }

        let request = CreateWebRtcTransport {
            force_tcp: self.force_tcp,
            producing: direction == TransportDirection::Send,
            consuming: direction == TransportDirection::Recv,
        };
        let parameters = self.channel.request(&request).await?;
        let transport_id = parameters.id.clone();

        let negotiator = Arc::new(SignalingNegotiator::new(
            transport_id.clone(),
            direction,
            self.channel.clone(),
            self.failures.clone(),
        ));
        let media = self
            .device
            .create_transport(
                direction,
                parameters,
                Arc::clone(&negotiator) as Arc<dyn TransportNegotiator>,
            )
            .await?;
        if media.id() != &transport_id {
            warn!(
                expected = %transport_id,
                actual = %media.id(),
                "Media engine reported a different transport id"
            );
        }

        let transport = Arc::new(ManagedTransport { negotiator, media });
        slot.set(Arc::clone(&transport))
            .map_err(|_| Error::InvalidState(format!("{direction} transport already exists")))?;

        info!(transport_id = %transport_id, direction = %direction, "Transport created");
        Ok(transport)
    }

    #[must_use]
    pub fn transport(&self, direction: TransportDirection) -> Option<Arc<ManagedTransport>> {
        self.slot(direction).get().cloned()
    }

    #[must_use]
    pub fn send_transport(&self) -> Option<Arc<ManagedTransport>> {
        self.transport(TransportDirection::Send)
    }

    #[must_use]
    pub fn recv_transport(&self) -> Option<Arc<ManagedTransport>> {
        self.transport(TransportDirection::Recv)
    }

    /// Close every transport that was created
    pub async fn close_all(&self) {
        for direction in [TransportDirection::Send, TransportDirection::Recv] {
            if let Some(transport) = self.transport(direction) {
                transport.close().await;
            }
        }
    }
}
