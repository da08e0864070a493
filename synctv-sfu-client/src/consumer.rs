//! Consumer management
//!
//! Reacts to server-driven consumer lifecycle: `newConsumer` requests create
//! a consumer on the receive transport, `consumerClosed` tears it down, and
//! pause/layer notifications update bookkeeping.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::encoding::parse_scalability_mode;
use crate::error::{Error, Result};
use crate::media::{ConsumeOptions, RtpParameters, TrackHandle};
use crate::registry::{TrackEntry, TrackRegistry, TrackRole};
use crate::signaling::protocol::{ConsumerEvent, NewConsumer};
use crate::signaling::RequestResponder;
use crate::transport::ManagedTransport;
use crate::types::{ConsumerId, MediaKind, PeerId, ProducerId, TrackId};

/// A remote track received through the receive transport
#[derive(Debug, Clone)]
pub struct Consumer {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    /// Peer that owns the remote producer
    pub peer_id: PeerId,
    pub kind: MediaKind,
    /// `simple`, `simulcast` or `svc`
    pub consumer_type: String,
    pub rtp_parameters: RtpParameters,
    pub app_data: Value,
    pub track: TrackHandle,
    pub paused: bool,
    pub producer_paused: bool,
    pub spatial_layers: u8,
    pub temporal_layers: u8,
    pub current_spatial_layer: Option<u8>,
    pub current_temporal_layer: Option<u8>,
    pub score: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl Consumer {
    #[must_use]
    pub fn track_id(&self) -> TrackId {
        TrackId::from(&self.id)
    }
}

pub struct ConsumerManager {
    registry: Arc<TrackRegistry>,
    consumers: Mutex<HashMap<ConsumerId, Consumer>>,
    /// Consumers still being created; `true` once a close arrived for them
    in_flight: Mutex<HashMap<ConsumerId, bool>>,
    shutdown: CancellationToken,
}

impl ConsumerManager {
    #[must_use]
    pub fn new(registry: Arc<TrackRegistry>, shutdown: CancellationToken) -> Self {
        Self {
            registry,
            consumers: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Handle a `newConsumer` server request.
    ///
    /// The consumer is marked in flight before this returns, so a closure
    /// notification processed afterwards is honoured even if creation has not
    /// finished. The request is always answered.
    pub fn handle_new_consumer(
        self: &Arc<Self>,
        transport: Option<Arc<ManagedTransport>>,
        request: NewConsumer,
        responder: RequestResponder,
    ) {
        self.in_flight.lock().insert(request.id.clone(), false);

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let consumer_id = request.id.clone();
            match manager.create(transport, request).await {
                Ok(()) => responder.accept(json!({})),
                Err(e) => {
                    warn!(consumer_id = %consumer_id, error = %e, "Failed to create consumer");
                    responder.reject(500, e.to_string());
                }
            }
        });
    }

    async fn create(
        &self,
        transport: Option<Arc<ManagedTransport>>,
        request: NewConsumer,
    ) -> Result<()> {
        let id = request.id.clone();
        let consumer = match self.consume(transport.as_deref(), request).await {
            Ok(consumer) => consumer,
            Err(e) => {
                self.in_flight.lock().remove(&id);
                return Err(e);
            }
        };

        // Decided under the in-flight lock so a concurrent close either
        // marks us first or finds the registered consumer
        let discarded = {
            let mut in_flight = self.in_flight.lock();
            let closed = in_flight.remove(&id).unwrap_or(false);
            let usable = transport.as_ref().is_some_and(|t| t.state().is_usable());
            if closed || !usable || self.shutdown.is_cancelled() {
                Some(consumer)
            } else {
                self.attach(consumer);
                None
            }
        };

        if let Some(consumer) = discarded {
            if let Some(transport) = &transport {
                transport.close_consumer(&id).await;
            }
            consumer.track.stop();
            return Err(Error::InvalidState(format!(
                "consumer {id} closed before it was ready"
            )));
        }
        Ok(())
    }

    /// Register the track entry, then the consumer
    fn attach(&self, consumer: Consumer) {
        self.registry.put(TrackEntry {
            id: consumer.track_id(),
            kind: consumer.kind,
            role: TrackRole::Consumer,
            peer_id: consumer.peer_id.clone(),
            track: Arc::clone(&consumer.track),
        });
        info!(
            consumer_id = %consumer.id,
            producer_id = %consumer.producer_id,
            peer_id = %consumer.peer_id,
            kind = %consumer.kind,
            spatial_layers = consumer.spatial_layers,
            temporal_layers = consumer.temporal_layers,
            "Consumer created"
        );
        self.consumers.lock().insert(consumer.id.clone(), consumer);
    }

    async fn consume(
        &self,
        transport: Option<&ManagedTransport>,
        request: NewConsumer,
    ) -> Result<Consumer> {
        let transport = transport
            .ok_or_else(|| Error::InvalidState("no receive transport".to_string()))?;

        let NewConsumer {
            peer_id,
            producer_id,
            id,
            kind,
            rtp_parameters,
            consumer_type,
            app_data,
            producer_paused,
        } = request;
        let app_data = with_peer_id(app_data, &peer_id);

        let consumed = transport
            .consume(ConsumeOptions {
                id: id.clone(),
                producer_id: producer_id.clone(),
                kind,
                rtp_parameters,
                app_data: app_data.clone(),
            })
            .await?;

        let scalability = parse_scalability_mode(
            consumed
                .rtp_parameters
                .encodings
                .first()
                .and_then(|encoding| encoding.scalability_mode.as_deref()),
        );

        Ok(Consumer {
            id,
            producer_id,
            peer_id,
            kind,
            consumer_type,
            rtp_parameters: consumed.rtp_parameters,
            app_data,
            track: consumed.track,
            paused: false,
            producer_paused,
            spatial_layers: scalability.spatial_layers,
            temporal_layers: scalability.temporal_layers,
            current_spatial_layer: None,
            current_temporal_layer: None,
            score: None,
            created_at: Utc::now(),
        })
    }

    /// Handle `consumerClosed`; unknown ids are a no-op
    pub async fn handle_consumer_closed(
        &self,
        transport: Option<&ManagedTransport>,
        id: &ConsumerId,
    ) -> bool {
        {
            let mut in_flight = self.in_flight.lock();
            if let Some(closed) = in_flight.get_mut(id) {
                debug!(consumer_id = %id, "Close arrived while consumer is being created");
                *closed = true;
                return true;
            }
        }

        let Some(consumer) = self.detach(id) else {
            debug!(consumer_id = %id, "Close for unknown consumer ignored");
            return false;
        };
        if let Some(transport) = transport {
            transport.close_consumer(id).await;
        }
        consumer.track.stop();
        info!(consumer_id = %id, peer_id = %consumer.peer_id, "Consumer closed");
        true
    }

    /// Apply pause/resume/layer/score bookkeeping; unknown ids are a no-op
    pub fn handle_consumer_event(&self, event: &ConsumerEvent) -> bool {
        let mut consumers = self.consumers.lock();
        let Some(consumer) = consumers.get_mut(event.consumer_id()) else {
            debug!(consumer_id = %event.consumer_id(), "Event for unknown consumer ignored");
            return false;
        };

        match event {
            ConsumerEvent::Paused(_) => consumer.paused = true,
            ConsumerEvent::Resumed(_) => consumer.paused = false,
            ConsumerEvent::LayersChanged(layers) => {
                consumer.current_spatial_layer = layers.spatial_layer;
                consumer.current_temporal_layer = layers.temporal_layer;
            }
            ConsumerEvent::Score(score) => consumer.score = Some(score.score.clone()),
        }
        debug!(consumer_id = %consumer.id, event = ?event, "Consumer updated");
        true
    }

    /// Drop every consumer, closing them on `transport` when given
    pub async fn close_all(&self, transport: Option<&ManagedTransport>) -> Vec<ConsumerId> {
        for closed in self.in_flight.lock().values_mut() {
            *closed = true;
        }

        let ids: Vec<ConsumerId> = self.consumers.lock().keys().cloned().collect();
        let mut closed = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(consumer) = self.detach(&id) else {
                continue;
            };
            if let Some(transport) = transport {
                transport.close_consumer(&id).await;
            }
            consumer.track.stop();
            closed.push(id);
        }
        closed
    }

    fn detach(&self, id: &ConsumerId) -> Option<Consumer> {
        self.registry.remove(&TrackId::from(id));
        self.consumers.lock().remove(id)
    }

    #[must_use]
    pub fn list(&self) -> Vec<Consumer> {
        let mut consumers: Vec<Consumer> = self.consumers.lock().values().cloned().collect();
        consumers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        consumers
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.consumers.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.consumers.lock().is_empty()
    }
}

/// Merge the owning peer id into the consumer's app data
fn with_peer_id(app_data: Value, peer_id: &PeerId) -> Value {
    let mut map = match app_data {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    map.insert("peerId".to_string(), Value::String(peer_id.to_string()));
    Value::Object(map)
}
