//! Producer management
//!
//! Publishes local tracks on the send transport (audio first, then video) and
//! keeps each producer in lockstep with its registry entry.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::MediaConfig;
use crate::encoding::{encodings_for, select_codec};
use crate::error::{Error, Result};
use crate::media::{
    LocalStream, ProduceOptions, RtpCapabilities, RtpCodecCapability, RtpEncodingParameters,
    RtpParameters, TrackHandle,
};
use crate::registry::{TrackEntry, TrackRegistry, TrackRole};
use crate::signaling::protocol::CloseProducer;
use crate::signaling::SignalingChannel;
use crate::transport::ManagedTransport;
use crate::types::{MediaKind, PeerId, ProducerId, TrackId};

/// A published local track
#[derive(Debug, Clone)]
pub struct Producer {
    pub id: ProducerId,
    pub kind: MediaKind,
    /// Engine id of the captured source track
    pub source_track_id: String,
    pub codec: Option<RtpCodecCapability>,
    pub encodings: Option<Vec<RtpEncodingParameters>>,
    pub rtp_parameters: RtpParameters,
    pub track: TrackHandle,
    pub created_at: DateTime<Utc>,
}

impl Producer {
    #[must_use]
    pub fn track_id(&self) -> TrackId {
        TrackId::from(&self.id)
    }
}

pub struct ProducerManager {
    local_peer: PeerId,
    settings: MediaConfig,
    registry: Arc<TrackRegistry>,
    producers: Mutex<HashMap<ProducerId, Producer>>,
    /// Productions awaiting the server id; `true` once `close_all` ran
    in_flight: Mutex<HashMap<u64, bool>>,
    next_attempt: AtomicU64,
    shutdown: CancellationToken,
}

impl ProducerManager {
    #[must_use]
    pub fn new(
        local_peer: PeerId,
        settings: MediaConfig,
        registry: Arc<TrackRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            local_peer,
            settings,
            registry,
            producers: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            next_attempt: AtomicU64::new(0),
            shutdown,
        }
    }

    /// Publish every captured track.
    ///
    /// A missing mandated video codec fails the whole call before anything is
    /// produced. A failed individual production is logged and skipped unless
    /// the error is session-fatal.
    pub async fn publish(
        &self,
        transport: &ManagedTransport,
        stream: &LocalStream,
        capabilities: &RtpCapabilities,
    ) -> Result<Vec<ProducerId>> {
        let video_codec = match &stream.video {
            Some(_) => {
                let codec = select_codec(capabilities, &self.settings.preferred_video_codec)
                    .cloned()
                    .ok_or_else(|| {
                        Error::CodecUnavailable(format!(
                            "{} not offered by the device",
                            self.settings.preferred_video_codec
                        ))
                    })?;
                Some(codec)
            }
            None => None,
        };

        let tracks = [
            stream.audio.clone().map(|track| (track, None)),
            stream.video.clone().map(|track| (track, video_codec)),
        ];

        let mut published = Vec::new();
        for (track, codec) in tracks.into_iter().flatten() {
            let kind = track.kind();
            match self.produce(transport, track, codec).await {
                Ok(id) => published.push(id),
                Err(e) if e.is_session_fatal() || self.shutdown.is_cancelled() => return Err(e),
                Err(e) => error!(kind = %kind, error = %e, "Failed to publish local track"),
            }
        }
        Ok(published)
    }

    async fn produce(
        &self,
        transport: &ManagedTransport,
        track: TrackHandle,
        codec: Option<RtpCodecCapability>,
    ) -> Result<ProducerId> {
        let kind = track.kind();
        let (encodings, codec_options) = match kind {
            MediaKind::Audio => (None, None),
            MediaKind::Video => (
                encodings_for(self.settings.scalability),
                Some(json!({ "videoGoogleStartBitrate": self.settings.video_start_bitrate_kbps })),
            ),
        };

        let options = ProduceOptions {
            track: Arc::clone(&track),
            codec: codec.clone(),
            encodings: encodings.clone(),
            codec_options,
            app_data: Value::Object(serde_json::Map::new()),
        };
        let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        self.in_flight.lock().insert(attempt, false);
        let produced = match transport.produce(options).await {
            Ok(produced) => produced,
            Err(e) => {
                self.in_flight.lock().remove(&attempt);
                return Err(e);
            }
        };

        let producer = Producer {
            id: produced.id.clone(),
            kind,
            source_track_id: track.id().to_string(),
            codec,
            encodings,
            rtp_parameters: produced.rtp_parameters,
            track: Arc::clone(&produced.track),
            created_at: Utc::now(),
        };

        // Decided under the in-flight lock so a concurrent `close_all` either
        // marks this attempt first or finds the registered producer
        let discarded = {
            let mut in_flight = self.in_flight.lock();
            let closed = in_flight.remove(&attempt).unwrap_or(false);
            let state = transport.state();
            if closed || self.shutdown.is_cancelled() || !state.is_usable() {
                Some(state)
            } else {
                self.attach(producer);
                None
            }
        };

        if let Some(state) = discarded {
            transport.close_producer(&produced.id).await;
            track.stop();
            warn!(
                producer_id = %produced.id,
                kind = %kind,
                transport_state = %state,
                "Producer closed before it was ready"
            );
            return Err(Error::InvalidState(format!(
                "producer {} closed before it was ready",
                produced.id
            )));
        }

        info!(producer_id = %produced.id, kind = %kind, "Producer created");
        Ok(produced.id)
    }

    /// Register the producer, then its track entry
    fn attach(&self, producer: Producer) {
        let entry = TrackEntry {
            id: producer.track_id(),
            kind: producer.kind,
            role: TrackRole::Producer,
            peer_id: self.local_peer.clone(),
            track: Arc::clone(&producer.track),
        };
        self.producers.lock().insert(producer.id.clone(), producer);
        self.registry.put(entry);
    }

    /// Stop one producer: close it locally, stop its source and tell the server
    pub async fn stop_producer(
        &self,
        transport: &ManagedTransport,
        channel: &SignalingChannel,
        id: &ProducerId,
    ) -> Result<()> {
        let producer = self.detach(id).ok_or_else(|| {
            Error::InvalidState(format!("unknown producer {id}"))
        })?;

        transport.close_producer(id).await;
        producer.track.stop();

        let request = CloseProducer {
            producer_id: id.clone(),
        };
        if let Err(e) = channel.request(&request).await {
            warn!(producer_id = %id, error = %e, "closeProducer request failed");
        }

        info!(producer_id = %id, kind = %producer.kind, "Producer stopped");
        Ok(())
    }

    /// Drop every producer, closing them on `transport` when given
    pub async fn close_all(&self, transport: Option<&ManagedTransport>) -> Vec<ProducerId> {
        for closed in self.in_flight.lock().values_mut() {
            *closed = true;
        }

        let ids: Vec<ProducerId> = self.producers.lock().keys().cloned().collect();
        let mut closed = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(producer) = self.detach(&id) else {
                continue;
            };
            if let Some(transport) = transport {
                transport.close_producer(&id).await;
            }
            producer.track.stop();
            closed.push(id);
        }
        closed
    }

    /// Remove the registry entry and the producer record together
    fn detach(&self, id: &ProducerId) -> Option<Producer> {
        self.registry.remove(&TrackId::from(id));
        self.producers.lock().remove(id)
    }

    #[must_use]
    pub fn list(&self) -> Vec<Producer> {
        let mut producers: Vec<Producer> = self.producers.lock().values().cloned().collect();
        producers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        producers
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.producers.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.producers.lock().is_empty()
    }
}
