//! Cross-process fan-out of appended stream events.
//!
//! Writers publish a [`BroadcastSignal`] on a [`MessageBus`] topic; every server process
//! subscribes to that topic and hands resolved events to its local [`hub::ConnectionHub`].

pub mod hub;
pub mod memory;
pub mod postgres;

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tandem_common::protocol::events::StreamEvent;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::streams::StreamEventLog;
use hub::ConnectionHub;

pub const STREAM_EVENTS_TOPIC: &str = "tandem_stream_events";

/// PostgreSQL rejects NOTIFY payloads of 8000 bytes or more.
pub const MAX_INLINE_SIGNAL_BYTES: usize = 7_900;

/// Minimal publish/subscribe contract over named topics. Delivery is best-effort.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: String) -> anyhow::Result<()>;

    /// Returns a receiver of every payload published on `topic` after this call returns.
    /// Dropping the receiver ends the subscription.
    async fn subscribe(&self, topic: &str) -> anyhow::Result<mpsc::Receiver<String>>;

    /// True when a payload can be published from inside the event store's own transaction and
    /// is delivered at commit.
    fn notifies_on_commit(&self) -> bool {
        false
    }
}

/// What travels on the bus for one appended event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BroadcastSignal {
    Event { event: StreamEvent },
    /// Sent when the inline form is too large; receivers read the event back from the log.
    Pointer { workspace_id: Uuid, stream_id: String, sequence: i64 },
}

impl BroadcastSignal {
    pub fn encode(event: &StreamEvent) -> anyhow::Result<String> {
        let inline = serde_json::to_string(&BroadcastSignal::Event { event: event.clone() })
            .context("failed to encode stream event signal")?;
        if inline.len() <= MAX_INLINE_SIGNAL_BYTES {
            return Ok(inline);
        }

        serde_json::to_string(&BroadcastSignal::Pointer {
            workspace_id: event.workspace_id,
            stream_id: event.stream_id.clone(),
            sequence: event.sequence,
        })
        .context("failed to encode stream event pointer")
    }

    pub fn decode(payload: &str) -> anyhow::Result<Self> {
        serde_json::from_str(payload).context("malformed stream event signal")
    }
}

/// Publishing half used by the stream event log after every successful write.
#[derive(Clone)]
pub struct EventBroadcaster {
    bus: Arc<dyn MessageBus>,
    topic: String,
}

impl EventBroadcaster {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self::with_topic(bus, STREAM_EVENTS_TOPIC)
    }

    pub fn with_topic(bus: Arc<dyn MessageBus>, topic: impl Into<String>) -> Self {
        Self { bus, topic: topic.into() }
    }

    pub fn bus(&self) -> Arc<dyn MessageBus> {
        Arc::clone(&self.bus)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn notifies_on_commit(&self) -> bool {
        self.bus.notifies_on_commit()
    }

    /// A failed publish is logged, not returned: the event is already durable and clients
    /// recover it with a catch-up read.
    pub async fn publish(&self, event: &StreamEvent) {
        let payload = match BroadcastSignal::encode(event) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(error = ?error, stream_id = %event.stream_id, "skipping broadcast");
                return;
            }
        };

        if let Err(error) = self.bus.publish(&self.topic, payload).await {
            warn!(
                error = ?error,
                stream_id = %event.stream_id,
                sequence = event.sequence,
                "stream event broadcast failed"
            );
        }
    }
}

/// Subscribes this process to the broadcaster's topic and forwards every signal to `hub`.
///
/// The subscription is established before this returns, so events written afterwards are
/// never missed by the fan-out task.
pub async fn start_fanout(
    broadcaster: &EventBroadcaster,
    log: StreamEventLog,
    hub: ConnectionHub,
    cancel: CancellationToken,
) -> anyhow::Result<JoinHandle<()>> {
    let mut signals = broadcaster
        .bus()
        .subscribe(broadcaster.topic())
        .await
        .context("failed to subscribe to stream event topic")?;
    info!(topic = broadcaster.topic(), "stream event fan-out subscribed");

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                signal = signals.recv() => {
                    let Some(payload) = signal else {
                        warn!("stream event bus closed; fan-out stopping");
                        break;
                    };
                    match resolve_signal(&log, &payload).await {
                        Ok(Some(event)) => {
                            hub.dispatch(&Arc::new(event));
                        }
                        Ok(None) => debug!("signal referenced an event that is no longer stored"),
                        Err(error) => warn!(error = ?error, "dropping undeliverable stream event signal"),
                    }
                }
            }
        }
        info!("stream event fan-out stopped");
    }))
}

async fn resolve_signal(log: &StreamEventLog, payload: &str) -> anyhow::Result<Option<StreamEvent>> {
    match BroadcastSignal::decode(payload)? {
        BroadcastSignal::Event { event } => Ok(Some(event)),
        BroadcastSignal::Pointer { workspace_id, stream_id, sequence } => log
            .read_event(workspace_id, &stream_id, sequence)
            .await
            .map_err(|error| anyhow::anyhow!(error)),
    }
}
