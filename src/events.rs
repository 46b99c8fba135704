use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Extension;
use axum::response::sse::{Event, Sse};
use dashmap::DashMap;
use futures_util::Stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{IntervalStream, UnboundedReceiverStream};
use tokio_stream::{self as stream, StreamExt};
use tracing::debug;
use uuid::Uuid;

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Lifecycle events pushed to SSE subscribers and mirrored onto the
/// outbound webhook queue by the coordinator.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    #[serde(rename_all = "camelCase")]
    Connected { client_id: Uuid },
    Ping,
    #[serde(rename_all = "camelCase")]
    ExtractionComplete {
        certificate_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        property_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ExtractionFailed {
        certificate_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        property_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    PropertyUpdated { property_id: Uuid },
    #[serde(rename_all = "camelCase")]
    CertificateUpdated {
        certificate_id: Uuid,
        status: String,
    },
}

/// Process-local fan-out of lifecycle events. Send failures mean the
/// subscriber hung up; those clients are evicted on the next broadcast.
#[derive(Clone, Default)]
pub struct EventBroadcaster {
    clients: Arc<DashMap<Uuid, mpsc::UnboundedSender<LifecycleEvent>>>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> (Uuid, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let client_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.clients.insert(client_id, tx);
        (client_id, rx)
    }

    pub fn broadcast(&self, event: LifecycleEvent) {
        let mut gone = Vec::new();
        for entry in self.clients.iter() {
            if entry.value().send(event.clone()).is_err() {
                gone.push(*entry.key());
            }
        }
        for client_id in gone {
            debug!(%client_id, "removing disconnected SSE client");
            self.clients.remove(&client_id);
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    fn remove(&self, client_id: &Uuid) {
        self.clients.remove(client_id);
    }
}

struct SubscriptionGuard {
    client_id: Uuid,
    broadcaster: EventBroadcaster,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.broadcaster.remove(&self.client_id);
    }
}

/// `GET /events`: emits a `connected` frame, then lifecycle events as they
/// are broadcast, with a `ping` frame every 30 seconds.
pub async fn sse_handler(
    Extension(broadcaster): Extension<EventBroadcaster>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (client_id, rx) = broadcaster.subscribe();
    let guard = SubscriptionGuard {
        client_id,
        broadcaster: broadcaster.clone(),
    };

    let connected = stream::once(LifecycleEvent::Connected { client_id });
    let events = UnboundedReceiverStream::new(rx);
    // The first interval tick fires immediately; skip it so pings start
    // thirty seconds after connect.
    let pings = IntervalStream::new(tokio::time::interval(PING_INTERVAL))
        .skip(1)
        .map(|_| LifecycleEvent::Ping);

    let frames = connected.chain(events.merge(pings)).map(move |event| {
        let _held = &guard;
        Ok(Event::default()
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().data("{}")))
    });

    Sse::new(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_all_subscribers() {
        let broadcaster = EventBroadcaster::new();
        let (_, mut rx_a) = broadcaster.subscribe();
        let (_, mut rx_b) = broadcaster.subscribe();

        broadcaster.broadcast(LifecycleEvent::PropertyUpdated {
            property_id: Uuid::new_v4(),
        });

        assert!(matches!(
            rx_a.recv().await,
            Some(LifecycleEvent::PropertyUpdated { .. })
        ));
        assert!(matches!(
            rx_b.recv().await,
            Some(LifecycleEvent::PropertyUpdated { .. })
        ));
    }

    #[tokio::test]
    async fn dropped_subscribers_are_evicted_on_broadcast() {
        let broadcaster = EventBroadcaster::new();
        let (_, rx) = broadcaster.subscribe();
        drop(rx);
        assert_eq!(broadcaster.client_count(), 1);

        broadcaster.broadcast(LifecycleEvent::Ping);
        assert_eq!(broadcaster.client_count(), 0);
    }

    #[test]
    fn events_serialise_with_snake_case_type_and_camel_case_fields() {
        let certificate_id = Uuid::new_v4();
        let event = LifecycleEvent::ExtractionComplete {
            certificate_id,
            property_id: None,
            status: Some("NEEDS_REVIEW".into()),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "extraction_complete");
        assert_eq!(value["certificateId"], certificate_id.to_string());
        assert_eq!(value["status"], "NEEDS_REVIEW");
        assert!(value.get("propertyId").is_none());
    }
}
