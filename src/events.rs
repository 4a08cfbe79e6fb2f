//! In-process fan-out of observability events.
//!
//! Publishing never blocks and never fails the caller; events published
//! while nobody is subscribed are dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::shutdown::ShutdownListener;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    WorkStarted,
    WorkFinished,
    RequestComplete,
    TunnelEstablished,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub request_id: Uuid,
    pub process_id: u32,
    pub thread_id: String,
    pub event_timestamp: DateTime<Utc>,
    pub event_name: EventName,
    pub event_payload: serde_json::Value,
    pub publisher_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EventQueue {
    tx: broadcast::Sender<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(
        &self,
        request_id: Uuid,
        event_name: EventName,
        event_payload: serde_json::Value,
        publisher_id: Option<&str>,
    ) {
        let event = Event {
            request_id,
            process_id: std::process::id(),
            thread_id: format!("{:?}", std::thread::current().id()),
            event_timestamp: Utc::now(),
            event_name,
            event_payload,
            publisher_id: publisher_id.map(str::to_string),
        };
        // Err only means there are no subscribers
        let _ = self.tx.send(event);
    }

    /// Drop the returned receiver to unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Log every event until shutdown.
pub async fn run_dispatcher(mut events: broadcast::Receiver<Event>, mut shutdown: ShutdownListener) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            received = events.recv() => match received {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => info!(target: "mitm_relay::events", "{}", line),
                    Err(e) => warn!("Unable to serialize event: {}", e),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event dispatcher lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::Shutdown;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_publish_without_subscribers() {
        let queue = EventQueue::new();
        queue.publish(Uuid::new_v4(), EventName::WorkStarted, json!({}), None);
        assert_eq!(queue.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let queue = EventQueue::new();
        let mut first = queue.subscribe();
        let mut second = queue.subscribe();
        let id = Uuid::new_v4();

        queue.publish(
            id,
            EventName::RequestComplete,
            json!({"method": "GET"}),
            Some("handler"),
        );

        for rx in [&mut first, &mut second] {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.request_id, id);
            assert_eq!(event.event_name, EventName::RequestComplete);
            assert_eq!(event.event_payload["method"], "GET");
            assert_eq!(event.publisher_id.as_deref(), Some("handler"));
            assert_eq!(event.process_id, std::process::id());
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_by_drop() {
        let queue = EventQueue::new();
        let rx = queue.subscribe();
        assert_eq!(queue.subscriber_count(), 1);
        drop(rx);
        assert_eq!(queue.subscriber_count(), 0);
    }

    #[test]
    fn test_event_name_serialization() {
        assert_eq!(
            serde_json::to_string(&EventName::TunnelEstablished).unwrap(),
            "\"tunnel_established\""
        );
    }

    #[tokio::test]
    async fn test_dispatcher_stops_on_shutdown() {
        let queue = EventQueue::new();
        let shutdown = Shutdown::new();
        let task = tokio::spawn(run_dispatcher(queue.subscribe(), shutdown.subscribe()));

        queue.publish(Uuid::new_v4(), EventName::WorkFinished, json!(null), None);
        shutdown.trigger();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
