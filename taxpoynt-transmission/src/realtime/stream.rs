//! Live stream connection registry and fan-out.
//!
//! Each connection owns a bounded outbound buffer. A connection without
//! subscriptions receives every event; otherwise only events for the request
//! ids it subscribed to. Slow consumers lose events rather than stall the
//! fan-out.

use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use tokio::{sync::mpsc, time::Instant};
use uuid::Uuid;

use super::StreamEvent;

/// Frames a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { request_id: Uuid },
    Unsubscribe { request_id: Uuid },
    Ping,
    Pong,
}

/// Frames queued for a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(Arc<StreamEvent>),
    Ping,
    Pong,
}

impl Outbound {
    /// JSON text of the frame.
    ///
    /// # Errors
    ///
    /// Fails only if the event cannot be serialized.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Event(event) => serde_json::to_string(event.as_ref()),
            Self::Ping => Ok(r#"{"type":"ping"}"#.to_string()),
            Self::Pong => Ok(r#"{"type":"pong"}"#.to_string()),
        }
    }
}

struct Connection {
    sender: mpsc::Sender<Outbound>,
    subscriptions: HashSet<Uuid>,
    last_seen: Instant,
    connected_at: DateTime<Utc>,
}

impl Connection {
    fn wants(&self, request_id: Uuid) -> bool {
        self.subscriptions.is_empty() || self.subscriptions.contains(&request_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub connection_id: Uuid,
    pub subscriptions: usize,
    pub connected_at: DateTime<Utc>,
}

pub struct StreamHub {
    connections: DashMap<Uuid, Connection>,
    buffer: usize,
}

impl StreamHub {
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            connections: DashMap::new(),
            buffer: buffer.max(1),
        }
    }

    /// Add a connection, returning its id and the receiving end of its buffer.
    pub fn register(&self) -> (Uuid, mpsc::Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let connection_id = Uuid::new_v4();
        self.connections.insert(
            connection_id,
            Connection {
                sender,
                subscriptions: HashSet::new(),
                last_seen: Instant::now(),
                connected_at: Utc::now(),
            },
        );
        tracing::debug!(%connection_id, "Stream connection registered");
        (connection_id, receiver)
    }

    pub fn unregister(&self, connection_id: Uuid) {
        if self.connections.remove(&connection_id).is_some() {
            tracing::debug!(%connection_id, "Stream connection closed");
        }
    }

    /// Record activity from the client.
    pub fn touch(&self, connection_id: Uuid) {
        if let Some(mut connection) = self.connections.get_mut(&connection_id) {
            connection.last_seen = Instant::now();
        }
    }

    /// Apply a frame from the client.
    ///
    /// # Errors
    ///
    /// Returns the parse error for frames that are not a [`ClientMessage`].
    pub fn handle_client_message(
        &self,
        connection_id: Uuid,
        text: &str,
    ) -> Result<(), serde_json::Error> {
        self.touch(connection_id);
        let message: ClientMessage = serde_json::from_str(text)?;

        let Some(mut connection) = self.connections.get_mut(&connection_id) else {
            return Ok(());
        };

        match message {
            ClientMessage::Subscribe { request_id } => {
                connection.subscriptions.insert(request_id);
            }
            ClientMessage::Unsubscribe { request_id } => {
                connection.subscriptions.remove(&request_id);
            }
            ClientMessage::Ping => {
                if connection.sender.try_send(Outbound::Pong).is_err() {
                    tracing::debug!(%connection_id, "Dropped pong for full connection buffer");
                }
            }
            ClientMessage::Pong => {}
        }

        Ok(())
    }

    /// Deliver `event` to every interested connection.
    ///
    /// Returns the number of connections the event was queued for.
    pub fn broadcast(&self, event: &Arc<StreamEvent>) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        for entry in &self.connections {
            if !entry.wants(event.request_id) {
                continue;
            }

            match entry.sender.try_send(Outbound::Event(Arc::clone(event))) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        connection_id = %entry.key(),
                        event_id = %event.event_id,
                        "Stream connection buffer full, dropping event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*entry.key()),
            }
        }

        for connection_id in closed {
            self.unregister(connection_id);
        }
        delivered
    }

    /// Ping connections idle for `idle` and evict those silent for `timeout`.
    ///
    /// Returns the number of evicted connections.
    pub fn sweep(&self, idle: Duration, timeout: Duration) -> usize {
        let mut evicted = Vec::new();

        for entry in &self.connections {
            let silent = entry.last_seen.elapsed();
            if silent >= timeout {
                evicted.push(*entry.key());
            } else if silent >= idle && entry.sender.try_send(Outbound::Ping).is_err() {
                tracing::debug!(connection_id = %entry.key(), "Could not queue ping");
            }
        }

        for connection_id in &evicted {
            tracing::info!(%connection_id, "Evicting unresponsive stream connection");
            self.unregister(*connection_id);
        }
        evicted.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections
            .iter()
            .map(|entry| ConnectionInfo {
                connection_id: *entry.key(),
                subscriptions: entry.subscriptions.len(),
                connected_at: entry.connected_at,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::realtime::StreamEventType;

    fn event(request_id: Uuid) -> Arc<StreamEvent> {
        Arc::new(StreamEvent::new(
            StreamEventType::RequestQueued,
            request_id,
            "INV-1",
            json!({}),
        ))
    }

    #[tokio::test]
    async fn test_subscription_filtering() {
        let hub = StreamHub::new(8);
        let (everything, mut everything_rx) = hub.register();
        let (filtered, mut filtered_rx) = hub.register();
        let wanted = Uuid::new_v4();

        hub.handle_client_message(
            filtered,
            &json!({"type": "subscribe", "request_id": wanted}).to_string(),
        )
        .unwrap();

        assert_eq!(hub.broadcast(&event(Uuid::new_v4())), 1);
        assert_eq!(hub.broadcast(&event(wanted)), 2);

        assert!(matches!(everything_rx.try_recv(), Ok(Outbound::Event(_))));
        assert!(matches!(everything_rx.try_recv(), Ok(Outbound::Event(_))));
        match filtered_rx.try_recv() {
            Ok(Outbound::Event(received)) => assert_eq!(received.request_id, wanted),
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(filtered_rx.try_recv().is_err());
        let _ = everything;
    }

    #[tokio::test]
    async fn test_ping_gets_pong() {
        let hub = StreamHub::new(8);
        let (connection, mut rx) = hub.register();

        hub.handle_client_message(connection, r#"{"type":"ping"}"#)
            .unwrap();
        assert_eq!(rx.try_recv().ok(), Some(Outbound::Pong));
        assert_eq!(
            Outbound::Pong.to_json().unwrap(),
            r#"{"type":"pong"}"#
        );
        assert!(hub.handle_client_message(connection, "not json").is_err());
    }

    #[tokio::test]
    async fn test_full_buffer_drops_events() {
        let hub = StreamHub::new(1);
        let (_connection, _rx) = hub.register();
        let request_id = Uuid::new_v4();

        assert_eq!(hub.broadcast(&event(request_id)), 1);
        assert_eq!(hub.broadcast(&event(request_id)), 0);
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_connections_are_removed() {
        let hub = StreamHub::new(4);
        let (_connection, rx) = hub.register();
        drop(rx);

        assert_eq!(hub.broadcast(&event(Uuid::new_v4())), 0);
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_pings_then_evicts() {
        let hub = StreamHub::new(4);
        let (_connection, mut rx) = hub.register();

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(hub.sweep(Duration::from_secs(30), Duration::from_secs(90)), 0);
        assert_eq!(rx.try_recv().ok(), Some(Outbound::Ping));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(hub.sweep(Duration::from_secs(30), Duration::from_secs(90)), 1);
        assert_eq!(hub.connection_count(), 0);
    }
}
