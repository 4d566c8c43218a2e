//! Live feed of rate limiting decisions
//!
//! Every decision made through the server is published on a [`DecisionBus`].
//! Subscribers receive it as a Server-Sent Events stream:
//!
//! ```text
//! event: decision
//! data: {"clientId":"c1","allowed":true,"currentTokens":9,"capacity":10,"refillRate":2,"timestamp":1700000000000}
//!
//! ```

use std::time::{SystemTime, UNIX_EPOCH};
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokengate::Decision;

/// Events kept for subscribers that fall behind, used when none is configured.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

const EVENT_NAME: &str = "decision";

/// A published decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionEvent {
    /// Client the decision was made for
    pub client_id: String,

    /// The decision
    #[serde(flatten)]
    pub decision: Decision,

    /// When the decision was published, in milliseconds since the UNIX epoch
    pub timestamp: u64,
}

/// Broadcasts decisions to every live subscriber.
///
/// Publishing never blocks; a subscriber that falls more than the
/// configured capacity behind skips the events it missed.
#[derive(Debug, Clone)]
pub struct DecisionBus {
    tx: broadcast::Sender<DecisionEvent>,
}

impl Default for DecisionBus {
    #[inline]
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl DecisionBus {
    /// Creates a bus that buffers up to `capacity` events per subscriber.
    #[inline]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes `decision` of `client_id`.
    ///
    /// Returns the number of subscribers it was delivered to.
    pub fn publish(&self, client_id: &str, decision: Decision) -> usize {
        let event = DecisionEvent {
            client_id: client_id.to_owned(),
            decision,
            timestamp: now_millis(),
        };
        // no subscribers is not an error
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribes to events published from now on.
    #[inline]
    pub fn subscribe(&self) -> broadcast::Receiver<DecisionEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    #[inline]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Subscribes and encodes every event as a Server-Sent Events frame.
    pub fn sse_stream(&self) -> impl Stream<Item = Bytes> + Send + 'static {
        BroadcastStream::new(self.subscribe()).filter_map(|event| async move {
            match event {
                Ok(event) => encode(&event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged behind");
                    None
                }
            }
        })
    }
}

/// Encodes `event` as a Server-Sent Events frame.
pub fn encode(event: &DecisionEvent) -> Option<Bytes> {
    let data = match serde_json::to_vec(event) {
        Ok(data) => data,
        Err(err) => {
            tracing::error!("failed to serialize decision event: {err:#}");
            return None;
        }
    };

    let mut frame = BytesMut::with_capacity(data.len() + 24);
    frame.put_slice(b"event: ");
    frame.put_slice(EVENT_NAME.as_bytes());
    frame.put_slice(b"\ndata: ");
    frame.put_slice(&data);
    frame.put_slice(b"\n\n");
    Some(frame.freeze())
}

#[inline]
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis().try_into().unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision() -> Decision {
        Decision { allowed: true, current_tokens: 9, capacity: 10, refill_rate: 2 }
    }

    #[tokio::test]
    async fn it_delivers_to_every_subscriber() {
        let bus = DecisionBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        assert_eq!(bus.publish("c1", decision()), 2);

        assert_eq!(first.recv().await.unwrap().client_id, "c1");
        assert_eq!(second.recv().await.unwrap().decision, decision());
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let bus = DecisionBus::default();

        assert_eq!(bus.publish("c1", decision()), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn it_encodes_sse_frame() {
        let event = DecisionEvent { client_id: "c1".into(), decision: decision(), timestamp: 42 };

        let frame = encode(&event).unwrap();

        assert_eq!(
            String::from_utf8_lossy(&frame),
            "event: decision\ndata: {\"clientId\":\"c1\",\"allowed\":true,\"currentTokens\":9,\"capacity\":10,\"refillRate\":2,\"timestamp\":42}\n\n"
        );
    }

    #[tokio::test]
    async fn sse_stream_skips_lagged_events() {
        let bus = DecisionBus::new(2);
        let stream = bus.sse_stream();
        tokio::pin!(stream);

        for _ in 0..5 {
            bus.publish("c1", decision());
        }
        bus.publish("c2", decision());

        let frame = stream.next().await.unwrap();
        assert!(String::from_utf8_lossy(&frame).contains("\"clientId\":\"c1\""));
        let frame = stream.next().await.unwrap();
        assert!(String::from_utf8_lossy(&frame).contains("\"clientId\":\"c2\""));
    }
}
