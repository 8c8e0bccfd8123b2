//! Publish/subscribe bus abstraction.
//!
//! A transport delivers `(channel, payload)` pairs into a single-consumer
//! queue returned by [`BusClient::subscribe`]. The episode controller is the
//! only consumer, so accumulated state never needs a lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{BusError, Result};

/// Queue depth between a transport and its consumer.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// One message as delivered by the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

impl BusMessage {
    #[must_use]
    pub fn new(channel: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }

    /// Payload as text, replacing invalid UTF-8.
    #[must_use]
    pub fn payload_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// A connected bus session.
///
/// Connecting is transport specific and happens before a value of this type
/// exists; connection failures are reported there, once.
#[async_trait]
pub trait BusClient: Send {
    /// Subscribe to `pattern` and return the delivery queue.
    async fn subscribe(&mut self, pattern: &str) -> Result<mpsc::Receiver<BusMessage>>;

    /// Tear down the subscription and the connection.
    async fn disconnect(&mut self) -> Result<()>;
}

/// In-process bus for tests and replay.
///
/// Messages sent through a [`LoopbackPublisher`] before `subscribe` are
/// buffered and delivered once subscribed.
#[derive(Debug)]
pub struct LoopbackBus {
    rx: Option<mpsc::Receiver<BusMessage>>,
    subscriptions: Arc<std::sync::Mutex<Vec<String>>>,
    disconnects: Arc<AtomicUsize>,
}

/// Sending half of a [`LoopbackBus`].
#[derive(Debug, Clone)]
pub struct LoopbackPublisher {
    tx: mpsc::Sender<BusMessage>,
    subscriptions: Arc<std::sync::Mutex<Vec<String>>>,
    disconnects: Arc<AtomicUsize>,
}

impl LoopbackBus {
    #[must_use]
    pub fn new() -> (Self, LoopbackPublisher) {
        let (tx, rx) = mpsc::channel(DEFAULT_QUEUE_CAPACITY);
        let subscriptions = Arc::new(std::sync::Mutex::new(Vec::new()));
        let disconnects = Arc::new(AtomicUsize::new(0));
        (
            Self {
                rx: Some(rx),
                subscriptions: Arc::clone(&subscriptions),
                disconnects: Arc::clone(&disconnects),
            },
            LoopbackPublisher {
                tx,
                subscriptions,
                disconnects,
            },
        )
    }
}

impl LoopbackPublisher {
    /// Publish a message; fails once the bus side is gone.
    pub async fn publish(&self, channel: &str, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.tx
            .send(BusMessage::new(channel, payload))
            .await
            .map_err(|_| BusError::Closed.into())
    }

    /// Patterns subscribed so far.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .map(|subs| subs.clone())
            .unwrap_or_default()
    }

    /// How many times `disconnect` was called.
    #[must_use]
    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BusClient for LoopbackBus {
    async fn subscribe(&mut self, pattern: &str) -> Result<mpsc::Receiver<BusMessage>> {
        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.push(pattern.to_string());
        }
        self.rx.take().ok_or_else(|| {
            BusError::Subscribe {
                pattern: pattern.to_string(),
                reason: "loopback bus supports a single subscription".to_string(),
            }
            .into()
        })
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.rx = None;
        Ok(())
    }
}
