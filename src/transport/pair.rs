use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use crate::error::{TransportError, TransportResult};
use crate::transport::FrameTransport;

pub const DEFAULT_CAPACITY: usize = 256;

/// Configuration for the in-process pair transport.
#[derive(Clone, Debug)]
pub struct PairConfig {
    pub capacity: usize,
}

impl Default for PairConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl PairConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

/// In-process connected transport pair, for tests and demos.
///
/// Frames pushed into one side come out of the other, in order.
/// `trigger_reconnect` simulates the underlying link re-establishing so
/// reconnect behavior can be exercised without a real socket.
pub struct PairTransport {
    sender: Mutex<Option<mpsc::Sender<Bytes>>>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    reconnect_tx: broadcast::Sender<()>,
    name: String,
}

impl PairTransport {
    /// Create a pair of connected transports.
    pub fn create_pair(name: impl Into<String>, config: PairConfig) -> (Self, Self) {
        let name = name.into();
        let (tx1, rx1) = mpsc::channel(config.capacity);
        let (tx2, rx2) = mpsc::channel(config.capacity);
        let (reconnect1, _) = broadcast::channel(4);
        let (reconnect2, _) = broadcast::channel(4);

        let left = Self {
            sender: Mutex::new(Some(tx1)),
            receiver: tokio::sync::Mutex::new(rx2),
            reconnect_tx: reconnect1,
            name: format!("{}-left", name),
        };

        let right = Self {
            sender: Mutex::new(Some(tx2)),
            receiver: tokio::sync::Mutex::new(rx1),
            reconnect_tx: reconnect2,
            name: format!("{}-right", name),
        };

        (left, right)
    }

    /// Fire this side's reconnect notification.
    pub fn trigger_reconnect(&self) {
        let _ = self.reconnect_tx.send(());
    }
}

#[async_trait]
impl FrameTransport for PairTransport {
    async fn send_frame(&self, frame: Bytes) -> TransportResult<()> {
        let sender = self.sender.lock().clone();
        match sender {
            Some(tx) => tx.send(frame).await.map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn recv_frame(&self) -> TransportResult<Bytes> {
        let mut rx = self.receiver.lock().await;
        rx.recv().await.ok_or(TransportError::Closed)
    }

    fn is_connected(&self) -> bool {
        match self.sender.lock().as_ref() {
            Some(tx) => !tx.is_closed(),
            None => false,
        }
    }

    fn reconnects(&self) -> Option<broadcast::Receiver<()>> {
        Some(self.reconnect_tx.subscribe())
    }

    async fn disconnect(&self) {
        self.sender.lock().take();
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for PairTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairTransport")
            .field("name", &self.name)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_recv() {
        let (left, right) = PairTransport::create_pair("test", PairConfig::default());

        left.send_frame(Bytes::from_static(b"hello")).await.unwrap();
        let received = right.recv_frame().await.unwrap();
        assert_eq!(received.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_bidirectional_order() {
        let (left, right) = PairTransport::create_pair("test", PairConfig::default());

        left.send_frame(Bytes::from_static(b"a")).await.unwrap();
        left.send_frame(Bytes::from_static(b"b")).await.unwrap();
        right.send_frame(Bytes::from_static(b"c")).await.unwrap();

        assert_eq!(right.recv_frame().await.unwrap().as_ref(), b"a");
        assert_eq!(right.recv_frame().await.unwrap().as_ref(), b"b");
        assert_eq!(left.recv_frame().await.unwrap().as_ref(), b"c");
    }

    #[tokio::test]
    async fn test_disconnect_closes_peer_recv() {
        let (left, right) = PairTransport::create_pair("test", PairConfig::default());

        left.disconnect().await;
        assert!(!left.is_connected());
        assert!(matches!(
            right.recv_frame().await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(
            left.send_frame(Bytes::new()).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_reconnect_notification() {
        let (left, _right) = PairTransport::create_pair("test", PairConfig::default());

        let mut rx = left.reconnects().unwrap();
        left.trigger_reconnect();
        rx.recv().await.unwrap();
    }
}
