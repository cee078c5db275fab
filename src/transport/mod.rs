use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;
use tokio::sync::broadcast;

use crate::error::TransportResult;

pub mod pair;
pub mod routed;

/// Transport trait abstracting one ordered, duplex frame channel.
///
/// Implementations deliver whole frames, in order, per connection. A
/// transport that reconnects internally must keep `recv_frame` alive across
/// the gap and announce the new link through [`FrameTransport::reconnects`];
/// an `Err` from either side means the connection is gone for good.
#[async_trait]
pub trait FrameTransport: Send + Sync + Debug {
    /// Send one encoded frame.
    async fn send_frame(&self, frame: Bytes) -> TransportResult<()>;

    /// Receive the next inbound frame.
    async fn recv_frame(&self) -> TransportResult<Bytes>;

    /// Check if the transport is connected.
    fn is_connected(&self) -> bool;

    /// Optional capability: notified each time the underlying link
    /// re-establishes after a drop.
    fn reconnects(&self) -> Option<broadcast::Receiver<()>> {
        None
    }

    /// Best-effort teardown notification to the peer. Not required for
    /// correctness, only for faster peer-side cleanup.
    async fn disconnect(&self) {}

    /// Get transport name/identifier
    fn name(&self) -> &str {
        "unknown"
    }
}

#[async_trait]
impl<T: FrameTransport + ?Sized> FrameTransport for std::sync::Arc<T> {
    async fn send_frame(&self, frame: Bytes) -> TransportResult<()> {
        (**self).send_frame(frame).await
    }

    async fn recv_frame(&self) -> TransportResult<Bytes> {
        (**self).recv_frame().await
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn reconnects(&self) -> Option<broadcast::Receiver<()>> {
        (**self).reconnects()
    }

    async fn disconnect(&self) {
        (**self).disconnect().await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

#[async_trait]
impl<T: FrameTransport + ?Sized> FrameTransport for Box<T> {
    async fn send_frame(&self, frame: Bytes) -> TransportResult<()> {
        (**self).send_frame(frame).await
    }

    async fn recv_frame(&self) -> TransportResult<Bytes> {
        (**self).recv_frame().await
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn reconnects(&self) -> Option<broadcast::Receiver<()>> {
        (**self).reconnects()
    }

    async fn disconnect(&self) {
        (**self).disconnect().await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
