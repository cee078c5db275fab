use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::sync::broadcast;

use crate::error::{TransportError, TransportResult};
use crate::transport::FrameTransport;

/// Source/target filtering over a shared physical connection.
///
/// When several logical peers multiplex one link (a relay fanning out to
/// multiple clients), each frame is stamped with the sending and receiving
/// peer ids. `recv_frame` only yields frames addressed to the local peer
/// from the expected remote; everything else is dropped.
#[derive(Debug)]
pub struct RoutedTransport<T: FrameTransport> {
    inner: T,
    local: String,
    remote: String,
}

impl<T: FrameTransport> RoutedTransport<T> {
    pub fn new(inner: T, local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            inner,
            local: local.into(),
            remote: remote.into(),
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    fn envelope(&self, frame: &[u8]) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(4 + self.local.len() + self.remote.len() + frame.len());
        put_peer_id(&mut buf, &self.local);
        put_peer_id(&mut buf, &self.remote);
        buf.put_slice(frame);
        buf.freeze()
    }
}

fn put_peer_id(buf: &mut BytesMut, id: &str) {
    buf.put_u16_le(id.len() as u16);
    buf.put_slice(id.as_bytes());
}

fn get_peer_id(buf: &mut Bytes) -> TransportResult<String> {
    if buf.remaining() < 2 {
        return Err(TransportError::ReceiveFailed(
            "truncated routing envelope".to_string(),
        ));
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(TransportError::ReceiveFailed(
            "truncated routing envelope".to_string(),
        ));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|e| TransportError::ReceiveFailed(format!("invalid peer id: {}", e)))
}

#[async_trait]
impl<T: FrameTransport> FrameTransport for RoutedTransport<T> {
    async fn send_frame(&self, frame: Bytes) -> TransportResult<()> {
        self.inner.send_frame(self.envelope(&frame)).await
    }

    async fn recv_frame(&self) -> TransportResult<Bytes> {
        loop {
            let mut raw = self.inner.recv_frame().await?;
            let source = get_peer_id(&mut raw)?;
            let target = get_peer_id(&mut raw)?;

            if target == self.local && source == self.remote {
                return Ok(raw);
            }

            tracing::trace!(
                source = %source,
                target = %target,
                local = %self.local,
                "dropping frame addressed to another peer"
            );
        }
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn reconnects(&self) -> Option<broadcast::Receiver<()>> {
        self.inner.reconnects()
    }

    async fn disconnect(&self) {
        self.inner.disconnect().await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
