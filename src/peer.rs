//! One duplex connection hosting both protocol halves.
//!
//! A [`Peer`] owns the reader task (routing request frames to its
//! [`ChannelServer`] and response frames to its [`ChannelClient`]) and the
//! writer task, which is the single owner of `send_frame` so every outbound
//! frame leaves in one well-defined order.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::ServerChannel;
use crate::client::{ChannelClient, ChannelProxy};
use crate::codec::{BincodeCodec, Codec};
use crate::error::Result;
use crate::frame::{self, RequestFrame, ResponseFrame};
use crate::server::{ChannelServer, ServerConfig};
use crate::transport::FrameTransport;

pub struct Peer<Ctx, C = BincodeCodec> {
    client: ChannelClient<C>,
    server: ChannelServer<Ctx, C>,
    transport: Arc<dyn FrameTransport>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    resubscriber: Option<JoinHandle<()>>,
}

impl<Ctx, C> Peer<Ctx, C>
where
    Ctx: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    C: Codec + Clone + 'static,
{
    /// Initiating side of the handshake: send `identity` as the first
    /// protocol frame, then run. The local channel server hands `identity`
    /// to its channel implementations as their connection ctx.
    ///
    /// A transport already closing swallows the identity frame like any
    /// other send; the peer then never replies with `Initialize` and queued
    /// activity simply stays queued.
    pub async fn connect<T>(
        transport: T,
        identity: Ctx,
        codec: C,
        config: ServerConfig,
    ) -> Result<Self>
    where
        T: FrameTransport + 'static,
    {
        let transport: Arc<dyn FrameTransport> = Arc::new(transport);
        let hello = Bytes::from(codec.encode(&identity)?);
        if let Err(e) = transport.send_frame(hello).await {
            tracing::debug!(error = %e, "identity send failed, frame dropped");
        }
        Ok(Self::start(transport, identity, codec, config))
    }

    /// Receiving side: the first inbound payload is the connecting peer's
    /// identity. Decoding it constructs the server (which replies with
    /// `Initialize`) and returns the identity alongside the running peer.
    pub async fn accept<T>(transport: T, codec: C, config: ServerConfig) -> Result<(Self, Ctx)>
    where
        T: FrameTransport + 'static,
    {
        let transport: Arc<dyn FrameTransport> = Arc::new(transport);
        let first = transport.recv_frame().await?;
        let identity: Ctx = codec.decode(&first)?;
        let peer = Self::start(transport, identity.clone(), codec, config);
        Ok((peer, identity))
    }

    fn start(
        transport: Arc<dyn FrameTransport>,
        ctx: Ctx,
        codec: C,
        config: ServerConfig,
    ) -> Self {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();
        let client = ChannelClient::new(codec.clone(), outbound_tx.clone());
        let server = ChannelServer::new(ctx, codec, config, outbound_tx);

        let writer = tokio::spawn({
            let transport = transport.clone();
            async move {
                while let Some(outgoing) = outbound_rx.recv().await {
                    if let Err(e) = transport.send_frame(outgoing).await {
                        // Frame considered lost; no retry. The caller's only
                        // symptom is an eventual timeout or missing response.
                        tracing::debug!(error = %e, "send failed, frame dropped");
                    }
                }
            }
        });

        let reader = tokio::spawn({
            let transport = transport.clone();
            let client = client.clone();
            let server = server.clone();
            async move {
                loop {
                    match transport.recv_frame().await {
                        Ok(raw) => dispatch_frame(raw, &client, &server),
                        Err(e) => {
                            tracing::debug!(error = %e, "connection closed");
                            break;
                        }
                    }
                }
                client.connection_lost();
                server.dispose();
            }
        });

        let resubscriber = transport.reconnects().map(|mut reconnects| {
            let client = client.clone();
            tokio::spawn(async move {
                loop {
                    match reconnects.recv().await {
                        Ok(()) => client.resubscribe_active(),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                            client.resubscribe_active()
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        });

        Self {
            client,
            server,
            transport,
            reader,
            writer,
            resubscriber,
        }
    }

    /// Get a proxy for the named channel on the remote peer. Usable before
    /// the peer registers that name; calls simply wait or buffer.
    pub fn get_channel(&self, name: impl Into<String>) -> ChannelProxy<C> {
        self.client.get_channel(name)
    }

    /// Register a local channel implementation under `name`. Last
    /// registration wins for future dispatches.
    pub fn register_channel(&self, name: impl Into<String>, channel: Arc<dyn ServerChannel<Ctx>>) {
        self.server.register_channel(name, channel)
    }

    pub fn client(&self) -> &ChannelClient<C> {
        &self.client
    }

    pub fn server(&self) -> &ChannelServer<Ctx, C> {
        &self.server
    }

    /// Tear the connection down: reject in-flight calls locally, cancel
    /// in-flight server work, notify the peer best-effort, stop the tasks.
    pub async fn dispose(&self) {
        self.client.dispose();
        self.server.dispose();
        self.transport.disconnect().await;
        self.reader.abort();
        self.writer.abort();
        if let Some(task) = &self.resubscriber {
            task.abort();
        }
    }
}

impl<Ctx, C> Drop for Peer<Ctx, C> {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
        if let Some(task) = &self.resubscriber {
            task.abort();
        }
    }
}

fn dispatch_frame<Ctx, C>(raw: Bytes, client: &ChannelClient<C>, server: &ChannelServer<Ctx, C>)
where
    Ctx: Clone + Send + Sync + 'static,
    C: Codec + Clone + 'static,
{
    let kind = match frame::peek_kind(&raw) {
        Some(kind) => kind,
        None => {
            tracing::trace!("empty frame, dropped");
            return;
        }
    };

    if frame::is_request_kind(kind) {
        match RequestFrame::decode(raw) {
            Ok(request) => server.handle_request(request),
            Err(e) => tracing::debug!(error = %e, "malformed request frame, dropped"),
        }
    } else if frame::is_response_kind(kind) {
        match ResponseFrame::decode(raw) {
            Ok(response) => client.handle_response(response),
            Err(e) => tracing::debug!(error = %e, "malformed response frame, dropped"),
        }
    } else {
        // Duplicate or late frames around reconnects land here.
        tracing::trace!(kind, "unrecognized frame kind, dropped");
    }
}
