//! The contract between the protocol core and application channels.
//!
//! Application modules implement [`ServerChannel`] (or assemble one from
//! closures with [`ChannelHandler`]) and register it by name; they never see
//! frame kinds, request ids, or the wire encoding.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use crate::cancel::CancellationToken;
use crate::codec::{BincodeCodec, Codec};
use crate::error::{RemoteError, Result, RpcError};

/// Encoded items emitted by one live event subscription.
pub type EventStream = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

/// Server-facing contract a named channel implementation satisfies.
///
/// `ctx` is the opaque per-connection identity supplied by the hosting
/// channel server. `cancel` is a request-scoped token; implementations must
/// observe it themselves for cancellation to actually stop work.
#[async_trait]
pub trait ServerChannel<Ctx>: Send + Sync {
    async fn call(
        &self,
        ctx: Ctx,
        method: &str,
        arg: Bytes,
        cancel: CancellationToken,
    ) -> Result<Bytes>;

    fn listen(&self, ctx: Ctx, event: &str, arg: Bytes) -> Result<EventStream>;
}

type MethodFn<Ctx> =
    Box<dyn Fn(Ctx, Bytes, CancellationToken) -> BoxFuture<'static, Result<Bytes>> + Send + Sync>;
type EventFn<Ctx> = Box<dyn Fn(Ctx, Bytes) -> Result<EventStream> + Send + Sync>;

/// Closure-based [`ServerChannel`] with typed method and event registration.
pub struct ChannelHandler<Ctx, C = BincodeCodec> {
    codec: C,
    methods: HashMap<String, MethodFn<Ctx>>,
    events: HashMap<String, EventFn<Ctx>>,
}

impl<Ctx> ChannelHandler<Ctx, BincodeCodec>
where
    Ctx: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_codec(BincodeCodec)
    }
}

impl<Ctx> Default for ChannelHandler<Ctx, BincodeCodec>
where
    Ctx: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<Ctx, C> ChannelHandler<Ctx, C>
where
    Ctx: Send + Sync + 'static,
    C: Codec + Clone + 'static,
{
    pub fn with_codec(codec: C) -> Self {
        Self {
            codec,
            methods: HashMap::new(),
            events: HashMap::new(),
        }
    }

    /// Register a typed method handler.
    pub fn method<A, R, F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Ctx, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.method_with_cancel(name, move |ctx, arg, _cancel| handler(ctx, arg))
    }

    /// Register a typed method handler that observes its cancellation token.
    pub fn method_with_cancel<A, R, F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Ctx, A, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let codec = self.codec.clone();
        let wrapped: MethodFn<Ctx> = Box::new(move |ctx, arg, cancel| {
            match codec.decode::<A>(&arg) {
                Ok(parsed) => {
                    let fut = handler(ctx, parsed, cancel);
                    let codec = codec.clone();
                    Box::pin(async move {
                        let value = fut.await?;
                        Ok(Bytes::from(codec.encode(&value)?))
                    })
                }
                Err(e) => Box::pin(async move { Err(e) }),
            }
        });
        self.methods.insert(name.into(), wrapped);
        self
    }

    /// Register a typed event stream factory.
    pub fn event<A, E, S, F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        E: Serialize + Send + 'static,
        S: Stream<Item = E> + Send + 'static,
        F: Fn(Ctx, A) -> S + Send + Sync + 'static,
    {
        let codec = self.codec.clone();
        let wrapped: EventFn<Ctx> = Box::new(move |ctx, arg| {
            let parsed: A = codec.decode(&arg)?;
            let codec = codec.clone();
            let stream = factory(ctx, parsed).filter_map(move |item| {
                let encoded = match codec.encode(&item) {
                    Ok(bytes) => Some(Bytes::from(bytes)),
                    Err(e) => {
                        tracing::debug!(error = %e, "dropping event item that failed to encode");
                        None
                    }
                };
                futures::future::ready(encoded)
            });
            Ok(Box::pin(stream) as EventStream)
        });
        self.events.insert(name.into(), wrapped);
        self
    }
}

#[async_trait]
impl<Ctx, C> ServerChannel<Ctx> for ChannelHandler<Ctx, C>
where
    Ctx: Send + Sync + 'static,
    C: Codec + Clone + 'static,
{
    async fn call(
        &self,
        ctx: Ctx,
        method: &str,
        arg: Bytes,
        cancel: CancellationToken,
    ) -> Result<Bytes> {
        match self.methods.get(method) {
            Some(handler) => handler(ctx, arg, cancel).await,
            None => Err(RpcError::Remote(RemoteError::new(
                format!("method '{}' not found", method),
                "UnknownMethod",
            ))),
        }
    }

    fn listen(&self, ctx: Ctx, event: &str, arg: Bytes) -> Result<EventStream> {
        match self.events.get(event) {
            Some(factory) => factory(ctx, arg),
            None => Err(RpcError::Remote(RemoteError::new(
                format!("event '{}' not found", event),
                "UnknownEvent",
            ))),
        }
    }
}
