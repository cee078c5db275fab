use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};

use crate::cancel::CancellationToken;
use crate::codec::{BincodeCodec, Codec};
use crate::error::{ErrorPayload, Result, RpcError};
use crate::frame::{RequestFrame, ResponseFrame};

/// The issuing half of one connection.
///
/// Starts Uninitialized: every call/listen activation is queued, in id
/// order, until the peer's `Initialize` frame releases them. The transition
/// is one-way and happens exactly once per client lifetime.
pub struct ChannelClient<C = BincodeCodec> {
    inner: Arc<ClientInner<C>>,
}

impl<C> Clone for ChannelClient<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct ClientInner<C> {
    codec: C,
    outbound: mpsc::UnboundedSender<Bytes>,
    activation: Mutex<ActivationState>,
    pending: Mutex<HashMap<u32, ResponseHandler<C>>>,
    subscriptions: Mutex<Vec<Weak<SubscriptionShared<C>>>>,
    disposed: AtomicBool,
}

struct ActivationState {
    initialized: bool,
    next_id: u32,
    queue: Vec<QueuedFrame>,
}

struct QueuedFrame {
    id: u32,
    frame: Bytes,
}

enum ResponseHandler<C> {
    Call(oneshot::Sender<Result<Bytes>>),
    Event(Weak<SubscriptionShared<C>>),
}

impl<C> ChannelClient<C>
where
    C: Codec + Clone + 'static,
{
    pub fn new(codec: C, outbound: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                codec,
                outbound,
                activation: Mutex::new(ActivationState {
                    initialized: false,
                    next_id: 0,
                    queue: Vec::new(),
                }),
                pending: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(Vec::new()),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Get a proxy for the named remote channel. Performs no network
    /// activity; the name does not have to be registered on the peer yet.
    pub fn get_channel(&self, name: impl Into<String>) -> ChannelProxy<C> {
        ChannelProxy {
            inner: self.inner.clone(),
            channel: name.into(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.activation.lock().initialized
    }

    /// Feed one decoded response frame into the client.
    pub fn handle_response(&self, frame: ResponseFrame) {
        match frame {
            ResponseFrame::Initialize => {
                // Flush under the lock so frames sent by calls racing the
                // transition cannot overtake the queue.
                let mut activation = self.inner.activation.lock();
                if activation.initialized {
                    tracing::trace!("duplicate initialize, dropped");
                    return;
                }
                activation.initialized = true;
                for queued in activation.queue.drain(..) {
                    let _ = self.inner.outbound.send(queued.frame);
                }
            }
            ResponseFrame::CallSuccess { id, body } => self.resolve_call(id, Ok(body)),
            ResponseFrame::CallError { id, body } => {
                let err = match self.inner.codec.decode::<ErrorPayload>(&body) {
                    Ok(payload) => RpcError::Remote(payload.into()),
                    Err(decode_err) => decode_err,
                };
                self.resolve_call(id, Err(err));
            }
            ResponseFrame::CallErrorObj { id, body } => {
                self.resolve_call(id, Err(RpcError::Value(body)))
            }
            ResponseFrame::EventFire { id, body } => {
                let shared = {
                    let pending = self.inner.pending.lock();
                    match pending.get(&id) {
                        Some(ResponseHandler::Event(weak)) => weak.upgrade(),
                        Some(ResponseHandler::Call(_)) => None,
                        None => None,
                    }
                };
                match shared {
                    Some(shared) => shared.emit(body),
                    None => tracing::trace!(id, "event fire with no live handler, dropped"),
                }
            }
        }
    }

    fn resolve_call(&self, id: u32, result: Result<Bytes>) {
        let handler = {
            let mut pending = self.inner.pending.lock();
            match pending.get(&id) {
                Some(ResponseHandler::Call(_)) => pending.remove(&id),
                _ => None,
            }
        };
        match handler {
            Some(ResponseHandler::Call(tx)) => {
                let _ = tx.send(result);
            }
            // Late or duplicate response for an id whose handler is gone;
            // expected around cancellation and reconnects.
            _ => tracing::trace!(id, "response with no matching handler, dropped"),
        }
    }

    /// Resend `EventListen` for every subscription that still has
    /// listeners. Invoked when the transport announces a reconnect; the peer
    /// does not retain subscription state across the gap.
    pub fn resubscribe_active(&self) {
        if !self.inner.activation.lock().initialized {
            return;
        }

        let subs: Vec<Arc<SubscriptionShared<C>>> = {
            let mut subscriptions = self.inner.subscriptions.lock();
            subscriptions.retain(|weak| weak.strong_count() > 0);
            subscriptions.iter().filter_map(|weak| weak.upgrade()).collect()
        };

        for sub in subs {
            if let Some(frame) = sub.resubscribe_frame() {
                tracing::debug!(
                    channel = %sub.channel,
                    event = %sub.event,
                    "resubscribing after reconnect"
                );
                let _ = self.inner.outbound.send(frame);
            }
        }
    }

    /// Reject every in-flight call locally and unsubscribe every event
    /// listener. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.teardown(|| RpcError::Disposed);
    }

    pub(crate) fn connection_lost(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.teardown(|| RpcError::ConnectionClosed);
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

impl<C> ClientInner<C> {
    /// Allocate the next request id, register its handler, and send or
    /// queue the frame, atomically with the Initialize transition. The
    /// activation queue stays in id order.
    fn activate(&self, make_frame: impl FnOnce(u32) -> Bytes, handler: ResponseHandler<C>) -> u32 {
        let mut activation = self.activation.lock();
        let id = activation.next_id;
        activation.next_id += 1;
        let frame = make_frame(id);
        self.pending.lock().insert(id, handler);
        if activation.initialized {
            let _ = self.outbound.send(frame);
        } else {
            activation.queue.push(QueuedFrame { id, frame });
        }
        id
    }

    /// Remove a still-queued activation. Returns true when the frame had
    /// not been sent, meaning no cancel/dispose frame is owed either.
    fn unqueue(&self, id: u32) -> bool {
        let mut activation = self.activation.lock();
        match activation.queue.iter().position(|q| q.id == id) {
            Some(pos) => {
                activation.queue.remove(pos);
                true
            }
            None => false,
        }
    }

    fn remove_handler(&self, id: u32) {
        self.pending.lock().remove(&id);
    }

    async fn call_raw(
        &self,
        channel: &str,
        method: &str,
        body: Bytes,
        cancel: Option<&CancellationToken>,
    ) -> Result<Bytes> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(RpcError::Disposed);
        }
        if let Some(token) = cancel {
            if token.is_cancelled() {
                // Already triggered: fail with nothing sent.
                return Err(RpcError::Canceled);
            }
        }

        let (tx, rx) = oneshot::channel();
        let id = self.activate(
            |id| {
                RequestFrame::Call {
                    id,
                    channel: channel.to_string(),
                    method: method.to_string(),
                    body,
                }
                .encode()
            },
            ResponseHandler::Call(tx),
        );

        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = cancelled => {
                let unsent = self.unqueue(id);
                self.remove_handler(id);
                if !unsent {
                    // The call frame is on the wire; request peer-side
                    // cancellation but do not wait for it.
                    let _ = self.outbound.send(RequestFrame::CallCancel { id }.encode());
                }
                Err(RpcError::Canceled)
            }
            result = rx => match result {
                Ok(outcome) => outcome,
                Err(_) => Err(RpcError::Disposed),
            }
        }
    }

    fn teardown(&self, make_err: impl Fn() -> RpcError) {
        let handlers: Vec<ResponseHandler<C>> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, handler)| handler).collect()
        };
        for handler in handlers {
            match handler {
                ResponseHandler::Call(tx) => {
                    let _ = tx.send(Err(make_err()));
                }
                ResponseHandler::Event(weak) => {
                    if let Some(shared) = weak.upgrade() {
                        shared.close();
                    }
                }
            }
        }
        self.activation.lock().queue.clear();
    }
}

/// Client-side proxy for one named remote channel.
pub struct ChannelProxy<C = BincodeCodec> {
    inner: Arc<ClientInner<C>>,
    channel: String,
}

impl<C> Clone for ChannelProxy<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            channel: self.channel.clone(),
        }
    }
}

impl<C> ChannelProxy<C>
where
    C: Codec + Clone + 'static,
{
    pub fn name(&self) -> &str {
        &self.channel
    }

    pub async fn call<A, R>(&self, method: &str, arg: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.call_inner(method, arg, None).await
    }

    pub async fn call_with_cancel<A, R>(
        &self,
        method: &str,
        arg: &A,
        cancel: &CancellationToken,
    ) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.call_inner(method, arg, Some(cancel)).await
    }

    async fn call_inner<A, R>(
        &self,
        method: &str,
        arg: &A,
        cancel: Option<&CancellationToken>,
    ) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let body = Bytes::from(self.inner.codec.encode(arg)?);
        let raw = self.inner.call_raw(&self.channel, method, body, cancel).await?;
        self.inner.codec.decode(&raw)
    }

    /// Get a lazily-activated event source for `event`.
    ///
    /// Nothing touches the network until the first subscriber attaches; the
    /// last subscriber detaching tears the remote subscription down again.
    pub fn listen<E>(&self, event: &str) -> Result<EventSource<E, C>>
    where
        E: DeserializeOwned,
    {
        self.listen_with_arg(event, &())
    }

    pub fn listen_with_arg<A, E>(&self, event: &str, arg: &A) -> Result<EventSource<E, C>>
    where
        A: Serialize,
        E: DeserializeOwned,
    {
        let body = Bytes::from(self.inner.codec.encode(arg)?);
        let shared = Arc::new(SubscriptionShared {
            client: self.inner.clone(),
            channel: self.channel.clone(),
            event: event.to_string(),
            arg: body,
            state: Mutex::new(SubState {
                listeners: Vec::new(),
                next_listener: 0,
                request_id: None,
            }),
        });
        self.inner.subscriptions.lock().push(Arc::downgrade(&shared));
        Ok(EventSource {
            shared,
            _marker: PhantomData,
        })
    }
}

struct SubscriptionShared<C> {
    client: Arc<ClientInner<C>>,
    channel: String,
    event: String,
    arg: Bytes,
    state: Mutex<SubState>,
}

struct SubState {
    listeners: Vec<(u64, mpsc::UnboundedSender<Bytes>)>,
    next_listener: u64,
    request_id: Option<u32>,
}

impl<C> SubscriptionShared<C> {
    fn attach(self: &Arc<Self>) -> (u64, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let listener_id = state.next_listener;
        state.next_listener += 1;
        state.listeners.push((listener_id, tx));

        if state.listeners.len() == 1 {
            let id = self.client.activate(
                |id| {
                    RequestFrame::EventListen {
                        id,
                        channel: self.channel.clone(),
                        event: self.event.clone(),
                        body: self.arg.clone(),
                    }
                    .encode()
                },
                ResponseHandler::Event(Arc::downgrade(self)),
            );
            state.request_id = Some(id);
        }

        (listener_id, rx)
    }

    fn detach(&self, listener_id: u64) {
        let mut state = self.state.lock();
        state.listeners.retain(|(id, _)| *id != listener_id);
        if !state.listeners.is_empty() {
            return;
        }

        if let Some(id) = state.request_id.take() {
            let unsent = self.client.unqueue(id);
            self.client.remove_handler(id);
            if !unsent {
                let _ = self
                    .client
                    .outbound
                    .send(RequestFrame::EventDispose { id }.encode());
            }
        }
    }

    fn emit(&self, body: Bytes) {
        let state = self.state.lock();
        for (_, tx) in state.listeners.iter() {
            let _ = tx.send(body.clone());
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.listeners.clear();
        state.request_id = None;
    }

    fn resubscribe_frame(&self) -> Option<Bytes> {
        let state = self.state.lock();
        match state.request_id {
            Some(id) if !state.listeners.is_empty() => Some(
                RequestFrame::EventListen {
                    id,
                    channel: self.channel.clone(),
                    event: self.event.clone(),
                    body: self.arg.clone(),
                }
                .encode(),
            ),
            _ => None,
        }
    }
}

/// Reference-counted handle for one remote event.
///
/// Cloning shares the underlying subscription; each [`EventSource::subscribe`]
/// adds one listener.
pub struct EventSource<E, C = BincodeCodec> {
    shared: Arc<SubscriptionShared<C>>,
    _marker: PhantomData<fn() -> E>,
}

impl<E, C> Clone for EventSource<E, C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            _marker: PhantomData,
        }
    }
}

impl<E, C> EventSource<E, C>
where
    E: DeserializeOwned,
    C: Codec + Clone + 'static,
{
    /// Attach a listener. The first listener activates the subscription on
    /// the network; the last one detaching deactivates it.
    pub fn subscribe(&self) -> EventSubscription<E, C> {
        let (listener_id, rx) = self.shared.attach();
        EventSubscription {
            shared: self.shared.clone(),
            listener_id,
            rx,
            codec: self.shared.client.codec.clone(),
            _marker: PhantomData,
        }
    }
}

/// One live listener on a remote event. Detaches on drop.
pub struct EventSubscription<E, C = BincodeCodec> {
    shared: Arc<SubscriptionShared<C>>,
    listener_id: u64,
    rx: mpsc::UnboundedReceiver<Bytes>,
    codec: C,
    _marker: PhantomData<fn() -> E>,
}

impl<E, C> EventSubscription<E, C>
where
    E: DeserializeOwned,
    C: Codec + Clone + 'static,
{
    pub async fn recv(&mut self) -> Option<Result<E>> {
        self.rx
            .recv()
            .await
            .map(|body| self.codec.decode(&body))
    }
}

impl<E, C> futures::Stream for EventSubscription<E, C>
where
    E: DeserializeOwned + Unpin,
    C: Codec + Clone + Unpin + 'static,
{
    type Item = Result<E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(body)) => Poll::Ready(Some(self.codec.decode(&body))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<E, C> Drop for EventSubscription<E, C> {
    fn drop(&mut self) {
        self.shared.detach(self.listener_id);
    }
}
