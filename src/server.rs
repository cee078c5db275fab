use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cancel::CancellationSource;
use crate::channel::ServerChannel;
use crate::codec::{BincodeCodec, Codec};
use crate::error::{ErrorPayload, RemoteError, Result, RpcError};
use crate::frame::{RequestFrame, RequestKind, ResponseFrame};

pub const DEFAULT_BUFFER_TIMEOUT: Duration = Duration::from_millis(1000);

/// Per-server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// How long a request for an unregistered channel name is buffered
    /// before it is answered with an "Unknown channel" error.
    pub buffer_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            buffer_timeout: DEFAULT_BUFFER_TIMEOUT,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffer_timeout(mut self, timeout: Duration) -> Self {
        self.buffer_timeout = timeout;
        self
    }
}

enum ActiveRequest {
    Call(CancellationSource),
    Listen(JoinHandle<()>),
}

impl ActiveRequest {
    fn dispose(self) {
        match self {
            ActiveRequest::Call(source) => source.cancel(),
            ActiveRequest::Listen(handle) => handle.abort(),
        }
    }
}

struct BufferedRequest {
    frame: RequestFrame,
    timer: JoinHandle<()>,
}

/// The receiving half of one connection: decodes inbound request frames,
/// dispatches them to registered channel implementations, and tracks
/// per-request cancellation and event-subscription lifetime.
///
/// Requests for channel names that are not yet registered are buffered and
/// replayed on registration, or answered with an error once the configured
/// window elapses.
pub struct ChannelServer<Ctx, C = BincodeCodec> {
    inner: Arc<ServerInner<Ctx, C>>,
}

impl<Ctx, C> Clone for ChannelServer<Ctx, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct ServerInner<Ctx, C> {
    codec: C,
    ctx: Ctx,
    outbound: mpsc::UnboundedSender<Bytes>,
    channels: Mutex<HashMap<String, Arc<dyn ServerChannel<Ctx>>>>,
    active: Mutex<HashMap<u32, ActiveRequest>>,
    buffered: Mutex<HashMap<String, Vec<BufferedRequest>>>,
    buffer_timeout: Duration,
    disposed: AtomicBool,
}

impl<Ctx, C> ChannelServer<Ctx, C>
where
    Ctx: Clone + Send + Sync + 'static,
    C: Codec + Clone + 'static,
{
    /// Create the server for one connection and announce it by sending the
    /// `Initialize` frame through `outbound`.
    ///
    /// `ctx` is the connecting peer's identity, handed to every channel
    /// implementation on dispatch.
    pub fn new(
        ctx: Ctx,
        codec: C,
        config: ServerConfig,
        outbound: mpsc::UnboundedSender<Bytes>,
    ) -> Self {
        let server = Self {
            inner: Arc::new(ServerInner {
                codec,
                ctx,
                outbound,
                channels: Mutex::new(HashMap::new()),
                active: Mutex::new(HashMap::new()),
                buffered: Mutex::new(HashMap::new()),
                buffer_timeout: config.buffer_timeout,
                disposed: AtomicBool::new(false),
            }),
        };
        server.inner.send(ResponseFrame::Initialize);
        server
    }

    /// Register a channel implementation under `name`, replaying any
    /// buffered requests for it in arrival order.
    ///
    /// Re-registering a name replaces the handler for future dispatches
    /// only; requests already dispatched to the previous handler are
    /// unaffected.
    pub fn register_channel(&self, name: impl Into<String>, channel: Arc<dyn ServerChannel<Ctx>>) {
        let name = name.into();
        self.inner.channels.lock().insert(name.clone(), channel.clone());

        let pending = self.inner.buffered.lock().remove(&name);
        if let Some(entries) = pending {
            for entry in entries {
                entry.timer.abort();
                tracing::debug!(
                    channel = %name,
                    id = entry.frame.id(),
                    "replaying buffered request"
                );
                self.inner.dispatch(&channel, entry.frame);
            }
        }
    }

    /// Feed one decoded request frame into the server.
    pub fn handle_request(&self, frame: RequestFrame) {
        if self.inner.disposed.load(Ordering::Acquire) {
            tracing::trace!(id = frame.id(), "request after disposal, dropped");
            return;
        }

        match frame {
            RequestFrame::Call { .. } | RequestFrame::EventListen { .. } => {
                let found = match frame.channel() {
                    Some(name) => self.inner.channels.lock().get(name).cloned(),
                    None => None,
                };
                match found {
                    Some(channel) => self.inner.dispatch(&channel, frame),
                    None => self.inner.buffer(frame),
                }
            }
            RequestFrame::CallCancel { id } | RequestFrame::EventDispose { id } => {
                let entry = self.inner.active.lock().remove(&id);
                match entry {
                    Some(request) => request.dispose(),
                    // Already finished vs. cancel in flight; expected race.
                    None => tracing::trace!(id, "dispose for unknown request id"),
                }
            }
        }
    }

    /// Dispose every still-active request: propagate cancellation into every
    /// in-flight call and terminate every live event subscription.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let active: Vec<ActiveRequest> = {
            let mut active = self.inner.active.lock();
            active.drain().map(|(_, request)| request).collect()
        };
        for request in active {
            request.dispose();
        }

        let buffered: Vec<BufferedRequest> = {
            let mut buffered = self.inner.buffered.lock();
            buffered.drain().flat_map(|(_, entries)| entries).collect()
        };
        for entry in buffered {
            entry.timer.abort();
        }
    }

    pub fn ctx(&self) -> &Ctx {
        &self.inner.ctx
    }

    #[cfg(test)]
    fn active_count(&self) -> usize {
        self.inner.active.lock().len()
    }
}

impl<Ctx, C> ServerInner<Ctx, C>
where
    Ctx: Clone + Send + Sync + 'static,
    C: Codec + Clone + 'static,
{
    fn dispatch(self: &Arc<Self>, channel: &Arc<dyn ServerChannel<Ctx>>, frame: RequestFrame) {
        match frame {
            RequestFrame::Call {
                id, method, body, ..
            } => self.on_call(channel, id, method, body),
            RequestFrame::EventListen {
                id, event, body, ..
            } => self.on_listen(channel, id, event, body),
            _ => {}
        }
    }

    fn on_call(
        self: &Arc<Self>,
        channel: &Arc<dyn ServerChannel<Ctx>>,
        id: u32,
        method: String,
        body: Bytes,
    ) {
        let source = CancellationSource::new();
        let token = source.token();
        // The entry must exist before the call's continuation can run, so a
        // cancel that beats the result always has something to act on.
        if let Some(previous) = self.active.lock().insert(id, ActiveRequest::Call(source)) {
            previous.dispose();
        }

        let inner = self.clone();
        let channel = channel.clone();
        tokio::spawn(async move {
            let result = channel.call(inner.ctx.clone(), &method, body, token).await;
            inner.send_call_result(id, result);
            inner.active.lock().remove(&id);
        });
    }

    fn on_listen(
        self: &Arc<Self>,
        channel: &Arc<dyn ServerChannel<Ctx>>,
        id: u32,
        event: String,
        body: Bytes,
    ) {
        let mut stream = match channel.listen(self.ctx.clone(), &event, body) {
            Ok(stream) => stream,
            Err(e) => {
                // No subscriber-facing failure mode for events.
                tracing::debug!(id, event = %event, error = %e, "listen rejected, dropped");
                return;
            }
        };

        let inner = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                inner.send(ResponseFrame::EventFire { id, body: item });
            }
        });
        // A listen resent after a reconnect reuses its id; the stale
        // forwarder is replaced, not leaked.
        if let Some(previous) = self.active.lock().insert(id, ActiveRequest::Listen(handle)) {
            previous.dispose();
        }
    }

    fn buffer(self: &Arc<Self>, frame: RequestFrame) {
        let name = match frame.channel() {
            Some(name) => name.to_string(),
            None => return,
        };
        let id = frame.id();
        let is_call = frame.kind() == RequestKind::Call;

        let timer = tokio::spawn({
            let inner = self.clone();
            let name = name.clone();
            async move {
                tokio::time::sleep(inner.buffer_timeout).await;

                let removed = {
                    let mut buffered = inner.buffered.lock();
                    let removed = match buffered.get_mut(&name) {
                        Some(entries) => {
                            match entries.iter().position(|e| e.frame.id() == id) {
                                Some(pos) => {
                                    entries.remove(pos);
                                    true
                                }
                                None => false,
                            }
                        }
                        None => false,
                    };
                    if buffered.get(&name).is_some_and(|e| e.is_empty()) {
                        buffered.remove(&name);
                    }
                    removed
                };

                if !removed {
                    return;
                }

                if is_call {
                    tracing::debug!(channel = %name, id, "buffered call timed out unregistered");
                    inner.send_call_result(
                        id,
                        Err(RpcError::Remote(RemoteError {
                            message: format!(
                                "channel '{}' did not register within {}ms",
                                name,
                                inner.buffer_timeout.as_millis()
                            ),
                            name: "Unknown channel".to_string(),
                            stack: None,
                        })),
                    );
                } else {
                    tracing::debug!(channel = %name, id, "buffered listen timed out, dropped");
                }
            }
        });

        tracing::debug!(channel = %name, id, "buffering request for unregistered channel");
        self.buffered
            .lock()
            .entry(name)
            .or_default()
            .push(BufferedRequest { frame, timer });
    }

    fn send_call_result(&self, id: u32, result: Result<Bytes>) {
        let frame = match result {
            Ok(body) => ResponseFrame::CallSuccess { id, body },
            Err(RpcError::Value(body)) => ResponseFrame::CallErrorObj { id, body },
            Err(err) => {
                let payload = ErrorPayload::from_error(&err);
                let body = match self.codec.encode(&payload) {
                    Ok(bytes) => Bytes::from(bytes),
                    Err(encode_err) => {
                        tracing::debug!(id, error = %encode_err, "failed to encode error payload");
                        Bytes::new()
                    }
                };
                ResponseFrame::CallError { id, body }
            }
        };
        self.send(frame);
    }

    fn send(&self, frame: ResponseFrame) {
        if self.outbound.send(frame.encode()).is_err() {
            tracing::trace!("outbound closed, dropping response frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelHandler;
    use serde::Serialize;
    use std::time::Instant;

    type TestServer = ChannelServer<String, BincodeCodec>;

    fn new_server(timeout: Duration) -> (TestServer, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = ChannelServer::new(
            "test-peer".to_string(),
            BincodeCodec,
            ServerConfig::new().with_buffer_timeout(timeout),
            tx,
        );
        // Every server announces itself exactly once.
        let init = ResponseFrame::decode(rx.try_recv().unwrap()).unwrap();
        assert_eq!(init, ResponseFrame::Initialize);
        (server, rx)
    }

    fn encode<T: Serialize>(value: &T) -> Bytes {
        Bytes::from(BincodeCodec.encode(value).unwrap())
    }

    async fn next_response(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> ResponseFrame {
        let raw = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for response")
            .expect("outbound closed");
        ResponseFrame::decode(raw).unwrap()
    }

    fn ping_channel() -> Arc<dyn ServerChannel<String>> {
        Arc::new(
            ChannelHandler::new().method("ping", |_ctx, (): ()| async move {
                Ok("pong".to_string())
            }),
        )
    }

    #[tokio::test]
    async fn test_call_success() {
        let (server, mut rx) = new_server(Duration::from_millis(1000));
        server.register_channel("echo", ping_channel());

        server.handle_request(RequestFrame::Call {
            id: 0,
            channel: "echo".to_string(),
            method: "ping".to_string(),
            body: encode(&()),
        });

        match next_response(&mut rx).await {
            ResponseFrame::CallSuccess { id, body } => {
                assert_eq!(id, 0);
                let value: String = BincodeCodec.decode(&body).unwrap();
                assert_eq!(value, "pong");
            }
            other => panic!("unexpected response: {:?}", other),
        }
        // The active entry is released right after the response goes out.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(server.active_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_channel_times_out() {
        // Scenario: timeout 50ms, registration arrives at 100ms. The caller
        // sees the timeout error, never the late handler's result.
        let (server, mut rx) = new_server(Duration::from_millis(50));
        let start = Instant::now();

        server.handle_request(RequestFrame::Call {
            id: 3,
            channel: "X".to_string(),
            method: "ping".to_string(),
            body: encode(&()),
        });

        match next_response(&mut rx).await {
            ResponseFrame::CallError { id, body } => {
                assert_eq!(id, 3);
                let payload: ErrorPayload = BincodeCodec.decode(&body).unwrap();
                assert_eq!(payload.name, "Unknown channel");
                assert!(payload.message.contains("50ms"));
            }
            other => panic!("unexpected response: {:?}", other),
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(45), "{:?}", elapsed);

        tokio::time::sleep(Duration::from_millis(50)).await;
        server.register_channel("X", ping_channel());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "late registration must not replay");
    }

    #[tokio::test]
    async fn test_registration_within_window_replays_once() {
        // Scenario: timeout 200ms, registration at 50ms. Exactly one success.
        let (server, mut rx) = new_server(Duration::from_millis(200));

        server.handle_request(RequestFrame::Call {
            id: 1,
            channel: "X".to_string(),
            method: "ping".to_string(),
            body: encode(&()),
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        server.register_channel("X", ping_channel());

        match next_response(&mut rx).await {
            ResponseFrame::CallSuccess { id, body } => {
                assert_eq!(id, 1);
                let value: String = BincodeCodec.decode(&body).unwrap();
                assert_eq!(value, "pong");
            }
            other => panic!("unexpected response: {:?}", other),
        }

        // Past the original window: no duplicate response.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_buffered_requests_replay_in_arrival_order() {
        let (server, mut rx) = new_server(Duration::from_millis(500));

        for id in [5, 6, 7] {
            server.handle_request(RequestFrame::Call {
                id,
                channel: "queue".to_string(),
                method: "ping".to_string(),
                body: encode(&()),
            });
        }

        server.register_channel(
            "queue",
            Arc::new(ChannelHandler::new().method("ping", |_ctx, (): ()| async move {
                Ok(())
            })) as Arc<dyn ServerChannel<String>>,
        );

        let mut ids = Vec::new();
        for _ in 0..3 {
            match next_response(&mut rx).await {
                ResponseFrame::CallSuccess { id, .. } => ids.push(id),
                other => panic!("unexpected response: {:?}", other),
            }
        }
        ids.sort_unstable();
        assert_eq!(ids, vec![5, 6, 7]);
    }

    #[tokio::test]
    async fn test_unregistered_listen_times_out_silently() {
        let (server, mut rx) = new_server(Duration::from_millis(50));

        server.handle_request(RequestFrame::EventListen {
            id: 9,
            channel: "X".to_string(),
            event: "tick".to_string(),
            body: encode(&()),
        });

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(rx.try_recv().is_err(), "listen timeout must not respond");
    }

    #[tokio::test]
    async fn test_event_listen_fires_until_disposed() {
        let (server, mut rx) = new_server(Duration::from_millis(1000));

        let (event_tx, event_rx) = mpsc::unbounded_channel::<u32>();
        let stream = tokio_stream_from(event_rx);
        let channel: Arc<dyn ServerChannel<String>> = Arc::new(
            ChannelHandler::new().event("tick", move |_ctx, (): ()| stream.take_stream()),
        );
        server.register_channel("clock", channel);

        server.handle_request(RequestFrame::EventListen {
            id: 2,
            channel: "clock".to_string(),
            event: "tick".to_string(),
            body: encode(&()),
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        event_tx.send(1).unwrap();
        event_tx.send(2).unwrap();

        for expected in [1u32, 2] {
            match next_response(&mut rx).await {
                ResponseFrame::EventFire { id, body } => {
                    assert_eq!(id, 2);
                    let value: u32 = BincodeCodec.decode(&body).unwrap();
                    assert_eq!(value, expected);
                }
                other => panic!("unexpected response: {:?}", other),
            }
        }

        server.handle_request(RequestFrame::EventDispose { id: 2 });
        tokio::time::sleep(Duration::from_millis(20)).await;
        event_tx.send(3).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err(), "fires after dispose must not be sent");
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_handler() {
        let (server, mut rx) = new_server(Duration::from_millis(1000));

        let channel: Arc<dyn ServerChannel<String>> = Arc::new(
            ChannelHandler::new().method_with_cancel(
                "wait",
                |_ctx, (): (), cancel| async move {
                    cancel.cancelled().await;
                    Err::<(), _>(RpcError::Canceled)
                },
            ),
        );
        server.register_channel("work", channel);

        server.handle_request(RequestFrame::Call {
            id: 4,
            channel: "work".to_string(),
            method: "wait".to_string(),
            body: encode(&()),
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(server.active_count(), 1);

        server.handle_request(RequestFrame::CallCancel { id: 4 });

        // The handler observes the token and settles; its response still
        // goes out (the client side already dropped the handler).
        match next_response(&mut rx).await {
            ResponseFrame::CallError { id, body } => {
                assert_eq!(id, 4);
                let payload: ErrorPayload = BincodeCodec.decode(&body).unwrap();
                assert_eq!(payload.name, "Canceled");
            }
            other => panic!("unexpected response: {:?}", other),
        }
        assert_eq!(server.active_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_id_is_noop() {
        let (server, mut rx) = new_server(Duration::from_millis(1000));
        server.handle_request(RequestFrame::CallCancel { id: 77 });
        server.handle_request(RequestFrame::EventDispose { id: 78 });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reregistration_replaces_future_dispatches_only() {
        let (server, mut rx) = new_server(Duration::from_millis(1000));

        let slow: Arc<dyn ServerChannel<String>> = Arc::new(
            ChannelHandler::new().method("which", |_ctx, (): ()| async move {
                tokio::time::sleep(Duration::from_millis(60)).await;
                Ok("old".to_string())
            }),
        );
        server.register_channel("v", slow);

        server.handle_request(RequestFrame::Call {
            id: 0,
            channel: "v".to_string(),
            method: "which".to_string(),
            body: encode(&()),
        });

        let fresh: Arc<dyn ServerChannel<String>> = Arc::new(
            ChannelHandler::new().method("which", |_ctx, (): ()| async move {
                Ok("new".to_string())
            }),
        );
        server.register_channel("v", fresh);

        server.handle_request(RequestFrame::Call {
            id: 1,
            channel: "v".to_string(),
            method: "which".to_string(),
            body: encode(&()),
        });

        let mut results = HashMap::new();
        for _ in 0..2 {
            match next_response(&mut rx).await {
                ResponseFrame::CallSuccess { id, body } => {
                    let value: String = BincodeCodec.decode(&body).unwrap();
                    results.insert(id, value);
                }
                other => panic!("unexpected response: {:?}", other),
            }
        }
        assert_eq!(results[&0], "old");
        assert_eq!(results[&1], "new");
    }

    #[tokio::test]
    async fn test_error_obj_passes_raw_value_through() {
        let (server, mut rx) = new_server(Duration::from_millis(1000));

        let channel: Arc<dyn ServerChannel<String>> = Arc::new(
            ChannelHandler::new().method("reject", |_ctx, (): ()| async move {
                let raw = BincodeCodec.encode(&(404u16, "not found".to_string()))?;
                Err::<(), _>(RpcError::Value(Bytes::from(raw)))
            }),
        );
        server.register_channel("values", channel);

        server.handle_request(RequestFrame::Call {
            id: 8,
            channel: "values".to_string(),
            method: "reject".to_string(),
            body: encode(&()),
        });

        match next_response(&mut rx).await {
            ResponseFrame::CallErrorObj { id, body } => {
                assert_eq!(id, 8);
                let value: (u16, String) = BincodeCodec.decode(&body).unwrap();
                assert_eq!(value, (404, "not found".to_string()));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispose_cancels_everything() {
        let (server, mut rx) = new_server(Duration::from_millis(5000));

        let channel: Arc<dyn ServerChannel<String>> = Arc::new(
            ChannelHandler::new().method_with_cancel(
                "wait",
                |_ctx, (): (), cancel| async move {
                    cancel.cancelled().await;
                    Err::<(), _>(RpcError::Canceled)
                },
            ),
        );
        server.register_channel("work", channel);

        server.handle_request(RequestFrame::Call {
            id: 0,
            channel: "work".to_string(),
            method: "wait".to_string(),
            body: encode(&()),
        });
        // One buffered request on an unregistered name, to check its timer
        // is dropped too.
        server.handle_request(RequestFrame::Call {
            id: 1,
            channel: "missing".to_string(),
            method: "x".to_string(),
            body: encode(&()),
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        server.dispose();
        assert_eq!(server.active_count(), 0);

        // The cancelled in-flight call settles; requests after disposal are
        // ignored.
        let _ = next_response(&mut rx).await;
        server.handle_request(RequestFrame::Call {
            id: 2,
            channel: "work".to_string(),
            method: "wait".to_string(),
            body: encode(&()),
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    // Small helper turning an UnboundedReceiver into a reusable stream
    // factory for ChannelHandler::event (which takes Fn, not FnOnce).
    struct StreamCell(Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<u32>>>);

    #[derive(Clone)]
    struct StreamOnce(Arc<StreamCell>);

    fn tokio_stream_from(rx: tokio::sync::mpsc::UnboundedReceiver<u32>) -> StreamOnce {
        StreamOnce(Arc::new(StreamCell(Mutex::new(Some(rx)))))
    }

    impl StreamOnce {
        fn take_stream(&self) -> impl futures::Stream<Item = u32> + Send {
            let rx = self.0 .0.lock().take().expect("stream already taken");
            futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
        }
    }
}
