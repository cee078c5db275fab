//! chanrpc - bidirectional channel RPC and event subscription over any
//! ordered duplex byte transport.

pub mod cancel;
pub mod channel;
pub mod client;
pub mod codec;
pub mod error;
pub mod frame;
pub mod peer;
pub mod server;
pub mod transport;

pub use cancel::{CancellationSource, CancellationToken};
pub use channel::{ChannelHandler, EventStream, ServerChannel};
pub use client::{ChannelClient, ChannelProxy, EventSource, EventSubscription};
pub use codec::{BincodeCodec, Codec, JsonCodec};
pub use error::{
    ErrorPayload, RemoteError, Result, RpcError, TransportError, TransportResult,
};
pub use frame::{RequestFrame, RequestKind, ResponseFrame, ResponseKind};
pub use peer::Peer;
pub use server::{ChannelServer, ServerConfig, DEFAULT_BUFFER_TIMEOUT};
pub use transport::pair::{PairConfig, PairTransport};
pub use transport::routed::RoutedTransport;
pub use transport::FrameTransport;
