use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, RpcError};

/// Request frame kind codes, always at header position 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestKind {
    Call = 100,
    CallCancel = 101,
    EventListen = 102,
    EventDispose = 103,
}

impl RequestKind {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            100 => Ok(RequestKind::Call),
            101 => Ok(RequestKind::CallCancel),
            102 => Ok(RequestKind::EventListen),
            103 => Ok(RequestKind::EventDispose),
            _ => Err(RpcError::Frame(format!(
                "unknown request kind: {}",
                value
            ))),
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Response frame kind codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResponseKind {
    Initialize = 200,
    CallSuccess = 201,
    CallError = 202,
    CallErrorObj = 203,
    EventFire = 204,
}

impl ResponseKind {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            200 => Ok(ResponseKind::Initialize),
            201 => Ok(ResponseKind::CallSuccess),
            202 => Ok(ResponseKind::CallError),
            203 => Ok(ResponseKind::CallErrorObj),
            204 => Ok(ResponseKind::EventFire),
            _ => Err(RpcError::Frame(format!(
                "unknown response kind: {}",
                value
            ))),
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Peek the kind byte of an encoded frame without decoding it.
pub fn peek_kind(frame: &[u8]) -> Option<u8> {
    frame.first().copied()
}

pub fn is_request_kind(kind: u8) -> bool {
    (100..=103).contains(&kind)
}

pub fn is_response_kind(kind: u8) -> bool {
    (200..=204).contains(&kind)
}

/// One request unit of the wire protocol.
///
/// The header is fixed-position: position 0 is the kind, position 1 the
/// request id, positions 2/3 the channel and method names for `Call` and
/// `EventListen`. The body is an opaque codec-encoded value.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestFrame {
    Call {
        id: u32,
        channel: String,
        method: String,
        body: Bytes,
    },
    CallCancel {
        id: u32,
    },
    EventListen {
        id: u32,
        channel: String,
        event: String,
        body: Bytes,
    },
    EventDispose {
        id: u32,
    },
}

impl RequestFrame {
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestFrame::Call { .. } => RequestKind::Call,
            RequestFrame::CallCancel { .. } => RequestKind::CallCancel,
            RequestFrame::EventListen { .. } => RequestKind::EventListen,
            RequestFrame::EventDispose { .. } => RequestKind::EventDispose,
        }
    }

    pub fn id(&self) -> u32 {
        match self {
            RequestFrame::Call { id, .. }
            | RequestFrame::CallCancel { id }
            | RequestFrame::EventListen { id, .. }
            | RequestFrame::EventDispose { id } => *id,
        }
    }

    /// The target channel name, for the kinds that carry one.
    pub fn channel(&self) -> Option<&str> {
        match self {
            RequestFrame::Call { channel, .. } | RequestFrame::EventListen { channel, .. } => {
                Some(channel)
            }
            _ => None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u8(self.kind().to_u8());
        buf.put_u32_le(self.id());

        match self {
            RequestFrame::Call {
                channel,
                method,
                body,
                ..
            } => {
                put_string(&mut buf, channel);
                put_string(&mut buf, method);
                buf.put_slice(body);
            }
            RequestFrame::EventListen {
                channel,
                event,
                body,
                ..
            } => {
                put_string(&mut buf, channel);
                put_string(&mut buf, event);
                buf.put_slice(body);
            }
            RequestFrame::CallCancel { .. } | RequestFrame::EventDispose { .. } => {}
        }

        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        if buf.remaining() < 5 {
            return Err(RpcError::Frame("request frame too short".to_string()));
        }

        let kind = RequestKind::from_u8(buf.get_u8())?;
        let id = buf.get_u32_le();

        match kind {
            RequestKind::Call => {
                let channel = get_string(&mut buf)?;
                let method = get_string(&mut buf)?;
                Ok(RequestFrame::Call {
                    id,
                    channel,
                    method,
                    body: buf,
                })
            }
            RequestKind::EventListen => {
                let channel = get_string(&mut buf)?;
                let event = get_string(&mut buf)?;
                Ok(RequestFrame::EventListen {
                    id,
                    channel,
                    event,
                    body: buf,
                })
            }
            RequestKind::CallCancel => Ok(RequestFrame::CallCancel { id }),
            RequestKind::EventDispose => Ok(RequestFrame::EventDispose { id }),
        }
    }
}

/// One response unit of the wire protocol. `Initialize` carries no id; it is
/// the one-time handshake singleton per connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseFrame {
    Initialize,
    CallSuccess { id: u32, body: Bytes },
    CallError { id: u32, body: Bytes },
    CallErrorObj { id: u32, body: Bytes },
    EventFire { id: u32, body: Bytes },
}

impl ResponseFrame {
    pub fn kind(&self) -> ResponseKind {
        match self {
            ResponseFrame::Initialize => ResponseKind::Initialize,
            ResponseFrame::CallSuccess { .. } => ResponseKind::CallSuccess,
            ResponseFrame::CallError { .. } => ResponseKind::CallError,
            ResponseFrame::CallErrorObj { .. } => ResponseKind::CallErrorObj,
            ResponseFrame::EventFire { .. } => ResponseKind::EventFire,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u8(self.kind().to_u8());

        match self {
            ResponseFrame::Initialize => {}
            ResponseFrame::CallSuccess { id, body }
            | ResponseFrame::CallError { id, body }
            | ResponseFrame::CallErrorObj { id, body }
            | ResponseFrame::EventFire { id, body } => {
                buf.put_u32_le(*id);
                buf.put_slice(body);
            }
        }

        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        if buf.remaining() < 1 {
            return Err(RpcError::Frame("response frame too short".to_string()));
        }

        let kind = ResponseKind::from_u8(buf.get_u8())?;

        if kind == ResponseKind::Initialize {
            return Ok(ResponseFrame::Initialize);
        }

        if buf.remaining() < 4 {
            return Err(RpcError::Frame("response frame too short".to_string()));
        }
        let id = buf.get_u32_le();

        Ok(match kind {
            ResponseKind::Initialize => unreachable!(),
            ResponseKind::CallSuccess => ResponseFrame::CallSuccess { id, body: buf },
            ResponseKind::CallError => ResponseFrame::CallError { id, body: buf },
            ResponseKind::CallErrorObj => ResponseFrame::CallErrorObj { id, body: buf },
            ResponseKind::EventFire => ResponseFrame::EventFire { id, body: buf },
        })
    }
}

fn put_string(buf: &mut BytesMut, value: &str) {
    debug_assert!(value.len() <= u16::MAX as usize);
    buf.put_u16_le(value.len() as u16);
    buf.put_slice(value.as_bytes());
}

fn get_string(buf: &mut Bytes) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(RpcError::Frame("truncated string length".to_string()));
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(RpcError::Frame("truncated string".to_string()));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|e| RpcError::Frame(format!("invalid string: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{BincodeCodec, Codec};
    use serde::{Deserialize, Serialize};

    #[test]
    fn test_call_round_trip() {
        let frame = RequestFrame::Call {
            id: 7,
            channel: "files".to_string(),
            method: "stat".to_string(),
            body: Bytes::from_static(b"\x01\x02\x03"),
        };

        let decoded = RequestFrame::decode(frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_listen_round_trip() {
        let frame = RequestFrame::EventListen {
            id: 42,
            channel: "watcher".to_string(),
            event: "onDidChange".to_string(),
            body: Bytes::new(),
        };

        let decoded = RequestFrame::decode(frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_cancel_and_dispose_round_trip() {
        for frame in [
            RequestFrame::CallCancel { id: 1 },
            RequestFrame::EventDispose { id: u32::MAX },
        ] {
            let decoded = RequestFrame::decode(frame.encode()).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_response_round_trips() {
        let frames = [
            ResponseFrame::Initialize,
            ResponseFrame::CallSuccess {
                id: 1,
                body: Bytes::from_static(b"ok"),
            },
            ResponseFrame::CallError {
                id: 2,
                body: Bytes::from_static(b"err"),
            },
            ResponseFrame::CallErrorObj {
                id: 3,
                body: Bytes::from_static(b"obj"),
            },
            ResponseFrame::EventFire {
                id: 4,
                body: Bytes::from_static(b"fire"),
            },
        ];

        for frame in frames {
            let decoded = ResponseFrame::decode(frame.encode()).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_nested_body_survives_encode_decode() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Inner {
            items: Vec<String>,
        }

        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Payload {
            id: u64,
            inner: Inner,
            pairs: Vec<(String, i32)>,
        }

        let payload = Payload {
            id: 9,
            inner: Inner {
                items: vec!["a".to_string(), "b".to_string()],
            },
            pairs: vec![("x".to_string(), -1), ("y".to_string(), 2)],
        };

        let codec = BincodeCodec;
        let frame = RequestFrame::Call {
            id: 0,
            channel: "c".to_string(),
            method: "m".to_string(),
            body: Bytes::from(codec.encode(&payload).unwrap()),
        };

        match RequestFrame::decode(frame.encode()).unwrap() {
            RequestFrame::Call { body, .. } => {
                let decoded: Payload = codec.decode(&body).unwrap();
                assert_eq!(decoded, payload);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = RequestFrame::decode(Bytes::from_static(&[99, 0, 0, 0, 0])).unwrap_err();
        assert!(matches!(err, RpcError::Frame(_)));

        let err = ResponseFrame::decode(Bytes::from_static(&[150, 0, 0, 0, 0])).unwrap_err();
        assert!(matches!(err, RpcError::Frame(_)));
    }

    #[test]
    fn test_truncated_frames_rejected() {
        assert!(RequestFrame::decode(Bytes::from_static(&[100, 0])).is_err());
        assert!(ResponseFrame::decode(Bytes::new()).is_err());
        // Call frame with a string length pointing past the end.
        assert!(RequestFrame::decode(Bytes::from_static(&[100, 0, 0, 0, 0, 10, 0, b'a'])).is_err());
    }

    #[test]
    fn test_kind_routing_helpers() {
        let call = RequestFrame::CallCancel { id: 0 }.encode();
        assert!(is_request_kind(peek_kind(&call).unwrap()));
        assert!(!is_response_kind(peek_kind(&call).unwrap()));

        let init = ResponseFrame::Initialize.encode();
        assert!(is_response_kind(peek_kind(&init).unwrap()));
        assert_eq!(peek_kind(&[]), None);
    }
}
