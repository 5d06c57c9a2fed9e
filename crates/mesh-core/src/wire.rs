//! Binary framing for the mesh peer protocol.
//!
//! Every datagram starts with a one-byte type tag followed by a
//! type-specific payload. String fields that are not the last field in a
//! message are null-terminated; the final field runs to the end of the
//! datagram. This mirrors the original peer/router message formats exactly
//! so any two implementations of this layout can interoperate.

use crate::node_id::NodeId;
use crate::relay::RelayMessage;

pub const TYPE_PING: u8 = 0x01;
pub const TYPE_PONG: u8 = 0x02;
pub const TYPE_ANNOUNCE: u8 = 0x03;
pub const TYPE_ROUTE_REQUEST: u8 = 0x04;
pub const TYPE_ROUTE_RESPONSE: u8 = 0x05;
pub const TYPE_RELAY_DATA: u8 = 0x06;
pub const TYPE_RELAY_ACK: u8 = 0x07;

/// Datagrams larger than this are refused at encode time.
pub const MAX_DATAGRAM_SIZE: usize = 1200;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame is empty")]
    Empty,
    #[error("unknown frame type byte 0x{0:02x}")]
    UnknownType(u8),
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("encoded frame of {0} bytes exceeds max datagram size")]
    TooLarge(usize),
}

#[derive(Debug, Clone)]
pub enum Frame {
    Ping { node_id: NodeId },
    Pong { node_id: NodeId },
    /// Reserved type byte, never constructed by this crate; decodes to the
    /// raw payload so callers can ignore it without treating it as malformed.
    Announce(Vec<u8>),
    RouteRequest {
        node_id: NodeId,
        request_id: String,
        destination: String,
    },
    RouteResponse {
        node_id: NodeId,
        request_id: String,
        destination: String,
        hops: u16,
        rtt_ms: f32,
    },
    RelayData(RelayMessage),
    RelayAck { message_id: String, success: bool },
}

fn split_null_terminated(buf: &[u8]) -> Result<(&[u8], &[u8]), CodecError> {
    let idx = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(CodecError::Malformed("missing null terminator"))?;
    Ok((&buf[..idx], &buf[idx + 1..]))
}

fn node_id_of(bytes: &[u8]) -> Result<NodeId, CodecError> {
    let s = std::str::from_utf8(bytes).map_err(|_| CodecError::Malformed("node id not utf-8"))?;
    NodeId::new(s).map_err(|_| CodecError::Malformed("invalid node id"))
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        match self {
            Frame::Ping { node_id } => {
                out.push(TYPE_PING);
                out.extend_from_slice(node_id.as_str().as_bytes());
                out.push(0);
            }
            Frame::Pong { node_id } => {
                out.push(TYPE_PONG);
                out.extend_from_slice(node_id.as_str().as_bytes());
                out.push(0);
            }
            Frame::Announce(payload) => {
                out.push(TYPE_ANNOUNCE);
                out.extend_from_slice(payload);
            }
            Frame::RouteRequest {
                node_id,
                request_id,
                destination,
            } => {
                out.push(TYPE_ROUTE_REQUEST);
                out.extend_from_slice(node_id.as_str().as_bytes());
                out.push(0);
                out.extend_from_slice(request_id.as_bytes());
                out.push(0);
                out.extend_from_slice(destination.as_bytes());
            }
            Frame::RouteResponse {
                node_id,
                request_id,
                destination,
                hops,
                rtt_ms,
            } => {
                out.push(TYPE_ROUTE_RESPONSE);
                out.extend_from_slice(node_id.as_str().as_bytes());
                out.push(0);
                out.extend_from_slice(request_id.as_bytes());
                out.push(0);
                out.extend_from_slice(destination.as_bytes());
                out.push(0);
                out.extend_from_slice(&hops.to_be_bytes());
                out.extend_from_slice(&rtt_ms.to_be_bytes());
            }
            Frame::RelayData(message) => {
                out.push(TYPE_RELAY_DATA);
                out.extend_from_slice(&message.to_bytes()?);
            }
            Frame::RelayAck {
                message_id,
                success,
            } => {
                out.push(TYPE_RELAY_ACK);
                out.extend_from_slice(message_id.as_bytes());
                out.push(0);
                out.push(if *success { 1 } else { 0 });
            }
        }
        if out.len() > MAX_DATAGRAM_SIZE {
            return Err(CodecError::TooLarge(out.len()));
        }
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Frame, CodecError> {
        let (&ty, rest) = data.split_first().ok_or(CodecError::Empty)?;
        match ty {
            TYPE_PING => {
                let id_bytes = rest.split(|&b| b == 0).next().unwrap_or(rest);
                Ok(Frame::Ping {
                    node_id: node_id_of(id_bytes)?,
                })
            }
            TYPE_PONG => {
                let id_bytes = rest.split(|&b| b == 0).next().unwrap_or(rest);
                Ok(Frame::Pong {
                    node_id: node_id_of(id_bytes)?,
                })
            }
            TYPE_ANNOUNCE => Ok(Frame::Announce(rest.to_vec())),
            TYPE_ROUTE_REQUEST => {
                let (id_bytes, rest) = split_null_terminated(rest)?;
                let (req_bytes, dest_bytes) = split_null_terminated(rest)?;
                Ok(Frame::RouteRequest {
                    node_id: node_id_of(id_bytes)?,
                    request_id: String::from_utf8_lossy(req_bytes).into_owned(),
                    destination: String::from_utf8_lossy(dest_bytes).into_owned(),
                })
            }
            TYPE_ROUTE_RESPONSE => {
                let (id_bytes, rest) = split_null_terminated(rest)?;
                let (req_bytes, rest) = split_null_terminated(rest)?;
                let (dest_bytes, rest) = split_null_terminated(rest)?;
                if rest.len() < 6 {
                    return Err(CodecError::Malformed("route response truncated"));
                }
                let hops = u16::from_be_bytes([rest[0], rest[1]]);
                let rtt_ms = f32::from_be_bytes([rest[2], rest[3], rest[4], rest[5]]);
                Ok(Frame::RouteResponse {
                    node_id: node_id_of(id_bytes)?,
                    request_id: String::from_utf8_lossy(req_bytes).into_owned(),
                    destination: String::from_utf8_lossy(dest_bytes).into_owned(),
                    hops,
                    rtt_ms,
                })
            }
            TYPE_RELAY_DATA => Ok(Frame::RelayData(RelayMessage::from_bytes(rest)?)),
            TYPE_RELAY_ACK => {
                let (id_bytes, rest) = split_null_terminated(rest)?;
                let success = *rest
                    .first()
                    .ok_or(CodecError::Malformed("relay ack missing success byte"))?
                    != 0;
                Ok(Frame::RelayAck {
                    message_id: String::from_utf8_lossy(id_bytes).into_owned(),
                    success,
                })
            }
            other => Err(CodecError::UnknownType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nid(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    #[test]
    fn ping_roundtrip() {
        let frame = Frame::Ping { node_id: nid("test-node-001") };
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes[0], TYPE_PING);
        match Frame::decode(&bytes).unwrap() {
            Frame::Ping { node_id } => assert_eq!(node_id.as_str(), "test-node-001"),
            _ => panic!("wrong frame"),
        }
    }

    #[test]
    fn route_request_roundtrip() {
        let frame = Frame::RouteRequest {
            node_id: nid("node-a"),
            request_id: "ab12cd34".into(),
            destination: "controller".into(),
        };
        let bytes = frame.encode().unwrap();
        match Frame::decode(&bytes).unwrap() {
            Frame::RouteRequest {
                node_id,
                request_id,
                destination,
            } => {
                assert_eq!(node_id.as_str(), "node-a");
                assert_eq!(request_id, "ab12cd34");
                assert_eq!(destination, "controller");
            }
            _ => panic!("wrong frame"),
        }
    }

    #[test]
    fn route_response_roundtrip() {
        let frame = Frame::RouteResponse {
            node_id: nid("node-b"),
            request_id: "ab12cd34".into(),
            destination: "controller".into(),
            hops: 1,
            rtt_ms: 55.5,
        };
        let bytes = frame.encode().unwrap();
        match Frame::decode(&bytes).unwrap() {
            Frame::RouteResponse { hops, rtt_ms, .. } => {
                assert_eq!(hops, 1);
                assert!((rtt_ms - 55.5).abs() < 0.001);
            }
            _ => panic!("wrong frame"),
        }
    }

    #[test]
    fn relay_ack_roundtrip() {
        let frame = Frame::RelayAck {
            message_id: "msg-1".into(),
            success: true,
        };
        let bytes = frame.encode().unwrap();
        match Frame::decode(&bytes).unwrap() {
            Frame::RelayAck { message_id, success } => {
                assert_eq!(message_id, "msg-1");
                assert!(success);
            }
            _ => panic!("wrong frame"),
        }
    }

    #[test]
    fn empty_frame_is_malformed() {
        assert!(matches!(Frame::decode(&[]), Err(CodecError::Empty)));
    }

    #[test]
    fn unknown_type_is_reported() {
        assert!(matches!(
            Frame::decode(&[0xee, 1, 2, 3]),
            Err(CodecError::UnknownType(0xee))
        ));
    }

    #[test]
    fn truncated_route_response_is_malformed() {
        let mut bytes = vec![TYPE_ROUTE_RESPONSE];
        bytes.extend_from_slice(b"node-b\0req\0controller\0");
        assert!(matches!(
            Frame::decode(&bytes),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn oversized_frame_refused_at_encode() {
        let frame = Frame::Announce(vec![0u8; MAX_DATAGRAM_SIZE + 1]);
        assert!(matches!(frame.encode(), Err(CodecError::TooLarge(_))));
    }
}
