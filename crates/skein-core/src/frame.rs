//! Frame model for the SKEIN wire protocol.
//!
//! Frames are a tagged sum; packets carry a sequence of frames. The binary
//! codec keeps all multi-byte fields big-endian (network byte order). It is
//! deliberately simple: SKEIN does not chase bit-exact compatibility with
//! IETF QUIC framing.

use crate::error::UnpackError;
use crate::protocol::{ByteCount, PacketNumber, PathId, StreamId};
use std::net::SocketAddr;
use std::time::Duration;

/// An inclusive range of acknowledged packet numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRange {
    /// Smallest packet number in the range.
    pub first: PacketNumber,
    /// Largest packet number in the range.
    pub last: PacketNumber,
}

/// STREAM frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    /// Stream the data belongs to.
    pub stream_id: StreamId,
    /// Byte offset of `data` within the stream.
    pub offset: ByteCount,
    /// The payload bytes.
    pub data: Vec<u8>,
    /// Final frame of the stream.
    pub fin: bool,
    /// Set when the stream is unreliable; such frames are never
    /// retransmitted.
    pub unreliable: bool,
}

impl StreamFrame {
    /// Length of the carried data.
    #[must_use]
    pub fn data_len(&self) -> ByteCount {
        self.data.len() as ByteCount
    }

    /// First byte offset past the carried data.
    #[must_use]
    pub fn end_offset(&self) -> ByteCount {
        self.offset + self.data_len()
    }
}

/// ACK frame payload. `ranges` is non-empty only when there are missing
/// packet numbers between `lowest_acked` and `largest_acked`; when present
/// it is ordered largest range first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    /// Largest packet number being acknowledged.
    pub largest_acked: PacketNumber,
    /// Smallest packet number being acknowledged.
    pub lowest_acked: PacketNumber,
    /// Peer-side delay between receiving `largest_acked` and sending this
    /// ACK.
    pub delay_time: Duration,
    /// Disjoint acknowledged ranges, largest first. Empty means the whole
    /// span `[lowest_acked, largest_acked]` is acknowledged.
    pub ranges: Vec<AckRange>,
    /// Path this ACK describes.
    pub path_id: PathId,
}

impl AckFrame {
    /// Whether packet numbers are missing between lowest and largest.
    #[must_use]
    pub fn has_missing_ranges(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// Whether this frame acknowledges `pn`.
    #[must_use]
    pub fn acks_packet(&self, pn: PacketNumber) -> bool {
        if pn < self.lowest_acked || pn > self.largest_acked {
            return false;
        }
        if self.ranges.is_empty() {
            return true;
        }
        self.ranges.iter().any(|r| r.first <= pn && pn <= r.last)
    }
}

/// CLOSE_PATH frame: the final ACK snapshot for a path being closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosePathFrame {
    /// Path being closed.
    pub path_id: PathId,
    /// Largest packet number acknowledged on that path.
    pub largest_acked: PacketNumber,
    /// Smallest packet number acknowledged on that path.
    pub lowest_acked: PacketNumber,
    /// Disjoint acknowledged ranges, largest first.
    pub ranges: Vec<AckRange>,
}

impl ClosePathFrame {
    /// Whether packet numbers are missing between lowest and largest.
    #[must_use]
    pub fn has_missing_ranges(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// Whether this frame acknowledges `pn`.
    #[must_use]
    pub fn acks_packet(&self, pn: PacketNumber) -> bool {
        if pn < self.lowest_acked || pn > self.largest_acked {
            return false;
        }
        if self.ranges.is_empty() {
            return true;
        }
        self.ranges.iter().any(|r| r.first <= pn && pn <= r.last)
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Stream data.
    Stream(StreamFrame),
    /// Acknowledgment ranges for one path.
    Ack(AckFrame),
    /// Final ACK snapshot closing a path.
    ClosePath(ClosePathFrame),
    /// Tells the peer to stop waiting for packets below `least_unacked`.
    StopWaiting {
        /// Smallest packet number still awaiting acknowledgment.
        least_unacked: PacketNumber,
    },
    /// Flow control credit for a stream (`stream_id == 0` is the
    /// connection window).
    WindowUpdate {
        /// Stream the credit applies to.
        stream_id: StreamId,
        /// New absolute receive offset.
        byte_offset: ByteCount,
    },
    /// Sender is blocked on flow control.
    Blocked {
        /// Blocked stream (`0` for the connection window).
        stream_id: StreamId,
    },
    /// Keepalive / probe.
    Ping,
    /// Advertises the sender's view of its paths.
    Paths {
        /// Known path ids.
        path_ids: Vec<PathId>,
    },
    /// Advertises an additional local address usable for new paths.
    AddAddress {
        /// The advertised address.
        addr: SocketAddr,
    },
    /// Abrupt stream termination.
    RstStream {
        /// Stream being reset.
        stream_id: StreamId,
        /// Final byte offset written on the stream.
        byte_offset: ByteCount,
        /// Application error code.
        error_code: u32,
    },
}

impl Frame {
    /// Whether loss of this frame requires queueing a replacement.
    ///
    /// ACK and STOP_WAITING state is regenerated, never replayed, and
    /// unreliable stream data is dropped on loss by design.
    #[must_use]
    pub fn is_retransmittable(&self) -> bool {
        match self {
            Frame::Ack(_) | Frame::StopWaiting { .. } => false,
            Frame::Stream(sf) => !sf.unreliable,
            _ => true,
        }
    }

    /// Whether receiving this frame counts toward the ACK-instigation
    /// policy. Unlike [`Frame::is_retransmittable`], unreliable stream
    /// frames do count: the peer still wants them acknowledged promptly.
    #[must_use]
    pub fn instigates_ack(&self) -> bool {
        !matches!(self, Frame::Ack(_) | Frame::StopWaiting { .. })
    }
}

/// Drops all frames whose loss does not require a replacement.
#[must_use]
pub fn strip_non_retransmittable(frames: Vec<Frame>) -> Vec<Frame> {
    frames.into_iter().filter(Frame::is_retransmittable).collect()
}

/// True if at least one frame is retransmittable.
#[must_use]
pub fn has_retransmittable(frames: &[Frame]) -> bool {
    frames.iter().any(Frame::is_retransmittable)
}

/// True if at least one frame instigates an ACK.
#[must_use]
pub fn instigates_ack(frames: &[Frame]) -> bool {
    frames.iter().any(Frame::instigates_ack)
}

// Wire type tags.
const TYPE_STREAM: u8 = 0x01;
const TYPE_ACK: u8 = 0x02;
const TYPE_CLOSE_PATH: u8 = 0x03;
const TYPE_STOP_WAITING: u8 = 0x04;
const TYPE_WINDOW_UPDATE: u8 = 0x05;
const TYPE_BLOCKED: u8 = 0x06;
const TYPE_PING: u8 = 0x07;
const TYPE_PATHS: u8 = 0x08;
const TYPE_ADD_ADDRESS: u8 = 0x09;
const TYPE_RST_STREAM: u8 = 0x0A;

const STREAM_FLAG_FIN: u8 = 0b0000_0001;
const STREAM_FLAG_UNRELIABLE: u8 = 0b0000_0010;

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn get_u8(input: &mut &[u8]) -> Result<u8, UnpackError> {
    let (&b, rest) = input
        .split_first()
        .ok_or_else(|| UnpackError::Malformed("truncated frame".into()))?;
    *input = rest;
    Ok(b)
}

fn get_bytes<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8], UnpackError> {
    if input.len() < n {
        return Err(UnpackError::Malformed("truncated frame".into()));
    }
    let (head, rest) = input.split_at(n);
    *input = rest;
    Ok(head)
}

fn get_u16(input: &mut &[u8]) -> Result<u16, UnpackError> {
    let b = get_bytes(input, 2)?;
    Ok(u16::from_be_bytes([b[0], b[1]]))
}

fn get_u32(input: &mut &[u8]) -> Result<u32, UnpackError> {
    let b = get_bytes(input, 4)?;
    Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn get_u64(input: &mut &[u8]) -> Result<u64, UnpackError> {
    let b = get_bytes(input, 8)?;
    Ok(u64::from_be_bytes([
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
    ]))
}

impl Frame {
    /// Serialized length in bytes.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        match self {
            Frame::Stream(sf) => 1 + 1 + 8 + 8 + 2 + sf.data.len(),
            Frame::Ack(af) => 1 + 1 + 8 + 8 + 4 + 2 + af.ranges.len() * 16,
            Frame::ClosePath(cp) => 1 + 1 + 8 + 8 + 2 + cp.ranges.len() * 16,
            Frame::StopWaiting { .. } => 1 + 8,
            Frame::WindowUpdate { .. } => 1 + 8 + 8,
            Frame::Blocked { .. } => 1 + 8,
            Frame::Ping => 1,
            Frame::Paths { path_ids } => 1 + 1 + path_ids.len(),
            Frame::AddAddress { addr } => 1 + 1 + if addr.is_ipv4() { 6 } else { 18 },
            Frame::RstStream { .. } => 1 + 8 + 8 + 4,
        }
    }

    /// Append the wire encoding of this frame to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Frame::Stream(sf) => {
                buf.push(TYPE_STREAM);
                let mut flags = 0u8;
                if sf.fin {
                    flags |= STREAM_FLAG_FIN;
                }
                if sf.unreliable {
                    flags |= STREAM_FLAG_UNRELIABLE;
                }
                buf.push(flags);
                put_u64(buf, sf.stream_id);
                put_u64(buf, sf.offset);
                put_u16(buf, sf.data.len() as u16);
                buf.extend_from_slice(&sf.data);
            }
            Frame::Ack(af) => {
                buf.push(TYPE_ACK);
                buf.push(af.path_id);
                put_u64(buf, af.largest_acked);
                put_u64(buf, af.lowest_acked);
                put_u32(buf, af.delay_time.as_micros().min(u128::from(u32::MAX)) as u32);
                put_u16(buf, af.ranges.len() as u16);
                for r in &af.ranges {
                    put_u64(buf, r.first);
                    put_u64(buf, r.last);
                }
            }
            Frame::ClosePath(cp) => {
                buf.push(TYPE_CLOSE_PATH);
                buf.push(cp.path_id);
                put_u64(buf, cp.largest_acked);
                put_u64(buf, cp.lowest_acked);
                put_u16(buf, cp.ranges.len() as u16);
                for r in &cp.ranges {
                    put_u64(buf, r.first);
                    put_u64(buf, r.last);
                }
            }
            Frame::StopWaiting { least_unacked } => {
                buf.push(TYPE_STOP_WAITING);
                put_u64(buf, *least_unacked);
            }
            Frame::WindowUpdate {
                stream_id,
                byte_offset,
            } => {
                buf.push(TYPE_WINDOW_UPDATE);
                put_u64(buf, *stream_id);
                put_u64(buf, *byte_offset);
            }
            Frame::Blocked { stream_id } => {
                buf.push(TYPE_BLOCKED);
                put_u64(buf, *stream_id);
            }
            Frame::Ping => buf.push(TYPE_PING),
            Frame::Paths { path_ids } => {
                buf.push(TYPE_PATHS);
                buf.push(path_ids.len() as u8);
                buf.extend_from_slice(path_ids);
            }
            Frame::AddAddress { addr } => {
                buf.push(TYPE_ADD_ADDRESS);
                match addr {
                    SocketAddr::V4(v4) => {
                        buf.push(4);
                        buf.extend_from_slice(&v4.ip().octets());
                        put_u16(buf, v4.port());
                    }
                    SocketAddr::V6(v6) => {
                        buf.push(6);
                        buf.extend_from_slice(&v6.ip().octets());
                        put_u16(buf, v6.port());
                    }
                }
            }
            Frame::RstStream {
                stream_id,
                byte_offset,
                error_code,
            } => {
                buf.push(TYPE_RST_STREAM);
                put_u64(buf, *stream_id);
                put_u64(buf, *byte_offset);
                put_u32(buf, *error_code);
            }
        }
    }

    /// Decode one frame from the front of `input`, advancing it.
    ///
    /// # Errors
    /// Returns [`UnpackError::Malformed`] on a truncated or unknown frame.
    pub fn decode(input: &mut &[u8]) -> Result<Self, UnpackError> {
        let tag = get_u8(input)?;
        match tag {
            TYPE_STREAM => {
                let flags = get_u8(input)?;
                let stream_id = get_u64(input)?;
                let offset = get_u64(input)?;
                let len = get_u16(input)? as usize;
                let data = get_bytes(input, len)?.to_vec();
                Ok(Frame::Stream(StreamFrame {
                    stream_id,
                    offset,
                    data,
                    fin: flags & STREAM_FLAG_FIN != 0,
                    unreliable: flags & STREAM_FLAG_UNRELIABLE != 0,
                }))
            }
            TYPE_ACK => {
                let path_id = get_u8(input)?;
                let largest_acked = get_u64(input)?;
                let lowest_acked = get_u64(input)?;
                let delay_us = get_u32(input)?;
                let n = get_u16(input)? as usize;
                let mut ranges = Vec::with_capacity(n);
                for _ in 0..n {
                    let first = get_u64(input)?;
                    let last = get_u64(input)?;
                    ranges.push(AckRange { first, last });
                }
                Ok(Frame::Ack(AckFrame {
                    largest_acked,
                    lowest_acked,
                    delay_time: Duration::from_micros(u64::from(delay_us)),
                    ranges,
                    path_id,
                }))
            }
            TYPE_CLOSE_PATH => {
                let path_id = get_u8(input)?;
                let largest_acked = get_u64(input)?;
                let lowest_acked = get_u64(input)?;
                let n = get_u16(input)? as usize;
                let mut ranges = Vec::with_capacity(n);
                for _ in 0..n {
                    let first = get_u64(input)?;
                    let last = get_u64(input)?;
                    ranges.push(AckRange { first, last });
                }
                Ok(Frame::ClosePath(ClosePathFrame {
                    path_id,
                    largest_acked,
                    lowest_acked,
                    ranges,
                }))
            }
            TYPE_STOP_WAITING => Ok(Frame::StopWaiting {
                least_unacked: get_u64(input)?,
            }),
            TYPE_WINDOW_UPDATE => Ok(Frame::WindowUpdate {
                stream_id: get_u64(input)?,
                byte_offset: get_u64(input)?,
            }),
            TYPE_BLOCKED => Ok(Frame::Blocked {
                stream_id: get_u64(input)?,
            }),
            TYPE_PING => Ok(Frame::Ping),
            TYPE_PATHS => {
                let n = get_u8(input)? as usize;
                let ids = get_bytes(input, n)?.to_vec();
                Ok(Frame::Paths { path_ids: ids })
            }
            TYPE_ADD_ADDRESS => {
                let family = get_u8(input)?;
                let addr = match family {
                    4 => {
                        let b = get_bytes(input, 4)?;
                        let ip = std::net::Ipv4Addr::new(b[0], b[1], b[2], b[3]);
                        let port = get_u16(input)?;
                        SocketAddr::from((ip, port))
                    }
                    6 => {
                        let b = get_bytes(input, 16)?;
                        let mut octets = [0u8; 16];
                        octets.copy_from_slice(b);
                        let ip = std::net::Ipv6Addr::from(octets);
                        let port = get_u16(input)?;
                        SocketAddr::from((ip, port))
                    }
                    other => {
                        return Err(UnpackError::Malformed(format!(
                            "unknown address family {other}"
                        )))
                    }
                };
                Ok(Frame::AddAddress { addr })
            }
            TYPE_RST_STREAM => Ok(Frame::RstStream {
                stream_id: get_u64(input)?,
                byte_offset: get_u64(input)?,
                error_code: get_u32(input)?,
            }),
            other => Err(UnpackError::Malformed(format!("unknown frame type 0x{other:02X}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) {
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        assert_eq!(buf.len(), frame.wire_len());
        let mut input = buf.as_slice();
        let decoded = Frame::decode(&mut input).unwrap();
        assert!(input.is_empty());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_stream_frame_roundtrip() {
        roundtrip(Frame::Stream(StreamFrame {
            stream_id: 5,
            offset: 4096,
            data: vec![1, 2, 3, 4],
            fin: true,
            unreliable: false,
        }));
    }

    #[test]
    fn test_ack_frame_roundtrip() {
        roundtrip(Frame::Ack(AckFrame {
            largest_acked: 100,
            lowest_acked: 1,
            delay_time: Duration::from_micros(1234),
            ranges: vec![
                AckRange { first: 50, last: 100 },
                AckRange { first: 1, last: 40 },
            ],
            path_id: 2,
        }));
    }

    #[test]
    fn test_control_frame_roundtrips() {
        roundtrip(Frame::StopWaiting { least_unacked: 17 });
        roundtrip(Frame::WindowUpdate {
            stream_id: 3,
            byte_offset: 1 << 20,
        });
        roundtrip(Frame::Blocked { stream_id: 0 });
        roundtrip(Frame::Ping);
        roundtrip(Frame::Paths {
            path_ids: vec![0, 1, 2],
        });
        roundtrip(Frame::AddAddress {
            addr: "10.1.2.3:443".parse().unwrap(),
        });
        roundtrip(Frame::AddAddress {
            addr: "[2001:db8::1]:8443".parse().unwrap(),
        });
        roundtrip(Frame::RstStream {
            stream_id: 7,
            byte_offset: 999,
            error_code: 42,
        });
        roundtrip(Frame::ClosePath(ClosePathFrame {
            path_id: 1,
            largest_acked: 9,
            lowest_acked: 1,
            ranges: vec![],
        }));
    }

    #[test]
    fn test_acks_packet() {
        let ack = AckFrame {
            largest_acked: 10,
            lowest_acked: 1,
            delay_time: Duration::ZERO,
            ranges: vec![AckRange { first: 8, last: 10 }, AckRange { first: 1, last: 4 }],
            path_id: 0,
        };
        assert!(ack.acks_packet(2));
        assert!(ack.acks_packet(9));
        assert!(!ack.acks_packet(6));
        assert!(!ack.acks_packet(11));
        assert!(!ack.acks_packet(0));

        let contiguous = AckFrame {
            largest_acked: 10,
            lowest_acked: 1,
            delay_time: Duration::ZERO,
            ranges: vec![],
            path_id: 0,
        };
        assert!(contiguous.acks_packet(6));
    }

    #[test]
    fn test_retransmittability() {
        let reliable = Frame::Stream(StreamFrame {
            stream_id: 5,
            offset: 0,
            data: vec![0],
            fin: false,
            unreliable: false,
        });
        let unreliable = Frame::Stream(StreamFrame {
            stream_id: 7,
            offset: 0,
            data: vec![0],
            fin: false,
            unreliable: true,
        });
        let ack = Frame::Ack(AckFrame {
            largest_acked: 1,
            lowest_acked: 1,
            delay_time: Duration::ZERO,
            ranges: vec![],
            path_id: 0,
        });

        assert!(reliable.is_retransmittable());
        assert!(!unreliable.is_retransmittable());
        assert!(!ack.is_retransmittable());
        assert!(!Frame::StopWaiting { least_unacked: 1 }.is_retransmittable());
        assert!(Frame::Ping.is_retransmittable());

        // Unreliable stream data still counts for the ACK policy.
        assert!(unreliable.instigates_ack());
        assert!(!ack.instigates_ack());

        let frames = vec![ack, unreliable];
        assert!(!has_retransmittable(&frames));
        assert!(instigates_ack(&frames));
        assert_eq!(strip_non_retransmittable(frames).len(), 0);
    }

    #[test]
    fn test_decode_truncated() {
        let mut buf = Vec::new();
        Frame::Ping.encode(&mut buf);
        buf.push(TYPE_STREAM); // header cut off
        let mut input = buf.as_slice();
        assert_eq!(Frame::decode(&mut input).unwrap(), Frame::Ping);
        assert!(Frame::decode(&mut input).is_err());
    }

    #[test]
    fn test_decode_unknown_type() {
        let buf = vec![0xEEu8];
        let mut input = buf.as_slice();
        assert!(Frame::decode(&mut input).is_err());
    }
}
