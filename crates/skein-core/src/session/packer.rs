//! Packet assembly and the packet protection seam.
//!
//! The cryptographic handshake and AEAD are collaborators, not part of
//! this crate: the session consumes a [`Sealer`] when packing and an
//! [`Unpacker`] when receiving. [`NullSealer`] passes payloads through
//! unchanged and backs the integration tests.

use crate::error::UnpackError;
use crate::frame::Frame;
use crate::protocol::{EncryptionLevel, PacketNumber, PathId};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Decoded public packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Path the packet belongs to.
    pub path_id: PathId,
    /// Packet number as read off the wire; truncated until inferred.
    pub pn: PacketNumber,
    /// Bytes the wire representation of the packet number used.
    pub pn_len: u8,
}

/// Bytes used for the truncated packet number on the wire.
const DEFAULT_PN_LEN: u8 = 4;

impl PacketHeader {
    /// Serialized header size in bytes.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        2 + self.pn_len as usize
    }

    /// Encode the header, truncating the packet number to `pn_len` bytes.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.path_id);
        buf.push(self.pn_len);
        let bytes = self.pn.to_be_bytes();
        buf.extend_from_slice(&bytes[8 - self.pn_len as usize..]);
    }

    /// Decode a header from the front of `input`, advancing it.
    ///
    /// # Errors
    /// Returns [`UnpackError::Malformed`] on truncation or a bad length.
    pub fn decode(input: &mut &[u8]) -> Result<Self, UnpackError> {
        if input.len() < 2 {
            return Err(UnpackError::Malformed("truncated header".into()));
        }
        let path_id = input[0];
        let pn_len = input[1];
        if !matches!(pn_len, 1 | 2 | 4 | 8) || input.len() < 2 + pn_len as usize {
            return Err(UnpackError::Malformed("bad packet number length".into()));
        }
        let mut pn: PacketNumber = 0;
        for &b in &input[2..2 + pn_len as usize] {
            pn = (pn << 8) | PacketNumber::from(b);
        }
        *input = &input[2 + pn_len as usize..];
        Ok(Self {
            path_id,
            pn,
            pn_len,
        })
    }
}

/// Resolve a truncated wire packet number to the full packet number
/// closest to one past the largest received.
#[must_use]
pub fn infer_packet_number(
    pn_len: u8,
    largest_rcvd: PacketNumber,
    truncated: PacketNumber,
) -> PacketNumber {
    if pn_len >= 8 {
        return truncated;
    }
    let space = 1u64 << (8 * u32::from(pn_len));
    let expected = largest_rcvd + 1;
    let candidate = (expected & !(space - 1)) | truncated;
    if candidate + space / 2 <= expected {
        candidate + space
    } else if candidate > expected + space / 2 && candidate >= space {
        candidate - space
    } else {
        candidate
    }
}

/// A decrypted packet: its frames plus the protection level they arrived
/// under.
#[derive(Debug)]
pub struct UnpackedPacket {
    /// Frames carried by the packet.
    pub frames: Vec<Frame>,
    /// Protection level of the packet.
    pub encryption_level: EncryptionLevel,
}

/// Decrypts and parses packet payloads.
pub trait Unpacker: Send + Sync {
    /// Open `ciphertext` under the keys implied by `header` and parse the
    /// carried frames.
    ///
    /// # Errors
    /// [`UnpackError::DecryptionFailure`] when authentication fails;
    /// [`UnpackError::Malformed`] when the plaintext does not parse.
    fn unpack(
        &self,
        header_raw: &[u8],
        header: &PacketHeader,
        ciphertext: &[u8],
    ) -> Result<UnpackedPacket, UnpackError>;
}

/// Protects packet payloads.
pub trait Sealer: Send + Sync {
    /// Seal `payload` for the wire, binding it to `header_raw`.
    fn seal(&self, header_raw: &[u8], payload: &[u8]) -> Vec<u8>;
}

/// Passthrough packet protection for tests and loopback runs.
#[derive(Debug, Default, Clone)]
pub struct NullSealer;

impl Sealer for NullSealer {
    fn seal(&self, _header_raw: &[u8], payload: &[u8]) -> Vec<u8> {
        payload.to_vec()
    }
}

impl Unpacker for NullSealer {
    fn unpack(
        &self,
        _header_raw: &[u8],
        _header: &PacketHeader,
        ciphertext: &[u8],
    ) -> Result<UnpackedPacket, UnpackError> {
        let mut input = ciphertext;
        let mut frames = Vec::new();
        while !input.is_empty() {
            frames.push(Frame::decode(&mut input)?);
        }
        Ok(UnpackedPacket {
            frames,
            encryption_level: EncryptionLevel::ForwardSecure,
        })
    }
}

/// A packet ready for the wire.
#[derive(Debug)]
pub struct PackedPacket {
    /// Packet number consumed from the path's generator.
    pub pn: PacketNumber,
    /// Full datagram bytes (header plus sealed payload).
    pub raw: Vec<u8>,
    /// The frames that were packed.
    pub frames: Vec<Frame>,
    /// Protection level the packet was sealed at.
    pub encryption_level: EncryptionLevel,
}

/// Assembles frames into sealed packets, keeping per-path control frame
/// queues.
pub struct Packer {
    sealer: Arc<dyn Sealer>,
    queued_control: HashMap<PathId, VecDeque<Frame>>,
}

impl Packer {
    /// Create a packer over a sealer.
    #[must_use]
    pub fn new(sealer: Arc<dyn Sealer>) -> Self {
        Self {
            sealer,
            queued_control: HashMap::new(),
        }
    }

    /// Queue a control frame for the next packet on `path_id`.
    pub fn queue_control_frame(&mut self, frame: Frame, path_id: PathId) {
        self.queued_control.entry(path_id).or_default().push_back(frame);
    }

    /// Whether control frames are waiting for `path_id`.
    #[must_use]
    pub fn has_control_frames(&self, path_id: PathId) -> bool {
        self.queued_control
            .get(&path_id)
            .is_some_and(|q| !q.is_empty())
    }

    /// Assemble one packet from the queued control frames plus
    /// `stream_frames`. Returns `None` when there is nothing to send.
    pub fn pack_packet(
        &mut self,
        path_id: PathId,
        pn: PacketNumber,
        stream_frames: Vec<Frame>,
    ) -> Option<PackedPacket> {
        let mut frames: Vec<Frame> = self
            .queued_control
            .get_mut(&path_id)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default();
        frames.extend(stream_frames);
        if frames.is_empty() {
            return None;
        }

        let header = PacketHeader {
            path_id,
            pn,
            pn_len: DEFAULT_PN_LEN,
        };
        let mut raw = Vec::with_capacity(
            header.wire_len() + frames.iter().map(Frame::wire_len).sum::<usize>(),
        );
        header.encode(&mut raw);
        let header_len = raw.len();

        let mut payload = Vec::new();
        for frame in &frames {
            frame.encode(&mut payload);
        }
        let sealed = self.sealer.seal(&raw[..header_len], &payload);
        raw.extend_from_slice(&sealed);

        Some(PackedPacket {
            pn,
            raw,
            frames,
            encryption_level: EncryptionLevel::ForwardSecure,
        })
    }
}
