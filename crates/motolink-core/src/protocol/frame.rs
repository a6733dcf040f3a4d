//! Frame encoding/decoding
//!
//! Frame format:
//! - 2 bytes: Length of command + payload (little-endian)
//! - 1 byte: Command
//! - N bytes: Payload, starting with the sequence number
//! - 4 bytes: CRC32 of command + payload (little-endian)

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;
use thiserror::Error;

use super::{Command, DEFAULT_MAX_PAYLOAD};

/// Bytes of framing around the payload: length, command, checksum
pub const FRAME_OVERHEAD: usize = 2 + 1 + 4;

/// Errors raised while decoding a frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Trailing CRC32 does not match the frame contents
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// CRC32 computed over command and payload
        expected: u32,
        /// CRC32 carried by the frame
        actual: u32,
    },

    /// Declared length exceeds the payload bound
    #[error("Frame too large: length {length} exceeds maximum {max}")]
    FrameTooLarge {
        /// Declared length
        length: usize,
        /// Largest accepted length
        max: usize,
    },

    /// Command byte not in the command table
    #[error("Unknown command byte {0:#04x}")]
    UnknownCommand(u8),

    /// Fewer bytes than the header announces
    #[error("Truncated frame: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes the header announces
        needed: usize,
        /// Bytes present
        available: usize,
    },
}

/// A wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame command
    pub command: Command,
    /// Frame payload
    pub payload: Vec<u8>,
    /// CRC32 of command + payload
    pub checksum: u32,
}

impl Frame {
    /// Create a new frame, computing its checksum
    pub fn new(command: Command, payload: Vec<u8>) -> Self {
        let checksum = frame_checksum(command.code(), &payload);
        Self {
            command,
            payload,
            checksum,
        }
    }

    /// Check that the stored checksum matches the frame contents
    pub fn is_valid(&self) -> bool {
        self.checksum == frame_checksum(self.command.code(), &self.payload)
    }

    /// Decode exactly one frame from raw bytes
    pub fn from_bytes(data: &[u8], max_payload: usize) -> Result<Self, FrameError> {
        if data.len() < FRAME_OVERHEAD {
            return Err(FrameError::Truncated {
                needed: FRAME_OVERHEAD,
                available: data.len(),
            });
        }

        let length = LittleEndian::read_u16(&data[0..2]) as usize;
        if length == 0 || length > max_payload + 1 {
            return Err(FrameError::FrameTooLarge {
                length,
                max: max_payload + 1,
            });
        }

        let needed = 2 + length + 4;
        if data.len() < needed {
            return Err(FrameError::Truncated {
                needed,
                available: data.len(),
            });
        }

        let body = &data[2..2 + length];
        let command = Command::from_code(body[0]).ok_or(FrameError::UnknownCommand(body[0]))?;
        let received = LittleEndian::read_u32(&data[2 + length..needed]);
        let expected = frame_checksum(body[0], &body[1..]);

        if received != expected {
            return Err(FrameError::ChecksumMismatch {
                expected,
                actual: received,
            });
        }

        Ok(Self {
            command,
            payload: body[1..].to_vec(),
            checksum: received,
        })
    }

    /// Encode the frame to raw bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let declared = (self.payload.len() + 1) as u16;
        let mut out = Vec::with_capacity(self.encoded_size());
        out.extend(declared.to_le_bytes());
        out.push(self.command.code());
        out.extend(&self.payload);
        out.extend(self.checksum.to_le_bytes());
        out
    }

    /// Bytes on the wire, framing included
    pub fn encoded_size(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }

    /// Sequence number carried at the start of the payload
    pub fn seq(&self) -> Option<u16> {
        (self.payload.len() >= 2).then(|| LittleEndian::read_u16(&self.payload[0..2]))
    }

    /// Payload after the sequence number
    pub fn body(&self) -> &[u8] {
        self.payload.get(2..).unwrap_or(&[])
    }
}

/// Builder for constructing frames
pub struct FrameBuilder {
    command: Command,
    payload: Vec<u8>,
}

impl FrameBuilder {
    /// Start a frame for the given command
    pub fn new(command: Command) -> Self {
        Self {
            command,
            payload: Vec::new(),
        }
    }

    /// Add the sequence number. Must be called first.
    pub fn seq(self, seq: u16) -> Self {
        self.u16_le(seq)
    }

    /// Append one byte
    pub fn byte(self, b: u8) -> Self {
        self.bytes(&[b])
    }

    /// Append a little-endian u16
    pub fn u16_le(self, value: u16) -> Self {
        self.bytes(&value.to_le_bytes())
    }

    /// Append a little-endian u32
    pub fn u32_le(self, value: u32) -> Self {
        self.bytes(&value.to_le_bytes())
    }

    /// Append a little-endian i32
    pub fn i32_le(self, value: i32) -> Self {
        self.bytes(&value.to_le_bytes())
    }

    /// Append raw payload bytes as-is
    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.payload.extend(data);
        self
    }

    /// Build the frame
    pub fn build(self) -> Frame {
        Frame::new(self.command, self.payload)
    }

    /// Payload bytes without framing, for callers that add the sequence
    /// number later
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

/// Little-endian field reader over a frame body
pub struct BodyReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    /// Read `data` from the start
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let slice = self.data.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(slice)
    }

    /// Next byte, or `None` at the end
    pub fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    /// Next little-endian u16
    pub fn u16_le(&mut self) -> Option<u16> {
        self.take(2).map(LittleEndian::read_u16)
    }

    /// Next little-endian u32
    pub fn u32_le(&mut self) -> Option<u32> {
        self.take(4).map(LittleEndian::read_u32)
    }

    /// Next little-endian i32
    pub fn i32_le(&mut self) -> Option<i32> {
        self.take(4).map(LittleEndian::read_i32)
    }

    /// Remaining unread bytes
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        rest
    }
}

/// Checksum of a frame's command byte and payload
pub fn frame_checksum(command: u8, payload: &[u8]) -> u32 {
    let mut crc = Hasher::new();
    crc.update(&[command]);
    crc.update(payload);
    crc.finalize()
}

/// CRC32 of arbitrary data (block and image checksums)
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Decode with the default payload bound
impl TryFrom<&[u8]> for Frame {
    type Error = FrameError;

    fn try_from(data: &[u8]) -> Result<Self, Self::Error> {
        Frame::from_bytes(data, DEFAULT_MAX_PAYLOAD)
    }
}
