//! Streaming frame decoder
//!
//! Bytes arrive from the transport in arbitrary fragments. The decoder walks
//! each byte through `Sync -> Length -> Command -> Payload -> Checksum` and
//! emits a frame once the checksum verifies. A rejected candidate is dropped
//! one byte at a time: everything after its first byte is rescanned, so a
//! valid frame that was swallowed by a garbled length is still found.

use std::collections::VecDeque;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, trace};

use super::frame::{frame_checksum, Frame, FrameError};
use super::{Command, DEFAULT_MAX_PAYLOAD};

/// Output of the decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeEvent {
    /// A frame whose checksum verified
    Frame(Frame),
    /// A candidate frame was discarded. Reported once per resync episode.
    Rejected(FrameError),
}

/// Decoder counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    /// Frames that passed length and CRC checks
    pub frames_decoded: u64,
    /// Resync episodes
    pub frames_rejected: u64,
    /// Bytes skipped while hunting for a frame
    pub bytes_discarded: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Sync,
    Length { low: u8 },
    Command { length: usize },
    Payload { command: Command, remaining: usize },
    Checksum { command: Command, remaining: usize },
}

enum Step {
    Pending,
    Complete(Frame),
    Reject(FrameError),
}

/// Incremental decoder over a byte stream
pub struct FrameDecoder {
    state: DecodeState,
    /// Raw bytes of the candidate frame, kept for rescanning
    candidate: Vec<u8>,
    payload: Vec<u8>,
    checksum: [u8; 4],
    max_payload: usize,
    resyncing: bool,
    stats: DecoderStats,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl FrameDecoder {
    /// Create a decoder rejecting payloads longer than `max_payload`
    pub fn new(max_payload: usize) -> Self {
        Self {
            state: DecodeState::Sync,
            candidate: Vec::new(),
            payload: Vec::new(),
            checksum: [0; 4],
            max_payload,
            resyncing: false,
            stats: DecoderStats::default(),
        }
    }

    /// Feed bytes and collect whatever frames they complete
    pub fn feed(&mut self, data: &[u8]) -> Vec<DecodeEvent> {
        let mut pending: VecDeque<u8> = data.iter().copied().collect();
        let mut events = Vec::new();
        self.drain(&mut pending, &mut events);
        events
    }

    /// Give up on a partial frame that stopped receiving bytes.
    ///
    /// The first byte of the stalled candidate is dropped and the rest is
    /// rescanned, which recovers from a corrupted length field.
    pub fn flush_stalled(&mut self) -> Vec<DecodeEvent> {
        let mut events = Vec::new();
        if self.candidate.is_empty() {
            return events;
        }

        debug!(
            buffered = self.candidate.len(),
            "decoder: partial frame stalled, rescanning"
        );
        let err = FrameError::Truncated {
            needed: self.declared_len(),
            available: self.candidate.len(),
        };
        let mut pending = self.restart_after_first_byte();
        if !self.resyncing {
            self.resyncing = true;
            self.stats.frames_rejected += 1;
            events.push(DecodeEvent::Rejected(err));
        }
        self.drain(&mut pending, &mut events);
        events
    }

    /// Whether a partial frame is buffered
    pub fn has_partial(&self) -> bool {
        !self.candidate.is_empty()
    }

    /// Drop any partial frame
    pub fn reset(&mut self) {
        self.stats.bytes_discarded += self.candidate.len() as u64;
        self.candidate.clear();
        self.payload.clear();
        self.state = DecodeState::Sync;
        self.resyncing = false;
    }

    /// Counters since creation
    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    fn drain(&mut self, pending: &mut VecDeque<u8>, events: &mut Vec<DecodeEvent>) {
        while let Some(byte) = pending.pop_front() {
            match self.step(byte) {
                Step::Pending => {}
                Step::Complete(frame) => {
                    trace!(command = %frame.command, len = frame.payload.len(), "decoder: frame");
                    self.stats.frames_decoded += 1;
                    self.resyncing = false;
                    events.push(DecodeEvent::Frame(frame));
                }
                Step::Reject(err) => {
                    if !self.resyncing {
                        debug!(error = %err, "decoder: rejecting frame, resyncing");
                        self.resyncing = true;
                        self.stats.frames_rejected += 1;
                        events.push(DecodeEvent::Rejected(err));
                    }
                    let mut rescan = self.restart_after_first_byte();
                    rescan.append(pending);
                    *pending = rescan;
                }
            }
        }
    }

    /// Reset to `Sync` and return the candidate minus its first byte
    fn restart_after_first_byte(&mut self) -> VecDeque<u8> {
        let mut rescan: VecDeque<u8> = std::mem::take(&mut self.candidate).into();
        if rescan.pop_front().is_some() {
            self.stats.bytes_discarded += 1;
        }
        self.payload.clear();
        self.state = DecodeState::Sync;
        rescan
    }

    /// Total encoded length the current candidate claims
    fn declared_len(&self) -> usize {
        match self.state {
            DecodeState::Sync | DecodeState::Length { .. } => 2,
            DecodeState::Command { length } => 2 + length + 4,
            DecodeState::Payload { remaining, .. } => self.candidate.len() + remaining + 4,
            DecodeState::Checksum { remaining, .. } => self.candidate.len() + remaining,
        }
    }

    fn step(&mut self, byte: u8) -> Step {
        self.candidate.push(byte);

        match self.state {
            DecodeState::Sync => {
                self.state = DecodeState::Length { low: byte };
                Step::Pending
            }
            DecodeState::Length { low } => {
                let length = LittleEndian::read_u16(&[low, byte]) as usize;
                if length == 0 {
                    return Step::Reject(FrameError::Truncated {
                        needed: 1,
                        available: 0,
                    });
                }
                if length > self.max_payload + 1 {
                    return Step::Reject(FrameError::FrameTooLarge {
                        length,
                        max: self.max_payload + 1,
                    });
                }
                self.state = DecodeState::Command { length };
                Step::Pending
            }
            DecodeState::Command { length } => {
                let Some(command) = Command::from_code(byte) else {
                    return Step::Reject(FrameError::UnknownCommand(byte));
                };
                self.payload.clear();
                self.payload.reserve(length - 1);
                self.state = if length == 1 {
                    DecodeState::Checksum {
                        command,
                        remaining: 4,
                    }
                } else {
                    DecodeState::Payload {
                        command,
                        remaining: length - 1,
                    }
                };
                Step::Pending
            }
            DecodeState::Payload { command, remaining } => {
                self.payload.push(byte);
                self.state = if remaining == 1 {
                    DecodeState::Checksum {
                        command,
                        remaining: 4,
                    }
                } else {
                    DecodeState::Payload {
                        command,
                        remaining: remaining - 1,
                    }
                };
                Step::Pending
            }
            DecodeState::Checksum { command, remaining } => {
                self.checksum[4 - remaining] = byte;
                if remaining > 1 {
                    self.state = DecodeState::Checksum {
                        command,
                        remaining: remaining - 1,
                    };
                    return Step::Pending;
                }

                let actual = LittleEndian::read_u32(&self.checksum);
                let expected = frame_checksum(command.code(), &self.payload);
                if actual != expected {
                    return Step::Reject(FrameError::ChecksumMismatch { expected, actual });
                }

                self.candidate.clear();
                self.state = DecodeState::Sync;
                Step::Complete(Frame {
                    command,
                    payload: std::mem::take(&mut self.payload),
                    checksum: actual,
                })
            }
        }
    }
}
