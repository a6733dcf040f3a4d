//! Simulated ECU
//!
//! An in-memory ECU speaking the link protocol, for tests and bench demos
//! without hardware. Faults can be scripted per parameter and per flash
//! block: refusals, silence, corrupted or duplicated replies, line noise,
//! slow responses and a pulled cable.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::protocol::frame::BodyReader;
use crate::protocol::{
    crc32, Command, Connector, DecodeEvent, Frame, FrameBuilder, FrameDecoder, LinkError,
    NackReason, Transport,
};

/// Longest single sleep while waiting for a reply
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Bytes queued for the host, released at `ready_at`
struct Pending {
    ready_at: Instant,
    bytes: Vec<u8>,
}

struct EcuState {
    parameters: BTreeMap<u16, i32>,
    silent_parameters: HashSet<u16>,
    unlock_key: Option<Vec<u8>>,
    unlocked: bool,
    refuse_erase: bool,
    flash_base: u32,
    flash: Vec<u8>,
    /// Remaining NACKs per block index
    block_nacks: HashMap<u32, u32>,
    /// Remaining unanswered writes per block index
    block_silences: HashMap<u32, u32>,
    verify_override: Option<u32>,
    response_delay: Duration,
    fragment_size: Option<usize>,
    corrupt_replies: u32,
    duplicate_replies: bool,
    noise: Option<StdRng>,
    unplugged: bool,
    open: bool,
    decoder: FrameDecoder,
    outbox: VecDeque<Pending>,
    received: Vec<Frame>,
}

impl Default for EcuState {
    fn default() -> Self {
        Self {
            parameters: BTreeMap::new(),
            silent_parameters: HashSet::new(),
            unlock_key: None,
            unlocked: false,
            refuse_erase: false,
            flash_base: 0,
            flash: Vec::new(),
            block_nacks: HashMap::new(),
            block_silences: HashMap::new(),
            verify_override: None,
            response_delay: Duration::ZERO,
            fragment_size: None,
            corrupt_replies: 0,
            duplicate_replies: false,
            noise: None,
            unplugged: false,
            open: false,
            decoder: FrameDecoder::default(),
            outbox: VecDeque::new(),
            received: Vec::new(),
        }
    }
}

impl EcuState {
    fn receive(&mut self, data: &[u8]) {
        for event in self.decoder.feed(data) {
            let DecodeEvent::Frame(frame) = event else {
                continue;
            };
            self.received.push(frame.clone());
            let Some(seq) = frame.seq() else {
                continue;
            };
            if let Some((command, body)) = self.respond(&frame) {
                self.queue_reply(FrameBuilder::new(command).seq(seq).bytes(&body).build());
            }
        }
    }

    fn respond(&mut self, frame: &Frame) -> Option<(Command, Vec<u8>)> {
        let mut body = BodyReader::new(frame.body());
        match frame.command {
            Command::ReadParam => {
                let id = body.u16_le()?;
                if self.silent_parameters.contains(&id) {
                    return None;
                }
                Some(match self.parameters.get(&id) {
                    Some(raw) => {
                        let reply = FrameBuilder::new(Command::ReadParam)
                            .u16_le(id)
                            .i32_le(*raw)
                            .into_payload();
                        (Command::ReadParam, reply)
                    }
                    None => nack(NackReason::OutOfRange),
                })
            }
            Command::WriteParam => {
                let (id, raw) = (body.u16_le()?, body.i32_le()?);
                Some(match self.parameters.get_mut(&id) {
                    Some(value) => {
                        *value = raw;
                        ack()
                    }
                    None => nack(NackReason::OutOfRange),
                })
            }
            Command::Unlock => {
                let key = body.rest();
                Some(match &self.unlock_key {
                    Some(expected) if expected.as_slice() != key => nack(NackReason::InvalidKey),
                    _ => {
                        self.unlocked = true;
                        ack()
                    }
                })
            }
            Command::Erase => {
                let (address, length) = (body.u32_le()?, body.u32_le()?);
                if !self.unlocked {
                    return Some(nack(NackReason::Locked));
                }
                if self.refuse_erase {
                    return Some(nack(NackReason::OutOfRange));
                }
                self.flash_base = address;
                self.flash = vec![0xFF; length as usize];
                Some(ack())
            }
            Command::WriteBlock => {
                let index = body.u32_le()?;
                if !self.unlocked {
                    return Some(nack(NackReason::Locked));
                }
                if take_one(&mut self.block_silences, index) {
                    trace!(index, "sim: ignoring block");
                    return None;
                }
                if take_one(&mut self.block_nacks, index) {
                    return Some(nack(NackReason::Busy));
                }

                let rest = body.rest();
                if rest.len() < 4 {
                    return Some(nack(NackReason::BadChecksum));
                }
                let (data, crc) = rest.split_at(rest.len() - 4);
                if BodyReader::new(crc).u32_le() != Some(crc32(data)) {
                    return Some(nack(NackReason::BadChecksum));
                }
                let offset = index as usize * data.len();
                match self.flash.get_mut(offset..offset + data.len()) {
                    Some(region) => {
                        region.copy_from_slice(data);
                        Some(ack())
                    }
                    None => Some(nack(NackReason::OutOfRange)),
                }
            }
            Command::VerifyBlock => {
                let (address, length) = (body.u32_le()?, body.u32_le()?);
                let start = address.checked_sub(self.flash_base)? as usize;
                let Some(region) = self.flash.get(start..start + length as usize) else {
                    return Some(nack(NackReason::OutOfRange));
                };
                let crc = self.verify_override.unwrap_or_else(|| crc32(region));
                Some((Command::VerifyBlock, crc.to_le_bytes().to_vec()))
            }
            Command::Ack | Command::Nack => None,
        }
    }

    fn queue_reply(&mut self, frame: Frame) {
        let mut bytes = frame.to_bytes();
        if self.corrupt_replies > 0 {
            self.corrupt_replies -= 1;
            let mid = bytes.len() / 2;
            bytes[mid] ^= 0xFF;
        }
        if let Some(rng) = self.noise.as_mut() {
            // High bytes only, so noise never declares a plausible frame length
            let count = rng.gen_range(1..=8);
            let mut noisy: Vec<u8> = (0..count).map(|_| rng.gen_range(0x80..=0xFF)).collect();
            noisy.extend_from_slice(&bytes);
            bytes = noisy;
        }

        let ready_at = Instant::now() + self.response_delay;
        if self.duplicate_replies {
            self.outbox.push_back(Pending {
                ready_at,
                bytes: bytes.clone(),
            });
        }
        self.outbox.push_back(Pending { ready_at, bytes });
    }
}

fn ack() -> (Command, Vec<u8>) {
    (Command::Ack, Vec::new())
}

fn nack(reason: NackReason) -> (Command, Vec<u8>) {
    (Command::Nack, vec![reason.to_byte()])
}

/// Consume one scripted fault for `index`, if any remain
fn take_one(faults: &mut HashMap<u32, u32>, index: u32) -> bool {
    match faults.get_mut(&index) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

/// Handle to a simulated ECU. Clones share the same device.
#[derive(Clone, Default)]
pub struct SimulatedEcu {
    state: Arc<Mutex<EcuState>>,
}

impl SimulatedEcu {
    /// An ECU with no parameters and no unlock key
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, EcuState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer READ_PARAM for `id` with `raw`
    pub fn with_parameter(self, id: u16, raw: i32) -> Self {
        self.state().parameters.insert(id, raw);
        self
    }

    /// Never answer READ_PARAM for `id`
    pub fn with_silent_parameter(self, id: u16) -> Self {
        self.state().silent_parameters.insert(id);
        self
    }

    /// Require this key to unlock; without one any key is accepted
    pub fn with_unlock_key(self, key: &[u8]) -> Self {
        self.state().unlock_key = Some(key.to_vec());
        self
    }

    /// NACK every ERASE with OutOfRange
    pub fn with_erase_refused(self) -> Self {
        self.state().refuse_erase = true;
        self
    }

    /// NACK the next `count` writes of block `index`
    pub fn with_block_nacks(self, index: u32, count: u32) -> Self {
        self.state().block_nacks.insert(index, count);
        self
    }

    /// Ignore the next `count` writes of block `index`
    pub fn with_block_silence(self, index: u32, count: u32) -> Self {
        self.state().block_silences.insert(index, count);
        self
    }

    /// Report this checksum for every VERIFY_BLOCK
    pub fn with_verify_checksum(self, crc: u32) -> Self {
        self.state().verify_override = Some(crc);
        self
    }

    /// Hold each reply back by `delay`
    pub fn with_response_delay(self, delay: Duration) -> Self {
        self.state().response_delay = delay;
        self
    }

    /// Deliver replies at most `size` bytes per read
    pub fn with_fragment_size(self, size: usize) -> Self {
        self.state().fragment_size = Some(size.max(1));
        self
    }

    /// Send every reply twice
    pub fn with_duplicate_replies(self) -> Self {
        self.state().duplicate_replies = true;
        self
    }

    /// Prefix every reply with a few random bytes
    pub fn with_noise(self, seed: u64) -> Self {
        self.state().noise = Some(StdRng::seed_from_u64(seed));
        self
    }

    /// Flip a byte in each of the next `count` replies
    pub fn corrupt_next_replies(&self, count: u32) {
        self.state().corrupt_replies = count;
    }

    /// Change a live value
    pub fn set_parameter(&self, id: u16, raw: i32) {
        self.state().parameters.insert(id, raw);
    }

    /// Pull the cable: reads, writes and new connections fail
    pub fn unplug(&self) {
        self.state().unplugged = true;
    }

    /// Make the device available again
    pub fn replug(&self) {
        self.state().unplugged = false;
    }

    /// Every well-formed frame the ECU received, oldest first
    pub fn received(&self) -> Vec<Frame> {
        self.state().received.clone()
    }

    /// Current raw value of `id`
    pub fn parameter(&self, id: u16) -> Option<i32> {
        self.state().parameters.get(&id).copied()
    }

    /// Flash memory as last erased and written
    pub fn flash_contents(&self) -> Vec<u8> {
        self.state().flash.clone()
    }

    /// Whether the flash controller accepted an unlock on this connection
    pub fn is_unlocked(&self) -> bool {
        self.state().unlocked
    }

    /// Whether a host currently holds the port open
    pub fn is_open(&self) -> bool {
        self.state().open
    }
}

fn unplugged() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "ECU unplugged")
}

/// Host side of the simulated cable
struct SimPort {
    ecu: SimulatedEcu,
    closed: bool,
}

impl SimPort {
    fn check(&self, state: &EcuState) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"));
        }
        if state.unplugged {
            return Err(unplugged());
        }
        Ok(())
    }
}

impl Transport for SimPort {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            let wait = {
                let mut state = self.ecu.state();
                self.check(&state)?;
                let limit = state.fragment_size.unwrap_or(usize::MAX).min(buf.len());
                let now = Instant::now();
                match state.outbox.front_mut() {
                    Some(pending) if pending.ready_at <= now => {
                        let n = limit.min(pending.bytes.len());
                        buf[..n].copy_from_slice(&pending.bytes[..n]);
                        pending.bytes.drain(..n);
                        if pending.bytes.is_empty() {
                            state.outbox.pop_front();
                        }
                        return Ok(n);
                    }
                    Some(pending) => pending.ready_at - now,
                    None => POLL_INTERVAL,
                }
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(0);
            }
            thread::sleep(wait.min(deadline - now).min(POLL_INTERVAL));
        }
    }

    fn write_all(&mut self, data: &[u8], _timeout: Duration) -> io::Result<()> {
        let mut state = self.ecu.state();
        self.check(&state)?;
        state.receive(data);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        let state = self.ecu.state();
        self.check(&state)
    }

    fn close(&mut self) -> io::Result<()> {
        if !self.closed {
            self.closed = true;
            let mut state = self.ecu.state();
            state.open = false;
            state.unlocked = false;
        }
        Ok(())
    }
}

/// Connector that opens a [`SimulatedEcu`] under a fixed port name
#[derive(Clone)]
pub struct SimConnector {
    port: String,
    ecu: SimulatedEcu,
}

impl SimConnector {
    /// Expose `ecu` as `port`
    pub fn new(port: &str, ecu: SimulatedEcu) -> Self {
        Self {
            port: port.to_string(),
            ecu,
        }
    }
}

impl Connector for SimConnector {
    fn open(
        &self,
        identifier: &str,
        _baud_rate: u32,
        _timeout: Duration,
    ) -> Result<Box<dyn Transport>, LinkError> {
        if identifier != self.port {
            return Err(LinkError::PortUnavailable {
                port: identifier.to_string(),
                reason: "no such device".into(),
            });
        }

        let mut state = self.ecu.state();
        if state.unplugged {
            return Err(LinkError::PortUnavailable {
                port: identifier.to_string(),
                reason: "device not present".into(),
            });
        }
        state.open = true;
        state.unlocked = false;
        state.outbox.clear();
        state.decoder.reset();
        drop(state);

        Ok(Box::new(SimPort {
            ecu: self.ecu.clone(),
            closed: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(command: Command, seq: u16, body: &[u8]) -> Vec<u8> {
        FrameBuilder::new(command)
            .seq(seq)
            .bytes(body)
            .build()
            .to_bytes()
    }

    fn open(ecu: &SimulatedEcu) -> Box<dyn Transport> {
        SimConnector::new("sim0", ecu.clone())
            .open("sim0", 115200, Duration::from_millis(10))
            .expect("open")
    }

    fn reply(port: &mut Box<dyn Transport>) -> Frame {
        let mut decoder = FrameDecoder::default();
        let mut buf = [0u8; 256];
        loop {
            let n = port.read(&mut buf, Duration::from_millis(100)).expect("read");
            assert!(n > 0, "no reply");
            for event in decoder.feed(&buf[..n]) {
                if let DecodeEvent::Frame(frame) = event {
                    return frame;
                }
            }
        }
    }

    #[test]
    fn test_read_param_echoes_seq() {
        let ecu = SimulatedEcu::new().with_parameter(0x10, 900);
        let mut port = open(&ecu);
        port.write_all(&request(Command::ReadParam, 42, &[0x10, 0x00]), Duration::ZERO)
            .expect("write");

        let frame = reply(&mut port);
        assert_eq!(frame.command, Command::ReadParam);
        assert_eq!(frame.seq(), Some(42));
        let mut body = BodyReader::new(frame.body());
        assert_eq!(body.u16_le(), Some(0x10));
        assert_eq!(body.i32_le(), Some(900));
    }

    #[test]
    fn test_unknown_parameter_is_refused() {
        let ecu = SimulatedEcu::new();
        let mut port = open(&ecu);
        port.write_all(&request(Command::ReadParam, 1, &[0x99, 0x00]), Duration::ZERO)
            .expect("write");

        let frame = reply(&mut port);
        assert_eq!(frame.command, Command::Nack);
        assert_eq!(frame.body(), &[NackReason::OutOfRange.to_byte()]);
    }

    #[test]
    fn test_fragmented_delivery() {
        let ecu = SimulatedEcu::new()
            .with_parameter(0x10, 1)
            .with_fragment_size(3);
        let mut port = open(&ecu);
        port.write_all(&request(Command::ReadParam, 7, &[0x10, 0x00]), Duration::ZERO)
            .expect("write");

        let mut decoder = FrameDecoder::default();
        let mut buf = [0u8; 64];
        let mut reads = 0;
        let mut events = Vec::new();
        while events.is_empty() {
            let n = port.read(&mut buf, Duration::from_millis(10)).expect("read");
            assert!((1..=3).contains(&n));
            reads += 1;
            events.extend(decoder.feed(&buf[..n]));
        }

        assert_eq!(reads, 5);
        assert!(matches!(&events[0], DecodeEvent::Frame(f) if f.seq() == Some(7)));
    }

    #[test]
    fn test_erase_requires_unlock() {
        let ecu = SimulatedEcu::new();
        let mut port = open(&ecu);
        let body = FrameBuilder::new(Command::Erase)
            .u32_le(0x8000)
            .u32_le(64)
            .into_payload();
        port.write_all(&request(Command::Erase, 1, &body), Duration::ZERO)
            .expect("write");

        let frame = reply(&mut port);
        assert_eq!(frame.command, Command::Nack);
        assert_eq!(frame.body(), &[NackReason::Locked.to_byte()]);
    }

    #[test]
    fn test_unplugged_port_fails() {
        let ecu = SimulatedEcu::new();
        let mut port = open(&ecu);
        ecu.unplug();

        let mut buf = [0u8; 8];
        assert!(port.read(&mut buf, Duration::from_millis(1)).is_err());
        assert!(SimConnector::new("sim0", ecu.clone())
            .open("sim0", 115200, Duration::ZERO)
            .is_err());
    }

    #[test]
    fn test_read_times_out_quietly() {
        let ecu = SimulatedEcu::new();
        let mut port = open(&ecu);
        let mut buf = [0u8; 8];
        assert_eq!(port.read(&mut buf, Duration::from_millis(5)).expect("read"), 0);
    }

    #[test]
    fn test_close_marks_port_free() {
        let ecu = SimulatedEcu::new();
        let mut port = open(&ecu);
        assert!(ecu.is_open());
        port.close().expect("close");
        assert!(!ecu.is_open());
        assert!(port.write_all(&[0], Duration::ZERO).is_err());
    }
}
