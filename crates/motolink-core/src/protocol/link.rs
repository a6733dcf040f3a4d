//! Connection management
//!
//! `LinkManager` owns the transport lifecycle and arbitrates access to it.
//! State moves `Disconnected -> Connecting -> Connected -> Busy(op)`, and
//! back to `Disconnected` on teardown or transport failure.
//!
//! Lock order is always `link` before `status`; `status` is never held
//! while waiting on the transport.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::decoder::{DecodeEvent, FrameDecoder};
use super::transport::{Connector, Transport};
use super::{
    Command, Frame, FrameBuilder, FrameError, LinkError, DEFAULT_BAUD_RATE, DEFAULT_MAX_PAYLOAD,
    DEFAULT_TIMEOUT_MS,
};
use crate::events::{Event, EventSender};

/// Work that needs the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Brief parameter reads, may run back to back with other brief work
    ReadParameters,
    /// Brief parameter write
    WriteParameter,
    /// Firmware flash session, holds the link exclusively
    Flash,
}

impl Operation {
    /// Whether the operation needs the link to itself
    pub fn is_exclusive(&self) -> bool {
        matches!(self, Operation::Flash)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Operation::ReadParameters => "parameter read",
            Operation::WriteParameter => "parameter write",
            Operation::Flash => "flash",
        };
        f.write_str(name)
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// No transport open
    Disconnected,
    /// Transport being opened
    Connecting,
    /// Idle and ready
    Connected,
    /// An exclusive operation owns the link
    Busy(Operation),
}

/// Link configuration, passed explicitly on every connect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Baud rate
    pub baud_rate: u32,
    /// Timeout for opening the transport in milliseconds
    pub connect_timeout_ms: u64,
    /// Timeout for writing one frame in milliseconds
    pub write_timeout_ms: u64,
    /// Silence after which a partial frame is considered stalled, in milliseconds
    pub inter_byte_timeout_ms: u64,
    /// Maximum frame payload accepted from the ECU
    pub max_payload: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            connect_timeout_ms: DEFAULT_TIMEOUT_MS,
            write_timeout_ms: DEFAULT_TIMEOUT_MS,
            inter_byte_timeout_ms: 50,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl LinkConfig {
    /// Reject values the link cannot work with
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.baud_rate == 0 {
            return Err(LinkError::Config("baud_rate must be non-zero".into()));
        }
        if self.connect_timeout_ms == 0 || self.write_timeout_ms == 0 {
            return Err(LinkError::Config("timeouts must be non-zero".into()));
        }
        if self.inter_byte_timeout_ms == 0 {
            return Err(LinkError::Config(
                "inter_byte_timeout_ms must be non-zero".into(),
            ));
        }
        if self.max_payload < 2 || self.max_payload > u16::MAX as usize - 1 {
            return Err(LinkError::Config(format!(
                "max_payload must be within 2..={}",
                u16::MAX - 1
            )));
        }
        Ok(())
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    fn inter_byte_timeout(&self) -> Duration {
        Duration::from_millis(self.inter_byte_timeout_ms)
    }
}

/// Cumulative traffic counters for the current connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkCounters {
    /// Bytes written to the transport
    pub tx_bytes: u64,
    /// Bytes read from the transport
    pub rx_bytes: u64,
    /// Requests sent
    pub tx_frames: u64,
    /// Frames that decoded cleanly
    pub rx_frames: u64,
    /// Candidate frames dropped by the decoder
    pub rejected_frames: u64,
    /// Valid frames whose sequence number matched no pending request
    pub stale_frames: u64,
}

/// Read-only snapshot of the link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkStatus {
    /// Connection state
    pub state: LinkState,
    /// Port of the current or last connection
    pub port_identifier: Option<String>,
    /// Baud rate of the current or last connection
    pub baud_rate: Option<u32>,
    /// Most recent connect or transport failure
    pub last_error: Option<String>,
    /// Traffic on the current connection
    pub counters: LinkCounters,
}

struct StatusCell {
    state: LinkState,
    port: Option<String>,
    baud_rate: Option<u32>,
    last_error: Option<String>,
    counters: LinkCounters,
    /// Guard id of the exclusive owner while `Busy`
    owner: Option<u64>,
    /// Cancels the exclusive owner on disconnect
    owner_cancel: Option<CancellationToken>,
    next_guard_id: u64,
    /// Bumped on every successful connect
    generation: u64,
}

impl StatusCell {
    fn snapshot(&self) -> LinkStatus {
        LinkStatus {
            state: self.state,
            port_identifier: self.port.clone(),
            baud_rate: self.baud_rate,
            last_error: self.last_error.clone(),
            counters: self.counters,
        }
    }
}

/// An open transport and its protocol state
struct ActiveLink {
    transport: Box<dyn Transport>,
    decoder: FrameDecoder,
    /// Decoded frames not yet claimed by an exchange
    inbox: VecDeque<Frame>,
    next_seq: u16,
    config: LinkConfig,
    counters: LinkCounters,
}

impl ActiveLink {
    fn new(transport: Box<dyn Transport>, config: LinkConfig) -> Self {
        Self {
            transport,
            decoder: FrameDecoder::new(config.max_payload),
            inbox: VecDeque::new(),
            next_seq: 1,
            config,
            counters: LinkCounters::default(),
        }
    }

    fn take_seq(&mut self) -> u16 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    /// Send one request and wait for the frame echoing its sequence number
    fn exchange(
        &mut self,
        command: Command,
        body: &[u8],
        timeout: Duration,
    ) -> Result<Frame, LinkError> {
        if body.len() + 2 > self.config.max_payload {
            return Err(LinkError::Frame(FrameError::FrameTooLarge {
                length: body.len() + 3,
                max: self.config.max_payload + 1,
            }));
        }

        let seq = self.take_seq();
        let request = FrameBuilder::new(command).seq(seq).bytes(body).build();
        let bytes = request.to_bytes();

        debug!(%command, seq, len = body.len(), "link: sending request");
        self.transport
            .write_all(&bytes, self.config.write_timeout())
            .map_err(map_io)?;
        self.counters.tx_bytes += bytes.len() as u64;
        self.counters.tx_frames += 1;

        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 512];
        loop {
            while let Some(frame) = self.inbox.pop_front() {
                if frame.seq() == Some(seq) {
                    debug!(command = %frame.command, seq, "link: response");
                    return Ok(frame);
                }
                self.counters.stale_frames += 1;
                debug!(
                    command = %frame.command,
                    got = ?frame.seq(),
                    expected = seq,
                    "link: discarding stale response"
                );
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(%command, seq, "link: response timeout");
                return Err(LinkError::Timeout);
            }
            let slice = (deadline - now).min(self.config.inter_byte_timeout());

            let n = self.transport.read(&mut buf, slice).map_err(map_io)?;
            let events = if n == 0 {
                if !self.decoder.has_partial() {
                    continue;
                }
                self.decoder.flush_stalled()
            } else {
                self.counters.rx_bytes += n as u64;
                self.decoder.feed(&buf[..n])
            };

            for event in events {
                match event {
                    DecodeEvent::Frame(frame) => {
                        self.counters.rx_frames += 1;
                        self.inbox.push_back(frame);
                    }
                    DecodeEvent::Rejected(err) => {
                        self.counters.rejected_frames += 1;
                        warn!(error = %err, "link: discarded malformed frame");
                    }
                }
            }
        }
    }

    /// Best-effort flush and close
    fn close(mut self) -> Option<String> {
        let mut failure = None;
        if let Err(e) = self.transport.flush() {
            warn!(error = %e, "link: flush during teardown failed");
            failure = Some(format!("flush failed: {e}"));
        }
        if let Err(e) = self.transport.close() {
            warn!(error = %e, "link: close during teardown failed");
            failure = Some(format!("close failed: {e}"));
        }
        failure
    }
}

fn map_io(err: io::Error) -> LinkError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => LinkError::Timeout,
        _ => LinkError::TransportClosed(err.to_string()),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

struct Shared {
    connector: Box<dyn Connector>,
    events: EventSender,
    status: Mutex<StatusCell>,
    link: Mutex<Option<ActiveLink>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let link = self
            .link
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(link) = link {
            let _ = link.close();
        }
    }
}

/// Owner of the single active connection to an ECU.
///
/// Clones share the same connection, so a control thread can read
/// [`status`](Self::status) or call [`disconnect`](Self::disconnect) while a
/// worker runs a flash session.
#[derive(Clone)]
pub struct LinkManager {
    shared: Arc<Shared>,
}

impl LinkManager {
    /// Create a link manager (not yet connected)
    pub fn new(connector: impl Connector + 'static, events: EventSender) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector: Box::new(connector),
                events,
                status: Mutex::new(StatusCell {
                    state: LinkState::Disconnected,
                    port: None,
                    baud_rate: None,
                    last_error: None,
                    counters: LinkCounters::default(),
                    owner: None,
                    owner_cancel: None,
                    next_guard_id: 1,
                    generation: 0,
                }),
                link: Mutex::new(None),
            }),
        }
    }

    /// Event sender shared by everything using this link
    pub fn events(&self) -> &EventSender {
        &self.shared.events
    }

    /// Current state snapshot
    pub fn status(&self) -> LinkStatus {
        lock(&self.shared.status).snapshot()
    }

    /// Current state only
    pub fn state(&self) -> LinkState {
        lock(&self.shared.status).state
    }

    /// Open a connection, replacing any open one
    pub fn connect(&self, port: &str, config: LinkConfig) -> Result<LinkStatus, LinkError> {
        config.validate()?;

        let had_link = {
            let status = lock(&self.shared.status);
            match status.state {
                LinkState::Busy(op) => return Err(LinkError::OperationInProgress(op.to_string())),
                LinkState::Connecting => {
                    return Err(LinkError::OperationInProgress("connect".into()))
                }
                LinkState::Connected => true,
                LinkState::Disconnected => false,
            }
        };
        if had_link {
            info!(port, "link: reconnecting, closing previous connection");
            self.disconnect();
        }

        {
            let mut status = lock(&self.shared.status);
            // Someone else may have started connecting while we tore down
            if status.state != LinkState::Disconnected {
                return Err(LinkError::OperationInProgress("connect".into()));
            }
            status.state = LinkState::Connecting;
            status.port = Some(port.to_string());
            status.baud_rate = Some(config.baud_rate);
            status.counters = LinkCounters::default();
        }

        debug!(port, baud_rate = config.baud_rate, "link: opening transport");
        let opened = self
            .shared
            .connector
            .open(port, config.baud_rate, config.connect_timeout());

        let transport = match opened {
            Ok(transport) => transport,
            Err(e) => {
                warn!(port, error = %e, "link: connect failed");
                {
                    let mut status = lock(&self.shared.status);
                    status.state = LinkState::Disconnected;
                    status.last_error = Some(e.to_string());
                }
                self.shared.events.error(&e);
                return Err(e);
            }
        };

        let baud_rate = config.baud_rate;
        let mut slot = lock(&self.shared.link);
        let mut status = lock(&self.shared.status);
        if status.state != LinkState::Connecting {
            // Disconnected while the port was opening
            drop(status);
            drop(slot);
            let _ = ActiveLink::new(transport, config).close();
            return Err(LinkError::NotConnected);
        }
        *slot = Some(ActiveLink::new(transport, config));
        status.state = LinkState::Connected;
        status.generation += 1;
        status.last_error = None;
        let snapshot = status.snapshot();
        drop(status);
        drop(slot);

        info!(port, baud_rate, "link: connected");
        self.shared.events.emit(Event::Connected {
            port: port.to_string(),
            baud_rate,
        });
        Ok(snapshot)
    }

    /// Close the connection. Never fails; safe to call repeatedly.
    ///
    /// A running exclusive operation is asked to cancel and the transport is
    /// closed once its in-flight exchange completes.
    pub fn disconnect(&self) {
        let cancel = lock(&self.shared.status).owner_cancel.take();
        if let Some(cancel) = cancel {
            debug!("link: cancelling running operation for disconnect");
            cancel.cancel();
        }

        let mut slot = lock(&self.shared.link);
        let teardown_error = slot.take().and_then(ActiveLink::close);
        let mut status = lock(&self.shared.status);
        drop(slot);

        let was_open = matches!(status.state, LinkState::Connected | LinkState::Busy(_));
        status.state = LinkState::Disconnected;
        status.owner = None;
        if teardown_error.is_some() {
            status.last_error = teardown_error.clone();
        }
        let port = status.port.clone().unwrap_or_default();
        drop(status);

        if was_open {
            info!(port = %port, "link: disconnected");
            self.shared.events.emit(Event::Disconnected {
                port,
                reason: teardown_error,
            });
        }
    }

    /// Claim the link for an operation.
    ///
    /// Exclusive operations move the link to `Busy` until the guard drops;
    /// anything requested while `Busy` fails with `OperationInProgress`.
    pub fn begin(&self, op: Operation) -> Result<OperationGuard, LinkError> {
        self.begin_with_cancel(op, &CancellationToken::new())
    }

    /// Like [`begin`](Self::begin), tying the guard's cancellation to `cancel`
    pub fn begin_with_cancel(
        &self,
        op: Operation,
        cancel: &CancellationToken,
    ) -> Result<OperationGuard, LinkError> {
        let mut status = lock(&self.shared.status);
        match status.state {
            LinkState::Connected => {}
            LinkState::Busy(running) => {
                debug!(requested = %op, %running, "link: rejecting request while busy");
                return Err(LinkError::OperationInProgress(running.to_string()));
            }
            LinkState::Disconnected | LinkState::Connecting => return Err(LinkError::NotConnected),
        }

        let id = status.next_guard_id;
        status.next_guard_id += 1;
        let cancel = cancel.child_token();
        if op.is_exclusive() {
            status.state = LinkState::Busy(op);
            status.owner = Some(id);
            status.owner_cancel = Some(cancel.clone());
            debug!(%op, "link: busy");
        }

        Ok(OperationGuard {
            link: self.clone(),
            op,
            id,
            generation: status.generation,
            cancel,
        })
    }

    /// One request/response exchange on behalf of `guard`
    fn transact(
        &self,
        guard: &OperationGuard,
        command: Command,
        body: &[u8],
        timeout: Duration,
    ) -> Result<Frame, LinkError> {
        let mut slot = lock(&self.shared.link);
        {
            let status = lock(&self.shared.status);
            let owns_link = guard.op.is_exclusive() && status.owner == Some(guard.id);
            match status.state {
                LinkState::Busy(_) if owns_link => {}
                LinkState::Busy(running) => {
                    return Err(LinkError::OperationInProgress(running.to_string()))
                }
                // Shared guards die with the connection they were issued on
                LinkState::Connected
                    if !guard.op.is_exclusive() && status.generation == guard.generation => {}
                _ => return Err(LinkError::NotConnected),
            }
        }
        let link = slot.as_mut().ok_or(LinkError::NotConnected)?;

        let result = link.exchange(command, body, timeout);
        let counters = link.counters;

        if let Err(e) = &result {
            if e.is_link_fatal() {
                let dead = slot.take();
                let mut status = lock(&self.shared.status);
                drop(slot);
                if let Some(dead) = dead {
                    let _ = dead.close();
                }
                status.state = LinkState::Disconnected;
                status.owner = None;
                status.owner_cancel = None;
                status.last_error = Some(e.to_string());
                status.counters = counters;
                let port = status.port.clone().unwrap_or_default();
                drop(status);

                warn!(port = %port, error = %e, "link: transport lost");
                self.shared.events.error(e);
                self.shared.events.emit(Event::Disconnected {
                    port,
                    reason: Some(e.to_string()),
                });
                return result;
            }
        }

        lock(&self.shared.status).counters = counters;
        result
    }

    /// Largest body (payload after the sequence number) a request may carry
    pub fn max_body(&self) -> Option<usize> {
        lock(&self.shared.link)
            .as_ref()
            .map(|link| link.config.max_payload.saturating_sub(2))
    }

    fn release(&self, guard: &OperationGuard) {
        if !guard.op.is_exclusive() {
            return;
        }
        let mut status = lock(&self.shared.status);
        if status.owner == Some(guard.id) {
            status.owner = None;
            status.owner_cancel = None;
            if status.state == LinkState::Busy(guard.op) {
                status.state = LinkState::Connected;
            }
            debug!(op = %guard.op, "link: released");
        }
    }
}

/// Permission to use the link for one operation
pub struct OperationGuard {
    link: LinkManager,
    op: Operation,
    id: u64,
    generation: u64,
    cancel: CancellationToken,
}

impl OperationGuard {
    /// Operation this guard was issued for
    pub fn operation(&self) -> Operation {
        self.op
    }

    /// Cancelled by the caller or by a disconnect
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the operation should stop
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Send `command` with `body` and wait up to `timeout` for the response
    pub fn transact(
        &self,
        command: Command,
        body: &[u8],
        timeout: Duration,
    ) -> Result<Frame, LinkError> {
        self.link.transact(self, command, body, timeout)
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.link.release(self);
    }
}
