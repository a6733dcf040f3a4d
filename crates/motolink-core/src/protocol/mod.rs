//! ECU Link Protocol
//!
//! Implements the framed request/response protocol used to talk to the ECU
//! over a serial (or TCP bridged) byte stream.
//!
//! Every exchange is a request frame carrying a sequence number, answered by
//! a frame echoing that number. The link layer owns the transport and the
//! gate that keeps long operations exclusive.

pub mod commands;
pub mod decoder;
mod error;
pub mod frame;
mod link;
pub mod retry;
pub mod serial;
pub mod transport;

pub use commands::{Command, NackReason};
pub use decoder::{DecodeEvent, DecoderStats, FrameDecoder};
pub use error::{ErrorKind, LinkError};
pub use frame::{crc32, Frame, FrameBuilder, FrameError};
pub use link::{
    LinkConfig, LinkCounters, LinkManager, LinkState, LinkStatus, Operation, OperationGuard,
};
pub use retry::RetryPolicy;
pub use serial::{list_physical_ports, list_ports, PortInfo, PortKind};
pub use transport::{Connector, SerialConnector, TcpConnector, Transport};

/// Default baud rate for ECU communication
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default timeout for responses in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Default maximum frame payload, excluding the command byte
pub const DEFAULT_MAX_PAYLOAD: usize = 1024;
