//! # MotoLink Core Library
//!
//! Link-and-flash protocol engine for motorcycle ECUs.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - A framed, checksummed request/response protocol over serial or TCP
//! - Connection management with an exclusive-operation gate
//! - Live parameter telemetry with a bounded sample buffer
//! - Staged firmware flashing (unlock, erase, write, verify)
//! - A non-blocking event stream for UIs and loggers
//! - A simulated ECU for tests and bench work
//!
//! ## Example
//!
//! ```rust,ignore
//! use motolink_core::prelude::*;
//! use std::collections::BTreeSet;
//!
//! let (events, mut rx) = EventSender::channel(DEFAULT_EVENT_CAPACITY);
//! let link = LinkManager::new(SerialConnector, events);
//! link.connect("/dev/ttyUSB0", LinkConfig::default())?;
//!
//! // Read live data
//! let reader = TelemetryReader::new(
//!     link.clone(),
//!     ParameterCatalog::motorcycle_defaults(),
//!     TelemetryConfig::default(),
//! );
//! for sample in reader.read_parameters(&BTreeSet::from([0x10, 0x20]))? {
//!     println!("{:?}", sample?);
//! }
//!
//! // Flash new firmware
//! let flasher = FirmwareFlasher::new(link.clone(), FlashConfig::default());
//! let image = FirmwareImage::from_file("firmware.bin")?;
//! flasher.flash(image, &CancellationToken::new())?;
//! ```

pub mod config;
pub mod events;
pub mod flash;
pub mod protocol;
pub mod sim;
pub mod telemetry;
pub mod worker;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::events::{Event, EventReceiver, EventSender, DEFAULT_EVENT_CAPACITY};
    pub use crate::flash::{FirmwareFlasher, FirmwareImage, FlashConfig, FlashReport, FlashState};
    pub use crate::protocol::{
        list_physical_ports, ErrorKind, LinkConfig, LinkError, LinkManager, LinkState,
        LinkStatus, SerialConnector, TcpConnector,
    };
    pub use crate::telemetry::{
        ParameterCatalog, ParameterId, TelemetryConfig, TelemetryReader, TelemetrySample,
    };
    pub use tokio_util::sync::CancellationToken;
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
