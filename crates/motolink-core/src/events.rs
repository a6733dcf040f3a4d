//! Event stream
//!
//! Status, telemetry and progress events for a UI or logger. Delivery is
//! fire-and-forget over a bounded channel: when the subscriber falls behind,
//! events are dropped and counted instead of stalling the link.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::flash::FlashState;
use crate::protocol::{ErrorKind, LinkError};
use crate::telemetry::TelemetrySample;

/// Default capacity of the event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// A failure as presented to the user
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReport {
    /// Error category
    pub kind: ErrorKind,
    /// Display text of the error
    pub message: String,
}

impl From<&LinkError> for ErrorReport {
    fn from(err: &LinkError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Flash progress after a block was acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FlashProgress {
    /// Flash session id
    pub session: Uuid,
    /// Blocks acknowledged so far
    pub blocks_written: u32,
    /// Blocks in the image
    pub total_blocks: u32,
}

impl FlashProgress {
    /// Completed fraction in `0.0..=1.0`
    pub fn fraction(&self) -> f64 {
        if self.total_blocks == 0 {
            return 0.0;
        }
        self.blocks_written as f64 / self.total_blocks as f64
    }
}

/// Events emitted by the engine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "payload")]
pub enum Event {
    /// A connection was opened
    Connected {
        /// Port identifier
        port: String,
        /// Negotiated baud rate
        baud_rate: u32,
    },
    /// A connection was closed or lost
    Disconnected {
        /// Port identifier
        port: String,
        /// Failure that ended the link, `None` for a requested disconnect
        reason: Option<String>,
    },
    /// A parameter was read
    TelemetrySample(TelemetrySample),
    /// A firmware block was acknowledged
    FlashProgress(FlashProgress),
    /// A flash session moved to a new stage
    FlashStateChanged {
        /// Flash session id
        session: Uuid,
        /// Stage entered
        state: FlashState,
    },
    /// A failure worth showing to the user
    Error(ErrorReport),
}

/// Sending half of the event stream. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Option<mpsc::Sender<Event>>,
    dropped: Arc<AtomicU64>,
}

/// Receiving half of the event stream
pub type EventReceiver = mpsc::Receiver<Event>;

impl EventSender {
    /// Create a bounded event channel
    pub fn channel(capacity: usize) -> (EventSender, EventReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            EventSender {
                tx: Some(tx),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// A sender that discards everything
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Deliver an event without waiting
    pub fn emit(&self, event: Event) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(?event, "event channel full, dropping");
            }
            // Nobody is listening any more
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Report an error
    pub fn error(&self, err: &LinkError) {
        self.emit(Event::Error(err.into()));
    }

    /// Number of events dropped because the channel was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventSender {
    fn default() -> Self {
        Self::disabled()
    }
}
