//! Background workers
//!
//! Link operations block on the transport. These helpers move them onto the
//! tokio blocking pool so an async control loop stays responsive and can
//! cancel them.

use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::flash::{FirmwareFlasher, FirmwareImage, FlashReport};
use crate::protocol::LinkError;
use crate::telemetry::{ParameterId, TelemetryReader, TelemetrySample};

/// A link operation running on the blocking pool
pub struct WorkerTask<T> {
    cancel: CancellationToken,
    handle: JoinHandle<Result<T, LinkError>>,
}

impl<T> WorkerTask<T> {
    /// Ask the operation to stop at its next cancellation point
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token the task checks between steps
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the task has returned
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the operation's result. A panic in the worker is resumed here.
    pub async fn join(self) -> Result<T, LinkError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(LinkError::Cancelled),
        }
    }
}

/// Run a flash session in the background.
///
/// # Panics
///
/// Must be called from within a Tokio runtime.
pub fn spawn_flash(flasher: &FirmwareFlasher, image: FirmwareImage) -> WorkerTask<FlashReport> {
    let cancel = CancellationToken::new();
    let flasher = flasher.clone();
    let token = cancel.clone();
    let handle = tokio::task::spawn_blocking(move || {
        debug!("worker: flash started");
        flasher.flash(image, &token)
    });
    WorkerTask { cancel, handle }
}

/// Read a batch of parameters in the background.
///
/// Cancelling stops the batch between parameters; samples already read are
/// kept in the reader's ring.
///
/// # Panics
///
/// Must be called from within a Tokio runtime.
pub fn spawn_read(
    reader: Arc<TelemetryReader>,
    ids: BTreeSet<ParameterId>,
) -> WorkerTask<Vec<Result<TelemetrySample, LinkError>>> {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let handle = tokio::task::spawn_blocking(move || {
        let mut results = Vec::with_capacity(ids.len());
        for result in reader.read_parameters(&ids)? {
            results.push(result);
            if token.is_cancelled() {
                debug!(read = results.len(), "worker: read batch cancelled");
                return Err(LinkError::Cancelled);
            }
        }
        Ok(results)
    });
    WorkerTask { cancel, handle }
}
