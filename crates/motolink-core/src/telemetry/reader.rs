//! Parameter polling

use chrono::Utc;
use std::collections::{BTreeSet, VecDeque};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use super::{ParameterCatalog, ParameterId, SampleRing, TelemetryConfig, TelemetrySample};
use crate::events::Event;
use crate::protocol::frame::BodyReader;
use crate::protocol::{
    Command, ErrorKind, Frame, LinkError, LinkManager, NackReason, Operation, OperationGuard,
};

/// Reads live parameters over a shared link
pub struct TelemetryReader {
    link: LinkManager,
    catalog: ParameterCatalog,
    config: TelemetryConfig,
    ring: SampleRing,
}

impl TelemetryReader {
    /// Reader over `link`, decoding with `catalog`
    pub fn new(link: LinkManager, catalog: ParameterCatalog, config: TelemetryConfig) -> Self {
        let ring = SampleRing::new(config.ring_capacity);
        Self {
            link,
            catalog,
            config,
            ring,
        }
    }

    /// Recent samples, shareable with a display thread
    pub fn samples(&self) -> &SampleRing {
        &self.ring
    }

    /// Catalog used to decode samples
    pub fn catalog(&self) -> &ParameterCatalog {
        &self.catalog
    }

    /// Link the reader sends on
    pub fn link(&self) -> &LinkManager {
        &self.link
    }

    /// Read each parameter once, lazily, in ascending id order.
    ///
    /// One bad parameter yields `ParameterUnreadable` for that id and the
    /// batch moves on. Call again to poll again.
    pub fn read_parameters(
        &self,
        ids: &BTreeSet<ParameterId>,
    ) -> Result<ParameterReads<'_>, LinkError> {
        let guard = self.link.begin(Operation::ReadParameters)?;
        Ok(ParameterReads {
            reader: self,
            guard,
            pending: ids.iter().copied().collect(),
            stopped: false,
        })
    }

    /// Write a raw parameter value; the ECU must acknowledge it
    pub fn write_parameter(&self, id: ParameterId, raw: i32) -> Result<(), LinkError> {
        let guard = self.link.begin(Operation::WriteParameter)?;
        let mut body = Vec::with_capacity(6);
        body.extend_from_slice(&id.to_le_bytes());
        body.extend_from_slice(&raw.to_le_bytes());

        let response = guard.transact(Command::WriteParam, &body, self.read_timeout())?;
        match response.command {
            Command::Ack => {
                debug!(id, raw, "telemetry: parameter written");
                Ok(())
            }
            Command::Nack => Err(LinkError::UnexpectedResponse(format!(
                "write of parameter {id:#06x} refused: {:?}",
                nack_reason(&response)
            ))),
            other => Err(LinkError::UnexpectedResponse(format!(
                "{other} in reply to WRITE_PARAM"
            ))),
        }
    }

    fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.config.read_timeout_ms)
    }

    /// Read one parameter, retrying transient failures with backoff
    fn read_with_retry(
        &self,
        guard: &OperationGuard,
        id: ParameterId,
    ) -> Result<TelemetrySample, LinkError> {
        let policy = self.config.retry;
        let mut last_error = LinkError::Timeout;

        for attempt in 0..policy.attempts() {
            if attempt > 0 {
                let delay = policy.backoff(attempt - 1);
                debug!(id, attempt, ?delay, "telemetry: retrying parameter");
                thread::sleep(delay);
            }

            match self.read_once(guard, id) {
                Ok(sample) => {
                    self.ring.push(sample.clone());
                    self.link
                        .events()
                        .emit(Event::TelemetrySample(sample.clone()));
                    return Ok(sample);
                }
                Err(e) if e.is_transient() => last_error = e,
                Err(e @ LinkError::ParameterUnreadable(_)) => {
                    self.link.events().error(&e);
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }

        warn!(id, error = %last_error, "telemetry: parameter unreadable");
        let err = LinkError::ParameterUnreadable(id);
        self.link.events().error(&err);
        Err(err)
    }

    fn read_once(
        &self,
        guard: &OperationGuard,
        id: ParameterId,
    ) -> Result<TelemetrySample, LinkError> {
        let response = guard.transact(Command::ReadParam, &id.to_le_bytes(), self.read_timeout())?;

        match response.command {
            Command::ReadParam => {
                let mut body = BodyReader::new(response.body());
                let (Some(got), Some(raw)) = (body.u16_le(), body.i32_le()) else {
                    return Err(LinkError::UnexpectedResponse(
                        "short READ_PARAM response".into(),
                    ));
                };
                if got != id {
                    return Err(LinkError::UnexpectedResponse(format!(
                        "response for parameter {got:#06x} while reading {id:#06x}"
                    )));
                }
                Ok(TelemetrySample {
                    timestamp: Utc::now(),
                    parameter_id: id,
                    raw_value: raw,
                    decoded_value: self.catalog.decode(id, raw),
                })
            }
            Command::Nack => match nack_reason(&response) {
                // The ECU asked us to come back later
                NackReason::Busy => Err(LinkError::Timeout),
                reason => {
                    debug!(id, ?reason, "telemetry: ECU refused parameter");
                    Err(LinkError::ParameterUnreadable(id))
                }
            },
            other => Err(LinkError::UnexpectedResponse(format!(
                "{other} in reply to READ_PARAM"
            ))),
        }
    }
}

fn nack_reason(frame: &Frame) -> NackReason {
    NackReason::from_byte(BodyReader::new(frame.body()).u8().unwrap_or(0))
}

/// Lazy sequence of parameter reads from one [`TelemetryReader::read_parameters`] call
pub struct ParameterReads<'a> {
    reader: &'a TelemetryReader,
    guard: OperationGuard,
    pending: VecDeque<ParameterId>,
    stopped: bool,
}

impl ParameterReads<'_> {
    /// Parameters not read yet
    pub fn remaining(&self) -> usize {
        if self.stopped {
            0
        } else {
            self.pending.len()
        }
    }
}

impl Iterator for ParameterReads<'_> {
    type Item = Result<TelemetrySample, LinkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stopped {
            return None;
        }
        let id = self.pending.pop_front()?;

        match self.reader.read_with_retry(&self.guard, id) {
            Ok(sample) => Some(Ok(sample)),
            Err(e @ LinkError::ParameterUnreadable(_)) => Some(Err(e)),
            Err(e) => {
                // The link itself is gone or taken; the rest of the batch would fail the same way
                if matches!(e.kind(), ErrorKind::Sequence | ErrorKind::Transport) {
                    self.stopped = true;
                }
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining()))
    }
}
