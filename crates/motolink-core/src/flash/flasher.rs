//! Flash state machine

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    FirmwareImage, FlashConfig, FlashReport, FlashSession, FlashState, FlashSummary,
    BLOCK_HEADER_SIZE,
};
use crate::events::{Event, FlashProgress};
use crate::protocol::frame::BodyReader;
use crate::protocol::{
    crc32, Command, FrameBuilder, LinkError, LinkManager, NackReason, Operation, OperationGuard,
};

/// Writes firmware images over a [`LinkManager`].
///
/// Clones share the record of the most recent session.
#[derive(Clone)]
pub struct FirmwareFlasher {
    link: LinkManager,
    config: FlashConfig,
    last: Arc<Mutex<Option<FlashSummary>>>,
}

impl FirmwareFlasher {
    /// Create a flasher using `link`
    pub fn new(link: LinkManager, config: FlashConfig) -> Self {
        Self {
            link,
            config,
            last: Arc::new(Mutex::new(None)),
        }
    }

    /// Link used for flashing
    pub fn link(&self) -> &LinkManager {
        &self.link
    }

    /// Session settings
    pub fn config(&self) -> &FlashConfig {
        &self.config
    }

    /// Most recent session, updated while it runs
    pub fn last_session(&self) -> Option<FlashSummary> {
        self.last_slot().clone()
    }

    fn last_slot(&self) -> MutexGuard<'_, Option<FlashSummary>> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a complete flash session.
    ///
    /// Holds the link exclusively until the session ends. Fails with
    /// `OperationInProgress` without touching the ECU if the link is busy.
    /// `cancel` is observed between stages, blocks and block retries.
    pub fn flash(
        &self,
        image: FirmwareImage,
        cancel: &CancellationToken,
    ) -> Result<FlashReport, LinkError> {
        self.config.validate()?;
        if self.config.unlock_key.is_empty() {
            return Err(LinkError::Config("no unlock key configured".into()));
        }
        let guard = self.link.begin_with_cancel(Operation::Flash, cancel)?;

        let max_body = self.link.max_body().ok_or(LinkError::NotConnected)?;
        if self.config.block_size + BLOCK_HEADER_SIZE > max_body {
            return Err(LinkError::Config(format!(
                "block_size {} does not fit in a {max_body}-byte request",
                self.config.block_size
            )));
        }

        let mut session = FlashSession::new(image, self.config.block_size)?;
        info!(
            session = %session.id(),
            blocks = session.total_blocks(),
            checksum = session.image_checksum(),
            "flash: session started"
        );
        *self.last_slot() = Some(session.summary(None));

        let started = Instant::now();
        match self.run(&guard, &mut session) {
            Ok(()) => {
                let elapsed = started.elapsed();
                info!(session = %session.id(), ?elapsed, "flash: verified");
                Ok(FlashReport {
                    session: session.id(),
                    total_blocks: session.total_blocks(),
                    bytes_written: session.image().len(),
                    image_checksum: session.image_checksum(),
                    block_retries: session.block_retries(),
                    elapsed,
                })
            }
            Err(e) => {
                error!(
                    session = %session.id(),
                    state = ?session.state(),
                    blocks_written = session.blocks_written(),
                    error = %e,
                    "flash: aborted"
                );
                self.transition(&mut session, FlashState::Aborted);
                *self.last_slot() = Some(session.summary(Some(&e)));
                self.link.events().error(&e);
                Err(e)
            }
        }
    }

    fn run(&self, guard: &OperationGuard, session: &mut FlashSession) -> Result<(), LinkError> {
        check_cancelled(guard)?;
        self.transition(session, FlashState::Unlocking);
        self.unlock(guard)?;

        check_cancelled(guard)?;
        self.transition(session, FlashState::Erasing);
        self.erase(guard, session)?;

        check_cancelled(guard)?;
        self.transition(session, FlashState::Writing);
        while session.blocks_written() < session.total_blocks() {
            check_cancelled(guard)?;
            self.write_block(guard, session)?;
            session.block_written();

            self.publish(session);
            self.link.events().emit(Event::FlashProgress(FlashProgress {
                session: session.id(),
                blocks_written: session.blocks_written(),
                total_blocks: session.total_blocks(),
            }));
        }

        check_cancelled(guard)?;
        self.transition(session, FlashState::Verifying);
        self.verify(guard, session)?;

        self.transition(session, FlashState::Done);
        Ok(())
    }

    fn transition(&self, session: &mut FlashSession, state: FlashState) {
        debug!(session = %session.id(), from = ?session.state(), to = ?state, "flash: state");
        session.set_state(state);
        self.publish(session);
        self.link.events().emit(Event::FlashStateChanged {
            session: session.id(),
            state,
        });
    }

    fn publish(&self, session: &FlashSession) {
        *self.last_slot() = Some(session.summary(None));
    }

    fn unlock(&self, guard: &OperationGuard) -> Result<(), LinkError> {
        let timeout = Duration::from_millis(self.config.unlock_timeout_ms);
        match guard.transact(Command::Unlock, &self.config.unlock_key, timeout) {
            Ok(frame) if frame.command == Command::Ack => Ok(()),
            Ok(frame) => {
                warn!(
                    reply = %frame.command,
                    reason = ?nack_reason(frame.body()),
                    "flash: unlock refused"
                );
                Err(LinkError::UnlockRejected)
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, "flash: no acknowledgement for unlock");
                Err(LinkError::UnlockRejected)
            }
            Err(e) => Err(e),
        }
    }

    fn erase(&self, guard: &OperationGuard, session: &FlashSession) -> Result<(), LinkError> {
        let address = self.config.base_address;
        let length = u32::try_from(session.image().len())
            .map_err(|_| LinkError::MalformedImage("image exceeds 4 GiB".into()))?;
        let rejected = LinkError::EraseRejected { address, length };

        let body = FrameBuilder::new(Command::Erase)
            .u32_le(address)
            .u32_le(length)
            .into_payload();
        let timeout = Duration::from_millis(self.config.erase_timeout_ms);

        debug!(address, length, "flash: erasing");
        match guard.transact(Command::Erase, &body, timeout) {
            Ok(frame) if frame.command == Command::Ack => Ok(()),
            Ok(frame) => {
                warn!(
                    reply = %frame.command,
                    reason = ?nack_reason(frame.body()),
                    "flash: erase refused"
                );
                Err(rejected)
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, "flash: erase not acknowledged");
                Err(rejected)
            }
            Err(e) => Err(e),
        }
    }

    /// Write the next block, retrying only that block
    fn write_block(
        &self,
        guard: &OperationGuard,
        session: &mut FlashSession,
    ) -> Result<(), LinkError> {
        let index = session.blocks_written();
        let data = session
            .next_block()
            .ok_or(LinkError::FlashWriteFailed(index))?;
        let body = FrameBuilder::new(Command::WriteBlock)
            .u32_le(index)
            .bytes(data)
            .u32_le(crc32(data))
            .into_payload();
        let timeout = Duration::from_millis(self.config.block_timeout_ms);

        for attempt in 0..=self.config.max_block_retries {
            if attempt > 0 {
                check_cancelled(guard)?;
                session.block_retried();
                debug!(block = index, attempt, "flash: retrying block");
            }

            match guard.transact(Command::WriteBlock, &body, timeout) {
                Ok(frame) if frame.command == Command::Ack => return Ok(()),
                Ok(frame) => {
                    warn!(
                        block = index,
                        reply = %frame.command,
                        reason = ?nack_reason(frame.body()),
                        "flash: block refused"
                    );
                }
                Err(e) if e.is_transient() => {
                    warn!(block = index, error = %e, "flash: block not acknowledged");
                }
                Err(e) => return Err(e),
            }
        }

        Err(LinkError::FlashWriteFailed(index))
    }

    fn verify(&self, guard: &OperationGuard, session: &FlashSession) -> Result<(), LinkError> {
        let length = u32::try_from(session.image().len())
            .map_err(|_| LinkError::MalformedImage("image exceeds 4 GiB".into()))?;
        let body = FrameBuilder::new(Command::VerifyBlock)
            .u32_le(self.config.base_address)
            .u32_le(length)
            .into_payload();
        let timeout = Duration::from_millis(self.config.verify_timeout_ms);

        let mut last_error = LinkError::Timeout;
        for attempt in 0..=self.config.max_block_retries {
            if attempt > 0 {
                check_cancelled(guard)?;
            }
            let frame = match guard.transact(Command::VerifyBlock, &body, timeout) {
                Ok(frame) => frame,
                Err(e) if e.is_transient() => {
                    last_error = e;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if frame.command != Command::VerifyBlock {
                return Err(LinkError::UnexpectedResponse(format!(
                    "{} in reply to VERIFY_BLOCK ({:?})",
                    frame.command,
                    nack_reason(frame.body())
                )));
            }
            let actual = BodyReader::new(frame.body()).u32_le().ok_or_else(|| {
                LinkError::UnexpectedResponse("short VERIFY_BLOCK response".into())
            })?;

            let expected = session.image_checksum();
            if actual != expected {
                return Err(LinkError::VerificationFailed { expected, actual });
            }
            return Ok(());
        }

        Err(last_error)
    }
}

fn check_cancelled(guard: &OperationGuard) -> Result<(), LinkError> {
    if guard.is_cancelled() {
        Err(LinkError::Cancelled)
    } else {
        Ok(())
    }
}

fn nack_reason(body: &[u8]) -> Option<NackReason> {
    BodyReader::new(body).u8().map(NackReason::from_byte)
}
