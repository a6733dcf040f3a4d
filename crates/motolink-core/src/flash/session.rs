//! Flash session bookkeeping

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::{FirmwareImage, FlashState};
use crate::protocol::LinkError;

/// One attempt to write an image, from unlock to verify
#[derive(Debug, Clone)]
pub struct FlashSession {
    id: Uuid,
    image: FirmwareImage,
    block_size: usize,
    total_blocks: u32,
    blocks_written: u32,
    state: FlashState,
    image_checksum: u32,
    block_retries: u32,
    started_at: DateTime<Utc>,
}

impl FlashSession {
    /// Start a session for `image`. The image checksum is fixed here,
    /// before anything is written.
    pub fn new(image: FirmwareImage, block_size: usize) -> Result<Self, LinkError> {
        let total_blocks = image.validate(block_size)?;
        let image_checksum = image.checksum();
        Ok(Self {
            id: Uuid::new_v4(),
            image,
            block_size,
            total_blocks,
            blocks_written: 0,
            state: FlashState::Idle,
            image_checksum,
            block_retries: 0,
            started_at: Utc::now(),
        })
    }

    /// Session id, carried by every flash event
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Image being written
    pub fn image(&self) -> &FirmwareImage {
        &self.image
    }

    /// Bytes per WRITE_BLOCK
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Blocks in the image
    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    /// Blocks the ECU acknowledged
    pub fn blocks_written(&self) -> u32 {
        self.blocks_written
    }

    /// Current stage
    pub fn state(&self) -> FlashState {
        self.state
    }

    /// CRC32 of the whole image
    pub fn image_checksum(&self) -> u32 {
        self.image_checksum
    }

    /// Block retries spent so far
    pub fn block_retries(&self) -> u32 {
        self.block_retries
    }

    /// When the session was created
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub(crate) fn set_state(&mut self, state: FlashState) {
        self.state = state;
    }

    pub(crate) fn block_written(&mut self) {
        self.blocks_written += 1;
    }

    pub(crate) fn block_retried(&mut self) {
        self.block_retries += 1;
    }

    /// Data of the next block to write
    pub(crate) fn next_block(&self) -> Option<&[u8]> {
        self.image.block(self.blocks_written, self.block_size)
    }

    /// Snapshot for callers and event consumers
    pub fn summary(&self, error: Option<&LinkError>) -> FlashSummary {
        FlashSummary {
            session: self.id,
            state: self.state,
            blocks_written: self.blocks_written,
            total_blocks: self.total_blocks,
            image_checksum: self.image_checksum,
            block_retries: self.block_retries,
            started_at: self.started_at,
            error: error.map(ToString::to_string),
        }
    }
}

/// Serializable view of a session, kept after the session ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashSummary {
    /// Session id
    pub session: Uuid,
    /// Last stage reached
    pub state: FlashState,
    /// Blocks acknowledged before the session ended
    pub blocks_written: u32,
    /// Blocks in the image
    pub total_blocks: u32,
    /// CRC32 of the image
    pub image_checksum: u32,
    /// Block writes repeated after a NACK or timeout
    pub block_retries: u32,
    /// When the session was created
    pub started_at: DateTime<Utc>,
    /// Why the session aborted
    pub error: Option<String>,
}

/// Result of a verified flash
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashReport {
    /// Session id
    pub session: Uuid,
    /// Blocks written
    pub total_blocks: u32,
    /// Image bytes written, padding included
    pub bytes_written: usize,
    /// CRC32 of the image, confirmed by the ECU
    pub image_checksum: u32,
    /// Block writes repeated after a NACK or timeout
    pub block_retries: u32,
    /// Wall time from unlock to verify
    pub elapsed: Duration,
}
