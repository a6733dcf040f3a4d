//! Firmware Flashing
//!
//! Drives the staged flash protocol: unlock, erase, block-by-block write,
//! and a whole-image checksum verify. A session only reports `Done` after
//! the ECU's read-back checksum matches the image.

mod flasher;
mod image;
mod session;

pub use flasher::FirmwareFlasher;
pub use image::FirmwareImage;
pub use session::{FlashReport, FlashSession, FlashSummary};

use serde::{Deserialize, Serialize};

use crate::protocol::LinkError;

/// Default firmware block size in bytes
pub const DEFAULT_BLOCK_SIZE: usize = 256;

/// Bytes of a WRITE_BLOCK body besides the block data: index + block CRC
pub const BLOCK_HEADER_SIZE: usize = 4 + 4;

/// Flash session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlashState {
    /// No session started
    Idle,
    /// Sending the unlock key
    Unlocking,
    /// Erasing the target region
    Erasing,
    /// Writing blocks
    Writing,
    /// Comparing the image CRC with the ECU
    Verifying,
    /// Image written and verified
    Done,
    /// Stopped on an error or cancellation
    Aborted,
}

impl FlashState {
    /// `Done` and `Aborted` end a session
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlashState::Done | FlashState::Aborted)
    }
}

/// Flash session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashConfig {
    /// Bytes per WRITE_BLOCK
    pub block_size: usize,
    /// Flash address the image is written to
    pub base_address: u32,
    /// Device-specific unlock key
    pub unlock_key: Vec<u8>,
    /// Time for the ECU to accept the unlock key, in milliseconds
    pub unlock_timeout_ms: u64,
    /// Time for the erase to finish, in milliseconds
    pub erase_timeout_ms: u64,
    /// Time for one block to be acknowledged, in milliseconds
    pub block_timeout_ms: u64,
    /// Time for the read-back checksum, in milliseconds
    pub verify_timeout_ms: u64,
    /// Retries of a single block after a NACK or timeout
    pub max_block_retries: u32,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            base_address: 0x0000_8000,
            unlock_key: Vec::new(),
            unlock_timeout_ms: 1000,
            erase_timeout_ms: 15_000,
            block_timeout_ms: 1000,
            verify_timeout_ms: 5000,
            max_block_retries: 3,
        }
    }
}

impl FlashConfig {
    /// Reject zero block sizes and zero timeouts
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.block_size == 0 {
            return Err(LinkError::Config("block_size must be non-zero".into()));
        }
        if [
            self.unlock_timeout_ms,
            self.erase_timeout_ms,
            self.block_timeout_ms,
            self.verify_timeout_ms,
        ]
        .contains(&0)
        {
            return Err(LinkError::Config("flash timeouts must be non-zero".into()));
        }
        Ok(())
    }
}
