//! Firmware images

use std::fs;
use std::path::Path;

use crate::protocol::{crc32, LinkError};

/// Fill byte of erased flash
pub const ERASED_BYTE: u8 = 0xFF;

/// A firmware binary and its declared length
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
    declared_len: usize,
}

impl FirmwareImage {
    /// Image whose declared length is its actual length
    pub fn new(data: Vec<u8>) -> Self {
        let declared_len = data.len();
        Self { data, declared_len }
    }

    /// Image with a separately declared length (e.g. from a container header)
    pub fn with_declared_len(data: Vec<u8>, declared_len: usize) -> Self {
        Self { data, declared_len }
    }

    /// Load a raw `.bin` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LinkError> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|e| {
            LinkError::MalformedImage(format!("cannot read {}: {e}", path.display()))
        })?;
        Ok(Self::new(data))
    }

    /// Pad with erased bytes up to a multiple of `block_size`
    pub fn padded(mut self, block_size: usize) -> Self {
        if block_size > 0 {
            let rem = self.data.len() % block_size;
            if rem != 0 {
                self.data.resize(self.data.len() + block_size - rem, ERASED_BYTE);
            }
        }
        self.declared_len = self.data.len();
        self
    }

    /// Image bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the image holds no bytes
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Length announced by the image source
    pub fn declared_len(&self) -> usize {
        self.declared_len
    }

    /// CRC32 over the whole image
    pub fn checksum(&self) -> u32 {
        crc32(&self.data)
    }

    /// Check the image splits into whole blocks; returns the block count
    pub fn validate(&self, block_size: usize) -> Result<u32, LinkError> {
        if block_size == 0 {
            return Err(LinkError::Config("block_size must be non-zero".into()));
        }
        if self.data.is_empty() {
            return Err(LinkError::MalformedImage("image is empty".into()));
        }
        if self.data.len() != self.declared_len {
            return Err(LinkError::MalformedImage(format!(
                "declared {} bytes but image holds {}",
                self.declared_len,
                self.data.len()
            )));
        }

        let total_blocks = self.declared_len / block_size;
        if total_blocks * block_size != self.declared_len {
            return Err(LinkError::MalformedImage(format!(
                "{} bytes is not a whole number of {block_size}-byte blocks",
                self.declared_len
            )));
        }
        u32::try_from(total_blocks)
            .map_err(|_| LinkError::MalformedImage(format!("{total_blocks} blocks is too many")))
    }

    /// Data of block `index`
    pub fn block(&self, index: u32, block_size: usize) -> Option<&[u8]> {
        let start = (index as usize).checked_mul(block_size)?;
        self.data.get(start..start.checked_add(block_size)?)
    }
}
