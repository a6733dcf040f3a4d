//! Protocol commands
//!
//! Defines the command bytes carried in every frame.

use serde::{Deserialize, Serialize};

/// Frame commands understood by the ECU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// Read a live parameter
    ReadParam,

    /// Write a parameter value
    WriteParam,

    /// Unlock the flash controller with the device key
    Unlock,

    /// Erase a flash region
    Erase,

    /// Write one firmware block
    WriteBlock,

    /// Ask the ECU for the CRC of a flash region
    VerifyBlock,

    /// Positive acknowledgement
    Ack,

    /// Negative acknowledgement
    Nack,
}

impl Command {
    /// All commands, in wire-code order
    pub const ALL: [Command; 8] = [
        Command::ReadParam,
        Command::WriteParam,
        Command::Ack,
        Command::Unlock,
        Command::Erase,
        Command::WriteBlock,
        Command::VerifyBlock,
        Command::Nack,
    ];

    /// Get the command byte
    pub fn code(&self) -> u8 {
        match self {
            Command::ReadParam => 0x01,
            Command::WriteParam => 0x02,
            Command::Ack => 0x06,
            Command::Unlock => 0x10,
            Command::Erase => 0x11,
            Command::WriteBlock => 0x12,
            Command::VerifyBlock => 0x13,
            Command::Nack => 0x15,
        }
    }

    /// Parse a command byte
    pub fn from_code(code: u8) -> Option<Command> {
        Command::ALL.into_iter().find(|c| c.code() == code)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::ReadParam => "READ_PARAM",
            Command::WriteParam => "WRITE_PARAM",
            Command::Unlock => "UNLOCK",
            Command::Erase => "ERASE",
            Command::WriteBlock => "WRITE_BLOCK",
            Command::VerifyBlock => "VERIFY_BLOCK",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
        };
        f.write_str(name)
    }
}

/// Reason byte carried by a NACK
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NackReason {
    /// Block checksum did not match its data
    BadChecksum,
    /// Flash controller is locked
    Locked,
    /// Address or parameter out of range
    OutOfRange,
    /// ECU busy, retry later
    Busy,
    /// Wrong unlock key
    InvalidKey,
    /// Reason code not known to this tool
    Unknown(u8),
}

impl NackReason {
    /// Decode a reason byte; unknown codes are kept
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => Self::BadChecksum,
            0x02 => Self::Locked,
            0x03 => Self::OutOfRange,
            0x04 => Self::Busy,
            0x05 => Self::InvalidKey,
            other => Self::Unknown(other),
        }
    }

    /// Wire code of the reason
    pub fn to_byte(&self) -> u8 {
        match self {
            Self::BadChecksum => 0x01,
            Self::Locked => 0x02,
            Self::OutOfRange => 0x03,
            Self::Busy => 0x04,
            Self::InvalidKey => 0x05,
            Self::Unknown(b) => *b,
        }
    }
}
