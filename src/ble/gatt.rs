//! Movesense GATT Sensor Protocol (GSP) constants
//!
//! The sensor exposes a single GSP service with one write characteristic
//! (command input) and one notify characteristic (sensor data output).
//! Every command and every notification starts with a one-byte opcode or
//! packet type followed by the subscriber-chosen reference code.

use uuid::Uuid;

/// GSP service UUID.
pub const GSP_SERVICE_UUID: Uuid = Uuid::from_u128(0x34802252_7185_4d5d_b431_630e7050e8f0);

/// Command characteristic (write).
pub const GSP_WRITE_UUID: Uuid = Uuid::from_u128(0x34800001_7185_4d5d_b431_630e7050e8f0);

/// Sensor data characteristic (notify).
pub const GSP_NOTIFY_UUID: Uuid = Uuid::from_u128(0x34800002_7185_4d5d_b431_630e7050e8f0);

/// Command opcodes written to [`GSP_WRITE_UUID`].
pub const CMD_HELLO: u8 = 0;
pub const CMD_SUBSCRIBE: u8 = 1;
pub const CMD_UNSUBSCRIBE: u8 = 2;

/// Packet types found in byte 0 of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Status reply to a previously written command.
    CommandResult,
    /// A complete data notification, or the first half of a split one.
    Data,
    /// Continuation of the preceding `Data` notification.
    DataPart2,
}

impl PacketType {
    pub const COMMAND_RESULT: u8 = 1;
    pub const DATA: u8 = 2;
    pub const DATA_PART2: u8 = 3;

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            Self::COMMAND_RESULT => Some(PacketType::CommandResult),
            Self::DATA => Some(PacketType::Data),
            Self::DATA_PART2 => Some(PacketType::DataPart2),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            PacketType::CommandResult => Self::COMMAND_RESULT,
            PacketType::Data => Self::DATA,
            PacketType::DataPart2 => Self::DATA_PART2,
        }
    }
}

/// Size of the common notification envelope: packet type + reference code.
pub const ENVELOPE_LEN: usize = 2;
