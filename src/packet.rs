//! HCI packet framing
//!
//! Packet type indicators, command opcodes and event codes used by the
//! engine, plus the encoders for outbound command frames and the raw socket
//! filter. Every frame exchanged with the driver starts with the H4 packet
//! type byte.

use crate::HciError;
use crate::constants::MAX_COMMAND_PARAMS;
use heapless::Vec;

/// Size of a command frame header: type, opcode (2), parameter length
pub const COMMAND_HEADER_SIZE: usize = 4;

/// Size of an event frame header: type, event code, parameter length
pub const EVENT_HEADER_SIZE: usize = 3;

/// Largest encoded command frame
pub const MAX_COMMAND_FRAME: usize = COMMAND_HEADER_SIZE + MAX_COMMAND_PARAMS;

/// Encoded command frame
pub type CommandFrame = Vec<u8, MAX_COMMAND_FRAME>;

/// Command parameter block
pub type CommandParams = Vec<u8, MAX_COMMAND_PARAMS>;

/// H4 packet type indicator (the leading byte of each frame)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PacketType {
    /// HCI command
    Command = 0x01,
    /// ACL data
    AclData = 0x02,
    /// SCO data
    ScoData = 0x03,
    /// HCI event
    Event = 0x04,
    /// LM diagnostic
    Diagnostic = 0x07,
    /// NFC
    Nfc = 0x10,
}

impl PacketType {
    /// Convert from the raw type byte
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Command),
            0x02 => Some(Self::AclData),
            0x03 => Some(Self::ScoData),
            0x04 => Some(Self::Event),
            0x07 => Some(Self::Diagnostic),
            0x10 => Some(Self::Nfc),
            _ => None,
        }
    }
}

/// HCI command opcodes (OGF << 10 | OCF)
pub mod opcode {
    /// Disconnect
    pub const DISCONNECT: u16 = 0x0406;
    /// Set Event Mask
    pub const SET_EVENT_MASK: u16 = 0x0C01;
    /// Reset
    pub const RESET: u16 = 0x0C03;
    /// Read LE Host Supported
    pub const READ_LE_HOST_SUPPORTED: u16 = 0x0C6C;
    /// Write LE Host Supported
    pub const WRITE_LE_HOST_SUPPORTED: u16 = 0x0C6D;
    /// Read Local Version Information
    pub const READ_LOCAL_VERSION: u16 = 0x1001;
    /// Read `BD_ADDR`
    pub const READ_BD_ADDR: u16 = 0x1009;
    /// Read RSSI
    pub const READ_RSSI: u16 = 0x1405;
    /// LE Set Event Mask
    pub const LE_SET_EVENT_MASK: u16 = 0x2001;
    /// LE Set Scan Parameters
    pub const LE_SET_SCAN_PARAMETERS: u16 = 0x200B;
    /// LE Set Scan Enable
    pub const LE_SET_SCAN_ENABLE: u16 = 0x200C;
    /// LE Create Connection
    pub const LE_CREATE_CONNECTION: u16 = 0x200D;
    /// LE Create Connection Cancel
    pub const LE_CREATE_CONNECTION_CANCEL: u16 = 0x200E;
    /// LE Read Remote Features
    pub const LE_READ_REMOTE_FEATURES: u16 = 0x2016;
    /// LE Start Encryption
    pub const LE_START_ENCRYPTION: u16 = 0x2019;

    /// Opcode group field
    #[must_use]
    pub const fn ogf(opcode: u16) -> u8 {
        (opcode >> 10) as u8
    }

    /// Opcode command field
    #[must_use]
    pub const fn ocf(opcode: u16) -> u16 {
        opcode & 0x03FF
    }
}

/// HCI event codes
pub mod event {
    /// Disconnection Complete
    pub const DISCONNECTION_COMPLETE: u8 = 0x05;
    /// Encryption Change
    pub const ENCRYPTION_CHANGE: u8 = 0x08;
    /// Command Complete
    pub const COMMAND_COMPLETE: u8 = 0x0E;
    /// Command Status
    pub const COMMAND_STATUS: u8 = 0x0F;
    /// Hardware Error
    pub const HARDWARE_ERROR: u8 = 0x10;
    /// Number Of Completed Packets
    pub const NUMBER_OF_COMPLETED_PACKETS: u8 = 0x13;
    /// LE Meta event
    pub const LE_META: u8 = 0x3E;

    /// LE Connection Complete subevent
    pub const LE_CONNECTION_COMPLETE: u8 = 0x01;
    /// LE Advertising Report subevent
    pub const LE_ADVERTISING_REPORT: u8 = 0x02;
    /// LE Connection Update Complete subevent
    pub const LE_CONNECTION_UPDATE_COMPLETE: u8 = 0x03;
    /// LE Read Remote Features Complete subevent
    pub const LE_READ_REMOTE_FEATURES_COMPLETE: u8 = 0x04;
}

/// Frame an HCI command: type byte, little-endian opcode, length, parameters
///
/// # Errors
/// Returns `HciError::InvalidParameter` if the parameters exceed 255 bytes
pub fn encode_command(opcode: u16, params: &[u8]) -> Result<CommandFrame, HciError> {
    let len = u8::try_from(params.len()).map_err(|_| HciError::InvalidParameter)?;
    let mut frame = CommandFrame::new();
    frame
        .push(PacketType::Command as u8)
        .map_err(|_| HciError::CapacityExceeded)?;
    frame
        .extend_from_slice(&opcode.to_le_bytes())
        .map_err(|()| HciError::CapacityExceeded)?;
    frame.push(len).map_err(|_| HciError::CapacityExceeded)?;
    frame
        .extend_from_slice(params)
        .map_err(|()| HciError::CapacityExceeded)?;
    Ok(frame)
}

/// A borrowed inbound event: code and parameter bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventPacket<'a> {
    /// Event code
    pub code: u8,
    /// Parameters, bounded by the declared parameter length
    pub params: &'a [u8],
}

impl<'a> EventPacket<'a> {
    /// Parse an event from a full frame (including the type byte)
    ///
    /// # Errors
    /// Returns `HciError::MalformedPacket` if the frame is shorter than its
    /// header or its declared parameter length
    pub fn from_frame(frame: &'a [u8]) -> Result<Self, HciError> {
        if frame.len() < EVENT_HEADER_SIZE {
            return Err(HciError::MalformedPacket);
        }
        let code = frame[1];
        let len = usize::from(frame[2]);
        let params = frame
            .get(EVENT_HEADER_SIZE..EVENT_HEADER_SIZE + len)
            .ok_or(HciError::MalformedPacket)?;
        Ok(Self { code, params })
    }
}

/// Raw HCI socket filter
///
/// Selects which packet types and event codes the kernel delivers to the
/// socket. Serialized as 14 little-endian bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SocketFilter {
    /// Bit N set selects packet type N
    pub type_mask: u32,
    /// Bit N set selects event code N (two 32-bit words)
    pub event_mask: [u32; 2],
    /// Opcode filter, zero for any
    pub opcode: u16,
}

impl SocketFilter {
    /// Serialized filter length
    pub const SIZE: usize = 14;

    /// Filter used by the engine: command, ACL and event packets; the
    /// disconnection, encryption, command complete/status and LE meta events
    #[must_use]
    pub fn le_default() -> Self {
        let type_mask = (1 << PacketType::Command as u32)
            | (1 << PacketType::Event as u32)
            | (1 << PacketType::AclData as u32);
        let low = (1u32 << event::DISCONNECTION_COMPLETE)
            | (1 << event::ENCRYPTION_CHANGE)
            | (1 << event::COMMAND_COMPLETE)
            | (1 << event::COMMAND_STATUS);
        let high = 1u32 << (event::LE_META - 32);
        Self {
            type_mask,
            event_mask: [low, high],
            opcode: 0,
        }
    }

    /// Serialize to the kernel's wire layout
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.type_mask.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.event_mask[0].to_le_bytes());
        bytes[8..12].copy_from_slice(&self.event_mask[1].to_le_bytes());
        bytes[12..14].copy_from_slice(&self.opcode.to_le_bytes());
        bytes
    }
}

/// Read a little-endian u16 at `offset`
pub(crate) fn read_u16(bytes: &[u8], offset: usize) -> Result<u16, HciError> {
    match bytes.get(offset..offset + 2) {
        Some(b) => Ok(u16::from_le_bytes([b[0], b[1]])),
        None => Err(HciError::MalformedPacket),
    }
}

/// Read a byte at `offset`
pub(crate) fn read_u8(bytes: &[u8], offset: usize) -> Result<u8, HciError> {
    bytes.get(offset).copied().ok_or(HciError::MalformedPacket)
}
