#![no_std]
#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![allow(clippy::too_many_lines, clippy::module_name_repetitions)]

#[macro_use]
mod fmt;

pub mod acl;
mod address;
pub mod api;
pub mod command;
pub mod connection;
pub mod constants;
pub mod device;
pub mod driver;
pub mod eir;
pub mod engine;
pub mod gatt;
pub mod packet;
pub mod status;

#[cfg(test)]
mod testing;

use crate::constants::{
    DEFAULT_ACL_MTU, DEFAULT_COMMAND_TIMEOUT_MS, DEFAULT_CONN_INTERVAL_MAX,
    DEFAULT_CONN_INTERVAL_MIN, DEFAULT_CONN_SCAN_INTERVAL, DEFAULT_CONN_SCAN_WINDOW,
    DEFAULT_MAX_CE_LENGTH, DEFAULT_MIN_CE_LENGTH, DEFAULT_POLL_INTERVAL_MS, DEFAULT_SCAN_INTERVAL,
    DEFAULT_SUPERVISION_TIMEOUT, MIN_HCI_VERSION,
};

pub use address::{AddressType, BluetoothAddress};
pub use api::Host;
pub use driver::{AdapterDriver, Clock};
pub use engine::{EngineEvent, HciEngine, Outcome, Ticket};

/// Lifecycle of the local adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AdapterState {
    /// Adapter is unpowered or not yet brought up
    #[default]
    Down,
    /// Bring-up sequence in progress
    Activating,
    /// Adapter accepts commands
    Ready,
    /// Controller speaks an HCI version older than the engine supports
    Unsupported,
}

/// HCI engine errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HciError {
    /// The raw transport failed to bind, start or write
    TransportFault,
    /// Controller HCI version is below the supported minimum
    ProtocolVersionUnsupported {
        /// Version reported by the controller
        version: u8,
    },
    /// The controller does not keep LE host support enabled
    LeUnsupported,
    /// The controller rejected a command
    CommandFailure {
        /// Command opcode
        opcode: u16,
        /// HCI status code, see [`status::name`]
        status: u8,
    },
    /// A length field overruns its buffer
    MalformedPacket,
    /// A command reply arrived with nothing waiting on it
    UnsolicitedEvent {
        /// Opcode named by the event
        opcode: u16,
    },
    /// An ACL continuation arrived without a start fragment
    ReassemblyOrphan {
        /// Connection handle of the fragment
        handle: u16,
    },
    /// The peer broke the attribute protocol's request/response rules
    ProtocolViolation,
    /// No reply arrived in time
    Timeout {
        /// Opcode of the command (or attribute opcode of a request)
        opcode: u16,
    },
    /// The adapter went down while the operation was outstanding
    AdapterDown,
    /// A fixed-capacity table is full
    CapacityExceeded,
    /// No connection with this handle
    UnknownConnection {
        /// Connection handle
        handle: u16,
    },
    /// No device with this address
    UnknownDevice,
    /// The link went down while the operation was outstanding
    Disconnected {
        /// Connection handle
        handle: u16,
        /// Disconnect reason code
        reason: u8,
    },
    /// The peer answered an attribute request with an Error Response
    AttError {
        /// Request opcode
        opcode: u8,
        /// ATT error code
        code: u8,
    },
    /// Invalid parameter provided (e.g., oversized payload)
    InvalidParameter,
}

impl core::fmt::Display for HciError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match *self {
            Self::TransportFault => f.write_str("transport fault"),
            Self::ProtocolVersionUnsupported { version } => {
                write!(f, "HCI version {version:#04x} is not supported")
            }
            Self::LeUnsupported => f.write_str("controller does not support LE"),
            Self::CommandFailure { opcode, status } => write!(
                f,
                "command {opcode:#06x} failed: {} ({status:#04x})",
                status::name(status)
            ),
            Self::MalformedPacket => f.write_str("malformed packet"),
            Self::UnsolicitedEvent { opcode } => {
                write!(f, "unsolicited event for command {opcode:#06x}")
            }
            Self::ReassemblyOrphan { handle } => {
                write!(f, "ACL continuation without start on handle {handle:#06x}")
            }
            Self::ProtocolViolation => f.write_str("attribute protocol violation"),
            Self::Timeout { opcode } => write!(f, "timed out waiting for {opcode:#06x}"),
            Self::AdapterDown => f.write_str("adapter is down"),
            Self::CapacityExceeded => f.write_str("capacity exceeded"),
            Self::UnknownConnection { handle } => write!(f, "unknown connection {handle:#06x}"),
            Self::UnknownDevice => f.write_str("unknown device"),
            Self::Disconnected { handle, reason } => write!(
                f,
                "connection {handle:#06x} closed: {}",
                status::name(reason)
            ),
            Self::AttError { opcode, code } => {
                write!(f, "attribute request {opcode:#04x} failed with error {code:#04x}")
            }
            Self::InvalidParameter => f.write_str("invalid parameter"),
        }
    }
}

impl core::error::Error for HciError {}

/// LE scan parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ScanParameters {
    /// Active scanning (scan requests are sent)
    pub active: bool,
    /// Scan interval (units of 0.625 ms)
    pub interval: u16,
    /// Scan window (units of 0.625 ms)
    pub window: u16,
    /// Own address type used in scan requests
    pub own_address_type: AddressType,
    /// Scanning filter policy
    pub filter_policy: u8,
    /// Ask the controller to filter duplicate reports
    pub filter_duplicates: bool,
}

impl Default for ScanParameters {
    fn default() -> Self {
        Self {
            active: true,
            interval: DEFAULT_SCAN_INTERVAL,
            window: DEFAULT_SCAN_INTERVAL,
            own_address_type: AddressType::Public,
            filter_policy: 0x00,
            filter_duplicates: true,
        }
    }
}

impl ScanParameters {
    /// LE Set Scan Parameters command parameters
    #[must_use]
    pub fn to_params(&self) -> [u8; 7] {
        let interval = self.interval.to_le_bytes();
        let window = self.window.to_le_bytes();
        [
            u8::from(self.active),
            interval[0],
            interval[1],
            window[0],
            window[1],
            self.own_address_type as u8,
            self.filter_policy,
        ]
    }
}

/// LE connection creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectionParameters {
    /// Scan interval while initiating (units of 0.625 ms)
    pub scan_interval: u16,
    /// Scan window while initiating (units of 0.625 ms)
    pub scan_window: u16,
    /// Minimum connection interval (units of 1.25 ms)
    pub interval_min: u16,
    /// Maximum connection interval (units of 1.25 ms)
    pub interval_max: u16,
    /// Peripheral latency
    pub latency: u16,
    /// Supervision timeout (units of 10 ms)
    pub supervision_timeout: u16,
    /// Minimum connection event length
    pub min_ce_length: u16,
    /// Maximum connection event length
    pub max_ce_length: u16,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        Self {
            scan_interval: DEFAULT_CONN_SCAN_INTERVAL,
            scan_window: DEFAULT_CONN_SCAN_WINDOW,
            interval_min: DEFAULT_CONN_INTERVAL_MIN,
            interval_max: DEFAULT_CONN_INTERVAL_MAX,
            latency: 0,
            supervision_timeout: DEFAULT_SUPERVISION_TIMEOUT,
            min_ce_length: DEFAULT_MIN_CE_LENGTH,
            max_ce_length: DEFAULT_MAX_CE_LENGTH,
        }
    }
}

impl ConnectionParameters {
    /// LE Create Connection command parameters for a peer
    #[must_use]
    pub fn to_params(&self, peer: BluetoothAddress, peer_type: AddressType) -> [u8; 25] {
        let mut params = [0u8; 25];
        params[0..2].copy_from_slice(&self.scan_interval.to_le_bytes());
        params[2..4].copy_from_slice(&self.scan_window.to_le_bytes());
        params[4] = 0x00; // initiator filter policy: use peer address
        params[5] = peer_type as u8;
        params[6..12].copy_from_slice(peer.as_bytes());
        params[12] = AddressType::Public as u8;
        params[13..15].copy_from_slice(&self.interval_min.to_le_bytes());
        params[15..17].copy_from_slice(&self.interval_max.to_le_bytes());
        params[17..19].copy_from_slice(&self.latency.to_le_bytes());
        params[19..21].copy_from_slice(&self.supervision_timeout.to_le_bytes());
        params[21..23].copy_from_slice(&self.min_ce_length.to_le_bytes());
        params[23..25].copy_from_slice(&self.max_ce_length.to_le_bytes());
        params
    }
}

/// Options for configuring an [`HciEngine`]
///
/// # Examples
///
/// ```rust
/// use hciwire::EngineOptions;
///
/// let options = EngineOptions {
///     device_index: 1,
///     command_timeout_ms: None,
///     ..EngineOptions::default()
/// };
/// assert_eq!(options.poll_interval_ms, 1000);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EngineOptions {
    /// Index of the adapter to bind
    pub device_index: u16,
    /// Period of the adapter power poll in milliseconds
    pub poll_interval_ms: u64,
    /// Time a command, or an attribute request waiting for a link, may
    /// stay unanswered. `None` waits forever.
    pub command_timeout_ms: Option<u64>,
    /// Lowest accepted HCI version
    pub min_hci_version: u8,
    /// Parameters used by scans
    pub scan: ScanParameters,
    /// Parameters used when creating connections
    pub connection: ConnectionParameters,
    /// Maximum ACL payload per outbound fragment
    pub acl_mtu: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            device_index: 0,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            command_timeout_ms: Some(DEFAULT_COMMAND_TIMEOUT_MS),
            min_hci_version: MIN_HCI_VERSION,
            scan: ScanParameters::default(),
            connection: ConnectionParameters::default(),
            acl_mtu: DEFAULT_ACL_MTU,
        }
    }
}

/// Local adapter information collected during activation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LocalAdapterInfo {
    /// Local Bluetooth device address
    pub address: Option<BluetoothAddress>,
    /// HCI version
    pub hci_version: Option<u8>,
    /// HCI revision
    pub hci_revision: Option<u16>,
    /// LMP/LL version
    pub lmp_version: Option<u8>,
    /// Manufacturer company identifier
    pub manufacturer: Option<u16>,
    /// LMP/LL subversion
    pub lmp_subversion: Option<u16>,
    /// LE supported by host, as read back after enabling it
    pub le_supported: Option<bool>,
    /// Simultaneous LE and BR/EDR supported by host
    pub simultaneous_le_host: Option<bool>,
}
