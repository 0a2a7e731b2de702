//! `hciwire` Constants
//!
//! This module contains the capacity limits, default values and fixed HCI
//! parameters used throughout the engine. Every table in the crate is a
//! fixed-capacity `heapless` collection sized by one of these constants.

/// Maximum number of simultaneous LE connections tracked by the engine
pub const MAX_CONNECTIONS: usize = 4;

/// Maximum number of devices kept in the device registry
pub const MAX_DEVICES: usize = 16;

/// Maximum number of distinct opcodes with outstanding commands
pub const MAX_PENDING_OPCODES: usize = 16;

/// Maximum number of outstanding commands sharing one opcode
pub const MAX_PENDING_PER_OPCODE: usize = 4;

/// Maximum number of commands queued while the adapter is not ready
pub const MAX_DEFERRED_COMMANDS: usize = 16;

/// Maximum number of resolved outcomes waiting to be collected
pub const MAX_OUTCOMES: usize = 16;

/// Maximum number of engine events buffered for the application
pub const EVENT_QUEUE_DEPTH: usize = 16;

/// Maximum number of attribute requests queued per connection
pub const MAX_QUEUED_ATT_REQUESTS: usize = 4;

/// Maximum number of attribute handles one connection can subscribe to
pub const MAX_SUBSCRIPTIONS: usize = 16;

/// Maximum number of attribute requests parked until a device is linked
pub const MAX_PARKED_REQUESTS: usize = 4;

/// Maximum number of tasks waiting on the async facade at once
pub const MAX_WAITERS: usize = 8;

/// Maximum number of frames buffered between the driver and the run loop
pub const INBOUND_QUEUE_DEPTH: usize = 8;

/// Largest HCI frame accepted from the driver (type byte + ACL header + data)
pub const MAX_HCI_FRAME: usize = 1028;

/// Largest command parameter block (the length field is one byte)
pub const MAX_COMMAND_PARAMS: usize = 255;

/// Largest reassembled L2CAP payload
pub const MAX_L2CAP_PAYLOAD: usize = 1024;

/// Largest attribute protocol PDU (512 byte value plus header)
pub const MAX_ATT_PDU: usize = 517;

/// Maximum device name length in bytes
pub const MAX_DEVICE_NAME_LENGTH: usize = 32;

/// Maximum number of 16-bit service UUIDs remembered per advertiser
pub const MAX_SERVICE_UUIDS: usize = 16;

/// Maximum number of service data entries remembered per advertiser
pub const MAX_SERVICE_DATA: usize = 8;

/// Maximum service data payload length
pub const MAX_SERVICE_DATA_LENGTH: usize = 29;

/// Maximum manufacturer specific data length
pub const MAX_MANUFACTURER_DATA_LENGTH: usize = 29;

/// Maximum number of addresses returned by one timed scan
pub const MAX_SCAN_RESULTS: usize = 16;

/// Default liveness poll period in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Default time a command may stay unanswered before it times out
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 10_000;

/// Lowest HCI version the engine speaks (Bluetooth 4.0)
pub const MIN_HCI_VERSION: u8 = 0x06;

/// Default maximum ACL payload per outbound fragment (LE default buffer size)
pub const DEFAULT_ACL_MTU: usize = 27;

/// Classic event mask written during activation
pub const EVENT_MASK: [u8; 8] = [0xFF, 0xFF, 0xFB, 0xFF, 0x07, 0xF8, 0xBF, 0x3D];

/// LE event mask written during activation (first five LE meta subevents)
pub const LE_EVENT_MASK: [u8; 8] = [0x1F, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

/// Parameters for Write LE Host Supported: LE enabled, simultaneous disabled
pub const LE_HOST_SUPPORTED_ENABLE: [u8; 2] = [0x01, 0x00];

/// Default scan interval and window (units of 0.625 ms)
pub const DEFAULT_SCAN_INTERVAL: u16 = 0x0010;

/// Default LE connection scan interval (units of 0.625 ms)
pub const DEFAULT_CONN_SCAN_INTERVAL: u16 = 0x0060;

/// Default LE connection scan window (units of 0.625 ms)
pub const DEFAULT_CONN_SCAN_WINDOW: u16 = 0x0030;

/// Default minimum connection interval (units of 1.25 ms)
pub const DEFAULT_CONN_INTERVAL_MIN: u16 = 0x0006;

/// Default maximum connection interval (units of 1.25 ms)
pub const DEFAULT_CONN_INTERVAL_MAX: u16 = 0x000C;

/// Default supervision timeout (units of 10 ms)
pub const DEFAULT_SUPERVISION_TIMEOUT: u16 = 0x00C8;

/// Default minimum connection event length
pub const DEFAULT_MIN_CE_LENGTH: u16 = 0x0004;

/// Default maximum connection event length
pub const DEFAULT_MAX_CE_LENGTH: u16 = 0x0006;

/// Disconnect reason used when the local user ends a connection
pub const REMOTE_USER_TERMINATED: u8 = 0x13;

/// Disconnect reason reported when the local host ended a connection
pub const LOCAL_HOST_TERMINATED: u8 = 0x16;

/// Period of the [`Host::run`](crate::Host::run) loop tick in milliseconds
pub const RUN_TICK_MS: u64 = 50;
