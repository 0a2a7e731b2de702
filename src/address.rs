use crate::HciError;

/// A Bluetooth Device Address (`BD_ADDR`) wrapper for type safety
///
/// The bytes are kept in wire order (least significant byte first), exactly
/// as they appear in HCI events and commands. [`BluetoothAddress::format_hex`]
/// and [`BluetoothAddress::from_hex`] use the conventional display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BluetoothAddress(pub [u8; 6]);

impl BluetoothAddress {
    /// Create a new Bluetooth address from wire-order bytes
    #[must_use]
    pub const fn new(addr: [u8; 6]) -> Self {
        Self(addr)
    }

    /// Get the raw address bytes in wire order
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Format the address as a colon-separated hex string, most significant byte first
    #[must_use]
    pub fn format_hex(&self) -> heapless::String<17> {
        const HEX: &[u8; 16] = b"0123456789ABCDEF";
        let mut result = heapless::String::new();
        for (i, byte) in self.0.iter().rev().enumerate() {
            if i > 0 {
                result.push(':').ok();
            }
            result.push(char::from(HEX[usize::from(byte >> 4)])).ok();
            result.push(char::from(HEX[usize::from(byte & 0x0F)])).ok();
        }
        result
    }

    /// Parse a Bluetooth address from a colon-separated hex string
    ///
    /// # Errors
    /// Returns `HciError::InvalidParameter` if the string is not exactly
    /// 17 characters long or contains invalid characters
    pub fn from_hex(hex: &str) -> Result<Self, HciError> {
        if hex.len() != 17 || !hex.chars().all(|c| c.is_ascii_hexdigit() || c == ':') {
            return Err(HciError::InvalidParameter);
        }

        let mut bytes = [0u8; 6];
        for (i, byte) in hex.split(':').enumerate() {
            if i >= 6 || byte.len() != 2 {
                return Err(HciError::InvalidParameter);
            }
            bytes[5 - i] = u8::from_str_radix(byte, 16).map_err(|_| HciError::InvalidParameter)?;
        }
        Ok(Self(bytes))
    }
}

impl From<[u8; 6]> for BluetoothAddress {
    fn from(addr: [u8; 6]) -> Self {
        Self(addr)
    }
}

impl From<BluetoothAddress> for [u8; 6] {
    fn from(addr: BluetoothAddress) -> Self {
        addr.0
    }
}

impl From<BluetoothAddress> for bt_hci::param::BdAddr {
    fn from(addr: BluetoothAddress) -> Self {
        bt_hci::param::BdAddr::new(addr.0)
    }
}

impl From<BluetoothAddress> for heapless::String<17> {
    fn from(addr: BluetoothAddress) -> Self {
        addr.format_hex()
    }
}

impl TryFrom<&str> for BluetoothAddress {
    type Error = HciError;

    fn try_from(hex: &str) -> Result<Self, Self::Error> {
        BluetoothAddress::from_hex(hex)
    }
}

impl TryFrom<&[u8]> for BluetoothAddress {
    type Error = HciError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let addr: [u8; 6] = bytes.try_into().map_err(|_| HciError::InvalidParameter)?;
        Ok(BluetoothAddress(addr))
    }
}

impl From<bt_hci::param::BdAddr> for BluetoothAddress {
    fn from(bd_addr: bt_hci::param::BdAddr) -> Self {
        let mut addr = [0u8; 6];
        addr.copy_from_slice(bd_addr.raw());
        Self(addr)
    }
}

/// LE address type as reported by advertising and connection events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum AddressType {
    /// Public device address
    #[default]
    Public = 0x00,
    /// Random device address
    Random = 0x01,
}

impl AddressType {
    /// Convert from the raw address type byte.
    ///
    /// Resolvable identity types (0x02, 0x03) fold onto public and random.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        if value & 0x01 == 0 {
            Self::Public
        } else {
            Self::Random
        }
    }
}
