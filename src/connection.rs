//! Connection registry
//!
//! A [`Connection`] exists for every link-layer handle the controller has
//! reported. It owns the attribute request queue of that link. Connections
//! are evicted when their Disconnection Complete arrives.

use crate::constants::MAX_CONNECTIONS;
use crate::device::{DeviceRegistry, DeviceUpdate};
use crate::gatt::GattQueue;
use crate::packet::{read_u16, read_u8};
use crate::{AddressType, BluetoothAddress, HciError};
use heapless::FnvIndexMap;

/// Local role on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Role {
    /// Local device initiated the connection
    Central,
    /// Peer initiated the connection
    Peripheral,
}

/// Link-layer details of an LE connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectionInfo {
    /// Connection handle
    pub handle: u16,
    /// Local role
    pub role: Role,
    /// Peer address type
    pub address_type: AddressType,
    /// Peer address
    pub address: BluetoothAddress,
    /// Connection interval (units of 1.25 ms)
    pub interval: u16,
    /// Peripheral latency in connection events
    pub latency: u16,
    /// Supervision timeout (units of 10 ms)
    pub supervision_timeout: u16,
    /// Central clock accuracy code
    pub clock_accuracy: u8,
}

impl ConnectionInfo {
    /// Parse LE Connection Complete parameters following the subevent code
    ///
    /// Returns the status byte alongside the decoded details.
    ///
    /// # Errors
    /// Returns `HciError::MalformedPacket` if the parameters are truncated
    pub fn from_le_connection_complete(params: &[u8]) -> Result<(u8, Self), HciError> {
        let status = read_u8(params, 0)?;
        let address = params.get(5..11).ok_or(HciError::MalformedPacket)?;
        let info = Self {
            handle: read_u16(params, 1)? & 0x0FFF,
            role: if read_u8(params, 3)? == 0 {
                Role::Central
            } else {
                Role::Peripheral
            },
            address_type: AddressType::from_u8(read_u8(params, 4)?),
            address: BluetoothAddress::try_from(address)?,
            interval: read_u16(params, 11)?,
            latency: read_u16(params, 13)?,
            supervision_timeout: read_u16(params, 15)?,
            clock_accuracy: read_u8(params, 17)?,
        };
        Ok((status, info))
    }

    /// Replace these details with newer ones for the same link
    pub fn merge(&mut self, other: &ConnectionInfo) {
        *self = *other;
    }

    /// Apply the parameters of an LE Connection Update Complete
    pub fn apply_update(&mut self, interval: u16, latency: u16, supervision_timeout: u16) {
        self.interval = interval;
        self.latency = latency;
        self.supervision_timeout = supervision_timeout;
    }
}

/// One LE link and its attribute channel
#[derive(Debug)]
pub struct Connection<T> {
    /// Connection handle
    pub handle: u16,
    /// Peer address once known
    pub address: Option<BluetoothAddress>,
    /// Latest link-layer details
    pub info: Option<ConnectionInfo>,
    /// LE features reported by the peer
    pub remote_features: Option<[u8; 8]>,
    /// Attribute request queue of this link
    pub gatt: GattQueue<T>,
}

impl<T> Connection<T> {
    /// Create a connection known only by handle
    #[must_use]
    pub fn new(handle: u16) -> Self {
        Self {
            handle,
            address: None,
            info: None,
            remote_features: None,
            gatt: GattQueue::new(),
        }
    }

    fn update_info(&mut self, info: &ConnectionInfo) {
        match &mut self.info {
            Some(existing) => existing.merge(info),
            None => self.info = Some(*info),
        }
        self.address = Some(info.address);
    }
}

/// Connections keyed by handle
#[derive(Debug)]
pub struct ConnectionRegistry<T> {
    connections: FnvIndexMap<u16, Connection<T>, MAX_CONNECTIONS>,
}

impl<T> Default for ConnectionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ConnectionRegistry<T> {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: FnvIndexMap::new(),
        }
    }

    /// Look up a connection
    #[must_use]
    pub fn get(&self, handle: u16) -> Option<&Connection<T>> {
        self.connections.get(&handle)
    }

    /// Look up a connection mutably
    pub fn get_mut(&mut self, handle: u16) -> Option<&mut Connection<T>> {
        self.connections.get_mut(&handle)
    }

    /// Resolve a connection by handle, creating it on first reference
    ///
    /// # Errors
    /// Returns `HciError::CapacityExceeded` if the registry is full
    pub fn get_or_insert(&mut self, handle: u16) -> Result<&mut Connection<T>, HciError> {
        if !self.connections.contains_key(&handle) {
            self.connections
                .insert(handle, Connection::new(handle))
                .map_err(|_| HciError::CapacityExceeded)?;
        }
        self.connections
            .get_mut(&handle)
            .ok_or(HciError::CapacityExceeded)
    }

    /// Handle of the connection to `address`, if any
    #[must_use]
    pub fn handle_for(&self, address: &BluetoothAddress) -> Option<u16> {
        self.connections
            .values()
            .find(|connection| connection.address.as_ref() == Some(address))
            .map(|connection| connection.handle)
    }

    /// Record a new link: resolve both the connection and its device, merge
    /// the details into each and mark the device connected
    ///
    /// # Errors
    /// Returns `HciError::CapacityExceeded` if either registry is full
    pub fn register(
        &mut self,
        info: &ConnectionInfo,
        devices: &mut DeviceRegistry,
    ) -> Result<(), HciError> {
        let connection = self.get_or_insert(info.handle)?;
        let address = connection.address.unwrap_or(info.address);
        connection.update_info(info);

        let device = devices.get_or_insert(address)?;
        device.update_info(DeviceUpdate::Connection(info));
        device.mark_connected(info.handle);
        info!("[CONN] handle {} registered", info.handle);
        Ok(())
    }

    /// Tear down a link: mark its device disconnected and evict the connection
    ///
    /// # Errors
    /// Returns `HciError::UnknownConnection` if the handle is not registered
    pub fn disconnect(
        &mut self,
        handle: u16,
        reason: u8,
        devices: &mut DeviceRegistry,
    ) -> Result<Connection<T>, HciError> {
        let Some(connection) = self.connections.remove(&handle) else {
            warn!("[CONN] disconnect for unknown handle {}", handle);
            return Err(HciError::UnknownConnection { handle });
        };

        let device = match connection.address {
            Some(address) => devices.get_mut(&address),
            None => None,
        };
        match device {
            Some(device) => device.mark_disconnected(reason),
            None => debug!("[CONN] handle {} had no device", handle),
        }
        Ok(connection)
    }

    /// Iterate over every connection
    pub fn iter(&self) -> impl Iterator<Item = &Connection<T>> {
        self.connections.values()
    }

    /// Iterate mutably over every connection
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection<T>> {
        self.connections.values_mut()
    }

    /// Remove every connection
    pub fn clear(&mut self) {
        self.connections.clear();
    }

    /// Number of live connections
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// True if there are no connections
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
