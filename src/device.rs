//! Device registry
//!
//! Every advertiser or peer the engine has heard of is a [`Device`], keyed by
//! address. Advertising data and connection details are kept in separate
//! typed records and merged with [`Device::update_info`].

use crate::constants::MAX_DEVICES;
use crate::connection::ConnectionInfo;
use crate::eir::{DeviceName, EirInfo};
use crate::{AddressType, BluetoothAddress, HciError, status};
use heapless::FnvIndexMap;

/// Advertising event type of a non-connectable undirected advertisement
pub const ADV_NONCONN_IND: u8 = 0x03;

/// Advertising event type of a scan response
pub const SCAN_RSP: u8 = 0x04;

/// One report from an LE Advertising Report event
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdvertisingReport {
    /// Advertising event type
    pub event_type: u8,
    /// Advertiser address type
    pub address_type: AddressType,
    /// Advertiser address
    pub address: BluetoothAddress,
    /// Advertising data decoded from this report alone
    pub eir: EirInfo,
    /// Signal strength in dBm
    pub rssi: i8,
}

/// What the engine learned from advertisements of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdvertInfo {
    /// Event type of the latest report
    pub event_type: u8,
    /// Advertiser address type
    pub address_type: AddressType,
    /// Whether the device accepts connections
    pub connectable: bool,
    /// Whether a scan response has been seen
    pub has_scan_response: bool,
    /// Signal strength of the latest report
    pub rssi: i8,
    /// Number of reports received
    pub discovery_count: u32,
    /// Time of the latest report, in milliseconds
    pub last_seen: u64,
}

impl AdvertInfo {
    fn first(report: &AdvertisingReport, now: u64) -> Self {
        Self {
            event_type: report.event_type,
            address_type: report.address_type,
            connectable: report.event_type != ADV_NONCONN_IND,
            has_scan_response: false,
            rssi: report.rssi,
            discovery_count: 0,
            last_seen: now,
        }
    }

    fn merge(&mut self, report: &AdvertisingReport, now: u64) {
        if report.event_type == SCAN_RSP {
            self.has_scan_response = true;
        } else {
            self.connectable = report.event_type != ADV_NONCONN_IND;
        }
        self.event_type = report.event_type;
        self.address_type = report.address_type;
        self.rssi = report.rssi;
        self.discovery_count = self.discovery_count.saturating_add(1);
        self.last_seen = now;
    }
}

/// Typed update applied to a device
#[derive(Debug, Clone, Copy)]
pub enum DeviceUpdate<'a> {
    /// A fresh advertising report
    Advertisement {
        /// The report
        report: &'a AdvertisingReport,
        /// Time it was received, in milliseconds
        now: u64,
    },
    /// Details of a link-layer connection to the device
    Connection(&'a ConnectionInfo),
}

/// A discovered or connected peer
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Device {
    /// Device address
    pub address: BluetoothAddress,
    /// Display name, taken from the advertised local name
    pub name: Option<DeviceName>,
    /// Advertisement summary
    pub advert_info: Option<AdvertInfo>,
    /// Accumulated advertising data
    pub eir_info: EirInfo,
    /// Latest connection details
    pub connection_info: Option<ConnectionInfo>,
    /// Whether a connection to the device is up
    pub connected: bool,
    /// Connection handle once assigned
    pub handle: Option<u16>,
    /// Reason code of the last disconnection
    pub disconnect_reason: Option<u8>,
}

impl Device {
    /// Create a device that has only been referenced by address
    #[must_use]
    pub fn new(address: BluetoothAddress) -> Self {
        Self {
            address,
            name: None,
            advert_info: None,
            eir_info: EirInfo::default(),
            connection_info: None,
            connected: false,
            handle: None,
            disconnect_reason: None,
        }
    }

    /// Merge new information into the device
    ///
    /// Connection details only touch `connection_info`. Advertisements update
    /// `advert_info` and `eir_info`, refresh the display name and mirror an
    /// already known connection handle.
    pub fn update_info(&mut self, update: DeviceUpdate<'_>) {
        match update {
            DeviceUpdate::Connection(info) => {
                match &mut self.connection_info {
                    Some(existing) => existing.merge(info),
                    None => self.connection_info = Some(*info),
                }
            }
            DeviceUpdate::Advertisement { report, now } => {
                match &mut self.advert_info {
                    Some(advert) => advert.merge(report, now),
                    None => {
                        let mut advert = AdvertInfo::first(report, now);
                        advert.merge(report, now);
                        self.advert_info = Some(advert);
                    }
                }
                self.eir_info.merge(&report.eir);
                if let Some(name) = &report.eir.local_name {
                    self.name = Some(name.clone());
                }
                if let Some(info) = &self.connection_info {
                    self.handle = Some(info.handle);
                }
            }
        }
    }

    /// Raise the connected and handle-assigned conditions
    pub fn mark_connected(&mut self, handle: u16) {
        self.connected = true;
        self.handle = Some(handle);
        self.disconnect_reason = None;
    }

    /// Clear the link conditions and record why the link went down
    pub fn mark_disconnected(&mut self, reason: u8) {
        self.connected = false;
        self.handle = None;
        self.disconnect_reason = Some(reason);
    }

    /// True once both the connected and the handle-assigned conditions hold
    #[must_use]
    pub fn link_ready(&self) -> bool {
        self.connected && self.handle.is_some()
    }

    /// Human readable reason of the last disconnection
    #[must_use]
    pub fn disconnect_reason_name(&self) -> Option<&'static str> {
        self.disconnect_reason.map(status::name)
    }
}

/// Devices keyed by address
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: FnvIndexMap<BluetoothAddress, Device, MAX_DEVICES>,
}

impl DeviceRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            devices: FnvIndexMap::new(),
        }
    }

    /// Look up a device
    #[must_use]
    pub fn get(&self, address: &BluetoothAddress) -> Option<&Device> {
        self.devices.get(address)
    }

    /// Look up a device mutably
    pub fn get_mut(&mut self, address: &BluetoothAddress) -> Option<&mut Device> {
        self.devices.get_mut(address)
    }

    /// Resolve a device by address, creating it on first reference
    ///
    /// When the registry is full, the least recently seen device without a
    /// connection makes room.
    ///
    /// # Errors
    /// Returns `HciError::CapacityExceeded` if every stored device is connected
    pub fn get_or_insert(&mut self, address: BluetoothAddress) -> Result<&mut Device, HciError> {
        if !self.devices.contains_key(&address) {
            if self.devices.len() == self.devices.capacity() {
                self.evict_stale()?;
            }
            self.devices
                .insert(address, Device::new(address))
                .map_err(|_| HciError::CapacityExceeded)?;
        }
        self.devices
            .get_mut(&address)
            .ok_or(HciError::CapacityExceeded)
    }

    fn evict_stale(&mut self) -> Result<(), HciError> {
        let victim = self
            .devices
            .values()
            .filter(|device| !device.connected)
            .min_by_key(|device| device.advert_info.map_or(0, |advert| advert.last_seen))
            .map(|device| device.address)
            .ok_or(HciError::CapacityExceeded)?;
        debug!("[DEVICE] evicting stale device");
        self.devices.remove(&victim);
        Ok(())
    }

    /// Feed an advertising report to its device
    ///
    /// # Errors
    /// Returns `HciError::CapacityExceeded` if the device cannot be stored
    pub fn on_discovery(
        &mut self,
        report: &AdvertisingReport,
        now: u64,
    ) -> Result<&Device, HciError> {
        let device = self.get_or_insert(report.address)?;
        device.update_info(DeviceUpdate::Advertisement { report, now });
        Ok(&*device)
    }

    /// Iterate over every device
    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Number of stored devices
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// True if no device is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
