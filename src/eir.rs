//! Extended Inquiry Response / advertising data decoder
//!
//! Advertising payloads are a sequence of `length, type, value[length - 1]`
//! records. [`decode_into`] folds those records into an [`EirInfo`]
//! accumulator so repeated sightings of the same advertiser merge into one
//! view. Truncated or zero-length records end decoding quietly; whatever was
//! decoded before them is kept.

use crate::constants::{
    MAX_DEVICE_NAME_LENGTH, MAX_MANUFACTURER_DATA_LENGTH, MAX_SERVICE_DATA,
    MAX_SERVICE_DATA_LENGTH, MAX_SERVICE_UUIDS,
};
use heapless::{String, Vec};

/// AD type codes understood by the decoder
pub mod ad_type {
    /// Incomplete list of 16-bit service UUIDs
    pub const INCOMPLETE_SERVICE_UUIDS_16: u8 = 0x02;
    /// Complete list of 16-bit service UUIDs
    pub const COMPLETE_SERVICE_UUIDS_16: u8 = 0x03;
    /// Shortened local name
    pub const SHORTENED_LOCAL_NAME: u8 = 0x08;
    /// Complete local name
    pub const COMPLETE_LOCAL_NAME: u8 = 0x09;
    /// Tx power level
    pub const TX_POWER_LEVEL: u8 = 0x0A;
    /// Service data, 16-bit UUID
    pub const SERVICE_DATA_16: u8 = 0x16;
    /// Manufacturer specific data
    pub const MANUFACTURER_SPECIFIC_DATA: u8 = 0xFF;
}

/// Hex-encoded 16-bit UUID, lowercase, most significant nibble first
pub type UuidString = String<4>;

/// Device local name
pub type DeviceName = String<MAX_DEVICE_NAME_LENGTH>;

/// One service data record
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ServiceData {
    /// Service UUID in display order
    pub uuid: UuidString,
    /// Opaque service payload
    pub data: Vec<u8, MAX_SERVICE_DATA_LENGTH>,
}

/// Decoded advertising data, accumulated across sightings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EirInfo {
    /// Shortened or complete local name, the last one seen wins
    pub local_name: Option<DeviceName>,
    /// Advertised transmit power in dBm
    pub tx_power_level: Option<i8>,
    /// 16-bit service UUIDs in order of first appearance, without duplicates
    pub service_uuids: Vec<UuidString, MAX_SERVICE_UUIDS>,
    /// Service data records, oldest first
    pub service_data: Vec<ServiceData, MAX_SERVICE_DATA>,
    /// Manufacturer specific data, the last one seen wins
    pub manufacturer_data: Option<Vec<u8, MAX_MANUFACTURER_DATA_LENGTH>>,
}

impl EirInfo {
    /// Decode a buffer into a fresh accumulator
    #[must_use]
    pub fn decode(data: &[u8]) -> Self {
        let mut info = Self::default();
        decode_into(data, &mut info);
        info
    }

    /// Merge another decoded view into this one, with the same rules the
    /// decoder applies record by record
    pub fn merge(&mut self, other: &EirInfo) {
        if let Some(name) = &other.local_name {
            self.local_name = Some(name.clone());
        }
        if other.tx_power_level.is_some() {
            self.tx_power_level = other.tx_power_level;
        }
        for uuid in &other.service_uuids {
            self.add_service_uuid(uuid);
        }
        for entry in &other.service_data {
            self.add_service_data(entry.clone());
        }
        if let Some(data) = &other.manufacturer_data {
            self.manufacturer_data = Some(data.clone());
        }
    }

    fn add_service_uuid(&mut self, uuid: &UuidString) {
        if self.service_uuids.contains(uuid) {
            return;
        }
        if self.service_uuids.push(uuid.clone()).is_err() {
            debug!("[EIR] service uuid list full, dropping {}", uuid.as_str());
        }
    }

    fn add_service_data(&mut self, entry: ServiceData) {
        if self.service_data.contains(&entry) {
            return;
        }
        if self.service_data.is_full() {
            self.service_data.remove(0);
        }
        self.service_data.push(entry).ok();
    }
}

/// Decode advertising data into `info`
///
/// Stops at the first zero-length record or the first record that would
/// extend past the end of `data`. Unknown record types are skipped.
pub fn decode_into(data: &[u8], info: &mut EirInfo) {
    let mut i = 0;

    while i + 1 < data.len() {
        let length = usize::from(data[i]);
        if length == 0 {
            break;
        }
        if i + length + 1 > data.len() {
            debug!("[EIR] record at {} overruns buffer ({} > {})", i, i + length + 1, data.len());
            break;
        }

        let record_type = data[i + 1];
        let value = &data[i + 2..i + 1 + length];

        match record_type {
            ad_type::INCOMPLETE_SERVICE_UUIDS_16 | ad_type::COMPLETE_SERVICE_UUIDS_16 => {
                for pair in value.chunks_exact(2) {
                    let uuid = uuid_to_hex(u16::from_le_bytes([pair[0], pair[1]]));
                    info.add_service_uuid(&uuid);
                }
            }
            ad_type::SHORTENED_LOCAL_NAME | ad_type::COMPLETE_LOCAL_NAME => {
                info.local_name = Some(decode_name(value));
            }
            ad_type::TX_POWER_LEVEL => {
                if let Some(&power) = value.first() {
                    info.tx_power_level = Some(power as i8);
                }
            }
            ad_type::SERVICE_DATA_16 => {
                if value.len() >= 2 {
                    let uuid = uuid_to_hex(u16::from_le_bytes([value[0], value[1]]));
                    let payload = &value[2..];
                    let payload = &payload[..payload.len().min(MAX_SERVICE_DATA_LENGTH)];
                    let mut data = Vec::new();
                    data.extend_from_slice(payload).ok();
                    info.add_service_data(ServiceData { uuid, data });
                }
            }
            ad_type::MANUFACTURER_SPECIFIC_DATA => {
                let value = &value[..value.len().min(MAX_MANUFACTURER_DATA_LENGTH)];
                let mut data = Vec::new();
                data.extend_from_slice(value).ok();
                info.manufacturer_data = Some(data);
            }
            other => {
                trace!("[EIR] skipping record type {:#x}", other);
            }
        }

        i += length + 1;
    }
}

/// Encode a 16-bit UUID as four lowercase hex digits
#[must_use]
pub fn uuid_to_hex(uuid: u16) -> UuidString {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::new();
    for shift in [12u16, 8, 4, 0] {
        out.push(char::from(HEX[usize::from((uuid >> shift) & 0x0F)]))
            .ok();
    }
    out
}

/// Decode a name as UTF-8, keeping the valid prefix and truncating to capacity
fn decode_name(value: &[u8]) -> DeviceName {
    let text = match core::str::from_utf8(value) {
        Ok(text) => text,
        Err(e) => core::str::from_utf8(&value[..e.valid_up_to()]).unwrap_or_default(),
    };
    let mut name = DeviceName::new();
    for c in text.chars() {
        if name.push(c).is_err() {
            break;
        }
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_complete_local_name() {
        let info = EirInfo::decode(&[0x04, 0x09, 0x41, 0x42, 0x43]);
        assert_eq!(info.local_name.as_deref(), Some("ABC"));
    }

    #[test]
    fn test_decode_flags_name_and_power() {
        let data = [
            0x02, 0x01, 0x06, // flags, ignored
            0x05, 0x08, b'B', b'u', b'd', b's', // shortened name
            0x02, 0x0A, 0xF4, // tx power -12
        ];
        let info = EirInfo::decode(&data);
        assert_eq!(info.local_name.as_deref(), Some("Buds"));
        assert_eq!(info.tx_power_level, Some(-12));
        assert!(info.service_uuids.is_empty());
        assert!(info.manufacturer_data.is_none());
    }

    #[test]
    fn test_decode_service_uuids_deduplicated() {
        let data = [
            0x05, 0x02, 0x0F, 0x18, 0x0A, 0x18, // 180f, 180a
            0x05, 0x03, 0x0A, 0x18, 0x9F, 0xFE, // 180a again, fe9f
        ];
        let info = EirInfo::decode(&data);
        let uuids: heapless::Vec<&str, 4> = info.service_uuids.iter().map(|u| u.as_str()).collect();
        assert_eq!(uuids.as_slice(), &["180f", "180a", "fe9f"]);
    }

    #[test]
    fn test_decode_service_and_manufacturer_data() {
        let data = [
            0x05, 0x16, 0xAA, 0xFE, 0x10, 0x20, // service data fe aa -> [10 20]
            0x04, 0xFF, 0x4C, 0x00, 0x01, // manufacturer
            0x03, 0xFF, 0x59, 0x00, // manufacturer again, last wins
        ];
        let info = EirInfo::decode(&data);
        assert_eq!(info.service_data.len(), 1);
        assert_eq!(info.service_data[0].uuid.as_str(), "feaa");
        assert_eq!(info.service_data[0].data.as_slice(), &[0x10, 0x20]);
        assert_eq!(
            info.manufacturer_data.as_ref().map(|d| d.as_slice()),
            Some(&[0x59, 0x00][..])
        );
    }

    #[test]
    fn test_decode_truncated_record_stops() {
        // Second record claims 10 bytes but only 2 remain
        let data = [0x04, 0x09, b'A', b'B', b'C', 0x0A, 0x09, b'X'];
        let info = EirInfo::decode(&data);
        assert_eq!(info.local_name.as_deref(), Some("ABC"));

        // First record already overruns
        let info = EirInfo::decode(&[0xFF, 0x09, b'A']);
        assert_eq!(info, EirInfo::default());
    }

    #[test]
    fn test_decode_truncation_at_every_length() {
        let data = [
            0x03, 0x03, 0x0F, 0x18, 0x04, 0x09, b'A', b'B', b'C', 0x02, 0x0A, 0x04,
        ];
        for end in 0..=data.len() {
            let info = EirInfo::decode(&data[..end]);
            if end < 4 {
                assert!(info.service_uuids.is_empty());
            }
            if end < 9 {
                assert!(info.local_name.is_none());
            }
            if end < 12 {
                assert!(info.tx_power_level.is_none());
            }
        }
    }

    #[test]
    fn test_decode_zero_length_terminates() {
        let data = [0x02, 0x0A, 0x05, 0x00, 0x04, 0x09, b'A', b'B', b'C'];
        let info = EirInfo::decode(&data);
        assert_eq!(info.tx_power_level, Some(5));
        assert!(info.local_name.is_none());
    }

    #[test]
    fn test_decode_invalid_utf8_keeps_valid_prefix() {
        let info = EirInfo::decode(&[0x04, 0x09, b'H', b'i', 0xFF]);
        assert_eq!(info.local_name.as_deref(), Some("Hi"));
    }

    #[test]
    fn test_repeated_merge_is_idempotent() {
        let data = [
            0x03, 0x03, 0x0F, 0x18, 0x04, 0x16, 0x0F, 0x18, 0x64, 0x04, 0x09, b'A', b'B', b'C',
        ];
        let mut info = EirInfo::default();
        decode_into(&data, &mut info);
        let once = info.clone();
        decode_into(&data, &mut info);
        assert_eq!(info, once);

        let mut merged = once.clone();
        merged.merge(&once);
        assert_eq!(merged, once);
    }

    #[test]
    fn test_service_data_drops_oldest_when_full() {
        let mut info = EirInfo::default();
        for i in 0..=MAX_SERVICE_DATA as u8 {
            decode_into(&[0x04, 0x16, 0x0F, 0x18, i], &mut info);
        }
        assert_eq!(info.service_data.len(), MAX_SERVICE_DATA);
        assert_eq!(info.service_data[0].data.as_slice(), &[1]);
        assert_eq!(
            info.service_data[MAX_SERVICE_DATA - 1].data.as_slice(),
            &[MAX_SERVICE_DATA as u8]
        );
    }

    #[test]
    fn test_uuid_to_hex() {
        assert_eq!(uuid_to_hex(0x180F).as_str(), "180f");
        assert_eq!(uuid_to_hex(0x000A).as_str(), "000a");
    }
}
