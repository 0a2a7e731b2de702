//! ACL (Asynchronous Connection-oriented) data handling
//!
//! Inbound ACL frames carry L2CAP PDUs split into a start fragment, which
//! holds the basic L2CAP header, and any number of continuation fragments.
//! [`AclReassembler`] rebuilds whole PDUs per connection handle. Fragments
//! of different handles may interleave freely.
//!
//! Outbound PDUs are framed and split to the controller's buffer size by
//! [`write_l2cap`].

use crate::HciError;
use crate::constants::{MAX_CONNECTIONS, MAX_HCI_FRAME, MAX_L2CAP_PAYLOAD};
use crate::packet::PacketType;
use heapless::{FnvIndexMap, Vec};

/// L2CAP channel carrying the attribute protocol
pub const ATT_CID: u16 = 0x0004;

/// Raw boundary flag value of a flushable start fragment
pub const ACL_START: u8 = 0x02;

/// Raw boundary flag value of a non-flushable start fragment
pub const ACL_START_NO_FLUSH: u8 = 0x00;

/// Raw boundary flag value of a continuation fragment
pub const ACL_CONT: u8 = 0x01;

/// Encoded outbound ACL frame, including the packet type byte
pub type AclFrame = Vec<u8, MAX_HCI_FRAME>;

/// Reassembled L2CAP payload
pub type L2capPayload = Vec<u8, MAX_L2CAP_PAYLOAD>;

/// ACL Packet Boundary flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PacketBoundary {
    /// First non-flushable packet
    FirstNonFlushable = 0x00,
    /// Continuing fragment packet
    ContinuingFragment = 0x01,
    /// First flushable packet
    FirstFlushable = 0x02,
    /// Complete L2CAP PDU (no fragmentation)
    CompletePdu = 0x03,
}

impl PacketBoundary {
    /// Convert from raw 2-bit value
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value & 0x03 {
            0x00 => Self::FirstNonFlushable,
            0x01 => Self::ContinuingFragment,
            0x02 => Self::FirstFlushable,
            _ => Self::CompletePdu,
        }
    }

    /// Whether this fragment opens a new PDU
    #[must_use]
    pub fn is_start(self) -> bool {
        !matches!(self, Self::ContinuingFragment)
    }
}

/// ACL Data packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AclHeader {
    /// Connection handle (12 bits)
    pub connection_handle: u16,
    /// Packet boundary flag (2 bits)
    pub packet_boundary: PacketBoundary,
    /// Broadcast flag (2 bits), always zero on LE links
    pub broadcast_flag: u8,
    /// Length of the data following the header
    pub data_length: u16,
}

impl AclHeader {
    /// Size of ACL header in bytes
    pub const SIZE: usize = 4;

    /// Create new ACL header
    #[must_use]
    pub fn new(connection_handle: u16, packet_boundary: PacketBoundary, data_length: u16) -> Self {
        Self {
            connection_handle: connection_handle & 0x0FFF,
            packet_boundary,
            broadcast_flag: 0,
            data_length,
        }
    }

    /// Parse ACL header from bytes
    ///
    /// # Errors
    /// Returns `HciError::MalformedPacket` if fewer than four bytes are given
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HciError> {
        if bytes.len() < Self::SIZE {
            return Err(HciError::MalformedPacket);
        }

        let handle_and_flags = u16::from_le_bytes([bytes[0], bytes[1]]);
        Ok(Self {
            connection_handle: handle_and_flags & 0x0FFF,
            packet_boundary: PacketBoundary::from_u8((handle_and_flags >> 12) as u8),
            broadcast_flag: (handle_and_flags >> 14) as u8 & 0x03,
            data_length: u16::from_le_bytes([bytes[2], bytes[3]]),
        })
    }

    /// Convert header to bytes
    #[must_use]
    pub fn to_bytes(self) -> [u8; 4] {
        let handle_and_flags = self.connection_handle
            | ((self.packet_boundary as u16) << 12)
            | (u16::from(self.broadcast_flag & 0x03) << 14);

        let mut bytes = [0u8; 4];
        bytes[0..2].copy_from_slice(&handle_and_flags.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.data_length.to_le_bytes());
        bytes
    }
}

/// Basic L2CAP header carried by a start fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct L2capHeader {
    /// Payload length, excluding this header
    pub length: u16,
    /// Channel identifier
    pub channel_id: u16,
}

impl L2capHeader {
    /// Size of the basic L2CAP header
    pub const SIZE: usize = 4;

    /// Parse from bytes
    ///
    /// # Errors
    /// Returns `HciError::MalformedPacket` if fewer than four bytes are given
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HciError> {
        if bytes.len() < Self::SIZE {
            return Err(HciError::MalformedPacket);
        }
        Ok(Self {
            length: u16::from_le_bytes([bytes[0], bytes[1]]),
            channel_id: u16::from_le_bytes([bytes[2], bytes[3]]),
        })
    }

    /// Convert header to bytes
    #[must_use]
    pub fn to_bytes(self) -> [u8; 4] {
        let mut bytes = [0u8; 4];
        bytes[0..2].copy_from_slice(&self.length.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.channel_id.to_le_bytes());
        bytes
    }
}

/// A complete inbound L2CAP PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L2capPdu {
    /// Connection handle it arrived on
    pub handle: u16,
    /// Channel identifier
    pub cid: u16,
    /// Full payload
    pub payload: L2capPayload,
}

/// A PDU still waiting for continuation fragments
#[derive(Debug, Clone)]
struct PartialPdu {
    expected: usize,
    cid: u16,
    data: L2capPayload,
}

/// Per-handle reassembly of fragmented L2CAP PDUs
#[derive(Debug, Default)]
pub struct AclReassembler {
    partial: FnvIndexMap<u16, PartialPdu, MAX_CONNECTIONS>,
}

impl AclReassembler {
    /// Create an empty reassembler
    #[must_use]
    pub fn new() -> Self {
        Self {
            partial: FnvIndexMap::new(),
        }
    }

    /// Feed one ACL fragment (starting at the ACL header, without the packet
    /// type byte). Returns the PDU once its last fragment has arrived.
    ///
    /// # Errors
    /// - `HciError::MalformedPacket` if a length field overruns the fragment
    ///   or the accumulated data overruns the declared PDU length
    /// - `HciError::ReassemblyOrphan` for a continuation without a start
    /// - `HciError::CapacityExceeded` if too many handles are mid-reassembly
    pub fn push(&mut self, fragment: &[u8]) -> Result<Option<L2capPdu>, HciError> {
        let header = AclHeader::from_bytes(fragment)?;
        let handle = header.connection_handle;
        let data = fragment
            .get(AclHeader::SIZE..AclHeader::SIZE + usize::from(header.data_length))
            .ok_or(HciError::MalformedPacket)?;

        if header.packet_boundary.is_start() {
            self.start(handle, data)
        } else {
            self.append(handle, data)
        }
    }

    fn start(&mut self, handle: u16, data: &[u8]) -> Result<Option<L2capPdu>, HciError> {
        if self.partial.remove(&handle).is_some() {
            warn!("[ACL] handle {} restarted before previous PDU completed", handle);
        }

        let l2cap = L2capHeader::from_bytes(data)?;
        let expected = usize::from(l2cap.length);
        let slice = &data[L2capHeader::SIZE..];
        if slice.len() > expected || expected > MAX_L2CAP_PAYLOAD {
            return Err(HciError::MalformedPacket);
        }

        let mut payload = L2capPayload::new();
        payload
            .extend_from_slice(slice)
            .map_err(|()| HciError::MalformedPacket)?;

        if payload.len() == expected {
            trace!("[ACL] complete PDU on handle {} cid {:#x}", handle, l2cap.channel_id);
            return Ok(Some(L2capPdu {
                handle,
                cid: l2cap.channel_id,
                payload,
            }));
        }

        self.partial
            .insert(
                handle,
                PartialPdu {
                    expected,
                    cid: l2cap.channel_id,
                    data: payload,
                },
            )
            .map_err(|_| HciError::CapacityExceeded)?;
        Ok(None)
    }

    fn append(&mut self, handle: u16, data: &[u8]) -> Result<Option<L2capPdu>, HciError> {
        let Some(partial) = self.partial.get_mut(&handle) else {
            return Err(HciError::ReassemblyOrphan { handle });
        };

        if partial.data.len() + data.len() > partial.expected
            || partial.data.extend_from_slice(data).is_err()
        {
            self.partial.remove(&handle);
            return Err(HciError::MalformedPacket);
        }

        if partial.data.len() < partial.expected {
            return Ok(None);
        }

        Ok(self.partial.remove(&handle).map(|done| L2capPdu {
            handle,
            cid: done.cid,
            payload: done.data,
        }))
    }

    /// Drop any partial PDU for `handle`
    pub fn discard(&mut self, handle: u16) {
        self.partial.remove(&handle);
    }

    /// Number of handles with a partial PDU
    #[must_use]
    pub fn in_progress(&self) -> usize {
        self.partial.len()
    }
}

/// Frame an L2CAP PDU as ACL data and hand each fragment to `write`
///
/// The first fragment is sent non-flushable, the rest as continuations.
/// Each fragment carries at most `mtu` bytes of L2CAP data.
///
/// # Errors
/// - `HciError::InvalidParameter` if `mtu` is zero or `payload` is too long
/// - any error returned by `write`
pub fn write_l2cap<F>(
    handle: u16,
    cid: u16,
    payload: &[u8],
    mtu: usize,
    mut write: F,
) -> Result<(), HciError>
where
    F: FnMut(&[u8]) -> Result<(), HciError>,
{
    let mtu = mtu.min(MAX_HCI_FRAME - 1 - AclHeader::SIZE);
    if mtu == 0 || payload.len() > MAX_L2CAP_PAYLOAD {
        return Err(HciError::InvalidParameter);
    }

    let length = u16::try_from(payload.len()).map_err(|_| HciError::InvalidParameter)?;
    let l2cap = L2capHeader {
        length,
        channel_id: cid,
    }
    .to_bytes();

    let total = L2capHeader::SIZE + payload.len();
    let mut offset = 0;
    while offset < total {
        let chunk = mtu.min(total - offset);
        let boundary = if offset == 0 {
            PacketBoundary::FirstNonFlushable
        } else {
            PacketBoundary::ContinuingFragment
        };
        // chunk <= mtu < MAX_HCI_FRAME
        let header = AclHeader::new(handle, boundary, chunk as u16);

        let mut frame = AclFrame::new();
        frame
            .push(PacketType::AclData as u8)
            .map_err(|_| HciError::CapacityExceeded)?;
        frame
            .extend_from_slice(&header.to_bytes())
            .map_err(|()| HciError::CapacityExceeded)?;
        for i in offset..offset + chunk {
            let byte = if i < L2capHeader::SIZE {
                l2cap[i]
            } else {
                payload[i - L2capHeader::SIZE]
            };
            frame.push(byte).map_err(|_| HciError::CapacityExceeded)?;
        }

        write(&frame)?;
        offset += chunk;
    }
    Ok(())
}
