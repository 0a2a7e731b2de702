//! Attribute protocol request queue
//!
//! One [`GattQueue`] lives in every connection. It keeps at most one
//! attribute request in flight, interprets inbound attribute PDUs and tells
//! the engine what to do through a short list of [`GattAction`]s.

use crate::HciError;
use crate::acl::ATT_CID;
use crate::constants::{MAX_ATT_PDU, MAX_QUEUED_ATT_REQUESTS, MAX_SUBSCRIPTIONS};
use heapless::{Deque, Vec};

/// Attribute protocol PDU
pub type AttPdu = Vec<u8, MAX_ATT_PDU>;

/// Actions produced by one call into the queue
pub type GattActions<T> = Vec<GattAction<T>, 2>;

/// Attribute protocol opcodes
pub mod att_op {
    /// Error Response
    pub const ERROR_RSP: u8 = 0x01;
    /// Exchange MTU Request
    pub const EXCHANGE_MTU_REQ: u8 = 0x02;
    /// Exchange MTU Response
    pub const EXCHANGE_MTU_RSP: u8 = 0x03;
    /// Read By Type Request
    pub const READ_BY_TYPE_REQ: u8 = 0x08;
    /// Read Request
    pub const READ_REQ: u8 = 0x0A;
    /// Read Response
    pub const READ_RSP: u8 = 0x0B;
    /// Read By Group Type Request
    pub const READ_BY_GROUP_TYPE_REQ: u8 = 0x10;
    /// Write Request
    pub const WRITE_REQ: u8 = 0x12;
    /// Write Response
    pub const WRITE_RSP: u8 = 0x13;
    /// Handle Value Notification
    pub const HANDLE_VALUE_NTF: u8 = 0x1B;
    /// Handle Value Indication
    pub const HANDLE_VALUE_IND: u8 = 0x1D;
    /// Handle Value Confirmation
    pub const HANDLE_VALUE_CFM: u8 = 0x1E;
    /// Command flag, set on PDUs that never get a response
    pub const COMMAND_FLAG: u8 = 0x40;
}

/// Attribute protocol error codes
pub mod att_error {
    /// Insufficient Authentication
    pub const INSUFFICIENT_AUTHENTICATION: u8 = 0x05;
    /// Request Not Supported
    pub const REQUEST_NOT_SUPPORTED: u8 = 0x06;
    /// Insufficient Authorization
    pub const INSUFFICIENT_AUTHORIZATION: u8 = 0x08;
    /// Insufficient Encryption
    pub const INSUFFICIENT_ENCRYPTION: u8 = 0x0F;
}

/// Link security level of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SecurityLevel {
    /// Unencrypted link
    #[default]
    Low,
    /// Encrypted link
    Medium,
    /// Encrypted with an authenticated key
    High,
}

/// What the engine has to do after feeding the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattAction<T> {
    /// Write this PDU on the attribute channel
    Send(AttPdu),
    /// Resolve a caller's request
    Resolve(T, Result<AttPdu, HciError>),
    /// A subscribed attribute changed
    Notify {
        /// Attribute handle
        attribute: u16,
        /// New value
        value: AttPdu,
        /// Whether the peer asked for a confirmation
        indication: bool,
    },
    /// The in-flight request needs an encrypted link before it can succeed
    SecurityUpgradeRequired {
        /// ATT error code returned by the peer
        code: u8,
    },
}

#[derive(Debug, Clone)]
struct GattRequest<T> {
    ticket: T,
    pdu: AttPdu,
    /// Error code of a reply that is waiting on an encryption upgrade
    held: Option<u8>,
}

/// Serialized attribute requests for one connection
#[derive(Debug)]
pub struct GattQueue<T> {
    in_flight: Option<GattRequest<T>>,
    queued: Deque<GattRequest<T>, MAX_QUEUED_ATT_REQUESTS>,
    subscriptions: Vec<u16, MAX_SUBSCRIPTIONS>,
    security: SecurityLevel,
    /// When the in-flight request went out; `None` until [`GattQueue::stamp`]
    sent_at: Option<u64>,
}

impl<T> Default for GattQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> GattQueue<T> {
    /// Create an idle queue on an unencrypted link
    #[must_use]
    pub fn new() -> Self {
        Self {
            in_flight: None,
            queued: Deque::new(),
            subscriptions: Vec::new(),
            security: SecurityLevel::Low,
            sent_at: None,
        }
    }

    /// Submit a request. Returns the PDU to write now if nothing else is in
    /// flight; otherwise the request waits its turn.
    ///
    /// # Errors
    /// Returns `HciError::CapacityExceeded` if the queue is full, or
    /// `HciError::InvalidParameter` for an empty PDU
    pub fn submit(&mut self, ticket: T, pdu: AttPdu) -> Result<Option<AttPdu>, HciError> {
        if pdu.is_empty() {
            return Err(HciError::InvalidParameter);
        }
        let request = GattRequest {
            ticket,
            pdu,
            held: None,
        };
        if self.in_flight.is_some() {
            self.queued
                .push_back(request)
                .map_err(|_| HciError::CapacityExceeded)?;
            return Ok(None);
        }
        let pdu = request.pdu.clone();
        self.in_flight = Some(request);
        Ok(Some(pdu))
    }

    /// Interpret one inbound L2CAP payload
    pub fn push(&mut self, cid: u16, payload: &[u8]) -> GattActions<T> {
        let mut actions = GattActions::new();

        if cid != ATT_CID {
            debug!("[GATT] ignoring cid {:#x}", cid);
            return actions;
        }
        let Some(&op) = payload.first() else {
            warn!("[GATT] empty attribute PDU");
            return actions;
        };

        if self
            .in_flight
            .as_ref()
            .is_some_and(|request| request.pdu.as_slice() == payload)
        {
            trace!("[GATT] echo of in-flight request {:#x}", op);
            return actions;
        }

        if op % 2 == 0 {
            if op & att_op::COMMAND_FLAG == 0 && op != att_op::HANDLE_VALUE_CFM {
                debug!("[GATT] replying request-not-supported to {:#x}", op);
                actions.push(GattAction::Send(not_supported(op))).ok();
            }
            return actions;
        }

        if op == att_op::HANDLE_VALUE_NTF || op == att_op::HANDLE_VALUE_IND {
            self.value_pdu(op, payload, &mut actions);
            return actions;
        }

        let Some(request) = self.in_flight.as_mut() else {
            warn!("[GATT] response {:#x} with no request outstanding", op);
            return actions;
        };

        if op == att_op::ERROR_RSP && payload.len() >= 5 {
            let code = payload[4];
            let insufficient = matches!(
                code,
                att_error::INSUFFICIENT_AUTHENTICATION
                    | att_error::INSUFFICIENT_AUTHORIZATION
                    | att_error::INSUFFICIENT_ENCRYPTION
            );
            if insufficient && self.security < SecurityLevel::Medium {
                info!("[GATT] request {:#x} needs encryption (error {:#x})", payload[1], code);
                request.held = Some(code);
                actions
                    .push(GattAction::SecurityUpgradeRequired { code })
                    .ok();
                return actions;
            }
        }

        let result = reply_result(payload);
        self.finish(result, &mut actions);
        actions
    }

    /// Apply an Encryption Change for this link
    ///
    /// A request held for an upgrade is sent again when encryption came up,
    /// and fails with the peer's original error otherwise.
    pub fn on_encryption_change(&mut self, enabled: bool) -> GattActions<T> {
        let mut actions = GattActions::new();
        self.security = if enabled {
            self.security.max(SecurityLevel::Medium)
        } else {
            SecurityLevel::Low
        };

        let Some(request) = self.in_flight.as_mut() else {
            return actions;
        };
        let Some(code) = request.held.take() else {
            return actions;
        };

        if enabled {
            actions.push(GattAction::Send(request.pdu.clone())).ok();
            self.sent_at = None;
        } else {
            let opcode = request.pdu.first().copied().unwrap_or_default();
            self.finish(Err(HciError::AttError { opcode, code }), &mut actions);
        }
        actions
    }

    fn value_pdu(&mut self, op: u8, payload: &[u8], actions: &mut GattActions<T>) {
        let indication = op == att_op::HANDLE_VALUE_IND;
        if payload.len() < 3 {
            warn!("[GATT] short handle value PDU ({} bytes)", payload.len());
            return;
        }
        let attribute = u16::from_le_bytes([payload[1], payload[2]]);

        if !self.subscriptions.contains(&attribute) {
            trace!("[GATT] no subscriber for attribute {:#x}", attribute);
        } else if let Ok(value) = AttPdu::from_slice(&payload[3..]) {
            actions
                .push(GattAction::Notify {
                    attribute,
                    value,
                    indication,
                })
                .ok();
        } else {
            warn!(
                "[GATT] dropping {} byte value of attribute {:#x}",
                payload.len() - 3,
                attribute
            );
        }

        if indication {
            let mut confirm = AttPdu::new();
            confirm.push(att_op::HANDLE_VALUE_CFM).ok();
            actions.push(GattAction::Send(confirm)).ok();
        }
    }

    /// Resolve the in-flight request and promote the next one
    fn finish(&mut self, result: Result<AttPdu, HciError>, actions: &mut GattActions<T>) {
        self.sent_at = None;
        if let Some(done) = self.in_flight.take() {
            actions.push(GattAction::Resolve(done.ticket, result)).ok();
        }
        if let Some(next) = self.queued.pop_front() {
            actions.push(GattAction::Send(next.pdu.clone())).ok();
            self.in_flight = Some(next);
        }
    }

    /// Record `now` as the send time of an in-flight request that has none yet
    pub fn stamp(&mut self, now: u64) {
        if self.in_flight.is_some() && self.sent_at.is_none() {
            self.sent_at = Some(now);
        }
    }

    /// Fail the in-flight request with `HciError::Timeout` if it went out
    /// `timeout_ms` or more before `now`, held requests included. The next
    /// queued request is promoted.
    pub fn expire(&mut self, now: u64, timeout_ms: u64) -> GattActions<T> {
        let mut actions = GattActions::new();
        let due = self
            .sent_at
            .is_some_and(|sent_at| now.saturating_sub(sent_at) >= timeout_ms);
        let Some(request) = self.in_flight.as_ref().filter(|_| due) else {
            return actions;
        };
        let opcode = request.pdu.first().copied().map_or(0, u16::from);
        warn!("[GATT] request {:#x} timed out", opcode);
        self.finish(Err(HciError::Timeout { opcode }), &mut actions);
        actions
    }

    /// Subscribe to value changes of an attribute handle
    ///
    /// # Errors
    /// Returns `HciError::CapacityExceeded` if the subscription table is full
    pub fn subscribe(&mut self, attribute: u16) -> Result<(), HciError> {
        if self.subscriptions.contains(&attribute) {
            return Ok(());
        }
        self.subscriptions
            .push(attribute)
            .map_err(|_| HciError::CapacityExceeded)
    }

    /// Remove a subscription, returning whether it existed
    pub fn unsubscribe(&mut self, attribute: u16) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|&a| a != attribute);
        before != self.subscriptions.len()
    }

    /// Whether value changes of `attribute` are reported
    #[must_use]
    pub fn is_subscribed(&self, attribute: u16) -> bool {
        self.subscriptions.contains(&attribute)
    }

    /// Current link security level
    #[must_use]
    pub fn security(&self) -> SecurityLevel {
        self.security
    }

    /// PDU of the request currently awaiting a response
    #[must_use]
    pub fn in_flight(&self) -> Option<&AttPdu> {
        self.in_flight.as_ref().map(|request| &request.pdu)
    }

    /// Number of requests waiting behind the in-flight one
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queued.len()
    }

    /// Take every outstanding ticket, in-flight first
    pub fn drain(&mut self) -> Vec<T, { MAX_QUEUED_ATT_REQUESTS + 1 }> {
        self.sent_at = None;
        let mut tickets = Vec::new();
        if let Some(request) = self.in_flight.take() {
            tickets.push(request.ticket).ok();
        }
        while let Some(request) = self.queued.pop_front() {
            tickets.push(request.ticket).ok();
        }
        tickets
    }
}

fn reply_result(payload: &[u8]) -> Result<AttPdu, HciError> {
    if payload[0] == att_op::ERROR_RSP {
        if payload.len() < 5 {
            return Err(HciError::MalformedPacket);
        }
        return Err(HciError::AttError {
            opcode: payload[1],
            code: payload[4],
        });
    }
    AttPdu::from_slice(payload).map_err(|()| HciError::MalformedPacket)
}

fn not_supported(op: u8) -> AttPdu {
    let mut pdu = AttPdu::new();
    pdu.extend_from_slice(&[
        att_op::ERROR_RSP,
        op,
        0x00,
        0x00,
        att_error::REQUEST_NOT_SUPPORTED,
    ])
    .ok();
    pdu
}

fn build(bytes: &[u8]) -> Result<AttPdu, HciError> {
    AttPdu::from_slice(bytes).map_err(|()| HciError::InvalidParameter)
}

/// Exchange MTU Request
///
/// # Errors
/// Never fails for valid input; the `Result` mirrors the other builders
pub fn exchange_mtu(mtu: u16) -> Result<AttPdu, HciError> {
    let mtu = mtu.to_le_bytes();
    build(&[att_op::EXCHANGE_MTU_REQ, mtu[0], mtu[1]])
}

/// Read Request
///
/// # Errors
/// Never fails for valid input; the `Result` mirrors the other builders
pub fn read(handle: u16) -> Result<AttPdu, HciError> {
    let handle = handle.to_le_bytes();
    build(&[att_op::READ_REQ, handle[0], handle[1]])
}

/// Write Request
///
/// # Errors
/// Returns `HciError::InvalidParameter` if the value does not fit one PDU
pub fn write(handle: u16, value: &[u8]) -> Result<AttPdu, HciError> {
    let mut pdu = build(&[att_op::WRITE_REQ])?;
    pdu.extend_from_slice(&handle.to_le_bytes())
        .map_err(|()| HciError::InvalidParameter)?;
    pdu.extend_from_slice(value)
        .map_err(|()| HciError::InvalidParameter)?;
    Ok(pdu)
}

/// Read By Type Request for a 16-bit attribute type
///
/// # Errors
/// Returns `HciError::InvalidParameter` if `start` is zero or above `end`
pub fn read_by_type(start: u16, end: u16, uuid: u16) -> Result<AttPdu, HciError> {
    handle_range_request(att_op::READ_BY_TYPE_REQ, start, end, uuid)
}

/// Read By Group Type Request for a 16-bit group type
///
/// # Errors
/// Returns `HciError::InvalidParameter` if `start` is zero or above `end`
pub fn read_by_group_type(start: u16, end: u16, uuid: u16) -> Result<AttPdu, HciError> {
    handle_range_request(att_op::READ_BY_GROUP_TYPE_REQ, start, end, uuid)
}

fn handle_range_request(op: u8, start: u16, end: u16, uuid: u16) -> Result<AttPdu, HciError> {
    if start == 0 || start > end {
        return Err(HciError::InvalidParameter);
    }
    let mut pdu = build(&[op])?;
    for field in [start, end, uuid] {
        pdu.extend_from_slice(&field.to_le_bytes())
            .map_err(|()| HciError::InvalidParameter)?;
    }
    Ok(pdu)
}
