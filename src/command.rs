//! Command/event correlation
//!
//! Every command sent to the controller is answered by a Command Complete or
//! a Command Status event that only names the opcode. The correlator keeps
//! one FIFO of pending completions per opcode and matches replies strictly in
//! submission order.
//!
//! Commands that run asynchronously (LE Create Connection, Disconnect, ...)
//! are first acknowledged by a successful Command Status. Their entry then
//! moves to a second, per-opcode follow-up FIFO and is resolved by the
//! opcode's own completion event. Completion events that name a connection
//! handle only resolve an entry issued for that handle. Each entry is
//! resolved exactly once.

use crate::constants::{MAX_COMMAND_PARAMS, MAX_PENDING_OPCODES, MAX_PENDING_PER_OPCODE};
use crate::packet::{opcode, read_u16, read_u8};
use crate::{BluetoothAddress, HciError};
use heapless::{Deque, FnvIndexMap, Vec};

/// Upper bound on outstanding commands across all opcodes
pub const MAX_PENDING_TOTAL: usize = MAX_PENDING_OPCODES * MAX_PENDING_PER_OPCODE;

/// Read Local Version Information return parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LocalVersion {
    /// HCI version
    pub hci_version: u8,
    /// HCI revision
    pub hci_revision: u16,
    /// LMP/LL version
    pub lmp_version: u8,
    /// Company identifier of the controller manufacturer
    pub manufacturer: u16,
    /// LMP/LL subversion
    pub lmp_subversion: u16,
}

/// Decoded result of a successful command
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandResult {
    /// No return parameters beyond the status
    Empty,
    /// Read Local Version Information
    LocalVersion(LocalVersion),
    /// Read `BD_ADDR`
    BdAddr(BluetoothAddress),
    /// Read RSSI
    Rssi {
        /// Connection handle
        handle: u16,
        /// Signal strength in dBm
        rssi: i8,
    },
    /// Read LE Host Supported
    LeHostSupported {
        /// LE supported by host
        le: bool,
        /// Simultaneous LE and BR/EDR supported by host
        simultaneous: bool,
    },
    /// LE Read Remote Features Complete
    LeRemoteFeatures {
        /// Connection handle
        handle: u16,
        /// LE feature bitmask, little-endian
        features: [u8; 8],
    },
    /// Return parameters of a command without a dedicated decoder
    Raw(Vec<u8, MAX_COMMAND_PARAMS>),
}

impl CommandResult {
    /// Decode the return parameters of a successful Command Complete
    ///
    /// # Errors
    /// Returns `HciError::MalformedPacket` if the parameters are too short
    /// for the opcode's layout
    pub fn decode(op: u16, params: &[u8]) -> Result<Self, HciError> {
        match op {
            opcode::READ_LOCAL_VERSION => Ok(Self::LocalVersion(LocalVersion {
                hci_version: read_u8(params, 0)?,
                hci_revision: read_u16(params, 1)?,
                lmp_version: read_u8(params, 3)?,
                manufacturer: read_u16(params, 4)?,
                lmp_subversion: read_u16(params, 6)?,
            })),
            opcode::READ_BD_ADDR => {
                let bytes = params.get(0..6).ok_or(HciError::MalformedPacket)?;
                Ok(Self::BdAddr(BluetoothAddress::try_from(bytes)?))
            }
            opcode::READ_RSSI => Ok(Self::Rssi {
                handle: read_u16(params, 0)? & 0x0FFF,
                rssi: read_u8(params, 2)? as i8,
            }),
            opcode::READ_LE_HOST_SUPPORTED => Ok(Self::LeHostSupported {
                le: read_u8(params, 0)? != 0,
                simultaneous: read_u8(params, 1)? != 0,
            }),
            _ if params.is_empty() => Ok(Self::Empty),
            _ => {
                let mut raw = Vec::new();
                raw.extend_from_slice(params)
                    .map_err(|()| HciError::MalformedPacket)?;
                Ok(Self::Raw(raw))
            }
        }
    }
}

/// A completion waiting for its reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCommand<C> {
    /// Whoever is waiting on the reply
    pub completion: C,
    /// Time the command was submitted, in milliseconds
    pub issued_at: u64,
    /// Connection the command targets, if its completion event names one
    pub handle: Option<u16>,
}

/// Connection handle carried in the parameters of a command whose
/// completion event reports that handle
#[must_use]
pub fn target_handle(op: u16, params: &[u8]) -> Option<u16> {
    match op {
        opcode::DISCONNECT | opcode::LE_READ_REMOTE_FEATURES | opcode::LE_START_ENCRYPTION => {
            read_u16(params, 0).ok().map(|handle| handle & 0x0FFF)
        }
        _ => None,
    }
}

/// A pending entry matched with its reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved<C> {
    /// Opcode of the command
    pub opcode: u16,
    /// Whoever was waiting on the reply
    pub completion: C,
    /// Decoded result or command failure
    pub result: Result<CommandResult, HciError>,
}

type Fifo<C> = Deque<PendingCommand<C>, MAX_PENDING_PER_OPCODE>;

/// Per-opcode FIFO correlation of commands with their replies
#[derive(Debug)]
pub struct CommandCorrelator<C> {
    awaiting: FnvIndexMap<u16, Fifo<C>, MAX_PENDING_OPCODES>,
    follow_up: FnvIndexMap<u16, Fifo<C>, MAX_PENDING_OPCODES>,
}

impl<C> Default for CommandCorrelator<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> CommandCorrelator<C> {
    /// Create an empty correlator
    #[must_use]
    pub fn new() -> Self {
        Self {
            awaiting: FnvIndexMap::new(),
            follow_up: FnvIndexMap::new(),
        }
    }

    /// Register a completion for a command about to be written
    ///
    /// # Errors
    /// Returns `HciError::CapacityExceeded` if the opcode's FIFO or the opcode
    /// table is full
    pub fn enqueue(&mut self, op: u16, completion: C, now: u64) -> Result<(), HciError> {
        self.enqueue_for(op, None, completion, now)
    }

    /// Register a completion for a command aimed at one connection
    ///
    /// # Errors
    /// See [`enqueue`](Self::enqueue)
    pub fn enqueue_for(
        &mut self,
        op: u16,
        handle: Option<u16>,
        completion: C,
        now: u64,
    ) -> Result<(), HciError> {
        push_entry(
            &mut self.awaiting,
            op,
            PendingCommand {
                completion,
                issued_at: now,
                handle,
            },
        )
    }

    /// Whether [`enqueue`](Self::enqueue) would accept another entry for `op`
    #[must_use]
    pub fn can_enqueue(&self, op: u16) -> bool {
        has_room(&self.awaiting, op)
    }

    /// Match a Command Complete event against the oldest pending entry
    ///
    /// # Errors
    /// Returns `HciError::UnsolicitedEvent` if nothing is waiting on `op`
    pub fn on_complete(
        &mut self,
        op: u16,
        status: u8,
        return_params: &[u8],
    ) -> Result<Resolved<C>, HciError> {
        let entry = pop_entry(&mut self.awaiting, op).ok_or(HciError::UnsolicitedEvent { opcode: op })?;
        let result = if status == 0 {
            CommandResult::decode(op, return_params)
        } else {
            Err(HciError::CommandFailure { opcode: op, status })
        };
        Ok(Resolved {
            opcode: op,
            completion: entry.completion,
            result,
        })
    }

    /// Match a Command Status event against the oldest pending entry
    ///
    /// A failing status resolves the entry. A successful one moves it to the
    /// follow-up FIFO and returns `Ok(None)`.
    ///
    /// If the follow-up FIFO has no room the entry is resolved with
    /// `HciError::CapacityExceeded` instead.
    ///
    /// # Errors
    /// Returns `HciError::UnsolicitedEvent` if nothing is waiting on `op`
    pub fn on_status(&mut self, op: u16, status: u8) -> Result<Option<Resolved<C>>, HciError> {
        let entry = pop_entry(&mut self.awaiting, op).ok_or(HciError::UnsolicitedEvent { opcode: op })?;
        let failure = if status != 0 {
            HciError::CommandFailure { opcode: op, status }
        } else if has_room(&self.follow_up, op) {
            push_entry(&mut self.follow_up, op, entry)?;
            return Ok(None);
        } else {
            HciError::CapacityExceeded
        };
        Ok(Some(Resolved {
            opcode: op,
            completion: entry.completion,
            result: Err(failure),
        }))
    }

    /// Take the oldest entry waiting on `op`'s follow-up event
    pub fn take_follow_up(&mut self, op: u16) -> Option<C> {
        pop_entry(&mut self.follow_up, op).map(|entry| entry.completion)
    }

    /// Take the oldest entry waiting on `op`'s follow-up event for `handle`.
    /// Entries for other connections keep their place.
    pub fn take_follow_up_for(&mut self, op: u16, handle: u16) -> Option<C> {
        let fifo = self.follow_up.get_mut(&op)?;
        let position = fifo.iter().position(|entry| entry.handle == Some(handle))?;
        let mut taken = None;
        for index in 0..fifo.len() {
            let Some(entry) = fifo.pop_front() else {
                break;
            };
            if index == position {
                taken = Some(entry.completion);
            } else {
                fifo.push_back(entry).ok();
            }
        }
        if fifo.is_empty() {
            self.follow_up.remove(&op);
        }
        taken
    }

    /// Number of entries waiting on a reply or follow-up for `op`
    #[must_use]
    pub fn pending(&self, op: u16) -> usize {
        self.awaiting.get(&op).map_or(0, Deque::len) + self.follow_up.get(&op).map_or(0, Deque::len)
    }

    /// True when nothing is outstanding
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.awaiting.is_empty() && self.follow_up.is_empty()
    }

    /// Remove every entry issued at or before `now - timeout_ms`
    pub fn expire(&mut self, now: u64, timeout_ms: u64) -> Vec<(u16, C), MAX_PENDING_TOTAL> {
        let mut expired = Vec::new();
        if now < timeout_ms {
            return expired;
        }
        let deadline = now - timeout_ms;
        for table in [&mut self.awaiting, &mut self.follow_up] {
            let opcodes: Vec<u16, MAX_PENDING_OPCODES> = table.keys().copied().collect();
            for op in opcodes {
                while table
                    .get(&op)
                    .and_then(Deque::front)
                    .is_some_and(|entry| entry.issued_at <= deadline)
                {
                    if let Some(entry) = pop_entry(table, op) {
                        expired.push((op, entry.completion)).ok();
                    }
                }
            }
        }
        expired
    }

    /// Remove every outstanding entry, oldest first per opcode
    pub fn drain(&mut self) -> Vec<(u16, C), MAX_PENDING_TOTAL> {
        let mut drained = Vec::new();
        for table in [&mut self.awaiting, &mut self.follow_up] {
            for (op, fifo) in table.iter_mut() {
                while let Some(entry) = fifo.pop_front() {
                    drained.push((*op, entry.completion)).ok();
                }
            }
            table.clear();
        }
        drained
    }
}

fn push_entry<C>(
    table: &mut FnvIndexMap<u16, Fifo<C>, MAX_PENDING_OPCODES>,
    op: u16,
    entry: PendingCommand<C>,
) -> Result<(), HciError> {
    if let Some(fifo) = table.get_mut(&op) {
        return fifo.push_back(entry).map_err(|_| HciError::CapacityExceeded);
    }
    let mut fifo = Fifo::new();
    fifo.push_back(entry).map_err(|_| HciError::CapacityExceeded)?;
    table
        .insert(op, fifo)
        .map(|_| ())
        .map_err(|_| HciError::CapacityExceeded)
}

fn has_room<C>(table: &FnvIndexMap<u16, Fifo<C>, MAX_PENDING_OPCODES>, op: u16) -> bool {
    match table.get(&op) {
        Some(fifo) => !fifo.is_full(),
        None => table.len() < table.capacity(),
    }
}

fn pop_entry<C>(
    table: &mut FnvIndexMap<u16, Fifo<C>, MAX_PENDING_OPCODES>,
    op: u16,
) -> Option<PendingCommand<C>> {
    let fifo = table.get_mut(&op)?;
    let entry = fifo.pop_front();
    if fifo.is_empty() {
        table.remove(&op);
    }
    entry
}
