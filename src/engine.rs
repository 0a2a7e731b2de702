//! HCI engine
//!
//! [`HciEngine`] is the protocol core. It owns the adapter driver and every
//! piece of state: the command correlator, the ACL reassembler, the device and
//! connection registries and the activation state machine. It performs no
//! I/O of its own and never blocks:
//!
//! - inbound frames are fed with [`HciEngine::on_bytes`]
//! - time advances with [`HciEngine::on_tick`], which also polls adapter power
//! - operations return a [`Ticket`]; their result is collected later with
//!   [`HciEngine::take_outcome`]
//! - unsolicited happenings are queued as [`EngineEvent`]s for
//!   [`HciEngine::poll_event`]
//!
//! [`Host`](crate::Host) wraps an engine with async waiting for applications
//! running on an executor.
//!
//! ## Activation
//!
//! When the adapter reports power the engine installs its socket filter and
//! issues Set Event Mask, LE Set Event Mask, Read Local Version, Read
//! `BD_ADDR` and Write LE Host Supported together. Once all five succeeded it
//! reads LE Host Supported back, then stops any scan or pending connection
//! left over from a previous owner, ignoring failures of those two. Finally
//! the HCI version is checked and the adapter becomes `Ready` or
//! `Unsupported`. Commands issued before that wait in a deferred queue.

mod events;

use crate::acl::{ATT_CID, AclReassembler, write_l2cap};
use crate::command::{CommandCorrelator, CommandResult, target_handle};
use crate::connection::{Connection, ConnectionInfo, ConnectionRegistry};
use crate::constants::{
    EVENT_MASK, EVENT_QUEUE_DEPTH, LE_EVENT_MASK, LE_HOST_SUPPORTED_ENABLE, LOCAL_HOST_TERMINATED,
    MAX_CONNECTIONS, MAX_DEFERRED_COMMANDS, MAX_OUTCOMES, MAX_PARKED_REQUESTS, MAX_SCAN_RESULTS,
};
use crate::device::{AdvertisingReport, Device, DeviceRegistry};
use crate::driver::AdapterDriver;
use crate::gatt::{AttPdu, GattAction, GattActions};
use crate::packet::{CommandParams, PacketType, SocketFilter, encode_command, opcode};
use crate::{
    AdapterState, AddressType, BluetoothAddress, EngineOptions, HciError, LocalAdapterInfo,
};
use heapless::{Deque, FnvIndexMap, Vec};

/// Handle to the result of an engine operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Ticket(u32);

/// Successful result of an engine operation
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome {
    /// A command completed
    Command(CommandResult),
    /// A connection created with [`HciEngine::create_le_connection`] is up
    Connected(ConnectionInfo),
    /// A link closed by [`HciEngine::disconnect`] is down
    Disconnected {
        /// Connection handle
        handle: u16,
        /// Reason reported by the controller
        reason: u8,
    },
    /// Addresses heard during a [`HciEngine::scan`]
    Scan(Vec<BluetoothAddress, MAX_SCAN_RESULTS>),
    /// Response PDU of an attribute request
    Att(AttPdu),
}

/// Something that happened without being asked for
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EngineEvent {
    /// Adapter state moved
    StateChanged(AdapterState),
    /// Activation stopped short of `Ready`
    ActivationFailed(HciError),
    /// An advertising report arrived
    Discovered {
        /// The raw report
        report: AdvertisingReport,
        /// The device after merging the report
        device: Device,
    },
    /// A link came up
    Connected(ConnectionInfo),
    /// A link's parameters changed
    ConnectionUpdated {
        /// Connection handle
        handle: u16,
        /// Connection interval (units of 1.25 ms)
        interval: u16,
        /// Peripheral latency
        latency: u16,
        /// Supervision timeout (units of 10 ms)
        supervision_timeout: u16,
    },
    /// A link went down
    Disconnected {
        /// Connection handle
        handle: u16,
        /// Peer address, if known
        address: Option<BluetoothAddress>,
        /// Disconnect reason code
        reason: u8,
    },
    /// A subscribed attribute changed value
    Notification {
        /// Connection handle
        handle: u16,
        /// Attribute handle
        attribute: u16,
        /// New value
        value: AttPdu,
        /// Sent as an indication (already confirmed)
        indication: bool,
    },
    /// An attribute request needs an encrypted link; it is held until
    /// encryption changes on this connection
    SecurityUpgradeRequired {
        /// Connection handle
        handle: u16,
        /// ATT error code returned by the peer
        code: u8,
    },
    /// Link encryption changed
    EncryptionChanged {
        /// Connection handle
        handle: u16,
        /// Whether the link is now encrypted
        enabled: bool,
    },
    /// The controller reported a hardware error
    HardwareError(u8),
    /// The transport failed
    TransportFault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActivationStep {
    SetEventMask,
    SetLeEventMask,
    ReadLocalVersion,
    ReadBdAddr,
    WriteLeHostSupported,
    ReadLeHostSupported,
    StopScan,
    CancelConnect,
}

impl ActivationStep {
    fn bit(self) -> u8 {
        1 << self as u8
    }

    /// Cleanup steps whose failure does not stop activation
    fn best_effort(self) -> bool {
        matches!(self, Self::StopScan | Self::CancelConnect)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanStage {
    Parameters,
    Enable,
}

/// Who is waiting on a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Completion {
    Caller(Ticket),
    Activation {
        generation: u16,
        step: ActivationStep,
    },
    Scan {
        ticket: Ticket,
        stage: ScanStage,
    },
    Discard,
}

#[derive(Debug, Default)]
struct Activation {
    generation: u16,
    pending: u8,
}

#[derive(Debug)]
struct DeferredCommand {
    opcode: u16,
    params: CommandParams,
    completion: Completion,
    queued_at: u64,
}

#[derive(Debug)]
struct ParkedRequest {
    address: BluetoothAddress,
    ticket: Ticket,
    pdu: AttPdu,
    parked_at: u64,
}

#[derive(Debug)]
struct ScanState {
    ticket: Ticket,
    duration_ms: u64,
    deadline: Option<u64>,
    results: Vec<BluetoothAddress, MAX_SCAN_RESULTS>,
}

/// Sans-IO raw HCI engine for one LE adapter
pub struct HciEngine<D: AdapterDriver> {
    driver: D,
    options: EngineOptions,
    state: AdapterState,
    powered: bool,
    now: u64,
    last_poll: Option<u64>,
    local_info: LocalAdapterInfo,
    activation: Activation,
    correlator: CommandCorrelator<Completion>,
    deferred: Deque<DeferredCommand, MAX_DEFERRED_COMMANDS>,
    reassembler: AclReassembler,
    devices: DeviceRegistry,
    connections: ConnectionRegistry<Ticket>,
    parked: Vec<ParkedRequest, MAX_PARKED_REQUESTS>,
    scan: Option<ScanState>,
    outcomes: FnvIndexMap<Ticket, Result<Outcome, HciError>, MAX_OUTCOMES>,
    events: Deque<EngineEvent, EVENT_QUEUE_DEPTH>,
    ticket_seq: u32,
}

impl<D: AdapterDriver> HciEngine<D> {
    /// Create an engine around a driver. Nothing is written until
    /// [`start`](Self::start).
    pub fn new(driver: D, options: EngineOptions) -> Self {
        Self {
            driver,
            options,
            state: AdapterState::Down,
            powered: false,
            now: 0,
            last_poll: None,
            local_info: LocalAdapterInfo::default(),
            activation: Activation::default(),
            correlator: CommandCorrelator::new(),
            deferred: Deque::new(),
            reassembler: AclReassembler::new(),
            devices: DeviceRegistry::new(),
            connections: ConnectionRegistry::new(),
            parked: Vec::new(),
            scan: None,
            outcomes: FnvIndexMap::new(),
            events: Deque::new(),
            ticket_seq: 0,
        }
    }

    /// Bind and start the transport, then poll adapter power once
    ///
    /// # Errors
    /// Returns `HciError::TransportFault` if the driver cannot bind or start
    pub fn start(&mut self) -> Result<(), HciError> {
        self.driver.bind(self.options.device_index).map_err(|_| {
            error!("[ENGINE] bind to adapter {} failed", self.options.device_index);
            HciError::TransportFault
        })?;
        self.driver.start().map_err(|_| {
            error!("[ENGINE] transport start failed");
            HciError::TransportFault
        })?;
        info!("[ENGINE] bound to adapter {}", self.options.device_index);
        self.last_poll = Some(self.now);
        self.poll_power();
        Ok(())
    }

    /// Advance time: poll adapter power when due, expire commands and attribute
    /// requests that waited too long, and finish a scan whose time is up
    pub fn on_tick(&mut self, now: u64) {
        self.now = now;

        let interval = self.options.poll_interval_ms;
        if self
            .last_poll
            .is_some_and(|last| now.saturating_sub(last) >= interval)
        {
            self.last_poll = Some(now);
            self.poll_power();
        }

        if let Some(timeout) = self.options.command_timeout_ms {
            self.expire_commands(timeout);
            self.expire_deferred(timeout);
            self.expire_parked(timeout);
            self.expire_att(timeout);
        }
        self.check_scan_deadline();
    }

    /// Feed one inbound HCI frame, packet type byte included
    ///
    /// Malformed or unexpected frames are logged and dropped.
    pub fn on_bytes(&mut self, frame: &[u8]) {
        let Some(&kind) = frame.first() else {
            return;
        };
        let result = match PacketType::from_u8(kind) {
            Some(PacketType::Event) => self.handle_event(frame),
            Some(PacketType::AclData) => self.handle_acl(&frame[1..]),
            Some(_) => {
                trace!("[ENGINE] ignoring packet type {:#x}", kind);
                Ok(())
            }
            None => {
                debug!("[ENGINE] unknown packet type {:#x}", kind);
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("[ENGINE] dropped frame: {:?}", e);
        }
    }

    /// The transport reported an unrecoverable error: report it and tear the
    /// adapter state down. The next power poll activates again.
    pub fn on_adapter_error(&mut self) {
        error!("[ENGINE] transport error");
        self.push_event(EngineEvent::TransportFault);
        self.deactivate();
    }

    /// Current adapter state
    pub fn state(&self) -> AdapterState {
        self.state
    }

    /// Why the adapter is `Unsupported`, if it is
    pub fn activation_error(&self) -> Option<HciError> {
        (self.state == AdapterState::Unsupported).then(|| self.unsupported())
    }

    /// Information collected during activation
    pub fn local_info(&self) -> &LocalAdapterInfo {
        &self.local_info
    }

    /// Engine configuration
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Look up a discovered or connected device
    pub fn device(&self, address: &BluetoothAddress) -> Option<&Device> {
        self.devices.get(address)
    }

    /// Every known device
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    /// Look up a live connection
    pub fn connection(&self, handle: u16) -> Option<&Connection<Ticket>> {
        self.connections.get(handle)
    }

    /// Whether a [`scan`](Self::scan) is in progress
    pub fn is_scanning(&self) -> bool {
        self.scan.is_some()
    }

    /// The adapter driver
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// The adapter driver, mutably
    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Collect the result of an operation, if it has finished
    pub fn take_outcome(&mut self, ticket: Ticket) -> Option<Result<Outcome, HciError>> {
        self.outcomes.remove(&ticket)
    }

    /// Take the oldest queued event
    pub fn poll_event(&mut self) -> Option<EngineEvent> {
        self.events.pop_front()
    }

    /// Send an arbitrary command. The outcome is the decoded Command Complete
    /// return parameters.
    ///
    /// # Errors
    /// - `HciError::ProtocolVersionUnsupported` or `HciError::LeUnsupported`
    ///   if the adapter is unsupported
    /// - `HciError::InvalidParameter` if `params` exceeds 255 bytes
    /// - `HciError::CapacityExceeded` if no more commands can wait
    /// - `HciError::TransportFault` if the frame could not be written
    pub fn send_command(&mut self, opcode: u16, params: &[u8]) -> Result<Ticket, HciError> {
        let ticket = self.next_ticket();
        self.submit(opcode, params, Completion::Caller(ticket))?;
        Ok(ticket)
    }

    /// Read the RSSI of a connection
    ///
    /// # Errors
    /// See [`send_command`](Self::send_command)
    pub fn read_rssi(&mut self, handle: u16) -> Result<Ticket, HciError> {
        self.send_command(opcode::READ_RSSI, &handle.to_le_bytes())
    }

    /// Apply the configured scan parameters
    ///
    /// # Errors
    /// See [`send_command`](Self::send_command)
    pub fn set_scan_parameters(&mut self) -> Result<Ticket, HciError> {
        let params = self.options.scan.to_params();
        self.send_command(opcode::LE_SET_SCAN_PARAMETERS, &params)
    }

    /// Start or stop LE scanning
    ///
    /// # Errors
    /// See [`send_command`](Self::send_command)
    pub fn set_scan_enabled(
        &mut self,
        enabled: bool,
        filter_duplicates: bool,
    ) -> Result<Ticket, HciError> {
        self.send_command(
            opcode::LE_SET_SCAN_ENABLE,
            &[u8::from(enabled), u8::from(filter_duplicates)],
        )
    }

    /// Scan for `duration_ms` and collect the addresses heard. Scanning
    /// starts with the configured parameters and is stopped once the time is
    /// up; the outcome is [`Outcome::Scan`].
    ///
    /// # Errors
    /// `HciError::CapacityExceeded` if a scan is already running, otherwise
    /// see [`send_command`](Self::send_command)
    pub fn scan(&mut self, duration_ms: u64) -> Result<Ticket, HciError> {
        if self.scan.is_some() {
            return Err(HciError::CapacityExceeded);
        }
        let ticket = self.next_ticket();
        self.scan = Some(ScanState {
            ticket,
            duration_ms,
            deadline: None,
            results: Vec::new(),
        });

        let params = self.options.scan.to_params();
        let enable = [0x01, u8::from(self.options.scan.filter_duplicates)];
        let submitted = self
            .submit(
                opcode::LE_SET_SCAN_PARAMETERS,
                &params,
                Completion::Scan {
                    ticket,
                    stage: ScanStage::Parameters,
                },
            )
            .and_then(|()| {
                self.submit(
                    opcode::LE_SET_SCAN_ENABLE,
                    &enable,
                    Completion::Scan {
                        ticket,
                        stage: ScanStage::Enable,
                    },
                )
            });
        if let Err(e) = submitted {
            self.scan = None;
            return Err(e);
        }
        info!("[ENGINE] scanning for {} ms", duration_ms);
        Ok(ticket)
    }

    /// Initiate an LE connection. The outcome is [`Outcome::Connected`] once
    /// the controller reports the link.
    ///
    /// # Errors
    /// See [`send_command`](Self::send_command)
    pub fn create_le_connection(
        &mut self,
        address: BluetoothAddress,
        address_type: AddressType,
    ) -> Result<Ticket, HciError> {
        let params = self.options.connection.to_params(address, address_type);
        self.send_command(opcode::LE_CREATE_CONNECTION, &params)
    }

    /// Cancel a pending [`create_le_connection`](Self::create_le_connection)
    ///
    /// # Errors
    /// See [`send_command`](Self::send_command)
    pub fn cancel_le_connection(&mut self) -> Result<Ticket, HciError> {
        self.send_command(opcode::LE_CREATE_CONNECTION_CANCEL, &[])
    }

    /// Close a link. The outcome is [`Outcome::Disconnected`].
    ///
    /// # Errors
    /// `HciError::UnknownConnection` if no such link exists, otherwise see
    /// [`send_command`](Self::send_command)
    pub fn disconnect(&mut self, handle: u16, reason: u8) -> Result<Ticket, HciError> {
        if self.connections.get(handle).is_none() {
            return Err(HciError::UnknownConnection { handle });
        }
        let h = handle.to_le_bytes();
        self.send_command(opcode::DISCONNECT, &[h[0], h[1], reason])
    }

    /// Read the peer's LE features. The outcome is
    /// [`CommandResult::LeRemoteFeatures`].
    ///
    /// # Errors
    /// See [`send_command`](Self::send_command)
    pub fn read_le_remote_features(&mut self, handle: u16) -> Result<Ticket, HciError> {
        self.send_command(opcode::LE_READ_REMOTE_FEATURES, &handle.to_le_bytes())
    }

    /// Encrypt a link with a long term key. The outcome arrives with the
    /// Encryption Change event.
    ///
    /// # Errors
    /// See [`send_command`](Self::send_command)
    pub fn start_encryption(
        &mut self,
        handle: u16,
        random: [u8; 8],
        ediv: u16,
        ltk: [u8; 16],
    ) -> Result<Ticket, HciError> {
        let mut params = [0u8; 28];
        params[0..2].copy_from_slice(&handle.to_le_bytes());
        params[2..10].copy_from_slice(&random);
        params[10..12].copy_from_slice(&ediv.to_le_bytes());
        params[12..28].copy_from_slice(&ltk);
        self.send_command(opcode::LE_START_ENCRYPTION, &params)
    }

    /// Send an attribute request to a device. If the device has no usable link
    /// yet the request waits until one comes up. The outcome is
    /// [`Outcome::Att`].
    ///
    /// # Errors
    /// - `HciError::InvalidParameter` for an empty PDU
    /// - `HciError::CapacityExceeded` if the request cannot be queued
    pub fn gatt_request(
        &mut self,
        address: BluetoothAddress,
        pdu: AttPdu,
    ) -> Result<Ticket, HciError> {
        let ready = self
            .devices
            .get(&address)
            .filter(|device| device.link_ready())
            .and_then(|device| device.handle);
        if let Some(handle) = ready {
            return self.gatt_request_on(handle, pdu);
        }

        if pdu.is_empty() {
            return Err(HciError::InvalidParameter);
        }
        let ticket = self.next_ticket();
        self.parked
            .push(ParkedRequest {
                address,
                ticket,
                pdu,
                parked_at: self.now,
            })
            .map_err(|_| HciError::CapacityExceeded)?;
        debug!("[GATT] request parked until link is ready");
        Ok(ticket)
    }

    /// Send an attribute request on a connection
    ///
    /// # Errors
    /// - `HciError::UnknownConnection` if no such link exists
    /// - `HciError::CapacityExceeded` if the request queue is full
    /// - `HciError::TransportFault` if the request could not be written
    pub fn gatt_request_on(&mut self, handle: u16, pdu: AttPdu) -> Result<Ticket, HciError> {
        let ticket = self.next_ticket();
        self.submit_att(handle, ticket, pdu)?;
        Ok(ticket)
    }

    /// Report value changes of an attribute as [`EngineEvent::Notification`]
    ///
    /// # Errors
    /// `HciError::UnknownConnection` or `HciError::CapacityExceeded`
    pub fn subscribe(&mut self, handle: u16, attribute: u16) -> Result<(), HciError> {
        self.connections
            .get_mut(handle)
            .ok_or(HciError::UnknownConnection { handle })?
            .gatt
            .subscribe(attribute)
    }

    /// Stop reporting value changes of an attribute. Returns whether a
    /// subscription existed.
    ///
    /// # Errors
    /// `HciError::UnknownConnection` if no such link exists
    pub fn unsubscribe(&mut self, handle: u16, attribute: u16) -> Result<bool, HciError> {
        Ok(self
            .connections
            .get_mut(handle)
            .ok_or(HciError::UnknownConnection { handle })?
            .gatt
            .unsubscribe(attribute))
    }

    fn next_ticket(&mut self) -> Ticket {
        let ticket = Ticket(self.ticket_seq);
        self.ticket_seq = self.ticket_seq.wrapping_add(1);
        ticket
    }

    /// Write now when ready, wait in the deferred queue otherwise
    fn submit(&mut self, op: u16, params: &[u8], completion: Completion) -> Result<(), HciError> {
        match self.state {
            AdapterState::Ready => self.write_command(op, params, completion),
            AdapterState::Unsupported => Err(self.unsupported()),
            AdapterState::Down | AdapterState::Activating => {
                let params = CommandParams::from_slice(params).map_err(|()| HciError::InvalidParameter)?;
                self.deferred
                    .push_back(DeferredCommand {
                        opcode: op,
                        params,
                        completion,
                        queued_at: self.now,
                    })
                    .map_err(|_| HciError::CapacityExceeded)?;
                debug!("[CMD] {:#x} deferred until adapter is ready", op);
                Ok(())
            }
        }
    }

    fn write_command(
        &mut self,
        op: u16,
        params: &[u8],
        completion: Completion,
    ) -> Result<(), HciError> {
        let frame = encode_command(op, params)?;
        if !self.correlator.can_enqueue(op) {
            warn!("[CMD] too many commands pending for {:#x}", op);
            return Err(HciError::CapacityExceeded);
        }
        if self.driver.write(&frame).is_err() {
            error!("[CMD] write of {:#x} failed", op);
            self.push_event(EngineEvent::TransportFault);
            return Err(HciError::TransportFault);
        }
        trace!("[CMD] sent {:#x} ({} bytes)", op, params.len());
        self.correlator
            .enqueue_for(op, target_handle(op, params), completion, self.now)
    }

    /// Deliver the result of a command to whoever waits on it
    fn complete(&mut self, completion: Completion, op: u16, result: Result<Outcome, HciError>) {
        match completion {
            Completion::Caller(ticket) => self.store_outcome(ticket, result),
            Completion::Activation { generation, step } => {
                self.on_activation_step(generation, step, result);
            }
            Completion::Scan { ticket, stage } => self.on_scan_step(ticket, stage, result),
            Completion::Discard => {
                if let Err(e) = result {
                    debug!("[CMD] {:#x} failed: {:?}", op, e);
                }
            }
        }
    }

    fn store_outcome(&mut self, ticket: Ticket, result: Result<Outcome, HciError>) {
        if self.outcomes.len() == self.outcomes.capacity() && !self.outcomes.contains_key(&ticket)
        {
            let oldest = self.outcomes.keys().next().copied();
            if let Some(oldest) = oldest {
                warn!("[ENGINE] dropping unclaimed outcome {:?}", oldest);
                self.outcomes.remove(&oldest);
            }
        }
        self.outcomes.insert(ticket, result).ok();
    }

    fn push_event(&mut self, event: EngineEvent) {
        if self.events.is_full() {
            warn!("[ENGINE] event queue full, dropping oldest");
            self.events.pop_front();
        }
        self.events.push_back(event).ok();
    }

    fn set_state(&mut self, state: AdapterState) {
        if self.state != state {
            info!("[ENGINE] state {:?} -> {:?}", self.state, state);
            self.state = state;
            self.push_event(EngineEvent::StateChanged(state));
        }
    }

    fn unsupported(&self) -> HciError {
        let version = self.local_info.hci_version.unwrap_or_default();
        if version < self.options.min_hci_version {
            HciError::ProtocolVersionUnsupported { version }
        } else {
            HciError::LeUnsupported
        }
    }

    fn poll_power(&mut self) {
        let powered = self.driver.is_powered();
        if powered && !self.powered {
            info!("[ENGINE] adapter powered");
            self.powered = true;
            self.start_activation();
        } else if !powered && self.powered {
            info!("[ENGINE] adapter lost power");
            self.deactivate();
        }
    }

    fn start_activation(&mut self) {
        self.activation.generation = self.activation.generation.wrapping_add(1);
        self.activation.pending = 0;
        self.local_info = LocalAdapterInfo::default();
        self.set_state(AdapterState::Activating);

        if self.driver.set_filter(&SocketFilter::le_default()).is_err() {
            self.fail_activation(HciError::TransportFault);
            return;
        }

        let steps: [(ActivationStep, u16, &[u8]); 5] = [
            (ActivationStep::SetEventMask, opcode::SET_EVENT_MASK, &EVENT_MASK),
            (ActivationStep::SetLeEventMask, opcode::LE_SET_EVENT_MASK, &LE_EVENT_MASK),
            (ActivationStep::ReadLocalVersion, opcode::READ_LOCAL_VERSION, &[]),
            (ActivationStep::ReadBdAddr, opcode::READ_BD_ADDR, &[]),
            (
                ActivationStep::WriteLeHostSupported,
                opcode::WRITE_LE_HOST_SUPPORTED,
                &LE_HOST_SUPPORTED_ENABLE,
            ),
        ];
        for (step, op, params) in steps {
            if let Err(e) = self.issue_activation(step, op, params) {
                self.fail_activation(e);
                return;
            }
        }
    }

    fn issue_activation(
        &mut self,
        step: ActivationStep,
        op: u16,
        params: &[u8],
    ) -> Result<(), HciError> {
        self.activation.pending |= step.bit();
        let completion = Completion::Activation {
            generation: self.activation.generation,
            step,
        };
        self.write_command(op, params, completion)
    }

    fn on_activation_step(
        &mut self,
        generation: u16,
        step: ActivationStep,
        result: Result<Outcome, HciError>,
    ) {
        if generation != self.activation.generation || self.state != AdapterState::Activating {
            debug!("[ENGINE] stale activation reply {:?}", step as u8);
            return;
        }
        self.activation.pending &= !step.bit();

        if step.best_effort() {
            if let Err(e) = result {
                debug!("[ENGINE] cleanup step {} failed: {:?}", step as u8, e);
            }
            if self.activation.pending == 0 {
                self.finish_activation();
            }
            return;
        }

        match result {
            Ok(Outcome::Command(CommandResult::LocalVersion(version))) => {
                self.local_info.hci_version = Some(version.hci_version);
                self.local_info.hci_revision = Some(version.hci_revision);
                self.local_info.lmp_version = Some(version.lmp_version);
                self.local_info.manufacturer = Some(version.manufacturer);
                self.local_info.lmp_subversion = Some(version.lmp_subversion);
            }
            Ok(Outcome::Command(CommandResult::BdAddr(address))) => {
                self.local_info.address = Some(address);
            }
            Ok(Outcome::Command(CommandResult::LeHostSupported { le, simultaneous })) => {
                self.local_info.le_supported = Some(le);
                self.local_info.simultaneous_le_host = Some(simultaneous);
            }
            Ok(_) => {}
            Err(e) => {
                self.fail_activation(e);
                return;
            }
        }

        let next = if step == ActivationStep::ReadLeHostSupported {
            self.issue_activation(ActivationStep::StopScan, opcode::LE_SET_SCAN_ENABLE, &[0x00, 0x00])
                .and_then(|()| {
                    self.issue_activation(
                        ActivationStep::CancelConnect,
                        opcode::LE_CREATE_CONNECTION_CANCEL,
                        &[],
                    )
                })
        } else if self.activation.pending == 0 {
            self.issue_activation(
                ActivationStep::ReadLeHostSupported,
                opcode::READ_LE_HOST_SUPPORTED,
                &[],
            )
        } else {
            Ok(())
        };
        if let Err(e) = next {
            self.fail_activation(e);
        }
    }

    fn finish_activation(&mut self) {
        let version = self.local_info.hci_version.unwrap_or_default();
        let le_disabled = self.local_info.le_supported == Some(false);
        if version < self.options.min_hci_version || le_disabled {
            let error = self.unsupported();
            error!("[ENGINE] adapter not usable: {:?}", error);
            self.push_event(EngineEvent::ActivationFailed(error));
            self.set_state(AdapterState::Unsupported);
            while let Some(command) = self.deferred.pop_front() {
                self.complete(command.completion, command.opcode, Err(error));
            }
            return;
        }

        self.set_state(AdapterState::Ready);
        while let Some(command) = self.deferred.pop_front() {
            if let Err(e) = self.write_command(command.opcode, &command.params, command.completion) {
                self.complete(command.completion, command.opcode, Err(e));
            }
        }
    }

    /// Give up on this activation. Power is treated as unseen so the next
    /// poll starts over.
    fn fail_activation(&mut self, error: HciError) {
        error!("[ENGINE] activation failed: {:?}", error);
        self.activation.pending = 0;
        self.powered = false;
        self.push_event(EngineEvent::ActivationFailed(error));
        self.set_state(AdapterState::Down);
    }

    fn deactivate(&mut self) {
        self.powered = false;
        self.activation.generation = self.activation.generation.wrapping_add(1);
        self.activation.pending = 0;

        for (op, completion) in self.correlator.drain() {
            self.complete(completion, op, Err(HciError::AdapterDown));
        }
        if let Some(scan) = self.scan.take() {
            self.store_outcome(scan.ticket, Err(HciError::AdapterDown));
        }

        let handles: Vec<u16, MAX_CONNECTIONS> =
            self.connections.iter().map(|connection| connection.handle).collect();
        for handle in handles {
            self.drop_connection(handle, LOCAL_HOST_TERMINATED, HciError::AdapterDown);
        }
        self.reassembler = AclReassembler::new();
        self.set_state(AdapterState::Down);
    }

    /// Evict a connection and fail its outstanding attribute requests
    fn drop_connection(&mut self, handle: u16, reason: u8, error: HciError) {
        self.reassembler.discard(handle);
        match self.connections.disconnect(handle, reason, &mut self.devices) {
            Ok(mut connection) => {
                for ticket in connection.gatt.drain() {
                    self.store_outcome(ticket, Err(error));
                }
                self.push_event(EngineEvent::Disconnected {
                    handle,
                    address: connection.address,
                    reason,
                });
            }
            Err(e) => debug!("[CONN] nothing to drop for {}: {:?}", handle, e),
        }
    }

    fn expire_commands(&mut self, timeout: u64) {
        for (op, completion) in self.correlator.expire(self.now, timeout) {
            warn!("[CMD] {:#x} timed out", op);
            if op == opcode::LE_CREATE_CONNECTION && self.state == AdapterState::Ready {
                if let Err(e) =
                    self.write_command(opcode::LE_CREATE_CONNECTION_CANCEL, &[], Completion::Discard)
                {
                    debug!("[CMD] connection cancel not sent: {:?}", e);
                }
            }
            self.complete(completion, op, Err(HciError::Timeout { opcode: op }));
        }
    }

    fn expire_deferred(&mut self, timeout: u64) {
        for _ in 0..self.deferred.len() {
            let Some(command) = self.deferred.pop_front() else {
                break;
            };
            if self.now.saturating_sub(command.queued_at) >= timeout {
                warn!("[CMD] deferred {:#x} timed out", command.opcode);
                let op = command.opcode;
                self.complete(command.completion, op, Err(HciError::Timeout { opcode: op }));
            } else {
                self.deferred.push_back(command).ok();
            }
        }
    }

    fn expire_parked(&mut self, timeout: u64) {
        let mut index = 0;
        while index < self.parked.len() {
            if self.now.saturating_sub(self.parked[index].parked_at) < timeout {
                index += 1;
                continue;
            }
            let request = self.parked.remove(index);
            let op = request.pdu.first().copied().map_or(0, u16::from);
            warn!("[GATT] parked request {:#x} timed out", op);
            self.store_outcome(request.ticket, Err(HciError::Timeout { opcode: op }));
        }
    }

    fn expire_att(&mut self, timeout: u64) {
        let now = self.now;
        let handles: Vec<u16, MAX_CONNECTIONS> =
            self.connections.iter().map(|connection| connection.handle).collect();
        for handle in handles {
            let actions = match self.connections.get_mut(handle) {
                Some(connection) => connection.gatt.expire(now, timeout),
                None => continue,
            };
            if !actions.is_empty() {
                self.apply_gatt_actions(handle, actions);
            }
        }
    }

    /// Send requests that were waiting for a link to `address`
    fn flush_parked(&mut self, address: BluetoothAddress, handle: u16) {
        let mut index = 0;
        while index < self.parked.len() {
            if self.parked[index].address != address {
                index += 1;
                continue;
            }
            let request = self.parked.remove(index);
            if let Err(e) = self.submit_att(handle, request.ticket, request.pdu) {
                self.store_outcome(request.ticket, Err(e));
            }
        }
    }

    fn on_scan_step(&mut self, ticket: Ticket, stage: ScanStage, result: Result<Outcome, HciError>) {
        let Some(scan) = self.scan.as_mut().filter(|scan| scan.ticket == ticket) else {
            return;
        };
        match result {
            Err(e) => {
                warn!("[ENGINE] scan setup failed: {:?}", e);
                self.scan = None;
                self.store_outcome(ticket, Err(e));
            }
            Ok(_) if stage == ScanStage::Enable => {
                scan.deadline = Some(self.now.saturating_add(scan.duration_ms));
            }
            Ok(_) => {}
        }
    }

    fn check_scan_deadline(&mut self) {
        let now = self.now;
        let due = self
            .scan
            .as_ref()
            .and_then(|scan| scan.deadline)
            .is_some_and(|deadline| now >= deadline);
        if !due {
            return;
        }
        if let Some(scan) = self.scan.take() {
            info!("[ENGINE] scan finished, {} devices heard", scan.results.len());
            if let Err(e) = self.submit(opcode::LE_SET_SCAN_ENABLE, &[0x00, 0x00], Completion::Discard)
            {
                warn!("[ENGINE] could not stop scanning: {:?}", e);
            }
            self.store_outcome(scan.ticket, Ok(Outcome::Scan(scan.results)));
        }
    }

    fn submit_att(&mut self, handle: u16, ticket: Ticket, pdu: AttPdu) -> Result<(), HciError> {
        let connection = self
            .connections
            .get_mut(handle)
            .ok_or(HciError::UnknownConnection { handle })?;
        let Some(pdu) = connection.gatt.submit(ticket, pdu)? else {
            trace!("[GATT] request queued on handle {}", handle);
            return Ok(());
        };
        if let Err(e) = self.send_att(handle, &pdu) {
            // The queue was idle, so the drained ticket is this request.
            if let Some(connection) = self.connections.get_mut(handle) {
                connection.gatt.drain();
            }
            return Err(e);
        }
        if let Some(connection) = self.connections.get_mut(handle) {
            connection.gatt.stamp(self.now);
        }
        Ok(())
    }

    fn send_att(&mut self, handle: u16, pdu: &[u8]) -> Result<(), HciError> {
        let driver = &mut self.driver;
        let result = write_l2cap(handle, ATT_CID, pdu, self.options.acl_mtu, |fragment| {
            driver.write(fragment).map_err(|_| HciError::TransportFault)
        });
        if result == Err(HciError::TransportFault) {
            self.push_event(EngineEvent::TransportFault);
        }
        result
    }

    fn apply_gatt_actions(&mut self, handle: u16, actions: GattActions<Ticket>) {
        for action in actions {
            match action {
                GattAction::Send(pdu) => {
                    if let Err(e) = self.send_att(handle, &pdu) {
                        self.fail_requests(handle, e);
                    }
                }
                GattAction::Resolve(ticket, result) => {
                    self.store_outcome(ticket, result.map(Outcome::Att));
                }
                GattAction::Notify {
                    attribute,
                    value,
                    indication,
                } => self.push_event(EngineEvent::Notification {
                    handle,
                    attribute,
                    value,
                    indication,
                }),
                GattAction::SecurityUpgradeRequired { code } => {
                    self.push_event(EngineEvent::SecurityUpgradeRequired { handle, code });
                }
            }
        }
        if let Some(connection) = self.connections.get_mut(handle) {
            connection.gatt.stamp(self.now);
        }
    }

    fn fail_requests(&mut self, handle: u16, error: HciError) {
        let tickets = match self.connections.get_mut(handle) {
            Some(connection) => connection.gatt.drain(),
            None => return,
        };
        for ticket in tickets {
            self.store_outcome(ticket, Err(error));
        }
    }
}
