//! Async host API
//!
//! [`Host`] wraps an [`HciEngine`] for applications running on an async
//! executor. One task drives [`Host::run`], which feeds inbound frames and
//! clock ticks to the engine; any number of tasks call the operations below
//! and await their results.
//!
//! # Usage
//!
//! ```rust,no_run
//! use embassy_futures::select::select;
//! use hciwire::{AddressType, BluetoothAddress, EngineOptions, Host};
//! # use hciwire::{AdapterDriver, Clock, packet::SocketFilter};
//! # struct Socket;
//! # impl AdapterDriver for Socket {
//! #     type Error = ();
//! #     fn bind(&mut self, _: u16) -> Result<(), ()> { Ok(()) }
//! #     fn start(&mut self) -> Result<(), ()> { Ok(()) }
//! #     fn set_filter(&mut self, _: &SocketFilter) -> Result<(), ()> { Ok(()) }
//! #     fn write(&mut self, _: &[u8]) -> Result<(), ()> { Ok(()) }
//! #     fn is_powered(&mut self) -> bool { true }
//! # }
//! # struct Timer;
//! # impl Clock for Timer {
//! #     fn now_ms(&self) -> u64 { 0 }
//! #     async fn sleep_ms(&self, _: u64) {}
//! # }
//! # async fn example() -> Result<(), hciwire::HciError> {
//! let host = Host::new(Socket, EngineOptions::default());
//! host.start()?;
//!
//! let app = async {
//!     host.wait_ready().await?;
//!     let heard = host.scan(5_000).await?;
//!     if let Some(address) = heard.first() {
//!         let link = host.connect(*address, AddressType::Random).await?;
//!         let rssi = host.read_rssi(link.handle).await?;
//!     }
//!     Ok::<(), hciwire::HciError>(())
//! };
//! select(host.run(&Timer), app).await;
//! # Ok(())
//! # }
//! ```

use crate::command::CommandResult;
use crate::connection::ConnectionInfo;
use crate::constants::{
    EVENT_QUEUE_DEPTH, INBOUND_QUEUE_DEPTH, MAX_HCI_FRAME, MAX_SCAN_RESULTS, MAX_WAITERS,
    RUN_TICK_MS,
};
use crate::device::Device;
use crate::driver::{AdapterDriver, Clock};
use crate::gatt::AttPdu;
use crate::{
    AdapterState, AddressType, BluetoothAddress, EngineEvent, EngineOptions, HciEngine, HciError,
    LocalAdapterInfo, Outcome, Ticket,
};
use core::cell::RefCell;
use core::future::poll_fn;
use core::task::{Poll, Waker};
use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::waitqueue::MultiWakerRegistration;
use heapless::Vec;

/// One inbound HCI frame, packet type byte included
pub type InboundFrame = Vec<u8, MAX_HCI_FRAME>;

/// Async front end of an [`HciEngine`]
pub struct Host<D: AdapterDriver> {
    engine: Mutex<NoopRawMutex, RefCell<HciEngine<D>>>,
    inbound: Channel<NoopRawMutex, InboundFrame, INBOUND_QUEUE_DEPTH>,
    events: Channel<NoopRawMutex, EngineEvent, EVENT_QUEUE_DEPTH>,
    waiters: Mutex<NoopRawMutex, RefCell<MultiWakerRegistration<MAX_WAITERS>>>,
}

impl<D: AdapterDriver> Host<D> {
    /// Create a host around a driver
    pub fn new(driver: D, options: EngineOptions) -> Self {
        Self {
            engine: Mutex::new(RefCell::new(HciEngine::new(driver, options))),
            inbound: Channel::new(),
            events: Channel::new(),
            waiters: Mutex::new(RefCell::new(MultiWakerRegistration::new())),
        }
    }

    /// Bind and start the transport
    ///
    /// # Errors
    /// Returns `HciError::TransportFault` if the driver cannot bind or start
    pub fn start(&self) -> Result<(), HciError> {
        let result = self.with_engine(HciEngine::start);
        self.pump();
        result
    }

    /// Run a closure against the engine
    pub fn with_engine<R>(&self, f: impl FnOnce(&mut HciEngine<D>) -> R) -> R {
        self.engine.lock(|engine| f(&mut engine.borrow_mut()))
    }

    /// Drive the engine: deliver inbound frames and tick the clock. Never
    /// returns.
    pub async fn run<C: Clock>(&self, clock: &C) {
        loop {
            if let Either::First(frame) =
                select(self.inbound.receive(), clock.sleep_ms(RUN_TICK_MS)).await
            {
                self.with_engine(|engine| engine.on_bytes(&frame));
            }
            let now = clock.now_ms();
            self.with_engine(|engine| engine.on_tick(now));
            self.pump();
        }
    }

    /// Queue an inbound frame for [`run`](Self::run)
    ///
    /// # Errors
    /// Returns `HciError::MalformedPacket` if the frame exceeds the maximum
    /// HCI frame size
    pub async fn on_bytes(&self, frame: &[u8]) -> Result<(), HciError> {
        let frame = InboundFrame::from_slice(frame).map_err(|()| HciError::MalformedPacket)?;
        self.inbound.send(frame).await;
        Ok(())
    }

    /// Queue an inbound frame without waiting
    ///
    /// # Errors
    /// `HciError::MalformedPacket` for an oversized frame,
    /// `HciError::CapacityExceeded` if the inbound queue is full
    pub fn try_on_bytes(&self, frame: &[u8]) -> Result<(), HciError> {
        let frame = InboundFrame::from_slice(frame).map_err(|()| HciError::MalformedPacket)?;
        self.inbound
            .try_send(frame)
            .map_err(|_| HciError::CapacityExceeded)
    }

    /// Report a transport failure
    pub fn on_adapter_error(&self) {
        self.with_engine(HciEngine::on_adapter_error);
        self.pump();
    }

    /// Wait for the next engine event
    pub async fn next_event(&self) -> EngineEvent {
        self.events.receive().await
    }

    /// Take the next engine event, if any
    pub fn try_next_event(&self) -> Option<EngineEvent> {
        self.events.try_receive().ok()
    }

    /// Current adapter state
    pub fn state(&self) -> AdapterState {
        self.with_engine(|engine| engine.state())
    }

    /// Information collected during activation
    pub fn local_info(&self) -> LocalAdapterInfo {
        self.with_engine(|engine| *engine.local_info())
    }

    /// Snapshot of a known device
    pub fn device(&self, address: &BluetoothAddress) -> Option<Device> {
        self.with_engine(|engine| engine.device(address).cloned())
    }

    /// Wait until the adapter is ready for commands
    ///
    /// # Errors
    /// Returns `HciError::ProtocolVersionUnsupported` or
    /// `HciError::LeUnsupported` if activation found an unsupported controller
    pub async fn wait_ready(&self) -> Result<(), HciError> {
        poll_fn(|cx| {
            let (state, error) =
                self.with_engine(|engine| (engine.state(), engine.activation_error()));
            match state {
                AdapterState::Ready => Poll::Ready(Ok(())),
                AdapterState::Unsupported => {
                    Poll::Ready(Err(error.unwrap_or(HciError::LeUnsupported)))
                }
                AdapterState::Down | AdapterState::Activating => {
                    self.register(cx.waker());
                    Poll::Pending
                }
            }
        })
        .await
    }

    /// Wait for the outcome of an operation started through
    /// [`with_engine`](Self::with_engine)
    ///
    /// # Errors
    /// Returns the operation's error
    pub async fn wait_outcome(&self, ticket: Ticket) -> Result<Outcome, HciError> {
        poll_fn(|cx| match self.with_engine(|engine| engine.take_outcome(ticket)) {
            Some(result) => Poll::Ready(result),
            None => {
                self.register(cx.waker());
                Poll::Pending
            }
        })
        .await
    }

    /// Send a command and wait for its result
    ///
    /// # Errors
    /// Returns the submission error or the command's failure
    pub async fn send_command(&self, opcode: u16, params: &[u8]) -> Result<CommandResult, HciError> {
        let ticket = self.with_engine(|engine| engine.send_command(opcode, params))?;
        command_result(self.wait_outcome(ticket).await?)
    }

    /// Read the RSSI of a connection in dBm
    ///
    /// # Errors
    /// Returns the submission error or the command's failure
    pub async fn read_rssi(&self, handle: u16) -> Result<i8, HciError> {
        let ticket = self.with_engine(|engine| engine.read_rssi(handle))?;
        match command_result(self.wait_outcome(ticket).await?)? {
            CommandResult::Rssi { rssi, .. } => Ok(rssi),
            _ => Err(HciError::ProtocolViolation),
        }
    }

    /// Scan for `duration_ms` and return the addresses heard
    ///
    /// # Errors
    /// Returns the error of the scan setup
    pub async fn scan(
        &self,
        duration_ms: u64,
    ) -> Result<Vec<BluetoothAddress, MAX_SCAN_RESULTS>, HciError> {
        let ticket = self.with_engine(|engine| engine.scan(duration_ms))?;
        match self.wait_outcome(ticket).await? {
            Outcome::Scan(addresses) => Ok(addresses),
            _ => Err(HciError::ProtocolViolation),
        }
    }

    /// Connect to a peer and wait for the link
    ///
    /// # Errors
    /// Returns the submission error, the controller's failure, or
    /// `HciError::Timeout` if the link never came up
    pub async fn connect(
        &self,
        address: BluetoothAddress,
        address_type: AddressType,
    ) -> Result<ConnectionInfo, HciError> {
        let ticket = self.with_engine(|engine| engine.create_le_connection(address, address_type))?;
        match self.wait_outcome(ticket).await? {
            Outcome::Connected(info) => Ok(info),
            _ => Err(HciError::ProtocolViolation),
        }
    }

    /// Cancel a pending [`connect`](Self::connect)
    ///
    /// # Errors
    /// Returns the submission error or the command's failure
    pub async fn cancel_connect(&self) -> Result<(), HciError> {
        let ticket = self.with_engine(HciEngine::cancel_le_connection)?;
        self.wait_outcome(ticket).await.map(|_| ())
    }

    /// Close a link and wait until it is down. Returns the reason reported
    /// by the controller.
    ///
    /// # Errors
    /// Returns the submission error or the command's failure
    pub async fn disconnect(&self, handle: u16, reason: u8) -> Result<u8, HciError> {
        let ticket = self.with_engine(|engine| engine.disconnect(handle, reason))?;
        match self.wait_outcome(ticket).await? {
            Outcome::Disconnected { reason, .. } => Ok(reason),
            _ => Err(HciError::ProtocolViolation),
        }
    }

    /// Read the peer's LE feature bitmask
    ///
    /// # Errors
    /// Returns the submission error or the command's failure
    pub async fn read_le_remote_features(&self, handle: u16) -> Result<[u8; 8], HciError> {
        let ticket = self.with_engine(|engine| engine.read_le_remote_features(handle))?;
        match command_result(self.wait_outcome(ticket).await?)? {
            CommandResult::LeRemoteFeatures { features, .. } => Ok(features),
            _ => Err(HciError::ProtocolViolation),
        }
    }

    /// Encrypt a link and wait for the Encryption Change
    ///
    /// # Errors
    /// Returns the submission error or the controller's failure
    pub async fn start_encryption(
        &self,
        handle: u16,
        random: [u8; 8],
        ediv: u16,
        ltk: [u8; 16],
    ) -> Result<(), HciError> {
        let ticket =
            self.with_engine(|engine| engine.start_encryption(handle, random, ediv, ltk))?;
        self.wait_outcome(ticket).await.map(|_| ())
    }

    /// Send an attribute request to a device, waiting for its link if needed
    ///
    /// # Errors
    /// Returns the submission error, the peer's Error Response or the reason
    /// the link went away
    pub async fn gatt_request(
        &self,
        address: BluetoothAddress,
        pdu: AttPdu,
    ) -> Result<AttPdu, HciError> {
        let ticket = self.with_engine(|engine| engine.gatt_request(address, pdu))?;
        att_response(self.wait_outcome(ticket).await?)
    }

    /// Send an attribute request on a connection
    ///
    /// # Errors
    /// Returns the submission error, the peer's Error Response or the reason
    /// the link went away
    pub async fn gatt_request_on(&self, handle: u16, pdu: AttPdu) -> Result<AttPdu, HciError> {
        let ticket = self.with_engine(|engine| engine.gatt_request_on(handle, pdu))?;
        att_response(self.wait_outcome(ticket).await?)
    }

    /// Report value changes of an attribute as events
    ///
    /// # Errors
    /// `HciError::UnknownConnection` or `HciError::CapacityExceeded`
    pub fn subscribe(&self, handle: u16, attribute: u16) -> Result<(), HciError> {
        self.with_engine(|engine| engine.subscribe(handle, attribute))
    }

    /// Stop reporting value changes of an attribute
    ///
    /// # Errors
    /// `HciError::UnknownConnection` if no such link exists
    pub fn unsubscribe(&self, handle: u16, attribute: u16) -> Result<bool, HciError> {
        self.with_engine(|engine| engine.unsubscribe(handle, attribute))
    }

    fn register(&self, waker: &Waker) {
        self.waiters.lock(|waiters| waiters.borrow_mut().register(waker));
    }

    /// Forward queued engine events and wake everyone waiting on the engine
    fn pump(&self) {
        self.with_engine(|engine| {
            while let Some(event) = engine.poll_event() {
                if self.events.try_send(event).is_err() {
                    warn!("[ENGINE] event channel full, dropping event");
                }
            }
        });
        self.waiters.lock(|waiters| waiters.borrow_mut().wake());
    }
}

fn command_result(outcome: Outcome) -> Result<CommandResult, HciError> {
    match outcome {
        Outcome::Command(result) => Ok(result),
        _ => Err(HciError::ProtocolViolation),
    }
}

fn att_response(outcome: Outcome) -> Result<AttPdu, HciError> {
    match outcome {
        Outcome::Att(pdu) => Ok(pdu),
        _ => Err(HciError::ProtocolViolation),
    }
}
