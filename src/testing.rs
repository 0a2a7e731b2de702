//! Test doubles and frame builders shared by the unit tests

use crate::connection::Role;
use crate::driver::{AdapterDriver, Clock};
use crate::packet::{SocketFilter, event, opcode};
use crate::{BluetoothAddress, EngineEvent, HciEngine};
use core::cell::Cell;
use core::future::Future;
use heapless::Vec;

pub type Frame = Vec<u8, 300>;

pub const LOCAL_ADDRESS: BluetoothAddress =
    BluetoothAddress::new([0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
pub const PEER: BluetoothAddress = BluetoothAddress::new([0x01, 0x3B, 0x6A, 0x8D, 0x7C, 0xC4]);
pub const PEER_2: BluetoothAddress = BluetoothAddress::new([0x02, 0x3B, 0x6A, 0x8D, 0x7C, 0xC4]);
pub const PEER_3: BluetoothAddress = BluetoothAddress::new([0x03, 0x3B, 0x6A, 0x8D, 0x7C, 0xC4]);

/// Records everything the engine writes
#[derive(Debug, Default)]
pub struct MockDriver {
    pub powered: bool,
    pub fail_bind: bool,
    pub fail_writes: bool,
    pub bound: Option<u16>,
    pub started: bool,
    pub filter: Option<SocketFilter>,
    pub written: Vec<Vec<u8, 64>, 64>,
}

impl MockDriver {
    pub fn powered() -> Self {
        Self {
            powered: true,
            ..Self::default()
        }
    }

    pub fn unpowered() -> Self {
        Self::default()
    }

    /// Opcodes of the command frames written so far
    pub fn written_opcodes(&self) -> Vec<u16, 64> {
        self.written
            .iter()
            .filter(|frame| frame.first() == Some(&0x01))
            .map(|frame| u16::from_le_bytes([frame[1], frame[2]]))
            .collect()
    }

    /// Parameters of the last command written with `op`
    pub fn command_params(&self, op: u16) -> Option<&[u8]> {
        self.written
            .iter()
            .rev()
            .filter(|frame| frame.first() == Some(&0x01))
            .find(|frame| u16::from_le_bytes([frame[1], frame[2]]) == op)
            .map(|frame| &frame[4..])
    }

    /// ACL frames written so far, packet type byte included
    pub fn acl_frames(&self) -> impl Iterator<Item = &[u8]> {
        self.written
            .iter()
            .filter(|frame| frame.first() == Some(&0x02))
            .map(|frame| frame.as_slice())
    }
}

impl AdapterDriver for MockDriver {
    type Error = ();

    fn bind(&mut self, device_index: u16) -> Result<(), ()> {
        if self.fail_bind {
            return Err(());
        }
        self.bound = Some(device_index);
        Ok(())
    }

    fn start(&mut self) -> Result<(), ()> {
        self.started = true;
        Ok(())
    }

    fn set_filter(&mut self, filter: &SocketFilter) -> Result<(), ()> {
        self.filter = Some(*filter);
        Ok(())
    }

    fn write(&mut self, frame: &[u8]) -> Result<(), ()> {
        if self.fail_writes {
            return Err(());
        }
        if self.written.is_full() {
            self.written.remove(0);
        }
        self.written.push(Vec::from_slice(frame)?).map_err(|_| ())
    }

    fn is_powered(&mut self) -> bool {
        self.powered
    }
}

/// Clock whose sleeps advance time instantly and yield once
#[derive(Debug, Default)]
pub struct MockClock {
    now: Cell<u64>,
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }

    fn sleep_ms(&self, ms: u64) -> impl Future<Output = ()> {
        self.now.set(self.now.get() + ms);
        embassy_futures::yield_now()
    }
}

pub fn event_frame(code: u8, params: &[u8]) -> Frame {
    let mut frame = Frame::new();
    frame.extend_from_slice(&[0x04, code, params.len() as u8]).unwrap();
    frame.extend_from_slice(params).unwrap();
    frame
}

pub fn command_complete(op: u16, status: u8, return_params: &[u8]) -> Frame {
    let mut params: Vec<u8, 255> = Vec::new();
    params.push(0x01).unwrap();
    params.extend_from_slice(&op.to_le_bytes()).unwrap();
    params.push(status).unwrap();
    params.extend_from_slice(return_params).unwrap();
    event_frame(event::COMMAND_COMPLETE, &params)
}

pub fn command_status(op: u16, status: u8) -> Frame {
    let op = op.to_le_bytes();
    event_frame(event::COMMAND_STATUS, &[status, 0x01, op[0], op[1]])
}

pub fn le_meta(subevent: u8, params: &[u8]) -> Frame {
    let mut body: Vec<u8, 255> = Vec::new();
    body.push(subevent).unwrap();
    body.extend_from_slice(params).unwrap();
    event_frame(event::LE_META, &body)
}

pub fn le_connection_complete(
    status: u8,
    handle: u16,
    address: BluetoothAddress,
    role: Role,
) -> Frame {
    let h = handle.to_le_bytes();
    let mut params: Vec<u8, 18> = Vec::new();
    params
        .extend_from_slice(&[status, h[0], h[1], u8::from(role == Role::Peripheral), 0x01])
        .unwrap();
    params.extend_from_slice(address.as_bytes()).unwrap();
    params
        .extend_from_slice(&[0x18, 0x00, 0x00, 0x00, 0xC8, 0x00, 0x01])
        .unwrap();
    le_meta(event::LE_CONNECTION_COMPLETE, &params)
}

/// One report of an LE Advertising Report, without the report count
pub fn report_bytes(event_type: u8, address: BluetoothAddress, data: &[u8], rssi: i8) -> Vec<u8, 48> {
    let mut report = Vec::new();
    report.extend_from_slice(&[event_type, 0x01]).unwrap();
    report.extend_from_slice(address.as_bytes()).unwrap();
    report.push(data.len() as u8).unwrap();
    report.extend_from_slice(data).unwrap();
    report.push(rssi as u8).unwrap();
    report
}

pub fn advertising_report(event_type: u8, address: BluetoothAddress, data: &[u8], rssi: i8) -> Frame {
    let mut params: Vec<u8, 64> = Vec::new();
    params.push(0x01).unwrap();
    params
        .extend_from_slice(&report_bytes(event_type, address, data, rssi))
        .unwrap();
    le_meta(event::LE_ADVERTISING_REPORT, &params)
}

pub fn disconnection_complete(status: u8, handle: u16, reason: u8) -> Frame {
    let h = handle.to_le_bytes();
    event_frame(event::DISCONNECTION_COMPLETE, &[status, h[0], h[1], reason])
}

pub fn encryption_change(status: u8, handle: u16, enabled: bool) -> Frame {
    let h = handle.to_le_bytes();
    event_frame(event::ENCRYPTION_CHANGE, &[status, h[0], h[1], u8::from(enabled)])
}

/// ACL start fragment carrying the L2CAP header and the first `slice` bytes
pub fn acl_start(handle: u16, total: u16, cid: u16, slice: &[u8]) -> Frame {
    let mut frame = Frame::new();
    frame.push(0x02).unwrap();
    frame.extend_from_slice(&(handle | 0x2000).to_le_bytes()).unwrap();
    frame
        .extend_from_slice(&((slice.len() + 4) as u16).to_le_bytes())
        .unwrap();
    frame.extend_from_slice(&total.to_le_bytes()).unwrap();
    frame.extend_from_slice(&cid.to_le_bytes()).unwrap();
    frame.extend_from_slice(slice).unwrap();
    frame
}

pub fn acl_continuation(handle: u16, slice: &[u8]) -> Frame {
    let mut frame = Frame::new();
    frame.push(0x02).unwrap();
    frame.extend_from_slice(&(handle | 0x1000).to_le_bytes()).unwrap();
    frame
        .extend_from_slice(&(slice.len() as u16).to_le_bytes())
        .unwrap();
    frame.extend_from_slice(slice).unwrap();
    frame
}

/// A complete attribute PDU in a single ACL fragment
pub fn acl_att(handle: u16, pdu: &[u8]) -> Frame {
    acl_start(handle, pdu.len() as u16, 0x0004, pdu)
}

/// Replies to the five configuration commands of activation
pub fn answer_configuration<D: AdapterDriver>(engine: &mut HciEngine<D>, version: u8) {
    engine.on_bytes(&command_complete(opcode::SET_EVENT_MASK, 0, &[]));
    engine.on_bytes(&command_complete(opcode::LE_SET_EVENT_MASK, 0, &[]));
    engine.on_bytes(&command_complete(
        opcode::READ_LOCAL_VERSION,
        0,
        &[version, 0x00, 0x00, version, 0x0F, 0x00, 0x01, 0x00],
    ));
    engine.on_bytes(&command_complete(opcode::READ_BD_ADDR, 0, LOCAL_ADDRESS.as_bytes()));
    engine.on_bytes(&command_complete(opcode::WRITE_LE_HOST_SUPPORTED, 0, &[]));
}

/// Replies to every activation command of a started engine
pub fn complete_activation<D: AdapterDriver>(engine: &mut HciEngine<D>, version: u8) {
    answer_configuration(engine, version);
    engine.on_bytes(&command_complete(opcode::READ_LE_HOST_SUPPORTED, 0, &[0x01, 0x00]));
    engine.on_bytes(&command_complete(opcode::LE_SET_SCAN_ENABLE, 0, &[]));
    engine.on_bytes(&command_complete(opcode::LE_CREATE_CONNECTION_CANCEL, 0x0C, &[]));
}

/// Start an engine and run activation to completion, leaving no writes or
/// events behind
pub fn activate(engine: &mut HciEngine<MockDriver>, version: u8) {
    engine.start().unwrap();
    complete_activation(engine, version);
    engine.driver_mut().written.clear();
    drain_events(engine);
}

/// Report a central link to `address`
pub fn connect<D: AdapterDriver>(engine: &mut HciEngine<D>, handle: u16, address: BluetoothAddress) {
    engine.on_bytes(&le_connection_complete(0, handle, address, Role::Central));
}

pub fn drain_events<D: AdapterDriver>(engine: &mut HciEngine<D>) -> Vec<EngineEvent, 32> {
    let mut events = Vec::new();
    while let Some(event) = engine.poll_event() {
        events.push(event).unwrap();
    }
    events
}
