//! Inbound event and ACL dispatch

use super::{Completion, EngineEvent, HciEngine, Outcome};
use crate::acl::L2capPdu;
use crate::command::CommandResult;
use crate::connection::{ConnectionInfo, Role};
use crate::constants::REMOTE_USER_TERMINATED;
use crate::device::AdvertisingReport;
use crate::driver::AdapterDriver;
use crate::eir::EirInfo;
use crate::packet::{EventPacket, event, opcode, read_u16, read_u8};
use crate::status::{self, SUCCESS};
use crate::{AddressType, BluetoothAddress, HciError};

impl<D: AdapterDriver> HciEngine<D> {
    pub(super) fn handle_event(&mut self, frame: &[u8]) -> Result<(), HciError> {
        let packet = EventPacket::from_frame(frame)?;
        let params = packet.params;
        match packet.code {
            event::COMMAND_COMPLETE => self.on_command_complete(params),
            event::COMMAND_STATUS => self.on_command_status(params),
            event::DISCONNECTION_COMPLETE => self.on_disconnection_complete(params),
            event::ENCRYPTION_CHANGE => self.on_encryption_change(params),
            event::HARDWARE_ERROR => {
                let code = read_u8(params, 0)?;
                error!("[ENGINE] controller hardware error {:#x}", code);
                self.push_event(EngineEvent::HardwareError(code));
                Ok(())
            }
            event::NUMBER_OF_COMPLETED_PACKETS => Ok(()),
            event::LE_META => self.on_le_meta(params),
            code => {
                trace!("[ENGINE] unhandled event {:#x}", code);
                Ok(())
            }
        }
    }

    pub(super) fn handle_acl(&mut self, fragment: &[u8]) -> Result<(), HciError> {
        match self.reassembler.push(fragment)? {
            Some(pdu) => self.deliver_l2cap(pdu),
            None => Ok(()),
        }
    }

    fn deliver_l2cap(&mut self, pdu: L2capPdu) -> Result<(), HciError> {
        let handle = pdu.handle;
        let connection = self
            .connections
            .get_mut(handle)
            .ok_or(HciError::UnknownConnection { handle })?;
        let actions = connection.gatt.push(pdu.cid, &pdu.payload);
        self.apply_gatt_actions(handle, actions);
        Ok(())
    }

    fn on_command_complete(&mut self, params: &[u8]) -> Result<(), HciError> {
        let op = read_u16(params, 1)?;
        if op == 0 {
            trace!("[CMD] controller accepts {} commands", read_u8(params, 0)?);
            return Ok(());
        }
        let status = read_u8(params, 3)?;
        let resolved = self.correlator.on_complete(op, status, &params[4..])?;
        trace!("[CMD] complete {:#x} status {:#x}", op, status);
        self.complete(resolved.completion, op, resolved.result.map(Outcome::Command));
        Ok(())
    }

    fn on_command_status(&mut self, params: &[u8]) -> Result<(), HciError> {
        let status = read_u8(params, 0)?;
        let op = read_u16(params, 2)?;
        if op == 0 {
            return Ok(());
        }
        match self.correlator.on_status(op, status)? {
            Some(resolved) => {
                debug!("[CMD] {:#x} rejected: {}", op, status::name(status));
                self.complete(resolved.completion, op, resolved.result.map(Outcome::Command));
            }
            None => trace!("[CMD] {:#x} pending", op),
        }
        Ok(())
    }

    fn on_disconnection_complete(&mut self, params: &[u8]) -> Result<(), HciError> {
        let status = read_u8(params, 0)?;
        let handle = read_u16(params, 1)? & 0x0FFF;
        let reason = read_u8(params, 3)?;

        if status != SUCCESS {
            self.finish_follow_up(
                opcode::DISCONNECT,
                Some(handle),
                Err(HciError::CommandFailure {
                    opcode: opcode::DISCONNECT,
                    status,
                }),
            );
            return Ok(());
        }

        info!("[CONN] handle {} disconnected: {}", handle, status::name(reason));
        self.drop_connection(handle, reason, HciError::Disconnected { handle, reason });
        self.finish_follow_up(
            opcode::DISCONNECT,
            Some(handle),
            Ok(Outcome::Disconnected { handle, reason }),
        );
        Ok(())
    }

    fn on_encryption_change(&mut self, params: &[u8]) -> Result<(), HciError> {
        let status = read_u8(params, 0)?;
        let handle = read_u16(params, 1)? & 0x0FFF;
        let enabled = status == SUCCESS && read_u8(params, 3)? != 0;

        if let Some(connection) = self.connections.get_mut(handle) {
            let actions = connection.gatt.on_encryption_change(enabled);
            self.apply_gatt_actions(handle, actions);
        }

        let result = if status == SUCCESS {
            info!("[CONN] handle {} encryption {}", handle, enabled);
            self.push_event(EngineEvent::EncryptionChanged { handle, enabled });
            Ok(Outcome::Command(CommandResult::Empty))
        } else {
            warn!("[CONN] handle {} encryption failed: {}", handle, status::name(status));
            Err(HciError::CommandFailure {
                opcode: opcode::LE_START_ENCRYPTION,
                status,
            })
        };
        self.finish_follow_up(opcode::LE_START_ENCRYPTION, Some(handle), result);
        Ok(())
    }

    fn on_le_meta(&mut self, params: &[u8]) -> Result<(), HciError> {
        let subevent = read_u8(params, 0)?;
        let params = &params[1..];
        match subevent {
            event::LE_CONNECTION_COMPLETE => self.on_le_connection_complete(params),
            event::LE_ADVERTISING_REPORT => self.on_advertising_report(params),
            event::LE_CONNECTION_UPDATE_COMPLETE => self.on_connection_update(params),
            event::LE_READ_REMOTE_FEATURES_COMPLETE => self.on_remote_features(params),
            _ => {
                trace!("[ENGINE] unhandled LE subevent {:#x}", subevent);
                Ok(())
            }
        }
    }

    fn on_le_connection_complete(&mut self, params: &[u8]) -> Result<(), HciError> {
        let (status, info) = ConnectionInfo::from_le_connection_complete(params)?;

        if status != SUCCESS {
            warn!("[CONN] connection failed: {}", status::name(status));
            self.finish_follow_up(
                opcode::LE_CREATE_CONNECTION,
                None,
                Err(HciError::CommandFailure {
                    opcode: opcode::LE_CREATE_CONNECTION,
                    status,
                }),
            );
            return Ok(());
        }

        // Only links we initiated answer LE Create Connection
        let follow_up = if info.role == Role::Central {
            self.correlator.take_follow_up(opcode::LE_CREATE_CONNECTION)
        } else {
            None
        };

        if let Err(e) = self.connections.register(&info, &mut self.devices) {
            // The controller keeps the link up until told otherwise
            warn!("[CONN] cannot track handle {}, disconnecting", info.handle);
            let h = info.handle.to_le_bytes();
            if let Err(err) = self.write_command(
                opcode::DISCONNECT,
                &[h[0], h[1], REMOTE_USER_TERMINATED],
                Completion::Discard,
            ) {
                warn!("[CONN] disconnect of handle {} failed: {:?}", info.handle, err);
            }
            if let Some(completion) = follow_up {
                self.complete(completion, opcode::LE_CREATE_CONNECTION, Err(e));
            }
            return Err(e);
        }

        self.push_event(EngineEvent::Connected(info));
        if let Some(completion) = follow_up {
            self.complete(
                completion,
                opcode::LE_CREATE_CONNECTION,
                Ok(Outcome::Connected(info)),
            );
        }
        self.flush_parked(info.address, info.handle);
        Ok(())
    }

    fn on_advertising_report(&mut self, params: &[u8]) -> Result<(), HciError> {
        let count = read_u8(params, 0)?;
        let mut offset = 1;
        for _ in 0..count {
            let event_type = read_u8(params, offset)?;
            let address_type = AddressType::from_u8(read_u8(params, offset + 1)?);
            let address = params
                .get(offset + 2..offset + 8)
                .ok_or(HciError::MalformedPacket)?;
            let address = BluetoothAddress::try_from(address)?;
            let len = usize::from(read_u8(params, offset + 8)?);
            let data = params
                .get(offset + 9..offset + 9 + len)
                .ok_or(HciError::MalformedPacket)?;
            let rssi = read_u8(params, offset + 9 + len)? as i8;
            offset += 10 + len;

            self.on_discovery(AdvertisingReport {
                event_type,
                address_type,
                address,
                eir: EirInfo::decode(data),
                rssi,
            });
        }
        Ok(())
    }

    fn on_discovery(&mut self, report: AdvertisingReport) {
        let device = match self.devices.on_discovery(&report, self.now) {
            Ok(device) => device.clone(),
            Err(e) => {
                warn!("[DEVICE] report dropped: {:?}", e);
                return;
            }
        };
        trace!("[DEVICE] report type {:#x} rssi {}", report.event_type, report.rssi);

        if let Some(scan) = self.scan.as_mut() {
            if !scan.results.contains(&report.address) && scan.results.push(report.address).is_err()
            {
                debug!("[ENGINE] scan result list full");
            }
        }
        self.push_event(EngineEvent::Discovered { report, device });
    }

    fn on_connection_update(&mut self, params: &[u8]) -> Result<(), HciError> {
        let status = read_u8(params, 0)?;
        let handle = read_u16(params, 1)? & 0x0FFF;
        if status != SUCCESS {
            debug!("[CONN] update of {} failed: {}", handle, status::name(status));
            return Ok(());
        }
        let interval = read_u16(params, 3)?;
        let latency = read_u16(params, 5)?;
        let supervision_timeout = read_u16(params, 7)?;

        let connection = self
            .connections
            .get_mut(handle)
            .ok_or(HciError::UnknownConnection { handle })?;
        if let Some(info) = connection.info.as_mut() {
            info.apply_update(interval, latency, supervision_timeout);
        }
        let device = match connection.address {
            Some(address) => self.devices.get_mut(&address),
            None => None,
        };
        if let Some(info) = device.and_then(|device| device.connection_info.as_mut()) {
            info.apply_update(interval, latency, supervision_timeout);
        }

        debug!("[CONN] handle {} interval {}", handle, interval);
        self.push_event(EngineEvent::ConnectionUpdated {
            handle,
            interval,
            latency,
            supervision_timeout,
        });
        Ok(())
    }

    fn on_remote_features(&mut self, params: &[u8]) -> Result<(), HciError> {
        let status = read_u8(params, 0)?;
        let handle = read_u16(params, 1)? & 0x0FFF;
        if status != SUCCESS {
            self.finish_follow_up(
                opcode::LE_READ_REMOTE_FEATURES,
                Some(handle),
                Err(HciError::CommandFailure {
                    opcode: opcode::LE_READ_REMOTE_FEATURES,
                    status,
                }),
            );
            return Ok(());
        }

        let mut features = [0u8; 8];
        features.copy_from_slice(params.get(3..11).ok_or(HciError::MalformedPacket)?);
        if let Some(connection) = self.connections.get_mut(handle) {
            connection.remote_features = Some(features);
        }
        self.finish_follow_up(
            opcode::LE_READ_REMOTE_FEATURES,
            Some(handle),
            Ok(Outcome::Command(CommandResult::LeRemoteFeatures { handle, features })),
        );
        Ok(())
    }

    /// Resolve the oldest command waiting on `op`'s completion event. When
    /// the event names a connection only a command for that link matches.
    fn finish_follow_up(&mut self, op: u16, handle: Option<u16>, result: Result<Outcome, HciError>) {
        let completion = match handle {
            Some(handle) => self.correlator.take_follow_up_for(op, handle),
            None => self.correlator.take_follow_up(op),
        };
        match completion {
            Some(completion) => self.complete(completion, op, result),
            None => trace!("[CMD] no follow-up waiting on {:#x}", op),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::command::CommandResult;
    use crate::connection::Role;
    use crate::gatt::{self, AttPdu, SecurityLevel, att_error};
    use crate::packet::{event, opcode};
    use crate::testing::*;
    use crate::{
        AddressType, BluetoothAddress, EngineEvent, EngineOptions, HciEngine, HciError, Outcome,
    };

    fn connected_engine() -> HciEngine<MockDriver> {
        let mut engine = HciEngine::new(MockDriver::powered(), EngineOptions::default());
        activate(&mut engine, 0x09);
        connect(&mut engine, 0x0040, PEER);
        drain_events(&mut engine);
        engine.driver_mut().written.clear();
        engine
    }

    #[test]
    fn test_unsolicited_reply_is_dropped() {
        let mut engine = connected_engine();
        engine.on_bytes(&command_complete(opcode::READ_RSSI, 0, &[0x40, 0x00, 0xC4]));
        engine.on_bytes(&command_status(opcode::DISCONNECT, 0));
        assert!(engine.poll_event().is_none());
    }

    #[test]
    fn test_truncated_event_is_dropped() {
        let mut engine = connected_engine();
        let ticket = engine.read_rssi(0x0040).unwrap();
        // Declared parameter length runs past the frame
        engine.on_bytes(&[0x04, event::COMMAND_COMPLETE, 0x07, 0x01, 0x05, 0x14]);
        assert_eq!(engine.take_outcome(ticket), None);

        engine.on_bytes(&command_complete(opcode::READ_RSSI, 0, &[0x40, 0x00, 0xC4]));
        assert!(engine.take_outcome(ticket).is_some());
    }

    #[test]
    fn test_command_status_failure() {
        let mut engine = connected_engine();
        let ticket = engine
            .create_le_connection(PEER_2, AddressType::Public)
            .unwrap();
        engine.on_bytes(&command_status(opcode::LE_CREATE_CONNECTION, 0x0C));
        assert_eq!(
            engine.take_outcome(ticket),
            Some(Err(HciError::CommandFailure {
                opcode: opcode::LE_CREATE_CONNECTION,
                status: 0x0C
            }))
        );
    }

    #[test]
    fn test_create_connection_resolves_on_connection_complete() {
        let mut engine = connected_engine();
        let ticket = engine
            .create_le_connection(PEER_2, AddressType::Public)
            .unwrap();
        engine.on_bytes(&command_status(opcode::LE_CREATE_CONNECTION, 0));
        assert_eq!(engine.take_outcome(ticket), None);

        engine.on_bytes(&le_connection_complete(0, 0x0041, PEER_2, Role::Central));
        let Some(Ok(Outcome::Connected(info))) = engine.take_outcome(ticket) else {
            panic!("connection not reported");
        };
        assert_eq!(info.handle, 0x0041);
        assert_eq!(info.address, PEER_2);

        let device = engine.device(&PEER_2).unwrap();
        assert!(device.link_ready());
        assert_eq!(device.handle, Some(0x0041));
        assert_eq!(engine.poll_event(), Some(EngineEvent::Connected(info)));
    }

    #[test]
    fn test_failed_connection_complete() {
        let mut engine = connected_engine();
        let ticket = engine
            .create_le_connection(PEER_2, AddressType::Public)
            .unwrap();
        engine.on_bytes(&command_status(opcode::LE_CREATE_CONNECTION, 0));
        engine.on_bytes(&le_connection_complete(0x02, 0x0000, PEER_2, Role::Central));

        assert_eq!(
            engine.take_outcome(ticket),
            Some(Err(HciError::CommandFailure {
                opcode: opcode::LE_CREATE_CONNECTION,
                status: 0x02
            }))
        );
        assert!(engine.device(&PEER_2).is_none());
    }

    #[test]
    fn test_peripheral_link_does_not_answer_create_connection() {
        let mut engine = connected_engine();
        let ticket = engine
            .create_le_connection(PEER_2, AddressType::Public)
            .unwrap();
        engine.on_bytes(&command_status(opcode::LE_CREATE_CONNECTION, 0));
        engine.on_bytes(&le_connection_complete(0, 0x0042, PEER_3, Role::Peripheral));

        assert_eq!(engine.take_outcome(ticket), None);
        assert!(engine.connection(0x0042).is_some());
    }

    #[test]
    fn test_disconnect_resolves_and_fails_requests() {
        let mut engine = connected_engine();
        let request = engine
            .gatt_request_on(0x0040, gatt::read(0x0003).unwrap())
            .unwrap();
        let ticket = engine.disconnect(0x0040, 0x13).unwrap();
        assert_eq!(
            engine.driver().command_params(opcode::DISCONNECT),
            Some(&[0x40, 0x00, 0x13][..])
        );
        engine.on_bytes(&command_status(opcode::DISCONNECT, 0));
        engine.on_bytes(&disconnection_complete(0, 0x0040, 0x16));

        assert_eq!(
            engine.take_outcome(ticket),
            Some(Ok(Outcome::Disconnected {
                handle: 0x0040,
                reason: 0x16
            }))
        );
        assert_eq!(
            engine.take_outcome(request),
            Some(Err(HciError::Disconnected {
                handle: 0x0040,
                reason: 0x16
            }))
        );
        assert!(engine.connection(0x0040).is_none());

        let device = engine.device(&PEER).unwrap();
        assert!(!device.link_ready());
        assert_eq!(
            device.disconnect_reason_name(),
            Some("Connection Terminated By Local Host")
        );
        assert_eq!(
            engine.disconnect(0x0040, 0x13),
            Err(HciError::UnknownConnection { handle: 0x0040 })
        );
    }

    #[test]
    fn test_disconnect_resolves_only_for_its_link() {
        let mut engine = connected_engine();
        connect(&mut engine, 0x0041, PEER_2);
        drain_events(&mut engine);

        let ticket = engine.disconnect(0x0040, 0x13).unwrap();
        engine.on_bytes(&command_status(opcode::DISCONNECT, 0));

        // The other link drops on its own
        engine.on_bytes(&disconnection_complete(0, 0x0041, 0x13));
        assert_eq!(engine.take_outcome(ticket), None);
        assert!(engine.connection(0x0041).is_none());
        assert!(engine.connection(0x0040).is_some());

        engine.on_bytes(&disconnection_complete(0, 0x0040, 0x16));
        assert_eq!(
            engine.take_outcome(ticket),
            Some(Ok(Outcome::Disconnected {
                handle: 0x0040,
                reason: 0x16
            }))
        );
    }

    #[test]
    fn test_link_events_resolve_their_own_commands() {
        let mut engine = connected_engine();
        connect(&mut engine, 0x0041, PEER_2);
        let features = engine.read_le_remote_features(0x0040).unwrap();
        let encrypt = engine.start_encryption(0x0041, [0; 8], 0, [0; 16]).unwrap();
        engine.on_bytes(&command_status(opcode::LE_READ_REMOTE_FEATURES, 0));
        engine.on_bytes(&command_status(opcode::LE_START_ENCRYPTION, 0));

        engine.on_bytes(&le_meta(
            event::LE_READ_REMOTE_FEATURES_COMPLETE,
            &[0x00, 0x41, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
        ));
        engine.on_bytes(&encryption_change(0, 0x0040, true));
        assert_eq!(engine.take_outcome(features), None);
        assert_eq!(engine.take_outcome(encrypt), None);

        engine.on_bytes(&le_meta(
            event::LE_READ_REMOTE_FEATURES_COMPLETE,
            &[0x00, 0x40, 0x00, 0x1F, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
        ));
        engine.on_bytes(&encryption_change(0, 0x0041, true));
        assert_eq!(
            engine.take_outcome(features),
            Some(Ok(Outcome::Command(CommandResult::LeRemoteFeatures {
                handle: 0x0040,
                features: [0x1F, 0, 0, 0, 0, 0, 0, 0]
            })))
        );
        assert_eq!(
            engine.take_outcome(encrypt),
            Some(Ok(Outcome::Command(CommandResult::Empty)))
        );
    }

    #[test]
    fn test_link_beyond_capacity_is_disconnected() {
        let mut engine = connected_engine();
        connect(&mut engine, 0x0041, PEER_2);
        connect(&mut engine, 0x0042, PEER_3);
        let fourth = BluetoothAddress::new([0x04, 0x3B, 0x6A, 0x8D, 0x7C, 0xC4]);
        connect(&mut engine, 0x0043, fourth);
        drain_events(&mut engine);
        engine.driver_mut().written.clear();

        let fifth = BluetoothAddress::new([0x05, 0x3B, 0x6A, 0x8D, 0x7C, 0xC4]);
        connect(&mut engine, 0x0044, fifth);
        assert!(engine.connection(0x0044).is_none());
        assert!(engine.poll_event().is_none());
        assert_eq!(
            engine.driver().command_params(opcode::DISCONNECT),
            Some(&[0x44, 0x00, 0x13][..])
        );

        engine.on_bytes(&command_status(opcode::DISCONNECT, 0));
        engine.on_bytes(&disconnection_complete(0, 0x0044, 0x16));
        assert!(engine.poll_event().is_none());
        assert!(engine.connection(0x0040).is_some());
    }

    #[test]
    fn test_remote_disconnect_emits_event() {
        let mut engine = connected_engine();
        engine.on_bytes(&disconnection_complete(0, 0x0040, 0x13));
        assert_eq!(
            engine.poll_event(),
            Some(EngineEvent::Disconnected {
                handle: 0x0040,
                address: Some(PEER),
                reason: 0x13
            })
        );
    }

    #[test]
    fn test_advertising_report_with_two_reports() {
        let mut engine = connected_engine();
        let mut params = heapless::Vec::<u8, 64>::new();
        params.push(0x02).unwrap();
        params
            .extend_from_slice(&report_bytes(0x00, PEER_2, &[0x04, 0x09, b'O', b'N', b'E'], -50))
            .unwrap();
        params
            .extend_from_slice(&report_bytes(0x03, PEER_3, &[0x03, 0x03, 0x0F, 0x18], -80))
            .unwrap();
        engine.on_bytes(&le_meta(event::LE_ADVERTISING_REPORT, &params));

        let Some(EngineEvent::Discovered { report, device }) = engine.poll_event() else {
            panic!("first report missing");
        };
        assert_eq!(report.address, PEER_2);
        assert_eq!(report.rssi, -50);
        assert_eq!(device.name.as_deref(), Some("ONE"));
        assert!(device.advert_info.unwrap().connectable);

        let Some(EngineEvent::Discovered { report, device }) = engine.poll_event() else {
            panic!("second report missing");
        };
        assert_eq!(report.address, PEER_3);
        assert!(!device.advert_info.unwrap().connectable);
        assert_eq!(device.eir_info.service_uuids[0].as_str(), "180f");
        assert_eq!(engine.devices().count(), 3);
    }

    #[test]
    fn test_truncated_advertising_report() {
        let mut engine = connected_engine();
        let mut params = heapless::Vec::<u8, 64>::new();
        params.push(0x01).unwrap();
        params
            .extend_from_slice(&report_bytes(0x00, PEER_2, &[0x02, 0x01, 0x06], -50))
            .unwrap();
        params.truncate(params.len() - 2);
        engine.on_bytes(&le_meta(event::LE_ADVERTISING_REPORT, &params));
        assert!(engine.poll_event().is_none());
        assert!(engine.device(&PEER_2).is_none());
    }

    #[test]
    fn test_insufficient_encryption_holds_request_until_encrypted() {
        let mut engine = connected_engine();
        let request = engine
            .gatt_request_on(0x0040, gatt::read(0x0003).unwrap())
            .unwrap();
        engine.on_bytes(&acl_att(
            0x0040,
            &[0x01, 0x0A, 0x03, 0x00, att_error::INSUFFICIENT_ENCRYPTION],
        ));
        assert_eq!(
            engine.poll_event(),
            Some(EngineEvent::SecurityUpgradeRequired {
                handle: 0x0040,
                code: att_error::INSUFFICIENT_ENCRYPTION
            })
        );
        assert_eq!(engine.take_outcome(request), None);

        let encrypt = engine
            .start_encryption(0x0040, [0x11; 8], 0x1234, [0x22; 16])
            .unwrap();
        let params = engine
            .driver()
            .command_params(opcode::LE_START_ENCRYPTION)
            .unwrap();
        assert_eq!(params.len(), 28);
        assert_eq!(&params[10..12], &[0x34, 0x12]);
        engine.on_bytes(&command_status(opcode::LE_START_ENCRYPTION, 0));
        engine.driver_mut().written.clear();

        engine.on_bytes(&encryption_change(0, 0x0040, true));
        assert_eq!(
            engine.take_outcome(encrypt),
            Some(Ok(Outcome::Command(CommandResult::Empty)))
        );
        assert_eq!(
            engine.connection(0x0040).unwrap().gatt.security(),
            SecurityLevel::Medium
        );
        // The held request goes out again
        assert_eq!(engine.driver().acl_frames().count(), 1);
        assert_eq!(
            engine.poll_event(),
            Some(EngineEvent::EncryptionChanged {
                handle: 0x0040,
                enabled: true
            })
        );

        engine.on_bytes(&acl_att(0x0040, &[0x0B, 0x01]));
        assert_eq!(
            engine.take_outcome(request),
            Some(Ok(Outcome::Att(AttPdu::from_slice(&[0x0B, 0x01]).unwrap())))
        );
    }

    #[test]
    fn test_failed_encryption_fails_held_request() {
        let mut engine = connected_engine();
        let request = engine
            .gatt_request_on(0x0040, gatt::read(0x0003).unwrap())
            .unwrap();
        engine.on_bytes(&acl_att(
            0x0040,
            &[0x01, 0x0A, 0x03, 0x00, att_error::INSUFFICIENT_AUTHENTICATION],
        ));
        let encrypt = engine
            .start_encryption(0x0040, [0; 8], 0, [0; 16])
            .unwrap();
        engine.on_bytes(&command_status(opcode::LE_START_ENCRYPTION, 0));
        engine.on_bytes(&encryption_change(0x06, 0x0040, false));

        assert_eq!(
            engine.take_outcome(encrypt),
            Some(Err(HciError::CommandFailure {
                opcode: opcode::LE_START_ENCRYPTION,
                status: 0x06
            }))
        );
        assert_eq!(
            engine.take_outcome(request),
            Some(Err(HciError::AttError {
                opcode: 0x0A,
                code: att_error::INSUFFICIENT_AUTHENTICATION
            }))
        );
    }

    #[test]
    fn test_notification_and_indication() {
        let mut engine = connected_engine();
        engine.subscribe(0x0040, 0x0021).unwrap();

        engine.on_bytes(&acl_att(0x0040, &[0x1B, 0x21, 0x00, 0x64]));
        assert_eq!(
            engine.poll_event(),
            Some(EngineEvent::Notification {
                handle: 0x0040,
                attribute: 0x0021,
                value: AttPdu::from_slice(&[0x64]).unwrap(),
                indication: false
            })
        );
        assert_eq!(engine.driver().acl_frames().count(), 0);

        engine.on_bytes(&acl_att(0x0040, &[0x1D, 0x21, 0x00, 0x65]));
        assert!(matches!(
            engine.poll_event(),
            Some(EngineEvent::Notification {
                indication: true,
                ..
            })
        ));
        // Confirmation
        assert_eq!(
            engine.driver().acl_frames().next(),
            Some(&[0x02, 0x40, 0x00, 0x05, 0x00, 0x01, 0x00, 0x04, 0x00, 0x1E][..])
        );

        assert_eq!(engine.unsubscribe(0x0040, 0x0021), Ok(true));
        engine.on_bytes(&acl_att(0x0040, &[0x1B, 0x21, 0x00, 0x66]));
        assert!(engine.poll_event().is_none());
    }

    #[test]
    fn test_fragmented_response_is_reassembled() {
        let mut engine = connected_engine();
        let request = engine
            .gatt_request_on(0x0040, gatt::read(0x0003).unwrap())
            .unwrap();

        let mut response = [0x42u8; 30];
        response[0] = 0x0B;
        engine.on_bytes(&acl_start(0x0040, 30, 0x0004, &response[..10]));
        engine.on_bytes(&acl_continuation(0x0040, &response[10..25]));
        assert_eq!(engine.take_outcome(request), None);
        engine.on_bytes(&acl_continuation(0x0040, &response[25..]));

        assert_eq!(
            engine.take_outcome(request),
            Some(Ok(Outcome::Att(AttPdu::from_slice(&response).unwrap())))
        );
    }

    #[test]
    fn test_value_longer_than_att_pdu_is_dropped() {
        let mut engine = connected_engine();
        engine.subscribe(0x0040, 0x0010).unwrap();

        let mut ntf = [0xA5u8; 603];
        ntf[..3].copy_from_slice(&[0x1B, 0x10, 0x00]);
        engine.on_bytes(&acl_start(0x0040, 603, 0x0004, &ntf[..250]));
        engine.on_bytes(&acl_continuation(0x0040, &ntf[250..500]));
        engine.on_bytes(&acl_continuation(0x0040, &ntf[500..]));
        assert!(engine.poll_event().is_none());

        // A value that fits is still reported afterwards
        engine.on_bytes(&acl_att(0x0040, &[0x1B, 0x10, 0x00, 0x01]));
        assert_eq!(
            engine.poll_event(),
            Some(EngineEvent::Notification {
                handle: 0x0040,
                attribute: 0x0010,
                value: AttPdu::from_slice(&[0x01]).unwrap(),
                indication: false
            })
        );
    }

    #[test]
    fn test_orphan_continuation_is_dropped() {
        let mut engine = connected_engine();
        engine.on_bytes(&acl_continuation(0x0040, &[0x0B, 0x01]));
        assert!(engine.poll_event().is_none());
        assert_eq!(engine.driver().acl_frames().count(), 0);
    }

    #[test]
    fn test_connection_update() {
        let mut engine = connected_engine();
        engine.on_bytes(&le_meta(
            event::LE_CONNECTION_UPDATE_COMPLETE,
            &[0x00, 0x40, 0x00, 0x28, 0x00, 0x04, 0x00, 0x00, 0x01],
        ));
        assert_eq!(
            engine.poll_event(),
            Some(EngineEvent::ConnectionUpdated {
                handle: 0x0040,
                interval: 0x0028,
                latency: 4,
                supervision_timeout: 0x0100
            })
        );
        let info = engine.connection(0x0040).unwrap().info.unwrap();
        assert_eq!(info.interval, 0x0028);
        let device = engine.device(&PEER).unwrap();
        assert_eq!(device.connection_info.unwrap().supervision_timeout, 0x0100);
    }

    #[test]
    fn test_remote_features() {
        let mut engine = connected_engine();
        let ticket = engine.read_le_remote_features(0x0040).unwrap();
        engine.on_bytes(&command_status(opcode::LE_READ_REMOTE_FEATURES, 0));
        engine.on_bytes(&le_meta(
            event::LE_READ_REMOTE_FEATURES_COMPLETE,
            &[0x00, 0x40, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
        ));
        assert_eq!(
            engine.take_outcome(ticket),
            Some(Ok(Outcome::Command(CommandResult::LeRemoteFeatures {
                handle: 0x0040,
                features: [0x01, 0, 0, 0, 0, 0, 0, 0]
            })))
        );
        assert_eq!(
            engine.connection(0x0040).unwrap().remote_features,
            Some([0x01, 0, 0, 0, 0, 0, 0, 0])
        );
    }

    #[test]
    fn test_hardware_error() {
        let mut engine = connected_engine();
        engine.on_bytes(&[0x04, event::HARDWARE_ERROR, 0x01, 0x2A]);
        assert_eq!(engine.poll_event(), Some(EngineEvent::HardwareError(0x2A)));
    }

    #[test]
    fn test_non_event_packets_are_ignored() {
        let mut engine = connected_engine();
        engine.on_bytes(&[]);
        engine.on_bytes(&[0x01, 0x03, 0x0C, 0x00]);
        engine.on_bytes(&[0x03, 0x40, 0x00, 0x00]);
        engine.on_bytes(&[0x55, 0x01]);
        assert!(engine.poll_event().is_none());
    }
}
