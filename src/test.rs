/* Copyright (C) 2022 by Jacob Alexander
 *
 * This file is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This file is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this file.  If not, see <http://www.gnu.org/licenses/>.
 */

#![cfg(test)]

// ----- Modules -----

use crate::channel::Core;
use crate::config::Config;
use crate::device::loopback::{self, DeviceEndpoint, Responder};
use crate::dispatcher::InboundError;
use crate::error::CoreError;
use crate::logging::setup_logging_lite;
use crate::nvs::{BondRecord, NvsReader, SnapshotNvs};
use crate::pairing::PairingState;
use crate::registry::Lookup;
use crate::session::{AccountName, SessionState};
use hidpp_protocol::features::{h0000, h0001, h1602, h1e02, FeatureFlags, Message};
use hidpp_protocol::hidpp10::{
    self, passkey_digits, AuthMethod, BluetoothAddress, ConnectAction, DeviceConnection,
    DeviceDiscovery, DisplayPassKeyKey, KeyCode, PairingErrorType, PairingStatus,
    PairingStatusCode, RequestDisplayPassKey, SetPerformDeviceConnection,
};
use hidpp_protocol::{
    DeviceError, ErrorCode, ErrorFrame, Header, Hidpp10ErrorCode, ReportId, RECEIVER_INDEX,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

// ----- Constants -----

const DEVICE: u8 = 0x01;

/// Feature ids of the emulated device, by feature index
const FEATURES: &[u16] = &[0x0000, 0x0001, 0x0003, 0x1602, 0x1E02, 0x1861];

/// Password of every account, sent as Passwd0 (00..0F) then Passwd1 (10..1F)
const PASSWORD: [u8; 32] = [
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E,
    0x0F, 0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B, 0x1C, 0x1D,
    0x1E, 0x1F,
];
const STATUS_REJECTED: u8 = 0x02;

const PEER: BluetoothAddress = [0xC0, 0xFF, 0xEE, 0x00, 0x00, 0x01];
const PASSKEY: &[u8; 6] = b"042137";
const SLOT: u8 = 2;
const LTK: [u8; 16] = [0x3C; 16];

// ----- Functions -----

fn reply<M: Message>(header: &Header, message: &M) -> Vec<u8> {
    message
        .encode(header.device_index, header.feature_index, header.software_id)
        .unwrap()
        .to_vec()
}

fn notification<M: Message>(device_index: u8, message: &M) -> Vec<u8> {
    message.encode(device_index, 0, 0).unwrap().to_vec()
}

fn error(header: &Header, code: ErrorCode) -> Vec<u8> {
    ErrorFrame {
        original: *header,
        error: DeviceError::Hidpp20(code.into()),
    }
    .to_frame()
    .unwrap()
    .to_vec()
}

fn block(range: std::ops::Range<usize>) -> [u8; 16] {
    let mut block = [0u8; 16];
    block.copy_from_slice(&PASSWORD[range]);
    block
}

// ----- Structs -----

/// Emulated HID++ 2.0 device behind a BLE capable receiver
struct FakeDevice {
    endpoint: DeviceEndpoint,
    nvs: Arc<SnapshotNvs>,
    /// Frames written by the host
    received: Vec<Vec<u8>>,
    resets_seen: usize,
    /// Session opened with StartSession
    session: Option<[u8; 16]>,
    passwd0_accepted: bool,
    authenticated: Vec<[u8; 16]>,
    /// Deactivatable feature state bitmap
    state: u8,
    /// Passkey entropy advertised in discoveries
    peer_entropy: u8,
    /// Send a name part ahead of the configuration part of a discovery
    name_part_first: bool,
    /// Peer links up once bonded
    link_up: bool,
    reply_delay: Option<Duration>,
}

impl FakeDevice {
    fn new(endpoint: DeviceEndpoint, nvs: Arc<SnapshotNvs>) -> FakeDevice {
        FakeDevice {
            endpoint,
            nvs,
            received: Vec::new(),
            resets_seen: 0,
            session: None,
            passwd0_accepted: false,
            authenticated: Vec::new(),
            state: 0,
            peer_entropy: 20,
            name_part_first: false,
            link_up: true,
            reply_delay: None,
        }
    }

    /// Power cycle: sessions are lost, only gotthard survives
    fn reboot(&mut self) {
        self.session = None;
        self.passwd0_accepted = false;
        self.authenticated.clear();
        self.state &= h1e02::GOTHARD;
    }

    fn handle(&mut self, frame: &[u8]) -> Vec<Vec<u8>> {
        self.received.push(frame.to_vec());
        let resets = self.endpoint.reset_requests();
        if resets != self.resets_seen {
            self.resets_seen = resets;
            self.reboot();
        }

        let header = match Header::parse(frame) {
            Ok(header) => header,
            Err(_) => return Vec::new(),
        };
        if header.device_index == RECEIVER_INDEX {
            return self.receiver(&header, frame);
        }

        let feature_id = match FEATURES.get(usize::from(header.feature_index)) {
            Some(feature_id) => *feature_id,
            None => return vec![error(&header, ErrorCode::InvalidFeatureIndex)],
        };
        match (feature_id, header.function_id) {
            (h0000::FEATURE_ID, 0) => {
                let request = h0000::GetFeature::decode(frame).unwrap();
                let feature_index = FEATURES
                    .iter()
                    .skip(1)
                    .position(|id| *id == request.feature_id)
                    .map_or(0, |position| position + 1);
                vec![reply(
                    &header,
                    &h0000::GetFeatureResponse {
                        feature_index: feature_index as u8,
                        flags: FeatureFlags::default(),
                        version: 0,
                    },
                )]
            }
            (h0001::FEATURE_ID, 0) => vec![reply(
                &header,
                &h0001::GetCountResponse {
                    count: (FEATURES.len() - 1) as u8,
                },
            )],
            (h0001::FEATURE_ID, 1) => {
                let request = h0001::GetFeatureId::decode(frame).unwrap();
                match FEATURES.get(usize::from(request.feature_index)) {
                    Some(feature_id) => vec![reply(
                        &header,
                        &h0001::GetFeatureIdResponse {
                            feature_id: *feature_id,
                            flags: FeatureFlags::default(),
                            version: 0,
                        },
                    )],
                    None => vec![error(&header, ErrorCode::OutOfRange)],
                }
            }
            (h1602::FEATURE_ID, _) => self.authentication(&header, frame),
            (h1e02::FEATURE_ID, _) => self.deactivatable(&header, frame),
            _ => vec![error(&header, ErrorCode::InvalidFunctionId)],
        }
    }

    fn authentication(&mut self, header: &Header, frame: &[u8]) -> Vec<Vec<u8>> {
        match header.function_id {
            0 => {
                let request = h1602::StartSession::decode(frame).unwrap();
                self.session = Some(request.account_name);
                self.passwd0_accepted = false;
                vec![reply(
                    header,
                    &h1602::StartSessionResponse {
                        constant_credentials: false,
                        full_authentication: true,
                        long_password: true,
                    },
                )]
            }
            1 => {
                let request = h1602::EndSession::decode(frame).unwrap();
                self.session = None;
                self.authenticated.retain(|account| *account != request.account_name);
                vec![reply(header, &h1602::EndSessionResponse)]
            }
            2 => {
                let request = h1602::Passwd0::decode(frame).unwrap();
                let status = if self.session.is_some() && request.passwd == block(0..16) {
                    self.passwd0_accepted = true;
                    h1602::STATUS_IN_PROGRESS
                } else {
                    self.session = None;
                    STATUS_REJECTED
                };
                vec![reply(header, &h1602::Passwd0Response { status })]
            }
            3 => {
                let request = h1602::Passwd1::decode(frame).unwrap();
                let status = match self.session.take() {
                    Some(account) if self.passwd0_accepted && request.passwd == block(16..32) => {
                        self.authenticated.push(account);
                        h1602::STATUS_SUCCESS
                    }
                    _ => STATUS_REJECTED,
                };
                self.passwd0_accepted = false;
                vec![reply(header, &h1602::Passwd1Response { status })]
            }
            _ => vec![error(header, ErrorCode::InvalidFunctionId)],
        }
    }

    fn deactivatable(&mut self, header: &Header, frame: &[u8]) -> Vec<Vec<u8>> {
        let all = h1e02::MANUFACTURING | h1e02::COMPLIANCE | h1e02::GOTHARD;
        match header.function_id {
            0 => vec![reply(
                header,
                &h1e02::GetInfoResponse {
                    support: all.into(),
                    persist: h1e02::GOTHARD.into(),
                    state: self.state.into(),
                },
            )],
            1 => {
                let request = h1e02::DisableFeatures::decode(frame).unwrap();
                let bits = u8::from(request.bit_map);
                self.state &= if request.bit_map.all { 0 } else { !bits };
                vec![reply(header, &h1e02::DisableFeaturesResponse::default())]
            }
            2 => {
                let request = h1e02::EnableFeatures::decode(frame).unwrap();
                let bits = if request.bit_map.all {
                    all
                } else {
                    u8::from(request.bit_map)
                };
                let permitted = AccountName::ALL
                    .into_iter()
                    .filter(|account| bits & account.feature_bit() != 0)
                    .all(|account| self.authenticated.contains(&account.padded()));
                if !permitted {
                    return vec![error(header, ErrorCode::NotAllowed)];
                }
                self.state |= bits;
                vec![reply(header, &h1e02::EnableFeaturesResponse::default())]
            }
            3 => vec![reply(
                header,
                &h1e02::GetReactInfoResponse {
                    auth_feature: h1602::FEATURE_ID,
                },
            )],
            _ => vec![error(header, ErrorCode::InvalidFunctionId)],
        }
    }

    fn receiver(&mut self, header: &Header, frame: &[u8]) -> Vec<Vec<u8>> {
        match (header.feature_index, header.function_byte()) {
            (hidpp10::SET_REGISTER, hidpp10::PERFORM_DEVICE_DISCOVERY) => {
                let mut frames = vec![notification(
                    RECEIVER_INDEX,
                    &hidpp10::SetPerformDeviceDiscoveryResponse,
                )];
                if self.name_part_first {
                    frames.push(Self::name_part());
                }
                frames.push(notification(
                    RECEIVER_INDEX,
                    &DeviceDiscovery {
                        notification_part: hidpp10::DISCOVERY_PART_CONFIGURATION,
                        device_type: 0x01,
                        bluetooth_address: PEER,
                        passkey_auth_method: true,
                        emu_2buttons_auth_method: false,
                        auth_entropy: self.peer_entropy,
                    },
                ));
                frames
            }
            (hidpp10::SET_LONG_REGISTER, hidpp10::PERFORM_DEVICE_CONNECTION) => {
                let request = SetPerformDeviceConnection::decode(frame).unwrap();
                let mut frames = vec![notification(
                    RECEIVER_INDEX,
                    &hidpp10::SetPerformDeviceConnectionResponse,
                )];
                match request.action {
                    ConnectAction::Pairing => frames.extend(self.pair(request.auth_entropy)),
                    ConnectAction::CancelPairing => frames.push(self.pairing_status(
                        PairingStatusCode::Cancel,
                        0,
                    )),
                    ConnectAction::Unpairing => {
                        self.nvs.clear_bond(SLOT);
                    }
                }
                frames
            }
            _ => vec![ErrorFrame {
                original: *header,
                error: DeviceError::Hidpp10(Hidpp10ErrorCode::InvalidAddress.into()),
            }
            .to_frame()
            .unwrap()
            .to_vec()],
        }
    }

    fn pairing_status(&self, status: PairingStatusCode, pairing_slot: u8) -> Vec<u8> {
        notification(
            RECEIVER_INDEX,
            &PairingStatus {
                status,
                error_type: PairingErrorType::NoError,
                bluetooth_address: PEER,
                pairing_slot,
            },
        )
    }

    /// First name part of a discovery: part 1, length, then ASCII
    fn name_part() -> Vec<u8> {
        let mut frame = vec![0u8; 20];
        frame[..5].copy_from_slice(&[0x11, RECEIVER_INDEX, hidpp10::DEVICE_DISCOVERY, 0x01, 7]);
        frame[5..12].copy_from_slice(b"MX Keys");
        frame
    }

    fn key(key_code: KeyCode) -> Vec<u8> {
        notification(
            RECEIVER_INDEX,
            &DisplayPassKeyKey {
                key_code,
                bluetooth_address: PEER,
            },
        )
    }

    /// Whole pairing sequence, the user types the passkey right away
    fn pair(&mut self, entropy_bits: u8) -> Vec<Vec<u8>> {
        let digits = passkey_digits(entropy_bits);
        let mut frames = vec![
            self.pairing_status(PairingStatusCode::Start, 0),
            notification(
                RECEIVER_INDEX,
                &RequestDisplayPassKey {
                    bluetooth_address: PEER,
                    passkey_length: digits as u8,
                    passkey_digits: *PASSKEY,
                },
            ),
            Self::key(KeyCode::PasskeyEntryStarted),
        ];
        frames.extend((0..digits).map(|_| Self::key(KeyCode::PasskeyDigitEntered)));
        frames.push(Self::key(KeyCode::PasskeyEntryCompleted));

        self.nvs.set_bond(BondRecord {
            slot: SLOT,
            peer_address: PEER,
            ltk: LTK,
            irk: None,
        });
        frames.push(self.pairing_status(PairingStatusCode::Stop, SLOT));
        if !self.link_up {
            return frames;
        }
        frames.push(notification(
            SLOT,
            &DeviceConnection {
                protocol_type: 0x10,
                link_established: true,
                device_type: 0x01,
                wireless_pid: 0xB023,
            },
        ));
        frames
    }
}

/// Core wired to a [`FakeDevice`]
struct Harness {
    core: Core,
    device: Arc<Mutex<FakeDevice>>,
    /// Extra handle for unsolicited device frames
    endpoint: DeviceEndpoint,
    nvs: Arc<SnapshotNvs>,
    _responder: Responder,
}

fn config() -> Config {
    Config {
        request_timeout_ms: 500,
        lookup_timeout_ms: 500,
        orphan_window_ms: 1000,
        pairing_timeout_ms: 2000,
        ..Default::default()
    }
}

fn harness(config: Config) -> Harness {
    setup_logging_lite().ok();
    let (transport, endpoint) = loopback::pair();
    let nvs = Arc::new(SnapshotNvs::new());
    let device = Arc::new(Mutex::new(FakeDevice::new(endpoint.clone(), nvs.clone())));

    let handler_device = device.clone();
    let responder = Responder::spawn(endpoint.clone(), move |frame| {
        let (delay, replies) = {
            let mut device = handler_device.lock();
            (device.reply_delay, device.handle(frame))
        };
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        replies
    })
    .unwrap();

    let core = Core::new(Box::new(transport), config)
        .unwrap()
        .with_nvs(nvs.clone());
    Harness {
        core,
        device,
        endpoint,
        nvs,
        _responder: responder,
    }
}

impl Harness {
    fn frames_received(&self) -> usize {
        self.device.lock().received.len()
    }
}

/// Opens x1E02_Manuf with the long password and enables manufacturing
async fn enable_manufacturing(core: &Core) -> h1e02::GetInfoResponse {
    let auth = core.auth(DEVICE);
    let session = auth.start_session(AccountName::Manufacturing).await.unwrap();
    assert!(session.long_password);
    assert_eq!(
        auth.passwd0(AccountName::Manufacturing, block(0..16)).await,
        Ok(SessionState::AwaitingPasswd1)
    );
    assert_eq!(
        auth.passwd1(AccountName::Manufacturing, block(16..32)).await,
        Ok(SessionState::Authenticated)
    );
    auth.enable_features(h1e02::BitMap {
        manufacturing: true,
        ..Default::default()
    })
    .await
    .unwrap()
}

// ----- Tests -----

/// Short request round trip, then a cached lookup
#[tokio::test]
async fn short_request_round_trip() {
    let h = harness(config());

    // Two lookups first so the next request gets software id 3
    assert_eq!(h.core.get_feature_index(DEVICE, 0x0001).await.unwrap().feature_index, 1);
    assert_eq!(h.core.get_feature_index(DEVICE, 0x1602).await.unwrap().feature_index, 3);

    let entry = h.core.get_feature_index(DEVICE, 0x1861).await.unwrap();
    assert_eq!(entry.feature_index, 0x05);
    assert_eq!(
        h.device.lock().received.last().unwrap(),
        &vec![0x10, 0x01, 0x00, 0x03, 0x18, 0x61, 0x00]
    );
    let expected_reply = h0000::GetFeatureResponse {
        feature_index: 0x05,
        flags: FeatureFlags::default(),
        version: 0,
    }
    .encode(DEVICE, 0x00, 0x3)
    .unwrap();
    assert_eq!(&expected_reply[..], &[0x10, 0x01, 0x00, 0x03, 0x05, 0x00, 0x00]);

    let sent = h.frames_received();
    assert_eq!(h.core.get_feature_index(DEVICE, 0x1861).await, Ok(entry));
    assert_eq!(h.core.registry(DEVICE).cached(0x1861), Some(Lookup::Present(entry)));
    assert_eq!(h.frames_received(), sent);
}

/// Index 0 is cached as not supported
#[tokio::test]
async fn unsupported_feature_is_cached() {
    let h = harness(config());
    let missing = CoreError::NotSupported { feature_id: 0x2201 };
    assert_eq!(h.core.get_feature_index(DEVICE, 0x2201).await, Err(missing.clone()));

    let sent = h.frames_received();
    assert_eq!(h.core.get_feature_index(DEVICE, 0x2201).await, Err(missing));
    assert_eq!(h.frames_received(), sent);
}

/// FeatureSet walk fills the registry
#[tokio::test]
async fn enumerate_features() {
    let h = harness(config());
    let entries = h.core.enumerate_features(DEVICE).await.unwrap();
    let ids: Vec<u16> = entries.iter().map(|entry| entry.feature_id).collect();
    assert_eq!(ids, FEATURES[1..].to_vec());

    let sent = h.frames_received();
    assert_eq!(h.core.get_feature_index(DEVICE, 0x1E02).await.unwrap().feature_index, 4);
    assert_eq!(h.frames_received(), sent);
}

/// Long password authentication unlocks manufacturing
#[tokio::test]
async fn long_password_authentication() {
    let h = harness(config());
    let info = enable_manufacturing(&h.core).await;
    assert!(info.state.manufacturing);
    assert!(!info.state.compliance);
    assert!(!info.state.gothard);
    assert_eq!(h.core.auth(DEVICE).deactivatable(), info);

    // Compliance was never authenticated
    assert_eq!(
        h.core
            .auth(DEVICE)
            .enable_features(h1e02::BitMap {
                compliance: true,
                ..Default::default()
            })
            .await,
        Err(CoreError::NotAuthenticated)
    );
    assert_eq!(h.core.auth(DEVICE).get_react_info().await, Ok(0x1602));
}

/// One shot authenticate and the failure path
#[tokio::test]
async fn authenticate_whole_password() {
    let h = harness(config());
    let auth = h.core.auth(DEVICE);

    auth.start_session(AccountName::Compliance).await.unwrap();
    // Long password accounts take 32 bytes
    assert!(matches!(
        auth.authenticate(AccountName::Compliance, &PASSWORD[..16]).await,
        Err(CoreError::Codec(_))
    ));
    assert_eq!(
        auth.authenticate(AccountName::Compliance, &PASSWORD).await,
        Ok(SessionState::Authenticated)
    );

    let mut wrong = PASSWORD;
    wrong[31] ^= 0xFF;
    auth.start_session(AccountName::Gotthard).await.unwrap();
    assert_eq!(
        auth.authenticate(AccountName::Gotthard, &wrong).await,
        Err(CoreError::AuthFailed)
    );
    assert_eq!(auth.state(AccountName::Gotthard), SessionState::Idle);
    assert_eq!(auth.state(AccountName::Compliance), SessionState::Authenticated);
}

/// Device reset invalidates the registry, the sessions and manufacturing
#[tokio::test]
async fn device_reset_clears_manufacturing() {
    let h = harness(config());
    enable_manufacturing(&h.core).await;
    let auth = h.core.auth(DEVICE);
    assert!(h.core.registry(DEVICE).cached(h1e02::FEATURE_ID).is_some());

    h.core.reset_device().unwrap();
    assert_eq!(h.endpoint.reset_requests(), 1);
    assert_eq!(h.core.registry(DEVICE).cached(h1e02::FEATURE_ID), None);
    assert_eq!(auth.state(AccountName::Manufacturing), SessionState::Idle);
    assert_eq!(auth.deactivatable().state, h1e02::BitMap::default());

    let info = auth.get_info().await.unwrap();
    assert_eq!(info.state, h1e02::BitMap::default());
    assert_eq!(
        auth.enable_features(h1e02::BitMap {
            manufacturing: true,
            ..Default::default()
        })
        .await,
        Err(CoreError::NotAuthenticated)
    );
}

/// Out of band resets run the same invalidation
#[tokio::test]
async fn signalled_reset_invalidates_registry() {
    let h = harness(config());
    h.core.get_feature_index(DEVICE, 0x1602).await.unwrap();
    h.endpoint.signal_reset();

    let registry = h.core.registry(DEVICE);
    for _ in 0..100 {
        if registry.cached(0x1602).is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(registry.cached(0x1602), None);
}

/// Three fragment VLP event, then the same stream with seq 1 lost
#[tokio::test]
async fn vlp_reassembly() {
    let h = harness(config());
    let events = h.core.dispatcher().subscribe_raw(Some(DEVICE), 0x02, Some(0x0));
    let fragment = |control: u8, data: u8| vec![0x13, DEVICE, 0x02, 0x00, control, data];

    h.endpoint.send(&fragment(0x80, 0xAA)).unwrap();
    h.endpoint.send(&fragment(0x01, 0xBB)).unwrap();
    h.endpoint.send(&fragment(0x42, 0xCC)).unwrap();
    let packet = events.recv(Duration::from_secs(1)).await.unwrap();
    assert_eq!(packet.header.report_id, ReportId::VlpNormal);
    assert_eq!(packet.payload, vec![0xAA, 0xBB, 0xCC]);

    h.endpoint.send(&fragment(0x80, 0xAA)).unwrap();
    h.endpoint.send(&fragment(0x42, 0xCC)).unwrap();
    match h.core.dispatcher().errors().recv(Duration::from_secs(1)).await {
        Some(InboundError::VlpGap { key, expected, got }) => {
            assert_eq!(key.device_index, DEVICE);
            assert_eq!((expected, got), (1, 2));
        }
        other => panic!("expected a VLP gap, got {:?}", other),
    }
    assert!(events.is_empty());
}

/// Pairing at 20 bits, bond reuse and bond loss
#[tokio::test]
async fn pairing_with_entropy() {
    let h = harness(config());
    let pairing = h.core.pairing(RECEIVER_INDEX);

    let peer = pairing.discover().await.unwrap();
    assert_eq!(peer.bluetooth_address, PEER);
    assert_eq!(peer.auth_method, AuthMethod::PasskeyDigits);
    assert_eq!(pairing.state(), PairingState::Discovered);

    let passkey = pairing
        .start_pairing(PEER, AuthMethod::PasskeyDigits, 20)
        .await
        .unwrap();
    assert_eq!(passkey, "042137");
    assert_eq!(pairing.state(), PairingState::AwaitingPasskey);

    let context = pairing.finish_pairing().await.unwrap();
    assert_eq!(context.state, PairingState::Bonded);
    assert_eq!(context.slot, Some(SLOT));
    assert_eq!(context.ltk, Some(LTK));
    assert_eq!(context.entropy_bits, 20);

    let context = pairing.wait_connection().await.unwrap();
    assert_eq!(context.state, PairingState::Connected);

    // The next connection reuses the stored key
    let context = pairing.reconnect().await.unwrap();
    assert_eq!(context.state, PairingState::Connected);
    assert_eq!(h.nvs.bond(SLOT).unwrap().map(|record| record.ltk), context.ltk);

    h.core.reset_device().unwrap();
    let context = pairing.context();
    assert_eq!(context.state, PairingState::Bonded);
    assert!(context.verify_on_reconnect);
    assert!(!pairing.reconnect().await.unwrap().verify_on_reconnect);

    h.nvs.clear_bond(SLOT);
    assert_eq!(pairing.reconnect().await, Err(CoreError::BondLost { slot: SLOT }));
    assert_eq!(pairing.state(), PairingState::Unpaired);
}

/// `pair` requests the configured entropy
#[tokio::test]
async fn pair_uses_configured_entropy() {
    let h = harness(Config {
        entropy_bits: 12,
        ..config()
    });
    let pairing = h.core.pairing(RECEIVER_INDEX);

    let peer = pairing.discover().await.unwrap();
    assert_eq!(pairing.pair(&peer).await.unwrap(), "042");
    assert_eq!(pairing.context().entropy_bits, 12);
    pairing.cancel().await.unwrap();
}

/// Name parts of a discovery carry no address
#[tokio::test]
async fn discovery_waits_for_configuration_part() {
    let h = harness(config());
    h.device.lock().name_part_first = true;
    let pairing = h.core.pairing(RECEIVER_INDEX);

    let peer = pairing.discover().await.unwrap();
    assert_eq!(peer.bluetooth_address, PEER);
    assert_eq!(peer.auth_method, AuthMethod::PasskeyDigits);
    assert_eq!(peer.auth_entropy, 20);
    assert_eq!(pairing.context().peer_address, PEER);
}

/// A bonded peer that never links up leaves the receiver unpaired
#[tokio::test]
async fn missing_link_up_unpairs() {
    let h = harness(Config {
        pairing_timeout_ms: 300,
        ..config()
    });
    h.device.lock().link_up = false;
    let pairing = h.core.pairing(RECEIVER_INDEX);

    pairing.discover().await.unwrap();
    pairing
        .start_pairing(PEER, AuthMethod::PasskeyDigits, 20)
        .await
        .unwrap();
    assert_eq!(pairing.finish_pairing().await.unwrap().state, PairingState::Bonded);

    assert_eq!(pairing.wait_connection().await, Err(CoreError::Timeout));
    let context = pairing.context();
    assert_eq!(context.state, PairingState::Unpaired);
    assert_eq!(context.slot, None);
    assert_eq!(context.ltk, None);
}

/// A peer limited to 16 bits gets a 4 digit passkey
#[tokio::test]
async fn entropy_negotiated_down() {
    let h = harness(config());
    h.device.lock().peer_entropy = 16;
    let pairing = h.core.pairing(RECEIVER_INDEX);

    pairing.discover().await.unwrap();
    assert!(matches!(
        pairing.start_pairing(PEER, AuthMethod::PasskeyDigits, 21).await,
        Err(CoreError::Config(_))
    ));
    let passkey = pairing
        .start_pairing(PEER, AuthMethod::PasskeyDigits, 20)
        .await
        .unwrap();
    assert_eq!(passkey, "0421");
    assert_eq!(pairing.context().entropy_bits, 16);

    pairing.cancel().await.unwrap();
    assert_eq!(pairing.state(), PairingState::Unpaired);
    assert!(matches!(
        pairing.finish_pairing().await,
        Err(CoreError::Pairing(_))
    ));
}

/// A reply after the timeout is delivered as an orphan
#[tokio::test]
async fn orphan_reply_on_timeout() {
    let h = harness(config());
    h.device.lock().reply_delay = Some(Duration::from_millis(150));

    let result = h
        .core
        .dispatcher()
        .send(DEVICE, 0x01, &h0001::GetCount, Duration::from_millis(100))
        .await;
    assert_eq!(result, Err(CoreError::Timeout));

    let orphan = h
        .core
        .dispatcher()
        .orphans()
        .recv(Duration::from_secs(1))
        .await
        .unwrap();
    let request = Header::parse(h.device.lock().received.last().unwrap()).unwrap();
    assert_eq!(orphan.key.device_index, DEVICE);
    assert_eq!(orphan.key.feature_index, 0x01);
    assert_eq!(orphan.key.software_id, request.software_id);
    let count = h0001::GetCountResponse::from_packet(&orphan.reply.unwrap()).unwrap();
    assert_eq!(count.count, 5);
    assert!(h.core.dispatcher().unclaimed().is_empty());
}
