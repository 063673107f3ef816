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

//! BLE pairing through a receiver
//!
//! Drives the receiver's PerformDeviceDiscovery / PerformDeviceConnection
//! registers and follows the notifications they trigger.

// ----- Crates -----

use crate::config::{Config, MAX_ENTROPY_BITS, MIN_ENTROPY_BITS};
use crate::dispatcher::{Dispatcher, SubscriberKey, Subscription};
use crate::error::CoreError;
use crate::nvs::NvsReader;
use hidpp_protocol::features::Message;
use hidpp_protocol::hidpp10::{
    self, passkey_digits, AuthMethod, BluetoothAddress, ConnectAction, DeviceConnection,
    DeviceDiscovery, DiscoveryAction, DisplayPassKeyKey, KeyCode, PairingErrorType,
    PairingStatus, PairingStatusCode, RequestDisplayPassKey,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ----- Enumerations -----

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum PairingState {
    Unpaired,
    Discovered,
    AuthMethodNegotiating,
    AwaitingPasskey,
    AwaitingEndOfSequence,
    Bonding,
    Bonded,
    Connected,
}

// ----- Structs -----

/// Peer reported by a discovery
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct Peer {
    pub bluetooth_address: BluetoothAddress,
    pub device_type: u8,
    pub auth_method: AuthMethod,
    /// Highest passkey entropy the peer supports
    pub auth_entropy: u8,
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct PairingContext {
    /// Receiver pairing slot, known once bonded
    pub slot: Option<u8>,
    pub peer_address: BluetoothAddress,
    pub auth_method: AuthMethod,
    /// Effective passkey entropy
    pub entropy_bits: u8,
    pub ltk: Option<[u8; 16]>,
    pub state: PairingState,
    /// Set by a device reset, cleared by [`Pairing::reconnect`]
    pub verify_on_reconnect: bool,
}

impl Default for PairingContext {
    fn default() -> Self {
        PairingContext {
            slot: None,
            peer_address: [0; 6],
            auth_method: AuthMethod::None,
            entropy_bits: 0,
            ltk: None,
            state: PairingState::Unpaired,
            verify_on_reconnect: false,
        }
    }
}

/// Receiver notifications followed while pairing
struct Events {
    discovery: Subscription<DeviceDiscovery>,
    status: Subscription<PairingStatus>,
    passkey: Subscription<RequestDisplayPassKey>,
    keys: Subscription<DisplayPassKeyKey>,
    /// Connection events carry the slot as device index
    connection: Subscription<(u8, DeviceConnection)>,
}

impl Events {
    fn clear(&self) {
        self.discovery.clear();
        self.status.clear();
        self.passkey.clear();
        self.keys.clear();
        self.connection.clear();
    }
}

/// Pairing state machine of one receiver
pub struct Pairing {
    dispatcher: Arc<Dispatcher>,
    receiver_index: u8,
    request_timeout: Duration,
    pairing_timeout: Duration,
    /// Entropy requested by [`Pairing::pair`]
    entropy_bits: u8,
    nvs: Option<Arc<dyn NvsReader>>,
    events: Events,
    context: Mutex<PairingContext>,
    /// Serializes pairing flows
    flow: tokio::sync::Mutex<()>,
}

fn decode_connection(
    packet: &hidpp_protocol::Packet,
) -> Result<(u8, DeviceConnection), hidpp_protocol::HidppParseError> {
    Ok((
        packet.header.device_index,
        DeviceConnection::from_packet(packet)?,
    ))
}

impl Pairing {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        receiver_index: u8,
        config: &Config,
        nvs: Option<Arc<dyn NvsReader>>,
    ) -> Pairing {
        let receiver = Some(receiver_index);
        let events = Events {
            discovery: dispatcher.subscribe(receiver, 0),
            status: dispatcher.subscribe(receiver, 0),
            passkey: dispatcher.subscribe(receiver, 0),
            keys: dispatcher.subscribe(receiver, 0),
            connection: dispatcher.subscribe_with(
                SubscriberKey {
                    device_index: None,
                    feature_index: hidpp10::DEVICE_CONNECTION,
                    function_id: None,
                },
                decode_connection,
            ),
        };

        Pairing {
            dispatcher,
            receiver_index,
            request_timeout: config.request_timeout(),
            pairing_timeout: config.pairing_timeout(),
            entropy_bits: config.entropy_bits,
            nvs,
            events,
            context: Mutex::new(PairingContext::default()),
            flow: tokio::sync::Mutex::new(()),
        }
    }

    pub fn context(&self) -> PairingContext {
        *self.context.lock()
    }

    pub fn state(&self) -> PairingState {
        self.context.lock().state
    }

    fn set_state(&self, state: PairingState) {
        let mut context = self.context.lock();
        debug!("Pairing {:?} -> {:?}", context.state, state);
        context.state = state;
    }

    /// Abandons the flow in progress
    fn fail(&self, error: CoreError) -> CoreError {
        warn!("Pairing failed in {:?} - {}", self.state(), error);
        *self.context.lock() = PairingContext::default();
        error
    }

    /// Next event of `subscription` within the pairing timeout
    async fn next<T>(
        &self,
        subscription: &Subscription<T>,
        deadline: Instant,
        what: &str,
    ) -> Result<T, CoreError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match subscription.recv(remaining).await {
            Ok(event) => Ok(event),
            Err(CoreError::Timeout) => {
                warn!("No {} notification", what);
                Err(self.fail(CoreError::Timeout))
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn connect_action(
        &self,
        action: ConnectAction,
        bluetooth_address: BluetoothAddress,
        auth_method: AuthMethod,
        auth_entropy: u8,
    ) -> Result<(), CoreError> {
        let _: hidpp10::SetPerformDeviceConnectionResponse = self
            .dispatcher
            .request(
                self.receiver_index,
                0,
                &hidpp10::SetPerformDeviceConnection {
                    action,
                    bluetooth_address,
                    auth_method,
                    auth_entropy,
                },
                self.request_timeout,
            )
            .await?;
        Ok(())
    }

    /// Starts a discovery and waits for the first peer
    pub async fn discover(&self) -> Result<Peer, CoreError> {
        let _flow = self.flow.lock().await;
        self.events.clear();
        let deadline = Instant::now() + self.pairing_timeout;

        let _: hidpp10::SetPerformDeviceDiscoveryResponse = self
            .dispatcher
            .request(
                self.receiver_index,
                0,
                &hidpp10::SetPerformDeviceDiscovery {
                    discovery_timeout: self.pairing_timeout.as_secs().min(u8::MAX.into()) as u8,
                    action: DiscoveryAction::Discover,
                },
                self.request_timeout,
            )
            .await?;

        let discovery = loop {
            let discovery = self
                .next(&self.events.discovery, deadline, "device discovery")
                .await?;
            if discovery.notification_part == hidpp10::DISCOVERY_PART_CONFIGURATION {
                break discovery;
            }
            trace!("Skipping discovery part {}", discovery.notification_part);
        };
        let peer = Peer {
            bluetooth_address: discovery.bluetooth_address,
            device_type: discovery.device_type,
            auth_method: discovery.auth_method(),
            auth_entropy: discovery.auth_entropy,
        };
        info!("Discovered {:02x?} ({:?})", peer.bluetooth_address, peer.auth_method);

        *self.context.lock() = PairingContext {
            peer_address: peer.bluetooth_address,
            auth_method: peer.auth_method,
            entropy_bits: peer.auth_entropy,
            state: PairingState::Discovered,
            ..Default::default()
        };
        Ok(peer)
    }

    /// Requests pairing with `peer` at the configured entropy
    pub async fn pair(&self, peer: &Peer) -> Result<String, CoreError> {
        self.start_pairing(peer.bluetooth_address, peer.auth_method, self.entropy_bits)
            .await
    }

    /// Requests pairing with the discovered peer, returns the passkey to type
    ///
    /// # Remarks
    /// The effective entropy is the lower of `entropy_bits` and what the peer
    /// advertised. The passkey length must match it.
    pub async fn start_pairing(
        &self,
        bluetooth_address: BluetoothAddress,
        auth_method: AuthMethod,
        entropy_bits: u8,
    ) -> Result<String, CoreError> {
        let _flow = self.flow.lock().await;
        if !(MIN_ENTROPY_BITS..=MAX_ENTROPY_BITS).contains(&entropy_bits) {
            return Err(CoreError::Config(format!(
                "entropy_bits {} outside {}..={}",
                entropy_bits, MIN_ENTROPY_BITS, MAX_ENTROPY_BITS
            )));
        }

        let context = self.context();
        if context.state != PairingState::Discovered || context.peer_address != bluetooth_address {
            return Err(CoreError::Pairing(format!(
                "{:02x?} was not discovered (state {:?})",
                bluetooth_address, context.state
            )));
        }
        // 0 means the peer did not advertise a limit
        let offered = match context.entropy_bits {
            0 => entropy_bits,
            device => device.min(entropy_bits),
        };
        let entropy = offered.clamp(MIN_ENTROPY_BITS, MAX_ENTROPY_BITS);
        if entropy != entropy_bits {
            info!("Entropy negotiated down to {} bits", entropy);
        }

        self.events.clear();
        let deadline = Instant::now() + self.pairing_timeout;
        {
            let mut context = self.context.lock();
            context.auth_method = auth_method;
            context.entropy_bits = entropy;
            context.state = PairingState::AuthMethodNegotiating;
        }
        if let Err(e) = self
            .connect_action(ConnectAction::Pairing, bluetooth_address, auth_method, entropy)
            .await
        {
            return Err(self.fail(e));
        }

        let status = self
            .next(&self.events.status, deadline, "pairing start")
            .await?;
        if status.status != PairingStatusCode::Start {
            return Err(self.fail(CoreError::Pairing(format!(
                "pairing refused ({:?}, {:?})",
                status.status, status.error_type
            ))));
        }

        let request = self
            .next(&self.events.passkey, deadline, "display passkey")
            .await?;
        let digits = passkey_digits(entropy);
        if usize::from(request.passkey_length) != digits {
            return Err(self.fail(CoreError::Pairing(format!(
                "{} passkey digits for {} bits of entropy, expected {}",
                request.passkey_length, entropy, digits
            ))));
        }
        let passkey = match request.passkey() {
            Ok(passkey) => passkey.to_string(),
            Err(e) => return Err(self.fail(e.into())),
        };

        self.set_state(PairingState::AwaitingPasskey);
        Ok(passkey)
    }

    /// Follows the passkey entry and the bonding until the receiver assigns a slot
    pub async fn finish_pairing(&self) -> Result<PairingContext, CoreError> {
        let _flow = self.flow.lock().await;
        let context = self.context();
        if context.state != PairingState::AwaitingPasskey {
            return Err(CoreError::Pairing(format!(
                "no passkey requested (state {:?})",
                context.state
            )));
        }
        let deadline = Instant::now() + self.pairing_timeout;
        let digits = passkey_digits(context.entropy_bits);

        let first = self
            .next(&self.events.keys, deadline, "passkey entry start")
            .await?;
        if first.key_code != KeyCode::PasskeyEntryStarted {
            return Err(self.fail(CoreError::Pairing(format!(
                "passkey entry reported {:?} before it started",
                first.key_code
            ))));
        }

        let mut entered: usize = 0;
        loop {
            let key = self.next(&self.events.keys, deadline, "passkey key").await?;
            match key.key_code {
                KeyCode::PasskeyDigitEntered => entered += 1,
                KeyCode::PasskeyDigitErased => entered = entered.saturating_sub(1),
                KeyCode::PasskeyCleared => entered = 0,
                KeyCode::PasskeyEntryStarted => debug!("Passkey entry restarted"),
                KeyCode::PasskeyEntryCompleted => {
                    if entered != digits {
                        return Err(self.fail(CoreError::Pairing(format!(
                            "passkey completed after {} of {} digits",
                            entered, digits
                        ))));
                    }
                    break;
                }
            }
            trace!("{} of {} passkey digits", entered, digits);
            self.set_state(if entered >= digits {
                PairingState::AwaitingEndOfSequence
            } else {
                PairingState::AwaitingPasskey
            });
        }
        self.set_state(PairingState::Bonding);

        let slot = loop {
            let status = self
                .next(&self.events.status, deadline, "pairing stop")
                .await?;
            match (status.status, status.error_type) {
                (PairingStatusCode::Stop, PairingErrorType::NoError) => break status.pairing_slot,
                (PairingStatusCode::Start, _) => continue,
                (code, error) => {
                    return Err(
                        self.fail(CoreError::Pairing(format!("bonding {:?} ({:?})", code, error)))
                    )
                }
            }
        };

        let ltk = self.read_ltk(slot, context.peer_address)?;
        let mut context = self.context.lock();
        context.slot = Some(slot);
        context.ltk = ltk;
        context.state = PairingState::Bonded;
        info!("Bonded {:02x?} in slot {}", context.peer_address, slot);
        Ok(*context)
    }

    fn read_ltk(
        &self,
        slot: u8,
        peer_address: BluetoothAddress,
    ) -> Result<Option<[u8; 16]>, CoreError> {
        let nvs = match &self.nvs {
            Some(nvs) => nvs,
            None => {
                debug!("No NVS reader, LTK of slot {} unknown", slot);
                return Ok(None);
            }
        };
        match nvs.bond(slot)? {
            Some(record) if record.peer_address == peer_address => Ok(Some(record.ltk)),
            Some(record) => {
                warn!(
                    "NVS slot {} holds {:02x?}, not {:02x?}",
                    slot, record.peer_address, peer_address
                );
                Ok(None)
            }
            None => {
                warn!("No NVS bond record for slot {}", slot);
                Ok(None)
            }
        }
    }

    /// Waits for the bonded peer's link
    pub async fn wait_connection(&self) -> Result<PairingContext, CoreError> {
        let _flow = self.flow.lock().await;
        let context = self.context();
        let slot = match (context.state, context.slot) {
            (PairingState::Bonded, Some(slot)) => slot,
            (state, _) => {
                return Err(CoreError::Pairing(format!("not bonded (state {:?})", state)))
            }
        };

        let deadline = Instant::now() + self.pairing_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.connection.recv(remaining).await {
                Ok((device_index, connection))
                    if device_index == slot && connection.link_established =>
                {
                    break
                }
                Ok((device_index, _)) => trace!("Ignoring connection event of {:02x}", device_index),
                Err(e) => {
                    warn!("Slot {} did not connect", slot);
                    return Err(self.fail(e));
                }
            }
        }

        self.set_state(PairingState::Connected);
        info!("Slot {} connected", slot);
        Ok(self.context())
    }

    /// Cancels the pairing in progress
    pub async fn cancel(&self) -> Result<(), CoreError> {
        let context = self.context();
        self.events.status.clear();
        self.connect_action(
            ConnectAction::CancelPairing,
            context.peer_address,
            AuthMethod::None,
            0,
        )
        .await?;

        let deadline = Instant::now() + self.request_timeout;
        let result = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.status.recv(remaining).await {
                Ok(status) if status.status == PairingStatusCode::Cancel => break Ok(()),
                Ok(_) => continue,
                Err(e) => break Err(e),
            }
        };
        *self.context.lock() = PairingContext::default();
        info!("Pairing cancelled");
        result
    }

    /// Removes the bond of the current peer
    pub async fn unpair(&self) -> Result<(), CoreError> {
        let _flow = self.flow.lock().await;
        let context = self.context();
        if context.slot.is_none() {
            return Err(CoreError::Pairing("nothing to unpair".to_string()));
        }
        self.connect_action(
            ConnectAction::Unpairing,
            context.peer_address,
            AuthMethod::None,
            0,
        )
        .await?;
        *self.context.lock() = PairingContext::default();
        info!("Unpaired {:02x?}", context.peer_address);
        Ok(())
    }

    /// Checks the cached LTK against NVS before reusing a bond
    ///
    /// A missing or different record means the device lost the bond:
    /// the context falls back to Unpaired and [`CoreError::BondLost`] is returned.
    pub async fn reconnect(&self) -> Result<PairingContext, CoreError> {
        let _flow = self.flow.lock().await;
        let context = self.context();
        let slot = context
            .slot
            .ok_or_else(|| CoreError::Pairing("no bond to reconnect".to_string()))?;
        let nvs = self
            .nvs
            .as_ref()
            .ok_or_else(|| CoreError::Pairing("no NVS reader".to_string()))?;

        match nvs.bond(slot)? {
            Some(record) if context.ltk == Some(record.ltk) => {
                let mut context = self.context.lock();
                context.verify_on_reconnect = false;
                if context.state == PairingState::Connected {
                    return Ok(*context);
                }
                context.state = PairingState::Bonded;
                debug!("Bond of slot {} verified", slot);
                Ok(*context)
            }
            _ => {
                warn!("Bond of slot {} lost", slot);
                *self.context.lock() = PairingContext::default();
                Err(CoreError::BondLost { slot })
            }
        }
    }

    /// Device reset: a bond must be verified again, a flow in progress is lost
    pub fn device_reset(&self) {
        let mut context = self.context.lock();
        match context.state {
            PairingState::Bonded | PairingState::Connected => {
                context.state = PairingState::Bonded;
                context.verify_on_reconnect = true;
            }
            PairingState::Unpaired => {}
            state => {
                info!("Pairing in {:?} lost to device reset", state);
                *context = PairingContext::default();
            }
        }
    }
}
