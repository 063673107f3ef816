/* Copyright (C) 2017-2022 by Jacob Alexander
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to deal
 * in the Software without restriction, including without limitation the rights
 * to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
 * copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
 * OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
 * THE SOFTWARE.
 */

//! HID++ 1.0 receiver registers and notifications used for pairing
//!
//! Register requests are addressed with a sub id (0x80 set, 0x81 get,
//! 0x82 set long, 0x83 get long) and the register address in byte 3.
//! Notifications use sub ids below 0x80 and carry data in byte 3.

// ----- Crates -----

use crate::bitfield::{Check, Field, Values};
use crate::features::{empty_message, Message, Route};
use crate::{HidppParseError, ReportId};
use num_enum::{IntoPrimitive, TryFromPrimitive};

// ----- Constants -----

pub const SET_REGISTER: u8 = 0x80;
pub const GET_REGISTER: u8 = 0x81;
pub const SET_LONG_REGISTER: u8 = 0x82;
pub const GET_LONG_REGISTER: u8 = 0x83;

pub const PERFORM_DEVICE_DISCOVERY: u8 = 0xC0;
pub const PERFORM_DEVICE_CONNECTION: u8 = 0xC1;

pub const DEVICE_DISCONNECTION: u8 = 0x40;
pub const DEVICE_CONNECTION: u8 = 0x41;
pub const REQUEST_DISPLAY_PASSKEY: u8 = 0x4D;
pub const DISPLAY_PASSKEY_KEY: u8 = 0x4E;
pub const DEVICE_DISCOVERY: u8 = 0x4F;
pub const DISCOVERY_STATUS: u8 = 0x53;
pub const PAIRING_STATUS: u8 = 0x54;

/// Largest passkey the receiver displays
pub const MAX_PASSKEY_DIGITS: usize = 6;

/// DeviceDiscovery part carrying the address and auth fields, name parts follow
pub const DISCOVERY_PART_CONFIGURATION: u8 = 0;

/// Bluetooth device address, as sent on the wire
pub type BluetoothAddress = [u8; 6];

// ----- Enumerations -----

#[repr(u8)]
#[derive(PartialEq, Eq, Clone, Copy, Debug, IntoPrimitive, TryFromPrimitive)]
pub enum DiscoveryAction {
    Discover = 0x01,
    Cancel = 0x02,
}

#[repr(u8)]
#[derive(PartialEq, Eq, Clone, Copy, Debug, IntoPrimitive, TryFromPrimitive)]
pub enum ConnectAction {
    Pairing = 0x01,
    CancelPairing = 0x02,
    Unpairing = 0x03,
}

#[repr(u8)]
#[derive(PartialEq, Eq, Clone, Copy, Debug, IntoPrimitive, TryFromPrimitive)]
pub enum PairingStatusCode {
    Start = 0x00,
    Stop = 0x01,
    Cancel = 0x02,
}

#[repr(u8)]
#[derive(PartialEq, Eq, Clone, Copy, Debug, IntoPrimitive, TryFromPrimitive)]
pub enum PairingErrorType {
    NoError = 0x00,
    Timeout = 0x01,
    Failed = 0x02,
}

#[repr(u8)]
#[derive(PartialEq, Eq, Clone, Copy, Debug, IntoPrimitive, TryFromPrimitive)]
pub enum KeyCode {
    PasskeyEntryStarted = 0x00,
    PasskeyDigitEntered = 0x01,
    PasskeyDigitErased = 0x02,
    PasskeyCleared = 0x03,
    PasskeyEntryCompleted = 0x04,
}

/// Authentication method offered or selected for a peer
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum AuthMethod {
    /// Keyboard style passkey entry
    PasskeyDigits,
    /// Mouse style entry through left/right button presses
    Passkey2Buttons,
    None,
}

impl AuthMethod {
    fn from_bits(passkey: bool, emu_2buttons: bool) -> AuthMethod {
        match (passkey, emu_2buttons) {
            (true, _) => AuthMethod::PasskeyDigits,
            (false, true) => AuthMethod::Passkey2Buttons,
            _ => AuthMethod::None,
        }
    }
}

// ----- Registers -----

/// PerformDeviceDiscovery (0xC0), set register
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct SetPerformDeviceDiscovery {
    /// Seconds, 0 uses the receiver default
    pub discovery_timeout: u8,
    pub action: DiscoveryAction,
}

impl Message for SetPerformDeviceDiscovery {
    const REPORT_ID: ReportId = ReportId::Short;
    const ROUTE: Route = Route::Register {
        sub_id: SET_REGISTER,
        address: PERFORM_DEVICE_DISCOVERY,
    };
    const FIELDS: &'static [Field] = &[
        Field::new("discovery_timeout", 8),
        Field::new("discover_devices", 8).with_check(Check::Range { min: 1, max: 2 }),
        Field::padding(8),
    ];

    fn to_values(&self) -> Values {
        Values::new()
            .with("discovery_timeout", self.discovery_timeout)
            .with("discover_devices", u8::from(self.action))
    }

    fn from_values(values: &Values) -> Result<Self, HidppParseError> {
        let action = values.u8("discover_devices")?;
        Ok(SetPerformDeviceDiscovery {
            discovery_timeout: values.u8("discovery_timeout")?,
            action: DiscoveryAction::try_from(action).map_err(|_| {
                HidppParseError::InvalidField {
                    field: "discover_devices",
                    value: action.into(),
                }
            })?,
        })
    }
}

empty_message!(
    /// Acknowledgement of a PerformDeviceDiscovery write
    SetPerformDeviceDiscoveryResponse,
    ReportId::Short,
    Route::Register {
        sub_id: SET_REGISTER,
        address: PERFORM_DEVICE_DISCOVERY,
    },
    &[Field::padding(24)]
);

/// PerformDeviceConnection (0xC1), set long register
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct SetPerformDeviceConnection {
    pub action: ConnectAction,
    pub bluetooth_address: BluetoothAddress,
    pub auth_method: AuthMethod,
    /// Requested passkey entropy in bits
    pub auth_entropy: u8,
}

impl Message for SetPerformDeviceConnection {
    const REPORT_ID: ReportId = ReportId::Long;
    const ROUTE: Route = Route::Register {
        sub_id: SET_LONG_REGISTER,
        address: PERFORM_DEVICE_CONNECTION,
    };
    const FIELDS: &'static [Field] = &[
        Field::new("connect_devices", 8).with_check(Check::Range { min: 1, max: 3 }),
        Field::new("bluetooth_address", 48),
        Field::new("reserved", 6),
        Field::new("passkey_auth_method", 1),
        Field::new("emu_2buttons_auth_method", 1),
        Field::new("auth_entropy", 8),
        Field::padding(56),
    ];

    fn to_values(&self) -> Values {
        Values::new()
            .with("connect_devices", u8::from(self.action))
            .with("bluetooth_address", self.bluetooth_address)
            .with(
                "passkey_auth_method",
                self.auth_method == AuthMethod::PasskeyDigits,
            )
            .with(
                "emu_2buttons_auth_method",
                self.auth_method == AuthMethod::Passkey2Buttons,
            )
            .with("auth_entropy", self.auth_entropy)
    }

    fn from_values(values: &Values) -> Result<Self, HidppParseError> {
        let action = values.u8("connect_devices")?;
        Ok(SetPerformDeviceConnection {
            action: ConnectAction::try_from(action).map_err(|_| HidppParseError::InvalidField {
                field: "connect_devices",
                value: action.into(),
            })?,
            bluetooth_address: bluetooth_address(values)?,
            auth_method: AuthMethod::from_bits(
                values.flag("passkey_auth_method")?,
                values.flag("emu_2buttons_auth_method")?,
            ),
            auth_entropy: values.u8("auth_entropy")?,
        })
    }
}

empty_message!(
    /// Acknowledgement of a PerformDeviceConnection write
    SetPerformDeviceConnectionResponse,
    ReportId::Short,
    Route::Register {
        sub_id: SET_LONG_REGISTER,
        address: PERFORM_DEVICE_CONNECTION,
    },
    &[Field::padding(24)]
);

// ----- Notifications -----

/// Address fields are 48 bits, carried as bytes by the codec
fn bluetooth_address(values: &Values) -> Result<BluetoothAddress, HidppParseError> {
    let value = values.int("bluetooth_address")?;
    let mut address = [0u8; 6];
    for (idx, byte) in address.iter_mut().enumerate() {
        *byte = (value >> (8 * (5 - idx))) as u8;
    }
    Ok(address)
}

fn enum_field<T: TryFrom<u8>>(values: &Values, field: &'static str) -> Result<T, HidppParseError> {
    let raw = values.u8(field)?;
    T::try_from(raw).map_err(|_| HidppParseError::InvalidField {
        field,
        value: raw.into(),
    })
}

/// DeviceDisconnection (0x40)
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct DeviceDisconnection {
    pub disconnection_type: u8,
}

impl Message for DeviceDisconnection {
    const REPORT_ID: ReportId = ReportId::Short;
    const ROUTE: Route = Route::Notification {
        sub_id: DEVICE_DISCONNECTION,
    };
    const FIELDS: &'static [Field] = &[
        Field::new("reserved", 8),
        Field::new("disconnection_type", 8),
        Field::padding(16),
    ];

    fn to_values(&self) -> Values {
        Values::new().with("disconnection_type", self.disconnection_type)
    }

    fn from_values(values: &Values) -> Result<Self, HidppParseError> {
        Ok(DeviceDisconnection {
            disconnection_type: values.u8("disconnection_type")?,
        })
    }
}

/// DeviceConnection (0x41)
///
/// The device index of the frame is the pairing slot.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct DeviceConnection {
    pub protocol_type: u8,
    pub link_established: bool,
    pub device_type: u8,
    pub wireless_pid: u16,
}

impl Message for DeviceConnection {
    const REPORT_ID: ReportId = ReportId::Short;
    const ROUTE: Route = Route::Notification {
        sub_id: DEVICE_CONNECTION,
    };
    const FIELDS: &'static [Field] = &[
        Field::new("protocol_type", 8),
        Field::new("reserved_0", 1),
        Field::new("link_not_established", 1),
        Field::new("reserved_1", 2),
        Field::new("device_type", 4),
        Field::new("wireless_pid", 16),
    ];

    fn to_values(&self) -> Values {
        Values::new()
            .with("protocol_type", self.protocol_type)
            .with("link_not_established", !self.link_established)
            .with("device_type", self.device_type & 0x0F)
            .with("wireless_pid", self.wireless_pid)
    }

    fn from_values(values: &Values) -> Result<Self, HidppParseError> {
        Ok(DeviceConnection {
            protocol_type: values.u8("protocol_type")?,
            link_established: !values.flag("link_not_established")?,
            device_type: values.u8("device_type")?,
            wireless_pid: values.u16("wireless_pid")?,
        })
    }
}

/// RequestDisplayPassKey (0x4D)
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct RequestDisplayPassKey {
    pub bluetooth_address: BluetoothAddress,
    pub passkey_length: u8,
    /// ASCII digits, only the first `passkey_length` are meaningful
    pub passkey_digits: [u8; MAX_PASSKEY_DIGITS],
}

impl RequestDisplayPassKey {
    /// Passkey digits as a string, leading zeros kept
    pub fn passkey(&self) -> Result<&str, HidppParseError> {
        let len = usize::from(self.passkey_length);
        let digits = self
            .passkey_digits
            .get(..len)
            .ok_or(HidppParseError::InvalidField {
                field: "passkey_length",
                value: len as u64,
            })?;
        if !digits.iter().all(u8::is_ascii_digit) {
            return Err(HidppParseError::InvalidField {
                field: "passkey_digits",
                value: 0,
            });
        }
        core::str::from_utf8(digits).map_err(|_| HidppParseError::InvalidField {
            field: "passkey_digits",
            value: 0,
        })
    }
}

impl Message for RequestDisplayPassKey {
    const REPORT_ID: ReportId = ReportId::Long;
    const ROUTE: Route = Route::Notification {
        sub_id: REQUEST_DISPLAY_PASSKEY,
    };
    const FIELDS: &'static [Field] = &[
        Field::new("reserved", 8),
        Field::new("bluetooth_address", 48),
        Field::new("passkey_length", 8).with_check(Check::Range {
            min: 0,
            max: MAX_PASSKEY_DIGITS as u64,
        }),
        Field::new("passkey_digits", 48),
        Field::padding(24),
    ];

    fn to_values(&self) -> Values {
        Values::new()
            .with("bluetooth_address", self.bluetooth_address)
            .with("passkey_length", self.passkey_length)
            .with("passkey_digits", self.passkey_digits)
    }

    fn from_values(values: &Values) -> Result<Self, HidppParseError> {
        let digits = values.int("passkey_digits")?;
        let mut passkey_digits = [0u8; MAX_PASSKEY_DIGITS];
        for (idx, byte) in passkey_digits.iter_mut().enumerate() {
            *byte = (digits >> (8 * (MAX_PASSKEY_DIGITS - 1 - idx))) as u8;
        }
        Ok(RequestDisplayPassKey {
            bluetooth_address: bluetooth_address(values)?,
            passkey_length: values.u8("passkey_length")?,
            passkey_digits,
        })
    }
}

/// DisplayPassKeyKey (0x4E), user progress while typing the passkey
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct DisplayPassKeyKey {
    pub key_code: KeyCode,
    pub bluetooth_address: BluetoothAddress,
}

impl Message for DisplayPassKeyKey {
    const REPORT_ID: ReportId = ReportId::Long;
    const ROUTE: Route = Route::Notification {
        sub_id: DISPLAY_PASSKEY_KEY,
    };
    const FIELDS: &'static [Field] = &[
        Field::new("key_code", 8),
        Field::new("bluetooth_address", 48),
        Field::padding(80),
    ];

    fn to_values(&self) -> Values {
        Values::new()
            .with("key_code", u8::from(self.key_code))
            .with("bluetooth_address", self.bluetooth_address)
    }

    fn from_values(values: &Values) -> Result<Self, HidppParseError> {
        Ok(DisplayPassKeyKey {
            key_code: enum_field(values, "key_code")?,
            bluetooth_address: bluetooth_address(values)?,
        })
    }
}

/// DeviceDiscovery (0x4F), one per advertising peer
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct DeviceDiscovery {
    pub notification_part: u8,
    pub device_type: u8,
    pub bluetooth_address: BluetoothAddress,
    pub passkey_auth_method: bool,
    pub emu_2buttons_auth_method: bool,
    /// Highest entropy the peer supports
    pub auth_entropy: u8,
}

impl Message for DeviceDiscovery {
    const REPORT_ID: ReportId = ReportId::Long;
    const ROUTE: Route = Route::Notification {
        sub_id: DEVICE_DISCOVERY,
    };
    const FIELDS: &'static [Field] = &[
        Field::new("notification_part", 8),
        Field::new("protocol_type", 8),
        Field::new("reserved_0", 4),
        Field::new("device_type", 4),
        Field::new("bluetooth_address", 48),
        Field::new("reserved_1", 6),
        Field::new("passkey_auth_method", 1),
        Field::new("emu_2buttons_auth_method", 1),
        Field::new("auth_entropy", 8),
        Field::padding(48),
    ];

    fn to_values(&self) -> Values {
        Values::new()
            .with("notification_part", self.notification_part)
            .with("device_type", self.device_type & 0x0F)
            .with("bluetooth_address", self.bluetooth_address)
            .with("passkey_auth_method", self.passkey_auth_method)
            .with("emu_2buttons_auth_method", self.emu_2buttons_auth_method)
            .with("auth_entropy", self.auth_entropy)
    }

    fn from_values(values: &Values) -> Result<Self, HidppParseError> {
        Ok(DeviceDiscovery {
            notification_part: values.u8("notification_part")?,
            device_type: values.u8("device_type")?,
            bluetooth_address: bluetooth_address(values)?,
            passkey_auth_method: values.flag("passkey_auth_method")?,
            emu_2buttons_auth_method: values.flag("emu_2buttons_auth_method")?,
            auth_entropy: values.u8("auth_entropy")?,
        })
    }
}

impl DeviceDiscovery {
    /// Preferred method offered by the peer
    pub fn auth_method(&self) -> AuthMethod {
        AuthMethod::from_bits(self.passkey_auth_method, self.emu_2buttons_auth_method)
    }
}

/// DiscoveryStatus (0x53)
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct DiscoveryStatus {
    /// 0 discovery started, 1 stopped
    pub device_discovery_status: u8,
    pub error_type: u8,
}

impl Message for DiscoveryStatus {
    const REPORT_ID: ReportId = ReportId::Short;
    const ROUTE: Route = Route::Notification {
        sub_id: DISCOVERY_STATUS,
    };
    const FIELDS: &'static [Field] = &[
        Field::new("device_discovery_status", 8),
        Field::new("error_type", 8),
        Field::padding(16),
    ];

    fn to_values(&self) -> Values {
        Values::new()
            .with("device_discovery_status", self.device_discovery_status)
            .with("error_type", self.error_type)
    }

    fn from_values(values: &Values) -> Result<Self, HidppParseError> {
        Ok(DiscoveryStatus {
            device_discovery_status: values.u8("device_discovery_status")?,
            error_type: values.u8("error_type")?,
        })
    }
}

/// PairingStatus (0x54)
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct PairingStatus {
    pub status: PairingStatusCode,
    pub error_type: PairingErrorType,
    pub bluetooth_address: BluetoothAddress,
    /// Slot allocated by the receiver, valid on a successful stop
    pub pairing_slot: u8,
}

impl Message for PairingStatus {
    const REPORT_ID: ReportId = ReportId::Long;
    const ROUTE: Route = Route::Notification {
        sub_id: PAIRING_STATUS,
    };
    const FIELDS: &'static [Field] = &[
        Field::new("device_pairing_status", 8),
        Field::new("error_type", 8),
        Field::new("bluetooth_address", 48),
        Field::new("pairing_slot", 8),
        Field::padding(64),
    ];

    fn to_values(&self) -> Values {
        Values::new()
            .with("device_pairing_status", u8::from(self.status))
            .with("error_type", u8::from(self.error_type))
            .with("bluetooth_address", self.bluetooth_address)
            .with("pairing_slot", self.pairing_slot)
    }

    fn from_values(values: &Values) -> Result<Self, HidppParseError> {
        Ok(PairingStatus {
            status: enum_field(values, "device_pairing_status")?,
            error_type: enum_field(values, "error_type")?,
            bluetooth_address: bluetooth_address(values)?,
            pairing_slot: values.u8("pairing_slot")?,
        })
    }
}

// ----- Functions -----

/// Number of decimal passkey digits carrying `entropy_bits` of entropy
///
/// floor(bits * log10(2)), 20 bits give 6 digits
pub const fn passkey_digits(entropy_bits: u8) -> usize {
    (entropy_bits as usize * 30103) / 100000
}

// ----- Tests -----
