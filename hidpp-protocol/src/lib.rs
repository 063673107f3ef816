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

// ----- Crates -----

#![no_std]

extern crate alloc;

// ----- Macros -----

#[cfg(not(feature = "server"))]
macro_rules! warn {
    (target: $target:expr, $($arg:tt)+) => {};
    ($($arg:tt)+) => {};
}

#[cfg(not(feature = "server"))]
macro_rules! trace {
    (target: $target:expr, $($arg:tt)+) => {};
    ($($arg:tt)+) => {};
}

#[cfg(not(feature = "server"))]
pub(crate) use {trace, warn};

#[cfg(feature = "server")]
pub(crate) use log::{trace, warn};

// ----- Modules -----

pub mod bitfield;
pub mod features;
pub mod hidpp10;
pub mod vlp;


use alloc::vec::Vec as AllocVec;
use core::fmt;
use heapless::Vec;
use num_enum::{IntoPrimitive, TryFromPrimitive};

// ----- Constants -----

/// Size of the common HID++ header
/// report_id | device_index | feature_index | function_id:4 software_id:4
pub const HEADER_LEN: usize = 4;

/// Size of the VLP header (HID++ header + control byte)
pub const VLP_HEADER_LEN: usize = 5;

/// Largest frame the codec will build or accept
/// Covers USB 2.0 HS sized VLP reports
pub const MAX_FRAME_LEN: usize = 512;

/// Device index used to address a receiver
pub const RECEIVER_INDEX: u8 = 0xFF;

/// Feature index byte tagging a HID++ 2.0 error frame
pub const HIDPP20_ERROR_TAG: u8 = 0xFF;

/// Sub id byte tagging a HID++ 1.0 error frame
pub const HIDPP10_ERROR_TAG: u8 = 0x8F;

/// Fixed size frame storage
pub type Frame = Vec<u8, MAX_FRAME_LEN>;

// ----- Enumerations -----

/// HID++ report ids
///
/// # Remarks
/// The report id selects both the protocol family and the frame length.
#[repr(u8)]
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt-impl", derive(defmt::Format))]
pub enum ReportId {
    /// 7 byte HID++ frame
    Short = 0x10,
    /// 20 byte HID++ frame
    Long = 0x11,
    /// 64 byte HID++ frame
    VeryLong = 0x12,
    /// Variable length VLP frame
    VlpNormal = 0x13,
    /// Variable length VLP frame (extended collection)
    VlpExtended = 0x14,
}

impl ReportId {
    /// Total frame length for fixed size classes
    /// VLP classes are variable and return None
    pub const fn frame_len(self) -> Option<usize> {
        match self {
            ReportId::Short => Some(7),
            ReportId::Long => Some(20),
            ReportId::VeryLong => Some(64),
            ReportId::VlpNormal | ReportId::VlpExtended => None,
        }
    }

    /// Payload length (frame minus header) for fixed size classes
    pub const fn payload_len(self) -> Option<usize> {
        match self.frame_len() {
            Some(len) => Some(len - HEADER_LEN),
            None => None,
        }
    }

    pub const fn is_vlp(self) -> bool {
        matches!(self, ReportId::VlpNormal | ReportId::VlpExtended)
    }

    /// Header length for this class
    pub const fn header_len(self) -> usize {
        if self.is_vlp() {
            VLP_HEADER_LEN
        } else {
            HEADER_LEN
        }
    }
}

/// HID++ 2.0 error codes
///
/// Carried in byte 5 of an error frame (feature index byte 0xFF)
#[repr(u8)]
#[derive(PartialEq, Eq, Clone, Copy, Debug, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt-impl", derive(defmt::Format))]
pub enum ErrorCode {
    NoError = 0x00,
    Unknown = 0x01,
    InvalidArgument = 0x02,
    OutOfRange = 0x03,
    HwError = 0x04,
    NotAllowed = 0x05,
    InvalidFeatureIndex = 0x06,
    InvalidFunctionId = 0x07,
    Busy = 0x08,
    Unsupported = 0x09,
}

/// HID++ 1.0 error codes
///
/// Carried in byte 5 of an error frame (sub id byte 0x8F)
#[repr(u8)]
#[derive(PartialEq, Eq, Clone, Copy, Debug, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt-impl", derive(defmt::Format))]
pub enum Hidpp10ErrorCode {
    Success = 0x00,
    InvalidSubId = 0x01,
    InvalidAddress = 0x02,
    InvalidValue = 0x03,
    ConnectFail = 0x04,
    TooManyDevices = 0x05,
    AlreadyExists = 0x06,
    Busy = 0x07,
    UnknownDevice = 0x08,
    ResourceError = 0x09,
    RequestUnavailable = 0x0A,
    InvalidParamValue = 0x0B,
    WrongPinCode = 0x0C,
}

/// Device issued error, tagged with the protocol family it came from
///
/// Raw codes are kept when the value is outside the known tables so
/// callers can still assert on them.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt-impl", derive(defmt::Format))]
pub enum DeviceError {
    Hidpp20(u8),
    Hidpp10(u8),
}

impl DeviceError {
    pub fn raw(self) -> u8 {
        match self {
            DeviceError::Hidpp20(code) | DeviceError::Hidpp10(code) => code,
        }
    }

    /// HID++ 2.0 code, if this is a known HID++ 2.0 error
    pub fn hidpp20(self) -> Option<ErrorCode> {
        match self {
            DeviceError::Hidpp20(code) => ErrorCode::try_from(code).ok(),
            DeviceError::Hidpp10(_) => None,
        }
    }

    /// HID++ 1.0 code, if this is a known HID++ 1.0 error
    pub fn hidpp10(self) -> Option<Hidpp10ErrorCode> {
        match self {
            DeviceError::Hidpp10(code) => Hidpp10ErrorCode::try_from(code).ok(),
            DeviceError::Hidpp20(_) => None,
        }
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::Hidpp20(code) => match ErrorCode::try_from(*code) {
                Ok(known) => write!(f, "{:?} ({:#04x})", known, code),
                Err(_) => write!(f, "unknown HID++ 2.0 error ({:#04x})", code),
            },
            DeviceError::Hidpp10(code) => match Hidpp10ErrorCode::try_from(*code) {
                Ok(known) => write!(f, "{:?} ({:#04x})", known, code),
                Err(_) => write!(f, "unknown HID++ 1.0 error ({:#04x})", code),
            },
        }
    }
}

/// HID++ Parse Error
///
/// # Remarks
/// thrown when there's an issue processing byte stream.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum HidppParseError {
    MissingReportIdByte,
    InvalidReportId(u8),
    /// Frame length does not match the report id class
    MalformedFrame {
        report_id: u8,
        len: usize,
        expected: usize,
    },
    /// Frame class differs from the one a message type declares
    ReportIdMismatch {
        expected: ReportId,
        got: u8,
    },
    /// Value check failed on encode or decode
    InvalidField {
        field: &'static str,
        value: u64,
    },
    /// Byte field had the wrong size
    InvalidFieldLength {
        field: &'static str,
        len: usize,
        expected: usize,
    },
    /// Discriminant not present in the variant table
    UnknownVariant {
        field: &'static str,
        value: u64,
    },
    /// Frame addresses a different function or register than the message type
    UnexpectedRoute {
        expected: (u8, u8),
        got: (u8, u8),
    },
    /// Payload shorter than the declared layout
    ShortPayload {
        len: usize,
        expected: usize,
    },
    MissingField(&'static str),
    FrameTooLong(usize),
    VecAddFailed,
}

impl fmt::Display for HidppParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HidppParseError::MissingReportIdByte => write!(f, "empty frame"),
            HidppParseError::InvalidReportId(id) => write!(f, "invalid report id {:#04x}", id),
            HidppParseError::MalformedFrame {
                report_id,
                len,
                expected,
            } => write!(
                f,
                "malformed frame: report id {:#04x} is {} bytes, expected {}",
                report_id, len, expected
            ),
            HidppParseError::ReportIdMismatch { expected, got } => write!(
                f,
                "report id {:#04x} does not match {:?}",
                got, expected
            ),
            HidppParseError::InvalidField { field, value } => {
                write!(f, "invalid field {}: {:#x}", field, value)
            }
            HidppParseError::InvalidFieldLength {
                field,
                len,
                expected,
            } => write!(
                f,
                "invalid field {}: {} bytes, expected at most {}",
                field, len, expected
            ),
            HidppParseError::UnknownVariant { field, value } => {
                write!(f, "unknown variant {}: {:#x}", field, value)
            }
            HidppParseError::UnexpectedRoute { expected, got } => write!(
                f,
                "unexpected route {:02x?}, expected {:02x?}",
                got, expected
            ),
            HidppParseError::ShortPayload { len, expected } => {
                write!(f, "payload is {} bytes, layout needs {}", len, expected)
            }
            HidppParseError::MissingField(field) => write!(f, "missing field {}", field),
            HidppParseError::FrameTooLong(len) => write!(f, "frame too long ({} bytes)", len),
            HidppParseError::VecAddFailed => write!(f, "frame buffer full"),
        }
    }
}

impl core::error::Error for HidppParseError {}

// ----- Structs -----

/// Common HID++ header
///
/// ```c
/// struct Hidpp_Header {
///    uint8_t report_id;
///    uint8_t device_index;
///    uint8_t feature_index;  // sub_id for HID++ 1.0
///    uint8_t function_id:4;  // address for HID++ 1.0 (whole byte)
///    uint8_t software_id:4;
/// };
/// ```
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt-impl", derive(defmt::Format))]
pub struct Header {
    pub report_id: ReportId,
    pub device_index: u8,
    pub feature_index: u8,
    pub function_id: u8,
    pub software_id: u8,
}

impl Header {
    pub fn new(
        report_id: ReportId,
        device_index: u8,
        feature_index: u8,
        function_id: u8,
        software_id: u8,
    ) -> Header {
        Header {
            report_id,
            device_index,
            feature_index,
            function_id: function_id & 0x0F,
            software_id: software_id & 0x0F,
        }
    }

    /// Parses the header of a frame
    /// Only the first 4 bytes are inspected, length is checked by validate_len
    pub fn parse(frame: &[u8]) -> Result<Header, HidppParseError> {
        let report_id = report_id(frame)?;
        if frame.len() < HEADER_LEN {
            return Err(HidppParseError::MalformedFrame {
                report_id: report_id.into(),
                len: frame.len(),
                expected: HEADER_LEN,
            });
        }

        Ok(Header {
            report_id,
            device_index: frame[1],
            feature_index: frame[2],
            function_id: frame[3] >> 4,
            software_id: frame[3] & 0x0F,
        })
    }

    /// Byte 3 of the header
    pub fn function_byte(&self) -> u8 {
        (self.function_id << 4) | self.software_id
    }

    /// Writes the 4 header bytes
    pub fn write(&self, frame: &mut [u8]) {
        frame[0] = self.report_id.into();
        frame[1] = self.device_index;
        frame[2] = self.feature_index;
        frame[3] = self.function_byte();
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} dev:{:02x} feat:{:02x} fn:{:x} sw:{:x}",
            self.report_id, self.device_index, self.feature_index, self.function_id, self.software_id
        )
    }
}

/// A decoded protocol message body
///
/// For fixed size frames the payload is everything after the 4 byte header.
/// For VLP the payload is the concatenation of every fragment's data.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Packet {
    pub header: Header,
    pub payload: AllocVec<u8>,
}

impl Packet {
    /// Builds a packet from a single validated HID++ frame
    pub fn from_frame(frame: &[u8]) -> Result<Packet, HidppParseError> {
        let header = Header::parse(frame)?;
        validate_len(frame)?;
        let start = header.report_id.header_len();
        Ok(Packet {
            header,
            payload: frame[start..].to_vec(),
        })
    }

    /// Serializes a packet back into a single frame
    /// Fixed size payloads are zero padded to the class size
    pub fn to_frame(&self) -> Result<Frame, HidppParseError> {
        let start = self.header.report_id.header_len();
        let used = start + self.payload.len();
        let len = self.header.report_id.frame_len().unwrap_or(used);
        if used > len || len > MAX_FRAME_LEN {
            return Err(HidppParseError::FrameTooLong(used));
        }

        let mut frame = Frame::new();
        frame
            .resize_default(len)
            .map_err(|_| HidppParseError::VecAddFailed)?;
        self.header.write(&mut frame);
        if self.header.report_id.is_vlp() {
            frame[HEADER_LEN] = vlp::Control::single().into();
        }
        frame[start..used].copy_from_slice(&self.payload);
        Ok(frame)
    }
}

// ----- Utility Functions -----

/// Determines the report id of a frame
///
/// # Arguments
/// * `frame` - Slice of bytes
///
/// # Remarks
/// First byte of every HID++ frame
pub fn report_id(frame: &[u8]) -> Result<ReportId, HidppParseError> {
    match frame.first() {
        Some(byte) => {
            ReportId::try_from(*byte).map_err(|_| HidppParseError::InvalidReportId(*byte))
        }
        None => Err(HidppParseError::MissingReportIdByte),
    }
}

/// Validates the frame length against the report id class
///
/// # Remarks
/// Fixed size classes must match exactly.
/// VLP frames need at least the 5 byte header and must fit MAX_FRAME_LEN.
pub fn validate_len(frame: &[u8]) -> Result<ReportId, HidppParseError> {
    let report_id = report_id(frame)?;
    let expected = report_id.frame_len().unwrap_or(VLP_HEADER_LEN);
    let valid = match report_id.frame_len() {
        Some(len) => frame.len() == len,
        None => frame.len() >= VLP_HEADER_LEN && frame.len() <= MAX_FRAME_LEN,
    };

    if !valid {
        return Err(HidppParseError::MalformedFrame {
            report_id: report_id.into(),
            len: frame.len(),
            expected,
        });
    }
    trace!("{:?} frame ok ({} bytes)", report_id, frame.len());
    Ok(report_id)
}

/// Determines whether the frame is a HID++ 2.0 error frame
///
/// ```c
/// struct Hidpp20_Error {
///    uint8_t report_id;
///    uint8_t device_index;
///    uint8_t tag;            // 0xFF
///    uint8_t feature_index;  // of the failed request
///    uint8_t function_id:4;  // of the failed request
///    uint8_t software_id:4;
///    uint8_t error_code;
/// };
/// ```
pub fn is_hidpp20_error(frame: &[u8]) -> bool {
    frame.len() > 5 && frame[2] == HIDPP20_ERROR_TAG
}

/// Determines whether the frame is a HID++ 1.0 error frame
///
/// ```c
/// struct Hidpp10_Error {
///    uint8_t report_id;
///    uint8_t device_index;
///    uint8_t tag;         // 0x8F
///    uint8_t sub_id;      // of the failed request
///    uint8_t address;     // of the failed request
///    uint8_t error_code;
/// };
/// ```
///
/// Only short frames carry HID++ 1.0 errors, a long reply of feature
/// index 0x8F is a regular reply.
pub fn is_hidpp10_error(frame: &[u8]) -> bool {
    frame.len() > 5 && frame[0] == u8::from(ReportId::Short) && frame[2] == HIDPP10_ERROR_TAG
}

/// Parsed error frame
///
/// `original` is the header of the request that failed, with the
/// feature_index / function_id / software_id fields restored.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct ErrorFrame {
    pub original: Header,
    pub error: DeviceError,
}

impl ErrorFrame {
    /// Parses either error frame family
    /// Returns None when the frame is not an error frame
    pub fn parse(frame: &[u8]) -> Result<Option<ErrorFrame>, HidppParseError> {
        let header = Header::parse(frame)?;
        if header.report_id.is_vlp() && frame.len() > 6 && frame[2] == HIDPP20_ERROR_TAG {
            // VLP error frames carry the control byte before the original request fields
            return Ok(Some(ErrorFrame {
                original: Header::new(
                    header.report_id,
                    header.device_index,
                    frame[3],
                    frame[5] >> 4,
                    frame[5] & 0x0F,
                ),
                error: DeviceError::Hidpp20(frame[6]),
            }));
        }

        if is_hidpp20_error(frame) {
            Ok(Some(ErrorFrame {
                original: Header::new(
                    header.report_id,
                    header.device_index,
                    frame[3],
                    frame[4] >> 4,
                    frame[4] & 0x0F,
                ),
                error: DeviceError::Hidpp20(frame[5]),
            }))
        } else if is_hidpp10_error(frame) {
            // HID++ 1.0 requests are keyed on sub_id / address
            Ok(Some(ErrorFrame {
                original: Header::new(
                    header.report_id,
                    header.device_index,
                    frame[3],
                    frame[4] >> 4,
                    frame[4] & 0x0F,
                ),
                error: DeviceError::Hidpp10(frame[5]),
            }))
        } else {
            Ok(None)
        }
    }

    /// Builds the error frame a device would emit for the original request
    pub fn to_frame(&self) -> Result<Frame, HidppParseError> {
        let report_id = match self.error {
            DeviceError::Hidpp10(_) => ReportId::Short,
            DeviceError::Hidpp20(_) => self.original.report_id,
        };
        let len = report_id.frame_len().unwrap_or(VLP_HEADER_LEN + 2);
        let mut frame = Frame::new();
        frame
            .resize_default(len)
            .map_err(|_| HidppParseError::VecAddFailed)?;

        frame[0] = report_id.into();
        frame[1] = self.original.device_index;
        frame[2] = match self.error {
            DeviceError::Hidpp20(_) => HIDPP20_ERROR_TAG,
            DeviceError::Hidpp10(_) => HIDPP10_ERROR_TAG,
        };
        frame[3] = self.original.feature_index;
        if report_id.is_vlp() {
            frame[4] = vlp::Control::single().into();
            frame[5] = self.original.function_byte();
            frame[6] = self.error.raw();
        } else {
            frame[4] = self.original.function_byte();
            frame[5] = self.error.raw();
        }
        Ok(frame)
    }
}

/// Copies a slice into a frame buffer
pub fn frame_from_slice(data: &[u8]) -> Result<Frame, HidppParseError> {
    Frame::from_slice(data).map_err(|_| HidppParseError::FrameTooLong(data.len()))
}
