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

use crate::bitfield::{self, Field, Values};
use crate::{Frame, Header, HidppParseError, Packet, ReportId};
use alloc::vec;
use alloc::vec::Vec;

// ----- Modules -----


// ----- Enumerations -----

/// Where a message lives on the wire
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Route {
    /// HID++ 2.0 / VLP feature function
    /// The feature index is resolved at runtime from the feature id
    Feature { feature_id: u16, function_id: u8 },
    /// HID++ 1.0 register access
    /// Byte 2 is the sub id, byte 3 the register address
    Register { sub_id: u8, address: u8 },
    /// HID++ 1.0 notification
    /// Byte 3 is notification data and is part of the layout
    Notification { sub_id: u8 },
}

impl Route {
    /// Number of header bytes carried by the layout
    pub const fn header_data_len(&self) -> usize {
        match self {
            Route::Notification { .. } => 1,
            _ => 0,
        }
    }
}

// ----- Traits -----

/// Declared message type
///
/// Layouts are data: `FIELDS` is packed by the generic bitfield codec.
pub trait Message: Sized {
    /// Frame class used when encoding
    const REPORT_ID: ReportId;
    const ROUTE: Route;
    /// Payload layout following the header (and VLP control byte)
    const FIELDS: &'static [Field];

    fn to_values(&self) -> Values;
    fn from_values(values: &Values) -> Result<Self, HidppParseError>;

    /// Frame classes accepted when decoding
    fn accepts(report_id: ReportId) -> bool {
        report_id == Self::REPORT_ID
    }

    /// Packs the layout
    ///
    /// # Remarks
    /// Fixed size classes are zero padded to the class payload size.
    /// Notification layouts include header byte 3 as their first byte.
    fn payload(&self) -> Result<Vec<u8>, HidppParseError> {
        let extra = Self::ROUTE.header_data_len();
        let len = match Self::REPORT_ID.payload_len() {
            Some(len) => len + extra,
            None => bitfield::layout_bytes(Self::FIELDS),
        };
        let mut out = vec![0; len];
        bitfield::pack(Self::FIELDS, &self.to_values(), &mut out)?;
        Ok(out)
    }

    /// Header for this message
    /// `feature_index` and `software_id` are ignored for HID++ 1.0 routes
    fn header(device_index: u8, feature_index: u8, software_id: u8) -> Header {
        match Self::ROUTE {
            Route::Feature { function_id, .. } => Header::new(
                Self::REPORT_ID,
                device_index,
                feature_index,
                function_id,
                software_id,
            ),
            Route::Register { sub_id, address } => Header {
                report_id: Self::REPORT_ID,
                device_index,
                feature_index: sub_id,
                function_id: address >> 4,
                software_id: address & 0x0F,
            },
            Route::Notification { sub_id } => {
                Header::new(Self::REPORT_ID, device_index, sub_id, 0, 0)
            }
        }
    }

    fn to_packet(
        &self,
        device_index: u8,
        feature_index: u8,
        software_id: u8,
    ) -> Result<Packet, HidppParseError> {
        let mut header = Self::header(device_index, feature_index, software_id);
        let mut payload = self.payload()?;
        if Self::ROUTE.header_data_len() == 1 {
            let byte = payload.remove(0);
            header.function_id = byte >> 4;
            header.software_id = byte & 0x0F;
        }
        Ok(Packet { header, payload })
    }

    /// Encodes a single frame
    fn encode(
        &self,
        device_index: u8,
        feature_index: u8,
        software_id: u8,
    ) -> Result<Frame, HidppParseError> {
        self.to_packet(device_index, feature_index, software_id)?
            .to_frame()
    }

    /// Decodes a packet, validating frame class and route
    fn from_packet(packet: &Packet) -> Result<Self, HidppParseError> {
        let header = &packet.header;
        if !Self::accepts(header.report_id) {
            return Err(HidppParseError::ReportIdMismatch {
                expected: Self::REPORT_ID,
                got: header.report_id.into(),
            });
        }

        match Self::ROUTE {
            Route::Feature { function_id, .. } => {
                if header.function_id != function_id {
                    return Err(HidppParseError::UnexpectedRoute {
                        expected: (header.feature_index, function_id),
                        got: (header.feature_index, header.function_id),
                    });
                }
                Self::from_values(&bitfield::unpack(Self::FIELDS, &packet.payload)?)
            }
            Route::Register { sub_id, address } => {
                if header.feature_index != sub_id || header.function_byte() != address {
                    return Err(HidppParseError::UnexpectedRoute {
                        expected: (sub_id, address),
                        got: (header.feature_index, header.function_byte()),
                    });
                }
                Self::from_values(&bitfield::unpack(Self::FIELDS, &packet.payload)?)
            }
            Route::Notification { sub_id } => {
                if header.feature_index != sub_id {
                    return Err(HidppParseError::UnexpectedRoute {
                        expected: (sub_id, 0),
                        got: (header.feature_index, header.function_byte()),
                    });
                }
                let mut data = Vec::with_capacity(packet.payload.len() + 1);
                data.push(header.function_byte());
                data.extend_from_slice(&packet.payload);
                Self::from_values(&bitfield::unpack(Self::FIELDS, &data)?)
            }
        }
    }

    /// Decodes a single frame
    fn decode(frame: &[u8]) -> Result<Self, HidppParseError> {
        Self::from_packet(&Packet::from_frame(frame)?)
    }
}

// ----- Structs -----

/// Entry of the host side feature table
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct FeatureInfo {
    pub feature_id: u16,
    pub name: &'static str,
    /// Highest version the host understands
    pub max_version: u8,
}

// ----- Constants -----

/// Features known to the host
pub const FEATURES: &[FeatureInfo] = &[
    FeatureInfo { feature_id: 0x0000, name: "Root", max_version: 2 },
    FeatureInfo { feature_id: 0x0001, name: "FeatureSet", max_version: 2 },
    FeatureInfo { feature_id: 0x0003, name: "DeviceInformation", max_version: 8 },
    FeatureInfo { feature_id: 0x0005, name: "DeviceTypeAndName", max_version: 3 },
    FeatureInfo { feature_id: 0x0008, name: "KeepAlive", max_version: 0 },
    FeatureInfo { feature_id: 0x00C3, name: "SecureDfuControl", max_version: 1 },
    FeatureInfo { feature_id: 0x00D0, name: "Dfu", max_version: 3 },
    FeatureInfo { feature_id: 0x0102, name: "VlpRoot", max_version: 0 },
    FeatureInfo { feature_id: 0x0103, name: "VlpFeatureSet", max_version: 0 },
    FeatureInfo { feature_id: 0x1004, name: "UnifiedBattery", max_version: 5 },
    FeatureInfo { feature_id: 0x1500, name: "ForcePairing", max_version: 0 },
    FeatureInfo { feature_id: 0x1602, name: "PasswordAuthentication", max_version: 0 },
    FeatureInfo { feature_id: 0x1814, name: "ChangeHost", max_version: 1 },
    FeatureInfo { feature_id: 0x1861, name: "BatteryLevelsCalibration", max_version: 1 },
    FeatureInfo { feature_id: 0x1890, name: "RfTest", max_version: 9 },
    FeatureInfo { feature_id: 0x18A1, name: "LedTest", max_version: 1 },
    FeatureInfo { feature_id: 0x19A1, name: "ContextualDisplay", max_version: 0 },
    FeatureInfo { feature_id: 0x1E00, name: "EnableHiddenFeatures", max_version: 0 },
    FeatureInfo { feature_id: 0x1E02, name: "ManageDeactivatableFeaturesAuth", max_version: 0 },
    FeatureInfo { feature_id: 0x1E22, name: "SpiDirectAccess", max_version: 1 },
    FeatureInfo { feature_id: 0x1E30, name: "I2cDirectAccess", max_version: 0 },
    FeatureInfo { feature_id: 0x8061, name: "ExtendedAdjustableReportRate", max_version: 0 },
];

/// Looks up the host side description of a feature id
pub fn feature_info(feature_id: u16) -> Option<&'static FeatureInfo> {
    FEATURES.iter().find(|info| info.feature_id == feature_id)
}

// ----- Feature Flags -----

/// Flag byte shared by Root.GetFeature and FeatureSet.GetFeatureId
#[derive(PartialEq, Eq, Clone, Copy, Debug, Default)]
pub struct FeatureFlags {
    pub obsolete: bool,
    pub hidden: bool,
    pub engineering: bool,
    pub manufacturing_deactivatable: bool,
    pub compliance_deactivatable: bool,
}

impl FeatureFlags {
    const FIELDS: [Field; 6] = [
        Field::new("obsolete", 1),
        Field::new("hidden", 1),
        Field::new("engineering", 1),
        Field::new("manufacturing_deactivatable", 1),
        Field::new("compliance_deactivatable", 1),
        Field::new("reserved", 3),
    ];

    fn set(&self, values: &mut Values) {
        values.set("obsolete", self.obsolete);
        values.set("hidden", self.hidden);
        values.set("engineering", self.engineering);
        values.set("manufacturing_deactivatable", self.manufacturing_deactivatable);
        values.set("compliance_deactivatable", self.compliance_deactivatable);
    }

    fn get(values: &Values) -> Result<FeatureFlags, HidppParseError> {
        Ok(FeatureFlags {
            obsolete: values.flag("obsolete")?,
            hidden: values.flag("hidden")?,
            engineering: values.flag("engineering")?,
            manufacturing_deactivatable: values.flag("manufacturing_deactivatable")?,
            compliance_deactivatable: values.flag("compliance_deactivatable")?,
        })
    }
}

/// Message with no payload fields
macro_rules! empty_message {
    ($(#[$meta:meta])* $name:ident, $report:expr, $route:expr, $fields:expr) => {
        $(#[$meta])*
        #[derive(PartialEq, Eq, Clone, Copy, Debug, Default)]
        pub struct $name;

        impl Message for $name {
            const REPORT_ID: ReportId = $report;
            const ROUTE: Route = $route;
            const FIELDS: &'static [Field] = $fields;

            fn to_values(&self) -> Values {
                Values::new()
            }

            fn from_values(_values: &Values) -> Result<Self, HidppParseError> {
                Ok($name)
            }
        }
    };
}

pub(crate) use empty_message;

// ----- Features -----

/// Root (0x0000)
pub mod h0000 {
    use super::*;

    pub const FEATURE_ID: u16 = 0x0000;
    /// Root is always at index 0
    pub const FEATURE_INDEX: u8 = 0x00;

    const fn route(function_id: u8) -> Route {
        Route::Feature {
            feature_id: FEATURE_ID,
            function_id,
        }
    }

    /// GetFeature (fn 0)
    #[derive(PartialEq, Eq, Clone, Copy, Debug)]
    pub struct GetFeature {
        pub feature_id: u16,
    }

    impl Message for GetFeature {
        const REPORT_ID: ReportId = ReportId::Short;
        const ROUTE: Route = route(0);
        const FIELDS: &'static [Field] = &[Field::new("feature_id", 16), Field::padding(8)];

        fn to_values(&self) -> Values {
            Values::new().with("feature_id", self.feature_id)
        }

        fn from_values(values: &Values) -> Result<Self, HidppParseError> {
            Ok(GetFeature {
                feature_id: values.u16("feature_id")?,
            })
        }
    }

    /// GetFeature response
    ///
    /// Index 0 means the feature is not supported.
    #[derive(PartialEq, Eq, Clone, Copy, Debug)]
    pub struct GetFeatureResponse {
        pub feature_index: u8,
        pub flags: FeatureFlags,
        pub version: u8,
    }

    impl Message for GetFeatureResponse {
        const REPORT_ID: ReportId = ReportId::Short;
        const ROUTE: Route = route(0);
        const FIELDS: &'static [Field] = &[
            Field::new("feature_index", 8),
            FeatureFlags::FIELDS[0],
            FeatureFlags::FIELDS[1],
            FeatureFlags::FIELDS[2],
            FeatureFlags::FIELDS[3],
            FeatureFlags::FIELDS[4],
            FeatureFlags::FIELDS[5],
            Field::new("version", 8),
        ];

        // Devices answer with either a short or a long frame
        fn accepts(report_id: ReportId) -> bool {
            matches!(report_id, ReportId::Short | ReportId::Long)
        }

        fn to_values(&self) -> Values {
            let mut values = Values::new()
                .with("feature_index", self.feature_index)
                .with("version", self.version);
            self.flags.set(&mut values);
            values
        }

        fn from_values(values: &Values) -> Result<Self, HidppParseError> {
            Ok(GetFeatureResponse {
                feature_index: values.u8("feature_index")?,
                flags: FeatureFlags::get(values)?,
                version: values.u8("version")?,
            })
        }
    }

    /// GetProtocolVersion (fn 1)
    #[derive(PartialEq, Eq, Clone, Copy, Debug)]
    pub struct GetProtocolVersion {
        pub ping_data: u8,
    }

    impl Message for GetProtocolVersion {
        const REPORT_ID: ReportId = ReportId::Short;
        const ROUTE: Route = route(1);
        const FIELDS: &'static [Field] = &[Field::new("reserved", 16), Field::new("ping_data", 8)];

        fn to_values(&self) -> Values {
            Values::new().with("ping_data", self.ping_data)
        }

        fn from_values(values: &Values) -> Result<Self, HidppParseError> {
            Ok(GetProtocolVersion {
                ping_data: values.u8("ping_data")?,
            })
        }
    }

    #[derive(PartialEq, Eq, Clone, Copy, Debug)]
    pub struct GetProtocolVersionResponse {
        pub protocol_major: u8,
        pub protocol_minor: u8,
        pub ping_data: u8,
    }

    impl Message for GetProtocolVersionResponse {
        const REPORT_ID: ReportId = ReportId::Short;
        const ROUTE: Route = route(1);
        const FIELDS: &'static [Field] = &[
            Field::new("protocol_major", 8),
            Field::new("protocol_minor", 8),
            Field::new("ping_data", 8),
        ];

        fn accepts(report_id: ReportId) -> bool {
            matches!(report_id, ReportId::Short | ReportId::Long)
        }

        fn to_values(&self) -> Values {
            Values::new()
                .with("protocol_major", self.protocol_major)
                .with("protocol_minor", self.protocol_minor)
                .with("ping_data", self.ping_data)
        }

        fn from_values(values: &Values) -> Result<Self, HidppParseError> {
            Ok(GetProtocolVersionResponse {
                protocol_major: values.u8("protocol_major")?,
                protocol_minor: values.u8("protocol_minor")?,
                ping_data: values.u8("ping_data")?,
            })
        }
    }
}

/// FeatureSet (0x0001)
pub mod h0001 {
    use super::*;

    pub const FEATURE_ID: u16 = 0x0001;

    const fn route(function_id: u8) -> Route {
        Route::Feature {
            feature_id: FEATURE_ID,
            function_id,
        }
    }

    empty_message!(
        /// GetCount (fn 0)
        GetCount,
        ReportId::Short,
        route(0),
        &[Field::padding(24)]
    );

    /// Number of features, Root excluded
    #[derive(PartialEq, Eq, Clone, Copy, Debug)]
    pub struct GetCountResponse {
        pub count: u8,
    }

    impl Message for GetCountResponse {
        const REPORT_ID: ReportId = ReportId::Long;
        const ROUTE: Route = route(0);
        const FIELDS: &'static [Field] = &[Field::new("count", 8), Field::padding(120)];

        fn to_values(&self) -> Values {
            Values::new().with("count", self.count)
        }

        fn from_values(values: &Values) -> Result<Self, HidppParseError> {
            Ok(GetCountResponse {
                count: values.u8("count")?,
            })
        }
    }

    /// GetFeatureId (fn 1)
    #[derive(PartialEq, Eq, Clone, Copy, Debug)]
    pub struct GetFeatureId {
        pub feature_index: u8,
    }

    impl Message for GetFeatureId {
        const REPORT_ID: ReportId = ReportId::Short;
        const ROUTE: Route = route(1);
        const FIELDS: &'static [Field] = &[Field::new("feature_index", 8), Field::padding(16)];

        fn to_values(&self) -> Values {
            Values::new().with("feature_index", self.feature_index)
        }

        fn from_values(values: &Values) -> Result<Self, HidppParseError> {
            Ok(GetFeatureId {
                feature_index: values.u8("feature_index")?,
            })
        }
    }

    #[derive(PartialEq, Eq, Clone, Copy, Debug)]
    pub struct GetFeatureIdResponse {
        pub feature_id: u16,
        pub flags: FeatureFlags,
        pub version: u8,
    }

    impl Message for GetFeatureIdResponse {
        const REPORT_ID: ReportId = ReportId::Long;
        const ROUTE: Route = route(1);
        const FIELDS: &'static [Field] = &[
            Field::new("feature_id", 16),
            FeatureFlags::FIELDS[0],
            FeatureFlags::FIELDS[1],
            FeatureFlags::FIELDS[2],
            FeatureFlags::FIELDS[3],
            FeatureFlags::FIELDS[4],
            FeatureFlags::FIELDS[5],
            Field::new("version", 8),
            Field::padding(96),
        ];

        fn to_values(&self) -> Values {
            let mut values = Values::new()
                .with("feature_id", self.feature_id)
                .with("version", self.version);
            self.flags.set(&mut values);
            values
        }

        fn from_values(values: &Values) -> Result<Self, HidppParseError> {
            Ok(GetFeatureIdResponse {
                feature_id: values.u16("feature_id")?,
                flags: FeatureFlags::get(values)?,
                version: values.u8("version")?,
            })
        }
    }
}

/// VLP Root (0x0102)
pub mod h0102 {
    use super::*;

    pub const FEATURE_ID: u16 = 0x0102;
    /// VLP Root is always at index 1
    pub const FEATURE_INDEX: u8 = 0x01;

    const fn route(function_id: u8) -> Route {
        Route::Feature {
            feature_id: FEATURE_ID,
            function_id,
        }
    }

    /// GetFeatureIndex (fn 0)
    #[derive(PartialEq, Eq, Clone, Copy, Debug)]
    pub struct GetFeatureIndex {
        pub feature_id: u16,
    }

    impl Message for GetFeatureIndex {
        const REPORT_ID: ReportId = ReportId::VlpNormal;
        const ROUTE: Route = route(0);
        const FIELDS: &'static [Field] = &[Field::new("feature_id", 16)];

        fn to_values(&self) -> Values {
            Values::new().with("feature_id", self.feature_id)
        }

        fn from_values(values: &Values) -> Result<Self, HidppParseError> {
            Ok(GetFeatureIndex {
                feature_id: values.u16("feature_id")?,
            })
        }
    }

    #[derive(PartialEq, Eq, Clone, Copy, Debug)]
    pub struct GetFeatureIndexResponse {
        pub feature_id: u16,
        pub feature_index: u8,
        pub hidden: bool,
        pub version: u8,
        pub max_memory: u16,
    }

    impl Message for GetFeatureIndexResponse {
        const REPORT_ID: ReportId = ReportId::VlpNormal;
        const ROUTE: Route = route(0);
        const FIELDS: &'static [Field] = &[
            Field::new("feature_id", 16),
            Field::new("feature_index", 8),
            Field::new("reserved_0", 1),
            Field::new("hidden", 1),
            Field::new("reserved_1", 6),
            Field::new("version", 8),
            Field::new("max_memory", 16),
        ];

        fn accepts(report_id: ReportId) -> bool {
            report_id.is_vlp()
        }

        fn to_values(&self) -> Values {
            Values::new()
                .with("feature_id", self.feature_id)
                .with("feature_index", self.feature_index)
                .with("hidden", self.hidden)
                .with("version", self.version)
                .with("max_memory", self.max_memory)
        }

        fn from_values(values: &Values) -> Result<Self, HidppParseError> {
            Ok(GetFeatureIndexResponse {
                feature_id: values.u16("feature_id")?,
                feature_index: values.u8("feature_index")?,
                hidden: values.flag("hidden")?,
                version: values.u8("version")?,
                max_memory: values.u16("max_memory")?,
            })
        }
    }

    empty_message!(
        /// GetProtocolCapabilities (fn 1)
        GetProtocolCapabilities,
        ReportId::VlpNormal,
        route(1),
        &[]
    );

    #[derive(PartialEq, Eq, Clone, Copy, Debug)]
    pub struct GetProtocolCapabilitiesResponse {
        pub protocol_major: u8,
        pub protocol_minor: u8,
        pub total_memory: u16,
    }

    impl Message for GetProtocolCapabilitiesResponse {
        const REPORT_ID: ReportId = ReportId::VlpNormal;
        const ROUTE: Route = route(1);
        const FIELDS: &'static [Field] = &[
            Field::new("protocol_major", 8),
            Field::new("protocol_minor", 8),
            Field::new("total_memory", 16),
        ];

        fn accepts(report_id: ReportId) -> bool {
            report_id.is_vlp()
        }

        fn to_values(&self) -> Values {
            Values::new()
                .with("protocol_major", self.protocol_major)
                .with("protocol_minor", self.protocol_minor)
                .with("total_memory", self.total_memory)
        }

        fn from_values(values: &Values) -> Result<Self, HidppParseError> {
            Ok(GetProtocolCapabilitiesResponse {
                protocol_major: values.u8("protocol_major")?,
                protocol_minor: values.u8("protocol_minor")?,
                total_memory: values.u16("total_memory")?,
            })
        }
    }

    /// GetPingData (fn 2), the device echoes the data back
    #[derive(PartialEq, Eq, Clone, Copy, Debug)]
    pub struct GetPingData {
        pub ping_data: u32,
    }

    impl Message for GetPingData {
        const REPORT_ID: ReportId = ReportId::VlpNormal;
        const ROUTE: Route = route(2);
        const FIELDS: &'static [Field] = &[Field::new("ping_data", 32)];

        fn accepts(report_id: ReportId) -> bool {
            report_id.is_vlp()
        }

        fn to_values(&self) -> Values {
            Values::new().with("ping_data", self.ping_data)
        }

        fn from_values(values: &Values) -> Result<Self, HidppParseError> {
            Ok(GetPingData {
                ping_data: values.u32("ping_data")?,
            })
        }
    }
}

/// DFU (0x00D0)
pub mod h00d0 {
    use super::*;
    use crate::bitfield::Variant;

    pub const FEATURE_ID: u16 = 0x00D0;

    const fn route(function_id: u8) -> Route {
        Route::Feature {
            feature_id: FEATURE_ID,
            function_id,
        }
    }

    pub const CMD_SUPPLY_PROGRAM_DATA: u8 = 1;
    pub const CMD_SUPPLY_CHECK_DATA: u8 = 2;
    pub const CMD_CHECK_AND_VALIDATE: u8 = 3;

    const PROGRAM_OR_CHECK: &[Field] = &[
        Field::new("cmd", 8),
        Field::new("address", 32),
        Field::new("size", 32),
        Field::new("reserved", 56),
    ];

    const CHECK_AND_VALIDATE: &[Field] = &[Field::new("cmd", 8), Field::new("reserved", 120)];

    /// Command variants, selected by the first payload byte
    pub const COMMANDS: &[Variant] = &[
        Variant {
            discriminant: CMD_SUPPLY_PROGRAM_DATA,
            name: "supply_program_data",
            fields: PROGRAM_OR_CHECK,
        },
        Variant {
            discriminant: CMD_SUPPLY_CHECK_DATA,
            name: "supply_check_data",
            fields: PROGRAM_OR_CHECK,
        },
        Variant {
            discriminant: CMD_CHECK_AND_VALIDATE,
            name: "check_and_validate",
            fields: CHECK_AND_VALIDATE,
        },
    ];

    /// dfuCmdDataX command payload
    #[derive(PartialEq, Eq, Clone, Copy, Debug)]
    pub enum Command {
        SupplyProgramData { address: u32, size: u32 },
        SupplyCheckData { address: u32, size: u32 },
        CheckAndValidate,
    }

    impl Command {
        /// Decodes a polymorphic command payload
        pub fn decode(payload: &[u8]) -> Result<Command, HidppParseError> {
            let (variant, values) = bitfield::unpack_variant("cmd", COMMANDS, payload)?;
            match variant.discriminant {
                CMD_SUPPLY_PROGRAM_DATA => Ok(Command::SupplyProgramData {
                    address: values.u32("address")?,
                    size: values.u32("size")?,
                }),
                CMD_SUPPLY_CHECK_DATA => Ok(Command::SupplyCheckData {
                    address: values.u32("address")?,
                    size: values.u32("size")?,
                }),
                _ => Ok(Command::CheckAndValidate),
            }
        }

        fn values(&self) -> (&'static [Field], Values) {
            match *self {
                Command::SupplyProgramData { address, size } => (
                    PROGRAM_OR_CHECK,
                    Values::new()
                        .with("cmd", CMD_SUPPLY_PROGRAM_DATA)
                        .with("address", address)
                        .with("size", size),
                ),
                Command::SupplyCheckData { address, size } => (
                    PROGRAM_OR_CHECK,
                    Values::new()
                        .with("cmd", CMD_SUPPLY_CHECK_DATA)
                        .with("address", address)
                        .with("size", size),
                ),
                Command::CheckAndValidate => (
                    CHECK_AND_VALIDATE,
                    Values::new().with("cmd", CMD_CHECK_AND_VALIDATE),
                ),
            }
        }
    }

    /// dfuCmdDataX (fn 0..3)
    ///
    /// The first packet of a sequence carries a command, the following
    /// ones carry raw data. Function x is the packet number modulo 4.
    #[derive(PartialEq, Eq, Clone, Debug)]
    pub enum CmdData {
        Command(Command),
        Data([u8; 16]),
    }

    #[derive(PartialEq, Eq, Clone, Debug)]
    pub struct DfuCmdData<const X: u8> {
        pub body: CmdData,
    }

    impl<const X: u8> Message for DfuCmdData<X> {
        const REPORT_ID: ReportId = ReportId::Long;
        const ROUTE: Route = route(X);
        const FIELDS: &'static [Field] = &[Field::new("data", 128)];

        fn to_values(&self) -> Values {
            match &self.body {
                CmdData::Data(data) => Values::new().with("data", *data),
                CmdData::Command(command) => {
                    let (fields, values) = command.values();
                    let mut data = [0u8; 16];
                    // Layout tables are static, packing them cannot overflow 16 bytes
                    if bitfield::pack(fields, &values, &mut data).is_err() {
                        data = [0u8; 16];
                    }
                    Values::new().with("data", data)
                }
            }
        }

        /// Raw data, use [`Command::decode`] to interpret a command packet
        fn from_values(values: &Values) -> Result<Self, HidppParseError> {
            Ok(DfuCmdData {
                body: CmdData::Data(values.array("data")?),
            })
        }
    }

    pub type DfuCmdData0 = DfuCmdData<0>;
    pub type DfuCmdData1 = DfuCmdData<1>;
    pub type DfuCmdData2 = DfuCmdData<2>;
    pub type DfuCmdData3 = DfuCmdData<3>;

    /// DfuStart (fn 4), version 2 layout
    #[derive(PartialEq, Eq, Clone, Copy, Debug)]
    pub struct DfuStart {
        pub fw_entity: u8,
        pub encrypt: u8,
        pub magic: [u8; 10],
        pub flag: u8,
        pub security_level: u8,
    }

    impl Message for DfuStart {
        const REPORT_ID: ReportId = ReportId::Long;
        const ROUTE: Route = route(4);
        const FIELDS: &'static [Field] = &[
            Field::new("fw_entity", 8),
            Field::new("encrypt", 8).with_check(bitfield::Check::Range { min: 0, max: 4 }),
            Field::new("magic", 80),
            Field::new("flag", 8),
            Field::new("security_level", 8),
            Field::new("reserved", 16),
        ];

        fn to_values(&self) -> Values {
            Values::new()
                .with("fw_entity", self.fw_entity)
                .with("encrypt", self.encrypt)
                .with("magic", self.magic)
                .with("flag", self.flag)
                .with("security_level", self.security_level)
        }

        fn from_values(values: &Values) -> Result<Self, HidppParseError> {
            Ok(DfuStart {
                fw_entity: values.u8("fw_entity")?,
                encrypt: values.u8("encrypt")?,
                magic: values.array("magic")?,
                flag: values.u8("flag")?,
                security_level: values.u8("security_level")?,
            })
        }
    }

    /// Restart (fn 5)
    #[derive(PartialEq, Eq, Clone, Copy, Debug)]
    pub struct Restart {
        pub fw_entity: u8,
    }

    impl Message for Restart {
        const REPORT_ID: ReportId = ReportId::Long;
        const ROUTE: Route = route(5);
        const FIELDS: &'static [Field] = &[Field::new("fw_entity", 8), Field::new("reserved", 120)];

        fn to_values(&self) -> Values {
            Values::new().with("fw_entity", self.fw_entity)
        }

        fn from_values(values: &Values) -> Result<Self, HidppParseError> {
            Ok(Restart {
                fw_entity: values.u8("fw_entity")?,
            })
        }
    }

    empty_message!(
        /// Restart acknowledgement
        RestartResponse,
        ReportId::Long,
        route(5),
        &[Field::padding(128)]
    );

    /// Status values (low 7 bits of the status byte)
    pub mod status {
        pub const NO_STATUS: u8 = 0x00;
        pub const PACKET_SUCCESS: u8 = 0x01;
        pub const DFU_SUCCESS: u8 = 0x02;
        pub const WAIT_FOR_EVENT: u8 = 0x03;
        pub const GENERIC_ERROR: u8 = 0x04;
        pub const DFU_SUCCESS_ENTITY_RESTART_REQUIRED: u8 = 0x05;
        pub const DFU_SUCCESS_SYSTEM_RESTART_REQUIRED: u8 = 0x06;
        pub const UNKNOWN_ERROR: u8 = 0x10;
        pub const BAD_POWER: u8 = 0x11;
        pub const UNSUPPORTED_FIRMWARE_ENTITY: u8 = 0x12;
        pub const UNSUPPORTED_ENCRYPTION_MODE: u8 = 0x13;
        pub const BAD_MAGIC_STRING: u8 = 0x14;
        pub const DFU_NOT_STARTED: u8 = 0x16;
        pub const BAD_SEQUENCE_NUMBER: u8 = 0x17;
        pub const UNSUPPORTED_COMMAND: u8 = 0x18;
        pub const COMMAND_IN_PROGRESS: u8 = 0x19;
    }

    /// Response to every DFU function but Restart, also sent as event 0
    #[derive(PartialEq, Eq, Clone, Copy, Debug)]
    pub struct DfuStatus<const F: u8> {
        pub packet_number: u32,
        pub status: u8,
        pub params: [u8; 11],
    }

    impl<const F: u8> DfuStatus<F> {
        /// Status value without the toggle bit
        pub fn status_value(&self) -> u8 {
            self.status & 0x7F
        }
    }

    impl<const F: u8> Message for DfuStatus<F> {
        const REPORT_ID: ReportId = ReportId::Long;
        const ROUTE: Route = route(F);
        const FIELDS: &'static [Field] = &[
            Field::new("packet_number", 32),
            Field::new("status", 8),
            Field::new("params", 88),
        ];

        fn to_values(&self) -> Values {
            Values::new()
                .with("packet_number", self.packet_number)
                .with("status", self.status)
                .with("params", self.params)
        }

        fn from_values(values: &Values) -> Result<Self, HidppParseError> {
            Ok(DfuStatus {
                packet_number: values.u32("packet_number")?,
                status: values.u8("status")?,
                params: values.array("params")?,
            })
        }
    }

    /// Unsolicited status (fn 0, software id 0)
    pub type DfuStatusEvent = DfuStatus<0>;
}

/// PasswordAuthentication (0x1602)
pub mod h1602 {
    use super::*;

    pub const FEATURE_ID: u16 = 0x1602;

    pub const STATUS_SUCCESS: u8 = 0x00;
    pub const STATUS_IN_PROGRESS: u8 = 0x01;

    const fn route(function_id: u8) -> Route {
        Route::Feature {
            feature_id: FEATURE_ID,
            function_id,
        }
    }

    /// StartSession (fn 0)
    #[derive(PartialEq, Eq, Clone, Copy, Debug)]
    pub struct StartSession {
        pub account_name: [u8; 16],
    }

    impl Message for StartSession {
        const REPORT_ID: ReportId = ReportId::Long;
        const ROUTE: Route = route(0);
        const FIELDS: &'static [Field] = &[Field::new("account_name", 128)];

        fn to_values(&self) -> Values {
            Values::new().with("account_name", self.account_name)
        }

        fn from_values(values: &Values) -> Result<Self, HidppParseError> {
            Ok(StartSession {
                account_name: values.array("account_name")?,
            })
        }
    }

    #[derive(PartialEq, Eq, Clone, Copy, Debug)]
    pub struct StartSessionResponse {
        pub constant_credentials: bool,
        pub full_authentication: bool,
        pub long_password: bool,
    }

    impl Message for StartSessionResponse {
        const REPORT_ID: ReportId = ReportId::Long;
        const ROUTE: Route = route(0);
        const FIELDS: &'static [Field] = &[
            Field::new("reserved", 5),
            Field::new("constant_credentials", 1),
            Field::new("full_authentication", 1),
            Field::new("long_password", 1),
            Field::padding(120),
        ];

        fn to_values(&self) -> Values {
            Values::new()
                .with("constant_credentials", self.constant_credentials)
                .with("full_authentication", self.full_authentication)
                .with("long_password", self.long_password)
        }

        fn from_values(values: &Values) -> Result<Self, HidppParseError> {
            Ok(StartSessionResponse {
                constant_credentials: values.flag("constant_credentials")?,
                full_authentication: values.flag("full_authentication")?,
                long_password: values.flag("long_password")?,
            })
        }
    }

    /// EndSession (fn 1)
    #[derive(PartialEq, Eq, Clone, Copy, Debug)]
    pub struct EndSession {
        pub account_name: [u8; 16],
    }

    impl Message for EndSession {
        const REPORT_ID: ReportId = ReportId::Long;
        const ROUTE: Route = route(1);
        const FIELDS: &'static [Field] = &[Field::new("account_name", 128)];

        fn to_values(&self) -> Values {
            Values::new().with("account_name", self.account_name)
        }

        fn from_values(values: &Values) -> Result<Self, HidppParseError> {
            Ok(EndSession {
                account_name: values.array("account_name")?,
            })
        }
    }

    empty_message!(EndSessionResponse, ReportId::Long, route(1), &[Field::padding(128)]);

    /// Passwd0 (fn 2) and Passwd1 (fn 3)
    #[derive(PartialEq, Eq, Clone, Copy, Debug)]
    pub struct Passwd<const F: u8> {
        pub passwd: [u8; 16],
    }

    impl<const F: u8> Message for Passwd<F> {
        const REPORT_ID: ReportId = ReportId::Long;
        const ROUTE: Route = route(F);
        const FIELDS: &'static [Field] = &[Field::new("passwd", 128)];

        fn to_values(&self) -> Values {
            Values::new().with("passwd", self.passwd)
        }

        fn from_values(values: &Values) -> Result<Self, HidppParseError> {
            Ok(Passwd {
                passwd: values.array("passwd")?,
            })
        }
    }

    pub type Passwd0 = Passwd<2>;
    pub type Passwd1 = Passwd<3>;

    #[derive(PartialEq, Eq, Clone, Copy, Debug)]
    pub struct PasswdResponse<const F: u8> {
        pub status: u8,
    }

    impl<const F: u8> Message for PasswdResponse<F> {
        const REPORT_ID: ReportId = ReportId::Long;
        const ROUTE: Route = route(F);
        const FIELDS: &'static [Field] = &[Field::new("status", 8), Field::padding(120)];

        fn to_values(&self) -> Values {
            Values::new().with("status", self.status)
        }

        fn from_values(values: &Values) -> Result<Self, HidppParseError> {
            Ok(PasswdResponse {
                status: values.u8("status")?,
            })
        }
    }

    pub type Passwd0Response = PasswdResponse<2>;
    pub type Passwd1Response = PasswdResponse<3>;
}

/// ManageDeactivatableFeaturesAuth (0x1E02)
pub mod h1e02 {
    use super::*;

    pub const FEATURE_ID: u16 = 0x1E02;

    pub const MANUFACTURING: u8 = 0x01;
    pub const COMPLIANCE: u8 = 0x02;
    pub const GOTHARD: u8 = 0x04;
    pub const ALL: u8 = 0x80;

    const fn route(function_id: u8) -> Route {
        Route::Feature {
            feature_id: FEATURE_ID,
            function_id,
        }
    }

    /// Deactivatable feature bitmap
    ///
    /// ```c
    /// struct BitMap {
    ///    uint8_t all_bit:1;
    ///    uint8_t reserved:4;
    ///    uint8_t gothard:1;
    ///    uint8_t compliance:1;
    ///    uint8_t manufacturing:1;
    /// };
    /// ```
    #[derive(PartialEq, Eq, Clone, Copy, Debug, Default)]
    pub struct BitMap {
        pub all: bool,
        pub gothard: bool,
        pub compliance: bool,
        pub manufacturing: bool,
    }

    impl From<u8> for BitMap {
        fn from(byte: u8) -> Self {
            BitMap {
                all: byte & ALL != 0,
                gothard: byte & GOTHARD != 0,
                compliance: byte & COMPLIANCE != 0,
                manufacturing: byte & MANUFACTURING != 0,
            }
        }
    }

    impl From<BitMap> for u8 {
        fn from(map: BitMap) -> Self {
            (map.all as u8) << 7
                | (map.gothard as u8) << 2
                | (map.compliance as u8) << 1
                | map.manufacturing as u8
        }
    }

    empty_message!(
        /// GetInfo (fn 0)
        GetInfo,
        ReportId::Short,
        route(0),
        &[Field::padding(24)]
    );

    #[derive(PartialEq, Eq, Clone, Copy, Debug)]
    pub struct GetInfoResponse {
        pub support: BitMap,
        pub persist: BitMap,
        pub state: BitMap,
    }

    impl Message for GetInfoResponse {
        const REPORT_ID: ReportId = ReportId::Long;
        const ROUTE: Route = route(0);
        const FIELDS: &'static [Field] = &[
            Field::new("support_bit_map", 8),
            Field::new("persist_bit_map", 8),
            Field::new("state_bit_map", 8),
            Field::padding(104),
        ];

        fn to_values(&self) -> Values {
            Values::new()
                .with("support_bit_map", u8::from(self.support))
                .with("persist_bit_map", u8::from(self.persist))
                .with("state_bit_map", u8::from(self.state))
        }

        fn from_values(values: &Values) -> Result<Self, HidppParseError> {
            Ok(GetInfoResponse {
                support: values.u8("support_bit_map")?.into(),
                persist: values.u8("persist_bit_map")?.into(),
                state: values.u8("state_bit_map")?.into(),
            })
        }
    }

    /// DisableFeatures (fn 1) and EnableFeatures (fn 2)
    #[derive(PartialEq, Eq, Clone, Copy, Debug)]
    pub struct SetFeatures<const F: u8> {
        pub bit_map: BitMap,
    }

    impl<const F: u8> Message for SetFeatures<F> {
        const REPORT_ID: ReportId = ReportId::Long;
        const ROUTE: Route = route(F);
        const FIELDS: &'static [Field] = &[Field::new("bit_map", 8), Field::padding(120)];

        fn to_values(&self) -> Values {
            Values::new().with("bit_map", u8::from(self.bit_map))
        }

        fn from_values(values: &Values) -> Result<Self, HidppParseError> {
            Ok(SetFeatures {
                bit_map: values.u8("bit_map")?.into(),
            })
        }
    }

    pub type DisableFeatures = SetFeatures<1>;
    pub type EnableFeatures = SetFeatures<2>;

    #[derive(PartialEq, Eq, Clone, Copy, Debug, Default)]
    pub struct SetFeaturesResponse<const F: u8>;

    impl<const F: u8> Message for SetFeaturesResponse<F> {
        const REPORT_ID: ReportId = ReportId::Long;
        const ROUTE: Route = route(F);
        const FIELDS: &'static [Field] = &[Field::padding(128)];

        fn to_values(&self) -> Values {
            Values::new()
        }

        fn from_values(_values: &Values) -> Result<Self, HidppParseError> {
            Ok(SetFeaturesResponse)
        }
    }

    pub type DisableFeaturesResponse = SetFeaturesResponse<1>;
    pub type EnableFeaturesResponse = SetFeaturesResponse<2>;

    empty_message!(
        /// GetReactInfo (fn 3)
        GetReactInfo,
        ReportId::Short,
        route(3),
        &[Field::padding(24)]
    );

    /// Feature id of the authentication feature to use for re-activation
    #[derive(PartialEq, Eq, Clone, Copy, Debug)]
    pub struct GetReactInfoResponse {
        pub auth_feature: u16,
    }

    impl Message for GetReactInfoResponse {
        const REPORT_ID: ReportId = ReportId::Long;
        const ROUTE: Route = route(3);
        const FIELDS: &'static [Field] = &[Field::new("auth_feature", 16), Field::padding(112)];

        fn to_values(&self) -> Values {
            Values::new().with("auth_feature", self.auth_feature)
        }

        fn from_values(values: &Values) -> Result<Self, HidppParseError> {
            Ok(GetReactInfoResponse {
                auth_feature: values.u16("auth_feature")?,
            })
        }
    }
}
