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

// ----- Crates -----

use hidpp_protocol::{DeviceError, HidppParseError};
use thiserror::Error;

// ----- Enumerations -----

/// Errors surfaced by the core
///
/// Cloneable so a single transport failure can complete every pending request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("codec error: {0}")]
    Codec(#[from] HidppParseError),
    #[error("request timed out")]
    Timeout,
    #[error("device returned {code}")]
    ProtocolError { code: DeviceError },
    #[error("account is not authenticated")]
    NotAuthenticated,
    #[error("password blocks sent out of sequence")]
    WrongSequence,
    #[error("authentication failed")]
    AuthFailed,
    #[error("feature {feature_id:#06x} is not supported")]
    NotSupported { feature_id: u16 },
    #[error("device did not answer the lookup of feature {feature_id:#06x}")]
    Unreachable { feature_id: u16 },
    #[error("bond for slot {slot} lost, pairing must be redone")]
    BondLost { slot: u8 },
    #[error("pairing: {0}")]
    Pairing(String),
    #[error("dispatcher shut down")]
    Shutdown,
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Transport(err.to_string())
    }
}

impl From<DeviceError> for CoreError {
    fn from(code: DeviceError) -> Self {
        CoreError::ProtocolError { code }
    }
}
