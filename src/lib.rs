/* Copyright (C) 2017-2022 by Jacob Alexander
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

#[macro_use]
extern crate log;

pub use hidpp_protocol as protocol;

// ----- Modules -----

/// per-device handle tying the sub-protocols together
pub mod channel;

/// runtime configuration
pub mod config;

/// transports (hidapi, loopback)
pub mod device;

/// request/reply correlation and event fan-out
pub mod dispatcher;

/// error taxonomy
pub mod error;

/// logging setup
pub mod logging;

/// device NVS snapshots
pub mod nvs;

/// BLE pairing step machine driven through receiver registers
pub mod pairing;

/// feature id to feature index mapping
pub mod registry;

/// password authentication and deactivatable features
pub mod session;

mod test;

pub use channel::Core;
pub use config::Config;
pub use error::CoreError;

/// Compile time information
pub mod built_info {
    // This file is generated at build time using build.rs
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}
