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

use crate::error::CoreError;
use clap::{Arg, ArgMatches};
use serde::Deserialize;
use std::time::Duration;

// ----- Structs -----

/// Core configuration
///
/// Missing fields fall back to [`Config::default`] when deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capacity of every event queue (oldest event dropped on overflow)
    pub queue_capacity: usize,
    pub request_timeout_ms: u64,
    /// Deadline for a Root.GetFeature lookup
    pub lookup_timeout_ms: u64,
    /// Transport read timeout of the inbound loop
    pub poll_interval_ms: u64,
    /// How long a timed out correlation key is remembered for orphan routing
    pub orphan_window_ms: u64,
    /// Largest VLP frame written to the transport
    pub vlp_frame_len: usize,
    pub default_device_index: u8,
    pub pairing_timeout_ms: u64,
    /// Passkey entropy requested when pairing
    pub entropy_bits: u8,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            queue_capacity: 128,
            request_timeout_ms: 1000,
            lookup_timeout_ms: 1000,
            poll_interval_ms: 5,
            orphan_window_ms: 2000,
            vlp_frame_len: 64,
            default_device_index: hidpp_protocol::RECEIVER_INDEX,
            pairing_timeout_ms: 30000,
            entropy_bits: 20,
        }
    }
}

pub const MIN_ENTROPY_BITS: u8 = 10;
pub const MAX_ENTROPY_BITS: u8 = 20;

impl Config {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.queue_capacity == 0 {
            return Err(CoreError::Config("queue_capacity must be non-zero".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(CoreError::Config("poll_interval_ms must be non-zero".into()));
        }
        if self.vlp_frame_len <= hidpp_protocol::VLP_HEADER_LEN
            || self.vlp_frame_len > hidpp_protocol::MAX_FRAME_LEN
        {
            return Err(CoreError::Config(format!(
                "vlp_frame_len {} outside {}..={}",
                self.vlp_frame_len,
                hidpp_protocol::VLP_HEADER_LEN + 1,
                hidpp_protocol::MAX_FRAME_LEN
            )));
        }
        if !(MIN_ENTROPY_BITS..=MAX_ENTROPY_BITS).contains(&self.entropy_bits) {
            return Err(CoreError::Config(format!(
                "entropy_bits {} outside {}..={}",
                self.entropy_bits, MIN_ENTROPY_BITS, MAX_ENTROPY_BITS
            )));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn orphan_window(&self) -> Duration {
        Duration::from_millis(self.orphan_window_ms)
    }

    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_millis(self.pairing_timeout_ms)
    }

    /// Command line overrides understood by [`Config::from_matches`]
    pub fn args() -> Vec<Arg<'static>> {
        vec![
            Arg::new("queue-capacity")
                .long("queue-capacity")
                .takes_value(true)
                .value_parser(clap::value_parser!(usize))
                .help("Event queue capacity"),
            Arg::new("timeout")
                .long("timeout")
                .takes_value(true)
                .value_parser(clap::value_parser!(u64))
                .help("Request timeout in milliseconds"),
            Arg::new("lookup-timeout")
                .long("lookup-timeout")
                .takes_value(true)
                .value_parser(clap::value_parser!(u64))
                .help("Feature lookup timeout in milliseconds"),
            Arg::new("vlp-frame-len")
                .long("vlp-frame-len")
                .takes_value(true)
                .value_parser(clap::value_parser!(usize))
                .help("Largest VLP frame written to the device"),
            Arg::new("device-index")
                .short('i')
                .long("device-index")
                .takes_value(true)
                .help("HID++ device index (hex), ff addresses the receiver"),
            Arg::new("entropy")
                .long("entropy")
                .takes_value(true)
                .value_parser(clap::value_parser!(u8).range(10..=20))
                .help("Passkey entropy in bits"),
        ]
    }

    /// Applies command line overrides on top of the defaults
    pub fn from_matches(matches: &ArgMatches) -> Result<Config, CoreError> {
        let mut config = Config::default();
        if let Some(value) = matches.get_one::<usize>("queue-capacity") {
            config.queue_capacity = *value;
        }
        if let Some(value) = matches.get_one::<u64>("timeout") {
            config.request_timeout_ms = *value;
        }
        if let Some(value) = matches.get_one::<u64>("lookup-timeout") {
            config.lookup_timeout_ms = *value;
        }
        if let Some(value) = matches.get_one::<usize>("vlp-frame-len") {
            config.vlp_frame_len = *value;
        }
        if let Some(value) = matches.get_one::<String>("device-index") {
            config.default_device_index = parse_hex_u8(value)?;
        }
        if let Some(value) = matches.get_one::<u8>("entropy") {
            config.entropy_bits = *value;
        }
        config.validate()?;
        Ok(config)
    }
}

fn parse_hex_u8(value: &str) -> Result<u8, CoreError> {
    u8::from_str_radix(value.trim_start_matches("0x"), 16)
        .map_err(|_| CoreError::Config(format!("invalid device index {value}")))
}

// ----- Tests -----

#[cfg(test)]
mod test {
    use super::*;
    use clap::Command;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert_eq!(config.queue_capacity, 128);
        assert_eq!(config.default_device_index, 0xFF);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{ "request_timeout_ms": 100, "entropy_bits": 16 }"#).unwrap();
        assert_eq!(config.request_timeout(), Duration::from_millis(100));
        assert_eq!(config.entropy_bits, 16);
        assert_eq!(config.orphan_window_ms, 2000);
    }

    #[test]
    fn rejects_bad_values() {
        let config = Config {
            entropy_bits: 21,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));

        let config = Config {
            queue_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn command_line_overrides() {
        let matches = Command::new("test")
            .args(Config::args())
            .get_matches_from(vec!["test", "--timeout", "250", "-i", "0x01"]);
        let config = Config::from_matches(&matches).unwrap();
        assert_eq!(config.request_timeout_ms, 250);
        assert_eq!(config.default_device_index, 0x01);
        assert_eq!(config.lookup_timeout_ms, 1000);
    }
}
