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

#[macro_use]
extern crate log;

use clap::{Arg, ArgAction, Command};
use hidpp_core::device::hidapi::{self, HidapiTransport};
use hidpp_core::protocol::features::feature_info;
use hidpp_core::registry::FeatureEntry;
use hidpp_core::{built_info, logging, Config, Core, CoreError};

fn parse_feature_id(value: &str) -> Result<u16, CoreError> {
    u16::from_str_radix(value.trim_start_matches("0x"), 16)
        .map_err(|_| CoreError::Config(format!("invalid feature id {value}")))
}

fn print_entry(entry: &FeatureEntry) {
    let name = feature_info(entry.feature_id).map_or("unknown", |info| info.name);
    println!(
        "{:#04x}  {:#06x}  v{:<2} {:<32} {:?}",
        entry.feature_index, entry.feature_id, entry.version, name, entry.flags
    );
}

/// Main entry point
#[tokio::main]
async fn main() -> Result<(), CoreError> {
    logging::setup_logging_lite()?;

    let version_info = format!("{} - {}", built_info::PKG_VERSION, built_info::PROFILE);
    let after_info = format!(
        "{} ({}) -> {}",
        built_info::RUSTC_VERSION,
        built_info::HOST,
        built_info::TARGET,
    );
    info!("Version: {}", version_info);

    // Process command-line arguments
    // Most of the information is generated from Cargo.toml using built crate (build.rs)
    let matches = Command::new(built_info::PKG_NAME)
        .version(version_info.as_str())
        .author(built_info::PKG_AUTHORS)
        .about(format!("\n{}", built_info::PKG_DESCRIPTION).as_str())
        .after_help(after_info.as_str())
        .args(Config::args())
        .arg(
            Arg::new("list")
                .short('l')
                .long("list")
                .action(ArgAction::SetTrue)
                .help("List HID++ interfaces and exit"),
        )
        .arg(
            Arg::new("select")
                .short('s')
                .long("select")
                .takes_value(true)
                .value_parser(clap::value_parser!(usize))
                .help("Interface to open, as numbered by --list"),
        )
        .arg(
            Arg::new("enumerate")
                .short('e')
                .long("enumerate")
                .action(ArgAction::SetTrue)
                .help("Walk the FeatureSet feature"),
        )
        .arg(
            Arg::new("feature")
                .takes_value(true)
                .multiple_values(true)
                .help("Feature ids (hex) to look up"),
        )
        .get_matches();
    let config = Config::from_matches(&matches)?;

    let mut api = ::hidapi::HidApi::new()
        .map_err(|e| CoreError::Transport(format!("hidapi unavailable - {:?}", e)))?;
    let candidates = hidapi::enumerate(&mut api)?;
    if matches.get_flag("list") {
        for (idx, candidate) in candidates.iter().enumerate() {
            println!(
                "{:>2}: {}{}",
                idx,
                candidate.name,
                if candidate.is_ble { " (BLE)" } else { "" }
            );
        }
        return Ok(());
    }

    let select = matches.get_one::<usize>("select").copied().unwrap_or(0);
    let candidate = candidates.get(select).ok_or_else(|| {
        CoreError::Transport(format!(
            "no HID++ interface {} ({} found)",
            select,
            candidates.len()
        ))
    })?;
    let transport = HidapiTransport::open(&api, candidate)?;

    let device_index = config.default_device_index;
    let core = Core::new(Box::new(transport), config)?;

    if let Some(features) = matches.get_many::<String>("feature") {
        for value in features {
            let feature_id = parse_feature_id(value)?;
            match core.get_feature_index(device_index, feature_id).await {
                Ok(entry) => print_entry(&entry),
                Err(CoreError::NotSupported { .. }) => {
                    println!("      {:#06x}  not supported", feature_id)
                }
                Err(e) => return Err(e),
            }
        }
    }

    if matches.get_flag("enumerate") {
        for entry in core.enumerate_features(device_index).await? {
            print_entry(&entry);
        }
    }

    core.shutdown();
    Ok(())
}
