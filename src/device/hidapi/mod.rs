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

use crate::device::Transport;
use regex::Regex;
use std::ffi::CString;
use std::time::Duration;

/// Logitech vendor id
pub const VENDOR_ID: u16 = 0x046D;
/// HID++ collections of receivers and USB devices
pub const USAGE_PAGE_HIDPP: u16 = 0xFF00;
/// HID++ collection of BLE devices
pub const USAGE_PAGE_HIDPP_BLE: u16 = 0xFF43;

/// Matching HID++ interface found during enumeration
#[derive(Debug, Clone)]
pub struct Candidate {
    pub path: CString,
    pub name: String,
    pub is_ble: bool,
}

pub struct HidapiTransport {
    device: ::hidapi::HidDevice,
    name: String,
    connected: bool,
}

fn io_error(e: ::hidapi::HidError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, format!("{:?}", e))
}

impl HidapiTransport {
    pub fn open(api: &::hidapi::HidApi, candidate: &Candidate) -> std::io::Result<HidapiTransport> {
        let device = api.open_path(&candidate.path).map_err(io_error)?;
        // Blocking mode, reads are unblocked by their timeout
        device.set_blocking_mode(true).map_err(io_error)?;
        info!("Connected to {}", candidate.name);
        Ok(HidapiTransport {
            device,
            name: candidate.name.clone(),
            connected: true,
        })
    }
}

impl Transport for HidapiTransport {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        let timeout = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        match self.device.read_timeout(buf, timeout) {
            Ok(len) => {
                if len > 0 {
                    trace!("Received {} bytes", len);
                    trace!("{:x?}", &buf[0..len]);
                }
                Ok(len)
            }
            Err(e) => {
                warn!("Read - {:?}", e);
                self.connected = false;
                Err(io_error(e))
            }
        }
    }

    fn write(&mut self, frame: &[u8]) -> std::io::Result<()> {
        // HID++ frames start with their report id, no prepending needed
        match self.device.write(frame) {
            Ok(len) => {
                trace!("Sent {} bytes", len);
                trace!("{:x?}", &frame[0..len.min(frame.len())]);
                Ok(())
            }
            Err(e) => {
                warn!("Write - {:?}", e);
                Err(io_error(e))
            }
        }
    }

    fn reset_device(&mut self) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "hidapi cannot reset a device",
        ))
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

fn device_name(device_info: &::hidapi::DeviceInfo) -> String {
    let mut string = format!(
        "[{:04x}:{:04x}-{:x}:{:x}] I:{} ",
        device_info.vendor_id(),
        device_info.product_id(),
        device_info.usage_page(),
        device_info.usage(),
        device_info.interface_number(),
    );
    if let Some(m) = &device_info.manufacturer_string() {
        string += m;
    }
    if let Some(p) = &device_info.product_string() {
        string += &format!(" {}", p);
    }
    if let Some(s) = &device_info.serial_number() {
        string += &format!(" ({})", s);
    }
    string
}

fn match_device(device_info: &::hidapi::DeviceInfo) -> bool {
    device_info.vendor_id() == VENDOR_ID
        && matches!(
            device_info.usage_page(),
            USAGE_PAGE_HIDPP | USAGE_PAGE_HIDPP_BLE
        )
}

/// Lists HID++ capable interfaces
pub fn enumerate(api: &mut ::hidapi::HidApi) -> std::io::Result<Vec<Candidate>> {
    api.refresh_devices().map_err(io_error)?;

    // If serial number is a MAC address, this is a bluetooth device
    let mac = Regex::new(r"([0-9a-fA-F][0-9a-fA-F]:){5}([0-9a-fA-F][0-9a-fA-F])")
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

    let mut candidates = Vec::new();
    debug!("Scanning for devices");
    for device_info in api.device_list() {
        let name = device_name(device_info);
        debug!("Device: {:#?}\n    {}", device_info.path(), name);
        if !match_device(device_info) {
            continue;
        }

        candidates.push(Candidate {
            path: device_info.path().to_owned(),
            is_ble: device_info.usage_page() == USAGE_PAGE_HIDPP_BLE
                || mac.is_match(device_info.serial_number().unwrap_or("")),
            name,
        });
    }
    Ok(candidates)
}
