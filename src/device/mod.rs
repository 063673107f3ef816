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

#[cfg(feature = "hidapi-devices")]
pub mod hidapi;
pub mod loopback;

use std::time::Duration;

/// Frame oriented link to a device
///
/// # Remarks
///
/// Each `write` is exactly one frame, the core never coalesces.
/// Reads are polled by the dispatcher thread with a short timeout so the
/// write side only ever waits for one poll interval.
pub trait Transport: Send {
    /// Reads one frame into `buf`
    /// Returns Ok(0) when nothing arrived before `timeout`
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize>;

    /// Writes one frame
    fn write(&mut self, frame: &[u8]) -> std::io::Result<()>;

    /// Asks the device to reset
    fn reset_device(&mut self) -> std::io::Result<()>;

    fn is_connected(&self) -> bool;

    /// Out-of-band reset notification, true once per device reset
    fn take_reset_signal(&mut self) -> bool {
        false
    }

    /// Human readable name used in logs
    fn name(&self) -> String;
}
