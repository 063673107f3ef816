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

//! Device side persistent storage, as observed by the host
//!
//! The core never writes NVS. Fixtures supply snapshots (debugger dumps,
//! emulator state) through [`NvsReader`].

// ----- Crates -----

use crate::error::CoreError;
use hidpp_protocol::hidpp10::BluetoothAddress;
use parking_lot::RwLock;
use std::collections::HashMap;

// ----- Structs -----

/// Bonded peer record
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct BondRecord {
    pub slot: u8,
    pub peer_address: BluetoothAddress,
    /// Long term key
    pub ltk: [u8; 16],
    /// Identity resolving key
    pub irk: Option<[u8; 16]>,
}

// ----- Traits -----

/// Read access to device NVS
pub trait NvsReader: Send + Sync {
    /// Bond record stored for a pairing slot
    fn bond(&self, slot: u8) -> Result<Option<BondRecord>, CoreError>;

    /// Persisted gotthard enable flag, None when the chunk is absent
    fn gotthard_enabled(&self) -> Result<Option<bool>, CoreError> {
        Ok(None)
    }
}

/// In-memory NVS snapshot
#[derive(Default)]
pub struct SnapshotNvs {
    bonds: RwLock<HashMap<u8, BondRecord>>,
    gotthard: RwLock<Option<bool>>,
}

impl SnapshotNvs {
    pub fn new() -> SnapshotNvs {
        SnapshotNvs::default()
    }

    pub fn set_bond(&self, record: BondRecord) {
        debug!("NVS bond for slot {} updated", record.slot);
        self.bonds.write().insert(record.slot, record);
    }

    /// Removes a bond, as a device side clear would
    pub fn clear_bond(&self, slot: u8) -> Option<BondRecord> {
        self.bonds.write().remove(&slot)
    }

    pub fn set_gotthard(&self, enabled: bool) {
        *self.gotthard.write() = Some(enabled);
    }
}

impl NvsReader for SnapshotNvs {
    fn bond(&self, slot: u8) -> Result<Option<BondRecord>, CoreError> {
        Ok(self.bonds.read().get(&slot).copied())
    }

    fn gotthard_enabled(&self) -> Result<Option<bool>, CoreError> {
        Ok(*self.gotthard.read())
    }
}

// ----- Tests -----

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn snapshot_bonds() {
        let nvs = SnapshotNvs::new();
        assert_eq!(nvs.bond(1), Ok(None));
        assert_eq!(nvs.gotthard_enabled(), Ok(None));

        let record = BondRecord {
            slot: 1,
            peer_address: [0xC0, 0xFF, 0xEE, 0x00, 0x00, 0x01],
            ltk: [0x5A; 16],
            irk: None,
        };
        nvs.set_bond(record);
        nvs.set_gotthard(true);
        assert_eq!(nvs.bond(1), Ok(Some(record)));
        assert_eq!(nvs.gotthard_enabled(), Ok(Some(true)));

        assert_eq!(nvs.clear_bond(1), Some(record));
        assert_eq!(nvs.bond(1), Ok(None));
    }
}
