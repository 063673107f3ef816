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

use crate::dispatcher::Dispatcher;
use crate::error::CoreError;
use hidpp_protocol::features::{feature_info, h0000, h0102, FeatureFlags};
use parking_lot::{RwLock, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ----- Enumerations -----

/// Root feature flavour spoken by a device
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Protocol {
    /// Root 0x0000 at index 0
    Hidpp20,
    /// VLP Root 0x0102 at index 1
    Vlp,
}

impl Protocol {
    pub const fn root_feature_id(self) -> u16 {
        match self {
            Protocol::Hidpp20 => h0000::FEATURE_ID,
            Protocol::Vlp => h0102::FEATURE_ID,
        }
    }

    pub const fn root_feature_index(self) -> u8 {
        match self {
            Protocol::Hidpp20 => h0000::FEATURE_INDEX,
            Protocol::Vlp => h0102::FEATURE_INDEX,
        }
    }
}

/// Cached lookup result
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Lookup {
    Present(FeatureEntry),
    /// The device answered with index 0
    NotSupported,
}

// ----- Structs -----

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct FeatureEntry {
    pub feature_id: u16,
    pub feature_index: u8,
    pub version: u8,
    pub flags: FeatureFlags,
}

impl FeatureEntry {
    fn root(protocol: Protocol) -> FeatureEntry {
        FeatureEntry {
            feature_id: protocol.root_feature_id(),
            feature_index: protocol.root_feature_index(),
            version: 0,
            flags: FeatureFlags::default(),
        }
    }
}

/// Feature id to runtime index map of one device
///
/// # Remarks
///
/// Read mostly. A miss queries the device's root feature once; concurrent
/// misses are serialized so a feature is never looked up twice.
/// Timeouts are not cached, unsupported features are.
pub struct FeatureRegistry {
    dispatcher: Arc<Dispatcher>,
    device_index: u8,
    protocol: Protocol,
    timeout: Duration,
    entries: RwLock<HashMap<u16, Lookup>>,
    lookup_gate: tokio::sync::Mutex<()>,
    /// Bumped on invalidation, lookups started before it are not cached
    generation: AtomicU64,
}

impl FeatureRegistry {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        device_index: u8,
        protocol: Protocol,
        timeout: Duration,
    ) -> FeatureRegistry {
        FeatureRegistry {
            dispatcher,
            device_index,
            protocol,
            timeout,
            entries: RwLock::new(HashMap::new()),
            lookup_gate: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn device_index(&self) -> u8 {
        self.device_index
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Cached lookup result, no wire traffic
    pub fn cached(&self, feature_id: u16) -> Option<Lookup> {
        if feature_id == self.protocol.root_feature_id() {
            return Some(Lookup::Present(FeatureEntry::root(self.protocol)));
        }
        self.entries.read().get(&feature_id).copied()
    }

    /// Resolves the runtime index of a feature
    ///
    /// # Remarks
    /// Returns [`CoreError::NotSupported`] when the device does not carry the
    /// feature and [`CoreError::Unreachable`] when the lookup timed out.
    pub async fn get_feature_index(&self, feature_id: u16) -> Result<FeatureEntry, CoreError> {
        if let Some(lookup) = self.cached(feature_id) {
            return Self::resolve(feature_id, lookup);
        }

        let _gate = self.lookup_gate.lock().await;
        // Another caller may have finished the same lookup while we waited
        if let Some(lookup) = self.cached(feature_id) {
            return Self::resolve(feature_id, lookup);
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let lookup = match self.query(feature_id).await {
            Ok(lookup) => lookup,
            Err(CoreError::Timeout) => {
                warn!(
                    "Lookup of {:#06x} on device {:02x} timed out",
                    feature_id, self.device_index
                );
                return Err(CoreError::Unreachable { feature_id });
            }
            Err(e) => return Err(e),
        };

        let mut entries = self.entries.write();
        if self.generation.load(Ordering::SeqCst) == generation {
            entries.insert(feature_id, lookup);
        } else {
            debug!("Registry invalidated during lookup of {:#06x}", feature_id);
        }
        let entries = RwLockWriteGuard::downgrade(entries);
        debug!(
            "Device {:02x} now maps {} features",
            self.device_index,
            entries.len()
        );
        Self::resolve(feature_id, lookup)
    }

    fn resolve(feature_id: u16, lookup: Lookup) -> Result<FeatureEntry, CoreError> {
        match lookup {
            Lookup::Present(entry) => Ok(entry),
            Lookup::NotSupported => Err(CoreError::NotSupported { feature_id }),
        }
    }

    async fn query(&self, feature_id: u16) -> Result<Lookup, CoreError> {
        let entry = match self.protocol {
            Protocol::Hidpp20 => {
                let response: h0000::GetFeatureResponse = self
                    .dispatcher
                    .request(
                        self.device_index,
                        h0000::FEATURE_INDEX,
                        &h0000::GetFeature { feature_id },
                        self.timeout,
                    )
                    .await?;
                FeatureEntry {
                    feature_id,
                    feature_index: response.feature_index,
                    version: response.version,
                    flags: response.flags,
                }
            }
            Protocol::Vlp => {
                let response: h0102::GetFeatureIndexResponse = self
                    .dispatcher
                    .request(
                        self.device_index,
                        h0102::FEATURE_INDEX,
                        &h0102::GetFeatureIndex { feature_id },
                        self.timeout,
                    )
                    .await?;
                FeatureEntry {
                    feature_id,
                    feature_index: response.feature_index,
                    version: response.version,
                    flags: FeatureFlags {
                        hidden: response.hidden,
                        ..Default::default()
                    },
                }
            }
        };

        if entry.feature_index == 0 {
            info!(
                "Feature {:#06x} not supported by device {:02x}",
                feature_id, self.device_index
            );
            return Ok(Lookup::NotSupported);
        }

        match feature_info(feature_id) {
            Some(info) if entry.version > info.max_version => warn!(
                "{} version {} is newer than the supported {}",
                info.name, entry.version, info.max_version
            ),
            Some(info) => debug!(
                "{} at index {:#04x} v{}",
                info.name, entry.feature_index, entry.version
            ),
            None => debug!(
                "Unknown feature {:#06x} at index {:#04x}",
                feature_id, entry.feature_index
            ),
        }
        Ok(Lookup::Present(entry))
    }

    /// Records an entry learned by other means (e.g. feature enumeration)
    pub fn insert(&self, entry: FeatureEntry) {
        self.entries
            .write()
            .insert(entry.feature_id, Lookup::Present(entry));
    }

    /// Known features ordered by index
    pub fn entries(&self) -> Vec<FeatureEntry> {
        let mut entries: Vec<FeatureEntry> = self
            .entries
            .read()
            .values()
            .filter_map(|lookup| match lookup {
                Lookup::Present(entry) => Some(*entry),
                Lookup::NotSupported => None,
            })
            .collect();
        entries.sort_by_key(|entry| entry.feature_index);
        entries
    }

    /// Forgets every mapping, used on device reset
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.write();
        if !entries.is_empty() {
            info!(
                "Invalidating {} registry entries of device {:02x}",
                entries.len(),
                self.device_index
            );
        }
        entries.clear();
    }
}

// ----- Tests -----

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;
    use crate::device::loopback::{self, Responder};
    use hidpp_protocol::features::Message;
    use hidpp_protocol::{Header, Packet};
    use std::sync::atomic::AtomicUsize;

    /// Device carrying 0x1861 at index 5, nothing else
    fn device(lookups: Arc<AtomicUsize>, answer: bool) -> (Arc<Dispatcher>, Responder) {
        let (transport, endpoint) = loopback::pair();
        let dispatcher = Arc::new(Dispatcher::new(Box::new(transport), &Config::default()).unwrap());
        let responder = Responder::spawn(endpoint, move |frame| {
            lookups.fetch_add(1, Ordering::SeqCst);
            if !answer {
                return vec![];
            }
            let request = h0000::GetFeature::decode(frame).unwrap();
            let header = Header::parse(frame).unwrap();
            let feature_index = if request.feature_id == 0x1861 { 5 } else { 0 };
            let payload = h0000::GetFeatureResponse {
                feature_index,
                flags: FeatureFlags::default(),
                version: 1,
            }
            .payload()
            .unwrap();
            vec![Packet { header, payload }.to_frame().unwrap().to_vec()]
        })
        .unwrap();
        (dispatcher, responder)
    }

    #[tokio::test]
    async fn lookup_is_cached() {
        let lookups = Arc::new(AtomicUsize::new(0));
        let (dispatcher, _device) = device(lookups.clone(), true);
        let registry =
            FeatureRegistry::new(dispatcher, 0x01, Protocol::Hidpp20, Duration::from_secs(1));

        let entry = registry.get_feature_index(0x1861).await.unwrap();
        assert_eq!(entry.feature_index, 5);
        assert_eq!(entry.version, 1);
        assert_eq!(registry.get_feature_index(0x1861).await, Ok(entry));
        assert_eq!(lookups.load(Ordering::SeqCst), 1);

        // Unsupported is remembered too
        assert_eq!(
            registry.get_feature_index(0x1E02).await,
            Err(CoreError::NotSupported { feature_id: 0x1E02 })
        );
        assert_eq!(
            registry.get_feature_index(0x1E02).await,
            Err(CoreError::NotSupported { feature_id: 0x1E02 })
        );
        assert_eq!(lookups.load(Ordering::SeqCst), 2);
        assert_eq!(registry.entries(), vec![entry]);

        registry.invalidate();
        assert_eq!(registry.cached(0x1861), None);
        registry.get_feature_index(0x1861).await.unwrap();
        assert_eq!(lookups.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn root_needs_no_lookup() {
        let lookups = Arc::new(AtomicUsize::new(0));
        let (dispatcher, _device) = device(lookups.clone(), true);

        let registry = FeatureRegistry::new(
            dispatcher.clone(),
            0x01,
            Protocol::Hidpp20,
            Duration::from_secs(1),
        );
        assert_eq!(registry.get_feature_index(0x0000).await.unwrap().feature_index, 0);

        let registry = FeatureRegistry::new(dispatcher, 0x01, Protocol::Vlp, Duration::from_secs(1));
        assert_eq!(registry.get_feature_index(0x0102).await.unwrap().feature_index, 1);
        assert_eq!(lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn silent_device_is_unreachable() {
        let lookups = Arc::new(AtomicUsize::new(0));
        let (dispatcher, _device) = device(lookups.clone(), false);
        let registry = FeatureRegistry::new(
            dispatcher,
            0x01,
            Protocol::Hidpp20,
            Duration::from_millis(50),
        );

        for _ in 0..2 {
            assert_eq!(
                registry.get_feature_index(0x1861).await,
                Err(CoreError::Unreachable { feature_id: 0x1861 })
            );
        }
        // Not cached, every call goes to the device
        assert_eq!(lookups.load(Ordering::SeqCst), 2);
    }
}
