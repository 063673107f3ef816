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

use crate::config::Config;
use crate::device::Transport;
use crate::dispatcher::Dispatcher;
use crate::error::CoreError;
use crate::nvs::NvsReader;
use crate::pairing::Pairing;
use crate::registry::{FeatureEntry, FeatureRegistry, Protocol};
use crate::session::Authentication;
use hidpp_protocol::features::h0001;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

// ----- Structs -----

/// Per device state
#[derive(Clone)]
pub struct DeviceChannel {
    pub registry: Arc<FeatureRegistry>,
    pub auth: Arc<Authentication>,
}

#[derive(Default)]
struct Channels {
    devices: HashMap<u8, DeviceChannel>,
    receivers: HashMap<u8, Arc<Pairing>>,
}

impl Channels {
    fn device_reset(&self) {
        for channel in self.devices.values() {
            channel.registry.invalidate();
            channel.auth.device_reset();
        }
        for pairing in self.receivers.values() {
            pairing.device_reset();
        }
    }
}

/// Handle threaded through callers
///
/// Owns the dispatcher (and through it the transport) and the per device
/// registries, sessions and pairing state machines. A device reset
/// invalidates all of them.
pub struct Core {
    config: Config,
    dispatcher: Arc<Dispatcher>,
    channels: Arc<Mutex<Channels>>,
    nvs: Option<Arc<dyn NvsReader>>,
}

impl Core {
    pub fn new(transport: Box<dyn Transport>, config: Config) -> Result<Core, CoreError> {
        let dispatcher = Arc::new(Dispatcher::new(transport, &config)?);
        let channels = Arc::new(Mutex::new(Channels::default()));

        let hook_channels: Weak<Mutex<Channels>> = Arc::downgrade(&channels);
        dispatcher.on_device_reset(move || {
            if let Some(channels) = hook_channels.upgrade() {
                channels.lock().device_reset();
            }
        });

        Ok(Core {
            config,
            dispatcher,
            channels,
            nvs: None,
        })
    }

    /// Supplies device NVS snapshots, used to verify pairing bonds
    pub fn with_nvs(mut self, nvs: Arc<dyn NvsReader>) -> Core {
        self.nvs = Some(nvs);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// State of a device, created on first use
    ///
    /// `protocol` only matters on creation.
    pub fn device(&self, device_index: u8, protocol: Protocol) -> DeviceChannel {
        let mut channels = self.channels.lock();
        channels
            .devices
            .entry(device_index)
            .or_insert_with(|| {
                debug!("New {:?} channel for device {:02x}", protocol, device_index);
                let registry = Arc::new(FeatureRegistry::new(
                    self.dispatcher.clone(),
                    device_index,
                    protocol,
                    self.config.lookup_timeout(),
                ));
                let auth = Arc::new(Authentication::new(
                    self.dispatcher.clone(),
                    registry.clone(),
                    self.config.request_timeout(),
                ));
                DeviceChannel { registry, auth }
            })
            .clone()
    }

    pub fn registry(&self, device_index: u8) -> Arc<FeatureRegistry> {
        self.device(device_index, Protocol::Hidpp20).registry
    }

    pub fn auth(&self, device_index: u8) -> Arc<Authentication> {
        self.device(device_index, Protocol::Hidpp20).auth
    }

    /// Pairing state machine of a receiver
    pub fn pairing(&self, receiver_index: u8) -> Arc<Pairing> {
        let mut channels = self.channels.lock();
        channels
            .receivers
            .entry(receiver_index)
            .or_insert_with(|| {
                Arc::new(Pairing::new(
                    self.dispatcher.clone(),
                    receiver_index,
                    &self.config,
                    self.nvs.clone(),
                ))
            })
            .clone()
    }

    pub async fn get_feature_index(
        &self,
        device_index: u8,
        feature_id: u16,
    ) -> Result<FeatureEntry, CoreError> {
        self.registry(device_index)
            .get_feature_index(feature_id)
            .await
    }

    /// Walks FeatureSet (0x0001) and records every feature in the registry
    pub async fn enumerate_features(&self, device_index: u8) -> Result<Vec<FeatureEntry>, CoreError> {
        let registry = self.registry(device_index);
        let feature_set = registry.get_feature_index(h0001::FEATURE_ID).await?;
        let timeout = self.config.request_timeout();

        let count: h0001::GetCountResponse = self
            .dispatcher
            .request(device_index, feature_set.feature_index, &h0001::GetCount, timeout)
            .await?;
        info!("Device {:02x} has {} features", device_index, count.count);

        for feature_index in 1..=count.count {
            let response: h0001::GetFeatureIdResponse = self
                .dispatcher
                .request(
                    device_index,
                    feature_set.feature_index,
                    &h0001::GetFeatureId { feature_index },
                    timeout,
                )
                .await?;
            registry.insert(FeatureEntry {
                feature_id: response.feature_id,
                feature_index,
                version: response.version,
                flags: response.flags,
            });
        }
        Ok(registry.entries())
    }

    /// Resets the device, every registry, session and pairing is invalidated
    pub fn reset_device(&self) -> Result<(), CoreError> {
        self.dispatcher.reset_device()
    }

    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }
}
