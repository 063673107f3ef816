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

//! In-memory transport
//!
//! The host half implements [`Transport`]; the [`DeviceEndpoint`] half is
//! driven by a test or an emulator thread playing the device.

use crate::device::Transport;
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Default)]
struct LinkState {
    disconnected: AtomicBool,
    reset_pending: AtomicBool,
    reset_requests: AtomicUsize,
}

/// Host half of a loopback link
pub struct LoopbackTransport {
    to_device: Sender<Vec<u8>>,
    from_device: Receiver<Vec<u8>>,
    state: Arc<LinkState>,
}

/// Device half of a loopback link
#[derive(Clone)]
pub struct DeviceEndpoint {
    from_host: Receiver<Vec<u8>>,
    to_host: Sender<Vec<u8>>,
    state: Arc<LinkState>,
}

/// Creates a connected transport/endpoint pair
pub fn pair() -> (LoopbackTransport, DeviceEndpoint) {
    let (to_device, from_host) = unbounded();
    let (to_host, from_device) = unbounded();
    let state = Arc::new(LinkState::default());

    (
        LoopbackTransport {
            to_device,
            from_device,
            state: state.clone(),
        },
        DeviceEndpoint {
            from_host,
            to_host,
            state,
        },
    )
}

fn not_connected() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::NotConnected, "loopback disconnected")
}

impl Transport for LoopbackTransport {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        if !self.is_connected() {
            return Err(not_connected());
        }
        match self.from_device.recv_timeout(timeout) {
            Ok(frame) => {
                if frame.len() > buf.len() {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("{} byte frame does not fit {}", frame.len(), buf.len()),
                    ));
                }
                buf[..frame.len()].copy_from_slice(&frame);
                trace!("Loopback received {:02x?}", frame);
                Ok(frame.len())
            }
            Err(RecvTimeoutError::Timeout) => Ok(0),
            Err(RecvTimeoutError::Disconnected) => {
                self.state.disconnected.store(true, Ordering::SeqCst);
                Err(not_connected())
            }
        }
    }

    fn write(&mut self, frame: &[u8]) -> std::io::Result<()> {
        if !self.is_connected() {
            return Err(not_connected());
        }
        trace!("Loopback sent {:02x?}", frame);
        self.to_device
            .send(frame.to_vec())
            .map_err(|_| not_connected())
    }

    fn reset_device(&mut self) -> std::io::Result<()> {
        self.state.reset_requests.fetch_add(1, Ordering::SeqCst);
        self.state.reset_pending.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.state.disconnected.load(Ordering::SeqCst)
    }

    fn take_reset_signal(&mut self) -> bool {
        self.state.reset_pending.swap(false, Ordering::SeqCst)
    }

    fn name(&self) -> String {
        "loopback".to_string()
    }
}

impl DeviceEndpoint {
    /// Next frame written by the host, None on timeout
    pub fn recv(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.from_host.recv_timeout(timeout).ok()
    }

    /// Emits a frame towards the host
    pub fn send(&self, frame: &[u8]) -> std::io::Result<()> {
        self.to_host.send(frame.to_vec()).map_err(|_| not_connected())
    }

    /// Signals an out-of-band device reset (e.g. power cycle)
    pub fn signal_reset(&self) {
        self.state.reset_pending.store(true, Ordering::SeqCst);
    }

    /// Simulates an unplug
    pub fn disconnect(&self) {
        self.state.disconnected.store(true, Ordering::SeqCst);
    }

    /// Number of reset_device calls made by the host
    pub fn reset_requests(&self) -> usize {
        self.state.reset_requests.load(Ordering::SeqCst)
    }
}

/// Device emulator thread
///
/// Every frame written by the host is passed to the handler; the frames it
/// returns are sent back in order. Stops when dropped.
pub struct Responder {
    running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Responder {
    pub fn spawn<F>(endpoint: DeviceEndpoint, mut handler: F) -> std::io::Result<Responder>
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let r = running.clone();
        let thread = thread::Builder::new()
            .name("Loopback device".to_string())
            .spawn(move || {
                while r.load(Ordering::SeqCst) {
                    let frame = match endpoint.recv(Duration::from_millis(10)) {
                        Some(frame) => frame,
                        None => continue,
                    };
                    for reply in handler(&frame) {
                        if endpoint.send(&reply).is_err() {
                            return;
                        }
                    }
                }
            })?;

        Ok(Responder {
            running,
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Loopback device thread panicked");
            }
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.stop();
    }
}
