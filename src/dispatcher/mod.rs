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

/// Bounded event queues and typed subscriptions
pub mod queue;

// ----- Crates -----

use crate::config::Config;
use crate::device::Transport;
use crate::error::CoreError;
use hidpp_protocol::features::{Message, Route};
use hidpp_protocol::vlp::{self, Reassembler, Reassembly};
use hidpp_protocol::{
    validate_len, DeviceError, ErrorFrame, Header, HidppParseError, Packet, MAX_FRAME_LEN,
    VLP_HEADER_LEN,
};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};

pub use queue::{EventQueue, Subscription};

// ----- Constants -----

/// Software ids handed out to HID++ 2.0 requests
/// 0 is reserved for device initiated events
const SOFTWARE_IDS: u8 = 15;

/// Upper bound between slot availability checks while a request waits
/// (expired keys do not signal when they age out)
const SLOT_RECHECK: Duration = Duration::from_millis(10);

// ----- Structs -----

/// Identifies a request and its reply
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub struct CorrelationKey {
    pub device_index: u8,
    pub feature_index: u8,
    pub function_id: u8,
    pub software_id: u8,
}

impl From<&Header> for CorrelationKey {
    fn from(header: &Header) -> Self {
        CorrelationKey {
            device_index: header.device_index,
            feature_index: header.feature_index,
            function_id: header.function_id,
            software_id: header.software_id,
        }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dev:{:02x} feat:{:02x} fn:{:x} sw:{:x}",
            self.device_index, self.feature_index, self.function_id, self.software_id
        )
    }
}

/// Routes events to a subscriber queue
///
/// `None` fields match anything. Lookups try the most specific key first.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub struct SubscriberKey {
    pub device_index: Option<u8>,
    pub feature_index: u8,
    pub function_id: Option<u8>,
}

impl SubscriberKey {
    /// Candidate keys for an event header, most specific first
    fn candidates(header: &Header) -> [SubscriberKey; 4] {
        let key = |device_index, function_id| SubscriberKey {
            device_index,
            feature_index: header.feature_index,
            function_id,
        };
        let device = Some(header.device_index);
        let function = Some(header.function_id);
        [
            key(device, function),
            key(device, None),
            key(None, function),
            key(None, None),
        ]
    }
}

/// Reply that arrived for a request that was no longer waiting
#[derive(Clone, Debug)]
pub struct OrphanReply {
    pub key: CorrelationKey,
    pub reply: Result<Packet, DeviceError>,
}

/// Inbound frame that could not be routed
#[derive(Clone, Debug)]
pub enum InboundError {
    /// Unknown report id or length not matching its class
    Malformed {
        frame: Vec<u8>,
        error: HidppParseError,
    },
    /// Error frame that matches no outstanding or recently expired request
    UnmatchedError(ErrorFrame),
    /// VLP sequence broken, the partial message was discarded
    VlpGap {
        key: CorrelationKey,
        expected: u8,
        got: u8,
    },
    /// Event delivered to a subscriber that failed to decode
    Undecodable {
        packet: Packet,
        error: HidppParseError,
    },
}

struct PendingRequest {
    /// Request type, for logging
    tag: &'static str,
    completion: oneshot::Sender<Result<Packet, CoreError>>,
}

#[derive(Default)]
struct State {
    pending: HashMap<CorrelationKey, PendingRequest>,
    /// Keys of timed out requests and when they timed out
    expired: HashMap<CorrelationKey, Instant>,
    next_software_id: u8,
    subscribers: HashMap<SubscriberKey, Arc<EventQueue<Packet>>>,
    reassemblers: HashMap<CorrelationKey, Reassembler>,
}

impl State {
    fn purge_expired(&mut self, window: Duration) {
        let now = Instant::now();
        self.expired
            .retain(|_, expired_at| now.duration_since(*expired_at) < window);
    }

    fn in_use(&self, key: &CorrelationKey) -> bool {
        self.pending.contains_key(key) || self.expired.contains_key(key)
    }

    /// Next free software id for the (device, feature, function) triple
    fn allocate(&mut self, mut key: CorrelationKey) -> Option<CorrelationKey> {
        for _ in 0..SOFTWARE_IDS {
            let software_id = self.next_software_id;
            self.next_software_id = software_id % SOFTWARE_IDS + 1;
            key.software_id = software_id;
            if !self.in_use(&key) {
                return Some(key);
            }
        }
        None
    }

    /// Queue of the most specific live subscriber
    fn subscriber(&mut self, header: &Header) -> Option<Arc<EventQueue<Packet>>> {
        for key in SubscriberKey::candidates(header) {
            let live = match self.subscribers.get(&key) {
                Some(queue) => Arc::strong_count(queue) > 1,
                None => continue,
            };
            if live {
                return self.subscribers.get(&key).cloned();
            }
            debug!("Dropping subscriber {:?}, no handles left", key);
            self.subscribers.remove(&key);
        }
        None
    }
}

type ResetHook = Box<dyn Fn() + Send + Sync>;

struct Shared {
    transport: Mutex<Box<dyn Transport>>,
    state: Mutex<State>,
    /// Signalled whenever a correlation key is released
    slot_freed: Notify,
    running: AtomicBool,
    unclaimed: Arc<EventQueue<Packet>>,
    orphans: Arc<EventQueue<OrphanReply>>,
    errors: Arc<EventQueue<InboundError>>,
    reset_hooks: Mutex<Vec<ResetHook>>,
    config: Config,
}

impl Shared {
    fn fail_pending(&self, error: CoreError) {
        let mut state = self.state.lock();
        for (key, pending) in state.pending.drain() {
            debug!("Failing {} ({}) with {}", key, pending.tag, error);
            pending.completion.send(Err(error.clone())).ok();
        }
        state.reassemblers.clear();
        drop(state);
        self.slot_freed.notify_waiters();
    }

    fn device_reset(&self) {
        info!("Device reset detected");
        self.state.lock().reassemblers.clear();
        for hook in self.reset_hooks.lock().iter() {
            hook();
        }
    }

    /// Classifies a single inbound frame
    fn handle_frame(&self, frame: &[u8]) {
        trace!("Inbound {:02x?}", frame);
        self.state.lock().purge_expired(self.config.orphan_window());

        let report_id = match validate_len(frame) {
            Ok(report_id) => report_id,
            Err(error) => {
                warn!("Malformed frame {:02x?} - {}", frame, error);
                self.errors.push(InboundError::Malformed {
                    frame: frame.to_vec(),
                    error,
                });
                return;
            }
        };

        match ErrorFrame::parse(frame) {
            Ok(Some(error)) => return self.route_error(error),
            Ok(None) => {}
            Err(error) => {
                self.errors.push(InboundError::Malformed {
                    frame: frame.to_vec(),
                    error,
                });
                return;
            }
        }

        let packet = if report_id.is_vlp() {
            match self.reassemble(frame) {
                Ok(Some(packet)) => packet,
                Ok(None) => return,
                Err(error) => {
                    self.errors.push(InboundError::Malformed {
                        frame: frame.to_vec(),
                        error,
                    });
                    return;
                }
            }
        } else {
            match Packet::from_frame(frame) {
                Ok(packet) => packet,
                Err(error) => {
                    self.errors.push(InboundError::Malformed {
                        frame: frame.to_vec(),
                        error,
                    });
                    return;
                }
            }
        };
        self.route_packet(packet);
    }

    /// Feeds a VLP fragment, returns the logical packet once complete
    fn reassemble(&self, frame: &[u8]) -> Result<Option<Packet>, HidppParseError> {
        let header = Header::parse(frame)?;
        let control = vlp::control(frame)?;
        let key = CorrelationKey::from(&header);

        let mut state = self.state.lock();
        let reassembly = state
            .reassemblers
            .entry(key)
            .or_insert_with(Reassembler::new)
            .push(control, &frame[VLP_HEADER_LEN..]);
        match reassembly {
            Reassembly::Incomplete => Ok(None),
            Reassembly::Complete(payload) => {
                state.reassemblers.remove(&key);
                Ok(Some(Packet { header, payload }))
            }
            Reassembly::Interrupted {
                expected,
                got,
                complete,
            } => {
                if complete.is_some() {
                    state.reassemblers.remove(&key);
                }
                drop(state);
                warn!("VLP message on {} interrupted at seq {}", key, expected);
                self.errors
                    .push(InboundError::VlpGap { key, expected, got });
                Ok(complete.map(|payload| Packet { header, payload }))
            }
            Reassembly::Gap { expected, got } => {
                state.reassemblers.remove(&key);
                drop(state);
                warn!("VLP gap on {}, expected {} got {}", key, expected, got);
                self.errors
                    .push(InboundError::VlpGap { key, expected, got });
                Ok(None)
            }
            Reassembly::Ack { sequence_number } => {
                trace!("VLP ack {} on {}", sequence_number, key);
                Ok(None)
            }
        }
    }

    fn route_error(&self, error: ErrorFrame) {
        let key = CorrelationKey::from(&error.original);
        let mut state = self.state.lock();
        if let Some(pending) = state.pending.remove(&key) {
            debug!("{} ({}) failed with {}", key, pending.tag, error.error);
            // Sent under the lock so a timing out request still observes it
            if pending
                .completion
                .send(Err(CoreError::from(error.error)))
                .is_err()
            {
                self.orphans.push(OrphanReply {
                    key,
                    reply: Err(error.error),
                });
            }
            drop(state);
            self.slot_freed.notify_waiters();
        } else if state.expired.remove(&key).is_some() {
            drop(state);
            debug!("Late error {} for {}", error.error, key);
            self.orphans.push(OrphanReply {
                key,
                reply: Err(error.error),
            });
            self.slot_freed.notify_waiters();
        } else {
            drop(state);
            warn!("Unmatched error {} for {}", error.error, key);
            self.errors.push(InboundError::UnmatchedError(error));
        }
    }

    fn route_packet(&self, packet: Packet) {
        let key = CorrelationKey::from(&packet.header);
        let mut state = self.state.lock();
        if let Some(pending) = state.pending.remove(&key) {
            trace!("Reply for {} ({})", key, pending.tag);
            if let Err(Ok(packet)) = pending.completion.send(Ok(packet)) {
                self.orphans.push(OrphanReply {
                    key,
                    reply: Ok(packet),
                });
            }
            drop(state);
            self.slot_freed.notify_waiters();
            return;
        }

        if state.expired.remove(&key).is_some() {
            drop(state);
            debug!("Late reply for {}", key);
            self.orphans.push(OrphanReply {
                key,
                reply: Ok(packet),
            });
            self.slot_freed.notify_waiters();
            return;
        }

        match state.subscriber(&packet.header) {
            Some(queue) => {
                drop(state);
                queue.push(packet);
            }
            None => {
                drop(state);
                trace!("Unclaimed event {}", packet.header);
                self.unclaimed.push(packet);
            }
        }
    }
}

/// Releases a correlation key if its request stops waiting early
///
/// A released key is remembered for the orphan window so a late reply
/// is not mistaken for an event or for the reply of a newer request.
struct PendingGuard<'a> {
    shared: &'a Shared,
    key: CorrelationKey,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if let Some(pending) = state.pending.remove(&self.key) {
            debug!("Expiring {} ({})", self.key, pending.tag);
            state.expired.insert(self.key, Instant::now());
        }
    }
}

/// Inbound loop
///
/// Polls the transport until shutdown or disconnection.
fn inbound_loop(shared: Arc<Shared>) {
    info!("Dispatcher thread started");
    let mut buf = vec![0u8; MAX_FRAME_LEN];
    let poll_interval = shared.config.poll_interval();

    while shared.running.load(Ordering::SeqCst) {
        let mut transport = shared.transport.lock();
        let reset = transport.take_reset_signal();
        let result = transport.read(&mut buf, poll_interval);
        let connected = transport.is_connected();
        // Hand the lock to a waiting writer
        MutexGuard::unlock_fair(transport);

        if reset {
            shared.device_reset();
        }

        match result {
            Ok(0) => {}
            Ok(len) => shared.handle_frame(&buf[..len]),
            Err(e) => {
                error!("Transport read failed - {}", e);
                shared.fail_pending(CoreError::from(e));
                if !connected {
                    warn!("Transport disconnected, stopping dispatcher");
                    shared.running.store(false, Ordering::SeqCst);
                    break;
                }
                thread::sleep(poll_interval);
            }
        }
    }

    shared.fail_pending(CoreError::Shutdown);
    info!("Dispatcher thread stopped");
}

/// Request/reply correlation and event routing
///
/// Owns the transport. A dedicated thread reads inbound frames and either
/// completes the matching pending request or routes the frame as an event.
pub struct Dispatcher {
    shared: Arc<Shared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(transport: Box<dyn Transport>, config: &Config) -> Result<Dispatcher, CoreError> {
        config.validate()?;
        let capacity = config.queue_capacity;
        info!("Dispatching for {}", transport.name());

        let shared = Arc::new(Shared {
            transport: Mutex::new(transport),
            state: Mutex::new(State {
                next_software_id: 1,
                ..Default::default()
            }),
            slot_freed: Notify::new(),
            running: AtomicBool::new(true),
            unclaimed: Arc::new(EventQueue::new("unclaimed", capacity)),
            orphans: Arc::new(EventQueue::new("orphans", capacity)),
            errors: Arc::new(EventQueue::new("errors", capacity)),
            reset_hooks: Mutex::new(Vec::new()),
            config: config.clone(),
        });

        let thread_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("hidpp-dispatcher".to_string())
            .spawn(move || inbound_loop(thread_shared))?;

        Ok(Dispatcher {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Reserves a correlation key, waiting for one to free up until `deadline`
    async fn reserve(
        &self,
        template: CorrelationKey,
        allocate: bool,
        tag: &'static str,
        deadline: Instant,
    ) -> Result<(CorrelationKey, oneshot::Receiver<Result<Packet, CoreError>>), CoreError> {
        loop {
            let notified = self.shared.slot_freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock();
                state.purge_expired(self.shared.config.orphan_window());
                let key = if allocate {
                    state.allocate(template)
                } else if state.in_use(&template) {
                    None
                } else {
                    Some(template)
                };
                if let Some(key) = key {
                    let (completion, receiver) = oneshot::channel();
                    state
                        .pending
                        .insert(key, PendingRequest { tag, completion });
                    return Ok((key, receiver));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                warn!("No free software id for {} ({})", template, tag);
                return Err(CoreError::Timeout);
            }
            let wait_until = deadline.min(now + SLOT_RECHECK);
            tokio::time::timeout_at(wait_until.into(), notified).await.ok();
        }
    }

    /// Sends a request and waits for the raw reply packet
    ///
    /// # Remarks
    /// HID++ 2.0 requests get a rotating software id. HID++ 1.0 register
    /// requests are keyed on their sub id and address, so at most one is
    /// outstanding per register. Device error frames complete the request
    /// with [`CoreError::ProtocolError`].
    pub async fn send<M: Message>(
        &self,
        device_index: u8,
        feature_index: u8,
        message: &M,
        timeout: Duration,
    ) -> Result<Packet, CoreError> {
        if !self.is_running() {
            return Err(CoreError::Shutdown);
        }
        let tag = std::any::type_name::<M>();
        let deadline = Instant::now() + timeout;
        let template = CorrelationKey::from(&M::header(device_index, feature_index, 0));
        let allocate = matches!(M::ROUTE, Route::Feature { .. });

        let (key, mut receiver) = self.reserve(template, allocate, tag, deadline).await?;
        let guard = PendingGuard {
            shared: &self.shared,
            key,
        };

        let packet = message.to_packet(device_index, feature_index, key.software_id)?;
        let frames = if packet.header.report_id.is_vlp() {
            vlp::fragment(
                packet.header,
                &packet.payload,
                self.shared.config.vlp_frame_len,
                false,
            )?
        } else {
            vec![packet.to_frame()?]
        };

        {
            let mut transport = self.shared.transport.lock();
            for frame in &frames {
                trace!("Outbound {} {:02x?}", key, &frame[..]);
                if let Err(e) = transport.write(frame) {
                    error!("send {} ({}) - {}", key, tag, e);
                    return Err(e.into());
                }
            }
        }

        match tokio::time::timeout_at(deadline.into(), &mut receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CoreError::Shutdown),
            Err(_) => {
                drop(guard);
                match receiver.try_recv() {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("{} ({}) timed out", key, tag);
                        Err(CoreError::Timeout)
                    }
                }
            }
        }
    }

    /// Sends a request and decodes the reply as `Resp`
    pub async fn request<Req: Message, Resp: Message>(
        &self,
        device_index: u8,
        feature_index: u8,
        message: &Req,
        timeout: Duration,
    ) -> Result<Resp, CoreError> {
        let packet = self
            .send(device_index, feature_index, message, timeout)
            .await?;
        Resp::from_packet(&packet).map_err(|e| {
            warn!(
                "{} reply undecodable as {} - {}",
                packet.header,
                std::any::type_name::<Resp>(),
                e
            );
            e.into()
        })
    }

    fn register(&self, key: SubscriberKey) -> Arc<EventQueue<Packet>> {
        let mut state = self.shared.state.lock();
        state
            .subscribers
            .entry(key)
            .or_insert_with(|| {
                debug!("New subscriber {:?}", key);
                Arc::new(EventQueue::new(
                    format!("{:?}", key),
                    self.shared.config.queue_capacity,
                ))
            })
            .clone()
    }

    /// Subscribes with a custom decoder
    ///
    /// Subscriptions of the same key share one queue.
    pub fn subscribe_with<T>(
        &self,
        key: SubscriberKey,
        decode: fn(&Packet) -> Result<T, HidppParseError>,
    ) -> Subscription<T> {
        Subscription::new(self.register(key), self.shared.errors.clone(), decode)
    }

    /// Subscribes to events of message type `M`
    ///
    /// `feature_index` is ignored for HID++ 1.0 messages, their sub id is used.
    /// `None` as device index receives the events of every device.
    pub fn subscribe<M: Message>(
        &self,
        device_index: Option<u8>,
        feature_index: u8,
    ) -> Subscription<M> {
        let key = match M::ROUTE {
            Route::Feature { function_id, .. } => SubscriberKey {
                device_index,
                feature_index,
                function_id: Some(function_id),
            },
            Route::Register { sub_id, address } => SubscriberKey {
                device_index,
                feature_index: sub_id,
                function_id: Some(address >> 4),
            },
            // Byte 3 of a notification is data
            Route::Notification { sub_id } => SubscriberKey {
                device_index,
                feature_index: sub_id,
                function_id: None,
            },
        };
        self.subscribe_with(key, M::from_packet)
    }

    /// Subscribes to undecoded packets
    pub fn subscribe_raw(
        &self,
        device_index: Option<u8>,
        feature_index: u8,
        function_id: Option<u8>,
    ) -> Subscription<Packet> {
        self.subscribe_with(
            SubscriberKey {
                device_index,
                feature_index,
                function_id,
            },
            |packet| Ok(packet.clone()),
        )
    }

    /// Events no subscriber claimed
    pub fn unclaimed(&self) -> Arc<EventQueue<Packet>> {
        self.shared.unclaimed.clone()
    }

    /// Replies that arrived after their request timed out or was dropped
    pub fn orphans(&self) -> Arc<EventQueue<OrphanReply>> {
        self.shared.orphans.clone()
    }

    /// Inbound frames that could not be routed or decoded
    pub fn errors(&self) -> Arc<EventQueue<InboundError>> {
        self.shared.errors.clone()
    }

    /// Number of requests waiting for a reply
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Runs `hook` on the dispatcher side whenever the device resets
    pub fn on_device_reset(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.shared.reset_hooks.lock().push(Box::new(hook));
    }

    /// Resets the device and runs the reset hooks before returning
    pub fn reset_device(&self) -> Result<(), CoreError> {
        {
            let mut transport = self.shared.transport.lock();
            transport.reset_device()?;
            // Already handled here, the inbound loop must not repeat it
            transport.take_reset_signal();
        }
        self.shared.device_reset();
        Ok(())
    }

    /// Stops the inbound thread, pending requests fail with [`CoreError::Shutdown`]
    pub fn shutdown(&self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            info!("Shutting down dispatcher");
        }
        if let Some(thread) = self.thread.lock().take() {
            // Last handle dropped from a reset hook, the loop exits on its own
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                error!("Dispatcher thread panicked");
            }
        }
        self.shared.fail_pending(CoreError::Shutdown);
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ----- Tests -----

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::loopback::{self, DeviceEndpoint};
    use hidpp_protocol::features::{h0000, h0001};
    use hidpp_protocol::{ErrorCode, ReportId};

    fn dispatcher(config: Config) -> (Dispatcher, DeviceEndpoint) {
        let (transport, endpoint) = loopback::pair();
        let dispatcher = Dispatcher::new(Box::new(transport), &config).unwrap();
        (dispatcher, endpoint)
    }

    fn quick() -> Config {
        Config {
            request_timeout_ms: 200,
            orphan_window_ms: 500,
            ..Default::default()
        }
    }

    /// Replies to the request frame with `payload` on the same header
    fn reply(request: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; request.len()];
        frame[..4].copy_from_slice(&request[..4]);
        frame[4..4 + payload.len()].copy_from_slice(payload);
        frame
    }

    #[tokio::test]
    async fn software_ids_rotate() {
        let (dispatcher, endpoint) = dispatcher(quick());
        let device = tokio::task::spawn_blocking(move || {
            let mut seen = Vec::new();
            for _ in 0..3 {
                let request = endpoint.recv(Duration::from_secs(1)).unwrap();
                seen.push(request[3] & 0x0F);
                endpoint.send(&reply(&request, &[0x05, 0x00, 0x01])).unwrap();
            }
            seen
        });

        for _ in 0..3 {
            let response: h0000::GetFeatureResponse = dispatcher
                .request(
                    0x01,
                    h0000::FEATURE_INDEX,
                    &h0000::GetFeature { feature_id: 0x1861 },
                    Duration::from_secs(1),
                )
                .await
                .unwrap();
            assert_eq!(response.feature_index, 0x05);
        }
        assert_eq!(device.await.unwrap(), vec![1, 2, 3]);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn error_frame_completes_request() {
        let (dispatcher, endpoint) = dispatcher(quick());
        tokio::task::spawn_blocking(move || {
            let request = endpoint.recv(Duration::from_secs(1)).unwrap();
            let error = ErrorFrame {
                original: Header::parse(&request).unwrap(),
                error: DeviceError::Hidpp20(ErrorCode::InvalidArgument.into()),
            };
            endpoint.send(&error.to_frame().unwrap()).unwrap();
        });

        let result = dispatcher
            .send(0x01, 0x02, &h0001::GetCount, Duration::from_secs(1))
            .await;
        assert_eq!(
            result,
            Err(CoreError::ProtocolError {
                code: DeviceError::Hidpp20(0x02)
            })
        );
    }

    #[tokio::test]
    async fn late_reply_becomes_orphan() {
        let (dispatcher, endpoint) = dispatcher(quick());
        let result = dispatcher
            .send(0x01, 0x02, &h0001::GetCount, Duration::from_millis(50))
            .await;
        assert_eq!(result, Err(CoreError::Timeout));

        let request = endpoint.recv(Duration::from_secs(1)).unwrap();
        endpoint.send(&reply(&request, &[0x09])).unwrap();

        let orphan = dispatcher
            .orphans()
            .recv(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(orphan.key.software_id, request[3] & 0x0F);
        assert_eq!(orphan.reply.unwrap().payload[0], 0x09);
        assert!(dispatcher.unclaimed().is_empty());
    }

    #[tokio::test]
    async fn events_route_to_most_specific_subscriber() {
        let (dispatcher, endpoint) = dispatcher(quick());
        let any_device = dispatcher.subscribe_raw(None, 0x04, None);
        let exact = dispatcher.subscribe_raw(Some(0x01), 0x04, Some(0x0));

        let event = |dev: u8, function: u8| {
            let mut frame = vec![0u8; 20];
            frame[..4].copy_from_slice(&[0x11, dev, 0x04, function << 4]);
            frame
        };
        endpoint.send(&event(0x01, 0x0)).unwrap();
        endpoint.send(&event(0x02, 0x0)).unwrap();
        endpoint.send(&event(0x01, 0x1)).unwrap();

        let timeout = Duration::from_secs(1);
        assert_eq!(exact.recv(timeout).await.unwrap().header.device_index, 0x01);
        assert_eq!(any_device.recv(timeout).await.unwrap().header.device_index, 0x02);
        assert_eq!(any_device.recv(timeout).await.unwrap().header.function_id, 0x1);
        assert!(exact.is_empty());

        // Dropped subscriptions no longer claim events
        drop(exact);
        drop(any_device);
        endpoint.send(&event(0x01, 0x0)).unwrap();
        let unclaimed = dispatcher.unclaimed().recv(timeout).await.unwrap();
        assert_eq!(unclaimed.header.report_id, ReportId::Long);
    }

    #[tokio::test]
    async fn malformed_and_unmatched_frames_are_reported() {
        let (dispatcher, endpoint) = dispatcher(quick());
        let errors = dispatcher.errors();

        endpoint.send(&[0x10, 0x01, 0x00]).unwrap();
        endpoint.send(&[0x10, 0x01, 0xFF, 0x05, 0x23, 0x05, 0x00]).unwrap();

        let timeout = Duration::from_secs(1);
        assert!(matches!(
            errors.recv(timeout).await,
            Some(InboundError::Malformed { .. })
        ));
        assert!(matches!(
            errors.recv(timeout).await,
            Some(InboundError::UnmatchedError(_))
        ));
    }

    #[tokio::test]
    async fn vlp_reply_is_reassembled() {
        let config = Config {
            vlp_frame_len: 8,
            ..quick()
        };
        let (dispatcher, endpoint) = dispatcher(config);
        tokio::task::spawn_blocking(move || {
            let request = endpoint.recv(Duration::from_secs(1)).unwrap();
            let header = Header::parse(&request).unwrap();
            let payload: Vec<u8> = (0..10).collect();
            for frame in vlp::fragment(header, &payload, 8, false).unwrap() {
                endpoint.send(&frame).unwrap();
            }
        });

        let packet = dispatcher
            .send(
                0x01,
                0x01,
                &hidpp_protocol::features::h0102::GetPingData {
                    ping_data: 0x5A5A_5A5A,
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(packet.payload, (0..10).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn concurrent_requests_get_distinct_software_ids() {
        let (dispatcher, endpoint) = dispatcher(quick());
        tokio::task::spawn_blocking(move || {
            let requests: Vec<Vec<u8>> = (0..3)
                .map(|_| endpoint.recv(Duration::from_secs(1)).unwrap())
                .collect();
            for request in &requests {
                endpoint.send(&reply(request, &[request[3] & 0x0F])).unwrap();
            }
        });

        let timeout = Duration::from_secs(1);
        let (a, b, c) = tokio::join!(
            dispatcher.send(0x01, 0x02, &h0001::GetCount, timeout),
            dispatcher.send(0x01, 0x02, &h0001::GetCount, timeout),
            dispatcher.send(0x01, 0x02, &h0001::GetCount, timeout),
        );
        let mut ids = Vec::new();
        for packet in [a.unwrap(), b.unwrap(), c.unwrap()] {
            assert_eq!(packet.payload[0], packet.header.software_id);
            ids.push(packet.header.software_id);
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert!(!ids.contains(&0));
    }

    async fn lookup(
        dispatcher: &Dispatcher,
        feature_id: u16,
    ) -> Result<h0000::GetFeatureResponse, CoreError> {
        dispatcher
            .request(
                0x01,
                h0000::FEATURE_INDEX,
                &h0000::GetFeature { feature_id },
                Duration::from_secs(1),
            )
            .await
    }

    #[tokio::test]
    async fn out_of_order_replies_reach_their_caller() {
        let (dispatcher, endpoint) = dispatcher(quick());
        tokio::task::spawn_blocking(move || {
            let requests: Vec<Vec<u8>> = (0..3)
                .map(|_| endpoint.recv(Duration::from_secs(1)).unwrap())
                .collect();
            // Feature index echoes the low byte of the requested feature id
            for request in requests.iter().rev() {
                endpoint.send(&reply(request, &[request[5], 0x00, 0x01])).unwrap();
            }
        });

        let (a, b, c) = tokio::join!(
            lookup(&dispatcher, 0x1861),
            lookup(&dispatcher, 0x1862),
            lookup(&dispatcher, 0x1863),
        );
        assert_eq!(a.unwrap().feature_index, 0x61);
        assert_eq!(b.unwrap().feature_index, 0x62);
        assert_eq!(c.unwrap().feature_index, 0x63);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    /// Starts 15 GetCount requests that the device holds on to
    async fn fill_software_ids(
        dispatcher: &Arc<Dispatcher>,
        timeout: Duration,
    ) -> Vec<tokio::task::JoinHandle<Result<Packet, CoreError>>> {
        let tasks: Vec<_> = (0..SOFTWARE_IDS)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    dispatcher
                        .send(0x01, 0x02, &h0001::GetCount, timeout)
                        .await
                })
            })
            .collect();
        while dispatcher.pending_count() < SOFTWARE_IDS as usize {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tasks
    }

    #[tokio::test]
    async fn sixteenth_request_waits_for_a_free_software_id() {
        let (dispatcher, endpoint) = dispatcher(quick());
        let dispatcher = Arc::new(dispatcher);
        let device = tokio::task::spawn_blocking(move || {
            let held: Vec<Vec<u8>> = (0..SOFTWARE_IDS)
                .map(|_| endpoint.recv(Duration::from_secs(1)).unwrap())
                .collect();
            assert_eq!(endpoint.recv(Duration::from_millis(150)), None);

            endpoint.send(&reply(&held[0], &[0x01])).unwrap();
            let late = endpoint.recv(Duration::from_secs(1)).unwrap();
            endpoint.send(&reply(&late, &[0x02])).unwrap();
            for request in &held[1..] {
                endpoint.send(&reply(request, &[0x01])).unwrap();
            }
            (held[0][3] & 0x0F, late[3] & 0x0F)
        });

        let tasks = fill_software_ids(&dispatcher, Duration::from_secs(2)).await;
        let started = Instant::now();
        let packet = dispatcher
            .send(0x01, 0x02, &h0001::GetCount, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(packet.payload[0], 0x02);

        let (freed, reused) = device.await.unwrap();
        assert_eq!(freed, reused);
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().payload[0], 0x01);
        }
    }

    #[tokio::test]
    async fn sixteenth_request_times_out_without_a_free_software_id() {
        let (dispatcher, endpoint) = dispatcher(quick());
        let dispatcher = Arc::new(dispatcher);
        let device = tokio::task::spawn_blocking(move || {
            let held: Vec<Vec<u8>> = (0..SOFTWARE_IDS)
                .map(|_| endpoint.recv(Duration::from_secs(1)).unwrap())
                .collect();
            // Nothing else may be written while every id is taken
            let extra = endpoint.recv(Duration::from_millis(300));
            for request in &held {
                endpoint.send(&reply(request, &[0x01])).unwrap();
            }
            extra
        });

        let tasks = fill_software_ids(&dispatcher, Duration::from_secs(2)).await;
        let started = Instant::now();
        let result = dispatcher
            .send(0x01, 0x02, &h0001::GetCount, Duration::from_millis(100))
            .await;
        assert_eq!(result, Err(CoreError::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(100));

        assert_eq!(device.await.unwrap(), None);
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn begin_frame_restarts_vlp_message() {
        let (dispatcher, endpoint) = dispatcher(quick());
        let events = dispatcher.subscribe_raw(Some(0x01), 0x02, Some(0x0));
        let errors = dispatcher.errors();
        let fragment = |control: u8, data: u8| vec![0x13, 0x01, 0x02, 0x00, control, data];
        let timeout = Duration::from_secs(1);

        for (control, data) in [(0x80, 0x11), (0x01, 0x22), (0x80, 0xAA), (0x01, 0xBB), (0x42, 0xCC)] {
            endpoint.send(&fragment(control, data)).unwrap();
        }
        assert_eq!(events.recv(timeout).await.unwrap().payload, vec![0xAA, 0xBB, 0xCC]);
        assert!(matches!(
            errors.recv(timeout).await,
            Some(InboundError::VlpGap {
                expected: 2,
                got: 0,
                ..
            })
        ));
        assert!(errors.is_empty());

        // Single frame message cutting a partial one short
        endpoint.send(&fragment(0x80, 0x11)).unwrap();
        endpoint.send(&fragment(0xC0, 0xAA)).unwrap();
        assert_eq!(events.recv(timeout).await.unwrap().payload, vec![0xAA]);
        assert!(matches!(
            errors.recv(timeout).await,
            Some(InboundError::VlpGap {
                expected: 1,
                got: 0,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn disconnect_fails_pending() {
        let (dispatcher, endpoint) = dispatcher(quick());
        let request = dispatcher.send(0x01, 0x02, &h0001::GetCount, Duration::from_secs(5));
        let disconnect = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            endpoint.disconnect();
        };
        let (result, _) = tokio::join!(request, disconnect);
        assert!(matches!(result, Err(CoreError::Transport(_))));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!dispatcher.is_running());
        assert_eq!(
            dispatcher
                .send(0x01, 0x02, &h0001::GetCount, Duration::from_secs(1))
                .await,
            Err(CoreError::Shutdown)
        );
    }
}
