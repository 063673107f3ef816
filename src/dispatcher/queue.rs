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

use super::InboundError;
use crate::error::CoreError;
use crossbeam::queue::ArrayQueue;
use hidpp_protocol::{HidppParseError, Packet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

// ----- Structs -----

/// Bounded event queue
///
/// # Remarks
///
/// Single producer (the dispatcher thread), any number of consumers.
/// On overflow the oldest event is dropped and counted.
pub struct EventQueue<T> {
    name: String,
    queue: ArrayQueue<T>,
    dropped: AtomicU64,
    notify: Notify,
}

impl<T> EventQueue<T> {
    pub fn new(name: impl Into<String>, capacity: usize) -> EventQueue<T> {
        EventQueue {
            name: name.into(),
            queue: ArrayQueue::new(capacity.max(1)),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn push(&self, item: T) {
        if self.queue.force_push(item).is_some() {
            let dropped = self.dropped.fetch_add(1, Ordering::SeqCst) + 1;
            warn!("{} queue full, dropped oldest event ({} total)", self.name, dropped);
        }
        self.notify.notify_waiters();
    }

    pub fn try_recv(&self) -> Option<T> {
        self.queue.pop()
    }

    /// Waits up to `timeout` for the next event
    pub async fn recv(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push in between is not missed
            notified.as_mut().enable();

            if let Some(item) = self.queue.pop() {
                return Some(item);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.queue.pop();
            }
        }
    }

    /// Number of events dropped on overflow since creation
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Removes every queued event, oldest first
    pub fn drain(&self) -> Vec<T> {
        std::iter::from_fn(|| self.queue.pop()).collect()
    }

    /// Discards every queued event, returns how many were discarded
    pub fn clear(&self) -> usize {
        self.drain().len()
    }
}

/// Typed view of a subscriber queue
///
/// Events are decoded when received. Undecodable events are reported on
/// the dispatcher error queue and returned as [`CoreError::Codec`].
/// Dropping every subscription of a key unregisters it.
pub struct Subscription<T> {
    queue: Arc<EventQueue<Packet>>,
    errors: Arc<EventQueue<InboundError>>,
    decode: fn(&Packet) -> Result<T, HidppParseError>,
}

impl<T> Subscription<T> {
    pub(crate) fn new(
        queue: Arc<EventQueue<Packet>>,
        errors: Arc<EventQueue<InboundError>>,
        decode: fn(&Packet) -> Result<T, HidppParseError>,
    ) -> Subscription<T> {
        Subscription {
            queue,
            errors,
            decode,
        }
    }

    fn decode(&self, packet: Packet) -> Result<T, CoreError> {
        (self.decode)(&packet).map_err(|error| {
            warn!("{} event {} - {}", self.queue.name(), packet.header, error);
            self.errors.push(InboundError::Undecodable {
                packet,
                error: error.clone(),
            });
            CoreError::Codec(error)
        })
    }

    pub fn try_recv(&self) -> Option<Result<T, CoreError>> {
        self.queue.try_recv().map(|packet| self.decode(packet))
    }

    /// Next event, [`CoreError::Timeout`] if none arrived in time
    pub async fn recv(&self, timeout: Duration) -> Result<T, CoreError> {
        match self.queue.recv(timeout).await {
            Some(packet) => self.decode(packet),
            None => Err(CoreError::Timeout),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Discards pending events, returns how many were discarded
    pub fn clear(&self) -> usize {
        self.queue.clear()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

// ----- Tests -----
