// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Routing of host channel signals to per-channel receive callbacks.

use crate::memory::DmaRingMem;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use vmbus_core::protocol::ChannelId;
use vmbus_ring::RingBuffer;

/// A callback invoked when the host signals a channel.
pub type ReceiveCallback = Box<dyn Fn() + Send + Sync>;

struct DispatchEntry {
    channel_id: ChannelId,
    callback: ReceiveCallback,
    incoming: Arc<RingBuffer<DmaRingMem>>,
    batched: Arc<AtomicBool>,
}

/// One registered event flag. The lock is held for reading while a callback
/// runs, so taking it for writing waits for callbacks in flight.
#[derive(Default)]
struct DispatchSlot {
    entry: RwLock<Option<DispatchEntry>>,
}

/// Maps event flags to the channels that own them.
#[derive(Default)]
pub struct EventDispatcher {
    slots: RwLock<HashMap<u16, Arc<DispatchSlot>>>,
}

const BITS_PER_WORD: usize = size_of::<AtomicU64>() * 8;

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for signals on `event_flag`.
    ///
    /// In batched mode, the inbound ring's interrupt mask is set for the
    /// duration of each callback and the callback reruns until the ring stays
    /// empty after unmasking.
    pub(crate) fn register(
        &self,
        event_flag: u16,
        channel_id: ChannelId,
        incoming: Arc<RingBuffer<DmaRingMem>>,
        batched: Arc<AtomicBool>,
        callback: ReceiveCallback,
    ) {
        let slot = self.slots.write().entry(event_flag).or_default().clone();
        let old = slot.entry.write().replace(DispatchEntry {
            channel_id,
            callback,
            incoming,
            batched,
        });
        if let Some(old) = old {
            tracing::warn!(
                event_flag,
                old_channel_id = old.channel_id.0,
                channel_id = channel_id.0,
                "replacing event flag registration"
            );
        }
    }

    /// Removes the registration for `event_flag`, if it belongs to
    /// `channel_id`, waiting for any callback in flight to return.
    ///
    /// Must not be called from the callback being removed.
    pub(crate) fn unregister(&self, event_flag: u16, channel_id: ChannelId) {
        let slot = {
            let mut slots = self.slots.write();
            let Some(slot) = slots.get(&event_flag) else {
                return;
            };
            let slot = slot.clone();
            if slot
                .entry
                .read()
                .as_ref()
                .is_some_and(|entry| entry.channel_id == channel_id)
            {
                slots.remove(&event_flag);
            }
            slot
        };
        let mut entry = slot.entry.write();
        if entry
            .as_ref()
            .is_some_and(|entry| entry.channel_id == channel_id)
        {
            *entry = None;
        }
    }

    /// Waits for any callback in flight on `event_flag` to return.
    pub(crate) fn drain(&self, event_flag: u16) {
        let slot = self.slots.read().get(&event_flag).cloned();
        if let Some(slot) = slot {
            drop(slot.entry.write());
        }
    }

    /// Dispatches a signal on `event_flag`. Returns false if no channel is
    /// registered for it.
    pub fn handle_event(&self, event_flag: u16) -> bool {
        let Some(slot) = self.slots.read().get(&event_flag).cloned() else {
            tracing::debug!(event_flag, "signal for unregistered event flag");
            return false;
        };
        let entry = slot.entry.read();
        let Some(entry) = entry.as_ref() else {
            return false;
        };

        if !entry.batched.load(Ordering::Relaxed) {
            (entry.callback)();
            return true;
        }

        if let Err(err) = entry.incoming.begin_batch() {
            tracing::warn!(
                channel_id = entry.channel_id.0,
                error = &err as &dyn std::error::Error,
                "inbound ring corrupt"
            );
        }
        loop {
            (entry.callback)();
            // Data that arrived while masked generated no signal.
            match entry.incoming.end_batch() {
                Ok(0) => break,
                Ok(_) => entry.incoming.set_interrupt_mask(true),
                Err(err) => {
                    tracing::warn!(
                        channel_id = entry.channel_id.0,
                        error = &err as &dyn std::error::Error,
                        "inbound ring corrupt"
                    );
                    break;
                }
            }
        }
        true
    }

    /// Dispatches every event flag set in `flags`, clearing the bits.
    pub fn handle_event_flags(&self, flags: &[AtomicU64]) {
        for (word_index, word) in flags.iter().enumerate() {
            // Retrieve and clear the current word atomically.
            let mut value = word.swap(0, Ordering::SeqCst);
            while value != 0 {
                let index = value.trailing_zeros();
                value &= !(1u64 << index);
                let event_flag = word_index * BITS_PER_WORD + index as usize;
                match u16::try_from(event_flag) {
                    Ok(event_flag) => {
                        self.handle_event(event_flag);
                    }
                    Err(_) => {
                        tracing::warn!(event_flag, "event flag out of range");
                    }
                }
            }
        }
    }
}
