// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The platform primitives the transport uses to talk to the host.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

/// The client interface to the synthetic interrupt controller.
pub trait SynicClient: Send + Sync {
    /// Posts a control message to the host message port.
    ///
    /// The host may deliver its response before this returns.
    fn post_message(&self, connection_id: u32, typ: u32, msg: &[u8]) -> std::io::Result<()>;

    /// Signals an event on the synic.
    fn signal_event(&self, connection_id: u32, event_flag: u16) -> std::io::Result<()>;
}

/// The number of monitor trigger groups.
const TRIGGER_GROUP_COUNT: usize = 4;

/// The number of monitor IDs per trigger group.
const MONITORS_PER_GROUP: usize = 32;

/// The maximum monitor ID.
pub const MAX_MONITOR_ID: u8 = (TRIGGER_GROUP_COUNT * MONITORS_PER_GROUP - 1) as u8;

/// The guest-to-host monitor page.
///
/// Setting a channel's pending bit asks the host to poll that channel on its
/// next monitor scan, without an individual event signal.
#[derive(Debug, Default)]
pub struct MonitorPage {
    trigger_groups: [AtomicU32; TRIGGER_GROUP_COUNT],
}

impl MonitorPage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the pending bit for `monitor_id`. Returns false if the ID is out
    /// of range.
    pub fn set_pending(&self, monitor_id: u8) -> bool {
        let Some(group) = self
            .trigger_groups
            .get(monitor_id as usize / MONITORS_PER_GROUP)
        else {
            return false;
        };
        let bit = 1 << (monitor_id as usize % MONITORS_PER_GROUP);
        group.fetch_or(bit, Ordering::SeqCst);
        true
    }

    /// Returns and clears the pending bits of a trigger group.
    pub fn take_pending(&self, group: usize) -> u32 {
        self.trigger_groups
            .get(group)
            .map_or(0, |g| g.swap(0, Ordering::SeqCst))
    }
}
