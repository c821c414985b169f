// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The bus-wide control channel: correlated request/response exchanges with
//! the host over the synic message port, and dispatch of inbound control
//! messages.

use crate::dispatch::EventDispatcher;
use crate::memory::DmaAllocator;
use crate::synic::MonitorPage;
use crate::synic::SynicClient;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;
use vmbus_core::protocol;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::GpadlId;
use vmbus_core::protocol::Message;
use vmbus_core::protocol::VMBUS_MESSAGE_CONNECTION_ID;
use vmbus_core::protocol::VMBUS_MESSAGE_TYPE;
use vmbus_core::OutgoingMessage;

/// The default deadline for a control request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// The first GPADL ID handed out on a connection.
const GPADL_ID_START: u32 = 0xe1e10;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("timed out waiting for the host response")]
    TransportTimeout,
    #[error("failed to post a control message")]
    PostFailed(#[source] std::io::Error),
    #[error("the channel was revoked by the host")]
    Revoked,
    #[error("unexpected host response {0:?}")]
    UnexpectedResponse(Response),
}

/// Identifies the host response a request waits for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResponseKey {
    GpadlCreated {
        channel_id: ChannelId,
        gpadl_id: GpadlId,
    },
    OpenResult {
        channel_id: ChannelId,
        open_id: u32,
    },
    GpadlTorndown {
        gpadl_id: GpadlId,
    },
}

/// A host response to a control request.
#[derive(Debug, Copy, Clone)]
pub enum Response {
    GpadlCreated(protocol::GpadlCreated),
    OpenResult(protocol::OpenResult),
    GpadlTorndown(protocol::GpadlTorndown),
}

impl Response {
    fn key(&self) -> ResponseKey {
        match *self {
            Response::GpadlCreated(m) => ResponseKey::GpadlCreated {
                channel_id: m.channel_id,
                gpadl_id: m.gpadl_id,
            },
            Response::OpenResult(m) => ResponseKey::OpenResult {
                channel_id: m.channel_id,
                open_id: m.open_id,
            },
            Response::GpadlTorndown(m) => ResponseKey::GpadlTorndown {
                gpadl_id: m.gpadl_id,
            },
        }
    }
}

/// A single-shot completion slot. The value is set at most once and moved
/// out by the waiter.
struct Completion {
    value: Mutex<Option<Result<Response, ControlError>>>,
    ready: Condvar,
    done: AtomicBool,
}

impl Completion {
    fn new() -> Self {
        Self {
            value: Mutex::new(None),
            ready: Condvar::new(),
            done: AtomicBool::new(false),
        }
    }

    /// Completes the slot. Returns false if it was already completed.
    fn complete(&self, result: Result<Response, ControlError>) -> bool {
        let mut value = self.value.lock();
        if self.done.swap(true, Ordering::Relaxed) {
            return false;
        }
        *value = Some(result);
        self.ready.notify_one();
        true
    }

    fn wait_until(&self, deadline: Instant) -> Option<Result<Response, ControlError>> {
        let mut value = self.value.lock();
        while value.is_none() {
            if self.ready.wait_until(&mut value, deadline).timed_out() {
                break;
            }
        }
        value.take()
    }
}

struct PendingRequest {
    channel_id: ChannelId,
    key: ResponseKey,
    completion: Arc<Completion>,
}

struct ControlState {
    /// Outstanding requests, keyed by sequence number so that responses
    /// match the oldest waiter first.
    pending: BTreeMap<u64, PendingRequest>,
    next_seq: u64,
    next_gpadl_id: u32,
    /// Revocation flags of the channels created on this connection.
    channels: HashMap<ChannelId, Arc<AtomicBool>>,
}

/// The control-message side of a vmbus connection.
pub struct ControlChannel {
    synic: Arc<dyn SynicClient>,
    connection_id: u32,
    state: Mutex<ControlState>,
}

/// Removes a pending request from the registry when the waiter leaves,
/// whichever way it leaves.
struct PendingGuard<'a> {
    control: &'a ControlChannel,
    seq: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.control.state.lock().pending.remove(&self.seq);
    }
}

impl ControlChannel {
    pub fn new(synic: Arc<dyn SynicClient>, connection_id: u32) -> Self {
        Self {
            synic,
            connection_id,
            state: Mutex::new(ControlState {
                pending: BTreeMap::new(),
                next_seq: 0,
                next_gpadl_id: GPADL_ID_START,
                channels: HashMap::new(),
            }),
        }
    }

    /// Returns a GPADL ID not used by any other GPADL on this connection.
    pub fn allocate_gpadl_id(&self) -> GpadlId {
        let mut state = self.state.lock();
        let id = state.next_gpadl_id;
        state.next_gpadl_id = state.next_gpadl_id.checked_add(1).unwrap_or(GPADL_ID_START);
        GpadlId(id)
    }

    /// Returns the number of requests waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Posts a message without waiting for any response.
    pub fn post(&self, message: &OutgoingMessage) -> Result<(), ControlError> {
        self.synic
            .post_message(self.connection_id, VMBUS_MESSAGE_TYPE, message.data())
            .map_err(ControlError::PostFailed)
    }

    /// Posts `messages` in order, then waits up to `timeout` for the response
    /// identified by `key`.
    ///
    /// The request is registered before the first message is posted, so a
    /// response delivered while posting is not lost. A response arriving after
    /// this returns is dropped.
    pub fn send_and_wait<'a>(
        &self,
        channel_id: ChannelId,
        messages: impl IntoIterator<Item = &'a OutgoingMessage>,
        key: ResponseKey,
        timeout: Duration,
    ) -> Result<Response, ControlError> {
        let completion = Arc::new(Completion::new());
        let seq = {
            let mut state = self.state.lock();
            if state
                .channels
                .get(&channel_id)
                .is_some_and(|revoked| revoked.load(Ordering::Relaxed))
            {
                return Err(ControlError::Revoked);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.pending.insert(
                seq,
                PendingRequest {
                    channel_id,
                    key,
                    completion: completion.clone(),
                },
            );
            seq
        };
        let _guard = PendingGuard { control: self, seq };

        for message in messages {
            tracing::trace!(
                channel_id = channel_id.0,
                len = message.data().len(),
                "posting control message"
            );
            self.post(message)?;
        }

        completion
            .wait_until(Instant::now() + timeout)
            .unwrap_or_else(|| {
                tracing::warn!(channel_id = channel_id.0, ?key, "control request timed out");
                Err(ControlError::TransportTimeout)
            })
    }

    /// Handles a message received from the host on the message port.
    pub fn handle_message(&self, data: &[u8]) {
        let message = match Message::parse(data) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "invalid vmbus message"
                );
                return;
            }
        };
        match message {
            Message::GpadlCreated(m, _) => self.complete(Response::GpadlCreated(m)),
            Message::OpenResult(m, _) => self.complete(Response::OpenResult(m)),
            Message::GpadlTorndown(m, _) => self.complete(Response::GpadlTorndown(m)),
            Message::RescindChannelOffer(m, _) => self.rescind(m.channel_id),
            message => {
                tracing::warn!(?message, "unexpected vmbus message from host");
            }
        }
    }

    fn complete(&self, response: Response) {
        let key = response.key();
        let state = self.state.lock();
        // An entry whose waiter has not yet woken may still be registered
        // after completion; skip it.
        let matched = state
            .pending
            .values()
            .filter(|request| request.key == key)
            .any(|request| request.completion.complete(Ok(response)));
        if !matched {
            tracing::warn!(?key, "dropping unmatched host response");
        }
    }

    fn rescind(&self, channel_id: ChannelId) {
        let state = self.state.lock();
        match state.channels.get(&channel_id) {
            Some(revoked) => {
                tracing::info!(channel_id = channel_id.0, "channel revoked");
                revoked.store(true, Ordering::Relaxed);
            }
            None => {
                tracing::warn!(channel_id = channel_id.0, "rescind for unknown channel");
            }
        }
        for request in state
            .pending
            .values()
            .filter(|request| request.channel_id == channel_id)
        {
            request.completion.complete(Err(ControlError::Revoked));
        }
    }

    /// Tracks revocation for `channel_id`. The returned flag is set when the
    /// host rescinds the channel.
    pub(crate) fn register_channel(&self, channel_id: ChannelId) -> Arc<AtomicBool> {
        let revoked = Arc::new(AtomicBool::new(false));
        self.state
            .lock()
            .channels
            .insert(channel_id, revoked.clone());
        revoked
    }

    /// Stops tracking `channel_id`, unless it has since been registered again.
    pub(crate) fn unregister_channel(&self, channel_id: ChannelId, revoked: &Arc<AtomicBool>) {
        let mut state = self.state.lock();
        if state
            .channels
            .get(&channel_id)
            .is_some_and(|r| Arc::ptr_eq(r, revoked))
        {
            state.channels.remove(&channel_id);
        }
    }
}

/// A builder for [`BusConnection`].
pub struct BusConnectionBuilder {
    synic: Arc<dyn SynicClient>,
    allocator: Arc<dyn DmaAllocator>,
    request_timeout: Duration,
    monitor_page: Option<Arc<MonitorPage>>,
    message_connection_id: u32,
}

impl BusConnectionBuilder {
    /// Creates a new builder with the platform message port and allocator.
    pub fn new(
        synic: impl SynicClient + 'static,
        allocator: impl DmaAllocator + 'static,
    ) -> Self {
        Self {
            synic: Arc::new(synic),
            allocator: Arc::new(allocator),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            monitor_page: None,
            message_connection_id: VMBUS_MESSAGE_CONNECTION_ID,
        }
    }

    /// Sets the deadline for each control request.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the monitor page used to signal channels that have a monitor ID.
    pub fn monitor_page(mut self, monitor_page: Arc<MonitorPage>) -> Self {
        self.monitor_page = Some(monitor_page);
        self
    }

    /// Sets the connection ID control messages are posted to.
    pub fn message_connection_id(mut self, connection_id: u32) -> Self {
        self.message_connection_id = connection_id;
        self
    }

    pub fn build(self) -> Arc<BusConnection> {
        Arc::new(BusConnection {
            control: ControlChannel::new(self.synic.clone(), self.message_connection_id),
            synic: self.synic,
            allocator: self.allocator,
            monitor_page: self.monitor_page,
            request_timeout: self.request_timeout,
            dispatcher: EventDispatcher::new(),
        })
    }
}

/// The process-wide state of one vmbus connection, shared by all of its
/// channels.
pub struct BusConnection {
    control: ControlChannel,
    synic: Arc<dyn SynicClient>,
    allocator: Arc<dyn DmaAllocator>,
    monitor_page: Option<Arc<MonitorPage>>,
    request_timeout: Duration,
    dispatcher: EventDispatcher,
}

impl BusConnection {
    pub fn control(&self) -> &ControlChannel {
        &self.control
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Entry point for control messages delivered by the platform.
    pub fn handle_synic_message(&self, data: &[u8]) {
        self.control.handle_message(data)
    }

    /// Entry point for a channel event delivered by the platform.
    pub fn handle_event(&self, event_flag: u16) -> bool {
        self.dispatcher.handle_event(event_flag)
    }

    /// Entry point for a shared interrupt: dispatches every channel whose bit
    /// is set in `flags`, clearing the bits.
    pub fn handle_event_flags(&self, flags: &[AtomicU64]) {
        self.dispatcher.handle_event_flags(flags)
    }

    pub(crate) fn synic(&self) -> &dyn SynicClient {
        self.synic.as_ref()
    }

    pub(crate) fn allocator(&self) -> &dyn DmaAllocator {
        self.allocator.as_ref()
    }

    pub(crate) fn monitor_page(&self) -> Option<&MonitorPage> {
        self.monitor_page.as_deref()
    }
}
