// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-channel state machine: opening a ring buffer pair with the host,
//! moving packets through it, and tearing it down.

use crate::control::BusConnection;
use crate::control::ControlError;
use crate::control::Response;
use crate::control::ResponseKey;
use crate::gpadl;
use crate::gpadl::GpadlError;
use crate::memory::DmaRingMem;
use crate::memory::MemoryBlock;
use crate::memory::PAGE_SIZE;
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use thiserror::Error;
use vmbus_core::protocol;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::GpadlId;
use vmbus_core::protocol::UserDefinedData;
use vmbus_core::protocol::STATUS_SUCCESS;
use vmbus_core::OutgoingMessage;
use vmbus_ring::packet::read_packet;
use vmbus_ring::packet::write_packet;
use vmbus_ring::packet::MultiPageBuffer;
use vmbus_ring::packet::OutgoingPacket;
use vmbus_ring::packet::OutgoingPacketType;
use vmbus_ring::packet::PageBuffer;
use vmbus_ring::packet::ReceivedPacket;
use vmbus_ring::packet::RecvPacketError;
use vmbus_ring::packet::SendPacketError;
use vmbus_ring::RingBuffer;
use vmbus_ring::WriteError;

/// The host's description of a channel.
#[derive(Debug, Copy, Clone)]
pub struct ChannelOffer {
    pub channel_id: ChannelId,
    /// Zero for a primary channel.
    pub sub_channel_index: u16,
    /// The connection ID used to signal the host.
    pub connection_id: u32,
    /// The event flag the host sets when signaling this channel.
    pub event_flag: u16,
    /// The monitor ID, if the host monitors this channel.
    pub monitor_id: Option<u8>,
}

impl ChannelOffer {
    /// Returns an unmonitored primary channel offer whose event flag is the
    /// channel ID. Returns `None` if the channel ID does not fit in an event
    /// flag; such offers must name their event flag explicitly.
    pub fn new(channel_id: ChannelId, connection_id: u32) -> Option<Self> {
        Some(Self {
            channel_id,
            sub_channel_index: 0,
            connection_id,
            event_flag: u16::try_from(channel_id.0).ok()?,
            monitor_id: None,
        })
    }
}

/// Parameters for [`Channel::open`].
#[derive(Debug, Copy, Clone, Default)]
pub struct OpenParams<'a> {
    /// The size of the guest-to-host ring's data region.
    pub send_size: usize,
    /// The size of the host-to-guest ring's data region.
    pub recv_size: usize,
    /// The VP the host should target when signaling the channel.
    pub target_vp: u32,
    /// Up to [`UserDefinedData::LEN`] bytes passed to the host device.
    pub user_data: &'a [u8],
}

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("channel is not closed, or was already opened")]
    InvalidState,
    #[error("ring sizes must be nonzero multiples of the page size")]
    InvalidSize,
    #[error("user data exceeds {} bytes", UserDefinedData::LEN)]
    UserDataTooLong,
    #[error("failed to allocate ring buffer memory")]
    ResourceExhausted(#[source] anyhow::Error),
    #[error("failed to describe ring buffer memory")]
    Gpadl(#[from] GpadlError),
    #[error("control request failed")]
    Transport(#[from] ControlError),
    #[error("host rejected the open request with status {0:#x}")]
    TransportRejected(u32),
    #[error("host rejected the gpadl with status {0:#x}")]
    GpadlRejected(i32),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("channel is not open")]
    NotOpen,
    #[error("the channel was revoked")]
    Revoked,
    #[error("outbound ring full, {0} bytes needed")]
    BackpressureFull(usize),
    #[error("too many page references: {0}")]
    TooManyPages(usize),
    #[error("page range does not match its page list")]
    InvalidPageRange,
    #[error("packet length {0} cannot be encoded")]
    PacketTooLarge(usize),
    #[error("outbound ring corrupt")]
    Corrupt(#[source] vmbus_ring::Error),
}

impl From<SendPacketError> for SendError {
    fn from(err: SendPacketError) -> Self {
        match err {
            SendPacketError::TooManyPages(n) => Self::TooManyPages(n),
            SendPacketError::InvalidPageRange => Self::InvalidPageRange,
            SendPacketError::PacketTooLarge(n) => Self::PacketTooLarge(n),
            SendPacketError::Write(WriteError::Full(n)) => Self::BackpressureFull(n),
            SendPacketError::Write(WriteError::Corrupt(err)) => Self::Corrupt(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum RecvError {
    #[error("channel is not open")]
    NotOpen,
    #[error("no packet available")]
    Empty,
    #[error("buffer too small, {required} bytes required")]
    BufferTooSmall { required: usize },
    #[error("host protocol violation")]
    ProtocolViolation(#[source] vmbus_ring::Error),
}

#[derive(Debug, Error)]
pub enum CloseError {
    #[error("channel is opening")]
    InvalidState,
    /// The host did not confirm the ring buffer teardown. The ring memory has
    /// been leaked since the host may still access it.
    #[error("host did not release the ring buffer")]
    RingStillConnected(#[source] ControlError),
}

struct OpenState {
    gpadl_id: GpadlId,
    memory: MemoryBlock,
    outgoing: Mutex<RingBuffer<DmaRingMem>>,
    incoming: Arc<RingBuffer<DmaRingMem>>,
    recv_lock: Mutex<()>,
}

enum ChannelState {
    Closed,
    Opening,
    Opened(Arc<OpenState>),
}

/// A vmbus channel.
pub struct Channel {
    bus: Arc<BusConnection>,
    offer: ChannelOffer,
    state: Mutex<ChannelState>,
    opened_once: AtomicBool,
    revoked: Arc<AtomicBool>,
    released: AtomicBool,
    batched: Arc<AtomicBool>,
    subchannels: Mutex<Vec<Weak<Channel>>>,
}

impl Channel {
    /// Creates a closed channel for an offer from the host.
    pub fn new(bus: Arc<BusConnection>, offer: ChannelOffer) -> Arc<Self> {
        let revoked = bus.control().register_channel(offer.channel_id);
        Arc::new(Self {
            bus,
            offer,
            state: Mutex::new(ChannelState::Closed),
            opened_once: AtomicBool::new(false),
            revoked,
            released: AtomicBool::new(false),
            batched: Arc::new(AtomicBool::new(false)),
            subchannels: Mutex::new(Vec::new()),
        })
    }

    /// Creates a sub-channel of this channel. Closing this channel closes the
    /// sub-channel first.
    pub fn new_subchannel(&self, offer: ChannelOffer) -> Arc<Self> {
        let channel = Self::new(self.bus.clone(), offer);
        let mut subchannels = self.subchannels.lock();
        subchannels.retain(|c| c.strong_count() > 0);
        subchannels.push(Arc::downgrade(&channel));
        channel
    }

    pub fn offer(&self) -> &ChannelOffer {
        &self.offer
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.state.lock(), ChannelState::Opened(_))
    }

    /// Returns true if the host has rescinded the channel.
    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Relaxed)
    }

    /// Sets whether the receive callback runs with host interrupts masked,
    /// rerunning until the inbound ring stays empty.
    pub fn set_batched_reading(&self, batched: bool) {
        self.batched.store(batched, Ordering::Relaxed);
    }

    /// Opens the channel: allocates and registers the ring buffers with the
    /// host, then asks the host to open the channel.
    ///
    /// `callback` runs whenever the host signals the channel, on the thread
    /// that delivers the signal. It must not block indefinitely, close the
    /// channel, or drop the last reference to it, so it should hold a
    /// [`Weak`] reference.
    ///
    /// A channel can be opened successfully only once. On failure the channel
    /// returns to the closed state and nothing stays registered with the host.
    pub fn open(
        &self,
        params: &OpenParams<'_>,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Result<(), OpenError> {
        {
            let mut state = self.state.lock();
            if !matches!(*state, ChannelState::Closed) || self.opened_once.load(Ordering::Relaxed)
            {
                return Err(OpenError::InvalidState);
            }
            *state = ChannelState::Opening;
        }

        let result = self.open_inner(params, Box::new(callback));
        let mut state = self.state.lock();
        match result {
            Ok(open) => {
                tracing::info!(
                    channel_id = self.offer.channel_id.0,
                    gpadl_id = open.gpadl_id.0,
                    "channel opened"
                );
                *state = ChannelState::Opened(open);
                self.opened_once.store(true, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                *state = ChannelState::Closed;
                Err(err)
            }
        }
    }

    fn open_inner(
        &self,
        params: &OpenParams<'_>,
        callback: crate::dispatch::ReceiveCallback,
    ) -> Result<Arc<OpenState>, OpenError> {
        let channel_id = self.offer.channel_id;
        let (send_size, recv_size) = (params.send_size, params.recv_size);
        if send_size == 0
            || recv_size == 0
            || send_size % PAGE_SIZE != 0
            || recv_size % PAGE_SIZE != 0
        {
            return Err(OpenError::InvalidSize);
        }
        let user_data =
            UserDefinedData::from_prefix(params.user_data).ok_or(OpenError::UserDataTooLong)?;
        let total_size = send_size
            .checked_add(recv_size)
            .and_then(|n| n.checked_add(PAGE_SIZE * 2))
            .ok_or(OpenError::InvalidSize)?;
        let downstream_offset =
            u32::try_from((send_size + PAGE_SIZE) / PAGE_SIZE).map_err(|_| OpenError::InvalidSize)?;

        let memory = self
            .bus
            .allocator()
            .allocate_dma_buffer(total_size)
            .map_err(OpenError::ResourceExhausted)?;

        // Each ring is a control page followed by its data. The outbound ring
        // comes first.
        let ring = |offset: usize, len: usize| {
            DmaRingMem::new(memory.subblock(offset, len))
                .and_then(RingBuffer::new)
                .map_err(|_| OpenError::InvalidSize)
        };
        let outgoing = ring(0, send_size + PAGE_SIZE)?;
        let incoming = Arc::new(ring(send_size + PAGE_SIZE, recv_size + PAGE_SIZE)?);

        let control = self.bus.control();
        let gpadl_id = control.allocate_gpadl_id();
        let messages = gpadl::build(channel_id, gpadl_id, memory.len(), memory.pfns())?;
        let response = control.send_and_wait(
            channel_id,
            messages.iter(),
            ResponseKey::GpadlCreated {
                channel_id,
                gpadl_id,
            },
            self.bus.request_timeout(),
        );
        let status = match response {
            Ok(Response::GpadlCreated(created)) => created.status,
            Ok(response) => {
                return Err(OpenError::Transport(ControlError::UnexpectedResponse(
                    response,
                )))
            }
            Err(err @ ControlError::TransportTimeout) => {
                // The host may have registered the gpadl without answering.
                self.abandon_gpadl(gpadl_id, memory);
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };
        if status != STATUS_SUCCESS {
            tracing::warn!(
                channel_id = channel_id.0,
                gpadl_id = gpadl_id.0,
                status,
                "host rejected gpadl"
            );
            return Err(OpenError::GpadlRejected(status));
        }

        let open = Arc::new(OpenState {
            gpadl_id,
            memory,
            outgoing: Mutex::new(outgoing),
            incoming,
            recv_lock: Mutex::new(()),
        });

        self.bus.dispatcher().register(
            self.offer.event_flag,
            channel_id,
            open.incoming.clone(),
            self.batched.clone(),
            callback,
        );

        let open_id = channel_id.0;
        let message = OutgoingMessage::new(&protocol::OpenChannel {
            channel_id,
            open_id,
            ring_buffer_gpadl_id: gpadl_id,
            target_vp: params.target_vp,
            downstream_ring_buffer_page_offset: downstream_offset,
            user_data,
        });
        let result = control
            .send_and_wait(
                channel_id,
                [&message],
                ResponseKey::OpenResult {
                    channel_id,
                    open_id,
                },
                self.bus.request_timeout(),
            )
            .map_err(OpenError::Transport)
            .and_then(|response| match response {
                Response::OpenResult(result) if result.status == STATUS_SUCCESS as u32 => Ok(()),
                Response::OpenResult(result) => Err(OpenError::TransportRejected(result.status)),
                response => Err(OpenError::Transport(ControlError::UnexpectedResponse(
                    response,
                ))),
            });

        if let Err(err) = result {
            tracing::warn!(
                channel_id = channel_id.0,
                error = &err as &dyn std::error::Error,
                "channel open failed"
            );
            self.bus
                .dispatcher()
                .unregister(self.offer.event_flag, channel_id);
            if matches!(err, OpenError::Transport(ControlError::TransportTimeout)) {
                // The host may have opened the channel without answering.
                self.post_close();
            }
            let memory = open.memory.clone();
            drop(open);
            self.abandon_gpadl(gpadl_id, memory);
            return Err(err);
        }

        Ok(open)
    }

    /// Closes the channel and its open sub-channels.
    ///
    /// Closing a closed channel succeeds and does nothing. Must not be called
    /// from the channel's receive callback.
    pub fn close(&self) -> Result<(), CloseError> {
        let subchannels: Vec<_> = self
            .subchannels
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for subchannel in subchannels {
            if let Err(err) = subchannel.close() {
                tracing::warn!(
                    channel_id = subchannel.offer.channel_id.0,
                    error = &err as &dyn std::error::Error,
                    "failed to close sub-channel"
                );
            }
        }

        let open = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, ChannelState::Closed) {
                ChannelState::Opened(open) => open,
                ChannelState::Closed => return Ok(()),
                ChannelState::Opening => {
                    *state = ChannelState::Opening;
                    return Err(CloseError::InvalidState);
                }
            }
        };

        let channel_id = self.offer.channel_id;
        // Wait for a callback in flight before releasing the rings.
        self.bus
            .dispatcher()
            .unregister(self.offer.event_flag, channel_id);

        let gpadl_id = open.gpadl_id;
        let memory = open.memory.clone();
        drop(open);

        if self.is_revoked() {
            // The host has already released its side of the channel.
            tracing::info!(channel_id = channel_id.0, "revoked channel closed");
            drop(memory);
            self.release_id();
            return Ok(());
        }

        self.post_close();
        self.teardown_gpadl(gpadl_id, memory)
            .map_err(CloseError::RingStillConnected)?;
        tracing::info!(channel_id = channel_id.0, "channel closed");
        Ok(())
    }

    /// Asks the host to close the channel, without waiting for it to do so.
    fn post_close(&self) {
        let channel_id = self.offer.channel_id;
        let message = OutgoingMessage::new(&protocol::CloseChannel { channel_id });
        if let Err(err) = self.bus.control().post(&message) {
            tracing::warn!(
                channel_id = channel_id.0,
                error = &err as &dyn std::error::Error,
                "failed to post close channel"
            );
        }
    }

    /// Tears down a gpadl left behind by a failed open.
    fn abandon_gpadl(&self, gpadl_id: GpadlId, memory: MemoryBlock) {
        match self.teardown_gpadl(gpadl_id, memory) {
            Ok(()) => {}
            Err(err) => {
                tracing::warn!(
                    channel_id = self.offer.channel_id.0,
                    gpadl_id = gpadl_id.0,
                    error = &err as &dyn std::error::Error,
                    "failed to clean up after open"
                );
            }
        }
    }

    /// Tears down the ring buffer GPADL, then frees `memory`. If the host does
    /// not confirm the teardown, the memory is leaked instead.
    fn teardown_gpadl(&self, gpadl_id: GpadlId, memory: MemoryBlock) -> Result<(), ControlError> {
        let channel_id = self.offer.channel_id;
        let message = OutgoingMessage::new(&protocol::GpadlTeardown {
            channel_id,
            gpadl_id,
        });
        match self.bus.control().send_and_wait(
            channel_id,
            [&message],
            ResponseKey::GpadlTorndown { gpadl_id },
            self.bus.request_timeout(),
        ) {
            Ok(_) => Ok(()),
            Err(ControlError::Revoked) => {
                tracing::info!(
                    channel_id = channel_id.0,
                    gpadl_id = gpadl_id.0,
                    "channel revoked, skipping gpadl teardown"
                );
                Ok(())
            }
            Err(err) => {
                tracing::warn!(
                    channel_id = channel_id.0,
                    gpadl_id = gpadl_id.0,
                    error = &err as &dyn std::error::Error,
                    "gpadl teardown failed, leaking ring buffer memory"
                );
                std::mem::forget(memory);
                Err(err)
            }
        }
    }

    fn release_id(&self) {
        if self.released.swap(true, Ordering::Relaxed) {
            return;
        }
        let message = OutgoingMessage::new(&protocol::RelIdReleased {
            channel_id: self.offer.channel_id,
        });
        if let Err(err) = self.bus.control().post(&message) {
            tracing::warn!(
                channel_id = self.offer.channel_id.0,
                error = &err as &dyn std::error::Error,
                "failed to release channel id"
            );
        }
    }

    fn open_state(&self) -> Option<Arc<OpenState>> {
        match &*self.state.lock() {
            ChannelState::Opened(open) => Some(open.clone()),
            ChannelState::Closed | ChannelState::Opening => None,
        }
    }

    /// Signals the host that the outbound ring has data, or that the inbound
    /// ring has room.
    fn signal_host(&self) {
        if let (Some(monitor_id), Some(monitor_page)) =
            (self.offer.monitor_id, self.bus.monitor_page())
        {
            if monitor_page.set_pending(monitor_id) {
                return;
            }
        }
        if let Err(err) = self
            .bus
            .synic()
            .signal_event(self.offer.connection_id, self.offer.event_flag)
        {
            tracing::warn!(
                channel_id = self.offer.channel_id.0,
                error = &err as &dyn std::error::Error,
                "failed to signal host"
            );
        }
    }

    fn send_packet(&self, packet: &OutgoingPacket<'_>) -> Result<(), SendError> {
        if self.is_revoked() {
            return Err(SendError::Revoked);
        }
        let open = self.open_state().ok_or(SendError::NotOpen)?;
        let signal = write_packet(&*open.outgoing.lock(), packet)?;
        if signal {
            self.signal_host();
        }
        Ok(())
    }

    /// Sends a packet carrying only `payload`.
    pub fn send_in_band(
        &self,
        payload: &[u8],
        transaction_id: u64,
        completion_requested: bool,
    ) -> Result<(), SendError> {
        self.send_packet(&OutgoingPacket {
            transaction_id,
            completion_requested,
            typ: OutgoingPacketType::InBand,
            payload,
        })
    }

    /// Sends a packet referencing up to 32 single-page fragments of guest
    /// memory, followed by `payload`.
    pub fn send_single_page_list(
        &self,
        buffers: &[PageBuffer],
        payload: &[u8],
        transaction_id: u64,
        completion_requested: bool,
    ) -> Result<(), SendError> {
        self.send_packet(&OutgoingPacket {
            transaction_id,
            completion_requested,
            typ: OutgoingPacketType::SinglePageList(buffers),
            payload,
        })
    }

    /// Sends a packet referencing one range of guest memory spanning several
    /// pages, followed by `payload`.
    pub fn send_multi_page_list(
        &self,
        buffer: MultiPageBuffer<'_>,
        payload: &[u8],
        transaction_id: u64,
        completion_requested: bool,
    ) -> Result<(), SendError> {
        self.send_packet(&OutgoingPacket {
            transaction_id,
            completion_requested,
            typ: OutgoingPacketType::MultiPageList(buffer),
            payload,
        })
    }

    /// Completes the host packet identified by `transaction_id`.
    pub fn send_completion(&self, payload: &[u8], transaction_id: u64) -> Result<(), SendError> {
        self.send_packet(&OutgoingPacket {
            transaction_id,
            completion_requested: false,
            typ: OutgoingPacketType::Completion,
            payload,
        })
    }

    fn receive_packet(&self, dest: &mut [u8], raw: bool) -> Result<ReceivedPacket, RecvError> {
        let open = self.open_state().ok_or(RecvError::NotOpen)?;
        let _guard = open.recv_lock.lock();
        match read_packet(&*open.incoming, dest, raw) {
            Ok((packet, signal)) => {
                if signal {
                    self.signal_host();
                }
                Ok(packet)
            }
            Err(RecvPacketError::Empty) => Err(RecvError::Empty),
            Err(RecvPacketError::BufferTooSmall { required }) => {
                Err(RecvError::BufferTooSmall { required })
            }
            Err(RecvPacketError::Malformed { error, signal }) => {
                tracing::warn!(
                    channel_id = self.offer.channel_id.0,
                    error = &error as &dyn std::error::Error,
                    "dropped malformed packet"
                );
                if signal {
                    self.signal_host();
                }
                Err(RecvError::ProtocolViolation(error))
            }
            Err(RecvPacketError::Corrupt(err)) => {
                tracing::warn!(
                    channel_id = self.offer.channel_id.0,
                    error = &err as &dyn std::error::Error,
                    "inbound ring corrupt"
                );
                Err(RecvError::ProtocolViolation(err))
            }
        }
    }

    /// Receives the next packet's payload into `dest`.
    pub fn receive(&self, dest: &mut [u8]) -> Result<ReceivedPacket, RecvError> {
        self.receive_packet(dest, false)
    }

    /// Receives the next packet, descriptor included, into `dest`.
    pub fn receive_raw(&self, dest: &mut [u8]) -> Result<ReceivedPacket, RecvError> {
        self.receive_packet(dest, true)
    }

    /// Returns true if the inbound ring has no unread data. A channel that is
    /// not open is empty.
    pub fn inbound_empty(&self) -> bool {
        self.open_state()
            .is_none_or(|open| open.incoming.is_empty().unwrap_or(true))
    }

    /// Returns true if the host has consumed everything sent.
    pub fn outbound_empty(&self) -> bool {
        self.open_state()
            .is_none_or(|open| open.outgoing.lock().is_empty().unwrap_or(true))
    }

    /// Waits for a receive callback in flight to return. Must not be called
    /// from the callback.
    pub fn drain_events(&self) {
        self.bus.dispatcher().drain(self.offer.event_flag);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(
                channel_id = self.offer.channel_id.0,
                error = &err as &dyn std::error::Error,
                "failed to close dropped channel"
            );
        }
        if self.is_revoked() {
            self.release_id();
        }
        self.bus
            .control()
            .unregister_channel(self.offer.channel_id, &self.revoked);
    }
}
