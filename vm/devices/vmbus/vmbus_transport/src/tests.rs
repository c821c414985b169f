// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Channel tests against a scripted in-process host.

use crate::channel::Channel;
use crate::channel::ChannelOffer;
use crate::channel::CloseError;
use crate::channel::OpenError;
use crate::channel::OpenParams;
use crate::channel::RecvError;
use crate::channel::SendError;
use crate::control::BusConnection;
use crate::control::BusConnectionBuilder;
use crate::control::ControlError;
use crate::control::Response;
use crate::control::ResponseKey;
use crate::emulated::EmulatedDmaAllocator;
use crate::emulated::EmulatedSharedMemory;
use crate::memory::DmaRingMem;
use crate::memory::PAGE_SIZE;
use crate::synic::MonitorPage;
use crate::synic::SynicClient;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::Weak;
use std::time::Duration;
use vmbus_core::protocol;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::GpadlId;
use vmbus_core::protocol::GpadlRange;
use vmbus_core::protocol::Message;
use vmbus_core::protocol::MessageType;
use vmbus_core::protocol::STATUS_SUCCESS;
use vmbus_core::protocol::STATUS_UNSUCCESSFUL;
use vmbus_core::OutgoingMessage;
use vmbus_ring::packet::read_packet;
use vmbus_ring::packet::write_packet;
use vmbus_ring::packet::MultiPageBuffer;
use vmbus_ring::packet::OutgoingPacket;
use vmbus_ring::packet::OutgoingPacketType;
use vmbus_ring::packet::PacketDescriptor;
use vmbus_ring::packet::PacketFlags;
use vmbus_ring::packet::PageBuffer;
use vmbus_ring::packet::ReceivedPacket;
use vmbus_ring::packet::PACKET_TYPE_COMPLETION;
use vmbus_ring::packet::PACKET_TYPE_GPA_DIRECT;
use vmbus_ring::packet::PACKET_TYPE_IN_BAND;
use vmbus_ring::RingBuffer;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

const CONNECTION_ID: u32 = 0x2000;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

/// How the host answers control requests.
struct HostBehavior {
    gpadl_status: Option<i32>,
    open_status: Option<u32>,
    respond_teardown: bool,
}

impl Default for HostBehavior {
    fn default() -> Self {
        Self {
            gpadl_status: Some(STATUS_SUCCESS),
            open_status: Some(0),
            respond_teardown: true,
        }
    }
}

struct PartialGpadl {
    channel_id: ChannelId,
    range: GpadlRange,
    expected: usize,
    pfns: Vec<u64>,
}

#[derive(Default)]
struct HostLog {
    messages: Vec<MessageType>,
    partial: HashMap<GpadlId, PartialGpadl>,
    gpadls: HashMap<GpadlId, (GpadlRange, Vec<u64>)>,
    opens: Vec<protocol::OpenChannel>,
    signals: Vec<(u32, u16)>,
}

struct HostInner {
    bus: OnceLock<Weak<BusConnection>>,
    mem: EmulatedSharedMemory,
    behavior: Mutex<HostBehavior>,
    log: Mutex<HostLog>,
}

/// A host that answers control messages inline, from the posting thread.
#[derive(Clone)]
struct MockHost {
    inner: Arc<HostInner>,
}

impl MockHost {
    fn new(mem: EmulatedSharedMemory) -> Self {
        Self {
            inner: Arc::new(HostInner {
                bus: OnceLock::new(),
                mem,
                behavior: Mutex::new(HostBehavior::default()),
                log: Mutex::new(HostLog::default()),
            }),
        }
    }

    fn behavior(&self) -> parking_lot::MutexGuard<'_, HostBehavior> {
        self.inner.behavior.lock()
    }

    fn deliver(&self, message: &OutgoingMessage) {
        let bus = self
            .inner
            .bus
            .get()
            .and_then(Weak::upgrade)
            .expect("bus attached");
        bus.handle_synic_message(message.data());
    }

    fn posted(&self, typ: MessageType) -> usize {
        self.inner
            .log
            .lock()
            .messages
            .iter()
            .filter(|&&t| t == typ)
            .count()
    }

    fn last_open(&self) -> protocol::OpenChannel {
        *self.inner.log.lock().opens.last().expect("channel opened")
    }

    fn gpadl_count(&self) -> usize {
        self.inner.log.lock().gpadls.len()
    }

    fn signals(&self) -> Vec<(u32, u16)> {
        self.inner.log.lock().signals.clone()
    }

    /// Returns the host's view of the most recently opened channel's rings:
    /// (guest-to-host, host-to-guest).
    fn rings(&self) -> (RingBuffer<DmaRingMem>, RingBuffer<DmaRingMem>) {
        let open = self.last_open();
        let pfns = self.inner.log.lock().gpadls[&open.ring_buffer_gpadl_id]
            .1
            .clone();
        let view = self.inner.mem.view(pfns[0], pfns.len());
        let split = open.downstream_ring_buffer_page_offset as usize * PAGE_SIZE;
        let ring = |offset: usize, len: usize| {
            RingBuffer::new(DmaRingMem::new(view.subblock(offset, len)).unwrap()).unwrap()
        };
        (ring(0, split), ring(split, view.len() - split))
    }

    fn handle(&self, data: &[u8]) {
        let behavior = self.behavior();
        let mut log = self.inner.log.lock();
        let reply = match Message::parse(data).expect("valid message") {
            Message::GpadlHeader(header, data) => {
                log.messages.push(MessageType::GPADL_HEADER);
                let (range, data) = GpadlRange::read_from_prefix(data).unwrap();
                let partial = PartialGpadl {
                    channel_id: header.channel_id,
                    range,
                    expected: header.len as usize / 8 - 1,
                    pfns: u64s(data),
                };
                log.partial.insert(header.gpadl_id, partial);
                complete_gpadl(&mut log, header.gpadl_id, &behavior)
            }
            Message::GpadlBody(body, data) => {
                log.messages.push(MessageType::GPADL_BODY);
                let partial = log.partial.get_mut(&body.gpadl_id).expect("known gpadl");
                partial.pfns.extend(u64s(data));
                complete_gpadl(&mut log, body.gpadl_id, &behavior)
            }
            Message::OpenChannel(open, _) => {
                log.messages.push(MessageType::OPEN_CHANNEL);
                log.opens.push(open);
                behavior.open_status.map(|status| {
                    OutgoingMessage::new(&protocol::OpenResult {
                        channel_id: open.channel_id,
                        open_id: open.open_id,
                        status,
                    })
                })
            }
            Message::GpadlTeardown(teardown, _) => {
                log.messages.push(MessageType::GPADL_TEARDOWN);
                if behavior.respond_teardown {
                    log.gpadls.remove(&teardown.gpadl_id);
                }
                behavior.respond_teardown.then(|| {
                    OutgoingMessage::new(&protocol::GpadlTorndown {
                        gpadl_id: teardown.gpadl_id,
                    })
                })
            }
            Message::CloseChannel(..) => {
                log.messages.push(MessageType::CLOSE_CHANNEL);
                None
            }
            Message::RelIdReleased(..) => {
                log.messages.push(MessageType::REL_ID_RELEASED);
                None
            }
            message => panic!("unexpected message {message:?}"),
        };
        drop(log);
        drop(behavior);
        if let Some(reply) = reply {
            self.deliver(&reply);
        }
    }
}

fn u64s(data: &[u8]) -> Vec<u64> {
    data.chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

/// Moves a GPADL to the complete set once all its pages have arrived, and
/// builds the host's answer.
fn complete_gpadl(
    log: &mut HostLog,
    gpadl_id: GpadlId,
    behavior: &HostBehavior,
) -> Option<OutgoingMessage> {
    let partial = &log.partial[&gpadl_id];
    if partial.pfns.len() < partial.expected {
        return None;
    }
    let partial = log.partial.remove(&gpadl_id).unwrap();
    let channel_id = partial.channel_id;
    log.gpadls.insert(gpadl_id, (partial.range, partial.pfns));
    behavior.gpadl_status.map(|status| {
        OutgoingMessage::new(&protocol::GpadlCreated {
            channel_id,
            gpadl_id,
            status,
        })
    })
}

impl SynicClient for MockHost {
    fn post_message(&self, connection_id: u32, typ: u32, msg: &[u8]) -> std::io::Result<()> {
        assert_eq!(connection_id, protocol::VMBUS_MESSAGE_CONNECTION_ID);
        assert_eq!(typ, protocol::VMBUS_MESSAGE_TYPE);
        self.handle(msg);
        Ok(())
    }

    fn signal_event(&self, connection_id: u32, event_flag: u16) -> std::io::Result<()> {
        self.inner
            .log
            .lock()
            .signals
            .push((connection_id, event_flag));
        Ok(())
    }
}

struct TestBus {
    host: MockHost,
    mem: EmulatedSharedMemory,
    bus: Arc<BusConnection>,
}

fn test_bus_with(configure: impl FnOnce(BusConnectionBuilder) -> BusConnectionBuilder) -> TestBus {
    init_tracing();
    let mem = EmulatedSharedMemory::new(256);
    let host = MockHost::new(mem.clone());
    let builder = BusConnectionBuilder::new(host.clone(), EmulatedDmaAllocator::new(mem.clone()))
        .request_timeout(Duration::from_millis(200));
    let bus = configure(builder).build();
    host.inner.bus.set(Arc::downgrade(&bus)).ok().unwrap();
    TestBus { host, mem, bus }
}

fn test_bus() -> TestBus {
    test_bus_with(|builder| builder)
}

fn offer(channel_id: u32) -> ChannelOffer {
    ChannelOffer::new(ChannelId(channel_id), CONNECTION_ID).unwrap()
}

fn params() -> OpenParams<'static> {
    OpenParams {
        send_size: PAGE_SIZE,
        recv_size: PAGE_SIZE,
        ..Default::default()
    }
}

type Received = Arc<Mutex<Vec<(ReceivedPacket, Vec<u8>)>>>;

/// Opens `channel` with a callback that drains the inbound ring into the
/// returned list.
fn open_collecting(channel: &Arc<Channel>, params: &OpenParams<'_>) -> Received {
    let received = Received::default();
    let weak = Arc::downgrade(channel);
    channel
        .open(params, {
            let received = received.clone();
            move || {
                let Some(channel) = weak.upgrade() else {
                    return;
                };
                let mut buf = [0; 512];
                loop {
                    match channel.receive(&mut buf) {
                        Ok(packet) => received.lock().push((packet, buf[..packet.len].to_vec())),
                        Err(RecvError::Empty) => break,
                        Err(err) => panic!("receive failed: {err}"),
                    }
                }
            }
        })
        .unwrap();
    received
}

fn host_send(ring: &RingBuffer<DmaRingMem>, transaction_id: u64, payload: &[u8]) {
    write_packet(
        ring,
        &OutgoingPacket {
            transaction_id,
            completion_requested: false,
            typ: OutgoingPacketType::InBand,
            payload,
        },
    )
    .unwrap();
}

#[test]
fn test_open_close() {
    let t = test_bus();
    let channel = Channel::new(t.bus.clone(), offer(3));
    channel
        .open(
            &OpenParams {
                send_size: PAGE_SIZE,
                recv_size: PAGE_SIZE,
                target_vp: 2,
                user_data: b"hello",
            },
            || {},
        )
        .unwrap();
    assert!(channel.is_open());

    // One control page per ring plus the data pages.
    assert_eq!(t.mem.allocated_pages(), 4);
    let open = t.host.last_open();
    assert_eq!(open.channel_id, ChannelId(3));
    assert_eq!(open.target_vp, 2);
    assert_eq!(open.downstream_ring_buffer_page_offset, 2);
    assert_eq!(&open.user_data[..6], b"hello\0");
    let pfns = t.host.inner.log.lock().gpadls[&open.ring_buffer_gpadl_id]
        .1
        .clone();
    assert_eq!(pfns.len(), 4);

    channel.close().unwrap();
    assert!(!channel.is_open());
    assert_eq!(t.host.posted(MessageType::CLOSE_CHANNEL), 1);
    assert_eq!(t.host.posted(MessageType::GPADL_TEARDOWN), 1);
    assert_eq!(t.mem.allocated_pages(), 0);
    assert_eq!(t.bus.control().pending_count(), 0);
}

#[test]
fn test_open_timeout() {
    let t = test_bus();
    t.host.behavior().open_status = None;
    let channel = Channel::new(t.bus.clone(), offer(1));
    let err = channel.open(&params(), || {}).unwrap_err();
    assert!(matches!(
        err,
        OpenError::Transport(ControlError::TransportTimeout)
    ));
    assert!(!channel.is_open());
    // The host may have opened the channel, so it is closed before the gpadl
    // is torn down and the memory released.
    assert_eq!(t.host.posted(MessageType::CLOSE_CHANNEL), 1);
    assert_eq!(t.host.posted(MessageType::GPADL_TEARDOWN), 1);
    assert_eq!(t.host.gpadl_count(), 0);
    assert_eq!(t.mem.allocated_pages(), 0);
    assert_eq!(t.bus.control().pending_count(), 0);

    // A failed open leaves the channel closed and openable.
    t.host.behavior().open_status = Some(0);
    channel.open(&params(), || {}).unwrap();
}

#[test]
fn test_open_rejected() {
    let t = test_bus();
    t.host.behavior().open_status = Some(0xc000_0001);
    let channel = Channel::new(t.bus.clone(), offer(1));
    let err = channel.open(&params(), || {}).unwrap_err();
    assert!(matches!(err, OpenError::TransportRejected(0xc000_0001)));
    assert!(!channel.is_open());
    assert_eq!(t.host.posted(MessageType::CLOSE_CHANNEL), 0);
    assert_eq!(t.host.posted(MessageType::GPADL_TEARDOWN), 1);
    assert_eq!(t.mem.allocated_pages(), 0);
}

#[test]
fn test_gpadl_rejected_fails_fast() {
    let t = test_bus();
    t.host.behavior().gpadl_status = Some(STATUS_UNSUCCESSFUL);
    let channel = Channel::new(t.bus.clone(), offer(1));
    let err = channel.open(&params(), || {}).unwrap_err();
    assert!(matches!(err, OpenError::GpadlRejected(STATUS_UNSUCCESSFUL)));
    assert_eq!(t.host.posted(MessageType::OPEN_CHANNEL), 0);
    assert_eq!(t.host.posted(MessageType::GPADL_TEARDOWN), 0);
    assert_eq!(t.mem.allocated_pages(), 0);
}

#[test]
fn test_gpadl_timeout() {
    let t = test_bus();
    t.host.behavior().gpadl_status = None;
    let channel = Channel::new(t.bus.clone(), offer(1));
    let err = channel.open(&params(), || {}).unwrap_err();
    assert!(matches!(
        err,
        OpenError::Transport(ControlError::TransportTimeout)
    ));
    assert_eq!(t.host.posted(MessageType::OPEN_CHANNEL), 0);
    // The host may hold the gpadl without having answered.
    assert_eq!(t.host.posted(MessageType::GPADL_TEARDOWN), 1);
    assert_eq!(t.host.gpadl_count(), 0);
    assert_eq!(t.mem.allocated_pages(), 0);
    assert_eq!(t.bus.control().pending_count(), 0);
}

#[test]
fn test_gpadl_timeout_unconfirmed_teardown_leaks() {
    let t = test_bus();
    {
        let mut behavior = t.host.behavior();
        behavior.gpadl_status = None;
        behavior.respond_teardown = false;
    }
    let channel = Channel::new(t.bus.clone(), offer(1));
    let err = channel.open(&params(), || {}).unwrap_err();
    assert!(matches!(
        err,
        OpenError::Transport(ControlError::TransportTimeout)
    ));
    assert_eq!(t.host.posted(MessageType::GPADL_TEARDOWN), 1);
    assert_eq!(t.host.gpadl_count(), 1);
    assert_eq!(t.mem.allocated_pages(), 4);
}

#[test]
fn test_offer_event_flag() {
    let offer = ChannelOffer::new(ChannelId(0x1234), CONNECTION_ID).unwrap();
    assert_eq!(offer.event_flag, 0x1234);
    assert!(ChannelOffer::new(ChannelId(0x1_0005), CONNECTION_ID).is_none());
}

#[test]
fn test_large_ring_gpadl_bodies() {
    let t = test_bus();
    let channel = Channel::new(t.bus.clone(), offer(1));
    channel
        .open(
            &OpenParams {
                send_size: PAGE_SIZE * 32,
                recv_size: PAGE_SIZE * 32,
                ..Default::default()
            },
            || {},
        )
        .unwrap();
    // 66 pages: 26 in the header, then 28 and 12 in two bodies.
    assert_eq!(t.host.posted(MessageType::GPADL_HEADER), 1);
    assert_eq!(t.host.posted(MessageType::GPADL_BODY), 2);
    let open = t.host.last_open();
    assert_eq!(open.downstream_ring_buffer_page_offset, 33);
    let (range, pfns) = t.host.inner.log.lock().gpadls[&open.ring_buffer_gpadl_id].clone();
    assert_eq!(range.byte_count as usize, 66 * PAGE_SIZE);
    assert!(pfns.windows(2).all(|w| w[1] == w[0] + 1));
}

#[test]
fn test_open_invalid() {
    let t = test_bus();
    let channel = Channel::new(t.bus.clone(), offer(1));
    for (send_size, recv_size) in [(0, PAGE_SIZE), (PAGE_SIZE, 100), (PAGE_SIZE + 8, PAGE_SIZE)] {
        let err = channel
            .open(
                &OpenParams {
                    send_size,
                    recv_size,
                    ..Default::default()
                },
                || {},
            )
            .unwrap_err();
        assert!(matches!(err, OpenError::InvalidSize), "{err:?}");
    }
    let err = channel
        .open(
            &OpenParams {
                user_data: &[0; 121],
                ..params()
            },
            || {},
        )
        .unwrap_err();
    assert!(matches!(err, OpenError::UserDataTooLong));
    assert_eq!(t.mem.allocated_pages(), 0);
    assert_eq!(t.host.posted(MessageType::GPADL_HEADER), 0);

    channel.open(&params(), || {}).unwrap();
    assert!(matches!(
        channel.open(&params(), || {}),
        Err(OpenError::InvalidState)
    ));

    // A channel object is opened at most once.
    channel.close().unwrap();
    assert!(matches!(
        channel.open(&params(), || {}),
        Err(OpenError::InvalidState)
    ));
}

#[test]
fn test_close_idempotent() {
    let t = test_bus();
    let channel = Channel::new(t.bus.clone(), offer(1));
    channel.close().unwrap();
    channel.open(&params(), || {}).unwrap();
    channel.close().unwrap();
    channel.close().unwrap();
    assert_eq!(t.host.posted(MessageType::CLOSE_CHANNEL), 1);
    assert_eq!(t.host.posted(MessageType::GPADL_TEARDOWN), 1);
}

#[test]
fn test_backpressure() {
    let t = test_bus();
    let channel = Channel::new(t.bus.clone(), offer(1));
    channel.open(&params(), || {}).unwrap();
    let (outgoing, _) = t.host.rings();

    let err = channel.send_in_band(&[0xaa; 9000], 1, false).unwrap_err();
    assert!(matches!(err, SendError::BackpressureFull(_)), "{err:?}");
    assert_eq!(outgoing.write_index(), 0);
    assert!(channel.outbound_empty());

    // Fill the ring, then free it from the host side.
    let payload = [0x55; 1000];
    let mut sent = 0;
    loop {
        match channel.send_in_band(&payload, sent, false) {
            Ok(()) => sent += 1,
            Err(SendError::BackpressureFull(_)) => break,
            Err(err) => panic!("{err}"),
        }
    }
    assert_eq!(sent, 3);
    let index = outgoing.write_index();
    assert!(matches!(
        channel.send_in_band(&payload, 99, false),
        Err(SendError::BackpressureFull(_))
    ));
    assert_eq!(outgoing.write_index(), index);

    let mut buf = [0; 1024];
    read_packet(&outgoing, &mut buf, false).unwrap();
    channel.send_in_band(&payload, 4, false).unwrap();
}

#[test]
fn test_send_to_host() {
    let t = test_bus();
    let channel = Channel::new(t.bus.clone(), offer(7));
    channel.open(&params(), || {}).unwrap();
    let (outgoing, _) = t.host.rings();

    channel.send_in_band(b"ping", 0x1234, true).unwrap();
    channel.send_in_band(b"pong", 0x1235, false).unwrap();
    // Only the empty to non-empty transition signals.
    assert_eq!(t.host.signals(), [(CONNECTION_ID, 7)]);

    let pfns = [10, 11];
    channel
        .send_multi_page_list(
            MultiPageBuffer {
                offset: 100,
                len: PAGE_SIZE as u32,
                pfns: &pfns,
            },
            b"mp",
            3,
            true,
        )
        .unwrap();
    channel
        .send_single_page_list(
            &[PageBuffer {
                len: 16,
                offset: 0,
                pfn: 20,
            }],
            b"sp",
            4,
            false,
        )
        .unwrap();
    channel.send_completion(b"done", 5).unwrap();
    assert!(!channel.outbound_empty());

    let mut buf = [0; 256];
    let (packet, _) = read_packet(&outgoing, &mut buf, false).unwrap();
    assert_eq!(packet.packet_type, PACKET_TYPE_IN_BAND);
    assert_eq!(packet.transaction_id, 0x1234);
    assert!(packet.completion_requested);
    assert_eq!(&buf[..4], b"ping");

    let (packet, _) = read_packet(&outgoing, &mut buf, false).unwrap();
    assert_eq!(packet.transaction_id, 0x1235);
    assert!(!packet.completion_requested);

    // The page list header precedes the payload in the packet body.
    let (packet, _) = read_packet(&outgoing, &mut buf, true).unwrap();
    assert_eq!(packet.packet_type, PACKET_TYPE_GPA_DIRECT);
    let (desc, _) = PacketDescriptor::read_from_prefix(&buf[..packet.len]).unwrap();
    let offset = desc.data_offset8 as usize * 8;
    assert_eq!(&buf[offset..offset + 2], b"mp");

    let (packet, _) = read_packet(&outgoing, &mut buf, false).unwrap();
    assert_eq!(packet.packet_type, PACKET_TYPE_GPA_DIRECT);
    assert_eq!(packet.transaction_id, 4);

    let (packet, _) = read_packet(&outgoing, &mut buf, false).unwrap();
    assert_eq!(packet.packet_type, PACKET_TYPE_COMPLETION);
    assert_eq!(&buf[..4], b"done");
    assert!(channel.outbound_empty());

    let err = channel
        .send_multi_page_list(
            MultiPageBuffer {
                offset: 0,
                len: PAGE_SIZE as u32 * 40,
                pfns: &[0; 40],
            },
            &[],
            0,
            false,
        )
        .unwrap_err();
    assert!(matches!(err, SendError::TooManyPages(40)));
}

#[test]
fn test_send_not_open() {
    let t = test_bus();
    let channel = Channel::new(t.bus.clone(), offer(1));
    assert!(matches!(
        channel.send_in_band(b"x", 0, false),
        Err(SendError::NotOpen)
    ));
    assert!(matches!(
        channel.receive(&mut [0; 16]),
        Err(RecvError::NotOpen)
    ));
    assert!(channel.inbound_empty());
}

#[test]
fn test_receive_via_callback() {
    let t = test_bus();
    let channel = Channel::new(t.bus.clone(), offer(4));
    let received = open_collecting(&channel, &params());
    let (_, incoming) = t.host.rings();

    host_send(&incoming, 1, b"first");
    host_send(&incoming, 2, b"second");
    assert!(!channel.inbound_empty());
    assert!(t.bus.handle_event(4));
    assert!(channel.inbound_empty());

    let received = received.lock();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].0.transaction_id, 1);
    assert_eq!(received[0].0.packet_type, PACKET_TYPE_IN_BAND);
    assert_eq!(&received[0].1[..5], b"first");
    assert_eq!(received[1].0.transaction_id, 2);
    assert_eq!(&received[1].1[..6], b"second");
}

#[test]
fn test_receive_raw_and_small_buffer() {
    let t = test_bus();
    let channel = Channel::new(t.bus.clone(), offer(1));
    channel.open(&params(), || {}).unwrap();
    let (_, incoming) = t.host.rings();

    host_send(&incoming, 9, &[7; 24]);
    let err = channel.receive(&mut [0; 8]).unwrap_err();
    assert!(matches!(err, RecvError::BufferTooSmall { required: 24 }));

    let mut buf = [0; 64];
    let packet = channel.receive_raw(&mut buf).unwrap();
    assert_eq!(packet.len, 16 + 24);
    assert_eq!(packet.transaction_id, 9);
    let (desc, _) = PacketDescriptor::read_from_prefix(&buf[..]).unwrap();
    assert_eq!(desc.packet_type, PACKET_TYPE_IN_BAND);
    assert_eq!(desc.data_offset8, 2);
    assert_eq!(&buf[16..40], &[7; 24]);
    assert!(matches!(channel.receive(&mut buf), Err(RecvError::Empty)));
}

#[test]
fn test_malformed_packet_dropped() {
    let t = test_bus();
    let channel = Channel::new(t.bus.clone(), offer(1));
    channel.open(&params(), || {}).unwrap();
    let (_, incoming) = t.host.rings();

    let desc = PacketDescriptor {
        packet_type: PACKET_TYPE_IN_BAND,
        data_offset8: 1,
        length8: 2,
        flags: PacketFlags::new(),
        transaction_id: 0,
    };
    incoming.write(&[desc.as_bytes()]).unwrap();
    host_send(&incoming, 2, b"ok");

    let mut buf = [0; 64];
    assert!(matches!(
        channel.receive(&mut buf),
        Err(RecvError::ProtocolViolation(_))
    ));
    let packet = channel.receive(&mut buf).unwrap();
    assert_eq!(packet.transaction_id, 2);
}

#[test]
fn test_overlong_packet_does_not_wedge_channel() {
    let t = test_bus();
    let channel = Channel::new(t.bus.clone(), offer(1));
    channel.open(&params(), || {}).unwrap();
    let (_, incoming) = t.host.rings();

    // Claims 1600 bytes, far more than was written.
    let desc = PacketDescriptor {
        packet_type: PACKET_TYPE_IN_BAND,
        data_offset8: 2,
        length8: 200,
        flags: PacketFlags::new(),
        transaction_id: 0,
    };
    incoming.write(&[desc.as_bytes()]).unwrap();
    host_send(&incoming, 1, b"lost");

    let mut buf = [0; 64];
    assert!(matches!(
        channel.receive(&mut buf),
        Err(RecvError::ProtocolViolation(_))
    ));
    assert!(channel.inbound_empty());
    assert!(matches!(channel.receive(&mut buf), Err(RecvError::Empty)));

    host_send(&incoming, 2, b"ok");
    let packet = channel.receive(&mut buf).unwrap();
    assert_eq!(packet.transaction_id, 2);
    assert_eq!(&buf[..2], b"ok");
}

#[test]
fn test_reader_signals_pending_send() {
    let t = test_bus();
    let channel = Channel::new(t.bus.clone(), offer(6));
    channel.open(&params(), || {}).unwrap();
    let (_, incoming) = t.host.rings();

    // Fill the inbound ring and ask to be woken when it drains.
    let payload = [0; 1000];
    let mut count = 0;
    while write_packet(
        &incoming,
        &OutgoingPacket {
            transaction_id: count,
            completion_requested: false,
            typ: OutgoingPacketType::InBand,
            payload: &payload,
        },
    )
    .is_ok()
    {
        count += 1;
    }
    incoming.set_pending_send_size(2048).unwrap();

    let mut buf = [0; 1024];
    for _ in 0..count {
        channel.receive(&mut buf).unwrap();
    }
    assert_eq!(t.host.signals(), [(CONNECTION_ID, 6)]);
}

#[test]
fn test_batched_reading() {
    let t = test_bus();
    let channel = Channel::new(t.bus.clone(), offer(2));
    channel.set_batched_reading(true);
    let received = open_collecting(&channel, &params());
    let (_, incoming) = t.host.rings();

    host_send(&incoming, 1, b"a");
    host_send(&incoming, 2, b"b");
    assert!(t.bus.handle_event(2));
    assert_eq!(received.lock().len(), 2);
    assert!(!incoming.interrupt_masked());

    // An unmasked, empty ring signals again on the next write.
    assert!(write_packet(
        &incoming,
        &OutgoingPacket {
            transaction_id: 3,
            completion_requested: false,
            typ: OutgoingPacketType::InBand,
            payload: b"c",
        },
    )
    .unwrap());
}

#[test]
fn test_event_flags_dispatch() {
    let t = test_bus();
    let a = Channel::new(t.bus.clone(), offer(1));
    let b = Channel::new(t.bus.clone(), offer(65));
    let received_a = open_collecting(&a, &params());
    let received_b = open_collecting(&b, &params());
    let (_, incoming_b) = t.host.rings();
    host_send(&incoming_b, 1, b"b");

    let flags = [AtomicU64::new(1 << 1), AtomicU64::new(1 << 1)];
    t.bus.handle_event_flags(&flags);
    assert!(received_a.lock().is_empty());
    assert_eq!(received_b.lock().len(), 1);
}

#[test]
fn test_teardown_failure_leaks_memory() {
    let t = test_bus();
    let channel = Channel::new(t.bus.clone(), offer(1));
    channel.open(&params(), || {}).unwrap();
    t.host.behavior().respond_teardown = false;

    let err = channel.close().unwrap_err();
    assert!(matches!(
        err,
        CloseError::RingStillConnected(ControlError::TransportTimeout)
    ));
    assert!(!channel.is_open());
    // The host may still be using the rings.
    assert_eq!(t.mem.allocated_pages(), 4);
    drop(channel);
    assert_eq!(t.mem.allocated_pages(), 4);
}

#[test]
fn test_revoke() {
    let t = test_bus();
    let channel = Channel::new(t.bus.clone(), offer(5));
    channel.open(&params(), || {}).unwrap();

    t.host.deliver(&OutgoingMessage::new(&protocol::RescindChannelOffer {
        channel_id: ChannelId(5),
    }));
    assert!(channel.is_revoked());
    assert!(matches!(
        channel.send_in_band(b"x", 0, false),
        Err(SendError::Revoked)
    ));

    channel.close().unwrap();
    assert_eq!(t.host.posted(MessageType::CLOSE_CHANNEL), 0);
    assert_eq!(t.host.posted(MessageType::GPADL_TEARDOWN), 0);
    assert_eq!(t.host.posted(MessageType::REL_ID_RELEASED), 1);
    assert_eq!(t.mem.allocated_pages(), 0);

    drop(channel);
    assert_eq!(t.host.posted(MessageType::REL_ID_RELEASED), 1);
}

#[test]
fn test_subchannel_closed_with_primary() {
    let t = test_bus();
    let primary = Channel::new(t.bus.clone(), offer(1));
    let sub = primary.new_subchannel(ChannelOffer {
        sub_channel_index: 1,
        ..offer(2)
    });
    primary.open(&params(), || {}).unwrap();
    sub.open(&params(), || {}).unwrap();
    assert_eq!(t.mem.allocated_pages(), 8);

    primary.close().unwrap();
    assert!(!sub.is_open());
    assert!(!primary.is_open());
    assert_eq!(t.host.posted(MessageType::CLOSE_CHANNEL), 2);
    assert_eq!(t.mem.allocated_pages(), 0);
}

#[test]
fn test_monitor_page_signal() {
    let monitor_page = Arc::new(MonitorPage::new());
    let t = test_bus_with(|builder| builder.monitor_page(monitor_page.clone()));
    let channel = Channel::new(
        t.bus.clone(),
        ChannelOffer {
            monitor_id: Some(37),
            ..offer(1)
        },
    );
    channel.open(&params(), || {}).unwrap();
    channel.send_in_band(b"x", 0, false).unwrap();
    assert_eq!(monitor_page.take_pending(1), 1 << 5);
    assert!(t.host.signals().is_empty());
}

#[test]
fn test_drop_closes() {
    let t = test_bus();
    let channel = Channel::new(t.bus.clone(), offer(1));
    channel.open(&params(), || {}).unwrap();
    drop(channel);
    assert_eq!(t.host.posted(MessageType::CLOSE_CHANNEL), 1);
    assert_eq!(t.mem.allocated_pages(), 0);
}

#[test]
fn test_concurrent_requests_out_of_order() {
    let t = test_bus_with(|builder| builder.request_timeout(Duration::from_secs(30)));
    t.host.behavior().respond_teardown = false;

    let waiters: Vec<_> = [GpadlId(100), GpadlId(200)]
        .into_iter()
        .map(|gpadl_id| {
            let bus = t.bus.clone();
            std::thread::spawn(move || {
                let message = OutgoingMessage::new(&protocol::GpadlTeardown {
                    channel_id: ChannelId(1),
                    gpadl_id,
                });
                let response = bus.control().send_and_wait(
                    ChannelId(1),
                    [&message],
                    ResponseKey::GpadlTorndown { gpadl_id },
                    bus.request_timeout(),
                );
                (gpadl_id, response)
            })
        })
        .collect();
    while t.bus.control().pending_count() < 2 {
        std::thread::yield_now();
    }

    for gpadl_id in [GpadlId(200), GpadlId(100)] {
        t.host
            .deliver(&OutgoingMessage::new(&protocol::GpadlTorndown { gpadl_id }));
    }

    for waiter in waiters {
        let (gpadl_id, response) = waiter.join().unwrap();
        match response.unwrap() {
            Response::GpadlTorndown(torndown) => assert_eq!(torndown.gpadl_id, gpadl_id),
            response => panic!("unexpected response {response:?}"),
        }
    }
    assert_eq!(t.bus.control().pending_count(), 0);
}

#[test]
fn test_orphan_response_dropped() {
    let t = test_bus();
    t.host.deliver(&OutgoingMessage::new(&protocol::OpenResult {
        channel_id: ChannelId(9),
        open_id: 9,
        status: 0,
    }));
    assert_eq!(t.bus.control().pending_count(), 0);
}
