// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Packet framing on top of [`RingBuffer`].
//!
//! Every packet starts with a 16-byte [`PacketDescriptor`], optionally
//! followed by a page-list header, then the payload, padded to a multiple of 8
//! bytes. The ring appends its footer after the padding.

use crate::Error;
use crate::ReadError;
use crate::RingBuffer;
use crate::RingMem;
use crate::WriteError;
use crate::FOOTER_SIZE;
use crate::PAGE_SIZE;
use bitfield_struct::bitfield;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const PACKET_TYPE_IN_BAND: u16 = 6;
pub const PACKET_TYPE_TRANSFER_PAGES: u16 = 7;
pub const PACKET_TYPE_GPA_DIRECT: u16 = 9;
pub const PACKET_TYPE_COMPLETION: u16 = 11;

/// The maximum number of page buffers in a single-page list packet.
pub const MAX_PAGE_BUFFER_COUNT: usize = 32;

/// The maximum number of page numbers in a multi-page list packet.
pub const MAX_MULTIPAGE_BUFFER_COUNT: usize = 32;

/// The descriptor header on every packet.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PacketDescriptor {
    pub packet_type: u16,
    pub data_offset8: u16,
    pub length8: u16,
    pub flags: PacketFlags,
    pub transaction_id: u64,
}

#[bitfield(u16)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PacketFlags {
    pub completion_requested: bool,
    #[bits(15)]
    _reserved: u16,
}

/// The extended portion of the packet descriptor describing a GPA direct packet.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct GpaDirectHeader {
    pub reserved: u32,
    pub range_count: u32,
}

/// A byte range header for a multi-page list; the page numbers follow it.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct GpaRange {
    pub len: u32,
    pub offset: u32,
}

/// A contiguous fragment within a single guest page.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PageBuffer {
    pub len: u32,
    pub offset: u32,
    pub pfn: u64,
}

/// A contiguous byte range spanning a list of guest pages.
#[derive(Copy, Clone, Debug)]
pub struct MultiPageBuffer<'a> {
    /// The offset of the range within the first page.
    pub offset: u32,
    pub len: u32,
    /// Exactly the pages the range touches.
    pub pfns: &'a [u64],
}

impl MultiPageBuffer<'_> {
    /// Returns the number of pages a range of `len` bytes starting at `offset`
    /// touches.
    pub fn page_count(offset: u32, len: u32) -> usize {
        (offset as usize + len as usize).div_ceil(PAGE_SIZE)
    }
}

#[derive(Copy, Clone, Debug)]
pub enum OutgoingPacketType<'a> {
    /// A packet with only in-band data.
    InBand,
    /// A completion of an earlier packet. The transaction ID must be the one
    /// from the packet being completed.
    Completion,
    /// A GPA direct packet describing up to [`MAX_PAGE_BUFFER_COUNT`]
    /// single-page fragments.
    SinglePageList(&'a [PageBuffer]),
    /// A GPA direct packet describing one range over up to
    /// [`MAX_MULTIPAGE_BUFFER_COUNT`] pages.
    MultiPageList(MultiPageBuffer<'a>),
}

/// An outgoing packet.
#[derive(Copy, Clone, Debug)]
pub struct OutgoingPacket<'a> {
    pub transaction_id: u64,
    pub completion_requested: bool,
    pub typ: OutgoingPacketType<'a>,
    pub payload: &'a [u8],
}

#[derive(Debug, thiserror::Error)]
pub enum SendPacketError {
    #[error("too many page references: {0}")]
    TooManyPages(usize),
    #[error("page range does not match its page list")]
    InvalidPageRange,
    #[error("packet length {0} cannot be encoded")]
    PacketTooLarge(usize),
    #[error(transparent)]
    Write(#[from] WriteError),
}

#[derive(Debug, thiserror::Error)]
pub enum RecvPacketError {
    #[error("ring buffer empty")]
    Empty,
    /// The buffer cannot hold the packet. The packet was not consumed.
    #[error("buffer too small, {required} bytes required")]
    BufferTooSmall { required: usize },
    /// The packet was malformed and has been discarded. A packet whose length
    /// runs past the written data takes everything written with it.
    #[error("dropped malformed packet")]
    Malformed {
        #[source]
        error: Error,
        /// Whether the producer must be signaled for the space freed.
        signal: bool,
    },
    /// The ring state is inconsistent. Nothing was consumed.
    #[error(transparent)]
    Corrupt(Error),
}

impl From<ReadError> for RecvPacketError {
    fn from(err: ReadError) -> Self {
        match err {
            ReadError::Empty => Self::Empty,
            ReadError::Corrupt(err) => Self::Corrupt(err),
        }
    }
}

/// Information about a packet copied out of the ring.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ReceivedPacket {
    pub packet_type: u16,
    pub transaction_id: u64,
    pub completion_requested: bool,
    /// The number of bytes copied into the caller's buffer.
    pub len: usize,
}

const ZERO_PAD: [u8; 8] = [0; 8];

/// Returns the ring space, footer included, an in-band packet with
/// `payload_len` bytes of payload consumes.
pub const fn in_band_size(payload_len: usize) -> usize {
    size_of::<PacketDescriptor>() + ((payload_len + 7) & !7) + FOOTER_SIZE
}

/// Encodes `packet` and appends it to `ring`, returning whether the consumer
/// must be signaled.
///
/// Nothing is written if the packet is invalid or does not fit.
pub fn write_packet<M: RingMem>(
    ring: &RingBuffer<M>,
    packet: &OutgoingPacket<'_>,
) -> Result<bool, SendPacketError> {
    let gpa_header;
    let range;
    let (packet_type, extra): (u16, [&[u8]; 3]) = match packet.typ {
        OutgoingPacketType::InBand => (PACKET_TYPE_IN_BAND, [&[], &[], &[]]),
        OutgoingPacketType::Completion => (PACKET_TYPE_COMPLETION, [&[], &[], &[]]),
        OutgoingPacketType::SinglePageList(buffers) => {
            if buffers.len() > MAX_PAGE_BUFFER_COUNT {
                return Err(SendPacketError::TooManyPages(buffers.len()));
            }
            if buffers
                .iter()
                .any(|b| b.offset as usize + b.len as usize > PAGE_SIZE)
            {
                return Err(SendPacketError::InvalidPageRange);
            }
            gpa_header = GpaDirectHeader {
                reserved: 0,
                range_count: buffers.len() as u32,
            };
            (
                PACKET_TYPE_GPA_DIRECT,
                [gpa_header.as_bytes(), buffers.as_bytes(), &[]],
            )
        }
        OutgoingPacketType::MultiPageList(buffer) => {
            let count = MultiPageBuffer::page_count(buffer.offset, buffer.len);
            if count > MAX_MULTIPAGE_BUFFER_COUNT || buffer.pfns.len() > MAX_MULTIPAGE_BUFFER_COUNT
            {
                return Err(SendPacketError::TooManyPages(count.max(buffer.pfns.len())));
            }
            if buffer.offset as usize >= PAGE_SIZE || buffer.pfns.len() != count {
                return Err(SendPacketError::InvalidPageRange);
            }
            gpa_header = GpaDirectHeader {
                reserved: 0,
                range_count: 1,
            };
            range = GpaRange {
                len: buffer.len,
                offset: buffer.offset,
            };
            (
                PACKET_TYPE_GPA_DIRECT,
                [
                    gpa_header.as_bytes(),
                    range.as_bytes(),
                    buffer.pfns.as_bytes(),
                ],
            )
        }
    };

    let header_len = size_of::<PacketDescriptor>() + extra.iter().map(|e| e.len()).sum::<usize>();
    let packet_len = header_len + packet.payload.len();
    let aligned_len = (packet_len + 7) & !7;
    let length8 = u16::try_from(aligned_len / 8)
        .map_err(|_| SendPacketError::PacketTooLarge(aligned_len))?;

    let desc = PacketDescriptor {
        packet_type,
        data_offset8: (header_len / 8) as u16,
        length8,
        flags: PacketFlags::new().with_completion_requested(packet.completion_requested),
        transaction_id: packet.transaction_id,
    };

    let segments = [
        desc.as_bytes(),
        extra[0],
        extra[1],
        extra[2],
        packet.payload,
        &ZERO_PAD[..aligned_len - packet_len],
    ];
    Ok(ring.write(&segments)?)
}

/// Copies the next packet out of `ring`.
///
/// With `raw` set, `dest` receives the whole packet, descriptor included.
/// Otherwise it receives the bytes following the descriptor header.
///
/// Returns the packet information and whether the producer must be signaled.
pub fn read_packet<M: RingMem>(
    ring: &RingBuffer<M>,
    dest: &mut [u8],
    raw: bool,
) -> Result<(ReceivedPacket, bool), RecvPacketError> {
    let mut desc = PacketDescriptor::new_zeroed();
    ring.peek(desc.as_mut_bytes())?;

    let total = desc.length8 as usize * 8;
    let offset = desc.data_offset8 as usize * 8;
    let available = ring.used_bytes().map_err(RecvPacketError::Corrupt)?;
    if total + FOOTER_SIZE > available {
        // No record boundary can be trusted past this point.
        let signal = ring.discard_unread().map_err(RecvPacketError::Corrupt)?;
        return Err(RecvPacketError::Malformed {
            error: Error::InvalidDescriptorLengths,
            signal,
        });
    }

    let malformed = if offset < size_of::<PacketDescriptor>() || offset > total {
        Some(Error::InvalidDescriptorLengths)
    } else if u16::from(desc.flags) & !1 != 0 {
        Some(Error::InvalidDescriptorFlags)
    } else if !matches!(
        desc.packet_type,
        PACKET_TYPE_IN_BAND
            | PACKET_TYPE_TRANSFER_PAGES
            | PACKET_TYPE_GPA_DIRECT
            | PACKET_TYPE_COMPLETION
    ) {
        Some(Error::InvalidDescriptorType)
    } else if desc.packet_type == PACKET_TYPE_GPA_DIRECT && gpa_range_count(ring, offset)? == 0 {
        Some(Error::InvalidDescriptorGpaDirectRangeCount)
    } else {
        None
    };
    if let Some(error) = malformed {
        // Consume the record so the channel can make progress.
        let signal = ring.read(&mut [], total)?;
        return Err(RecvPacketError::Malformed { error, signal });
    }

    let (skip, len) = if raw {
        (0, total)
    } else {
        (offset, total - offset)
    };
    let dest = dest
        .get_mut(..len)
        .ok_or(RecvPacketError::BufferTooSmall { required: len })?;
    let signal = ring.read(dest, skip)?;
    Ok((
        ReceivedPacket {
            packet_type: desc.packet_type,
            transaction_id: desc.transaction_id,
            completion_requested: desc.flags.completion_requested(),
            len,
        },
        signal,
    ))
}

/// Returns the range count of the GPA direct packet at the read index, or zero
/// if the header does not leave room for it.
fn gpa_range_count<M: RingMem>(ring: &RingBuffer<M>, data_offset: usize) -> Result<u32, ReadError> {
    const LEN: usize = size_of::<PacketDescriptor>() + size_of::<GpaDirectHeader>();
    if data_offset < LEN {
        return Ok(0);
    }
    let mut head = [0; LEN];
    ring.peek(&mut head)?;
    Ok(GpaDirectHeader::read_from_prefix(&head[size_of::<PacketDescriptor>()..])
        .map_or(0, |(header, _)| header.range_count))
}
