// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Splitting a buffer's page list across GPADL control messages.

use crate::memory::PAGE_SIZE;
use thiserror::Error;
use vmbus_core::protocol;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::GpadlId;
use vmbus_core::protocol::GpadlRange;
use vmbus_core::protocol::MAX_MESSAGE_SIZE;
use vmbus_core::MessageTooLarge;
use vmbus_core::OutgoingMessage;
use zerocopy::IntoBytes;

/// The largest GPADL that can be described: the range data length (range
/// descriptor plus page numbers) must fit in the header's 16-bit length field.
pub const MAX_GPADL_PAGES: usize =
    (u16::MAX as usize - size_of::<GpadlRange>()) / size_of::<u64>();

#[derive(Debug, Error)]
pub enum GpadlError {
    #[error("gpadl length {0:#x} is not a nonzero multiple of the page size")]
    InvalidSize(usize),
    #[error("{pfns} page numbers do not describe a {len:#x} byte buffer")]
    PageCountMismatch { len: usize, pfns: usize },
    #[error("gpadl covers too many pages: {0}")]
    TooManyPages(usize),
    #[error("out of memory building gpadl messages")]
    ResourceExhausted,
    #[error(transparent)]
    MessageTooLarge(#[from] MessageTooLarge),
}

/// The control messages that register one buffer with the host, in the
/// order they must be posted.
#[derive(Debug)]
pub struct GpadlMessages {
    pub header: OutgoingMessage,
    pub bodies: Vec<OutgoingMessage>,
}

impl GpadlMessages {
    /// Returns the number of messages.
    pub fn len(&self) -> usize {
        1 + self.bodies.len()
    }

    /// Iterates over the messages in posting order.
    pub fn iter(&self) -> impl Iterator<Item = &OutgoingMessage> {
        std::iter::once(&self.header).chain(&self.bodies)
    }
}

/// Builds the header and body messages describing a `byte_len` byte buffer
/// made of the pages in `pfns`, as a single range starting at offset 0.
///
/// The header carries as many page numbers as fit after the range
/// descriptor; each body carries the next contiguous slice. All messages use
/// `gpadl_id`. Either every message is built or none is.
pub fn build(
    channel_id: ChannelId,
    gpadl_id: GpadlId,
    byte_len: usize,
    pfns: &[u64],
) -> Result<GpadlMessages, GpadlError> {
    if byte_len == 0 || byte_len % PAGE_SIZE != 0 {
        return Err(GpadlError::InvalidSize(byte_len));
    }
    let page_count = byte_len / PAGE_SIZE;
    if page_count > MAX_GPADL_PAGES {
        return Err(GpadlError::TooManyPages(page_count));
    }
    if pfns.len() != page_count {
        return Err(GpadlError::PageCountMismatch {
            len: byte_len,
            pfns: pfns.len(),
        });
    }

    let range = GpadlRange {
        byte_count: byte_len as u32,
        byte_offset: 0,
    };

    // Split off the values that fit in the header.
    let (first, remaining) = pfns.split_at(page_count.min(protocol::GpadlHeader::MAX_PAGES));

    let mut data = [0; MAX_MESSAGE_SIZE];
    let range_len = size_of::<GpadlRange>();
    let data_len = range_len + first.as_bytes().len();
    data[..range_len].copy_from_slice(range.as_bytes());
    data[range_len..data_len].copy_from_slice(first.as_bytes());

    let header = OutgoingMessage::with_data(
        &protocol::GpadlHeader {
            channel_id,
            gpadl_id,
            len: ((1 + page_count) * size_of::<u64>()) as u16,
            count: 1,
        },
        &data[..data_len],
    )?;

    let body_count = remaining.len().div_ceil(protocol::GpadlBody::MAX_DATA_VALUES);
    let mut bodies = Vec::new();
    bodies
        .try_reserve_exact(body_count)
        .map_err(|_| GpadlError::ResourceExhausted)?;

    // Send GpadlBody messages for the remaining values.
    let body = protocol::GpadlBody { rsvd: 0, gpadl_id };
    for chunk in remaining.chunks(protocol::GpadlBody::MAX_DATA_VALUES) {
        bodies.push(OutgoingMessage::with_data(&body, chunk.as_bytes())?);
    }

    tracing::trace!(
        channel_id = channel_id.0,
        gpadl_id = gpadl_id.0,
        page_count,
        body_count,
        "built gpadl messages"
    );

    Ok(GpadlMessages { header, bodies })
}
