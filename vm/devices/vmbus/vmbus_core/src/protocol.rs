// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire definitions for the vmbus control messages exchanged with the host
//! over the synic message port.

use std::mem::size_of;
use std::ops::Deref;
use std::ops::DerefMut;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

#[macro_use]
mod macros;

/// The connection ID used for vmbus control messages.
pub const VMBUS_MESSAGE_CONNECTION_ID: u32 = 1;

/// The hypervisor message type used to post vmbus control messages.
pub const VMBUS_MESSAGE_TYPE: u32 = 1;

pub const STATUS_SUCCESS: i32 = 0;
pub const STATUS_UNSUCCESSFUL: i32 = 0x8000ffff_u32 as i32;

pub const HEADER_SIZE: usize = size_of::<MessageHeader>();

/// The size of a hypervisor message payload. Every control message,
/// including its header and any trailing data, must fit in this many bytes.
pub const MAX_MESSAGE_SIZE: usize = 240;

// This macro is used to define a MessageType open enum, a Message enum, a parse method for the
// Message enum, and VmbusMessage trait implementations for each protocol message struct.
//
// The syntax here is as follows:
// number name { struct },*
vmbus_messages! {
    pub enum Message, MessageType {
        2 RESCIND_CHANNEL_OFFER { RescindChannelOffer },
        5 OPEN_CHANNEL { OpenChannel },
        6 OPEN_CHANNEL_RESULT { OpenResult },
        7 CLOSE_CHANNEL { CloseChannel },
        8 GPADL_HEADER { GpadlHeader },
        9 GPADL_BODY { GpadlBody },
        10 GPADL_CREATED { GpadlCreated },
        11 GPADL_TEARDOWN { GpadlTeardown },
        12 GPADL_TORNDOWN { GpadlTorndown },
        13 REL_ID_RELEASED { RelIdReleased },
    }
}

/// An error that occurred while parsing a vmbus protocol message.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The message was smaller than required for the message type.
    #[error("message too small: {0:?}")]
    MessageTooSmall(Option<MessageType>),
    /// The message type is not a vmbus protocol message understood by this
    /// endpoint.
    #[error("unexpected or unsupported message type: {0:?}")]
    InvalidMessageType(MessageType),
}

/// Trait implemented on all protocol message structs by the vmbus_message! macro.
pub trait VmbusMessage: Sized {
    /// The corresponding message type for the struct.
    const MESSAGE_TYPE: MessageType;

    /// The size of the message, including the vmbus message header.
    const MESSAGE_SIZE: usize = HEADER_SIZE + size_of::<Self>();
}

/// The header of a vmbus message.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct MessageHeader {
    message_type: MessageType,
    padding: u32,
}

impl MessageHeader {
    /// Creates a new `MessageHeader` for the specified message type.
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            padding: 0,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }
}

#[repr(transparent)]
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, IntoBytes, FromBytes, Immutable, KnownLayout,
)]
pub struct GpadlId(pub u32);

/// The host-assigned child relation ID of a channel.
#[repr(transparent)]
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, IntoBytes, FromBytes, Immutable, KnownLayout,
)]
pub struct ChannelId(pub u32);

/// User-defined data provided by a device as part of an open request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub struct UserDefinedData([u8; 120]);

impl UserDefinedData {
    /// The number of bytes of user data carried by an open request.
    pub const LEN: usize = 120;

    /// Builds user data from a prefix, zero-filling the rest. Returns `None`
    /// if `data` is longer than [`Self::LEN`].
    pub fn from_prefix(data: &[u8]) -> Option<Self> {
        let mut this = Self::new_zeroed();
        this.0.get_mut(..data.len())?.copy_from_slice(data);
        Some(this)
    }
}

impl Deref for UserDefinedData {
    type Target = [u8; 120];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for UserDefinedData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<[u8; 120]> for UserDefinedData {
    fn from(value: [u8; 120]) -> Self {
        Self(value)
    }
}

impl Default for UserDefinedData {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct RescindChannelOffer {
    pub channel_id: ChannelId,
}

/// The range descriptor that leads the values of a GPADL header.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlRange {
    pub byte_count: u32,
    pub byte_offset: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlHeader {
    pub channel_id: ChannelId,
    pub gpadl_id: GpadlId,
    /// The length in bytes of the range data (range descriptors plus page
    /// numbers) across the header and all its body messages.
    pub len: u16,
    /// The number of ranges.
    pub count: u16,
}

impl GpadlHeader {
    /// The maximum number of 64 bit values that fit after the message data.
    pub const MAX_DATA_VALUES: usize = (MAX_MESSAGE_SIZE - Self::MESSAGE_SIZE) / size_of::<u64>();

    /// The maximum number of page numbers that fit in a single-range header,
    /// after the range descriptor.
    pub const MAX_PAGES: usize =
        (MAX_MESSAGE_SIZE - Self::MESSAGE_SIZE - size_of::<GpadlRange>()) / size_of::<u64>();
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlBody {
    pub rsvd: u32,
    pub gpadl_id: GpadlId,
}

impl GpadlBody {
    /// The maximum number of 64 bit values that fit after the message data.
    pub const MAX_DATA_VALUES: usize = (MAX_MESSAGE_SIZE - Self::MESSAGE_SIZE) / size_of::<u64>();
}

#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlCreated {
    pub channel_id: ChannelId,
    pub gpadl_id: GpadlId,
    pub status: i32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct OpenChannel {
    pub channel_id: ChannelId,
    pub open_id: u32,
    pub ring_buffer_gpadl_id: GpadlId,
    pub target_vp: u32,
    pub downstream_ring_buffer_page_offset: u32,
    pub user_data: UserDefinedData,
}

#[repr(C)]
#[derive(PartialEq, Eq, Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct OpenResult {
    pub channel_id: ChannelId,
    pub open_id: u32,
    pub status: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct CloseChannel {
    pub channel_id: ChannelId,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct RelIdReleased {
    pub channel_id: ChannelId,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlTeardown {
    pub channel_id: ChannelId,
    pub gpadl_id: GpadlId,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlTorndown {
    pub gpadl_id: GpadlId,
}
