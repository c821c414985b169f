// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Control-plane definitions shared by the vmbus channel transport.

#![forbid(unsafe_code)]

pub mod protocol;

use protocol::MessageHeader;
use protocol::VmbusMessage;
use protocol::MAX_MESSAGE_SIZE;
use thiserror::Error;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// An error returned when a message does not fit in a hypervisor message.
#[derive(Debug, Error)]
#[error("a synic message exceeds the maximum length")]
pub struct MessageTooLarge;

/// A control message ready to post to the host: the message header, the
/// message struct and any trailing data, in one fixed-size buffer.
#[derive(Clone)]
pub struct OutgoingMessage {
    buf: [u8; MAX_MESSAGE_SIZE],
    len: usize,
}

impl OutgoingMessage {
    fn from_parts(parts: &[&[u8]]) -> Result<Self, MessageTooLarge> {
        let mut this = Self {
            buf: [0; MAX_MESSAGE_SIZE],
            len: 0,
        };
        for part in parts {
            let end = this.len + part.len();
            this.buf
                .get_mut(this.len..end)
                .ok_or(MessageTooLarge)?
                .copy_from_slice(part);
            this.len = end;
        }
        Ok(this)
    }

    /// Encodes `message` behind its header.
    pub fn new<T: IntoBytes + Immutable + KnownLayout + VmbusMessage>(message: &T) -> Self {
        Self::from_parts(&[
            MessageHeader::new(T::MESSAGE_TYPE).as_bytes(),
            message.as_bytes(),
        ])
        .expect("message size checked at compile time")
    }

    /// Encodes `message` behind its header, followed by `data`.
    pub fn with_data<T: IntoBytes + Immutable + KnownLayout + VmbusMessage>(
        message: &T,
        data: &[u8],
    ) -> Result<Self, MessageTooLarge> {
        Self::from_parts(&[
            MessageHeader::new(T::MESSAGE_TYPE).as_bytes(),
            message.as_bytes(),
            data,
        ])
    }

    /// The encoded bytes.
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl std::fmt::Debug for OutgoingMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingMessage")
            .field("data", &self.data())
            .finish()
    }
}

impl PartialEq for OutgoingMessage {
    fn eq(&self, other: &Self) -> bool {
        self.data() == other.data()
    }
}
