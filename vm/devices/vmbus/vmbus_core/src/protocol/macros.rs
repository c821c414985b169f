// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

/// Defines an open enum, which contains constants for each vmbus message type.
///
/// Unknown values from the host must round-trip, so this is a transparent
/// newtype rather than a Rust enum.
macro_rules! vmbus_message_type {
    (pub enum $enum_name:ident, $open_enum_name:ident { $( $num:literal $name:ident $rest:tt, )* }) => {
        /// Represents the message type value that identifies a vmbus protocol message.
        #[repr(transparent)]
        #[derive(Copy, Clone, PartialEq, Eq, Hash, IntoBytes, FromBytes, Immutable, KnownLayout)]
        pub struct $open_enum_name(pub u32);

        #[allow(missing_docs)]
        impl $open_enum_name {
            $(pub const $name: Self = Self($num);)*
        }

        impl std::fmt::Debug for $open_enum_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match *self {
                    $(Self::$name => f.pad(stringify!($name)),)*
                    _ => write!(f, "{:#x}", self.0),
                }
            }
        }
    }
}

/// Defines an enum which contains a variant for each message type, and a parse method that converts
/// a received message into one of those variants.
macro_rules! vmbus_message_enum {
    (pub enum $enum_name:ident, $open_enum_name:ident { $( $num:literal $name:ident { $type:ident } ,)* }) => {
        /// Represents a parsed vmbus protocol message.
        #[derive(Debug)]
        pub enum $enum_name<'a> {
            $($type($type, &'a [u8]),)*
        }

        impl<'a> $enum_name<'a> {
            /// Parses a vmbus message received from the synic into an enum variant.
            ///
            /// The second field of each variant holds any bytes trailing the
            /// fixed-size message struct.
            pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
                let (header, data) = MessageHeader::read_from_prefix(data)
                    .map_err(|_| ParseError::MessageTooSmall(None))?;

                let message = match header.message_type {
                    $(
                        $open_enum_name::$name => {
                            let (message, remaining) = $type::read_from_prefix(data)
                                .map_err(|_| ParseError::MessageTooSmall(Some(header.message_type)))?;

                            Self::$type(message, remaining)
                        }
                    )*
                    _ => return Err(ParseError::InvalidMessageType(header.message_type)),
                };

                Ok(message)
            }
        }
    };
}

/// Implements the `VmbusMessage` trait for each protocol message struct, which provides a constant
/// with the message type for that struct. It also generates a compile-time assert that the message
/// fits in the hypervisor message payload.
macro_rules! vmbus_message_trait_impl {
    (pub enum $enum_name:ident, $open_enum_name:ident { $( $num:literal $name:ident { $type:ident } ,)* }) => {
        $(
            impl VmbusMessage for $type {
                const MESSAGE_TYPE: $open_enum_name = $open_enum_name::$name;
            }

            static_assertions::const_assert!($type::MESSAGE_SIZE <= MAX_MESSAGE_SIZE);
        )*
    }
}

/// Defines an open enum with message type constant, an enum with parsed messages, and
/// `VmbusMessage` trait implementation for vmbus protocol messages. See this macro's usage in
/// protocol.rs for more information.
macro_rules! vmbus_messages {
    ($($contents:tt)*) => {
        vmbus_message_type!($($contents)*);
        vmbus_message_enum!($($contents)*);
        vmbus_message_trait_impl!($($contents)*);
    }
}
