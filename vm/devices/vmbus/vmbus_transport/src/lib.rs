// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest-side vmbus channel transport.
//!
//! A [`control::BusConnection`] owns the control connection to the host.
//! Each [`channel::Channel`] registers a pair of ring buffers with the host
//! through it and moves packets over them; host signals are routed to the
//! channel's receive callback by the [`dispatch::EventDispatcher`].

#![forbid(unsafe_code)]

pub mod channel;
pub mod control;
pub mod dispatch;
pub mod emulated;
pub mod gpadl;
pub mod memory;
pub mod synic;

#[cfg(test)]
mod tests;
