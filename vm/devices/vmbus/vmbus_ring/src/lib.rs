// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! This module implements the low-level interface to the VmBus ring buffer. The
//! ring buffer resides in guest memory and is mapped into the host, allowing
//! efficient transfer of variable-sized packets.
//!
//! Every record in the ring is a multiple of 8 bytes and is followed by an
//! 8-byte footer holding the write index at which the record started. The
//! packet layout on top of that is handled by the [`packet`] module.
//!
//! In practice, ring buffers always come in pairs so that packets can be both
//! sent and received. However, this module's interfaces operate on them singly:
//! the same [`RingBuffer`] type is used for the producer and the consumer side.

#![forbid(unsafe_code)]

pub mod packet;

pub use protocol::PAGE_SIZE;

use protocol::*;
use std::fmt::Debug;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;
use zerocopy::IntoBytes;

mod protocol {
    use crate::CONTROL_WORD_COUNT;
    use std::fmt::Debug;
    use std::sync::atomic::AtomicU32;
    use zerocopy::FromBytes;
    use zerocopy::Immutable;
    use zerocopy::IntoBytes;
    use zerocopy::KnownLayout;

    /// VmBus ring buffers are sized in multiples 4KB pages, with a 4KB control page.
    pub const PAGE_SIZE: usize = 4096;

    /// A control page accessor.
    pub struct Control<'a>(pub &'a [AtomicU32; CONTROL_WORD_COUNT]);

    impl Control<'_> {
        pub fn inp(&self) -> &AtomicU32 {
            &self.0[0]
        }
        pub fn outp(&self) -> &AtomicU32 {
            &self.0[1]
        }
        pub fn interrupt_mask(&self) -> &AtomicU32 {
            &self.0[2]
        }
        pub fn pending_send_size(&self) -> &AtomicU32 {
            &self.0[3]
        }
    }

    impl Debug for Control<'_> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("Control")
                .field("inp", self.inp())
                .field("outp", self.outp())
                .field("interrupt_mask", self.interrupt_mask())
                .field("pending_send_size", self.pending_send_size())
                .finish()
        }
    }

    /// The record footer.
    #[repr(C)]
    #[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct Footer {
        pub reserved: u32,
        /// The ring offset of the record.
        pub offset: u32,
    }
}

/// The size of the trailer written after every record.
pub const FOOTER_SIZE: usize = size_of::<Footer>();

#[derive(Copy, Clone, Debug, Error)]
pub enum Error {
    #[error("invalid ring buffer pointer")]
    InvalidRingPointer,
    #[error("invalid message length")]
    InvalidMessageLength,
    #[error("invalid ring memory")]
    InvalidRingMemory,
    #[error("invalid descriptor offset or length")]
    InvalidDescriptorLengths,
    #[error("unknown packet descriptor flags")]
    InvalidDescriptorFlags,
    #[error("unknown packet descriptor type")]
    InvalidDescriptorType,
    #[error("invalid range count for gpa direct packet")]
    InvalidDescriptorGpaDirectRangeCount,
}

#[derive(Copy, Clone, Debug, Error)]
pub enum ReadError {
    #[error("ring buffer empty")]
    Empty,
    #[error(transparent)]
    Corrupt(#[from] Error),
}

#[derive(Copy, Clone, Debug, Error)]
pub enum WriteError {
    /// The record does not currently fit. Holds the number of bytes (including
    /// the footer) the record needs.
    #[error("ring buffer full, {0} bytes needed")]
    Full(usize),
    #[error(transparent)]
    Corrupt(#[from] Error),
}

/// The size of the control region in 32-bit words.
pub const CONTROL_WORD_COUNT: usize = 32;

/// A trait for memory backing a ring buffer.
pub trait RingMem: Send + Sync {
    /// Returns the control page.
    fn control(&self) -> &[AtomicU32; CONTROL_WORD_COUNT];

    /// Reads from the data portion of the ring, wrapping (once) at the end of
    /// the ring. Precondition: `addr + data.len() <= self.len() * 2`.
    fn read_at(&self, addr: usize, data: &mut [u8]);

    /// Writes to the data portion of the ring, wrapping (once) at the end of
    /// the ring. Precondition: `addr + data.len() <= self.len() * 2`.
    fn write_at(&self, addr: usize, data: &[u8]);

    /// Returns the length of the ring in bytes.
    fn len(&self) -> usize;
}

/// Implementation of `RingMem` for references. Useful for tests.
impl<T: RingMem> RingMem for &'_ T {
    fn control(&self) -> &[AtomicU32; CONTROL_WORD_COUNT] {
        (*self).control()
    }
    fn read_at(&self, addr: usize, data: &mut [u8]) {
        (*self).read_at(addr, data)
    }
    fn write_at(&self, addr: usize, data: &[u8]) {
        (*self).write_at(addr, data)
    }
    fn len(&self) -> usize {
        (*self).len()
    }
}

/// An implementation of `RingMem` over a flat allocation. Useful for tests.
#[derive(Clone)]
pub struct FlatRingMem {
    inner: Arc<FlatRingInner>,
}

struct FlatRingInner {
    control: [AtomicU32; CONTROL_WORD_COUNT],
    data: Vec<AtomicU8>,
}

impl FlatRingMem {
    /// Allocates a new memory.
    pub fn new(len: usize) -> Self {
        let mut data = Vec::new();
        data.resize_with(len, Default::default);
        Self {
            inner: Arc::new(FlatRingInner {
                control: [0; CONTROL_WORD_COUNT].map(Into::into),
                data,
            }),
        }
    }
}

impl Debug for FlatRingMem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlatRingMem").finish()
    }
}

fn atomic_read(src: &[AtomicU8], dest: &mut [u8]) {
    for (d, s) in dest.iter_mut().zip(src) {
        *d = s.load(Ordering::Relaxed);
    }
}

fn atomic_write(dest: &[AtomicU8], src: &[u8]) {
    for (d, s) in dest.iter().zip(src) {
        d.store(*s, Ordering::Relaxed);
    }
}

impl RingMem for FlatRingMem {
    fn read_at(&self, mut addr: usize, data: &mut [u8]) {
        if addr >= self.len() {
            addr -= self.len();
        }
        if addr + data.len() <= self.len() {
            atomic_read(&self.inner.data[addr..addr + data.len()], data);
        } else {
            let data_len = data.len();
            let (first, last) = data.split_at_mut(self.len() - addr);
            atomic_read(&self.inner.data[addr..], first);
            atomic_read(
                &self.inner.data[..data_len - (self.len() - addr)],
                last,
            );
        }
    }

    fn write_at(&self, mut addr: usize, data: &[u8]) {
        if addr >= self.len() {
            addr -= self.len();
        }
        if addr + data.len() <= self.len() {
            atomic_write(&self.inner.data[addr..addr + data.len()], data);
        } else {
            let (first, last) = data.split_at(self.len() - addr);
            atomic_write(&self.inner.data[addr..], first);
            atomic_write(&self.inner.data[..data.len() - (self.len() - addr)], last);
        }
    }

    fn control(&self) -> &[AtomicU32; CONTROL_WORD_COUNT] {
        &self.inner.control
    }

    fn len(&self) -> usize {
        self.inner.data.len()
    }
}

/// One direction of a channel: a circular byte buffer shared with the host.
///
/// The producer owns the write index and the consumer owns the read index.
/// Callers serialize producers against each other and consumers against each
/// other; a producer and a consumer may run concurrently.
pub struct RingBuffer<M: RingMem> {
    mem: M,
    size: u32,
}

impl<M: RingMem> Debug for RingBuffer<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("control", &self.control())
            .field("size", &self.size)
            .finish()
    }
}

impl<M: RingMem> RingBuffer<M> {
    /// Returns a ring over `mem`. Fails if the data region is empty, is not a
    /// multiple of the page size, or is too large to index.
    pub fn new(mem: M) -> Result<Self, Error> {
        let ring_size = u32::try_from(mem.len()).map_err(|_| Error::InvalidRingMemory)?;
        if ring_size == 0 || ring_size % PAGE_SIZE as u32 != 0 || ring_size > (1 << 31) {
            return Err(Error::InvalidRingMemory);
        }
        Ok(Self {
            mem,
            size: ring_size,
        })
    }

    /// Returns the largest record, footer included, that fits in an empty
    /// ring.
    pub fn maximum_packet_size(&self) -> usize {
        self.size as usize - 8
    }

    /// Returns the number of unread bytes.
    pub fn used_bytes(&self) -> Result<usize, Error> {
        let control = self.control();
        let inp = self.validate(control.inp().load(Ordering::Acquire))?;
        let outp = self.validate(control.outp().load(Ordering::Acquire))?;
        Ok(self.available(inp, outp) as usize)
    }

    /// Returns true if there is nothing to read.
    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.used_bytes()? == 0)
    }

    /// Returns the write index.
    pub fn write_index(&self) -> u32 {
        self.control().inp().load(Ordering::Relaxed)
    }

    /// Returns the read index.
    pub fn read_index(&self) -> u32 {
        self.control().outp().load(Ordering::Relaxed)
    }

    /// Enables or disables the interrupt mask, declaring to the opposite
    /// endpoint that interrupts should not or should be sent for a ring
    /// empty-to-non-empty transition.
    pub fn set_interrupt_mask(&self, state: bool) {
        self.control()
            .interrupt_mask()
            .store(state as u32, Ordering::SeqCst);
    }

    /// Returns whether the consumer has asked not to be signaled.
    pub fn interrupt_masked(&self) -> bool {
        self.control().interrupt_mask().load(Ordering::SeqCst) != 0
    }

    /// Sets the pending send size: the number of bytes that should be free in
    /// the ring before the opposite endpoint sends a ring-non-full signal.
    /// Zero cancels the request.
    ///
    /// Fails if the packet size is larger than the ring's maximum packet size.
    pub fn set_pending_send_size(&self, len: usize) -> Result<(), Error> {
        if len > self.maximum_packet_size() {
            return Err(Error::InvalidMessageLength);
        }
        self.control()
            .pending_send_size()
            .store((len as u32 + 7) & !7, Ordering::SeqCst);
        Ok(())
    }

    /// Appends one record, gathered from `segments`, followed by its footer.
    ///
    /// The total length must be a multiple of 8. On failure the ring is left
    /// untouched. On success, returns whether the consumer must be signaled:
    /// true only if the ring was empty before this write and the consumer has
    /// not masked interrupts.
    pub fn write(&self, segments: &[&[u8]]) -> Result<bool, WriteError> {
        let len: usize = segments.iter().map(|s| s.len()).sum();
        if len == 0 || len % 8 != 0 {
            return Err(WriteError::Corrupt(Error::InvalidMessageLength));
        }
        let total = len + FOOTER_SIZE;
        if total > self.maximum_packet_size() {
            return Err(WriteError::Full(total));
        }

        let control = self.control();
        let old_inp = self.validate(control.inp().load(Ordering::Relaxed))?;
        let outp = self.validate(control.outp().load(Ordering::Acquire))?;
        if (self.free(old_inp, outp) as usize) < total {
            return Err(WriteError::Full(total));
        }

        let mut inp = old_inp;
        for segment in segments.iter().filter(|s| !s.is_empty()) {
            self.mem.write_at(inp as usize, segment);
            inp = self.add_pointer(inp, segment.len() as u32);
        }
        let footer = Footer {
            reserved: 0,
            offset: old_inp,
        };
        self.mem.write_at(inp as usize, footer.as_bytes());
        inp = self.add_pointer(inp, FOOTER_SIZE as u32);

        // Publish the record only after its contents are in place.
        control.inp().store(inp, Ordering::SeqCst);

        // The consumer needs a signal only for the empty to non-empty edge.
        if control.interrupt_mask().load(Ordering::SeqCst) != 0 {
            return Ok(false);
        }
        Ok(control.outp().load(Ordering::SeqCst) == old_inp)
    }

    /// Copies the first `dest.len()` unread bytes without consuming them.
    pub fn peek(&self, dest: &mut [u8]) -> Result<(), ReadError> {
        let control = self.control();
        let inp = self.validate(control.inp().load(Ordering::Acquire))?;
        let outp = self.validate(control.outp().load(Ordering::Relaxed))?;
        if (self.available(inp, outp) as usize) < dest.len() || inp == outp {
            return Err(ReadError::Empty);
        }
        self.mem.read_at(outp as usize, dest);
        Ok(())
    }

    /// Skips `skip` bytes, copies `dest.len()` bytes, then consumes both plus
    /// the record footer.
    ///
    /// Returns whether the producer must be signaled because the free space
    /// crossed the pending send size it asked for.
    pub fn read(&self, dest: &mut [u8], skip: usize) -> Result<bool, ReadError> {
        let len = skip + dest.len();
        if len % 8 != 0 {
            return Err(ReadError::Corrupt(Error::InvalidMessageLength));
        }
        let control = self.control();
        let inp = self.validate(control.inp().load(Ordering::Acquire))?;
        let outp = self.validate(control.outp().load(Ordering::Relaxed))?;
        let needed = len + FOOTER_SIZE;
        if inp == outp || (self.available(inp, outp) as usize) < needed {
            return Err(ReadError::Empty);
        }
        self.mem
            .read_at(self.add_pointer(outp, skip as u32) as usize, dest);
        let new_outp = self.add_pointer(outp, needed as u32);
        Ok(self.commit_read(outp, new_outp))
    }

    /// Consumes everything up to the current write index, for use when the
    /// data at the read index cannot be framed.
    ///
    /// Returns whether the producer must be signaled, as for [`Self::read`].
    pub fn discard_unread(&self) -> Result<bool, Error> {
        let control = self.control();
        let inp = self.validate(control.inp().load(Ordering::Acquire))?;
        let outp = self.validate(control.outp().load(Ordering::Relaxed))?;
        if inp == outp {
            return Ok(false);
        }
        Ok(self.commit_read(outp, inp))
    }

    /// Starts a batch of reads: masks interrupts so the host stops signaling,
    /// and returns the number of bytes currently unread.
    pub fn begin_batch(&self) -> Result<usize, Error> {
        self.set_interrupt_mask(true);
        self.used_bytes()
    }

    /// Ends a batch of reads: unmasks interrupts and returns the number of
    /// unread bytes. A nonzero result means data arrived while masked and the
    /// host will not signal for it, so the caller must read again.
    pub fn end_batch(&self) -> Result<usize, Error> {
        self.set_interrupt_mask(false);
        self.used_bytes()
    }

    fn commit_read(&self, old_outp: u32, new_outp: u32) -> bool {
        let control = self.control();
        control.outp().store(new_outp, Ordering::SeqCst);
        // Some implementations set the pending send size to the size of the
        // ring minus 1. Mask off the low bits to work around this.
        let pending_send_size = control.pending_send_size().load(Ordering::SeqCst) & !7;
        if pending_send_size == 0 {
            return false;
        }
        match self.validate(control.inp().load(Ordering::SeqCst)) {
            Ok(inp) => {
                let old_free = self.free(inp, old_outp);
                let new_free = self.free(inp, new_outp);
                old_free < pending_send_size && new_free >= pending_send_size
            }
            Err(_) => false,
        }
    }

    fn control(&self) -> Control<'_> {
        Control(self.mem.control())
    }

    fn validate(&self, p: u32) -> Result<u32, Error> {
        if p >= self.size || p % 8 != 0 {
            Err(Error::InvalidRingPointer)
        } else {
            Ok(p)
        }
    }

    fn add_pointer(&self, p: u32, off: u32) -> u32 {
        let np = p + off;
        if np >= self.size {
            np - self.size
        } else {
            np
        }
    }

    fn available(&self, inp: u32, outp: u32) -> u32 {
        if inp >= outp {
            // |____outp....inp_____|
            inp - outp
        } else {
            // |....inp____outp.....|
            self.size + inp - outp
        }
    }

    fn free(&self, inp: u32, outp: u32) -> u32 {
        // It's not possible to fully fill the ring since that state would be
        // indistinguishable from the empty ring. So subtract 8 bytes from the
        // result.
        if outp > inp {
            // |....inp____outp.....|
            outp - inp - 8
        } else {
            // |____outp....inp_____|
            self.size - (inp - outp) - 8
        }
    }
}
