// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Traits and types for memory shared with the host.

use std::fmt::Debug;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use vmbus_ring::RingMem;
use vmbus_ring::CONTROL_WORD_COUNT;

/// The 4KB page size used by vmbus.
pub const PAGE_SIZE: usize = 4096;

const WORD_SIZE: usize = size_of::<AtomicU32>();

/// Physically contiguous memory visible to the host.
///
/// The memory is exposed as 32-bit atomic words so that both partitions can
/// access it concurrently without `unsafe`.
pub trait DmaTarget: Send + Sync {
    /// The backing words, `len() / 4` of them.
    fn words(&self) -> &[AtomicU32];

    /// 4KB page numbers used to refer to the memory when communicating with
    /// the host.
    fn pfns(&self) -> &[u64];
}

/// A view of a [`DmaTarget`].
///
/// The target is released when the last view referencing it is dropped.
#[derive(Clone)]
pub struct MemoryBlock {
    mem: Arc<dyn DmaTarget>,
    offset: usize,
    len: usize,
}

impl Debug for MemoryBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("pfns", &self.pfns())
            .finish()
    }
}

impl MemoryBlock {
    /// Creates a new memory block backed by `mem`.
    pub fn new<T: 'static + DmaTarget>(mem: T) -> Self {
        let len = mem.words().len() * WORD_SIZE;
        Self {
            mem: Arc::new(mem),
            offset: 0,
            len,
        }
    }

    /// Returns a view of a subset of the buffer. `offset` must be a multiple
    /// of 4.
    ///
    /// Panics if the range is out of bounds.
    pub fn subblock(&self, offset: usize, len: usize) -> Self {
        assert!(offset % WORD_SIZE == 0);
        assert!(self.len >= offset && self.len - offset >= len);
        Self {
            mem: self.mem.clone(),
            offset: self.offset + offset,
            len,
        }
    }

    /// Gets the length of the buffer in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Gets the PFNs of the pages this view touches.
    pub fn pfns(&self) -> &[u64] {
        let start = self.offset / PAGE_SIZE;
        let end = (self.offset + self.len).div_ceil(PAGE_SIZE);
        &self.mem.pfns()[start..end]
    }

    /// Gets the words of this view, rounded out to word boundaries.
    pub fn words(&self) -> &[AtomicU32] {
        let start = self.offset / WORD_SIZE;
        let end = (self.offset + self.len).div_ceil(WORD_SIZE);
        &self.mem.words()[start..end]
    }

    /// Reads `data.len()` bytes at `offset`.
    ///
    /// Panics if the range is out of bounds.
    pub fn read_at(&self, offset: usize, mut data: &mut [u8]) {
        assert!(self.len >= offset && self.len - offset >= data.len());
        let words = self.mem.words();
        let mut pos = self.offset + offset;
        while !data.is_empty() {
            let shift = pos % WORD_SIZE;
            let n = (WORD_SIZE - shift).min(data.len());
            let word = words[pos / WORD_SIZE].load(Ordering::Relaxed).to_le_bytes();
            let (head, rest) = std::mem::take(&mut data).split_at_mut(n);
            head.copy_from_slice(&word[shift..shift + n]);
            data = rest;
            pos += n;
        }
    }

    /// Writes `data` at `offset`.
    ///
    /// Panics if the range is out of bounds.
    pub fn write_at(&self, offset: usize, mut data: &[u8]) {
        assert!(self.len >= offset && self.len - offset >= data.len());
        let words = self.mem.words();
        let mut pos = self.offset + offset;
        while !data.is_empty() {
            let shift = pos % WORD_SIZE;
            let n = (WORD_SIZE - shift).min(data.len());
            let (head, rest) = data.split_at(n);
            let word = &words[pos / WORD_SIZE];
            if n == WORD_SIZE {
                word.store(
                    u32::from_le_bytes([head[0], head[1], head[2], head[3]]),
                    Ordering::Relaxed,
                );
            } else {
                // Partial word: merge with the bytes owned by the other side.
                let _ = word.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |old| {
                    let mut bytes = old.to_le_bytes();
                    bytes[shift..shift + n].copy_from_slice(head);
                    Some(u32::from_le_bytes(bytes))
                });
            }
            data = rest;
            pos += n;
        }
    }
}

/// An object that can allocate memory to be shared with the host.
pub trait DmaAllocator: Send + Sync {
    /// Allocates `len` bytes of physically contiguous, page aligned, zeroed
    /// memory. `len` must be a multiple of [`PAGE_SIZE`].
    ///
    /// The memory is freed when the last [`MemoryBlock`] referencing it is
    /// dropped.
    fn allocate_dma_buffer(&self, len: usize) -> anyhow::Result<MemoryBlock>;
}

/// Ring memory carved out of a [`MemoryBlock`]: one control page followed by
/// the data pages.
#[derive(Debug, Clone)]
pub struct DmaRingMem {
    mem: MemoryBlock,
}

impl DmaRingMem {
    /// Wraps `mem`, which must be page aligned and at least two pages long.
    pub fn new(mem: MemoryBlock) -> Result<Self, vmbus_ring::Error> {
        if mem.offset % PAGE_SIZE != 0 || mem.len() % PAGE_SIZE != 0 || mem.len() < PAGE_SIZE * 2
        {
            return Err(vmbus_ring::Error::InvalidRingMemory);
        }
        Ok(Self { mem })
    }

    fn data_len(&self) -> usize {
        self.mem.len() - PAGE_SIZE
    }
}

impl RingMem for DmaRingMem {
    fn control(&self) -> &[AtomicU32; CONTROL_WORD_COUNT] {
        self.mem
            .words()
            .first_chunk()
            .expect("ring memory validated at construction")
    }

    fn read_at(&self, mut addr: usize, data: &mut [u8]) {
        let len = self.data_len();
        if addr >= len {
            addr -= len;
        }
        if addr + data.len() <= len {
            self.mem.read_at(PAGE_SIZE + addr, data);
        } else {
            let (first, last) = data.split_at_mut(len - addr);
            self.mem.read_at(PAGE_SIZE + addr, first);
            self.mem.read_at(PAGE_SIZE, last);
        }
    }

    fn write_at(&self, mut addr: usize, data: &[u8]) {
        let len = self.data_len();
        if addr >= len {
            addr -= len;
        }
        if addr + data.len() <= len {
            self.mem.write_at(PAGE_SIZE + addr, data);
        } else {
            let (first, last) = data.split_at(len - addr);
            self.mem.write_at(PAGE_SIZE + addr, first);
            self.mem.write_at(PAGE_SIZE, last);
        }
    }

    fn len(&self) -> usize {
        self.data_len()
    }
}
