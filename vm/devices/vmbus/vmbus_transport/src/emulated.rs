// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An emulated pool of host-visible memory, for running the transport against
//! an in-process host.

use crate::memory::DmaAllocator;
use crate::memory::DmaTarget;
use crate::memory::MemoryBlock;
use crate::memory::PAGE_SIZE;
use anyhow::Context;
use parking_lot::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;

const WORDS_PER_PAGE: usize = PAGE_SIZE / size_of::<u32>();

struct SharedInner {
    words: Box<[AtomicU32]>,
    state: Mutex<AllocState>,
}

struct AllocState {
    bitmap: Vec<u64>,
    frees: usize,
}

/// A flat range of "physical" pages shared by an emulated guest and host.
/// PFN `n` is page `n` of the range.
#[derive(Clone)]
pub struct EmulatedSharedMemory {
    inner: Arc<SharedInner>,
    page_count: usize,
}

impl EmulatedSharedMemory {
    pub fn new(page_count: usize) -> Self {
        let mut words = Vec::new();
        words.resize_with(page_count * WORDS_PER_PAGE, Default::default);
        Self {
            inner: Arc::new(SharedInner {
                words: words.into(),
                state: Mutex::new(AllocState {
                    bitmap: vec![0; page_count.div_ceil(64)],
                    frees: 0,
                }),
            }),
            page_count,
        }
    }

    /// Allocates `len` bytes of contiguous, zeroed pages.
    pub fn alloc(&self, len: usize) -> Option<DmaBuffer> {
        if len == 0 || len % PAGE_SIZE != 0 {
            return None;
        }
        let count = len / PAGE_SIZE;

        // Find a contiguous free range by scanning the state bitmap.
        let start_page = {
            let mut state = self.inner.state.lock();
            let mut i = 0;
            let mut contig = 0;
            while contig < count && i < self.page_count {
                if state.bitmap[i / 64] & 1 << (i % 64) != 0 {
                    contig = 0;
                } else {
                    contig += 1;
                }
                i += 1;
            }
            if contig < count {
                return None;
            }
            let start = i - contig;
            for j in start..i {
                state.bitmap[j / 64] |= 1 << (j % 64);
            }
            start
        };

        let buffer = DmaBuffer {
            range: PageRange {
                inner: self.inner.clone(),
                pfns: (start_page..start_page + count).map(|p| p as u64).collect(),
            },
        };
        for word in buffer.words() {
            word.store(0, Ordering::Relaxed);
        }
        Some(buffer)
    }

    /// Returns a view of `count` pages starting at `pfn`, as the host would
    /// map them. The view does not own the pages.
    ///
    /// Panics if the range is outside the shared memory.
    pub fn view(&self, pfn: u64, count: usize) -> MemoryBlock {
        let start = usize::try_from(pfn).unwrap_or(usize::MAX);
        assert!(start < self.page_count && self.page_count - start >= count);
        MemoryBlock::new(PageRange {
            inner: self.inner.clone(),
            pfns: (start..start + count).map(|p| p as u64).collect(),
        })
    }

    /// Returns the number of pages currently allocated.
    pub fn allocated_pages(&self) -> usize {
        let state = self.inner.state.lock();
        state.bitmap.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Returns the number of buffers freed so far.
    pub fn free_count(&self) -> usize {
        self.inner.state.lock().frees
    }
}

struct PageRange {
    inner: Arc<SharedInner>,
    pfns: Vec<u64>,
}

impl DmaTarget for PageRange {
    fn words(&self) -> &[AtomicU32] {
        let start = self.pfns.first().map_or(0, |&p| p as usize) * WORDS_PER_PAGE;
        &self.inner.words[start..start + self.pfns.len() * WORDS_PER_PAGE]
    }

    fn pfns(&self) -> &[u64] {
        &self.pfns
    }
}

/// An allocation from [`EmulatedSharedMemory`]. The pages are returned to the
/// pool on drop.
pub struct DmaBuffer {
    range: PageRange,
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        let mut state = self.range.inner.state.lock();
        for &pfn in &self.range.pfns {
            state.bitmap[pfn as usize / 64] &= !(1 << (pfn % 64));
        }
        state.frees += 1;
    }
}

impl DmaTarget for DmaBuffer {
    fn words(&self) -> &[AtomicU32] {
        self.range.words()
    }

    fn pfns(&self) -> &[u64] {
        self.range.pfns()
    }
}

/// A [`DmaAllocator`] handing out pages of an [`EmulatedSharedMemory`].
#[derive(Clone)]
pub struct EmulatedDmaAllocator {
    shared_mem: EmulatedSharedMemory,
}

impl EmulatedDmaAllocator {
    pub fn new(shared_mem: EmulatedSharedMemory) -> Self {
        Self { shared_mem }
    }
}

impl DmaAllocator for EmulatedDmaAllocator {
    fn allocate_dma_buffer(&self, len: usize) -> anyhow::Result<MemoryBlock> {
        Ok(MemoryBlock::new(
            self.shared_mem.alloc(len).context("out of memory")?,
        ))
    }
}
