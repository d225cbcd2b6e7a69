// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-Harbor is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{ErrorKind, Result};
use crate::kernel::migrate::Prd;
use crate::utils::{range_in_range, round_up};

pub const PAGE_SIZE: usize = 4096;

/// The contiguous guest-physical memory window of one VM. Owned by the
/// motherboard; vCPU portals and the migration driver address it through
/// raw page offsets.
pub struct GuestMem {
    base: NonNull<u8>,
    size: usize,
}

// The window is a plain byte arena addressed from several threads; the
// freeze discipline of the migration driver keeps readers and writers
// apart where it matters.
unsafe impl Send for GuestMem {}
unsafe impl Sync for GuestMem {}

impl GuestMem {
    pub fn new(size: usize) -> Result<GuestMem> {
        let size = round_up(size, PAGE_SIZE);
        if size == 0 {
            return Ok(GuestMem {
                base: NonNull::dangling(),
                size: 0,
            });
        }
        let layout =
            Layout::from_size_align(size, PAGE_SIZE).map_err(|_| ErrorKind::InvalidParam)?;
        let ptr = unsafe { alloc_zeroed(layout) };
        match NonNull::new(ptr) {
            Some(base) => Ok(GuestMem { base, size }),
            None => ErrorKind::Exhausted.into(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn pages(&self) -> usize {
        self.size / PAGE_SIZE
    }

    pub fn host_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn contains(&self, offset: usize, len: usize) -> bool {
        range_in_range(offset, len, 0, self.size)
    }

    pub fn slice(&self, offset: usize, len: usize) -> &[u8] {
        assert!(self.contains(offset, len), "guest mem read out of range");
        unsafe { std::slice::from_raw_parts(self.base.as_ptr().add(offset), len) }
    }

    /// Mutable view of a guest range. Callers follow the single-writer
    /// discipline: only the restore path writes while the vCPUs are parked.
    #[allow(clippy::mut_from_ref)]
    pub fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        assert!(self.contains(offset, len), "guest mem write out of range");
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr().add(offset), len) }
    }
}

impl Drop for GuestMem {
    fn drop(&mut self) {
        if self.size > 0 {
            let layout = Layout::from_size_align(self.size, PAGE_SIZE).unwrap();
            unsafe { dealloc(self.base.as_ptr(), layout) };
        }
    }
}

/// The host's view of which guest pages were written since they were last
/// reported. How pages get into this set is the hypervisor backend's
/// business; the migration driver only ever asks for the next entry.
pub trait DirtyOracle: Send + Sync {
    /// Next dirty page run, or the empty descriptor when the set is
    /// exhausted for now. All pages dirtied between two sweeps must
    /// eventually be reported.
    fn next_dirty_page(&self) -> Prd;
}

/// Backend-independent oracle for the initial transfer: reports every guest
/// page exactly once, in large aligned runs, then goes silent.
pub struct InitialSweepOracle {
    pages: usize,
    next: AtomicUsize,
}

impl InitialSweepOracle {
    pub fn new(pages: usize) -> InitialSweepOracle {
        InitialSweepOracle {
            pages,
            next: AtomicUsize::new(0),
        }
    }
}

impl DirtyOracle for InitialSweepOracle {
    fn next_dirty_page(&self) -> Prd {
        let cur = self.next.load(Ordering::Acquire);
        if cur >= self.pages {
            return Prd::EMPTY;
        }
        let run = Prd::largest_aligned_run(cur, self.pages - cur);
        self.next.store(cur + run.pages(), Ordering::Release);
        run
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_mem_is_zeroed_and_addressable() {
        let mem = GuestMem::new(4 * PAGE_SIZE).unwrap();
        assert_eq!(mem.pages(), 4);
        assert!(mem.slice(0, mem.size()).iter().all(|&b| b == 0));

        mem.slice_mut(PAGE_SIZE, PAGE_SIZE).fill(0xab);
        assert!(mem.slice(PAGE_SIZE, PAGE_SIZE).iter().all(|&b| b == 0xab));
        assert!(mem.slice(0, PAGE_SIZE).iter().all(|&b| b == 0));
    }

    #[test]
    fn empty_guest_mem_is_valid() {
        let mem = GuestMem::new(0).unwrap();
        assert_eq!(mem.pages(), 0);
        assert!(!mem.contains(0, 1));
    }

    #[test]
    fn sub_page_sizes_round_up() {
        let mem = GuestMem::new(1).unwrap();
        assert_eq!(mem.size(), PAGE_SIZE);
    }

    #[test]
    fn initial_sweep_covers_every_page_once() {
        let pages = 1027; // deliberately not a power of two
        let oracle = InitialSweepOracle::new(pages);
        let mut seen = vec![false; pages];
        loop {
            let prd = oracle.next_dirty_page();
            if prd.is_empty() {
                break;
            }
            let base = prd.base_page() as usize;
            assert_eq!(base % prd.pages(), 0);
            for page in base..base + prd.pages() {
                assert!(!seen[page], "page {} reported twice", page);
                seen[page] = true;
            }
        }
        assert!(seen.iter().all(|&s| s));
        // The oracle stays silent once drained.
        assert!(oracle.next_dirty_page().is_empty());
    }
}
