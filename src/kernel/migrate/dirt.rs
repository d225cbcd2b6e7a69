// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-Harbor is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

use super::prd::Prd;

/// Tracks which guest pages still await (re-)transfer during a migration
/// session. Feeding it page runs instead of single pages amortizes the
/// per-page cost of the coarse runs the host reports. Next to the live
/// bitmap it keeps a per-page fault-frequency counter for post-mortem
/// statistics and future resend heuristics.
pub struct DirtManager {
    map: Vec<u64>,
    pages: usize,
    cnt: Vec<u8>,
    dirt_count: usize,
}

impl DirtManager {
    pub fn new(pages: usize) -> DirtManager {
        DirtManager {
            map: vec![0; pages.div_ceil(64)],
            pages,
            cnt: vec![0; pages],
            dirt_count: 0,
        }
    }

    #[inline]
    fn get_bit(&self, page: usize) -> bool {
        self.map[page / 64] & (1 << (page % 64)) != 0
    }

    #[inline]
    fn set_bit(&mut self, page: usize, value: bool) {
        if value {
            self.map[page / 64] |= 1 << (page % 64);
        } else {
            self.map[page / 64] &= !(1 << (page % 64));
        }
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn mark_dirty(&mut self, dirty: Prd) {
        let base = dirty.base_page() as usize;
        for page in base..base + dirty.pages() {
            self.mark_dirty_page(page);
        }
    }

    pub fn mark_dirty_page(&mut self, page: usize) {
        assert!(page < self.pages, "page {} beyond guest memory", page);
        if !self.get_bit(page) {
            self.dirt_count += 1;
            self.cnt[page] = self.cnt[page].saturating_add(1);
            self.set_bit(page, true);
        }
    }

    pub fn mark_clean(&mut self, clean: Prd) {
        let base = clean.base_page() as usize;
        for page in base..base + clean.pages() {
            self.mark_clean_page(page);
        }
    }

    pub fn mark_clean_page(&mut self, page: usize) {
        assert!(page < self.pages, "page {} beyond guest memory", page);
        debug_assert!(self.get_bit(page), "cleaning an already-clean page");
        if self.get_bit(page) {
            self.dirt_count -= 1;
            self.set_bit(page, false);
        }
    }

    pub fn dirty_pages(&self) -> usize {
        self.dirt_count
    }

    /// Largest naturally aligned run starting at the lowest dirty page, or
    /// the empty descriptor when nothing is dirty.
    pub fn next_dirty(&self) -> Prd {
        let mut base = None;
        for (idx, &word) in self.map.iter().enumerate() {
            if word != 0 {
                base = Some(idx * 64 + word.trailing_zeros() as usize);
                break;
            }
        }
        let base = match base {
            Some(base) => base,
            None => return Prd::EMPTY,
        };

        let mut len = 0;
        while base + len < self.pages && self.get_bit(base + len) {
            len += 1;
        }
        Prd::largest_aligned_run(base, len)
    }

    /// Dump fault-frequency statistics of the finished session. The numbers
    /// are diagnostic output only; nothing in the protocol depends on them.
    pub fn print_stats(&self) {
        if self.pages == 0 {
            return;
        }

        const BUCKETS: usize = 20;
        let mut bucket = [0usize; BUCKETS + 1];
        let mut sum = 0u64;
        let mut sq_sum = 0u64;

        for &faults in self.cnt.iter() {
            let faults = faults as usize;
            bucket[faults.min(BUCKETS)] += 1;
            sum += faults as u64;
            sq_sum += (faults * faults) as u64;
        }

        let pages = self.pages as f64;
        let avg = sum as f64 / pages;
        let var = sq_sum as f64 / pages - avg * avg;
        info!("# fault counts: avg = {:.2}, var = {:.2}", avg, var);

        for (faults, &count) in bucket.iter().enumerate().filter(|(_, &c)| c != 0) {
            debug!("# {:>2}{} faults: {:6} pages", faults, if faults == BUCKETS { "+" } else { " " }, count);
        }

        for window in [1usize, 51, 101] {
            let peak = (0..self.pages)
                .map(|pos| fir_max(&self.cnt, pos, window))
                .max()
                .unwrap_or(0);
            debug!("# smoothed peak (window {:>3}): {}", window, peak);
        }
    }
}

/// Sliding-window maximum over the fault-count curve.
fn fir_max(cnt: &[u8], pos: usize, half_width: usize) -> u8 {
    let beg = pos.saturating_sub(half_width);
    let end = (pos + half_width).min(cnt.len() - 1);
    cnt[beg..=end].iter().copied().max().unwrap_or(0)
}
