// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-Harbor is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

use std::time::{Duration, Instant};

static TSC_FREQ_HZ: spin::Once<u64> = spin::Once::new();

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// Read the host time-stamp counter.
        pub fn rdtsc() -> u64 {
            unsafe { core::arch::x86_64::_rdtsc() }
        }
    } else {
        static TSC_EPOCH: spin::Lazy<Instant> = spin::Lazy::new(Instant::now);

        /// Monotonic nanosecond counter standing in for the TSC on hosts
        /// without one.
        pub fn rdtsc() -> u64 {
            TSC_EPOCH.elapsed().as_nanos() as u64
        }
    }
}

fn calibrate_tsc() -> u64 {
    let wall_start = Instant::now();
    let tsc_start = rdtsc();
    std::thread::sleep(Duration::from_millis(20));
    let ticks = rdtsc().wrapping_sub(tsc_start);
    let nanos = wall_start.elapsed().as_nanos() as u64;
    ticks.saturating_mul(1_000_000_000) / nanos.max(1)
}

/// Host TSC frequency in Hz, calibrated against the wall clock on first use.
pub fn tsc_freq_hz() -> u64 {
    *TSC_FREQ_HZ.call_once(calibrate_tsc)
}

pub fn timer_init() {
    info!("TSC frequency: {}Hz", tsc_freq_hz());
    info!("Timer init ok");
}
