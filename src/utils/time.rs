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

static BOOT_TIME: spin::Lazy<Instant> = spin::Lazy::new(Instant::now);

/// Get current time in microseconds since process start.
pub fn time_current_us() -> usize {
    BOOT_TIME.elapsed().as_micros() as usize
}

/// Get current time in milliseconds since process start.
pub fn time_current_ms() -> usize {
    BOOT_TIME.elapsed().as_millis() as usize
}

/// Wall-clock lap timer used for transfer-rate accounting.
pub struct StopWatch {
    started: Option<Instant>,
    delta: Duration,
    abs_start_ms: usize,
}

impl StopWatch {
    pub fn new() -> StopWatch {
        StopWatch {
            started: None,
            delta: Duration::ZERO,
            abs_start_ms: 0,
        }
    }

    pub fn start(&mut self) {
        self.abs_start_ms = time_current_ms();
        self.started = Some(Instant::now());
    }

    pub fn stop(&mut self) {
        if let Some(begin) = self.started.take() {
            self.delta = begin.elapsed();
        }
    }

    /// Measured lap length in milliseconds.
    pub fn delta_ms(&self) -> u64 {
        self.delta.as_millis() as u64
    }

    /// Millisecond timestamp of the last `start` call.
    pub fn abs_start_ms(&self) -> usize {
        self.abs_start_ms
    }

    /// Throughput in KiB/s for `bytes` moved during the measured lap.
    /// A watch that never ran reports zero, never a division fault.
    pub fn rate_kibps(&self, bytes: usize) -> u64 {
        let ms = self.delta_ms();
        if ms == 0 {
            return 0;
        }
        bytes as u64 / ms
    }
}

impl Default for StopWatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopwatch_measures_elapsed_time() {
        let mut watch = StopWatch::new();
        watch.start();
        std::thread::sleep(Duration::from_millis(20));
        watch.stop();
        assert!(watch.delta_ms() >= 20);
        assert!(watch.rate_kibps(1 << 20) > 0);
    }

    #[test]
    fn idle_stopwatch_reports_zero_rate() {
        let watch = StopWatch::new();
        assert_eq!(watch.delta_ms(), 0);
        assert_eq!(watch.rate_kibps(4096), 0);
    }
}
