// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-Harbor is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

use std::sync::Arc;

/// A device attached to a typed broadcast bus. Returning `true` claims the
/// message for dispatch policies that care.
pub trait BusMember<M>: Send + Sync {
    fn receive(&self, msg: &mut M) -> bool;
}

/// In-process typed broadcast channel. Registration order is fixed at
/// machine assembly time; the per-send dispatch policy decides how the
/// member list is walked.
pub struct Bus<M> {
    list: Vec<Arc<dyn BusMember<M>>>,
}

impl<M> Bus<M> {
    pub fn new() -> Bus<M> {
        Bus { list: Vec::new() }
    }

    pub fn add(&mut self, member: Arc<dyn BusMember<M>>) {
        self.list.push(member);
    }

    pub fn count(&self) -> usize {
        self.list.len()
    }

    /// LIFO broadcast; with `earlyout` the walk stops at the first member
    /// that claims the message.
    pub fn send(&self, msg: &mut M, earlyout: bool) -> bool {
        let mut res = false;
        for member in self.list.iter().rev() {
            res |= member.receive(msg);
            if earlyout && res {
                break;
            }
        }
        res
    }

    /// Broadcast in registration order to every member.
    pub fn send_fifo(&self, msg: &mut M) -> bool {
        let mut res = false;
        for member in self.list.iter() {
            res |= member.receive(msg);
        }
        res
    }

    /// First-hit round robin; `start` rotates to the member after the one
    /// that claimed the message.
    pub fn send_rr(&self, msg: &mut M, start: &mut usize) -> bool {
        let count = self.list.len();
        for i in 0..count {
            let slot = (i + *start) % count;
            if self.list[slot].receive(msg) {
                *start = (slot + 1) % count;
                return true;
            }
        }
        false
    }
}

impl<M> Default for Bus<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        tag: usize,
        claim: bool,
        log: Arc<Mutex<Vec<usize>>>,
    }

    impl BusMember<u32> for Recorder {
        fn receive(&self, msg: &mut u32) -> bool {
            self.log.lock().unwrap().push(self.tag);
            *msg += 1;
            self.claim
        }
    }

    fn bus_with(claims: &[bool]) -> (Bus<u32>, Arc<Mutex<Vec<usize>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = Bus::new();
        for (tag, &claim) in claims.iter().enumerate() {
            bus.add(Arc::new(Recorder {
                tag,
                claim,
                log: log.clone(),
            }));
        }
        (bus, log)
    }

    #[test]
    fn send_walks_lifo_and_fifo_walks_forward() {
        let (bus, log) = bus_with(&[false, false, false]);
        let mut msg = 0;
        assert!(!bus.send(&mut msg, false));
        assert_eq!(*log.lock().unwrap(), vec![2, 1, 0]);
        assert_eq!(msg, 3);

        log.lock().unwrap().clear();
        bus.send_fifo(&mut msg);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn earlyout_stops_at_the_first_claim() {
        let (bus, log) = bus_with(&[false, true, false]);
        let mut msg = 0;
        assert!(bus.send(&mut msg, true));
        // LIFO: member 2 declines, member 1 claims, member 0 never sees it.
        assert_eq!(*log.lock().unwrap(), vec![2, 1]);
    }

    #[test]
    fn round_robin_rotates_past_the_claimer() {
        let (bus, log) = bus_with(&[true, true, true]);
        let mut start = 0;
        let mut msg = 0;
        assert!(bus.send_rr(&mut msg, &mut start));
        assert_eq!(start, 1);
        assert!(bus.send_rr(&mut msg, &mut start));
        assert_eq!(start, 2);
        assert!(bus.send_rr(&mut msg, &mut start));
        assert_eq!(start, 0);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn empty_bus_accepts_nothing() {
        let bus: Bus<u32> = Bus::new();
        let mut start = 0;
        let mut msg = 0;
        assert!(!bus.send(&mut msg, true));
        assert!(!bus.send_fifo(&mut msg));
        assert!(!bus.send_rr(&mut msg, &mut start));
    }
}
