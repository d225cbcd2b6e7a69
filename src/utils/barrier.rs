// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-Harbor is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

use std::sync::{Condvar, Mutex};

/// Multi-producer rendezvous: a coordinator waits until `n` producers have
/// arrived, then releases them all at once. One cycle at a time; a producer
/// arriving while the previous cycle is still draining blocks until the
/// drain finished.
pub struct Rendezvous {
    n: usize,
    inner: Mutex<RendezvousInner>,
    arrived: Condvar,
    released: Condvar,
}

struct RendezvousInner {
    arrived: usize,
    epoch: usize,
    draining: bool,
}

impl Rendezvous {
    pub fn new(n: usize) -> Rendezvous {
        Rendezvous {
            n,
            inner: Mutex::new(RendezvousInner {
                arrived: 0,
                epoch: 0,
                draining: false,
            }),
            arrived: Condvar::new(),
            released: Condvar::new(),
        }
    }

    /// Producer side: check in and block until the coordinator opens the gate.
    pub fn arrive_and_wait(&self) {
        let mut guard = self.inner.lock().unwrap();
        while guard.draining {
            guard = self.released.wait(guard).unwrap();
        }
        guard.arrived += 1;
        if guard.arrived >= self.n {
            self.arrived.notify_all();
        }
        let epoch = guard.epoch;
        while guard.epoch == epoch {
            guard = self.released.wait(guard).unwrap();
        }
        guard.arrived -= 1;
        if guard.arrived == 0 {
            guard.draining = false;
            self.released.notify_all();
        }
    }

    /// Coordinator side: block until all `n` producers checked in.
    pub fn wait_full(&self) {
        let mut guard = self.inner.lock().unwrap();
        while guard.arrived < self.n {
            guard = self.arrived.wait(guard).unwrap();
        }
    }

    /// Coordinator side: release every parked producer.
    pub fn open_gate(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.epoch = guard.epoch.wrapping_add(1);
        guard.draining = guard.arrived > 0;
        self.released.notify_all();
    }

    pub fn arrived(&self) -> usize {
        self.inner.lock().unwrap().arrived
    }
}
