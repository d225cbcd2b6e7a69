// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-Harbor is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

use std::sync::atomic::{AtomicBool, Ordering};

use super::{devtype, BusMember, RestoreMsg};

/// Bridge for pass-through PCI devices. Their state cannot travel with the
/// guest; they detach before the memory rounds start and reattach on the
/// destination.
pub struct PassthroughBridge {
    plugged: AtomicBool,
}

impl PassthroughBridge {
    pub fn new() -> PassthroughBridge {
        PassthroughBridge {
            plugged: AtomicBool::new(true),
        }
    }

    pub fn plugged(&self) -> bool {
        self.plugged.load(Ordering::Acquire)
    }
}

impl Default for PassthroughBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl BusMember<RestoreMsg> for PassthroughBridge {
    fn receive(&self, msg: &mut RestoreMsg) -> bool {
        if msg.devtype != devtype::PCI_PLUG {
            return false;
        }
        if msg.write {
            info!("replugging pass-through devices");
        } else {
            info!("unplugging pass-through devices");
        }
        self.plugged.store(msg.write, Ordering::Release);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plug_state_follows_the_bus() {
        let bridge = PassthroughBridge::new();
        assert!(bridge.plugged());

        assert!(bridge.receive(&mut RestoreMsg::pci_plug(false)));
        assert!(!bridge.plugged());

        assert!(bridge.receive(&mut RestoreMsg::pci_plug(true)));
        assert!(bridge.plugged());
    }

    #[test]
    fn snapshot_messages_are_ignored() {
        let bridge = PassthroughBridge::new();
        assert!(!bridge.receive(&mut RestoreMsg::restart(true)));
        assert!(!bridge.receive(&mut RestoreMsg::save(devtype::NIC)));
    }
}
