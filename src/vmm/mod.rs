// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-Harbor is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! Machine assembly: the motherboard with its broadcast channels, the host
//! bridge answering hostop requests, and vCPU thread management.

pub use self::init::*;

mod init;

use std::sync::Arc;

use crate::config::VmConfigEntry;
use crate::device::{Bus, BusMember, HostOpMsg, PassthroughBridge, Pic, RestoreMsg, Vga};
use crate::kernel::{DirtyOracle, FreezeGate, GuestMem, Vcpu};

/// One virtual machine: its buses, devices, vCPUs and memory. Handed around
/// as an immutable `Arc`; channel membership is fixed at assembly time.
pub struct Motherboard {
    pub bus_hostop: Bus<HostOpMsg>,
    pub bus_restore: Bus<RestoreMsg>,
    pub vcpus: Vec<Vcpu>,
    pub guest_mem: Arc<GuestMem>,
    pub freeze_gate: Arc<FreezeGate>,
    pub vga: Arc<Vga>,
    pub pic: Arc<Pic>,
    pub pci_bridge: Arc<PassthroughBridge>,
    pub config: VmConfigEntry,
}

/// Host backend wired onto the hostop bus: resolves the guest memory
/// window, the dirty-page oracle, and the config string.
pub(crate) struct HostBridge {
    pub mem: Arc<GuestMem>,
    pub oracle: Arc<dyn DirtyOracle>,
    pub cmdline: String,
}

impl BusMember<HostOpMsg> for HostBridge {
    fn receive(&self, msg: &mut HostOpMsg) -> bool {
        match msg {
            HostOpMsg::GuestMem { ptr, len } => {
                *ptr = self.mem.host_ptr();
                *len = self.mem.size();
                true
            }
            HostOpMsg::NextDirtyPage { prd } => {
                *prd = self.oracle.next_dirty_page();
                true
            }
            HostOpMsg::ConfigString { cmdline } => {
                *cmdline = self.cmdline.clone();
                true
            }
        }
    }
}
