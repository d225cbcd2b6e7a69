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
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::config::VmConfigEntry;
use crate::device::{Bus, PassthroughBridge, Pic, Vga};
use crate::error::Result;
use crate::kernel::{
    vcpu_run, CpuEvent, DirtyOracle, FreezeGate, GuestMem, IdlePortal, InitialSweepOracle, Vcpu,
    VcpuPortal,
};

use super::{HostBridge, Motherboard};

/// Build a machine with the default dirty-page oracle: a one-shot full
/// sweep, which is what an initial transfer needs.
pub fn vmm_init(config: VmConfigEntry) -> Result<Arc<Motherboard>> {
    let guest_mem = Arc::new(GuestMem::new(config.mem_size)?);
    let oracle = Arc::new(InitialSweepOracle::new(guest_mem.pages()));
    vmm_assemble(config, guest_mem, oracle)
}

/// Build a machine around a caller-provided dirty-page oracle.
pub fn vmm_init_with_oracle(
    config: VmConfigEntry,
    oracle: Arc<dyn DirtyOracle>,
) -> Result<Arc<Motherboard>> {
    let guest_mem = Arc::new(GuestMem::new(config.mem_size)?);
    vmm_assemble(config, guest_mem, oracle)
}

fn vmm_assemble(
    config: VmConfigEntry,
    guest_mem: Arc<GuestMem>,
    oracle: Arc<dyn DirtyOracle>,
) -> Result<Arc<Motherboard>> {
    info!(
        "assembling VM[{}]: {} MB, {} vcpus",
        config.name,
        config.mem_size >> 20,
        config.cpu_num
    );

    let vga = Arc::new(Vga::new(config.fb_size));
    let pic = Arc::new(Pic::new());
    let pci_bridge = Arc::new(PassthroughBridge::new());

    // Restore-bus registration order is part of the machine's identity:
    // sender and receiver walk devices in the same order within a session.
    let mut bus_restore = Bus::new();
    bus_restore.add(vga.clone());
    bus_restore.add(pic.clone());
    bus_restore.add(pci_bridge.clone());

    let mut bus_hostop = Bus::new();
    bus_hostop.add(Arc::new(HostBridge {
        mem: guest_mem.clone(),
        oracle,
        cmdline: config.to_cmdline(),
    }));

    let vcpus: Vec<Vcpu> = (0..config.cpu_num).map(Vcpu::new).collect();
    let freeze_gate = Arc::new(FreezeGate::new(config.cpu_num));

    Ok(Arc::new(Motherboard {
        bus_hostop,
        bus_restore,
        vcpus,
        guest_mem,
        freeze_gate,
        vga,
        pic,
        pci_bridge,
        config,
    }))
}

/// Running vCPU threads of one machine.
pub struct VmHandle {
    mb: Arc<Motherboard>,
    threads: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

/// Spawn one host thread per vCPU, all driven by the given portal.
pub fn vmm_spawn_vcpus(mb: &Arc<Motherboard>, portal: Arc<dyn VcpuPortal>) -> VmHandle {
    let shutdown = Arc::new(AtomicBool::new(false));
    let threads = mb
        .vcpus
        .iter()
        .map(|vcpu| {
            let vcpu = vcpu.clone();
            let portal = portal.clone();
            let gate = mb.freeze_gate.clone();
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name(format!("vcpu{}", vcpu.id()))
                .spawn(move || vcpu_run(vcpu, portal, gate, shutdown))
                .expect("spawning a vcpu thread")
        })
        .collect();
    VmHandle {
        mb: mb.clone(),
        threads,
        shutdown,
    }
}

/// Spawn the machine's vCPUs on the no-op portal.
pub fn vmm_boot_vm(mb: &Arc<Motherboard>) -> VmHandle {
    vmm_spawn_vcpus(mb, Arc::new(IdlePortal))
}

impl VmHandle {
    /// Tear the vCPU threads down, releasing any that are still parked.
    pub fn stop(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.mb.freeze_gate.thaw_all();
        for vcpu in &self.mb.vcpus {
            vcpu.bus_event(CpuEvent::Resume);
        }
        for thread in self.threads {
            let _ = thread.join();
        }
    }
}
