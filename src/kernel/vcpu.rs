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
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::utils::Rendezvous;

/// Segment/table register as the portal ABI lays it out.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Descriptor {
    pub sel: u16,
    pub ar: u16,
    pub limit: u32,
    pub base: u64,
}

/// The contiguous register sub-range that travels over the wire during
/// migration, from the message-transfer descriptor down to the IDT
/// descriptor. The portal ABI appends further fields (TSC among them) that
/// are deliberately not part of this range; the TSC is compensated
/// separately at the destination.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MigrationRegs {
    pub mtd: u64,
    pub inst_len: u64,
    pub rip: u64,
    pub rflags: u64,
    pub intr_state: u32,
    pub actv_state: u32,
    pub inj_info: u32,
    pub inj_error: u32,
    pub gpr: [u64; 8],
    pub qual: [u64; 2],
    pub ctrl: [u32; 2],
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub dr7: u64,
    pub sysenter_cs: u64,
    pub sysenter_rsp: u64,
    pub sysenter_rip: u64,
    pub es: Descriptor,
    pub cs: Descriptor,
    pub ss: Descriptor,
    pub ds: Descriptor,
    pub fs: Descriptor,
    pub gs: Descriptor,
    pub ld: Descriptor,
    pub tr: Descriptor,
    pub gd: Descriptor,
    pub id: Descriptor,
}

impl MigrationRegs {
    pub const WIRE_BYTES: usize = std::mem::size_of::<MigrationRegs>();

    pub fn zeroed() -> MigrationRegs {
        unsafe { std::mem::zeroed() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(self as *const MigrationRegs as *const u8, Self::WIRE_BYTES)
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> MigrationRegs {
        assert_eq!(bytes.len(), Self::WIRE_BYTES, "register image size");
        let mut regs = MigrationRegs::zeroed();
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                &mut regs as *mut MigrationRegs as *mut u8,
                Self::WIRE_BYTES,
            );
        }
        regs
    }
}

impl Default for MigrationRegs {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Full per-vCPU register state as held by the portal. Only the `mig`
/// sub-range is serialized for migration; the rest stays host-local.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ArchRegs {
    pub head: u64,
    pub mig: MigrationRegs,
    pub tsc_value: u64,
    pub tsc_off: i64,
}

impl ArchRegs {
    pub fn as_migration_slice(&self) -> &[u8] {
        self.mig.as_bytes()
    }

    pub fn from_migration_slice(&mut self, bytes: &[u8]) {
        self.mig = MigrationRegs::from_bytes(bytes);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VcpuState {
    Running = 0,
    Recalled = 1,
    Parked = 2,
}

/// Events delivered on a vCPU's event bus. `Resume` is the recall: it
/// forces the vCPU out of guest mode on its next opportunity.
#[derive(Clone, Copy, Debug)]
pub enum CpuEvent {
    Resume,
}

/// Messages delivered to a vCPU's executor.
#[derive(Clone, Copy, Debug)]
pub enum CpuMessage {
    AddTscOff(i64),
}

#[derive(Clone)]
pub struct Vcpu {
    shared: Arc<VcpuShared>,
}

struct VcpuShared {
    id: usize,
    inner: Mutex<VcpuInner>,
    event: Condvar,
}

struct VcpuInner {
    state: VcpuState,
    pending_recall: bool,
    regs: ArchRegs,
}

impl Vcpu {
    pub fn new(id: usize) -> Vcpu {
        Vcpu {
            shared: Arc::new(VcpuShared {
                id,
                inner: Mutex::new(VcpuInner {
                    state: VcpuState::Running,
                    pending_recall: false,
                    regs: ArchRegs::default(),
                }),
                event: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    pub fn state(&self) -> VcpuState {
        self.shared.inner.lock().unwrap().state
    }

    pub fn set_state(&self, state: VcpuState) {
        self.shared.inner.lock().unwrap().state = state;
    }

    /// Event bus entry point (per-vCPU `bus_event`).
    pub fn bus_event(&self, event: CpuEvent) {
        match event {
            CpuEvent::Resume => {
                let mut inner = self.shared.inner.lock().unwrap();
                inner.pending_recall = true;
                self.shared.event.notify_all();
            }
        }
    }

    /// Executor entry point (per-vCPU `executor`).
    pub fn executor(&self, msg: CpuMessage) {
        match msg {
            CpuMessage::AddTscOff(offset) => {
                let mut inner = self.shared.inner.lock().unwrap();
                inner.regs.tsc_off = inner.regs.tsc_off.wrapping_add(offset);
                trace!("vcpu {} tsc_off += {}", self.shared.id, offset);
            }
        }
    }

    /// Consume a pending recall, if any.
    pub fn take_recall(&self) -> bool {
        let mut inner = self.shared.inner.lock().unwrap();
        std::mem::replace(&mut inner.pending_recall, false)
    }

    /// Park the calling thread until an event arrives or `timeout` passes.
    /// Returns whether a recall is pending.
    pub fn wait_event(&self, timeout: Duration) -> bool {
        let inner = self.shared.inner.lock().unwrap();
        if inner.pending_recall {
            return true;
        }
        let (inner, _timed_out) = self.shared.event.wait_timeout(inner, timeout).unwrap();
        inner.pending_recall
    }

    pub fn with_regs<R>(&self, f: impl FnOnce(&mut ArchRegs) -> R) -> R {
        let mut inner = self.shared.inner.lock().unwrap();
        f(&mut inner.regs)
    }

    /// Copy of the wire sub-range of this vCPU's registers.
    pub fn migration_image(&self) -> MigrationRegs {
        self.shared.inner.lock().unwrap().regs.mig
    }

    pub fn load_migration_slice(&self, bytes: &[u8]) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.regs.from_migration_slice(bytes);
    }

    pub fn tsc_off(&self) -> i64 {
        self.shared.inner.lock().unwrap().regs.tsc_off
    }
}

/// Hypervisor backend of one vCPU. The migration core never looks inside;
/// it only needs `run` to return within bounded time after a recall event.
pub trait VcpuPortal: Send + Sync {
    /// Run the guest until the next exit: a recall or the end of the
    /// timeslice.
    fn run(&self, vcpu: &Vcpu);
}

/// Portal without a hypervisor backend: executes no guest instructions and
/// parks the thread until an event arrives.
pub struct IdlePortal;

impl VcpuPortal for IdlePortal {
    fn run(&self, vcpu: &Vcpu) {
        vcpu.wait_event(Duration::from_millis(10));
    }
}

/// Freeze/thaw coordinator. The driver thread stops every vCPU through
/// here before the stop-and-copy round and releases them afterwards; the
/// rendezvous provides the release/acquire edge that lets the driver read
/// the parked register images.
pub struct FreezeGate {
    should_block: AtomicBool,
    hold: Mutex<Vec<Option<MigrationRegs>>>,
    gate: Rendezvous,
}

impl FreezeGate {
    pub fn new(cpu_num: usize) -> FreezeGate {
        FreezeGate {
            should_block: AtomicBool::new(false),
            hold: Mutex::new(vec![None; cpu_num]),
            gate: Rendezvous::new(cpu_num),
        }
    }

    pub fn should_block(&self) -> bool {
        self.should_block.load(Ordering::Acquire)
    }

    /// Recall every vCPU and block until each one parked. After this
    /// returns, no vCPU executes guest code until `thaw_all`.
    pub fn freeze_all(&self, vcpus: &[Vcpu]) {
        info!("Stopping vcpus.");
        self.should_block.store(true, Ordering::SeqCst);
        for vcpu in vcpus {
            vcpu.bus_event(CpuEvent::Resume);
        }
        self.gate.wait_full();
    }

    /// Release every parked vCPU. Called on success and on error paths
    /// alike once `freeze_all` ran.
    pub fn thaw_all(&self) {
        self.should_block.store(false, Ordering::SeqCst);
        self.gate.open_gate();
    }

    /// Called on the vCPU thread after a recall exit. No-op unless a freeze
    /// is in progress; otherwise stores the register image and parks the
    /// thread until thawed.
    pub fn save_guestregs(&self, vcpu: &Vcpu) {
        if !self.should_block() {
            return;
        }
        {
            let mut hold = self.hold.lock().unwrap();
            hold[vcpu.id()] = Some(vcpu.migration_image());
        }
        vcpu.set_state(VcpuState::Parked);
        self.gate.arrive_and_wait();
        vcpu.set_state(VcpuState::Running);
    }

    /// Take the register image a parked vCPU deposited.
    pub fn take_image(&self, vcpu_id: usize) -> Option<MigrationRegs> {
        self.hold.lock().unwrap()[vcpu_id].take()
    }
}

/// Body of one vCPU thread.
pub fn vcpu_run(
    vcpu: Vcpu,
    portal: Arc<dyn VcpuPortal>,
    gate: Arc<FreezeGate>,
    shutdown: Arc<AtomicBool>,
) {
    trace!("vcpu {} enters its run loop", vcpu.id());
    while !shutdown.load(Ordering::Acquire) {
        if gate.should_block() {
            vcpu.take_recall();
            vcpu.set_state(VcpuState::Recalled);
            gate.save_guestregs(&vcpu);
            continue;
        }
        portal.run(&vcpu);
        vcpu.take_recall();
    }
    trace!("vcpu {} leaves its run loop", vcpu.id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wire_range_spans_mtd_through_idt_descriptor() {
        assert_eq!(offset_of!(MigrationRegs, mtd), 0);
        assert_eq!(
            offset_of!(MigrationRegs, id) + std::mem::size_of::<Descriptor>(),
            MigrationRegs::WIRE_BYTES
        );
        // The TSC fields live outside the wire range.
        assert!(offset_of!(ArchRegs, tsc_value) >= offset_of!(ArchRegs, mig) + MigrationRegs::WIRE_BYTES);
    }

    #[test]
    fn migration_slice_round_trips() {
        let mut regs = ArchRegs::default();
        regs.mig.rip = 0xfff0;
        regs.mig.gpr[3] = 0xdead_beef;
        regs.mig.cr3 = 0x1000;
        regs.mig.id = Descriptor {
            sel: 0,
            ar: 0x8b,
            limit: 0xfff,
            base: 0xfee0_0000,
        };
        regs.tsc_off = -5;

        let mut other = ArchRegs::default();
        other.from_migration_slice(regs.as_migration_slice());
        assert_eq!(other.mig, regs.mig);
        // TSC compensation is not part of the register image.
        assert_eq!(other.tsc_off, 0);
    }

    #[test]
    fn executor_accumulates_tsc_offsets() {
        let vcpu = Vcpu::new(0);
        vcpu.executor(CpuMessage::AddTscOff(100));
        vcpu.executor(CpuMessage::AddTscOff(-30));
        assert_eq!(vcpu.tsc_off(), 70);
    }

    #[test]
    fn freeze_parks_every_vcpu_and_thaw_releases_them() {
        let cpu_num = 3;
        let vcpus: Vec<Vcpu> = (0..cpu_num).map(Vcpu::new).collect();
        let gate = Arc::new(FreezeGate::new(cpu_num));
        let shutdown = Arc::new(AtomicBool::new(false));
        let portal: Arc<dyn VcpuPortal> = Arc::new(IdlePortal);

        let threads: Vec<_> = vcpus
            .iter()
            .map(|vcpu| {
                let vcpu = vcpu.clone();
                let portal = portal.clone();
                let gate = gate.clone();
                let shutdown = shutdown.clone();
                thread::spawn(move || vcpu_run(vcpu, portal, gate, shutdown))
            })
            .collect();

        for vcpu in &vcpus {
            vcpu.with_regs(|regs| regs.mig.gpr[0] = 0x11 * (vcpu.id() as u64 + 1));
        }

        gate.freeze_all(&vcpus);
        for vcpu in &vcpus {
            assert_eq!(vcpu.state(), VcpuState::Parked);
        }
        for vcpu in &vcpus {
            let image = gate.take_image(vcpu.id()).expect("parked image");
            assert_eq!(image.gpr[0], 0x11 * (vcpu.id() as u64 + 1));
        }

        gate.thaw_all();
        shutdown.store(true, Ordering::SeqCst);
        for vcpu in &vcpus {
            vcpu.bus_event(CpuEvent::Resume);
        }
        for t in threads {
            t.join().unwrap();
        }
        for vcpu in &vcpus {
            assert_eq!(vcpu.state(), VcpuState::Running);
        }
    }

    #[test]
    fn save_guestregs_is_a_noop_without_freeze() {
        let vcpu = Vcpu::new(0);
        let gate = FreezeGate::new(1);
        gate.save_guestregs(&vcpu);
        assert_eq!(vcpu.state(), VcpuState::Running);
        assert!(gate.take_image(0).is_none());
    }
}
