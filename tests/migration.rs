// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-Harbor is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! End-to-end migration over loopback: two machines in one process, one
//! sending, one retrieving.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rust_harbor::config::VmConfigEntry;
use rust_harbor::device::PicRegs;
use rust_harbor::kernel::migrate::{
    Migration, MigrationAnswer, MigrationInit, Prd, PING_WORD,
};
use rust_harbor::kernel::{DirtyOracle, Vcpu, VcpuState, PAGE_SIZE};
use rust_harbor::vmm::{vmm_boot_vm, vmm_init, vmm_init_with_oracle, Motherboard, VmHandle};
use rust_harbor::ErrorKind;

fn loopback() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn test_config(name: &str, mem_size: usize, cpu_num: usize) -> VmConfigEntry {
    let mut config = VmConfigEntry::new(name, mem_size, cpu_num).unwrap();
    config.migration.io_timeout = Duration::from_secs(10);
    config
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// The receiver thread needs a moment to bind its rendezvous port; retry
/// plain connection refusals, nothing else.
fn send_with_retry(migration: &mut Migration, port: u16) -> rust_harbor::Result<()> {
    for _ in 0..100 {
        match migration.send(loopback(), port) {
            Err(e) if e.kind() == ErrorKind::Transport && e.phase() == Some("negotiate") => {
                thread::sleep(Duration::from_millis(50));
            }
            other => return other,
        }
    }
    panic!("receiver never came up");
}

/// Thawed vcpus leave the gate asynchronously; give them a moment before
/// asserting on their state.
fn wait_for_state(vcpu: &Vcpu, want: VcpuState) {
    for _ in 0..500 {
        if vcpu.state() == want {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("vcpu {} never reached {:?}", vcpu.id(), want);
}

fn fill_guest_pattern(mb: &Motherboard) {
    for page in 0..mb.guest_mem.pages() {
        let value = (page as u8) ^ 0xa5;
        mb.guest_mem.slice_mut(page * PAGE_SIZE, PAGE_SIZE).fill(value);
    }
}

fn guest_images_match(src: &Motherboard, dst: &Motherboard) -> bool {
    src.guest_mem.slice(0, src.guest_mem.size()) == dst.guest_mem.slice(0, dst.guest_mem.size())
}

struct Machines {
    mb: Arc<Motherboard>,
    handle: VmHandle,
}

fn boot(mb: Arc<Motherboard>) -> Machines {
    let handle = vmm_boot_vm(&mb);
    Machines { mb, handle }
}

#[test]
fn happy_path_moves_memory_devices_and_clock() {
    let src = boot(vmm_init(test_config("src", 4 << 20, 1)).unwrap());
    let dst = boot(vmm_init(test_config("dst", 4 << 20, 1)).unwrap());

    fill_guest_pattern(&src.mb);
    src.mb.vga.write_fb(16, &[0xcd; 100]);
    src.mb.pic.set_regs(
        PicRegs {
            irr: 0x21,
            isr: 0x42,
            imr: 0x84,
        },
        PicRegs {
            irr: 0x12,
            isr: 0x24,
            imr: 0x48,
        },
    );
    src.mb.vcpus[0].with_regs(|regs| {
        regs.mig.rip = 0x1000;
        regs.mig.gpr[0] = 0x1234_5678;
    });

    let port = free_port();
    let receiver = {
        let mb = dst.mb.clone();
        thread::spawn(move || Migration::new(mb).unwrap().listen(port))
    };

    let mut migration = Migration::new(src.mb.clone()).unwrap();
    send_with_retry(&mut migration, port).expect("send side");
    receiver.join().unwrap().expect("receive side");

    // Guest-physical memory arrived byte for byte.
    assert!(guest_images_match(&src.mb, &dst.mb));

    // Device state arrived through the restore bus.
    assert_eq!(dst.mb.pic.regs(), src.mb.pic.regs());
    assert_eq!(dst.mb.vga.fb_snapshot(), src.mb.vga.fb_snapshot());
    // The sender's (blank) text plane replaced the waiting banner.
    assert_eq!(dst.mb.vga.text_row(0), "");

    // The parked register image landed in the destination vcpu.
    assert_eq!(dst.mb.vcpus[0].with_regs(|regs| regs.mig.rip), 0x1000);
    assert_eq!(
        dst.mb.vcpus[0].with_regs(|regs| regs.mig.gpr[0]),
        0x1234_5678
    );

    // The guest clock was compensated.
    assert_ne!(dst.mb.vcpus[0].tsc_off(), 0);

    // Source stays frozen with its pass-through devices detached; the
    // destination runs with them attached.
    assert_eq!(src.mb.vcpus[0].state(), VcpuState::Parked);
    assert!(!src.mb.pci_bridge.plugged());
    wait_for_state(&dst.mb.vcpus[0], VcpuState::Running);
    assert!(dst.mb.pci_bridge.plugged());

    src.handle.stop();
    dst.handle.stop();
}

#[test]
fn multi_vcpu_images_arrive_in_order() {
    let src = boot(vmm_init(test_config("src", 1 << 20, 3)).unwrap());
    let dst = boot(vmm_init(test_config("dst", 1 << 20, 3)).unwrap());

    for vcpu in &src.mb.vcpus {
        let tag = 0x100 + vcpu.id() as u64;
        vcpu.with_regs(|regs| regs.mig.gpr[7] = tag);
    }

    let port = free_port();
    let receiver = {
        let mb = dst.mb.clone();
        thread::spawn(move || Migration::new(mb).unwrap().listen(port))
    };
    send_with_retry(&mut Migration::new(src.mb.clone()).unwrap(), port).unwrap();
    receiver.join().unwrap().unwrap();

    for vcpu in &dst.mb.vcpus {
        assert_eq!(
            vcpu.with_regs(|regs| regs.mig.gpr[7]),
            0x100 + vcpu.id() as u64
        );
        wait_for_state(vcpu, VcpuState::Running);
    }

    src.handle.stop();
    dst.handle.stop();
}

/// Oracle scripted from a fixed set of dirty reports; once drained it goes
/// silent like an idle guest.
struct ScriptedOracle {
    runs: Mutex<VecDeque<Prd>>,
}

impl ScriptedOracle {
    fn new(runs: Vec<Prd>) -> ScriptedOracle {
        ScriptedOracle {
            runs: Mutex::new(runs.into()),
        }
    }
}

impl DirtyOracle for ScriptedOracle {
    fn next_dirty_page(&self) -> Prd {
        self.runs.lock().unwrap().pop_front().unwrap_or(Prd::EMPTY)
    }
}

#[test]
fn scattered_pages_survive_the_round_cap() {
    let mem_size = 2 << 20; // 512 pages
    let pages = mem_size / PAGE_SIZE;

    // Every other page dirty: only order-0 runs, so the small batch window
    // below forces many rounds and the round cap has to fire.
    let scattered: Vec<Prd> = (0..pages)
        .step_by(2)
        .map(|page| Prd::largest_aligned_run(page, 1))
        .collect();
    let dirty_count = scattered.len();

    let mut src_config = test_config("src", mem_size, 1);
    src_config.migration.batch_window = 4;
    src_config.migration.max_rounds = 8;
    src_config.migration.dirty_threshold = 0;

    let src = boot(
        vmm_init_with_oracle(src_config, Arc::new(ScriptedOracle::new(scattered))).unwrap(),
    );
    let dst = boot(vmm_init(test_config("dst", mem_size, 1)).unwrap());

    fill_guest_pattern(&src.mb);

    let port = free_port();
    let receiver = {
        let mb = dst.mb.clone();
        thread::spawn(move || Migration::new(mb).unwrap().listen(port))
    };
    send_with_retry(&mut Migration::new(src.mb.clone()).unwrap(), port).unwrap();
    receiver.join().unwrap().unwrap();

    // Exactly the dirty pages arrived; the untouched ones stayed zero on
    // the destination.
    for page in 0..pages {
        let dst_page = dst.mb.guest_mem.slice(page * PAGE_SIZE, PAGE_SIZE);
        if page % 2 == 0 {
            assert_eq!(dst_page, src.mb.guest_mem.slice(page * PAGE_SIZE, PAGE_SIZE));
        } else {
            assert!(dst_page.iter().all(|&b| b == 0), "page {} not zero", page);
        }
    }
    assert!(dirty_count > 0);

    src.handle.stop();
    dst.handle.stop();
}

#[test]
fn empty_guest_completes_with_zero_data_pages() {
    let src = boot(vmm_init(test_config("src", 0, 1)).unwrap());
    let dst = boot(vmm_init(test_config("dst", 0, 1)).unwrap());

    let port = free_port();
    let receiver = {
        let mb = dst.mb.clone();
        thread::spawn(move || Migration::new(mb).unwrap().listen(port))
    };
    send_with_retry(&mut Migration::new(src.mb.clone()).unwrap(), port).unwrap();
    receiver.join().unwrap().unwrap();

    assert_eq!(dst.mb.guest_mem.pages(), 0);
    wait_for_state(&dst.mb.vcpus[0], VcpuState::Running);

    src.handle.stop();
    dst.handle.stop();
}

#[test]
fn config_mismatch_aborts_and_the_source_survives() {
    let src = boot(vmm_init(test_config("src", 4 << 20, 1)).unwrap());
    // Different memory size: the listener must refuse the guest.
    let dst = boot(vmm_init(test_config("dst", 8 << 20, 1)).unwrap());

    let port = free_port();
    let receiver = {
        let mb = dst.mb.clone();
        thread::spawn(move || Migration::new(mb).unwrap().listen(port))
    };

    let err = send_with_retry(&mut Migration::new(src.mb.clone()).unwrap(), port).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigMismatch);

    let recv_err = receiver.join().unwrap().unwrap_err();
    assert_eq!(recv_err.kind(), ErrorKind::ConfigMismatch);

    // The source VM keeps running; it was never frozen.
    assert_eq!(src.mb.vcpus[0].state(), VcpuState::Running);

    src.handle.stop();
    dst.handle.stop();
}

#[test]
fn corrupted_pong_fails_the_ping_and_the_source_resumes() {
    let src = boot(vmm_init(test_config("src", 1 << 20, 1)).unwrap());

    // A fake listener that negotiates correctly but answers the ping with
    // the wrong multiple.
    let rendezvous = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = rendezvous.local_addr().unwrap().port();
    let fake = thread::spawn(move || {
        let (mut ctrl, _) = rendezvous.accept().unwrap();
        let mut init = [0u8; MigrationInit::WIRE_BYTES];
        ctrl.read_exact(&mut init).unwrap();
        let init = MigrationInit::from_wire(&init);
        assert!(init.check_magic());
        let mut cmdline_buf = vec![0u8; init.cmdlen as usize];
        ctrl.read_exact(&mut cmdline_buf).unwrap();

        let data_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let answer = MigrationAnswer::accept(data_listener.local_addr().unwrap().port());
        ctrl.write_all(&answer.to_wire()).unwrap();
        drop(ctrl);

        let (mut data, _) = data_listener.accept().unwrap();
        let mut ping = [0u8; 8];
        data.read_exact(&mut ping).unwrap();
        assert_eq!(u64::from_le_bytes(ping), PING_WORD);
        // Wrong pong: 2x instead of 3x.
        data.write_all(&(PING_WORD * 2).to_le_bytes()).unwrap();
        // Hold the socket open until the sender had a chance to fail.
        let mut rest = Vec::new();
        let _ = data.read_to_end(&mut rest);
    });

    let err = send_with_retry(&mut Migration::new(src.mb.clone()).unwrap(), port).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Desync);
    assert_eq!(err.phase(), Some("negotiate"));
    fake.join().unwrap();

    // Thaw path ran; the source VM keeps executing.
    assert_eq!(src.mb.vcpus[0].state(), VcpuState::Running);

    src.handle.stop();
}

#[test]
fn corrupted_header_is_fatal_for_the_receiver() {
    let dst = boot(vmm_init(test_config("dst", 1 << 20, 1)).unwrap());
    let cmdline = dst.mb.config.to_cmdline();

    let port = free_port();
    let receiver = {
        let mb = dst.mb.clone();
        thread::spawn(move || Migration::new(mb).unwrap().listen(port))
    };

    // Fake sender: valid negotiation and ping, then a header with a broken
    // magic word.
    let mut ctrl = loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => break stream,
            Err(_) => thread::sleep(Duration::from_millis(50)),
        }
    };
    ctrl.write_all(&MigrationInit::new(cmdline.len()).to_wire())
        .unwrap();
    ctrl.write_all(cmdline.as_bytes()).unwrap();
    let mut answer = [0u8; MigrationAnswer::WIRE_BYTES];
    ctrl.read_exact(&mut answer).unwrap();
    let answer = MigrationAnswer::from_wire(&answer);
    assert!(answer.check_magic());
    assert_eq!(answer.success, 1);
    drop(ctrl);

    let mut data = TcpStream::connect(("127.0.0.1", answer.port as u16)).unwrap();
    data.write_all(&PING_WORD.to_le_bytes()).unwrap();
    let mut pong = [0u8; 8];
    data.read_exact(&mut pong).unwrap();
    assert_eq!(u64::from_le_bytes(pong), 3 * PING_WORD);

    data.write_all(&[0u8; 24]).unwrap(); // header with zero magic

    // The partially restored machine is destroyed: the receiver panics.
    assert!(receiver.join().is_err());

    dst.handle.stop();
}
