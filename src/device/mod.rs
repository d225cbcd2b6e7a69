// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-Harbor is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! Emulated device models and the broadcast buses connecting them to the
//! monitor.

pub use self::bus::*;
pub use self::pci::*;
pub use self::pic::*;
pub use self::vga::*;

mod bus;
mod pci;
mod pic;
mod vga;

use crate::kernel::migrate::Prd;

/// Device type tags multiplexed over the restore bus and the device section
/// of the migration stream. Tags in `RESTART+1..LAST` are iterated during a
/// device save; the tags above `LAST` never appear on the wire.
pub mod devtype {
    pub const RESTART: u16 = 0;
    pub const TIMEOUTS: u16 = 1;
    pub const PIC: u16 = 2;
    pub const LAPIC: u16 = 3;
    pub const PIT: u16 = 4;
    pub const VGA: u16 = 5;
    pub const NIC: u16 = 6;
    pub const ACPI: u16 = 7;
    pub const VCPU: u16 = 8;
    pub const LAST: u16 = 9;

    pub const VGA_DISPLAY_GUEST: u16 = 10;
    pub const VGA_VIDEOMODE: u16 = 11;
    pub const PCI_PLUG: u16 = 12;

    /// Terminates the device section of the stream.
    pub const END: u16 = 0xdead;
}

/// Message on the restore bus. One shape carries three commands: RESTART
/// (cursor reset), SAVE (`write` set, device fills `space` chunk by chunk
/// until it returns false) and RESTORE (`write` clear, device consumes
/// exactly `bytes` from `space`).
pub struct RestoreMsg {
    pub devtype: u16,
    pub bytes: usize,
    pub id1: u32,
    pub id2: u32,
    pub write: bool,
    pub space: Vec<u8>,
}

impl RestoreMsg {
    pub fn restart(write: bool) -> RestoreMsg {
        RestoreMsg {
            devtype: devtype::RESTART,
            bytes: 0,
            id1: 0,
            id2: 0,
            write,
            space: Vec::new(),
        }
    }

    pub fn save(devtype: u16) -> RestoreMsg {
        RestoreMsg {
            devtype,
            bytes: 0,
            id1: 0,
            id2: 0,
            write: true,
            space: Vec::new(),
        }
    }

    pub fn restore(devtype: u16, id1: u32, id2: u32, blob: Vec<u8>) -> RestoreMsg {
        RestoreMsg {
            devtype,
            bytes: blob.len(),
            id1,
            id2,
            write: false,
            space: blob,
        }
    }

    /// Put a status line onto the guest screen; `reset` clears it first.
    pub fn display_guest(text: &str, reset: bool) -> RestoreMsg {
        RestoreMsg {
            devtype: devtype::VGA_DISPLAY_GUEST,
            bytes: text.len(),
            id1: 0,
            id2: 0,
            write: reset,
            space: text.as_bytes().to_vec(),
        }
    }

    pub fn videomode_query() -> RestoreMsg {
        RestoreMsg {
            devtype: devtype::VGA_VIDEOMODE,
            bytes: 0,
            id1: 0,
            id2: 0,
            write: false,
            space: Vec::new(),
        }
    }

    pub fn videomode_set(mode: usize) -> RestoreMsg {
        RestoreMsg {
            devtype: devtype::VGA_VIDEOMODE,
            bytes: mode,
            id1: 0,
            id2: 0,
            write: true,
            space: Vec::new(),
        }
    }

    /// Pass-through devices unplug (`plug` false) before migration and
    /// replug afterwards.
    pub fn pci_plug(plug: bool) -> RestoreMsg {
        RestoreMsg {
            devtype: devtype::PCI_PLUG,
            bytes: 0,
            id1: 0,
            id2: 0,
            write: plug,
            space: Vec::new(),
        }
    }
}

/// Requests to the host backing the machine.
pub enum HostOpMsg {
    /// Resolved to the `(host_ptr, byte_len)` of the guest-physical window.
    GuestMem { ptr: *mut u8, len: usize },
    /// Resolved to the next page run the host considers dirty.
    NextDirtyPage { prd: Prd },
    /// Resolved to the configuration cmdline of this machine.
    ConfigString { cmdline: String },
}

impl HostOpMsg {
    pub fn guest_mem() -> HostOpMsg {
        HostOpMsg::GuestMem {
            ptr: std::ptr::null_mut(),
            len: 0,
        }
    }

    pub fn next_dirty_page() -> HostOpMsg {
        HostOpMsg::NextDirtyPage { prd: Prd::EMPTY }
    }

    pub fn config_string() -> HostOpMsg {
        HostOpMsg::ConfigString {
            cmdline: String::new(),
        }
    }
}
