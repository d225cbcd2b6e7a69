// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-Harbor is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

use std::sync::Mutex;

use super::{devtype, BusMember, RestoreMsg};

const PIC_BLOB_BYTES: usize = 6;

/// 8259-pair interrupt controller model; its snapshot is one small chunk.
pub struct Pic {
    inner: Mutex<PicInner>,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct PicRegs {
    pub irr: u8,
    pub isr: u8,
    pub imr: u8,
}

struct PicInner {
    master: PicRegs,
    slave: PicRegs,
    save_done: bool,
}

impl Pic {
    pub fn new() -> Pic {
        Pic {
            inner: Mutex::new(PicInner {
                master: PicRegs::default(),
                slave: PicRegs::default(),
                save_done: false,
            }),
        }
    }

    pub fn regs(&self) -> (PicRegs, PicRegs) {
        let inner = self.inner.lock().unwrap();
        (inner.master, inner.slave)
    }

    pub fn set_regs(&self, master: PicRegs, slave: PicRegs) {
        let mut inner = self.inner.lock().unwrap();
        inner.master = master;
        inner.slave = slave;
    }
}

impl Default for Pic {
    fn default() -> Self {
        Self::new()
    }
}

impl BusMember<RestoreMsg> for Pic {
    fn receive(&self, msg: &mut RestoreMsg) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match msg.devtype {
            devtype::RESTART => {
                inner.save_done = false;
                if msg.write {
                    msg.bytes += PIC_BLOB_BYTES;
                }
                true
            }
            devtype::PIC if msg.write => {
                if inner.save_done {
                    return false;
                }
                msg.space.clear();
                msg.space.extend_from_slice(&[
                    inner.master.irr,
                    inner.master.isr,
                    inner.master.imr,
                    inner.slave.irr,
                    inner.slave.isr,
                    inner.slave.imr,
                ]);
                msg.bytes = msg.space.len();
                inner.save_done = true;
                true
            }
            devtype::PIC => {
                if msg.bytes < PIC_BLOB_BYTES {
                    warn!("pic restore chunk too short: {} bytes", msg.bytes);
                    return true;
                }
                let blob = &msg.space[..PIC_BLOB_BYTES];
                inner.master = PicRegs {
                    irr: blob[0],
                    isr: blob[1],
                    imr: blob[2],
                };
                inner.slave = PicRegs {
                    irr: blob[3],
                    isr: blob[4],
                    imr: blob[5],
                };
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_yields_exactly_one_chunk_per_session() {
        let pic = Pic::new();
        assert!(pic.receive(&mut RestoreMsg::restart(true)));

        let mut msg = RestoreMsg::save(devtype::PIC);
        assert!(pic.receive(&mut msg));
        assert_eq!(msg.bytes, PIC_BLOB_BYTES);
        assert!(!pic.receive(&mut RestoreMsg::save(devtype::PIC)));

        // A new RESTART opens the next session.
        assert!(pic.receive(&mut RestoreMsg::restart(true)));
        assert!(pic.receive(&mut RestoreMsg::save(devtype::PIC)));
    }

    #[test]
    fn restore_recreates_the_register_state() {
        let src = Pic::new();
        src.set_regs(
            PicRegs {
                irr: 0x11,
                isr: 0x22,
                imr: 0x44,
            },
            PicRegs {
                irr: 0x01,
                isr: 0x02,
                imr: 0x04,
            },
        );
        src.receive(&mut RestoreMsg::restart(true));
        let mut saved = RestoreMsg::save(devtype::PIC);
        assert!(src.receive(&mut saved));

        let dst = Pic::new();
        dst.receive(&mut RestoreMsg::restart(false));
        let blob = saved.space[..saved.bytes].to_vec();
        assert!(dst.receive(&mut RestoreMsg::restore(devtype::PIC, 0, 0, blob)));
        assert_eq!(dst.regs(), src.regs());
    }
}
