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

pub const VGA_TEXT_COLS: usize = 80;
pub const VGA_TEXT_ROWS: usize = 25;
pub const VGA_VIDEOMODE_TEXT: usize = 3;

const REGS_BLOB_BYTES: usize = 16;

/// Display adapter model. Snapshots travel in two chunks: the register
/// block first, then text plane and framebuffer together, so the receiver
/// can program the mode before pixel data lands.
pub struct Vga {
    inner: Mutex<VgaInner>,
}

struct VgaInner {
    videomode: usize,
    cursor_row: usize,
    text: Vec<u8>,
    fb: Vec<u8>,
    save_cursor: usize,
    restore_cursor: usize,
}

impl Vga {
    pub fn new(fb_size: usize) -> Vga {
        Vga {
            inner: Mutex::new(VgaInner {
                videomode: VGA_VIDEOMODE_TEXT,
                cursor_row: 0,
                text: vec![b' '; VGA_TEXT_COLS * VGA_TEXT_ROWS],
                fb: vec![0; fb_size],
                save_cursor: 0,
                restore_cursor: 0,
            }),
        }
    }

    pub fn videomode(&self) -> usize {
        self.inner.lock().unwrap().videomode
    }

    /// One text row, trimmed; diagnostic/test access.
    pub fn text_row(&self, row: usize) -> String {
        let inner = self.inner.lock().unwrap();
        let line = &inner.text[row * VGA_TEXT_COLS..(row + 1) * VGA_TEXT_COLS];
        String::from_utf8_lossy(line).trim_end().to_string()
    }

    pub fn write_fb(&self, offset: usize, bytes: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.fb[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn fb_snapshot(&self) -> Vec<u8> {
        self.inner.lock().unwrap().fb.clone()
    }

    fn regs_blob(inner: &VgaInner) -> [u8; REGS_BLOB_BYTES] {
        let mut blob = [0u8; REGS_BLOB_BYTES];
        blob[0..8].copy_from_slice(&(inner.videomode as u64).to_le_bytes());
        blob[8..16].copy_from_slice(&(inner.cursor_row as u64).to_le_bytes());
        blob
    }

    fn load_regs_blob(inner: &mut VgaInner, blob: &[u8]) {
        if blob.len() < REGS_BLOB_BYTES {
            warn!("vga register chunk too short: {} bytes", blob.len());
            return;
        }
        inner.videomode = u64::from_le_bytes(blob[0..8].try_into().unwrap()) as usize;
        inner.cursor_row = u64::from_le_bytes(blob[8..16].try_into().unwrap()) as usize % VGA_TEXT_ROWS;
    }

    fn display(inner: &mut VgaInner, text: &[u8], reset: bool) {
        if reset {
            inner.text.fill(b' ');
            inner.cursor_row = 0;
        }
        let row = inner.cursor_row;
        // Whatever the caller sends, at most one text row is used.
        let line = &text[..text.len().min(VGA_TEXT_COLS)];
        let dst = &mut inner.text[row * VGA_TEXT_COLS..row * VGA_TEXT_COLS + line.len()];
        dst.copy_from_slice(line);
        inner.cursor_row = (row + 1) % VGA_TEXT_ROWS;
    }
}

impl BusMember<RestoreMsg> for Vga {
    fn receive(&self, msg: &mut RestoreMsg) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match msg.devtype {
            devtype::RESTART => {
                inner.save_cursor = 0;
                inner.restore_cursor = 0;
                if msg.write {
                    msg.bytes += REGS_BLOB_BYTES + inner.text.len() + inner.fb.len();
                }
                true
            }
            devtype::VGA if msg.write => match inner.save_cursor {
                0 => {
                    msg.space.clear();
                    msg.space.extend_from_slice(&Vga::regs_blob(&inner));
                    msg.bytes = msg.space.len();
                    msg.id1 = 0;
                    inner.save_cursor = 1;
                    true
                }
                1 => {
                    msg.space.clear();
                    msg.space.extend_from_slice(&inner.text);
                    msg.space.extend_from_slice(&inner.fb);
                    msg.bytes = msg.space.len();
                    msg.id1 = 1;
                    inner.save_cursor = 2;
                    true
                }
                _ => false,
            },
            devtype::VGA => {
                match inner.restore_cursor {
                    0 => Vga::load_regs_blob(&mut inner, &msg.space[..msg.bytes]),
                    1 => {
                        let blob = &msg.space[..msg.bytes];
                        let text_len = inner.text.len().min(blob.len());
                        inner.text[..text_len].copy_from_slice(&blob[..text_len]);
                        let fb_len = inner.fb.len().min(blob.len() - text_len);
                        inner.fb[..fb_len].copy_from_slice(&blob[text_len..text_len + fb_len]);
                    }
                    _ => return false,
                }
                inner.restore_cursor += 1;
                true
            }
            devtype::VGA_VIDEOMODE => {
                if msg.write {
                    debug!("vga: switching to videomode {}", msg.bytes);
                    inner.videomode = msg.bytes;
                } else {
                    msg.bytes = inner.videomode;
                }
                true
            }
            devtype::VGA_DISPLAY_GUEST => {
                let text = std::mem::take(&mut msg.space);
                Vga::display(&mut inner, &text[..msg.bytes.min(text.len())], msg.write);
                true
            }
            _ => false,
        }
    }
}
