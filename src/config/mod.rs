// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-Harbor is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! Per-VM configuration. The cmdline form of an entry is what migration
//! peers exchange during negotiation, so its format is part of the
//! protocol.

use std::time::Duration;

use crate::error::{ErrorKind, Result};
use crate::kernel::migrate::Prd;
use crate::kernel::PAGE_SIZE;
use crate::utils::{byte2page, round_up};

pub const NAME_MAX_LEN: usize = 32;

const DEFAULT_FB_SIZE: usize = 0x8000;

/// What to do when the migration fails after device state already left the
/// host. Resuming locally risks running a guest whose devices were
/// snapshotted mid-flight; terminating gives the operator a clean loss.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LatePolicy {
    ResumeLocal,
    Terminate,
}

#[derive(Clone, Debug)]
pub struct MigrationConfig {
    /// Wall-clock budget per stream operation.
    pub io_timeout: Duration,
    /// Pre-copy never runs more rounds than this.
    pub max_rounds: usize,
    /// Residual dirty pages below which pre-copy moves to stop-and-copy.
    pub dirty_threshold: usize,
    /// Pipelined send window, in page-run descriptors.
    pub batch_window: usize,
    pub late_policy: LatePolicy,
    /// Keep the source VM running after a successful send.
    pub clone_semantics: bool,
    /// Exchange per-page checksums after the transfer. Widens the
    /// migration gap, off by default.
    pub verify_checksums: bool,
}

impl Default for MigrationConfig {
    fn default() -> MigrationConfig {
        MigrationConfig {
            io_timeout: Duration::from_secs(60),
            max_rounds: 32,
            dirty_threshold: 64,
            batch_window: 1000,
            late_policy: LatePolicy::ResumeLocal,
            clone_semantics: false,
            verify_checksums: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct VmConfigEntry {
    pub name: String,
    pub mem_size: usize,
    pub cpu_num: usize,
    pub fb_size: usize,
    pub migration: MigrationConfig,
}

impl VmConfigEntry {
    pub fn new(name: &str, mem_size: usize, cpu_num: usize) -> Result<VmConfigEntry> {
        if name.is_empty() || name.len() > NAME_MAX_LEN {
            return Err(ErrorKind::InvalidParam.msg("vm name length"));
        }
        if name.contains([' ', ':']) {
            return Err(ErrorKind::InvalidParam.msg("vm name must not contain spaces or colons"));
        }
        if cpu_num == 0 {
            return Err(ErrorKind::InvalidParam.msg("vm needs at least one vcpu"));
        }
        let mem_size = round_up(mem_size, PAGE_SIZE);
        if byte2page(mem_size) > Prd::BASE_PAGE_MAX as usize + 1 {
            return Err(ErrorKind::InvalidParam.msg("guest memory beyond descriptor range"));
        }
        Ok(VmConfigEntry {
            name: name.to_string(),
            mem_size,
            cpu_num,
            fb_size: DEFAULT_FB_SIZE,
            migration: MigrationConfig::default(),
        })
    }

    pub fn pages(&self) -> usize {
        self.mem_size / PAGE_SIZE
    }

    /// The negotiation form of this entry.
    pub fn to_cmdline(&self) -> String {
        format!(
            "name:{} mem:{} cpus:{}",
            self.name, self.mem_size, self.cpu_num
        )
    }

    pub fn from_cmdline(cmdline: &str) -> Result<VmConfigEntry> {
        let mut name = None;
        let mut mem_size = None;
        let mut cpu_num = None;
        for token in cmdline.split_whitespace() {
            let (key, value) = token
                .split_once(':')
                .ok_or_else(|| ErrorKind::InvalidParam.msg("malformed cmdline token"))?;
            match key {
                "name" => name = Some(value.to_string()),
                "mem" => {
                    mem_size = Some(
                        value
                            .parse::<usize>()
                            .map_err(|_| ErrorKind::InvalidParam.msg("mem size"))?,
                    )
                }
                "cpus" => {
                    cpu_num = Some(
                        value
                            .parse::<usize>()
                            .map_err(|_| ErrorKind::InvalidParam.msg("cpu count"))?,
                    )
                }
                _ => trace!("ignoring unknown cmdline key {}", key),
            }
        }
        match (name, mem_size, cpu_num) {
            (Some(name), Some(mem_size), Some(cpu_num)) => {
                VmConfigEntry::new(&name, mem_size, cpu_num)
            }
            _ => Err(ErrorKind::InvalidParam.msg("incomplete cmdline")),
        }
    }

    /// Whether a guest described by `cmdline` fits into this machine. The
    /// name is operator-local; memory size and vcpu count must match.
    pub fn compatible_with(&self, cmdline: &str) -> bool {
        match VmConfigEntry::from_cmdline(cmdline) {
            Ok(peer) => peer.mem_size == self.mem_size && peer.cpu_num == self.cpu_num,
            Err(_) => false,
        }
    }
}
