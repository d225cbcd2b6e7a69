// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-Harbor is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

#[macro_use]
extern crate log;
#[macro_use]
extern crate memoffset;

pub mod config;
pub mod device;
pub mod kernel;
pub mod utils;
pub mod vmm;

mod error;

pub use error::{Error, ErrorKind, Result};

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub fn print_built_info() {
    println!(
        "Welcome to {} {}!",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );
    println!(
        "Built at {build_time} by {hostname}\nCompiler: {rustc_version}\nCommit: {commit_hash}",
        build_time = env!("BUILD_TIME"),
        hostname = env!("HOSTNAME"),
        commit_hash = env!("GIT_COMMIT"),
        rustc_version = built_info::RUSTC_VERSION,
    );
}
