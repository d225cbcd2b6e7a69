// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-Harbor is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

use std::io::BufRead;
use std::net::IpAddr;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::{error, info, warn};

use rust_harbor::config::VmConfigEntry;
use rust_harbor::kernel::migrate::Migration;
use rust_harbor::kernel::{logger_init, timer_init};
use rust_harbor::vmm::{vmm_boot_vm, vmm_init};
use rust_harbor::print_built_info;

#[derive(Parser)]
#[command(
    version,
    about,
    long_about = "A Type-2 Virtual Machine Monitor with Pre-Copy Live Migration"
)]
struct Cli {
    /// VM name used in migration negotiation
    #[arg(long, default_value = "guest0")]
    name: String,
    /// Guest memory size in MiB
    #[arg(long, default_value_t = 64)]
    mem: usize,
    /// Number of virtual CPUs
    #[arg(long, default_value_t = 1)]
    cpus: usize,
    #[command(subcommand)]
    subcmd: CliSubCmd,
}

#[derive(Subcommand)]
enum CliSubCmd {
    /// Run the VM locally; `migrate <ip> <port>` on stdin sends it away
    Run {},
    /// Wait for an inbound migration on <port> and become that guest
    RetrieveGuest {
        /// Rendezvous port to listen on
        port: u16,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    logger_init().expect("installing the logger");
    print_built_info();
    timer_init();

    let config = match VmConfigEntry::new(&cli.name, cli.mem << 20, cli.cpus) {
        Ok(config) => config,
        Err(e) => {
            error!("bad configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mb = match vmm_init(config) {
        Ok(mb) => mb,
        Err(e) => {
            error!("assembling the VM failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let handle = vmm_boot_vm(&mb);

    let code = match cli.subcmd {
        CliSubCmd::Run {} => management_loop(&mb),
        CliSubCmd::RetrieveGuest { port } => {
            let mut migration = match Migration::new(mb.clone()) {
                Ok(migration) => migration,
                Err(e) => {
                    error!("{}", e);
                    return ExitCode::FAILURE;
                }
            };
            match migration.listen(port) {
                Ok(()) => {
                    info!("guest arrived, taking over");
                    management_loop(&mb)
                }
                Err(e) => {
                    // A partially restored machine must not keep running.
                    error!("retrieve failed, destroying the partial guest: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
    };

    handle.stop();
    code
}

/// Operator commands on stdin: `migrate <ip> <port>` and `quit`.
fn management_loop(mb: &std::sync::Arc<rust_harbor::vmm::Motherboard>) -> ExitCode {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        let mut words = line.split_whitespace();
        match words.next() {
            Some("migrate") => {
                let addr: Option<IpAddr> = words.next().and_then(|w| w.parse().ok());
                let port: Option<u16> = words.next().and_then(|w| w.parse().ok());
                let (addr, port) = match (addr, port) {
                    (Some(addr), Some(port)) => (addr, port),
                    _ => {
                        warn!("usage: migrate <ip> <port>");
                        continue;
                    }
                };
                let mut migration = match Migration::new(mb.clone()) {
                    Ok(migration) => migration,
                    Err(e) => {
                        error!("{}", e);
                        continue;
                    }
                };
                match migration.send(addr, port) {
                    Ok(()) => {
                        info!("guest handed over, shutting down");
                        return ExitCode::SUCCESS;
                    }
                    Err(e) => {
                        error!("migration failed: {}", e);
                        // The source VM resumed locally; keep serving it.
                    }
                }
            }
            Some("quit") => return ExitCode::SUCCESS,
            Some(other) => warn!("unknown command: {}", other),
            None => {}
        }
    }
    ExitCode::SUCCESS
}
