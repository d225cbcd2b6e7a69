// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-Harbor is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

use std::net::IpAddr;
use std::sync::Arc;

use crate::config::{LatePolicy, MigrationConfig};
use crate::device::{devtype, HostOpMsg, RestoreMsg};
use crate::error::{ErrorKind, Result};
use crate::kernel::{rdtsc, tsc_freq_hz, CpuMessage, MigrationRegs, PAGE_SIZE};
use crate::utils::StopWatch;
use crate::vmm::Motherboard;

use super::dirt::DirtManager;
use super::prd::Prd;
use super::records::{
    DeviceRecord, MigrationAnswer, MigrationHeader, MigrationInit, Mword, PING_WORD,
};
use super::stream::{MigrationListener, MigrationStream};

/// Upper bound for a single device blob; anything larger means the stream
/// lost sync.
const MAX_DEVICE_BLOB: usize = 1 << 24;

/// Upper bound for the negotiated configuration cmdline.
const MAX_CMDLINE: usize = 4096;

/// One live-migration session, sender or receiver side. Owns the dirty-page
/// bookkeeping and the stream; everything else it reaches through the
/// motherboard's buses.
pub struct Migration {
    mb: Arc<Motherboard>,
    dirt: DirtManager,
    physmem_start: *mut u8,
    physmem_size: usize,
    sendmem: usize,
    sendmem_total: usize,
}

// The raw window pointer stays valid for the lifetime of the motherboard
// the session holds.
unsafe impl Send for Migration {}

impl Migration {
    pub fn new(mb: Arc<Motherboard>) -> Result<Migration> {
        let mut msg = HostOpMsg::guest_mem();
        if !mb.bus_hostop.send(&mut msg, true) {
            return Err(ErrorKind::NotFound.msg("no host backend answered the guest memory request"));
        }
        let (ptr, len) = match msg {
            HostOpMsg::GuestMem { ptr, len } => (ptr, len),
            _ => unreachable!(),
        };
        Ok(Migration {
            mb,
            dirt: DirtManager::new(len / PAGE_SIZE),
            physmem_start: ptr,
            physmem_size: len,
            sendmem: 0,
            sendmem_total: 0,
        })
    }

    fn migration_config(&self) -> MigrationConfig {
        self.mb.config.migration.clone()
    }

    fn page_slice(&self, prd: Prd) -> &[u8] {
        assert!(
            prd.base() + prd.size() <= self.physmem_size,
            "descriptor beyond guest memory"
        );
        unsafe { std::slice::from_raw_parts(self.physmem_start.add(prd.base()), prd.size()) }
    }

    #[allow(clippy::mut_from_ref)]
    fn page_slice_mut(&self, prd: Prd) -> Result<&mut [u8]> {
        if prd.base() + prd.size() > self.physmem_size {
            return Err(ErrorKind::Desync.msg("page descriptor beyond guest memory"));
        }
        Ok(unsafe { std::slice::from_raw_parts_mut(self.physmem_start.add(prd.base()), prd.size()) })
    }

    fn puts_guestscreen(&self, text: &str, reset: bool) -> bool {
        self.mb
            .bus_restore
            .send(&mut RestoreMsg::display_guest(text, reset), true)
    }

    /***********************************************************************
     * Guest sending part
     ***********************************************************************/

    /// Migrate this guest to the peer's rendezvous service. On failure the
    /// source VM resumes locally, unless devices already left the host and
    /// the late-failure policy says terminate.
    pub fn send(&mut self, addr: IpAddr, port: u16) -> Result<()> {
        let cfg = self.migration_config();
        let mut migration_timer = StopWatch::new();
        let mut freeze_timer = StopWatch::new();
        let mut devices_sent = false;

        let result = self.send_session(
            addr,
            port,
            &cfg,
            &mut migration_timer,
            &mut freeze_timer,
            &mut devices_sent,
        );
        if let Err(e) = result {
            if !devices_sent || cfg.late_policy == LatePolicy::ResumeLocal {
                self.mb.freeze_gate.thaw_all();
                self.mb
                    .bus_restore
                    .send(&mut RestoreMsg::pci_plug(true), false);
            } else {
                warn!("late failure under terminate policy: source VM stays frozen");
            }
            return Err(e);
        }

        if cfg.clone_semantics {
            info!("Clone semantics: resuming the source VM.");
            self.mb.freeze_gate.thaw_all();
            self.mb
                .bus_restore
                .send(&mut RestoreMsg::pci_plug(true), false);
        }

        info!("Done. VM was frozen for {} ms.", freeze_timer.delta_ms());
        info!(
            "This migration took {} seconds.",
            migration_timer.delta_ms() / 1000
        );
        if self.sendmem > 0 {
            let resent = self.sendmem_total - self.sendmem;
            info!(
                "{:3}% ({} MB) of guest memory resent due to change.",
                100 * resent / self.sendmem,
                resent / 1024 / 1024
            );
        }
        self.dirt.print_stats();
        Ok(())
    }

    fn send_session(
        &mut self,
        addr: IpAddr,
        port: u16,
        cfg: &MigrationConfig,
        migration_timer: &mut StopWatch,
        freeze_timer: &mut StopWatch,
        devices_sent: &mut bool,
    ) -> Result<()> {
        info!("Trying to connect...");
        let mut ctrl = MigrationStream::connect(addr, port, cfg.io_timeout)
            .map_err(|e| e.in_phase("negotiate"))?;
        info!("Established connection.");

        let data_port = self
            .negotiate_port(&mut ctrl)
            .map_err(|e| e.in_phase("negotiate"))?;
        ctrl.close().map_err(|e| e.in_phase("negotiate"))?;

        info!("Connecting to waiting target VM.");
        let mut stream = MigrationStream::connect(addr, data_port, cfg.io_timeout)
            .map_err(|e| e.in_phase("negotiate"))?;
        info!("OK, starting the actual migration.");
        migration_timer.start();

        let latency_ms = self
            .send_ping(&mut stream)
            .map_err(|e| e.in_phase("negotiate"))?;
        info!(
            "Connection has a latency of {} ms * freq {} kHz = {} ticks.",
            latency_ms,
            tsc_freq_hz() / 1000,
            latency_ms * (tsc_freq_hz() / 1000)
        );

        self.send_header(&mut stream)
            .map_err(|e| e.in_phase("header"))?;

        // Pass-through state cannot travel; detach before memory moves.
        self.mb
            .bus_restore
            .send(&mut RestoreMsg::pci_plug(false), false);

        self.send_guest_state(&mut stream, latency_ms, freeze_timer, devices_sent)?;

        freeze_timer.stop();
        stream.close().map_err(|e| e.in_phase("close"))?;
        migration_timer.stop();
        Ok(())
    }

    fn send_guest_state(
        &mut self,
        stream: &mut MigrationStream,
        latency_ms: u64,
        freeze_timer: &mut StopWatch,
        devices_sent: &mut bool,
    ) -> Result<()> {
        self.send_memory(stream).map_err(|e| e.in_phase("memory"))?;
        freeze_timer.start();
        self.send_vcpus(stream)
            .map_err(|e| e.in_phase("devices"))?;
        self.send_devices(stream)
            .map_err(|e| e.in_phase("devices"))?;
        *devices_sent = true;
        self.send_tsc(stream, latency_ms)
            .map_err(|e| e.in_phase("tsc"))?;
        if self.mb.config.migration.verify_checksums {
            self.send_checksums(stream)
                .map_err(|e| e.in_phase("close"))?;
        }
        Ok(())
    }

    fn negotiate_port(&self, stream: &mut MigrationStream) -> Result<u16> {
        let mut msg = HostOpMsg::config_string();
        if !self.mb.bus_hostop.send(&mut msg, true) {
            return Err(ErrorKind::NotFound.msg("no config string provider"));
        }
        let cmdline = match msg {
            HostOpMsg::ConfigString { cmdline } => cmdline,
            _ => unreachable!(),
        };

        // The listener tries to bring up an identically configured machine
        // and answers with the port awaiting the state stream.
        stream.send(&MigrationInit::new(cmdline.len()).to_wire())?;
        stream.send(cmdline.as_bytes())?;

        let mut buf = [0u8; MigrationAnswer::WIRE_BYTES];
        stream.receive(&mut buf)?;
        let answer = MigrationAnswer::from_wire(&buf);
        if !answer.check_magic() {
            error!("Magic string check failed: MigrationAnswer");
            return Err(ErrorKind::Desync.msg("MigrationAnswer magic mismatch"));
        }
        if answer.success == 0 {
            info!("Configuration is not suitable for target machine.");
            return Err(ErrorKind::ConfigMismatch.msg("configuration not suitable"));
        }
        Ok(answer.port as u16)
    }

    fn send_ping(&self, stream: &mut MigrationStream) -> Result<u64> {
        let mut timer = StopWatch::new();
        timer.start();
        stream.send_word(PING_WORD)?;
        let pong = stream.receive_word()?;
        timer.stop();

        if pong != 3 * PING_WORD {
            error!("Ping failed.");
            return Err(ErrorKind::Desync.msg("ping corrupted"));
        }
        // Latency = round trip time / 2
        Ok(timer.delta_ms() / 2)
    }

    fn send_header(&self, stream: &mut MigrationStream) -> Result<()> {
        // Telling the listener the video mode up front lets it program the
        // framebuffer before its contents arrive.
        let mut vgamsg = RestoreMsg::videomode_query();
        self.mb.bus_restore.send(&mut vgamsg, true);
        stream.send(&MigrationHeader::new(vgamsg.bytes as Mword).to_wire())
    }

    /// Ask the host which pages went dirty since the last cycle and mark
    /// them. Terminates when the oracle runs empty or wraps around to a run
    /// it already reported this cycle.
    fn collect_dirty_cycle(&mut self) {
        let mut first = Prd::EMPTY;
        let mut last = Prd::EMPTY;
        loop {
            let mut msg = HostOpMsg::next_dirty_page();
            if !self.mb.bus_hostop.send(&mut msg, true) {
                break;
            }
            let current = match msg {
                HostOpMsg::NextDirtyPage { prd } => prd,
                _ => unreachable!(),
            };
            if current.is_empty()
                || (!first.is_empty() && current.base() == first.base())
                || (!last.is_empty() && current.base() == last.base())
            {
                break;
            }
            self.dirt.mark_dirty(current);
            if first.is_empty() {
                first = current;
            }
            last = current;
        }
    }

    /// Drain up to one batch window of dirty runs onto the stream,
    /// pipelined. Returns the page count that went out.
    fn send_dirty_batch(&mut self, stream: &mut MigrationStream) -> Result<usize> {
        let window = self.mb.config.migration.batch_window;
        let mut runs: Vec<Prd> = Vec::new();
        runs.try_reserve(window)
            .map_err(|_| ErrorKind::Exhausted.msg("batch window"))?;
        while self.dirt.dirty_pages() > 0 && runs.len() < window {
            let run = self.dirt.next_dirty();
            if run.is_empty() {
                break;
            }
            self.dirt.mark_clean(run);
            runs.push(run);
        }
        if runs.is_empty() {
            return Ok(0);
        }

        // Headers and page contents stay alive until wait_complete returns.
        let headers: Vec<[u8; Prd::WIRE_BYTES]> = runs.iter().map(|run| run.to_wire()).collect();
        let mut pages = 0;
        let mut batch = stream.batch();
        for (run, header) in runs.iter().zip(headers.iter()) {
            batch.send_nonblocking(header);
            batch.send_nonblocking(self.page_slice(*run));
            pages += run.pages();
        }
        batch.wait_complete()?;
        Ok(pages)
    }

    fn send_memory(&mut self, stream: &mut MigrationStream) -> Result<()> {
        let cfg = self.migration_config();
        let mut round = 0usize;
        let mut prev_round = StopWatch::new();

        loop {
            let mut lap = StopWatch::new();
            lap.start();
            self.collect_dirty_cycle();
            let pages = self.send_dirty_batch(stream)?;
            lap.stop();

            let transfer_rate = lap.rate_kibps(pages * PAGE_SIZE);
            let dirtying_rate = prev_round.rate_kibps(pages * PAGE_SIZE);
            info!(
                "RND {} PAGE_CNT {:5} TX {:5} KB/s DRT {:5} KB/s DELTA {} START {}",
                round,
                pages,
                transfer_rate,
                dirtying_rate,
                lap.delta_ms(),
                lap.abs_start_ms()
            );

            self.sendmem_total += pages * PAGE_SIZE;
            if self.sendmem == 0 {
                self.sendmem = self.sendmem_total;
            }
            round += 1;
            prev_round = lap;

            if pages == 0 {
                break;
            }
            if self.dirt.dirty_pages() <= cfg.dirty_threshold {
                break;
            }
            if round >= cfg.max_rounds {
                warn!(
                    "pre-copy hit the {} round limit, forcing stop-and-copy",
                    cfg.max_rounds
                );
                break;
            }
            if transfer_rate < dirtying_rate {
                break;
            }
        }

        // The last transfer rounds run with a frozen guest system.
        self.mb.freeze_gate.freeze_all(&self.mb.vcpus);

        self.collect_dirty_cycle();
        let mut last_pages = 0;
        loop {
            let pages = self.send_dirty_batch(stream)?;
            if pages == 0 {
                break;
            }
            last_pages += pages;
        }
        self.sendmem_total += last_pages * PAGE_SIZE;
        stream.send(&Prd::EMPTY.to_wire())?;
        info!("Enqueued the last {} dirty pages", last_pages);
        Ok(())
    }

    fn send_vcpus(&self, stream: &mut MigrationStream) -> Result<()> {
        for vcpu in &self.mb.vcpus {
            let image = self
                .mb
                .freeze_gate
                .take_image(vcpu.id())
                .unwrap_or_else(|| panic!("frozen vcpu {} left no register image", vcpu.id()));
            stream.send(image.as_bytes())?;
        }
        Ok(())
    }

    fn send_devices(&self, stream: &mut MigrationStream) -> Result<()> {
        // RESTART rewinds every device's snapshot cursor and collects an
        // upper bound for the session's blob bytes.
        let mut restart = RestoreMsg::restart(true);
        self.mb.bus_restore.send_fifo(&mut restart);

        let mut payload: Vec<u8> = Vec::new();
        payload
            .try_reserve(restart.bytes + 16 * DeviceRecord::WIRE_BYTES)
            .map_err(|_| ErrorKind::Exhausted.msg("device payload buffer"))?;

        for tag in devtype::RESTART + 1..devtype::LAST {
            // A device answers true per chunk and false once it is done;
            // tags nobody owns fall through on the first send.
            loop {
                let mut msg = RestoreMsg::save(tag);
                if !self.mb.bus_restore.send(&mut msg, true) {
                    break;
                }
                let record = DeviceRecord::new(tag, msg.bytes, msg.id1, msg.id2, true);
                payload.extend_from_slice(&record.to_wire());
                payload.extend_from_slice(&msg.space[..msg.bytes]);
            }
        }

        let end_record = DeviceRecord::end().to_wire();
        let mut batch = stream.batch();
        batch.send_nonblocking(&payload);
        batch.send_nonblocking(&end_record);
        batch.wait_complete().map_err(|e| {
            error!("Error sending device states.");
            e
        })
    }

    fn send_tsc(&self, stream: &mut MigrationStream, latency_ms: u64) -> Result<()> {
        // Compensate network latency: the receiver continues the TSC where
        // the stamp says, so the stamp must account for transit time.
        let stamp = rdtsc().wrapping_add(latency_ms.saturating_mul(tsc_freq_hz() / 1000));
        stream.send(&stamp.to_le_bytes()).map_err(|e| {
            error!("Error sending RDTSC");
            e
        })
    }

    /***********************************************************************
     * Guest receiving part
     ***********************************************************************/

    /// Wait for an inbound migration on `port` and become that guest. Any
    /// protocol error is fatal for the partially restored machine.
    pub fn listen(&mut self, port: u16) -> Result<()> {
        let cfg = self.migration_config();

        // The vcpus park right away; nothing may run before restore ends.
        self.mb.freeze_gate.freeze_all(&self.mb.vcpus);

        let listener = MigrationListener::bind(port).map_err(|e| e.in_phase("negotiate"))?;
        self.print_welcomescreen(listener.port());

        match self.retrieve(&listener, &cfg) {
            Ok(()) => {
                self.mb
                    .bus_restore
                    .send(&mut RestoreMsg::pci_plug(true), false);
                info!("That's it. Waking up VCPUs.");
                self.mb.freeze_gate.thaw_all();
                Ok(())
            }
            Err(e) => {
                error!("retrieving the guest failed: {}", e);
                Err(e)
            }
        }
    }

    /// Port of the data listener is negotiated over the rendezvous stream;
    /// the guest state arrives on a second connection.
    fn retrieve(&mut self, listener: &MigrationListener, cfg: &MigrationConfig) -> Result<()> {
        let mut ctrl = listener
            .accept(cfg.io_timeout)
            .map_err(|e| e.in_phase("negotiate"))?;
        let data_listener = self
            .negotiate_answer(&mut ctrl)
            .map_err(|e| e.in_phase("negotiate"))?;
        ctrl.close().map_err(|e| e.in_phase("negotiate"))?;

        let mut stream = data_listener
            .accept(cfg.io_timeout)
            .map_err(|e| e.in_phase("negotiate"))?;

        self.receive_ping(&mut stream)
            .map_err(|e| e.in_phase("negotiate"))?;
        self.receive_header(&mut stream)
            .map_err(|e| e.in_phase("header"))?;
        self.receive_memory(&mut stream)
            .map_err(|e| e.in_phase("memory"))?;
        self.receive_vcpus(&mut stream)
            .map_err(|e| e.in_phase("devices"))?;
        self.receive_devices(&mut stream)
            .map_err(|e| e.in_phase("devices"))?;
        self.receive_tsc(&mut stream)
            .map_err(|e| e.in_phase("tsc"))?;
        if cfg.verify_checksums {
            self.receive_checksums(&mut stream)
                .map_err(|e| e.in_phase("close"))?;
        }
        stream.close().map_err(|e| e.in_phase("close"))?;
        Ok(())
    }

    fn negotiate_answer(&self, ctrl: &mut MigrationStream) -> Result<MigrationListener> {
        let mut buf = [0u8; MigrationInit::WIRE_BYTES];
        ctrl.receive(&mut buf)?;
        let init = MigrationInit::from_wire(&buf);
        if !init.check_magic() {
            error!("Magic string check failed: MigrationInit");
            panic!("Magic string check failed: MigrationInit");
        }
        if init.cmdlen as usize > MAX_CMDLINE {
            return Err(ErrorKind::Desync.msg("oversized config cmdline"));
        }
        let mut cmdline = vec![0u8; init.cmdlen as usize];
        ctrl.receive(&mut cmdline)?;
        let cmdline = String::from_utf8_lossy(&cmdline).into_owned();

        if !self.mb.config.compatible_with(&cmdline) {
            ctrl.send(&MigrationAnswer::reject().to_wire())?;
            return Err(ErrorKind::ConfigMismatch
                .msg("sender configuration does not fit this machine"));
        }

        let data_listener = MigrationListener::bind(0)?;
        ctrl.send(&MigrationAnswer::accept(data_listener.port()).to_wire())?;
        Ok(data_listener)
    }

    fn receive_ping(&self, stream: &mut MigrationStream) -> Result<()> {
        let ping = stream.receive_word()?;
        if ping != PING_WORD {
            error!("Received bad ping message.");
            return Err(ErrorKind::Desync.msg("bad ping word"));
        }
        stream.send_word(ping * 3)
    }

    fn receive_header(&self, stream: &mut MigrationStream) -> Result<()> {
        info!("Receiving guest information.");
        let mut buf = [0u8; MigrationHeader::WIRE_BYTES];
        stream.receive(&mut buf)?;
        let header = MigrationHeader::from_wire(&buf);
        if !header.check_magic() {
            error!("Magic string check failed: MigrationHeader");
            panic!("Magic string check failed: MigrationHeader");
        }
        self.mb
            .bus_restore
            .send(&mut RestoreMsg::videomode_set(header.videomode as usize), true);
        Ok(())
    }

    fn receive_memory(&mut self, stream: &mut MigrationStream) -> Result<()> {
        info!("Receiving guest memory.");
        let mut watch = StopWatch::new();
        watch.start();

        let mut bytes = 0usize;
        loop {
            let mut prd_buf = [0u8; Prd::WIRE_BYTES];
            stream.receive(&mut prd_buf)?;
            let current = Prd::from_wire(prd_buf);
            if current.is_empty() {
                // An empty range descriptor means "EOF".
                break;
            }
            stream.receive(self.page_slice_mut(current)?)?;
            bytes += current.size();
        }
        watch.stop();

        info!(
            "Received {} MB. RX Rate: {} KB/s",
            bytes / 1024 / 1024,
            watch.rate_kibps(bytes)
        );
        Ok(())
    }

    fn receive_vcpus(&self, stream: &mut MigrationStream) -> Result<()> {
        info!("Receiving vcpu register images.");
        let mut image = vec![0u8; MigrationRegs::WIRE_BYTES];
        for vcpu in &self.mb.vcpus {
            stream.receive(&mut image)?;
            vcpu.load_migration_slice(&image);
        }
        Ok(())
    }

    fn receive_devices(&mut self, stream: &mut MigrationStream) -> Result<()> {
        info!("Receiving Devices.");
        self.mb
            .bus_restore
            .send_fifo(&mut RestoreMsg::restart(false));

        loop {
            let mut buf = [0u8; DeviceRecord::WIRE_BYTES];
            stream.receive(&mut buf)?;
            let record = DeviceRecord::from_wire(&buf);
            if !record.check_magic() {
                error!("Magic string check failed: DeviceRecord");
                panic!("Magic string check failed: DeviceRecord");
            }
            if record.is_end() {
                break;
            }
            if record.bytes as usize > MAX_DEVICE_BLOB {
                return Err(ErrorKind::Desync.msg("oversized device blob"));
            }

            let mut blob = Vec::new();
            blob.try_reserve(record.bytes as usize)
                .map_err(|_| ErrorKind::Exhausted.msg("device blob buffer"))?;
            blob.resize(record.bytes as usize, 0);
            stream.receive(&mut blob)?;

            let mut msg = RestoreMsg::restore(
                record.devtype as u16,
                record.id1 as u32,
                record.id2 as u32,
                blob,
            );
            if !self.mb.bus_restore.send(&mut msg, true) {
                warn!("No device replied on restore message! VMM-Configuration mismatch?");
            }
        }
        Ok(())
    }

    fn receive_tsc(&self, stream: &mut MigrationStream) -> Result<()> {
        // The guest's clock continues where the sender's stamp says;
        // without the offset its timers would jump backward or freeze.
        let sender_tsc = stream.receive_word()?;
        let offset = sender_tsc.wrapping_sub(rdtsc()) as i64;
        for vcpu in &self.mb.vcpus {
            vcpu.executor(CpuMessage::AddTscOff(offset));
        }
        Ok(())
    }

    fn print_welcomescreen(&self, port: u16) {
        let banner = format!("   Waiting for guest to migrate. Listening on port {}", port);
        self.puts_guestscreen(&banner, true);
    }

    /***********************************************************************
     * Optional integrity check
     ***********************************************************************/

    fn page_checksum(&self, page: usize) -> u64 {
        let bytes = self.page_slice(Prd::largest_aligned_run(page, 1));
        let mut sum = 0u64;
        for chunk in bytes.chunks_exact(8) {
            let word = u64::from_le_bytes(chunk.try_into().unwrap());
            sum = sum.wrapping_add(word.wrapping_mul(word));
        }
        sum
    }

    fn send_checksums(&self, stream: &mut MigrationStream) -> Result<()> {
        let entries = self.physmem_size / PAGE_SIZE;
        info!("Checksumming the area [0 - {:#x})", self.physmem_size);
        let mut list: Vec<u8> = Vec::new();
        list.try_reserve(entries * 8)
            .map_err(|_| ErrorKind::Exhausted.msg("checksum list"))?;
        for page in 0..entries {
            list.extend_from_slice(&self.page_checksum(page).to_le_bytes());
        }
        stream.send(&list)
    }

    fn receive_checksums(&self, stream: &mut MigrationStream) -> Result<()> {
        let entries = self.physmem_size / PAGE_SIZE;
        info!("Checksumming the area [0 - {:#x})", self.physmem_size);
        let mut list: Vec<u8> = Vec::new();
        list.try_reserve(entries * 8)
            .map_err(|_| ErrorKind::Exhausted.msg("checksum list"))?;
        list.resize(entries * 8, 0);
        stream.receive(&mut list)?;

        let mut err = 0;
        for page in 0..entries {
            let expected = u64::from_le_bytes(list[page * 8..page * 8 + 8].try_into().unwrap());
            if self.page_checksum(page) != expected {
                err += 1;
                warn!("bad page received. page number: {:#x}", page);
            }
        }
        if err > 0 {
            error!("Erroneous pages: {}", err);
            return Err(ErrorKind::Desync.msg("post-migration checksum mismatch"));
        }
        Ok(())
    }
}
