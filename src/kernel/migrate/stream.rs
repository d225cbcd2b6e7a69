// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-Harbor is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! Ordered, reliable, length-delimited transport for migration sessions.
//! Blocking sends and receives move exactly the requested byte count;
//! `TxBatch` adds pipelined sends over borrowed buffers which stay queued
//! until `wait_complete` returns.

use std::io::{IoSlice, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use crate::error::{ErrorKind, Result};

use super::records::Mword;

pub struct MigrationListener {
    inner: TcpListener,
    port: u16,
}

impl MigrationListener {
    /// Bind to `port` on all interfaces; port 0 picks a free port.
    pub fn bind(port: u16) -> Result<MigrationListener> {
        let inner = TcpListener::bind(("0.0.0.0", port))?;
        let port = inner.local_addr()?.port();
        Ok(MigrationListener { inner, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Block until a peer connects.
    pub fn accept(&self, io_timeout: Duration) -> Result<MigrationStream> {
        let (sock, peer) = self.inner.accept()?;
        debug!("accepted migration connection from {}", peer);
        MigrationStream::from_socket(sock, io_timeout)
    }
}

pub struct MigrationStream {
    sock: TcpStream,
}

impl MigrationStream {
    pub fn connect(addr: IpAddr, port: u16, io_timeout: Duration) -> Result<MigrationStream> {
        let sock = TcpStream::connect_timeout(&SocketAddr::new(addr, port), io_timeout)?;
        MigrationStream::from_socket(sock, io_timeout)
    }

    fn from_socket(sock: TcpStream, io_timeout: Duration) -> Result<MigrationStream> {
        // A wall-clock budget per operation; there is no protocol-level
        // timeout below this one.
        sock.set_read_timeout(Some(io_timeout))?;
        sock.set_write_timeout(Some(io_timeout))?;
        sock.set_nodelay(true)?;
        Ok(MigrationStream { sock })
    }

    /// Blocking send of the whole buffer.
    pub fn send(&mut self, buf: &[u8]) -> Result<()> {
        self.sock.write_all(buf)?;
        Ok(())
    }

    /// Blocking receive filling the whole buffer.
    pub fn receive(&mut self, buf: &mut [u8]) -> Result<()> {
        self.sock.read_exact(buf)?;
        Ok(())
    }

    pub fn send_word(&mut self, word: Mword) -> Result<()> {
        self.send(&word.to_le_bytes())
    }

    pub fn receive_word(&mut self) -> Result<Mword> {
        let mut bytes = [0u8; 8];
        self.receive(&mut bytes)?;
        Ok(Mword::from_le_bytes(bytes))
    }

    /// Open a pipelined send window. Buffers handed to it must outlive the
    /// batch; the borrow ends when `wait_complete` returns.
    pub fn batch<'b>(&mut self) -> TxBatch<'_, 'b> {
        TxBatch {
            sock: &mut self.sock,
            segs: Vec::new(),
            queued: 0,
        }
    }

    pub fn close(self) -> Result<()> {
        self.sock.shutdown(Shutdown::Both)?;
        Ok(())
    }
}

/// A window of queued sends over borrowed buffers. Nothing is guaranteed to
/// be on the wire before `wait_complete`; everything is once it returned.
pub struct TxBatch<'s, 'b> {
    sock: &'s mut TcpStream,
    segs: Vec<IoSlice<'b>>,
    queued: usize,
}

impl<'s, 'b> TxBatch<'s, 'b> {
    /// Queue a borrowed buffer for transmission.
    pub fn send_nonblocking(&mut self, buf: &'b [u8]) {
        if !buf.is_empty() {
            self.queued += buf.len();
            self.segs.push(IoSlice::new(buf));
        }
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued
    }

    /// Drain the queue onto the wire. Consumes the batch, ending the borrow
    /// of every queued buffer.
    pub fn wait_complete(mut self) -> Result<()> {
        let mut slices = self.segs.as_mut_slice();
        while !slices.is_empty() {
            let n = self.sock.write_vectored(&*slices)?;
            if n == 0 {
                return Err(ErrorKind::Transport.msg("connection closed mid-send"));
            }
            IoSlice::advance_slices(&mut slices, n);
        }
        self.sock.flush()?;
        Ok(())
    }
}
