// Copyright 2020 Netwarps Ltd.
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! `TransportConn`: the raw, ordered byte-pipe contract consumed by
//! [`crate::secured`]. The actual datagram transport (UDX/TCP) is an
//! external collaborator; this module only defines the interface and a
//! `MemoryDuplex` implementation used by tests to emulate a lossy,
//! fragmenting transport without touching a real socket.

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::lock::Mutex;
use futures::{SinkExt, StreamExt};
use std::io;

/// Ordered, reliable byte pipe. Reads may return short; writes must either
/// complete in full or fail. Implementations are shared behind `&self`
/// because [`crate::secured::SecuredConnection`] serializes access itself.
#[async_trait]
pub trait TransportConn: Send + Sync + Unpin + 'static {
    /// Read at least one byte, or `Ok(0)` on a clean EOF.
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
    /// Write the entire buffer, or fail.
    async fn write(&self, buf: &[u8]) -> io::Result<()>;
    /// Idempotent close.
    async fn close(&self) -> io::Result<()>;
    fn local_addr(&self) -> String;
    fn remote_addr(&self) -> String;
}

/// An in-process, in-memory duplex pipe pair. Each `write` is chopped into
/// `fragment_size`-sized pieces before being handed to the peer's reader,
/// which emulates a fragmenting UDX-style transport so the secured layer's
/// atomicity guarantees are actually exercised in tests.
pub struct MemoryDuplex {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    recv_buf: Mutex<Vec<u8>>,
    fragment_size: usize,
    local: String,
    remote: String,
}

impl MemoryDuplex {
    /// Build a connected pair. `fragment_size` controls how finely writes
    /// are chopped up on the wire between the two ends.
    pub fn pair(fragment_size: usize) -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded();
        let (tx_b, rx_b) = mpsc::unbounded();
        let a = MemoryDuplex {
            tx: tx_a,
            rx: Mutex::new(rx_b),
            recv_buf: Mutex::new(Vec::new()),
            fragment_size,
            local: "memory:a".to_string(),
            remote: "memory:b".to_string(),
        };
        let b = MemoryDuplex {
            tx: tx_b,
            rx: Mutex::new(rx_a),
            recv_buf: Mutex::new(Vec::new()),
            fragment_size,
            local: "memory:b".to_string(),
            remote: "memory:a".to_string(),
        };
        (a, b)
    }
}

#[async_trait]
impl TransportConn for MemoryDuplex {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut recv_buf = self.recv_buf.lock().await;
        if recv_buf.is_empty() {
            let mut rx = self.rx.lock().await;
            match rx.next().await {
                Some(chunk) => *recv_buf = chunk,
                None => return Ok(0),
            }
        }
        let n = std::cmp::min(buf.len(), recv_buf.len());
        buf[..n].copy_from_slice(&recv_buf[..n]);
        recv_buf.drain(..n);
        Ok(n)
    }

    async fn write(&self, buf: &[u8]) -> io::Result<()> {
        let mut tx = self.tx.clone();
        if buf.is_empty() {
            return Ok(());
        }
        for chunk in buf.chunks(self.fragment_size.max(1)) {
            tx.send(chunk.to_vec())
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))?;
        }
        Ok(())
    }

    async fn close(&self) -> io::Result<()> {
        self.tx.close_channel();
        Ok(())
    }

    fn local_addr(&self) -> String {
        self.local.clone()
    }

    fn remote_addr(&self) -> String {
        self.remote.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[async_std::test]
    async fn memory_duplex_round_trips_fragmented_write() {
        let (a, b) = MemoryDuplex::pair(7);
        let msg = b"the quick brown fox jumps over the lazy dog";
        a.write(msg).await.unwrap();
        let mut got = Vec::new();
        let mut buf = [0u8; 64];
        while got.len() < msg.len() {
            let n = b.read(&mut buf).await.unwrap();
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, msg);
    }
}
