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

//! A YAMUX-compatible stream multiplexer over a [`crate::secured::SecuredConnection`].

pub(crate) mod chunks;
pub mod frame;
pub mod session;
pub mod stream;

pub use session::{Mode, YamuxSession};
pub use stream::YamuxStream;

use std::time::Duration;

/// Negotiation protocol id for this muxer, compared bytewise.
pub const PROTOCOL_ID: &[u8] = b"/yamux/1.0.0";

const DEFAULT_CREDIT: u32 = 256 * 1024;
const DEFAULT_MAX_WINDOW: u32 = 1024 * 1024;
/// A whole encoded frame (12-byte header + body) is the plaintext of exactly
/// one secured record (the reader reads one record per frame); leave room
/// for the header so a max-size DATA frame never spills into a second record.
const DEFAULT_MAX_FRAME_SIZE: usize = crate::secured::MAX_PLAINTEXT - frame::HEADER_LEN;
const DEFAULT_MAX_STREAMS: usize = 256;
const DEFAULT_ACCEPT_QUEUE: usize = 256;
const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(30);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Specifies when window update frames are sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowUpdateMode {
    /// Send window updates as soon as a stream's receive window drops to 0,
    /// right when data is received. Prevents head-of-line blocking but does
    /// not by itself exercise back pressure on a fast sender / slow reader.
    OnReceive,
    /// Send window updates only once the application reads the data. Keeps
    /// buffer usage low but a sender that never reads could deadlock.
    OnRead,
}

/// Yamux session configuration. Defaults follow the yamux specification:
/// 256 KiB initial stream window, 1 MiB max, 256 max streams, on-receive
/// window updates, eager (non-lazy) stream open, 30 s keepalive.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) initial_window: u32,
    pub(crate) max_window: u32,
    pub(crate) max_message_size: usize,
    pub(crate) max_streams: usize,
    pub(crate) accept_queue_size: usize,
    pub(crate) window_update_mode: WindowUpdateMode,
    pub(crate) lazy_open: bool,
    pub(crate) keepalive_interval: Option<Duration>,
    pub(crate) write_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            initial_window: DEFAULT_CREDIT,
            max_window: DEFAULT_MAX_WINDOW,
            max_message_size: DEFAULT_MAX_FRAME_SIZE,
            max_streams: DEFAULT_MAX_STREAMS,
            accept_queue_size: DEFAULT_ACCEPT_QUEUE,
            window_update_mode: WindowUpdateMode::OnReceive,
            lazy_open: false,
            keepalive_interval: Some(DEFAULT_KEEPALIVE),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }

    /// Set the initial per-stream receive window. Must be >= 256 KiB.
    pub fn set_initial_stream_window(&mut self, n: u32) -> &mut Self {
        assert!(n >= DEFAULT_CREDIT, "initial stream window must be >= 256 KiB");
        self.initial_window = n;
        self
    }

    /// Set the ceiling a stream's receive window may grow to adaptively.
    pub fn set_max_stream_window(&mut self, n: u32) -> &mut Self {
        self.max_window = n;
        self
    }

    /// Set the max DATA frame body size. A whole frame (header + body) must
    /// fit in one secured record, so `n` is capped at `MAX_PLAINTEXT - HEADER_LEN`.
    pub fn set_max_frame_size(&mut self, n: usize) -> &mut Self {
        self.max_message_size = n.min(crate::secured::MAX_PLAINTEXT - frame::HEADER_LEN);
        self
    }

    pub fn set_max_streams(&mut self, n: usize) -> &mut Self {
        self.max_streams = n;
        self
    }

    pub fn set_accept_queue_size(&mut self, n: usize) -> &mut Self {
        self.accept_queue_size = n;
        self
    }

    pub fn set_window_update_mode(&mut self, m: WindowUpdateMode) -> &mut Self {
        self.window_update_mode = m;
        self
    }

    /// When enabled, opening an outbound stream defers the SYN flag to the
    /// first outbound data frame instead of sending an empty SYN eagerly.
    pub fn set_lazy_open(&mut self, b: bool) -> &mut Self {
        self.lazy_open = b;
        self
    }

    /// `None` disables keepalive pings entirely.
    pub fn set_keepalive_interval(&mut self, d: Option<Duration>) -> &mut Self {
        self.keepalive_interval = d;
        self
    }

    pub fn set_write_timeout(&mut self, d: Duration) -> &mut Self {
        self.write_timeout = d;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "initial stream window")]
    fn rejects_too_small_initial_window() {
        Config::new().set_initial_stream_window(1024);
    }
}
