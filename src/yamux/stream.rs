// Copyright (c) 2018-2019 Parity Technologies (UK) Ltd.
// Copyright 2020 Netwarps Ltd.
//
// Licensed under the Apache License, Version 2.0 or MIT license, at your option.
//
// A copy of the Apache License, Version 2.0 is included in the software as
// LICENSE-APACHE and a copy of the MIT license is included in the software
// as LICENSE-MIT. You may also obtain a copy of the Apache License, Version 2.0
// at https://www.apache.org/licenses/LICENSE-2.0 and a copy of the MIT license
// at https://opensource.org/licenses/MIT.

//! A single multiplexed stream's state machine, receive buffer and
//! flow-control windows. The session task is the only writer of [`Shared`];
//! the stream itself only reads it and waits on its wakers.

use crate::error::{StreamError, StreamStateTag};
use crate::yamux::chunks::Chunks;
use crate::yamux::frame::Frame;
use crate::yamux::{Config, WindowUpdateMode};
use futures::channel::mpsc;
use futures::lock::Mutex;
use futures::{future, SinkExt};
use std::sync::Arc;
use std::task::{Poll, Waker};
use std::time::Instant;

/// The state of a yamux stream. Follows the table in the stream lifecycle
/// spec: a stream is legal to read from starting at `SynSent`, and only
/// `Init`, `Reset`, and an empty-buffered `Closed` refuse a read outright.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Init,
    SynSent,
    SynReceived,
    Open,
    LocalHalfClosed,
    RemoteHalfClosed,
    Closed,
    Reset,
}

impl State {
    fn tag(self) -> StreamStateTag {
        match self {
            State::Init => StreamStateTag::Init,
            State::SynSent => StreamStateTag::SynSent,
            State::SynReceived => StreamStateTag::SynReceived,
            State::Open => StreamStateTag::Open,
            State::LocalHalfClosed => StreamStateTag::LocalHalfClosed,
            State::RemoteHalfClosed => StreamStateTag::RemoteHalfClosed,
            State::Closed => StreamStateTag::Closed,
            State::Reset => StreamStateTag::Reset,
        }
    }

    fn can_write(self) -> bool {
        !matches!(self, State::LocalHalfClosed | State::Closed | State::Reset)
    }
}

/// Commands a stream sends to the session's single outbound-frame writer.
pub(crate) enum StreamCommand {
    SendFrame(Frame),
    CloseStream { id: u32 },
    ResetStream { id: u32 },
}

/// Indicates a flag still pending on the next outbound frame header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Flag {
    None,
    Syn,
}

pub struct YamuxStream {
    id: u32,
    config: Arc<Config>,
    sender: mpsc::Sender<StreamCommand>,
    flag: Flag,
    shared: Arc<Mutex<Shared>>,
    protocol: Option<String>,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
}

impl YamuxStream {
    pub(crate) fn new(id: u32, config: Arc<Config>, window: u32, credit: u32, sender: mpsc::Sender<StreamCommand>, flag: Flag) -> Self {
        let window_update_mode = config.window_update_mode;
        YamuxStream {
            id,
            config,
            sender,
            flag,
            shared: Arc::new(Mutex::new(Shared::new(window, credit, window_update_mode))),
            protocol: None,
            read_deadline: None,
            write_deadline: None,
        }
    }

    pub(crate) fn shared_handle(&self) -> Arc<Mutex<Shared>> {
        self.shared.clone()
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub fn set_protocol(&mut self, protocol: impl Into<String>) {
        self.protocol = Some(protocol.into());
    }

    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline;
    }

    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline;
    }

    async fn shared(&self) -> futures::lock::MutexGuard<'_, Shared> {
        self.shared.lock().await
    }

    /// Return whatever bytes are currently buffered, suspending for more if
    /// the buffer is empty and the stream can still receive data. Only one
    /// `read()` may be outstanding at a time.
    pub async fn read(&mut self) -> Result<Vec<u8>, StreamError> {
        let mut pending_update = None;
        let out = {
            let mut shared = self.shared().await;
            if shared.reader_pending {
                return Err(StreamError::StateError {
                    state: shared.state.tag(),
                    operation: "read",
                    reason: "already pending",
                });
            }
            match shared.state {
                State::Init => {
                    return Err(StreamError::StateError { state: StreamStateTag::Init, operation: "read", reason: "stream not yet opened" })
                }
                State::Reset => return Err(StreamError::Reset),
                _ => {}
            }
            if !shared.buffer.is_empty() {
                let (bytes, update) = drain_ready(&mut shared);
                pending_update = update;
                Some(bytes)
            } else if matches!(shared.state, State::RemoteHalfClosed | State::Closed) {
                Some(Vec::new())
            } else {
                shared.reader_pending = true;
                None
            }
        };

        let out = match out {
            Some(out) => out,
            None => {
                let deadline = self.read_deadline;
                let shared = self.shared.clone();
                let outcome = with_deadline(deadline, wait_for_reader(shared.clone())).await;

                let mut guard = shared.lock().await;
                guard.reader_pending = false;
                match outcome {
                    Err(StreamError::Timeout) => return Err(StreamError::Timeout),
                    _ => match guard.state {
                        State::Reset => return Err(StreamError::Reset),
                        _ if !guard.buffer.is_empty() => {
                            let (bytes, update) = drain_ready(&mut guard);
                            pending_update = update;
                            bytes
                        }
                        _ => Vec::new(),
                    },
                }
            }
        };

        if let Some(delta) = pending_update {
            let frame = Frame::window_update(self.id, delta);
            let _ = self.sender.send(StreamCommand::SendFrame(frame)).await;
        }
        Ok(out)
    }

    /// Send `data`, splitting into `max_message_size`-sized frames and
    /// suspending while the stream's send window is exhausted.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), StreamError> {
        if data.is_empty() {
            return Ok(());
        }
        let mut offset = 0;
        while offset < data.len() {
            let credit = loop {
                let shared = self.shared().await;
                if !shared.state.can_write() {
                    return Err(StreamError::StateError {
                        state: shared.state.tag(),
                        operation: "write",
                        reason: "send side already closed",
                    });
                }
                if shared.send_window > 0 {
                    break shared.send_window;
                }
                drop(shared);
                with_deadline(self.write_deadline, wait_for_credit(self.shared.clone())).await?;
            };

            let take = (credit as usize).min(data.len() - offset).min(self.config.max_message_size.max(1));
            let body = data[offset..offset + take].to_vec();
            {
                let mut shared = self.shared().await;
                if !shared.state.can_write() {
                    return Err(StreamError::StateError {
                        state: shared.state.tag(),
                        operation: "write",
                        reason: "send side closed while waiting for credit",
                    });
                }
                shared.send_window = shared.send_window.saturating_sub(body.len() as u32);
            }
            let mut frame = Frame::data(self.id, body);
            self.apply_flag(&mut frame);
            self.sender.send(StreamCommand::SendFrame(frame)).await.map_err(|_| StreamError::SessionClosed)?;
            offset += take;
        }
        Ok(())
    }

    /// Half-close: send FIN, transition to `LocalHalfClosed` (or `Closed`
    /// if the peer's FIN already arrived).
    pub async fn close(&mut self) -> Result<(), StreamError> {
        let mut frame = Frame::data(self.id, Vec::new());
        frame.header = frame.header.fin();
        self.apply_flag(&mut frame);

        // Commit the post-close state before handing the FIN/CloseStream
        // commands to the writer task: that task may dequeue and run
        // `reap_if_terminal` on another executor thread before we'd
        // otherwise get back here, and it must see the terminal state, not
        // whatever state we were in prior to closing.
        {
            let mut shared = self.shared().await;
            if matches!(shared.state, State::Closed | State::Reset) {
                return Ok(());
            }
            shared.state = match shared.state {
                State::RemoteHalfClosed => State::Closed,
                _ => State::LocalHalfClosed,
            };
        }
        self.sender.send(StreamCommand::SendFrame(frame)).await.map_err(|_| StreamError::SessionClosed)?;
        self.sender.send(StreamCommand::CloseStream { id: self.id }).await.map_err(|_| StreamError::SessionClosed)?;
        Ok(())
    }

    /// Reset: send RST, transition to `Reset`, wake any pending I/O.
    pub async fn reset(&mut self) -> Result<(), StreamError> {
        let mut frame = Frame::data(self.id, Vec::new());
        frame.header = frame.header.rst();

        {
            let mut shared = self.shared().await;
            shared.state = State::Reset;
            shared.wake_all();
        }
        let _ = self.sender.send(StreamCommand::SendFrame(frame)).await;
        let _ = self.sender.send(StreamCommand::ResetStream { id: self.id }).await;
        Ok(())
    }

    fn apply_flag(&mut self, frame: &mut Frame) {
        match self.flag {
            Flag::None => {}
            Flag::Syn => {
                frame.header = frame.header.syn();
                self.flag = Flag::None;
            }
        }
    }
}

impl Drop for YamuxStream {
    fn drop(&mut self) {
        log::trace!("dropping stream {}", self.id);
    }
}

/// Drain every buffered byte and, in `OnRead` mode, compute the window
/// update owed to the peer now that the buffer is empty again.
fn drain_ready(shared: &mut Shared) -> (Vec<u8>, Option<u32>) {
    let mut out = Vec::new();
    while let Some(chunk) = shared.buffer.front_mut() {
        if chunk.is_empty() {
            shared.buffer.pop_front();
            continue;
        }
        out.extend_from_slice(chunk.as_ref());
        let len = chunk.as_ref().len();
        chunk.advance(len);
    }
    let update = if shared.window_update_mode == WindowUpdateMode::OnRead && shared.recv_window < shared.max_recv_window {
        let delta = shared.max_recv_window - shared.recv_window;
        shared.recv_window = shared.max_recv_window;
        Some(delta)
    } else {
        None
    };
    (out, update)
}

async fn wait_for_reader(shared: Arc<Mutex<Shared>>) -> Result<(), StreamError> {
    future::poll_fn(move |cx| {
        let mut guard = match shared.try_lock() {
            Some(g) => g,
            None => {
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
        };
        if !guard.buffer.is_empty() || matches!(guard.state, State::RemoteHalfClosed | State::Closed | State::Reset) {
            return Poll::Ready(Ok(()));
        }
        guard.reader = Some(cx.waker().clone());
        Poll::Pending
    })
    .await
}

async fn wait_for_credit(shared: Arc<Mutex<Shared>>) -> Result<(), StreamError> {
    future::poll_fn(move |cx| {
        let mut guard = match shared.try_lock() {
            Some(g) => g,
            None => {
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
        };
        if guard.send_window > 0 || !guard.state.can_write() {
            return Poll::Ready(Ok(()));
        }
        guard.writer = Some(cx.waker().clone());
        Poll::Pending
    })
    .await
}

async fn with_deadline<F>(deadline: Option<Instant>, fut: F) -> Result<(), StreamError>
where
    F: std::future::Future<Output = Result<(), StreamError>>,
{
    match deadline {
        None => fut.await,
        Some(d) => {
            let now = Instant::now();
            if now >= d {
                return Err(StreamError::Timeout);
            }
            futures::pin_mut!(fut);
            let timer = async_std::task::sleep(d - now);
            futures::pin_mut!(timer);
            match future::select(fut, timer).await {
                future::Either::Left((res, _)) => res,
                future::Either::Right((_, _)) => Err(StreamError::Timeout),
            }
        }
    }
}

/// Shared, session-mutated stream state: lifecycle, flow-control windows,
/// receive buffer and wakers. The session reader task is the sole mutator
/// other than the owning stream's own `close`/`reset`.
pub(crate) struct Shared {
    pub(crate) state: State,
    pub(crate) recv_window: u32,
    pub(crate) max_recv_window: u32,
    pub(crate) send_window: u32,
    pub(crate) buffer: Chunks,
    pub(crate) reader: Option<Waker>,
    pub(crate) writer: Option<Waker>,
    pub(crate) reader_pending: bool,
    pub(crate) window_update_mode: WindowUpdateMode,
}

impl Shared {
    fn new(window: u32, credit: u32, window_update_mode: WindowUpdateMode) -> Self {
        Shared {
            state: State::Init,
            recv_window: window,
            max_recv_window: window,
            send_window: credit,
            buffer: Chunks::new(),
            reader: None,
            writer: None,
            reader_pending: false,
            window_update_mode,
        }
    }

    pub(crate) fn wake_reader(&mut self) {
        if let Some(w) = self.reader.take() {
            w.wake();
        }
    }

    pub(crate) fn wake_writer(&mut self) {
        if let Some(w) = self.writer.take() {
            w.wake();
        }
    }

    pub(crate) fn wake_all(&mut self) {
        self.wake_reader();
        self.wake_writer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_write_excludes_half_closed_and_terminal_states() {
        assert!(State::Open.can_write());
        assert!(State::RemoteHalfClosed.can_write());
        assert!(!State::LocalHalfClosed.can_write());
        assert!(!State::Closed.can_write());
        assert!(!State::Reset.can_write());
    }
}
