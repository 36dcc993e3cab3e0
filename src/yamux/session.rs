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

//! `YamuxSession`: one background reader task parsing inbound frames and
//! dispatching them to the stream table, one background writer task
//! draining a single outbound frame queue (the single-writer discipline
//! that keeps every `SecuredConnection::write` call a whole, atomic frame),
//! and an optional keepalive task.

use crate::error::{ConnectionError, SecurityError};
use crate::peer::PeerId;
use crate::secured::SecuredConnection;
use crate::transport::TransportConn;
use crate::yamux::frame::{Flags, Frame, Header, Type};
use crate::yamux::stream::{Flag, Shared, State, StreamCommand, YamuxStream};
use crate::yamux::Config;
use futures::channel::{mpsc, oneshot};
use futures::lock::Mutex as AsyncMutex;
use futures::SinkExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const GO_AWAY_NORMAL: u32 = 0;
const GO_AWAY_PROTOCOL: u32 = 1;
const GO_AWAY_INTERNAL: u32 = 2;

/// Which side of the session we are; determines stream id parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Client,
    Server,
}

impl Mode {
    fn first_stream_id(self) -> u32 {
        match self {
            Mode::Client => 1,
            Mode::Server => 2,
        }
    }
}

struct PingWait {
    opaque: u32,
    started: Instant,
    done: oneshot::Sender<Duration>,
}

struct SessionState {
    streams: Mutex<HashMap<u32, Arc<AsyncMutex<Shared>>>>,
    next_out_id: AtomicU32,
    go_away_sent: AtomicBool,
    go_away_received: Mutex<Option<u32>>,
    closed: AtomicBool,
    pending_ping: Mutex<Option<PingWait>>,
    next_ping_opaque: AtomicU32,
    last_outbound: Mutex<Instant>,
}

/// A live YAMUX session over a [`SecuredConnection`].
pub struct YamuxSession<T: TransportConn + 'static> {
    secured: SecuredConnection<T>,
    config: Arc<Config>,
    state: Arc<SessionState>,
    out_tx: mpsc::Sender<StreamCommand>,
    accept_rx: AsyncMutex<mpsc::Receiver<YamuxStream>>,
    accept_tx: mpsc::Sender<YamuxStream>,
    tasks: Mutex<Vec<async_std::task::JoinHandle<()>>>,
}

impl<T: TransportConn + 'static> YamuxSession<T> {
    /// Start a session over `secured`, spawning its reader/writer/keepalive
    /// background tasks.
    pub fn new(secured: SecuredConnection<T>, config: Config, mode: Mode) -> Arc<Self> {
        log::debug!("starting yamux session in {:?} mode", mode);
        let (out_tx, out_rx) = mpsc::channel(1024);
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_queue_size);
        let state = Arc::new(SessionState {
            streams: Mutex::new(HashMap::new()),
            next_out_id: AtomicU32::new(mode.first_stream_id()),
            go_away_sent: AtomicBool::new(false),
            go_away_received: Mutex::new(None),
            closed: AtomicBool::new(false),
            pending_ping: Mutex::new(None),
            next_ping_opaque: AtomicU32::new(1),
            last_outbound: Mutex::new(Instant::now()),
        });

        let session = Arc::new(YamuxSession {
            secured,
            config: Arc::new(config),
            state,
            out_tx,
            accept_rx: AsyncMutex::new(accept_rx),
            accept_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let writer = async_std::task::spawn(writer_task(session.clone(), out_rx));
        let reader = async_std::task::spawn(reader_task(session.clone()));
        let mut handles = vec![writer, reader];
        if let Some(interval) = session.config.keepalive_interval {
            handles.push(async_std::task::spawn(keepalive_task(session.clone(), interval)));
        }
        *session.tasks.lock().unwrap() = handles;
        session
    }

    pub fn local_peer(&self) -> &PeerId {
        self.secured.local_peer()
    }

    pub fn remote_peer(&self) -> &PeerId {
        self.secured.remote_peer()
    }

    /// Open a new outbound stream, honoring `lazy_open`.
    pub async fn open_stream(&self) -> Result<YamuxStream, ConnectionError> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }
        if let Some(code) = *self.state.go_away_received.lock().unwrap() {
            return Err(ConnectionError::GoneAway { code });
        }
        if self.state.go_away_sent.load(Ordering::SeqCst) {
            return Err(ConnectionError::GoneAway { code: GO_AWAY_NORMAL });
        }
        if self.state.streams.lock().unwrap().len() >= self.config.max_streams {
            return Err(ConnectionError::ResourceLimit);
        }

        let id = self.state.next_out_id.fetch_add(2, Ordering::SeqCst);
        if id > u32::MAX - 2 {
            return Err(ConnectionError::StreamIdExhausted);
        }

        let flag = if self.config.lazy_open { Flag::Syn } else { Flag::None };
        let stream = YamuxStream::new(id, self.config.clone(), self.config.initial_window, self.config.initial_window, self.out_tx.clone(), flag);
        self.set_stream_state(&stream, State::SynSent).await;
        self.state.streams.lock().unwrap().insert(id, stream.shared_handle());

        if !self.config.lazy_open {
            let frame = Frame::data(id, Vec::new());
            let mut frame = frame;
            frame.header = frame.header.syn();
            self.send_control_frame(frame).await.map_err(ConnectionError::Security)?;
        }
        Ok(stream)
    }

    /// Wait for the next inbound stream.
    pub async fn accept_stream(&self) -> Result<YamuxStream, ConnectionError> {
        use futures::StreamExt;
        let mut rx = self.accept_rx.lock().await;
        match rx.next().await {
            Some(stream) => Ok(stream),
            None => {
                if let Some(code) = *self.state.go_away_received.lock().unwrap() {
                    Err(ConnectionError::GoneAway { code })
                } else {
                    Err(ConnectionError::Closed)
                }
            }
        }
    }

    /// Round-trip a PING and report the elapsed time.
    pub async fn ping(&self) -> Result<Duration, ConnectionError> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }
        let opaque = self.state.next_ping_opaque.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.state.pending_ping.lock().unwrap();
            if pending.is_some() {
                return Err(ConnectionError::ProtocolViolation("ping already in flight"));
            }
            *pending = Some(PingWait { opaque, started: Instant::now(), done: tx });
        }
        let mut frame = Frame::ping(opaque);
        frame.header = frame.header.syn();
        self.send_control_frame(frame).await.map_err(ConnectionError::Security)?;
        rx.await.map_err(|_| ConnectionError::Closed)
    }

    /// Send GO_AWAY(normal), reset all live streams, and close the secured
    /// connection. Idempotent.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.state.go_away_sent.swap(true, Ordering::SeqCst) {
            let _ = self.send_control_frame(Frame::go_away(GO_AWAY_NORMAL)).await;
        }
        let entries: Vec<_> = self.state.streams.lock().unwrap().drain().collect();
        for (_, shared) in entries {
            let mut guard = shared.lock().await;
            guard.state = State::Reset;
            guard.wake_all();
        }
        self.secured.close().await.map_err(ConnectionError::Security)?;
        Ok(())
    }

    async fn set_stream_state(&self, stream: &YamuxStream, state: State) {
        stream.shared_handle().lock().await.state = state;
    }

    async fn send_control_frame(&self, frame: Frame) -> Result<(), SecurityError> {
        let mut tx = self.out_tx.clone();
        tx.send(StreamCommand::SendFrame(frame)).await.map_err(|_| SecurityError::Closed)
    }

    fn fail_session(self: &Arc<Self>, reason: &'static str) {
        log::warn!("yamux session failing: {}", reason);
        let session = self.clone();
        async_std::task::spawn(async move {
            let _ = session.abort(GO_AWAY_PROTOCOL).await;
        });
    }

    async fn abort(&self, code: u32) -> Result<(), ConnectionError> {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.state.go_away_sent.swap(true, Ordering::SeqCst) {
            let _ = self.send_control_frame(Frame::go_away(code)).await;
        }
        let entries: Vec<_> = self.state.streams.lock().unwrap().drain().collect();
        for (_, shared) in entries {
            let mut guard = shared.lock().await;
            guard.state = State::Reset;
            guard.wake_all();
        }
        self.secured.close().await.map_err(ConnectionError::Security)
    }
}

async fn writer_task<T: TransportConn + 'static>(session: Arc<YamuxSession<T>>, mut rx: mpsc::Receiver<StreamCommand>) {
    use futures::StreamExt;
    while let Some(cmd) = rx.next().await {
        match cmd {
            StreamCommand::SendFrame(frame) => {
                let bytes = frame.encode();
                if let Err(e) = session.secured.write(&bytes).await {
                    log::warn!("yamux writer: secured write failed: {}", e);
                    break;
                }
                *session.state.last_outbound.lock().unwrap() = Instant::now();
            }
            StreamCommand::CloseStream { id } => {
                reap_if_terminal(&session, id).await;
            }
            StreamCommand::ResetStream { id } => {
                session.state.streams.lock().unwrap().remove(&id);
            }
        }
    }
    log::info!("yamux writer task exiting");
}

async fn reap_if_terminal<T: TransportConn + 'static>(session: &Arc<YamuxSession<T>>, id: u32) {
    let shared = session.state.streams.lock().unwrap().get(&id).cloned();
    if let Some(shared) = shared {
        let guard = shared.lock().await;
        if matches!(guard.state, State::Closed | State::Reset) {
            drop(guard);
            session.state.streams.lock().unwrap().remove(&id);
        }
    }
}

async fn reader_task<T: TransportConn + 'static>(session: Arc<YamuxSession<T>>) {
    loop {
        let record = match session.secured.read().await {
            Ok(r) => r,
            Err(e) => {
                log::info!("yamux reader: secured connection ended: {}", e);
                break;
            }
        };
        if record.len() < crate::yamux::frame::HEADER_LEN {
            session.fail_session("short frame");
            break;
        }
        let header = match Header::decode(&record[..crate::yamux::frame::HEADER_LEN]) {
            Ok(h) => h,
            Err(e) => {
                log::warn!("yamux reader: bad header: {}", e);
                session.fail_session("malformed header");
                break;
            }
        };
        let body = record[crate::yamux::frame::HEADER_LEN..].to_vec();

        match header.ty {
            Type::Data => handle_data(&session, header, body).await,
            Type::WindowUpdate => handle_window_update(&session, header).await,
            Type::Ping => handle_ping(&session, header).await,
            Type::GoAway => handle_go_away(&session, header),
        }

        if session.state.closed.load(Ordering::SeqCst) {
            break;
        }
    }
    // Unblock any `accept_stream` waiting on an empty queue: once the reader
    // is gone no further inbound streams can ever arrive, so pending and
    // future accepts must observe GO_AWAY or Closed rather than hang.
    session.accept_tx.clone().close_channel();
    log::info!("yamux reader task exiting");
}

async fn handle_data<T: TransportConn + 'static>(session: &Arc<YamuxSession<T>>, header: Header, body: Vec<u8>) {
    let id = header.stream_id;
    let is_new = header.flags.contains(Flags::SYN);

    let shared = if is_new {
        let refuse = session.state.go_away_sent.load(Ordering::SeqCst) || {
            let streams = session.state.streams.lock().unwrap();
            streams.contains_key(&id) || streams.len() >= session.config.max_streams
        };
        if refuse {
            log::debug!("yamux: refusing inbound stream {} (duplicate id, over max_streams, or GO_AWAY sent)", id);
            let mut rst = Frame::data(id, Vec::new());
            rst.header = rst.header.rst();
            let _ = session.send_control_frame(rst).await;
            return;
        }

        let new_stream = YamuxStream::new(
            id,
            session.config.clone(),
            session.config.initial_window,
            session.config.initial_window,
            session.out_tx.clone(),
            Flag::None,
        );
        let new_shared = new_stream.shared_handle();
        {
            let mut guard = new_shared.lock().await;
            guard.state = State::Open;
        }
        session.state.streams.lock().unwrap().insert(id, new_shared.clone());

        let mut accept_tx = session.accept_tx.clone();
        if accept_tx.try_send(new_stream).is_err() {
            log::debug!("yamux: accept queue full, refusing inbound stream {}", id);
            session.state.streams.lock().unwrap().remove(&id);
            let mut rst = Frame::data(id, Vec::new());
            rst.header = rst.header.rst();
            let _ = session.send_control_frame(rst).await;
            return;
        }

        let mut ack = Frame::data(id, Vec::new());
        ack.header = ack.header.ack();
        let _ = session.send_control_frame(ack).await;
        new_shared
    } else {
        let found = session.state.streams.lock().unwrap().get(&id).cloned();
        match found {
            Some(s) => s,
            None => return, // frame for an unknown/already-reaped stream id; ignore
        }
    };

    if header.flags.contains(Flags::ACK) {
        let mut guard = shared.lock().await;
        if guard.state == State::SynSent {
            guard.state = State::Open;
        }
    }

    if !body.is_empty() {
        let mut guard = shared.lock().await;
        if body.len() as u32 > guard.recv_window {
            drop(guard);
            log::warn!("yamux: stream {} exceeded its receive window", id);
            session.fail_session("receive window exceeded");
            return;
        }
        guard.recv_window -= body.len() as u32;
        guard.buffer.push(body);
        guard.wake_reader();

        if guard.window_update_mode == crate::yamux::WindowUpdateMode::OnReceive && guard.recv_window < guard.max_recv_window / 2 {
            if guard.max_recv_window < session.config.max_window {
                guard.max_recv_window = guard.max_recv_window.saturating_mul(2).min(session.config.max_window);
            }
            let delta = guard.max_recv_window - guard.recv_window;
            guard.recv_window = guard.max_recv_window;
            drop(guard);
            let update = Frame::window_update(id, delta);
            let _ = session.send_control_frame(update).await;
        }
    }

    if header.flags.contains(Flags::FIN) {
        let mut guard = shared.lock().await;
        guard.state = match guard.state {
            State::LocalHalfClosed => State::Closed,
            _ => State::RemoteHalfClosed,
        };
        guard.wake_reader();
    }

    if header.flags.contains(Flags::RST) {
        let mut guard = shared.lock().await;
        guard.state = State::Reset;
        guard.wake_all();
        drop(guard);
        session.state.streams.lock().unwrap().remove(&id);
    }
}

async fn handle_window_update<T: TransportConn + 'static>(session: &Arc<YamuxSession<T>>, header: Header) {
    let shared = session.state.streams.lock().unwrap().get(&header.stream_id).cloned();
    if let Some(shared) = shared {
        let mut guard = shared.lock().await;
        guard.send_window = guard.send_window.saturating_add(header.length);
        guard.wake_writer();
    }
}

async fn handle_ping<T: TransportConn + 'static>(session: &Arc<YamuxSession<T>>, header: Header) {
    if header.flags.contains(Flags::SYN) {
        let mut reply = Frame::ping(header.length);
        reply.header = reply.header.ack();
        let _ = session.send_control_frame(reply).await;
    } else if header.flags.contains(Flags::ACK) {
        let mut pending = session.state.pending_ping.lock().unwrap();
        if let Some(wait) = pending.take() {
            if wait.opaque == header.length {
                let _ = wait.done.send(wait.started.elapsed());
            } else {
                *pending = Some(wait);
            }
        }
    }
}

fn handle_go_away<T: TransportConn + 'static>(session: &Arc<YamuxSession<T>>, header: Header) {
    log::info!("yamux: received GO_AWAY (code {})", header.length);
    *session.state.go_away_received.lock().unwrap() = Some(header.length);
}

async fn keepalive_task<T: TransportConn + 'static>(session: Arc<YamuxSession<T>>, interval: Duration) {
    loop {
        async_std::task::sleep(interval).await;
        if session.state.closed.load(Ordering::SeqCst) {
            break;
        }
        let idle_for = session.state.last_outbound.lock().unwrap().elapsed();
        if idle_for < interval {
            continue;
        }
        match async_std::future::timeout(interval, session.ping()).await {
            Ok(Ok(rtt)) => log::trace!("yamux keepalive: ping round-trip {:?}", rtt),
            Ok(Err(e)) => {
                log::warn!("yamux keepalive: ping failed: {}", e);
                break;
            }
            Err(_) => {
                log::warn!("yamux keepalive: ping timed out, closing session");
                let _ = session.abort(GO_AWAY_INTERNAL).await;
                break;
            }
        }
    }
    log::info!("yamux keepalive task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamError;
    use crate::transport::MemoryDuplex;

    fn pair(config: Config) -> (Arc<YamuxSession<MemoryDuplex>>, Arc<YamuxSession<MemoryDuplex>>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let (ta, tb) = MemoryDuplex::pair(4096);
        let client_peer = PeerId::from_public_key_bytes_for_test(b"client");
        let server_peer = PeerId::from_public_key_bytes_for_test(b"server");
        let key_cs = [1u8; 32];
        let key_sc = [2u8; 32];
        let secured_client = SecuredConnection::new(ta, client_peer.clone(), server_peer.clone(), key_cs, key_sc);
        let secured_server = SecuredConnection::new(tb, server_peer, client_peer, key_sc, key_cs);
        let client = YamuxSession::new(secured_client, config.clone(), Mode::Client);
        let server = YamuxSession::new(secured_server, config, Mode::Server);
        (client, server)
    }

    async fn read_until_eof(stream: &mut YamuxStream) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let chunk = stream.read().await.unwrap();
            if chunk.is_empty() {
                break;
            }
            out.extend(chunk);
        }
        out
    }

    async fn round_trip_size(size: usize) {
        let (client, server) = pair(Config::new());
        let payload: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();

        let client_task = {
            let payload = payload.clone();
            let client = client.clone();
            async_std::task::spawn(async move {
                let mut stream = client.open_stream().await.unwrap();
                stream.write(&payload).await.unwrap();
                stream.close().await.unwrap();
            })
        };

        let mut accepted = server.accept_stream().await.unwrap();
        let got = read_until_eof(&mut accepted).await;
        client_task.await;
        assert_eq!(got, payload);

        client.close().await.unwrap();
        server.close().await.unwrap();
    }

    // S1: a 50 KiB payload round-trips byte-for-byte.
    #[async_std::test]
    async fn s1_round_trip_50kib() {
        round_trip_size(50 * 1024).await;
    }

    // S2: 96 KiB, the historical mplex/yamux buffer-boundary bug size.
    #[async_std::test]
    async fn s2_round_trip_96kib() {
        round_trip_size(96 * 1024).await;
    }

    // S3: 200 KiB, bigger than a single record/frame but smaller than the
    // default 256 KiB initial window — must still round-trip with no MAC errors.
    #[async_std::test]
    async fn s3_round_trip_200kib() {
        round_trip_size(200 * 1024).await;
    }

    // Flow control: a payload bigger than the initial window forces at least
    // one window update round trip before the writer can finish.
    #[async_std::test]
    async fn round_trip_exceeding_initial_window_exercises_backpressure() {
        round_trip_size(600 * 1024).await;
    }

    // S4: opening one more stream than `max_streams` fails locally with
    // `ResourceLimit` without consuming a stream id on the wire.
    #[async_std::test]
    async fn s4_max_streams_enforced_on_open() {
        let mut config = Config::new();
        config.set_max_streams(4);
        let (client, server) = pair(config);

        let mut streams = Vec::new();
        for _ in 0..4 {
            streams.push(client.open_stream().await.unwrap());
        }
        let err = match client.open_stream().await {
            Err(e) => e,
            Ok(_) => panic!("expected ResourceLimit"),
        };
        assert!(matches!(err, ConnectionError::ResourceLimit));

        for _ in 0..4 {
            server.accept_stream().await.unwrap();
        }

        client.close().await.unwrap();
        server.close().await.unwrap();
    }

    // `Config::set_window_update_mode` must reach every stream's `Shared`,
    // both the locally-opened side and the inbound-SYN-accepted side.
    #[async_std::test]
    async fn window_update_mode_propagates_from_config() {
        let mut config = Config::new();
        config.set_window_update_mode(crate::yamux::WindowUpdateMode::OnRead);
        let (client, server) = pair(config);

        let client_stream = client.open_stream().await.unwrap();
        let server_stream = server.accept_stream().await.unwrap();

        assert_eq!(
            client_stream.shared_handle().lock().await.window_update_mode,
            crate::yamux::WindowUpdateMode::OnRead
        );
        assert_eq!(
            server_stream.shared_handle().lock().await.window_update_mode,
            crate::yamux::WindowUpdateMode::OnRead
        );

        client.close().await.unwrap();
        server.close().await.unwrap();
    }

    // S5: both sides close(); further read returns EOF, further write fails.
    #[async_std::test]
    async fn s5_half_close_then_full_close_both_sides() {
        let (client, server) = pair(Config::new());

        let mut client_stream = client.open_stream().await.unwrap();
        let mut server_stream = server.accept_stream().await.unwrap();

        let ping = b"ping-32B-aaaaaaaaaaaaaaaaaaaaaaa";
        client_stream.write(ping).await.unwrap();
        let echoed = read_some(&mut server_stream, ping.len()).await;
        assert_eq!(echoed, ping);
        server_stream.write(&echoed).await.unwrap();
        let back = read_some(&mut client_stream, ping.len()).await;
        assert_eq!(back, ping);

        client_stream.close().await.unwrap();
        server_stream.close().await.unwrap();

        // give the FIN frames a moment to cross
        async_std::task::sleep(Duration::from_millis(50)).await;

        assert!(client_stream.read().await.unwrap().is_empty());
        assert!(server_stream.read().await.unwrap().is_empty());

        let err = client_stream.write(b"more").await.unwrap_err();
        assert!(matches!(err, StreamError::StateError { .. }));
        let err = server_stream.write(b"more").await.unwrap_err();
        assert!(matches!(err, StreamError::StateError { .. }));

        client.close().await.unwrap();
        server.close().await.unwrap();
    }

    async fn read_some(stream: &mut YamuxStream, want: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < want {
            out.extend(stream.read().await.unwrap());
        }
        out
    }

    // S6: reset() on one side wakes the peer's pending read with `StreamReset`
    // and removes the id from both stream tables.
    #[async_std::test]
    async fn s6_reset_wakes_peer_pending_read() {
        let (client, server) = pair(Config::new());

        let mut client_stream = client.open_stream().await.unwrap();
        let id = client_stream.id();
        let mut server_stream = server.accept_stream().await.unwrap();

        let reader = async_std::task::spawn(async move { server_stream.read().await });

        async_std::task::sleep(Duration::from_millis(20)).await;
        client_stream.reset().await.unwrap();

        let result = async_std::future::timeout(Duration::from_millis(100), reader).await.expect("peer read did not wake in time");
        assert!(matches!(result, Err(StreamError::Reset)));

        async_std::task::sleep(Duration::from_millis(20)).await;
        assert!(!client.state.streams.lock().unwrap().contains_key(&id));
        assert!(!server.state.streams.lock().unwrap().contains_key(&id));

        client.close().await.unwrap();
        server.close().await.unwrap();
    }

    // No cross-stream interference: N concurrent streams each carry their own
    // distinct payload to the peer, in order, without mixing bytes.
    #[async_std::test]
    async fn no_cross_stream_interference_with_concurrent_streams() {
        const N: usize = 8;
        let (client, server) = pair(Config::new());

        let payloads: Vec<Vec<u8>> = (0..N).map(|i| vec![i as u8; 4096 + i * 37]).collect();

        let writers = {
            let payloads = payloads.clone();
            let client = client.clone();
            async_std::task::spawn(async move {
                let mut handles = Vec::new();
                for payload in payloads {
                    let client = client.clone();
                    handles.push(async_std::task::spawn(async move {
                        let mut stream = client.open_stream().await.unwrap();
                        stream.write(&payload).await.unwrap();
                        stream.close().await.unwrap();
                    }));
                }
                for h in handles {
                    h.await;
                }
            })
        };

        let mut received = Vec::new();
        for _ in 0..N {
            let mut stream = server.accept_stream().await.unwrap();
            received.push(async_std::task::spawn(async move { read_until_eof(&mut stream).await }));
        }
        let mut results = Vec::new();
        for r in received {
            results.push(r.await);
        }
        writers.await;

        results.sort();
        let mut expected = payloads;
        expected.sort();
        assert_eq!(results, expected);

        client.close().await.unwrap();
        server.close().await.unwrap();
    }

    // Keepalive liveness: an idle session with a short keepalive interval
    // completes at least one PING round trip within 2x the interval.
    #[async_std::test]
    async fn keepalive_liveness_on_idle_session() {
        let mut config = Config::new();
        config.set_keepalive_interval(Some(Duration::from_millis(50)));
        let (client, server) = pair(config);

        async_std::task::sleep(Duration::from_millis(150)).await;

        // the session must still be alive and able to open/accept a stream
        let mut c = client.open_stream().await.unwrap();
        let mut s = server.accept_stream().await.unwrap();
        c.write(b"still alive").await.unwrap();
        let got = read_some(&mut s, b"still alive".len()).await;
        assert_eq!(got, b"still alive");

        client.close().await.unwrap();
        server.close().await.unwrap();
    }

    // GO_AWAY: after close() sends GO_AWAY(normal), the peer's accept_stream
    // eventually observes the graceful shutdown rather than a bare Closed error.
    #[async_std::test]
    async fn go_away_is_observable_by_peer() {
        let (client, server) = pair(Config::new());
        client.close().await.unwrap();

        async_std::task::sleep(Duration::from_millis(50)).await;
        let err = match server.accept_stream().await {
            Err(e) => e,
            Ok(_) => panic!("expected GoneAway or Closed"),
        };
        assert!(matches!(err, ConnectionError::GoneAway { code: 0 } | ConnectionError::Closed));
    }
}
