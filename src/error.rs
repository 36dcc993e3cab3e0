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

//! Error taxonomy for the secured/muxed connection core.

use std::{fmt, io};

/// Errors raised by the [`crate::secured`] record-framing layer.
#[non_exhaustive]
#[derive(Debug)]
pub enum SecurityError {
    /// The underlying transport failed (I/O error, reset, closed pipe).
    Transport(io::Error),
    /// AEAD authentication failed while decrypting a record.
    SecurityFailed,
    /// A record's length prefix was zero or exceeded the configured maximum.
    ProtocolViolation(&'static str),
    /// The transport reached EOF in the middle of a record.
    UnexpectedEof,
    /// A handshake-specific failure (key exchange, signature, transcript).
    HandshakeFailed(String),
    /// Operations are no longer possible because the connection already failed or closed.
    Closed,
}

impl fmt::Display for SecurityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityError::Transport(e) => write!(f, "transport error: {}", e),
            SecurityError::SecurityFailed => write!(f, "MAC verification failed"),
            SecurityError::ProtocolViolation(why) => write!(f, "secured-record protocol violation: {}", why),
            SecurityError::UnexpectedEof => write!(f, "unexpected EOF mid-record"),
            SecurityError::HandshakeFailed(why) => write!(f, "handshake failed: {}", why),
            SecurityError::Closed => write!(f, "secured connection is closed"),
        }
    }
}

impl std::error::Error for SecurityError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SecurityError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SecurityError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            SecurityError::UnexpectedEof
        } else {
            SecurityError::Transport(e)
        }
    }
}

impl From<SecurityError> for io::Error {
    fn from(e: SecurityError) -> Self {
        match e {
            SecurityError::Transport(e) => e,
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}

/// Errors that are fatal to a whole [`crate::yamux::YamuxSession`].
#[non_exhaustive]
#[derive(Debug)]
pub enum ConnectionError {
    /// The secured layer failed; the session cannot continue.
    Security(SecurityError),
    /// A malformed frame, window overflow, SYN for an existing id, or version mismatch.
    ProtocolViolation(&'static str),
    /// The keepalive PING did not receive an ACK within the interval.
    SessionTimeout,
    /// `next_out_id` wrapped around `u32::MAX`.
    StreamIdExhausted,
    /// The session is already closed.
    Closed,
    /// A GO_AWAY was sent or received; new streams are refused. `code` is the
    /// GO_AWAY error code (0=normal, 1=protocol, 2=internal).
    GoneAway { code: u32 },
    /// `open_stream` was refused because the session already has `max_streams`
    /// live entries in its stream table.
    ResourceLimit,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Security(e) => write!(f, "secured connection failed: {}", e),
            ConnectionError::ProtocolViolation(why) => write!(f, "yamux protocol violation: {}", why),
            ConnectionError::SessionTimeout => write!(f, "session keepalive timed out"),
            ConnectionError::StreamIdExhausted => write!(f, "stream id space exhausted"),
            ConnectionError::Closed => write!(f, "session is closed"),
            ConnectionError::GoneAway { code } => write!(f, "session received or sent GO_AWAY (code {})", code),
            ConnectionError::ResourceLimit => write!(f, "session stream table is at max_streams"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Security(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SecurityError> for ConnectionError {
    fn from(e: SecurityError) -> Self {
        ConnectionError::Security(e)
    }
}

/// The lifecycle state a [`crate::yamux::YamuxStream`] was in when an illegal
/// operation was attempted, for [`StreamError::StateError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStateTag {
    Init,
    SynSent,
    SynReceived,
    Open,
    LocalHalfClosed,
    RemoteHalfClosed,
    Closed,
    Reset,
}

impl fmt::Display for StreamStateTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamStateTag::Init => "init",
            StreamStateTag::SynSent => "syn_sent",
            StreamStateTag::SynReceived => "syn_received",
            StreamStateTag::Open => "open",
            StreamStateTag::LocalHalfClosed => "local_half_closed",
            StreamStateTag::RemoteHalfClosed => "remote_half_closed",
            StreamStateTag::Closed => "closed",
            StreamStateTag::Reset => "reset",
        };
        f.write_str(s)
    }
}

/// Errors local to one [`crate::yamux::YamuxStream`]; never fatal to the session.
#[non_exhaustive]
#[derive(Debug)]
pub enum StreamError {
    /// `operation` is illegal while the stream is in `state` (e.g. write on Closed,
    /// a second concurrent read, or any I/O on Reset).
    StateError { state: StreamStateTag, operation: &'static str, reason: &'static str },
    /// A read or write deadline elapsed.
    Timeout,
    /// The peer sent RST, or we did; pending I/O on this stream fails with this.
    Reset,
    /// `max_streams` was exceeded, or the inbound accept queue was full.
    ResourceLimit,
    /// The caller's operation was cancelled before completion.
    Cancelled,
    /// The owning session is gone.
    SessionClosed,
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::StateError { state, operation, reason } => {
                write!(f, "{} illegal in state {}: {}", operation, state, reason)
            }
            StreamError::Timeout => write!(f, "stream deadline elapsed"),
            StreamError::Reset => write!(f, "stream was reset"),
            StreamError::ResourceLimit => write!(f, "stream resource limit exceeded"),
            StreamError::Cancelled => write!(f, "operation cancelled"),
            StreamError::SessionClosed => write!(f, "owning session closed"),
        }
    }
}

impl std::error::Error for StreamError {}

impl From<StreamError> for io::Error {
    fn from(e: StreamError) -> Self {
        let kind = match e {
            StreamError::Timeout => io::ErrorKind::TimedOut,
            StreamError::Reset => io::ErrorKind::ConnectionReset,
            StreamError::StateError { .. } | StreamError::SessionClosed => io::ErrorKind::BrokenPipe,
            StreamError::ResourceLimit => io::ErrorKind::WouldBlock,
            StreamError::Cancelled => io::ErrorKind::Interrupted,
        };
        io::Error::new(kind, e.to_string())
    }
}

/// The negotiation phase during which [`crate::upgrade`] failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradePhase {
    Security,
    Muxer,
}

impl fmt::Display for UpgradePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgradePhase::Security => f.write_str("security"),
            UpgradePhase::Muxer => f.write_str("muxer"),
        }
    }
}

/// Errors from [`crate::upgrade`] orchestration.
#[non_exhaustive]
#[derive(Debug)]
pub enum UpgradeError {
    /// Negotiation failed during `phase`, with `cause` as the underlying error message.
    Failed { phase: UpgradePhase, cause: String },
    /// An outbound dial reached a peer other than the one expected.
    PeerIdMismatch { expected: crate::peer::PeerId, actual: crate::peer::PeerId },
    /// No mutually supported protocol id was found.
    NoCommonProtocol,
}

impl fmt::Display for UpgradeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgradeError::Failed { phase, cause } => write!(f, "upgrade failed during {}: {}", phase, cause),
            UpgradeError::PeerIdMismatch { expected, actual } => {
                write!(f, "peer id mismatch: expected {}, got {}", expected, actual)
            }
            UpgradeError::NoCommonProtocol => write!(f, "no mutually supported protocol"),
        }
    }
}

impl std::error::Error for UpgradeError {}

impl From<SecurityError> for UpgradeError {
    fn from(e: SecurityError) -> Self {
        UpgradeError::Failed { phase: UpgradePhase::Security, cause: e.to_string() }
    }
}

impl From<ConnectionError> for UpgradeError {
    fn from(e: ConnectionError) -> Self {
        UpgradeError::Failed { phase: UpgradePhase::Muxer, cause: e.to_string() }
    }
}
