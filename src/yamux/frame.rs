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

//! The 12-byte YAMUX frame header and the frame types built on it.

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const HEADER_LEN: usize = 12;
const VERSION: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Data = 0,
    WindowUpdate = 1,
    Ping = 2,
    GoAway = 3,
}

impl Type {
    fn from_u8(b: u8) -> Result<Self, HeaderDecodeError> {
        match b {
            0 => Ok(Type::Data),
            1 => Ok(Type::WindowUpdate),
            2 => Ok(Type::Ping),
            3 => Ok(Type::GoAway),
            other => Err(HeaderDecodeError::Type(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(pub u16);

impl Flags {
    pub const SYN: u16 = 0x1;
    pub const ACK: u16 = 0x2;
    pub const FIN: u16 = 0x4;
    pub const RST: u16 = 0x8;

    pub fn contains(self, bit: u16) -> bool {
        self.0 & bit != 0
    }

    pub fn with(mut self, bit: u16) -> Self {
        self.0 |= bit;
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub ty: Type,
    pub flags: Flags,
    pub stream_id: u32,
    pub length: u32,
}

impl Header {
    pub fn data(stream_id: u32, length: u32) -> Self {
        Header { ty: Type::Data, flags: Flags::default(), stream_id, length }
    }

    pub fn window_update(stream_id: u32, delta: u32) -> Self {
        Header { ty: Type::WindowUpdate, flags: Flags::default(), stream_id, length: delta }
    }

    pub fn ping(opaque: u32) -> Self {
        Header { ty: Type::Ping, flags: Flags::default(), stream_id: 0, length: opaque }
    }

    pub fn go_away(code: u32) -> Self {
        Header { ty: Type::GoAway, flags: Flags::default(), stream_id: 0, length: code }
    }

    pub fn syn(mut self) -> Self {
        self.flags = self.flags.with(Flags::SYN);
        self
    }

    pub fn ack(mut self) -> Self {
        self.flags = self.flags.with(Flags::ACK);
        self
    }

    pub fn fin(mut self) -> Self {
        self.flags = self.flags.with(Flags::FIN);
        self
    }

    pub fn rst(mut self) -> Self {
        self.flags = self.flags.with(Flags::RST);
        self
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        buf.put_u8(VERSION);
        buf.put_u8(self.ty as u8);
        buf.put_u16(self.flags.0);
        buf.put_u32(self.stream_id);
        buf.put_u32(self.length);
        buf
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self, HeaderDecodeError> {
        if bytes.len() != HEADER_LEN {
            return Err(HeaderDecodeError::Length(bytes.len()));
        }
        let version = bytes.get_u8();
        if version != VERSION {
            return Err(HeaderDecodeError::Version(version));
        }
        let ty = Type::from_u8(bytes.get_u8())?;
        let flags = Flags(bytes.get_u16());
        let stream_id = bytes.get_u32();
        let length = bytes.get_u32();
        Ok(Header { ty, flags, stream_id, length })
    }
}

/// A parsed frame: header plus, for `DATA`, the payload bytes.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: Header,
    pub body: Bytes,
}

impl Frame {
    pub fn data(stream_id: u32, body: Vec<u8>) -> Self {
        Frame { header: Header::data(stream_id, body.len() as u32), body: Bytes::from(body) }
    }

    pub fn window_update(stream_id: u32, delta: u32) -> Self {
        Frame { header: Header::window_update(stream_id, delta), body: Bytes::new() }
    }

    pub fn ping(opaque: u32) -> Self {
        Frame { header: Header::ping(opaque), body: Bytes::new() }
    }

    pub fn go_away(code: u32) -> Self {
        Frame { header: Header::go_away(code), body: Bytes::new() }
    }

    /// Encode header + body into one contiguous buffer, suitable for a single
    /// `SecuredConnection::write` call (one plaintext chunk, one record).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.header.encode();
        buf.extend_from_slice(&self.body);
        buf.to_vec()
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub enum HeaderDecodeError {
    Length(usize),
    Version(u8),
    Type(u8),
}

impl std::fmt::Display for HeaderDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeaderDecodeError::Length(n) => write!(f, "header must be {} bytes, got {}", HEADER_LEN, n),
            HeaderDecodeError::Version(v) => write!(f, "unsupported frame version {}", v),
            HeaderDecodeError::Type(t) => write!(f, "unknown frame type {}", t),
        }
    }
}

impl std::error::Error for HeaderDecodeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let h = Header::data(7, 42).syn();
        let encoded = h.encode();
        let decoded = Header::decode(&encoded).unwrap();
        assert_eq!(decoded.ty, Type::Data);
        assert_eq!(decoded.stream_id, 7);
        assert_eq!(decoded.length, 42);
        assert!(decoded.flags.contains(Flags::SYN));
    }

    #[test]
    fn bad_version_is_rejected() {
        let mut bytes = Header::data(1, 0).encode();
        bytes[0] = 9;
        assert!(matches!(Header::decode(&bytes), Err(HeaderDecodeError::Version(9))));
    }
}
