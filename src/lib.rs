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

//! Core of a peer-to-peer secured, multiplexed connection stack.
//!
//! Three pieces compose to turn a raw byte pipe into many flow-controlled
//! application streams:
//!
//! - [`secured`]: atomic encrypt/decrypt record framing over a
//!   [`transport::TransportConn`].
//! - [`yamux`]: a YAMUX-compatible stream multiplexer on top of a
//!   [`secured::SecuredConnection`].
//! - [`upgrade`]: orchestration that dials/accepts a raw connection,
//!   negotiates security then a muxer, and returns a [`upgrade::MuxedConn`].

pub mod error;
pub mod peer;
pub mod resource;
pub mod secured;
pub mod transport;
pub mod upgrade;
pub mod yamux;

pub use error::{ConnectionError, SecurityError, StreamError, UpgradeError};
pub use peer::{Keypair, PeerId};
pub use transport::TransportConn;
