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

//! Resource-scope bookkeeping consumed by [`crate::upgrade`]. The actual
//! limiter policy (byte/fd/stream accounting across the whole host) lives
//! outside this core; `Upgrader` only needs something to open a connection
//! scope on and release on close.

use crate::peer::PeerId;

/// One connection's resource scope: opened by the upgrader right after a
/// muxer has been selected, released when the connection closes.
pub trait ConnectionScope: Send + Sync {
    /// Attach the verified remote peer to this scope.
    fn set_peer(&self, peer: &PeerId);
    /// Release the scope. Idempotent.
    fn done(&self);
}

/// Opens per-connection scopes. Implementations typically enforce global
/// connection/stream/memory limits; this core only calls into the
/// interface, it never enforces limits itself.
pub trait ResourceManager: Send + Sync {
    fn open_connection(&self) -> Box<dyn ConnectionScope>;
}

/// A `ResourceManager` that imposes no limits and does no accounting,
/// suitable for tests and for hosts that delegate limits elsewhere.
#[derive(Default, Clone, Copy)]
pub struct NullResourceManager;

struct NullScope;

impl ConnectionScope for NullScope {
    fn set_peer(&self, _peer: &PeerId) {}
    fn done(&self) {}
}

impl ResourceManager for NullResourceManager {
    fn open_connection(&self) -> Box<dyn ConnectionScope> {
        Box::new(NullScope)
    }
}
