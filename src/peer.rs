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

//! Peer identity. Key generation and peer-id derivation are external
//! collaborators per spec; this module only carries the value types the
//! rest of the core needs to move around: a `Keypair` wrapper and the
//! `PeerId` derived from a public key's bytes.

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use std::fmt;

/// An Ed25519 keypair. Generation is a thin wrapper over `ed25519-dalek`;
/// this core never invents its own key material format.
#[derive(Clone)]
pub struct Keypair(SigningKey);

impl Keypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Keypair(SigningKey::generate(&mut rng))
    }

    /// Wrap an existing signing key.
    pub fn from_signing_key(key: SigningKey) -> Self {
        Keypair(key)
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }

    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        self.0.sign(msg).to_bytes()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Keypair").field(&self.public()).finish()
    }
}

/// An Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, ed25519_dalek::SignatureError> {
        Ok(PublicKey(VerifyingKey::from_bytes(bytes)?))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn verify(&self, msg: &[u8], sig: &[u8; 64]) -> bool {
        use ed25519_dalek::{Signature, Verifier};
        let sig = Signature::from_bytes(sig);
        self.0.verify(msg, &sig).is_ok()
    }

    /// Derive the stable `PeerId` for this key: the SHA-256 digest of the
    /// raw public key bytes, matching the identity scheme the rest of the
    /// core treats as opaque and externally supplied.
    pub fn into_peer_id(self) -> PeerId {
        PeerId::from_public_key_bytes(&self.0.to_bytes())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex(&self.to_bytes()))
    }
}

/// Opaque, stable peer identifier. Equality is by bytes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PeerId(Vec<u8>);

impl PeerId {
    fn from_public_key_bytes(bytes: &[u8]) -> Self {
        use sha2_peer_id::digest;
        PeerId(digest(bytes))
    }

    /// Build a `PeerId` directly from arbitrary bytes, for tests that need a
    /// stand-in identity without a real keypair.
    #[cfg(test)]
    pub(crate) fn from_public_key_bytes_for_test(bytes: &[u8]) -> Self {
        Self::from_public_key_bytes(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", hex(&self.0))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex(&self.0))
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

mod sha2_peer_id {
    use sha2::{Digest, Sha256};

    pub fn digest(data: &[u8]) -> Vec<u8> {
        Sha256::digest(data).to_vec()
    }
}
