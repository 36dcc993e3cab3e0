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

//! Noise `XX` handshake as the one shipped [`SecurityProtocol`]. Noise
//! itself only authenticates the ephemeral X25519 static key it exchanges;
//! binding that to a stable `PeerId` needs an identity payload the same way
//! libp2p's noise transport does: each side signs its X25519 static public
//! key with its long-lived Ed25519 identity key and sends
//! `(ed25519 public key, signature)` as the handshake payload.

use crate::error::SecurityError;
use crate::peer::{Keypair, PeerId, PublicKey};
use crate::secured::SecuredConnection;
use crate::transport::TransportConn;
use rand::rngs::OsRng;
use snow::{Builder, HandshakeState};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

const NOISE_PARAMS: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";
const SIGNATURE_DOMAIN: &[u8] = b"noise-libp2p-static-key:";
const MAX_HANDSHAKE_MSG: usize = 4096;

/// Role a side plays in the handshake, matching spec.md's client/server split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// The one `SecurityProtocol` this crate ships: Noise `XX` over `snow`,
/// with libp2p-style identity binding.
#[derive(Clone)]
pub struct NoiseConfig {
    identity: Keypair,
}

impl NoiseConfig {
    pub fn new(identity: Keypair) -> Self {
        NoiseConfig { identity }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.identity.public().into_peer_id()
    }

    /// Run the handshake over `transport` as the dialer. Whether the
    /// authenticated remote matches an expected peer id is the caller's
    /// concern (see `upgrade::Upgrader`), not this layer's.
    pub async fn secure_outbound<T: TransportConn>(&self, transport: T) -> Result<SecuredConnection<T>, SecurityError> {
        self.run(transport, Role::Client).await
    }

    /// Run the handshake over `transport` as the listener.
    pub async fn secure_inbound<T: TransportConn>(&self, transport: T) -> Result<SecuredConnection<T>, SecurityError> {
        self.run(transport, Role::Server).await
    }

    async fn run<T: TransportConn>(&self, transport: T, role: Role) -> Result<SecuredConnection<T>, SecurityError> {
        let local_static = StaticSecret::random_from_rng(OsRng);
        let local_static_pub = X25519Public::from(&local_static);

        let params = NOISE_PARAMS.parse().map_err(|e| SecurityError::HandshakeFailed(format!("bad noise params: {}", e)))?;
        let builder = Builder::new(params).local_private_key(local_static.as_bytes());
        let mut hs: HandshakeState = match role {
            Role::Client => builder.build_initiator(),
            Role::Server => builder.build_responder(),
        }
        .map_err(|e| SecurityError::HandshakeFailed(e.to_string()))?;

        let identity_payload = sign_identity_payload(&self.identity, local_static_pub.as_bytes());
        let remote_identity_payload;

        let mut buf = vec![0u8; MAX_HANDSHAKE_MSG];
        match role {
            Role::Client => {
                // -> e
                let n = hs.write_message(&[], &mut buf).map_err(|e| SecurityError::HandshakeFailed(e.to_string()))?;
                write_handshake_frame(&transport, &buf[..n]).await?;

                // <- e, ee, s, es  (+ responder identity payload)
                let msg = read_handshake_frame(&transport).await?;
                let mut payload = vec![0u8; MAX_HANDSHAKE_MSG];
                let n = hs.read_message(&msg, &mut payload).map_err(|_| SecurityError::SecurityFailed)?;
                remote_identity_payload = Some(payload[..n].to_vec());

                // -> s, se (+ our identity payload)
                let n = hs
                    .write_message(&identity_payload, &mut buf)
                    .map_err(|e| SecurityError::HandshakeFailed(e.to_string()))?;
                write_handshake_frame(&transport, &buf[..n]).await?;
            }
            Role::Server => {
                // -> e
                let msg = read_handshake_frame(&transport).await?;
                let mut payload = vec![0u8; MAX_HANDSHAKE_MSG];
                hs.read_message(&msg, &mut payload).map_err(|_| SecurityError::SecurityFailed)?;

                // <- e, ee, s, es (+ our identity payload)
                let n = hs
                    .write_message(&identity_payload, &mut buf)
                    .map_err(|e| SecurityError::HandshakeFailed(e.to_string()))?;
                write_handshake_frame(&transport, &buf[..n]).await?;

                // -> s, se (+ remote identity payload)
                let msg = read_handshake_frame(&transport).await?;
                let mut payload = vec![0u8; MAX_HANDSHAKE_MSG];
                let n = hs.read_message(&msg, &mut payload).map_err(|_| SecurityError::SecurityFailed)?;
                remote_identity_payload = Some(payload[..n].to_vec());
            }
        }

        let remote_static = hs
            .get_remote_static()
            .ok_or_else(|| SecurityError::HandshakeFailed("remote static key missing after XX handshake".into()))?
            .to_vec();

        let remote_identity_payload =
            remote_identity_payload.ok_or_else(|| SecurityError::HandshakeFailed("remote identity payload missing".into()))?;
        let remote_peer = verify_identity_payload(&remote_identity_payload, &remote_static)?;

        let (key_initiator, key_responder) = hs.dangerously_get_raw_split();
        let (send_key, recv_key) = match role {
            Role::Client => (key_initiator, key_responder),
            Role::Server => (key_responder, key_initiator),
        };

        Ok(SecuredConnection::new(transport, self.local_peer_id(), remote_peer, send_key, recv_key))
    }
}

fn sign_identity_payload(identity: &Keypair, static_pub_key: &[u8; 32]) -> Vec<u8> {
    let mut to_sign = Vec::with_capacity(SIGNATURE_DOMAIN.len() + 32);
    to_sign.extend_from_slice(SIGNATURE_DOMAIN);
    to_sign.extend_from_slice(static_pub_key);
    let signature = identity.sign(&to_sign);

    let public = identity.public().to_bytes();
    let mut payload = Vec::with_capacity(32 + 64);
    payload.extend_from_slice(&public);
    payload.extend_from_slice(&signature);
    payload
}

fn verify_identity_payload(payload: &[u8], remote_static_key: &[u8]) -> Result<PeerId, SecurityError> {
    if payload.len() != 32 + 64 {
        return Err(SecurityError::HandshakeFailed("malformed identity payload".into()));
    }
    let mut pub_bytes = [0u8; 32];
    pub_bytes.copy_from_slice(&payload[..32]);
    let mut sig = [0u8; 64];
    sig.copy_from_slice(&payload[32..]);

    let public = PublicKey::from_bytes(&pub_bytes).map_err(|e| SecurityError::HandshakeFailed(e.to_string()))?;

    let mut to_verify = Vec::with_capacity(SIGNATURE_DOMAIN.len() + remote_static_key.len());
    to_verify.extend_from_slice(SIGNATURE_DOMAIN);
    to_verify.extend_from_slice(remote_static_key);
    if !public.verify(&to_verify, &sig) {
        return Err(SecurityError::SecurityFailed);
    }
    Ok(public.into_peer_id())
}

async fn write_handshake_frame<T: TransportConn>(transport: &T, msg: &[u8]) -> Result<(), SecurityError> {
    let mut framed = Vec::with_capacity(2 + msg.len());
    framed.extend_from_slice(&(msg.len() as u16).to_be_bytes());
    framed.extend_from_slice(msg);
    transport.write(&framed).await.map_err(SecurityError::from)
}

async fn read_handshake_frame<T: TransportConn>(transport: &T) -> Result<Vec<u8>, SecurityError> {
    let mut len_buf = [0u8; 2];
    read_exact(transport, &mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut msg = vec![0u8; len];
    read_exact(transport, &mut msg).await?;
    Ok(msg)
}

async fn read_exact<T: TransportConn>(transport: &T, buf: &mut [u8]) -> Result<(), SecurityError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = transport.read(&mut buf[filled..]).await.map_err(SecurityError::from)?;
        if n == 0 {
            return Err(SecurityError::UnexpectedEof);
        }
        filled += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryDuplex;

    #[async_std::test]
    async fn xx_handshake_authenticates_both_sides() {
        let (ta, tb) = MemoryDuplex::pair(64);
        let client_identity = Keypair::generate();
        let server_identity = Keypair::generate();
        let client_cfg = NoiseConfig::new(client_identity.clone());
        let server_cfg = NoiseConfig::new(server_identity.clone());

        let client_peer_id = client_cfg.local_peer_id();
        let server_peer_id = server_cfg.local_peer_id();

        let client_fut = client_cfg.secure_outbound(ta);
        let server_fut = server_cfg.secure_inbound(tb);

        let (client_secured, server_secured) = futures::join!(client_fut, server_fut);
        let client_secured = client_secured.unwrap();
        let server_secured = server_secured.unwrap();

        assert_eq!(client_secured.remote_peer(), &server_peer_id);
        assert_eq!(server_secured.remote_peer(), &client_peer_id);

        client_secured.write(b"post-handshake hello").await.unwrap();
        let got = server_secured.read().await.unwrap();
        assert_eq!(got, b"post-handshake hello");
    }
}
