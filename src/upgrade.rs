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

//! `Upgrader`: pure orchestration turning a raw [`TransportConn`] into a
//! [`MuxedConn`] — negotiate security, negotiate a muxer, register the
//! connection with a [`ResourceManager`]. Neither phase is retried here;
//! a failing handshake or muxer setup closes the raw connection and
//! returns an [`UpgradeError`].

use crate::error::{UpgradeError, UpgradePhase};
use crate::peer::PeerId;
use crate::resource::ResourceManager;
use crate::secured::noise::NoiseConfig;
use crate::transport::TransportConn;
use crate::yamux::{self, Mode, YamuxSession};
use std::sync::Arc;

/// A handle to the selected muxer's session plus the resource scope the
/// `Upgrader` opened for it. `MuxedConn` is what application code holds
/// after a successful upgrade; dropping it does not close the underlying
/// session — call [`MuxedConn::close`] explicitly.
pub struct MuxedConn<T: TransportConn + 'static> {
    session: Arc<YamuxSession<T>>,
    scope: Box<dyn crate::resource::ConnectionScope>,
}

impl<T: TransportConn + 'static> MuxedConn<T> {
    pub fn local_peer(&self) -> &PeerId {
        self.session.local_peer()
    }

    pub fn remote_peer(&self) -> &PeerId {
        self.session.remote_peer()
    }

    pub async fn open_stream(&self) -> Result<yamux::YamuxStream, crate::error::ConnectionError> {
        self.session.open_stream().await
    }

    pub async fn accept_stream(&self) -> Result<yamux::YamuxStream, crate::error::ConnectionError> {
        self.session.accept_stream().await
    }

    /// Tears down the whole underlying connection and every stream on it, not
    /// just one logical stream. Closing while the peer still has a pending
    /// read or write on this connection races a real transport shutdown
    /// against in-flight data; callers that need only one stream done should
    /// use [`yamux::YamuxStream::close`] instead.
    pub async fn close(&self) -> Result<(), crate::error::ConnectionError> {
        let result = self.session.close().await;
        self.scope.done();
        result
    }
}

/// Configuration the `Upgrader` negotiates with. `security_protocols` and
/// `muxers` are ordered by preference; today each carries exactly one
/// entry (Noise-XX, yamux) since this crate ships one implementation of
/// each, but the orchestration already walks the list so a second
/// implementation is a config change, not a rewrite.
pub struct UpgradeConfig {
    pub security_protocols: Vec<NoiseConfig>,
    pub muxers: Vec<yamux::Config>,
}

impl UpgradeConfig {
    pub fn new(security: NoiseConfig, muxer: yamux::Config) -> Self {
        UpgradeConfig { security_protocols: vec![security], muxers: vec![muxer] }
    }
}

/// Orchestrates security then muxer negotiation for both dial and accept
/// directions, registering every upgraded connection with a
/// [`ResourceManager`].
pub struct Upgrader {
    resources: Arc<dyn ResourceManager>,
}

impl Upgrader {
    pub fn new(resources: Arc<dyn ResourceManager>) -> Self {
        Upgrader { resources }
    }

    /// Dial-side upgrade: the handshake must authenticate `expected_remote`
    /// or the whole upgrade fails with `PeerIdMismatch`.
    pub async fn upgrade_outbound<T: TransportConn + 'static>(
        &self,
        raw: T,
        expected_remote: &PeerId,
        config: &UpgradeConfig,
    ) -> Result<MuxedConn<T>, UpgradeError> {
        let security = config
            .security_protocols
            .first()
            .ok_or(UpgradeError::NoCommonProtocol)?;

        let secured = match security.secure_outbound(raw).await {
            Ok(s) => s,
            Err(e) => return Err(UpgradeError::Failed { phase: UpgradePhase::Security, cause: e.to_string() }),
        };

        if secured.remote_peer() != expected_remote {
            let _ = secured.close().await;
            return Err(UpgradeError::PeerIdMismatch { expected: expected_remote.clone(), actual: secured.remote_peer().clone() });
        }

        self.finish_muxer(secured, Mode::Client, config).await
    }

    /// Listen-side upgrade: whichever peer authenticates during the
    /// handshake is accepted, there being no expected peer id to check.
    pub async fn upgrade_inbound<T: TransportConn + 'static>(
        &self,
        raw: T,
        config: &UpgradeConfig,
    ) -> Result<MuxedConn<T>, UpgradeError> {
        let security = config
            .security_protocols
            .first()
            .ok_or(UpgradeError::NoCommonProtocol)?;

        let secured = match security.secure_inbound(raw).await {
            Ok(s) => s,
            Err(e) => return Err(UpgradeError::Failed { phase: UpgradePhase::Security, cause: e.to_string() }),
        };

        self.finish_muxer(secured, Mode::Server, config).await
    }

    async fn finish_muxer<T: TransportConn + 'static>(
        &self,
        secured: crate::secured::SecuredConnection<T>,
        mode: Mode,
        config: &UpgradeConfig,
    ) -> Result<MuxedConn<T>, UpgradeError> {
        let muxer_config = config
            .muxers
            .first()
            .cloned()
            .ok_or(UpgradeError::NoCommonProtocol)?;

        let remote = secured.remote_peer().clone();
        let session = YamuxSession::new(secured, muxer_config, mode);

        let scope = self.resources.open_connection();
        scope.set_peer(&remote);

        log::info!("upgraded connection to {} ({:?})", remote, mode);
        Ok(MuxedConn { session, scope })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::Keypair;
    use crate::resource::NullResourceManager;
    use crate::transport::MemoryDuplex;

    fn config_for(keypair: Keypair) -> UpgradeConfig {
        UpgradeConfig::new(NoiseConfig::new(keypair), yamux::Config::new())
    }

    #[async_std::test]
    async fn outbound_and_inbound_agree_on_peer_identity() {
        let (ta, tb) = MemoryDuplex::pair(256);
        let client_identity = Keypair::generate();
        let server_identity = Keypair::generate();
        let server_peer_id = server_identity.public().into_peer_id();

        let upgrader = Upgrader::new(Arc::new(NullResourceManager));
        let client_cfg = config_for(client_identity);
        let server_cfg = config_for(server_identity);

        let client_fut = upgrader.upgrade_outbound(ta, &server_peer_id, &client_cfg);
        let server_fut = upgrader.upgrade_inbound(tb, &server_cfg);
        let (client, server) = futures::join!(client_fut, server_fut);
        let client = client.unwrap();
        let server = server.unwrap();

        assert_eq!(client.remote_peer(), server.local_peer());
        assert_eq!(server.remote_peer(), client.local_peer());

        client.close().await.unwrap();
        server.close().await.unwrap();
    }

    #[async_std::test]
    async fn outbound_fails_on_peer_mismatch() {
        let (ta, tb) = MemoryDuplex::pair(256);
        let client_identity = Keypair::generate();
        let server_identity = Keypair::generate();
        let wrong_peer = Keypair::generate().public().into_peer_id();

        let upgrader = Upgrader::new(Arc::new(NullResourceManager));
        let client_cfg = config_for(client_identity);
        let server_cfg = config_for(server_identity);

        let client_fut = upgrader.upgrade_outbound(ta, &wrong_peer, &client_cfg);
        let server_fut = upgrader.upgrade_inbound(tb, &server_cfg);
        let (client, _server) = futures::join!(client_fut, server_fut);
        assert!(matches!(client, Err(UpgradeError::PeerIdMismatch { .. })));
    }

    #[async_std::test]
    async fn streams_work_end_to_end_after_upgrade() {
        let (ta, tb) = MemoryDuplex::pair(4096);
        let client_identity = Keypair::generate();
        let server_identity = Keypair::generate();
        let server_peer_id = server_identity.public().into_peer_id();

        let upgrader = Upgrader::new(Arc::new(NullResourceManager));
        let client_cfg = config_for(client_identity);
        let server_cfg = config_for(server_identity);

        let client_fut = upgrader.upgrade_outbound(ta, &server_peer_id, &client_cfg);
        let server_fut = upgrader.upgrade_inbound(tb, &server_cfg);
        let (client, server) = futures::join!(client_fut, server_fut);
        let client = client.unwrap();
        let server = server.unwrap();

        let client_task = async_std::task::spawn(async move {
            let mut stream = client.open_stream().await.unwrap();
            stream.write(b"hello from client").await.unwrap();
            stream.close().await.unwrap();
        });

        let mut accepted = server.accept_stream().await.unwrap();
        let mut got = Vec::new();
        loop {
            let chunk = accepted.read().await.unwrap();
            if chunk.is_empty() {
                break;
            }
            got.extend(chunk);
            if got.len() >= b"hello from client".len() {
                break;
            }
        }
        client_task.await;
        assert_eq!(got, b"hello from client");
    }
}
