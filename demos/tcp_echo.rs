//! Exercises the public `muxcore` API over a real TCP loopback connection:
//! upgrade (Noise handshake + Yamux), open/accept a stream, echo payload,
//! half-close, full close. Run with `cargo run --example tcp_echo`.

use async_std::net::{TcpListener, TcpStream};
use async_trait::async_trait;
use muxcore::peer::Keypair;
use muxcore::resource::NullResourceManager;
use muxcore::secured::noise::NoiseConfig;
use muxcore::transport::TransportConn;
use muxcore::upgrade::{UpgradeConfig, Upgrader};
use muxcore::yamux;
use std::io;
use std::sync::Arc;

struct TcpConn(TcpStream);

#[async_trait]
impl TransportConn for TcpConn {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        use futures::AsyncReadExt;
        (&self.0).read(buf).await
    }

    async fn write(&self, buf: &[u8]) -> io::Result<()> {
        use futures::AsyncWriteExt;
        (&self.0).write_all(buf).await
    }

    async fn close(&self) -> io::Result<()> {
        use async_std::net::Shutdown;
        self.0.shutdown(Shutdown::Both)
    }

    fn local_addr(&self) -> String {
        self.0.local_addr().map(|a| a.to_string()).unwrap_or_default()
    }

    fn remote_addr(&self) -> String {
        self.0.peer_addr().map(|a| a.to_string()).unwrap_or_default()
    }
}

fn main() {
    env_logger::init();
    async_std::task::block_on(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        println!("listening on {addr}");

        let server_identity = Keypair::generate();
        let server_peer_id = server_identity.public().into_peer_id();
        let client_identity = Keypair::generate();

        let server = async_std::task::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let cfg = UpgradeConfig::new(NoiseConfig::new(server_identity), yamux::Config::new());
            let upgrader = Upgrader::new(Arc::new(NullResourceManager));
            let conn = upgrader.upgrade_inbound(TcpConn(stream), &cfg).await.unwrap();
            println!("server: upgrade complete, remote peer = {}", conn.remote_peer());

            let mut stream = conn.accept_stream().await.unwrap();
            let received = stream.read().await.unwrap();
            println!("server: received {:?}", String::from_utf8_lossy(&received));
            stream.write(b"world").await.unwrap();
            stream.close().await.unwrap();

            let mut big_stream = conn.accept_stream().await.unwrap();
            let mut total = 0usize;
            while total < 96 * 1024 {
                let chunk = big_stream.read().await.unwrap();
                total += chunk.len();
            }
            println!("server: received {total} bytes on big stream");
            big_stream.close().await.unwrap();
            // Leave the shared connection open until the client has read our
            // reply; closing it here would tear down the one underlying TCP
            // socket both sides still multiplex over.
            conn
        });

        let client_stream = TcpStream::connect(addr).await.unwrap();
        let cfg = UpgradeConfig::new(NoiseConfig::new(client_identity), yamux::Config::new());
        let upgrader = Upgrader::new(Arc::new(NullResourceManager));
        let conn = upgrader
            .upgrade_outbound(TcpConn(client_stream), &server_peer_id, &cfg)
            .await
            .unwrap();
        println!("client: upgrade complete, remote peer = {}", conn.remote_peer());

        let mut stream = conn.open_stream().await.unwrap();
        stream.write(b"hello").await.unwrap();
        let received = stream.read().await.unwrap();
        println!("client: received {:?}", String::from_utf8_lossy(&received));

        let mut big_stream = conn.open_stream().await.unwrap();
        let payload = vec![0xABu8; 96 * 1024];
        big_stream.write(&payload).await.unwrap();
        big_stream.close().await.unwrap();
        println!("client: sent {} bytes on big stream", payload.len());

        // Wait for the server to finish draining the big stream before
        // tearing down the shared connection.
        let server_conn = server.await;
        conn.close().await.unwrap();
        server_conn.close().await.unwrap();
        println!("done");
    });
}
