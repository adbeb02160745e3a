//! Shared setup for server/client integration tests.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fshare::client::{Client, ClientConfig};
use fshare::frame::{self, DEFAULT_MAX_FRAME_LEN, FrameReader};
use fshare::protocol::{Envelope, HEADER_LEN};
use fshare::server::{Server, ServerConfig};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;

pub use fshare::logging::init_test_tracing;

/// How long a test waits for something that should arrive.
pub const ARRIVAL_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a test waits to be sure nothing else arrives.
pub const QUIET_PERIOD: Duration = Duration::from_millis(300);

pub struct TestServer {
    pub addr: SocketAddr,
    /// Canonical upload directory, as used in table links.
    pub upload_dir: PathBuf,
    task: JoinHandle<fshare::Result<()>>,
}

impl TestServer {
    /// Start a server keeping its uploads and table under `root`.
    pub async fn start(root: &Path) -> Self {
        let config = ServerConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            upload_dir: root.join("uploads"),
            table_path: root.join("TableFile.txt"),
            ..ServerConfig::default()
        };
        let server = Server::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let upload_dir = server.config().upload_dir.clone();
        let task = tokio::spawn(server.run());
        Self {
            addr,
            upload_dir,
            task,
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            server: self.addr.to_string(),
            idle_timeout: Duration::from_millis(500),
            ..ClientConfig::default()
        }
    }

    /// A connected client whose session is known to be registered.
    pub async fn client(&self) -> Client {
        let mut client = Client::connect(self.client_config()).await.unwrap();
        client.request_table().await.unwrap();
        client
    }

    pub fn link(&self, file_name: &str) -> String {
        fshare::table::link_for(&self.upload_dir, file_name)
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

/// A bare connection for checking exact bytes on the wire.
pub struct RawConnection {
    pub reader: FrameReader<OwnedReadHalf>,
    pub writer: OwnedWriteHalf,
}

impl RawConnection {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, writer) = stream.into_split();
        Self {
            reader: FrameReader::new(read, DEFAULT_MAX_FRAME_LEN),
            writer,
        }
    }

    /// Send `header` text padded to the header width, followed by `payload`.
    pub async fn send_raw(&mut self, header: &str, payload: &[u8]) {
        let mut content = vec![0u8; HEADER_LEN];
        content[..header.len()].copy_from_slice(header.as_bytes());
        content.extend_from_slice(payload);
        frame::write_frame(&mut self.writer, &content).await.unwrap();
    }

    pub async fn send(&mut self, envelope: &Envelope) {
        let content = envelope.encode().unwrap();
        frame::write_frame(&mut self.writer, &content).await.unwrap();
    }

    /// Next envelope, failing the test if none arrives in time.
    pub async fn recv(&mut self) -> Envelope {
        let frame = tokio::time::timeout(ARRIVAL_TIMEOUT, self.reader.read_frame())
            .await
            .expect("timed out waiting for a frame")
            .unwrap()
            .expect("connection closed");
        Envelope::decode(frame).unwrap()
    }

    /// Assert that nothing arrives for a short while.
    pub async fn expect_silence(&mut self) {
        let next = tokio::time::timeout(QUIET_PERIOD, self.reader.read_frame()).await;
        assert!(next.is_err(), "unexpected frame: {:?}", next);
    }
}
