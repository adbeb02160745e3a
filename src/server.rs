use crate::error::{Error, Result};
use crate::frame::{self, DEFAULT_MAX_FRAME_LEN};
use crate::protocol::Envelope;
use crate::registry::Registry;
use crate::session;
use crate::table::TableStore;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::net::TcpListener;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Directory holding uploaded files.
    pub upload_dir: PathBuf,
    /// Ledger of uploaded files.
    pub table_path: PathBuf,
    pub max_frame_len: usize,
    /// Frames queued per session before senders wait.
    pub outbound_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], crate::DEFAULT_PORT)),
            upload_dir: PathBuf::from("SavedFilesOnServer"),
            table_path: PathBuf::from("TableFile.txt"),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            outbound_capacity: 32,
        }
    }
}

/// State every session task shares.
pub(crate) struct Shared {
    pub(crate) config: ServerConfig,
    pub(crate) table: TableStore,
    pub(crate) registry: Registry,
}

impl Shared {
    /// Send the current table to every live session.
    pub(crate) async fn broadcast_table(&self) -> Result<usize> {
        let frame = self.table_frame().await?;
        Ok(self.registry.broadcast(frame))
    }

    /// The table snapshot as a framed `Update` envelope.
    pub(crate) async fn table_frame(&self) -> Result<bytes::Bytes> {
        let snapshot = self.table.snapshot().await?;
        let content = Envelope::update(snapshot).encode()?;
        frame::encode_frame(&content)
    }
}

pub struct Server {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl Server {
    /// Prepare the upload directory and table, then bind the listener.
    pub async fn bind(mut config: ServerConfig) -> Result<Self> {
        if !fs::try_exists(&config.upload_dir).await.unwrap_or(false) {
            fs::create_dir_all(&config.upload_dir)
                .await
                .map_err(|e| Error::persistence(&config.upload_dir, e))?;
            tracing::info!(dir = %config.upload_dir.display(), "created upload directory");
        } else {
            tracing::info!(dir = %config.upload_dir.display(), "using existing upload directory");
        }
        config.upload_dir = fs::canonicalize(&config.upload_dir)
            .await
            .map_err(|e| Error::persistence(&config.upload_dir, e))?;

        let table = TableStore::open(&config.table_path).await?;
        let listener = TcpListener::bind(config.bind).await?;
        tracing::info!(addr = %listener.local_addr()?, "server is listening");

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                config,
                table,
                registry: Registry::default(),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Accept connections forever, one task per session.
    pub async fn run(self) -> Result<()> {
        loop {
            let (socket, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(%err, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            let shared = self.shared.clone();
            tokio::spawn(async move {
                session::serve(socket, peer, shared).await;
            });
        }
    }
}
