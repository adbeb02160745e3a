//! One live client connection on the server: read frames, dispatch by flag,
//! write queued frames back.

use crate::error::{Error, Result};
use crate::frame::{self, FrameReader};
use crate::protocol::{self, Envelope, Flag};
use crate::registry::{SessionHandle, SessionId};
use crate::server::Shared;
use crate::table::TableEntry;
use bytes::Bytes;
use futures::TryStreamExt;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;

struct Session {
    id: SessionId,
    handle: SessionHandle,
    shared: Arc<Shared>,
}

/// Drive a connection from accept to disconnect.
#[tracing::instrument(skip(socket, shared), fields(session = tracing::field::Empty))]
pub(crate) async fn serve(socket: TcpStream, peer: SocketAddr, shared: Arc<Shared>) {
    if let Err(err) = socket.set_nodelay(true) {
        tracing::debug!(%err, "could not disable nagle");
    }
    let (read, write) = socket.into_split();
    let (tx, rx) = mpsc::channel(shared.config.outbound_capacity);
    let handle = SessionHandle::new(peer, tx);

    let id = shared.registry.register(handle.clone());
    tracing::Span::current().record("session", id);
    tokio::spawn(write_frames(write, rx));

    let session = Session {
        id,
        handle,
        shared: shared.clone(),
    };
    match session.read_frames(read).await {
        Ok(()) => tracing::info!("client has left"),
        Err(err) => tracing::warn!(%err, "session closed on error"),
    }
    shared.registry.deregister(id);
    tracing::debug!(live = shared.registry.session_count(), "sessions remaining");
}

async fn write_frames(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(frame) = rx.recv().await {
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = written {
            tracing::warn!(%err, "write failed, dropping session writer");
            return;
        }
        tracing::trace!(bytes = frame.len(), "frame written");
    }
}

impl Session {
    async fn read_frames(&self, read: OwnedReadHalf) -> Result<()> {
        let frames = FrameReader::new(read, self.shared.config.max_frame_len).into_stream();
        tokio::pin!(frames);
        while let Some(frame) = frames.try_next().await? {
            let envelope = match Envelope::decode(frame) {
                Ok(envelope) => envelope,
                Err(err) => {
                    tracing::warn!(%err, "dropping frame");
                    continue;
                }
            };
            tracing::debug!(
                flag = %envelope.flag(),
                file_name = ?envelope.file_name(),
                payload = envelope.payload.len(),
                "received envelope"
            );

            match self.dispatch(envelope).await {
                Ok(()) => {}
                Err(err @ Error::Connection(_)) => return Err(err),
                Err(err @ Error::Persistence { .. }) => {
                    tracing::error!(session = self.id, %err, "request failed")
                }
                Err(err) => tracing::warn!(session = self.id, %err, "request rejected"),
            }
        }
        Ok(())
    }

    async fn dispatch(&self, envelope: Envelope) -> Result<()> {
        match envelope.flag() {
            Flag::Save => self.save(envelope).await,
            Flag::Update => self.send_table().await,
            Flag::Load => self.send_files(envelope).await,
        }
    }

    /// Store the upload, record it, then tell everyone.
    async fn save(&self, envelope: Envelope) -> Result<()> {
        let name = envelope
            .file_name()
            .ok_or_else(|| Error::MalformedHeader("save without fileName".to_string()))?;
        let name = protocol::check_file_name(name)?;
        let body = envelope.body();
        if envelope.header.file_size != Some(body.len() as u64) {
            tracing::warn!(
                declared = ?envelope.header.file_size,
                received = envelope.payload.len(),
                "upload size differs from header"
            );
        }
        tracing::info!(file_name = name, file_size = body.len(), "receiving file");

        let upload_dir = &self.shared.config.upload_dir;
        let path = upload_dir.join(name);
        fs::write(&path, body)
            .await
            .map_err(|e| Error::persistence(&path, e))?;
        tracing::info!(path = %path.display(), "file stored");

        self.shared
            .table
            .append(&TableEntry::now(name, upload_dir))
            .await?;

        let delivered = self.shared.broadcast_table().await?;
        tracing::debug!(delivered, "table broadcast after save");
        Ok(())
    }

    async fn send_table(&self) -> Result<()> {
        let frame = self.shared.table_frame().await?;
        self.handle.send(frame).await
    }

    /// Send each requested file as its own frame, in request order.
    async fn send_files(&self, request: Envelope) -> Result<()> {
        let names = request.requested_names();
        tracing::debug!(?names, "files requested");

        for name in names {
            match self.read_upload(&name).await {
                Ok(data) => {
                    let content = Envelope::load(name.as_str(), data).encode()?;
                    self.handle.send(frame::encode_frame(&content)?).await?;
                    tracing::info!(file_name = %name, "file sent");
                }
                Err(err @ (Error::MissingFile(_) | Error::InvalidFileName(_))) => {
                    tracing::warn!(%err, "skipping requested file");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn read_upload(&self, name: &str) -> Result<Vec<u8>> {
        let name = protocol::check_file_name(name)?;
        let path = self.shared.config.upload_dir.join(name);
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::MissingFile(name.to_string())),
            Err(e) => {
                tracing::warn!(path = %path.display(), err = %e, "cannot read upload");
                Err(Error::MissingFile(name.to_string()))
            }
        }
    }
}
