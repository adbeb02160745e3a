use crate::frame::{self, DEFAULT_MAX_FRAME_LEN, FrameReader};
use crate::protocol::{self, Envelope, Flag};
use crate::table::{self, TableEntry};
use anyhow::{Context, Result, anyhow, bail};
use glob::Pattern;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the server.
    pub server: String,
    pub max_frame_len: usize,
    /// How long a download waits for the next file before calling the batch done.
    pub idle_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: format!("127.0.0.1:{}", crate::DEFAULT_PORT),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            idle_timeout: Duration::from_secs(3),
        }
    }
}

/// Outcome of one batched download.
#[derive(Debug, Default)]
pub struct DownloadReport {
    /// Written files, in arrival order.
    pub received: Vec<PathBuf>,
    /// Requested names that never arrived, after names that arrived but
    /// could not be stored.
    pub missing: Vec<String>,
}

/// A connection to the server plus the last table it sent.
pub struct Client {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer: SocketAddr,
    table: Vec<TableEntry>,
    config: ClientConfig,
}

impl Client {
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let socket = TcpStream::connect(&config.server)
            .await
            .with_context(|| format!("failed to connect to {}", config.server))?;
        socket.set_nodelay(true)?;
        let peer = socket.peer_addr()?;
        tracing::info!(%peer, "connected to server");

        let (read, writer) = socket.into_split();
        Ok(Self {
            reader: FrameReader::new(read, config.max_frame_len),
            writer,
            peer,
            table: Vec::new(),
            config,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Table as of the last `Update` received.
    pub fn table(&self) -> &[TableEntry] {
        &self.table
    }

    async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        let content = envelope.encode()?;
        frame::write_frame(&mut self.writer, &content).await?;
        tracing::debug!(flag = %envelope.flag(), bytes = content.len(), "sent envelope");
        Ok(())
    }

    /// Next well-formed envelope; `None` once the server closed the connection.
    pub async fn next_envelope(&mut self) -> Result<Option<Envelope>> {
        while let Some(frame) = self.reader.read_frame().await? {
            match Envelope::decode(frame) {
                Ok(envelope) => return Ok(Some(envelope)),
                Err(err) => tracing::warn!(%err, "dropping frame"),
            }
        }
        Ok(None)
    }

    fn replace_table(&mut self, envelope: &Envelope) {
        let text = String::from_utf8_lossy(&envelope.payload);
        self.table = table::parse_table(&text);
        tracing::debug!(rows = self.table.len(), "table replaced");
    }

    /// Upload one local file. Returns the number of bytes sent.
    pub async fn upload(&mut self, path: &Path) -> Result<u64> {
        let file_name = path
            .file_name()
            .context("path has no file name")?
            .to_string_lossy()
            .to_string();
        let data = fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let size = data.len() as u64;

        self.send(&Envelope::save(file_name.as_str(), data)).await?;
        tracing::info!(file_name = %file_name, file_size = size, "file uploaded");
        Ok(size)
    }

    /// Ask for the table and wait for the answer.
    pub async fn request_table(&mut self) -> Result<&[TableEntry]> {
        self.send(&Envelope::update_request()).await?;
        loop {
            let envelope = self
                .next_envelope()
                .await?
                .ok_or_else(|| anyhow!("server closed the connection"))?;
            if envelope.flag() == Flag::Update {
                self.replace_table(&envelope);
                return Ok(&self.table);
            }
            tracing::warn!(flag = %envelope.flag(), "ignoring envelope while waiting for table");
        }
    }

    /// Wait for the next table broadcast, giving up after `idle`.
    pub async fn wait_for_table(&mut self, idle: Duration) -> Result<Option<&[TableEntry]>> {
        loop {
            let envelope = match tokio::time::timeout(idle, self.next_envelope()).await {
                Err(_) => return Ok(None),
                Ok(envelope) => envelope?.ok_or_else(|| anyhow!("server closed the connection"))?,
            };
            if envelope.flag() == Flag::Update {
                self.replace_table(&envelope);
                return Ok(Some(&self.table));
            }
            tracing::warn!(flag = %envelope.flag(), "ignoring envelope while waiting for table");
        }
    }

    /// Request `names` in one batch and write each file that comes back into `dir`.
    ///
    /// The batch ends after one file per requested name, or when the server
    /// stays silent for the configured idle timeout (it skips missing files).
    pub async fn download(&mut self, names: &[String], dir: &Path) -> Result<DownloadReport> {
        let mut pending: Vec<String> = names
            .iter()
            .filter(|name| !name.trim().is_empty())
            .cloned()
            .collect();
        if pending.is_empty() {
            return Ok(DownloadReport::default());
        }
        let expected = pending.len();
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;

        self.send(&Envelope::load_request(&pending)).await?;

        let mut report = DownloadReport::default();
        let mut arrived = 0;
        while arrived < expected {
            let envelope = match tokio::time::timeout(self.config.idle_timeout, self.next_envelope()).await {
                Err(_) => {
                    tracing::debug!(arrived, expected, "download idle, ending batch");
                    break;
                }
                Ok(envelope) => envelope?.ok_or_else(|| anyhow!("server closed the connection during download"))?,
            };

            match envelope.flag() {
                Flag::Load => {
                    arrived += 1;
                    if let Some(at) = pending.iter().position(|n| Some(n.as_str()) == envelope.file_name()) {
                        pending.remove(at);
                    }
                    match store_download(&envelope, dir).await {
                        Ok(path) => report.received.push(path),
                        Err(err) => {
                            let name = envelope.file_name().unwrap_or(protocol::NULL).to_string();
                            tracing::warn!(file_name = %name, err = %format!("{:#}", err), "could not store download");
                            report.missing.push(name);
                        }
                    }
                }
                Flag::Update => self.replace_table(&envelope),
                Flag::Save => tracing::warn!("ignoring unexpected save envelope"),
            }
        }

        for name in &pending {
            tracing::warn!(file_name = %name, "requested file was not delivered");
        }
        report.missing.extend(pending);
        Ok(report)
    }
}

async fn store_download(envelope: &Envelope, dir: &Path) -> Result<PathBuf> {
    let name = envelope
        .file_name()
        .ok_or_else(|| anyhow!("download without fileName"))?;
    let name = protocol::check_file_name(name)?;
    let body = envelope.body();
    if envelope.header.file_size != Some(body.len() as u64) {
        tracing::warn!(
            file_name = name,
            declared = ?envelope.header.file_size,
            received = body.len(),
            "download shorter than declared"
        );
    }

    let path = dir.join(name);
    fs::write(&path, body)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!(path = %path.display(), bytes = body.len(), "file downloaded");
    Ok(path)
}

/// Files to upload for `source_path`: the file itself, or every file below a
/// directory that no `exclude_patterns` glob matches.
pub fn scan_files(source_path: &Path, exclude_patterns: &[String]) -> Result<Vec<PathBuf>> {
    if source_path.is_file() {
        return Ok(vec![source_path.to_path_buf()]);
    }
    if !source_path.is_dir() {
        bail!("{} does not exist", source_path.display());
    }

    let patterns = exclude_patterns
        .iter()
        .map(|p| Pattern::new(p).with_context(|| format!("invalid exclude pattern {:?}", p)))
        .collect::<Result<Vec<_>>>()?;

    let mut files = Vec::new();
    for entry in WalkDir::new(source_path).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(source_path)?
            .to_string_lossy()
            .replace('\\', "/");
        if patterns.iter().any(|p| p.matches(&relative)) {
            tracing::debug!(path = %relative, "excluded");
            continue;
        }
        files.push(entry.into_path());
    }
    tracing::info!(count = files.len(), "scan complete");
    Ok(files)
}

pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
