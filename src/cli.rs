use clap::{Args, Parser, Subcommand};
use fshare::DEFAULT_PORT;
use fshare::client::ClientConfig;
use fshare::frame::DEFAULT_MAX_FRAME_LEN;
use fshare::server::ServerConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Local transfer history database
    #[arg(long, global = true, default_value = "fshare_history.db")]
    pub history_db: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Clone)]
pub struct Remote {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    /// Server port
    #[arg(long, short, default_value_t = DEFAULT_PORT)]
    pub port: u16,
    /// Milliseconds without traffic after which a wait gives up
    #[arg(long, default_value_t = 3000)]
    pub idle_timeout: u64,
}

impl Remote {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            server: format!("{}:{}", self.host, self.port),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            idle_timeout: Duration::from_millis(self.idle_timeout),
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the server
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0")]
        bind: std::net::IpAddr,
        /// Port to listen on
        #[arg(long, short, default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Directory to store uploaded files
        #[arg(long, default_value = "SavedFilesOnServer")]
        dir: PathBuf,
        /// File holding the table of uploaded files
        #[arg(long, default_value = "TableFile.txt")]
        table: PathBuf,
        /// Largest frame accepted from a client, in bytes
        #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
        max_frame: usize,
    },
    /// Upload a file, or every file in a directory
    Push {
        /// File or directory to upload
        path: PathBuf,
        /// Glob patterns (relative to the directory) to skip
        #[arg(long, short)]
        exclude: Vec<String>,
        #[command(flatten)]
        remote: Remote,
    },
    /// Show the table of uploaded files
    Table {
        /// Print as JSON
        #[arg(long)]
        json: bool,
        #[command(flatten)]
        remote: Remote,
    },
    /// Download files by name
    Pull {
        /// Names of files to download
        #[arg(required = true)]
        names: Vec<String>,
        /// Directory to save downloaded files
        #[arg(long, short, default_value = ".")]
        dir: PathBuf,
        #[command(flatten)]
        remote: Remote,
    },
    /// Stay connected and print the table whenever it changes
    Watch {
        #[command(flatten)]
        remote: Remote,
    },
    /// List transfer history
    History,
    /// Remove a transfer history entry
    Remove {
        /// ID of the entry to remove
        id: i64,
    },
}

pub fn server_config(
    bind: std::net::IpAddr,
    port: u16,
    dir: PathBuf,
    table: PathBuf,
    max_frame: usize,
) -> ServerConfig {
    ServerConfig {
        bind: SocketAddr::new(bind, port),
        upload_dir: dir,
        table_path: table,
        max_frame_len: max_frame,
        ..ServerConfig::default()
    }
}
