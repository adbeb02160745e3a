mod cli;

use anyhow::{Result, bail};
use clap::Parser;
use cli::{Cli, Commands};
use fshare::client::{self, Client};
use fshare::db::{self, Db, Direction};
use fshare::server::Server;
use fshare::table::TableEntry;

#[tokio::main]
async fn main() -> Result<()> {
    fshare::logging::init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            bind,
            port,
            dir,
            table,
            max_frame,
        } => {
            let config = cli::server_config(bind, port, dir, table, max_frame);
            let server = Server::bind(config).await?;
            server.run().await?;
        }
        Commands::Push {
            path,
            exclude,
            remote,
        } => {
            let db = Db::open(&cli.history_db)?;
            let files = client::scan_files(&path, &exclude)?;
            if files.is_empty() {
                println!("No files to upload.");
                return Ok(());
            }

            let config = remote.client_config();
            let idle = config.idle_timeout;
            let mut client = Client::connect(config).await?;
            let peer = client.peer_addr().to_string();
            let (mut uploaded, mut confirmed) = (0, 0);
            for file in &files {
                let name = file
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                let id = db.add_transfer(Direction::Push, &name, 0, &peer)?;
                match client.upload(file).await {
                    Ok(size) => {
                        db.set_size(id, size)?;
                        db.update_status(id, db::STATUS_COMPLETED)?;
                        println!("Uploaded {} ({})", name, client::format_size(size));
                        uploaded += 1;
                    }
                    Err(e) if is_encoding_error(&e) => {
                        db.update_status(id, db::STATUS_FAILED)?;
                        eprintln!("Skipping {}: {}", name, e);
                        continue;
                    }
                    Err(e) => {
                        db.update_status(id, db::STATUS_FAILED)?;
                        bail!("upload of {} failed: {}", name, e);
                    }
                }
                // Read the broadcast for this upload before sending the next one.
                if client.wait_for_table(idle).await?.is_some() {
                    confirmed += 1;
                }
            }
            if confirmed < uploaded {
                eprintln!("Server confirmed {} of {} uploads.", confirmed, uploaded);
            }
            print_table(client.table());
        }
        Commands::Table { json, remote } => {
            let mut client = Client::connect(remote.client_config()).await?;
            let table = client.request_table().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(table)?);
            } else {
                print_table(table);
            }
        }
        Commands::Pull { names, dir, remote } => {
            let db = Db::open(&cli.history_db)?;
            let mut client = Client::connect(remote.client_config()).await?;
            let peer = client.peer_addr().to_string();
            let ids = names
                .iter()
                .map(|name| db.add_transfer(Direction::Pull, name, 0, &peer))
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let report = match client.download(&names, &dir).await {
                Ok(report) => report,
                Err(e) => {
                    for id in &ids {
                        db.update_status(*id, db::STATUS_FAILED)?;
                    }
                    return Err(e);
                }
            };

            let mut missing = report.missing.clone();
            for (id, name) in ids.iter().zip(&names) {
                if name.trim().is_empty() {
                    db.update_status(*id, db::STATUS_FAILED)?;
                } else if let Some(at) = missing.iter().position(|m| m == name) {
                    missing.remove(at);
                    db.update_status(*id, db::STATUS_MISSING)?;
                } else {
                    db.update_status(*id, db::STATUS_COMPLETED)?;
                }
            }
            for path in &report.received {
                println!("Downloaded {}", path.display());
            }
            for name in &report.missing {
                eprintln!("Not available on server: {}", name);
            }
        }
        Commands::Watch { remote } => {
            let mut client = Client::connect(remote.client_config()).await?;
            print_table(client.request_table().await?);
            while let Some(envelope) = client.next_envelope().await? {
                if envelope.flag() == fshare::protocol::Flag::Update {
                    let text = String::from_utf8_lossy(&envelope.payload);
                    println!();
                    print_table(&fshare::table::parse_table(&text));
                }
            }
            println!("Server closed the connection.");
        }
        Commands::History => {
            let db = Db::open(&cli.history_db)?;
            let transfers = db.list_transfers()?;
            println!(
                "{:<5} {:<5} {:<30} {:<10} {:<21} {:<10} {:<20}",
                "ID", "Dir", "File", "Size", "Peer", "Status", "Created At"
            );
            for t in transfers {
                println!(
                    "{:<5} {:<5} {:<30} {:<10} {:<21} {:<10} {:<20}",
                    t.id,
                    t.direction,
                    t.file_name,
                    client::format_size(t.size),
                    t.peer,
                    t.status,
                    t.created_at
                );
            }
        }
        Commands::Remove { id } => {
            let db = Db::open(&cli.history_db)?;
            if db.delete_transfer(id)? {
                println!("Removed transfer {}.", id);
            } else {
                bail!("no transfer with ID {}", id);
            }
        }
    }

    Ok(())
}

fn is_encoding_error(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<fshare::Error>(),
        Some(fshare::Error::Encoding { .. })
    )
}

fn print_table(table: &[TableEntry]) {
    println!("{:<24} {:<30} {}", "Date/Time", "File", "Link");
    for entry in table {
        println!(
            "{:<24} {:<30} {}",
            entry.timestamp, entry.file_name, entry.link
        );
    }
}
