//! Local history of uploads and downloads made by this client.

use rusqlite::{Connection, Result, params};
use std::path::Path;

pub const STATUS_PENDING: &str = "Pending";
pub const STATUS_COMPLETED: &str = "Completed";
pub const STATUS_FAILED: &str = "Failed";
pub const STATUS_MISSING: &str = "Missing";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Push,
    Pull,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Push => "push",
            Direction::Pull => "pull",
        }
    }
}

#[derive(Debug)]
pub struct Transfer {
    pub id: i64,
    pub direction: String,
    pub file_name: String,
    pub size: u64,
    pub peer: String,
    pub status: String,
    pub created_at: String,
}

pub struct Db {
    conn: Connection,
}

impl Db {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS history (
                id INTEGER PRIMARY KEY,
                direction TEXT NOT NULL,
                file_name TEXT NOT NULL,
                size INTEGER NOT NULL DEFAULT 0,
                peer TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;
        let _: String = conn.query_row("PRAGMA journal_mode=WAL;", [], |row| row.get(0))?;
        conn.execute("PRAGMA synchronous=NORMAL;", [])?;

        Ok(Db { conn })
    }

    pub fn add_transfer(
        &self,
        direction: Direction,
        file_name: &str,
        size: u64,
        peer: &str,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO history (direction, file_name, size, peer, status) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![direction.as_str(), file_name, size, peer, STATUS_PENDING],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn update_status(&self, id: i64, status: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE history SET status = ?2 WHERE id = ?1",
            params![id, status],
        )?;
        Ok(())
    }

    pub fn set_size(&self, id: i64, size: u64) -> Result<()> {
        self.conn.execute(
            "UPDATE history SET size = ?2 WHERE id = ?1",
            params![id, size],
        )?;
        Ok(())
    }

    /// Returns whether a row was removed.
    pub fn delete_transfer(&self, id: i64) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM history WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    pub fn list_transfers(&self) -> Result<Vec<Transfer>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, direction, file_name, size, peer, status, created_at FROM history ORDER BY id DESC",
        )?;
        let transfer_iter = stmt.query_map([], |row| {
            Ok(Transfer {
                id: row.get(0)?,
                direction: row.get(1)?,
                file_name: row.get(2)?,
                size: row.get(3)?,
                peer: row.get(4)?,
                status: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?;

        let mut transfers = Vec::new();
        for transfer in transfer_iter {
            transfers.push(transfer?);
        }
        Ok(transfers)
    }
}
