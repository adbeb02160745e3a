//! Shared-table file exchange over TCP.
//!
//! Clients upload files to a server, which records each upload in a durable
//! table and pushes the refreshed table to every connected client. Any client
//! can download one or more stored files in a single request.

pub mod client;
pub mod db;
pub mod error;
pub mod frame;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod server;
mod session;
pub mod table;

pub use error::{Error, Result};

pub const DEFAULT_PORT: u16 = 7070;
