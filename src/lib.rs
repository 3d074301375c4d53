//! # Room Broker
//!
//! A standalone TCP broadcast server, one process per room. Peers exchange
//! newline-delimited JSON messages; the server answers requests directly and
//! fans out `send_params` and `broadcast` messages to the other peers in the room.
//!
//! ## Dependencies
//! - `tokio` / `tokio-util` for the async runtime and line framing
//! - `dashmap` for the connection registry
//! - `config` and `clap` for startup configuration
//! - `tracing` for logging

pub mod config;
pub mod logging;
pub mod server;
pub mod utils;

pub use config::{CliArgs, RoomServerConfig};
pub use server::lifecycle::{Phase, RoomServer};
pub use utils::BrokerError;
