//! Tokio runtime for kcp-core connections: worker pool, UDP server and client.

pub mod client;
pub mod config;
pub mod listener;
pub mod server;
pub mod session;
pub mod transport;
pub mod worker;

pub use client::Client;
pub use config::{Config, LoadError};
pub use listener::Listener;
pub use server::Server;
pub use session::Session;
pub use worker::WorkerPool;
