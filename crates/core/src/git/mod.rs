//! Git operations for the repository mirror.

pub mod client;
pub mod transport;

pub use client::GitTransport;
pub use transport::{CommitInfo, Transport, TransportStatus};
