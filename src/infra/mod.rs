//! Process-level plumbing: sockets, workers, supervision and telemetry.

pub mod client;
pub mod error;
pub mod server;
pub mod supervisor;
pub mod telemetry;
pub mod transport;
