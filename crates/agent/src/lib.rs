//! Host agent daemon for containerized game servers
//!
//! Wires the `agent-lib` core to the Docker Engine, a SQLite database and
//! an HTTP API.

pub mod api;
pub mod backup;
pub mod config;
pub mod docker;
