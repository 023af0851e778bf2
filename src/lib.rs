//! Transport Supervisor - keeps one circumvention transport connected
//!
//! The supervisor launches transport programs as child processes, learns
//! where they listen through a line-based handshake on stdout, verifies
//! that the exposed SOCKS5 endpoint actually reaches the internet and
//! rotates through the configured connections whenever one fails.
//!
//! # Architecture
//!
//! ```text
//!                   +------------------+
//!                   |   supervisor/    |
//!                   +--------+---------+
//!                            |
//!        +-------------------+-------------------+
//!        |                   |                   |
//! +------v------+    +-------v-------+   +-------v-------+
//! |   config/   |    |   manager/    |   |  telemetry/   |
//! +-------------+    | (state loop)  |   |  (receiver)   |
//!                    +-------+-------+   +-------^-------+
//!                            |                   |
//!                    +-------v-------+           | POST traffic
//!                    |  transport/   |           |
//!                    +-------+-------+   +-------+-------+
//!                            |           |   server/     |
//!                    +-------v-------+   | (child side)  |
//!                    |   service/    +--->  socks5 ...   |
//!                    +-------+-------+   +---------------+
//!                            |
//!                    +-------v-------+
//!                    |   protocol/   |
//!                    +---------------+
//! ```

pub mod common;
pub mod config;
pub mod connection;
pub mod manager;
pub mod protocol;
pub mod server;
pub mod service;
pub mod supervisor;
pub mod telemetry;
pub mod transport;

pub use common::error::{Error, Result};
pub use config::Config;
pub use supervisor::Supervisor;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
