//! Graphguard Library
//!
//! Transparent authorizing reverse proxy for the Kubernetes API, backed by
//! a SpiceDB-compatible relationship-based access-control service.
//!
//! # How a request flows
//!
//! - **Authenticate**: an [`auth::Authenticator`] produces the user identity
//! - **Extract**: the request is parsed into an [`authz::AuthzInput`]
//! - **Match**: declarative [`rules`] select checks, prefilters and updates
//! - **Check**: permission checks fan out against the [`spicedb`] client
//! - **Write**: mutating requests run a durable dual-write [`workflow`]
//!   committing to both the permission service and the cluster
//! - **Filter**: read responses are intersected with the allowed set built
//!   by prefilter lookups ([`authz::filter`])
//!
//! # Example
//!
//! ```no_run
//! use graphguard::{config::Config, proxy::Server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let server = Server::new(config)?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod authz;
pub mod config;
pub mod expr;
pub mod metrics;
pub mod proxy;
pub mod rules;
pub mod spicedb;
pub mod workflow;

// Re-export commonly used types
pub use config::Config;
pub use proxy::Server;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
