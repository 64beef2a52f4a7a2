//! Configuration module
//!
//! Handles loading and validation of the proxy's YAML configuration file.
//! String values support `${VAR}` environment expansion, which keeps
//! preshared tokens out of the file itself.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::authz::DEFAULT_BODY_LIMIT;
use crate::rules::LockMode;

mod loader;

pub use loader::ConfigLoader;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub spicedb: SpiceDbConfig,
    pub rules: RulesConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub authentication: AuthenticationConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.address.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::ValidationError(format!(
                "server.address {:?} is not a host:port pair",
                self.server.address
            )));
        }
        if !self.upstream.server.starts_with("https://") {
            return Err(ConfigError::ValidationError(
                "upstream.server must be an https:// URL".into(),
            ));
        }
        if self.spicedb.endpoint.is_empty() {
            return Err(ConfigError::ValidationError(
                "spicedb.endpoint must be set".into(),
            ));
        }
        if self.rules.path.is_empty() {
            return Err(ConfigError::ValidationError("rules.path must be set".into()));
        }
        if self.server.body_limit_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "server.body_limit_bytes must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub address: String,
    /// Maximum request body read for authorization purposes.
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

fn default_body_limit() -> usize {
    DEFAULT_BODY_LIMIT
}

/// Upstream Kubernetes API server configuration. Credentials reference PEM
/// files on disk; discovery of kubeconfigs is intentionally out of scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the API server, e.g. `https://10.0.0.1:6443`.
    pub server: String,
    #[serde(default)]
    pub ca_cert: Option<String>,
    #[serde(default)]
    pub client_cert: Option<String>,
    #[serde(default)]
    pub client_key: Option<String>,
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}

/// Permission service endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpiceDbConfig {
    /// gRPC endpoint, e.g. `http://spicedb:50051`.
    pub endpoint: String,
    /// Preshared token; expanded from the environment in the common case.
    #[serde(default)]
    pub token: Option<String>,
}

/// Rule file configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
    pub path: String,
}

/// Dual-write workflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Durable store file. Empty means in-memory.
    #[serde(default)]
    pub store_path: String,
    /// Default locking strategy for rules that do not set one.
    #[serde(default = "default_lock_mode")]
    pub lock_mode: LockMode,
    /// How long a request waits for its workflow.
    #[serde(default = "default_workflow_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            store_path: String::new(),
            lock_mode: default_lock_mode(),
            timeout_secs: default_workflow_timeout_secs(),
        }
    }
}

fn default_lock_mode() -> LockMode {
    LockMode::Pessimistic
}

fn default_workflow_timeout_secs() -> u64 {
    30
}

/// Authentication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthenticationConfig {
    #[serde(default)]
    pub mode: AuthenticationMode,
    /// Identity assigned by the `anonymous` mode.
    #[serde(default)]
    pub anonymous_user: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthenticationMode {
    /// Trust `X-Remote-*` identity headers from a front proxy.
    #[default]
    Headers,
    /// Assign every request a fixed identity.
    Anonymous,
}
