//! Configuration System
//!
//! Layered configuration: merge-policy defaults, then the global config file, then
//! workspace files, then `TURIUM__*` environment variables. Each component owns its
//! section type; this module assembles and validates them.

use crate::error::BlockError;
use crate::logging::LoggingConfig;
use config::Environment;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub use crate::relay::token::StorageConfig;
pub use crate::relay::RelayConfig;
pub use crate::sandbox::SandboxConfig;
pub use crate::selector::resolver::ResolverConfig;

mod merge {
    pub mod merge_policy;
}
mod sources {
    pub mod global_file;
    pub mod workspace_file;
}

pub use sources::global_file::global_config_path;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TuriumConfig {
    /// Selector chain resolution
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Isolated code execution
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Cross-frame relay
    #[serde(default)]
    pub relay: RelayConfig,

    /// Message token storage
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    Resolver(String),
    Sandbox(String),
    Relay(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Resolver(msg) => write!(f, "Resolver: {}", msg),
            ValidationError::Sandbox(msg) => write!(f, "Sandbox: {}", msg),
            ValidationError::Relay(msg) => write!(f, "Relay: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl TuriumConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.resolver.poll_interval_ms == 0 {
            errors.push(ValidationError::Resolver(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.resolver.poll_interval_ms > self.resolver.wait_ms && self.resolver.wait_ms > 0 {
            errors.push(ValidationError::Resolver(format!(
                "poll_interval_ms ({}) exceeds wait_ms ({})",
                self.resolver.poll_interval_ms, self.resolver.wait_ms
            )));
        }
        if self.sandbox.default_timeout_ms == 0 {
            errors.push(ValidationError::Sandbox(
                "default_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.relay.timeout_ms == 0 {
            errors.push(ValidationError::Relay(
                "timeout_ms must be greater than zero".to_string(),
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Loads [`TuriumConfig`] from the layered sources.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration for a workspace root.
    pub fn load(workspace_root: &Path) -> Result<TuriumConfig, BlockError> {
        let builder = merge::merge_policy::builder_with_defaults()?;
        let builder = sources::global_file::add_to_builder(builder)?;
        let builder = sources::workspace_file::add_to_builder(builder, workspace_root)?;
        let builder = builder.add_source(Environment::with_prefix("TURIUM").separator("__"));
        Self::finish(builder.build()?)
    }

    /// Load configuration from one explicit file (skips global and workspace files).
    pub fn load_from_file(path: &Path) -> Result<TuriumConfig, BlockError> {
        if !path.exists() {
            return Err(BlockError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        let builder = merge::merge_policy::builder_with_defaults()?
            .add_source(config::File::from(path))
            .add_source(Environment::with_prefix("TURIUM").separator("__"));
        Self::finish(builder.build()?)
    }

    fn finish(raw: config::Config) -> Result<TuriumConfig, BlockError> {
        let config: TuriumConfig = raw.try_deserialize()?;
        config.validate().map_err(|errors| {
            let error_msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            BlockError::Config(format!(
                "Configuration validation failed:\n{}",
                error_msgs.join("\n")
            ))
        })?;
        Ok(config)
    }
}
