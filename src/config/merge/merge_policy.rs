//! Merge rules: defaults, override order, conflict handling.

use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder with merge policy defaults applied.
pub fn builder_with_defaults() -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError>
{
    Config::builder()
        .set_default("resolver.wait_ms", 5000)?
        .set_default("resolver.poll_interval_ms", 100)?
        .set_default("sandbox.default_timeout_ms", 20000)?
        .set_default("sandbox.preload_fetch_timeout_ms", 10000)?
        .set_default("relay.timeout_ms", 30000)
}
