//! Merge rules: defaults, override order, conflict handling.

use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder with merge policy defaults applied.
///
/// Later sources override these key by key; tables are merged, not replaced.
pub fn builder_with_defaults() -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError>
{
    Config::builder()
        .set_default("system.storage.state_dir", ".glossgen")?
        .set_default("catalog.terms_path", "terms.json")?
        .set_default("catalog.dimensions_path", "dimensions.toml")?
        .set_default("run.order", "top-down")?
        .set_default("run.in_flight", "drain")
}
