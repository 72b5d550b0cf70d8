//! Business plugins and the factory that builds them from configuration.
//!
//! Each `[biz.<NAME>]` section names its implementation with `plugin`
//! (default `"default"`). Unknown names stop startup.

mod bsi;
mod default;

use std::sync::Arc;

pub use bsi::BsiPlugin;
pub use default::DefaultPlugin;

use crate::config::{BizConfig, ConfigError, Settings};
use crate::watchdog::Plugin;

type Factory = fn(&str, &BizConfig) -> Arc<dyn Plugin>;

/// Registered plugin implementations, by factory key.
const FACTORIES: &[(&str, Factory)] = &[("default", default_plugin), ("bsi", bsi_plugin)];

fn default_plugin(name: &str, cfg: &BizConfig) -> Arc<dyn Plugin> {
    Arc::new(DefaultPlugin::new(name, cfg.clone()))
}

fn bsi_plugin(name: &str, cfg: &BizConfig) -> Arc<dyn Plugin> {
    Arc::new(BsiPlugin::new(name, cfg.clone()))
}

/// Names accepted by the `plugin` key.
pub fn available() -> impl Iterator<Item = &'static str> {
    FACTORIES.iter().map(|(key, _)| *key)
}

/// Construct one plugin.
pub fn build(name: &str, cfg: &BizConfig) -> Result<Arc<dyn Plugin>, ConfigError> {
    let key = cfg.plugin.trim().to_ascii_lowercase();
    FACTORIES
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, factory)| factory(name, cfg))
        .ok_or_else(|| ConfigError::UnknownPlugin {
            biz: name.to_string(),
            plugin: cfg.plugin.clone(),
        })
}

/// Construct a plugin for every configured business, in name order.
///
/// Inactive businesses are still built; the hook registry filters them.
pub fn autoload(settings: &Settings) -> Result<Vec<Arc<dyn Plugin>>, ConfigError> {
    settings
        .biz
        .iter()
        .map(|(name, cfg)| build(name, cfg))
        .collect()
}
