//! Plugin lifecycle hooks.
//!
//! Each hook is a small capability trait. A plugin exposes the hooks it
//! implements through the `as_*` accessors on [`Plugin`]; the rest default
//! to `None`, so a business that needs no `Transform` simply doesn't
//! provide one.
//!
//! ```text
//! startup:   AutoCheck -> AutoInit -> Mount           (fatal on error)
//! per file:  CheckFile -> Transform -> handler chain
//! on stat failure: Handle404Error
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::config::Settings;

use super::error::HookError;
use super::event::ChangeEvent;
use super::handler::{Handler, HandlerChain};
use super::record::FileRecord;
use super::rule::{Rule, WatchStrategy};

/// Names of the hook points, for logging and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    AutoCheck,
    AutoInit,
    Mount,
    CheckFile,
    Transform,
    Handle404Error,
}

impl Hook {
    pub fn as_str(&self) -> &'static str {
        match self {
            Hook::AutoCheck => "AutoCheck",
            Hook::AutoInit => "AutoInit",
            Hook::Mount => "Mount",
            Hook::CheckFile => "CheckFile",
            Hook::Transform => "Transform",
            Hook::Handle404Error => "Handle404Error",
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validate the plugin's configuration before anything is registered.
pub trait AutoCheck: Send + Sync {
    fn auto_check(&self, registrar: &mut Registrar) -> Result<(), HookError>;
}

/// Register rules, strategies and handlers.
pub trait AutoInit: Send + Sync {
    fn auto_init(&self, registrar: &mut Registrar) -> Result<(), HookError>;
}

/// Post-init customization.
pub trait Mount: Send + Sync {
    fn mount(&self, registrar: &mut Registrar) -> Result<(), HookError>;
}

/// Reject a file before anything is shipped.
pub trait CheckFile: Send + Sync {
    fn check_file(&self, ctx: &HookContext, record: &FileRecord) -> Result<(), HookError>;
}

/// Normalize a record in place.
pub trait Transform: Send + Sync {
    fn transform(&self, ctx: &HookContext, record: &mut FileRecord) -> Result<(), HookError>;
}

/// React to an event whose file could not be stat'ed or read.
pub trait Handle404Error: Send + Sync {
    fn handle_404(
        &self,
        ctx: &HookContext,
        event: &ChangeEvent,
        error: &std::io::Error,
    ) -> Result<(), HookError>;
}

/// A business module.
pub trait Plugin: Send + Sync {
    /// Business id this plugin serves.
    fn name(&self) -> &str;

    fn is_active(&self) -> bool {
        true
    }

    fn as_auto_check(&self) -> Option<&dyn AutoCheck> {
        None
    }

    fn as_auto_init(&self) -> Option<&dyn AutoInit> {
        None
    }

    fn as_mount(&self) -> Option<&dyn Mount> {
        None
    }

    fn as_check_file(&self) -> Option<&dyn CheckFile> {
        None
    }

    fn as_transform(&self) -> Option<&dyn Transform> {
        None
    }

    fn as_handle_404(&self) -> Option<&dyn Handle404Error> {
        None
    }
}

/// Read-only context for per-file hooks.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub host_id: String,
}

impl HookContext {
    pub fn new(host_id: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
        }
    }
}

/// Mutable setup surface handed to the lifecycle hooks.
///
/// Everything registered here is frozen into the running pipeline once
/// `Mount` has completed.
pub struct Registrar {
    host_id: String,
    settings: Arc<Settings>,
    rules: BTreeMap<String, Rule>,
    strategies: BTreeMap<String, Vec<WatchStrategy>>,
    chains: BTreeMap<String, HandlerChain>,
}

impl Registrar {
    pub fn new(host_id: impl Into<String>, settings: Arc<Settings>) -> Self {
        Self {
            host_id: host_id.into(),
            settings,
            rules: BTreeMap::new(),
            strategies: BTreeMap::new(),
            chains: BTreeMap::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host_id
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Register (or replace) the rule for `rule.business_id`.
    pub fn set_rule(&mut self, rule: Rule) {
        self.rules.insert(rule.business_id.clone(), rule);
    }

    pub fn set_watch_strategy(&mut self, business_id: &str, strategies: &[WatchStrategy]) {
        let mut list = strategies.to_vec();
        list.dedup();
        self.strategies.insert(business_id.to_string(), list);
    }

    pub fn add_handler(&mut self, business_id: &str, handler: Arc<dyn Handler>) {
        self.chains
            .entry(business_id.to_string())
            .or_default()
            .push(handler);
    }

    pub fn rule(&self, business_id: &str) -> Option<&Rule> {
        self.rules.get(business_id)
    }

    pub fn strategies(&self, business_id: &str) -> &[WatchStrategy] {
        self.strategies
            .get(business_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn chain(&self, business_id: &str) -> Option<&HandlerChain> {
        self.chains.get(business_id)
    }

    /// Business ids with a registered rule, in sorted order.
    pub fn businesses(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    pub(crate) fn into_parts(self) -> Registration {
        Registration {
            host_id: self.host_id,
            rules: self.rules,
            strategies: self.strategies,
            chains: self.chains,
        }
    }
}

/// Frozen output of the lifecycle hooks.
pub(crate) struct Registration {
    pub host_id: String,
    pub rules: BTreeMap<String, Rule>,
    pub strategies: BTreeMap<String, Vec<WatchStrategy>>,
    pub chains: BTreeMap<String, HandlerChain>,
}

/// Ordered set of active plugins.
#[derive(Default, Clone)]
pub struct HookRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the active plugins, in the order given. Returns how many were kept.
    pub fn import(&mut self, plugins: impl IntoIterator<Item = Arc<dyn Plugin>>) -> usize {
        let before = self.plugins.len();
        for plugin in plugins {
            if plugin.is_active() {
                crate::debug_event!("hooks", "imported", "{}", plugin.name());
                self.plugins.push(plugin);
            } else {
                crate::log_event!("hooks", "skipped inactive plugin", "{}", plugin.name());
            }
        }
        self.plugins.len() - before
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn plugin_names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Invoke `hook` on every plugin implementing it, in import order.
    ///
    /// `call` returns `None` for plugins lacking the capability. The first
    /// error stops the remaining invocations. Returns the number of plugins
    /// invoked.
    pub fn trigger<F>(&self, hook: Hook, mut call: F) -> Result<usize, HookError>
    where
        F: FnMut(&dyn Plugin) -> Option<Result<(), HookError>>,
    {
        let mut invoked = 0;
        for plugin in &self.plugins {
            if let Some(result) = call(plugin.as_ref()) {
                invoked += 1;
                if let Err(e) = result {
                    crate::debug_event!("hooks", "aborted", "{hook} at {}: {e}", plugin.name());
                    return Err(e);
                }
            }
        }
        Ok(invoked)
    }

    pub fn auto_check(&self, registrar: &mut Registrar) -> Result<usize, HookError> {
        self.trigger(Hook::AutoCheck, |p| {
            p.as_auto_check().map(|h| h.auto_check(registrar))
        })
    }

    pub fn auto_init(&self, registrar: &mut Registrar) -> Result<usize, HookError> {
        self.trigger(Hook::AutoInit, |p| {
            p.as_auto_init().map(|h| h.auto_init(registrar))
        })
    }

    pub fn mount(&self, registrar: &mut Registrar) -> Result<usize, HookError> {
        self.trigger(Hook::Mount, |p| p.as_mount().map(|h| h.mount(registrar)))
    }

    /// Run the three startup hooks in order.
    pub fn run_lifecycle(&self, registrar: &mut Registrar) -> Result<(), HookError> {
        self.auto_check(registrar)?;
        self.auto_init(registrar)?;
        self.mount(registrar)?;
        Ok(())
    }

    pub fn check_file(&self, ctx: &HookContext, record: &FileRecord) -> Result<usize, HookError> {
        self.trigger(Hook::CheckFile, |p| {
            p.as_check_file().map(|h| h.check_file(ctx, record))
        })
    }

    pub fn transform(&self, ctx: &HookContext, record: &mut FileRecord) -> Result<usize, HookError> {
        self.trigger(Hook::Transform, |p| {
            p.as_transform().map(|h| h.transform(ctx, record))
        })
    }

    pub fn handle_404(
        &self,
        ctx: &HookContext,
        event: &ChangeEvent,
        error: &std::io::Error,
    ) -> Result<usize, HookError> {
        self.trigger(Hook::Handle404Error, |p| {
            p.as_handle_404().map(|h| h.handle_404(ctx, event, error))
        })
    }
}
