//! Configuration-driven plugin used by most businesses.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Local};

use crate::config::BizConfig;
use crate::watchdog::handlers::{ConsoleHandler, LocalBackupHandler};
use crate::watchdog::{
    AutoCheck, AutoInit, ChangeEvent, CheckFile, FileRecord, Handle404Error, Hook, HookContext,
    HookError, Mount, Operation, Plugin, Registrar,
};

/// Modification times further ahead than this point at a wrong clock.
const MAX_CLOCK_SKEW_HOURS: i64 = 24;

/// Builds its rule and sinks straight from a `[biz.<NAME>]` section.
pub struct DefaultPlugin {
    business_id: String,
    config: BizConfig,
}

impl DefaultPlugin {
    pub fn new(business_id: impl Into<String>, config: BizConfig) -> Self {
        Self {
            business_id: business_id.into(),
            config,
        }
    }

    pub fn config(&self) -> &BizConfig {
        &self.config
    }

    fn owns(&self, event: &ChangeEvent) -> bool {
        event.business_id == self.business_id
    }

    fn fail(&self, hook: Hook, reason: impl Into<String>) -> HookError {
        HookError::new(&self.business_id, hook, reason)
    }
}

impl AutoCheck for DefaultPlugin {
    fn auto_check(&self, registrar: &mut Registrar) -> Result<(), HookError> {
        crate::debug_event!("plugin", "AutoCheck", "{}", self.business_id);

        match &self.config.watch {
            Some(path) if !path.as_os_str().is_empty() => {}
            _ => {
                return Err(self.fail(
                    Hook::AutoCheck,
                    format!("no \"watch\" configured in [biz.{}]", self.business_id),
                ));
            }
        }

        // patterns must compile
        self.config
            .to_rule(&self.business_id, registrar.settings().watchdog.default_debounce())
            .map(|_| ())
            .map_err(|e| self.fail(Hook::AutoCheck, e.to_string()))
    }
}

impl AutoInit for DefaultPlugin {
    fn auto_init(&self, registrar: &mut Registrar) -> Result<(), HookError> {
        crate::debug_event!("plugin", "AutoInit", "{}", self.business_id);

        let rule = self
            .config
            .to_rule(&self.business_id, registrar.settings().watchdog.default_debounce())
            .map_err(|e| self.fail(Hook::AutoInit, e.to_string()))?;
        registrar.set_rule(rule);
        registrar.set_watch_strategy(&self.business_id, &self.config.strategies());

        if let Some(dest) = self.config.backup.as_ref().filter(|d| !d.as_os_str().is_empty()) {
            registrar.add_handler(
                &self.business_id,
                Arc::new(LocalBackupHandler::new(dest, self.config.backup_priority)),
            );
        }

        if self.config.console {
            registrar.add_handler(
                &self.business_id,
                Arc::new(ConsoleHandler::new(self.config.console_priority)),
            );
        }

        Ok(())
    }
}

impl Mount for DefaultPlugin {
    fn mount(&self, registrar: &mut Registrar) -> Result<(), HookError> {
        let handlers = registrar
            .chain(&self.business_id)
            .map(|chain| chain.names().join(" > "))
            .unwrap_or_default();
        crate::log_event!(
            "plugin",
            "mounted",
            "{} [{}]",
            self.business_id,
            if handlers.is_empty() { "no handlers" } else { handlers.as_str() }
        );
        Ok(())
    }
}

impl CheckFile for DefaultPlugin {
    fn check_file(&self, _ctx: &HookContext, record: &FileRecord) -> Result<(), HookError> {
        let event = &record.originating_event;
        if !self.owns(event) || event.operation == Operation::Load {
            return Ok(());
        }

        // warn only, the file still ships
        if record.modify_time > Local::now() + ChronoDuration::hours(MAX_CLOCK_SKEW_HOURS) {
            tracing::warn!(
                "[plugin] {} modified in the future ({}), check the clock on {}",
                record.absolute_path.display(),
                record.modify_time,
                record.host_id
            );
        }
        Ok(())
    }
}

impl Handle404Error for DefaultPlugin {
    fn handle_404(
        &self,
        _ctx: &HookContext,
        event: &ChangeEvent,
        error: &std::io::Error,
    ) -> Result<(), HookError> {
        if self.owns(event) {
            crate::debug_event!("plugin", "gone before dispatch", "{event}: {error}");
        }
        Ok(())
    }
}

impl Plugin for DefaultPlugin {
    fn name(&self) -> &str {
        &self.business_id
    }

    fn is_active(&self) -> bool {
        self.config.enabled
    }

    fn as_auto_check(&self) -> Option<&dyn AutoCheck> {
        Some(self)
    }

    fn as_auto_init(&self) -> Option<&dyn AutoInit> {
        Some(self)
    }

    fn as_mount(&self) -> Option<&dyn Mount> {
        Some(self)
    }

    fn as_check_file(&self) -> Option<&dyn CheckFile> {
        Some(self)
    }

    fn as_handle_404(&self) -> Option<&dyn Handle404Error> {
        Some(self)
    }
}
