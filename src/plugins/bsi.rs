//! BSI test-log plugin.
//!
//! BSI stations store logs as
//! `<family>/<model>/<date>/<test_id>[/<sub>]/<file>`, e.g.
//! `LOUP/1395T2936101/2017-06-07/MBBIVS171700094_1W_1_2017-06-07_16_15_42_797/FLOWLOG.ZIP`.
//! The test id ends in the moment the test ran. That timestamp is stable
//! across re-creations of the same archive, so it replaces the filesystem
//! times on the record.

use std::sync::LazyLock;

use chrono::{DateTime, Local, NaiveDate, TimeZone};
use regex::Regex;

use crate::config::BizConfig;
use crate::watchdog::{
    AutoCheck, AutoInit, CheckFile, FileRecord, Handle404Error, Hook, HookContext, HookError,
    Mount, Plugin, Transform,
};

use super::DefaultPlugin;

/// `YYYY-MM-DD_HH_MM_SS_mmm` at the end of a test id.
static TEST_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{4})-(\d{2})-(\d{2})_(\d{2})_(\d{2})_(\d{2})_(\d{3})$")
        .expect("test time pattern is valid")
});

pub struct BsiPlugin {
    inner: DefaultPlugin,
}

impl BsiPlugin {
    pub fn new(business_id: impl Into<String>, config: BizConfig) -> Self {
        Self {
            inner: DefaultPlugin::new(business_id, config),
        }
    }
}

/// Timestamp encoded at the end of a test id, if any.
///
/// `Ok(None)` when the id carries no timestamp; `Err` when it does but the
/// values are out of range.
pub fn parse_test_time(test_id: &str) -> Result<Option<DateTime<Local>>, String> {
    let Some(caps) = TEST_TIME.captures(test_id) else {
        return Ok(None);
    };
    let num = |i: usize| caps[i].parse::<u32>().unwrap_or(u32::MAX);

    let date = NaiveDate::from_ymd_opt(num(1) as i32, num(2), num(3))
        .ok_or_else(|| format!("bad date in test id '{test_id}'"))?;
    let naive = date
        .and_hms_milli_opt(num(4), num(5), num(6), num(7))
        .ok_or_else(|| format!("bad time in test id '{test_id}'"))?;

    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(Some)
        .ok_or_else(|| format!("nonexistent local time in test id '{test_id}'"))
}

impl Transform for BsiPlugin {
    /// Stamps the test time from segment 3 of the relative directory
    /// (`family/model/date/test_id`). The id stays at index 3 for deeper
    /// paths too, so in `family/model/date/test_id/sub` the trailing
    /// sub-folder is ignored.
    fn transform(&self, _ctx: &HookContext, record: &mut FileRecord) -> Result<(), HookError> {
        if record.business_id() != self.inner.name() {
            return Ok(());
        }

        let segments: Vec<&str> = record.relative_sub_directory.split('/').collect();
        if segments.len() != 4 && segments.len() != 5 {
            return Ok(());
        }

        let test_id = segments[3];
        match parse_test_time(test_id) {
            Ok(Some(when)) => {
                record.folder_create_time = when;
                record.create_time = when;
                crate::debug_event!("bsi", "test time", "{test_id} -> {when}");
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(reason) => Err(HookError::new(self.inner.name(), Hook::Transform, reason)),
        }
    }
}

impl Plugin for BsiPlugin {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    fn as_auto_check(&self) -> Option<&dyn AutoCheck> {
        self.inner.as_auto_check()
    }

    fn as_auto_init(&self) -> Option<&dyn AutoInit> {
        self.inner.as_auto_init()
    }

    fn as_mount(&self) -> Option<&dyn Mount> {
        self.inner.as_mount()
    }

    fn as_check_file(&self) -> Option<&dyn CheckFile> {
        self.inner.as_check_file()
    }

    fn as_transform(&self) -> Option<&dyn Transform> {
        Some(self)
    }

    fn as_handle_404(&self) -> Option<&dyn Handle404Error> {
        self.inner.as_handle_404()
    }
}
