//! Static per-business watch rules.
//!
//! A [`Rule`] names the root of a business tree, the sub-path actually
//! monitored beneath it, include/exclude regexes and the recursion limit
//! used by the native watcher. Rules are built once at startup and never
//! mutated afterwards.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;

use super::error::WatchError;

/// Which watch mechanisms a business runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchStrategy {
    /// OS change notifications (recursive, with liveness guard).
    Native,
    /// Periodic full-tree walk used as backfill.
    Polling,
}

impl WatchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchStrategy::Native => "native",
            WatchStrategy::Polling => "polling",
        }
    }
}

impl fmt::Display for WatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Watch configuration for one business.
#[derive(Debug, Clone)]
pub struct Rule {
    pub business_id: String,
    /// Root of the business tree; relative sub-directories are computed against it.
    pub root_path: PathBuf,
    /// Sub-path below the root that is actually monitored (may be empty).
    pub sub_path: PathBuf,
    include: Option<Regex>,
    exclude: Option<Regex>,
    /// Native watcher recursion limit, 0 = unlimited.
    pub max_depth: usize,
    pub debounce_interval: Duration,
}

impl Rule {
    /// Create a rule that accepts everything below `root_path`.
    pub fn new(business_id: impl Into<String>, root_path: impl Into<PathBuf>) -> Self {
        Self {
            business_id: business_id.into(),
            root_path: root_path.into(),
            sub_path: PathBuf::new(),
            include: None,
            exclude: None,
            max_depth: 0,
            debounce_interval: Duration::from_secs(3),
        }
    }

    pub fn with_sub_path(mut self, sub_path: impl Into<PathBuf>) -> Self {
        self.sub_path = sub_path.into();
        self
    }

    /// Set the include regex. Empty and `.*` both mean "match everything".
    pub fn with_include(mut self, pattern: &str) -> Result<Self, WatchError> {
        self.include = compile(&self.business_id, pattern, true)?;
        Ok(self)
    }

    /// Set the exclude regex. Empty means "exclude nothing".
    pub fn with_exclude(mut self, pattern: &str) -> Result<Self, WatchError> {
        self.exclude = compile(&self.business_id, pattern, false)?;
        Ok(self)
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_debounce(mut self, interval: Duration) -> Self {
        self.debounce_interval = interval;
        self
    }

    /// The directory the watchers start from: `root_path/sub_path`.
    pub fn monitor_path(&self) -> PathBuf {
        if self.sub_path.as_os_str().is_empty() {
            self.root_path.clone()
        } else {
            self.root_path.join(&self.sub_path)
        }
    }

    /// Same rule with the recursion limit lifted; used by the poller.
    pub fn unlimited(&self) -> Self {
        let mut rule = self.clone();
        rule.max_depth = 0;
        rule
    }

    /// Whether the exclude regex rejects this path.
    ///
    /// Patterns are matched against the `/`-separated form of the path.
    pub fn is_excluded(&self, path: &Path) -> bool {
        match &self.exclude {
            Some(re) => re.is_match(&slash_path(path)),
            None => false,
        }
    }

    /// Whether a file path passes both filters.
    pub fn accepts_file(&self, path: &Path) -> bool {
        if self.is_excluded(path) {
            return false;
        }
        match &self.include {
            Some(re) => re.is_match(&slash_path(path)),
            None => true,
        }
    }

    /// Whether a directory should be traversed / watched.
    ///
    /// The include pattern describes files, so it does not prune directories.
    pub fn accepts_dir(&self, path: &Path) -> bool {
        !self.is_excluded(path)
    }

    /// Depth of `path` below the monitor path (direct children are depth 1).
    pub fn depth_of(&self, path: &Path) -> Option<usize> {
        path.strip_prefix(self.monitor_path())
            .ok()
            .map(|rel| rel.components().count())
    }

    /// Whether a directory at `depth` may be descended into.
    pub fn within_depth(&self, depth: usize) -> bool {
        self.max_depth == 0 || depth <= self.max_depth
    }

    pub fn include_pattern(&self) -> Option<&str> {
        self.include.as_ref().map(|re| re.as_str())
    }

    pub fn exclude_pattern(&self) -> Option<&str> {
        self.exclude.as_ref().map(|re| re.as_str())
    }
}

fn compile(biz: &str, pattern: &str, is_include: bool) -> Result<Option<Regex>, WatchError> {
    let pattern = pattern.trim();
    if pattern.is_empty() || (is_include && pattern == ".*") {
        return Ok(None);
    }
    Regex::new(pattern)
        .map(Some)
        .map_err(|e| WatchError::InvalidRule {
            biz: biz.to_string(),
            reason: format!("bad pattern '{pattern}': {e}"),
        })
}

/// Render a path with `/` separators regardless of platform.
pub fn slash_path(path: &Path) -> String {
    let s = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        s.into_owned()
    } else {
        s.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_patterns_accept_everything() {
        let rule = Rule::new("T1", "/data/t1")
            .with_include("")
            .unwrap()
            .with_exclude("")
            .unwrap();

        assert!(rule.accepts_file(Path::new("/data/t1/a.txt")));
        assert!(rule.accepts_dir(Path::new("/data/t1/sub")));
        assert!(rule.include_pattern().is_none());
    }

    #[test]
    fn test_include_only_filters_files() {
        let rule = Rule::new("T1", "/data/t1").with_include(r"\.log$").unwrap();

        assert!(rule.accepts_file(Path::new("/data/t1/run.log")));
        assert!(!rule.accepts_file(Path::new("/data/t1/run.txt")));
        // directories are still traversed
        assert!(rule.accepts_dir(Path::new("/data/t1/station-3")));
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let rule = Rule::new("T1", "/data/t1")
            .with_include(r"\.log$")
            .unwrap()
            .with_exclude(r"/tmp/")
            .unwrap();

        assert!(!rule.accepts_file(Path::new("/data/t1/tmp/run.log")));
        assert!(!rule.accepts_dir(Path::new("/data/t1/tmp/")));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let err = Rule::new("T1", "/data/t1").with_include("([").unwrap_err();
        assert!(matches!(err, WatchError::InvalidRule { .. }));
    }

    #[test]
    fn test_monitor_path_and_depth() {
        let rule = Rule::new("T1", "/data/t1")
            .with_sub_path("line-a")
            .with_max_depth(2);

        assert_eq!(rule.monitor_path(), PathBuf::from("/data/t1/line-a"));
        assert_eq!(rule.depth_of(Path::new("/data/t1/line-a/x")), Some(1));
        assert_eq!(rule.depth_of(Path::new("/data/t1/line-a/x/y")), Some(2));
        assert_eq!(rule.depth_of(Path::new("/elsewhere")), None);

        assert!(rule.within_depth(2));
        assert!(!rule.within_depth(3));
        assert!(rule.unlimited().within_depth(50));
    }
}
