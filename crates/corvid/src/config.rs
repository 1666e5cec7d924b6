//! Process-wide host configuration.
//!
//! A [`HostConfig`] is assembled once by the embedding front end through
//! [`HostConfig::builder`] and frozen inside the runtime behind an `Arc`. Nothing in the
//! runtime mutates it afterwards; `sys` exposes read-only views of some fields.

use std::sync::Arc;

/// Default maximum call depth, as `sys.getrecursionlimit()` reports it.
pub const DEFAULT_RECURSION_LIMIT: usize = 1000;

/// Rules a call site may hold before it goes megamorphic.
pub const DEFAULT_POLYMORPHIC_LIMIT: usize = 10;

/// Entries after which a code object is compiled to a delegate.
pub const DEFAULT_TIER_THRESHOLD: u32 = 32;

/// What the runtime does with `warnings`-style diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum WarningFilter {
    #[default]
    Default,
    Ignore,
    /// Warnings become exceptions.
    Error,
    Always,
}

impl WarningFilter {
    /// Parses a `-W` action name.
    #[must_use]
    pub fn parse(action: &str) -> Option<Self> {
        Some(match action {
            "default" => Self::Default,
            "ignore" => Self::Ignore,
            "error" => Self::Error,
            "always" => Self::Always,
            _ => return None,
        })
    }
}

/// Read-only process defaults supplied by the host.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HostConfig {
    /// Directories the host's importer searches, exposed as `sys.path`.
    pub search_paths: Vec<Arc<str>>,
    pub recursion_limit: usize,
    pub warnings: Vec<WarningFilter>,
    /// `-O` count. Any non-zero level strips asserts and docstrings.
    pub optimize: u8,
    /// Ignore environment-derived paths (`-I`).
    pub isolated: bool,
    /// `sys.argv`.
    pub argv: Vec<Arc<str>>,
    pub polymorphic_limit: usize,
    pub tier_threshold: u32,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            search_paths: Vec::new(),
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            warnings: Vec::new(),
            optimize: 0,
            isolated: false,
            argv: vec![Arc::from("")],
            polymorphic_limit: DEFAULT_POLYMORPHIC_LIMIT,
            tier_threshold: DEFAULT_TIER_THRESHOLD,
        }
    }
}

impl HostConfig {
    #[must_use]
    pub fn builder() -> HostConfigBuilder {
        HostConfigBuilder::default()
    }
}

/// Builder for [`HostConfig`].
#[derive(Debug, Clone, Default)]
pub struct HostConfigBuilder {
    config: HostConfig,
}

impl HostConfigBuilder {
    #[must_use]
    pub fn search_path(mut self, path: impl Into<Arc<str>>) -> Self {
        self.config.search_paths.push(path.into());
        self
    }

    #[must_use]
    pub fn recursion_limit(mut self, limit: usize) -> Self {
        self.config.recursion_limit = limit;
        self
    }

    #[must_use]
    pub fn warning(mut self, filter: WarningFilter) -> Self {
        self.config.warnings.push(filter);
        self
    }

    #[must_use]
    pub fn optimize(mut self, level: u8) -> Self {
        self.config.optimize = level;
        self
    }

    #[must_use]
    pub fn isolated(mut self, isolated: bool) -> Self {
        self.config.isolated = isolated;
        self
    }

    /// Sets `sys.argv`. An empty list becomes `['']`.
    #[must_use]
    pub fn argv<S: Into<Arc<str>>>(mut self, argv: impl IntoIterator<Item = S>) -> Self {
        self.config.argv = argv.into_iter().map(Into::into).collect();
        if self.config.argv.is_empty() {
            self.config.argv.push(Arc::from(""));
        }
        self
    }

    /// Sets the rule count at which call sites go megamorphic. Zero is treated as one.
    #[must_use]
    pub fn polymorphic_limit(mut self, limit: usize) -> Self {
        self.config.polymorphic_limit = limit.max(1);
        self
    }

    #[must_use]
    pub fn tier_threshold(mut self, calls: u32) -> Self {
        self.config.tier_threshold = calls;
        self
    }

    #[must_use]
    pub fn build(self) -> HostConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = HostConfig::default();
        assert_eq!(config.recursion_limit, 1000);
        assert_eq!(config.polymorphic_limit, 10);
        assert_eq!(config.tier_threshold, 32);
        assert_eq!(config.argv, vec![Arc::<str>::from("")]);
    }

    #[test]
    fn builder_sets_fields() {
        let config = HostConfig::builder()
            .search_path("lib")
            .argv(["prog.py", "x"])
            .optimize(2)
            .polymorphic_limit(0)
            .warning(WarningFilter::Error)
            .build();
        assert_eq!(config.search_paths, vec![Arc::<str>::from("lib")]);
        assert_eq!(config.argv.len(), 2);
        assert_eq!(config.optimize, 2);
        assert_eq!(config.polymorphic_limit, 1);
        assert_eq!(config.warnings, vec![WarningFilter::Error]);
    }

    #[test]
    fn warning_actions_parse() {
        assert_eq!(WarningFilter::parse("ignore"), Some(WarningFilter::Ignore));
        assert_eq!(WarningFilter::parse("bogus"), None);
    }
}
