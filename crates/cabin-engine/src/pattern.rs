//! Shell-style glob patterns over dataset names.

use std::fmt;
use std::str::FromStr;

use globset::{GlobBuilder, GlobMatcher};

use crate::error::EngineError;

/// A dataset name or glob.
///
/// `*` matches any run of characters, `?` a single one, and `[...]` a
/// character class. Display names contain no path separators, so `*` is
/// allowed to cross `/`.
#[derive(Debug, Clone)]
pub struct DatasetPattern {
    raw: String,
    matcher: GlobMatcher,
}

impl DatasetPattern {
    pub fn new(pattern: &str) -> Result<Self, EngineError> {
        let matcher = GlobBuilder::new(pattern)
            .literal_separator(false)
            .build()
            .map_err(|e| EngineError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.kind().to_string(),
            })?
            .compile_matcher();

        Ok(Self {
            raw: pattern.to_string(),
            matcher,
        })
    }

    /// Whether the pattern contains wildcards.
    pub fn is_glob(&self) -> bool {
        self.raw.contains(['*', '?', '['])
    }

    pub fn matches(&self, name: &str) -> bool {
        self.matcher.is_match(name)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for DatasetPattern {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for DatasetPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
