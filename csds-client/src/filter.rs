//! Client-side selection of node dumps by node id.

use std::str::FromStr;

use regex::Regex;

use crate::error::{Error, Result};
use crate::message::NodeDump;

/// How a filter pattern is applied to node ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    /// Keep every node.
    #[default]
    All,
    /// Keep nodes whose id starts with the pattern.
    Prefix,
    /// Keep nodes whose id ends with the pattern.
    Suffix,
    /// Keep nodes whose id matches the regex anywhere.
    Regex,
}

impl FromStr for FilterMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "all" => Ok(FilterMode::All),
            "prefix" => Ok(FilterMode::Prefix),
            "suffix" => Ok(FilterMode::Suffix),
            "regex" => Ok(FilterMode::Regex),
            other => Err(Error::Config(format!(
                "unsupported filter_mode {other:?}, expected one of: prefix, suffix, regex"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
enum Matcher {
    All,
    Prefix(String),
    Suffix(String),
    Regex(Regex),
}

/// A compiled node filter.
#[derive(Debug, Clone)]
pub struct NodeFilter {
    matcher: Matcher,
}

impl NodeFilter {
    /// Compile a filter.
    ///
    /// Returns [`Error::Config`] if `mode` is [`FilterMode::Regex`] and the
    /// pattern does not compile.
    pub fn new(mode: FilterMode, pattern: &str) -> Result<Self> {
        let matcher = match mode {
            FilterMode::All => Matcher::All,
            FilterMode::Prefix => Matcher::Prefix(pattern.to_string()),
            FilterMode::Suffix => Matcher::Suffix(pattern.to_string()),
            FilterMode::Regex => Regex::new(pattern)
                .map(Matcher::Regex)
                .map_err(|e| Error::Config(format!("invalid filter_pattern: {e}")))?,
        };
        Ok(Self { matcher })
    }

    /// A filter that keeps everything.
    pub fn all() -> Self {
        Self {
            matcher: Matcher::All,
        }
    }

    /// Whether a node with this id is kept.
    pub fn matches(&self, node_id: &str) -> bool {
        match &self.matcher {
            Matcher::All => true,
            Matcher::Prefix(prefix) => node_id.starts_with(prefix.as_str()),
            Matcher::Suffix(suffix) => node_id.ends_with(suffix.as_str()),
            Matcher::Regex(regex) => regex.is_match(node_id),
        }
    }

    /// Drop the dumps of nodes that do not match, keeping order.
    pub fn retain(&self, mut dumps: Vec<NodeDump>) -> Vec<NodeDump> {
        if matches!(self.matcher, Matcher::All) {
            return dumps;
        }
        let before = dumps.len();
        dumps.retain(|dump| self.matches(&dump.node.id));
        tracing::debug!(kept = dumps.len(), dropped = before - dumps.len(), "filtered node dumps");
        dumps
    }
}

impl Default for NodeFilter {
    fn default() -> Self {
        Self::all()
    }
}
