//! Classification rules
//!
//! Rules come from a line-oriented file of whitespace-separated `key=value`
//! pairs (`mark=42 proto=http method=GET url=^/private/.*`). Patterns are
//! case-insensitive regular expressions compiled once at load time; matching
//! scans rules in declaration order and the first hit wins.

use std::fmt;
use std::fs;
use std::path::Path;

use regex::{Regex, RegexBuilder};
use tracing::{info, warn};

use crate::error::{FlowmarkError, Result};

/// Mark of a connection the classifier never touched.
pub const MARK_UNTOUCHED: u32 = 0;
/// Mark of a connection still being classified.
pub const MARK_NO_MATCH_YET: u32 = 1;
/// Terminal mark of a connection no rule matched.
pub const MARK_NO_MATCH: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleProtocol {
    Http,
    Ftp,
}

impl fmt::Display for RuleProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleProtocol::Http => write!(f, "http"),
            RuleProtocol::Ftp => write!(f, "ftp"),
        }
    }
}

/// A single classification rule. Absent constraints match anything.
pub struct ClassificationRule {
    protocol: RuleProtocol,
    mark: u32,
    method: Option<Regex>,
    url: Option<Regex>,
}

fn compile_pattern(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| FlowmarkError::Pattern {
            pattern: pattern.to_string(),
            source,
        })
}

impl ClassificationRule {
    pub fn new(protocol: RuleProtocol, mark: u32) -> Self {
        Self {
            protocol,
            mark,
            method: None,
            url: None,
        }
    }

    pub fn mark(&self) -> u32 {
        self.mark
    }

    /// Match the method exactly (the literal is anchored, not escaped).
    pub fn set_method_literal(&mut self, method: &str) -> Result<()> {
        self.method = Some(compile_pattern(&format!("^{}$", method))?);
        Ok(())
    }

    pub fn set_method_regex(&mut self, pattern: &str) -> Result<()> {
        self.method = Some(compile_pattern(pattern)?);
        Ok(())
    }

    pub fn set_url_regex(&mut self, pattern: &str) -> Result<()> {
        self.url = Some(compile_pattern(pattern)?);
        Ok(())
    }

    /// Match URLs strictly longer than `max_size` characters.
    pub fn set_url_maxsize(&mut self, max_size: usize) -> Result<()> {
        if max_size < 1 {
            return Err(FlowmarkError::UrlMaxSize(max_size));
        }
        self.url = Some(compile_pattern(&format!("^.{{{},}}$", max_size + 1))?);
        Ok(())
    }

    pub fn matches(&self, protocol: RuleProtocol, method: &str, url: &str) -> bool {
        self.protocol == protocol
            && self.method.as_ref().map_or(true, |re| re.is_match(method))
            && self.url.as_ref().map_or(true, |re| re.is_match(url))
    }
}

impl fmt::Display for ClassificationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mark={} proto={}", self.mark, self.protocol)?;
        if let Some(url) = &self.url {
            write!(f, " url={}", url.as_str())?;
        }
        if let Some(method) = &self.method {
            write!(f, " method={}", method.as_str())?;
        }
        Ok(())
    }
}

/// Ordered rule list. Immutable after startup; shared by all connections.
#[derive(Default)]
pub struct RuleSet {
    rules: Vec<ClassificationRule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, rule: ClassificationRule) {
        self.rules.push(rule);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    /// First-match scan. Returns the matching rule's mark, or
    /// [`MARK_NO_MATCH`] when no rule matches.
    pub fn classify(&self, protocol: RuleProtocol, method: &str, url: &str) -> u32 {
        for rule in &self.rules {
            if rule.matches(protocol, method, url) {
                return rule.mark();
            }
        }
        MARK_NO_MATCH
    }

    /// Load a rule file. Blank lines and `#` comments are skipped;
    /// unrecognized keys are ignored.
    pub fn load(path: &Path) -> Result<RuleSet> {
        let contents = fs::read_to_string(path).map_err(|source| FlowmarkError::RuleFile {
            path: path.to_path_buf(),
            source,
        })?;
        let set = Self::parse(&contents)?;
        info!("loaded {} rules from {}", set.len(), path.display());
        for (n, rule) in set.rules().iter().enumerate() {
            info!("  ({}) {}", n, rule);
        }
        Ok(set)
    }

    fn parse(contents: &str) -> Result<RuleSet> {
        let mut set = RuleSet::new();

        for (nline, raw) in contents.lines().enumerate() {
            let nline = nline + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut mark = None;
            let mut proto = None;
            let mut method = None;
            let mut method_re = None;
            let mut url = None;
            let mut url_maxsize = None;

            for token in line.split_whitespace() {
                let (key, value) = token.split_once('=').ok_or_else(|| FlowmarkError::Rule {
                    line: nline,
                    message: format!("'{}' is not a key=value pair", token),
                })?;
                match key {
                    "mark" => {
                        mark = Some(value.parse::<u32>().map_err(|_| FlowmarkError::Rule {
                            line: nline,
                            message: format!("invalid mark '{}'", value),
                        })?)
                    }
                    "proto" => {
                        proto = Some(match value.to_ascii_lowercase().as_str() {
                            "http" => RuleProtocol::Http,
                            "ftp" => RuleProtocol::Ftp,
                            other => {
                                return Err(FlowmarkError::Rule {
                                    line: nline,
                                    message: format!("unrecognized protocol '{}'", other),
                                })
                            }
                        })
                    }
                    "method" => method = Some(value),
                    "method_re" => method_re = Some(value),
                    "url" => url = Some(value),
                    "url_maxsize" => {
                        url_maxsize =
                            Some(value.parse::<usize>().map_err(|_| FlowmarkError::Rule {
                                line: nline,
                                message: format!("invalid url_maxsize '{}'", value),
                            })?)
                    }
                    _ => {}
                }
            }

            let (Some(mark), Some(proto)) = (mark, proto) else {
                return Err(FlowmarkError::Rule {
                    line: nline,
                    message: "a rule must include at least a mark and a proto".into(),
                });
            };

            let mut rule = ClassificationRule::new(proto, mark);
            match (method, method_re) {
                (Some(_), Some(re)) => {
                    warn!("rule file line {}: both method and method_re given, method_re wins", nline);
                    rule.set_method_regex(re)?;
                }
                (None, Some(re)) => rule.set_method_regex(re)?,
                (Some(m), None) => rule.set_method_literal(m)?,
                (None, None) => {}
            }
            if let Some(pattern) = url {
                rule.set_url_regex(pattern)?;
            }
            if let Some(size) = url_maxsize {
                rule.set_url_maxsize(size).map_err(|e| FlowmarkError::Rule {
                    line: nline,
                    message: e.to_string(),
                })?;
            }

            set.push(rule);
        }

        Ok(set)
    }
}
