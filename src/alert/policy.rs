//! Alert policy documents.
//!
//! A policy document is TOML or JSON (picked by file extension) with a
//! `version`, a `description` and a non-empty `rules` list. Several documents
//! merge into one [`RuleSet`]: a rule whose name was already loaded replaces
//! the earlier rule in place, keeping its original position.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::alert::rule::{AlertRule, PolicySet};
use crate::error::{Error, Result};

impl PolicySet {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let set: PolicySet = toml::from_str(s)?;
        set.validate()?;
        Ok(set)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let set: PolicySet = serde_json::from_str(s)?;
        set.validate()?;
        Ok(set)
    }

    /// Load a policy document, choosing the format from the extension.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase());
        let result = match ext.as_deref() {
            Some("toml") => Self::from_toml_str(&content),
            Some("json") => Self::from_json_str(&content),
            _ => return Err(Error::UnsupportedFormat(path.display().to_string())),
        };
        result.map_err(|e| match e {
            Error::Policy(msg) => Error::Policy(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    /// Check the document-level invariants.
    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(Error::Policy("missing version".to_string()));
        }
        if self.rules.is_empty() {
            return Err(Error::Policy("rule list is empty".to_string()));
        }
        let mut seen = HashSet::new();
        for rule in &self.rules {
            if rule.name.trim().is_empty() {
                return Err(Error::Policy("rule with empty name".to_string()));
            }
            if !seen.insert(rule.name.as_str()) {
                return Err(Error::Policy(format!("duplicate rule name '{}'", rule.name)));
            }
        }
        Ok(())
    }
}

/// Effective rules after merging policy documents in load order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSet {
    rules: Vec<AlertRule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sets(sets: impl IntoIterator<Item = PolicySet>) -> Self {
        let mut merged = Self::new();
        for set in sets {
            merged.merge(set);
        }
        merged
    }

    /// Load and merge the files in order. Later files take precedence.
    pub fn load_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut merged = Self::new();
        for path in paths {
            merged.merge(PolicySet::load(path.as_ref())?);
        }
        Ok(merged)
    }

    /// Merge a document on top of the current rules.
    pub fn merge(&mut self, set: PolicySet) {
        let mut positions: HashMap<String, usize> = self
            .rules
            .iter()
            .enumerate()
            .map(|(i, r)| (r.name.clone(), i))
            .collect();
        for rule in set.rules {
            match positions.get(&rule.name) {
                Some(&i) => self.rules[i] = rule,
                None => {
                    positions.insert(rule.name.clone(), self.rules.len());
                    self.rules.push(rule);
                }
            }
        }
    }

    pub fn rules(&self) -> &[AlertRule] {
        &self.rules
    }

    pub fn enabled(&self) -> impl Iterator<Item = &AlertRule> {
        self.rules.iter().filter(|r| r.enabled)
    }

    pub fn get(&self, name: &str) -> Option<&AlertRule> {
        self.rules.iter().find(|r| r.name == name)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
