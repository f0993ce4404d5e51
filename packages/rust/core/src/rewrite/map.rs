//! Prefix substitution rules compiled into a byte trie.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
use serde_json::Value;
use tracing::{info, warn};

use ldstore_shared::{LdStoreError, Result};

/// One `prefix → replacement` substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteRule {
    pub prefix: String,
    pub replacement: String,
}

impl RewriteRule {
    /// Maps its prefix onto itself.
    pub fn is_identity(&self) -> bool {
        self.prefix == self.replacement
    }
}

#[derive(Debug, Default)]
struct Node {
    children: BTreeMap<u8, usize>,
    rule: Option<usize>,
}

/// Immutable, longest-prefix-match set of rewrite rules.
#[derive(Debug)]
pub struct RewriteMap {
    rules: Vec<RewriteRule>,
    nodes: Vec<Node>,
}

impl RewriteMap {
    /// Compile rules in declaration order. A repeated prefix keeps its first
    /// replacement.
    pub fn from_rules<I, K, V>(rules: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut map = Self {
            rules: Vec::new(),
            nodes: vec![Node::default()],
        };
        for (prefix, replacement) in rules {
            map.insert(prefix.into(), replacement.into())?;
        }
        map.validate()?;
        Ok(map)
    }

    /// Parse a mapping document `{"old prefix": "replacement", ...}`.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let entries: Entries = serde_json::from_str(text)
            .map_err(|e| LdStoreError::mapping(format!("invalid mapping JSON: {e}")))?;

        let mut rules = Vec::with_capacity(entries.0.len());
        for (prefix, value) in entries.0 {
            match value {
                Value::String(replacement) => rules.push((prefix, replacement)),
                other => {
                    return Err(LdStoreError::mapping(format!(
                        "replacement for '{prefix}' must be a string, got {other}"
                    )));
                }
            }
        }
        Self::from_rules(rules)
    }

    /// Load and compile a mapping file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            LdStoreError::mapping(format!("cannot read {}: {e}", path.display()))
        })?;
        let map = Self::from_json_str(&text)?;
        info!(path = %path.display(), rules = map.len(), "loaded rewrite map");
        Ok(map)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[RewriteRule] {
        &self.rules
    }

    /// Longest rule whose prefix starts `s`.
    pub fn lookup(&self, s: &str) -> Option<&RewriteRule> {
        let mut node = 0;
        let mut best = self.nodes[0].rule;
        for byte in s.bytes() {
            match self.nodes[node].children.get(&byte) {
                Some(&next) => {
                    node = next;
                    if let Some(rule) = self.nodes[node].rule {
                        best = Some(rule);
                    }
                }
                None => break,
            }
        }
        best.map(|i| &self.rules[i])
    }

    /// Rewrite one string, or `None` when no rule matches.
    pub fn rewrite_str(&self, s: &str) -> Option<String> {
        let rule = self.lookup(s)?;
        // The prefix is a whole `str`, so its length is a char boundary in `s`.
        let rest = &s[rule.prefix.len()..];
        Some(format!("{}{rest}", rule.replacement))
    }

    /// Rewrite every string leaf of `value` in place; object keys are left
    /// alone. Returns the number of strings changed.
    pub fn rewrite_value(&self, value: &mut Value) -> usize {
        match value {
            Value::String(s) => match self.rewrite_str(s) {
                Some(new) if new != *s => {
                    *s = new;
                    1
                }
                _ => 0,
            },
            Value::Array(items) => items.iter_mut().map(|v| self.rewrite_value(v)).sum(),
            Value::Object(map) => map.values_mut().map(|v| self.rewrite_value(v)).sum(),
            _ => 0,
        }
    }

    fn insert(&mut self, prefix: String, replacement: String) -> Result<()> {
        if prefix.is_empty() {
            return Err(LdStoreError::mapping("rule prefixes must not be empty"));
        }

        let mut node = 0;
        for byte in prefix.bytes() {
            node = match self.nodes[node].children.get(&byte) {
                Some(&next) => next,
                None => {
                    self.nodes.push(Node::default());
                    let next = self.nodes.len() - 1;
                    self.nodes[node].children.insert(byte, next);
                    next
                }
            };
        }

        match self.nodes[node].rule {
            Some(first) => {
                warn!(
                    prefix = %prefix,
                    kept = %self.rules[first].replacement,
                    ignored = %replacement,
                    "duplicate rewrite prefix, keeping first declaration"
                );
            }
            None => {
                self.nodes[node].rule = Some(self.rules.len());
                self.rules.push(RewriteRule {
                    prefix,
                    replacement,
                });
            }
        }
        Ok(())
    }

    /// Reject rules whose output could be rewritten again by a second pass.
    ///
    /// Identity rules never change their input and need no check. For any
    /// other rule, a later lookup on `replacement + rest` may only land on no
    /// rule or on an identity rule, whatever `rest` is.
    fn validate(&self) -> Result<()> {
        for rule in self.rules.iter().filter(|r| !r.is_identity()) {
            if let Some(hit) = self.lookup(&rule.replacement).filter(|h| !h.is_identity()) {
                return Err(LdStoreError::mapping(format!(
                    "replacement '{}' of '{}' starts with rule prefix '{}'",
                    rule.replacement, rule.prefix, hit.prefix
                )));
            }
            if let Some(hit) = self.rewriting_rule_beyond(&rule.replacement) {
                return Err(LdStoreError::mapping(format!(
                    "replacement '{}' of '{}' is a prefix of rule '{}'",
                    rule.replacement, rule.prefix, hit.prefix
                )));
            }
        }
        Ok(())
    }

    /// A non-identity rule whose prefix is strictly longer than `s` and starts
    /// with it.
    fn rewriting_rule_beyond(&self, s: &str) -> Option<&RewriteRule> {
        let mut node = 0;
        for byte in s.bytes() {
            node = *self.nodes[node].children.get(&byte)?;
        }

        let mut stack: Vec<usize> = self.nodes[node].children.values().copied().collect();
        while let Some(next) = stack.pop() {
            let current = &self.nodes[next];
            if let Some(rule) = current.rule.map(|i| &self.rules[i]) {
                if !rule.is_identity() {
                    return Some(rule);
                }
            }
            stack.extend(current.children.values().copied());
        }
        None
    }
}

/// Object entries in document order, duplicates included.
struct Entries(Vec<(String, Value)>);

impl<'de> Deserialize<'de> for Entries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = Entries;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a JSON object of prefix to replacement")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Entries, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<String, Value>()? {
                    entries.push((key, value));
                }
                Ok(Entries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}
