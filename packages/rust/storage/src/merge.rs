//! Combining two JSON-LD bodies stored under the same key.
//!
//! Rules, applied recursively:
//! - objects merge key-wise, keys unique to one side pass through;
//! - arrays under a reference-list key become a set keyed by element
//!   identity (`id`/`@id`, else the whole value), same-id elements merge,
//!   and the set is kept sorted by identity;
//! - other arrays take the multiset union: incoming elements are appended
//!   unless an equal element is already present (counting multiplicity);
//! - anything else that differs is a conflict, the incoming value wins.
//!
//! Every body is normalized before it is stored, which makes
//! `merge(d, d) == d` hold for stored documents.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};

use serde_json::Value;

/// A scalar (or shape) disagreement resolved in favour of the incoming value.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeConflict {
    /// JSON-pointer-like location of the value.
    pub path: String,
    /// Value that was stored before.
    pub previous: Value,
    /// Value that replaced it.
    pub incoming: Value,
}

/// Merge rules, parameterized by the set of reference-list property names.
#[derive(Debug, Clone, Default)]
pub struct MergePolicy {
    reference_list_keys: HashSet<String>,
}

impl MergePolicy {
    pub fn new<I, S>(reference_list_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            reference_list_keys: reference_list_keys.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_reference_list(&self, key: &str) -> bool {
        self.reference_list_keys.contains(key)
    }

    /// Bring a body into canonical form: reference lists deduplicated and sorted.
    pub fn normalize(&self, value: &mut Value) {
        let mut sink = Vec::new();
        self.normalize_at(value, None, &mut String::new(), &mut sink);
    }

    /// Merge `incoming` into `existing`, returning the result and any conflicts.
    pub fn merge(&self, mut existing: Value, mut incoming: Value) -> (Value, Vec<MergeConflict>) {
        let mut conflicts = Vec::new();
        let mut path = String::new();
        self.normalize_at(&mut existing, None, &mut path, &mut conflicts);
        self.normalize_at(&mut incoming, None, &mut path, &mut conflicts);
        self.merge_at(&mut existing, incoming, None, &mut path, &mut conflicts);
        (existing, conflicts)
    }

    fn merge_at(
        &self,
        existing: &mut Value,
        incoming: Value,
        key: Option<&str>,
        path: &mut String,
        conflicts: &mut Vec<MergeConflict>,
    ) {
        match (existing, incoming) {
            (Value::Object(current), Value::Object(new)) => {
                for (k, v) in new {
                    match current.get_mut(&k) {
                        Some(slot) => {
                            let len = path.len();
                            push_segment(path, &k);
                            self.merge_at(slot, v, Some(k.as_str()), path, conflicts);
                            path.truncate(len);
                        }
                        None => {
                            current.insert(k, v);
                        }
                    }
                }
            }
            (Value::Array(current), Value::Array(new)) => {
                if key.is_some_and(|k| self.is_reference_list(k)) {
                    current.extend(new);
                    self.collapse_reference_list(current, path, conflicts);
                } else {
                    append_missing(current, new);
                }
            }
            (slot, new) => {
                if *slot != new {
                    let previous = std::mem::replace(slot, new.clone());
                    conflicts.push(MergeConflict {
                        path: if path.is_empty() { "/".into() } else { path.clone() },
                        previous,
                        incoming: new,
                    });
                }
            }
        }
    }

    fn normalize_at(
        &self,
        value: &mut Value,
        key: Option<&str>,
        path: &mut String,
        conflicts: &mut Vec<MergeConflict>,
    ) {
        match value {
            Value::Object(map) => {
                for (k, child) in map.iter_mut() {
                    let len = path.len();
                    push_segment(path, k);
                    self.normalize_at(child, Some(k.as_str()), path, conflicts);
                    path.truncate(len);
                }
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    self.normalize_at(item, None, path, conflicts);
                }
                if key.is_some_and(|k| self.is_reference_list(k)) {
                    self.collapse_reference_list(items, path, conflicts);
                }
            }
            _ => {}
        }
    }

    /// Deduplicate by identity, merging same-id entries, ordered by identity.
    fn collapse_reference_list(
        &self,
        items: &mut Vec<Value>,
        path: &mut String,
        conflicts: &mut Vec<MergeConflict>,
    ) {
        let mut by_identity: BTreeMap<String, Value> = BTreeMap::new();
        for item in items.drain(..) {
            match by_identity.entry(identity(&item)) {
                Entry::Vacant(slot) => {
                    slot.insert(item);
                }
                Entry::Occupied(mut slot) => {
                    let len = path.len();
                    push_segment(path, slot.key());
                    self.merge_at(slot.get_mut(), item, None, path, conflicts);
                    path.truncate(len);
                }
            }
        }
        items.extend(by_identity.into_values());
    }
}

/// Identity of a reference-list element.
fn identity(value: &Value) -> String {
    let id = value
        .get("id")
        .or_else(|| value.get("@id"))
        .and_then(Value::as_str);
    match id {
        Some(id) => format!("id:{id}"),
        None => format!("value:{value}"),
    }
}

/// Append elements of `new` that have no unmatched equal element in `current`.
fn append_missing(current: &mut Vec<Value>, new: Vec<Value>) {
    let mut matched = vec![false; current.len()];
    for item in new {
        let hit = current
            .iter()
            .zip(matched.iter_mut())
            .find(|(existing, used)| !**used && **existing == item);
        match hit {
            Some((_, used)) => *used = true,
            None => current.push(item),
        }
    }
}

fn push_segment(path: &mut String, segment: &str) {
    path.push('/');
    path.push_str(&segment.replace('~', "~0").replace('/', "~1"));
}
