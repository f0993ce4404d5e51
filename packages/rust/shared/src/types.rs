//! Core domain types for the document store.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LdStoreError, Result};

// ---------------------------------------------------------------------------
// Kind
// ---------------------------------------------------------------------------

/// Closed set of resource kinds the store accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Kind {
    Acquisition,
    Activity,
    Destruction,
    Event,
    Group,
    HumanMadeObject,
    Journal,
    LinguisticObject,
    Organization,
    Person,
    Phase,
    Place,
    Procurement,
    Series,
    Set,
    VisualItem,
}

impl Kind {
    /// Every kind, in declaration order.
    pub const ALL: [Kind; 16] = [
        Kind::Acquisition,
        Kind::Activity,
        Kind::Destruction,
        Kind::Event,
        Kind::Group,
        Kind::HumanMadeObject,
        Kind::Journal,
        Kind::LinguisticObject,
        Kind::Organization,
        Kind::Person,
        Kind::Phase,
        Kind::Place,
        Kind::Procurement,
        Kind::Series,
        Kind::Set,
        Kind::VisualItem,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Acquisition => "Acquisition",
            Kind::Activity => "Activity",
            Kind::Destruction => "Destruction",
            Kind::Event => "Event",
            Kind::Group => "Group",
            Kind::HumanMadeObject => "HumanMadeObject",
            Kind::Journal => "Journal",
            Kind::LinguisticObject => "LinguisticObject",
            Kind::Organization => "Organization",
            Kind::Person => "Person",
            Kind::Phase => "Phase",
            Kind::Place => "Place",
            Kind::Procurement => "Procurement",
            Kind::Series => "Series",
            Kind::Set => "Set",
            Kind::VisualItem => "VisualItem",
        }
    }

    /// Default on-disk directory: the resource-model UUID of the kind.
    pub fn default_dir(self) -> &'static str {
        match self {
            Kind::Acquisition => "b5fdce59-2e41-11e9-b1c2-a4d18cec433a",
            Kind::Activity => "24c45975-3955-11e9-80f0-a4d18cec433a",
            Kind::Destruction => "39ca28c0-643c-4b66-abb4-74b901a7d8fc",
            Kind::Event => "a93a8a1b-383e-41d2-ac8b-2f18a85b3759",
            Kind::Group => "00000000-0000-0000-0000-000000000000",
            Kind::HumanMadeObject => "2486c17d-2e42-11e9-bd33-a4d18cec433a",
            Kind::Journal => "f6c52114-aca7-4e2b-a51a-5d61e4c7181c",
            Kind::LinguisticObject => "41a41e47-2e42-11e9-b5ee-a4d18cec433a",
            Kind::Organization => "edbee5e8-2e41-11e9-bc39-a4d18cec433a",
            Kind::Person => "0b47366e-2e42-11e9-9018-a4d18cec433a",
            Kind::Phase => "17871ac7-2e42-11e9-87b2-a4d18cec433a",
            Kind::Place => "846cdf96-f0f5-4310-8415-018452032175",
            Kind::Procurement => "08ad7e74-da48-4720-9e3f-ad5577d0d57c",
            Kind::Series => "d537c62e-720a-467f-ac88-9f0b53b14dd8",
            Kind::Set => "76510a15-d517-4ef6-9b57-2b87d4540250",
            Kind::VisualItem => "504dcf0a-2e42-11e9-b4e2-a4d18cec433a",
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Kind {
    type Err = LdStoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Kind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| LdStoreError::UnknownKind { kind: s.to_string() })
    }
}

// ---------------------------------------------------------------------------
// KindTable
// ---------------------------------------------------------------------------

/// Lookup table from kind to its directory under the output root.
///
/// Built once per run and validated eagerly: unknown kind names, unsafe
/// directory names and two kinds sharing a directory are all rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindTable {
    dirs: BTreeMap<Kind, String>,
}

impl KindTable {
    /// Build the table from defaults plus `overrides` (kind name → directory).
    pub fn new(overrides: &BTreeMap<String, String>) -> Result<Self> {
        let mut dirs: BTreeMap<Kind, String> = Kind::ALL
            .into_iter()
            .map(|k| (k, k.default_dir().to_string()))
            .collect();

        for (name, dir) in overrides {
            let kind: Kind = name.parse()?;
            validate_dir_name(dir)?;
            dirs.insert(kind, dir.clone());
        }

        let mut seen = HashSet::new();
        for (kind, dir) in &dirs {
            if !seen.insert(dir.as_str()) {
                return Err(LdStoreError::config(format!(
                    "kind {kind} shares directory '{dir}' with another kind"
                )));
            }
        }

        Ok(Self { dirs })
    }

    /// Resolve a kind name coming from the pipeline.
    pub fn resolve(&self, name: &str) -> Result<Kind> {
        name.parse()
    }

    /// Directory name for `kind`.
    pub fn dir(&self, kind: Kind) -> &str {
        // Every kind is inserted by `new`.
        self.dirs
            .get(&kind)
            .map(String::as_str)
            .unwrap_or_else(|| kind.default_dir())
    }

    /// All `(kind, directory)` pairs in kind order.
    pub fn iter(&self) -> impl Iterator<Item = (Kind, &str)> {
        self.dirs.iter().map(|(k, d)| (*k, d.as_str()))
    }
}

impl Default for KindTable {
    fn default() -> Self {
        Self {
            dirs: Kind::ALL
                .into_iter()
                .map(|k| (k, k.default_dir().to_string()))
                .collect(),
        }
    }
}

fn validate_dir_name(dir: &str) -> Result<()> {
    if dir.is_empty()
        || dir.starts_with('.')
        || dir.contains('/')
        || dir.contains('\\')
        || dir.contains('\0')
    {
        return Err(LdStoreError::config(format!(
            "invalid kind directory name '{dir}'"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// StorageKey
// ---------------------------------------------------------------------------

/// Stable key of one stored document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorageKey {
    pub kind: Kind,
    pub id: String,
}

impl StorageKey {
    /// Build a key, rejecting empty identifiers.
    pub fn new(kind: Kind, id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(LdStoreError::malformed(format!(
                "empty identifier for kind {kind}"
            )));
        }
        Ok(Self { kind, id })
    }
}

impl std::fmt::Display for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

// ---------------------------------------------------------------------------
// Format
// ---------------------------------------------------------------------------

/// On-disk JSON serialization style.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Compact,
    Pretty,
}

impl Format {
    /// Serialize a document body. Object keys come out sorted in both styles.
    pub fn render(self, value: &Value) -> Result<String> {
        let rendered = match self {
            Format::Compact => serde_json::to_string(value),
            Format::Pretty => serde_json::to_string_pretty(value),
        };
        rendered.map_err(|e| LdStoreError::validation(format!("JSON serialization failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_roundtrip() {
        for kind in Kind::ALL {
            let parsed: Kind = kind.as_str().parse().expect("parse kind");
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn unknown_kind_fails() {
        let err = "Spaceship".parse::<Kind>().unwrap_err();
        assert!(matches!(err, LdStoreError::UnknownKind { .. }));
    }

    #[test]
    fn kind_table_defaults() {
        let table = KindTable::new(&BTreeMap::new()).expect("default table");
        assert_eq!(table.dir(Kind::Person), "0b47366e-2e42-11e9-9018-a4d18cec433a");
        assert_eq!(table.iter().count(), Kind::ALL.len());
    }

    #[test]
    fn kind_table_overrides() {
        let mut overrides = BTreeMap::new();
        overrides.insert("Person".to_string(), "people".to_string());
        let table = KindTable::new(&overrides).expect("table");
        assert_eq!(table.dir(Kind::Person), "people");
        assert_eq!(table.dir(Kind::Place), Kind::Place.default_dir());
    }

    #[test]
    fn kind_table_rejects_unknown_kind() {
        let mut overrides = BTreeMap::new();
        overrides.insert("Spaceship".to_string(), "ships".to_string());
        assert!(matches!(
            KindTable::new(&overrides),
            Err(LdStoreError::UnknownKind { .. })
        ));
    }

    #[test]
    fn kind_table_rejects_shared_and_unsafe_dirs() {
        let mut overrides = BTreeMap::new();
        overrides.insert("Person".to_string(), "agents".to_string());
        overrides.insert("Group".to_string(), "agents".to_string());
        assert!(KindTable::new(&overrides).is_err());

        let mut overrides = BTreeMap::new();
        overrides.insert("Person".to_string(), "../escape".to_string());
        assert!(KindTable::new(&overrides).is_err());
    }

    #[test]
    fn storage_key_rejects_empty_id() {
        assert!(StorageKey::new(Kind::Person, "").is_err());
        let key = StorageKey::new(Kind::Person, "abc-1").expect("key");
        assert_eq!(key.to_string(), "Person/abc-1");
    }

    #[test]
    fn format_render_styles() {
        let value = json!({"b": 1, "a": [true, null]});
        let compact = Format::Compact.render(&value).expect("compact");
        assert_eq!(compact, r#"{"a":[true,null],"b":1}"#);

        let pretty = Format::Pretty.render(&value).expect("pretty");
        assert!(pretty.contains("\n  \"a\": ["));
        let reparsed: Value = serde_json::from_str(&pretty).expect("reparse");
        assert_eq!(reparsed, value);
    }
}
