//! Version model types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Number of fingerprint characters used in display names.
const SHORT_FINGERPRINT_LEN: usize = 8;

/// What kind of artifact a dataset produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    /// A root source outside cabin (e.g. a versioned URL). Nothing is stored locally.
    External,
    /// A file under the downloads directory.
    File,
    /// A table in the data store.
    Table,
}

impl DatasetKind {
    /// Stable string form, as stored in the catalog.
    pub fn as_str(self) -> &'static str {
        match self {
            DatasetKind::External => "external",
            DatasetKind::File => "file",
            DatasetKind::Table => "table",
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "external" => Ok(DatasetKind::External),
            "file" => Ok(DatasetKind::File),
            "table" => Ok(DatasetKind::Table),
            other => Err(format!("unknown dataset kind: {}", other)),
        }
    }
}

/// SHA-256 fingerprint of a dataset formula, as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint arbitrary bytes.
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Wrap a hex string read back from storage.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Full hex form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form used in display names.
    pub fn short(&self) -> &str {
        self.0.get(..SHORT_FINGERPRINT_LEN).unwrap_or(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a version: the content address of a produced artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionKey {
    /// Dataset name.
    pub dataset: String,
    /// Root-source identifier (e.g. a source year).
    pub root: String,
    /// Formula fingerprint.
    pub fingerprint: Fingerprint,
}

impl VersionKey {
    pub fn new(dataset: impl Into<String>, root: impl Into<String>, fingerprint: Fingerprint) -> Self {
        Self {
            dataset: dataset.into(),
            root: root.into(),
            fingerprint,
        }
    }

    /// Human readable, unique name, e.g. `StormDetailsTable::2011::1a2b3c4d`.
    ///
    /// Used as the table name or file stem of the artifact.
    pub fn display_name(&self) -> String {
        format!(
            "{}::{}::{}",
            self.dataset,
            self.root,
            self.fingerprint.short()
        )
    }
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}

/// A catalog row: one immutable produced artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    /// Catalog-wide creation sequence number. Never reused.
    pub seq: u64,
    /// Identity triple.
    pub key: VersionKey,
    /// Artifact kind.
    pub kind: DatasetKind,
    /// The formula document the fingerprint was computed from.
    pub formula: String,
    /// Number of rows in the artifact (0 when not applicable).
    pub row_count: u64,
    /// Size of the artifact in bytes (0 when not applicable).
    pub byte_size: u64,
    /// Sequence numbers of the input versions consumed, in declaration order.
    pub inputs: Vec<u64>,
    /// When the version was recorded.
    pub created_at: DateTime<Utc>,
}

impl VersionRecord {
    /// See [`VersionKey::display_name`].
    pub fn display_name(&self) -> String {
        self.key.display_name()
    }
}

/// A version about to be recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVersion {
    pub key: VersionKey,
    pub kind: DatasetKind,
    pub formula: String,
    pub row_count: u64,
    pub byte_size: u64,
    pub inputs: Vec<u64>,
}

/// A user-supplied reference to a single version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionRef {
    /// By global sequence number.
    Seq(u64),
    /// By display name.
    Name(String),
}

impl VersionRef {
    /// Whether this reference designates `record`.
    pub fn matches(&self, record: &VersionRecord) -> bool {
        match self {
            VersionRef::Seq(seq) => record.seq == *seq,
            VersionRef::Name(name) => record.display_name() == *name,
        }
    }
}

impl FromStr for VersionRef {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.strip_prefix('#').unwrap_or(s).parse::<u64>() {
            Ok(seq) => VersionRef::Seq(seq),
            Err(_) => VersionRef::Name(s.to_string()),
        })
    }
}

impl fmt::Display for VersionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionRef::Seq(seq) => write!(f, "#{}", seq),
            VersionRef::Name(name) => f.write_str(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_hex_sha256() {
        let fp = Fingerprint::of(b"abc");
        assert_eq!(
            fp.as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(fp.short(), "ba7816bf");
    }

    #[test]
    fn test_display_name() {
        let key = VersionKey::new("StormDetailsTable", "2011", Fingerprint::of(b"formula"));
        let name = key.display_name();
        assert!(name.starts_with("StormDetailsTable::2011::"));
        assert_eq!(name.len(), "StormDetailsTable::2011::".len() + 8);
    }

    #[test]
    fn test_kind_roundtrip() {
        for kind in [DatasetKind::External, DatasetKind::File, DatasetKind::Table] {
            assert_eq!(kind.as_str().parse::<DatasetKind>(), Ok(kind));
        }
        assert!("view".parse::<DatasetKind>().is_err());
    }

    #[test]
    fn test_version_ref_parse() {
        assert_eq!("42".parse::<VersionRef>().unwrap(), VersionRef::Seq(42));
        assert_eq!("#42".parse::<VersionRef>().unwrap(), VersionRef::Seq(42));
        assert_eq!(
            "A::2011::deadbeef".parse::<VersionRef>().unwrap(),
            VersionRef::Name("A::2011::deadbeef".to_string())
        );
    }

    #[test]
    fn test_short_fingerprint_of_short_hex() {
        let fp = Fingerprint::from_hex("abc");
        assert_eq!(fp.short(), "abc");
    }

    #[test]
    fn test_short_fingerprint_of_corrupt_value() {
        // 'é' straddles the cut
        let fp = Fingerprint::from_hex("abcdefgé12");
        assert_eq!(fp.short(), "abcdefgé12");
    }
}
