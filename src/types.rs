use clap::ValueEnum;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Serialize, ValueEnum, PartialEq, Eq, Hash, Copy)]
pub enum Checksum {
    #[serde(rename = "CRC32")]
    Crc32,
    #[serde(rename = "MD5")]
    Md5,
    #[serde(rename = "SHA1")]
    Sha1,
    #[serde(rename = "SHA256")]
    Sha256,
}

impl Checksum {
    pub fn rank(&self) -> u8 {
        match self {
            Checksum::Crc32 => 0,
            Checksum::Md5 => 1,
            Checksum::Sha1 => 2,
            Checksum::Sha256 => 3,
        }
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Checksum::Crc32 => "crc",
            Checksum::Md5 => "md5",
            Checksum::Sha1 => "sha1",
            Checksum::Sha256 => "sha256",
        };
        f.write_str(label)
    }
}

/// Lowercase hex digests; a `None` slot means the value is unknown.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ChecksumSet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crc32: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl ChecksumSet {
    pub fn from_crc32(crc: u32) -> Self {
        ChecksumSet {
            crc32: Some(format!("{crc:08x}")),
            ..ChecksumSet::default()
        }
    }

    pub fn get(&self, kind: Checksum) -> Option<&str> {
        match kind {
            Checksum::Crc32 => self.crc32.as_deref(),
            Checksum::Md5 => self.md5.as_deref(),
            Checksum::Sha1 => self.sha1.as_deref(),
            Checksum::Sha256 => self.sha256.as_deref(),
        }
    }

    /// Stores `value` normalized to lowercase; empty strings clear the slot.
    pub fn set(&mut self, kind: Checksum, value: &str) {
        let value = value.trim();
        let normalized = (!value.is_empty()).then(|| value.to_ascii_lowercase());
        match kind {
            Checksum::Crc32 => self.crc32 = normalized,
            Checksum::Md5 => self.md5 = normalized,
            Checksum::Sha1 => self.sha1 = normalized,
            Checksum::Sha256 => self.sha256 = normalized,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.crc32.is_none() && self.md5.is_none() && self.sha1.is_none() && self.sha256.is_none()
    }

    /// Fill slots that are unknown here from `other`.
    pub fn merge_missing(&mut self, other: &ChecksumSet) {
        if self.crc32.is_none() {
            self.crc32 = other.crc32.clone();
        }
        if self.md5.is_none() {
            self.md5 = other.md5.clone();
        }
        if self.sha1.is_none() {
            self.sha1 = other.sha1.clone();
        }
        if self.sha256.is_none() {
            self.sha256 = other.sha256.clone();
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DumpStatus {
    #[default]
    Good,
    BadDump,
    NoDump,
}

impl DumpStatus {
    pub fn from_attr(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "baddump" => DumpStatus::BadDump,
            "nodump" => DumpStatus::NoDump,
            _ => DumpStatus::Good,
        }
    }
}

/// One file a game expects, as recorded in the catalog.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ExpectedFile {
    pub name: String,
    pub size: Option<u64>,
    pub checksums: ChecksumSet,
    /// Name of the same file in the parent; set when the file is inherited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge: Option<String>,
    pub status: DumpStatus,
}

impl ExpectedFile {
    pub fn new(name: impl Into<String>, size: Option<u64>, checksums: ChecksumSet) -> Self {
        ExpectedFile {
            name: name.into(),
            size,
            checksums,
            ..ExpectedFile::default()
        }
    }

    pub fn is_inherited(&self) -> bool {
        self.merge.is_some()
    }

    pub fn merged_name(&self) -> &str {
        self.merge.as_deref().unwrap_or(&self.name)
    }

    /// Bad or missing dumps are accepted without a verified copy.
    pub fn accepts_bad_dump(&self) -> bool {
        self.status != DumpStatus::Good
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Game {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grandparent: Option<String>,
    pub files: Vec<ExpectedFile>,
    pub disks: Vec<ExpectedFile>,
}

impl Game {
    pub fn new(name: impl Into<String>) -> Self {
        Game {
            name: name.into(),
            ..Game::default()
        }
    }

    pub fn is_ancestor(&self, name: &str) -> bool {
        self.parent.as_deref() == Some(name) || self.grandparent.as_deref() == Some(name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    OkBadDump,
    Fixable,
    Broken,
    NotFound,
    Superfluous,
    /// Own copy of a file the game inherits and its ancestor already holds.
    Duplicate,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Status::Ok => "correct",
            Status::OkBadDump => "correct, no good dump",
            Status::Fixable => "fixable",
            Status::Broken => "wrong checksum",
            Status::NotFound => "missing",
            Status::Superfluous => "unknown",
            Status::Duplicate => "duplicate",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Where {
    InGame,
    InParent,
    InGrandparent,
    Needed,
    Extra,
    Elsewhere,
}

impl fmt::Display for Where {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Where::InGame => "in game",
            Where::InParent => "in parent",
            Where::InGrandparent => "in grandparent",
            Where::Needed => "in needed pool",
            Where::Extra => "in extra pool",
            Where::Elsewhere => "in another game",
        };
        f.write_str(label)
    }
}

/// A file that was actually found somewhere.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ActualFile {
    pub name: String,
    pub size: u64,
    pub checksums: ChecksumSet,
    /// Entry index inside the container it was found in.
    pub index: usize,
    pub status: Status,
    pub found_in: Where,
}
