use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use serde::Serialize;
use walkdir::WalkDir;

use crate::checksum::{HashMatch, compare_files, compute_checksums};
use crate::config::Config;
use crate::container::{Container, EntryHeader, OpenFlags};
use crate::types::{Checksum, ChecksumSet, Where};

const MAX_UNIQUE_SUFFIX: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    /// Files some game in the catalog still needs.
    Needed,
    /// Files nothing needs, plus read-only search directories.
    Extra,
}

impl PoolKind {
    pub fn found_in(self) -> Where {
        match self {
            PoolKind::Needed => Where::Needed,
            PoolKind::Extra => Where::Extra,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolEntry {
    pub path: PathBuf,
    pub size: u64,
    pub checksums: ChecksumSet,
    /// Owned files are deleted when claimed; search-directory files are left alone.
    pub owned: bool,
}

/// A directory of loose files indexed by size and checksums.
#[derive(Debug, Clone)]
pub struct Pool {
    kind: PoolKind,
    dir: PathBuf,
    entries: Vec<PoolEntry>,
}

impl Pool {
    pub fn new(kind: PoolKind, dir: &Path) -> Self {
        Pool {
            kind,
            dir: dir.to_path_buf(),
            entries: Vec::new(),
        }
    }

    /// Indexes everything already stored under the pool directory.
    pub fn load(kind: PoolKind, dir: &Path, config: &Config) -> anyhow::Result<Self> {
        let mut pool = Pool::new(kind, dir);
        pool.scan(dir, true, config)?;
        Ok(pool)
    }

    /// Adds every regular file below `dir`; a missing directory adds nothing.
    pub fn scan(&mut self, dir: &Path, owned: bool, config: &Config) -> anyhow::Result<usize> {
        if !dir.exists() {
            return Ok(0);
        }
        let mut added = 0;
        for entry in WalkDir::new(dir).follow_links(true).sort_by_file_name() {
            let entry = entry.with_context(|| format!("scanning {dir:?}"))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path().to_path_buf();
            if self.contains(&path) {
                continue;
            }
            let (checksums, size) = compute_checksums(&path, config)?;
            vprintln!(config.verbose, 2, "{:?} pool: indexed {}", self.kind, path.display());
            self.entries.push(PoolEntry {
                path,
                size,
                checksums,
                owned,
            });
            added += 1;
        }
        Ok(added)
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entries(&self) -> &[PoolEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.iter().any(|entry| entry.path == path)
    }

    /// First file whose size agrees and which shares at least one matching checksum.
    pub fn find(
        &self,
        size: Option<u64>,
        checksums: &ChecksumSet,
        types: &[Checksum],
    ) -> Option<&PoolEntry> {
        self.entries.iter().find(|entry| {
            compare_files(Some(entry.size), &entry.checksums, size, checksums, types)
                == HashMatch::Match
        })
    }

    /// Stores `data` under a fresh name and indexes it.
    pub fn insert(
        &mut self,
        entry_name: &str,
        data: &[u8],
        checksums: ChecksumSet,
    ) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating pool directory: {:?}", self.dir))?;
        let path = self.file_name_for(entry_name, &checksums)?;
        fs::write(&path, data).with_context(|| format!("writing pool file: {path:?}"))?;
        self.entries.push(PoolEntry {
            path: path.clone(),
            size: data.len() as u64,
            checksums,
            owned: true,
        });
        Ok(path)
    }

    /// Free path for storing `entry_name` in this pool. Needed files are
    /// named after their CRC (or, for disk images, MD5 or SHA-1).
    pub fn file_name_for(
        &self,
        entry_name: &str,
        checksums: &ChecksumSet,
    ) -> anyhow::Result<PathBuf> {
        let base = Path::new(entry_name)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| entry_name.replace(['/', '\\'], "_"));
        let (stem, ext) = split_extension(&base);
        match self.kind {
            PoolKind::Needed => {
                let key = checksums
                    .crc32
                    .as_deref()
                    .or(checksums.md5.as_deref())
                    .or(checksums.sha1.as_deref())
                    .unwrap_or("nocrc");
                unique_path(&self.dir, key, ext)
            }
            PoolKind::Extra => {
                let plain = self.dir.join(&base);
                if plain.exists() {
                    unique_path(&self.dir, stem, ext)
                } else {
                    Ok(plain)
                }
            }
        }
    }

    /// Consumes a pool file: owned files are deleted, and the index entry
    /// goes away. Returns false if the file was no longer indexed.
    pub fn claim(&mut self, path: &Path) -> anyhow::Result<bool> {
        let Some(pos) = self.entries.iter().position(|entry| entry.path == path) else {
            return Ok(false);
        };
        let entry = self.entries.remove(pos);
        if entry.owned && entry.path.exists() {
            fs::remove_file(&entry.path)
                .with_context(|| format!("removing pool file: {:?}", entry.path))?;
        }
        Ok(true)
    }
}

pub(crate) fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    }
}

/// `<dir>/<stem>-NNN<ext>` for the first unused NNN.
pub(crate) fn unique_path(dir: &Path, stem: &str, ext: &str) -> anyhow::Result<PathBuf> {
    for n in 0..MAX_UNIQUE_SUFFIX {
        let candidate = dir.join(format!("{stem}-{n:03}{ext}"));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    bail!("no free name for {stem}{ext} in {dir:?}");
}

/// An entry of an archive in the rom directory that belongs to no game.
/// Such archives are read from but never changed.
#[derive(Debug, Clone, Serialize)]
pub struct ArchivedEntry {
    pub archive: PathBuf,
    pub index: usize,
    pub name: String,
    pub size: u64,
    pub checksums: ChecksumSet,
    #[serde(skip)]
    pub header: EntryHeader,
}

/// The needed and extra pools of one run, plus the entries of unknown
/// archives found in the rom directory.
#[derive(Debug, Clone)]
pub struct Pools {
    pub needed: Pool,
    pub extra: Pool,
    pub archived: Vec<ArchivedEntry>,
}

impl Pools {
    pub fn new(needed: Pool, extra: Pool) -> Self {
        Pools {
            needed,
            extra,
            archived: Vec::new(),
        }
    }

    pub fn load(config: &Config) -> anyhow::Result<Self> {
        let needed = Pool::load(PoolKind::Needed, &config.needed_dir, config)?;
        let mut extra = Pool::load(PoolKind::Extra, &config.extra_dir, config)?;
        for dir in &config.search_dirs {
            let added = extra.scan(dir, false, config)?;
            vprintln!(config.verbose, 1, "search directory {}: {added} files", dir.display());
        }
        Ok(Pools::new(needed, extra))
    }

    /// Indexes every readable entry of an archive no game owns.
    pub fn add_archive(&mut self, path: &Path, config: &Config) -> anyhow::Result<usize> {
        let container = Container::open(path, OpenFlags::default(), config)?;
        let mut added = 0;
        for (index, entry) in container.list() {
            let checksums = match container.checksums(index) {
                Ok(checksums) => checksums,
                Err(err) => {
                    vprintln!(config.verbose, 1, "{}: {}: {err:#}", path.display(), entry.name());
                    continue;
                }
            };
            self.archived.push(ArchivedEntry {
                archive: path.to_path_buf(),
                index,
                name: entry.name().to_string(),
                size: entry.size(),
                checksums,
                header: entry.header().clone(),
            });
            added += 1;
        }
        Ok(added)
    }

    /// First unknown-archive entry strictly matching the query.
    pub fn find_archived(
        &self,
        size: Option<u64>,
        checksums: &ChecksumSet,
        types: &[Checksum],
    ) -> Option<&ArchivedEntry> {
        self.archived.iter().find(|entry| {
            compare_files(Some(entry.size), &entry.checksums, size, checksums, types)
                == HashMatch::Match
        })
    }

    pub fn get(&self, kind: PoolKind) -> &Pool {
        match kind {
            PoolKind::Needed => &self.needed,
            PoolKind::Extra => &self.extra,
        }
    }

    pub fn get_mut(&mut self, kind: PoolKind) -> &mut Pool {
        match kind {
            PoolKind::Needed => &mut self.needed,
            PoolKind::Extra => &mut self.extra,
        }
    }
}
