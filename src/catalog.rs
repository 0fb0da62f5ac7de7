use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::Path;

use anyhow::{Context, anyhow, bail};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde::Serialize;

use crate::checksum::{HashMatch, compare_files};
use crate::types::{Checksum, ChecksumSet, DumpStatus, ExpectedFile, Game};

/// A catalog slot expecting some content: file `index` of `game`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileLocation {
    pub game: String,
    pub index: usize,
    /// The slot is satisfied through the game's parent or grandparent.
    pub inherited: bool,
}

/// Read-only view of the expected sets.
pub trait Catalog {
    /// Looks a game up by name, with `grandparent` resolved.
    fn find_game(&self, name: &str) -> anyhow::Result<Option<Game>>;

    /// Every good-dump slot whose size and checksums match the query.
    fn find_locations(
        &self,
        size: Option<u64>,
        checksums: &ChecksumSet,
    ) -> anyhow::Result<Vec<FileLocation>>;

    /// Every good-dump disk slot whose checksums match; `index` counts disks.
    fn find_disk_locations(&self, checksums: &ChecksumSet) -> anyhow::Result<Vec<FileLocation>>;

    fn list_games(&self) -> anyhow::Result<Vec<String>>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    games: BTreeMap<String, Game>,
    hash_types: Vec<Checksum>,
}

impl MemoryCatalog {
    pub fn new(hash_types: Vec<Checksum>) -> Self {
        MemoryCatalog {
            games: BTreeMap::new(),
            hash_types,
        }
    }

    pub fn insert(&mut self, game: Game) {
        self.games.insert(game.name.clone(), game);
    }

    pub fn len(&self) -> usize {
        self.games.len()
    }

    pub fn is_empty(&self) -> bool {
        self.games.is_empty()
    }

    pub fn load_datafiles(
        paths: &[impl AsRef<Path>],
        hash_types: Vec<Checksum>,
    ) -> anyhow::Result<Self> {
        let mut catalog = MemoryCatalog::new(hash_types);
        for path in paths {
            let path = path.as_ref();
            let mut reader = Reader::from_file(path)
                .with_context(|| format!("unable to open datafile: {}", path.to_string_lossy()))?;
            catalog
                .read_datafile(&mut reader)
                .with_context(|| format!("parsing datafile: {}", path.to_string_lossy()))?;
        }
        Ok(catalog)
    }

    /// Adds every game of a Logiqx XML datafile. Later definitions replace earlier ones.
    pub fn read_datafile<R: BufRead>(&mut self, reader: &mut Reader<R>) -> anyhow::Result<usize> {
        reader.config_mut().trim_text(true);
        let mut buf = Vec::new();
        let mut current: Option<Game> = None;
        let mut in_description = false;
        let mut added = 0usize;

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e))
                    if e.name().as_ref() == b"game" || e.name().as_ref() == b"machine" =>
                {
                    current = Some(game_from_attributes(e)?);
                }
                Ok(Event::Start(ref e)) if e.name().as_ref() == b"description" => {
                    in_description = true;
                }
                Ok(Event::Text(e)) if in_description => {
                    if let Some(game) = current.as_mut() {
                        game.description = Some(e.unescape().unwrap_or_default().to_string());
                    }
                    in_description = false;
                }
                Ok(Event::End(ref e)) if e.name().as_ref() == b"description" => {
                    in_description = false;
                }
                Ok(Event::Empty(ref e)) | Ok(Event::Start(ref e))
                    if e.name().as_ref() == b"rom" || e.name().as_ref() == b"disk" =>
                {
                    let is_disk = e.name().as_ref() == b"disk";
                    let file = file_from_attributes(e);
                    if let Some(game) = current.as_mut() {
                        if file.name.is_empty() {
                            bail!("unnamed rom or disk in game {}", game.name);
                        }
                        if is_disk {
                            game.disks.push(file);
                        } else {
                            game.files.push(file);
                        }
                    }
                }
                Ok(Event::End(ref e))
                    if e.name().as_ref() == b"game" || e.name().as_ref() == b"machine" =>
                {
                    if let Some(game) = current.take() {
                        self.insert(game);
                        added += 1;
                    }
                }
                Ok(Event::Eof) => break,
                Err(err) => bail!("xml error at byte {}: {err}", reader.buffer_position()),
                _ => {}
            }
            buf.clear();
        }

        Ok(added)
    }
}

fn game_from_attributes(e: &BytesStart<'_>) -> anyhow::Result<Game> {
    let mut game = Game::default();
    for attr in e.attributes().flatten() {
        let value = String::from_utf8_lossy(&attr.value).to_string();
        match attr.key.as_ref() {
            b"name" => game.name = value,
            b"cloneof" => game.parent = Some(value).filter(|v| !v.is_empty()),
            _ => {}
        }
    }
    if game.name.is_empty() {
        bail!("game without a name");
    }
    Ok(game)
}

fn file_from_attributes(e: &BytesStart<'_>) -> ExpectedFile {
    let mut file = ExpectedFile::default();
    for attr in e.attributes().flatten() {
        let value = String::from_utf8_lossy(&attr.value).to_string();
        match attr.key.as_ref() {
            b"name" => file.name = value,
            b"size" => file.size = value.trim().parse().ok(),
            b"crc" => file.checksums.set(Checksum::Crc32, &value),
            b"md5" => file.checksums.set(Checksum::Md5, &value),
            b"sha1" => file.checksums.set(Checksum::Sha1, &value),
            b"sha256" => file.checksums.set(Checksum::Sha256, &value),
            b"merge" => file.merge = Some(value).filter(|v| !v.is_empty()),
            b"status" => file.status = DumpStatus::from_attr(&value),
            _ => {}
        }
    }
    file
}

impl Catalog for MemoryCatalog {
    fn find_game(&self, name: &str) -> anyhow::Result<Option<Game>> {
        let Some(game) = self.games.get(name) else {
            return Ok(None);
        };
        let mut game = game.clone();
        if game.parent.as_deref() == Some(name) {
            return Err(anyhow!("game {name} names itself as its parent"));
        }
        if game.grandparent.is_none() {
            game.grandparent = game
                .parent
                .as_deref()
                .and_then(|parent| self.games.get(parent))
                .and_then(|parent| parent.parent.clone())
                .filter(|grandparent| grandparent != name);
        }
        Ok(Some(game))
    }

    fn find_locations(
        &self,
        size: Option<u64>,
        checksums: &ChecksumSet,
    ) -> anyhow::Result<Vec<FileLocation>> {
        let mut found = Vec::new();
        for game in self.games.values() {
            for (index, file) in game.files.iter().enumerate() {
                if file.status != DumpStatus::Good {
                    continue;
                }
                let outcome =
                    compare_files(file.size, &file.checksums, size, checksums, &self.hash_types);
                if outcome == HashMatch::Match {
                    found.push(FileLocation {
                        game: game.name.clone(),
                        index,
                        inherited: file.is_inherited(),
                    });
                }
            }
        }
        Ok(found)
    }

    fn find_disk_locations(&self, checksums: &ChecksumSet) -> anyhow::Result<Vec<FileLocation>> {
        let mut found = Vec::new();
        for game in self.games.values() {
            for (index, disk) in game.disks.iter().enumerate() {
                if disk.status != DumpStatus::Good {
                    continue;
                }
                let outcome =
                    compare_files(disk.size, &disk.checksums, None, checksums, &self.hash_types);
                if outcome == HashMatch::Match {
                    found.push(FileLocation {
                        game: game.name.clone(),
                        index,
                        inherited: disk.is_inherited(),
                    });
                }
            }
        }
        Ok(found)
    }

    fn list_games(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.games.keys().cloned().collect())
    }
}
