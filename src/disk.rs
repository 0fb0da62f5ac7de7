use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use serde::Serialize;
use walkdir::WalkDir;

use crate::catalog::Catalog;
use crate::checksum::{HashMatch, compare_files, hash_stream};
use crate::config::Config;
use crate::fix::FixAction;
use crate::pool::{Pool, PoolKind};
use crate::types::{Checksum, ChecksumSet, ExpectedFile, Game, Status, Where};

const CHD_MAGIC: &[u8; 8] = b"MComprHD";
const CHD_HEADER_MAX: usize = 124;

/// Identifies a disk image. Implementations decide how much of the image they read.
pub trait DiskProbe {
    fn probe(&self, path: &Path) -> anyhow::Result<(Option<u64>, ChecksumSet)>;
}

/// Reads the digests CHD headers carry; anything that isn't a CHD is hashed whole.
#[derive(Debug, Clone)]
pub struct ChdProbe {
    pub hash_types: Vec<Checksum>,
}

impl DiskProbe for ChdProbe {
    fn probe(&self, path: &Path) -> anyhow::Result<(Option<u64>, ChecksumSet)> {
        #[cfg(feature = "libchd")]
        {
            if let Ok(sums) = libchd::header_checksums(path) {
                return Ok((None, sums));
            }
        }

        let mut file = File::open(path).with_context(|| format!("opening disk image: {path:?}"))?;
        let mut header = Vec::with_capacity(CHD_HEADER_MAX);
        (&mut file)
            .take(CHD_HEADER_MAX as u64)
            .read_to_end(&mut header)
            .with_context(|| format!("reading disk header: {path:?}"))?;
        if let Some(sums) = chd_header_checksums(&header) {
            return Ok((None, sums));
        }

        let file = File::open(path).with_context(|| format!("opening disk image: {path:?}"))?;
        let (sums, len) = hash_stream(file, &self.hash_types)
            .with_context(|| format!("hashing disk image: {path:?}"))?;
        Ok((Some(len), sums))
    }
}

// With the libchd feature, headers are read through the chd crate; the
// parser below stays as the fallback.
#[cfg(feature = "libchd")]
mod libchd {
    use std::fs::File;
    use std::io::BufReader;
    use std::path::Path;

    use anyhow::Context;

    use crate::types::ChecksumSet;

    pub fn header_checksums(path: &Path) -> anyhow::Result<ChecksumSet> {
        let file = File::open(path).with_context(|| format!("opening chd: {path:?}"))?;
        let mut reader = BufReader::new(file);
        let chd = chd::Chd::open(&mut reader, None)
            .with_context(|| format!("opening CHD via chd crate: {path:?}"))?;
        let header = chd.header();
        Ok(ChecksumSet {
            md5: header.md5().map(hex::encode),
            sha1: header.sha1().map(hex::encode),
            ..ChecksumSet::default()
        })
    }
}

/// Digests recorded in a CHD v3, v4 or v5 header.
fn chd_header_checksums(header: &[u8]) -> Option<ChecksumSet> {
    if header.len() < 16 || &header[..8] != CHD_MAGIC {
        return None;
    }
    let version = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);
    let field = |offset: usize, len: usize| header.get(offset..offset + len).map(hex::encode);
    let mut sums = ChecksumSet::default();
    match version {
        3 => {
            sums.md5 = field(44, 16);
            sums.sha1 = field(80, 20);
        }
        4 => sums.sha1 = field(48, 20),
        5 => sums.sha1 = field(84, 20),
        _ => return None,
    }
    Some(sums)
}

pub fn disk_path(rom_dir: &Path, game: &str, disk: &str) -> PathBuf {
    rom_dir.join(game).join(format!("{disk}.chd"))
}

fn is_image(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("chd"))
}

/// A disk image in the needed pool, the extra pool or a search directory.
#[derive(Debug, Clone, Serialize)]
pub struct StoredImage {
    pub path: PathBuf,
    pub kind: PoolKind,
    pub checksums: ChecksumSet,
    /// Owned images are moved into place; search-directory images are copied.
    pub owned: bool,
}

/// Disk images available outside the rom directory.
#[derive(Debug, Clone, Default)]
pub struct DiskStore {
    images: Vec<StoredImage>,
}

impl DiskStore {
    pub fn load(config: &Config, probe: &dyn DiskProbe) -> anyhow::Result<Self> {
        let mut store = DiskStore::default();
        store.scan(&config.needed_dir, PoolKind::Needed, true, probe)?;
        store.scan(&config.extra_dir, PoolKind::Extra, true, probe)?;
        for dir in &config.search_dirs {
            store.scan(dir, PoolKind::Extra, false, probe)?;
        }
        Ok(store)
    }

    /// Probes every `.chd` file below `dir`.
    pub fn scan(
        &mut self,
        dir: &Path,
        kind: PoolKind,
        owned: bool,
        probe: &dyn DiskProbe,
    ) -> anyhow::Result<usize> {
        if !dir.exists() {
            return Ok(0);
        }
        let mut added = 0;
        for entry in WalkDir::new(dir).follow_links(true).sort_by_file_name() {
            let entry = entry.with_context(|| format!("scanning {dir:?}"))?;
            if !entry.file_type().is_file() || !is_image(entry.path()) {
                continue;
            }
            let path = entry.path().to_path_buf();
            if self.images.iter().any(|image| image.path == path) {
                continue;
            }
            let (_, checksums) = probe.probe(&path)?;
            self.images.push(StoredImage {
                path,
                kind,
                checksums,
                owned,
            });
            added += 1;
        }
        Ok(added)
    }

    pub fn images(&self) -> &[StoredImage] {
        &self.images
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// An image strictly matching `disk`, needed images first.
    pub fn find(&self, disk: &ExpectedFile, types: &[Checksum]) -> Option<&StoredImage> {
        if disk.checksums.is_empty() {
            return None;
        }
        [PoolKind::Needed, PoolKind::Extra]
            .into_iter()
            .find_map(|kind| {
                self.images.iter().find(|image| {
                    image.kind == kind
                        && compare_files(None, &image.checksums, disk.size, &disk.checksums, types)
                            == HashMatch::Match
                })
            })
    }

    pub fn insert(&mut self, image: StoredImage) {
        self.images.push(image);
    }

    pub fn remove(&mut self, path: &Path) -> Option<StoredImage> {
        let pos = self.images.iter().position(|image| image.path == path)?;
        Some(self.images.remove(pos))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskMatch {
    pub expected: usize,
    pub name: String,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub found_in: Option<Where>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// The game's own directory holds an image under this name with other content.
    pub wrong_image: bool,
    /// Stored image that can take this disk's place.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
}

impl DiskMatch {
    pub fn needs_fix(&self) -> bool {
        self.status == Status::Fixable || (self.wrong_image && self.status == Status::Broken)
    }
}

/// Verifies each expected disk of `game` in place. Inherited disks may also
/// live in the parent's or grandparent's directory; other missing or wrong
/// disks are looked up in `store`.
pub fn check_disks(
    game: &Game,
    rom_dir: &Path,
    probe: &dyn DiskProbe,
    types: &[Checksum],
    store: &DiskStore,
) -> Vec<DiskMatch> {
    let mut matches = Vec::with_capacity(game.disks.len());
    for (expected, disk) in game.disks.iter().enumerate() {
        let mut places = vec![(Where::InGame, disk_path(rom_dir, &game.name, &disk.name))];
        if disk.is_inherited() {
            if let Some(parent) = &game.parent {
                places.push((Where::InParent, disk_path(rom_dir, parent, disk.merged_name())));
            }
            if let Some(grandparent) = &game.grandparent {
                places.push((
                    Where::InGrandparent,
                    disk_path(rom_dir, grandparent, disk.merged_name()),
                ));
            }
        }

        let mut result = DiskMatch {
            expected,
            name: disk.name.clone(),
            status: Status::NotFound,
            found_in: None,
            path: None,
            wrong_image: false,
            source: None,
        };
        for (found_in, path) in places {
            if !path.is_file() {
                continue;
            }
            let agrees = match probe.probe(&path) {
                Ok((size, sums)) => {
                    compare_files(size, &sums, disk.size, &disk.checksums, types).is_acceptable()
                }
                Err(_) => false,
            };
            if agrees {
                result.status = Status::Ok;
                result.found_in = Some(found_in);
                result.path = Some(path);
                break;
            }
            if found_in == Where::InGame {
                result.wrong_image = true;
            }
            if result.path.is_none() {
                result.status = Status::Broken;
                result.path = Some(path);
            }
        }
        if result.status != Status::Ok && !disk.is_inherited() {
            if let Some(image) = store.find(disk, types) {
                result.status = Status::Fixable;
                result.found_in = Some(image.kind.found_in());
                result.source = Some(image.path.clone());
            }
        }
        if matches!(result.status, Status::Broken | Status::NotFound) && disk.accepts_bad_dump() {
            result.status = Status::OkBadDump;
        }
        matches.push(result);
    }
    matches
}

/// Images in the game's own directory that no expected disk names.
pub fn stray_images(game: &Game, rom_dir: &Path) -> Vec<PathBuf> {
    let dir = rom_dir.join(&game.name);
    if !dir.is_dir() {
        return Vec::new();
    }
    WalkDir::new(&dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file() && is_image(entry.path()))
        .filter(|entry| {
            let stem = entry.path().file_stem().map(|stem| stem.to_string_lossy());
            !game
                .disks
                .iter()
                .any(|disk| stem.as_deref() == Some(disk.name.as_str()))
        })
        .map(|entry| entry.into_path())
        .collect()
}

/// Renames, or copies and removes when a rename crosses filesystems.
fn move_file(from: &Path, to: &Path) -> anyhow::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).with_context(|| format!("copying {from:?} to {to:?}"))?;
    fs::remove_file(from).with_context(|| format!("removing {from:?}"))?;
    Ok(())
}

/// Games other than `game` expecting this image whose own copy is missing.
fn games_lacking_image(
    game: &Game,
    checksums: &ChecksumSet,
    catalog: &dyn Catalog,
    probe: &dyn DiskProbe,
    config: &Config,
) -> anyhow::Result<Vec<String>> {
    let types = config.hash_types();
    let mut games: Vec<String> = Vec::new();
    for location in catalog.find_disk_locations(checksums)? {
        if location.inherited || location.game == game.name || games.contains(&location.game) {
            continue;
        }
        let Some(other) = catalog.find_game(&location.game)? else {
            continue;
        };
        let Some(slot) = other.disks.get(location.index) else {
            continue;
        };
        let path = disk_path(&config.rom_dir, &other.name, &slot.name);
        let held = path.is_file()
            && probe.probe(&path).is_ok_and(|(size, sums)| {
                compare_files(size, &sums, slot.size, &slot.checksums, &types).is_acceptable()
            });
        if !held {
            games.push(location.game);
        }
    }
    Ok(games)
}

/// Moves an image out of the rom directory: to the needed pool if another
/// game lacks it, to the extra pool otherwise. Returns the games to recheck.
fn save_image(
    game: &Game,
    path: &Path,
    store: &mut DiskStore,
    catalog: &dyn Catalog,
    probe: &dyn DiskProbe,
    config: &Config,
    actions: &mut Vec<FixAction>,
) -> anyhow::Result<Vec<String>> {
    let (_, checksums) = probe.probe(path)?;
    let wanting = games_lacking_image(game, &checksums, catalog, probe, config)?;
    let (kind, dir) = if wanting.is_empty() {
        (PoolKind::Extra, &config.extra_dir)
    } else {
        (PoolKind::Needed, &config.needed_dir)
    };
    fs::create_dir_all(dir).with_context(|| format!("creating pool directory: {dir:?}"))?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("image path without a file name: {path:?}"))?;
    let target = Pool::new(kind, dir).file_name_for(&name, &checksums)?;
    move_file(path, &target)?;
    actions.push(FixAction::Save {
        name,
        pool: kind,
        path: target.clone(),
    });
    store.insert(StoredImage {
        path: target,
        kind,
        checksums,
        owned: true,
    });
    Ok(wanting)
}

#[derive(Debug, Clone, Default)]
pub struct DiskFixOutcome {
    pub actions: Vec<FixAction>,
    pub failures: Vec<String>,
    /// Games waiting for an image just saved to the needed pool.
    pub rechecks: Vec<String>,
}

/// Puts wrong and stray images of `game` aside and moves (or copies from a
/// search directory) stored images into place.
pub fn fix_disks(
    game: &Game,
    disks: &[DiskMatch],
    strays: &[PathBuf],
    store: &mut DiskStore,
    catalog: &dyn Catalog,
    probe: &dyn DiskProbe,
    config: &Config,
) -> DiskFixOutcome {
    let mut outcome = DiskFixOutcome::default();
    let own_dir = config.rom_dir.join(&game.name);

    for disk in disks.iter().filter(|disk| disk.needs_fix()) {
        if disk.wrong_image {
            let wrong = disk_path(&config.rom_dir, &game.name, &disk.name);
            match save_image(game, &wrong, store, catalog, probe, config, &mut outcome.actions) {
                Ok(rechecks) => outcome.rechecks.extend(rechecks),
                Err(err) => {
                    outcome
                        .failures
                        .push(format!("{}: cannot move image aside: {err:#}", disk.name));
                    continue;
                }
            }
        }
        let Some(source) = &disk.source else {
            continue;
        };
        let target = disk_path(&config.rom_dir, &game.name, &disk.name);
        let placed = fs::create_dir_all(&own_dir)
            .with_context(|| format!("creating directory: {own_dir:?}"))
            .and_then(|()| {
                let owned = store
                    .images()
                    .iter()
                    .any(|image| image.path == *source && image.owned);
                if owned {
                    move_file(source, &target)?;
                    store.remove(source);
                } else {
                    fs::copy(source, &target)
                        .with_context(|| format!("copying {source:?} to {target:?}"))?;
                }
                Ok(())
            });
        match placed {
            Ok(()) => outcome.actions.push(FixAction::Add {
                name: disk.name.clone(),
                from: source.display().to_string(),
            }),
            Err(err) => outcome.failures.push(format!("{}: {err:#}", disk.name)),
        }
    }

    for stray in strays {
        match save_image(game, stray, store, catalog, probe, config, &mut outcome.actions) {
            Ok(rechecks) => outcome.rechecks.extend(rechecks),
            Err(err) => outcome
                .failures
                .push(format!("{}: cannot save image: {err:#}", stray.display())),
        }
    }

    for action in &outcome.actions {
        vprintln!(config.verbose, 1, "{}: {action}", game.name);
    }
    outcome
}
