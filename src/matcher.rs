use std::collections::HashMap;
use std::path::PathBuf;

use serde::Serialize;

use crate::catalog::Catalog;
use crate::checksum::HashMatch;
use crate::config::Config;
use crate::container::{Container, EntryHeader, OpenFlags, container_path};
use crate::disk::DiskMatch;
use crate::pool::{PoolKind, Pools};
use crate::types::{ActualFile, ExpectedFile, Game, Status, Where};

/// Where a missing file can be taken from.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Source {
    /// An entry of the game's own container; renamed in place when `rename`
    /// is set, copied otherwise.
    Own { index: usize, rename: bool },
    /// An entry of another game's container.
    Container {
        game: String,
        path: PathBuf,
        index: usize,
        found_in: Where,
        #[serde(skip)]
        header: EntryHeader,
    },
    Pool { kind: PoolKind, path: PathBuf },
}

impl Source {
    pub fn found_in(&self) -> Where {
        match self {
            Source::Own { .. } => Where::InGame,
            Source::Container { found_in, .. } => *found_in,
            Source::Pool { kind, .. } => kind.found_in(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Source::Own { index, .. } => format!("entry #{index}"),
            Source::Container { game, path, .. } => format!("{game} ({})", path.display()),
            Source::Pool { path, .. } => path.display().to_string(),
        }
    }
}

/// Classification of one expected file.
#[derive(Debug, Clone, Serialize)]
pub struct FileMatch {
    pub expected: usize,
    pub name: String,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub found_in: Option<Where>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    /// Own entry carrying the expected name but other content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wrong_entry: Option<usize>,
}

impl FileMatch {
    fn new(expected: usize, file: &ExpectedFile) -> Self {
        FileMatch {
            expected,
            name: file.name.clone(),
            status: Status::NotFound,
            found_in: None,
            source: None,
            wrong_entry: None,
        }
    }

    fn found(&mut self, status: Status, source: Source) {
        self.status = status;
        self.found_in = Some(source.found_in());
        self.source = Some(source);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    pub game: String,
    pub files: Vec<FileMatch>,
    /// Live entries of the game's own container.
    pub entries: Vec<ActualFile>,
    pub disks: Vec<DiskMatch>,
    /// Images in the game's directory that no expected disk names.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stray_disks: Vec<PathBuf>,
}

impl MatchResult {
    pub fn needs_fix(&self) -> bool {
        self.files.iter().any(|file| file.status == Status::Fixable)
            || self
                .entries
                .iter()
                .any(|entry| matches!(entry.status, Status::Superfluous | Status::Duplicate))
    }

    pub fn disks_need_fix(&self) -> bool {
        self.disks.iter().any(DiskMatch::needs_fix) || !self.stray_disks.is_empty()
    }
}

/// Containers a game may draw from: its own and its ancestors'.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lineage<'a> {
    pub own: Option<&'a Container>,
    pub parent: Option<&'a Container>,
    pub grandparent: Option<&'a Container>,
}

/// Entry of `container` holding `expected`: the preferred name first, then
/// any entry sharing a checksum.
fn find_in(
    container: &Container,
    preferred_name: &str,
    expected: &ExpectedFile,
    skip: impl Fn(usize) -> bool,
) -> anyhow::Result<Option<usize>> {
    if let Some(idx) = container.find_name(preferred_name) {
        if !skip(idx) && container.matches(idx, expected.size, &expected.checksums)? {
            return Ok(Some(idx));
        }
    }
    if expected.checksums.is_empty() {
        return Ok(None);
    }
    let candidates: Vec<usize> = container.list().map(|(idx, _)| idx).collect();
    for idx in candidates {
        if skip(idx) {
            continue;
        }
        if container.compare(idx, expected.size, &expected.checksums)? == HashMatch::Match {
            return Ok(Some(idx));
        }
    }
    Ok(None)
}

fn container_source(
    game: &str,
    container: &Container,
    index: usize,
    found_in: Where,
) -> anyhow::Result<Source> {
    Ok(Source::Container {
        game: game.to_string(),
        path: container.path().to_path_buf(),
        index,
        found_in,
        header: container.entry(index)?.header().clone(),
    })
}

struct Matcher<'a> {
    game: &'a Game,
    lineage: Lineage<'a>,
    pools: &'a Pools,
    catalog: &'a dyn Catalog,
    config: &'a Config,
    /// Status each claimed own entry ends up with.
    claims: HashMap<usize, Status>,
    opened: HashMap<String, Option<Container>>,
}

impl<'a> Matcher<'a> {
    fn ancestor(&self, found_in: Where) -> Option<(&'a str, &'a Container)> {
        let (name, container) = match found_in {
            Where::InParent => (self.game.parent.as_deref(), self.lineage.parent),
            Where::InGrandparent => (self.game.grandparent.as_deref(), self.lineage.grandparent),
            _ => (None, None),
        };
        Some((name?, container?))
    }

    fn inherited(&self, file: &ExpectedFile) -> anyhow::Result<Option<Source>> {
        for found_in in [Where::InParent, Where::InGrandparent] {
            let Some((name, container)) = self.ancestor(found_in) else {
                continue;
            };
            if let Some(idx) = find_in(container, file.merged_name(), file, |_| false)? {
                return Ok(Some(container_source(name, container, idx, found_in)?));
            }
        }
        Ok(None)
    }

    /// Unclaimed own entry holding `file`, under its name or another.
    fn own_copy(&self, file: &ExpectedFile) -> anyhow::Result<Option<usize>> {
        let Some(own) = self.lineage.own else {
            return Ok(None);
        };
        let claims = &self.claims;
        find_in(own, &file.name, file, |idx| claims.contains_key(&idx))
    }

    fn own_name_is(&self, idx: usize, name: &str) -> bool {
        self.lineage
            .own
            .and_then(|own| own.entry(idx).ok())
            .is_some_and(|entry| entry.name() == name)
    }

    fn own_by_hash(&mut self, file: &ExpectedFile) -> anyhow::Result<Option<Source>> {
        let Some(own) = self.lineage.own else {
            return Ok(None);
        };
        if file.checksums.is_empty() {
            return Ok(None);
        }
        let claims = &self.claims;
        if let Some(idx) = find_in(own, &file.name, file, |idx| claims.contains_key(&idx))? {
            self.claims.insert(idx, Status::Fixable);
            return Ok(Some(Source::Own {
                index: idx,
                rename: true,
            }));
        }
        // content already claimed under another name: copy it
        if let Some(idx) = find_in(own, &file.name, file, |_| false)? {
            return Ok(Some(Source::Own {
                index: idx,
                rename: false,
            }));
        }
        Ok(None)
    }

    fn pooled(&self, file: &ExpectedFile) -> Option<Source> {
        if file.checksums.is_empty() {
            return None;
        }
        let types = self.config.hash_types();
        [PoolKind::Needed, PoolKind::Extra].into_iter().find_map(|kind| {
            self.pools
                .get(kind)
                .find(file.size, &file.checksums, &types)
                .map(|entry| Source::Pool {
                    kind,
                    path: entry.path.clone(),
                })
        })
    }

    /// Entries of archives in the rom directory that no game owns.
    fn archived(&self, file: &ExpectedFile) -> Option<Source> {
        if file.checksums.is_empty() {
            return None;
        }
        let types = self.config.hash_types();
        self.pools
            .find_archived(file.size, &file.checksums, &types)
            .map(|entry| Source::Container {
                game: entry
                    .archive
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                path: entry.archive.clone(),
                index: entry.index,
                found_in: Where::Extra,
                header: entry.header.clone(),
            })
    }

    fn elsewhere(&mut self, file: &ExpectedFile) -> anyhow::Result<Option<Source>> {
        if !self.config.relocate || file.checksums.is_empty() {
            return Ok(None);
        }
        for location in self.catalog.find_locations(file.size, &file.checksums)? {
            if location.inherited || location.game == self.game.name {
                continue;
            }
            let Some(other) = self.catalog.find_game(&location.game)? else {
                continue;
            };
            let Some(slot) = other.files.get(location.index) else {
                continue;
            };

            let ancestor = [Where::InParent, Where::InGrandparent]
                .into_iter()
                .find_map(|found_in| {
                    self.ancestor(found_in)
                        .filter(|(name, _)| *name == location.game)
                        .map(|(_, container)| (container, found_in))
                });
            let (container, found_in) = match ancestor {
                Some(found) => found,
                None => {
                    if !self.opened.contains_key(&location.game) {
                        let path = container_path(&self.config.rom_dir, &location.game);
                        let opened = if path.is_file() {
                            Container::open(&path, OpenFlags::default(), self.config).ok()
                        } else {
                            None
                        };
                        self.opened.insert(location.game.clone(), opened);
                    }
                    match self.opened.get(&location.game) {
                        Some(Some(container)) => (container, Where::Elsewhere),
                        _ => continue,
                    }
                }
            };
            if let Some(idx) = find_in(container, &slot.name, file, |_| false)? {
                return Ok(Some(container_source(&location.game, container, idx, found_in)?));
            }
        }
        Ok(None)
    }
}

/// Classifies every expected file and every own-container entry of `game`.
pub fn match_game(
    game: &Game,
    lineage: Lineage<'_>,
    pools: &Pools,
    catalog: &dyn Catalog,
    config: &Config,
) -> anyhow::Result<MatchResult> {
    let mut matcher = Matcher {
        game,
        lineage,
        pools,
        catalog,
        config,
        claims: HashMap::new(),
        opened: HashMap::new(),
    };
    let mut files: Vec<FileMatch> = game
        .files
        .iter()
        .enumerate()
        .map(|(i, file)| FileMatch::new(i, file))
        .collect();

    // Entries already carrying the right name and content.
    if let Some(own) = lineage.own {
        for (file, result) in game.files.iter().zip(files.iter_mut()) {
            let Some(idx) = own.find_name(&file.name) else {
                continue;
            };
            if own.matches(idx, file.size, &file.checksums)? {
                if file.is_inherited() {
                    // settled against the ancestors below
                    continue;
                }
                result.status = Status::Ok;
                result.found_in = Some(Where::InGame);
                matcher.claims.insert(idx, Status::Ok);
            } else {
                result.wrong_entry = Some(idx);
            }
        }
    }

    for (file, result) in game.files.iter().zip(files.iter_mut()) {
        if result.status == Status::Ok {
            continue;
        }

        if file.is_inherited() {
            let own_copy = matcher.own_copy(file)?;
            match matcher.inherited(file)? {
                Some(source) => {
                    result.found(Status::Ok, source);
                    if let Some(idx) = own_copy {
                        matcher.claims.insert(idx, Status::Duplicate);
                    }
                }
                None => match own_copy.filter(|idx| matcher.own_name_is(*idx, &file.name)) {
                    Some(idx) => {
                        result.status = Status::Ok;
                        result.found_in = Some(Where::InGame);
                        matcher.claims.insert(idx, Status::Ok);
                    }
                    None if file.accepts_bad_dump() => result.status = Status::OkBadDump,
                    None => result.status = Status::NotFound,
                },
            }
        } else {
            let source = match matcher.own_by_hash(file)? {
                Some(source) => Some(source),
                None => match matcher.pooled(file).or_else(|| matcher.archived(file)) {
                    Some(source) => Some(source),
                    None => matcher.elsewhere(file)?,
                },
            };
            match source {
                Some(source) => result.found(Status::Fixable, source),
                None => {
                    let status = if file.accepts_bad_dump() {
                        Status::OkBadDump
                    } else if result.wrong_entry.is_some() {
                        Status::Broken
                    } else {
                        Status::NotFound
                    };
                    result.status = status;
                    if let Some(idx) = result.wrong_entry {
                        matcher.claims.entry(idx).or_insert(status);
                    }
                }
            }
        }

        vprintln!(
            config.verbose,
            2,
            "{}: {} {}{}",
            game.name,
            result.name,
            result.status,
            result
                .found_in
                .map(|found_in| format!(" ({found_in})"))
                .unwrap_or_default()
        );
    }

    let mut entries = Vec::new();
    if let Some(own) = lineage.own {
        for (idx, entry) in own.list() {
            let status = match matcher.claims.get(&idx) {
                Some(status) => *status,
                None if entry.is_broken() => Status::Broken,
                None => Status::Superfluous,
            };
            let checksums = own
                .checksums(idx)
                .unwrap_or_else(|_| entry.toc_checksums());
            entries.push(ActualFile {
                name: entry.name().to_string(),
                size: entry.size(),
                checksums,
                index: idx,
                status,
                found_in: Where::InGame,
            });
        }
    }

    Ok(MatchResult {
        game: game.name.clone(),
        files,
        entries,
        disks: Vec::new(),
        stray_disks: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::checksum::compute_checksums_from_bytes;
    use crate::container::DataSource;
    use crate::pool::Pool;
    use crate::types::{Checksum, ChecksumSet, DumpStatus};
    use std::path::Path;
    use tempfile::{TempDir, tempdir};

    fn expected(name: &str, data: &[u8]) -> ExpectedFile {
        ExpectedFile::new(
            name,
            Some(data.len() as u64),
            ChecksumSet::from_crc32(crc32fast::hash(data)),
        )
    }

    fn container(path: &Path, files: &[(&str, &[u8])], config: &Config) -> Container {
        let flags = OpenFlags {
            create: true,
            ..OpenFlags::default()
        };
        let mut container = Container::open(path, flags, config).unwrap();
        for (name, data) in files {
            container
                .add(name, DataSource::Bytes(data.to_vec()))
                .unwrap();
        }
        container.commit().unwrap();
        container
    }

    fn setup() -> (TempDir, Config, Pools) {
        let dir = tempdir().unwrap();
        let config = Config {
            rom_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let pools = Pools::new(
            Pool::new(PoolKind::Needed, &dir.path().join("needed")),
            Pool::new(PoolKind::Extra, &dir.path().join("extra")),
        );
        (dir, config, pools)
    }

    fn catalog(games: &[&Game]) -> MemoryCatalog {
        let mut catalog = MemoryCatalog::new(vec![Checksum::Crc32, Checksum::Sha1]);
        for game in games {
            catalog.insert((*game).clone());
        }
        catalog
    }

    fn statuses(result: &MatchResult) -> Vec<Status> {
        result.files.iter().map(|file| file.status).collect()
    }

    #[test]
    fn misnamed_entry_is_fixable_by_rename() {
        let (dir, config, pools) = setup();
        let mut game = Game::new("pacman");
        game.files = vec![expected("pacman.6e", b"6e data"), expected("pacman.6f", b"6f data")];
        let own = container(
            &dir.path().join("pacman.zip"),
            &[("6e.bin", b"6e data"), ("pacman.6f", b"6f data"), ("junk", b"junk")],
            &config,
        );

        let lineage = Lineage {
            own: Some(&own),
            ..Lineage::default()
        };
        let result = match_game(&game, lineage, &pools, &catalog(&[&game]), &config).unwrap();
        assert_eq!(statuses(&result), vec![Status::Fixable, Status::Ok]);
        assert!(matches!(
            result.files[0].source,
            Some(Source::Own { index: 0, rename: true })
        ));
        let entry_statuses: Vec<Status> = result.entries.iter().map(|e| e.status).collect();
        assert_eq!(
            entry_statuses,
            vec![Status::Fixable, Status::Ok, Status::Superfluous]
        );
        assert!(result.needs_fix());
    }

    #[test]
    fn inherited_file_is_found_in_parent() {
        let (dir, config, pools) = setup();
        let mut parent = Game::new("pacman");
        parent.files = vec![expected("pacman.6e", b"6e data")];
        let mut clone = Game::new("mspacmna");
        clone.parent = Some("pacman".into());
        let mut inherited = expected("pacman.6e", b"6e data");
        inherited.merge = Some("pacman.6e".into());
        clone.files = vec![inherited, expected("boot1", b"boot")];

        let parent_zip = container(&dir.path().join("pacman.zip"), &[("x", b"6e data")], &config);
        let own = container(&dir.path().join("mspacmna.zip"), &[("boot1", b"boot")], &config);
        let lineage = Lineage {
            own: Some(&own),
            parent: Some(&parent_zip),
            grandparent: None,
        };
        let result =
            match_game(&clone, lineage, &pools, &catalog(&[&parent, &clone]), &config).unwrap();
        assert_eq!(statuses(&result), vec![Status::Ok, Status::Ok]);
        assert_eq!(result.files[0].found_in, Some(Where::InParent));
        assert!(!result.needs_fix());

        // without the parent's container the inherited file is missing
        let lineage = Lineage {
            own: Some(&own),
            ..Lineage::default()
        };
        let result =
            match_game(&clone, lineage, &pools, &catalog(&[&parent, &clone]), &config).unwrap();
        assert_eq!(result.files[0].status, Status::NotFound);
    }

    #[test]
    fn own_copy_of_inherited_file() {
        let (dir, config, pools) = setup();
        let mut parent = Game::new("pacman");
        parent.files = vec![expected("pacman.6e", b"6e data")];
        let mut clone = Game::new("mspacmna");
        clone.parent = Some("pacman".into());
        let mut inherited = expected("pacman.6e", b"6e data");
        inherited.merge = Some("pacman.6e".into());
        clone.files = vec![inherited];
        let catalog = catalog(&[&parent, &clone]);

        let own = container(&dir.path().join("mspacmna.zip"), &[("pacman.6e", b"6e data")], &config);
        let parent_zip = container(&dir.path().join("pacman.zip"), &[("pacman.6e", b"6e data")], &config);

        // the parent holds it too: the clone's copy is a duplicate
        let lineage = Lineage {
            own: Some(&own),
            parent: Some(&parent_zip),
            grandparent: None,
        };
        let result = match_game(&clone, lineage, &pools, &catalog, &config).unwrap();
        assert_eq!(result.files[0].status, Status::Ok);
        assert_eq!(result.files[0].found_in, Some(Where::InParent));
        assert_eq!(result.entries[0].status, Status::Duplicate);
        assert!(result.needs_fix());

        // no parent container: the clone's own copy counts
        let lineage = Lineage {
            own: Some(&own),
            ..Lineage::default()
        };
        let result = match_game(&clone, lineage, &pools, &catalog, &config).unwrap();
        assert_eq!(result.files[0].status, Status::Ok);
        assert_eq!(result.files[0].found_in, Some(Where::InGame));
        assert_eq!(result.entries[0].status, Status::Ok);
        assert!(!result.needs_fix());
    }

    #[test]
    fn sources_serialize_with_their_kind() {
        let pool = Source::Pool {
            kind: PoolKind::Needed,
            path: PathBuf::from("needed/0badf00d-000.bin"),
        };
        let value = serde_json::to_value(&pool).unwrap();
        assert_eq!(value["source"], "pool");
        assert_eq!(value["kind"], "needed");
        assert_eq!(value["path"], "needed/0badf00d-000.bin");

        let own = serde_json::to_value(Source::Own {
            index: 2,
            rename: true,
        })
        .unwrap();
        assert_eq!(own["source"], "own");
        assert_eq!(own["index"], 2);
    }

    #[test]
    fn bad_dumps_and_wrong_checksums() {
        let (dir, config, pools) = setup();
        let mut game = Game::new("game");
        let mut bad = expected("bad", b"bad dump");
        bad.status = DumpStatus::BadDump;
        game.files = vec![bad, expected("wrong", b"right data"), expected("gone", b"gone")];
        let own = container(&dir.path().join("game.zip"), &[("wrong", b"other data")], &config);

        let lineage = Lineage {
            own: Some(&own),
            ..Lineage::default()
        };
        let result = match_game(&game, lineage, &pools, &catalog(&[&game]), &config).unwrap();
        assert_eq!(
            statuses(&result),
            vec![Status::OkBadDump, Status::Broken, Status::NotFound]
        );
        assert_eq!(result.entries[0].status, Status::Broken);
        assert!(!result.needs_fix());
    }

    #[test]
    fn duplicate_content_is_copied_within_container() {
        let (dir, config, pools) = setup();
        let mut game = Game::new("game");
        game.files = vec![expected("a", b"same"), expected("b", b"same")];
        let own = container(&dir.path().join("game.zip"), &[("a", b"same")], &config);

        let lineage = Lineage {
            own: Some(&own),
            ..Lineage::default()
        };
        let result = match_game(&game, lineage, &pools, &catalog(&[&game]), &config).unwrap();
        assert_eq!(statuses(&result), vec![Status::Ok, Status::Fixable]);
        assert!(matches!(
            result.files[1].source,
            Some(Source::Own { index: 0, rename: false })
        ));
    }

    #[test]
    fn pools_are_searched_needed_first() {
        let (_dir, config, mut pools) = setup();
        let mut game = Game::new("game");
        game.files = vec![expected("a", b"pooled")];
        let sums = compute_checksums_from_bytes(b"pooled", &config).unwrap();
        pools.extra.insert("a", b"pooled", sums.clone()).unwrap();
        let needed = pools.needed.insert("a", b"pooled", sums).unwrap();

        let result =
            match_game(&game, Lineage::default(), &pools, &catalog(&[&game]), &config).unwrap();
        assert_eq!(result.files[0].status, Status::Fixable);
        assert_eq!(result.files[0].found_in, Some(Where::Needed));
        assert!(matches!(
            &result.files[0].source,
            Some(Source::Pool { path, .. }) if *path == needed
        ));
    }

    #[test]
    fn unknown_archives_are_searched_after_the_pools() {
        let (dir, config, mut pools) = setup();
        let mut game = Game::new("game");
        game.files = vec![expected("a", b"loose"), expected("b", b"pooled")];
        let stuff = dir.path().join("stuff.zip");
        container(&stuff, &[("x.bin", b"loose"), ("y.bin", b"pooled")], &config);
        pools.add_archive(&stuff, &config).unwrap();
        let sums = compute_checksums_from_bytes(b"pooled", &config).unwrap();
        pools.extra.insert("b", b"pooled", sums).unwrap();

        let result =
            match_game(&game, Lineage::default(), &pools, &catalog(&[&game]), &config).unwrap();
        assert_eq!(statuses(&result), vec![Status::Fixable, Status::Fixable]);
        assert!(matches!(
            &result.files[0].source,
            Some(Source::Container { game, path, index: 0, .. }) if game == "stuff" && *path == stuff
        ));
        assert!(matches!(&result.files[1].source, Some(Source::Pool { .. })));
    }

    #[test]
    fn relocation_only_when_enabled() {
        let (dir, mut config, pools) = setup();
        let mut game = Game::new("galaga");
        game.files = vec![expected("galaga.1", b"cpu")];
        let mut other = Game::new("galagab");
        other.files = vec![expected("gg.1", b"cpu")];
        container(&dir.path().join("galagab.zip"), &[("gg.1", b"cpu")], &config);
        let catalog = catalog(&[&game, &other]);

        let result = match_game(&game, Lineage::default(), &pools, &catalog, &config).unwrap();
        assert_eq!(result.files[0].status, Status::NotFound);

        config.relocate = true;
        let result = match_game(&game, Lineage::default(), &pools, &catalog, &config).unwrap();
        assert_eq!(result.files[0].status, Status::Fixable);
        assert_eq!(result.files[0].found_in, Some(Where::Elsewhere));
    }
}
