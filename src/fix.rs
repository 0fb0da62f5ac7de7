use std::fmt;
use std::path::PathBuf;

use anyhow::bail;
use serde::Serialize;

use crate::catalog::Catalog;
use crate::checksum::{HashMatch, compute_checksums_from_bytes};
use crate::config::Config;
use crate::container::{Container, DataSource, OpenFlags, container_path};
use crate::matcher::{MatchResult, Source};
use crate::pool::{PoolKind, Pools};
use crate::types::{ActualFile, ChecksumSet, Game, Status};

/// Attempts at finding a free name for an entry moved out of the way.
const MOVE_ASIDE_ATTEMPTS: u32 = 10;

/// One change made (or staged) while fixing a game.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FixAction {
    Rename { from: String, to: String },
    /// An entry occupying a wanted name was given a temporary one.
    MoveAside { from: String, to: String },
    Add { name: String, from: String },
    Save { name: String, pool: PoolKind, path: PathBuf },
    Delete { name: String },
}

impl fmt::Display for FixAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixAction::Rename { from, to } => write!(f, "rename {from} to {to}"),
            FixAction::MoveAside { from, to } => write!(f, "move {from} aside to {to}"),
            FixAction::Add { name, from } => write!(f, "add {name} from {from}"),
            FixAction::Save { name, pool, path } => {
                write!(f, "save {name} to {pool:?} pool as {}", path.display())
            }
            FixAction::Delete { name } => write!(f, "delete {name}"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FixOutcome {
    pub actions: Vec<FixAction>,
    pub failures: Vec<String>,
    /// The container was rewritten.
    pub committed: bool,
    /// Games inheriting a file this fix added.
    pub rechecks: Vec<String>,
    /// Content now waiting in the needed pool.
    pub needed: Vec<(Option<u64>, ChecksumSet)>,
}

impl FixOutcome {
    pub fn failed(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Gives the entry occupying `name` a free temporary name.
fn move_aside(
    container: &mut Container,
    name: &str,
    actions: &mut Vec<FixAction>,
) -> anyhow::Result<()> {
    let Some(occupant) = container.find_name(name) else {
        return Ok(());
    };
    for n in 0..MOVE_ASIDE_ATTEMPTS {
        let candidate = format!("{name}_renamed_by_romcheck_{n}");
        if container.find_name(&candidate).is_none() {
            container.rename(occupant, &candidate)?;
            actions.push(FixAction::MoveAside {
                from: name.to_string(),
                to: candidate,
            });
            return Ok(());
        }
    }
    bail!("no free name to move {name} out of the way");
}

/// Whether another game expects this content in its own container and its
/// container does not hold it yet.
fn wanted_elsewhere(
    game: &Game,
    size: u64,
    checksums: &ChecksumSet,
    catalog: &dyn Catalog,
    config: &Config,
) -> anyhow::Result<bool> {
    for location in catalog.find_locations(Some(size), checksums)? {
        if location.inherited || location.game == game.name {
            continue;
        }
        let Some(other) = catalog.find_game(&location.game)? else {
            continue;
        };
        let Some(slot) = other.files.get(location.index) else {
            continue;
        };
        let path = container_path(&config.rom_dir, &location.game);
        let container = match Container::open(&path, OpenFlags::default(), config) {
            Ok(container) => container,
            Err(_) => return Ok(true),
        };
        let mut held = false;
        for (idx, _) in container.list() {
            if container.compare(idx, slot.size, &slot.checksums)? == HashMatch::Match {
                held = true;
                break;
            }
        }
        if !held {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Copies a superfluous entry into a pool. Content another game still
/// lacks goes to the needed pool, everything else to the extra pool.
fn save_entry(
    game: &Game,
    container: &Container,
    entry: &ActualFile,
    pools: &mut Pools,
    catalog: &dyn Catalog,
    config: &Config,
) -> anyhow::Result<(PoolKind, PathBuf, ChecksumSet)> {
    let data = container.read(entry.index)?;
    let checksums = compute_checksums_from_bytes(&data, config)?;
    let kind = if wanted_elsewhere(game, data.len() as u64, &checksums, catalog, config)? {
        PoolKind::Needed
    } else {
        PoolKind::Extra
    };
    let path = pools
        .get_mut(kind)
        .insert(&entry.name, &data, checksums.clone())?;
    Ok((kind, path, checksums))
}

/// Stages the change bringing one fixable file into the container. Returns
/// the pool file it consumes, if any.
fn stage_file(
    container: &mut Container,
    name: &str,
    source: &Source,
    actions: &mut Vec<FixAction>,
) -> anyhow::Result<Option<(PoolKind, PathBuf)>> {
    match source {
        Source::Own {
            index,
            rename: true,
        } => {
            let from = container.entry(*index)?.name().to_string();
            if from != name {
                move_aside(container, name, actions)?;
            }
            container.rename(*index, name)?;
            actions.push(FixAction::Rename {
                from,
                to: name.to_string(),
            });
            Ok(None)
        }
        Source::Own {
            index,
            rename: false,
        } => {
            let header = container.entry(*index)?.header().clone();
            let archive = container.path().to_path_buf();
            move_aside(container, name, actions)?;
            container.add(name, DataSource::Entry { archive, header })?;
            actions.push(FixAction::Add {
                name: name.to_string(),
                from: source.describe(),
            });
            Ok(None)
        }
        Source::Container { path, header, .. } => {
            move_aside(container, name, actions)?;
            container.add(
                name,
                DataSource::Entry {
                    archive: path.clone(),
                    header: header.clone(),
                },
            )?;
            actions.push(FixAction::Add {
                name: name.to_string(),
                from: source.describe(),
            });
            Ok(None)
        }
        Source::Pool { kind, path } => {
            move_aside(container, name, actions)?;
            container.add(name, DataSource::File(path.clone()))?;
            actions.push(FixAction::Add {
                name: name.to_string(),
                from: source.describe(),
            });
            Ok(Some((*kind, path.clone())))
        }
    }
}

/// Applies `result` to `container` and the pools, committing once at the
/// end. A failed commit rolls everything back, including pool files saved
/// on the way.
pub fn fix_game(
    game: &Game,
    container: &mut Container,
    result: &MatchResult,
    pools: &mut Pools,
    catalog: &dyn Catalog,
    config: &Config,
) -> anyhow::Result<FixOutcome> {
    let mut outcome = FixOutcome::default();
    let rechecks = inheriting_games(game, result, catalog)?;
    let mut saved: Vec<(PoolKind, PathBuf)> = Vec::new();
    let mut consumed: Vec<(PoolKind, PathBuf)> = Vec::new();

    for entry in result
        .entries
        .iter()
        .filter(|entry| entry.status == Status::Duplicate)
    {
        container.delete(entry.index)?;
        outcome.actions.push(FixAction::Delete {
            name: entry.name.clone(),
        });
    }

    for entry in result
        .entries
        .iter()
        .filter(|entry| entry.status == Status::Superfluous)
    {
        if config.delete_superfluous {
            container.delete(entry.index)?;
            outcome.actions.push(FixAction::Delete {
                name: entry.name.clone(),
            });
            continue;
        }
        match save_entry(game, container, entry, pools, catalog, config) {
            Ok((kind, path, checksums)) => {
                container.delete(entry.index)?;
                outcome.actions.push(FixAction::Save {
                    name: entry.name.clone(),
                    pool: kind,
                    path: path.clone(),
                });
                if kind == PoolKind::Needed {
                    outcome.needed.push((Some(entry.size), checksums));
                }
                saved.push((kind, path));
            }
            Err(err) => outcome
                .failures
                .push(format!("{}: cannot save: {err:#}", entry.name)),
        }
    }

    // Renames first, so entries are not copied under names about to be freed.
    let fixable: Vec<_> = result
        .files
        .iter()
        .filter(|file| file.status == Status::Fixable)
        .filter_map(|file| file.source.as_ref().map(|source| (file, source)))
        .collect();
    let (renames, copies): (Vec<_>, Vec<_>) = fixable.into_iter().partition(|(_, source)| {
        matches!(source, Source::Own { rename: true, .. })
    });
    for (file, source) in renames.into_iter().chain(copies) {
        match stage_file(container, &file.name, source, &mut outcome.actions) {
            Ok(Some(pooled)) => consumed.push(pooled),
            Ok(None) => {}
            Err(err) => outcome
                .failures
                .push(format!("{}: {err:#}", file.name)),
        }
    }

    for action in &outcome.actions {
        vprintln!(config.verbose, 1, "{}: {action}", game.name);
    }

    if !container.has_changes() {
        return Ok(outcome);
    }
    match container.commit() {
        Ok(committed) => {
            outcome.committed = committed;
            for (kind, path) in consumed {
                if let Err(err) = pools.get_mut(kind).claim(&path) {
                    outcome.failures.push(format!("{err:#}"));
                }
            }
            outcome.rechecks = rechecks;
        }
        Err(err) => {
            container.rollback();
            for (kind, path) in saved {
                if let Err(err) = pools.get_mut(kind).claim(&path) {
                    outcome.failures.push(format!("{err:#}"));
                }
            }
            outcome.needed.clear();
            outcome
                .failures
                .push(format!("commit failed: {err:#}"));
        }
    }
    Ok(outcome)
}

/// Descendants of `game` that inherit one of the files just added.
fn inheriting_games(
    game: &Game,
    result: &MatchResult,
    catalog: &dyn Catalog,
) -> anyhow::Result<Vec<String>> {
    let mut games = Vec::new();
    for file in result.files.iter().filter(|file| file.status == Status::Fixable) {
        let Some(expected) = game.files.get(file.expected) else {
            continue;
        };
        if expected.checksums.is_empty() {
            continue;
        }
        for location in catalog.find_locations(expected.size, &expected.checksums)? {
            if !location.inherited || location.game == game.name || games.contains(&location.game)
            {
                continue;
            }
            let Some(other) = catalog.find_game(&location.game)? else {
                continue;
            };
            if other.is_ancestor(&game.name) {
                games.push(location.game);
            }
        }
    }
    Ok(games)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FileLocation, MemoryCatalog};
    use crate::matcher::{Lineage, match_game};
    use crate::pool::Pool;
    use crate::types::{Checksum, ExpectedFile};
    use std::fs;
    use std::path::Path;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        dir: TempDir,
        config: Config,
        pools: Pools,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let config = Config {
            rom_dir: dir.path().join("roms"),
            needed_dir: dir.path().join("needed"),
            extra_dir: dir.path().join("unknown"),
            fix: true,
            ..Config::default()
        };
        let pools = Pools::new(
            Pool::new(PoolKind::Needed, &config.needed_dir),
            Pool::new(PoolKind::Extra, &config.extra_dir),
        );
        Fixture { dir, config, pools }
    }

    fn expected(name: &str, data: &[u8]) -> ExpectedFile {
        ExpectedFile::new(
            name,
            Some(data.len() as u64),
            ChecksumSet::from_crc32(crc32fast::hash(data)),
        )
    }

    fn write_container(path: &Path, files: &[(&str, &[u8])], config: &Config) -> Container {
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

    fn names(container: &Container) -> Vec<String> {
        let mut names: Vec<String> = container
            .list()
            .map(|(_, entry)| entry.name().to_string())
            .collect();
        names.sort();
        names
    }

    fn catalog_with(games: Vec<Game>) -> MemoryCatalog {
        let mut catalog = MemoryCatalog::new(vec![Checksum::Crc32, Checksum::Sha1]);
        for game in games {
            catalog.insert(game);
        }
        catalog
    }

    #[test]
    fn swapped_names_are_exchanged() {
        let mut fx = fixture();
        let mut game = Game::new("swap");
        game.files = vec![expected("a", b"content a"), expected("b", b"content b")];
        let catalog = catalog_with(vec![game.clone()]);
        let path = fx.config.rom_dir.join("swap.zip");
        let mut container = write_container(
            &path,
            &[("a", b"content b"), ("b", b"content a")],
            &fx.config,
        );

        let lineage = Lineage {
            own: Some(&container),
            ..Lineage::default()
        };
        let result = match_game(&game, lineage, &fx.pools, &catalog, &fx.config).unwrap();
        assert!(result.files.iter().all(|f| f.status == Status::Fixable));

        let outcome = fix_game(
            &game,
            &mut container,
            &result,
            &mut fx.pools,
            &catalog,
            &fx.config,
        )
        .unwrap();
        assert!(!outcome.failed(), "{:?}", outcome.failures);
        assert!(outcome.committed);
        assert_eq!(names(&container), vec!["a", "b"]);
        let a = container.find_name("a").unwrap();
        assert_eq!(container.read(a).unwrap(), b"content a");
    }

    #[test]
    fn superfluous_entry_goes_to_needed_pool_when_another_game_wants_it() {
        let mut fx = fixture();
        let mut pacman = Game::new("pacman");
        pacman.files = vec![expected("pacman.6e", b"pacman rom")];
        let mut galaga = Game::new("galaga");
        galaga.files = vec![expected("galaga.1", b"galaga rom")];
        let catalog = catalog_with(vec![pacman.clone(), galaga.clone()]);

        let path = fx.config.rom_dir.join("pacman.zip");
        let mut container = write_container(
            &path,
            &[
                ("pacman.6e", b"pacman rom"),
                ("stray.bin", b"galaga rom"),
                ("readme.txt", b"hello"),
            ],
            &fx.config,
        );
        let lineage = Lineage {
            own: Some(&container),
            ..Lineage::default()
        };
        let result = match_game(&pacman, lineage, &fx.pools, &catalog, &fx.config).unwrap();
        let outcome = fix_game(
            &pacman,
            &mut container,
            &result,
            &mut fx.pools,
            &catalog,
            &fx.config,
        )
        .unwrap();

        assert!(outcome.committed);
        assert_eq!(names(&container), vec!["pacman.6e"]);
        assert_eq!(fx.pools.needed.len(), 1);
        assert_eq!(fx.pools.extra.len(), 1);
        assert_eq!(outcome.needed.len(), 1);
        assert!(fx.config.extra_dir.join("readme.txt").exists());
    }

    #[test]
    fn pool_copy_claims_the_pool_file() {
        let mut fx = fixture();
        let mut game = Game::new("pacman");
        game.files = vec![expected("pacman.6e", b"pacman rom")];
        let catalog = catalog_with(vec![game.clone()]);
        let sums = compute_checksums_from_bytes(b"pacman rom", &fx.config).unwrap();
        let pooled = fx
            .pools
            .needed
            .insert("x.bin", b"pacman rom", sums)
            .unwrap();

        let path = fx.config.rom_dir.join("pacman.zip");
        let flags = OpenFlags {
            create: true,
            ..OpenFlags::default()
        };
        let mut container = Container::open(&path, flags, &fx.config).unwrap();
        let lineage = Lineage {
            own: Some(&container),
            ..Lineage::default()
        };
        let result = match_game(&game, lineage, &fx.pools, &catalog, &fx.config).unwrap();
        let outcome = fix_game(
            &game,
            &mut container,
            &result,
            &mut fx.pools,
            &catalog,
            &fx.config,
        )
        .unwrap();

        assert!(outcome.committed);
        assert!(!pooled.exists());
        assert!(fx.pools.needed.is_empty());
        let idx = container.find_name("pacman.6e").unwrap();
        assert_eq!(container.read(idx).unwrap(), b"pacman rom");
    }

    #[test]
    fn failed_commit_leaves_container_and_pools_untouched() {
        let mut fx = fixture();
        let mut game = Game::new("pacman");
        game.files = vec![expected("pacman.6e", b"pacman rom")];
        let catalog = catalog_with(vec![game.clone()]);
        let path = fx.config.rom_dir.join("pacman.zip");
        let mut container = write_container(
            &path,
            &[("6e.bin", b"pacman rom"), ("junk", b"junk")],
            &fx.config,
        );
        let before = fs::read(&path).unwrap();

        let lineage = Lineage {
            own: Some(&container),
            ..Lineage::default()
        };
        let result = match_game(&game, lineage, &fx.pools, &catalog, &fx.config).unwrap();
        container.set_write_budget(Some(10));
        let outcome = fix_game(
            &game,
            &mut container,
            &result,
            &mut fx.pools,
            &catalog,
            &fx.config,
        )
        .unwrap();

        assert!(outcome.failed());
        assert!(!outcome.committed);
        assert!(!container.has_changes());
        assert_eq!(fs::read(&path).unwrap(), before);
        assert!(fx.pools.extra.is_empty());
        assert!(!fx.config.extra_dir.join("junk").exists());
        assert!(fx.dir.path().join("roms").read_dir().unwrap().count() == 1);
    }

    #[test]
    fn clone_copy_of_inherited_file_is_deleted_as_duplicate() {
        let mut fx = fixture();
        let mut pacman = Game::new("pacman");
        pacman.files = vec![expected("pacman.6e", b"pacman rom")];
        let mut clone = Game::new("mspacmna");
        clone.parent = Some("pacman".into());
        let mut inherited = expected("pacman.6e", b"pacman rom");
        inherited.merge = Some("pacman.6e".into());
        clone.files = vec![inherited, expected("boot1", b"boot rom")];
        let catalog = catalog_with(vec![pacman.clone(), clone.clone()]);

        let parent = write_container(
            &fx.config.rom_dir.join("pacman.zip"),
            &[("pacman.6e", b"pacman rom")],
            &fx.config,
        );
        let mut container = write_container(
            &fx.config.rom_dir.join("mspacmna.zip"),
            &[("pacman.6e", b"pacman rom"), ("boot1", b"boot rom")],
            &fx.config,
        );
        let lineage = Lineage {
            own: Some(&container),
            parent: Some(&parent),
            grandparent: None,
        };
        let result = match_game(&clone, lineage, &fx.pools, &catalog, &fx.config).unwrap();
        assert_eq!(result.files[0].status, Status::Ok);
        assert_eq!(result.entries[0].status, Status::Duplicate);
        assert!(result.needs_fix());

        let outcome = fix_game(
            &clone,
            &mut container,
            &result,
            &mut fx.pools,
            &catalog,
            &fx.config,
        )
        .unwrap();
        assert!(outcome.committed);
        assert_eq!(
            outcome.actions,
            vec![FixAction::Delete {
                name: "pacman.6e".into()
            }]
        );
        assert_eq!(names(&container), vec!["boot1"]);
        assert!(fx.pools.needed.is_empty());
        assert!(fx.pools.extra.is_empty());
    }

    #[test]
    fn content_its_game_already_holds_goes_to_extra_pool() {
        let mut fx = fixture();
        let mut pacman = Game::new("pacman");
        pacman.files = vec![expected("pacman.6e", b"pacman rom")];
        let mut galaga = Game::new("galaga");
        galaga.files = vec![expected("galaga.1", b"galaga rom")];
        let catalog = catalog_with(vec![pacman.clone(), galaga.clone()]);

        write_container(
            &fx.config.rom_dir.join("galaga.zip"),
            &[("galaga.1", b"galaga rom")],
            &fx.config,
        );
        let mut container = write_container(
            &fx.config.rom_dir.join("pacman.zip"),
            &[("pacman.6e", b"pacman rom"), ("stray.bin", b"galaga rom")],
            &fx.config,
        );
        let lineage = Lineage {
            own: Some(&container),
            ..Lineage::default()
        };
        let result = match_game(&pacman, lineage, &fx.pools, &catalog, &fx.config).unwrap();
        let outcome = fix_game(
            &pacman,
            &mut container,
            &result,
            &mut fx.pools,
            &catalog,
            &fx.config,
        )
        .unwrap();

        assert!(outcome.committed);
        assert!(outcome.needed.is_empty());
        assert!(fx.pools.needed.is_empty());
        assert_eq!(fx.pools.extra.len(), 1);
    }

    /// Catalog whose content lookups fail.
    struct BrokenLocations(MemoryCatalog);

    impl Catalog for BrokenLocations {
        fn find_game(&self, name: &str) -> anyhow::Result<Option<Game>> {
            self.0.find_game(name)
        }

        fn find_locations(
            &self,
            _size: Option<u64>,
            _checksums: &ChecksumSet,
        ) -> anyhow::Result<Vec<FileLocation>> {
            bail!("lookup failed")
        }

        fn find_disk_locations(&self, _checksums: &ChecksumSet) -> anyhow::Result<Vec<FileLocation>> {
            bail!("lookup failed")
        }

        fn list_games(&self) -> anyhow::Result<Vec<String>> {
            self.0.list_games()
        }
    }

    #[test]
    fn catalog_errors_surface_before_anything_is_changed() {
        let mut fx = fixture();
        let mut game = Game::new("pacman");
        game.files = vec![expected("pacman.6e", b"pacman rom")];
        let catalog = catalog_with(vec![game.clone()]);
        let path = fx.config.rom_dir.join("pacman.zip");
        let mut container = write_container(
            &path,
            &[("6e.bin", b"pacman rom"), ("junk", b"junk")],
            &fx.config,
        );
        let before = fs::read(&path).unwrap();
        let lineage = Lineage {
            own: Some(&container),
            ..Lineage::default()
        };
        let result = match_game(&game, lineage, &fx.pools, &catalog, &fx.config).unwrap();
        assert!(result.needs_fix());

        let broken = BrokenLocations(catalog);
        let fixed = fix_game(
            &game,
            &mut container,
            &result,
            &mut fx.pools,
            &broken,
            &fx.config,
        );
        assert!(fixed.is_err());
        assert!(!container.has_changes());
        assert_eq!(fs::read(&path).unwrap(), before);
        assert!(fx.pools.extra.is_empty());
        assert!(fx.pools.needed.is_empty());
    }

    #[test]
    fn move_aside_picks_first_free_name() {
        let fx = fixture();
        let path = fx.config.rom_dir.join("x.zip");
        let mut container = write_container(
            &path,
            &[("a", b"1"), ("a_renamed_by_romcheck_0", b"2")],
            &fx.config,
        );
        let mut actions = Vec::new();
        move_aside(&mut container, "a", &mut actions).unwrap();
        assert!(container.find_name("a").is_none());
        assert!(container.find_name("a_renamed_by_romcheck_1").is_some());
        assert_eq!(
            actions,
            vec![FixAction::MoveAside {
                from: "a".into(),
                to: "a_renamed_by_romcheck_1".into()
            }]
        );
    }
}
