use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Context, anyhow, bail};
use globset::Glob;
use walkdir::WalkDir;

use crate::catalog::{Catalog, MemoryCatalog};
use crate::config::Config;
use crate::container::{Container, OpenFlags, container_path};
use crate::diagnostics::{Diagnostics, GameReport};
use crate::disk::{ChdProbe, DiskStore, check_disks, fix_disks, stray_images};
use crate::fix::fix_game;
use crate::matcher::{Lineage, MatchResult, match_game};
use crate::pool::Pools;
use crate::progress::ProgressReporter;
use crate::tree::{Frame, GameTree, Visit};
use crate::types::Game;

/// State shared by every node of one run.
pub struct RunContext<'a> {
    pub config: &'a Config,
    pub catalog: &'a dyn Catalog,
    pub pools: Pools,
    pub disks: DiskStore,
    pub diagnostics: Diagnostics,
    probe: ChdProbe,
}

impl<'a> RunContext<'a> {
    pub fn new(
        config: &'a Config,
        catalog: &'a dyn Catalog,
        pools: Pools,
        disks: DiskStore,
    ) -> Self {
        RunContext {
            config,
            catalog,
            pools,
            disks,
            diagnostics: Diagnostics::new(),
            probe: ChdProbe {
                hash_types: config.hash_types(),
            },
        }
    }


    fn classify(
        &self,
        game: &Game,
        container: &Container,
        frame: &Frame<'_, Container>,
    ) -> anyhow::Result<MatchResult> {
        let lineage = Lineage {
            own: Some(container),
            parent: frame.parent.map(|handle| &**handle),
            grandparent: frame.grandparent.map(|handle| &**handle),
        };
        let mut result = match_game(game, lineage, &self.pools, self.catalog, self.config)?;
        result.disks = check_disks(
            game,
            &self.config.rom_dir,
            &self.probe,
            &self.config.hash_types(),
            &self.disks,
        );
        result.stray_disks = stray_images(game, &self.config.rom_dir);
        Ok(result)
    }

    /// Opens an ancestor's container for lookups only.
    fn open_ancestor(&self, name: &str) -> Option<Rc<Container>> {
        let path = container_path(&self.config.rom_dir, name);
        if !path.is_file() {
            return None;
        }
        match Container::open(&path, OpenFlags::default(), self.config) {
            Ok(container) => Some(Rc::new(container)),
            Err(err) => {
                vprintln!(self.config.verbose, 1, "{name}: {err:#}");
                None
            }
        }
    }

    /// Processes one tree node: verify, fix if asked to, record the
    /// outcome. Failures below the catalog end up in the game's report and
    /// leave the node unchecked.
    pub fn visit(&mut self, frame: &Frame<'_, Container>) -> anyhow::Result<Visit<Container>> {
        if !frame.process {
            return Ok(Visit::skip(self.open_ancestor(frame.name)));
        }
        let game = self
            .catalog
            .find_game(frame.name)?
            .ok_or_else(|| anyhow!("game not found in catalog: {}", frame.name))?;
        vprintln!(self.config.verbose, 1, "checking {}", game.name);

        let path = container_path(&self.config.rom_dir, &game.name);
        let flags = OpenFlags {
            create: true,
            check_integrity: self.config.check_integrity,
        };
        let mut container = match Container::open(&path, flags, self.config) {
            Ok(container) => container,
            Err(err) => {
                self.diagnostics
                    .record(GameReport::failed(&game, format!("{err:#}")));
                return Ok(Visit::skip(None));
            }
        };

        let result = match self.classify(&game, &container, frame) {
            Ok(result) => result,
            Err(err) => {
                self.diagnostics
                    .record(GameReport::failed(&game, format!("{err:#}")));
                return Ok(Visit::skip(Some(Rc::new(container))));
            }
        };

        let mut visit = Visit::skip(None);
        let report = if self.config.fix && (result.needs_fix() || result.disks_need_fix()) {
            let disk_fix = fix_disks(
                &game,
                &result.disks,
                &result.stray_disks,
                &mut self.disks,
                self.catalog,
                &self.probe,
                self.config,
            );
            let fixed = fix_game(
                &game,
                &mut container,
                &result,
                &mut self.pools,
                self.catalog,
                self.config,
            );
            match fixed {
                Ok(mut outcome) => {
                    let disks_changed = !disk_fix.actions.is_empty();
                    outcome.actions.extend(disk_fix.actions);
                    outcome.failures.extend(disk_fix.failures);
                    outcome.rechecks.extend(disk_fix.rechecks);
                    let final_result = if outcome.committed || disks_changed {
                        self.classify(&game, &container, frame)
                    } else {
                        Ok(result)
                    };
                    let mut report = match final_result {
                        Ok(result) => GameReport::new(&game, result),
                        Err(err) => GameReport::failed(&game, format!("{err:#}")),
                    };
                    report.fix_failed = outcome.failed();
                    report.errors.extend(outcome.failures);
                    report.actions = outcome.actions;
                    visit.checked = !report.fix_failed;
                    visit.rechecks = outcome.rechecks;
                    visit.needed = outcome.needed;
                    report
                }
                Err(err) => {
                    container.rollback();
                    let mut report = GameReport::new(&game, result);
                    report.fix_failed = true;
                    report.errors.extend(disk_fix.failures);
                    report.errors.push(format!("{err:#}"));
                    report.actions = disk_fix.actions;
                    visit.rechecks = disk_fix.rechecks;
                    report
                }
            }
        } else {
            visit.checked = true;
            GameReport::new(&game, result)
        };

        self.diagnostics.record(report);
        visit.handle = Some(Rc::new(container));
        Ok(visit)
    }
}

/// Zip archives directly in `rom_dir` whose name matches no catalog game.
pub fn unknown_containers(rom_dir: &Path, catalog: &dyn Catalog) -> anyhow::Result<Vec<PathBuf>> {
    if !rom_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut unknown = Vec::new();
    for entry in WalkDir::new(rom_dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("scanning {rom_dir:?}"))?;
        let path = entry.path();
        let is_zip = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"));
        if !entry.file_type().is_file() || !is_zip {
            continue;
        }
        let Some(stem) = path.file_stem().map(|stem| stem.to_string_lossy()) else {
            continue;
        };
        if catalog.find_game(&stem)?.is_none() {
            unknown.push(path.to_path_buf());
        }
    }
    Ok(unknown)
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

/// Resolves game names and glob patterns against the catalog. No patterns
/// selects every game; an exact name the catalog lacks is an error.
pub fn select_games(catalog: &dyn Catalog, patterns: &[String]) -> anyhow::Result<Vec<String>> {
    let all = catalog.list_games()?;
    if patterns.is_empty() {
        return Ok(all);
    }
    let mut selected: Vec<String> = Vec::new();
    for pattern in patterns {
        if is_glob(pattern) {
            let matcher = Glob::new(pattern)
                .with_context(|| format!("invalid game pattern: {pattern}"))?
                .compile_matcher();
            for name in all.iter().filter(|name| matcher.is_match(name.as_str())) {
                if !selected.contains(name) {
                    selected.push(name.clone());
                }
            }
        } else if all.contains(pattern) {
            if !selected.contains(pattern) {
                selected.push(pattern.clone());
            }
        } else {
            bail!("game not found in catalog: {pattern}");
        }
    }
    Ok(selected)
}

/// Verifies (and with `--fix` repairs) the selected games. Returns the
/// process exit code.
pub fn run(config: &Config) -> anyhow::Result<i32> {
    let catalog = MemoryCatalog::load_datafiles(&config.datafiles, config.hash_types())?;
    vprintln!(config.verbose, 1, "catalog: {} games", catalog.len());

    let games = select_games(&catalog, &config.games)?;
    let mut tree = GameTree::new();
    for name in &games {
        tree.insert(&catalog, name)?;
    }

    let mut pools = Pools::load(config)?;
    let unknown = unknown_containers(&config.rom_dir, &catalog)?;
    for path in &unknown {
        match pools.add_archive(path, config) {
            Ok(count) => vprintln!(config.verbose, 1, "{path:?}: {count} unknown entries"),
            Err(err) => vprintln!(config.verbose, 0, "warning: skipping {path:?}: {err:#}"),
        }
    }
    vprintln!(
        config.verbose,
        1,
        "pools: {} needed, {} extra, {} in unknown archives",
        pools.needed.len(),
        pools.extra.len(),
        pools.archived.len()
    );

    let probe = ChdProbe {
        hash_types: config.hash_types(),
    };
    let disks = DiskStore::load(config, &probe)?;
    vprintln!(config.verbose, 1, "disk images: {}", disks.len());

    let progress = ProgressReporter::maybe_new(config, tree.requested());
    let mut context = RunContext::new(config, &catalog, pools, disks);
    context.diagnostics.set_unknown(unknown);
    let passes = tree.traverse(&catalog, |frame: &Frame<'_, Container>| {
        let visit = context.visit(frame);
        if frame.process {
            if let Some(progress) = &progress {
                progress.advance(frame.name);
            }
        }
        visit
    })?;
    if let Some(progress) = &progress {
        progress.finish();
    }
    vprintln!(config.verbose, 1, "done after {passes} pass(es)");

    let diagnostics = context.diagnostics;
    if config.quiet == 0 {
        for line in diagnostics.lines(&config.report_filter) {
            println!("{line}");
        }
    }
    if let Some(path) = &config.report {
        diagnostics.write_report(path)?;
    }
    if let Some(path) = &config.fixdat {
        diagnostics.write_fixdat(path)?;
    }
    Ok(diagnostics.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Checksum, ChecksumSet, ExpectedFile};

    fn catalog() -> MemoryCatalog {
        let mut catalog = MemoryCatalog::new(vec![Checksum::Crc32]);
        for name in ["galaga", "galagao", "pacman", "puckman"] {
            let mut game = Game::new(name);
            game.files
                .push(ExpectedFile::new("a", Some(1), ChecksumSet::from_crc32(1)));
            catalog.insert(game);
        }
        catalog
    }

    #[test]
    fn no_patterns_select_everything() {
        let selected = select_games(&catalog(), &[]).unwrap();
        assert_eq!(selected.len(), 4);
    }

    #[test]
    fn globs_and_names_are_combined_without_duplicates() {
        let patterns = vec!["gal*".to_string(), "pacman".to_string(), "galaga".to_string()];
        let selected = select_games(&catalog(), &patterns).unwrap();
        assert_eq!(selected, vec!["galaga", "galagao", "pacman"]);
    }

    #[test]
    fn unknown_exact_name_is_fatal() {
        let patterns = vec!["mspacman".to_string()];
        assert!(select_games(&catalog(), &patterns).is_err());
        // a glob matching nothing is not
        let patterns = vec!["zz*".to_string()];
        assert!(select_games(&catalog(), &patterns).unwrap().is_empty());
    }

    #[test]
    fn archives_of_unknown_games_are_listed() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["pacman.zip", "stuff.zip", "notes.txt", "Other.ZIP"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/deep.zip"), b"").unwrap();

        let unknown = unknown_containers(dir.path(), &catalog()).unwrap();
        assert_eq!(
            unknown,
            vec![dir.path().join("Other.ZIP"), dir.path().join("stuff.zip")]
        );
        assert!(unknown_containers(&dir.path().join("missing"), &catalog()).unwrap().is_empty());
    }
}
