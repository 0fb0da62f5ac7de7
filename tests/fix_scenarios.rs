use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use tempfile::{TempDir, tempdir};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use romcheck::check;
use romcheck::config::Config;

const PACMAN_6E: &[u8] = b"pacman 6e program rom";
const PACMAN_6F: &[u8] = b"pacman 6f program rom";
const BOOT1: &[u8] = b"ms pacman boot rom";
const GALAGA_1: &[u8] = b"galaga cpu rom";

fn rom(name: &str, data: &[u8]) -> String {
    format!(
        r#"<rom name="{name}" size="{}" crc="{:08x}"/>"#,
        data.len(),
        crc32fast::hash(data)
    )
}

fn datafile() -> String {
    format!(
        r#"<?xml version="1.0"?>
<datafile>
  <game name="pacman">
    <description>Pac-Man</description>
    {}
    {}
  </game>
  <game name="mspacmna" cloneof="pacman">
    <rom name="pacman.6e" merge="pacman.6e" size="{}" crc="{:08x}"/>
    {}
  </game>
  <game name="galaga">
    {}
  </game>
  <game name="galagab">
    {}
  </game>
  <game name="badgame">
    <rom name="bad.1" size="16" crc="01020304" status="baddump"/>
    <rom name="bad.2" size="16" crc="05060708" status="baddump"/>
  </game>
</datafile>"#,
        rom("pacman.6e", PACMAN_6E),
        rom("pacman.6f", PACMAN_6F),
        PACMAN_6E.len(),
        crc32fast::hash(PACMAN_6E),
        rom("boot1", BOOT1),
        rom("galaga.1", GALAGA_1),
        rom("gg.1", GALAGA_1),
    )
}

struct Setup {
    dir: TempDir,
    config: Config,
}

impl Setup {
    fn new(games: &[&str]) -> Result<Self> {
        let dir = tempdir()?;
        let dat = dir.path().join("test.dat");
        fs::write(&dat, datafile())?;
        let config = Config {
            games: games.iter().map(|g| g.to_string()).collect(),
            datafiles: vec![dat],
            rom_dir: dir.path().join("roms"),
            needed_dir: dir.path().join("needed"),
            extra_dir: dir.path().join("unknown"),
            report: Some(dir.path().join("report.json")),
            quiet: 1,
            ..Config::default()
        };
        fs::create_dir_all(&config.rom_dir)?;
        Ok(Setup { dir, config })
    }

    fn zip_path(&self, game: &str) -> PathBuf {
        self.config.rom_dir.join(format!("{game}.zip"))
    }

    fn write_zip(&self, game: &str, files: &[(&str, &[u8])]) -> Result<()> {
        let mut writer = ZipWriter::new(File::create(self.zip_path(game))?);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        for (name, data) in files {
            writer.start_file(*name, options)?;
            writer.write_all(data)?;
        }
        writer.finish()?;
        Ok(())
    }

    fn run(&self, fix: bool) -> Result<i32> {
        let config = Config {
            fix,
            ..self.config.clone()
        };
        check::run(&config)
    }

    fn report(&self) -> Result<serde_json::Value> {
        let path = self.dir.path().join("report.json");
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

fn zip_contents(path: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let mut archive = ZipArchive::new(File::open(path)?)?;
    let mut contents = Vec::new();
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        contents.push((file.name().to_string(), data));
    }
    contents.sort();
    Ok(contents)
}

fn statuses(report: &serde_json::Value, game: &str) -> Vec<String> {
    report
        .as_array()
        .into_iter()
        .flatten()
        .filter(|r| r["game"] == game)
        .flat_map(|r| r["files"].as_array().cloned().unwrap_or_default())
        .map(|f| f["status"].as_str().unwrap_or_default().to_string())
        .collect()
}

#[test]
fn misnamed_file_is_renamed_and_stray_file_moved_to_extra_pool() -> Result<()> {
    let setup = Setup::new(&["pacman", "mspacmna"])?;
    setup.write_zip(
        "pacman",
        &[
            ("6e.bin", PACMAN_6E),
            ("pacman.6f", PACMAN_6F),
            ("readme.txt", b"not a rom"),
        ],
    )?;
    setup.write_zip("mspacmna", &[("boot1", BOOT1)])?;
    let clone_before = fs::read(setup.zip_path("mspacmna"))?;

    assert_eq!(setup.run(false)?, 0);
    let report = setup.report()?;
    assert_eq!(statuses(&report, "pacman"), vec!["fixable", "ok"]);
    // inherited from the parent, nothing copied
    assert_eq!(statuses(&report, "mspacmna"), vec!["ok", "ok"]);

    assert_eq!(setup.run(true)?, 0);
    assert_eq!(
        zip_contents(&setup.zip_path("pacman"))?,
        vec![
            ("pacman.6e".to_string(), PACMAN_6E.to_vec()),
            ("pacman.6f".to_string(), PACMAN_6F.to_vec()),
        ]
    );
    assert_eq!(
        fs::read(setup.config.extra_dir.join("readme.txt"))?,
        b"not a rom"
    );
    assert_eq!(fs::read(setup.zip_path("mspacmna"))?, clone_before);

    let report = setup.report()?;
    assert_eq!(statuses(&report, "pacman"), vec!["ok", "ok"]);
    Ok(())
}

#[test]
fn fixing_twice_changes_nothing() -> Result<()> {
    let setup = Setup::new(&["pacman"])?;
    setup.write_zip(
        "pacman",
        &[("pacman.6f", PACMAN_6F), ("6e.bin", PACMAN_6E)],
    )?;

    assert_eq!(setup.run(true)?, 0);
    let fixed = fs::read(setup.zip_path("pacman"))?;
    assert_eq!(setup.run(true)?, 0);
    assert_eq!(fs::read(setup.zip_path("pacman"))?, fixed);
    let report = setup.report()?;
    assert!(report[0].get("actions").is_none());
    Ok(())
}

#[test]
fn stray_file_travels_through_needed_pool_to_its_game() -> Result<()> {
    let setup = Setup::new(&["galaga", "pacman"])?;
    setup.write_zip(
        "pacman",
        &[
            ("pacman.6e", PACMAN_6E),
            ("pacman.6f", PACMAN_6F),
            ("g1.bin", GALAGA_1),
        ],
    )?;

    // galaga is visited first, finds nothing, and is rechecked once the
    // pacman fix saves its file to the needed pool
    assert_eq!(setup.run(true)?, 0);
    assert_eq!(
        zip_contents(&setup.zip_path("galaga"))?,
        vec![("galaga.1".to_string(), GALAGA_1.to_vec())]
    );
    assert_eq!(zip_contents(&setup.zip_path("pacman"))?.len(), 2);
    let leftover = fs::read_dir(&setup.config.needed_dir)?.count();
    assert_eq!(leftover, 0);
    Ok(())
}

#[test]
fn relocate_copies_from_unrelated_game_without_touching_it() -> Result<()> {
    let mut setup = Setup::new(&["galaga"])?;
    setup.config.relocate = true;
    setup.write_zip("galagab", &[("gg.1", GALAGA_1)])?;
    let source_before = fs::read(setup.zip_path("galagab"))?;

    assert_eq!(setup.run(true)?, 0);
    assert_eq!(
        zip_contents(&setup.zip_path("galaga"))?,
        vec![("galaga.1".to_string(), GALAGA_1.to_vec())]
    );
    assert_eq!(fs::read(setup.zip_path("galagab"))?, source_before);
    Ok(())
}

#[test]
fn missing_files_fail_the_run_unless_only_bad_dumps_exist() -> Result<()> {
    let setup = Setup::new(&["badgame"])?;
    assert_eq!(setup.run(false)?, 0);
    let report = setup.report()?;
    assert_eq!(statuses(&report, "badgame"), vec!["ok_bad_dump", "ok_bad_dump"]);

    let setup = Setup::new(&["galaga"])?;
    assert_eq!(setup.run(true)?, 1);
    let report = setup.report()?;
    assert_eq!(statuses(&report, "galaga"), vec!["not_found"]);
    assert!(!setup.zip_path("galaga").exists());
    Ok(())
}

#[test]
fn archive_of_no_game_supplies_files_and_is_left_alone() -> Result<()> {
    let setup = Setup::new(&["galaga"])?;
    setup.write_zip("stuff", &[("whatever.bin", GALAGA_1), ("notes.txt", b"notes")])?;
    let stuff_before = fs::read(setup.zip_path("stuff"))?;

    assert_eq!(setup.run(false)?, 0);
    assert_eq!(statuses(&setup.report()?, "galaga"), vec!["fixable"]);

    assert_eq!(setup.run(true)?, 0);
    assert_eq!(
        zip_contents(&setup.zip_path("galaga"))?,
        vec![("galaga.1".to_string(), GALAGA_1.to_vec())]
    );
    assert_eq!(fs::read(setup.zip_path("stuff"))?, stuff_before);
    Ok(())
}

#[test]
fn unknown_game_aborts_the_run() -> Result<()> {
    let setup = Setup::new(&["nosuchgame"])?;
    assert!(setup.run(false).is_err());
    Ok(())
}

#[test]
fn fixdat_lists_files_present_after_fixing() -> Result<()> {
    let mut setup = Setup::new(&["pacman"])?;
    let fixdat = setup.dir.path().join("fixdat.json");
    setup.config.fixdat = Some(fixdat.clone());
    setup.write_zip("pacman", &[("pacman.6e", PACMAN_6E)])?;

    assert_eq!(setup.run(false)?, 1);
    let written: serde_json::Value = serde_json::from_str(&fs::read_to_string(&fixdat)?)?;
    assert_eq!(written[0]["name"], "pacman");
    assert_eq!(written[0]["files"].as_array().map(Vec::len), Some(1));
    assert_eq!(written[0]["files"][0]["name"], "pacman.6e");
    Ok(())
}
