use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Serialize;

use crate::disk::DiskMatch;
use crate::fix::FixAction;
use crate::matcher::{FileMatch, MatchResult};
use crate::types::{ActualFile, ChecksumSet, ExpectedFile, Game, Status};

/// Which statuses show up in the text report. Classification and fixing
/// ignore it.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct ReportFilter {
    pub correct: bool,
    pub fixable: bool,
    pub broken: bool,
    pub superfluous: bool,
    pub no_good_dump: bool,
}

impl Default for ReportFilter {
    fn default() -> Self {
        ReportFilter {
            correct: false,
            fixable: true,
            broken: true,
            superfluous: true,
            no_good_dump: true,
        }
    }
}

impl ReportFilter {
    pub fn from_flags(
        no_warnings: bool,
        no_superfluous: bool,
        no_fixable: bool,
        no_broken: bool,
        no_nogooddumps: bool,
        correct: bool,
    ) -> Self {
        // warnings are everything short of a broken or missing file
        let warnings = !no_warnings;
        ReportFilter {
            correct,
            fixable: warnings && !no_fixable,
            broken: !no_broken,
            superfluous: warnings && !no_superfluous,
            no_good_dump: warnings && !no_nogooddumps,
        }
    }

    pub fn shows(&self, status: Status) -> bool {
        match status {
            Status::Ok => self.correct,
            Status::OkBadDump => self.no_good_dump,
            Status::Fixable => self.fixable,
            Status::Broken | Status::NotFound => self.broken,
            Status::Superfluous | Status::Duplicate => self.superfluous,
        }
    }
}

/// Outcome of processing one game.
#[derive(Debug, Clone, Serialize)]
pub struct GameReport {
    pub game: String,
    pub expected: Vec<ExpectedFile>,
    pub files: Vec<FileMatch>,
    pub entries: Vec<ActualFile>,
    pub disks: Vec<DiskMatch>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stray_disks: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<FixAction>,
    pub fix_failed: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl GameReport {
    pub fn new(game: &Game, result: MatchResult) -> Self {
        GameReport {
            game: game.name.clone(),
            expected: game.files.clone(),
            files: result.files,
            entries: result.entries,
            disks: result.disks,
            stray_disks: result.stray_disks,
            actions: Vec::new(),
            fix_failed: false,
            errors: Vec::new(),
        }
    }

    /// A game that could not be examined at all.
    pub fn failed(game: &Game, error: String) -> Self {
        GameReport {
            game: game.name.clone(),
            expected: game.files.clone(),
            files: Vec::new(),
            entries: Vec::new(),
            disks: Vec::new(),
            stray_disks: Vec::new(),
            actions: Vec::new(),
            fix_failed: false,
            errors: vec![error],
        }
    }

    /// Number of expected files, disks and unclaimed entries per status.
    pub fn counts(&self) -> BTreeMap<Status, usize> {
        let mut counts = BTreeMap::new();
        let statuses = self
            .files
            .iter()
            .map(|file| file.status)
            .chain(self.disks.iter().map(|disk| disk.status))
            .chain(
                self.entries
                    .iter()
                    .filter(|entry| self.is_unclaimed(entry))
                    .map(|entry| entry.status),
            );
        for status in statuses {
            *counts.entry(status).or_insert(0) += 1;
        }
        counts
    }

    /// Entries not already reported through an expected file.
    fn is_unclaimed(&self, entry: &ActualFile) -> bool {
        match entry.status {
            Status::Superfluous | Status::Duplicate => true,
            Status::Broken => !self
                .files
                .iter()
                .any(|file| file.wrong_entry == Some(entry.index)),
            _ => false,
        }
    }

    /// Every file and disk is accounted for and no fix or read failed.
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
            && !self.fix_failed
            && !self
                .counts()
                .keys()
                .any(|status| matches!(status, Status::Broken | Status::NotFound))
    }

    pub fn lines(&self, filter: &ReportFilter) -> Vec<String> {
        let mut lines = Vec::new();
        for error in &self.errors {
            lines.push(format!("  error: {error}"));
        }
        for file in &self.files {
            if !filter.shows(file.status) {
                continue;
            }
            let described = self
                .expected
                .get(file.expected)
                .map(describe_expected)
                .unwrap_or_else(|| file.name.clone());
            let origin = match (file.status, file.found_in) {
                (Status::Fixable, Some(found_in)) => format!(" ({found_in})"),
                _ => String::new(),
            };
            lines.push(format!("  rom  {described}: {}{origin}", file.status));
        }
        for disk in &self.disks {
            if filter.shows(disk.status) {
                let origin = match (disk.status, disk.found_in) {
                    (Status::Fixable, Some(found_in)) => format!(" ({found_in})"),
                    _ => String::new(),
                };
                lines.push(format!("  disk {}: {}{origin}", disk.name, disk.status));
            }
        }
        if filter.superfluous {
            for stray in &self.stray_disks {
                lines.push(format!("  image {}: unknown", stray.display()));
            }
        }
        for entry in self.entries.iter().filter(|entry| self.is_unclaimed(entry)) {
            if filter.shows(entry.status) {
                lines.push(format!(
                    "  file {:<12}  size {:>7}  crc {}: {}",
                    entry.name,
                    entry.size,
                    entry.checksums.crc32.as_deref().unwrap_or("-"),
                    entry.status
                ));
            }
        }
        if self.fix_failed {
            lines.push("  fix failed, container left unchanged".to_string());
        }
        if !lines.is_empty() {
            lines.insert(0, format!("In game {}:", self.game));
        }
        lines
    }
}

fn describe_expected(file: &ExpectedFile) -> String {
    let size = file
        .size
        .map(|size| size.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let crc = file.checksums.crc32.as_deref().unwrap_or("-");
    format!("{:<12}  size {size:>7}  crc {crc}", file.name)
}

/// Files a game now holds correctly.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FixdatGame {
    pub name: String,
    pub files: Vec<FixdatFile>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FixdatFile {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub checksums: ChecksumSet,
}

/// Per-game reports of one run, in the order games were processed.
#[derive(Debug, Default)]
pub struct Diagnostics {
    reports: Vec<GameReport>,
    /// Archives in the rom directory that belong to no game.
    unknown: Vec<PathBuf>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Diagnostics::default()
    }

    /// Stores `report`, replacing an earlier one for the same game.
    pub fn record(&mut self, report: GameReport) {
        match self.reports.iter_mut().find(|old| old.game == report.game) {
            Some(old) => *old = report,
            None => self.reports.push(report),
        }
    }

    pub fn get(&self, game: &str) -> Option<&GameReport> {
        self.reports.iter().find(|report| report.game == game)
    }

    pub fn reports(&self) -> &[GameReport] {
        &self.reports
    }

    pub fn set_unknown(&mut self, unknown: Vec<PathBuf>) {
        self.unknown = unknown;
    }

    pub fn unknown(&self) -> &[PathBuf] {
        &self.unknown
    }

    pub fn lines(&self, filter: &ReportFilter) -> Vec<String> {
        let mut lines: Vec<String> = self
            .reports
            .iter()
            .flat_map(|report| report.lines(filter))
            .collect();
        if filter.superfluous && !self.unknown.is_empty() {
            lines.push("Unknown archives in rom directory:".to_string());
            lines.extend(
                self.unknown
                    .iter()
                    .map(|path| format!("  {}", path.display())),
            );
        }
        lines
    }

    pub fn totals(&self) -> BTreeMap<Status, usize> {
        let mut totals = BTreeMap::new();
        for report in &self.reports {
            for (status, count) in report.counts() {
                *totals.entry(status).or_insert(0) += count;
            }
        }
        totals
    }

    /// 0 when every game is complete, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.reports.iter().all(GameReport::is_complete) {
            0
        } else {
            1
        }
    }

    pub fn write_report(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.reports)?;
        write_file(path, json)
    }

    pub fn fixdat(&self) -> Vec<FixdatGame> {
        self.reports
            .iter()
            .filter(|report| report.errors.is_empty())
            .map(|report| FixdatGame {
                name: report.game.clone(),
                files: report
                    .files
                    .iter()
                    .filter(|file| file.status == Status::Ok)
                    .filter_map(|file| report.expected.get(file.expected))
                    .map(|file| FixdatFile {
                        name: file.name.clone(),
                        size: file.size,
                        checksums: file.checksums.clone(),
                    })
                    .collect(),
            })
            .filter(|game| !game.files.is_empty())
            .collect()
    }

    pub fn write_fixdat(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.fixdat())?;
        write_file(path, json)
    }
}

fn write_file(path: &Path, contents: String) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("creating directory: {parent:?}"))?;
    }
    fs::write(path, contents).with_context(|| format!("writing {path:?}"))
}
