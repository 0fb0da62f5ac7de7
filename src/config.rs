use std::path::PathBuf;

use crate::{
    checksum::checksum_range, cli::Cli, diagnostics::ReportFilter, types::Checksum,
};

#[derive(Debug, Clone, serde::Serialize)]
pub struct Config {
    pub games: Vec<String>,
    pub datafiles: Vec<PathBuf>,
    pub rom_dir: PathBuf,
    pub needed_dir: PathBuf,
    pub extra_dir: PathBuf,
    pub search_dirs: Vec<PathBuf>,
    pub fix: bool,
    pub delete_superfluous: bool,
    pub relocate: bool,
    pub check_integrity: bool,
    pub checksum_min: Checksum,
    pub checksum_max: Option<Checksum>,
    pub checksum_quick: bool,
    pub report_filter: ReportFilter,
    pub report: Option<PathBuf>,
    pub fixdat: Option<PathBuf>,
    pub verbose: u8,
    pub quiet: u8,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            games: Vec::new(),
            datafiles: Vec::new(),
            rom_dir: PathBuf::from("roms"),
            needed_dir: PathBuf::from("needed"),
            extra_dir: PathBuf::from("unknown"),
            search_dirs: Vec::new(),
            fix: false,
            delete_superfluous: false,
            relocate: false,
            check_integrity: false,
            checksum_min: Checksum::Crc32,
            checksum_max: Some(Checksum::Sha1),
            checksum_quick: false,
            report_filter: ReportFilter::default(),
            report: None,
            fixdat: None,
            verbose: 0,
            quiet: 0,
        }
    }
}

impl Config {
    /// Hash types used for matching, in rank order.
    pub fn hash_types(&self) -> Vec<Checksum> {
        checksum_range(self.checksum_min, self.checksum_max)
    }

    fn validate_checksum_range(&self) -> anyhow::Result<()> {
        if let Some(max) = self.checksum_max {
            if max.rank() < self.checksum_min.rank() {
                anyhow::bail!("checksum-max cannot be lower fidelity than checksum-min");
            }
        }

        Ok(())
    }

    fn validate_fix_options(&self) -> anyhow::Result<()> {
        if self.delete_superfluous && !self.fix {
            anyhow::bail!("--delete-superfluous requires --fix");
        }

        Ok(())
    }

    fn validate_datafiles(&self) -> anyhow::Result<()> {
        if self.datafiles.is_empty() {
            anyhow::bail!("at least one --datafile must be provided");
        }

        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.validate_datafiles()?;
        self.validate_checksum_range()?;
        self.validate_fix_options()?;
        Ok(())
    }
}

impl TryFrom<Cli> for Config {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        // Without an explicit maximum, hash up to SHA-1 so catalog digests get used.
        let checksum_max = cli.checksum_max.or_else(|| {
            (cli.checksum_min.rank() < Checksum::Sha1.rank()).then_some(Checksum::Sha1)
        });

        let config = Self {
            games: cli.games,
            datafiles: cli.datafile,
            rom_dir: cli.rom_dir,
            needed_dir: cli.needed_dir,
            extra_dir: cli.extra_dir,
            search_dirs: cli.search,
            fix: cli.fix,
            delete_superfluous: cli.delete_superfluous,
            relocate: cli.relocate,
            check_integrity: cli.check_integrity,
            checksum_min: cli.checksum_min,
            checksum_max,
            checksum_quick: cli.checksum_quick,
            report_filter: ReportFilter::from_flags(
                cli.no_warnings,
                cli.no_superfluous,
                cli.no_fixable,
                cli.no_broken,
                cli.no_nogooddumps,
                cli.correct,
            ),
            report: cli.report,
            fixdat: cli.fixdat,
            verbose: cli.verbose,
            quiet: cli.quiet,
        };

        config.validate()?;

        Ok(config)
    }
}
