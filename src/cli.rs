use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::types::Checksum;

#[derive(Parser, Debug, serde::Serialize)]
#[command(
    name = "romcheck",
    version,
    about = "Verify and repair ROM set containers against a catalog"
)]
pub struct Cli {
    /// Game names or glob patterns to check (default: every game in the catalog)
    #[arg(value_name = "GAME", action = ArgAction::Append)]
    pub games: Vec<String>,

    /// Logiqx XML datafile(s) describing the sets
    #[arg(short = 'D', long = "datafile", value_name = "PATH", action = ArgAction::Append)]
    pub datafile: Vec<PathBuf>,

    /// Directory holding one `<game>.zip` container per game
    #[arg(short = 'R', long = "rom-dir", value_name = "PATH", default_value = "roms")]
    pub rom_dir: PathBuf,

    /// Directory for files some other game needs
    #[arg(long = "needed-dir", value_name = "PATH", default_value = "needed")]
    pub needed_dir: PathBuf,

    /// Directory for files no game needs
    #[arg(long = "extra-dir", value_name = "PATH", default_value = "unknown")]
    pub extra_dir: PathBuf,

    /// Additional directories searched for missing files (never modified)
    #[arg(short = 'e', long = "search", value_name = "PATH", action = ArgAction::Append)]
    pub search: Vec<PathBuf>,

    /// Repair containers instead of only reporting
    #[arg(short = 'F', long = "fix")]
    pub fix: bool,

    /// Delete unknown entries instead of moving them to the extra directory
    #[arg(long = "delete-superfluous")]
    pub delete_superfluous: bool,

    /// Also search every other game's container for missing files
    #[arg(long = "relocate")]
    pub relocate: bool,

    /// Validate local headers and payload CRCs of every entry
    #[arg(short = 'i', long = "check-integrity")]
    pub check_integrity: bool,

    /// The minimum checksum level to calculate and use for matching
    #[arg(long = "checksum-min", value_enum, default_value_t = Checksum::Crc32)]
    pub checksum_min: Checksum,

    /// The maximum checksum level to calculate and use for matching
    #[arg(long = "checksum-max", value_enum)]
    pub checksum_max: Option<Checksum>,

    /// Only compare what archive directories record, never decompress
    #[arg(long = "checksum-quick")]
    pub checksum_quick: bool,

    /// Only report broken files
    #[arg(short = 'n', long = "nowarnings")]
    pub no_warnings: bool,
    /// Don't report unknown files
    #[arg(short = 's', long = "nosuperfluous")]
    pub no_superfluous: bool,
    /// Don't report fixable files
    #[arg(short = 'f', long = "nofixable")]
    pub no_fixable: bool,
    /// Don't report broken or missing files
    #[arg(short = 'b', long = "nobroken")]
    pub no_broken: bool,
    /// Don't report files without a good dump
    #[arg(short = 'd', long = "nonogooddumps")]
    pub no_nogooddumps: bool,
    /// Also report correct files
    #[arg(short = 'c', long = "correct")]
    pub correct: bool,

    /// Write per-game diagnostics as JSON
    #[arg(long = "report", value_name = "PATH")]
    pub report: Option<PathBuf>,

    /// Write the files found correct as a JSON fixdat
    #[arg(long = "fixdat", value_name = "PATH")]
    pub fixdat: Option<PathBuf>,

    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
    #[arg(short = 'q', long = "quiet", action = ArgAction::Count)]
    pub quiet: u8,
}
