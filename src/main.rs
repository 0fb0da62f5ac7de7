use std::process::ExitCode;

use clap::Parser;

use romcheck::check;
use romcheck::cli::Cli;
use romcheck::config::Config;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let outcome = Config::try_from(cli).and_then(|config| check::run(&config));
    match outcome {
        Ok(0) => ExitCode::SUCCESS,
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(err) => {
            eprintln!("romcheck: {err:#}");
            ExitCode::from(2)
        }
    }
}
