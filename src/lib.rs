// Lightweight verbosity-gated logging helper used throughout the crate.
macro_rules! vprintln {
	($verbose:expr, $level:expr, $($arg:tt)*) => {
		if $verbose >= $level {
			eprintln!($($arg)*);
		}
	};
}

// Public library re-exports for integration tests and external use.
pub mod catalog;
pub mod check;
pub mod checksum;
pub mod cli;
pub mod config;
pub mod container;
pub mod diagnostics;
pub mod disk;
pub mod fix;
pub mod matcher;
pub mod pool;
pub mod progress;
pub mod tree;
pub mod types;

// Keep main.rs thin and have it call into the library functions.
