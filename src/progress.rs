use std::io::{IsTerminal, stderr};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::config::Config;

const GAME_BAR_TEMPLATE: &str =
    "{prefix} [{bar:40}] {pos:>5}/{len:<5} | {percent:>3}% | {elapsed_precise}<{eta_precise} | {msg}";

fn ellipsize(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut shortened: String = input.chars().take(keep).collect();
    shortened.push_str("...");
    shortened
}

fn stderr_supports_progress() -> bool {
    stderr().is_terminal()
}

/// Progress over the games of one run. Verbose output and the bar would
/// interleave, so the bar only shows at verbosity 0.
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    pub fn maybe_new(config: &Config, total: usize) -> Option<Self> {
        if config.quiet > 0 || config.verbose > 0 || !stderr_supports_progress() {
            return None;
        }
        Some(Self::with_target(total, ProgressDrawTarget::stderr_with_hz(15)))
    }

    fn with_target(total: usize, target: ProgressDrawTarget) -> Self {
        let bar = ProgressBar::with_draw_target(Some(total.max(1) as u64), target);
        if let Ok(style) = ProgressStyle::with_template(GAME_BAR_TEMPLATE) {
            bar.set_style(style.progress_chars("=>-"));
        }
        bar.set_prefix("[CHECK]");
        bar.enable_steady_tick(Duration::from_millis(120));
        ProgressReporter { bar }
    }

    /// Counts one processed game. Rechecks can push the count past the
    /// initial total, so the length grows with it.
    pub fn advance(&self, game: &str) {
        if let Some(len) = self.bar.length() {
            if self.bar.position() >= len {
                self.bar.inc_length(1);
            }
        }
        self.bar.inc(1);
        self.bar.set_message(ellipsize(game, 40));
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}
