//! Progress bar and summary reporting for CLI installs.

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::stats::InstallStats;
use crate::worker::InstallProgress;

const SEPARATOR: &str = "────────────────────────────────────────────────────────────";

/// Formats a byte count with a binary unit.
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 3] = ["KB", "MB", "GB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = UNITS[0];
    for next in &UNITS[1..] {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = *next;
    }
    format!("{value:.2} {unit}")
}

/// Install progress rendered as a single bar with one line per asset.
pub struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    /// Creates a hidden bar; it is sized when the install starts.
    #[must_use]
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("━━╌"),
        );
        Self { bar }
    }
}

impl Default for CliProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl InstallProgress for CliProgress {
    fn on_install_start(&self, cache: &str, assets: usize) {
        self.bar.set_length(assets as u64);
        self.bar.set_message(format!("caching into {cache}"));
    }

    fn on_asset_fetched(&self, url: &str, bytes: u64) {
        self.bar.println(format!(
            "  {} {url} ({})",
            style("✔").green(),
            format_bytes(bytes)
        ));
        self.bar.inc(1);
    }

    fn on_asset_failed(&self, url: &str, error: &str) {
        self.bar.println(format!("  {} {url}: {error}", style("✘").red()));
    }

    fn on_install_complete(&self, _stats: &InstallStats) {
        self.bar.finish_and_clear();
    }
}

impl Drop for CliProgress {
    fn drop(&mut self) {
        if !self.bar.is_finished() {
            self.bar.abandon();
        }
    }
}

/// Prints a summary of a finished install.
pub fn print_summary(stats: &InstallStats) {
    println!("\n{SEPARATOR}");
    println!("Install Summary");
    println!("{SEPARATOR}");
    println!("  Cache:        {}", stats.cache_name);
    println!("  Assets:       {}", stats.assets);
    println!("  Total size:   {}", format_bytes(stats.total_bytes));
    println!("  Total time:   {:.1}s", stats.elapsed.as_secs_f64());
    println!("{SEPARATOR}");
}
