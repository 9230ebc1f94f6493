//! Progress bar and summary reporting for CLI fetches.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::fetcher::DownloadProgress;
use crate::format::{format_bytes, format_duration, format_progress};
use crate::stats::{FetchStats, ProgressState};

const SEPARATOR: &str = "────────────────────────────────────────────────────────────";

/// Creates a progress bar for a download of known size.
pub fn make_progress_bar(size: u64, name: &str) -> ProgressBar {
    let bar = ProgressBar::new(size);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} [{bar:40.cyan/blue}] {bytes}/{total_bytes} @ {bytes_per_sec} - {msg}",
        )
        .expect("progress template is valid")
        .progress_chars("━━╌"),
    );
    bar.set_message(name.to_string());
    bar
}

/// Creates a spinner for a download without a declared length.
pub fn make_spinner(name: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {bytes} @ {bytes_per_sec} - {msg}")
            .expect("spinner template is valid"),
    );
    bar.set_message(name.to_string());
    bar
}

/// Short display name for a URL: its last path segment.
fn display_name(url: &str) -> &str {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(url)
}

/// Renders fetch progress on the terminal.
#[derive(Default)]
pub struct CliProgress {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliProgress {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        if let Some(bar) = self.bar.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            f(bar);
        }
    }

    fn take_bar(&self) -> Option<ProgressBar> {
        self.bar.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl DownloadProgress for CliProgress {
    fn on_start(&self, url: &str, total: Option<u64>) {
        let name = display_name(url);
        let bar = total.map_or_else(|| make_spinner(name), |size| make_progress_bar(size, name));
        bar.enable_steady_tick(Duration::from_millis(250));
        *self.bar.lock().unwrap_or_else(PoisonError::into_inner) = Some(bar);
    }

    fn on_progress(&self, url: &str, progress: &ProgressState, _speed: u64) {
        self.with_bar(|bar| {
            bar.set_position(progress.received);
            bar.set_message(format!("{} {}", display_name(url), format_progress(progress)));
        });
    }

    fn on_cache_hit(&self, url: &str, size: u64) {
        println!(
            "  {} {} ({})",
            style("cached").green(),
            display_name(url),
            format_bytes(size)
        );
    }

    fn on_complete(&self, _url: &str, _stats: &FetchStats) {
        if let Some(bar) = self.take_bar() {
            bar.finish_and_clear();
        }
    }

    fn on_error(&self, url: &str, error: &str) {
        if let Some(bar) = self.take_bar() {
            bar.abandon();
        }
        eprintln!("  {} {}: {error}", style("failed").red(), display_name(url));
    }
}

/// Prints a summary of one fetch.
pub fn print_summary(url: &str, stats: &FetchStats) {
    println!("\n{SEPARATOR}");
    println!("{}", style("Fetch Summary").bold());
    println!("{SEPARATOR}");
    println!("  URL:               {url}");
    println!("  Size:              {}", format_bytes(stats.size));
    if stats.from_cache {
        println!("  Source:            cache");
    } else {
        println!("  Source:            network");
        println!("  Total time:        {}", format_duration(stats.elapsed));
        println!("  Average speed:     {}/s", format_bytes(stats.average_speed));
        println!("  Peak speed:        {}/s", format_bytes(stats.peak_speed));
    }
    println!("{SEPARATOR}");
}
