//! Terminal rendering of download events.

use console::style;
use indicatif::{HumanBytes, HumanDuration, ProgressBar, ProgressStyle};
use rangeget::{DownloadEvent, DownloadEvents, StartInfo, Summary};

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";
const SPINNER_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] {bytes} ({bytes_per_sec})";

/// Renders events as a progress bar.
pub struct ProgressDisplay {
    bar: ProgressBar,
    quiet: bool,
}

impl ProgressDisplay {
    pub fn new(quiet: bool) -> Self {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new_spinner()
        };
        Self { bar, quiet }
    }

    /// Consume events until the download is disposed.
    pub async fn consume(self, mut events: DownloadEvents) {
        while let Some(event) = events.recv().await {
            match event {
                DownloadEvent::Started(info) => self.on_started(&info),
                DownloadEvent::Progress(progress) => self.bar.set_position(progress.completed),
                // Terminal errors are printed once the run returns
                DownloadEvent::Error(error) if error.is_recoverable() => {
                    self.bar
                        .println(format!("{}: {}", style("retrying").yellow(), error));
                }
                DownloadEvent::Error(_) => {}
                DownloadEvent::Completed(_) => self.bar.finish_and_clear(),
                DownloadEvent::Disposed => break,
            }
        }
        if !self.bar.is_finished() {
            self.bar.abandon();
        }
    }

    fn on_started(&self, info: &StartInfo) {
        let template = match info.file_size {
            Some(size) => {
                self.bar.set_length(size);
                BAR_TEMPLATE
            }
            None => SPINNER_TEMPLATE,
        };
        if let Ok(bar_style) = ProgressStyle::with_template(template) {
            self.bar.set_style(bar_style.progress_chars("#>-"));
        }
        self.bar.set_position(info.completed);

        if !self.quiet {
            let resumed = if info.resumed {
                format!(" (resuming at {})", HumanBytes(info.completed))
            } else {
                String::new()
            };
            self.bar.println(format!(
                "Saving to {} over {} connection{}{}",
                style(info.path.display()).bold(),
                info.connections,
                if info.connections == 1 { "" } else { "s" },
                resumed
            ));
        }
    }
}

/// One-line report of a finished download.
pub fn summary_line(summary: &Summary) -> String {
    format!(
        "{} {} ({}) in {} at {}/s",
        style("Saved").green().bold(),
        summary.path.display(),
        HumanBytes(summary.bytes),
        HumanDuration(summary.elapsed),
        HumanBytes(summary.bytes_per_second())
    )
}
