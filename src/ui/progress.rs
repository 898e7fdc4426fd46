use crate::event::{CounterKind, Event, EventHandler};
use crate::ui::theme;
use crate::ui::Icons;
use indicatif::{HumanDuration, MultiProgress, ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

fn visible(pb: ProgressBar) -> ProgressBar {
    if console::Term::stdout().is_term() {
        pb
    } else {
        ProgressBar::hidden()
    }
}

/// Progress bars for an import run, driven by pipeline events.
///
/// Subscribe it to the run's [`EventDispatcher`](crate::EventDispatcher);
/// it is updated from the dispatcher thread.
pub struct ProgressManager {
    mp: MultiProgress,
    files: ProgressBar,
    features: ProgressBar,
    xlinks: ProgressBar,
    registered: AtomicU64,
    resolved: AtomicU64,
}

impl ProgressManager {
    pub fn new(total_files: usize) -> Self {
        let mp = MultiProgress::new();

        let files = visible(mp.add(ProgressBar::new(total_files as u64).with_message("Importing files")));
        if let Ok(style) = ProgressStyle::default_bar().template("{bar:30.cyan/blue} {pos}/{len} {wide_msg}") {
            files.set_style(style);
        }

        let features = visible(mp.add(ProgressBar::new_spinner().with_message("Features")));
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner} {pos} {msg} ({per_sec})") {
            features.set_style(style);
        }
        features.enable_steady_tick(Duration::from_millis(100));

        let xlinks = visible(mp.add(ProgressBar::new_spinner().with_message("XLinks")));

        Self {
            mp,
            files,
            features,
            xlinks,
            registered: AtomicU64::new(0),
            resolved: AtomicU64::new(0),
        }
    }

    fn update_xlinks(&self) {
        self.xlinks.set_message(format!(
            "XLinks: {} registered, {} resolved",
            self.registered.load(Ordering::Relaxed),
            self.resolved.load(Ordering::Relaxed)
        ));
    }

    pub fn clear(&self) {
        self.mp.clear().ok();
    }

    pub fn finish(&self) {
        self.files.finish_with_message("Done");
        self.features.finish();
        self.xlinks.finish();
        self.clear();
    }

    pub fn finish_with_summary(&self, duration: Duration, files: usize, features: u64, geometries: u64) {
        self.finish();
        println!();
        println!(
            "{} {}",
            Icons::CHECK.style(theme().success.clone()),
            format!("Complete in {}", HumanDuration(duration)).style(theme().success.clone())
        );
        println!(
            "  {} {}  {} {}  {} {}",
            Icons::FILE.style(theme().counter.clone()),
            files,
            Icons::BUILDING.style(theme().counter.clone()),
            features,
            Icons::TRIANGLE.style(theme().counter.clone()),
            geometries
        );
    }
}

impl EventHandler for ProgressManager {
    fn handle_event(&self, event: &Event) {
        match event {
            Event::FeatureCounter(counts) => self.features.inc(counts.values().sum()),
            Event::Counter { kind, value } => match kind {
                CounterKind::File => self.files.inc(*value),
                CounterKind::XlinkRegistered => {
                    self.registered.fetch_add(*value, Ordering::Relaxed);
                    self.update_xlinks();
                }
                CounterKind::XlinkResolved => {
                    self.resolved.fetch_add(*value, Ordering::Relaxed);
                    self.update_xlinks();
                }
            },
            Event::StatusTitle(title) => self.files.set_message(title.clone()),
            Event::StatusMessage(message) => self.xlinks.set_message(message.clone()),
            Event::Interrupt { message, .. } => {
                let message = message.as_deref().unwrap_or("Interrupted");
                self.files.abandon_with_message(message.to_string());
            }
            Event::GeometryCounter(_) => {}
        }
    }
}
