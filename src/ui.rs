//! Terminal rendering of a session's progress.
//!
//! [`SessionProgress`] draws an `indicatif` bar for stage fractions and
//! prints one coloured line per job result above it.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::progress::{ProgressEvent, ProgressStream};
use crate::quota::QuotaAccount;
use crate::state_machine::JobOutcome;

const BAR_LENGTH: u64 = 1000;

pub struct SessionProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl SessionProgress {
    pub fn start(label: &str) -> Self {
        let pb = ProgressBar::new(BAR_LENGTH);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.cyan} [{bar:30.cyan/blue}] {percent:>3}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        pb.set_message(label.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    pub fn render(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Stage { name, fraction } => {
                self.pb
                    .set_position((fraction.clamp(0.0, 1.0) * BAR_LENGTH as f64) as u64);
                self.pb.set_message(name.clone());
            }
            ProgressEvent::JobResult { outcome } => {
                let mark = if outcome.success {
                    self.green.apply_to("✓")
                } else {
                    self.red.apply_to("✗")
                };
                self.pb.println(format!("  {mark} {}", describe_outcome(outcome)));
            }
            ProgressEvent::Completed { summary } => {
                self.pb.set_position(BAR_LENGTH);
                self.pb.finish_and_clear();
                println!("  {} {}", self.green.apply_to("✓"), summary.message);
                if let Some(reason) = &summary.halted {
                    println!("  {} {reason}", self.yellow.apply_to("!"));
                }
            }
            ProgressEvent::Failed { error } => {
                self.pb.abandon();
                println!("  {} Session failed: {error}", self.red.apply_to("✗"));
            }
        }
    }

    /// Renders `stream` until its terminal event and returns that event.
    pub async fn drive(self, mut stream: ProgressStream) -> Option<ProgressEvent> {
        while let Some(event) = stream.next().await {
            self.render(&event);
            if event.is_terminal() {
                return Some(event);
            }
        }
        self.pb.abandon();
        None
    }
}

fn describe_outcome(outcome: &JobOutcome) -> String {
    let mut line = outcome.title.clone();
    if !outcome.company.is_empty() {
        line.push_str(&format!(" @ {}", outcome.company));
    }
    format!("{line} [{}]: {}", outcome.stage, outcome.message)
}

pub fn print_balances(accounts: &[QuotaAccount]) {
    let dim = Style::new().dim();
    println!();
    println!("{}", dim.apply_to("─── Quota ───"));
    for account in accounts {
        println!("  {:<20} {:?} {:>8}", account.id, account.plan, account.remaining);
    }
}
