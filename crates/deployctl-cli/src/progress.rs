//! Progress reporting module with TTY detection.
//!
//! Provides a live view over a running task's `ConsoleMsg` stream: a
//! multi-line progress display in TTY mode, plain `eprintln!` lines
//! otherwise.

use std::collections::HashMap;

use deployctl_core::types::{ConsoleMsg, StepStatus};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

/// Detects whether stdout is connected to a TTY.
pub fn is_tty() -> bool {
    atty::is(atty::Stream::Stdout)
}

const STAGE_NAMES: [&str; 7] = [
    "local",
    "prev-deploy",
    "deploy",
    "post-deploy",
    "pre-release",
    "release",
    "post-release",
];

fn stage_name(step: u8) -> &'static str {
    STAGE_NAMES.get(step as usize).copied().unwrap_or("unknown")
}

fn target_label(server_id: i64) -> String {
    if server_id == 0 {
        "local".to_string()
    } else {
        format!("server-{server_id}")
    }
}

/// Tails a task's `ConsoleMsg` stream, showing one progress line per target
/// in TTY mode and falling back to plain lines when not in a TTY.
pub struct DeployProgress {
    is_tty: bool,
    multi: Option<MultiProgress>,
    bars: HashMap<i64, ProgressBar>,
}

impl DeployProgress {
    pub fn new() -> Self {
        let is_tty = is_tty();
        Self {
            is_tty,
            multi: is_tty.then(MultiProgress::new),
            bars: HashMap::new(),
        }
    }

    fn bar_for(&mut self, server_id: i64) -> &ProgressBar {
        let multi = self.multi.as_ref().expect("bar_for requires TTY mode");
        self.bars.entry(server_id).or_insert_with(|| {
            let pb = multi.add(ProgressBar::new_spinner());
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            pb
        })
    }

    /// Renders one `ConsoleMsg` as it arrives.
    pub fn on_message(&mut self, msg: &ConsoleMsg) {
        let label = target_label(msg.server_id);
        let stage = stage_name(msg.step);
        if self.is_tty {
            let pb = self.bar_for(msg.server_id);
            match msg.status {
                StepStatus::Running => pb.set_message(format!("[{label}] {stage}: running")),
                StepStatus::Success => pb.set_message(format!("[{label}] {stage}: ok")),
                StepStatus::Failed => pb.set_message(format!("[{label}] {stage}: failed")),
            }
            if !msg.data.is_empty() {
                pb.println(format!("[{label}] {}", msg.data.trim_end()));
            }
        } else {
            eprintln!("[{label}] {stage}: {}", msg.data.trim_end());
        }
    }

    pub fn finish(self) {
        if let Some(multi) = self.multi {
            for (_, pb) in self.bars {
                pb.finish();
            }
            let _ = multi.clear();
        }
    }
}

impl Default for DeployProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use deployctl_core::types::ConsoleMsg;

    use super::*;

    #[test]
    fn is_tty_returns_bool() {
        let _ = is_tty();
    }

    #[test]
    fn stage_name_covers_known_steps() {
        assert_eq!(stage_name(0), "local");
        assert_eq!(stage_name(5), "release");
        assert_eq!(stage_name(99), "unknown");
    }

    #[test]
    fn target_label_distinguishes_local_from_servers() {
        assert_eq!(target_label(0), "local");
        assert_eq!(target_label(3), "server-3");
    }

    #[test]
    fn non_tty_progress_does_not_panic_on_message() {
        let mut progress = DeployProgress {
            is_tty: false,
            multi: None,
            bars: HashMap::new(),
        };
        progress.on_message(&ConsoleMsg {
            server_id: 1,
            step: 4,
            status: StepStatus::Running,
            data: "uploading release.tar.gz\n".into(),
        });
        progress.finish();
    }
}
