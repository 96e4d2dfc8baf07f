//! Progress reporting for multi-worker builds.
//!
//! Workers never touch the display. They send events over a channel and a
//! single display thread owns the progress bar.

use crossbeam_channel::{unbounded, Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use std::thread::JoinHandle;

/// What a worker reports
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// `n` more units of work are done
    Advance(u64),
    /// A unit finished with a note worth showing (e.g. the year just written)
    Message(String),
}

/// Cloneable handle given to workers
#[derive(Debug, Clone)]
pub struct ProgressSender {
    sender: Sender<ProgressEvent>,
}

impl ProgressSender {
    pub fn advance(&self, n: u64) {
        // the display may already be gone; progress is best effort
        let _ = self.sender.send(ProgressEvent::Advance(n));
    }

    pub fn message(&self, message: impl Into<String>) {
        let _ = self.sender.send(ProgressEvent::Message(message.into()));
    }
}

/// Display thread; `finish` waits for it once all senders are dropped
pub struct ProgressDisplay {
    handle: JoinHandle<u64>,
}

impl ProgressDisplay {
    /// Start a display for `total` units. A hidden bar is used when `show` is false.
    pub fn spawn(total: u64, label: &str, show: bool) -> (ProgressSender, ProgressDisplay) {
        let (sender, receiver) = unbounded();
        let bar = if show {
            let style = ProgressStyle::default_bar()
                .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-");
            let bar = ProgressBar::new(total);
            bar.set_style(style);
            bar
        } else {
            ProgressBar::hidden()
        };
        bar.set_message(label.to_string());

        let handle = std::thread::spawn(move || run_display(receiver, bar));
        (ProgressSender { sender }, ProgressDisplay { handle })
    }

    /// Wait for the display to drain; returns the units reported
    pub fn finish(self) -> u64 {
        self.handle.join().unwrap_or_else(|_| {
            log::warn!("Progress display thread panicked");
            0
        })
    }
}

fn run_display(receiver: Receiver<ProgressEvent>, bar: ProgressBar) -> u64 {
    let mut done = 0;
    for event in receiver {
        match event {
            ProgressEvent::Advance(n) => {
                done += n;
                bar.inc(n);
            }
            ProgressEvent::Message(message) => bar.set_message(message),
        }
    }
    bar.finish();
    done
}
