//! Live transfer progress.
//!
//! Transfers report through a cloneable [`ProgressSender`]; a single consumer
//! task folds the events into a [`ProgressAggregate`] and drives the progress
//! bar. Nothing here affects what gets transferred.

use std::collections::HashMap;
use std::io::IsTerminal;
use std::sync::{Arc, Mutex, PoisonError};

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Started { key: String, size_bytes: u64 },
    Transferred { key: String, bytes: u64 },
    /// The file was already in place; counted as a full transfer.
    AlreadyPresent { key: String, size_bytes: u64 },
    Completed { key: String },
    Failed { key: String, size_bytes: u64 },
}

/// Counters for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressAggregate {
    pub total_objects: u64,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub active: u64,
    pub completed: u64,
    pub already_present: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct ProgressState {
    aggregate: ProgressAggregate,
    /// Bytes received so far for each in-flight key.
    in_flight: HashMap<String, u64>,
}

impl ProgressState {
    fn apply(&mut self, event: ProgressEvent) {
        let agg = &mut self.aggregate;
        match event {
            ProgressEvent::Started { key, .. } => {
                if self.in_flight.insert(key, 0).is_none() {
                    agg.active += 1;
                }
            }
            ProgressEvent::Transferred { key, bytes } => {
                agg.transferred_bytes += bytes;
                *self.in_flight.entry(key).or_insert(0) += bytes;
            }
            ProgressEvent::AlreadyPresent { key, size_bytes } => {
                if self.in_flight.remove(&key).is_some() {
                    agg.active = agg.active.saturating_sub(1);
                }
                agg.transferred_bytes += size_bytes;
                agg.already_present += 1;
            }
            ProgressEvent::Completed { key } => {
                if self.in_flight.remove(&key).is_some() {
                    agg.active = agg.active.saturating_sub(1);
                }
                agg.completed += 1;
            }
            ProgressEvent::Failed { key, size_bytes } => {
                if let Some(partial) = self.in_flight.remove(&key) {
                    agg.active = agg.active.saturating_sub(1);
                    agg.transferred_bytes = agg.transferred_bytes.saturating_sub(partial);
                }
                agg.total_bytes = agg.total_bytes.saturating_sub(size_bytes);
                agg.failed += 1;
            }
        }
    }
}

/// Handle transfers use to report progress.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ProgressSender {
    pub fn send(&self, event: ProgressEvent) {
        // The tracker outlives every transfer; a closed channel only means
        // reporting is over.
        let _ = self.tx.send(event);
    }
}

/// Create a progress bar measured in bytes.
///
/// Returns `ProgressBar::hidden()` when the bar is disabled or stdout is not
/// a TTY, so cron and piped runs get clean log output.
pub fn create_progress_bar(no_progress_bar: bool, total_bytes: u64) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total_bytes);
    pb.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}",
        )
        .expect("valid template")
        .progress_chars("=> "),
    );
    pb
}

/// Owns the consumer task and the bar for one batch.
pub struct ProgressTracker {
    sender: ProgressSender,
    state: Arc<Mutex<ProgressState>>,
    bar: ProgressBar,
    consumer: JoinHandle<()>,
}

impl ProgressTracker {
    pub fn start(total_objects: u64, total_bytes: u64, no_progress_bar: bool) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bar = create_progress_bar(no_progress_bar, total_bytes);
        let state = Arc::new(Mutex::new(ProgressState {
            aggregate: ProgressAggregate {
                total_objects,
                total_bytes,
                ..Default::default()
            },
            in_flight: HashMap::new(),
        }));

        let consumer_state = state.clone();
        let consumer_bar = bar.clone();
        let consumer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let agg = {
                    let mut state = consumer_state
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    state.apply(event);
                    state.aggregate.clone()
                };
                consumer_bar.set_length(agg.total_bytes);
                consumer_bar.set_position(agg.transferred_bytes);
                consumer_bar.set_message(format!(
                    "{} done, {} active, {} failed",
                    agg.completed + agg.already_present,
                    agg.active,
                    agg.failed
                ));
            }
        });

        Self {
            sender: ProgressSender { tx },
            state,
            bar,
            consumer,
        }
    }

    pub fn sender(&self) -> ProgressSender {
        self.sender.clone()
    }

    /// Run `f` with the bar hidden, so log lines are not garbled by redraws.
    pub fn suspend<F: FnOnce() -> R, R>(&self, f: F) -> R {
        self.bar.suspend(f)
    }

    /// Drain outstanding events and clear the bar.
    ///
    /// Every other sender clone must already be dropped, or this waits for
    /// them.
    pub async fn finish(self) -> ProgressAggregate {
        let Self {
            sender,
            state,
            bar,
            consumer,
        } = self;
        drop(sender);
        if let Err(e) = consumer.await {
            tracing::warn!("Progress consumer ended abnormally: {}", e);
        }
        bar.finish_and_clear();
        let agg = state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .aggregate
            .clone();
        agg
    }
}
