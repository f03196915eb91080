//! Status events posted by a running graph and the loop that watches them

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, info};
use tokio::sync::mpsc;

use super::state::LifecycleState;
use crate::error::RuntimeError;

/// Informational events that never end the watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    StateChanged {
        from: LifecycleState,
        to: LifecycleState,
    },
    /// A source began producing
    StreamStart { stage: String },
    /// A sink consumed end-of-stream; the graph-level EndOfStream follows once all sinks did
    SinkEos { stage: String },
}

/// Immutable record posted asynchronously by the graph
#[derive(Debug, Clone)]
pub enum StatusEvent {
    EndOfStream,
    Error(RuntimeError),
    Other(Notice),
}

/// Why the watch ended
#[derive(Debug, Clone)]
pub enum Termination {
    /// EndOfStream reached: every sink drained
    Graceful,
    Fatal(RuntimeError),
}

impl Termination {
    pub fn is_graceful(&self) -> bool {
        matches!(self, Termination::Graceful)
    }
}

/// Outcome of looking at one event
#[derive(Debug, Clone)]
pub enum Verdict {
    Continue,
    Terminate(Termination),
}

/// Map a status event to continue / graceful stop / fatal error
pub fn classify(event: StatusEvent) -> Verdict {
    match event {
        StatusEvent::EndOfStream => Verdict::Terminate(Termination::Graceful),
        StatusEvent::Error(err) => Verdict::Terminate(Termination::Fatal(err)),
        StatusEvent::Other(_) => Verdict::Continue,
    }
}

/// Tracks which sinks have drained and posts EndOfStream exactly once
#[derive(Debug)]
struct EosAggregator {
    sinks: HashSet<String>,
    reached: Mutex<HashSet<String>>,
    posted: AtomicBool,
}

/// Posting side of the bus, cloned into every stage task
#[derive(Debug, Clone)]
pub struct BusPoster {
    tx: mpsc::UnboundedSender<StatusEvent>,
    eos: Arc<EosAggregator>,
}

impl BusPoster {
    pub fn post(&self, event: StatusEvent) {
        // The monitor may already have exited; late events are dropped.
        let _ = self.tx.send(event);
    }

    pub fn post_error(&self, err: RuntimeError) {
        self.post(StatusEvent::Error(err));
    }

    pub fn state_changed(&self, from: LifecycleState, to: LifecycleState) {
        self.post(StatusEvent::Other(Notice::StateChanged { from, to }));
    }

    pub fn stream_start(&self, stage: &str) {
        self.post(StatusEvent::Other(Notice::StreamStart {
            stage: stage.to_string(),
        }));
    }

    pub fn sink_eos(&self, stage: &str) {
        self.post(StatusEvent::Other(Notice::SinkEos {
            stage: stage.to_string(),
        }));

        let all_drained = {
            let mut reached = match self.eos.reached.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            reached.insert(stage.to_string());
            self.eos.sinks.iter().all(|s| reached.contains(s))
        };
        if all_drained && !self.eos.posted.swap(true, Ordering::AcqRel) {
            self.post(StatusEvent::EndOfStream);
        }
    }
}

/// Create a bus for a graph whose terminal stages are `sinks`
pub fn bus(sinks: impl IntoIterator<Item = String>) -> (BusPoster, EventMonitor) {
    let (tx, rx) = mpsc::unbounded_channel();
    let poster = BusPoster {
        tx,
        eos: Arc::new(EosAggregator {
            sinks: sinks.into_iter().collect(),
            reached: Mutex::new(HashSet::new()),
            posted: AtomicBool::new(false),
        }),
    };
    (poster, EventMonitor { rx })
}

/// Single consumer of the status-event stream
///
/// `watch` consumes the monitor, so it can never be re-armed after a
/// terminal classification.
pub struct EventMonitor {
    rx: mpsc::UnboundedReceiver<StatusEvent>,
}

impl EventMonitor {
    /// Receive events in emission order until EndOfStream or Error
    pub async fn watch(mut self) -> Termination {
        while let Some(event) = self.rx.recv().await {
            match &event {
                StatusEvent::Other(notice) => debug!("bus: {:?}", notice),
                StatusEvent::EndOfStream => info!("bus: end of stream reached"),
                StatusEvent::Error(err) => {
                    error!("bus: error from {}", err);
                    if let Some(debug) = &err.debug {
                        error!("bus: debug info: {}", debug);
                    }
                }
            }

            if let Verdict::Terminate(termination) = classify(event) {
                return termination;
            }
        }

        // Every poster is gone but nothing terminal was seen
        let err = RuntimeError {
            stage: "bus".to_string(),
            message: "status stream closed without end-of-stream".to_string(),
            debug: None,
        };
        error!("bus: {}", err.message);
        Termination::Fatal(err)
    }
}
