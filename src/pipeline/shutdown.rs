//! Turns an interrupt into a single graceful end-of-stream request

use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::lifecycle::{EosRequest, PipelineRef};

/// What a shutdown request did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// End-of-stream was injected
    Initiated,
    /// An earlier request already did so
    AlreadyInFlight,
    /// The pipeline was not Running; nothing was sent
    NotRunning,
    /// The pipeline has been released
    PipelineGone,
}

/// Listens for interrupts for the lifetime of one pipeline
///
/// The first interrupt while Running injects end-of-stream; later ones are
/// no-ops, so a second Ctrl+C never turns a graceful drain into an abort.
pub struct ShutdownCoordinator {
    pipeline: PipelineRef,
    scope: CancellationToken,
    fired: AtomicBool,
}

impl ShutdownCoordinator {
    /// `scope` is cancelled by the owner once the pipeline has stopped
    pub fn new(pipeline: PipelineRef, scope: CancellationToken) -> Self {
        Self {
            pipeline,
            scope,
            fired: AtomicBool::new(false),
        }
    }

    /// Handle one interrupt
    pub async fn request(&self) -> ShutdownOutcome {
        if self.fired.load(Ordering::Acquire) {
            debug!("shutdown: already in flight, ignoring interrupt");
            return ShutdownOutcome::AlreadyInFlight;
        }

        match self.pipeline.send_eos().await {
            EosRequest::Injected => {
                self.fired.store(true, Ordering::Release);
                info!("shutdown: interrupt received, sending end-of-stream");
                ShutdownOutcome::Initiated
            }
            EosRequest::AlreadyInjected => {
                self.fired.store(true, Ordering::Release);
                ShutdownOutcome::AlreadyInFlight
            }
            EosRequest::Ignored(state) => {
                warn!("shutdown: pipeline is {}, interrupt ignored", state);
                ShutdownOutcome::NotRunning
            }
            EosRequest::Released => ShutdownOutcome::PipelineGone,
        }
    }

    /// Serve interrupts from `interrupts` until the scope ends
    pub fn spawn(self, mut interrupts: mpsc::UnboundedReceiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.scope.cancelled() => break,
                    received = interrupts.recv() => {
                        if received.is_none() {
                            break;
                        }
                        if self.request().await == ShutdownOutcome::PipelineGone {
                            break;
                        }
                    }
                }
            }
            debug!("shutdown: listener finished");
        })
    }
}
