//! Lifecycle controller: drives a built graph to Running and tears it down
//!
//! The controller holds the only strong reference to the pipeline's shared
//! control block for as long as the graph is active. Other components get a
//! [`PipelineRef`], which never keeps the pipeline alive on its own.

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use futures_util::future::join_all;
use log::{debug, error, info, warn};
use tokio::sync::{Mutex, MutexGuard, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use super::bus::{self, BusPoster, EventMonitor, Termination};
use super::graph::Graph;
use super::health::{HealthSummary, StageHealth};
use super::stage::{InputPad, OutputPad, StageContext, link_channel};
use super::state::LifecycleState;
use crate::error::{LinkClosed, RuntimeError, StartFailure};

/// How long a graceful drain may take before stages are torn down
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Control block shared between the controller and non-owning handles
struct PipelineShared {
    /// Held for the whole duration of every state change
    state: Mutex<LifecycleState>,
    observed: watch::Sender<LifecycleState>,
    /// Cancelled to inject end-of-stream at every source
    eos: CancellationToken,
    /// Cancelled for forced teardown
    kill: CancellationToken,
    bus: BusPoster,
}

impl PipelineShared {
    fn transition(&self, state: &mut MutexGuard<'_, LifecycleState>, to: LifecycleState) -> bool {
        let from = **state;
        if from == to {
            return true;
        }
        if !from.can_transition_to(&to) {
            warn!("pipeline: refusing transition {} -> {}", from, to);
            return false;
        }
        **state = to;
        self.observed.send_replace(to);
        self.bus.state_changed(from, to);
        info!("pipeline: {} -> {}", from, to);
        true
    }
}

/// Result of asking the pipeline to inject end-of-stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EosRequest {
    Injected,
    /// End-of-stream was already injected earlier
    AlreadyInjected,
    /// The pipeline is not Running
    Ignored(LifecycleState),
    /// The controller has already released the pipeline
    Released,
}

/// Non-owning handle to a started pipeline
///
/// The default handle is detached and behaves like a released pipeline.
#[derive(Clone, Default)]
pub struct PipelineRef {
    inner: Weak<PipelineShared>,
}

impl PipelineRef {
    /// Current state, `None` once the pipeline has been released
    pub fn state(&self) -> Option<LifecycleState> {
        self.inner.upgrade().map(|shared| *shared.observed.borrow())
    }

    /// Watch state changes
    pub fn subscribe(&self) -> Option<watch::Receiver<LifecycleState>> {
        self.inner.upgrade().map(|shared| shared.observed.subscribe())
    }

    /// Inject end-of-stream at the source end of a Running pipeline
    pub async fn send_eos(&self) -> EosRequest {
        let Some(shared) = self.inner.upgrade() else {
            return EosRequest::Released;
        };
        let state = shared.state.lock().await;
        if !state.is_running() {
            return EosRequest::Ignored(*state);
        }
        if shared.eos.is_cancelled() {
            return EosRequest::AlreadyInjected;
        }
        shared.eos.cancel();
        info!("pipeline: end-of-stream injected at the sources");
        EosRequest::Injected
    }
}

/// Owns a running graph from start until it is Stopped and released
pub struct LifecycleController {
    /// Keep-alive for the running lifetime; taken exactly once by `release`
    shared: Option<Arc<PipelineShared>>,
    playing: watch::Sender<bool>,
    tasks: Vec<(String, JoinHandle<()>)>,
    health: BTreeMap<String, Arc<StageHealth>>,
    started_at: Option<Instant>,
}

impl LifecycleController {
    /// Drive `graph` through Ready and Paused to Running
    ///
    /// Returns the controller and the single monitor for the graph's status
    /// events. On failure every acquired resource is dropped and the graph
    /// ends in Stopped.
    pub async fn start(graph: Graph) -> Result<(Self, EventMonitor), StartFailure> {
        let sinks: Vec<String> = graph.sinks().into_iter().map(str::to_string).collect();
        let (poster, monitor) = bus::bus(sinks);
        let (observed, _) = watch::channel(LifecycleState::Built);
        let (playing, _) = watch::channel(false);

        let shared = Arc::new(PipelineShared {
            state: Mutex::new(LifecycleState::Built),
            observed,
            eos: CancellationToken::new(),
            kill: CancellationToken::new(),
            bus: poster,
        });

        let mut controller = Self {
            shared: Some(shared.clone()),
            playing,
            tasks: Vec::new(),
            health: BTreeMap::new(),
            started_at: None,
        };

        let mut state = shared.state.lock().await;
        shared.transition(&mut state, LifecycleState::Ready);

        if let Err(failure) = controller.launch(&shared, graph).await {
            error!("pipeline: {}", failure);
            shared.kill.cancel();
            shared.transition(&mut state, LifecycleState::Stopping);
            shared.transition(&mut state, LifecycleState::Stopped);
            return Err(failure);
        }
        shared.transition(&mut state, LifecycleState::Paused);

        controller.playing.send_replace(true);
        shared.transition(&mut state, LifecycleState::Running);
        controller.started_at = Some(Instant::now());
        drop(state);

        Ok((controller, monitor))
    }

    /// Acquire stage resources, wire links into channels and spawn stage tasks
    async fn launch(&mut self, shared: &Arc<PipelineShared>, graph: Graph) -> Result<(), StartFailure> {
        let (mut entries, links, order) = graph.into_parts();

        // Downstream stages first, so sinks are ready before data can arrive
        for &i in order.iter().rev() {
            let entry = &mut entries[i];
            if let Err(e) = entry.stage.prepare().await {
                return Err(StartFailure::Stage {
                    stage: entry.name.clone(),
                    reason: format!("{:#}", e),
                });
            }
        }

        let mut inputs: HashMap<String, Vec<InputPad>> = HashMap::new();
        let mut outputs: HashMap<String, Vec<OutputPad>> = HashMap::new();
        for link in &links {
            let src = entries.iter().find(|e| e.name == link.src.stage);
            let sink = entries.iter().find(|e| e.name == link.sink.stage);
            let (Some(src), Some(sink)) = (src, sink) else {
                continue;
            };
            let src_template = src.ports.iter().find(|p| p.name == link.src.port).map(|p| &p.template);
            let role = sink
                .ports
                .iter()
                .find(|p| p.name == link.sink.port)
                .and_then(|p| p.template.role);
            let capacity = match src_template {
                Some(template) => src.stage.link_capacity(template),
                None => continue,
            };

            let (tx, rx) = link_channel(capacity);
            outputs
                .entry(link.src.stage.clone())
                .or_default()
                .push(OutputPad::new(link.src.port.clone(), tx));
            inputs
                .entry(link.sink.stage.clone())
                .or_default()
                .push(InputPad::new(link.sink.port.clone(), role, rx));
            debug!("pipeline: wired {} ({:?})", link, capacity);
        }

        for entry in entries {
            let name = entry.name;
            let mut stage = entry.stage;
            let kind = stage.kind();
            let health = Arc::new(StageHealth::new());
            self.health.insert(name.clone(), health.clone());

            let ctx = StageContext::new(
                name.clone(),
                inputs.remove(&name).unwrap_or_default(),
                outputs.remove(&name).unwrap_or_default(),
                shared.eos.clone(),
                self.playing.subscribe(),
                health.clone(),
                shared.bus.clone(),
            );
            let kill = shared.kill.clone();
            let bus = shared.bus.clone();
            let task_name = name.clone();

            let handle = tokio::spawn(async move {
                let outcome = tokio::select! {
                    biased;
                    _ = kill.cancelled() => {
                        debug!("{}: torn down", task_name);
                        return;
                    }
                    outcome = AssertUnwindSafe(stage.run(ctx)).catch_unwind() => outcome,
                };

                match outcome {
                    Ok(Ok(())) if health.eos_reached() => debug!("{}: finished", task_name),
                    Ok(Ok(())) => {
                        if !kill.is_cancelled() {
                            warn!("{}: stopped before end-of-stream", task_name);
                            bus.post_error(RuntimeError {
                                stage: task_name,
                                message: "stopped before end-of-stream".to_string(),
                                debug: None,
                            });
                        }
                    }
                    // The neighbour that went away reports its own cause
                    Ok(Err(e)) if e.downcast_ref::<LinkClosed>().is_some() => {
                        debug!("{}: {}", task_name, e);
                    }
                    Ok(Err(e)) => {
                        error!("{} ({}) failed: {:#}", task_name, kind, e);
                        bus.post_error(RuntimeError::from_stage(&task_name, &e));
                    }
                    Err(_) => {
                        error!("{} ({}) panicked", task_name, kind);
                        bus.post_error(RuntimeError {
                            stage: task_name,
                            message: "stage panicked".to_string(),
                            debug: None,
                        });
                    }
                }
            });
            self.tasks.push((name, handle));
        }

        info!("pipeline: {} stage tasks spawned", self.tasks.len());
        Ok(())
    }

    fn shared(&self) -> Option<&Arc<PipelineShared>> {
        self.shared.as_ref()
    }

    /// Non-owning handle for the monitor, the shutdown coordinator and others
    pub fn pipeline(&self) -> PipelineRef {
        PipelineRef {
            inner: self.shared().map(Arc::downgrade).unwrap_or_default(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.shared()
            .map(|shared| *shared.observed.borrow())
            .unwrap_or(LifecycleState::Stopped)
    }

    /// Time spent since reaching Running
    pub fn running_duration(&self) -> Option<Duration> {
        self.started_at.map(|t| t.elapsed())
    }

    /// Running → Paused: sources hold back further data
    pub async fn pause(&self) -> bool {
        self.set_playing(false, LifecycleState::Paused).await
    }

    /// Paused → Running
    pub async fn play(&self) -> bool {
        self.set_playing(true, LifecycleState::Running).await
    }

    async fn set_playing(&self, playing: bool, target: LifecycleState) -> bool {
        let Some(shared) = self.shared() else {
            return false;
        };
        let mut state = shared.state.lock().await;
        if !state.is_active() || !shared.transition(&mut state, target) {
            return false;
        }
        self.playing.send_replace(playing);
        true
    }

    /// Tear down according to how the watch ended
    pub async fn shutdown(&mut self, termination: &Termination) {
        match termination {
            Termination::Graceful => self.drain().await,
            Termination::Fatal(_) => self.stop().await,
        }
    }

    /// Wait for stages that already saw end-of-stream to finish, then Stopped
    async fn drain(&mut self) {
        let Some(shared) = self.shared().cloned() else {
            return;
        };
        let mut state = shared.state.lock().await;
        if !shared.transition(&mut state, LifecycleState::Stopping) {
            return;
        }

        let tasks = std::mem::take(&mut self.tasks);
        let (names, handles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();

        // One join future for both phases: a finished JoinHandle must not be polled again
        let mut joined = std::pin::pin!(join_all(handles));
        let results = match tokio::time::timeout(DRAIN_TIMEOUT, &mut joined).await {
            Ok(results) => results,
            Err(_) => {
                warn!("pipeline: drain timed out after {:?}, tearing down", DRAIN_TIMEOUT);
                shared.kill.cancel();
                joined.await
            }
        };
        Self::report_panics(names, results);

        self.playing.send_replace(false);
        shared.transition(&mut state, LifecycleState::Stopped);
        self.log_health();
    }

    /// Force Running → Stopped without waiting for end-of-stream
    pub async fn stop(&mut self) {
        let Some(shared) = self.shared().cloned() else {
            return;
        };
        let mut state = shared.state.lock().await;
        if *state == LifecycleState::Stopped || !shared.transition(&mut state, LifecycleState::Stopping) {
            return;
        }

        shared.kill.cancel();
        let tasks = std::mem::take(&mut self.tasks);
        let (names, handles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();
        Self::report_panics(names, join_all(handles).await);

        self.playing.send_replace(false);
        shared.transition(&mut state, LifecycleState::Stopped);
        self.log_health();
    }

    fn report_panics(names: Vec<String>, results: Vec<Result<(), JoinError>>) {
        for (name, result) in names.into_iter().zip(results) {
            if let Err(e) = result
                && e.is_panic()
            {
                error!("{}: stage task panicked", name);
            }
        }
    }

    fn log_health(&self) {
        for (name, health) in &self.health {
            info!("{}: {}", name, health.summary());
        }
    }

    /// Counters of one stage
    pub fn stage_health(&self, stage: &str) -> Option<HealthSummary> {
        self.health.get(stage).map(|h| h.summary())
    }

    /// Drop the keep-alive reference; call once the pipeline is Stopped
    pub fn release(mut self) -> BTreeMap<String, HealthSummary> {
        if let Some(shared) = self.shared.take() {
            let state = *shared.observed.borrow();
            if state != LifecycleState::Stopped {
                warn!("pipeline: released while {}, tearing down", state);
                shared.kill.cancel();
            }
        }
        self.health
            .iter()
            .map(|(name, health)| (name.clone(), health.summary()))
            .collect()
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.kill.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::builder::GraphBuilder;
    use crate::pipeline::registry::StageRegistry;

    fn appsrc_to_file(registry: &StageRegistry, location: &str) -> Graph {
        let mut builder = GraphBuilder::new(registry);
        builder.add_many(&[("appsrc", "src"), ("filesink", "sink")]).unwrap();
        builder.sink_to("sink", location).unwrap();
        builder.link("src", "sink").unwrap();
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn test_forced_stop_reaches_stopped() {
        let registry = StageRegistry::with_builtin();
        let location = std::env::temp_dir().join(format!("avrecord-lifecycle-{}.out", std::process::id()));
        let graph = appsrc_to_file(&registry, &location.to_string_lossy());

        let (mut controller, _monitor) = LifecycleController::start(graph).await.unwrap();
        let pipeline = controller.pipeline();
        assert_eq!(pipeline.state(), Some(LifecycleState::Running));

        controller.stop().await;
        assert_eq!(controller.state(), LifecycleState::Stopped);
        // Stopping twice is harmless
        controller.stop().await;

        let health = controller.release();
        assert!(!health["sink"].eos_reached);
        assert_eq!(pipeline.state(), None);
        assert_eq!(pipeline.send_eos().await, EosRequest::Released);
        let _ = std::fs::remove_file(location);
    }

    #[tokio::test]
    async fn test_prepare_failure_is_a_start_failure() {
        let registry = StageRegistry::with_builtin();
        let mut builder = GraphBuilder::new(&registry);
        builder
            .add_many(&[("videotestsrc", "camera"), ("filesink", "sink")])
            .unwrap();
        builder.set("camera", "device", "/nonexistent/video7").unwrap();
        builder.sink_to("sink", std::env::temp_dir().join("avrecord-never-written.out")).unwrap();
        builder.link("camera", "sink").unwrap();
        let graph = builder.build().unwrap();

        match LifecycleController::start(graph).await {
            Err(StartFailure::Stage { stage, reason }) => {
                assert_eq!(stage, "camera");
                assert!(reason.contains("cannot open capture device"), "{}", reason);
            }
            Ok(_) => panic!("start should fail"),
        }
    }

    #[tokio::test]
    async fn test_state_changes_are_posted() {
        let registry = StageRegistry::with_builtin();
        let location = std::env::temp_dir().join(format!("avrecord-states-{}.out", std::process::id()));
        let graph = appsrc_to_file(&registry, &location.to_string_lossy());
        let (mut controller, monitor) = LifecycleController::start(graph).await.unwrap();

        assert!(controller.pause().await);
        // Already paused: no-op
        assert!(controller.pause().await);
        assert_eq!(controller.state(), LifecycleState::Paused);
        assert!(matches!(
            controller.pipeline().send_eos().await,
            EosRequest::Ignored(LifecycleState::Paused)
        ));
        assert!(controller.play().await);
        assert_eq!(controller.pipeline().send_eos().await, EosRequest::Injected);
        assert_eq!(controller.pipeline().send_eos().await, EosRequest::AlreadyInjected);

        assert!(monitor.watch().await.is_graceful());
        controller.shutdown(&Termination::Graceful).await;
        assert_eq!(controller.state(), LifecycleState::Stopped);
        let _ = std::fs::remove_file(location);
    }
}
