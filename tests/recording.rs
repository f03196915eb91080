//! End-to-end runs of built graphs: graceful stop, runtime failure, start failure

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use avrecord::config::RecorderConfig;
use avrecord::error::{PropertyError, StartFailure};
use avrecord::pipeline::stage::PortTemplate;
use avrecord::pipeline::{
    Caps, DataItem, Graph, GraphBuilder, LifecycleController, LifecycleState, PipelineStage, PropertyValue,
    ShutdownCoordinator, ShutdownOutcome, StageContext, StageRegistry, Termination,
};
use avrecord::recorder::{self, build_recording_graph};
use avrecord::stages::{AppSource, AppSourceHandle};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const UNIT_SIZE: usize = 100;

fn scratch_dir(test: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("avrecord-{}-{}", test, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// appsrc → videoconvert → videoscale → capsfilter → tee ⇒ 2 × (queue → filesink)
fn tee_graph(registry: &StageRegistry, dir: &Path) -> (Graph, AppSourceHandle) {
    let mut builder = GraphBuilder::new(registry);
    builder
        .add_many(&[
            ("appsrc", "src"),
            ("videoconvert", "convert"),
            ("videoscale", "scale"),
            ("capsfilter", "filter"),
            ("tee", "tee"),
            ("queue", "queue-one"),
            ("queue", "queue-two"),
            ("filesink", "sink-one"),
            ("filesink", "sink-two"),
        ])
        .unwrap();
    builder
        .set("src", "caps", "video/x-raw, width=64, height=48")
        .unwrap();
    builder.set_caps("filter", "video/x-raw, width=64").unwrap();
    builder.sink_to("sink-one", dir.join("fileOne.out")).unwrap();
    builder.sink_to("sink-two", dir.join("fileTwo.out")).unwrap();

    builder.chain(&["src", "convert", "scale", "filter", "tee"]).unwrap();
    let branches = builder.tee("tee", 2).unwrap();
    builder.chain_from(&branches[0], &["queue-one", "sink-one"]).unwrap();
    builder.chain_from(&branches[1], &["queue-two", "sink-two"]).unwrap();

    let graph = builder.build().unwrap();
    let handle = graph.stage_as::<AppSource>("src").unwrap().handle();
    (graph, handle)
}

#[tokio::test]
async fn test_graceful_stop_delivers_every_unit_to_both_files() {
    let dir = scratch_dir("graceful");
    let registry = StageRegistry::with_builtin();
    let (graph, handle) = tee_graph(&registry, &dir);

    let (controller, monitor) = LifecycleController::start(graph).await.unwrap();
    assert_eq!(controller.state(), LifecycleState::Running);

    for i in 0..10u8 {
        assert!(handle.push(vec![i; UNIT_SIZE]));
    }
    let (interrupt_tx, interrupt_rx) = mpsc::unbounded_channel();
    interrupt_tx.send(()).unwrap();

    let report = recorder::supervise(controller, monitor, interrupt_rx).await;
    assert!(report.termination.is_graceful(), "{:?}", report.termination);

    for sink in ["sink-one", "sink-two"] {
        let health = report.health[sink];
        assert_eq!(health.units_processed, 10, "{}", sink);
        assert!(health.eos_reached);
    }

    // Both branches carry every unit, unmodified and in push order
    let expected: Vec<u8> = (0..10u8).flat_map(|i| vec![i; UNIT_SIZE]).collect();
    let one = std::fs::read(dir.join("fileOne.out")).unwrap();
    let two = std::fs::read(dir.join("fileTwo.out")).unwrap();
    assert_eq!(one, expected);
    assert_eq!(one, two);
}

#[tokio::test]
async fn test_repeated_interrupts_are_no_ops() {
    let dir = scratch_dir("repeated");
    let registry = StageRegistry::with_builtin();
    let (graph, handle) = tee_graph(&registry, &dir);
    let (mut controller, monitor) = LifecycleController::start(graph).await.unwrap();

    for i in 0..10u8 {
        handle.push(vec![i; UNIT_SIZE]);
    }

    let coordinator = ShutdownCoordinator::new(controller.pipeline(), CancellationToken::new());
    assert_eq!(coordinator.request().await, ShutdownOutcome::Initiated);
    assert_eq!(coordinator.request().await, ShutdownOutcome::AlreadyInFlight);
    assert_eq!(coordinator.request().await, ShutdownOutcome::AlreadyInFlight);

    let termination = monitor.watch().await;
    assert!(termination.is_graceful());
    controller.shutdown(&termination).await;
    assert_eq!(controller.state(), LifecycleState::Stopped);

    assert_eq!(coordinator.request().await, ShutdownOutcome::AlreadyInFlight);
    let health = controller.release();
    assert_eq!(health["sink-one"].units_processed, 10);
    assert_eq!(health["sink-two"].units_processed, 10);

    // Released pipelines cannot be reached any more
    let late = ShutdownCoordinator::new(avrecord::pipeline::PipelineRef::default(), CancellationToken::new());
    assert_eq!(late.request().await, ShutdownOutcome::PipelineGone);
}

#[tokio::test]
async fn test_interrupt_while_paused_is_ignored() {
    let dir = scratch_dir("paused");
    let registry = StageRegistry::with_builtin();
    let (graph, handle) = tee_graph(&registry, &dir);
    let (mut controller, monitor) = LifecycleController::start(graph).await.unwrap();
    let coordinator = ShutdownCoordinator::new(controller.pipeline(), CancellationToken::new());

    assert!(controller.pause().await);
    assert_eq!(controller.state(), LifecycleState::Paused);
    assert_eq!(coordinator.request().await, ShutdownOutcome::NotRunning);

    assert!(controller.play().await);
    handle.push(vec![1; UNIT_SIZE]);
    assert_eq!(coordinator.request().await, ShutdownOutcome::Initiated);

    let termination = monitor.watch().await;
    assert!(termination.is_graceful());
    controller.shutdown(&termination).await;
    assert_eq!(controller.release()["sink-one"].units_processed, 1);
}

#[tokio::test]
async fn test_paused_appsrc_holds_back_data() {
    let location = scratch_dir("held").join("held.out");
    let registry = StageRegistry::with_builtin();
    let mut builder = GraphBuilder::new(&registry);
    builder.add_many(&[("appsrc", "src"), ("filesink", "sink")]).unwrap();
    builder.sink_to("sink", &location).unwrap();
    builder.link("src", "sink").unwrap();
    let graph = builder.build().unwrap();
    let handle = graph.stage_as::<AppSource>("src").unwrap().handle();

    let (mut controller, monitor) = LifecycleController::start(graph).await.unwrap();
    assert!(controller.pause().await);
    for i in 0..5u8 {
        assert!(handle.push(vec![i; UNIT_SIZE]));
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(controller.stage_health("sink").unwrap().units_processed, 0);
    assert_eq!(controller.stage_health("src").unwrap().units_processed, 0);

    assert!(controller.play().await);
    let coordinator = ShutdownCoordinator::new(controller.pipeline(), CancellationToken::new());
    assert_eq!(coordinator.request().await, ShutdownOutcome::Initiated);
    let termination = monitor.watch().await;
    assert!(termination.is_graceful());
    controller.shutdown(&termination).await;

    assert_eq!(controller.release()["sink"].units_processed, 5);
    assert_eq!(std::fs::read(&location).unwrap().len(), 5 * UNIT_SIZE);
}

/// Passes the first unit, then fails
struct Faulty;

#[async_trait]
impl PipelineStage for Faulty {
    fn kind(&self) -> &'static str {
        "faulty"
    }

    fn port_templates(&self) -> Vec<PortTemplate> {
        vec![PortTemplate::sink(Caps::any()), PortTemplate::src(Caps::any())]
    }

    fn set_property(&mut self, _key: &str, _value: PropertyValue) -> Result<(), PropertyError> {
        Err(PropertyError::Unknown)
    }

    async fn run(&mut self, mut ctx: StageContext) -> Result<()> {
        let mut input = ctx.take_input()?;
        if let Some(DataItem::Buffer(buffer)) = input.recv().await {
            ctx.push(buffer).await;
        }
        bail!("decoder state corrupted")
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[tokio::test]
async fn test_runtime_error_stops_without_waiting_for_eos() {
    let dir = scratch_dir("fatal");
    let mut registry = StageRegistry::with_builtin();
    registry.register("faulty", || Box::new(Faulty));

    let mut builder = GraphBuilder::new(&registry);
    builder
        .add_many(&[("appsrc", "src"), ("faulty", "broken"), ("filesink", "sink")])
        .unwrap();
    builder.sink_to("sink", dir.join("partial.out")).unwrap();
    builder.chain(&["src", "broken", "sink"]).unwrap();
    let graph = builder.build().unwrap();
    let handle = graph.stage_as::<AppSource>("src").unwrap().handle();

    let (mut controller, monitor) = LifecycleController::start(graph).await.unwrap();
    handle.push(vec![7; UNIT_SIZE]);
    handle.push(vec![8; UNIT_SIZE]);

    let termination = monitor.watch().await;
    match &termination {
        Termination::Fatal(err) => {
            assert_eq!(err.stage, "broken");
            assert_eq!(err.message, "decoder state corrupted");
        }
        Termination::Graceful => panic!("expected a fatal error"),
    }

    controller.shutdown(&termination).await;
    assert_eq!(controller.state(), LifecycleState::Stopped);
    let health = controller.release();
    assert!(!health["sink"].eos_reached);
}

#[tokio::test]
async fn test_unwritable_sink_fails_start() {
    let registry = StageRegistry::with_builtin();
    let mut builder = GraphBuilder::new(&registry);
    builder.add_many(&[("appsrc", "src"), ("filesink", "sink")]).unwrap();
    builder
        .sink_to("sink", "/nonexistent/avrecord/out.mp4")
        .unwrap();
    builder.link("src", "sink").unwrap();
    let graph = builder.build().unwrap();

    match LifecycleController::start(graph).await {
        Err(StartFailure::Stage { stage, reason }) => {
            assert_eq!(stage, "sink");
            assert!(reason.contains("cannot open"), "{}", reason);
        }
        Ok(_) => panic!("start should fail"),
    }
}

#[tokio::test]
async fn test_recording_ends_when_sources_run_dry() {
    let dir = scratch_dir("exhausted");
    let config = RecorderConfig {
        units: Some(5),
        live: false,
        outputs: vec![dir.join("fileOne.mp4"), dir.join("fileTwo.mp4")],
        ..Default::default()
    };
    let registry = StageRegistry::with_builtin();
    let graph = build_recording_graph(&config, &registry).unwrap();
    let (controller, monitor) = LifecycleController::start(graph).await.unwrap();

    // No interrupt: end-of-stream comes from the sources themselves
    let (_interrupt_tx, interrupt_rx) = mpsc::unbounded_channel();
    let report = recorder::supervise(controller, monitor, interrupt_rx).await;
    assert!(report.termination.is_graceful(), "{:?}", report.termination);

    for (sink, file) in [("file-sink-0", "fileOne.mp4"), ("file-sink-1", "fileTwo.mp4")] {
        // file header + 5 video + 5 audio samples + index
        assert_eq!(report.health[sink].units_processed, 12, "{}", sink);
        let data = std::fs::read(dir.join(file)).unwrap();
        assert_eq!(&data[4..8], b"ftyp");
    }
    assert_eq!(report.health["video-enc"].keyframes_processed, 1);
}
