//! The capture-record topology and the loop supervising one recording
//!
//! ```text
//! video-src → queue → videoconvert → videorate → videoscale → caps → queue → h264enc → queue ─┐
//!                                                                                            mp4mux → tee ─┬→ queue → filesink
//! audio-src → queue → audioconvert → audioresample → audiorate → caps → queue → aacenc → queue ─┘            └→ queue → filesink
//! ```

use std::collections::BTreeMap;

use log::{debug, error, info};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::config::RecorderConfig;
use crate::error::BuildError;
use crate::pipeline::{
    EventMonitor, Graph, GraphBuilder, HealthSummary, LifecycleController, ShutdownCoordinator, StageRegistry,
    Termination,
};

/// Declare, configure and link the full recording graph
pub fn build_recording_graph(config: &RecorderConfig, registry: &StageRegistry) -> Result<Graph, BuildError> {
    let mut builder = GraphBuilder::new(registry);
    let num_buffers = config.units.map(|n| n as i64).unwrap_or(-1);

    builder.add_many(&[
        ("videotestsrc", "video-src"),
        ("queue", "video-queue-capture"),
        ("videoconvert", "video-convert"),
        ("videorate", "video-rate"),
        ("videoscale", "video-scale"),
        ("capsfilter", "video-caps"),
        ("queue", "video-queue-encode"),
        ("h264enc", "video-enc"),
        ("queue", "video-queue-mux"),
    ])?;
    builder.set("video-src", "num-buffers", num_buffers)?;
    builder.set("video-src", "is-live", config.live)?;
    if let Some(device) = &config.video.device {
        builder.set("video-src", "device", device.to_string_lossy().into_owned())?;
    }
    builder.set("video-rate", "silent", false)?;
    builder.set_caps("video-caps", &config.video.caps())?;
    builder.set("video-enc", "speed-preset", config.video.speed_preset)?;
    builder.set("video-enc", "tune", config.video.tune.as_str())?;
    builder.set("video-enc", "bitrate", config.video.bitrate)?;
    builder.set("video-enc", "key-int-max", config.video.key_int_max)?;
    builder.chain(&[
        "video-src",
        "video-queue-capture",
        "video-convert",
        "video-rate",
        "video-scale",
        "video-caps",
        "video-queue-encode",
        "video-enc",
        "video-queue-mux",
    ])?;

    builder.add_many(&[
        ("audiotestsrc", "audio-src"),
        ("queue", "audio-queue-capture"),
        ("audioconvert", "audio-convert"),
        ("audioresample", "audio-resample"),
        ("audiorate", "audio-rate"),
        ("capsfilter", "audio-caps"),
        ("queue", "audio-queue-encode"),
        ("aacenc", "audio-enc"),
        ("queue", "audio-queue-mux"),
    ])?;
    builder.set("audio-src", "num-buffers", num_buffers)?;
    builder.set("audio-src", "is-live", config.live)?;
    if let Some(device) = &config.audio.device {
        builder.set("audio-src", "device", device.to_string_lossy().into_owned())?;
    }
    builder.set_caps("audio-caps", &config.audio.caps())?;
    builder.set("audio-enc", "bitrate", config.audio.bitrate)?;
    builder.chain(&[
        "audio-src",
        "audio-queue-capture",
        "audio-convert",
        "audio-resample",
        "audio-rate",
        "audio-caps",
        "audio-queue-encode",
        "audio-enc",
        "audio-queue-mux",
    ])?;

    builder.add("mp4mux", "mux")?;
    builder.set("mux", "streamable", config.streamable)?;
    let mux = builder.merge("mux", &[("audio-queue-mux", "audio"), ("video-queue-mux", "video")])?;

    builder.add("tee", "tee")?;
    builder.link(&mux, "tee")?;
    let branches = builder.tee("tee", config.outputs.len())?;
    for (i, (branch, output)) in branches.iter().zip(&config.outputs).enumerate() {
        let queue = format!("file-queue-{}", i);
        let sink = format!("file-sink-{}", i);
        builder.add("queue", &queue)?;
        builder.add("filesink", &sink)?;
        builder.sink_to(&sink, output)?;
        builder.chain_from(branch, &[queue.as_str(), sink.as_str()])?;
    }

    builder.build()
}

/// How a supervised run ended
#[derive(Debug)]
pub struct RunReport {
    pub termination: Termination,
    pub health: BTreeMap<String, HealthSummary>,
}

/// Watch a started pipeline until it terminates, then tear it down
///
/// Interrupts arriving on `interrupts` are turned into a single graceful
/// end-of-stream for as long as the pipeline lives.
pub async fn supervise(
    mut controller: LifecycleController,
    monitor: EventMonitor,
    interrupts: mpsc::UnboundedReceiver<()>,
) -> RunReport {
    let scope = CancellationToken::new();
    let listener = ShutdownCoordinator::new(controller.pipeline(), scope.clone()).spawn(interrupts);

    let termination = monitor.watch().await;
    debug!("recorder: watch ended, graceful={}", termination.is_graceful());
    controller.shutdown(&termination).await;

    scope.cancel();
    listener_finished(listener.await);

    if let Some(elapsed) = controller.running_duration() {
        info!("recorder: ran for {:.1}s", elapsed.as_secs_f64());
    }
    RunReport {
        termination,
        health: controller.release(),
    }
}

/// Report how the interrupt listener ended; false if it panicked or was aborted
fn listener_finished(result: Result<(), JoinError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            error!("recorder: interrupt listener failed: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listener_panic_is_reported() {
        let panicked = tokio::spawn(async {
            panic!("listener blew up");
        });
        assert!(!listener_finished(panicked.await));
        assert!(listener_finished(tokio::spawn(async {}).await));
    }

    #[test]
    fn test_recording_graph_builds() {
        let registry = StageRegistry::with_builtin();
        let graph = build_recording_graph(&RecorderConfig::default(), &registry).unwrap();

        let mut sources = graph.sources();
        sources.sort();
        assert_eq!(sources, vec!["audio-src", "video-src"]);
        let mut sinks = graph.sinks();
        sinks.sort();
        assert_eq!(sinks, vec!["file-sink-0", "file-sink-1"]);
        assert_eq!(graph.port_names("tee"), vec!["sink", "src_0", "src_1"]);
        // 8 + 8 chain links, 2 into the mux, mux → tee, 2 × 2 per branch
        assert_eq!(graph.links().len(), 8 + 8 + 2 + 1 + 4);
    }

    #[test]
    fn test_invalid_encoder_setting_fails_build() {
        let registry = StageRegistry::with_builtin();
        let mut config = RecorderConfig::default();
        config.video.speed_preset = 42;
        assert!(matches!(
            build_recording_graph(&config, &registry),
            Err(BuildError::InvalidProperty { .. })
        ));
    }

    #[test]
    fn test_no_outputs_is_a_topology_error() {
        let registry = StageRegistry::with_builtin();
        let config = RecorderConfig {
            outputs: Vec::new(),
            ..Default::default()
        };
        assert!(matches!(
            build_recording_graph(&config, &registry),
            Err(BuildError::Topology(_))
        ));
    }
}
