use std::path::PathBuf;
use std::process::ExitCode;
use std::{panic, process};

use avrecord::config::{RecorderConfig, app_name, app_version};
use avrecord::pipeline::{LifecycleController, StageRegistry, Termination};
use avrecord::recorder::{self, RunReport};
use clap::{Arg, ArgAction, Command, value_parser};
use log::{error, info, warn};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const EXIT_GRACEFUL: u8 = 0;
const EXIT_RUNTIME_ERROR: u8 = 1;
const EXIT_BUILD_ERROR: u8 = 2;
const EXIT_START_FAILURE: u8 = 3;

fn cli() -> Command {
    Command::new(app_name())
        .version(app_version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Record audio and video into two files until interrupted")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON file overriding the recording defaults.")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("units")
                .short('n')
                .long("units")
                .value_name("N")
                .help("Stop each capture source after N units instead of waiting for Ctrl+C.")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .help("Destination file; repeat for every copy (default fileOne.mp4 and fileTwo.mp4).")
                .action(ArgAction::Append)
                .value_parser(value_parser!(PathBuf)),
        )
}

fn load_config(matches: &clap::ArgMatches) -> anyhow::Result<RecorderConfig> {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => RecorderConfig::load(path)?,
        None => RecorderConfig::default(),
    };
    if let Some(units) = matches.get_one::<u64>("units") {
        config.units = Some(*units);
    }
    if let Some(outputs) = matches.get_many::<PathBuf>("output") {
        config.outputs = outputs.cloned().collect();
    }
    Ok(config)
}

/// Run one recording and map how it ended to the process exit status
async fn record(config: RecorderConfig, interrupts: mpsc::UnboundedReceiver<()>) -> u8 {
    let registry = StageRegistry::with_builtin();
    let graph = match recorder::build_recording_graph(&config, &registry) {
        Ok(graph) => graph,
        Err(e) => {
            error!("failed to build pipeline: {}", e);
            return EXIT_BUILD_ERROR;
        }
    };

    let (controller, monitor) = match LifecycleController::start(graph).await {
        Ok(started) => started,
        Err(e) => {
            error!("failed to start pipeline: {}", e);
            return EXIT_START_FAILURE;
        }
    };

    info!(
        "recording to {}; press Ctrl+C to stop",
        config
            .outputs
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let RunReport { termination, health } = recorder::supervise(controller, monitor, interrupts).await;
    for (stage, summary) in health.iter().filter(|(name, _)| name.starts_with("file-sink")) {
        info!("{}: {}", stage, summary);
    }

    match termination {
        Termination::Graceful => {
            info!("recording finished");
            EXIT_GRACEFUL
        }
        Termination::Fatal(err) => {
            error!("recording failed: {}", err);
            if let Some(debug) = &err.debug {
                error!("debug info: {}", debug);
            }
            EXIT_RUNTIME_ERROR
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = cli().get_matches();
    let config = match load_config(&matches) {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(EXIT_BUILD_ERROR);
        }
    };

    // stage panics are caught by the controller and end the run as a runtime
    // error; anything else panicking on the main thread exits right away
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        if std::thread::current().name() == Some("main") {
            process::exit(105);
        }
    }));

    // SIGINT asks for a graceful stop; the coordinator ignores repeats
    let (interrupt_tx, interrupt_rx) = mpsc::unbounded_channel();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = interrupt_tx.send(());
    }) {
        warn!("cannot install Ctrl+C handler, recording stops only at end of input: {}", e);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("cannot start async runtime: {}", e);
            return ExitCode::from(EXIT_RUNTIME_ERROR);
        }
    };
    ExitCode::from(runtime.block_on(record(config, interrupt_rx)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides() {
        let matches = cli()
            .try_get_matches_from(["avrecord", "--units", "25", "-o", "a.mp4", "-o", "b.mp4", "-o", "c.mp4"])
            .unwrap();
        let config = load_config(&matches).unwrap();
        assert_eq!(config.units, Some(25));
        assert_eq!(config.outputs.len(), 3);
    }

    #[tokio::test]
    async fn test_exit_status_follows_termination_cause() {
        let dir = std::env::temp_dir().join(format!("avrecord-exit-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let (_interrupt_tx, interrupt_rx) = mpsc::unbounded_channel();

        let mut bad_preset = RecorderConfig::default();
        bad_preset.video.speed_preset = 42;
        assert_eq!(record(bad_preset, interrupt_rx).await, EXIT_BUILD_ERROR);

        let unwritable = RecorderConfig {
            outputs: vec![PathBuf::from("/nonexistent/avrecord/out.mp4")],
            live: false,
            units: Some(3),
            ..Default::default()
        };
        let (_interrupt_tx, interrupt_rx) = mpsc::unbounded_channel();
        assert_eq!(record(unwritable, interrupt_rx).await, EXIT_START_FAILURE);

        let bounded = RecorderConfig {
            outputs: vec![dir.join("fileOne.mp4"), dir.join("fileTwo.mp4")],
            live: false,
            units: Some(3),
            ..Default::default()
        };
        let (_interrupt_tx, interrupt_rx) = mpsc::unbounded_channel();
        assert_eq!(record(bounded, interrupt_rx).await, EXIT_GRACEFUL);
        assert!(dir.join("fileTwo.mp4").exists());
    }

    #[test]
    fn test_no_arguments_required() {
        let matches = cli().try_get_matches_from(["avrecord"]).unwrap();
        assert_eq!(load_config(&matches).unwrap(), RecorderConfig::default());
    }
}
