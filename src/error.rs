//! Error types for graph assembly, startup and runtime
//!
//! Build errors abort the whole graph assembly, start failures abort the
//! Ready → Running transition, and runtime errors arrive on the bus while the
//! graph is running. Stage implementations report plain `anyhow` errors and
//! the pipeline wraps them with the stage name.

use thiserror::Error;

/// Errors raised while declaring, configuring and linking stages
#[derive(Debug, Error)]
pub enum BuildError {
    /// The registry has no factory for this kind
    #[error("unknown stage kind '{0}'")]
    UnknownStageKind(String),

    /// Unrecognized key, wrong value type, or out-of-range value
    #[error("invalid property '{key}' on {stage}: {source}")]
    InvalidProperty {
        stage: String,
        key: String,
        #[source]
        source: PropertyError,
    },

    /// Caps rejected by the stage, or caps text that does not parse
    #[error("unsupported format on {stage}: {reason}")]
    UnsupportedFormat { stage: String, reason: String },

    /// Adjacent ports cannot agree on a data format, or a port is already taken
    #[error("cannot link {src} -> {sink}: {reason}")]
    LinkIncompatible {
        src: String,
        sink: String,
        reason: String,
    },

    /// A link references a stage that was never added
    #[error("unknown stage '{0}'")]
    UnknownStage(String),

    /// Two stages were added under the same name
    #[error("stage name '{0}' is already in use")]
    DuplicateStage(String),

    /// Two merge inputs claimed the same role
    #[error("role '{role}' supplied more than once to {mux}")]
    DuplicateRole { mux: String, role: String },

    /// A role required for a correct container is absent
    #[error("required role '{role}' missing on {mux}")]
    MissingRole { mux: String, role: String },

    /// The finished graph is not a single connected acyclic structure
    #[error("invalid topology: {0}")]
    Topology(String),
}

/// Rejection of a single property assignment, reported by the stage itself
#[derive(Debug, Error)]
pub enum PropertyError {
    #[error("no such property")]
    Unknown,

    #[error("expected {expected} value, got {got}")]
    WrongType {
        expected: &'static str,
        got: &'static str,
    },

    #[error("{0}")]
    OutOfRange(String),
}

/// Failure to bring a built graph up to Running
#[derive(Debug, Error)]
pub enum StartFailure {
    /// A stage could not acquire its resources (busy device, unwritable file)
    #[error("stage {stage} failed to start: {reason}")]
    Stage { stage: String, reason: String },
}

/// A neighbouring stage went away mid-stream
///
/// The neighbour reports its own cause, so stages returning this are not
/// reported again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LinkClosed {
    #[error("upstream closed without end-of-stream")]
    Upstream,
    #[error("every downstream consumer is gone")]
    Downstream,
}

/// A fatal error posted on the bus while the graph was running
#[derive(Debug, Clone, Error)]
#[error("{stage}: {message}")]
pub struct RuntimeError {
    /// Name of the stage that failed
    pub stage: String,
    pub message: String,
    /// Extra diagnostic text for the operator
    pub debug: Option<String>,
}

impl RuntimeError {
    pub fn from_stage(stage: &str, err: &anyhow::Error) -> Self {
        let chain: Vec<String> = err.chain().skip(1).map(|e| e.to_string()).collect();
        Self {
            stage: stage.to_string(),
            message: err.to_string(),
            debug: if chain.is_empty() {
                None
            } else {
                Some(chain.join(": "))
            },
        }
    }
}
