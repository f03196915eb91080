//! Pipeline abstraction layer for avrecord
//!
//! This module separates the concerns of a capture-record graph:
//! - Composition: a registry of stage kinds and a builder wiring them
//!   through chain, tee, merge and sink operations
//! - Control: the lifecycle state machine driving a graph to Running and
//!   back to Stopped
//! - Observation: status events posted by stages and watched by a single
//!   monitor
//! - Termination: interrupts turned into one graceful end-of-stream
//!
//! # Architecture
//!
//! - Each stage runs in its own async task
//! - Stages implement the `PipelineStage` trait and talk over channels
//! - The controller owns the running graph; everything else holds a
//!   non-owning `PipelineRef`

pub mod builder;
pub mod bus;
pub mod caps;
pub mod graph;
pub mod health;
pub mod lifecycle;
pub mod registry;
pub mod shutdown;
pub mod stage;
pub mod state;
pub mod types;

pub use builder::GraphBuilder;
pub use bus::{EventMonitor, Notice, StatusEvent, Termination, Verdict, classify};
pub use caps::Caps;
pub use graph::{Graph, Link, PortRef};
pub use health::{HealthSummary, StageHealth};
pub use lifecycle::{EosRequest, LifecycleController, PipelineRef};
pub use registry::StageRegistry;
pub use shutdown::{ShutdownCoordinator, ShutdownOutcome};
pub use stage::{PipelineStage, PortTemplate, StageContext};
pub use state::LifecycleState;
pub use types::{Buffer, DataItem, MediaKind, PropertyValue, Timestamp};
