//! avrecord: capture, encode, multiplex and record audio/video through a
//! graph of asynchronous stages, stopping gracefully on interrupt.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod recorder;
pub mod stages;

pub use config::RecorderConfig;
pub use error::{BuildError, PropertyError, RuntimeError, StartFailure};
