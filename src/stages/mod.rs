//! In-process stage kinds
//!
//! These implement the [`PipelineStage`](crate::pipeline::PipelineStage) contract with the same port layout,
//! properties and format rules as their media-framework namesakes, so graphs
//! can be assembled, started and drained without external plugins.

use std::ops::RangeInclusive;

use anyhow::Result;

use crate::error::{LinkClosed, PropertyError};
use crate::pipeline::registry::StageRegistry;
use crate::pipeline::stage::StageContext;
use crate::pipeline::types::{Buffer, DataItem, PropertyValue};

pub mod convert;
pub mod encoder;
pub mod mux;
pub mod sink;
pub mod source;
pub mod tee;

pub use convert::{CapsFilter, Convert, ConvertKind, Queue};
pub use encoder::{AacEncoder, H264Encoder};
pub use mux::Mp4Mux;
pub use sink::FileSink;
pub use source::{AppSource, AppSourceHandle, TestSource};
pub use tee::Tee;

/// Register every built-in kind under its conventional name
pub fn register_builtin(registry: &mut StageRegistry) {
    registry.register("videotestsrc", || Box::new(TestSource::video()));
    registry.register("audiotestsrc", || Box::new(TestSource::audio()));
    registry.register("appsrc", || Box::new(AppSource::new()));
    registry.register("queue", || Box::new(Queue::new()));
    for kind in ConvertKind::ALL {
        registry.register(kind.name(), move || Box::new(Convert::new(kind)));
    }
    registry.register("capsfilter", || Box::new(CapsFilter::new()));
    registry.register("h264enc", || Box::new(H264Encoder::new()));
    registry.register("aacenc", || Box::new(AacEncoder::new()));
    registry.register("mp4mux", || Box::new(Mp4Mux::new()));
    registry.register("tee", || Box::new(Tee::new()));
    registry.register("filesink", || Box::new(FileSink::new()));
}

fn wrong_type(expected: &'static str, value: &PropertyValue) -> PropertyError {
    PropertyError::WrongType {
        expected,
        got: value.type_name(),
    }
}

pub(crate) fn expect_bool(value: &PropertyValue) -> Result<bool, PropertyError> {
    match value {
        PropertyValue::Bool(v) => Ok(*v),
        other => Err(wrong_type("bool", other)),
    }
}

pub(crate) fn expect_int(value: &PropertyValue, range: RangeInclusive<i64>) -> Result<i64, PropertyError> {
    let v = value.as_i64().ok_or_else(|| wrong_type("int", value))?;
    if !range.contains(&v) {
        return Err(PropertyError::OutOfRange(format!(
            "{} is outside {}..={}",
            v,
            range.start(),
            range.end()
        )));
    }
    Ok(v)
}

pub(crate) fn expect_str(value: &PropertyValue) -> Result<&str, PropertyError> {
    match value {
        PropertyValue::Str(v) => Ok(v),
        other => Err(wrong_type("string", other)),
    }
}

/// Drive a one-input stage, mapping every buffer through `transform`
///
/// `transform` may drop a buffer by returning `None`. End-of-stream is
/// forwarded to every output.
pub(crate) async fn pump<F>(ctx: &mut StageContext, mut transform: F) -> Result<()>
where
    F: FnMut(Buffer) -> Result<Option<Buffer>> + Send,
{
    let mut input = ctx.take_input()?;
    while let Some(item) = input.recv().await {
        match item {
            DataItem::Buffer(buffer) => {
                if let Some(out) = transform(buffer)?
                    && !ctx.push(out).await
                {
                    return Err(LinkClosed::Downstream.into());
                }
            }
            DataItem::Eos => {
                ctx.push_eos().await;
                return Ok(());
            }
        }
    }
    Err(LinkClosed::Upstream.into())
}
