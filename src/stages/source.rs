//! Source stages: synthetic test sources and an application-fed source

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, info};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{expect_bool, expect_int, expect_str};
use crate::error::{LinkClosed, PropertyError};
use crate::pipeline::caps::Caps;
use crate::pipeline::stage::{PipelineStage, PortTemplate, StageContext};
use crate::pipeline::types::{Buffer, MediaKind, PropertyValue, Timestamp};

const VIDEO_FRAME_PERIOD: Duration = Duration::from_millis(40);
/// 1024 samples at 48 kHz
const AUDIO_BUFFER_PERIOD: Duration = Duration::from_micros(21_333);

/// Synthetic capture source (`videotestsrc` / `audiotestsrc`)
///
/// Produces `num-buffers` units (or until end-of-stream is injected when
/// `num-buffers` is -1). With `device` set, the path is opened on prepare the
/// way a capture device would be, so a missing device fails the start.
pub struct TestSource {
    kind: MediaKind,
    num_buffers: i64,
    is_live: bool,
    blocksize: usize,
    pattern: u8,
    device: Option<PathBuf>,
}

impl TestSource {
    pub fn video() -> Self {
        Self {
            kind: MediaKind::Video,
            num_buffers: -1,
            is_live: false,
            blocksize: 4096,
            pattern: 0,
            device: None,
        }
    }

    pub fn audio() -> Self {
        Self {
            kind: MediaKind::Audio,
            num_buffers: -1,
            is_live: false,
            blocksize: 1024 * 4,
            pattern: 0,
            device: None,
        }
    }

    fn period(&self) -> Duration {
        match self.kind {
            MediaKind::Audio => AUDIO_BUFFER_PERIOD,
            _ => VIDEO_FRAME_PERIOD,
        }
    }

    fn make_buffer(&self, sequence: u64) -> Buffer {
        let mut data = BytesMut::with_capacity(self.blocksize);
        data.put_u64(sequence);
        data.resize(self.blocksize.max(8), self.pattern);
        let pts = Timestamp::from_duration(frame_offset(self.period(), sequence));
        Buffer::new(self.kind, data.freeze(), pts, sequence)
    }
}

#[async_trait]
impl PipelineStage for TestSource {
    fn kind(&self) -> &'static str {
        match self.kind {
            MediaKind::Audio => "audiotestsrc",
            _ => "videotestsrc",
        }
    }

    fn port_templates(&self) -> Vec<PortTemplate> {
        let caps = match self.kind {
            MediaKind::Audio => Caps::new_simple("audio/x-raw"),
            _ => Caps::new_simple("video/x-raw"),
        };
        vec![PortTemplate::src(caps)]
    }

    fn set_property(&mut self, key: &str, value: PropertyValue) -> Result<(), PropertyError> {
        match key {
            "num-buffers" => self.num_buffers = expect_int(&value, -1..=i64::MAX)?,
            "is-live" => self.is_live = expect_bool(&value)?,
            "blocksize" => self.blocksize = expect_int(&value, 8..=16 * 1024 * 1024)? as usize,
            "pattern" | "wave" => {
                self.pattern = match expect_str(&value)? {
                    "black" | "silence" => 0x00,
                    "white" => 0xff,
                    "smpte" | "sine" => 0x5a,
                    other => return Err(PropertyError::OutOfRange(format!("unknown pattern '{}'", other))),
                }
            }
            "device" => self.device = Some(PathBuf::from(expect_str(&value)?)),
            _ => return Err(PropertyError::Unknown),
        }
        Ok(())
    }

    async fn prepare(&mut self) -> Result<()> {
        if let Some(device) = &self.device {
            tokio::fs::File::open(device)
                .await
                .with_context(|| format!("cannot open capture device {}", device.display()))?;
            debug!("{}: opened device {}", self.kind(), device.display());
        }
        Ok(())
    }

    async fn run(&mut self, mut ctx: StageContext) -> Result<()> {
        let eos = ctx.eos_requested().clone();
        let period = self.period();
        let started = Instant::now();
        let mut sequence = 0u64;

        ctx.post_stream_start();
        info!("{}: producing {} buffers", ctx.name(), self.kind);

        loop {
            if self.num_buffers >= 0 && sequence >= self.num_buffers as u64 {
                break;
            }

            tokio::select! {
                biased;
                _ = eos.cancelled() => break,
                _ = ctx.wait_playing() => {}
            }
            if self.is_live {
                tokio::select! {
                    biased;
                    _ = eos.cancelled() => break,
                    _ = tokio::time::sleep(frame_offset(period, sequence).saturating_sub(started.elapsed())) => {}
                }
            } else if eos.is_cancelled() {
                break;
            }

            if !ctx.push(self.make_buffer(sequence)).await {
                return Err(LinkClosed::Downstream.into());
            }
            sequence += 1;
        }

        debug!("{}: end-of-stream after {} buffers", ctx.name(), sequence);
        ctx.push_eos().await;
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Offset of unit `sequence` from the start of the stream
fn frame_offset(period: Duration, sequence: u64) -> Duration {
    Duration::from_micros((period.as_micros() as u64).saturating_mul(sequence))
}

enum AppCommand {
    Push(Bytes),
    EndOfStream,
}

/// Feeds an `appsrc` from application code
#[derive(Clone)]
pub struct AppSourceHandle {
    tx: mpsc::UnboundedSender<AppCommand>,
}

impl AppSourceHandle {
    /// Queue one unit; false once the source has finished
    pub fn push(&self, data: impl Into<Bytes>) -> bool {
        self.tx.send(AppCommand::Push(data.into())).is_ok()
    }

    /// Finish the stream after everything queued so far
    pub fn end_of_stream(&self) -> bool {
        self.tx.send(AppCommand::EndOfStream).is_ok()
    }
}

/// Source fed through an [`AppSourceHandle`]
///
/// Units pushed before end-of-stream is injected are always delivered; the
/// injected end-of-stream is appended after whatever is still queued.
pub struct AppSource {
    caps: Caps,
    tx: mpsc::UnboundedSender<AppCommand>,
    rx: Option<mpsc::UnboundedReceiver<AppCommand>>,
}

impl AppSource {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            caps: Caps::any(),
            tx,
            rx: Some(rx),
        }
    }

    pub fn handle(&self) -> AppSourceHandle {
        AppSourceHandle { tx: self.tx.clone() }
    }

    fn media_kind(&self) -> MediaKind {
        match self.caps.media_type() {
            Some(t) if t.starts_with("video/") => MediaKind::Video,
            Some(t) if t.starts_with("audio/") => MediaKind::Audio,
            _ => MediaKind::Container,
        }
    }
}

impl Default for AppSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PipelineStage for AppSource {
    fn kind(&self) -> &'static str {
        "appsrc"
    }

    fn port_templates(&self) -> Vec<PortTemplate> {
        vec![PortTemplate::src(Caps::any())]
    }

    fn set_property(&mut self, key: &str, value: PropertyValue) -> Result<(), PropertyError> {
        match (key, value) {
            ("caps", PropertyValue::Caps(caps)) => self.caps = caps,
            ("caps", PropertyValue::Str(text)) => {
                self.caps = text.parse::<Caps>().map_err(|e| PropertyError::OutOfRange(format!("{}", e)))?
            }
            ("caps", other) => {
                return Err(PropertyError::WrongType {
                    expected: "caps",
                    got: other.type_name(),
                });
            }
            _ => return Err(PropertyError::Unknown),
        }
        Ok(())
    }

    fn output_caps(&self, _template: &PortTemplate, _upstream: Option<&Caps>) -> Option<Caps> {
        Some(self.caps.clone())
    }

    async fn run(&mut self, mut ctx: StageContext) -> Result<()> {
        let mut rx = self.rx.take().context("appsrc can only run once")?;
        let eos = ctx.eos_requested().clone();
        let kind = self.media_kind();
        let started = Instant::now();
        let mut sequence = 0u64;
        let mut last_pts = Timestamp::from_micros(-1);

        ctx.wait_playing().await;
        ctx.post_stream_start();

        loop {
            let command = tokio::select! {
                biased;
                command = rx.recv() => command,
                _ = eos.cancelled() => {
                    // Deliver what was queued before the request
                    match rx.try_recv() {
                        Ok(command) => Some(command),
                        Err(_) => Some(AppCommand::EndOfStream),
                    }
                }
            };

            match command {
                Some(AppCommand::Push(data)) => {
                    // Held while paused; injected end-of-stream flushes regardless
                    tokio::select! {
                        biased;
                        _ = eos.cancelled() => {}
                        _ = ctx.wait_playing() => {}
                    }
                    // Strictly increasing even for back-to-back pushes
                    let pts = Timestamp::from_duration(started.elapsed())
                        .max(Timestamp::from_micros(last_pts.micros + 1));
                    last_pts = pts;
                    let buffer = Buffer::new(kind, data, pts, sequence);
                    if !ctx.push(buffer).await {
                        return Err(LinkClosed::Downstream.into());
                    }
                    sequence += 1;
                }
                Some(AppCommand::EndOfStream) | None => break,
            }
        }

        debug!("{}: end-of-stream after {} buffers", ctx.name(), sequence);
        ctx.push_eos().await;
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_properties() {
        let mut src = TestSource::video();
        src.set_property("num-buffers", PropertyValue::Int(10)).unwrap();
        src.set_property("is-live", PropertyValue::Bool(true)).unwrap();
        src.set_property("pattern", PropertyValue::Str("white".into())).unwrap();
        assert!(matches!(
            src.set_property("num-buffers", PropertyValue::Int(-2)),
            Err(PropertyError::OutOfRange(_))
        ));
        assert!(matches!(
            src.set_property("is-live", PropertyValue::Int(1)),
            Err(PropertyError::WrongType { .. })
        ));
        assert!(matches!(
            src.set_property("framerate", PropertyValue::Int(25)),
            Err(PropertyError::Unknown)
        ));
    }

    #[test]
    fn test_buffers_carry_sequence_and_pattern() {
        let mut src = TestSource::audio();
        src.set_property("blocksize", PropertyValue::Int(16)).unwrap();
        src.set_property("wave", PropertyValue::Str("sine".into())).unwrap();
        let buffer = src.make_buffer(3);
        assert_eq!(buffer.size(), 16);
        assert_eq!(&buffer.data[..8], &3u64.to_be_bytes());
        assert!(buffer.data[8..].iter().all(|&b| b == 0x5a));
        assert_eq!(buffer.pts, Timestamp::from_duration(AUDIO_BUFFER_PERIOD * 3));
    }

    #[test]
    fn test_frame_offset_past_u32_sequences() {
        let sequence = u32::MAX as u64 + 10;
        let offset = frame_offset(VIDEO_FRAME_PERIOD, sequence);
        assert_eq!(offset.as_micros(), 40_000 * sequence as u128);
        assert!(offset > frame_offset(VIDEO_FRAME_PERIOD, u32::MAX as u64));
        assert_eq!(frame_offset(AUDIO_BUFFER_PERIOD, u64::MAX), Duration::from_micros(u64::MAX));
    }

    #[tokio::test]
    async fn test_missing_device_fails_prepare() {
        let mut src = TestSource::video();
        src.set_property("device", PropertyValue::Str("/nonexistent/video9".into()))
            .unwrap();
        let err = src.prepare().await.unwrap_err();
        assert!(format!("{:#}", err).contains("cannot open capture device"));
    }

    #[test]
    fn test_appsrc_caps_decide_media_kind() {
        let mut src = AppSource::new();
        assert_eq!(src.media_kind(), MediaKind::Container);
        src.set_property("caps", PropertyValue::Str("video/x-raw, width=64".into()))
            .unwrap();
        assert_eq!(src.media_kind(), MediaKind::Video);
        assert!(src.set_property("caps", PropertyValue::Str("bogus".into())).is_err());
    }
}
