//! One-in one-out stages that buffer, adapt or constrain raw media

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, warn};

use super::{expect_bool, expect_int, pump};
use crate::error::PropertyError;
use crate::pipeline::caps::Caps;
use crate::pipeline::stage::{LinkCapacity, PipelineStage, PortDirection, PortTemplate, StageContext};
use crate::pipeline::types::{PropertyValue, Timestamp};

const DEFAULT_QUEUE_BUFFERS: i64 = 200;

/// Decouples its upstream from its downstream with its own buffering
///
/// `max-size-buffers` sets the depth of the outgoing link; 0 means unlimited.
pub struct Queue {
    max_size_buffers: i64,
}

impl Queue {
    pub fn new() -> Self {
        Self {
            max_size_buffers: DEFAULT_QUEUE_BUFFERS,
        }
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PipelineStage for Queue {
    fn kind(&self) -> &'static str {
        "queue"
    }

    fn port_templates(&self) -> Vec<PortTemplate> {
        vec![PortTemplate::sink(Caps::any()), PortTemplate::src(Caps::any())]
    }

    fn set_property(&mut self, key: &str, value: PropertyValue) -> Result<(), PropertyError> {
        match key {
            "max-size-buffers" => self.max_size_buffers = expect_int(&value, 0..=u32::MAX as i64)?,
            _ => return Err(PropertyError::Unknown),
        }
        Ok(())
    }

    fn output_caps(&self, template: &PortTemplate, upstream: Option<&Caps>) -> Option<Caps> {
        Some(upstream.cloned().unwrap_or_else(|| template.caps.clone()))
    }

    fn link_capacity(&self, _template: &PortTemplate) -> LinkCapacity {
        match self.max_size_buffers {
            0 => LinkCapacity::Unbounded,
            n => LinkCapacity::Bounded(n as usize),
        }
    }

    async fn run(&mut self, mut ctx: StageContext) -> Result<()> {
        pump(&mut ctx, |buffer| Ok(Some(buffer))).await
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Raw-media adapters: each frees some caps fields so downstream can pick them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertKind {
    VideoConvert,
    VideoRate,
    VideoScale,
    AudioConvert,
    AudioResample,
    AudioRate,
}

impl ConvertKind {
    pub const ALL: [ConvertKind; 6] = [
        ConvertKind::VideoConvert,
        ConvertKind::VideoRate,
        ConvertKind::VideoScale,
        ConvertKind::AudioConvert,
        ConvertKind::AudioResample,
        ConvertKind::AudioRate,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ConvertKind::VideoConvert => "videoconvert",
            ConvertKind::VideoRate => "videorate",
            ConvertKind::VideoScale => "videoscale",
            ConvertKind::AudioConvert => "audioconvert",
            ConvertKind::AudioResample => "audioresample",
            ConvertKind::AudioRate => "audiorate",
        }
    }

    fn media_type(self) -> &'static str {
        match self {
            ConvertKind::VideoConvert | ConvertKind::VideoRate | ConvertKind::VideoScale => "video/x-raw",
            _ => "audio/x-raw",
        }
    }

    /// Fields this adapter can change
    fn free_fields(self) -> &'static [&'static str] {
        match self {
            ConvertKind::VideoConvert => &["format", "colorimetry"],
            ConvertKind::VideoRate => &["framerate"],
            ConvertKind::VideoScale => &["width", "height", "pixel-aspect-ratio"],
            ConvertKind::AudioConvert => &["format", "channels", "layout"],
            ConvertKind::AudioResample => &["rate"],
            ConvertKind::AudioRate => &[],
        }
    }

    /// Rate adapters keep timestamps monotonic
    fn is_rate(self) -> bool {
        matches!(self, ConvertKind::VideoRate | ConvertKind::AudioRate)
    }
}

/// Media adapter (`videoconvert`, `videorate`, `audioresample`, ...)
pub struct Convert {
    kind: ConvertKind,
    silent: bool,
    last_pts: Option<Timestamp>,
    dropped: u64,
}

impl Convert {
    pub fn new(kind: ConvertKind) -> Self {
        Self {
            kind,
            silent: true,
            last_pts: None,
            dropped: 0,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Rate adapters drop units that would move time backwards
    fn admit(&mut self, pts: Timestamp) -> bool {
        if !self.kind.is_rate() {
            return true;
        }
        if let Some(last) = self.last_pts
            && pts <= last
        {
            self.dropped += 1;
            return false;
        }
        self.last_pts = Some(pts);
        true
    }
}

#[async_trait]
impl PipelineStage for Convert {
    fn kind(&self) -> &'static str {
        self.kind.name()
    }

    fn port_templates(&self) -> Vec<PortTemplate> {
        let caps = Caps::new_simple(self.kind.media_type());
        vec![PortTemplate::sink(caps.clone()), PortTemplate::src(caps)]
    }

    fn set_property(&mut self, key: &str, value: PropertyValue) -> Result<(), PropertyError> {
        match key {
            "silent" if self.kind.is_rate() => self.silent = expect_bool(&value)?,
            _ => return Err(PropertyError::Unknown),
        }
        Ok(())
    }

    fn output_caps(&self, template: &PortTemplate, upstream: Option<&Caps>) -> Option<Caps> {
        match upstream {
            Some(caps) => caps
                .intersect(&template.caps)
                .map(|caps| caps.without_fields(self.kind.free_fields())),
            None => Some(template.caps.clone()),
        }
    }

    async fn run(&mut self, mut ctx: StageContext) -> Result<()> {
        let name = ctx.name().to_string();
        let silent = self.silent;
        pump(&mut ctx, |buffer| {
            if self.admit(buffer.pts) {
                return Ok(Some(buffer));
            }
            if !silent {
                warn!("{}: dropped unit {} at {}", name, buffer.sequence, buffer.pts);
            }
            Ok(None)
        })
        .await?;

        if self.dropped > 0 {
            debug!("{}: {} units dropped", name, self.dropped);
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Constrains the stream to a fixed format
///
/// Without caps the filter accepts and forwards anything.
pub struct CapsFilter {
    caps: Caps,
}

impl CapsFilter {
    pub fn new() -> Self {
        Self { caps: Caps::any() }
    }

    pub fn caps(&self) -> &Caps {
        &self.caps
    }
}

impl Default for CapsFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PipelineStage for CapsFilter {
    fn kind(&self) -> &'static str {
        "capsfilter"
    }

    fn port_templates(&self) -> Vec<PortTemplate> {
        vec![PortTemplate::sink(Caps::any()), PortTemplate::src(Caps::any())]
    }

    fn set_property(&mut self, key: &str, value: PropertyValue) -> Result<(), PropertyError> {
        match (key, value) {
            ("caps", PropertyValue::Caps(caps)) => self.caps = caps,
            ("caps", PropertyValue::Str(text)) => {
                self.caps = text
                    .parse::<Caps>()
                    .map_err(|e| PropertyError::OutOfRange(e.to_string()))?
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

    fn set_caps(&mut self, caps: Caps) -> Result<(), String> {
        self.caps = caps;
        Ok(())
    }

    fn input_caps(&self, template: &PortTemplate) -> Caps {
        match template.direction {
            PortDirection::Input => self.caps.clone(),
            PortDirection::Output => template.caps.clone(),
        }
    }

    fn output_caps(&self, _template: &PortTemplate, upstream: Option<&Caps>) -> Option<Caps> {
        match upstream {
            Some(caps) => caps.intersect(&self.caps),
            None => Some(self.caps.clone()),
        }
    }

    async fn run(&mut self, mut ctx: StageContext) -> Result<()> {
        pump(&mut ctx, |buffer| Ok(Some(buffer))).await
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_capacity() {
        let mut queue = Queue::new();
        let template = PortTemplate::src(Caps::any());
        assert_eq!(queue.link_capacity(&template), LinkCapacity::Bounded(200));
        queue.set_property("max-size-buffers", PropertyValue::UInt(0)).unwrap();
        assert_eq!(queue.link_capacity(&template), LinkCapacity::Unbounded);
    }

    #[test]
    fn test_converters_free_their_fields() {
        let upstream: Caps = "video/x-raw, width=640, height=480, framerate=30/1".parse().unwrap();
        let scale = Convert::new(ConvertKind::VideoScale);
        let template = &scale.port_templates()[1];
        let out = scale.output_caps(template, Some(&upstream)).unwrap();
        assert_eq!(out.get("width"), None);
        assert!(out.get("framerate").is_some());

        let resample = Convert::new(ConvertKind::AudioResample);
        let template = &resample.port_templates()[1];
        assert!(resample.output_caps(template, Some(&upstream)).is_none());
    }

    #[test]
    fn test_silent_only_on_rate_adapters() {
        let mut rate = Convert::new(ConvertKind::VideoRate);
        rate.set_property("silent", PropertyValue::Bool(false)).unwrap();
        let mut convert = Convert::new(ConvertKind::VideoConvert);
        assert!(matches!(
            convert.set_property("silent", PropertyValue::Bool(false)),
            Err(PropertyError::Unknown)
        ));
    }

    #[test]
    fn test_rate_drops_non_monotonic_units() {
        let mut rate = Convert::new(ConvertKind::AudioRate);
        assert!(rate.admit(Timestamp::from_micros(10)));
        assert!(!rate.admit(Timestamp::from_micros(10)));
        assert!(rate.admit(Timestamp::from_micros(20)));
        assert_eq!(rate.dropped(), 1);

        let mut convert = Convert::new(ConvertKind::AudioConvert);
        assert!(convert.admit(Timestamp::from_micros(10)));
        assert!(convert.admit(Timestamp::from_micros(5)));
    }

    #[test]
    fn test_capsfilter_narrows() {
        let mut filter = CapsFilter::new();
        filter
            .set_caps("audio/x-raw, rate=48000, channels=2".parse().unwrap())
            .unwrap();
        let src = &filter.port_templates()[1];
        let upstream = Caps::new_simple("audio/x-raw");
        let out = filter.output_caps(src, Some(&upstream)).unwrap();
        assert_eq!(out.get_int("rate"), Some(48000));
        assert!(filter
            .output_caps(src, Some(&Caps::new_simple("video/x-raw")))
            .is_none());
    }
}
