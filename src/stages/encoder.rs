//! Encoder stages producing H.264 Annex-B access units and ADTS AAC frames

use anyhow::Result;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use log::{debug, info};

use super::{expect_int, expect_str, pump};
use crate::error::PropertyError;
use crate::pipeline::caps::Caps;
use crate::pipeline::stage::{PipelineStage, PortTemplate, StageContext};
use crate::pipeline::types::{Buffer, PropertyValue};

const ANNEXB_START_CODE: [u8; 4] = [0, 0, 0, 1];
const NAL_IDR: u8 = 0x65;
const NAL_NON_IDR: u8 = 0x41;
/// Keyframe distance used when `key-int-max` is 0 (automatic)
const AUTO_KEY_INTERVAL: u64 = 250;
const NOMINAL_FRAME_RATE: u64 = 25;

const TUNES: &[&str] = &["stillimage", "fastdecode", "zerolatency"];

/// H.264 encoder (`h264enc`)
///
/// Every output unit is one access unit prefixed with an Annex-B start code;
/// keyframes carry an IDR slice.
pub struct H264Encoder {
    /// kbit/s
    bitrate: i64,
    speed_preset: i64,
    tune: Option<String>,
    key_int_max: i64,
    frames: u64,
}

impl H264Encoder {
    pub fn new() -> Self {
        Self {
            bitrate: 2048,
            speed_preset: 6,
            tune: None,
            key_int_max: 0,
            frames: 0,
        }
    }

    fn key_interval(&self) -> u64 {
        match self.key_int_max {
            0 => AUTO_KEY_INTERVAL,
            n => n as u64,
        }
    }

    /// Payload budget of one frame at the configured bitrate
    fn frame_budget(&self) -> usize {
        (self.bitrate as u64 * 1000 / 8 / NOMINAL_FRAME_RATE) as usize
    }

    fn encode(&mut self, buffer: Buffer) -> Buffer {
        let keyframe = self.frames % self.key_interval() == 0;
        self.frames += 1;

        let payload = &buffer.data[..buffer.data.len().min(self.frame_budget())];
        let mut out = BytesMut::with_capacity(payload.len() + 5);
        out.put_slice(&ANNEXB_START_CODE);
        out.put_u8(if keyframe { NAL_IDR } else { NAL_NON_IDR });
        put_escaped(&mut out, payload);

        let mut encoded = Buffer::new(buffer.kind, out.freeze(), buffer.pts, buffer.sequence);
        encoded.is_keyframe = contains_idr(&encoded.data);
        encoded
    }
}

impl Default for H264Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Append `payload` with emulation-prevention bytes, so it never contains a start code
fn put_escaped(out: &mut BytesMut, payload: &[u8]) {
    let mut zeros = 0;
    for &byte in payload {
        if zeros >= 2 && byte <= 3 {
            out.put_u8(0x03);
            zeros = 0;
        }
        out.put_u8(byte);
        zeros = if byte == 0 { zeros + 1 } else { 0 };
    }
}

/// Check if H.264 Annex B data contains an IDR NAL unit (type 5)
fn contains_idr(data: &[u8]) -> bool {
    let mut i = 0;
    while i + 4 < data.len() {
        if data[i..i + 4] == ANNEXB_START_CODE {
            if (data[i + 4] & 0x1F) == 5 {
                return true;
            }
            i += 4;
        } else {
            i += 1;
        }
    }
    false
}

#[async_trait]
impl PipelineStage for H264Encoder {
    fn kind(&self) -> &'static str {
        "h264enc"
    }

    fn port_templates(&self) -> Vec<PortTemplate> {
        vec![
            PortTemplate::sink(Caps::new_simple("video/x-raw")),
            PortTemplate::src(
                Caps::builder("video/x-h264")
                    .field("stream-format", "byte-stream")
                    .field("alignment", "au")
                    .build(),
            ),
        ]
    }

    fn set_property(&mut self, key: &str, value: PropertyValue) -> Result<(), PropertyError> {
        match key {
            "bitrate" => self.bitrate = expect_int(&value, 1..=2_048_000)?,
            "speed-preset" => self.speed_preset = expect_int(&value, 0..=10)?,
            "key-int-max" => self.key_int_max = expect_int(&value, 0..=i32::MAX as i64)?,
            "tune" => {
                let tune = expect_str(&value)?;
                if !TUNES.contains(&tune) {
                    return Err(PropertyError::OutOfRange(format!(
                        "tune must be one of {}",
                        TUNES.join(", ")
                    )));
                }
                self.tune = Some(tune.to_string());
            }
            _ => return Err(PropertyError::Unknown),
        }
        Ok(())
    }

    async fn run(&mut self, mut ctx: StageContext) -> Result<()> {
        info!(
            "{}: {} kbit/s, speed-preset {}, tune {}, keyframe every {} frames",
            ctx.name(),
            self.bitrate,
            self.speed_preset,
            self.tune.as_deref().unwrap_or("none"),
            self.key_interval()
        );
        pump(&mut ctx, |buffer| Ok(Some(self.encode(buffer)))).await?;
        debug!("{}: encoded {} frames", ctx.name(), self.frames);
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

const ADTS_HEADER_LEN: usize = 7;
/// 1024 samples per AAC frame at 48 kHz
const AAC_FRAMES_PER_SECOND: u64 = 48_000 / 1024;
/// Largest frame length an ADTS header can describe
const ADTS_MAX_FRAME: usize = 0x1FFF;

/// AAC encoder (`aacenc`), one ADTS frame per unit
pub struct AacEncoder {
    /// bit/s; 0 selects the encoder default
    bitrate: i64,
}

impl AacEncoder {
    pub fn new() -> Self {
        Self { bitrate: 0 }
    }

    fn frame_budget(&self) -> usize {
        let bitrate = (if self.bitrate == 0 { 128_000 } else { self.bitrate }) as u64;
        ((bitrate / 8 / AAC_FRAMES_PER_SECOND) as usize).min(ADTS_MAX_FRAME - ADTS_HEADER_LEN)
    }

    fn encode(&self, buffer: Buffer) -> Buffer {
        let payload = &buffer.data[..buffer.data.len().min(self.frame_budget())];
        let frame_len = payload.len() + ADTS_HEADER_LEN;

        // MPEG-4 AAC LC, 48 kHz, stereo, no CRC
        let mut out = BytesMut::with_capacity(frame_len);
        out.put_u8(0xFF);
        out.put_u8(0xF1);
        out.put_u8((1 << 6) | (3 << 2));
        out.put_u8((2 << 6) | ((frame_len >> 11) & 0x03) as u8);
        out.put_u8(((frame_len >> 3) & 0xFF) as u8);
        out.put_u8((((frame_len & 0x07) << 5) as u8) | 0x1F);
        out.put_u8(0xFC);
        out.put_slice(payload);

        let mut encoded = Buffer::new(buffer.kind, out.freeze(), buffer.pts, buffer.sequence);
        encoded.is_keyframe = true;
        encoded
    }
}

impl Default for AacEncoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PipelineStage for AacEncoder {
    fn kind(&self) -> &'static str {
        "aacenc"
    }

    fn port_templates(&self) -> Vec<PortTemplate> {
        vec![
            PortTemplate::sink(Caps::new_simple("audio/x-raw")),
            PortTemplate::src(
                Caps::builder("audio/mpeg")
                    .field("mpegversion", 4)
                    .field("stream-format", "adts")
                    .build(),
            ),
        ]
    }

    fn set_property(&mut self, key: &str, value: PropertyValue) -> Result<(), PropertyError> {
        match key {
            "bitrate" => {
                let bitrate = expect_int(&value, 0..=960_000)?;
                if bitrate != 0 && bitrate < 8_000 {
                    return Err(PropertyError::OutOfRange(format!(
                        "{} is below 8000 bit/s",
                        bitrate
                    )));
                }
                self.bitrate = bitrate;
            }
            _ => return Err(PropertyError::Unknown),
        }
        Ok(())
    }

    async fn run(&mut self, mut ctx: StageContext) -> Result<()> {
        debug!("{}: {} bit/s", ctx.name(), self.bitrate);
        pump(&mut ctx, |buffer| Ok(Some(self.encode(buffer)))).await
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{MediaKind, Timestamp};
    use bytes::Bytes;

    fn raw(sequence: u64, len: usize) -> Buffer {
        Buffer::new(
            MediaKind::Video,
            Bytes::from(vec![0xAB; len]),
            Timestamp::from_micros(sequence as i64 * 40_000),
            sequence,
        )
    }

    #[test]
    fn test_contains_idr() {
        assert!(contains_idr(&[0, 0, 0, 1, 0x65, 0x88]));
        assert!(!contains_idr(&[0, 0, 0, 1, 0x41, 0x9a]));
        assert!(contains_idr(&[0xAB, 0, 0, 0, 1, 0x41, 0, 0, 0, 1, 0x65, 0x01]));
        assert!(!contains_idr(&[0, 0, 0, 1]));
    }

    #[test]
    fn test_payload_never_fakes_a_start_code() {
        let mut out = BytesMut::new();
        // Sequence number 261 as big-endian u64 ends in 00 00 01 05
        put_escaped(&mut out, &261u64.to_be_bytes());
        assert_eq!(&out[..], &[0, 0, 3, 0, 0, 3, 0, 0, 3, 1, 5]);
        assert!(!contains_idr(&out));
    }

    #[test]
    fn test_keyframe_interval() {
        let mut enc = H264Encoder::new();
        enc.set_property("key-int-max", PropertyValue::UInt(3)).unwrap();
        let keyframes: Vec<bool> = (0..7).map(|i| enc.encode(raw(i, 64)).is_keyframe).collect();
        assert_eq!(keyframes, vec![true, false, false, true, false, false, true]);
    }

    #[test]
    fn test_bitrate_caps_frame_size() {
        let mut enc = H264Encoder::new();
        // 100 kbit/s at 25 fps leaves 500 bytes per frame
        enc.set_property("bitrate", PropertyValue::UInt(100)).unwrap();
        let out = enc.encode(raw(0, 4096));
        assert_eq!(out.size(), 500 + 5);
        assert_eq!(&out.data[..5], &[0, 0, 0, 1, NAL_IDR]);
    }

    #[test]
    fn test_aac_bitrate_range() {
        let mut enc = AacEncoder::new();
        enc.set_property("bitrate", PropertyValue::Int(128_000)).unwrap();
        enc.set_property("bitrate", PropertyValue::Int(0)).unwrap();
        assert!(enc.set_property("bitrate", PropertyValue::Int(4_000)).is_err());
        assert!(enc.set_property("bitrate", PropertyValue::Int(1_000_000)).is_err());
    }

    #[test]
    fn test_adts_header_length() {
        let enc = AacEncoder::new();
        let out = enc.encode(raw(0, 100));
        assert_eq!(&out.data[..2], &[0xFF, 0xF1]);
        let frame_len = (((out.data[3] & 0x03) as usize) << 11)
            | ((out.data[4] as usize) << 3)
            | ((out.data[5] as usize) >> 5);
        assert_eq!(frame_len, out.size());
    }
}
