//! Recorder configuration
//!
//! Every field has a default, so the recorder runs without a config file. A
//! JSON file may override any subset of the values.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Capture device; synthetic frames when unset
    pub device: Option<PathBuf>,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    /// kbit/s
    pub bitrate: u32,
    pub speed_preset: u32,
    pub tune: String,
    /// 0 lets the encoder decide
    pub key_int_max: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            device: None,
            width: 1280,
            height: 720,
            framerate: 25,
            bitrate: 3800,
            speed_preset: 3,
            tune: "zerolatency".to_string(),
            key_int_max: 0,
        }
    }
}

impl VideoConfig {
    /// Format constraint applied before encoding
    pub fn caps(&self) -> String {
        format!(
            "video/x-raw, width={}, height={}, framerate={}/1",
            self.width, self.height, self.framerate
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub device: Option<PathBuf>,
    pub rate: u32,
    pub channels: u32,
    /// bit/s
    pub bitrate: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: None,
            rate: 48000,
            channels: 2,
            bitrate: 128000,
        }
    }
}

impl AudioConfig {
    pub fn caps(&self) -> String {
        format!("audio/x-raw, rate={}, channels={}", self.rate, self.channels)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub video: VideoConfig,
    pub audio: AudioConfig,
    /// Write the container progressively instead of index-first at the end
    pub streamable: bool,
    /// One file per tee branch
    pub outputs: Vec<PathBuf>,
    /// Units each capture source produces; unbounded when unset
    pub units: Option<u64>,
    /// Pace capture in real time
    pub live: bool,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            video: VideoConfig::default(),
            audio: AudioConfig::default(),
            streamable: true,
            outputs: vec![PathBuf::from("fileOne.mp4"), PathBuf::from("fileTwo.mp4")],
            units: None,
            live: true,
        }
    }
}

impl RecorderConfig {
    /// Read overrides from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
    }
}

/// Returns a version as specified in Cargo.toml
pub fn app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_recording_constants() {
        let config = RecorderConfig::default();
        assert_eq!(
            config.video.caps(),
            "video/x-raw, width=1280, height=720, framerate=25/1"
        );
        assert_eq!(config.audio.caps(), "audio/x-raw, rate=48000, channels=2");
        assert_eq!(config.video.bitrate, 3800);
        assert_eq!(config.audio.bitrate, 128000);
        assert!(config.streamable);
        assert_eq!(config.outputs.len(), 2);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: RecorderConfig =
            serde_json::from_str(r#"{ "video": { "bitrate": 2000 }, "units": 50 }"#).unwrap();
        assert_eq!(config.video.bitrate, 2000);
        assert_eq!(config.video.width, 1280);
        assert_eq!(config.units, Some(50));
        assert_eq!(config.outputs[0], PathBuf::from("fileOne.mp4"));
    }

    #[test]
    fn test_load_reports_path() {
        let err = RecorderConfig::load(Path::new("/nonexistent/avrecord.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/avrecord.json"));
    }
}
