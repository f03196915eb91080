//! MP4 multiplexer merging one audio and one video elementary stream

use anyhow::Result;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::StreamExt;
use futures_util::stream::{self, select_all};
use log::{debug, info};

use super::expect_bool;
use crate::error::{LinkClosed, PropertyError};
use crate::pipeline::caps::Caps;
use crate::pipeline::stage::{PipelineStage, PortTemplate, StageContext};
use crate::pipeline::types::{Buffer, DataItem, MediaKind, PropertyValue, Timestamp};

const ROLES: &[&str] = &["audio", "video"];

/// Samples of one input, in arrival order
#[derive(Debug, Default)]
struct Track {
    role: &'static str,
    sizes: Vec<u32>,
    sync_samples: Vec<u32>,
    first_pts: Option<Timestamp>,
    last_pts: Timestamp,
    eos: bool,
}

impl Track {
    fn handler(&self) -> &'static [u8; 4] {
        match self.role {
            "audio" => b"soun",
            _ => b"vide",
        }
    }

    fn record(&mut self, buffer: &Buffer) {
        self.sizes.push(buffer.size() as u32);
        if buffer.is_keyframe {
            self.sync_samples.push(self.sizes.len() as u32);
        }
        self.first_pts.get_or_insert(buffer.pts);
        self.last_pts = buffer.pts;
    }

    fn duration_micros(&self) -> u64 {
        match self.first_pts {
            Some(first) => (self.last_pts.micros - first.micros).max(0) as u64,
            None => 0,
        }
    }
}

/// Write one ISO BMFF box around whatever `body` appends
fn put_box(out: &mut BytesMut, fourcc: &[u8; 4], body: impl FnOnce(&mut BytesMut)) {
    let start = out.len();
    out.put_u32(0);
    out.put_slice(fourcc);
    body(out);
    let size = (out.len() - start) as u32;
    out[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

/// `mp4mux`: merges the `audio` and `video` roles into one container stream
///
/// With `streamable` every sample goes out as soon as it arrives and the
/// sample index trails the data. Otherwise the whole file is held until
/// end-of-stream and written index-first.
pub struct Mp4Mux {
    streamable: bool,
}

impl Mp4Mux {
    pub fn new() -> Self {
        Self { streamable: false }
    }

    fn file_type() -> Bytes {
        let mut out = BytesMut::new();
        put_box(&mut out, b"ftyp", |b| {
            b.put_slice(b"isom");
            b.put_u32(0x200);
            b.put_slice(b"isomiso2avc1mp41");
        });
        out.freeze()
    }

    fn movie(tracks: &[Track]) -> Bytes {
        let mut out = BytesMut::new();
        put_box(&mut out, b"moov", |moov| {
            for (i, track) in tracks.iter().enumerate() {
                put_box(moov, b"trak", |trak| {
                    put_box(trak, b"tkhd", |b| {
                        b.put_u32(i as u32 + 1);
                        b.put_u64(track.duration_micros());
                    });
                    put_box(trak, b"hdlr", |b| b.put_slice(track.handler()));
                    put_box(trak, b"stsz", |b| {
                        b.put_u32(track.sizes.len() as u32);
                        track.sizes.iter().for_each(|s| b.put_u32(*s));
                    });
                    if track.role == "video" {
                        put_box(trak, b"stss", |b| {
                            b.put_u32(track.sync_samples.len() as u32);
                            track.sync_samples.iter().for_each(|s| b.put_u32(*s));
                        });
                    }
                });
            }
        });
        out.freeze()
    }

    fn sample(data: &Bytes) -> Bytes {
        let mut out = BytesMut::with_capacity(data.len() + 8);
        put_box(&mut out, b"mdat", |b| b.put_slice(data));
        out.freeze()
    }
}

impl Default for Mp4Mux {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PipelineStage for Mp4Mux {
    fn kind(&self) -> &'static str {
        "mp4mux"
    }

    fn port_templates(&self) -> Vec<PortTemplate> {
        vec![
            PortTemplate::src(Caps::builder("video/quicktime").field("variant", "iso").build()),
            PortTemplate::request_sink("audio_%u", "audio", Caps::new_simple("audio/mpeg")),
            PortTemplate::request_sink("video_%u", "video", Caps::new_simple("video/x-h264")),
        ]
    }

    fn set_property(&mut self, key: &str, value: PropertyValue) -> Result<(), PropertyError> {
        match key {
            "streamable" => self.streamable = expect_bool(&value)?,
            _ => return Err(PropertyError::Unknown),
        }
        Ok(())
    }

    fn required_roles(&self) -> &'static [&'static str] {
        ROLES
    }

    async fn run(&mut self, mut ctx: StageContext) -> Result<()> {
        let inputs = ctx.take_inputs();
        let mut tracks: Vec<Track> = inputs
            .iter()
            .map(|pad| Track {
                role: pad.role.unwrap_or("data"),
                ..Default::default()
            })
            .collect();

        let mut merged = select_all(inputs.into_iter().enumerate().map(|(i, pad)| {
            Box::pin(stream::unfold(Some(pad), move |state| async move {
                let mut pad = state?;
                let item = pad.recv().await;
                let finished = matches!(item, None | Some(DataItem::Eos));
                Some(((i, item), if finished { None } else { Some(pad) }))
            }))
        }));

        // Samples held back until end-of-stream when not streamable
        let mut pending = BytesMut::new();
        let mut sequence = 0u64;
        let mut last_pts = Timestamp::default();

        if self.streamable {
            let header = Buffer::new(MediaKind::Container, Self::file_type(), last_pts, sequence);
            if !ctx.push(header).await {
                return Err(LinkClosed::Downstream.into());
            }
            sequence += 1;
        }

        while let Some((i, item)) = merged.next().await {
            let track = &mut tracks[i];
            match item {
                Some(DataItem::Buffer(buffer)) => {
                    track.record(&buffer);
                    last_pts = last_pts.max(buffer.pts);
                    let sample = Self::sample(&buffer.data);
                    if self.streamable {
                        let mut out = Buffer::new(MediaKind::Container, sample, buffer.pts, sequence);
                        out.is_keyframe = buffer.is_keyframe && track.role == "video";
                        if !ctx.push(out).await {
                            return Err(LinkClosed::Downstream.into());
                        }
                        sequence += 1;
                    } else {
                        pending.extend_from_slice(&sample);
                    }
                }
                Some(DataItem::Eos) => {
                    debug!("{}: {} input reached end-of-stream", ctx.name(), track.role);
                    track.eos = true;
                }
                None => {
                    debug!("{}: {} input closed without end-of-stream", ctx.name(), track.role);
                    return Err(LinkClosed::Upstream.into());
                }
            }
        }

        let movie = Self::movie(&tracks);
        let tail = if self.streamable {
            movie
        } else {
            let ftyp = Self::file_type();
            let mut file = BytesMut::with_capacity(ftyp.len() + movie.len() + pending.len());
            file.extend_from_slice(&ftyp);
            file.extend_from_slice(&movie);
            file.extend_from_slice(&pending);
            file.freeze()
        };
        if !ctx.push(Buffer::new(MediaKind::Container, tail, last_pts, sequence)).await {
            return Err(LinkClosed::Downstream.into());
        }

        for track in &tracks {
            info!(
                "{}: {} track, {} samples, {} sync",
                ctx.name(),
                track.role,
                track.sizes.len(),
                track.sync_samples.len()
            );
        }
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
    fn test_box_sizes_are_patched() {
        let ftyp = Mp4Mux::file_type();
        assert_eq!(u32::from_be_bytes([ftyp[0], ftyp[1], ftyp[2], ftyp[3]]) as usize, ftyp.len());
        assert_eq!(&ftyp[4..8], b"ftyp");

        let sample = Mp4Mux::sample(&Bytes::from_static(b"abc"));
        assert_eq!(sample.len(), 11);
        assert_eq!(&sample[4..8], b"mdat");
    }

    #[test]
    fn test_movie_lists_sync_samples_for_video_only() {
        let mut video = Track {
            role: "video",
            ..Default::default()
        };
        let mut audio = Track {
            role: "audio",
            ..Default::default()
        };
        for i in 0..4u64 {
            let mut buffer = Buffer::new(
                MediaKind::Video,
                Bytes::from_static(b"frame"),
                Timestamp::from_micros(i as i64 * 40_000),
                i,
            );
            buffer.is_keyframe = i % 2 == 0;
            video.record(&buffer);
            audio.record(&buffer);
        }
        assert_eq!(video.sync_samples, vec![1, 3]);
        assert_eq!(video.duration_micros(), 120_000);

        let movie = Mp4Mux::movie(&[audio, video]);
        assert_eq!(&movie[4..8], b"moov");
        let stss = movie.windows(4).filter(|w| *w == b"stss").count();
        assert_eq!(stss, 1);
    }

    #[test]
    fn test_requires_both_roles() {
        let mux = Mp4Mux::new();
        assert_eq!(mux.required_roles(), &["audio", "video"]);
    }
}
