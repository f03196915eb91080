//! File sink

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use super::{expect_bool, expect_str};
use crate::error::{LinkClosed, PropertyError};
use crate::pipeline::caps::Caps;
use crate::pipeline::stage::{PipelineStage, PortTemplate, StageContext};
use crate::pipeline::types::{DataItem, PropertyValue};

/// Writes every unit it receives to `location`, in order
///
/// The file is created when the graph starts, so an unwritable destination
/// fails the start instead of surfacing mid-run.
pub struct FileSink {
    location: Option<PathBuf>,
    sync: bool,
    append: bool,
    file: Option<BufWriter<File>>,
}

impl FileSink {
    pub fn new() -> Self {
        Self {
            location: None,
            sync: false,
            append: false,
            file: None,
        }
    }

    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }
}

impl Default for FileSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PipelineStage for FileSink {
    fn kind(&self) -> &'static str {
        "filesink"
    }

    fn port_templates(&self) -> Vec<PortTemplate> {
        vec![PortTemplate::sink(Caps::any())]
    }

    fn set_property(&mut self, key: &str, value: PropertyValue) -> Result<(), PropertyError> {
        match key {
            "location" => {
                let location = expect_str(&value)?;
                if location.is_empty() {
                    return Err(PropertyError::OutOfRange("location is empty".to_string()));
                }
                self.location = Some(PathBuf::from(location));
            }
            "sync" => self.sync = expect_bool(&value)?,
            "append" => self.append = expect_bool(&value)?,
            _ => return Err(PropertyError::Unknown),
        }
        Ok(())
    }

    async fn prepare(&mut self) -> Result<()> {
        let location = self.location.as_ref().context("no location set")?;
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .append(self.append)
            .truncate(!self.append)
            .open(location)
            .await
            .with_context(|| format!("cannot open {} for writing", location.display()))?;
        debug!("filesink: opened {}", location.display());
        self.file = Some(BufWriter::new(file));
        Ok(())
    }

    async fn run(&mut self, mut ctx: StageContext) -> Result<()> {
        let mut input = ctx.take_input()?;
        let file = self.file.as_mut().context("file was not opened")?;
        let location = self.location.clone().unwrap_or_default();

        while let Some(item) = input.recv().await {
            match item {
                DataItem::Buffer(buffer) => {
                    file.write_all(&buffer.data)
                        .await
                        .with_context(|| format!("write to {} failed", location.display()))?;
                    ctx.health().record_unit(buffer.size(), buffer.is_keyframe);
                }
                DataItem::Eos => {
                    file.flush().await?;
                    if self.sync {
                        file.get_ref().sync_all().await?;
                    }
                    info!(
                        "{}: wrote {} units ({} bytes) to {}",
                        ctx.name(),
                        ctx.health().units_processed(),
                        ctx.health().bytes_processed(),
                        location.display()
                    );
                    ctx.post_eos();
                    return Ok(());
                }
            }
        }
        Err(LinkClosed::Upstream.into())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
