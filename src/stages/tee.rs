//! Fan-out stage

use anyhow::Result;
use async_trait::async_trait;
use log::debug;

use super::pump;
use crate::error::PropertyError;
use crate::pipeline::caps::Caps;
use crate::pipeline::stage::{LinkCapacity, PipelineStage, PortPresence, PortTemplate, StageContext};
use crate::pipeline::types::PropertyValue;

/// Replicates every unit onto each `src_%u` request port
///
/// Branch links never block, so a slow branch (behind its own queue) cannot
/// stall its siblings.
pub struct Tee;

impl Tee {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Tee {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PipelineStage for Tee {
    fn kind(&self) -> &'static str {
        "tee"
    }

    fn port_templates(&self) -> Vec<PortTemplate> {
        vec![
            PortTemplate::sink(Caps::any()),
            PortTemplate::request_src("src_%u", Caps::any()),
        ]
    }

    fn set_property(&mut self, _key: &str, _value: PropertyValue) -> Result<(), PropertyError> {
        Err(PropertyError::Unknown)
    }

    fn output_caps(&self, template: &PortTemplate, upstream: Option<&Caps>) -> Option<Caps> {
        Some(upstream.cloned().unwrap_or_else(|| template.caps.clone()))
    }

    fn link_capacity(&self, template: &PortTemplate) -> LinkCapacity {
        match template.presence {
            PortPresence::Request => LinkCapacity::Unbounded,
            PortPresence::Always => LinkCapacity::Bounded(crate::pipeline::stage::DEFAULT_LINK_CAPACITY),
        }
    }

    async fn run(&mut self, mut ctx: StageContext) -> Result<()> {
        debug!("{}: replicating onto {} branches", ctx.name(), ctx.output_count());
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
    fn test_branches_are_unbounded() {
        let tee = Tee::new();
        let templates = tee.port_templates();
        assert_eq!(templates[1].instance_name(3), "src_3");
        assert_eq!(tee.link_capacity(&templates[1]), LinkCapacity::Unbounded);
    }
}
