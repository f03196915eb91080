//! Declarative graph assembly
//!
//! The builder is all-or-nothing: every operation either fully applies or
//! leaves the builder as it was, and the only way to obtain a [`Graph`] is
//! [`GraphBuilder::build`], which validates the whole topology first.

use std::collections::HashSet;
use std::path::Path;

use log::{debug, info};

use super::caps::Caps;
use super::graph::{Graph, Link, PortRef};
use super::registry::StageRegistry;
use super::stage::PortDirection;
use super::types::PropertyValue;
use crate::error::BuildError;

pub struct GraphBuilder<'r> {
    registry: &'r StageRegistry,
    graph: Graph,
}

impl<'r> GraphBuilder<'r> {
    pub fn new(registry: &'r StageRegistry) -> Self {
        Self {
            registry,
            graph: Graph::new(),
        }
    }

    /// Create a stage of `kind` and add it under `name`
    pub fn add(&mut self, kind: &str, name: &str) -> Result<(), BuildError> {
        let stage = self.registry.create(kind)?;
        self.graph.add(name, stage)?;
        debug!("builder: added {} ({})", name, kind);
        Ok(())
    }

    /// Add several `(kind, name)` stages in order
    pub fn add_many(&mut self, stages: &[(&str, &str)]) -> Result<(), BuildError> {
        for (kind, name) in stages {
            self.add(kind, name)?;
        }
        Ok(())
    }

    /// Set one property on a stage
    pub fn set(&mut self, stage: &str, key: &str, value: impl Into<PropertyValue>) -> Result<(), BuildError> {
        self.graph.set_property(stage, key, value.into())
    }

    /// Set a format constraint, given in text form, on a filtering stage
    pub fn set_caps(&mut self, stage: &str, caps: &str) -> Result<(), BuildError> {
        let caps: Caps = caps.parse().map_err(|e: super::caps::CapsParseError| {
            BuildError::UnsupportedFormat {
                stage: stage.to_string(),
                reason: e.to_string(),
            }
        })?;
        self.graph.set_caps(stage, caps)
    }

    /// Link `src`'s next output to `sink`'s next input
    ///
    /// Fixed ports are preferred; request ports are created when a stage has
    /// no free fixed port and released again if the link fails.
    pub fn link(&mut self, src: &str, sink: &str) -> Result<Link, BuildError> {
        let (src_port, src_requested) = match self.graph.free_port(src, PortDirection::Output)? {
            Some(port) => (port, false),
            None if self.graph.has_request_template(src, PortDirection::Output)? => {
                (self.graph.request_port(src, PortDirection::Output)?, true)
            }
            None => {
                return Err(BuildError::LinkIncompatible {
                    src: src.to_string(),
                    sink: sink.to_string(),
                    reason: format!("{} has no free output", src),
                });
            }
        };

        let result = self.link_port(&src_port, sink);
        if result.is_err() && src_requested {
            self.graph.release_port(&src_port);
        }
        result
    }

    /// Link an already known output port to `sink`'s next input
    pub fn link_port(&mut self, src: &PortRef, sink: &str) -> Result<Link, BuildError> {
        let sink_port = match self.graph.free_port(sink, PortDirection::Input)? {
            Some(port) => port,
            None => {
                // Pick the request template matching what the source produces
                let offered = self.graph.negotiated_caps(src).map_err(|reason| {
                    BuildError::LinkIncompatible {
                        src: src.to_string(),
                        sink: sink.to_string(),
                        reason,
                    }
                })?;
                let template = self
                    .graph
                    .compatible_request_template(sink, &offered)?
                    .ok_or_else(|| BuildError::LinkIncompatible {
                        src: src.to_string(),
                        sink: sink.to_string(),
                        reason: format!("{} has no free input accepting {}", sink, offered),
                    })?;
                let port = self.graph.request_template_port(sink, template)?;
                return self.link_ports_or_release(src, &port);
            }
        };
        self.graph.link_ports(src, &sink_port)
    }

    fn link_ports_or_release(&mut self, src: &PortRef, requested_sink: &PortRef) -> Result<Link, BuildError> {
        self.graph.link_ports(src, requested_sink).inspect_err(|_| {
            self.graph.release_port(requested_sink);
        })
    }

    fn rollback(&mut self, links: &[Link]) {
        for link in links.iter().rev() {
            debug!("builder: rolling back {}", link);
            self.graph.unlink(link);
        }
    }

    /// Link each consecutive pair of stages in order
    pub fn chain(&mut self, stages: &[&str]) -> Result<Vec<Link>, BuildError> {
        // Fail fast on unknown names before touching anything
        if let Some(missing) = stages.iter().find(|s| !self.graph.contains(s)) {
            return Err(BuildError::UnknownStage(missing.to_string()));
        }

        let mut links = Vec::with_capacity(stages.len().saturating_sub(1));
        for pair in stages.windows(2) {
            match self.link(pair[0], pair[1]) {
                Ok(link) => links.push(link),
                Err(err) => {
                    self.rollback(&links);
                    return Err(err);
                }
            }
        }
        Ok(links)
    }

    /// Link `port` to the first stage of `stages`, then chain the rest
    pub fn chain_from(&mut self, port: &PortRef, stages: &[&str]) -> Result<Vec<Link>, BuildError> {
        let Some(first) = stages.first() else {
            return Ok(Vec::new());
        };
        if let Some(missing) = stages.iter().find(|s| !self.graph.contains(s)) {
            return Err(BuildError::UnknownStage(missing.to_string()));
        }

        let head = self.link_port(port, first)?;
        match self.chain(stages) {
            Ok(mut links) => {
                links.insert(0, head);
                Ok(links)
            }
            Err(err) => {
                self.rollback(&[head]);
                Err(err)
            }
        }
    }

    /// Create `branches` request outputs on a fan-out stage
    pub fn tee(&mut self, source: &str, branches: usize) -> Result<Vec<PortRef>, BuildError> {
        if branches == 0 {
            return Err(BuildError::Topology(format!("{} needs at least one branch", source)));
        }

        let mut ports = Vec::with_capacity(branches);
        for _ in 0..branches {
            match self.graph.request_port(source, PortDirection::Output) {
                Ok(port) => ports.push(port),
                Err(err) => {
                    for port in &ports {
                        self.graph.release_port(port);
                    }
                    return Err(err);
                }
            }
        }
        debug!("builder: {} fans out to {} branches", source, branches);
        Ok(ports)
    }

    /// Link each `(source, role)` into a matching request input of `mux`
    pub fn merge(&mut self, mux: &str, inputs: &[(&str, &str)]) -> Result<String, BuildError> {
        if !self.graph.contains(mux) {
            return Err(BuildError::UnknownStage(mux.to_string()));
        }
        if let Some((missing, _)) = inputs.iter().find(|(s, _)| !self.graph.contains(s)) {
            return Err(BuildError::UnknownStage(missing.to_string()));
        }

        let mut roles = HashSet::new();
        for (_, role) in inputs {
            if !roles.insert(*role) {
                return Err(BuildError::DuplicateRole {
                    mux: mux.to_string(),
                    role: role.to_string(),
                });
            }
        }
        let required = self.required_roles(mux);
        if let Some(role) = required.iter().find(|r| !roles.contains(*r)) {
            return Err(BuildError::MissingRole {
                mux: mux.to_string(),
                role: role.to_string(),
            });
        }

        let mut links = Vec::with_capacity(inputs.len());
        for (source, role) in inputs {
            let result = self.link_role(source, mux, role);
            match result {
                Ok(link) => links.push(link),
                Err(err) => {
                    self.rollback(&links);
                    return Err(err);
                }
            }
        }
        Ok(mux.to_string())
    }

    fn required_roles(&self, mux: &str) -> &'static [&'static str] {
        self.graph
            .entries
            .iter()
            .find(|e| e.name == mux)
            .map(|e| e.stage.required_roles())
            .unwrap_or(&[])
    }

    fn link_role(&mut self, source: &str, mux: &str, role: &str) -> Result<Link, BuildError> {
        let src_port = self
            .graph
            .free_port(source, PortDirection::Output)?
            .ok_or_else(|| BuildError::LinkIncompatible {
                src: source.to_string(),
                sink: mux.to_string(),
                reason: format!("{} has no free output", source),
            })?;
        let sink_port = self.graph.request_role_port(mux, role)?;
        self.link_ports_or_release(&src_port, &sink_port)
    }

    /// Point a sink stage at its destination
    pub fn sink_to(&mut self, stage: &str, destination: impl AsRef<Path>) -> Result<(), BuildError> {
        if !self.graph.is_sink_kind(stage)? {
            return Err(BuildError::Topology(format!("{} is not a sink", stage)));
        }
        let destination = destination.as_ref().to_string_lossy().into_owned();
        self.set(stage, "location", destination)
    }

    /// Validate and hand out the finished graph
    pub fn build(mut self) -> Result<Graph, BuildError> {
        self.graph.validate()?;
        info!(
            "builder: graph ready with {} stages and {} links",
            self.graph.stage_names().count(),
            self.graph.links().len()
        );
        Ok(self.graph)
    }

    /// Graph under construction, for inspection
    pub fn graph(&self) -> &Graph {
        &self.graph
    }
}
