//! Processing graph: stages, their ports, and the links between them
//!
//! The graph owns every stage added to it. Links are only created through
//! [`GraphBuilder`](super::builder::GraphBuilder), which guarantees a
//! [`Graph`] handed out to callers has passed [`Graph::validate`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use log::debug;

use super::caps::Caps;
use super::stage::{PipelineStage, PortDirection, PortPresence, PortTemplate};
use super::types::PropertyValue;
use crate::error::BuildError;

/// Address of one port: `stage.port`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortRef {
    pub stage: String,
    pub port: String,
}

impl PortRef {
    pub fn new(stage: &str, port: &str) -> Self {
        Self {
            stage: stage.to_string(),
            port: port.to_string(),
        }
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.stage, self.port)
    }
}

/// Directed edge from an output port to an input port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub src: PortRef,
    pub sink: PortRef,
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.sink)
    }
}

pub(crate) struct PortInstance {
    pub name: String,
    pub template: PortTemplate,
    pub peer: Option<PortRef>,
}

pub(crate) struct StageEntry {
    pub name: String,
    pub stage: Box<dyn PipelineStage>,
    pub ports: Vec<PortInstance>,
    templates: Vec<PortTemplate>,
    next_request: HashMap<&'static str, u32>,
}

impl StageEntry {
    fn port(&self, name: &str) -> Option<&PortInstance> {
        self.ports.iter().find(|p| p.name == name)
    }

    fn port_mut(&mut self, name: &str) -> Option<&mut PortInstance> {
        self.ports.iter_mut().find(|p| p.name == name)
    }

    fn has_template(&self, direction: PortDirection) -> bool {
        self.templates.iter().any(|t| t.direction == direction)
    }

    fn linked(&self, direction: PortDirection) -> impl Iterator<Item = &PortInstance> {
        self.ports
            .iter()
            .filter(move |p| p.template.direction == direction && p.peer.is_some())
    }
}

/// A set of stages and links forming one processing graph
pub struct Graph {
    pub(crate) entries: Vec<StageEntry>,
    index: HashMap<String, usize>,
    links: Vec<Link>,
    /// Topological order of `entries`, filled by `validate`
    order: Vec<usize>,
}

impl Graph {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            links: Vec::new(),
            order: Vec::new(),
        }
    }

    pub(crate) fn add(&mut self, name: &str, stage: Box<dyn PipelineStage>) -> Result<(), BuildError> {
        if self.index.contains_key(name) {
            return Err(BuildError::DuplicateStage(name.to_string()));
        }

        let templates = stage.port_templates();
        let ports = templates
            .iter()
            .filter(|t| t.presence == PortPresence::Always)
            .map(|t| PortInstance {
                name: t.name.to_string(),
                template: t.clone(),
                peer: None,
            })
            .collect();

        self.index.insert(name.to_string(), self.entries.len());
        self.entries.push(StageEntry {
            name: name.to_string(),
            stage,
            ports,
            templates,
            next_request: HashMap::new(),
        });
        Ok(())
    }

    fn entry(&self, name: &str) -> Result<&StageEntry, BuildError> {
        self.index
            .get(name)
            .map(|&i| &self.entries[i])
            .ok_or_else(|| BuildError::UnknownStage(name.to_string()))
    }

    fn entry_mut(&mut self, name: &str) -> Result<&mut StageEntry, BuildError> {
        match self.index.get(name) {
            Some(&i) => Ok(&mut self.entries[i]),
            None => Err(BuildError::UnknownStage(name.to_string())),
        }
    }

    pub(crate) fn set_property(
        &mut self,
        stage: &str,
        key: &str,
        value: PropertyValue,
    ) -> Result<(), BuildError> {
        let entry = self.entry_mut(stage)?;
        entry
            .stage
            .set_property(key, value)
            .map_err(|source| BuildError::InvalidProperty {
                stage: stage.to_string(),
                key: key.to_string(),
                source,
            })
    }

    pub(crate) fn set_caps(&mut self, stage: &str, caps: Caps) -> Result<(), BuildError> {
        let entry = self.entry_mut(stage)?;
        entry
            .stage
            .set_caps(caps)
            .map_err(|reason| BuildError::UnsupportedFormat {
                stage: stage.to_string(),
                reason,
            })
    }

    fn create_request_port(
        &mut self,
        stage: &str,
        pick: impl Fn(&PortTemplate) -> bool,
        what: &str,
    ) -> Result<PortRef, BuildError> {
        let entry = self.entry_mut(stage)?;
        let template = entry
            .templates
            .iter()
            .find(|t| t.presence == PortPresence::Request && pick(t))
            .cloned()
            .ok_or_else(|| BuildError::LinkIncompatible {
                src: stage.to_string(),
                sink: what.to_string(),
                reason: format!("{} has no request port for {}", entry.stage.kind(), what),
            })?;

        let counter = entry.next_request.entry(template.name).or_insert(0);
        let name = template.instance_name(*counter);
        *counter += 1;

        entry.ports.push(PortInstance {
            name: name.clone(),
            template,
            peer: None,
        });
        Ok(PortRef::new(stage, &name))
    }

    /// Create a request port from the first template with this direction
    pub(crate) fn request_port(
        &mut self,
        stage: &str,
        direction: PortDirection,
    ) -> Result<PortRef, BuildError> {
        let what = match direction {
            PortDirection::Input => "input",
            PortDirection::Output => "output",
        };
        self.create_request_port(stage, |t| t.direction == direction, what)
    }

    /// Create a request input port serving `role`
    pub(crate) fn request_role_port(&mut self, stage: &str, role: &str) -> Result<PortRef, BuildError> {
        self.create_request_port(
            stage,
            |t| t.direction == PortDirection::Input && t.role == Some(role),
            &format!("role '{}'", role),
        )
    }

    /// Drop an unlinked request port again
    pub(crate) fn release_port(&mut self, port: &PortRef) {
        if let Ok(entry) = self.entry_mut(&port.stage) {
            entry.ports.retain(|p| {
                !(p.name == port.port && p.template.presence == PortPresence::Request && p.peer.is_none())
            });
        }
    }

    /// First unlinked always-present port in `direction`
    pub(crate) fn free_port(&self, stage: &str, direction: PortDirection) -> Result<Option<PortRef>, BuildError> {
        let entry = self.entry(stage)?;
        Ok(entry
            .ports
            .iter()
            .find(|p| {
                p.template.direction == direction
                    && p.template.presence == PortPresence::Always
                    && p.peer.is_none()
            })
            .map(|p| PortRef::new(stage, &p.name)))
    }

    /// Does `stage` have a request template in `direction`
    pub(crate) fn has_request_template(&self, stage: &str, direction: PortDirection) -> Result<bool, BuildError> {
        Ok(self
            .entry(stage)?
            .templates
            .iter()
            .any(|t| t.direction == direction && t.presence == PortPresence::Request))
    }

    /// First request input template whose caps accept `caps`
    pub(crate) fn compatible_request_template(
        &self,
        stage: &str,
        caps: &Caps,
    ) -> Result<Option<&'static str>, BuildError> {
        let entry = self.entry(stage)?;
        Ok(entry
            .templates
            .iter()
            .filter(|t| t.direction == PortDirection::Input && t.presence == PortPresence::Request)
            .find(|t| entry.stage.input_caps(t).can_intersect(caps))
            .map(|t| t.name))
    }

    /// Create a request port from the named template
    pub(crate) fn request_template_port(&mut self, stage: &str, template: &str) -> Result<PortRef, BuildError> {
        self.create_request_port(stage, |t| t.name == template, template)
    }

    pub(crate) fn is_sink_kind(&self, stage: &str) -> Result<bool, BuildError> {
        Ok(!self.entry(stage)?.has_template(PortDirection::Output))
    }

    /// Caps that will flow out of an output port, following passthrough stages upstream
    pub(crate) fn negotiated_caps(&self, port: &PortRef) -> Result<Caps, String> {
        self.negotiated_caps_bounded(port, self.entries.len())
    }

    fn negotiated_caps_bounded(&self, port: &PortRef, budget: usize) -> Result<Caps, String> {
        let entry = self.entry(&port.stage).map_err(|e| e.to_string())?;
        let instance = entry
            .port(&port.port)
            .ok_or_else(|| format!("no port {}", port))?;

        let mut upstream = None;
        if budget > 0
            && let Some(input) = entry.linked(PortDirection::Input).next()
            && let Some(peer) = &input.peer
        {
            let offered = self.negotiated_caps_bounded(peer, budget - 1)?;
            let accepted = entry.stage.input_caps(&input.template);
            upstream = Some(offered.intersect(&accepted).ok_or_else(|| {
                format!("{} offers {} but {} accepts {}", peer, offered, port.stage, accepted)
            })?);
        }

        entry
            .stage
            .output_caps(&instance.template, upstream.as_ref())
            .ok_or_else(|| match &upstream {
                Some(caps) => format!("{} cannot produce output from {}", port.stage, caps),
                None => format!("{} cannot produce output on {}", port.stage, port.port),
            })
    }

    fn check_link_caps(&self, src: &PortRef, sink: &PortRef) -> Result<(), String> {
        let offered = self.negotiated_caps(src)?;
        let entry = self.entry(&sink.stage).map_err(|e| e.to_string())?;
        let instance = entry
            .port(&sink.port)
            .ok_or_else(|| format!("no port {}", sink))?;
        let accepted = entry.stage.input_caps(&instance.template);
        if offered.can_intersect(&accepted) {
            Ok(())
        } else {
            Err(format!("{} produces {} but {} accepts {}", src, offered, sink, accepted))
        }
    }

    pub(crate) fn link_ports(&mut self, src: &PortRef, sink: &PortRef) -> Result<Link, BuildError> {
        let incompatible = |reason: String| BuildError::LinkIncompatible {
            src: src.to_string(),
            sink: sink.to_string(),
            reason,
        };

        if src.stage == sink.stage {
            return Err(incompatible("a stage cannot feed itself".into()));
        }
        for (port, direction) in [(src, PortDirection::Output), (sink, PortDirection::Input)] {
            let entry = self.entry(&port.stage)?;
            let instance = entry
                .port(&port.port)
                .ok_or_else(|| incompatible(format!("{} has no port {}", port.stage, port.port)))?;
            if instance.template.direction != direction {
                return Err(incompatible(format!("{} points the wrong way", port)));
            }
            if let Some(peer) = &instance.peer {
                return Err(incompatible(format!("{} is already linked to {}", port, peer)));
            }
        }
        self.check_link_caps(src, sink).map_err(incompatible)?;

        for (port, peer) in [(src, sink), (sink, src)] {
            if let Some(instance) = self.entry_mut(&port.stage)?.port_mut(&port.port) {
                instance.peer = Some(peer.clone());
            }
        }
        let link = Link {
            src: src.clone(),
            sink: sink.clone(),
        };
        self.links.push(link.clone());
        Ok(link)
    }

    /// Remove a link and release any request port it held
    pub(crate) fn unlink(&mut self, link: &Link) {
        self.links.retain(|l| l != link);
        for port in [&link.src, &link.sink] {
            if let Ok(entry) = self.entry_mut(&port.stage)
                && let Some(instance) = entry.port_mut(&port.port)
            {
                instance.peer = None;
            }
            self.release_port(port);
        }
    }

    /// Check the finished graph is one connected acyclic structure
    pub(crate) fn validate(&mut self) -> Result<(), BuildError> {
        if self.entries.is_empty() {
            return Err(BuildError::Topology("graph has no stages".into()));
        }

        // Request ports nobody linked are given back
        for entry in &mut self.entries {
            let name = &entry.name;
            entry.ports.retain(|p| {
                let unused = p.template.presence == PortPresence::Request && p.peer.is_none();
                if unused {
                    debug!("graph: releasing unlinked {}.{}", name, p.name);
                }
                !unused
            });
        }

        // Property changes after linking can invalidate earlier negotiation
        for link in &self.links {
            self.check_link_caps(&link.src, &link.sink)
                .map_err(|reason| BuildError::LinkIncompatible {
                    src: link.src.to_string(),
                    sink: link.sink.to_string(),
                    reason,
                })?;
        }

        for entry in &self.entries {
            if let Some(port) = entry
                .ports
                .iter()
                .find(|p| p.template.presence == PortPresence::Always && p.peer.is_none())
            {
                return Err(BuildError::Topology(format!(
                    "{}.{} is not linked",
                    entry.name, port.name
                )));
            }
            for direction in [PortDirection::Input, PortDirection::Output] {
                if entry.has_template(direction) && entry.linked(direction).next().is_none() {
                    return Err(BuildError::Topology(format!(
                        "{} has no linked {}",
                        entry.name,
                        if direction == PortDirection::Input { "input" } else { "output" }
                    )));
                }
            }

            let roles: HashSet<&str> = entry
                .linked(PortDirection::Input)
                .filter_map(|p| p.template.role)
                .collect();
            if let Some(missing) = entry
                .stage
                .required_roles()
                .iter()
                .find(|role| !roles.contains(*role))
            {
                return Err(BuildError::MissingRole {
                    mux: entry.name.clone(),
                    role: missing.to_string(),
                });
            }
        }

        self.order = self.topological_order()?;
        self.check_connected()?;
        Ok(())
    }

    fn successors(&self, i: usize) -> impl Iterator<Item = usize> + '_ {
        self.entries[i]
            .linked(PortDirection::Output)
            .filter_map(|p| p.peer.as_ref())
            .filter_map(|peer| self.index.get(&peer.stage).copied())
    }

    fn topological_order(&self) -> Result<Vec<usize>, BuildError> {
        let mut in_degree = vec![0usize; self.entries.len()];
        for i in 0..self.entries.len() {
            for j in self.successors(i) {
                in_degree[j] += 1;
            }
        }

        let mut ready: VecDeque<usize> = (0..self.entries.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.entries.len());
        while let Some(i) = ready.pop_front() {
            order.push(i);
            for j in self.successors(i) {
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    ready.push_back(j);
                }
            }
        }

        if order.len() != self.entries.len() {
            let stuck: Vec<&str> = (0..self.entries.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.entries[i].name.as_str())
                .collect();
            return Err(BuildError::Topology(format!(
                "cycle through {}",
                stuck.join(", ")
            )));
        }
        Ok(order)
    }

    fn check_connected(&self) -> Result<(), BuildError> {
        let mut neighbours: Vec<Vec<usize>> = vec![Vec::new(); self.entries.len()];
        for i in 0..self.entries.len() {
            for j in self.successors(i) {
                neighbours[i].push(j);
                neighbours[j].push(i);
            }
        }

        let mut seen = vec![false; self.entries.len()];
        let mut queue = VecDeque::from([0usize]);
        seen[0] = true;
        while let Some(i) = queue.pop_front() {
            for &j in &neighbours[i] {
                if !seen[j] {
                    seen[j] = true;
                    queue.push_back(j);
                }
            }
        }

        match seen.iter().position(|s| !s) {
            Some(i) => Err(BuildError::Topology(format!(
                "{} is not connected to {}",
                self.entries[i].name, self.entries[0].name
            ))),
            None => Ok(()),
        }
    }

    pub(crate) fn into_parts(self) -> (Vec<StageEntry>, Vec<Link>, Vec<usize>) {
        (self.entries, self.links, self.order)
    }

    pub fn contains(&self, stage: &str) -> bool {
        self.index.contains_key(stage)
    }

    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn stage_kind(&self, stage: &str) -> Option<&'static str> {
        self.entry(stage).ok().map(|e| e.stage.kind())
    }

    /// Names of the ports currently present on `stage`
    pub fn port_names(&self, stage: &str) -> Vec<&str> {
        self.entry(stage)
            .map(|e| e.ports.iter().map(|p| p.name.as_str()).collect())
            .unwrap_or_default()
    }

    /// Stages without inputs
    pub fn sources(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| !e.has_template(PortDirection::Input))
            .map(|e| e.name.as_str())
            .collect()
    }

    /// Stages without outputs
    pub fn sinks(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| !e.has_template(PortDirection::Output))
            .map(|e| e.name.as_str())
            .collect()
    }

    /// Downcast a stage to its concrete type
    pub fn stage_as<T: PipelineStage>(&self, stage: &str) -> Option<&T> {
        self.entry(stage).ok()?.stage.as_any().downcast_ref::<T>()
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("stages", &self.stage_names().collect::<Vec<_>>())
            .field("links", &self.links)
            .finish()
    }
}
