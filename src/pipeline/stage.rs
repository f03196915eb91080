//! Pipeline stage trait, port templates and the run-time context
//!
//! A stage declares its ports through templates, accepts typed properties
//! before the graph starts, and runs as one async task once the graph is
//! Paused. Data moves between stages over the channels created for each link.

use std::any::Any;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::bus::BusPoster;
use super::caps::Caps;
use super::health::StageHealth;
use super::types::{Buffer, DataItem, PropertyValue};
use crate::error::PropertyError;

/// Channel depth for links whose source port does not ask for something else
pub const DEFAULT_LINK_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

/// Whether a port exists for the stage's lifetime or is created on demand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortPresence {
    Always,
    Request,
}

/// Declaration of a port (or a family of request ports such as `src_%u`)
#[derive(Debug, Clone, PartialEq)]
pub struct PortTemplate {
    pub name: &'static str,
    pub direction: PortDirection,
    pub presence: PortPresence,
    pub caps: Caps,
    /// Role served by ports of this template, for multiplexer inputs
    pub role: Option<&'static str>,
}

impl PortTemplate {
    pub fn sink(caps: Caps) -> Self {
        Self {
            name: "sink",
            direction: PortDirection::Input,
            presence: PortPresence::Always,
            caps,
            role: None,
        }
    }

    pub fn src(caps: Caps) -> Self {
        Self {
            name: "src",
            direction: PortDirection::Output,
            presence: PortPresence::Always,
            caps,
            role: None,
        }
    }

    pub fn request_src(name: &'static str, caps: Caps) -> Self {
        Self {
            name,
            direction: PortDirection::Output,
            presence: PortPresence::Request,
            caps,
            role: None,
        }
    }

    pub fn request_sink(name: &'static str, role: &'static str, caps: Caps) -> Self {
        Self {
            name,
            direction: PortDirection::Input,
            presence: PortPresence::Request,
            caps,
            role: Some(role),
        }
    }

    /// Concrete port name for the n-th request port of this template
    pub fn instance_name(&self, index: u32) -> String {
        self.name.replace("%u", &index.to_string())
    }
}

/// Buffering of the channel behind a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkCapacity {
    Bounded(usize),
    /// Never blocks the sender; used where one consumer must not stall others
    Unbounded,
}

/// Trait for pipeline stages that process media data
///
/// Implementations are the external collaborators of the graph: the graph
/// only sees ports, properties, caps and the `prepare`/`run` entry points.
#[async_trait]
pub trait PipelineStage: Send + Any {
    /// Registry kind this stage was created from, for logging
    fn kind(&self) -> &'static str;

    fn port_templates(&self) -> Vec<PortTemplate>;

    /// Validate and store one configuration value
    fn set_property(&mut self, key: &str, value: PropertyValue) -> Result<(), PropertyError>;

    /// Apply a structured format constraint; only filtering stages accept one
    fn set_caps(&mut self, _caps: Caps) -> Result<(), String> {
        Err(format!("{} does not accept a format constraint", self.kind()))
    }

    /// Caps accepted on an input port
    fn input_caps(&self, template: &PortTemplate) -> Caps {
        template.caps.clone()
    }

    /// Caps produced on an output port given what arrives upstream
    ///
    /// Returns `None` when the stage cannot produce anything from `upstream`.
    fn output_caps(&self, template: &PortTemplate, _upstream: Option<&Caps>) -> Option<Caps> {
        Some(template.caps.clone())
    }

    fn link_capacity(&self, _template: &PortTemplate) -> LinkCapacity {
        LinkCapacity::Bounded(DEFAULT_LINK_CAPACITY)
    }

    /// Roles that must all be linked for the output to be valid
    fn required_roles(&self) -> &'static [&'static str] {
        &[]
    }

    /// Acquire resources (devices, files) on the Ready → Paused transition
    async fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    /// Process data until end-of-stream
    async fn run(&mut self, ctx: StageContext) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
}

pub(crate) enum PadSender {
    Bounded(mpsc::Sender<DataItem>),
    Unbounded(mpsc::UnboundedSender<DataItem>),
}

pub(crate) enum PadReceiver {
    Bounded(mpsc::Receiver<DataItem>),
    Unbounded(mpsc::UnboundedReceiver<DataItem>),
}

/// Create the channel carrying one link
pub(crate) fn link_channel(capacity: LinkCapacity) -> (PadSender, PadReceiver) {
    match capacity {
        LinkCapacity::Bounded(n) => {
            let (tx, rx) = mpsc::channel(n.max(1));
            (PadSender::Bounded(tx), PadReceiver::Bounded(rx))
        }
        LinkCapacity::Unbounded => {
            let (tx, rx) = mpsc::unbounded_channel();
            (PadSender::Unbounded(tx), PadReceiver::Unbounded(rx))
        }
    }
}

impl PadSender {
    /// Returns false once the downstream stage has gone away
    async fn send(&self, item: DataItem) -> bool {
        match self {
            PadSender::Bounded(tx) => tx.send(item).await.is_ok(),
            PadSender::Unbounded(tx) => tx.send(item).is_ok(),
        }
    }
}

/// Receiving end of a linked input port
pub struct InputPad {
    pub name: String,
    pub role: Option<&'static str>,
    rx: PadReceiver,
}

impl InputPad {
    pub(crate) fn new(name: String, role: Option<&'static str>, rx: PadReceiver) -> Self {
        Self { name, role, rx }
    }

    /// Next item, `None` if the upstream task ended without EOS
    pub async fn recv(&mut self) -> Option<DataItem> {
        match &mut self.rx {
            PadReceiver::Bounded(rx) => rx.recv().await,
            PadReceiver::Unbounded(rx) => rx.recv().await,
        }
    }
}

pub(crate) struct OutputPad {
    name: String,
    tx: PadSender,
    open: bool,
}

impl OutputPad {
    pub(crate) fn new(name: String, tx: PadSender) -> Self {
        Self {
            name,
            tx,
            open: true,
        }
    }
}

/// Everything a running stage gets from the graph
pub struct StageContext {
    name: String,
    inputs: Vec<InputPad>,
    outputs: Vec<OutputPad>,
    eos: CancellationToken,
    playing: watch::Receiver<bool>,
    health: Arc<StageHealth>,
    bus: BusPoster,
}

impl StageContext {
    pub(crate) fn new(
        name: String,
        inputs: Vec<InputPad>,
        outputs: Vec<OutputPad>,
        eos: CancellationToken,
        playing: watch::Receiver<bool>,
        health: Arc<StageHealth>,
        bus: BusPoster,
    ) -> Self {
        Self {
            name,
            inputs,
            outputs,
            eos,
            playing,
            health,
            bus,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn health(&self) -> &Arc<StageHealth> {
        &self.health
    }

    /// The single input of a one-input stage
    pub fn take_input(&mut self) -> Result<InputPad> {
        if self.inputs.len() != 1 {
            anyhow::bail!(
                "{} expects exactly one linked input, has {}",
                self.name,
                self.inputs.len()
            );
        }
        Ok(self.inputs.remove(0))
    }

    /// All linked inputs, for stages that merge several streams
    pub fn take_inputs(&mut self) -> Vec<InputPad> {
        std::mem::take(&mut self.inputs)
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Token cancelled when end-of-stream is injected at the source end
    pub fn eos_requested(&self) -> &CancellationToken {
        &self.eos
    }

    /// Suspend until the graph reaches Running (or until it will never do so)
    pub async fn wait_playing(&mut self) {
        while !*self.playing.borrow_and_update() {
            if self.playing.changed().await.is_err() {
                return;
            }
        }
    }

    /// Send a buffer to every linked output, in link order
    ///
    /// Returns false when no downstream consumer is left.
    pub async fn push(&mut self, buffer: Buffer) -> bool {
        self.health.record_unit(buffer.size(), buffer.is_keyframe);

        let mut delivered = false;
        for pad in self.outputs.iter_mut().filter(|p| p.open) {
            if pad.tx.send(DataItem::Buffer(buffer.clone())).await {
                delivered = true;
            } else {
                debug!("{}: downstream of {} went away", self.name, pad.name);
                pad.open = false;
            }
        }
        delivered
    }

    /// Forward end-of-stream to every output
    pub async fn push_eos(&mut self) {
        self.health.record_eos();
        for pad in self.outputs.iter_mut().filter(|p| p.open) {
            pad.open = pad.tx.send(DataItem::Eos).await;
        }
    }

    /// Announce that this stage started producing data
    pub fn post_stream_start(&self) {
        self.bus.stream_start(&self.name);
    }

    /// Report that a sink consumed end-of-stream
    pub fn post_eos(&self) {
        self.health.record_eos();
        self.bus.sink_eos(&self.name);
    }
}
