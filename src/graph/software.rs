use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use rtrb::{Consumer, Producer, RingBuffer};
use tracing::warn;

use crate::{
    dsp::filter::SVFilter,
    error::EngineError,
    graph::{
        device::AudioDevice,
        node::{NodeId, NodeSpec, ParamKind},
        param::{ParamTimeline, RampCommand},
    },
    MAX_BLOCK_SIZE,
};

/*
Software Output Device
======================

A reference device in two halves, joined by lock-free SPSC ring buffers:

    control thread                          render path
    ──────────────                          ───────────
    SoftwareDevice  ── DeviceCommand ──▶    DeviceRenderer
       mirrors every timeline                owns the nodes, realizes ramps
       hands out NodeIds                     per sample
       reads taps          ◀── f32 ──────    pushes tap samples
    frees nodes         ◀── node ─────    hands back removed nodes
                           ◀── clock ────    frames rendered (atomic)

Node construction (buffers, timelines, output blocks) happens on the control
side; the render path only moves finished nodes into place. Removal is the
mirror image: the renderer unlinks a node and sends the box back, and the
control side drops it the next time it sends a command. The node table holds
MAX_NODES slots from the start and every node reserves MAX_INPUTS inputs, so
the render path never allocates or frees.

Rendering
---------

Each block is pulled from the destination node. A node sums its inputs, then
processes the sum:

    Playback   ignores inputs; loops its buffer with linear interpolation,
               silent until its start time
    Gain       multiplies by the gain timeline, evaluated per sample
    LowPass    one TPT state-variable stage, coefficients per block
    Tap        passes through and copies the block to its ring

Taps usually hang off a voice without reaching the destination, so every tap
is pulled once more after the destination. A visited flag per node keeps
shared subgraphs (and accidental cycles) from rendering twice.
*/

/// Node slots, the destination included.
pub const MAX_NODES: usize = 512;

/// Inputs a single node can sum.
pub const MAX_INPUTS: usize = 64;

enum DeviceCommand {
    Create(Box<RenderNode>),
    Connect { from: NodeId, to: NodeId },
    Start { id: NodeId, at: f64 },
    Stop(NodeId),
    Remove(NodeId),
    Schedule {
        id: NodeId,
        param: ParamKind,
        command: RampCommand,
    },
}

fn find(params: &[(ParamKind, ParamTimeline)], kind: ParamKind) -> Option<&ParamTimeline> {
    params.iter().find(|(k, _)| *k == kind).map(|(_, t)| t)
}

fn find_mut(
    params: &mut [(ParamKind, ParamTimeline)],
    kind: ParamKind,
) -> Option<&mut ParamTimeline> {
    params.iter_mut().find(|(k, _)| *k == kind).map(|(_, t)| t)
}

struct TapReader {
    rx: Consumer<f32>,
    recent: VecDeque<f32>,
    window: usize,
}

impl TapReader {
    fn drain(&mut self) {
        while let Ok(sample) = self.rx.pop() {
            if self.recent.len() == self.window {
                self.recent.pop_front();
            }
            self.recent.push_back(sample);
        }
    }
}

struct MirrorNode {
    id: NodeId,
    params: Vec<(ParamKind, ParamTimeline)>,
    inputs: Vec<u32>,
    stopped: bool,
    tap: Option<TapReader>,
}

impl MirrorNode {
    fn new(id: NodeId, params: Vec<(ParamKind, ParamTimeline)>, tap: Option<TapReader>) -> Self {
        Self {
            id,
            params,
            inputs: Vec::with_capacity(MAX_INPUTS),
            stopped: false,
            tap,
        }
    }
}

/// Control-side handle of the software device.
pub struct SoftwareDevice {
    sample_rate: f32,
    tx: Producer<DeviceCommand>,
    retired: Consumer<Box<RenderNode>>,
    clock: Arc<AtomicU64>,
    nodes: Vec<Option<MirrorNode>>,
    generations: Vec<u32>,
    free: Vec<u32>,
}

impl SoftwareDevice {
    pub fn new(sample_rate: f32, queue_size: usize) -> (SoftwareDevice, DeviceRenderer) {
        let (tx, rx) = RingBuffer::new(queue_size);
        // Every node in the ring arrived through a Remove command, and the
        // control side empties the ring before each send.
        let (retire_tx, retire_rx) = RingBuffer::new(queue_size + 1);
        let clock = Arc::new(AtomicU64::new(0));

        let destination = NodeSpec::Gain { gain: 1.0 };
        let render_destination =
            RenderNode::new(NodeId::DESTINATION, &destination, timelines(&destination), None);

        let mut render_nodes: Vec<Option<Box<RenderNode>>> = (0..MAX_NODES).map(|_| None).collect();
        render_nodes[NodeId::DESTINATION.index as usize] = Some(Box::new(render_destination));

        let mut nodes = Vec::with_capacity(MAX_NODES);
        nodes.push(Some(MirrorNode::new(NodeId::DESTINATION, timelines(&destination), None)));

        let device = SoftwareDevice {
            sample_rate,
            tx,
            retired: retire_rx,
            clock: Arc::clone(&clock),
            nodes,
            generations: vec![0],
            free: Vec::new(),
        };

        let renderer = DeviceRenderer {
            rx,
            retired: retire_tx,
            nodes: render_nodes,
            visited: vec![false; MAX_NODES],
            sample_rate,
            clock,
            frame: 0,
        };

        (device, renderer)
    }

    /// Drop nodes the renderer has handed back. Returns how many.
    pub fn reclaim(&mut self) -> usize {
        let mut reclaimed = 0;
        while self.retired.pop().is_ok() {
            reclaimed += 1;
        }
        reclaimed
    }

    fn send(&mut self, command: DeviceCommand) -> Result<(), EngineError> {
        self.reclaim();
        self.tx.push(command).map_err(|_| {
            warn!("device command queue full, dropping command");
            EngineError::QueueFull
        })
    }

    fn node(&self, id: NodeId) -> Result<&MirrorNode, EngineError> {
        self.nodes
            .get(id.index as usize)
            .and_then(Option::as_ref)
            .filter(|node| node.id == id)
            .ok_or(EngineError::StaleNode(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut MirrorNode, EngineError> {
        self.nodes
            .get_mut(id.index as usize)
            .and_then(Option::as_mut)
            .filter(|node| node.id == id)
            .ok_or(EngineError::StaleNode(id))
    }

    fn allocate(&mut self) -> Result<NodeId, EngineError> {
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.nodes.len() < MAX_NODES => {
                self.nodes.push(None);
                self.generations.push(0);
                (self.nodes.len() - 1) as u32
            }
            None => {
                warn!(max = MAX_NODES, "device node table is full");
                return Err(EngineError::DeviceFull);
            }
        };
        Ok(NodeId::new(index, self.generations[index as usize]))
    }

    /// Number of live nodes, the destination included.
    pub fn node_count(&self) -> usize {
        self.nodes.iter().flatten().count()
    }
}

fn timelines(spec: &NodeSpec) -> Vec<(ParamKind, ParamTimeline)> {
    spec.initial_params()
        .into_iter()
        .map(|(kind, value)| (kind, ParamTimeline::new(value)))
        .collect()
}

impl AudioDevice for SoftwareDevice {
    fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.clock.load(Ordering::Acquire) as f64 / self.sample_rate as f64
    }

    fn create_node(&mut self, spec: NodeSpec) -> Result<NodeId, EngineError> {
        let id = self.allocate()?;

        let (reader, tap_tx) = match spec {
            NodeSpec::Tap { window } => {
                let window = window.max(1);
                // Room for several control ticks between reads
                let (tx, rx) = RingBuffer::new(window * 8);
                let reader = TapReader {
                    rx,
                    recent: VecDeque::with_capacity(window),
                    window,
                };
                (Some(reader), Some(tx))
            }
            _ => (None, None),
        };

        let render = RenderNode::new(id, &spec, timelines(&spec), tap_tx);
        if let Err(err) = self.send(DeviceCommand::Create(Box::new(render))) {
            self.free.push(id.index);
            return Err(err);
        }

        self.nodes[id.index as usize] = Some(MirrorNode::new(id, timelines(&spec), reader));
        Ok(id)
    }

    fn connect(&mut self, from: NodeId, to: NodeId) -> Result<(), EngineError> {
        self.node(from)?;
        if self.node(to)?.inputs.len() >= MAX_INPUTS {
            warn!(%to, max = MAX_INPUTS, "node has no free inputs");
            return Err(EngineError::DeviceFull);
        }
        self.send(DeviceCommand::Connect { from, to })?;
        self.node_mut(to)?.inputs.push(from.index);
        Ok(())
    }

    fn start(&mut self, node: NodeId, at: f64) -> Result<(), EngineError> {
        self.node(node)?;
        self.send(DeviceCommand::Start { id: node, at })
    }

    fn stop(&mut self, node: NodeId) -> Result<(), EngineError> {
        if self.node(node)?.stopped {
            return Err(EngineError::StaleNode(node));
        }
        self.send(DeviceCommand::Stop(node))?;
        self.node_mut(node)?.stopped = true;
        Ok(())
    }

    fn disconnect(&mut self, node: NodeId) -> Result<(), EngineError> {
        self.node(node)?;
        if node == NodeId::DESTINATION {
            return Ok(());
        }
        self.send(DeviceCommand::Remove(node))?;

        let index = node.index as usize;
        self.nodes[index] = None;
        for mirror in self.nodes.iter_mut().flatten() {
            mirror.inputs.retain(|&input| input != node.index);
        }
        self.generations[index] = self.generations[index].wrapping_add(1);
        self.free.push(node.index);
        Ok(())
    }

    fn schedule(
        &mut self,
        node: NodeId,
        param: ParamKind,
        command: RampCommand,
    ) -> Result<(), EngineError> {
        if find(&self.node(node)?.params, param).is_none() {
            return Err(EngineError::StaleNode(node));
        }
        self.send(DeviceCommand::Schedule {
            id: node,
            param,
            command,
        })?;

        let now = self.current_time();
        if let Some(timeline) = find_mut(&mut self.node_mut(node)?.params, param) {
            timeline.prune(now);
            timeline.apply(command);
        }
        Ok(())
    }

    fn param_value(&self, node: NodeId, param: ParamKind) -> Option<f32> {
        let now = self.current_time();
        let node = self.node(node).ok()?;
        find(&node.params, param).map(|timeline| timeline.value_at(now))
    }

    fn timeline(&self, node: NodeId, param: ParamKind) -> Option<&ParamTimeline> {
        find(&self.node(node).ok()?.params, param)
    }

    fn read_tap(&mut self, node: NodeId, out: &mut [f32]) -> usize {
        let Some(tap) = self.node_mut(node).ok().and_then(|n| n.tap.as_mut()) else {
            return 0;
        };
        tap.drain();

        let count = out.len().min(tap.recent.len());
        let skip = tap.recent.len() - count;
        for (slot, &sample) in out.iter_mut().zip(tap.recent.iter().skip(skip)) {
            *slot = sample;
        }
        count
    }

    fn is_live(&self, node: NodeId) -> bool {
        self.node(node).is_ok()
    }
}

enum RenderKind {
    Playback { samples: Arc<[f32]>, position: f64 },
    Gain,
    LowPass(SVFilter),
    Tap(Producer<f32>),
}

struct RenderNode {
    id: NodeId,
    kind: RenderKind,
    params: Vec<(ParamKind, ParamTimeline)>,
    inputs: Vec<u32>,
    output: Vec<f32>,
    start_at: Option<f64>,
    stopped: bool,
}

impl RenderNode {
    fn new(
        id: NodeId,
        spec: &NodeSpec,
        params: Vec<(ParamKind, ParamTimeline)>,
        tap: Option<Producer<f32>>,
    ) -> Self {
        let kind = match (spec, tap) {
            (NodeSpec::Playback { buffer, .. }, _) => RenderKind::Playback {
                samples: buffer.shared(),
                position: 0.0,
            },
            (NodeSpec::LowPass { cutoff, q }, _) => {
                RenderKind::LowPass(SVFilter::lowpass(*cutoff, *q))
            }
            (NodeSpec::Tap { .. }, Some(tx)) => RenderKind::Tap(tx),
            (NodeSpec::Gain { .. }, _) | (NodeSpec::Tap { .. }, None) => RenderKind::Gain,
        };

        Self {
            id,
            kind,
            params,
            inputs: Vec::with_capacity(MAX_INPUTS),
            output: vec![0.0; MAX_BLOCK_SIZE],
            start_at: None,
            stopped: false,
        }
    }

    /// Process the summed input block in place.
    fn process(&mut self, buffer: &mut [f32], start: f64, sample_rate: f32) {
        if self.stopped {
            buffer.fill(0.0);
            return;
        }

        let dt = 1.0 / sample_rate as f64;
        match &mut self.kind {
            RenderKind::Playback { samples, position } => {
                let len = samples.len();
                let rate = find(&self.params, ParamKind::PlaybackRate);

                for (i, out) in buffer.iter_mut().enumerate() {
                    let t = start + i as f64 * dt;
                    let playing = self.start_at.is_some_and(|at| t >= at);
                    if !playing || len == 0 {
                        *out = 0.0;
                        continue;
                    }

                    let pos = *position;
                    let i0 = pos as usize % len;
                    let frac = (pos - pos.floor()) as f32;
                    let a = samples[i0];
                    let b = samples[(i0 + 1) % len];
                    *out = a + (b - a) * frac;

                    let step = rate.map_or(1.0, |r| r.value_at(t)) as f64;
                    *position = (pos + step).rem_euclid(len as f64);
                }
            }
            RenderKind::Gain => {
                if let Some(gain) = find(&self.params, ParamKind::Gain) {
                    for (i, sample) in buffer.iter_mut().enumerate() {
                        *sample *= gain.value_at(start + i as f64 * dt);
                    }
                }
            }
            RenderKind::LowPass(filter) => {
                if let Some(cutoff) = find(&self.params, ParamKind::Frequency) {
                    filter.set_cutoff(cutoff.value_at(start));
                }
                if let Some(q) = find(&self.params, ParamKind::Q) {
                    filter.set_q(q.value_at(start));
                }
                filter.render(buffer, sample_rate);
            }
            RenderKind::Tap(tx) => {
                for &sample in buffer.iter() {
                    if tx.push(sample).is_err() {
                        break;
                    }
                }
            }
        }
    }

    fn is_tap(&self) -> bool {
        matches!(self.kind, RenderKind::Tap(_))
    }
}

/// Render half of the software device. Move it into the audio callback.
pub struct DeviceRenderer {
    rx: Consumer<DeviceCommand>,
    retired: Producer<Box<RenderNode>>,
    nodes: Vec<Option<Box<RenderNode>>>,
    visited: Vec<bool>,
    sample_rate: f32,
    clock: Arc<AtomicU64>,
    frame: u64,
}

impl DeviceRenderer {
    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    /// Seconds rendered so far.
    pub fn time(&self) -> f64 {
        self.frame as f64 / self.sample_rate as f64
    }

    /// Apply pending commands and fill `out` with the destination's signal.
    pub fn render(&mut self, out: &mut [f32]) {
        self.drain_commands();
        for block in out.chunks_mut(MAX_BLOCK_SIZE) {
            self.render_block(block);
        }
    }

    fn live_mut(&mut self, id: NodeId) -> Option<&mut RenderNode> {
        self.nodes
            .get_mut(id.index as usize)?
            .as_deref_mut()
            .filter(|node| node.id == id)
    }

    /// Hand a node back to the control side to be dropped there.
    fn retire(&mut self, node: Box<RenderNode>) {
        // Sized in `SoftwareDevice::new` so this cannot fill
        let _ = self.retired.push(node);
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.rx.pop() {
            match command {
                DeviceCommand::Create(node) => match self.nodes.get_mut(node.id.index as usize) {
                    Some(slot) => {
                        if let Some(old) = slot.replace(node) {
                            self.retire(old);
                        }
                    }
                    None => self.retire(node),
                },
                DeviceCommand::Connect { from, to } => {
                    if let Some(node) = self.live_mut(to) {
                        if node.inputs.len() < node.inputs.capacity() {
                            node.inputs.push(from.index);
                        }
                    }
                }
                DeviceCommand::Start { id, at } => {
                    if let Some(node) = self.live_mut(id) {
                        node.start_at = Some(at);
                    }
                }
                DeviceCommand::Stop(id) => {
                    if let Some(node) = self.live_mut(id) {
                        node.stopped = true;
                    }
                }
                DeviceCommand::Remove(id) => {
                    if self.live_mut(id).is_some() {
                        for node in self.nodes.iter_mut().flatten() {
                            node.inputs.retain(|&input| input != id.index);
                        }
                        if let Some(node) = self.nodes[id.index as usize].take() {
                            self.retire(node);
                        }
                    }
                }
                DeviceCommand::Schedule { id, param, command } => {
                    if let Some(timeline) = self
                        .live_mut(id)
                        .and_then(|node| find_mut(&mut node.params, param))
                    {
                        timeline.apply(command);
                    }
                }
            }
        }
    }

    fn render_block(&mut self, out: &mut [f32]) {
        let frames = out.len();
        let start = self.frame as f64 / self.sample_rate as f64;

        for node in self.nodes.iter_mut().flatten() {
            for (_, timeline) in &mut node.params {
                timeline.prune(start);
            }
        }

        self.visited.fill(false);

        self.pull(NodeId::DESTINATION.index as usize, frames, start);
        for index in 0..self.nodes.len() {
            if self.nodes[index].as_ref().is_some_and(|node| node.is_tap()) {
                self.pull(index, frames, start);
            }
        }

        match self.nodes.first().and_then(Option::as_ref) {
            Some(destination) => out.copy_from_slice(&destination.output[..frames]),
            None => out.fill(0.0),
        }

        self.frame += frames as u64;
        self.clock.store(self.frame, Ordering::Release);
    }

    fn pull(&mut self, index: usize, frames: usize, start: f64) {
        if self.visited[index] {
            return;
        }
        self.visited[index] = true;

        let Some(node) = self.nodes[index].as_mut() else {
            return;
        };
        let inputs = std::mem::take(&mut node.inputs);
        let mut output = std::mem::take(&mut node.output);

        for &input in &inputs {
            if (input as usize) < self.nodes.len() {
                self.pull(input as usize, frames, start);
            }
        }

        let block = &mut output[..frames];
        block.fill(0.0);
        for &input in &inputs {
            if let Some(source) = self.nodes.get(input as usize).and_then(Option::as_ref) {
                // A node still being rendered (cycle) has an empty output
                for (o, s) in block.iter_mut().zip(&source.output) {
                    *o += s;
                }
            }
        }

        if let Some(node) = self.nodes[index].as_mut() {
            node.process(&mut output[..frames], start, self.sample_rate);
            node.output = output;
            node.inputs = inputs;
        }
    }
}
