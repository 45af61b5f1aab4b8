use crate::config::{BuildOptions, QueueType};
use crate::core::error::EngineError;
use crate::core::types::Layout;
use crate::device::{Buffer, Event, Stream};
use crate::engine::Engine;
use crate::program::Program;
use crate::registry::InstanceContext;
use crate::runtime::PrimitiveInst;
use crate::topology::Topology;
use anyhow::{Context, anyhow};
use petgraph::stable_graph::NodeIndex;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, trace};

static NEXT_NETWORK_ID: AtomicU32 = AtomicU32::new(1);

/// Result of one output after `execute`: its memory and the event that
/// completes once the memory holds the result.
#[derive(Debug, Clone)]
pub struct NetworkOutput {
    buffer: Buffer,
    event: Event,
}

impl NetworkOutput {
    pub fn memory(&self) -> &Buffer {
        &self.buffer
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Waits for the event and reads the values.
    pub fn to_f64_vec(&self) -> anyhow::Result<Vec<f64>> {
        self.event.wait();
        self.buffer.to_f64_vec()
    }

    pub fn to_f32_vec(&self) -> anyhow::Result<Vec<f32>> {
        self.event.wait();
        self.buffer.to_f32_vec()
    }
}

/// Diagnostic view of one primitive, serialized by `get_primitive_info`.
#[derive(Debug, Clone, Serialize)]
pub struct PrimitiveInfo {
    pub id: String,
    pub kind: String,
    pub description: String,
    pub layout: String,
    pub dependencies: Vec<String>,
    pub users: Vec<String>,
    pub kernel: Option<String>,
    pub fused: Vec<String>,
    pub is_input: bool,
    pub is_output: bool,
    pub is_constant: bool,
    pub can_be_optimized: bool,
    pub executed: bool,
    pub memory_dependencies: Vec<String>,
}

/// One execution context over a built program.
pub struct Network {
    id: u32,
    engine: Arc<Engine>,
    program: Arc<Program>,
    stream: Arc<dyn Stream>,
    internal: bool,
    instances: Vec<PrimitiveInst>,
    index: HashMap<String, usize>,
    /// Instances updated each run, in processing order.
    update_order: Vec<usize>,
    events: HashMap<String, Event>,
    executed: Vec<String>,
    ext_id_mapping: BTreeMap<String, String>,
    /// Output id -> instances sharing its memory.
    output_chains: HashMap<String, Vec<usize>>,
    synchronous_reuse: bool,
}

/// The instance whose memory `pos` views: aliases are followed to their source.
fn alias_root(instances: &[PrimitiveInst], mut pos: usize) -> usize {
    let mut hops = 0;
    while instances[pos].can_be_optimized() && hops < instances.len() {
        match instances[pos].deps.first() {
            Some(dep) => pos = *dep,
            None => break,
        }
        hops += 1;
    }
    pos
}

impl Network {
    pub fn new(program: Arc<Program>, stream: Arc<dyn Stream>) -> anyhow::Result<Self> {
        let internal = program.is_internal();
        Self::create(program, stream, internal)
    }

    /// Network over a nested program; never shares pooled memory.
    pub fn new_internal(program: Arc<Program>, stream: Arc<dyn Stream>) -> anyhow::Result<Self> {
        Self::create(program, stream, true)
    }

    pub fn build(engine: &Arc<Engine>, topology: &Topology, options: BuildOptions) -> anyhow::Result<Self> {
        let stream = engine.device().create_stream(options.queue_type)?;
        let program = Program::build(engine, topology, options)?;
        Self::new(Arc::new(program), stream)
    }

    fn create(program: Arc<Program>, stream: Arc<dyn Stream>, internal: bool) -> anyhow::Result<Self> {
        // In-order liveness lets nodes on parallel branches share pooled buffers.
        let planned = program.options().queue_type;
        if !internal && planned == QueueType::InOrder && stream.queue_type() == QueueType::OutOfOrder {
            return Err(EngineError::QueueTypeMismatch { program: planned, stream: stream.queue_type() }.into());
        }
        let engine = program.engine().clone();
        let id = NEXT_NETWORK_ID.fetch_add(1, Ordering::Relaxed);
        let order = program.processing_order().to_vec();
        let positions: HashMap<NodeIndex, usize> = order.iter().enumerate().map(|(i, idx)| (*idx, i)).collect();

        let ctx = InstanceContext { engine: &engine, stream: &stream, network_id: id };
        let mut instances = Vec::with_capacity(order.len());
        let mut index = HashMap::new();
        for idx in &order {
            let inst = PrimitiveInst::new(&program, *idx, &ctx).with_context(|| format!("Failed to create instance of '{}'", program.node(*idx).id()))?;
            index.insert(inst.id().to_string(), instances.len());
            instances.push(inst);
        }

        for (i, idx) in order.iter().enumerate() {
            let deps: Vec<usize> = program.dependencies(*idx).iter().map(|d| positions[d]).collect();
            let mut exec_deps = Vec::new();
            for d in &deps {
                let dep = &instances[*d];
                if dep.executes {
                    exec_deps.push(*d);
                } else if dep.can_be_optimized() {
                    exec_deps.extend(dep.exec_deps.iter().copied());
                }
            }
            exec_deps.sort_unstable();
            exec_deps.dedup();
            let inst = &mut instances[i];
            inst.mutable_input = deps.iter().map(|d| program.node(order[*d])).any(|dep| dep.is_input() || dep.can_be_optimized());
            inst.deps = deps;
            inst.exec_deps = exec_deps;
        }

        // Largest buffers first so that the pool hands out big blocks early.
        let mut by_size: Vec<usize> = (0..instances.len()).collect();
        by_size.sort_by_key(|i| Reverse(instances[*i].layout().byte_size().unwrap_or(0)));
        for i in by_size {
            let node = program.node(order[i]);
            instances[i].allocate_output(&engine, node.memory_dependencies(), id)?;
        }
        for i in 0..instances.len() {
            if instances[i].can_be_optimized() {
                let source = instances[i].deps.first().and_then(|d| instances[*d].output().cloned());
                if let Some(source) = source {
                    instances[i].alias(&source)?;
                }
            }
        }

        let mut output_chains = HashMap::new();
        for pos in (0..instances.len()).filter(|i| instances[*i].is_output()) {
            let root = alias_root(&instances, pos);
            let chain: Vec<usize> = (0..instances.len()).filter(|i| alias_root(&instances, *i) == root).collect();
            output_chains.insert(instances[pos].id().to_string(), chain);
        }

        let update_order: Vec<usize> =
            (0..instances.len()).filter(|i| !(instances[*i].is_constant() && instances[*i].deps.is_empty())).collect();

        let mut ext_id_mapping: BTreeMap<String, String> = index.keys().map(|k| (k.clone(), k.clone())).collect();
        for (removed, replaced_by) in program.get_optimized() {
            if let Some(target) = replaced_by.last() {
                ext_id_mapping.insert(removed.clone(), target.clone());
            }
        }
        // Chains of removals resolve to a surviving id.
        let snapshot = ext_id_mapping.clone();
        for target in ext_id_mapping.values_mut() {
            let mut hops = 0;
            while let Some(next) = snapshot.get(target.as_str()) {
                if next == target || hops > snapshot.len() {
                    break;
                }
                *target = next.clone();
                hops += 1;
            }
        }

        info!(network = id, program = program.id(), instances = instances.len(), internal, "network created");
        Ok(Self {
            id,
            engine,
            program,
            stream,
            internal,
            instances,
            index,
            update_order,
            events: HashMap::new(),
            executed: Vec::new(),
            ext_id_mapping,
            output_chains,
            synchronous_reuse: false,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn stream(&self) -> &Arc<dyn Stream> {
        &self.stream
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    /// When enabled, `execute` first waits for whatever the previous run
    /// still has in flight, so its buffers can be rewritten safely.
    pub fn set_synchronous_reuse(&mut self, enabled: bool) {
        self.synchronous_reuse = enabled;
    }

    /// Forgets the events of the previous run, waiting for the pending ones
    /// first when `wait` is set.
    fn reset_execution(&mut self, wait: bool) -> anyhow::Result<()> {
        if wait {
            let pending: Vec<Event> = self.events.values().filter(|e| !e.is_set()).cloned().collect();
            if !pending.is_empty() {
                trace!(network = self.id, pending = pending.len(), "waiting for previous run");
                self.stream.wait_for_events(&pending)?;
            }
        }
        self.events.clear();
        Ok(())
    }

    fn position(&self, id: &str) -> anyhow::Result<usize> {
        let resolved = self.ext_id_mapping.get(id).map(String::as_str).unwrap_or(id);
        self.index.get(resolved).copied().ok_or_else(|| EngineError::UnknownPrimitive(id.to_string()).into())
    }

    pub fn get_input_ids(&self) -> Vec<String> {
        self.program.get_input_ids()
    }

    pub fn get_output_ids(&self) -> Vec<String> {
        self.program.get_output_ids()
    }

    /// External id -> id of the instance carrying its result.
    pub fn get_ext_id_mapping(&self) -> &BTreeMap<String, String> {
        &self.ext_id_mapping
    }

    pub fn set_input_data(&mut self, id: &str, buffer: Buffer) -> anyhow::Result<()> {
        let pos = *self.index.get(id).ok_or_else(|| EngineError::UnknownPrimitive(id.to_string()))?;
        let inst = &self.instances[pos];
        if !inst.is_input() {
            return Err(EngineError::NotAnInput(id.to_string()).into());
        }
        let declared = self.program.node(inst.node()).output_layout()?;
        let actual = buffer.layout();
        if actual.dtype != declared.dtype || actual.is_dynamic() || !actual.shape.is_compatible_with(&declared.shape) {
            return Err(EngineError::LayoutMismatch { id: id.to_string(), expected: declared.to_string(), actual: actual.to_string() }.into());
        }
        trace!(network = self.id, input = id, layout = %actual, "input set");
        self.reset_execution(true)?;
        self.instances[pos].set_input(buffer);
        Ok(())
    }

    /// Replaces the memory of an output. Every instance in its output chain
    /// moves to the new buffer and their consumers rebind before the next run.
    pub fn set_output_memory(&mut self, id: &str, buffer: Buffer) -> anyhow::Result<()> {
        let pos = self.position(id)?;
        let inst = &self.instances[pos];
        if !inst.is_output() {
            return Err(EngineError::NotAnOutput(id.to_string()).into());
        }
        if buffer.layout() != inst.layout() {
            return Err(EngineError::LayoutMismatch { id: id.to_string(), expected: inst.layout().to_string(), actual: buffer.layout().to_string() }.into());
        }
        let key = inst.id().to_string();
        self.reset_execution(true)?;

        let chain = self.output_chains.get(&key).cloned().unwrap_or_else(|| vec![pos]);
        for member in &chain {
            let layout = self.instances[*member].layout().clone();
            self.instances[*member].set_output(buffer.reinterpret(&layout)?);
        }
        for inst in &mut self.instances {
            if inst.deps.iter().any(|d| chain.contains(d)) {
                inst.invalidate_arguments();
            }
        }
        debug!(network = self.id, output = id, chain = chain.len(), "output memory replaced");
        Ok(())
    }

    pub fn get_output_memory(&self, id: &str) -> anyhow::Result<Buffer> {
        let pos = self.position(id)?;
        self.instances[pos].output().cloned().ok_or_else(|| anyhow!("'{}' has no memory allocated yet", id))
    }

    /// Memory and event of a declared output from the last run.
    pub fn get_output(&self, id: &str) -> anyhow::Result<NetworkOutput> {
        let pos = self.position(id)?;
        let inst = &self.instances[pos];
        if !inst.is_output() {
            return Err(EngineError::NotAnOutput(id.to_string()).into());
        }
        let event = self.events.get(inst.id()).cloned().ok_or_else(|| anyhow!("output '{}' has not been computed yet", id))?;
        Ok(NetworkOutput { buffer: self.get_output_memory(id)?, event })
    }

    pub fn get_primitive_event(&self, id: &str) -> anyhow::Result<Event> {
        let pos = self.position(id)?;
        self.events.get(self.instances[pos].id()).cloned().ok_or_else(|| anyhow!("no event recorded for '{}'", id))
    }

    pub fn has_event(&self, id: &str) -> bool {
        self.position(id).is_ok_and(|pos| self.events.contains_key(self.instances[pos].id()))
    }

    /// Ids submitted to the stream during the last run, in submission order.
    pub fn get_executed_ids(&self) -> Vec<String> {
        self.executed.clone()
    }

    pub fn impl_updates(&self, id: &str) -> anyhow::Result<usize> {
        Ok(self.instances[self.position(id)?].impl_updates())
    }

    pub fn primitive_info(&self, id: &str) -> anyhow::Result<PrimitiveInfo> {
        let pos = self.position(id)?;
        let inst = &self.instances[pos];
        let node = self.program.node(inst.node());
        let ids = |nodes: Vec<NodeIndex>| nodes.into_iter().map(|n| self.program.node(n).id().to_string()).collect::<Vec<_>>();
        Ok(PrimitiveInfo {
            id: inst.id().to_string(),
            kind: node.kind().to_string(),
            description: (node.node_type().to_string)(node),
            layout: inst.layout().to_string(),
            dependencies: ids(self.program.dependencies(inst.node())),
            users: ids(self.program.users(inst.node())),
            kernel: inst.kernel_name().map(str::to_string),
            fused: node.fused_primitives().iter().map(|f| f.id.clone()).collect(),
            is_input: inst.is_input(),
            is_output: inst.is_output(),
            is_constant: inst.is_constant(),
            can_be_optimized: inst.can_be_optimized(),
            executed: self.executed.iter().any(|e| e == inst.id()),
            memory_dependencies: node.memory_dependencies().iter().cloned().collect(),
        })
    }

    /// `primitive_info` as pretty JSON.
    pub fn get_primitive_info(&self, id: &str) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(&self.primitive_info(id)?)?)
    }

    /// Runs every primitive once. `wait_on` gates the primitives that have no
    /// executed dependencies.
    pub fn execute(&mut self, wait_on: &[Event]) -> anyhow::Result<BTreeMap<String, NetworkOutput>> {
        self.reset_execution(self.synchronous_reuse)?;
        self.executed.clear();

        let order = self.update_order.clone();
        for pos in order {
            self.prepare(pos)?;
            if self.instances[pos].executes {
                self.execute_primitive(pos, wait_on)?;
            }
        }

        // Outputs nothing was submitted for borrow the event of the last
        // submission. Out-of-order queues only order through explicit waits,
        // so there a marker joins the producers instead.
        let last = self.executed.last().and_then(|id| self.events.get(id)).cloned();
        for pos in 0..self.instances.len() {
            let inst = &self.instances[pos];
            if !inst.is_output() || self.events.contains_key(inst.id()) {
                continue;
            }
            let event = if inst.exec_deps.is_empty() {
                self.stream.create_user_event(true)
            } else if self.stream.queue_type() == QueueType::OutOfOrder {
                let waits: Vec<Event> = inst.exec_deps.iter().filter_map(|d| self.events.get(self.instances[*d].id()).cloned()).collect();
                self.stream.enqueue_marker(&waits)?
            } else {
                last.clone().unwrap_or_else(|| self.stream.create_user_event(true))
            };
            let id = inst.id().to_string();
            self.events.insert(id, event);
        }

        for inst in &mut self.instances {
            inst.shape_changed = false;
        }
        self.stream.flush()?;
        debug!(network = self.id, executed = self.executed.len(), "network executed");

        let mut outputs = BTreeMap::new();
        for id in self.program.get_output_ids() {
            let output = self.get_output(&id)?;
            outputs.insert(id, output);
        }
        Ok(outputs)
    }

    fn prepare(&mut self, pos: usize) -> anyhow::Result<()> {
        let node = self.program.node(self.instances[pos].node());
        let deps = self.instances[pos].deps.clone();
        let dep_layouts: Vec<Layout> = deps.iter().map(|d| self.instances[*d].layout().clone()).collect();
        let dep_changed = deps.iter().any(|d| self.instances[*d].shape_changed);

        let inst = &mut self.instances[pos];
        inst.update_shape(node, &dep_layouts, dep_changed)?;

        if inst.can_be_optimized() {
            let source = deps.first().and_then(|d| self.instances[*d].output().cloned());
            let source = source.ok_or_else(|| anyhow!("aliased source of '{}' has no memory", self.instances[pos].id()))?;
            return self.instances[pos].alias(&source);
        }
        if inst.is_input() {
            if !inst.has_valid_output() {
                return Err(EngineError::InputNotSet(inst.id().to_string()).into());
            }
            return Ok(());
        }
        if inst.layout().is_dynamic() {
            return Err(EngineError::DynamicLayout(inst.id().to_string()).into());
        }
        if inst.shape_changed || (inst.output().is_none() && !inst.is_constant()) {
            let inputs: Vec<(Layout, bool)> =
                deps.iter().map(|d| (self.instances[*d].layout().clone(), self.instances[*d].is_constant())).collect();
            let inst = &mut self.instances[pos];
            inst.update_impl(&self.engine, node, &inputs)?;
            inst.realloc_if_needed(&self.engine, node.memory_dependencies(), self.id)?;
        }

        if self.instances[pos].needs_rebind(dep_changed) {
            let inputs = self.dep_buffers(pos)?;
            self.instances[pos].bind(&inputs)?;
        }
        Ok(())
    }

    fn dep_buffers(&self, pos: usize) -> anyhow::Result<Vec<Buffer>> {
        self.instances[pos]
            .deps
            .iter()
            .map(|d| {
                let dep = &self.instances[*d];
                dep.output().cloned().ok_or_else(|| anyhow!("dependency '{}' of '{}' has no memory", dep.id(), self.instances[pos].id()))
            })
            .collect()
    }

    fn execute_primitive(&mut self, pos: usize, wait_on: &[Event]) -> anyhow::Result<()> {
        let id = self.instances[pos].id().to_string();
        if self.events.contains_key(&id) {
            return Err(EngineError::Reexecution(id).into());
        }

        let exec_deps = &self.instances[pos].exec_deps;
        let waits: Vec<Event> = if exec_deps.is_empty() {
            wait_on.to_vec()
        } else if self.stream.queue_type() == QueueType::OutOfOrder {
            exec_deps
                .iter()
                .map(|d| {
                    let dep_id = self.instances[*d].id();
                    self.events
                        .get(dep_id)
                        .cloned()
                        .ok_or_else(|| EngineError::ExecutionOrderCorrupted { node: id.clone(), dependency: dep_id.to_string() }.into())
                })
                .collect::<anyhow::Result<_>>()?
        } else {
            Vec::new()
        };

        let inputs = self.dep_buffers(pos)?;
        let input_ids: Vec<String> = self.instances[pos].deps.iter().map(|d| self.instances[*d].id().to_string()).collect();
        let event = self.instances[pos].execute(&self.stream, &waits, &inputs, &input_ids)?;
        self.events.insert(id.clone(), event);
        self.executed.push(id);
        Ok(())
    }

    /// Blocks until the stream drained.
    pub fn finish(&self) -> anyhow::Result<()> {
        self.stream.finish()
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.engine.memory_pool().release_network(self.id);
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network").field("id", &self.id).field("program", &self.program.id()).field("instances", &self.instances.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::core::types::DataType;
    use crate::device::HostDevice;
    use crate::topology::PrimitiveDesc;
    use serde_json::json;

    #[test]
    fn executing_a_primitive_twice_in_one_run_fails() {
        let engine = Engine::new(Arc::new(HostDevice::new()), EngineConfig::default()).unwrap();
        let layout = Layout::new(DataType::F32, &[2]);
        let topology = Topology::new()
            .with(PrimitiveDesc::new("a", "input_layout", &[], json!({ "layout": layout })))
            .with(PrimitiveDesc::new("b", "activation", &["a"], json!({ "func": "relu" })));
        let mut net = Network::build(&engine, &topology, BuildOptions::default()).unwrap();
        net.set_input_data("a", Buffer::from_f32(&layout, &[1.0, -1.0]).unwrap()).unwrap();
        net.execute(&[]).unwrap();

        let pos = net.index["b"];
        let err = net.execute_primitive(pos, &[]).unwrap_err();
        assert_eq!(err.downcast_ref::<EngineError>(), Some(&EngineError::Reexecution("b".into())));
        assert_eq!(net.get_executed_ids(), vec!["a", "b"]);
    }
}
