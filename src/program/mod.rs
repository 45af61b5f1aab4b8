pub mod node;
pub mod order;
pub mod passes;

pub use node::{FusedPrimitive, ImplPreference, ProgramNode};
pub use order::ProcessingOrder;
pub use passes::{PassFn, PassManager};

use crate::config::BuildOptions;
use crate::core::error::EngineError;
use crate::core::types::Layout;
use crate::device::Kernel;
use crate::engine::Engine;
use crate::kernels::{KernelId, KernelSource};
use crate::topology::{PrimitiveDesc, Topology};
use anyhow::Context;
use petgraph::Direction;
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::info;

static NEXT_PROGRAM_ID: AtomicU32 = AtomicU32::new(1);

/// Edge weight is the input slot of the target node.
pub type NodeGraph = StableDiGraph<ProgramNode, usize>;

/// A topology turned into an optimized node graph with a processing order.
pub struct Program {
    id: u32,
    engine: Arc<Engine>,
    options: BuildOptions,
    pub(crate) graph: NodeGraph,
    pub(crate) nodes_map: HashMap<String, NodeIndex>,
    pub(crate) order: ProcessingOrder,
    pub(crate) inputs: Vec<NodeIndex>,
    pub(crate) outputs: Vec<NodeIndex>,
    pub(crate) optimized_out: Vec<String>,
    pub(crate) optimized: Vec<(String, Vec<String>)>,
    pub(crate) fusing_history: BTreeMap<String, Vec<String>>,
    pub(crate) pass_log: Vec<String>,
}

impl Program {
    pub fn build(engine: &Arc<Engine>, topology: &Topology, options: BuildOptions) -> anyhow::Result<Self> {
        let mut program = Self::materialize(engine, topology, options)?;
        program.optimize()?;
        info!(
            program = program.id,
            nodes = program.graph.node_count(),
            optimized_out = program.optimized_out.len(),
            internal = program.options.internal,
            "program built"
        );
        Ok(program)
    }

    /// Nodes and edges only, no passes.
    pub fn materialize(engine: &Arc<Engine>, topology: &Topology, options: BuildOptions) -> anyhow::Result<Self> {
        let mut program = Self {
            id: NEXT_PROGRAM_ID.fetch_add(1, Ordering::Relaxed),
            engine: engine.clone(),
            options,
            graph: NodeGraph::default(),
            nodes_map: HashMap::new(),
            order: ProcessingOrder::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            optimized_out: Vec::new(),
            optimized: Vec::new(),
            fusing_history: BTreeMap::new(),
            pass_log: Vec::new(),
        };

        for desc in topology.iter() {
            if program.nodes_map.contains_key(&desc.id) {
                return Err(EngineError::DuplicateId(desc.id.clone()).into());
            }
            let node = program.create_node(Arc::new(desc.clone()))?;
            let idx = program.graph.add_node(node);
            program.nodes_map.insert(desc.id.clone(), idx);
        }

        for desc in topology.iter() {
            let idx = program.nodes_map[&desc.id];
            for (slot, dep) in desc.inputs.iter().enumerate() {
                let dep_idx = *program
                    .nodes_map
                    .get(dep)
                    .ok_or_else(|| EngineError::DanglingReference { node: desc.id.clone(), dependency: dep.clone() })?;
                program.graph.add_edge(dep_idx, idx, slot);
            }
        }

        program.order = program.calc_processing_order()?;
        Ok(program)
    }

    fn create_node(&self, desc: Arc<PrimitiveDesc>) -> anyhow::Result<ProgramNode> {
        let node_type = self.engine.registry().get(&desc.kind)?;
        let mut node = ProgramNode::new(desc.clone(), node_type.clone());
        (node_type.create_node)(&mut node, &self.engine).with_context(|| format!("Failed to create node '{}'", desc.id))?;
        Ok(node)
    }

    /// Topological order of the current graph.
    pub fn calc_processing_order(&self) -> anyhow::Result<ProcessingOrder> {
        let sorted = petgraph::algo::toposort(&self.graph, None)
            .map_err(|cycle| EngineError::CyclicReference(self.graph[cycle.node_id()].id().to_string()))?;
        Ok(ProcessingOrder::from_sequence(sorted))
    }

    /// Runs the default pass pipeline again. Passes are idempotent, so an
    /// already optimized program is left unchanged.
    pub fn optimize(&mut self) -> anyhow::Result<()> {
        PassManager::default_pipeline().run(self)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    pub fn is_internal(&self) -> bool {
        self.options.internal
    }

    pub fn node(&self, idx: NodeIndex) -> &ProgramNode {
        &self.graph[idx]
    }

    pub fn node_mut(&mut self, idx: NodeIndex) -> &mut ProgramNode {
        &mut self.graph[idx]
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn get_node_index(&self, id: &str) -> Option<NodeIndex> {
        self.nodes_map.get(id).copied()
    }

    pub fn get_node(&self, id: &str) -> anyhow::Result<&ProgramNode> {
        self.get_node_index(id)
            .map(|idx| &self.graph[idx])
            .ok_or_else(|| EngineError::UnknownPrimitive(id.to_string()).into())
    }

    pub fn processing_order(&self) -> &ProcessingOrder {
        &self.order
    }

    pub fn get_processing_order(&self) -> Vec<String> {
        self.order.iter().map(|idx| self.graph[idx].id().to_string()).collect()
    }

    /// Ids removed by optimization passes, in removal order.
    pub fn get_optimized_out(&self) -> &[String] {
        &self.optimized_out
    }

    /// Removed id -> ids that now carry its result.
    pub fn get_optimized(&self) -> &[(String, Vec<String>)] {
        &self.optimized
    }

    /// Producer id -> ids fused into it.
    pub fn get_fusing_history(&self) -> &BTreeMap<String, Vec<String>> {
        &self.fusing_history
    }

    pub fn pass_log(&self) -> &[String] {
        &self.pass_log
    }

    pub fn inputs(&self) -> &[NodeIndex] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[NodeIndex] {
        &self.outputs
    }

    pub fn get_input_ids(&self) -> Vec<String> {
        self.inputs.iter().map(|i| self.graph[*i].id().to_string()).collect()
    }

    pub fn get_output_ids(&self) -> Vec<String> {
        self.outputs.iter().map(|i| self.graph[*i].id().to_string()).collect()
    }

    /// (edge, dependency, slot) sorted by slot.
    pub fn dependency_edges(&self, idx: NodeIndex) -> Vec<(EdgeIndex, NodeIndex, usize)> {
        let mut edges: Vec<_> = self.graph.edges_directed(idx, Direction::Incoming).map(|e| (e.id(), e.source(), *e.weight())).collect();
        edges.sort_by_key(|(_, _, slot)| *slot);
        edges
    }

    pub fn dependencies(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.dependency_edges(idx).into_iter().map(|(_, dep, _)| dep).collect()
    }

    /// (edge, user, slot) for every consumer edge.
    pub fn user_edges(&self, idx: NodeIndex) -> Vec<(EdgeIndex, NodeIndex, usize)> {
        self.graph.edges_directed(idx, Direction::Outgoing).map(|e| (e.id(), e.target(), *e.weight())).collect()
    }

    pub fn users(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        let mut users: Vec<NodeIndex> = self.graph.neighbors_directed(idx, Direction::Outgoing).collect();
        users.sort();
        users.dedup();
        users
    }

    pub fn input_layouts(&self, idx: NodeIndex) -> anyhow::Result<Vec<Layout>> {
        self.dependencies(idx).into_iter().map(|d| self.graph[d].output_layout().cloned()).collect()
    }

    /// True when the node's buffer is observed from outside: it is an
    /// output or an optimized-out output aliases it.
    pub fn is_output_buffer(&self, idx: NodeIndex) -> bool {
        let node = &self.graph[idx];
        if node.is_output {
            return true;
        }
        self.users(idx).into_iter().any(|u| self.graph[u].can_be_optimized && self.is_output_buffer(u))
    }

    pub fn has_cpu_user(&self, idx: NodeIndex) -> bool {
        self.users(idx).into_iter().any(|u| self.graph[u].selected_impl.as_ref().is_some_and(|imp| imp.is_cpu()))
    }

    pub fn add_kernel(&self, source: KernelSource) -> anyhow::Result<KernelId> {
        self.engine.kernel_cache().set_kernel_source(source)
    }

    pub fn get_kernel(&self, id: &str) -> anyhow::Result<Kernel> {
        self.engine.kernel_cache().get_kernel(id)
    }

    pub fn compile(&self) -> anyhow::Result<()> {
        self.engine.kernel_cache().build_all()
    }

    /// Creates a node for `desc`, wires its declared inputs and computes its
    /// layout. The caller places it in the processing order.
    pub(crate) fn add_node(&mut self, desc: PrimitiveDesc) -> anyhow::Result<NodeIndex> {
        if self.nodes_map.contains_key(&desc.id) {
            return Err(EngineError::DuplicateId(desc.id).into());
        }
        let inputs = desc.inputs.clone();
        let id = desc.id.clone();
        let node = self.create_node(Arc::new(desc))?;
        let idx = self.graph.add_node(node);
        self.nodes_map.insert(id.clone(), idx);
        for (slot, dep) in inputs.iter().enumerate() {
            let dep_idx = self
                .get_node_index(dep)
                .ok_or_else(|| EngineError::DanglingReference { node: id.clone(), dependency: dep.clone() })?;
            self.graph.add_edge(dep_idx, idx, slot);
        }
        let layouts = self.input_layouts(idx)?;
        let node = &self.graph[idx];
        let layout = (node.node_type().calc_output_layout)(node, &layouts)?;
        self.graph[idx].output_layout = Some(layout);
        Ok(idx)
    }

    /// Places a new node between `user` and its dependency at `slot`; the new
    /// node must read that dependency as its only input.
    pub(crate) fn add_intermediate(&mut self, desc: PrimitiveDesc, user: NodeIndex, slot: usize) -> anyhow::Result<NodeIndex> {
        let (edge, _, _) = self
            .dependency_edges(user)
            .into_iter()
            .find(|(_, _, s)| *s == slot)
            .ok_or_else(|| anyhow::anyhow!("'{}' has no input at slot {}", self.graph[user].id(), slot))?;
        let idx = self.add_node(desc)?;
        self.graph.remove_edge(edge);
        self.graph.add_edge(idx, user, slot);
        self.order.insert_before(user, idx)?;
        Ok(idx)
    }

    /// Removes a single-input node, handing its consumers to its dependency.
    pub(crate) fn extract_and_remove(&mut self, idx: NodeIndex) -> anyhow::Result<()> {
        let deps = self.dependencies(idx);
        let [dep] = deps.as_slice() else {
            return Err(anyhow::anyhow!("'{}' must have exactly one dependency to be extracted", self.graph[idx].id()));
        };
        let dep = *dep;
        for (_, user, slot) in self.user_edges(idx) {
            self.graph.add_edge(dep, user, slot);
        }
        let replacement = self.graph[dep].id().to_string();
        self.remove_node(idx, vec![replacement]);
        Ok(())
    }

    /// Drops a node and its edges, recording it as optimized out.
    pub(crate) fn remove_node(&mut self, idx: NodeIndex, replaced_by: Vec<String>) {
        self.order.erase(idx);
        self.inputs.retain(|i| *i != idx);
        self.outputs.retain(|i| *i != idx);
        if let Some(node) = self.graph.remove_node(idx) {
            self.nodes_map.remove(node.id());
            self.optimized_out.push(node.id().to_string());
            self.optimized.push((node.id().to_string(), replaced_by));
        }
    }
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("id", &self.id)
            .field("order", &self.get_processing_order())
            .field("optimized_out", &self.optimized_out)
            .finish()
    }
}
