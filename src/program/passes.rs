use super::{FusedPrimitive, Program};
use crate::config::{BuildOptions, QueueType};
use crate::core::error::EngineError;
use crate::network::Network;
use crate::registry::ImplParams;
use crate::runtime::PrimitiveImpl;
use crate::topology::{PrimitiveDesc, Topology};
use anyhow::Context;
use petgraph::stable_graph::NodeIndex;
use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

pub type PassFn = fn(&mut Program) -> anyhow::Result<()>;

pub struct PassManager {
    passes: Vec<(&'static str, PassFn)>,
}

impl Default for PassManager {
    fn default() -> Self {
        Self::default_pipeline()
    }
}

impl PassManager {
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    pub fn with_pass(mut self, name: &'static str, pass: PassFn) -> Self {
        self.passes.push((name, pass));
        self
    }

    pub fn default_pipeline() -> Self {
        Self::new()
            .with_pass("graph_initializations", graph_initializations)
            .with_pass("calculate_layouts", calculate_layouts)
            .with_pass("mark_constants", mark_constants)
            .with_pass("insert_reorders", insert_reorders)
            .with_pass("propagate_constants", propagate_constants)
            .with_pass("remove_redundant_reshapes", remove_redundant_reshapes)
            .with_pass("prepare_primitive_fusing", prepare_primitive_fusing)
            .with_pass("prepare_buffer_fusing", prepare_buffer_fusing)
            .with_pass("calc_memory_dependencies", calc_memory_dependencies)
            .with_pass("compile_graph", compile_graph)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|(n, _)| *n).collect()
    }

    pub fn run(&self, program: &mut Program) -> anyhow::Result<()> {
        for (name, pass) in &self.passes {
            if !program.options().is_pass_enabled(name) {
                debug!(pass = name, "pass disabled");
                continue;
            }
            debug!(pass = name, program = program.id(), nodes = program.node_count(), "running pass");
            pass(program).with_context(|| format!("Pass '{}' failed", name))?;
            program.pass_log.push(name.to_string());
        }
        Ok(())
    }
}

fn optimizing(program: &Program) -> bool {
    program.options().optimize_data
}

/// Marks declared outputs (every sink when none are declared) and collects inputs.
pub fn graph_initializations(program: &mut Program) -> anyhow::Result<()> {
    let declared = program.options().outputs.clone();
    let outputs: Vec<NodeIndex> = if declared.is_empty() {
        program.order.iter().filter(|idx| program.users(*idx).is_empty()).collect()
    } else {
        declared
            .iter()
            .map(|id| program.get_node_index(id).ok_or_else(|| anyhow::Error::from(EngineError::UnknownOutput(id.clone()))))
            .collect::<anyhow::Result<Vec<_>>>()?
    };

    let indices: Vec<NodeIndex> = program.graph.node_indices().collect();
    for idx in indices {
        let is_output = outputs.contains(&idx);
        program.graph[idx].is_output = is_output;
    }
    program.inputs = program.order.iter().filter(|idx| program.graph[*idx].is_input).collect();
    program.outputs = outputs;
    Ok(())
}

pub fn calculate_layouts(program: &mut Program) -> anyhow::Result<()> {
    for idx in program.order.to_vec() {
        let inputs = program.input_layouts(idx)?;
        let node = &program.graph[idx];
        let layout = (node.node_type().calc_output_layout)(node, &inputs)
            .with_context(|| format!("Failed to compute output layout of '{}'", node.id()))?;
        program.graph[idx].output_layout = Some(layout);
    }
    Ok(())
}

/// A node is constant when all of its dependencies are; sources keep the
/// flag their kind gave them.
pub fn mark_constants(program: &mut Program) -> anyhow::Result<()> {
    for idx in program.order.to_vec() {
        let deps = program.dependencies(idx);
        if deps.is_empty() || program.graph[idx].is_input {
            continue;
        }
        let constant = deps.iter().all(|d| program.graph[*d].is_constant);
        program.graph[idx].is_constant = constant;
    }
    Ok(())
}

/// Converts mismatching inputs of nodes that need one element type.
pub fn insert_reorders(program: &mut Program) -> anyhow::Result<()> {
    for idx in program.order.to_vec() {
        if !program.graph[idx].node_type().traits.uniform_input_dtype {
            continue;
        }
        let deps = program.dependency_edges(idx);
        let Some((_, first, _)) = deps.first() else { continue };
        let target = program.graph[*first].output_layout()?.dtype;

        for (_, dep, slot) in deps.iter().skip(1) {
            if program.graph[*dep].output_layout()?.dtype == target {
                continue;
            }
            let user_id = program.graph[idx].id().to_string();
            let mut reorder_id = format!("{}_reorder_{}", user_id, slot);
            while program.nodes_map.contains_key(&reorder_id) {
                reorder_id.push('_');
            }
            let dep_id = program.graph[*dep].id().to_string();
            let desc = PrimitiveDesc::new(&reorder_id, "reorder", &[&dep_id], serde_json::json!({ "dtype": target }));
            let new_idx = program.add_intermediate(desc, idx, *slot)?;
            let constant = program.graph[*dep].is_constant;
            program.graph[new_idx].is_constant = constant;
            debug!(node = %user_id, reorder = %reorder_id, "inserted reorder");
        }
    }
    Ok(())
}

/// Evaluates constant subgraphs once, through an internal network, and
/// replaces the needed results with data nodes.
pub fn propagate_constants(program: &mut Program) -> anyhow::Result<()> {
    if !optimizing(program) || program.is_internal() {
        return Ok(());
    }

    let order = program.order.to_vec();
    let constants: Vec<NodeIndex> = order.iter().copied().filter(|idx| program.graph[*idx].is_constant).collect();
    let targets: Vec<NodeIndex> = constants
        .iter()
        .copied()
        .filter(|idx| !program.dependencies(*idx).is_empty())
        .filter(|idx| program.graph[*idx].is_output || program.users(*idx).iter().any(|u| !program.graph[*u].is_constant))
        .collect();

    if !targets.is_empty() {
        let mut topology = Topology::new();
        for idx in &constants {
            let node = &program.graph[*idx];
            let inputs: Vec<String> = program.dependencies(*idx).iter().map(|d| program.graph[*d].id().to_string()).collect();
            topology.add(PrimitiveDesc { id: node.id().to_string(), kind: node.kind().to_string(), inputs, params: node.params().clone() });
        }
        let target_ids: Vec<String> = targets.iter().map(|idx| program.graph[*idx].id().to_string()).collect();

        let engine = program.engine().clone();
        let folded = Program::build(&engine, &topology, BuildOptions::internal(target_ids.clone()))?;
        let mut network = Network::new_internal(Arc::new(folded), engine.create_stream()?)?;
        let results = network.execute(&[])?;

        let data_type = engine.registry().get("data")?;
        for (idx, id) in targets.iter().zip(&target_ids) {
            let output = results.get(id).ok_or_else(|| anyhow::anyhow!("constant '{}' was not produced", id))?;
            let buffer = output.memory();
            let values: Vec<f64> = buffer.to_f64_vec()?;
            let desc = PrimitiveDesc::new(id, "data", &[], serde_json::json!({ "layout": buffer.layout(), "values": values }));

            let incoming: Vec<_> = program.dependency_edges(*idx).into_iter().map(|(e, _, _)| e).collect();
            for edge in incoming {
                program.graph.remove_edge(edge);
            }
            let node = &mut program.graph[*idx];
            node.replace_desc(Arc::new(desc), data_type.clone());
            (data_type.create_node)(node, &engine)?;
            node.is_constant = true;
            debug!(node = %id, "folded constant");
        }
    }

    loop {
        let dead: Vec<NodeIndex> = program
            .order
            .iter()
            .filter(|idx| {
                let node = &program.graph[*idx];
                node.is_constant && !node.is_output && program.users(*idx).is_empty()
            })
            .collect();
        if dead.is_empty() {
            break;
        }
        for idx in dead {
            program.remove_node(idx, Vec::new());
        }
    }
    Ok(())
}

/// Identity views are dropped; an identity view that is an output stays as
/// an alias of its input.
pub fn remove_redundant_reshapes(program: &mut Program) -> anyhow::Result<()> {
    if !optimizing(program) {
        return Ok(());
    }
    for idx in program.order.to_vec() {
        let node = &program.graph[idx];
        if !node.node_type().traits.in_place || node.is_input || node.can_be_optimized {
            continue;
        }
        let deps = program.dependencies(idx);
        let [dep] = deps.as_slice() else { continue };
        if program.graph[*dep].output_layout()? != node.output_layout()? {
            continue;
        }
        if node.is_output {
            program.graph[idx].can_be_optimized = true;
        } else {
            debug!(node = %node.id(), "removing identity node");
            program.extract_and_remove(idx)?;
        }
    }
    Ok(())
}

/// Folds a post-operation into the producer feeding only it.
pub fn prepare_primitive_fusing(program: &mut Program) -> anyhow::Result<()> {
    if !optimizing(program) {
        return Ok(());
    }
    for idx in program.order.to_vec() {
        let node = &program.graph[idx];
        if !node.node_type().traits.fusable_post_op || node.is_output || node.is_input || node.is_constant {
            continue;
        }
        let deps = program.dependencies(idx);
        let [producer] = deps.as_slice() else { continue };
        let producer = *producer;
        let pnode = &program.graph[producer];
        if !pnode.node_type().traits.accepts_post_ops || pnode.is_input || pnode.is_output || pnode.is_constant || pnode.can_be_optimized {
            continue;
        }
        if program.user_edges(producer).len() != 1 || pnode.output_layout()? != node.output_layout()? {
            continue;
        }

        let fused = FusedPrimitive { id: node.id().to_string(), kind: node.kind().to_string(), params: node.params().clone() };
        let fused_id = fused.id.clone();
        let mut carried = node.fused.clone();
        let producer_id = pnode.id().to_string();

        for (_, user, slot) in program.user_edges(idx) {
            program.graph.add_edge(producer, user, slot);
        }
        let pnode = &mut program.graph[producer];
        pnode.fused.push(fused);
        pnode.fused.append(&mut carried);
        program.fusing_history.entry(producer_id.clone()).or_default().push(fused_id.clone());
        program.remove_node(idx, vec![producer_id.clone()]);
        debug!(producer = %producer_id, fused = %fused_id, "fused post-operation");
    }
    Ok(())
}

/// Views over a plain input of the same type alias that input's memory.
pub fn prepare_buffer_fusing(program: &mut Program) -> anyhow::Result<()> {
    if !optimizing(program) {
        return Ok(());
    }
    for idx in program.order.to_vec() {
        let node = &program.graph[idx];
        if !node.node_type().traits.in_place || node.is_input || node.can_be_optimized {
            continue;
        }
        let deps = program.dependencies(idx);
        let [dep] = deps.as_slice() else { continue };
        let (own, src) = (node.output_layout()?, program.graph[*dep].output_layout()?);
        if own.dtype == src.dtype && own.format.is_plain() && src.format.is_plain() {
            program.graph[idx].can_be_optimized = true;
        }
    }
    Ok(())
}

/// Nodes whose buffers may not be shared with each node.
///
/// A buffer is live from its producer until the last consumer reads it,
/// where consumers that alias the buffer extend its life to their own last
/// reader. Overlapping intervals conflict. Out-of-order queues may also run
/// any two nodes not ordered by a path concurrently, so those conflict too.
pub fn calc_memory_dependencies(program: &mut Program) -> anyhow::Result<()> {
    let order = program.order.to_vec();
    let pos = program.order.positions();

    let mut end: HashMap<NodeIndex, usize> = HashMap::new();
    for idx in order.iter().rev() {
        let mut last = pos[idx];
        for user in program.users(*idx) {
            let user_end = if program.graph[user].can_be_optimized { end.get(&user).copied().unwrap_or(pos[&user]) } else { pos[&user] };
            last = last.max(user_end);
        }
        if program.graph[*idx].is_output {
            last = usize::MAX;
        }
        end.insert(*idx, last);
    }

    let ancestors = if program.options().queue_type == QueueType::OutOfOrder {
        let mut anc: HashMap<NodeIndex, HashSet<NodeIndex>> = HashMap::new();
        for idx in &order {
            let mut set = HashSet::new();
            for dep in program.dependencies(*idx) {
                set.insert(dep);
                if let Some(up) = anc.get(&dep) {
                    set.extend(up.iter().copied());
                }
            }
            anc.insert(*idx, set);
        }
        Some(anc)
    } else {
        None
    };

    for a in &order {
        let mut conflicts = BTreeSet::new();
        for b in &order {
            if a == b {
                continue;
            }
            let overlap = pos[a] <= end[b] && pos[b] <= end[a];
            let concurrent = ancestors.as_ref().is_some_and(|anc| !anc[a].contains(b) && !anc[b].contains(a));
            if overlap || concurrent {
                conflicts.insert(program.graph[*b].id().to_string());
            }
        }
        program.graph[*a].memory_dependencies = conflicts;
    }
    Ok(())
}

/// Selects implementations for every statically shaped node in parallel,
/// registers their kernels and compiles them in one go.
pub fn compile_graph(program: &mut Program) -> anyhow::Result<()> {
    let engine = program.engine().clone();
    let mut candidates = Vec::new();
    for idx in program.order.iter() {
        let node = &program.graph[idx];
        let source_constant = node.is_constant && program.dependencies(idx).is_empty();
        if node.selected_impl.is_some() || node.can_be_optimized || source_constant {
            continue;
        }
        let output = node.output_layout()?;
        let inputs = program.input_layouts(idx)?;
        if output.is_dynamic() || inputs.iter().any(|l| l.is_dynamic()) {
            continue;
        }
        candidates.push((idx, inputs));
    }

    let graph = &program.graph;
    let chosen: Vec<(NodeIndex, anyhow::Result<Option<Box<dyn PrimitiveImpl>>>)> = candidates
        .par_iter()
        .map(|(idx, inputs)| {
            let node = &graph[*idx];
            let choice = node.output_layout().and_then(|output| {
                (node.node_type().choose_impl)(&ImplParams { node, input_layouts: inputs, output_layout: output })
            });
            (*idx, choice)
        })
        .collect();

    let mut selected = Vec::new();
    for (idx, choice) in chosen {
        let id = program.graph[idx].id().to_string();
        if let Some(mut imp) = choice.with_context(|| format!("Failed to select implementation for '{}'", id))? {
            imp.add_kernels(engine.kernel_cache())?;
            selected.push((idx, imp));
        }
    }
    engine.kernel_cache().build_all()?;
    for (idx, mut imp) in selected {
        imp.init_kernels(engine.kernel_cache())?;
        program.graph[idx].selected_impl = Some(Arc::from(imp));
    }
    Ok(())
}
