//! Runs a nested body program a bounded number of times.
//!
//! Input 0 holds the trip count (first element, truncated). A negative count
//! runs the maximum number of iterations. The other inputs feed body inputs
//! with the same id. After every iteration each back edge carries the value of
//! body node `from` into body input `to`. The loop's output is the body output
//! of the last iteration.

use super::condition::{BranchDesc, build_nested};
use crate::core::types::Layout;
use crate::device::{Buffer, Event};
use crate::engine::Engine;
use crate::network::Network;
use crate::program::{Program, ProgramNode};
use crate::registry::{ImplParams, InstanceContext, InstanceSetup, NodeType};
use crate::runtime::{ExecuteContext, PrimitiveImpl};
use anyhow::anyhow;
use serde::Deserialize;
use std::sync::Arc;
use tracing::trace;

/// Iteration bound used when `max_iterations` is negative.
pub const DEFAULT_MAX_ITERATIONS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BackEdge {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Deserialize)]
pub struct LoopParams {
    pub body: BranchDesc,
    #[serde(default)]
    pub back_edges: Vec<BackEdge>,
    #[serde(default = "unbounded")]
    pub max_iterations: i64,
}

fn unbounded() -> i64 {
    -1
}

/// Built body program, attached to the node by `create_node`.
#[derive(Debug)]
pub struct LoopBody {
    pub program: Arc<Program>,
    pub output: String,
    pub back_edges: Vec<BackEdge>,
    pub max_iterations: usize,
}

struct LoopState {
    body: Network,
    /// One buffer per back edge holding the value carried into the next iteration.
    carried: Vec<Buffer>,
}

pub fn node_type() -> NodeType {
    NodeType::new("loop", calc_output_layout)
        .with_create_node(create_node)
        .with_create_instance(create_instance)
        .with_choose_impl(choose_impl)
        .with_to_string(describe)
}

fn create_node(node: &mut ProgramNode, engine: &Arc<Engine>) -> anyhow::Result<()> {
    let params: LoopParams = node.desc().parse_params()?;
    if node.desc().inputs.is_empty() {
        return Err(super::invalid(node.id(), "loop needs a trip count input"));
    }

    let mut outputs = vec![params.body.output.clone()];
    for edge in &params.back_edges {
        if !outputs.contains(&edge.from) {
            outputs.push(edge.from.clone());
        }
    }
    let program = build_nested(node, engine, &params.body.topology, outputs)?;

    let body_inputs = program.get_input_ids();
    for edge in &params.back_edges {
        if !body_inputs.contains(&edge.to) {
            return Err(super::invalid(node.id(), format!("back edge target '{}' is not a body input", edge.to)));
        }
        let (from, to) = (program.get_node(&edge.from)?.output_layout()?, program.get_node(&edge.to)?.output_layout()?);
        if from != to {
            return Err(super::invalid(node.id(), format!("back edge {} -> {} changes layout: {} vs {}", edge.from, edge.to, from, to)));
        }
    }

    let max_iterations = usize::try_from(params.max_iterations).unwrap_or(DEFAULT_MAX_ITERATIONS);
    node.set_payload(LoopBody {
        program: Arc::new(program),
        output: params.body.output,
        back_edges: params.back_edges,
        max_iterations,
    });
    Ok(())
}

fn body(node: &ProgramNode) -> anyhow::Result<&LoopBody> {
    node.payload::<LoopBody>().ok_or_else(|| anyhow!("loop '{}' has no body", node.id()))
}

fn calc_output_layout(node: &ProgramNode, _: &[Layout]) -> anyhow::Result<Layout> {
    let b = body(node)?;
    Ok(b.program.get_node(&b.output)?.output_layout()?.clone())
}

fn create_instance(node: &ProgramNode, ctx: &InstanceContext<'_>) -> anyhow::Result<InstanceSetup> {
    let b = body(node)?;
    let device = ctx.engine.device();
    let stream = device.create_stream(ctx.stream.queue_type())?;
    let carried = b
        .back_edges
        .iter()
        .map(|edge| device.allocate(b.program.get_node(&edge.to)?.output_layout()?, device.lockable_allocation()))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let state = LoopState { body: Network::new_internal(b.program.clone(), stream)?, carried };
    Ok(InstanceSetup { output: None, state: Box::new(state) })
}

fn choose_impl(params: &ImplParams<'_>) -> anyhow::Result<Option<Box<dyn PrimitiveImpl>>> {
    let b = body(params.node)?;
    Ok(Some(Box::new(LoopImpl {
        name: params.node.id().to_string(),
        output: b.output.clone(),
        back_edges: b.back_edges.clone(),
        max_iterations: b.max_iterations,
    })))
}

fn describe(node: &ProgramNode) -> String {
    match body(node) {
        Ok(b) => format!(
            "loop body: {} ({} nodes) back edges: {} max iterations: {}",
            b.output,
            b.program.node_count(),
            b.back_edges.len(),
            b.max_iterations
        ),
        Err(_) => "loop".to_string(),
    }
}

#[derive(Clone)]
struct LoopImpl {
    name: String,
    output: String,
    back_edges: Vec<BackEdge>,
    max_iterations: usize,
}

impl LoopImpl {
    fn iterations(&self, trip_count: Option<f64>) -> usize {
        match trip_count {
            Some(n) if n >= 0.0 => (n as usize).min(self.max_iterations),
            Some(_) => self.max_iterations,
            None => 0,
        }
    }
}

impl PrimitiveImpl for LoopImpl {
    fn kernel_name(&self) -> &str {
        &self.name
    }

    fn is_cpu(&self) -> bool {
        true
    }

    fn execute(&mut self, ctx: &mut ExecuteContext<'_>) -> anyhow::Result<Event> {
        ctx.stream.wait_for_events(ctx.wait_on)?;
        let trip_count = ctx.inputs.first().ok_or_else(|| anyhow!("loop '{}' has no trip count", ctx.id))?.to_f64_vec()?;
        let iterations = self.iterations(trip_count.first().copied());
        let state = ctx.state.downcast_mut::<LoopState>().ok_or_else(|| anyhow!("loop '{}' has no body network", ctx.id))?;
        trace!(id = ctx.id, iterations, "loop");

        let wanted = state.body.get_input_ids();
        for (id, buffer) in ctx.input_ids.iter().zip(ctx.inputs).skip(1) {
            if wanted.contains(id) {
                state.body.set_input_data(id, buffer.clone())?;
            }
        }

        if iterations == 0 {
            // A carried output keeps its initial value; anything else reads as zeros.
            let initial = self
                .back_edges
                .iter()
                .find(|edge| edge.from == self.output)
                .and_then(|edge| ctx.input_ids.iter().position(|id| *id == edge.to))
                .and_then(|pos| ctx.inputs.get(pos));
            match initial {
                Some(buffer) => ctx.output.copy_from(buffer)?,
                None => ctx.output.write_bytes(&vec![0u8; ctx.output.capacity()])?,
            }
            return Ok(ctx.stream.create_user_event(true));
        }

        for iteration in 0..iterations {
            let results = state.body.execute(&[])?;
            let produced = |id: &str| {
                let result = results.get(id).ok_or_else(|| anyhow!("body output '{}' was not produced", id))?;
                result.event().wait();
                anyhow::Ok(result.memory().clone())
            };

            if iteration + 1 == iterations {
                ctx.output.copy_from(&produced(&self.output)?)?;
                break;
            }
            // Read every carried value before overwriting any body input.
            let values = self.back_edges.iter().map(|edge| produced(&edge.from)?.read_bytes()).collect::<anyhow::Result<Vec<_>>>()?;
            for ((edge, carry), value) in self.back_edges.iter().zip(&state.carried).zip(values) {
                carry.write_bytes(&value)?;
                state.body.set_input_data(&edge.to, carry.clone())?;
            }
        }
        Ok(ctx.stream.create_user_event(true))
    }

    fn clone_box(&self) -> Box<dyn PrimitiveImpl> {
        Box::new(self.clone())
    }
}
