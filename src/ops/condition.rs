//! Runs one of two nested programs depending on a predicate.
//!
//! Input 0 is the predicate (first element nonzero means true). The other
//! inputs feed branch inputs with the same id.

use crate::config::BuildOptions;
use crate::core::types::Layout;
use crate::device::Event;
use crate::engine::Engine;
use crate::network::Network;
use crate::program::{Program, ProgramNode};
use crate::registry::{ImplParams, InstanceContext, InstanceSetup, NodeType};
use crate::runtime::{ExecuteContext, PrimitiveImpl};
use crate::topology::Topology;
use anyhow::anyhow;
use serde::Deserialize;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Deserialize)]
pub struct BranchDesc {
    pub topology: Topology,
    pub output: String,
}

#[derive(Debug, Deserialize)]
pub struct ConditionParams {
    pub true_branch: BranchDesc,
    pub false_branch: BranchDesc,
}

#[derive(Debug)]
pub struct Branch {
    pub program: Arc<Program>,
    pub output: String,
}

/// Built branch programs, attached to the node by `create_node`.
#[derive(Debug)]
pub struct ConditionBranches {
    pub true_branch: Branch,
    pub false_branch: Branch,
}

struct ConditionState {
    true_net: Network,
    false_net: Network,
}

pub fn node_type() -> NodeType {
    NodeType::new("condition", calc_output_layout)
        .with_create_node(create_node)
        .with_create_instance(create_instance)
        .with_choose_impl(choose_impl)
        .with_to_string(describe)
}

/// Builds a nested program whose inputs are fed by the node's inputs after
/// the first one, matched by id.
pub(crate) fn build_nested(node: &ProgramNode, engine: &Arc<Engine>, topology: &Topology, outputs: Vec<String>) -> anyhow::Result<Program> {
    let program = Program::build(engine, topology, BuildOptions::internal(outputs))?;
    let outer_inputs = &node.desc().inputs;
    for id in program.get_input_ids() {
        if !outer_inputs.iter().skip(1).any(|i| *i == id) {
            return Err(super::invalid(node.id(), format!("nested input '{}' is not an input of '{}'", id, node.id())));
        }
    }
    Ok(program)
}

fn build_branch(node: &ProgramNode, engine: &Arc<Engine>, desc: &BranchDesc) -> anyhow::Result<Branch> {
    let program = build_nested(node, engine, &desc.topology, vec![desc.output.clone()])?;
    Ok(Branch { program: Arc::new(program), output: desc.output.clone() })
}

fn create_node(node: &mut ProgramNode, engine: &Arc<Engine>) -> anyhow::Result<()> {
    let params: ConditionParams = node.desc().parse_params()?;
    if node.desc().inputs.is_empty() {
        return Err(super::invalid(node.id(), "condition needs a predicate input"));
    }
    let true_branch = build_branch(node, engine, &params.true_branch)?;
    let false_branch = build_branch(node, engine, &params.false_branch)?;

    let (t, f) = (true_branch.program.get_node(&true_branch.output)?, false_branch.program.get_node(&false_branch.output)?);
    if t.output_layout()? != f.output_layout()? {
        return Err(super::invalid(
            node.id(),
            format!("branch outputs disagree: {} vs {}", t.output_layout()?, f.output_layout()?),
        ));
    }
    node.set_payload(ConditionBranches { true_branch, false_branch });
    Ok(())
}

fn branches(node: &ProgramNode) -> anyhow::Result<&ConditionBranches> {
    node.payload::<ConditionBranches>().ok_or_else(|| anyhow!("condition '{}' has no branches", node.id()))
}

fn calc_output_layout(node: &ProgramNode, _: &[Layout]) -> anyhow::Result<Layout> {
    let b = branches(node)?;
    Ok(b.true_branch.program.get_node(&b.true_branch.output)?.output_layout()?.clone())
}

fn create_instance(node: &ProgramNode, ctx: &InstanceContext<'_>) -> anyhow::Result<InstanceSetup> {
    let b = branches(node)?;
    let stream = ctx.engine.device().create_stream(ctx.stream.queue_type())?;
    let state = ConditionState {
        true_net: Network::new_internal(b.true_branch.program.clone(), stream.clone())?,
        false_net: Network::new_internal(b.false_branch.program.clone(), stream)?,
    };
    Ok(InstanceSetup { output: None, state: Box::new(state) })
}

fn choose_impl(params: &ImplParams<'_>) -> anyhow::Result<Option<Box<dyn PrimitiveImpl>>> {
    let b = branches(params.node)?;
    Ok(Some(Box::new(ConditionImpl {
        name: params.node.id().to_string(),
        true_output: b.true_branch.output.clone(),
        false_output: b.false_branch.output.clone(),
    })))
}

fn describe(node: &ProgramNode) -> String {
    match branches(node) {
        Ok(b) => format!(
            "condition true: {} ({} nodes) false: {} ({} nodes)",
            b.true_branch.output,
            b.true_branch.program.node_count(),
            b.false_branch.output,
            b.false_branch.program.node_count()
        ),
        Err(_) => "condition".to_string(),
    }
}

#[derive(Clone)]
struct ConditionImpl {
    name: String,
    true_output: String,
    false_output: String,
}

impl PrimitiveImpl for ConditionImpl {
    fn kernel_name(&self) -> &str {
        &self.name
    }

    fn is_cpu(&self) -> bool {
        true
    }

    fn execute(&mut self, ctx: &mut ExecuteContext<'_>) -> anyhow::Result<Event> {
        ctx.stream.wait_for_events(ctx.wait_on)?;
        let predicate = ctx.inputs.first().ok_or_else(|| anyhow!("condition '{}' has no predicate", ctx.id))?.to_f64_vec()?;
        let taken = predicate.first().is_some_and(|v| *v != 0.0);

        let state = ctx.state.downcast_mut::<ConditionState>().ok_or_else(|| anyhow!("condition '{}' has no branch networks", ctx.id))?;
        let (net, output) = if taken { (&mut state.true_net, &self.true_output) } else { (&mut state.false_net, &self.false_output) };
        trace!(id = ctx.id, taken, "condition");

        let wanted = net.get_input_ids();
        for (id, buffer) in ctx.input_ids.iter().zip(ctx.inputs).skip(1) {
            if wanted.contains(id) {
                net.set_input_data(id, buffer.clone())?;
            }
        }
        let results = net.execute(&[])?;
        let result = results.get(output).ok_or_else(|| anyhow!("branch output '{}' was not produced", output))?;
        result.event().wait();
        ctx.output.copy_from(result.memory())?;
        Ok(ctx.stream.create_user_event(true))
    }

    fn clone_box(&self) -> Box<dyn PrimitiveImpl> {
        Box::new(self.clone())
    }
}
