use super::activation::ActivationParams;
use crate::core::error::EngineError;
use crate::core::types::Layout;
use crate::engine::Engine;
use crate::kernels::codegen::{Combine, DEFAULT_OPTIONS, ElementwiseKernel};
use crate::program::ProgramNode;
use crate::registry::{ImplParams, NodeTraits, NodeType};
use crate::runtime::PrimitiveImpl;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EltwiseMode {
    Sum,
    Prod,
    Sub,
    Max,
    Min,
}

impl EltwiseMode {
    fn routine(&self) -> &'static str {
        match self {
            Self::Sum => "eltwise_sum",
            Self::Prod => "eltwise_prod",
            Self::Sub => "eltwise_sub",
            Self::Max => "eltwise_max",
            Self::Min => "eltwise_min",
        }
    }

    fn combine(&self) -> Combine {
        match self {
            Self::Sum => Combine::Infix("+"),
            Self::Prod => Combine::Infix("*"),
            Self::Sub => Combine::Infix("-"),
            Self::Max => Combine::Call("max"),
            Self::Min => Combine::Call("min"),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct EltwiseParams {
    pub mode: EltwiseMode,
}

pub fn node_type() -> NodeType {
    NodeType::new("eltwise", calc_output_layout)
        .with_traits(NodeTraits { accepts_post_ops: true, uniform_input_dtype: true, ..Default::default() })
        .with_create_node(create_node)
        .with_choose_impl(choose_impl)
}

fn create_node(node: &mut ProgramNode, _: &Arc<Engine>) -> anyhow::Result<()> {
    node.desc().parse_params::<EltwiseParams>()?;
    if node.desc().inputs.is_empty() {
        return Err(super::invalid(node.id(), "eltwise needs at least one input"));
    }
    Ok(())
}

/// Shape of the largest input; the others broadcast over it. Type of input 0.
fn calc_output_layout(node: &ProgramNode, inputs: &[Layout]) -> anyhow::Result<Layout> {
    let first = inputs.first().ok_or_else(|| super::invalid(node.id(), "missing inputs"))?;
    if inputs.iter().any(|l| l.is_dynamic()) {
        let dynamic = inputs.iter().find(|l| l.is_dynamic()).unwrap_or(first);
        return Ok(dynamic.with_dtype(first.dtype));
    }
    let mut widest = first;
    for layout in inputs {
        if layout.count() > widest.count() {
            widest = layout;
        }
    }
    if let Some(n) = widest.count() {
        if let Some(bad) = inputs.iter().find(|l| l.count().is_some_and(|c| c == 0 || n % c != 0)) {
            return Err(super::invalid(node.id(), format!("input {} does not broadcast to {}", bad, widest)));
        }
    }
    Ok(widest.with_dtype(first.dtype))
}

fn choose_impl(params: &ImplParams<'_>) -> anyhow::Result<Option<Box<dyn PrimitiveImpl>>> {
    let node = params.node;
    let own: EltwiseParams = node.desc().parse_params()?;
    let dtype = params.output_layout.dtype;

    let mut post_ops = Vec::new();
    let mut scalars = Vec::new();
    for fused in node.fused_primitives() {
        if fused.kind != "activation" {
            return Err(EngineError::UnsupportedFusion { node: node.id().to_string(), reason: format!("cannot fuse '{}' of kind {}", fused.id, fused.kind) }.into());
        }
        let act = ActivationParams::from_value(&fused.params)?;
        post_ops.push(act.wgsl(dtype));
        scalars.extend(act.scalars());
    }

    let kernel = ElementwiseKernel {
        routine: own.mode.routine().into(),
        inputs: params.input_layouts.iter().map(|l| l.dtype).collect(),
        output: dtype,
        combine: Some(own.mode.combine()),
        post_ops,
        options: DEFAULT_OPTIONS.into(),
    };
    Ok(Some(super::elementwise_impl(node, kernel, scalars)?))
}
