use crate::core::types::{DataType, Layout};
use crate::kernels::codegen::{DEFAULT_OPTIONS, ElementwiseKernel};
use crate::program::ProgramNode;
use crate::registry::{ImplParams, NodeType};
use crate::runtime::PrimitiveImpl;
use serde::Deserialize;

/// Element type conversion, inserted in front of inputs that disagree with
/// what their user needs.
#[derive(Debug, Deserialize)]
pub struct ReorderParams {
    pub dtype: DataType,
}

pub fn node_type() -> NodeType {
    NodeType::new("reorder", calc_output_layout).with_choose_impl(choose_impl)
}

fn calc_output_layout(node: &ProgramNode, inputs: &[Layout]) -> anyhow::Result<Layout> {
    let params: ReorderParams = node.desc().parse_params()?;
    let input = inputs.first().ok_or_else(|| super::invalid(node.id(), "missing input"))?;
    Ok(input.with_dtype(params.dtype))
}

fn choose_impl(params: &ImplParams<'_>) -> anyhow::Result<Option<Box<dyn PrimitiveImpl>>> {
    let input = params.input_layouts.first().ok_or_else(|| super::invalid(params.node.id(), "missing input"))?;
    let kernel = ElementwiseKernel {
        routine: "convert".into(),
        inputs: vec![input.dtype],
        output: params.output_layout.dtype,
        combine: None,
        post_ops: Vec::new(),
        options: DEFAULT_OPTIONS.into(),
    };
    Ok(Some(super::elementwise_impl(params.node, kernel, Vec::new())?))
}
