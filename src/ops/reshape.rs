use crate::core::types::{Dim, Layout, Shape};
use crate::engine::Engine;
use crate::kernels::codegen::{DEFAULT_OPTIONS, ElementwiseKernel};
use crate::program::ProgramNode;
use crate::registry::{ImplParams, NodeTraits, NodeType};
use crate::runtime::PrimitiveImpl;
use serde::Deserialize;
use std::sync::Arc;

/// Target dimensions; one entry may be `-1` and is inferred.
#[derive(Debug, Deserialize)]
pub struct ReshapeParams {
    pub shape: Vec<i64>,
}

pub fn node_type() -> NodeType {
    NodeType::new("reshape", calc_output_layout)
        .with_traits(NodeTraits { in_place: true, ..Default::default() })
        .with_create_node(create_node)
        .with_choose_impl(choose_impl)
}

fn create_node(node: &mut ProgramNode, _: &Arc<Engine>) -> anyhow::Result<()> {
    let params: ReshapeParams = node.desc().parse_params()?;
    if params.shape.iter().filter(|d| **d == -1).count() > 1 {
        return Err(super::invalid(node.id(), "at most one dimension may be -1"));
    }
    if params.shape.iter().any(|d| *d == 0 || *d < -1) {
        return Err(super::invalid(node.id(), format!("invalid target shape {:?}", params.shape)));
    }
    if node.desc().inputs.len() != 1 {
        return Err(super::invalid(node.id(), "reshape takes exactly one input"));
    }
    Ok(())
}

fn calc_output_layout(node: &ProgramNode, inputs: &[Layout]) -> anyhow::Result<Layout> {
    let params: ReshapeParams = node.desc().parse_params()?;
    let input = inputs.first().ok_or_else(|| super::invalid(node.id(), "missing input"))?;

    let known = params
        .shape
        .iter()
        .filter(|d| **d > 0)
        .try_fold(1usize, |acc, d| acc.checked_mul(*d as usize))
        .ok_or_else(|| super::invalid(node.id(), format!("element count of {:?} overflows", params.shape)))?;
    let Some(total) = input.count() else {
        // Inferred dimension stays symbolic until the input resolves.
        let dims = params
            .shape
            .iter()
            .map(|d| if *d > 0 { Dim::Static(*d as usize) } else { Dim::Variable(format!("{}_inferred", node.id())) })
            .collect();
        return Ok(input.with_shape(Shape { dims }));
    };

    let dims: Vec<usize> = if params.shape.contains(&-1) {
        if known == 0 || total % known != 0 {
            return Err(super::invalid(node.id(), format!("cannot infer dimension of {:?} from {}", params.shape, input)));
        }
        params.shape.iter().map(|d| if *d == -1 { total / known } else { *d as usize }).collect()
    } else {
        if known != total {
            return Err(super::invalid(node.id(), format!("{:?} does not hold the {} elements of {}", params.shape, total, input)));
        }
        params.shape.iter().map(|d| *d as usize).collect()
    };
    Ok(input.with_shape(Shape::new(&dims)))
}

/// Only reached when the view could not alias its input.
fn choose_impl(params: &ImplParams<'_>) -> anyhow::Result<Option<Box<dyn PrimitiveImpl>>> {
    let dtype = params.output_layout.dtype;
    let kernel = ElementwiseKernel {
        routine: "copy".into(),
        inputs: vec![dtype],
        output: dtype,
        combine: None,
        post_ops: Vec::new(),
        options: DEFAULT_OPTIONS.into(),
    };
    Ok(Some(super::elementwise_impl(params.node, kernel, Vec::new())?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::EngineError;
    use crate::core::types::DataType;
    use crate::topology::PrimitiveDesc;

    fn node(shape: serde_json::Value) -> ProgramNode {
        let desc = PrimitiveDesc::new("r", "reshape", &["x"], serde_json::json!({ "shape": shape }));
        ProgramNode::new(Arc::new(desc), Arc::new(node_type()))
    }

    #[test]
    fn infers_minus_one() {
        let out = calc_output_layout(&node(serde_json::json!([-1, 4])), &[Layout::new(DataType::F32, &[2, 2, 4])]).unwrap();
        assert_eq!(out.shape, Shape::new(&[4, 4]));
    }

    #[test]
    fn rejects_element_count_change() {
        assert!(calc_output_layout(&node(serde_json::json!([3])), &[Layout::new(DataType::F32, &[4])]).is_err());
    }

    #[test]
    fn rejects_overflowing_target_shape() {
        let huge = i64::MAX;
        let err = calc_output_layout(&node(serde_json::json!([huge, huge, -1])), &[Layout::new(DataType::F32, &[4])]).unwrap_err();
        assert!(matches!(err.downcast_ref::<EngineError>(), Some(EngineError::InvalidParams { .. })));
        assert!(err.to_string().contains("overflows"));
    }
}
