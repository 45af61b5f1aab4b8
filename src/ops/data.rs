use crate::core::types::Layout;
use crate::engine::Engine;
use crate::program::ProgramNode;
use crate::registry::{InstanceContext, InstanceSetup, NodeType};
use serde::Deserialize;
use std::sync::Arc;

/// Constant tensor. `values` may be empty (zeros); `null` entries are NaN.
#[derive(Debug, Deserialize)]
pub struct DataParams {
    pub layout: Layout,
    #[serde(default)]
    pub values: Vec<Option<f64>>,
}

impl DataParams {
    fn values(&self) -> Vec<f64> {
        self.values.iter().map(|v| v.unwrap_or(f64::NAN)).collect()
    }
}

pub fn node_type() -> NodeType {
    NodeType::new("data", calc_output_layout).with_create_node(create_node).with_create_instance(create_instance)
}

fn create_node(node: &mut ProgramNode, _: &Arc<Engine>) -> anyhow::Result<()> {
    let params: DataParams = node.desc().parse_params()?;
    let count = params.layout.count().ok_or_else(|| super::invalid(node.id(), "constant data needs a static layout"))?;
    if !params.values.is_empty() && params.values.len() != count {
        return Err(super::invalid(node.id(), format!("{} values for layout {}", params.values.len(), params.layout)));
    }
    node.set_constant(true);
    Ok(())
}

fn calc_output_layout(node: &ProgramNode, _: &[Layout]) -> anyhow::Result<Layout> {
    Ok(node.desc().parse_params::<DataParams>()?.layout)
}

/// Constants own their memory from the start.
fn create_instance(node: &ProgramNode, ctx: &InstanceContext<'_>) -> anyhow::Result<InstanceSetup> {
    let params: DataParams = node.desc().parse_params()?;
    let device = ctx.engine.device();
    let buffer = device.allocate(&params.layout, device.lockable_allocation())?;
    if !params.values.is_empty() {
        buffer.write_f64(&params.values())?;
    }
    Ok(InstanceSetup { output: Some(buffer), ..Default::default() })
}
