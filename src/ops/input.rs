use crate::core::types::Layout;
use crate::engine::Engine;
use crate::program::ProgramNode;
use crate::registry::NodeType;
use serde::Deserialize;
use std::sync::Arc;

/// `{"layout": {...}}`; symbolic dimensions make the network dynamic.
#[derive(Debug, Deserialize)]
pub struct InputParams {
    pub layout: Layout,
}

pub fn node_type() -> NodeType {
    NodeType::new("input_layout", calc_output_layout).with_create_node(create_node)
}

fn create_node(node: &mut ProgramNode, _: &Arc<Engine>) -> anyhow::Result<()> {
    node.desc().parse_params::<InputParams>()?;
    node.set_input(true);
    Ok(())
}

fn calc_output_layout(node: &ProgramNode, _: &[Layout]) -> anyhow::Result<Layout> {
    Ok(node.desc().parse_params::<InputParams>()?.layout)
}
