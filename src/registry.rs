use crate::core::error::EngineError;
use crate::core::types::Layout;
use crate::device::{Buffer, Stream};
use crate::engine::Engine;
use crate::program::ProgramNode;
use crate::runtime::PrimitiveImpl;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

pub type CreateNodeFn = fn(&mut ProgramNode, &Arc<Engine>) -> anyhow::Result<()>;
pub type CreateInstanceFn = fn(&ProgramNode, &InstanceContext<'_>) -> anyhow::Result<InstanceSetup>;
pub type CalcOutputLayoutFn = fn(&ProgramNode, &[Layout]) -> anyhow::Result<Layout>;
pub type ChooseImplFn = fn(&ImplParams<'_>) -> anyhow::Result<Option<Box<dyn PrimitiveImpl>>>;
pub type ToStringFn = fn(&ProgramNode) -> String;

/// Static capabilities the optimization passes consult instead of matching on kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeTraits {
    /// Output may alias input 0 (pure view change).
    pub in_place: bool,
    /// May be folded into its producer as a post-operation.
    pub fusable_post_op: bool,
    /// Implementations accept fused post-operations.
    pub accepts_post_ops: bool,
    /// All inputs must share the data type of input 0.
    pub uniform_input_dtype: bool,
}

pub struct InstanceContext<'a> {
    pub engine: &'a Arc<Engine>,
    pub stream: &'a Arc<dyn Stream>,
    pub network_id: u32,
}

pub struct InstanceSetup {
    /// Memory the instance owns from the start (constants).
    pub output: Option<Buffer>,
    pub state: Box<dyn Any + Send>,
}

impl Default for InstanceSetup {
    fn default() -> Self {
        Self { output: None, state: Box::new(()) }
    }
}

pub struct ImplParams<'a> {
    pub node: &'a ProgramNode,
    pub input_layouts: &'a [Layout],
    pub output_layout: &'a Layout,
}

/// What the core needs from an operation kind.
pub struct NodeType {
    pub kind: String,
    pub traits: NodeTraits,
    pub create_node: CreateNodeFn,
    pub create_instance: CreateInstanceFn,
    pub calc_output_layout: CalcOutputLayoutFn,
    pub choose_impl: ChooseImplFn,
    pub to_string: ToStringFn,
}

fn plain_node(_: &mut ProgramNode, _: &Arc<Engine>) -> anyhow::Result<()> {
    Ok(())
}

fn plain_instance(_: &ProgramNode, _: &InstanceContext<'_>) -> anyhow::Result<InstanceSetup> {
    Ok(InstanceSetup::default())
}

fn no_impl(_: &ImplParams<'_>) -> anyhow::Result<Option<Box<dyn PrimitiveImpl>>> {
    Ok(None)
}

fn describe_kind(node: &ProgramNode) -> String {
    format!("{} {}", node.kind(), node.params())
}

impl NodeType {
    pub fn new(kind: &str, calc_output_layout: CalcOutputLayoutFn) -> Self {
        Self {
            kind: kind.to_string(),
            traits: NodeTraits::default(),
            create_node: plain_node,
            create_instance: plain_instance,
            calc_output_layout,
            choose_impl: no_impl,
            to_string: describe_kind,
        }
    }

    pub fn with_traits(mut self, traits: NodeTraits) -> Self {
        self.traits = traits;
        self
    }

    pub fn with_create_node(mut self, f: CreateNodeFn) -> Self {
        self.create_node = f;
        self
    }

    pub fn with_create_instance(mut self, f: CreateInstanceFn) -> Self {
        self.create_instance = f;
        self
    }

    pub fn with_choose_impl(mut self, f: ChooseImplFn) -> Self {
        self.choose_impl = f;
        self
    }

    pub fn with_to_string(mut self, f: ToStringFn) -> Self {
        self.to_string = f;
        self
    }
}

impl std::fmt::Debug for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeType").field("kind", &self.kind).field("traits", &self.traits).finish()
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    types: HashMap<String, Arc<NodeType>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin_ops() -> Self {
        let mut registry = Self::new();
        crate::ops::register_builtin_ops(&mut registry);
        registry
    }

    /// Adds a kind, replacing any previous registration under the same name.
    pub fn register(&mut self, node_type: NodeType) -> &mut Self {
        self.types.insert(node_type.kind.clone(), Arc::new(node_type));
        self
    }

    pub fn get(&self, kind: &str) -> anyhow::Result<Arc<NodeType>> {
        self.types.get(kind).cloned().ok_or_else(|| EngineError::UnknownKind(kind.to_string()).into())
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.types.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.types.keys().map(|k| k.as_str()).collect();
        kinds.sort();
        kinds
    }
}
