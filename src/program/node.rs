use crate::core::error::EngineError;
use crate::core::types::Layout;
use crate::registry::NodeType;
use crate::runtime::PrimitiveImpl;
use crate::topology::PrimitiveDesc;
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_UNIQUE_ID: AtomicU64 = AtomicU64::new(0);

/// A secondary operation folded into its producer.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FusedPrimitive {
    pub id: String,
    pub kind: String,
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ImplPreference {
    #[default]
    Any,
    Device,
    Host,
}

pub struct ProgramNode {
    desc: Arc<PrimitiveDesc>,
    node_type: Arc<NodeType>,
    unique_id: u64,
    pub(crate) output_layout: Option<Layout>,
    pub(crate) is_input: bool,
    pub(crate) is_output: bool,
    pub(crate) is_constant: bool,
    pub(crate) can_be_optimized: bool,
    pub(crate) preferred_impl: ImplPreference,
    pub(crate) fused: Vec<FusedPrimitive>,
    pub(crate) payload: Option<Arc<dyn Any + Send + Sync>>,
    pub(crate) selected_impl: Option<Arc<dyn PrimitiveImpl>>,
    pub(crate) memory_dependencies: BTreeSet<String>,
}

impl ProgramNode {
    pub fn new(desc: Arc<PrimitiveDesc>, node_type: Arc<NodeType>) -> Self {
        Self {
            desc,
            node_type,
            unique_id: NEXT_UNIQUE_ID.fetch_add(1, Ordering::Relaxed),
            output_layout: None,
            is_input: false,
            is_output: false,
            is_constant: false,
            can_be_optimized: false,
            preferred_impl: ImplPreference::Any,
            fused: Vec::new(),
            payload: None,
            selected_impl: None,
            memory_dependencies: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.desc.id
    }

    pub fn kind(&self) -> &str {
        &self.desc.kind
    }

    pub fn desc(&self) -> &Arc<PrimitiveDesc> {
        &self.desc
    }

    pub fn params(&self) -> &serde_json::Value {
        &self.desc.params
    }

    pub fn node_type(&self) -> &Arc<NodeType> {
        &self.node_type
    }

    /// Process-wide id; two programs built from one topology never share it.
    pub fn unique_id(&self) -> u64 {
        self.unique_id
    }

    pub fn output_layout(&self) -> anyhow::Result<&Layout> {
        self.output_layout.as_ref().ok_or_else(|| EngineError::LayoutNotComputed(self.id().to_string()).into())
    }

    pub fn is_input(&self) -> bool {
        self.is_input
    }

    pub fn is_output(&self) -> bool {
        self.is_output
    }

    pub fn is_constant(&self) -> bool {
        self.is_constant
    }

    pub fn can_be_optimized(&self) -> bool {
        self.can_be_optimized
    }

    pub fn preferred_impl(&self) -> ImplPreference {
        self.preferred_impl
    }

    pub fn fused_primitives(&self) -> &[FusedPrimitive] {
        &self.fused
    }

    pub fn selected_impl(&self) -> Option<&Arc<dyn PrimitiveImpl>> {
        self.selected_impl.as_ref()
    }

    pub fn memory_dependencies(&self) -> &BTreeSet<String> {
        &self.memory_dependencies
    }

    pub fn set_input(&mut self, value: bool) {
        self.is_input = value;
    }

    pub fn set_constant(&mut self, value: bool) {
        self.is_constant = value;
    }

    pub fn set_preferred_impl(&mut self, pref: ImplPreference) {
        self.preferred_impl = pref;
    }

    pub fn set_payload<T: Any + Send + Sync>(&mut self, payload: T) {
        self.payload = Some(Arc::new(payload));
    }

    /// Kind-specific state attached by `create_node`.
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.as_ref()?.downcast_ref::<T>()
    }

    /// Swaps descriptor and type, as when a folded constant becomes a data node.
    pub(crate) fn replace_desc(&mut self, desc: Arc<PrimitiveDesc>, node_type: Arc<NodeType>) {
        self.desc = desc;
        self.node_type = node_type;
        self.payload = None;
        self.fused.clear();
        self.selected_impl = None;
    }
}

impl fmt::Debug for ProgramNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramNode")
            .field("id", &self.desc.id)
            .field("kind", &self.desc.kind)
            .field("layout", &self.output_layout.as_ref().map(|l| l.to_string()))
            .field("input", &self.is_input)
            .field("output", &self.is_output)
            .field("constant", &self.is_constant)
            .field("optimized", &self.can_be_optimized)
            .field("fused", &self.fused.iter().map(|p| p.id.as_str()).collect::<Vec<_>>())
            .finish()
    }
}
