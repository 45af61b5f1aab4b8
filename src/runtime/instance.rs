use super::{ExecuteContext, PrimitiveImpl, impl_key};
use crate::core::error::EngineError;
use crate::core::types::Layout;
use crate::device::{AllocationType, Buffer, Event, Stream};
use crate::engine::Engine;
use crate::program::{Program, ProgramNode};
use crate::registry::{ImplParams, InstanceContext};
use anyhow::anyhow;
use petgraph::stable_graph::NodeIndex;
use std::any::Any;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, trace};

/// Where an instance's output lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationPolicy {
    pub kind: AllocationType,
    /// Served by the memory pool; dedicated allocation otherwise.
    pub pooled: bool,
}

impl AllocationPolicy {
    /// Buffers the host reads or writes directly get dedicated lockable
    /// memory: outputs and what they alias, CPU implementations and their
    /// producers, inputs, and everything in nested programs.
    pub fn for_node(program: &Program, idx: NodeIndex) -> Self {
        let engine = program.engine();
        let device = engine.device();
        let node = program.node(idx);
        let on_cpu = node.selected_impl().is_some_and(|imp| imp.is_cpu());
        if program.is_output_buffer(idx) || node.is_input() || on_cpu || program.has_cpu_user(idx) || program.is_internal() {
            return Self { kind: device.lockable_allocation(), pooled: false };
        }
        let kind = if device.supports_allocation(AllocationType::Device) { AllocationType::Device } else { device.lockable_allocation() };
        Self { kind, pooled: engine.config().use_memory_pool }
    }
}

/// Runtime counterpart of a program node inside one network.
pub struct PrimitiveInst {
    id: String,
    node: NodeIndex,
    layout: Layout,
    output: Option<Buffer>,
    imp: Option<Box<dyn PrimitiveImpl>>,
    state: Box<dyn Any + Send>,
    policy: AllocationPolicy,
    is_input: bool,
    is_output: bool,
    is_constant: bool,
    can_be_optimized: bool,
    /// Positions of dependencies in the network's instance list, by slot.
    pub(crate) deps: Vec<usize>,
    /// Executed instances this one must wait for (aliases resolved).
    pub(crate) exec_deps: Vec<usize>,
    pub(crate) executes: bool,
    pub(crate) mutable_input: bool,
    pub(crate) shape_changed: bool,
    has_valid_output: bool,
    args_bound: bool,
    impl_updates: usize,
}

impl PrimitiveInst {
    pub fn new(program: &Program, idx: NodeIndex, ctx: &InstanceContext<'_>) -> anyhow::Result<Self> {
        let node = program.node(idx);
        let setup = (node.node_type().create_instance)(node, ctx)?;
        let source_constant = node.is_constant() && program.dependencies(idx).is_empty();
        Ok(Self {
            id: node.id().to_string(),
            node: idx,
            layout: node.output_layout()?.clone(),
            has_valid_output: setup.output.is_some(),
            output: setup.output,
            imp: node.selected_impl().map(|imp| imp.clone_box()),
            state: setup.state,
            policy: AllocationPolicy::for_node(program, idx),
            is_input: node.is_input(),
            is_output: node.is_output(),
            is_constant: node.is_constant(),
            can_be_optimized: node.can_be_optimized(),
            deps: Vec::new(),
            exec_deps: Vec::new(),
            executes: !node.can_be_optimized() && !source_constant,
            mutable_input: false,
            shape_changed: false,
            args_bound: false,
            impl_updates: 0,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn node(&self) -> NodeIndex {
        self.node
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn output(&self) -> Option<&Buffer> {
        self.output.as_ref()
    }

    pub fn policy(&self) -> AllocationPolicy {
        self.policy
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

    pub fn has_valid_output(&self) -> bool {
        self.has_valid_output
    }

    pub fn kernel_name(&self) -> Option<&str> {
        self.imp.as_ref().map(|imp| imp.kernel_name())
    }

    /// How many times the implementation was re-selected after a shape change.
    pub fn impl_updates(&self) -> usize {
        self.impl_updates
    }

    /// Initial output allocation. Inputs, aliases and dynamic layouts wait for execution.
    pub(crate) fn allocate_output(&mut self, engine: &Engine, deps: &BTreeSet<String>, network_id: u32) -> anyhow::Result<()> {
        if self.output.is_some() || self.is_input || self.can_be_optimized || self.layout.is_dynamic() {
            return Ok(());
        }
        let buffer = engine.memory_pool().get_memory(&self.layout, &self.id, network_id, deps, self.policy.kind, self.policy.pooled)?;
        self.output = Some(buffer);
        Ok(())
    }

    /// Views the dependency's buffer with this instance's layout.
    pub(crate) fn alias(&mut self, source: &Buffer) -> anyhow::Result<()> {
        let same = self.output.as_ref().is_some_and(|o| o.same_storage(source) && o.layout() == &self.layout);
        if !same {
            self.output = Some(source.reinterpret(&self.layout)?);
            self.args_bound = false;
        }
        Ok(())
    }

    pub(crate) fn set_input(&mut self, buffer: Buffer) {
        if buffer.layout() != &self.layout {
            self.layout = buffer.layout().clone();
            self.shape_changed = true;
        }
        self.output = Some(buffer);
        self.has_valid_output = true;
    }

    pub(crate) fn set_output(&mut self, buffer: Buffer) {
        self.output = Some(buffer);
        self.has_valid_output = true;
        self.args_bound = false;
    }

    /// Recomputes the layout when a dependency changed shape or the current
    /// one is still symbolic.
    pub fn update_shape(&mut self, node: &ProgramNode, dep_layouts: &[Layout], dep_changed: bool) -> anyhow::Result<()> {
        if self.is_input || dep_layouts.is_empty() {
            return Ok(());
        }
        if !dep_changed && !self.layout.is_dynamic() {
            return Ok(());
        }
        if dep_layouts.iter().any(|l| l.is_dynamic()) {
            return Ok(());
        }
        let layout = (node.node_type().calc_output_layout)(node, dep_layouts)?;
        if layout != self.layout {
            trace!(id = %self.id, from = %self.layout, to = %layout, "shape changed");
            self.layout = layout;
            self.shape_changed = true;
        }
        Ok(())
    }

    /// Re-selects the implementation for the current layouts through the
    /// engine's implementation cache.
    pub fn update_impl(&mut self, engine: &Engine, node: &ProgramNode, inputs: &[(Layout, bool)]) -> anyhow::Result<()> {
        if self.can_be_optimized {
            return Ok(());
        }
        if self.layout.is_dynamic() || inputs.iter().any(|(l, _)| l.is_dynamic()) {
            return Err(EngineError::DynamicLayout(self.id.clone()).into());
        }
        let key = impl_key(&self.id, node.unique_id(), &self.layout, inputs);
        let input_layouts: Vec<Layout> = inputs.iter().map(|(l, _)| l.clone()).collect();
        let output_layout = &self.layout;
        let (prototype, hit) = engine.impl_cache().get_or_try_insert_with(&key, || {
            let params = ImplParams { node, input_layouts: &input_layouts, output_layout };
            let Some(mut imp) = (node.node_type().choose_impl)(&params)? else {
                return Ok(None);
            };
            imp.add_kernels(engine.kernel_cache())?;
            engine.kernel_cache().build_all()?;
            imp.init_kernels(engine.kernel_cache())?;
            Ok(Some(Arc::from(imp)))
        })?;
        debug!(id = %self.id, layout = %self.layout, cached = hit, "implementation updated");
        self.imp = prototype.map(|p| p.clone_box());
        self.impl_updates += 1;
        self.args_bound = false;
        Ok(())
    }

    /// Keeps the current buffer when it is large enough, otherwise trades it
    /// for a new one.
    pub fn realloc_if_needed(&mut self, engine: &Engine, deps: &BTreeSet<String>, network_id: u32) -> anyhow::Result<()> {
        if self.is_input || self.can_be_optimized || (self.is_constant && self.has_valid_output) {
            return Ok(());
        }
        let needed = self.layout.byte_size().ok_or_else(|| EngineError::DynamicLayout(self.id.clone()))?;
        if let Some(current) = &self.output {
            if current.capacity() >= needed {
                if current.layout() != &self.layout {
                    self.output = Some(current.reinterpret(&self.layout)?);
                    self.args_bound = false;
                }
                return Ok(());
            }
            if self.policy.pooled {
                engine.memory_pool().release_memory(current, &self.id, network_id);
            }
        }
        debug!(id = %self.id, bytes = needed, "reallocating output");
        self.output =
            Some(engine.memory_pool().get_memory(&self.layout, &self.id, network_id, deps, self.policy.kind, self.policy.pooled)?);
        self.args_bound = false;
        Ok(())
    }

    /// Forces kernel arguments to be set again, e.g. after a dependency's
    /// memory was replaced.
    pub(crate) fn invalidate_arguments(&mut self) {
        self.args_bound = false;
    }

    /// Whether kernel arguments must be set again before the next run.
    pub(crate) fn needs_rebind(&self, dep_changed: bool) -> bool {
        self.imp.is_some() && (!self.args_bound || self.mutable_input || self.is_output || dep_changed)
    }

    pub(crate) fn bind(&mut self, inputs: &[Buffer]) -> anyhow::Result<()> {
        let output = self.output.as_ref().ok_or_else(|| anyhow!("'{}' has no output memory", self.id))?;
        if let Some(imp) = self.imp.as_mut() {
            imp.set_arguments(inputs, output)?;
        }
        self.args_bound = true;
        Ok(())
    }

    /// Submits the implementation; instances without one enqueue a marker
    /// so that users still get an event.
    pub(crate) fn execute(
        &mut self,
        stream: &Arc<dyn Stream>,
        wait_on: &[Event],
        inputs: &[Buffer],
        input_ids: &[String],
    ) -> anyhow::Result<Event> {
        let Some(imp) = self.imp.as_mut() else {
            return stream.enqueue_marker(wait_on);
        };
        let output = self.output.as_ref().ok_or_else(|| anyhow!("'{}' has no output memory", self.id))?;
        trace!(id = %self.id, kernel = imp.kernel_name(), waits = wait_on.len(), "execute");
        let mut ctx = ExecuteContext { id: &self.id, stream, wait_on, inputs, input_ids, output, state: &mut *self.state };
        let event = imp.execute(&mut ctx)?;
        self.has_valid_output = true;
        Ok(event)
    }
}

impl std::fmt::Debug for PrimitiveInst {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimitiveInst")
            .field("id", &self.id)
            .field("layout", &self.layout.to_string())
            .field("kernel", &self.kernel_name())
            .field("executes", &self.executes)
            .finish()
    }
}
