use crate::core::types::Layout;
use crate::device::host::HostRoutine;
use crate::device::{Buffer, Event, Kernel, KernelArgs, LaunchConfig, Stream};
use crate::kernels::{KernelCache, KernelId, KernelSource};
use anyhow::anyhow;
use std::any::Any;
use std::sync::Arc;

pub struct ExecuteContext<'a> {
    pub id: &'a str,
    pub stream: &'a Arc<dyn Stream>,
    pub wait_on: &'a [Event],
    pub inputs: &'a [Buffer],
    pub input_ids: &'a [String],
    pub output: &'a Buffer,
    pub state: &'a mut (dyn Any + Send),
}

/// A selected implementation of one node. Instances own a private clone;
/// the implementation cache keeps the prototype.
pub trait PrimitiveImpl: Send + Sync {
    fn kernel_name(&self) -> &str;

    /// Host-side implementations need lockable memory on both ends.
    fn is_cpu(&self) -> bool {
        false
    }

    /// Registers kernel sources with the cache without compiling them.
    fn add_kernels(&mut self, _cache: &KernelCache) -> anyhow::Result<()> {
        Ok(())
    }

    /// Binds compiled kernels. Requires a completed `build_all`.
    fn init_kernels(&mut self, _cache: &KernelCache) -> anyhow::Result<()> {
        Ok(())
    }

    fn set_arguments(&mut self, _inputs: &[Buffer], _output: &Buffer) -> anyhow::Result<()> {
        Ok(())
    }

    fn execute(&mut self, ctx: &mut ExecuteContext<'_>) -> anyhow::Result<Event>;

    fn clone_box(&self) -> Box<dyn PrimitiveImpl>;
}

fn kernel_args(inputs: &[Buffer], output: &Buffer, scalars: &[f64]) -> KernelArgs {
    let count = output.layout().count().unwrap_or(0);
    KernelArgs { inputs: inputs.to_vec(), output: output.clone(), scalars: scalars.to_vec(), launch: LaunchConfig::for_elements(count) }
}

/// One generated device kernel.
#[derive(Clone)]
pub struct KernelImpl {
    name: String,
    source: KernelSource,
    scalars: Vec<f64>,
    kernel_id: Option<KernelId>,
    kernel: Option<Kernel>,
    args: Option<KernelArgs>,
}

impl KernelImpl {
    pub fn new(name: &str, source: KernelSource, scalars: Vec<f64>) -> Self {
        Self { name: name.to_string(), source, scalars, kernel_id: None, kernel: None, args: None }
    }

    pub fn entry_point(&self) -> &str {
        &self.source.entry_point
    }

    pub fn kernel_id(&self) -> Option<&str> {
        self.kernel_id.as_deref()
    }
}

impl PrimitiveImpl for KernelImpl {
    fn kernel_name(&self) -> &str {
        &self.name
    }

    fn add_kernels(&mut self, cache: &KernelCache) -> anyhow::Result<()> {
        self.kernel_id = Some(cache.set_kernel_source(self.source.clone())?);
        Ok(())
    }

    fn init_kernels(&mut self, cache: &KernelCache) -> anyhow::Result<()> {
        let id = self.kernel_id.as_ref().ok_or_else(|| anyhow!("kernels of '{}' were never registered", self.name))?;
        self.kernel = Some(cache.get_kernel(id)?);
        Ok(())
    }

    fn set_arguments(&mut self, inputs: &[Buffer], output: &Buffer) -> anyhow::Result<()> {
        self.args = Some(kernel_args(inputs, output, &self.scalars));
        Ok(())
    }

    fn execute(&mut self, ctx: &mut ExecuteContext<'_>) -> anyhow::Result<Event> {
        let kernel = self.kernel.as_ref().ok_or_else(|| anyhow!("kernel of '{}' is not initialized", ctx.id))?;
        let args = self.args.as_ref().ok_or_else(|| anyhow!("arguments of '{}' are not set", ctx.id))?;
        ctx.stream.submit(kernel, args, ctx.wait_on)
    }

    fn clone_box(&self) -> Box<dyn PrimitiveImpl> {
        Box::new(self.clone())
    }
}

/// Runs a host routine on the calling thread once dependencies completed.
#[derive(Clone)]
pub struct HostImpl {
    name: String,
    routine: HostRoutine,
    scalars: Vec<f64>,
    args: Option<KernelArgs>,
}

impl HostImpl {
    pub fn new(name: &str, routine: HostRoutine, scalars: Vec<f64>) -> Self {
        Self { name: name.to_string(), routine, scalars, args: None }
    }
}

impl PrimitiveImpl for HostImpl {
    fn kernel_name(&self) -> &str {
        &self.name
    }

    fn is_cpu(&self) -> bool {
        true
    }

    fn set_arguments(&mut self, inputs: &[Buffer], output: &Buffer) -> anyhow::Result<()> {
        self.args = Some(kernel_args(inputs, output, &self.scalars));
        Ok(())
    }

    fn execute(&mut self, ctx: &mut ExecuteContext<'_>) -> anyhow::Result<Event> {
        let args = self.args.as_ref().ok_or_else(|| anyhow!("arguments of '{}' are not set", ctx.id))?;
        ctx.stream.wait_for_events(ctx.wait_on)?;
        (self.routine)(args)?;
        Ok(ctx.stream.create_user_event(true))
    }

    fn clone_box(&self) -> Box<dyn PrimitiveImpl> {
        Box::new(self.clone())
    }
}

/// Key of the implementation cache: name, node identity, output layout and
/// the layouts of every non-constant input.
pub fn impl_key(id: &str, unique_id: u64, output: &Layout, inputs: &[(Layout, bool)]) -> String {
    let mut key = format!("{}_{}_{}", id, unique_id, output);
    for (layout, is_constant) in inputs {
        if !is_constant {
            key.push('_');
            key.push_str(&layout.to_string());
        }
    }
    key
}
