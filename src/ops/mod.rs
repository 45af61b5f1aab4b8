//! Built-in operation kinds. The core only knows them through the registry.

pub mod activation;
pub mod condition;
pub mod data;
pub mod eltwise;
pub mod input;
pub mod loops;
pub mod reference;
pub mod reorder;
pub mod reshape;

use crate::core::error::EngineError;
use crate::kernels::codegen::{ElementwiseKernel, render_elementwise};
use crate::program::{ImplPreference, ProgramNode};
use crate::registry::Registry;
use crate::runtime::{HostImpl, KernelImpl, PrimitiveImpl};

pub fn register_builtin_ops(registry: &mut Registry) {
    registry
        .register(input::node_type())
        .register(data::node_type())
        .register(reshape::node_type())
        .register(eltwise::node_type())
        .register(activation::node_type())
        .register(reorder::node_type())
        .register(condition::node_type())
        .register(loops::node_type());
}

pub(crate) fn invalid(node: &str, reason: impl Into<String>) -> anyhow::Error {
    EngineError::InvalidParams { node: node.to_string(), reason: reason.into() }.into()
}

/// Device kernel when every type has device storage and the node does not
/// ask for the host, host routine otherwise.
pub(crate) fn elementwise_impl(node: &ProgramNode, kernel: ElementwiseKernel, scalars: Vec<f64>) -> anyhow::Result<Box<dyn PrimitiveImpl>> {
    let device_types = kernel.inputs.iter().chain(std::iter::once(&kernel.output)).all(|t| t.to_wgsl_type().is_some());
    if device_types && node.preferred_impl() != ImplPreference::Host {
        let source = render_elementwise(&kernel)?;
        return Ok(Box::new(KernelImpl::new(node.id(), source, scalars)));
    }
    let routine = reference::routine(&kernel.routine).ok_or_else(|| anyhow::anyhow!("no host routine '{}'", kernel.routine))?;
    Ok(Box::new(HostImpl::new(node.id(), routine, scalars)))
}
