use crate::core::types::{DataType, Layout};
use crate::engine::Engine;
use crate::kernels::codegen::{DEFAULT_OPTIONS, ElementwiseKernel, wgsl_literal};
use crate::program::ProgramNode;
use crate::registry::{ImplParams, NodeTraits, NodeType};
use crate::runtime::PrimitiveImpl;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActivationFunc {
    Relu,
    Abs,
    Neg,
    /// `a * x + b`
    Linear,
    /// `clamp(x, a, b)`
    Clamp,
}

impl ActivationFunc {
    const ALL: [ActivationFunc; 5] = [Self::Relu, Self::Abs, Self::Neg, Self::Linear, Self::Clamp];

    /// Numeric tag carried in kernel scalar arguments.
    pub fn code(&self) -> f64 {
        match self {
            Self::Relu => 0.0,
            Self::Abs => 1.0,
            Self::Neg => 2.0,
            Self::Linear => 3.0,
            Self::Clamp => 4.0,
        }
    }

    pub fn from_code(code: f64) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.code() == code)
    }

    pub fn apply(&self, x: f64, a: f64, b: f64) -> f64 {
        match self {
            Self::Relu => x.max(0.0),
            Self::Abs => x.abs(),
            Self::Neg => -x,
            Self::Linear => a * x + b,
            Self::Clamp => x.max(a).min(b),
        }
    }

    /// WGSL expression over `acc`.
    pub fn wgsl(&self, dtype: DataType, a: f64, b: f64) -> String {
        let (a, b) = (wgsl_literal(dtype, a), wgsl_literal(dtype, b));
        match self {
            Self::Relu => format!("max(acc, {})", wgsl_literal(dtype, 0.0)),
            Self::Abs => "abs(acc)".to_string(),
            Self::Neg if dtype == DataType::U32 => "(0u - acc)".to_string(),
            Self::Neg => "(-acc)".to_string(),
            Self::Linear => format!("(acc * {} + {})", a, b),
            Self::Clamp => format!("clamp(acc, {}, {})", a, b),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct ActivationParams {
    pub func: ActivationFunc,
    #[serde(default)]
    pub a: f64,
    #[serde(default)]
    pub b: f64,
}

impl ActivationParams {
    pub fn from_value(value: &serde_json::Value) -> anyhow::Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    /// `(code, a, b)` as read by `apply_post_ops`.
    pub fn scalars(&self) -> [f64; 3] {
        [self.func.code(), self.a, self.b]
    }

    pub fn wgsl(&self, dtype: DataType) -> String {
        self.func.wgsl(dtype, self.a, self.b)
    }
}

/// Applies `(code, a, b)` triples in order. Unknown codes are skipped.
pub fn apply_post_ops(value: f64, scalars: &[f64]) -> f64 {
    scalars.chunks_exact(3).fold(value, |acc, op| match ActivationFunc::from_code(op[0]) {
        Some(func) => func.apply(acc, op[1], op[2]),
        None => acc,
    })
}

pub fn node_type() -> NodeType {
    NodeType::new("activation", calc_output_layout)
        .with_traits(NodeTraits { fusable_post_op: true, ..Default::default() })
        .with_create_node(create_node)
        .with_choose_impl(choose_impl)
}

fn create_node(node: &mut ProgramNode, _: &Arc<Engine>) -> anyhow::Result<()> {
    let params: ActivationParams = node.desc().parse_params()?;
    if !params.a.is_finite() || !params.b.is_finite() {
        return Err(super::invalid(node.id(), "activation parameters must be finite"));
    }
    if node.desc().inputs.len() != 1 {
        return Err(super::invalid(node.id(), "activation takes exactly one input"));
    }
    Ok(())
}

fn calc_output_layout(node: &ProgramNode, inputs: &[Layout]) -> anyhow::Result<Layout> {
    inputs.first().cloned().ok_or_else(|| super::invalid(node.id(), "missing input"))
}

fn choose_impl(params: &ImplParams<'_>) -> anyhow::Result<Option<Box<dyn PrimitiveImpl>>> {
    let own: ActivationParams = params.node.desc().parse_params()?;
    let dtype = params.output_layout.dtype;
    let input = params.input_layouts.first().map(|l| l.dtype).unwrap_or(dtype);
    let kernel = ElementwiseKernel {
        routine: "activation".into(),
        inputs: vec![input],
        output: dtype,
        combine: None,
        post_ops: vec![own.wgsl(dtype)],
        options: DEFAULT_OPTIONS.into(),
    };
    Ok(Some(super::elementwise_impl(params.node, kernel, own.scalars().to_vec())?))
}
