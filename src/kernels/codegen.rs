use super::KernelSource;
use crate::core::hash::hash_str;
use crate::core::types::DataType;
use crate::device::LaunchConfig;
use anyhow::anyhow;
use serde::Serialize;
use tera::{Context, Tera};

const ELEMENTWISE_TEMPLATE: &str = include_str!("../../templates/kernels/elementwise.wgsl.tera");

pub const DEFAULT_OPTIONS: &str = "-O2";

/// How input `j > 0` is folded into the accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combine {
    Infix(&'static str),
    Call(&'static str),
}

impl Combine {
    fn expr(&self, operand: &str) -> String {
        match self {
            Combine::Infix(op) => format!("acc {} {}", op, operand),
            Combine::Call(f) => format!("{}(acc, {})", f, operand),
        }
    }
}

/// An elementwise kernel: `out[i] = post(fold(in0[i], in1[i], ..))`, inputs
/// broadcast by index modulo their length.
#[derive(Debug, Clone)]
pub struct ElementwiseKernel {
    pub routine: String,
    pub inputs: Vec<DataType>,
    pub output: DataType,
    pub combine: Option<Combine>,
    /// WGSL expressions over `acc`, applied in order.
    pub post_ops: Vec<String>,
    pub options: String,
}

#[derive(Serialize)]
struct RenderInfo<'a> {
    routine: &'a str,
    entry: String,
    inputs: Vec<&'static str>,
    out_type: &'static str,
    steps: Vec<String>,
    workgroup: usize,
}

fn wgsl_type(dtype: DataType) -> anyhow::Result<&'static str> {
    dtype.to_wgsl_type().ok_or_else(|| anyhow!("no device kernel storage for {}", dtype.name()))
}

/// Numeric literal of `dtype` usable inside generated expressions.
pub fn wgsl_literal(dtype: DataType, value: f64) -> String {
    match dtype {
        DataType::I32 | DataType::I64 => format!("({}i)", value as i32),
        DataType::U32 => format!("{}u", value.max(0.0) as u32),
        DataType::F32 | DataType::F64 => format!("({:?})", value as f32),
    }
}

pub fn render_elementwise(kernel: &ElementwiseKernel) -> anyhow::Result<KernelSource> {
    if kernel.inputs.is_empty() {
        return Err(anyhow!("elementwise kernel '{}' has no inputs", kernel.routine));
    }
    let inputs = kernel.inputs.iter().map(|t| wgsl_type(*t)).collect::<anyhow::Result<Vec<_>>>()?;
    let out_type = wgsl_type(kernel.output)?;

    // The suffix only has to separate different kernels of the same routine.
    let signature = format!("{}|{:?}|{}|{:?}|{:?}|{}", kernel.routine, inputs, out_type, kernel.combine, kernel.post_ops, kernel.options);
    let entry = format!("{}__{:016x}", kernel.routine, hash_str(&signature));

    let mut steps = Vec::new();
    if let Some(combine) = kernel.combine {
        for j in 1..inputs.len() {
            steps.push(combine.expr(&format!("{e}_in{j}[i % arrayLength(&{e}_in{j})]", e = entry, j = j)));
        }
    }
    steps.extend(kernel.post_ops.iter().cloned());

    let info = RenderInfo { routine: &kernel.routine, entry: entry.clone(), inputs, out_type, steps, workgroup: LaunchConfig::WORKGROUP };

    let mut tera = Tera::default();
    tera.autoescape_on(vec![]);
    tera.add_raw_template("elementwise.wgsl", ELEMENTWISE_TEMPLATE)?;
    let code = tera.render("elementwise.wgsl", &Context::from_serialize(&info)?)?;

    Ok(KernelSource::new(&entry, code, &kernel.options))
}
