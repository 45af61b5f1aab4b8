//! Host reference routines: what each generated kernel computes, evaluated
//! element by element. Used by `HostDevice` and by host fallback impls.

use super::activation::apply_post_ops;
use crate::device::KernelArgs;
use crate::device::host::HostRoutine;
use anyhow::anyhow;

pub fn builtin_routines() -> Vec<(&'static str, HostRoutine)> {
    vec![
        ("copy", convert as HostRoutine),
        ("convert", convert),
        ("activation", activation),
        ("eltwise_sum", eltwise_sum),
        ("eltwise_prod", eltwise_prod),
        ("eltwise_sub", eltwise_sub),
        ("eltwise_max", eltwise_max),
        ("eltwise_min", eltwise_min),
    ]
}

/// Looks up a builtin routine by name.
pub fn routine(name: &str) -> Option<HostRoutine> {
    builtin_routines().into_iter().find(|(n, _)| *n == name).map(|(_, f)| f)
}

fn output_count(args: &KernelArgs) -> anyhow::Result<usize> {
    args.output.layout().count().ok_or_else(|| anyhow!("kernel output layout {} is dynamic", args.output.layout()))
}

fn map_elements(args: &KernelArgs, combine: fn(f64, f64) -> f64) -> anyhow::Result<()> {
    if args.inputs.is_empty() {
        return Err(anyhow!("elementwise routine needs at least one input"));
    }
    let count = output_count(args)?;
    let inputs = args
        .inputs
        .iter()
        .map(|b| Ok((b.layout().dtype, b.read_bytes()?, b.layout().count().unwrap_or(0).max(1))))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let out_dtype = args.output.layout().dtype;
    let mut out = vec![0u8; count * out_dtype.size()];
    for i in 0..count {
        let (dt, bytes, n) = &inputs[0];
        let mut acc = dt.read(bytes, i % n);
        for (dt, bytes, n) in &inputs[1..] {
            acc = combine(acc, dt.read(bytes, i % n));
        }
        out_dtype.write(&mut out, i, apply_post_ops(acc, &args.scalars));
    }
    args.output.write_bytes(&out)
}

fn convert(args: &KernelArgs) -> anyhow::Result<()> {
    map_elements(args, |a, _| a)
}

fn activation(args: &KernelArgs) -> anyhow::Result<()> {
    map_elements(args, |a, _| a)
}

fn eltwise_sum(args: &KernelArgs) -> anyhow::Result<()> {
    map_elements(args, |a, b| a + b)
}

fn eltwise_prod(args: &KernelArgs) -> anyhow::Result<()> {
    map_elements(args, |a, b| a * b)
}

fn eltwise_sub(args: &KernelArgs) -> anyhow::Result<()> {
    map_elements(args, |a, b| a - b)
}

fn eltwise_max(args: &KernelArgs) -> anyhow::Result<()> {
    map_elements(args, f64::max)
}

fn eltwise_min(args: &KernelArgs) -> anyhow::Result<()> {
    map_elements(args, f64::min)
}
