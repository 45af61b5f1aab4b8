#![allow(dead_code)]

use serde_json::json;
use sionflow_engine::{Buffer, DataType, Engine, EngineConfig, EngineError, HostDevice, Layout, PrimitiveDesc};
use std::sync::Arc;

pub fn host_engine() -> (Arc<HostDevice>, Arc<Engine>) {
    engine_with(EngineConfig::default())
}

pub fn engine_with(config: EngineConfig) -> (Arc<HostDevice>, Arc<Engine>) {
    let device = Arc::new(HostDevice::new());
    let engine = Engine::new(device.clone(), config).unwrap();
    (device, engine)
}

pub fn input(id: &str, dtype: DataType, dims: &[usize]) -> PrimitiveDesc {
    PrimitiveDesc::new(id, "input_layout", &[], json!({ "layout": Layout::new(dtype, dims) }))
}

pub fn dynamic_input(id: &str, dims: serde_json::Value) -> PrimitiveDesc {
    PrimitiveDesc::new(id, "input_layout", &[], json!({ "layout": { "dtype": "F32", "shape": dims } }))
}

pub fn data(id: &str, dims: &[usize], values: &[f64]) -> PrimitiveDesc {
    PrimitiveDesc::new(id, "data", &[], json!({ "layout": Layout::new(DataType::F32, dims), "values": values }))
}

pub fn eltwise(id: &str, mode: &str, inputs: &[&str]) -> PrimitiveDesc {
    PrimitiveDesc::new(id, "eltwise", inputs, json!({ "mode": mode }))
}

pub fn activation(id: &str, func: &str, input: &str) -> PrimitiveDesc {
    PrimitiveDesc::new(id, "activation", &[input], json!({ "func": func }))
}

pub fn reshape(id: &str, input: &str, shape: &[i64]) -> PrimitiveDesc {
    PrimitiveDesc::new(id, "reshape", &[input], json!({ "shape": shape }))
}

pub fn f32_buffer(dims: &[usize], values: &[f32]) -> Buffer {
    Buffer::from_f32(&Layout::new(DataType::F32, dims), values).unwrap()
}

/// The `EngineError` somewhere in the context chain.
pub fn engine_error(err: &anyhow::Error) -> Option<&EngineError> {
    err.chain().find_map(|e| e.downcast_ref::<EngineError>())
}
