use anyhow::{Context, anyhow};
use serde::Deserialize;
use sionflow_engine::{Buffer, BuildOptions, EngineConfig, Engine, HostDevice, Layout, Network, Topology};
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

/// Values for one network input, as given in the inputs file.
#[derive(Debug, Deserialize)]
struct InputData {
    layout: Layout,
    values: Vec<f64>,
}

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let topology_path = args.next().ok_or_else(|| anyhow!("usage: sionflow-engine <topology.json> [inputs.json]"))?;
    let inputs_path = args.next();

    println!("1. Loading topology from {}...", topology_path);
    let topology = Topology::from_json(&fs::read_to_string(&topology_path)?)?;

    let config = EngineConfig::default().from_env_overrides();
    let engine = Engine::new(Arc::new(HostDevice::new()), config)?;

    println!("2. Building program ({} primitives)...", topology.len());
    let mut network = Network::build(&engine, &topology, BuildOptions::default())?;
    println!("   processing order: {:?}", network.program().get_processing_order());
    println!("   optimized out: {:?}", network.program().get_optimized_out());

    if let Some(path) = inputs_path {
        println!("3. Setting inputs from {}...", path);
        let inputs: BTreeMap<String, InputData> =
            serde_json::from_str(&fs::read_to_string(&path)?).with_context(|| format!("Failed to parse inputs file {}", path))?;
        for (id, data) in inputs {
            network.set_input_data(&id, Buffer::from_f64(&data.layout, &data.values)?)?;
        }
    }

    println!("4. Executing...");
    let outputs = network.execute(&[])?;
    println!("   executed: {:?}", network.get_executed_ids());
    let stats = engine.kernel_cache().stats();
    println!("   kernels: {} compiled, {} loaded from disk, {} reused", stats.compiled, stats.loaded_from_disk, stats.reused);

    println!("--- Outputs ---");
    for (id, output) in outputs {
        println!("{} {} = {:?}", id, output.memory().layout(), output.to_f64_vec()?);
    }
    Ok(())
}
