mod common;

use common::*;
use sionflow_engine::{BuildOptions, DataType, EngineError, Network, Program, Topology};
use std::sync::Arc;

fn fused_topology() -> Topology {
    Topology::new()
        .with(input("a", DataType::F32, &[4]))
        .with(input("b", DataType::F32, &[4]))
        .with(eltwise("c", "sum", &["a", "b"]))
        .with(activation("d", "relu", "c"))
        .with(eltwise("e", "prod", &["d", "b"]))
}

fn assert_topological(program: &Program) {
    let order = program.get_processing_order();
    let pos = |id: &str| order.iter().position(|o| o == id).unwrap();
    for id in &order {
        let idx = program.get_node_index(id).unwrap();
        for dep in program.dependencies(idx) {
            assert!(pos(program.node(dep).id()) < pos(id), "{} must precede {}", program.node(dep).id(), id);
        }
    }
}

#[test]
fn processing_order_follows_dependencies() {
    let (_, engine) = host_engine();
    let topology = Topology::new()
        .with(eltwise("sum", "sum", &["x", "w"]))
        .with(activation("act", "abs", "sum"))
        .with(data("w", &[4], &[1.0, 2.0, 3.0, 4.0]))
        .with(input("x", DataType::F32, &[4]));
    let program = Program::build(&engine, &topology, BuildOptions::unoptimized()).unwrap();
    assert_eq!(program.node_count(), 4);
    assert_topological(&program);
    assert_eq!(program.get_input_ids(), vec!["x"]);
    assert_eq!(program.get_output_ids(), vec!["act"]);
}

#[test]
fn malformed_topologies_fail_to_build() {
    let (_, engine) = host_engine();

    let dangling = Topology::new().with(activation("y", "relu", "missing"));
    let err = Program::build(&engine, &dangling, BuildOptions::default()).unwrap_err();
    assert!(matches!(engine_error(&err), Some(EngineError::DanglingReference { dependency, .. }) if dependency == "missing"));

    let duplicate = Topology::new().with(input("x", DataType::F32, &[1])).with(input("x", DataType::F32, &[2]));
    let err = Program::build(&engine, &duplicate, BuildOptions::default()).unwrap_err();
    assert_eq!(engine_error(&err), Some(&EngineError::DuplicateId("x".into())));

    let cyclic = Topology::new()
        .with(input("a", DataType::F32, &[4]))
        .with(eltwise("x", "sum", &["a", "y"]))
        .with(activation("y", "relu", "x"));
    let err = Program::build(&engine, &cyclic, BuildOptions::default()).unwrap_err();
    assert!(matches!(engine_error(&err), Some(EngineError::CyclicReference(_))));

    let unknown = Topology::new().with(sionflow_engine::PrimitiveDesc::new("p", "pooling", &[], serde_json::json!({})));
    let err = Program::build(&engine, &unknown, BuildOptions::default()).unwrap_err();
    assert_eq!(engine_error(&err), Some(&EngineError::UnknownKind("pooling".into())));

    let options = BuildOptions::default().with_outputs(["nope"]);
    let err = Program::build(&engine, &fused_topology(), options).unwrap_err();
    assert_eq!(engine_error(&err), Some(&EngineError::UnknownOutput("nope".into())));
}

#[test]
fn activation_is_fused_into_its_producer() {
    let (_, engine) = host_engine();
    let program = Program::build(&engine, &fused_topology(), BuildOptions::default()).unwrap();

    assert!(program.get_node_index("d").is_none());
    assert_eq!(program.get_optimized_out(), ["d".to_string()]);
    assert!(program.get_optimized().contains(&("d".to_string(), vec!["c".to_string()])));
    assert_eq!(program.get_fusing_history().get("c"), Some(&vec!["d".to_string()]));
    let c = program.get_node("c").unwrap();
    assert_eq!(c.fused_primitives().len(), 1);
    assert!(c.selected_impl().is_some());
    assert_topological(&program);

    let mut net = Network::new(Arc::new(program), engine.create_stream().unwrap()).unwrap();
    net.set_input_data("a", f32_buffer(&[4], &[-1.0, 2.0, -3.0, 4.0])).unwrap();
    net.set_input_data("b", f32_buffer(&[4], &[1.0, 1.0, 1.0, 2.0])).unwrap();
    let out = net.execute(&[]).unwrap();
    assert_eq!(out["e"].to_f32_vec().unwrap(), vec![0.0, 3.0, 0.0, 12.0]);
}

#[test]
fn outputs_are_never_fused_away() {
    let (_, engine) = host_engine();
    let options = BuildOptions::default().with_outputs(["d", "e"]);
    let program = Program::build(&engine, &fused_topology(), options).unwrap();
    assert!(program.get_node_index("d").is_some());
    assert!(program.get_fusing_history().is_empty());
}

#[test]
fn rerunning_the_pipeline_changes_nothing() {
    let (device, engine) = host_engine();
    let mut program = Program::build(&engine, &fused_topology(), BuildOptions::default()).unwrap();
    let order = program.get_processing_order();
    let optimized_out = program.get_optimized_out().to_vec();
    let compiles = device.compile_calls();

    program.optimize().unwrap();

    assert_eq!(program.get_processing_order(), order);
    assert_eq!(program.get_optimized_out(), optimized_out.as_slice());
    assert_eq!(program.get_node("c").unwrap().fused_primitives().len(), 1);
    assert_eq!(device.compile_calls(), compiles);
}

#[test]
fn mismatching_input_types_get_a_reorder() {
    let (_, engine) = host_engine();
    let topology = Topology::new()
        .with(input("a", DataType::F32, &[4]))
        .with(input("b", DataType::I32, &[4]))
        .with(eltwise("c", "sum", &["a", "b"]));
    let program = Program::build(&engine, &topology, BuildOptions::default()).unwrap();

    let reorder = program.get_node("c_reorder_1").unwrap();
    assert_eq!(reorder.kind(), "reorder");
    assert_eq!(reorder.output_layout().unwrap().dtype, DataType::F32);
    let order = program.get_processing_order();
    let pos = |id: &str| order.iter().position(|o| o == id).unwrap();
    assert!(pos("b") < pos("c_reorder_1") && pos("c_reorder_1") < pos("c"));

    let mut net = Network::new(Arc::new(program), engine.create_stream().unwrap()).unwrap();
    net.set_input_data("a", f32_buffer(&[4], &[1.5, 2.0, 3.0, 4.0])).unwrap();
    let ints = sionflow_engine::Buffer::from_f64(&sionflow_engine::Layout::new(DataType::I32, &[4]), &[1.0, 2.0, 3.0, 4.0]).unwrap();
    net.set_input_data("b", ints).unwrap();
    let out = net.execute(&[]).unwrap();
    assert_eq!(out["c"].to_f32_vec().unwrap(), vec![2.5, 4.0, 6.0, 8.0]);
}

#[test]
fn constant_subgraphs_are_folded() {
    let (_, engine) = host_engine();
    let topology = Topology::new()
        .with(data("w", &[4], &[1.0, 2.0, 3.0, 4.0]))
        .with(data("v", &[4], &[1.0, 1.0, 1.0, 1.0]))
        .with(eltwise("p", "sum", &["w", "v"]))
        .with(input("a", DataType::F32, &[4]))
        .with(eltwise("out", "prod", &["a", "p"]));
    let program = Program::build(&engine, &topology, BuildOptions::default()).unwrap();

    assert_eq!(program.get_node("p").unwrap().kind(), "data");
    assert!(program.get_node("p").unwrap().is_constant());
    assert!(program.get_optimized_out().contains(&"w".to_string()));
    assert!(program.get_optimized_out().contains(&"v".to_string()));

    let mut net = Network::new(Arc::new(program), engine.create_stream().unwrap()).unwrap();
    net.set_input_data("a", f32_buffer(&[4], &[1.0, 1.0, 2.0, 2.0])).unwrap();
    let out = net.execute(&[]).unwrap();
    assert_eq!(out["out"].to_f32_vec().unwrap(), vec![2.0, 3.0, 8.0, 10.0]);
    assert!(!net.get_executed_ids().contains(&"p".to_string()));
}

#[test]
fn disabled_passes_are_skipped() {
    let (_, engine) = host_engine();
    let mut options = BuildOptions::default();
    options.disabled_passes.push("prepare_primitive_fusing".into());
    let program = Program::build(&engine, &fused_topology(), options).unwrap();
    assert!(program.get_node_index("d").is_some());
    assert!(!program.pass_log().contains(&"prepare_primitive_fusing".to_string()));
    assert!(program.pass_log().contains(&"compile_graph".to_string()));
}

#[test]
fn identity_reshape_between_nodes_is_removed() {
    let (_, engine) = host_engine();
    let topology = Topology::new()
        .with(input("a", DataType::F32, &[2, 2]))
        .with(reshape("r", "a", &[2, 2]))
        .with(activation("y", "abs", "r"));
    let program = Program::build(&engine, &topology, BuildOptions::default()).unwrap();
    assert_eq!(program.get_optimized_out(), ["r".to_string()]);
    let y = program.get_node_index("y").unwrap();
    assert_eq!(program.node(program.dependencies(y)[0]).id(), "a");
}

#[test]
fn topology_round_trips_through_json() {
    let (_, engine) = host_engine();
    let json = fused_topology().to_json().unwrap();
    let parsed = Topology::from_json(&json).unwrap();
    assert_eq!(parsed, fused_topology());
    assert!(Program::build(&engine, &parsed, BuildOptions::default()).is_ok());
}
