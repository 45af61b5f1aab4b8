mod common;

use common::*;
use serde_json::json;
use sionflow_engine::device::{HostStream, Kernel, KernelArgs};
use sionflow_engine::{BuildOptions, DataType, EngineError, Event, Network, PrimitiveDesc, Program, QueueType, Stream, Topology};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn chain_topology() -> Topology {
    Topology::new()
        .with(input("a", DataType::F32, &[4]))
        .with(activation("b", "relu", "a"))
        .with(activation("c", "abs", "b"))
}

fn network_on(engine: &Arc<sionflow_engine::Engine>, topology: &Topology, stream: Arc<HostStream>, options: BuildOptions) -> Network {
    let program = Program::build(engine, topology, options).unwrap();
    Network::new(Arc::new(program), stream).unwrap()
}

#[test]
fn identity_reshape_output_aliases_the_input() {
    let (_, engine) = host_engine();
    let topology = Topology::new().with(input("in", DataType::F32, &[2, 2])).with(reshape("view", "in", &[2, 2]));
    let mut net = Network::build(&engine, &topology, BuildOptions::default()).unwrap();
    assert!(net.program().get_node("view").unwrap().can_be_optimized());

    let data = f32_buffer(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
    net.set_input_data("in", data.clone()).unwrap();
    let out = net.execute(&[]).unwrap();

    assert_eq!(net.get_executed_ids(), vec!["in"]);
    assert!(out["view"].memory().same_storage(&data));
    assert_eq!(out["view"].to_f32_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn flattening_reshape_aliases_with_its_own_layout() {
    let (_, engine) = host_engine();
    let topology = Topology::new()
        .with(input("in", DataType::F32, &[2, 2]))
        .with(activation("neg", "neg", "in"))
        .with(reshape("flat", "neg", &[-1]));
    let mut net = Network::build(&engine, &topology, BuildOptions::default()).unwrap();
    net.set_input_data("in", f32_buffer(&[2, 2], &[1.0, -2.0, 3.0, -4.0])).unwrap();
    let out = net.execute(&[]).unwrap();

    assert_eq!(out["flat"].memory().layout().shape, sionflow_engine::Shape::new(&[4]));
    assert!(out["flat"].memory().same_storage(&net.get_output_memory("neg").unwrap()));
    assert_eq!(out["flat"].to_f32_vec().unwrap(), vec![-1.0, 2.0, -3.0, 4.0]);
    assert_eq!(net.get_executed_ids(), vec!["in", "neg"]);
}

#[test]
fn repeated_execution_is_bit_identical_without_recompiling() {
    let (device, engine) = host_engine();
    let mut net = Network::build(&engine, &chain_topology(), BuildOptions::default()).unwrap();
    net.set_input_data("a", f32_buffer(&[4], &[-1.5, 0.25, 3.0, -0.0])).unwrap();

    let first: Vec<u32> = net.execute(&[]).unwrap()["c"].to_f32_vec().unwrap().iter().map(|v| v.to_bits()).collect();
    let compiles = device.compile_calls();
    let second: Vec<u32> = net.execute(&[]).unwrap()["c"].to_f32_vec().unwrap().iter().map(|v| v.to_bits()).collect();

    assert_eq!(first, second);
    assert_eq!(device.compile_calls(), compiles);
    assert_eq!(net.impl_updates("b").unwrap(), 0);
    assert_eq!(net.impl_updates("c").unwrap(), 0);
}

#[test]
fn usage_errors() {
    let (_, engine) = host_engine();
    let mut net = Network::build(&engine, &chain_topology(), BuildOptions::default()).unwrap();

    let err = net.execute(&[]).unwrap_err();
    assert_eq!(engine_error(&err), Some(&EngineError::InputNotSet("a".into())));

    let err = net.set_input_data("b", f32_buffer(&[4], &[0.0; 4])).unwrap_err();
    assert_eq!(engine_error(&err), Some(&EngineError::NotAnInput("b".into())));

    let err = net.set_input_data("nope", f32_buffer(&[4], &[0.0; 4])).unwrap_err();
    assert_eq!(engine_error(&err), Some(&EngineError::UnknownPrimitive("nope".into())));

    let err = net.set_input_data("a", f32_buffer(&[5], &[0.0; 5])).unwrap_err();
    assert!(matches!(engine_error(&err), Some(EngineError::LayoutMismatch { .. })));

    net.set_input_data("a", f32_buffer(&[4], &[0.0; 4])).unwrap();
    net.execute(&[]).unwrap();
    let err = net.get_output("b").unwrap_err();
    assert_eq!(engine_error(&err), Some(&EngineError::NotAnOutput("b".into())));
    assert!(net.get_output_memory("b").is_ok());
    assert!(net.get_output_memory("zzz").is_err());
}

#[test]
fn in_order_stream_is_flushed_once_without_wait_lists() {
    let (device, engine) = host_engine();
    let stream = device.create_host_stream(QueueType::InOrder);
    let mut net = network_on(&engine, &chain_topology(), stream.clone(), BuildOptions::default());
    net.set_input_data("a", f32_buffer(&[4], &[1.0, -1.0, 2.0, -2.0])).unwrap();
    net.execute(&[]).unwrap();

    assert_eq!(stream.flush_count(), 1);
    assert_eq!(stream.marker_count(), 1);
    let submissions = stream.submissions();
    assert_eq!(submissions.len(), 2);
    assert!(submissions.iter().all(|s| s.waited.is_empty()));
    assert!(submissions[0].entry_point.starts_with("activation__"));
}

#[test]
fn out_of_order_stream_waits_on_dependency_events() {
    let (device, engine) = host_engine();
    let stream = device.create_host_stream(QueueType::OutOfOrder);
    let options = BuildOptions { queue_type: QueueType::OutOfOrder, ..BuildOptions::default() };
    let mut net = network_on(&engine, &chain_topology(), stream.clone(), options);
    net.set_input_data("a", f32_buffer(&[4], &[1.0, -1.0, 2.0, -2.0])).unwrap();
    let out = net.execute(&[]).unwrap();

    let a = net.get_primitive_event("a").unwrap();
    let b = net.get_primitive_event("b").unwrap();
    let submissions = stream.submissions();
    assert_eq!(submissions[0].waited, vec![a.id()]);
    assert_eq!(submissions[1].waited, vec![b.id()]);
    assert_eq!(out["c"].event().id(), submissions[1].event);
    assert!(net.has_event("c"));
    assert_eq!(out["c"].to_f32_vec().unwrap(), vec![1.0, 0.0, 2.0, 0.0]);
}

#[test]
fn fused_ids_resolve_to_their_producer() {
    let (_, engine) = host_engine();
    let topology = Topology::new()
        .with(input("a", DataType::F32, &[4]))
        .with(input("b", DataType::F32, &[4]))
        .with(eltwise("c", "sum", &["a", "b"]))
        .with(activation("d", "relu", "c"))
        .with(eltwise("e", "prod", &["d", "b"]));
    let mut net = Network::build(&engine, &topology, BuildOptions::default()).unwrap();
    net.set_input_data("a", f32_buffer(&[4], &[1.0; 4])).unwrap();
    net.set_input_data("b", f32_buffer(&[4], &[2.0; 4])).unwrap();
    net.execute(&[]).unwrap();

    assert_eq!(net.get_ext_id_mapping().get("d"), Some(&"c".to_string()));
    let d = net.get_output_memory("d").unwrap();
    assert!(d.same_storage(&net.get_output_memory("c").unwrap()));

    let info: serde_json::Value = serde_json::from_str(&net.get_primitive_info("c").unwrap()).unwrap();
    assert_eq!(info["fused"], json!(["d"]));
    assert_eq!(info["executed"], json!(true));
    assert_eq!(info["layout"], json!("f32:Bfyx:[4]"));
    assert_eq!(net.get_executed_ids(), vec!["a", "b", "c", "e"]);
}

#[test]
fn output_memory_can_be_replaced() {
    let (_, engine) = host_engine();
    let mut net = Network::build(&engine, &chain_topology(), BuildOptions::default()).unwrap();
    net.set_input_data("a", f32_buffer(&[4], &[-3.0, 3.0, -1.0, 1.0])).unwrap();
    let target = f32_buffer(&[4], &[0.0; 4]);
    net.set_output_memory("c", target.clone()).unwrap();
    net.execute(&[]).unwrap();
    assert_eq!(target.to_f32_vec().unwrap(), vec![0.0, 3.0, 0.0, 1.0]);

    let err = net.set_output_memory("c", f32_buffer(&[2], &[0.0; 2])).unwrap_err();
    assert!(matches!(engine_error(&err), Some(EngineError::LayoutMismatch { .. })));
}

#[test]
fn condition_runs_the_selected_branch() {
    let (_, engine) = host_engine();
    let branch = |id: &str, func: &str| {
        json!({
            "topology": Topology::new().with(input("x", DataType::F32, &[4])).with(activation(id, func, "x")),
            "output": id,
        })
    };
    let topology = Topology::new()
        .with(input("pred", DataType::F32, &[1]))
        .with(input("x", DataType::F32, &[4]))
        .with(PrimitiveDesc::new(
            "cond",
            "condition",
            &["pred", "x"],
            json!({ "true_branch": branch("t", "relu"), "false_branch": branch("f", "neg") }),
        ));
    let mut net = Network::build(&engine, &topology, BuildOptions::default()).unwrap();
    net.set_input_data("x", f32_buffer(&[4], &[-1.0, 2.0, -3.0, 4.0])).unwrap();

    net.set_input_data("pred", f32_buffer(&[1], &[1.0])).unwrap();
    let taken = net.execute(&[]).unwrap()["cond"].to_f32_vec().unwrap();
    assert_eq!(taken, vec![0.0, 2.0, 0.0, 4.0]);

    net.set_input_data("pred", f32_buffer(&[1], &[0.0])).unwrap();
    let skipped = net.execute(&[]).unwrap()["cond"].to_f32_vec().unwrap();
    assert_eq!(skipped, vec![1.0, -2.0, 3.0, -4.0]);
}

#[test]
fn condition_branch_inputs_must_come_from_the_condition() {
    let (_, engine) = host_engine();
    let branch = json!({ "topology": Topology::new().with(input("y", DataType::F32, &[4])), "output": "y" });
    let topology = Topology::new()
        .with(input("pred", DataType::F32, &[1]))
        .with(PrimitiveDesc::new("cond", "condition", &["pred"], json!({ "true_branch": branch, "false_branch": branch })));
    let err = Network::build(&engine, &topology, BuildOptions::default()).unwrap_err();
    assert!(matches!(engine_error(&err), Some(EngineError::InvalidParams { .. })));
}

/// Adds `step` to `acc` once per iteration, carrying the sum back into `acc`.
fn accumulating_loop(back_to: &str) -> Topology {
    let body = Topology::new()
        .with(input("acc", DataType::F32, &[4]))
        .with(input("step", DataType::F32, &[4]))
        .with(eltwise("next", "sum", &["acc", "step"]));
    Topology::new()
        .with(input("trips", DataType::F32, &[1]))
        .with(input("acc", DataType::F32, &[4]))
        .with(input("step", DataType::F32, &[4]))
        .with(PrimitiveDesc::new(
            "accumulate",
            "loop",
            &["trips", "acc", "step"],
            json!({
                "body": { "topology": body, "output": "next" },
                "back_edges": [{ "from": "next", "to": back_to }],
                "max_iterations": 5,
            }),
        ))
}

#[test]
fn loop_carries_values_between_iterations() {
    let (_, engine) = host_engine();
    let mut net = Network::build(&engine, &accumulating_loop("acc"), BuildOptions::default()).unwrap();
    let initial = f32_buffer(&[4], &[0.0, 1.0, 2.0, 3.0]);
    net.set_input_data("acc", initial.clone()).unwrap();
    net.set_input_data("step", f32_buffer(&[4], &[1.0; 4])).unwrap();

    let mut run = |trips: f32| {
        net.set_input_data("trips", f32_buffer(&[1], &[trips])).unwrap();
        net.execute(&[]).unwrap()["accumulate"].to_f32_vec().unwrap()
    };
    assert_eq!(run(3.0), vec![3.0, 4.0, 5.0, 6.0]);
    assert_eq!(run(1.0), vec![1.0, 2.0, 3.0, 4.0]);
    // Clamped to max_iterations; negative means run to the bound.
    assert_eq!(run(12.0), vec![5.0, 6.0, 7.0, 8.0]);
    assert_eq!(run(-1.0), vec![5.0, 6.0, 7.0, 8.0]);
    assert_eq!(run(0.0), vec![0.0, 1.0, 2.0, 3.0]);

    assert_eq!(initial.to_f32_vec().unwrap(), vec![0.0, 1.0, 2.0, 3.0]);
}

#[test]
fn loop_back_edges_must_target_body_inputs() {
    let (_, engine) = host_engine();
    let err = Network::build(&engine, &accumulating_loop("next"), BuildOptions::default()).unwrap_err();
    assert!(matches!(engine_error(&err), Some(EngineError::InvalidParams { .. })));
}

#[test]
fn dropping_a_network_releases_its_pooled_memory() {
    let (_, engine) = host_engine();
    let topology = chain_topology().with(activation("d", "neg", "c"));
    let net = Network::build(&engine, &topology, BuildOptions::default()).unwrap();
    let id = net.id();
    assert!(engine.memory_pool().pooled_buffers_for(id) > 0);
    drop(net);
    assert_eq!(engine.memory_pool().pooled_buffers_for(id), 0);
}

#[test]
fn replaced_output_memory_reaches_its_consumers() {
    let (_, engine) = host_engine();
    let topology = Topology::new()
        .with(input("a", DataType::F32, &[4]))
        .with(activation("b", "neg", "a"))
        .with(activation("c", "abs", "b"))
        .with(activation("d", "relu", "c"));
    let mut net = Network::build(&engine, &topology, BuildOptions::default().with_outputs(["b", "d"])).unwrap();
    net.set_input_data("a", f32_buffer(&[4], &[1.0, 2.0, 3.0, 4.0])).unwrap();
    net.execute(&[]).unwrap();
    let previous = net.get_output_memory("b").unwrap();

    let target = f32_buffer(&[4], &[0.0; 4]);
    net.set_output_memory("b", target.clone()).unwrap();
    net.set_input_data("a", f32_buffer(&[4], &[10.0, 20.0, 30.0, 40.0])).unwrap();
    let out = net.execute(&[]).unwrap();

    assert!(out["b"].memory().same_storage(&target));
    assert_eq!(target.to_f32_vec().unwrap(), vec![-10.0, -20.0, -30.0, -40.0]);
    assert_eq!(out["d"].to_f32_vec().unwrap(), vec![10.0, 20.0, 30.0, 40.0]);
    assert_eq!(previous.to_f32_vec().unwrap(), vec![-1.0, -2.0, -3.0, -4.0]);
}

#[test]
fn replacing_an_aliased_output_moves_its_producer() {
    let (_, engine) = host_engine();
    let topology = Topology::new()
        .with(input("a", DataType::F32, &[4]))
        .with(activation("b", "neg", "a"))
        .with(reshape("v", "b", &[4]));
    let mut net = Network::build(&engine, &topology, BuildOptions::default()).unwrap();
    assert!(net.program().get_node("v").unwrap().can_be_optimized());

    let target = f32_buffer(&[4], &[0.0; 4]);
    net.set_output_memory("v", target.clone()).unwrap();
    net.set_input_data("a", f32_buffer(&[4], &[1.0, -2.0, 3.0, -4.0])).unwrap();
    net.execute(&[]).unwrap();

    assert!(net.get_output_memory("b").unwrap().same_storage(&target));
    assert_eq!(target.to_f32_vec().unwrap(), vec![-1.0, 2.0, -3.0, 4.0]);
}

/// Two activation branches joined by a sum.
fn diamond_topology() -> Topology {
    Topology::new()
        .with(input("a", DataType::F32, &[4]))
        .with(activation("b", "neg", "a"))
        .with(activation("c", "abs", "b"))
        .with(activation("d", "relu", "a"))
        .with(activation("e", "neg", "d"))
        .with(activation("g", "abs", "e"))
        .with(eltwise("f", "sum", &["c", "g"]))
}

#[test]
fn in_order_program_is_rejected_on_an_out_of_order_stream() {
    let (device, engine) = host_engine();
    let program = Program::build(&engine, &diamond_topology(), BuildOptions::default()).unwrap();
    let err = Network::new(Arc::new(program), device.create_host_stream(QueueType::OutOfOrder)).unwrap_err();
    assert_eq!(
        engine_error(&err),
        Some(&EngineError::QueueTypeMismatch { program: QueueType::InOrder, stream: QueueType::OutOfOrder })
    );
}

#[test]
fn out_of_order_plan_keeps_parallel_branches_apart() {
    let (device, engine) = host_engine();
    let in_order = Network::build(&engine, &diamond_topology(), BuildOptions::default()).unwrap();
    // Serial liveness lets the two branches take turns on pooled buffers.
    let across = ["b", "c"].iter().any(|x| {
        let bx = in_order.get_output_memory(x).unwrap();
        ["d", "e", "g"].iter().any(|y| bx.same_storage(&in_order.get_output_memory(y).unwrap()))
    });
    assert!(across);

    let options = BuildOptions { queue_type: QueueType::OutOfOrder, ..BuildOptions::default() };
    let mut net = network_on(&engine, &diamond_topology(), device.create_host_stream(QueueType::OutOfOrder), options);
    let b = net.program().get_node("b").unwrap();
    assert!(b.memory_dependencies().contains("e"));
    assert!(b.memory_dependencies().contains("g"));
    for (x, y) in [("b", "d"), ("b", "e"), ("b", "g"), ("c", "d"), ("c", "e"), ("c", "g")] {
        let (bx, by) = (net.get_output_memory(x).unwrap(), net.get_output_memory(y).unwrap());
        assert!(!bx.same_storage(&by), "{} and {} may run concurrently", x, y);
    }

    net.set_input_data("a", f32_buffer(&[4], &[-2.0, -1.0, 1.0, 2.0])).unwrap();
    let out = net.execute(&[]).unwrap();
    assert_eq!(out["f"].to_f32_vec().unwrap(), vec![2.0, 1.0, 2.0, 4.0]);
}

#[test]
fn outputs_without_submissions_borrow_the_last_event() {
    let (_, engine) = host_engine();
    let topology = Topology::new()
        .with(input("a", DataType::F32, &[4]))
        .with(activation("b", "neg", "a"))
        .with(reshape("v", "b", &[4]))
        .with(activation("c", "abs", "a"));
    let mut net = Network::build(&engine, &topology, BuildOptions::default()).unwrap();
    net.set_input_data("a", f32_buffer(&[4], &[1.0, -2.0, 3.0, -4.0])).unwrap();
    let out = net.execute(&[]).unwrap();

    assert_eq!(net.get_executed_ids(), vec!["a", "b", "c"]);
    assert_eq!(out["v"].event().id(), net.get_primitive_event("c").unwrap().id());
    assert_ne!(out["v"].event().id(), net.get_primitive_event("b").unwrap().id());
    assert_eq!(out["v"].to_f32_vec().unwrap(), vec![-1.0, 2.0, -3.0, 4.0]);
}

/// Runs work on a host stream but reports it complete only once waited for.
struct DeferredStream {
    inner: Arc<HostStream>,
    pending: Mutex<Vec<Event>>,
    waited: AtomicUsize,
}

impl DeferredStream {
    fn new(inner: Arc<HostStream>) -> Self {
        Self { inner, pending: Mutex::new(Vec::new()), waited: AtomicUsize::new(0) }
    }

    fn defer(&self) -> Event {
        let event = Event::new(false);
        self.pending.lock().unwrap().push(event.clone());
        event
    }

    fn waited(&self) -> usize {
        self.waited.load(Ordering::SeqCst)
    }
}

impl Stream for DeferredStream {
    fn queue_type(&self) -> QueueType {
        self.inner.queue_type()
    }

    fn submit(&self, kernel: &Kernel, args: &KernelArgs, wait_on: &[Event]) -> anyhow::Result<Event> {
        self.inner.submit(kernel, args, wait_on)?;
        Ok(self.defer())
    }

    fn enqueue_marker(&self, wait_on: &[Event]) -> anyhow::Result<Event> {
        self.inner.enqueue_marker(wait_on)?;
        Ok(self.defer())
    }

    fn wait_for_events(&self, events: &[Event]) -> anyhow::Result<()> {
        self.waited.fetch_add(events.len(), Ordering::SeqCst);
        for event in events {
            event.set();
        }
        Ok(())
    }

    fn flush(&self) -> anyhow::Result<()> {
        self.inner.flush()
    }

    fn finish(&self) -> anyhow::Result<()> {
        for event in self.pending.lock().unwrap().drain(..) {
            event.set();
        }
        Ok(())
    }
}

#[test]
fn buffers_are_swapped_only_after_pending_work_completes() {
    let (device, engine) = host_engine();
    let stream = Arc::new(DeferredStream::new(device.create_host_stream(QueueType::InOrder)));
    let program = Program::build(&engine, &chain_topology(), BuildOptions::default()).unwrap();
    let mut net = Network::new(Arc::new(program), stream.clone()).unwrap();

    net.set_input_data("a", f32_buffer(&[4], &[1.0, -1.0, 2.0, -2.0])).unwrap();
    net.execute(&[]).unwrap();
    assert_eq!(stream.waited(), 0);
    let c = net.get_primitive_event("c").unwrap();
    assert!(!c.is_set());

    // a's marker, b and c are still in flight.
    net.set_input_data("a", f32_buffer(&[4], &[-4.0, 4.0, -5.0, 5.0])).unwrap();
    assert_eq!(stream.waited(), 3);
    assert!(c.is_set());

    net.execute(&[]).unwrap();
    net.set_output_memory("c", f32_buffer(&[4], &[0.0; 4])).unwrap();
    assert_eq!(stream.waited(), 6);

    // Plain execution leaves the previous run alone.
    net.execute(&[]).unwrap();
    net.execute(&[]).unwrap();
    assert_eq!(stream.waited(), 6);

    net.set_synchronous_reuse(true);
    let out = net.execute(&[]).unwrap();
    assert_eq!(stream.waited(), 9);
    net.finish().unwrap();
    assert_eq!(out["c"].to_f32_vec().unwrap(), vec![0.0, 4.0, 0.0, 5.0]);
}
