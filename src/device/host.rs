//! Reference device that runs kernels on the calling thread. Kernel sources
//! are real WGSL: the compiler parses and validates them with naga and maps
//! every compute entry point onto a registered host routine.

use super::{AllocationType, Buffer, Device, DeviceInfo, Event, Kernel, KernelArgs, Stream};
use crate::config::QueueType;
use crate::core::hash::Fingerprint;
use crate::core::types::Layout;
use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::trace;

pub type HostRoutine = fn(&KernelArgs) -> anyhow::Result<()>;

type RoutineTable = Arc<RwLock<HashMap<String, HostRoutine>>>;

const BINARY_FORMAT: &str = "sionflow-host-v1";

#[derive(Debug, Serialize, Deserialize)]
struct HostBinary {
    format: String,
    options: String,
    entry_points: Vec<String>,
}

pub struct HostDevice {
    info: DeviceInfo,
    routines: RoutineTable,
    compile_calls: AtomicUsize,
    allocations: AtomicUsize,
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDevice {
    pub fn new() -> Self {
        let table: HashMap<String, HostRoutine> = crate::ops::reference::builtin_routines()
            .into_iter()
            .map(|(name, f)| (name.to_string(), f))
            .collect();
        Self {
            info: DeviceInfo { name: "host".into(), driver_version: "host-1.0".into(), supports_device_memory: true },
            routines: Arc::new(RwLock::new(table)),
            compile_calls: AtomicUsize::new(0),
            allocations: AtomicUsize::new(0),
        }
    }

    pub fn with_driver_version(mut self, version: &str) -> Self {
        self.info.driver_version = version.to_string();
        self
    }

    /// Makes entry points named `<name>__*` executable.
    pub fn register_routine(&self, name: &str, routine: HostRoutine) -> anyhow::Result<()> {
        self.routines.write().map_err(|_| anyhow!("routine table poisoned"))?.insert(name.to_string(), routine);
        Ok(())
    }

    pub fn compile_calls(&self) -> usize {
        self.compile_calls.load(Ordering::SeqCst)
    }

    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    pub fn create_host_stream(&self, queue_type: QueueType) -> Arc<HostStream> {
        Arc::new(HostStream {
            queue_type,
            routines: self.routines.clone(),
            submissions: Mutex::new(Vec::new()),
            flushes: AtomicUsize::new(0),
            markers: AtomicUsize::new(0),
        })
    }

    fn has_routine(&self, name: &str) -> bool {
        self.routines.read().map(|t| t.contains_key(name)).unwrap_or(false)
    }
}

impl Device for HostDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn allocate(&self, layout: &Layout, kind: AllocationType) -> anyhow::Result<Buffer> {
        self.allocations.fetch_add(1, Ordering::SeqCst);
        Buffer::allocate(layout, kind)
    }

    fn create_stream(&self, queue_type: QueueType) -> anyhow::Result<Arc<dyn Stream>> {
        Ok(self.create_host_stream(queue_type))
    }

    fn compile_program(&self, source: &str, options: &str) -> anyhow::Result<Vec<u8>> {
        self.compile_calls.fetch_add(1, Ordering::SeqCst);

        let module = naga::front::wgsl::parse_str(source)
            .map_err(|e| anyhow!("WGSL parse error:\n{}", e.emit_to_string(source)))?;
        naga::valid::Validator::new(naga::valid::ValidationFlags::all(), naga::valid::Capabilities::all())
            .validate(&module)
            .map_err(|e| anyhow!("WGSL validation error: {}", e))?;

        let mut entry_points = Vec::new();
        for ep in &module.entry_points {
            if !matches!(ep.stage, naga::ShaderStage::Compute) {
                continue;
            }
            let routine = ep.name.split("__").next().unwrap_or(&ep.name);
            if !self.has_routine(routine) {
                return Err(anyhow!("entry point '{}' has no host routine '{}'", ep.name, routine));
            }
            entry_points.push(ep.name.clone());
        }
        if entry_points.is_empty() {
            return Err(anyhow!("program has no compute entry points"));
        }

        let binary = HostBinary { format: BINARY_FORMAT.into(), options: options.to_string(), entry_points };
        Ok(serde_json::to_vec(&binary)?)
    }

    fn load_kernels(&self, binary: &[u8]) -> anyhow::Result<Vec<Kernel>> {
        let parsed: HostBinary = serde_json::from_slice(binary).map_err(|e| anyhow!("corrupted kernel binary: {}", e))?;
        if parsed.format != BINARY_FORMAT {
            return Err(anyhow!("unsupported kernel binary format '{}'", parsed.format));
        }
        let hash = Fingerprint::new().update(binary).finish();
        Ok(parsed.entry_points.iter().map(|ep| Kernel::new(ep, hash)).collect())
    }
}

/// One recorded kernel submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub entry_point: String,
    pub waited: Vec<u64>,
    pub event: u64,
}

/// Synchronous stream: every submission runs to completion before returning.
pub struct HostStream {
    queue_type: QueueType,
    routines: RoutineTable,
    submissions: Mutex<Vec<Submission>>,
    flushes: AtomicUsize,
    markers: AtomicUsize,
}

impl HostStream {
    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn marker_count(&self) -> usize {
        self.markers.load(Ordering::SeqCst)
    }

    pub fn clear_log(&self) {
        if let Ok(mut s) = self.submissions.lock() {
            s.clear();
        }
    }
}

impl Stream for HostStream {
    fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    fn submit(&self, kernel: &Kernel, args: &KernelArgs, wait_on: &[Event]) -> anyhow::Result<Event> {
        self.wait_for_events(wait_on)?;
        let routine = {
            let table = self.routines.read().map_err(|_| anyhow!("routine table poisoned"))?;
            *table.get(kernel.routine()).ok_or_else(|| anyhow!("no host routine for kernel '{}'", kernel.entry_point()))?
        };
        trace!(kernel = kernel.entry_point(), waits = wait_on.len(), "host submit");
        routine(args)?;

        let event = Event::completed();
        self.submissions.lock().map_err(|_| anyhow!("submission log poisoned"))?.push(Submission {
            entry_point: kernel.entry_point().to_string(),
            waited: wait_on.iter().map(|e| e.id()).collect(),
            event: event.id(),
        });
        Ok(event)
    }

    fn enqueue_marker(&self, wait_on: &[Event]) -> anyhow::Result<Event> {
        self.wait_for_events(wait_on)?;
        self.markers.fetch_add(1, Ordering::SeqCst);
        Ok(Event::completed())
    }

    fn flush(&self) -> anyhow::Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn finish(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COPY_SRC: &str = r#"
@group(0) @binding(0) var<storage, read> copy__t_in0: array<f32>;
@group(0) @binding(1) var<storage, read_write> copy__t_out: array<f32>;

@compute @workgroup_size(64)
fn copy__t(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = gid.x;
    if (i >= arrayLength(&copy__t_out)) {
        return;
    }
    copy__t_out[i] = copy__t_in0[i];
}
"#;

    #[test]
    fn compiles_and_loads_entry_points() {
        let device = HostDevice::new();
        let binary = device.compile_program(COPY_SRC, "-O2").unwrap();
        let kernels = device.load_kernels(&binary).unwrap();
        assert_eq!(kernels.len(), 1);
        assert_eq!(kernels[0].entry_point(), "copy__t");
        assert_eq!(kernels[0].routine(), "copy");
        assert_eq!(device.compile_calls(), 1);
    }

    #[test]
    fn rejects_invalid_source() {
        let device = HostDevice::new();
        assert!(device.compile_program("fn broken(", "").is_err());
        assert_eq!(device.compile_calls(), 1);
    }

    #[test]
    fn rejects_entry_points_without_routine() {
        let device = HostDevice::new();
        let src = COPY_SRC.replace("copy__t", "mystery__t");
        let err = device.compile_program(&src, "").unwrap_err();
        assert!(err.to_string().contains("mystery"));
    }
}
