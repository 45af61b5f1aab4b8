pub mod buffer;
pub mod event;
pub mod host;

pub use buffer::{AllocationType, Buffer};
pub use event::Event;
pub use host::{HostDevice, HostStream, Submission};

use crate::config::QueueType;
use crate::core::types::Layout;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    /// Part of every kernel batch hash; a driver update invalidates the disk cache.
    pub driver_version: String,
    pub supports_device_memory: bool,
}

/// A loaded kernel handle, addressed by the entry point it was compiled from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kernel {
    entry_point: Arc<str>,
    program_hash: u64,
}

impl Kernel {
    pub fn new(entry_point: &str, program_hash: u64) -> Self {
        Self { entry_point: Arc::from(entry_point), program_hash }
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// Entry points are generated as `<routine>__<suffix>`.
    pub fn routine(&self) -> &str {
        self.entry_point.split("__").next().unwrap_or(&self.entry_point)
    }

    pub fn program_hash(&self) -> u64 {
        self.program_hash
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub global: usize,
    pub local: usize,
}

impl LaunchConfig {
    pub const WORKGROUP: usize = 64;

    pub fn for_elements(count: usize) -> Self {
        let groups = count.div_ceil(Self::WORKGROUP).max(1);
        Self { global: groups * Self::WORKGROUP, local: Self::WORKGROUP }
    }
}

#[derive(Debug, Clone)]
pub struct KernelArgs {
    pub inputs: Vec<Buffer>,
    pub output: Buffer,
    pub scalars: Vec<f64>,
    pub launch: LaunchConfig,
}

pub trait Device: Send + Sync {
    fn info(&self) -> &DeviceInfo;

    fn allocate(&self, layout: &Layout, kind: AllocationType) -> anyhow::Result<Buffer>;

    /// Kind used when the host must read or write the buffer directly.
    fn lockable_allocation(&self) -> AllocationType {
        AllocationType::Host
    }

    fn supports_allocation(&self, kind: AllocationType) -> bool {
        match kind {
            AllocationType::Device => self.info().supports_device_memory,
            _ => true,
        }
    }

    fn create_stream(&self, queue_type: QueueType) -> anyhow::Result<Arc<dyn Stream>>;

    /// Compiles one batch source into a device binary.
    fn compile_program(&self, source: &str, options: &str) -> anyhow::Result<Vec<u8>>;

    fn load_kernels(&self, binary: &[u8]) -> anyhow::Result<Vec<Kernel>>;
}

pub trait Stream: Send + Sync {
    fn queue_type(&self) -> QueueType;

    fn submit(&self, kernel: &Kernel, args: &KernelArgs, wait_on: &[Event]) -> anyhow::Result<Event>;

    /// An event that completes once everything in `wait_on` has.
    fn enqueue_marker(&self, wait_on: &[Event]) -> anyhow::Result<Event>;

    fn create_user_event(&self, set: bool) -> Event {
        Event::new(set)
    }

    fn wait_for_events(&self, events: &[Event]) -> anyhow::Result<()> {
        for ev in events {
            ev.wait();
        }
        Ok(())
    }

    fn flush(&self) -> anyhow::Result<()>;

    fn finish(&self) -> anyhow::Result<()>;
}
