pub mod batch;
pub mod cache;
pub mod codegen;

pub use cache::{KernelCache, KernelCacheStats, KERNEL_BINARY_SUFFIX};
pub use codegen::{ElementwiseKernel, render_elementwise};

/// Process-unique handle returned by `KernelCache::set_kernel_source`.
pub type KernelId = String;

/// A device kernel source waiting for compilation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelSource {
    pub entry_point: String,
    pub code: String,
    pub options: String,
    /// Sources may opt out of batching; they then compile as a program of their own.
    pub batch_compilation: bool,
}

impl KernelSource {
    pub fn new(entry_point: &str, code: String, options: &str) -> Self {
        Self { entry_point: entry_point.to_string(), code, options: options.to_string(), batch_compilation: true }
    }

    pub fn standalone(mut self) -> Self {
        self.batch_compilation = false;
        self
    }
}
