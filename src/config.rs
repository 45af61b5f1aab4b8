use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const KERNEL_CACHE_DIR_ENV: &str = "SIONFLOW_KERNEL_CACHE_DIR";

/// Submission ordering of a device stream, fixed when the stream is created.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueType {
    #[default]
    InOrder,
    OutOfOrder,
}

/// Per-program build switches.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BuildOptions {
    /// Runs the optimizing passes (folding, elimination, fusion, aliasing).
    pub optimize_data: bool,
    /// Declared outputs. Empty means every node without users.
    pub outputs: Vec<String>,
    /// Nested programs (constant folding, condition branches) skip folding and
    /// never share pooled memory.
    pub internal: bool,
    /// Queue type the program will be executed on; drives memory dependencies.
    pub queue_type: QueueType,
    /// Pass names to skip.
    pub disabled_passes: Vec<String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            optimize_data: true,
            outputs: Vec::new(),
            internal: false,
            queue_type: QueueType::InOrder,
            disabled_passes: Vec::new(),
        }
    }
}

impl BuildOptions {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("Failed to parse build options")
    }

    pub fn with_outputs<I: IntoIterator<Item = S>, S: Into<String>>(mut self, outputs: I) -> Self {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn unoptimized() -> Self {
        Self { optimize_data: false, ..Self::default() }
    }

    pub fn internal(outputs: Vec<String>) -> Self {
        Self { optimize_data: false, internal: true, outputs, ..Self::default() }
    }

    pub fn is_pass_enabled(&self, name: &str) -> bool {
        !self.disabled_passes.iter().any(|p| p == name)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelCacheConfig {
    /// Directory holding compiled batches. `None` or a missing directory
    /// disables persistence.
    pub cache_dir: Option<PathBuf>,
    pub max_kernels_per_batch: usize,
    /// Worker threads used for batch compilation. 0 picks rayon's default.
    pub compile_threads: usize,
}

impl Default for KernelCacheConfig {
    fn default() -> Self {
        Self { cache_dir: None, max_kernels_per_batch: 10, compile_threads: 0 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub kernel_cache: KernelCacheConfig,
    pub impl_cache_capacity: usize,
    pub use_memory_pool: bool,
    pub queue_type: QueueType,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kernel_cache: KernelCacheConfig::default(),
            impl_cache_capacity: 128,
            use_memory_pool: true,
            queue_type: QueueType::InOrder,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("Failed to parse engine config")
    }

    pub fn from_env_overrides(mut self) -> Self {
        if let Ok(dir) = std::env::var(KERNEL_CACHE_DIR_ENV) {
            if !dir.trim().is_empty() {
                self.kernel_cache.cache_dir = Some(PathBuf::from(dir));
            }
        }
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.kernel_cache.cache_dir = Some(dir.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = EngineConfig::from_json(r#"{"kernel_cache": {"cache_dir": "/tmp/k"}, "queue_type": "OutOfOrder"}"#).unwrap();
        assert_eq!(cfg.kernel_cache.max_kernels_per_batch, 10);
        assert_eq!(cfg.kernel_cache.cache_dir, Some(PathBuf::from("/tmp/k")));
        assert_eq!(cfg.queue_type, QueueType::OutOfOrder);
        assert!(cfg.use_memory_pool);
    }

    #[test]
    fn build_options_defaults_to_optimizing() {
        let opts = BuildOptions::from_json(r#"{"outputs": ["out"]}"#).unwrap();
        assert!(opts.optimize_data);
        assert!(!opts.internal);
        assert_eq!(opts.outputs, vec!["out".to_string()]);
    }
}
