use crate::config::EngineConfig;
use crate::device::{Device, HostDevice, Stream};
use crate::kernels::KernelCache;
use crate::memory::MemoryPool;
use crate::registry::Registry;
use crate::runtime::ImplCache;
use std::sync::Arc;
use tracing::info;

/// Everything programs and networks on one device share: the device itself,
/// the operation registry, the kernel cache, the implementation cache and
/// the memory pool.
pub struct Engine {
    device: Arc<dyn Device>,
    config: EngineConfig,
    registry: Registry,
    kernel_cache: KernelCache,
    impl_cache: ImplCache,
    memory_pool: MemoryPool,
}

impl Engine {
    pub fn new(device: Arc<dyn Device>, config: EngineConfig) -> anyhow::Result<Arc<Self>> {
        Self::with_registry(device, config, Registry::with_builtin_ops())
    }

    pub fn with_registry(device: Arc<dyn Device>, config: EngineConfig, registry: Registry) -> anyhow::Result<Arc<Self>> {
        let kernel_cache = KernelCache::new(device.clone(), config.kernel_cache.clone())?;
        let impl_cache = ImplCache::new(config.impl_cache_capacity);
        let memory_pool = MemoryPool::new(device.clone());
        info!(device = %device.info().name, driver = %device.info().driver_version, kinds = registry.kinds().len(), "engine created");
        Ok(Arc::new(Self { device, config, registry, kernel_cache, impl_cache, memory_pool }))
    }

    /// Engine over a fresh `HostDevice` with default configuration.
    pub fn host() -> anyhow::Result<Arc<Self>> {
        Self::new(Arc::new(HostDevice::new()), EngineConfig::default())
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn kernel_cache(&self) -> &KernelCache {
        &self.kernel_cache
    }

    pub fn impl_cache(&self) -> &ImplCache {
        &self.impl_cache
    }

    pub fn memory_pool(&self) -> &MemoryPool {
        &self.memory_pool
    }

    pub fn create_stream(&self) -> anyhow::Result<Arc<dyn Stream>> {
        self.device.create_stream(self.config.queue_type)
    }
}
