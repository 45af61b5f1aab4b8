use super::batch::{Batch, PendingKernel, plan_batches};
use super::{KernelId, KernelSource};
use crate::config::KernelCacheConfig;
use crate::core::error::EngineError;
use crate::core::hash::Fingerprint;
use crate::device::{Device, Kernel};
use anyhow::{Context, anyhow};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

pub const KERNEL_BINARY_SUFFIX: &str = ".kbin";

type ProgramKernels = Arc<HashMap<String, Kernel>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelCacheStats {
    pub compiled: usize,
    pub loaded_from_disk: usize,
    pub reused: usize,
}

#[derive(Default)]
struct CacheState {
    pending: Vec<PendingKernel>,
    in_flight: HashSet<KernelId>,
    by_content: HashMap<u64, KernelId>,
    entry_points: HashMap<String, u64>,
    kernels: HashMap<KernelId, Kernel>,
    programs: HashMap<u64, ProgramKernels>,
    counter: usize,
}

/// Registers kernel sources, compiles them in batches and hands out loaded
/// kernels by id. One instance is shared by every program of an engine.
pub struct KernelCache {
    device: Arc<dyn Device>,
    config: KernelCacheConfig,
    pool: rayon::ThreadPool,
    state: Mutex<CacheState>,
    compiled: AtomicUsize,
    loaded_from_disk: AtomicUsize,
    reused: AtomicUsize,
}

impl KernelCache {
    pub fn new(device: Arc<dyn Device>, config: KernelCacheConfig) -> anyhow::Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.compile_threads)
            .thread_name(|i| format!("kernel-compile-{}", i))
            .build()
            .context("Failed to create kernel compilation pool")?;
        Ok(Self {
            device,
            config,
            pool,
            state: Mutex::new(CacheState::default()),
            compiled: AtomicUsize::new(0),
            loaded_from_disk: AtomicUsize::new(0),
            reused: AtomicUsize::new(0),
        })
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, CacheState>> {
        self.state.lock().map_err(|_| anyhow!("kernel cache mutex poisoned"))
    }

    /// Registers a source for the next `build_all` and returns its id.
    /// Content-identical sources share one id.
    pub fn set_kernel_source(&self, source: KernelSource) -> anyhow::Result<KernelId> {
        let content = Fingerprint::new()
            .update_str(&source.entry_point)
            .update_str("\0")
            .update_str(&source.options)
            .update_str("\0")
            .update_str(&source.code)
            .finish();

        let mut state = self.lock()?;
        if let Some(id) = state.by_content.get(&content) {
            return Ok(id.clone());
        }
        if let Some(other) = state.entry_points.get(&source.entry_point) {
            if *other != content {
                return Err(anyhow!("entry point '{}' registered twice with different sources", source.entry_point));
            }
        }

        let id = format!("{}_{}", source.entry_point, state.counter);
        state.counter += 1;
        state.by_content.insert(content, id.clone());
        state.entry_points.insert(source.entry_point.clone(), content);
        state.pending.push(PendingKernel { id: id.clone(), source });
        Ok(id)
    }

    pub fn has_pending(&self) -> bool {
        self.lock().map(|s| !s.pending.is_empty()).unwrap_or(false)
    }

    /// Compiles everything registered since the last call. Batches run on the
    /// compile pool; failures are collected and reported once all batches finish.
    pub fn build_all(&self) -> anyhow::Result<()> {
        let pending = {
            let mut state = self.lock()?;
            if state.pending.is_empty() {
                return Ok(());
            }
            let pending = std::mem::take(&mut state.pending);
            let ids: Vec<KernelId> = pending.iter().map(|p| p.id.clone()).collect();
            state.in_flight.extend(ids);
            pending
        };

        let batches = plan_batches(&pending, self.config.max_kernels_per_batch, &self.device.info().driver_version);
        let total = batches.len();
        debug!(kernels = pending.len(), batches = total, "building kernel batches");

        let results: Vec<(Batch, anyhow::Result<ProgramKernels>)> = self.pool.install(|| {
            batches
                .into_par_iter()
                .map(|batch| {
                    let built = self.build_batch(&batch);
                    (batch, built)
                })
                .collect()
        });

        let mut failures = Vec::new();
        let mut state = self.lock()?;
        for (batch, result) in results {
            for id in batch.entry_points.values() {
                state.in_flight.remove(id);
            }
            let extracted = result.and_then(|kernels| {
                batch
                    .entry_points
                    .iter()
                    .map(|(entry, id)| {
                        kernels
                            .get(entry)
                            .cloned()
                            .map(|k| (id.clone(), k))
                            .ok_or_else(|| anyhow!("could not find entry point '{}' in compiled batch", entry))
                    })
                    .collect::<anyhow::Result<Vec<_>>>()
            });
            match extracted {
                Ok(kernels) => state.kernels.extend(kernels),
                Err(e) => {
                    warn!(bucket = %batch.bucket, batch = batch.index, error = %e, "kernel batch failed");
                    state.by_content.retain(|_, id| !batch.entry_points.values().any(|b| b == id));
                    for entry in batch.entry_points.keys() {
                        state.entry_points.remove(entry);
                    }
                    failures.push(e);
                }
            }
        }
        drop(state);

        let stats = self.stats();
        info!(batches = total, compiled = stats.compiled, from_disk = stats.loaded_from_disk, reused = stats.reused, "kernel cache built");

        if let Some(first) = failures.first() {
            return Err(EngineError::CompilationFailed { failed: failures.len(), total, first: format!("{:#}", first) }.into());
        }
        Ok(())
    }

    fn build_batch(&self, batch: &Batch) -> anyhow::Result<ProgramKernels> {
        if let Some(kernels) = self.lock()?.programs.get(&batch.hash).cloned() {
            self.reused.fetch_add(1, Ordering::SeqCst);
            return Ok(kernels);
        }

        let path = self.binary_path(batch.hash);
        let mut loaded = None;
        if let Some(path) = path.as_ref().filter(|p| p.is_file()) {
            match std::fs::read(path).map_err(anyhow::Error::from).and_then(|bin| self.device.load_kernels(&bin)) {
                Ok(kernels) => {
                    self.loaded_from_disk.fetch_add(1, Ordering::SeqCst);
                    loaded = Some(kernels);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "ignoring unreadable kernel binary"),
            }
        }

        let kernels = match loaded {
            Some(kernels) => kernels,
            None => {
                let binary = self
                    .device
                    .compile_program(&batch.source(), &batch.options)
                    .with_context(|| format!("batch {} of bucket '{}'", batch.index, batch.bucket))?;
                self.compiled.fetch_add(1, Ordering::SeqCst);
                if let Some(path) = &path {
                    if let Err(e) = std::fs::write(path, &binary) {
                        warn!(path = %path.display(), error = %e, "failed to persist kernel binary");
                    }
                }
                self.device.load_kernels(&binary)?
            }
        };

        let by_entry: ProgramKernels = Arc::new(kernels.into_iter().map(|k| (k.entry_point().to_string(), k)).collect());
        self.lock()?.programs.insert(batch.hash, by_entry.clone());
        Ok(by_entry)
    }

    /// Where a batch binary lives, `None` when persistence is disabled.
    pub fn binary_path(&self, hash: u64) -> Option<PathBuf> {
        self.config
            .cache_dir
            .as_ref()
            .filter(|dir| dir.is_dir())
            .map(|dir| dir.join(format!("{:016x}{}", hash, KERNEL_BINARY_SUFFIX)))
    }

    pub fn get_kernel(&self, id: &str) -> anyhow::Result<Kernel> {
        let state = self.lock()?;
        if let Some(kernel) = state.kernels.get(id) {
            return Ok(kernel.clone());
        }
        if state.in_flight.contains(id) || state.pending.iter().any(|p| p.id == id) {
            return Err(EngineError::KernelsNotCompiled(id.to_string()).into());
        }
        Err(EngineError::UnknownKernel(id.to_string()).into())
    }

    pub fn stats(&self) -> KernelCacheStats {
        KernelCacheStats {
            compiled: self.compiled.load(Ordering::SeqCst),
            loaded_from_disk: self.loaded_from_disk.load(Ordering::SeqCst),
            reused: self.reused.load(Ordering::SeqCst),
        }
    }
}
