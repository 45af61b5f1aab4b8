use super::{KernelId, KernelSource};
use crate::core::hash::Fingerprint;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone)]
pub(crate) struct PendingKernel {
    pub id: KernelId,
    pub source: KernelSource,
}

/// Kernels compiled together as one device program.
#[derive(Debug, Clone)]
pub struct Batch {
    pub bucket: String,
    pub index: usize,
    pub options: String,
    pub sources: Vec<String>,
    /// entry point -> kernel id
    pub entry_points: BTreeMap<String, KernelId>,
    pub hash: u64,
}

impl Batch {
    pub fn source(&self) -> String {
        self.sources.join("\n")
    }
}

/// Sorted, de-duplicated option words.
pub fn normalize_options(options: &str) -> String {
    let words: BTreeSet<&str> = options.split_whitespace().collect();
    words.into_iter().collect::<Vec<_>>().join(" ")
}

/// Per-kernel defines or include paths make a source unsafe to share a program with others.
pub fn is_batchable(source: &KernelSource) -> bool {
    source.batch_compilation && !source.options.contains("-D") && !source.options.contains("-I")
}

pub fn batch_hash(options: &str, driver_version: &str, sources: &[String]) -> u64 {
    let mut fp = Fingerprint::new();
    fp.update_str(options).update_str(" ").update_str(driver_version);
    for s in sources {
        fp.update_str(s);
    }
    fp.finish()
}

/// Groups pending kernels into deterministic batches: same normalized options
/// share a bucket, buckets are split after `max_per_batch` kernels, and
/// non-batchable kernels get a bucket each.
pub(crate) fn plan_batches(pending: &[PendingKernel], max_per_batch: usize, driver_version: &str) -> Vec<Batch> {
    let max_per_batch = max_per_batch.max(1);
    let mut sorted: Vec<&PendingKernel> = pending.iter().collect();
    sorted.sort_by(|a, b| {
        (normalize_options(&a.source.options), &a.source.entry_point).cmp(&(normalize_options(&b.source.options), &b.source.entry_point))
    });

    let mut buckets: BTreeMap<String, Vec<Batch>> = BTreeMap::new();
    let mut standalone = 0usize;
    for kernel in sorted {
        let (key, options) = if is_batchable(&kernel.source) {
            let opts = normalize_options(&kernel.source.options);
            (opts.clone(), opts)
        } else {
            standalone += 1;
            (format!("{} __PROGRAM__{}", kernel.source.options, standalone), kernel.source.options.clone())
        };

        let bucket = buckets.entry(key.clone()).or_default();
        let needs_new = bucket.last().is_none_or(|b| b.entry_points.len() >= max_per_batch);
        if needs_new {
            let index = bucket.len();
            bucket.push(Batch { bucket: key, index, options, sources: Vec::new(), entry_points: BTreeMap::new(), hash: 0 });
        }
        if let Some(batch) = bucket.last_mut() {
            batch.sources.push(kernel.source.code.clone());
            batch.entry_points.insert(kernel.source.entry_point.clone(), kernel.id.clone());
        }
    }

    buckets
        .into_values()
        .flatten()
        .map(|mut b| {
            b.hash = batch_hash(&b.options, driver_version, &b.sources);
            b
        })
        .collect()
}
