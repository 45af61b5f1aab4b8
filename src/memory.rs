use crate::core::types::Layout;
use crate::device::{AllocationType, Buffer, Device};
use anyhow::anyhow;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct MemoryUser {
    pub id: String,
    pub network_id: u32,
}

struct MemoryRecord {
    buffer: Buffer,
    users: BTreeSet<MemoryUser>,
    network_id: u32,
    kind: AllocationType,
}

/// Reuses device buffers between nodes whose lifetimes do not overlap.
///
/// A pooled buffer remembers every node it was handed to. A request is served
/// from an existing buffer only when none of those users appears in the
/// requester's dependency set (the nodes whose data must stay intact while
/// the requester's output is live). Users accumulate until released.
///
/// One pool lives in each engine, but a buffer is only handed out again
/// within the network that first requested it. Networks never share pooled
/// storage, so dropping one network cannot free memory another still uses.
pub struct MemoryPool {
    device: Arc<dyn Device>,
    // capacity in bytes -> records
    records: Mutex<BTreeMap<usize, Vec<MemoryRecord>>>,
    allocations: AtomicUsize,
    reuses: AtomicUsize,
}

impl MemoryPool {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self { device, records: Mutex::new(BTreeMap::new()), allocations: AtomicUsize::new(0), reuses: AtomicUsize::new(0) }
    }

    pub fn get_memory(
        &self,
        layout: &Layout,
        owner_id: &str,
        network_id: u32,
        dependencies: &BTreeSet<String>,
        kind: AllocationType,
        reusable: bool,
    ) -> anyhow::Result<Buffer> {
        if !reusable {
            self.allocations.fetch_add(1, Ordering::SeqCst);
            return self.device.allocate(layout, kind);
        }

        let size = layout.byte_size().ok_or_else(|| anyhow!("cannot pool memory for dynamic layout {}", layout))?;
        let mut records = self.records.lock().map_err(|_| anyhow!("memory pool mutex poisoned"))?;
        for (_, bucket) in records.range_mut(size..) {
            for rec in bucket.iter_mut() {
                let compatible = rec.network_id == network_id && rec.kind == kind;
                if compatible && !rec.users.iter().any(|u| dependencies.contains(&u.id)) {
                    rec.users.insert(MemoryUser { id: owner_id.to_string(), network_id });
                    self.reuses.fetch_add(1, Ordering::SeqCst);
                    debug!(owner = owner_id, storage = rec.buffer.storage_id(), users = rec.users.len(), "reusing pooled buffer");
                    return rec.buffer.reinterpret(layout);
                }
            }
        }

        let buffer = self.device.allocate(layout, kind)?;
        self.allocations.fetch_add(1, Ordering::SeqCst);
        debug!(owner = owner_id, bytes = size, ?kind, "allocated pooled buffer");
        records.entry(size).or_default().push(MemoryRecord {
            buffer: buffer.clone(),
            users: BTreeSet::from([MemoryUser { id: owner_id.to_string(), network_id }]),
            network_id,
            kind,
        });
        Ok(buffer)
    }

    /// Drops `owner_id` from the buffer's users; the record goes away with its last user.
    pub fn release_memory(&self, buffer: &Buffer, owner_id: &str, network_id: u32) {
        let Ok(mut records) = self.records.lock() else { return };
        let user = MemoryUser { id: owner_id.to_string(), network_id };
        for bucket in records.values_mut() {
            for rec in bucket.iter_mut().filter(|r| r.buffer.same_storage(buffer)) {
                rec.users.remove(&user);
            }
            bucket.retain(|r| !r.users.is_empty());
        }
        records.retain(|_, b| !b.is_empty());
    }

    /// Releases everything handed out to one network.
    pub fn release_network(&self, network_id: u32) {
        let Ok(mut records) = self.records.lock() else { return };
        for bucket in records.values_mut() {
            bucket.retain(|r| r.network_id != network_id);
        }
        records.retain(|_, b| !b.is_empty());
        debug!(network_id, "released pooled memory");
    }

    pub fn pooled_buffers(&self) -> usize {
        self.records.lock().map(|r| r.values().map(|b| b.len()).sum()).unwrap_or(0)
    }

    pub fn pooled_buffers_for(&self, network_id: u32) -> usize {
        self.records
            .lock()
            .map(|r| r.values().flatten().filter(|rec| rec.network_id == network_id).count())
            .unwrap_or(0)
    }

    /// Fresh device allocations made through the pool, pooled or dedicated.
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    pub fn reuses(&self) -> usize {
        self.reuses.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::DataType;
    use crate::device::HostDevice;

    fn deps(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn reuses_only_without_conflicts() {
        let pool = MemoryPool::new(Arc::new(HostDevice::new()));
        let layout = Layout::new(DataType::F32, &[16]);
        let a = pool.get_memory(&layout, "a", 1, &deps(&["b"]), AllocationType::Device, true).unwrap();
        let b = pool.get_memory(&layout, "b", 1, &deps(&["a", "c"]), AllocationType::Device, true).unwrap();
        let c = pool.get_memory(&layout, "c", 1, &deps(&["b"]), AllocationType::Device, true).unwrap();
        assert!(!a.same_storage(&b));
        assert!(a.same_storage(&c));
        assert_eq!(pool.allocations(), 2);
        assert_eq!(pool.reuses(), 1);
    }

    #[test]
    fn smaller_request_fits_larger_buffer_but_not_other_network() {
        let pool = MemoryPool::new(Arc::new(HostDevice::new()));
        let big = pool.get_memory(&Layout::new(DataType::F32, &[64]), "big", 1, &deps(&[]), AllocationType::Device, true).unwrap();
        let small = pool.get_memory(&Layout::new(DataType::F32, &[8]), "small", 1, &deps(&[]), AllocationType::Device, true).unwrap();
        assert!(big.same_storage(&small));
        assert_eq!(small.layout().count(), Some(8));

        let other = pool.get_memory(&Layout::new(DataType::F32, &[8]), "small", 2, &deps(&[]), AllocationType::Device, true).unwrap();
        assert!(!other.same_storage(&big));
        let host = pool.get_memory(&Layout::new(DataType::F32, &[8]), "h", 1, &deps(&[]), AllocationType::Host, true).unwrap();
        assert!(!host.same_storage(&big));
    }

    #[test]
    fn non_reusable_requests_bypass_the_pool() {
        let pool = MemoryPool::new(Arc::new(HostDevice::new()));
        let layout = Layout::new(DataType::F32, &[4]);
        let a = pool.get_memory(&layout, "out", 1, &deps(&[]), AllocationType::Host, false).unwrap();
        let b = pool.get_memory(&layout, "out2", 1, &deps(&[]), AllocationType::Host, false).unwrap();
        assert!(!a.same_storage(&b));
        assert_eq!(pool.pooled_buffers(), 0);
    }

    #[test]
    fn release_network_drops_its_records() {
        let pool = MemoryPool::new(Arc::new(HostDevice::new()));
        let layout = Layout::new(DataType::F32, &[4]);
        pool.get_memory(&layout, "a", 7, &deps(&[]), AllocationType::Device, true).unwrap();
        pool.get_memory(&layout, "a", 8, &deps(&[]), AllocationType::Device, true).unwrap();
        pool.release_network(7);
        assert_eq!(pool.pooled_buffers_for(7), 0);
        assert_eq!(pool.pooled_buffers_for(8), 1);
    }

    #[test]
    fn release_memory_forgets_a_single_user() {
        let pool = MemoryPool::new(Arc::new(HostDevice::new()));
        let layout = Layout::new(DataType::F32, &[4]);
        let a = pool.get_memory(&layout, "a", 1, &deps(&[]), AllocationType::Device, true).unwrap();
        // "b" conflicts with "a" until "a" lets go of the buffer.
        let b = pool.get_memory(&layout, "b", 1, &deps(&["a"]), AllocationType::Device, true).unwrap();
        assert!(!a.same_storage(&b));
        pool.release_memory(&a, "a", 1);
        let c = pool.get_memory(&layout, "c", 1, &deps(&["b"]), AllocationType::Device, true).unwrap();
        assert!(!c.same_storage(&b));
        assert_eq!(pool.pooled_buffers(), 2);
    }
}
