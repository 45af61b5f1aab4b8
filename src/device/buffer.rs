use crate::core::types::Layout;
use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

static NEXT_STORAGE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AllocationType {
    /// Device resident, not host lockable.
    Device,
    /// Host memory visible to the device.
    Host,
    /// Shared virtual memory, lockable from both sides.
    Shared,
}

impl AllocationType {
    pub fn is_lockable(&self) -> bool {
        !matches!(self, AllocationType::Device)
    }
}

struct Storage {
    id: u64,
    kind: AllocationType,
    bytes: RwLock<Vec<u8>>,
}

/// A typed view over device storage. Reinterpreting keeps the storage and
/// swaps the layout, so several buffers can alias one allocation.
#[derive(Clone)]
pub struct Buffer {
    storage: Arc<Storage>,
    layout: Layout,
}

impl Buffer {
    /// Zero-filled storage sized for `layout`.
    pub fn allocate(layout: &Layout, kind: AllocationType) -> anyhow::Result<Self> {
        let size = layout.byte_size().ok_or_else(|| anyhow!("cannot allocate dynamic layout {}", layout))?;
        Ok(Self::with_storage(vec![0u8; size], layout.clone(), kind))
    }

    pub fn from_bytes(layout: &Layout, bytes: Vec<u8>, kind: AllocationType) -> anyhow::Result<Self> {
        let size = layout.byte_size().ok_or_else(|| anyhow!("cannot allocate dynamic layout {}", layout))?;
        if bytes.len() < size {
            return Err(anyhow!("{} bytes cannot back layout {} ({} bytes)", bytes.len(), layout, size));
        }
        Ok(Self::with_storage(bytes, layout.clone(), kind))
    }

    pub fn from_f64(layout: &Layout, values: &[f64]) -> anyhow::Result<Self> {
        Self::from_bytes(layout, layout.dtype.encode(values), AllocationType::Host)
    }

    pub fn from_f32(layout: &Layout, values: &[f32]) -> anyhow::Result<Self> {
        let wide: Vec<f64> = values.iter().map(|v| *v as f64).collect();
        Self::from_f64(layout, &wide)
    }

    fn with_storage(bytes: Vec<u8>, layout: Layout, kind: AllocationType) -> Self {
        Self {
            storage: Arc::new(Storage { id: NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed), kind, bytes: RwLock::new(bytes) }),
            layout,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn allocation_type(&self) -> AllocationType {
        self.storage.kind
    }

    pub fn storage_id(&self) -> u64 {
        self.storage.id
    }

    pub fn same_storage(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    pub fn capacity(&self) -> usize {
        self.storage.bytes.read().map(|b| b.len()).unwrap_or(0)
    }

    /// Same storage, new layout. Fails when the storage is too small.
    pub fn reinterpret(&self, layout: &Layout) -> anyhow::Result<Buffer> {
        let needed = layout.byte_size().ok_or_else(|| anyhow!("cannot reinterpret as dynamic layout {}", layout))?;
        if needed > self.capacity() {
            return Err(anyhow!("buffer of {} bytes cannot hold layout {}", self.capacity(), layout));
        }
        Ok(Buffer { storage: self.storage.clone(), layout: layout.clone() })
    }

    /// Copy of the bytes covered by the current layout.
    pub fn read_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let size = self.layout.byte_size().unwrap_or(0);
        let bytes = self.storage.bytes.read().map_err(|_| anyhow!("buffer storage poisoned"))?;
        Ok(bytes[..size.min(bytes.len())].to_vec())
    }

    pub fn write_bytes(&self, data: &[u8]) -> anyhow::Result<()> {
        let mut bytes = self.storage.bytes.write().map_err(|_| anyhow!("buffer storage poisoned"))?;
        if data.len() > bytes.len() {
            return Err(anyhow!("write of {} bytes overflows buffer of {} bytes", data.len(), bytes.len()));
        }
        bytes[..data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn copy_from(&self, other: &Buffer) -> anyhow::Result<()> {
        let data = other.read_bytes()?;
        self.write_bytes(&data)
    }

    pub fn to_f64_vec(&self) -> anyhow::Result<Vec<f64>> {
        Ok(self.layout.dtype.decode(&self.read_bytes()?))
    }

    pub fn to_f32_vec(&self) -> anyhow::Result<Vec<f32>> {
        Ok(self.to_f64_vec()?.into_iter().map(|v| v as f32).collect())
    }

    pub fn write_f64(&self, values: &[f64]) -> anyhow::Result<()> {
        self.write_bytes(&self.layout.dtype.encode(values))
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("storage", &self.storage.id)
            .field("kind", &self.storage.kind)
            .field("layout", &self.layout.to_string())
            .finish()
    }
}
