//! Compute-graph execution engine: topologies are built into optimized
//! programs, programs are instantiated as networks and executed on a device
//! stream. Compiled kernels and implementations are shared per engine; the
//! engine's memory pool hands out buffers per network.

pub mod config;
pub mod core;
pub mod device;
pub mod engine;
pub mod kernels;
pub mod memory;
pub mod network;
pub mod ops;
pub mod program;
pub mod registry;
pub mod runtime;
pub mod topology;

pub use config::{BuildOptions, EngineConfig, KernelCacheConfig, QueueType};
pub use crate::core::error::EngineError;
pub use crate::core::types::{DataType, Dim, Format, Layout, Shape};
pub use device::{AllocationType, Buffer, Device, Event, HostDevice, Stream};
pub use engine::Engine;
pub use network::{Network, NetworkOutput, PrimitiveInfo};
pub use program::Program;
pub use registry::{NodeTraits, NodeType, Registry};
pub use topology::{PrimitiveDesc, Topology};
