pub mod impl_cache;
pub mod implementation;
pub mod instance;

pub use impl_cache::ImplCache;
pub use implementation::{ExecuteContext, HostImpl, KernelImpl, PrimitiveImpl, impl_key};
pub use instance::{AllocationPolicy, PrimitiveInst};
