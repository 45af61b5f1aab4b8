use crate::config::QueueType;
use thiserror::Error;

/// Conditions callers may want to match on. They travel inside
/// `anyhow::Error`; use `err.downcast_ref::<EngineError>()` to inspect them.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    // build time
    #[error("duplicate primitive id '{0}' in topology")]
    DuplicateId(String),
    #[error("primitive '{node}' depends on '{dependency}' which is not part of the topology")]
    DanglingReference { node: String, dependency: String },
    #[error("cyclic reference detected in topology (at '{0}')")]
    CyclicReference(String),
    #[error("unknown primitive kind '{0}'")]
    UnknownKind(String),
    #[error("requested output '{0}' is not part of the topology")]
    UnknownOutput(String),
    #[error("invalid parameters for '{node}': {reason}")]
    InvalidParams { node: String, reason: String },
    #[error("unsupported fused combination for '{node}': {reason}")]
    UnsupportedFusion { node: String, reason: String },
    #[error("layout of '{0}' has not been computed")]
    LayoutNotComputed(String),

    // kernel compilation
    #[error("kernel cache is not compiled, call build_all() first (kernel '{0}')")]
    KernelsNotCompiled(String),
    #[error("kernel '{0}' not found in the kernel cache")]
    UnknownKernel(String),
    #[error("{failed} of {total} kernel batches failed to compile: {first}")]
    CompilationFailed { failed: usize, total: usize, first: String },

    // execution time
    #[error("primitive '{0}' is tried to be executed for the second time")]
    Reexecution(String),
    #[error("output layout of '{0}' is still dynamic at execution time")]
    DynamicLayout(String),
    #[error("execution order corrupted: no event for dependency '{dependency}' of '{node}'")]
    ExecutionOrderCorrupted { node: String, dependency: String },
    #[error("no implementation selected for '{0}'")]
    MissingImplementation(String),
    #[error("input '{0}' has no data set")]
    InputNotSet(String),

    // usage
    #[error("topology doesn't contain primitive '{0}'")]
    UnknownPrimitive(String),
    #[error("primitive '{0}' is not an input")]
    NotAnInput(String),
    #[error("primitive '{0}' is not a network output")]
    NotAnOutput(String),
    #[error("layout mismatch for '{id}': expected {expected}, got {actual}")]
    LayoutMismatch { id: String, expected: String, actual: String },
    #[error("program was planned for {program:?} queues and cannot run on an {stream:?} stream")]
    QueueTypeMismatch { program: QueueType, stream: QueueType },
}
