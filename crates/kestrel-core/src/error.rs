use std::fmt;

use crate::device::DeviceKind;

/// Broad failure category of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Initialization,
    Format,
    Io,
    Allocation,
    State,
    Lookup,
    Execution,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Initialization => "initialization",
            ErrorKind::Format => "format",
            ErrorKind::Io => "io",
            ErrorKind::Allocation => "allocation",
            ErrorKind::State => "state",
            ErrorKind::Lookup => "lookup",
            ErrorKind::Execution => "execution",
        };
        write!(f, "{s}")
    }
}

/// Every failure the runtime surfaces. None are retried internally.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // -- initialization --
    #[error("{component} is already initialized")]
    AlreadyInitialized { component: &'static str },

    #[error("no compute device could be activated")]
    NoActiveDevices,

    #[error("{device} context initialization failed: {reason}")]
    DeviceInit { device: DeviceKind, reason: String },

    #[error("driver library {library} not available")]
    DriverUnavailable { library: &'static str },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // -- format --
    #[error("model file too small for {section}: need {needed} bytes, have {actual}")]
    Truncated { section: &'static str, needed: u64, actual: u64 },

    #[error("bad model magic: expected {expected:#010x}, found {found:#010x}")]
    BadMagic { expected: u32, found: u32 },

    #[error("unsupported model version {found} (minimum {minimum})")]
    UnsupportedVersion { found: u16, minimum: u16 },

    #[error("invalid execution plan: {0}")]
    InvalidPlan(String),

    #[error("tensor entry {index}: unknown device id {id}")]
    UnknownDevice { index: usize, id: u8 },

    #[error("tensor entry {index}: unknown data type code {code}")]
    UnknownDType { index: usize, code: u32 },

    #[error("tensor entry {index}: name is not valid UTF-8")]
    InvalidName { index: usize },

    #[error("tensor '{name}': stored size {stored} exceeds capacity {capacity}")]
    StoredSizeExceedsCapacity { name: String, stored: u64, capacity: usize },

    #[error("duplicate tensor name '{0}'")]
    DuplicateTensor(String),

    #[error("tensor '{name}': {reason}")]
    InvalidEntry { name: String, reason: String },

    // -- io --
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("short read for tensor '{name}': expected {expected} bytes")]
    ShortRead { name: String, expected: u64 },

    // -- allocation --
    #[error("{device} allocation of {size} bytes failed: {reason}")]
    AllocationFailed { device: DeviceKind, size: usize, reason: String },

    #[error("no allocator registered for {0}")]
    NoAllocator(DeviceKind),

    #[error("tensor '{name}' has {numel} elements but sizes to zero bytes")]
    ZeroSized { name: String, numel: usize },

    #[error("{device} memory budget exceeded: requested {requested} bytes, {remaining} remaining")]
    BudgetExceeded { device: DeviceKind, requested: usize, remaining: usize },

    #[error("tensor '{name}' is not host-mapped")]
    Unmapped { name: String },

    // -- state --
    #[error("{operation} is not valid in state {state}")]
    InvalidState { operation: &'static str, state: String },

    #[error("pipeline is already prepared")]
    AlreadyPrepared,

    #[error("pipeline is not prepared")]
    NotPrepared,

    #[error("a model is already loaded")]
    ModelAlreadyLoaded,

    #[error("conversation limit of {limit} reached")]
    ConversationLimit { limit: usize },

    #[error("conversation {handle} would hold {requested} tokens, capacity is {capacity}")]
    ContextOverflow { handle: u64, requested: usize, capacity: usize },

    #[error("token sequence is empty")]
    EmptyInput,

    // -- lookup --
    #[error("unknown conversation handle {0}")]
    UnknownConversation(u64),

    #[error("layer index {index} out of range ({len} entries)")]
    LayerOutOfRange { index: usize, len: usize },

    #[error("tensor '{0}' not found")]
    TensorNotFound(String),

    #[error("tensor count mismatch: table has {expected} entries, got {actual} tensors")]
    TensorCountMismatch { expected: usize, actual: usize },

    #[error("no executor for device {0}")]
    NoExecutor(DeviceKind),

    // -- execution --
    #[error("{device} driver call {call} failed with code {code}")]
    Driver { device: DeviceKind, call: &'static str, code: i32 },

    #[error("kernel error: {0}")]
    Kernel(String),
}

impl EngineError {
    /// Wrap an I/O error with a short description of what was being done.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        EngineError::Io { context: context.into(), source }
    }

    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        use EngineError::*;
        match self {
            AlreadyInitialized { .. }
            | NoActiveDevices
            | DeviceInit { .. }
            | DriverUnavailable { .. }
            | InvalidConfig(_) => ErrorKind::Initialization,
            Truncated { .. }
            | BadMagic { .. }
            | UnsupportedVersion { .. }
            | InvalidPlan(_)
            | UnknownDevice { .. }
            | UnknownDType { .. }
            | InvalidName { .. }
            | StoredSizeExceedsCapacity { .. }
            | DuplicateTensor(_)
            | InvalidEntry { .. } => ErrorKind::Format,
            Io { .. } | ShortRead { .. } => ErrorKind::Io,
            AllocationFailed { .. } | NoAllocator(_) | ZeroSized { .. } | BudgetExceeded { .. } | Unmapped { .. } => {
                ErrorKind::Allocation
            }
            InvalidState { .. }
            | AlreadyPrepared
            | NotPrepared
            | ModelAlreadyLoaded
            | ConversationLimit { .. }
            | ContextOverflow { .. }
            | EmptyInput => ErrorKind::State,
            UnknownConversation(_)
            | LayerOutOfRange { .. }
            | TensorNotFound(_)
            | TensorCountMismatch { .. }
            | NoExecutor(_) => ErrorKind::Lookup,
            Driver { .. } | Kernel(_) => ErrorKind::Execution,
        }
    }
}
