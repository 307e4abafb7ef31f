//! Error type shared by every layer of the transfer engine.
//!
//! Setup failures (device discovery, verbs resource allocation, queue pair
//! transitions, exchange validation) surface here and are expected to abort the
//! caller's session. Request-level failures never use this type once a work
//! request has been accepted by the fabric; they travel through
//! [`crate::CompletionStatus`] instead.

use crate::ibverbs_primitives::LinkType;
use crate::ibverbs_primitives::OpCode;
use crate::rdma_context::ContextState;

pub type Result<T> = std::result::Result<T, RdmaError>;

#[derive(Debug, thiserror::Error)]
pub enum RdmaError {
    #[error("no RDMA devices found")]
    NoDevices,

    #[error("failed to open RDMA device {name}: {source}")]
    DeviceOpen {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("port {port} of {device} has link layer {actual}, expected {expected}")]
    LinkTypeMismatch {
        device: String,
        port: u8,
        expected: LinkType,
        actual: String,
    },

    #[error("no RoCE v2 IPv4-mapped GID found on {device} port {port}")]
    GidNotFound { device: String, port: u8 },

    #[error("{op} failed: {source}")]
    Verbs {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: cannot {operation} in state {state}")]
    InvalidState {
        context: String,
        state: ContextState,
        operation: &'static str,
    },

    #[error("{0} is already connected")]
    AlreadyConnected(String),

    #[error("failed to post work request on {context}: {source}")]
    PostFailed {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown local memory region {0}")]
    UnknownMemoryRegion(String),

    #[error("unknown remote memory region {0}")]
    UnknownRemoteMemoryRegion(String),

    #[error("unknown buffer {0}")]
    UnknownBuffer(String),

    #[error("memory region {0} is already registered")]
    DuplicateMemoryRegion(String),

    #[error("peer has {remote} device contexts, local scheduler has {local}")]
    ContextCountMismatch { local: usize, remote: usize },

    #[error("malformed exchange payload: {0}")]
    MalformedExchange(#[from] serde_json::Error),

    #[error("control channel: {0}")]
    Channel(#[from] std::io::Error),

    #[error("control channel closed by peer")]
    ChannelClosed,

    #[error("batch has {sources} source offsets but {targets} target offsets")]
    BatchMismatch { sources: usize, targets: usize },

    #[error("transfer [{offset}, {offset}+{length}) is outside buffer {key} of {size} bytes")]
    OutOfRange {
        key: String,
        offset: usize,
        length: usize,
        size: usize,
    },

    #[error("target range at offset {offset} of {key} does not line up with source slice {slice}")]
    MisalignedTarget {
        key: String,
        offset: usize,
        slice: String,
    },

    #[error("invalid context config: {0}")]
    InvalidConfig(String),

    #[error("opcode {0} is not supported by this context")]
    UnsupportedOpcode(OpCode),
}

impl RdmaError {
    /// Captures `errno` for a verbs call that just failed.
    pub(crate) fn verbs(op: &'static str) -> Self {
        RdmaError::Verbs {
            op,
            source: std::io::Error::last_os_error(),
        }
    }
}
