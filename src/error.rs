use std::fmt;
use thiserror::Error;

/// Malformed bytes in a trace or symbols file
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of stream at offset {offset}")]
    UnexpectedEof { offset: u64 },
    #[error("unknown record tag 0x{tag:02x} at offset {offset}")]
    UnknownTag { offset: u64, tag: u8 },
    #[error("record at offset {offset} declares {declared} bytes but {consumed} were consumed")]
    RecordSizeMismatch {
        offset: u64,
        declared: u64,
        consumed: u64,
    },
    #[error("invalid {what} at offset {offset}")]
    InvalidValue { offset: u64, what: String },
}

impl DecodeError {
    pub fn offset(&self) -> u64 {
        match self {
            DecodeError::UnexpectedEof { offset }
            | DecodeError::UnknownTag { offset, .. }
            | DecodeError::RecordSizeMismatch { offset, .. }
            | DecodeError::InvalidValue { offset, .. } => *offset,
        }
    }

    pub(crate) fn invalid(offset: u64, what: impl Into<String>) -> Self {
        DecodeError::InvalidValue {
            offset,
            what: what.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Type,
    AllocationSite,
    Class,
    String,
    StackFrame,
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SymbolKind::Type => "type",
            SymbolKind::AllocationSite => "allocation site",
            SymbolKind::Class => "class",
            SymbolKind::String => "string",
            SymbolKind::StackFrame => "stack frame",
        };
        f.write_str(s)
    }
}

/// Well-formed records that break the GC-cycle protocol or reference
/// metadata that does not exist
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("GC cycle {new} started at offset {offset} while cycle {open} is still running")]
    NestedGcCycle { open: u32, new: u32, offset: u64 },
    #[error("GC end for cycle {id} at offset {offset} has no matching start")]
    UnmatchedGcEnd { id: u32, offset: u64 },
    #[error("GC cycle id {id} at offset {offset} does not follow cycle {last}")]
    NonMonotonicGcId { id: u32, last: u32, offset: u64 },
    #[error("{kind} {id} referenced at offset {offset} is missing from the symbol table")]
    MissingSymbol {
        kind: SymbolKind,
        id: u64,
        offset: u64,
    },
    #[error("trace nonce {trace:#x} does not match symbols nonce {symbols:#x}")]
    HeaderMismatch { trace: u32, symbols: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ViolationKind {
    DanglingPointer,
    RootToDeadObject,
    OrphanedAddress,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ViolationKind::DanglingPointer => "dangling pointer",
            ViolationKind::RootToDeadObject => "root to dead object",
            ViolationKind::OrphanedAddress => "orphaned address",
        };
        f.write_str(s)
    }
}

/// A heap-graph invariant violation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} at address {addr:#x} (event offset {offset})")]
pub struct ConsistencyError {
    pub kind: ViolationKind,
    pub addr: u64,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("features file {row}:{col}: {message}")]
pub struct FeaturesError {
    pub row: usize,
    pub col: usize,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum TraceError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse cancelled at offset {0}")]
    Cancelled(u64),
    #[error("listener aborted the parse: {0:#}")]
    Listener(anyhow::Error),
    #[error("checkpoint: {0}")]
    Checkpoint(String),
}

impl From<prost::DecodeError> for TraceError {
    fn from(e: prost::DecodeError) -> Self {
        TraceError::Checkpoint(e.to_string())
    }
}
