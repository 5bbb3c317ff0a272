use crate::error::TraceError;
use crate::heap::RootPtr;
use clap::ValueEnum;
use std::fs::File;
use std::io::Read;
use std::path::Path;

pub mod hprof;
pub mod native;
pub mod scanner;

pub use hprof::{HprofDecoder, HprofSymbols};
pub use native::{NativeDecoder, NativeHeader, TraceWriter};
pub use scanner::{RecordBuf, Scanner};

pub type Address = u64;

/// Subsystem that performed an allocation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AllocKind {
    /// VM slow path
    VmSlow,
    Interpreter,
    /// Client compiler
    C1,
    /// Server compiler
    C2,
    /// Object found in a heap dump, allocator unknown
    Dump,
}

impl AllocKind {
    pub fn from_u8(v: u8) -> Option<AllocKind> {
        match v {
            0 => Some(AllocKind::VmSlow),
            1 => Some(AllocKind::Interpreter),
            2 => Some(AllocKind::C1),
            3 => Some(AllocKind::C2),
            4 => Some(AllocKind::Dump),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            AllocKind::VmSlow => 0,
            AllocKind::Interpreter => 1,
            AllocKind::C1 => 2,
            AllocKind::C2 => 3,
            AllocKind::Dump => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AllocKind::VmSlow => "VM",
            AllocKind::Interpreter => "IR",
            AllocKind::C1 => "C1",
            AllocKind::C2 => "C2",
            AllocKind::Dump => "Dump",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub addr: Address,
    pub thread: u32,
    pub site: u32,
    pub type_id: u32,
    pub kind: AllocKind,
    /// Padded size in bytes; for arrays the decoder derives it from the length
    pub size: u64,
    pub array_length: Option<u32>,
    pub is_mirror: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GcKind {
    Minor,
    Major,
}

impl GcKind {
    pub fn is_full(self) -> bool {
        self == GcKind::Major
    }
}

pub const ARTIFICIAL_CAUSE: &str = "Artificial GC Event";

/// One GC-cycle boundary as reported by the trace
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParserGcInfo {
    pub id: u32,
    pub kind: GcKind,
    pub cause: String,
    pub concurrent: bool,
    pub failed: bool,
    pub timestamp: u64,
}

impl ParserGcInfo {
    pub fn artificial(id: u32) -> Self {
        ParserGcInfo {
            id,
            kind: GcKind::Minor,
            cause: ARTIFICIAL_CAUSE.to_string(),
            concurrent: false,
            failed: false,
            timestamp: 0,
        }
    }

    pub fn is_artificial(&self) -> bool {
        self.cause == ARTIFICIAL_CAUSE
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SpaceKind {
    Eden,
    Survivor,
    Old,
    /// Addresses outside every declared space
    Undefined,
}

impl SpaceKind {
    pub const ALL: [SpaceKind; 4] = [
        SpaceKind::Eden,
        SpaceKind::Survivor,
        SpaceKind::Old,
        SpaceKind::Undefined,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_u8(v: u8) -> Option<SpaceKind> {
        SpaceKind::ALL.get(v as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            SpaceKind::Eden => "eden",
            SpaceKind::Survivor => "survivor",
            SpaceKind::Old => "old",
            SpaceKind::Undefined => "undefined",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpaceInfo {
    pub index: u32,
    pub kind: SpaceKind,
    pub start: Address,
    pub size: u64,
}

impl SpaceInfo {
    pub fn end(&self) -> Address {
        self.start + self.size
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Allocate(Allocation),
    Move { from: Address, to: Address },
    Die { addr: Address },
    /// A zero target clears the slot
    PointerUpdate { addr: Address, slot: u32, target: Address },
    /// A zero target clears every binding of the root
    RootUpdate { root: RootPtr, target: Address },
    GcStart(ParserGcInfo),
    GcEnd(ParserGcInfo),
    SpaceCreate(SpaceInfo),
}

/// An event together with the offset of the record it was decoded from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TracedEvent {
    pub offset: u64,
    pub event: Event,
}

/// Byte window of the trace being processed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParsingInfo {
    pub from: u64,
    pub to: u64,
    pub position: u64,
}

impl ParsingInfo {
    pub fn progress(&self) -> f64 {
        if self.to <= self.from {
            return 1.0;
        }
        (self.position.saturating_sub(self.from)) as f64 / (self.to - self.from) as f64
    }
}

/// A lazy, single-pass, ordered stream of decoded events
pub trait EventSource: Iterator<Item = Result<TracedEvent, TraceError>> {
    /// Offset of the next undecoded byte
    fn position(&self) -> u64;
    fn format(&self) -> TraceFormat;
    /// Whether GC cycles may overlap in this trace
    fn allows_nested_cycles(&self) -> bool {
        false
    }
    /// Whether pointers to an object may outlive its death by one cycle
    fn allows_dangling_after_death(&self) -> bool {
        false
    }
    /// Whether no decoded events are buffered, so `position` is a record
    /// boundary the decoder could resume from
    fn at_record_boundary(&self) -> bool;
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum, Debug)]
pub enum TraceFormat {
    Native,
    Hprof,
}

impl TraceFormat {
    /// Sniff the format from the leading magic bytes
    pub fn detect(path: impl AsRef<Path>) -> Result<TraceFormat, TraceError> {
        let mut magic = [0u8; 4];
        let mut file = File::open(path)?;
        let n = file.read(&mut magic)?;
        if n == 4 && magic == crate::constants::NATIVE_TRACE_MAGIC {
            Ok(TraceFormat::Native)
        } else if n == 4 && &magic == b"JAVA" {
            Ok(TraceFormat::Hprof)
        } else {
            Err(crate::error::DecodeError::invalid(0, "trace magic").into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_artificial_info() {
        let info = ParserGcInfo::artificial(0);
        assert!(info.is_artificial());
        assert!(!info.kind.is_full());
    }

    #[test]
    fn test_progress() {
        let info = ParsingInfo {
            from: 100,
            to: 300,
            position: 200,
        };
        assert_eq!(info.progress(), 0.5);
        assert_eq!(ParsingInfo::default().progress(), 1.0);
    }

    #[test]
    fn test_detect() {
        let mut native = tempfile::NamedTempFile::new().unwrap();
        native.write_all(b"GCTR\x01\x00").unwrap();
        assert_eq!(TraceFormat::detect(native.path()).unwrap(), TraceFormat::Native);
        let mut hprof = tempfile::NamedTempFile::new().unwrap();
        hprof.write_all(b"JAVA PROFILE 1.0.2\0").unwrap();
        assert_eq!(TraceFormat::detect(hprof.path()).unwrap(), TraceFormat::Hprof);
        let mut other = tempfile::NamedTempFile::new().unwrap();
        other.write_all(b"xx").unwrap();
        assert!(TraceFormat::detect(other.path()).is_err());
    }

    #[test]
    fn test_space_kind_indices() {
        for (i, kind) in SpaceKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
        assert_eq!(SpaceKind::from_u8(2), Some(SpaceKind::Old));
    }
}
