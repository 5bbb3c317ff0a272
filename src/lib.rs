#[macro_use]
extern crate lazy_static;

#[macro_use]
extern crate log;

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

mod checkpoint;
pub mod classify;
mod cli;
mod config;
pub mod constants;
mod error;
mod export;
pub mod heap;
mod parser;
mod phase;
mod sanity;
pub mod statistics;
pub mod symbols;
pub mod trace;
mod util;

pub use crate::checkpoint::{Checkpoint, CheckpointBlob, CheckpointManager};
pub use crate::classify::{Classifier, ClassifierChoice, Histogram};
pub use crate::cli::{Args, Commands, ExportArgs, HistogramArgs, ParseArgs};
pub use crate::config::{CallContextMode, CheckpointPolicy, ParserConfig, TimeWindow};
pub use crate::error::{
    ConsistencyError, DecodeError, FeaturesError, ProtocolError, SymbolKind, TraceError, ViolationKind,
};
pub use crate::export::write_edges;
pub use crate::heap::{HeapGraph, HeapGraphBuilder, ObjRef, RootKind, RootPtr};
pub use crate::parser::{ParseHandle, ParseOutcome, TraceParser};
pub use crate::phase::{Boundary, PhaseChange, PhaseContext, PhaseListener, PhaseMachine};
pub use crate::sanity::{sanity_trace, verify_transpose, Reachability};
pub use crate::statistics::{SpaceStatistics, StatisticsAggregator};
pub use crate::symbols::{FeatureMap, Symbols};
pub use crate::trace::{EventSource, ParserGcInfo, ParsingInfo, SpaceKind, TraceFormat};
pub use crate::util::human_bytes;
