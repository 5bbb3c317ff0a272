use crate::constants::ARRAY_SIZE_MAX_SMALL;
use clap::ValueEnum;
use std::path::PathBuf;

/// How much of an allocation site's call chain the symbol loaders keep
#[derive(Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Debug, Default)]
pub enum CallContextMode {
    /// Only the immediate allocating frame
    None,
    /// Frames known statically, without runtime-only frames
    Static,
    #[default]
    Full,
}

/// Half-open `[from, to)` range of GC timestamps
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeWindow {
    pub from: u64,
    pub to: u64,
}

impl TimeWindow {
    pub fn new(from: u64, to: u64) -> Self {
        TimeWindow { from, to }
    }

    pub fn contains(&self, timestamp: u64) -> bool {
        self.from <= timestamp && timestamp < self.to
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointPolicy {
    pub directory: PathBuf,
    /// Capture on every n-th eligible completed cycle
    pub every_n_cycles: u32,
    /// Only major (full) collections are eligible
    pub major_only: bool,
    /// Number of checkpoint files retained, older ones are pruned; 0 keeps
    /// every file
    pub keep: usize,
}

impl CheckpointPolicy {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        CheckpointPolicy {
            directory: directory.into(),
            every_n_cycles: 1,
            major_only: false,
            keep: 4,
        }
    }

    #[must_use]
    pub fn every(mut self, n: u32) -> Self {
        self.every_n_cycles = n.max(1);
        self
    }

    #[must_use]
    pub fn major_only(mut self, major_only: bool) -> Self {
        self.major_only = major_only;
        self
    }

    #[must_use]
    pub fn keep(mut self, keep: usize) -> Self {
        self.keep = keep;
        self
    }
}

/// Settings for one parse, fixed at parser construction
#[derive(Clone, Debug)]
pub struct ParserConfig {
    /// Fail on the first heap-graph invariant violation instead of counting it
    pub consistency_check: bool,
    /// Skip unknown or oversized records and stop quietly on truncation
    pub lenient_decoding: bool,
    pub call_context: CallContextMode,
    pub window: Option<TimeWindow>,
    /// Stop decoding at the first record boundary at or past this offset
    pub stop_offset: Option<u64>,
    pub small_array_threshold: u32,
    /// Lenient-mode violations logged individually before summarising
    pub max_reported_violations: usize,
    pub checkpoint: Option<CheckpointPolicy>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        ParserConfig {
            consistency_check: false,
            lenient_decoding: false,
            call_context: CallContextMode::default(),
            window: None,
            stop_offset: None,
            small_array_threshold: ARRAY_SIZE_MAX_SMALL,
            max_reported_violations: 16,
            checkpoint: None,
        }
    }
}

impl ParserConfig {
    #[must_use]
    pub fn with_consistency_check(mut self, strict: bool) -> Self {
        self.consistency_check = strict;
        self
    }

    #[must_use]
    pub fn with_lenient_decoding(mut self, lenient: bool) -> Self {
        self.lenient_decoding = lenient;
        self
    }

    #[must_use]
    pub fn with_call_context(mut self, mode: CallContextMode) -> Self {
        self.call_context = mode;
        self
    }

    #[must_use]
    pub fn with_window(mut self, from: u64, to: u64) -> Self {
        self.window = Some(TimeWindow::new(from, to));
        self
    }

    #[must_use]
    pub fn with_stop_offset(mut self, offset: u64) -> Self {
        self.stop_offset = Some(offset);
        self
    }

    #[must_use]
    pub fn with_small_array_threshold(mut self, threshold: u32) -> Self {
        self.small_array_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_checkpoints(mut self, policy: CheckpointPolicy) -> Self {
        self.checkpoint = Some(policy);
        self
    }
}
