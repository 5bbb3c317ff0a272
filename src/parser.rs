//! Drives one parse: decoder → phase machine → graph builder and statistics
//! → checkpoints, one event at a time on a single thread.

use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::config::ParserConfig;
use crate::error::{ProtocolError, TraceError};
use crate::heap::{ConsistencyReport, HeapGraph, HeapGraphBuilder};
use crate::phase::{Boundary, CloseContext, PhaseChange, PhaseContext, PhaseListener, PhaseMachine};
use crate::statistics::StatisticsAggregator;
use crate::symbols::{FeatureMap, Symbols};
use crate::trace::{
    Event, EventSource, HprofDecoder, HprofSymbols, NativeDecoder, ParserGcInfo, ParsingInfo, TraceFormat,
};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

/// Everything a finished parse leaves behind
pub struct ParseOutcome {
    pub graph: HeapGraph,
    pub statistics: StatisticsAggregator,
    pub report: ConsistencyReport,
    pub symbols: Arc<Symbols>,
    pub info: ParsingInfo,
    /// Completed cycles, the synthesized cycle 0 included
    pub cycles: u32,
    pub events: u64,
    /// Checkpoint files retained on disk, oldest first
    pub checkpoints: Vec<PathBuf>,
}

pub struct TraceParser {
    source: Box<dyn EventSource + Send>,
    symbols: Arc<Symbols>,
    config: ParserConfig,
    features: Option<Arc<FeatureMap>>,
    listeners: Vec<Box<dyn PhaseListener>>,
    resume: Option<Checkpoint>,
    info: ParsingInfo,
    label: String,
}

fn file_window(path: &Path, from: u64, config: &ParserConfig) -> Result<ParsingInfo, TraceError> {
    let len = std::fs::metadata(path)?.len();
    let to = config.stop_offset.map_or(len, |stop| stop.min(len));
    Ok(ParsingInfo {
        from,
        to,
        position: from,
    })
}

impl TraceParser {
    /// Parse events from an already opened source
    pub fn from_source(
        source: Box<dyn EventSource + Send>,
        symbols: Arc<Symbols>,
        config: ParserConfig,
        info: ParsingInfo,
    ) -> Self {
        TraceParser {
            source,
            symbols,
            config,
            features: None,
            listeners: vec![],
            resume: None,
            info,
            label: "<memory>".to_string(),
        }
    }

    pub fn open_native(path: impl AsRef<Path>, symbols: Arc<Symbols>, config: ParserConfig) -> Result<Self, TraceError> {
        let path = path.as_ref();
        let decoder = NativeDecoder::new(BufReader::new(File::open(path)?), symbols.clone())?
            .lenient(config.lenient_decoding)
            .stop_at(config.stop_offset);
        let info = file_window(path, 0, &config)?;
        let mut parser = Self::from_source(Box::new(decoder), symbols, config, info);
        parser.label = path.display().to_string();
        Ok(parser)
    }

    /// Read a heap dump twice: once for its symbols, once for its events
    pub fn open_hprof(path: impl AsRef<Path>, config: ParserConfig) -> Result<Self, TraceError> {
        let path = path.as_ref();
        let start = Instant::now();
        let index = HprofSymbols::scan(
            BufReader::new(File::open(path)?),
            config.call_context,
            config.lenient_decoding,
        )?;
        debug!(
            "Symbol pass over {} took {} ms",
            path.display(),
            start.elapsed().as_millis()
        );
        let index = Arc::new(index);
        let symbols = index.symbols.clone();
        let decoder = HprofDecoder::new(BufReader::new(File::open(path)?), index)?
            .lenient(config.lenient_decoding)
            .stop_at(config.stop_offset);
        let info = file_window(path, 0, &config)?;
        let mut parser = Self::from_source(Box::new(decoder), symbols, config, info);
        parser.label = path.display().to_string();
        Ok(parser)
    }

    /// Continue a native trace from a checkpoint taken while parsing it
    pub fn resume_native(
        path: impl AsRef<Path>,
        symbols: Arc<Symbols>,
        checkpoint: Checkpoint,
        config: ParserConfig,
    ) -> Result<Self, TraceError> {
        let path = path.as_ref();
        if checkpoint.nonce != symbols.nonce {
            return Err(ProtocolError::HeaderMismatch {
                trace: checkpoint.nonce,
                symbols: symbols.nonce,
            }
            .into());
        }
        let decoder = NativeDecoder::resume(BufReader::new(File::open(path)?), symbols.clone(), checkpoint.offset)?
            .lenient(config.lenient_decoding)
            .stop_at(config.stop_offset);
        let info = file_window(path, checkpoint.offset, &config)?;
        let mut parser = Self::from_source(Box::new(decoder), symbols, config, info).resume_from(checkpoint);
        parser.label = path.display().to_string();
        Ok(parser)
    }

    /// Open either format, sniffing it from the file
    pub fn open(path: impl AsRef<Path>, symbols: Option<Arc<Symbols>>, config: ParserConfig) -> Result<Self, TraceError> {
        match (TraceFormat::detect(&path)?, symbols) {
            (TraceFormat::Hprof, _) => Self::open_hprof(path, config),
            (TraceFormat::Native, Some(symbols)) => Self::open_native(path, symbols, config),
            (TraceFormat::Native, None) => Err(TraceError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "native traces need a symbols file",
            ))),
        }
    }

    /// Start from a restored state instead of an empty heap
    #[must_use]
    pub fn resume_from(mut self, checkpoint: Checkpoint) -> Self {
        self.resume = Some(checkpoint);
        self
    }

    #[must_use]
    pub fn with_features(mut self, features: Arc<FeatureMap>) -> Self {
        self.features = Some(features);
        self
    }

    pub fn add_listener(&mut self, listener: Box<dyn PhaseListener>) {
        self.listeners.push(listener);
    }

    pub fn symbols(&self) -> &Arc<Symbols> {
        &self.symbols
    }

    pub fn info(&self) -> ParsingInfo {
        self.info
    }

    pub fn run(self) -> Result<ParseOutcome, TraceError> {
        self.run_with(&AtomicBool::new(false), &AtomicU64::new(0))
    }

    /// Run the parse on a worker thread
    pub fn spawn(self) -> ParseHandle {
        let cancel = Arc::new(AtomicBool::new(false));
        let position = Arc::new(AtomicU64::new(self.info.from));
        let info = self.info;
        let thread = {
            let cancel = cancel.clone();
            let position = position.clone();
            std::thread::spawn(move || self.run_with(&cancel, &position))
        };
        ParseHandle {
            cancel,
            position,
            info,
            thread,
        }
    }

    fn run_with(self, cancel: &AtomicBool, position: &AtomicU64) -> Result<ParseOutcome, TraceError> {
        let start = Instant::now();
        let TraceParser {
            mut source,
            symbols,
            config,
            features,
            listeners,
            resume,
            mut info,
            label,
        } = self;
        info!(
            "Parsing {} from offset {} ({} bytes)",
            label,
            info.from,
            info.to.saturating_sub(info.from)
        );

        let mut driver = Driver {
            builder: HeapGraphBuilder::new(config.consistency_check)
                .allow_dangling_after_death(source.allows_dangling_after_death())
                .max_reported(config.max_reported_violations),
            statistics: StatisticsAggregator::new(symbols.clone(), features, config.small_array_threshold),
            phase: PhaseMachine::new(source.allows_nested_cycles(), config.window),
            checkpoints: config.checkpoint.clone().map(CheckpointManager::new).transpose()?,
            symbols: symbols.clone(),
            cycles: 0,
        };
        let resumed_at = resume.as_ref().map(|checkpoint| checkpoint.offset);
        if let Some(checkpoint) = resume {
            info!(
                "Resuming after cycle {} with {} live objects",
                checkpoint.cycle,
                checkpoint.graph.len()
            );
            driver.builder = driver.builder.with_graph(checkpoint.graph);
            driver.statistics = driver.statistics.with_state(checkpoint.spaces, checkpoint.statistics);
            driver.phase = driver
                .phase
                .with_state(checkpoint.committed, checkpoint.open_cycles, checkpoint.last_start_id);
        }
        for listener in listeners {
            driver.phase.add_listener(listener);
        }

        let replayed = driver
            .open(resumed_at, info.from)
            .and_then(|()| driver.replay(source.as_mut(), cancel, position, &label));
        info.position = EventSource::position(source.as_ref());
        position.store(info.position, Ordering::Relaxed);
        let replayed = replayed.and_then(|events| driver.builder.finish(info.position).map(|()| events));
        let closed = driver.close(info.position, replayed.is_ok());
        let events = replayed?;
        closed?;

        let Driver {
            builder,
            statistics,
            checkpoints,
            cycles,
            ..
        } = driver;
        let checkpoints = match checkpoints {
            Some(manager) => manager.finish()?,
            None => vec![],
        };
        let (graph, report) = builder.into_parts();
        info!(
            "Parsed {}: {} events, {} cycles, {} live objects in {} ms",
            label,
            events,
            cycles,
            graph.len(),
            start.elapsed().as_millis()
        );
        if !report.is_clean() {
            warn!("{} consistency violations in {}", report.total(), label);
        }
        Ok(ParseOutcome {
            graph,
            statistics,
            report,
            symbols,
            info,
            cycles,
            events,
            checkpoints,
        })
    }
}

struct Driver {
    builder: HeapGraphBuilder,
    statistics: StatisticsAggregator,
    phase: PhaseMachine,
    checkpoints: Option<CheckpointManager>,
    symbols: Arc<Symbols>,
    cycles: u32,
}

impl Driver {
    /// Everything before the first real collection belongs to cycle 0. A
    /// resumed parse instead shows its listeners the cycle it resumes after.
    fn open(&mut self, resumed_at: Option<u64>, from: u64) -> Result<(), TraceError> {
        if let Some(offset) = resumed_at {
            if let Some(change) = self.phase.resumed_at(offset) {
                let ctx = PhaseContext {
                    change: &change,
                    graph: self.builder.graph(),
                    statistics: &self.statistics,
                };
                self.phase.notify_changing(&ctx)?;
                self.phase.notify_changed(&ctx)?;
            }
            return Ok(());
        }
        let initial = ParserGcInfo::artificial(0);
        let change = self.phase.begin(&initial, from)?;
        self.boundary(change, None)?;
        let change = self.phase.end(&initial, from)?;
        self.boundary(change, None)
    }

    /// Apply every event of `source`; returns how many were read
    fn replay(
        &mut self,
        source: &mut (dyn EventSource + Send),
        cancel: &AtomicBool,
        position: &AtomicU64,
        label: &str,
    ) -> Result<u64, TraceError> {
        let mut events = 0u64;
        while let Some(item) = source.next() {
            let traced = item?;
            if cancel.load(Ordering::Relaxed) {
                info!("Parse of {} cancelled at offset {}", label, traced.offset);
                return Err(TraceError::Cancelled(traced.offset));
            }
            position.store(traced.offset, Ordering::Relaxed);
            match &traced.event {
                Event::GcStart(gc) => {
                    let change = self.phase.begin(gc, traced.offset)?;
                    self.boundary(change, None)?;
                }
                Event::GcEnd(gc) => {
                    let change = self.phase.end(gc, traced.offset)?;
                    let resume_at = source.at_record_boundary().then(|| EventSource::position(&*source));
                    self.boundary(change, resume_at)?;
                }
                event => {
                    let effect = self.builder.apply(&traced)?;
                    self.statistics.observe(event, &effect);
                }
            }
            events += 1;
        }
        Ok(events)
    }

    fn close(&mut self, position: u64, completed: bool) -> Result<(), TraceError> {
        self.phase.notify_close(&CloseContext {
            graph: self.builder.graph(),
            statistics: &self.statistics,
            position,
            cycles: self.cycles,
            completed,
        })
    }

    /// `resume_at` is where a checkpoint taken at this boundary would
    /// continue decoding; `None` when no checkpoint may be taken here.
    fn boundary(&mut self, change: PhaseChange, resume_at: Option<u64>) -> Result<(), TraceError> {
        let gc = &change.next;
        debug!(
            "GC {:?} #{} ({:?}, {}{}) at offset {}",
            change.boundary,
            gc.id,
            gc.kind,
            gc.cause,
            if change.failed { ", failed" } else { "" },
            change.position
        );
        match change.boundary {
            Boundary::Start => self.builder.gc_started(gc),
            Boundary::End => self.builder.gc_finished(change.position)?,
        }
        self.phase.notify_changing(&PhaseContext {
            change: &change,
            graph: self.builder.graph(),
            statistics: &self.statistics,
        })?;
        self.phase.commit(&change);
        if change.boundary == Boundary::End {
            self.statistics.cycle_finished(gc);
            self.cycles += 1;
            if let (Some(manager), Some(offset)) = (self.checkpoints.as_mut(), resume_at) {
                if manager.should_capture(gc) {
                    let blob = Checkpoint::capture(
                        offset,
                        gc.id,
                        self.symbols.nonce,
                        self.symbols.heap_word_size,
                        &self.phase,
                        self.builder.graph(),
                        &self.statistics,
                    );
                    manager.submit(gc.id, blob)?;
                }
            }
        }
        self.phase.notify_changed(&PhaseContext {
            change: &change,
            graph: self.builder.graph(),
            statistics: &self.statistics,
        })
    }
}

/// A parse running on its own thread
pub struct ParseHandle {
    cancel: Arc<AtomicBool>,
    position: Arc<AtomicU64>,
    info: ParsingInfo,
    thread: JoinHandle<Result<ParseOutcome, TraceError>>,
}

impl ParseHandle {
    /// Ask the parse to stop before its next event
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Relaxed)
    }

    pub fn progress(&self) -> f64 {
        ParsingInfo {
            position: self.position(),
            ..self.info
        }
        .progress()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    pub fn join(self) -> Result<ParseOutcome, TraceError> {
        self.thread
            .join()
            .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
    }
}
