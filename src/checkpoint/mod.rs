//! Persisted snapshots of the parse state at cycle boundaries.
//!
//! The parsing thread copies the state into a [`CheckpointBlob`] and hands
//! it to a writer thread, so I/O never holds up graph mutation.

mod codec;

pub use codec::CheckpointBlob;

use crate::config::CheckpointPolicy;
use crate::constants::CHECKPOINT_FORMAT_VERSION;
use crate::error::TraceError;
use crate::heap::HeapGraph;
use crate::phase::PhaseMachine;
use crate::statistics::{SpaceStatistics, StatisticsAggregator};
use crate::trace::{ParserGcInfo, SpaceInfo};
use crossbeam::channel::{unbounded, Sender};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Instant;

/// A loaded snapshot, enough to continue a parse from `offset`
#[derive(Debug)]
pub struct Checkpoint {
    /// Trace offset of the first record after the captured boundary
    pub offset: u64,
    pub cycle: u32,
    pub nonce: u32,
    pub heap_word_size: u32,
    pub committed: Option<ParserGcInfo>,
    pub open_cycles: Vec<ParserGcInfo>,
    pub last_start_id: Option<u32>,
    pub graph: HeapGraph,
    pub spaces: Vec<SpaceInfo>,
    pub statistics: [SpaceStatistics; 4],
}

impl Checkpoint {
    pub fn file_name(cycle: u32) -> String {
        format!("checkpoint.{:08}.binpb.zst", cycle)
    }

    /// Copy the state of a parse into a blob
    pub fn capture(
        offset: u64,
        cycle: u32,
        nonce: u32,
        heap_word_size: u32,
        phase: &PhaseMachine,
        graph: &HeapGraph,
        statistics: &StatisticsAggregator,
    ) -> CheckpointBlob {
        let mut objects: Vec<_> = graph
            .objects()
            .map(|(addr, o)| codec::object_to_msg(addr, o))
            .collect();
        objects.sort_unstable_by_key(|o| o.addr);
        let mut generations: Vec<_> = graph.generations().iter().map(|(a, g)| (*a, *g)).collect();
        generations.sort_unstable();
        let mut roots: Vec<_> = graph.root_bindings().collect();
        roots.sort_unstable_by(|a, b| a.0.cmp(b.0));
        CheckpointBlob {
            version: CHECKPOINT_FORMAT_VERSION,
            offset,
            cycle,
            nonce,
            heap_word_size,
            committed: phase.committed().map(codec::gc_to_msg),
            open_cycles: phase.open_cycles().iter().map(codec::gc_to_msg).collect(),
            last_start_id: phase.last_start_id(),
            next_object_id: graph.next_id(),
            generation_addrs: generations.iter().map(|(a, _)| *a).collect(),
            generation_values: generations.iter().map(|(_, g)| *g).collect(),
            objects,
            roots: roots
                .into_iter()
                .map(|(root, targets)| codec::root_to_msg(root, targets))
                .collect(),
            spaces: statistics.spaces().iter().map(codec::space_to_msg).collect(),
            statistics: statistics.live_spaces().iter().map(codec::stats_to_msg).collect(),
        }
    }

    pub fn from_blob(blob: CheckpointBlob) -> Result<Checkpoint, TraceError> {
        if blob.version != CHECKPOINT_FORMAT_VERSION {
            return Err(TraceError::Checkpoint(format!(
                "unsupported checkpoint version {}",
                blob.version
            )));
        }
        if blob.generation_addrs.len() != blob.generation_values.len() {
            return Err(TraceError::Checkpoint("malformed checkpoint: generations".to_string()));
        }
        let generations: HashMap<_, _> = blob
            .generation_addrs
            .iter()
            .copied()
            .zip(blob.generation_values.iter().copied())
            .collect();
        let objects = blob
            .objects
            .into_iter()
            .map(codec::object_from_msg)
            .collect::<Result<Vec<_>, _>>()?;
        let roots = blob
            .roots
            .into_iter()
            .map(codec::root_from_msg)
            .collect::<Result<Vec<_>, _>>()?;
        let spaces = blob
            .spaces
            .into_iter()
            .map(codec::space_from_msg)
            .collect::<Result<Vec<_>, _>>()?;
        let stats = blob
            .statistics
            .into_iter()
            .map(codec::stats_from_msg)
            .collect::<Result<Vec<_>, _>>()?;
        let statistics: [SpaceStatistics; 4] = stats
            .try_into()
            .map_err(|_| TraceError::Checkpoint("malformed checkpoint: space statistics".to_string()))?;
        Ok(Checkpoint {
            offset: blob.offset,
            cycle: blob.cycle,
            nonce: blob.nonce,
            heap_word_size: blob.heap_word_size,
            committed: blob.committed.map(codec::gc_from_msg),
            open_cycles: blob.open_cycles.into_iter().map(codec::gc_from_msg).collect(),
            last_start_id: blob.last_start_id,
            graph: HeapGraph::restore(blob.next_object_id, generations, objects, roots),
            spaces,
            statistics,
        })
    }

    pub fn from_binpb_zst(p: impl AsRef<Path>) -> Result<Checkpoint, TraceError> {
        let start = Instant::now();
        let checkpoint = Self::from_blob(CheckpointBlob::from_binpb_zst(&p)?)?;
        info!(
            "Loaded checkpoint {} (cycle {}, {} objects) in {} ms",
            p.as_ref().display(),
            checkpoint.cycle,
            checkpoint.graph.len(),
            start.elapsed().as_millis()
        );
        Ok(checkpoint)
    }
}

/// Decides which completed cycles are captured and persists them in the
/// background, pruning the oldest files beyond the configured count.
pub struct CheckpointManager {
    policy: CheckpointPolicy,
    eligible: u32,
    sender: Option<Sender<(u32, CheckpointBlob)>>,
    writer: Option<JoinHandle<Result<Vec<PathBuf>, TraceError>>>,
}

impl CheckpointManager {
    pub fn new(policy: CheckpointPolicy) -> Result<Self, TraceError> {
        fs::create_dir_all(&policy.directory)?;
        let (sender, receiver) = unbounded::<(u32, CheckpointBlob)>();
        let directory = policy.directory.clone();
        let keep = policy.keep;
        let writer = std::thread::spawn(move || -> Result<Vec<PathBuf>, TraceError> {
            let mut written: VecDeque<PathBuf> = VecDeque::new();
            for (cycle, blob) in receiver {
                let start = Instant::now();
                let path = directory.join(Checkpoint::file_name(cycle));
                blob.write_binpb_zst(&path)?;
                info!(
                    "Wrote checkpoint {} ({} objects) in {} ms",
                    path.display(),
                    blob.objects.len(),
                    start.elapsed().as_millis()
                );
                written.retain(|p| *p != path);
                written.push_back(path);
                while keep > 0 && written.len() > keep {
                    if let Some(old) = written.pop_front() {
                        fs::remove_file(&old)?;
                        info!("Pruned checkpoint {}", old.display());
                    }
                }
            }
            Ok(written.into_iter().collect())
        });
        Ok(CheckpointManager {
            policy,
            eligible: 0,
            sender: Some(sender),
            writer: Some(writer),
        })
    }

    pub fn policy(&self) -> &CheckpointPolicy {
        &self.policy
    }

    /// Called once per completed cycle; counts it towards the interval
    pub fn should_capture(&mut self, gc: &ParserGcInfo) -> bool {
        if gc.is_artificial() || (self.policy.major_only && !gc.kind.is_full()) {
            return false;
        }
        self.eligible += 1;
        self.eligible % self.policy.every_n_cycles.max(1) == 0
    }

    pub fn submit(&self, cycle: u32, blob: CheckpointBlob) -> Result<(), TraceError> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| TraceError::Checkpoint("writer already finished".to_string()))?;
        sender
            .send((cycle, blob))
            .map_err(|_| TraceError::Checkpoint("checkpoint writer stopped".to_string()))
    }

    /// Wait for pending writes; returns the retained files, oldest first
    pub fn finish(mut self) -> Result<Vec<PathBuf>, TraceError> {
        self.join()
    }

    fn join(&mut self) -> Result<Vec<PathBuf>, TraceError> {
        drop(self.sender.take());
        match self.writer.take() {
            Some(writer) => writer
                .join()
                .map_err(|_| TraceError::Checkpoint("checkpoint writer panicked".to_string()))?,
            None => Ok(vec![]),
        }
    }
}

impl Drop for CheckpointManager {
    fn drop(&mut self) {
        if let Err(e) = self.join() {
            error!("{}", e);
        }
    }
}
