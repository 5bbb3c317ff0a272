use super::{HeapGraph, ObjRef, ObjectRecord};
use crate::error::{ConsistencyError, TraceError, ViolationKind};
use crate::trace::{Address, Event, ParserGcInfo, TracedEvent};
use std::collections::HashSet;

/// What one event did to the graph
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Effect {
    None,
    Allocated {
        addr: Address,
        record: ObjectRecord,
        evicted: Option<ObjectRecord>,
    },
    Moved {
        from: Address,
        to: Address,
        record: ObjectRecord,
        evicted: Option<ObjectRecord>,
    },
    Died {
        addr: Address,
        record: ObjectRecord,
    },
}

/// Violations counted in lenient mode
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub dangling_pointers: u64,
    pub roots_to_dead_objects: u64,
    pub orphaned_addresses: u64,
    /// The first few violations in the order they were found
    pub samples: Vec<ConsistencyError>,
}

impl ConsistencyReport {
    pub fn count(&self, kind: ViolationKind) -> u64 {
        match kind {
            ViolationKind::DanglingPointer => self.dangling_pointers,
            ViolationKind::RootToDeadObject => self.roots_to_dead_objects,
            ViolationKind::OrphanedAddress => self.orphaned_addresses,
        }
    }

    pub fn total(&self) -> u64 {
        self.dangling_pointers + self.roots_to_dead_objects + self.orphaned_addresses
    }

    pub fn is_clean(&self) -> bool {
        self.total() == 0
    }

    fn record(&mut self, error: ConsistencyError, max_samples: usize) {
        match error.kind {
            ViolationKind::DanglingPointer => self.dangling_pointers += 1,
            ViolationKind::RootToDeadObject => self.roots_to_dead_objects += 1,
            ViolationKind::OrphanedAddress => self.orphaned_addresses += 1,
        }
        if self.samples.len() < max_samples {
            warn!("{}", error);
            self.samples.push(error);
        } else if self.total() == max_samples as u64 + 1 {
            warn!("Further consistency violations are counted but not logged");
        }
    }
}

/// Applies events to the [`HeapGraph`] it owns and checks the graph at
/// cycle boundaries.
pub struct HeapGraphBuilder {
    graph: HeapGraph,
    strict: bool,
    dangling_after_death: bool,
    max_samples: usize,
    report: ConsistencyReport,
    died_this_cycle: HashSet<ObjRef>,
    /// Violations found at the last check, so a lasting one is counted once
    reported: HashSet<(ViolationKind, ObjRef)>,
    /// A collection started and has not reported a root yet
    roots_stale: bool,
}

impl HeapGraphBuilder {
    pub fn new(strict: bool) -> Self {
        HeapGraphBuilder {
            graph: HeapGraph::new(),
            strict,
            dangling_after_death: false,
            max_samples: 16,
            report: ConsistencyReport::default(),
            died_this_cycle: HashSet::new(),
            reported: HashSet::new(),
            roots_stale: false,
        }
    }

    /// Pointers to an object that died may survive until the next boundary
    #[must_use]
    pub fn allow_dangling_after_death(mut self, allow: bool) -> Self {
        self.dangling_after_death = allow;
        self
    }

    #[must_use]
    pub fn max_reported(mut self, n: usize) -> Self {
        self.max_samples = n;
        self
    }

    /// Continue from a restored graph
    #[must_use]
    pub fn with_graph(mut self, graph: HeapGraph) -> Self {
        self.graph = graph;
        self
    }

    pub fn graph(&self) -> &HeapGraph {
        &self.graph
    }

    pub fn report(&self) -> &ConsistencyReport {
        &self.report
    }

    pub fn into_parts(self) -> (HeapGraph, ConsistencyReport) {
        (self.graph, self.report)
    }

    fn violation(&mut self, kind: ViolationKind, addr: Address, offset: u64) -> Result<(), TraceError> {
        let error = ConsistencyError { kind, addr, offset };
        if self.strict {
            return Err(error.into());
        }
        self.report.record(error, self.max_samples);
        Ok(())
    }

    pub fn apply(&mut self, traced: &TracedEvent) -> Result<Effect, TraceError> {
        let offset = traced.offset;
        let effect = match &traced.event {
            Event::Allocate(alloc) => {
                let occupant = self.graph.object_ref(alloc.addr);
                let (record, evicted) = self.graph.allocate(alloc);
                if let Some(occupant) = occupant {
                    self.died_this_cycle.insert(occupant);
                }
                Effect::Allocated {
                    addr: alloc.addr,
                    record,
                    evicted,
                }
            }
            Event::Move { from, to } => {
                let occupant = self.graph.object_ref(*to);
                match self.graph.relocate(*from, *to) {
                    Some((record, evicted)) => {
                        if let (Some(occupant), Some(_)) = (occupant, evicted) {
                            self.died_this_cycle.insert(occupant);
                        }
                        Effect::Moved {
                            from: *from,
                            to: *to,
                            record,
                            evicted,
                        }
                    }
                    None => {
                        self.violation(ViolationKind::OrphanedAddress, *from, offset)?;
                        Effect::None
                    }
                }
            }
            Event::Die { addr } => {
                let this = self.graph.object_ref(*addr);
                match (this, self.graph.remove(*addr)) {
                    (Some(this), Some(record)) => {
                        self.died_this_cycle.insert(this);
                        Effect::Died { addr: *addr, record }
                    }
                    _ => {
                        self.violation(ViolationKind::OrphanedAddress, *addr, offset)?;
                        Effect::None
                    }
                }
            }
            Event::PointerUpdate { addr, slot, target } => {
                if !self.graph.set_pointer(*addr, *slot, *target) {
                    self.violation(ViolationKind::OrphanedAddress, *addr, offset)?;
                }
                Effect::None
            }
            Event::RootUpdate { root, target } => {
                if std::mem::take(&mut self.roots_stale) {
                    self.graph.clear_roots();
                }
                self.graph.bind_root(root, *target);
                Effect::None
            }
            Event::GcStart(_) | Event::GcEnd(_) | Event::SpaceCreate(_) => Effect::None,
        };
        Ok(effect)
    }

    /// Roots are reported afresh by every real collection. The previous
    /// set stays visible until the first new root arrives.
    pub fn gc_started(&mut self, info: &ParserGcInfo) {
        if !info.is_artificial() {
            self.roots_stale = true;
        }
    }

    /// A cycle that reported no roots keeps the previous set
    pub fn gc_finished(&mut self, offset: u64) -> Result<(), TraceError> {
        self.roots_stale = false;
        self.check(offset)
    }

    pub fn finish(&mut self, offset: u64) -> Result<(), TraceError> {
        self.check(offset)
    }

    /// Look for pointers and roots toward objects that are not live. A
    /// violation is reported when it first appears and again only if it
    /// recurs after having been resolved.
    fn check(&mut self, offset: u64) -> Result<(), TraceError> {
        let tolerated = |t: &ObjRef| self.dangling_after_death && self.died_this_cycle.contains(t);
        let mut found: Vec<(ViolationKind, ObjRef)> = self
            .graph
            .dangling()
            .map(|(t, _)| t)
            .filter(|t| !tolerated(t))
            .map(|t| (ViolationKind::DanglingPointer, t))
            .collect();
        found.extend(
            self.graph
                .dead_roots()
                .map(|(_, r)| (ViolationKind::RootToDeadObject, r)),
        );
        found.sort_unstable();
        self.died_this_cycle.clear();
        let previous = std::mem::take(&mut self.reported);
        for (kind, target) in found {
            self.reported.insert((kind, target));
            if !previous.contains(&(kind, target)) {
                self.violation(kind, target.addr, offset)?;
            }
        }
        if cfg!(feature = "verify_transpose") && !crate::sanity::verify_transpose(&self.graph) {
            error!("Incoming index is not the transpose of the slots at offset {}", offset);
        }
        Ok(())
    }
}
