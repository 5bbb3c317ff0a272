//! Per-space counters maintained from the event stream.
//!
//! Every counter is a plain sum, so [`SpaceStatistics::merge`] is
//! associative and commutative and per-cycle deltas roll up into totals
//! without revisiting objects.

use crate::heap::{ObjectKind, ObjectRecord};
use crate::trace::{AllocKind, ParserGcInfo, SpaceKind};

mod aggregator;

pub use aggregator::StatisticsAggregator;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct MemoryConsumption {
    pub objects: u64,
    pub bytes: u64,
}

impl MemoryConsumption {
    pub fn new(objects: u64, bytes: u64) -> Self {
        MemoryConsumption { objects, bytes }
    }

    fn add(&mut self, bytes: u64) {
        self.objects += 1;
        self.bytes += bytes;
    }

    fn release(&mut self, bytes: u64) {
        self.objects = self.objects.saturating_sub(1);
        self.bytes = self.bytes.saturating_sub(bytes);
    }

    pub fn merge(&mut self, other: &MemoryConsumption) {
        self.objects += other.objects;
        self.bytes += other.bytes;
    }

    pub fn saturating_sub(&self, other: &MemoryConsumption) -> MemoryConsumption {
        MemoryConsumption {
            objects: self.objects.saturating_sub(other.objects),
            bytes: self.bytes.saturating_sub(other.bytes),
        }
    }
}

/// Object counts by allocating subsystem
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocatorBreakdown {
    pub vm: u64,
    pub ir: u64,
    pub c1: u64,
    pub c2: u64,
    /// Objects read from a heap dump
    pub dump: u64,
}

impl AllocatorBreakdown {
    fn counter(&mut self, kind: AllocKind) -> &mut u64 {
        match kind {
            AllocKind::VmSlow => &mut self.vm,
            AllocKind::Interpreter => &mut self.ir,
            AllocKind::C1 => &mut self.c1,
            AllocKind::C2 => &mut self.c2,
            AllocKind::Dump => &mut self.dump,
        }
    }

    fn as_array(&self) -> [u64; 5] {
        [self.vm, self.ir, self.c1, self.c2, self.dump]
    }

    fn from_array(a: [u64; 5]) -> Self {
        AllocatorBreakdown {
            vm: a[0],
            ir: a[1],
            c1: a[2],
            c2: a[3],
            dump: a[4],
        }
    }

    pub fn merge(&mut self, other: &AllocatorBreakdown) {
        let (a, b) = (self.as_array(), other.as_array());
        *self = Self::from_array(std::array::from_fn(|i| a[i] + b[i]));
    }

    pub fn saturating_sub(&self, other: &AllocatorBreakdown) -> AllocatorBreakdown {
        let (a, b) = (self.as_array(), other.as_array());
        Self::from_array(std::array::from_fn(|i| a[i].saturating_sub(b[i])))
    }
}

/// Object counts by shape
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ObjectKindBreakdown {
    pub instances: u64,
    pub small_arrays: u64,
    pub big_arrays: u64,
}

impl ObjectKindBreakdown {
    fn counter(&mut self, kind: ObjectKind) -> &mut u64 {
        match kind {
            ObjectKind::Instance => &mut self.instances,
            ObjectKind::SmallArray => &mut self.small_arrays,
            ObjectKind::BigArray => &mut self.big_arrays,
        }
    }

    pub fn merge(&mut self, other: &ObjectKindBreakdown) {
        self.instances += other.instances;
        self.small_arrays += other.small_arrays;
        self.big_arrays += other.big_arrays;
    }

    pub fn saturating_sub(&self, other: &ObjectKindBreakdown) -> ObjectKindBreakdown {
        ObjectKindBreakdown {
            instances: self.instances.saturating_sub(other.instances),
            small_arrays: self.small_arrays.saturating_sub(other.small_arrays),
            big_arrays: self.big_arrays.saturating_sub(other.big_arrays),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SpaceStatistics {
    pub memory: MemoryConsumption,
    pub allocators: AllocatorBreakdown,
    pub object_kinds: ObjectKindBreakdown,
    /// Indexed by feature id; missing trailing entries count as zero
    pub features: Vec<MemoryConsumption>,
}

impl PartialEq for SpaceStatistics {
    fn eq(&self, other: &Self) -> bool {
        let len = self.features.len().max(other.features.len());
        let feature = |s: &SpaceStatistics, i: usize| s.features.get(i).copied().unwrap_or_default();
        self.memory == other.memory
            && self.allocators == other.allocators
            && self.object_kinds == other.object_kinds
            && (0..len).all(|i| feature(self, i) == feature(other, i))
    }
}

impl Eq for SpaceStatistics {}

impl SpaceStatistics {
    pub fn is_empty(&self) -> bool {
        *self == SpaceStatistics::default()
    }

    fn feature_mut(&mut self, id: usize) -> &mut MemoryConsumption {
        if self.features.len() <= id {
            self.features.resize(id + 1, MemoryConsumption::default());
        }
        &mut self.features[id]
    }

    pub fn record(&mut self, record: &ObjectRecord, kind: ObjectKind, features: &[usize]) {
        self.memory.add(record.size);
        *self.allocators.counter(record.kind) += 1;
        *self.object_kinds.counter(kind) += 1;
        for id in features {
            self.feature_mut(*id).add(record.size);
        }
    }

    pub fn release(&mut self, record: &ObjectRecord, kind: ObjectKind, features: &[usize]) {
        self.memory.release(record.size);
        let allocator = self.allocators.counter(record.kind);
        *allocator = allocator.saturating_sub(1);
        let object_kind = self.object_kinds.counter(kind);
        *object_kind = object_kind.saturating_sub(1);
        for id in features {
            self.feature_mut(*id).release(record.size);
        }
    }

    pub fn merge(&mut self, other: &SpaceStatistics) {
        self.memory.merge(&other.memory);
        self.allocators.merge(&other.allocators);
        self.object_kinds.merge(&other.object_kinds);
        for (id, f) in other.features.iter().enumerate() {
            self.feature_mut(id).merge(f);
        }
    }

    pub fn saturating_sub(&self, other: &SpaceStatistics) -> SpaceStatistics {
        let len = self.features.len().max(other.features.len());
        let features = (0..len)
            .map(|i| {
                let a = self.features.get(i).copied().unwrap_or_default();
                let b = other.features.get(i).copied().unwrap_or_default();
                a.saturating_sub(&b)
            })
            .collect();
        SpaceStatistics {
            memory: self.memory.saturating_sub(&other.memory),
            allocators: self.allocators.saturating_sub(&other.allocators),
            object_kinds: self.object_kinds.saturating_sub(&other.object_kinds),
            features,
        }
    }
}

/// Objects that entered and left one space during a cycle
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpaceDelta {
    pub added: SpaceStatistics,
    pub removed: SpaceStatistics,
}

impl SpaceDelta {
    pub fn merge(&mut self, other: &SpaceDelta) {
        self.added.merge(&other.added);
        self.removed.merge(&other.removed);
    }

    pub fn net(&self) -> SpaceStatistics {
        self.added.saturating_sub(&self.removed)
    }
}

/// Statistics of one completed cycle, indexed by [`SpaceKind::index`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CycleStatistics {
    pub gc: ParserGcInfo,
    pub spaces: [SpaceDelta; 4],
}

impl CycleStatistics {
    pub fn space(&self, kind: SpaceKind) -> &SpaceDelta {
        &self.spaces[kind.index()]
    }
}

/// Fold per-cycle deltas of one space into a cumulative total
pub fn cumulative<'a>(cycles: impl IntoIterator<Item = &'a CycleStatistics>, kind: SpaceKind) -> SpaceDelta {
    cycles.into_iter().fold(SpaceDelta::default(), |mut total, cycle| {
        total.merge(cycle.space(kind));
        total
    })
}
