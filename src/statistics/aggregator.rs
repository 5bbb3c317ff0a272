use super::{CycleStatistics, SpaceDelta, SpaceStatistics};
use crate::heap::{Effect, ObjectRecord};
use crate::symbols::features::FeatureSet;
use crate::symbols::{FeatureMap, Symbols, OTHERS_FEATURE};
use crate::trace::{Address, Event, ParserGcInfo, SpaceInfo, SpaceKind};
use smallvec::smallvec;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// Keeps per-space statistics of the live heap up to date from builder
/// effects, without holding on to the objects.
pub struct StatisticsAggregator {
    symbols: Arc<Symbols>,
    features: Option<Arc<FeatureMap>>,
    /// Sorted by start address, non-overlapping
    spaces: Vec<SpaceInfo>,
    feature_cache: HashMap<u32, FeatureSet>,
    small_array_threshold: u32,
    live: [SpaceStatistics; 4],
    current: [SpaceDelta; 4],
    history: Vec<CycleStatistics>,
}

impl StatisticsAggregator {
    pub fn new(symbols: Arc<Symbols>, features: Option<Arc<FeatureMap>>, small_array_threshold: u32) -> Self {
        StatisticsAggregator {
            symbols,
            features,
            spaces: vec![],
            feature_cache: HashMap::new(),
            small_array_threshold,
            live: Default::default(),
            current: Default::default(),
            history: vec![],
        }
    }

    /// Continue from persisted spaces and live statistics
    #[must_use]
    pub fn with_state(mut self, spaces: Vec<SpaceInfo>, live: [SpaceStatistics; 4]) -> Self {
        for space in spaces {
            self.add_space(space);
        }
        self.live = live;
        self
    }

    pub fn spaces(&self) -> &[SpaceInfo] {
        &self.spaces
    }

    pub fn live(&self, kind: SpaceKind) -> &SpaceStatistics {
        &self.live[kind.index()]
    }

    pub fn live_spaces(&self) -> &[SpaceStatistics; 4] {
        &self.live
    }

    pub fn live_total(&self) -> SpaceStatistics {
        self.live.iter().fold(SpaceStatistics::default(), |mut total, s| {
            total.merge(s);
            total
        })
    }

    pub fn history(&self) -> &[CycleStatistics] {
        &self.history
    }

    /// Changes since the last completed cycle
    pub fn pending(&self) -> &[SpaceDelta; 4] {
        &self.current
    }

    fn add_space(&mut self, space: SpaceInfo) {
        self.spaces.retain(|s| s.index != space.index);
        let at = self.spaces.partition_point(|s| s.start < space.start);
        self.spaces.insert(at, space);
    }

    pub fn space_of(&self, addr: Address) -> SpaceKind {
        self.spaces
            .binary_search_by(|s| {
                if addr < s.start {
                    Ordering::Greater
                } else if addr >= s.end() {
                    Ordering::Less
                } else {
                    Ordering::Equal
                }
            })
            .map_or(SpaceKind::Undefined, |i| self.spaces[i].kind)
    }

    fn features_of(&mut self, site: u32) -> FeatureSet {
        let Some(features) = &self.features else {
            return smallvec![OTHERS_FEATURE];
        };
        let symbols = &self.symbols;
        self.feature_cache
            .entry(site)
            .or_insert_with(|| match symbols.site(site) {
                Some(s) => features.classify(s),
                None => smallvec![OTHERS_FEATURE],
            })
            .clone()
    }

    fn add(&mut self, space: SpaceKind, record: &ObjectRecord) {
        let features = self.features_of(record.site);
        let kind = record.object_kind(self.small_array_threshold);
        self.live[space.index()].record(record, kind, &features);
        self.current[space.index()].added.record(record, kind, &features);
    }

    fn remove(&mut self, space: SpaceKind, record: &ObjectRecord) {
        let features = self.features_of(record.site);
        let kind = record.object_kind(self.small_array_threshold);
        self.live[space.index()].release(record, kind, &features);
        self.current[space.index()].removed.record(record, kind, &features);
    }

    pub fn observe(&mut self, event: &Event, effect: &Effect) {
        if let Event::SpaceCreate(space) = event {
            debug!(
                "Space {} ({}) at {:#x}..{:#x}",
                space.index,
                space.kind.name(),
                space.start,
                space.end()
            );
            self.add_space(*space);
            return;
        }
        match effect {
            Effect::None => {}
            Effect::Allocated { addr, record, evicted } => {
                let space = self.space_of(*addr);
                if let Some(evicted) = evicted {
                    self.remove(space, evicted);
                }
                self.add(space, record);
            }
            Effect::Moved {
                from,
                to,
                record,
                evicted,
            } => {
                let (source, destination) = (self.space_of(*from), self.space_of(*to));
                if let Some(evicted) = evicted {
                    self.remove(destination, evicted);
                }
                if source != destination {
                    self.remove(source, record);
                    self.add(destination, record);
                }
            }
            Effect::Died { addr, record } => {
                let space = self.space_of(*addr);
                self.remove(space, record);
            }
        }
    }

    /// Close the statistics of the cycle that just ended
    pub fn cycle_finished(&mut self, gc: &ParserGcInfo) {
        let spaces = std::mem::take(&mut self.current);
        self.history.push(CycleStatistics {
            gc: gc.clone(),
            spaces,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{test_allocation, HeapGraphBuilder};
    use crate::statistics::{cumulative, MemoryConsumption};
    use crate::trace::TracedEvent;

    fn space(index: u32, kind: SpaceKind, start: u64, size: u64) -> Event {
        Event::SpaceCreate(SpaceInfo {
            index,
            kind,
            start,
            size,
        })
    }

    fn run(aggregator: &mut StatisticsAggregator, builder: &mut HeapGraphBuilder, events: Vec<Event>) {
        for (i, event) in events.into_iter().enumerate() {
            let traced = TracedEvent {
                offset: i as u64,
                event,
            };
            let effect = builder.apply(&traced).unwrap();
            aggregator.observe(&traced.event, &effect);
        }
    }

    #[test]
    fn test_space_lookup() {
        let mut a = StatisticsAggregator::new(Arc::new(Symbols::new(8)), None, 256);
        let mut b = HeapGraphBuilder::new(true);
        run(
            &mut a,
            &mut b,
            vec![
                space(2, SpaceKind::Old, 0x10000, 0x10000),
                space(0, SpaceKind::Eden, 0x1000, 0x1000),
                space(1, SpaceKind::Survivor, 0x2000, 0x1000),
            ],
        );
        assert_eq!(a.space_of(0x1000), SpaceKind::Eden);
        assert_eq!(a.space_of(0x2fff), SpaceKind::Survivor);
        assert_eq!(a.space_of(0x3000), SpaceKind::Undefined);
        assert_eq!(a.space_of(0x18000), SpaceKind::Old);
        assert_eq!(a.space_of(0x10), SpaceKind::Undefined);
        // redeclaring a space replaces it
        run(&mut a, &mut b, vec![space(0, SpaceKind::Eden, 0x1000, 0x800)]);
        assert_eq!(a.space_of(0x1900), SpaceKind::Undefined);
        assert_eq!(a.spaces().len(), 3);
    }

    #[test]
    fn test_promotion_between_spaces() {
        let mut a = StatisticsAggregator::new(Arc::new(Symbols::new(8)), None, 256);
        let mut b = HeapGraphBuilder::new(true);
        run(
            &mut a,
            &mut b,
            vec![
                space(0, SpaceKind::Eden, 0x1000, 0x1000),
                space(2, SpaceKind::Old, 0x10000, 0x10000),
                Event::Allocate(test_allocation(0x1000, 16)),
                Event::Allocate(test_allocation(0x1010, 32)),
            ],
        );
        a.cycle_finished(&ParserGcInfo::artificial(0));
        run(
            &mut a,
            &mut b,
            vec![
                Event::Move { from: 0x1000, to: 0x10000 },
                Event::Die { addr: 0x1010 },
            ],
        );
        assert_eq!(a.live(SpaceKind::Eden).memory, MemoryConsumption::new(0, 0));
        assert_eq!(a.live(SpaceKind::Old).memory, MemoryConsumption::new(1, 16));
        a.cycle_finished(&ParserGcInfo::artificial(1));

        assert_eq!(a.history().len(), 2);
        let eden = cumulative(a.history(), SpaceKind::Eden);
        assert_eq!(eden.added.memory, MemoryConsumption::new(2, 48));
        assert_eq!(eden.removed.memory, MemoryConsumption::new(2, 48));
        let old = cumulative(a.history(), SpaceKind::Old);
        assert_eq!(old.net(), *a.live(SpaceKind::Old));
        assert_eq!(a.live_total().memory, MemoryConsumption::new(1, 16));
    }

    #[test]
    fn test_features_by_site() {
        let mut symbols = Symbols::new(8);
        symbols.insert_site(crate::symbols::AllocationSite {
            id: 10,
            allocated_type: Some(1),
            call_sites: vec![crate::symbols::CallSite {
                declaring_type: "com.foo.Bar".to_string(),
                method: "make".to_string(),
                params: String::new(),
                bci: 0,
            }],
        });
        let features = FeatureMap::parse("Net(10 20 30) { com.foo.* }").unwrap();
        let net = features.by_name("Net").unwrap().id;
        let mut a = StatisticsAggregator::new(Arc::new(symbols), Some(Arc::new(features)), 256);
        let mut b = HeapGraphBuilder::new(true);
        let mut elsewhere = test_allocation(0x20, 8);
        elsewhere.site = 11;
        run(
            &mut a,
            &mut b,
            vec![Event::Allocate(test_allocation(0x10, 16)), Event::Allocate(elsewhere)],
        );
        let undefined = a.live(SpaceKind::Undefined);
        assert_eq!(undefined.features[net], MemoryConsumption::new(1, 16));
        assert_eq!(undefined.features[OTHERS_FEATURE], MemoryConsumption::new(1, 8));
    }
}
