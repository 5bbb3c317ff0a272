use crate::heap::{HeapGraph, ObjectKind, ObjectRecord};
use crate::statistics::MemoryConsumption;
use crate::symbols::{FeatureMap, Symbols, OTHERS_FEATURE};
use clap::ValueEnum;
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

/// Maps a live object to the label of the bucket it is counted in
pub trait Classifier: Sync {
    fn name(&self) -> &str;
    fn classify(&self, object: &ObjectRecord) -> String;
}

pub struct ByType {
    symbols: Arc<Symbols>,
}

impl ByType {
    pub fn new(symbols: Arc<Symbols>) -> Self {
        ByType { symbols }
    }
}

impl Classifier for ByType {
    fn name(&self) -> &str {
        "type"
    }

    fn classify(&self, object: &ObjectRecord) -> String {
        match self.symbols.allocated_type(object.type_id) {
            Some(ty) => ty.external_name(),
            None => format!("<type {}>", object.type_id),
        }
    }
}

/// Buckets by the immediate allocating frame
pub struct BySite {
    symbols: Arc<Symbols>,
}

impl BySite {
    pub fn new(symbols: Arc<Symbols>) -> Self {
        BySite { symbols }
    }
}

impl Classifier for BySite {
    fn name(&self) -> &str {
        "site"
    }

    fn classify(&self, object: &ObjectRecord) -> String {
        match self.symbols.site(object.site).and_then(|s| s.immediate()) {
            Some(frame) => frame.to_string(),
            None => format!("<site {}>", object.site),
        }
    }
}

pub struct ByFeature {
    symbols: Arc<Symbols>,
    features: Arc<FeatureMap>,
}

impl ByFeature {
    pub fn new(symbols: Arc<Symbols>, features: Arc<FeatureMap>) -> Self {
        ByFeature { symbols, features }
    }
}

impl Classifier for ByFeature {
    fn name(&self) -> &str {
        "feature"
    }

    fn classify(&self, object: &ObjectRecord) -> String {
        let ids = match self.symbols.site(object.site) {
            Some(site) => self.features.classify(site),
            None => smallvec::smallvec![OTHERS_FEATURE],
        };
        ids.iter()
            .filter_map(|id| self.features.get(*id))
            .map(|f| f.name.as_str())
            .collect::<Vec<_>>()
            .join("+")
    }
}

pub struct ByAllocator;

impl Classifier for ByAllocator {
    fn name(&self) -> &str {
        "allocator"
    }

    fn classify(&self, object: &ObjectRecord) -> String {
        object.kind.name().to_string()
    }
}

pub struct ByObjectKind {
    threshold: u32,
}

impl ByObjectKind {
    pub fn new(threshold: u32) -> Self {
        ByObjectKind { threshold }
    }
}

impl Classifier for ByObjectKind {
    fn name(&self) -> &str {
        "kind"
    }

    fn classify(&self, object: &ObjectRecord) -> String {
        match object.object_kind(self.threshold) {
            ObjectKind::Instance => "instance",
            ObjectKind::SmallArray => "small array",
            ObjectKind::BigArray => "big array",
        }
        .to_string()
    }
}

type Predicate = Box<dyn Fn(&ObjectRecord) -> bool + Send + Sync>;

/// First matching rule wins; unmatched objects go to the fallback label
pub struct RuleClassifier {
    name: String,
    rules: Vec<(String, Predicate)>,
    fallback: String,
}

impl RuleClassifier {
    pub fn new(name: impl Into<String>, fallback: impl Into<String>) -> Self {
        RuleClassifier {
            name: name.into(),
            rules: vec![],
            fallback: fallback.into(),
        }
    }

    #[must_use]
    pub fn rule(
        mut self,
        label: impl Into<String>,
        predicate: impl Fn(&ObjectRecord) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.rules.push((label.into(), Box::new(predicate)));
        self
    }

    /// Buckets by object size, in powers of four from 16 bytes
    pub fn by_size() -> Self {
        [16u64, 64, 256, 1024, 4096]
            .into_iter()
            .fold(RuleClassifier::new("size", "> 4096 B"), |c, limit| {
                c.rule(format!("<= {} B", limit), move |o| o.size <= limit)
            })
    }
}

impl Classifier for RuleClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn classify(&self, object: &ObjectRecord) -> String {
        self.rules
            .iter()
            .find(|(_, matches)| matches(object))
            .map_or(&self.fallback, |(label, _)| label)
            .clone()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum, Debug)]
#[clap(rename_all = "verbatim")]
pub enum ClassifierChoice {
    Type,
    Site,
    Feature,
    Allocator,
    Kind,
    Size,
}

impl ClassifierChoice {
    pub fn build(
        self,
        symbols: Arc<Symbols>,
        features: Option<Arc<FeatureMap>>,
        small_array_threshold: u32,
    ) -> anyhow::Result<Box<dyn Classifier>> {
        Ok(match self {
            ClassifierChoice::Type => Box::new(ByType::new(symbols)),
            ClassifierChoice::Site => Box::new(BySite::new(symbols)),
            ClassifierChoice::Feature => {
                let features = features.ok_or_else(|| anyhow::anyhow!("classifying by feature needs --features"))?;
                Box::new(ByFeature::new(symbols, features))
            }
            ClassifierChoice::Allocator => Box::new(ByAllocator),
            ClassifierChoice::Kind => Box::new(ByObjectKind::new(small_array_threshold)),
            ClassifierChoice::Size => Box::new(RuleClassifier::by_size()),
        })
    }
}

type CountMap = HashMap<String, MemoryConsumption>;

fn merge_counts(count_a: &mut CountMap, count_b: &CountMap) {
    for (key, val) in count_b.iter() {
        count_a.entry(key.clone()).or_default().merge(val);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Histogram {
    pub buckets: CountMap,
}

impl Histogram {
    /// Classify every live object in parallel
    pub fn of(graph: &HeapGraph, classifier: &dyn Classifier) -> Histogram {
        let records: Vec<&ObjectRecord> = graph.objects().map(|(_, o)| &o.record).collect();
        let buckets = records
            .par_iter()
            .fold(HashMap::new, |mut partial_count: CountMap, record| {
                partial_count
                    .entry(classifier.classify(record))
                    .or_default()
                    .merge(&MemoryConsumption::new(1, record.size));
                partial_count
            })
            .reduce(HashMap::new, |mut count_a: CountMap, count_b: CountMap| {
                merge_counts(&mut count_a, &count_b);
                count_a
            });
        Histogram { buckets }
    }

    pub fn total(&self) -> MemoryConsumption {
        self.buckets.values().fold(MemoryConsumption::default(), |mut t, m| {
            t.merge(m);
            t
        })
    }

    /// Largest buckets by bytes first
    pub fn sorted(&self) -> Vec<(&str, MemoryConsumption)> {
        let mut rows: Vec<(&str, MemoryConsumption)> = self.buckets.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        rows.sort_by(|a, b| b.1.bytes.cmp(&a.1.bytes).then_with(|| a.0.cmp(b.0)));
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{test_allocation, HeapGraphBuilder};
    use crate::trace::native::tests::{symbols, BYTES_TYPE, OBJ_TYPE};
    use crate::trace::{AllocKind, Event, TracedEvent};

    fn graph() -> HeapGraph {
        let mut builder = HeapGraphBuilder::new(true);
        let mut array = test_allocation(0x100, 1048);
        array.type_id = BYTES_TYPE;
        array.array_length = Some(1024);
        array.kind = AllocKind::C2;
        array.site = 99;
        let mut events = vec![Event::Allocate(array)];
        for i in 0..3u64 {
            let mut o = test_allocation(0x10 + i * 0x10, 24);
            o.type_id = OBJ_TYPE;
            o.site = crate::trace::native::tests::SITE;
            events.push(Event::Allocate(o));
        }
        for (offset, event) in events.into_iter().enumerate() {
            builder
                .apply(&TracedEvent {
                    offset: offset as u64,
                    event,
                })
                .unwrap();
        }
        builder.into_parts().0
    }

    #[test]
    fn test_by_type() {
        let h = Histogram::of(&graph(), &ByType::new(symbols()));
        assert_eq!(
            h.sorted(),
            vec![
                ("byte[]", MemoryConsumption::new(1, 1048)),
                ("com.foo.Bar", MemoryConsumption::new(3, 72)),
            ]
        );
        assert_eq!(h.total(), MemoryConsumption::new(4, 1120));
    }

    #[test]
    fn test_by_site_unknown_site() {
        let h = Histogram::of(&graph(), &BySite::new(symbols()));
        assert_eq!(h.buckets["<site 99>"], MemoryConsumption::new(1, 1048));
        assert_eq!(h.buckets["com.foo.Bar::make() @ 1"].objects, 3);
    }

    #[test]
    fn test_by_feature() {
        let features = Arc::new(FeatureMap::parse("Bars(1 2 3) { com.foo.Bar }").unwrap());
        let h = Histogram::of(&graph(), &ByFeature::new(symbols(), features));
        assert_eq!(h.buckets["Bars"].objects, 3);
        assert_eq!(h.buckets.values().map(|m| m.objects).sum::<u64>(), 4);
    }

    #[test]
    fn test_rules_first_match_wins() {
        let c = RuleClassifier::new("custom", "rest")
            .rule("compiled", |o| o.kind == AllocKind::C2)
            .rule("arrays", |o| o.array_length.is_some());
        let h = Histogram::of(&graph(), &c);
        assert_eq!(h.buckets["compiled"].objects, 1);
        assert!(!h.buckets.contains_key("arrays"));
        assert_eq!(h.buckets["rest"].objects, 3);

        let sizes = Histogram::of(&graph(), &RuleClassifier::by_size());
        assert_eq!(sizes.buckets["<= 64 B"].objects, 3);
        assert_eq!(sizes.buckets["<= 4096 B"].objects, 1);
    }

    #[test]
    fn test_feature_choice_needs_definitions() {
        assert!(ClassifierChoice::Feature.build(symbols(), None, 256).is_err());
        let c = ClassifierChoice::Kind.build(symbols(), None, 256).unwrap();
        assert_eq!(Histogram::of(&graph(), c.as_ref()).buckets["big array"].objects, 1);
    }
}
