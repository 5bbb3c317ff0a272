use crate::heap::{HeapGraph, ObjRef, Pointer};
use std::collections::HashMap;
use std::collections::HashSet;

/// Live objects reachable from the resolved roots
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Reachability {
    pub objects: usize,
    pub bytes: u64,
}

pub fn sanity_trace(graph: &HeapGraph) -> Reachability {
    let mut reachable_objects: HashSet<ObjRef> = HashSet::new();
    let mut mark_stack: Vec<ObjRef> = graph.resolved_roots().map(|(_, r)| r).collect();
    let mut bytes = 0;
    while let Some(o) = mark_stack.pop() {
        if reachable_objects.contains(&o) {
            continue;
        }
        let Some(object) = graph.get(o.addr).filter(|obj| obj.generation == o.generation) else {
            continue;
        };
        reachable_objects.insert(o);
        bytes += object.record.size;
        for (_, target) in object.targets() {
            mark_stack.push(target);
        }
    }
    Reachability {
        objects: reachable_objects.len(),
        bytes,
    }
}

fn sorted(mut index: HashMap<ObjRef, Vec<Pointer>>) -> HashMap<ObjRef, Vec<Pointer>> {
    for pointers in index.values_mut() {
        pointers.sort_unstable();
    }
    index
}

/// Brute-force check that the incoming index is exactly the transpose of
/// the live objects' slots
pub fn verify_transpose(graph: &HeapGraph) -> bool {
    let mut forward: HashMap<ObjRef, Vec<Pointer>> = HashMap::new();
    for (addr, object) in graph.objects() {
        let source = ObjRef {
            addr,
            generation: object.generation,
        };
        for (slot, target) in object.targets() {
            forward
                .entry(target)
                .or_default()
                .push(Pointer { source, slot });
        }
    }
    let backward: HashMap<ObjRef, Vec<Pointer>> = graph
        .incoming_index()
        .map(|(target, pointers)| (target, pointers.to_vec()))
        .collect();
    let (forward, backward) = (sorted(forward), sorted(backward));
    if forward != backward {
        let mismatched = forward
            .iter()
            .filter(|(t, p)| backward.get(*t) != Some(*p))
            .count()
            + backward.keys().filter(|t| !forward.contains_key(*t)).count();
        debug!("{} incoming-index entries disagree with the slots", mismatched);
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{test_allocation, HeapGraphBuilder, RootPtr, XorShift};
    use crate::trace::{Event, TracedEvent};

    #[test]
    fn test_transpose_on_random_graphs() {
        for seed in [1u64, 0xdead_beef, 0x1234_5678_9abc] {
            let mut rng = XorShift(seed);
            let mut builder = HeapGraphBuilder::new(false);
            let addr = |rng: &mut XorShift| 0x1000 + rng.below(48) * 16;
            for step in 0..2000u64 {
                let event = match rng.below(10) {
                    0..=2 => Event::Allocate(test_allocation(addr(&mut rng), 16)),
                    3 => Event::Move {
                        from: addr(&mut rng),
                        to: addr(&mut rng),
                    },
                    4 => Event::Die { addr: addr(&mut rng) },
                    5 => Event::PointerUpdate {
                        addr: addr(&mut rng),
                        slot: rng.below(3) as u32,
                        target: 0,
                    },
                    _ => Event::PointerUpdate {
                        addr: addr(&mut rng),
                        slot: rng.below(3) as u32,
                        target: addr(&mut rng),
                    },
                };
                builder
                    .apply(&TracedEvent { offset: step, event })
                    .unwrap();
                assert!(verify_transpose(builder.graph()), "seed {} step {}", seed, step);
            }
            assert!(builder.report().orphaned_addresses > 0);
        }
    }

    #[test]
    fn test_reachability() {
        let mut builder = HeapGraphBuilder::new(true);
        let events = vec![
            Event::Allocate(test_allocation(0x10, 16)),
            Event::Allocate(test_allocation(0x20, 24)),
            Event::Allocate(test_allocation(0x30, 32)),
            Event::Allocate(test_allocation(0x40, 8)),
            Event::PointerUpdate { addr: 0x10, slot: 0, target: 0x20 },
            Event::PointerUpdate { addr: 0x20, slot: 0, target: 0x10 },
            Event::PointerUpdate { addr: 0x40, slot: 0, target: 0x30 },
            Event::RootUpdate {
                root: RootPtr::JniLocal { thread: 1 },
                target: 0x10,
            },
        ];
        for (offset, event) in events.into_iter().enumerate() {
            builder
                .apply(&TracedEvent {
                    offset: offset as u64,
                    event,
                })
                .unwrap();
        }
        assert_eq!(
            sanity_trace(builder.graph()),
            Reachability {
                objects: 2,
                bytes: 40
            }
        );
    }
}
