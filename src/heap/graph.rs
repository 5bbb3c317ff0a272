use super::{ObjectRecord, RootPtr};
use crate::trace::{Address, Allocation};
use smallvec::SmallVec;
use std::collections::HashMap;

/// An object identity: the address it lives at plus how many objects have
/// lived at that address before it. A reused address gets a fresh
/// generation, so references to the previous occupant never match the new
/// object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef {
    pub addr: Address,
    pub generation: u32,
}

/// Slot `slot` of object `source`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pointer {
    pub source: ObjRef,
    pub slot: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LiveObject {
    pub record: ObjectRecord,
    pub generation: u32,
    /// Outgoing pointers indexed by slot; `None` is null
    pub slots: SmallVec<[Option<ObjRef>; 4]>,
}

impl LiveObject {
    pub fn targets(&self) -> impl Iterator<Item = (u32, ObjRef)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, t)| t.map(|t| (slot as u32, t)))
    }
}

/// One binding of a root. `resolved` stays `None` until an object is
/// allocated at `addr`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RootTarget {
    pub addr: Address,
    pub resolved: Option<ObjRef>,
}

/// The live heap: objects by address, forward slots, the reverse
/// (incoming) index and the root set.
///
/// `incoming` is kept as the exact transpose of every live object's slots.
/// Keys may name objects that are no longer (or not yet) live; those are
/// the dangling and pending pointers the builder checks at cycle
/// boundaries.
#[derive(Clone, Debug, Default)]
pub struct HeapGraph {
    objects: HashMap<Address, LiveObject>,
    by_id: HashMap<u64, Address>,
    incoming: HashMap<ObjRef, SmallVec<[Pointer; 2]>>,
    /// Latest generation seen per address, kept after the object dies
    generations: HashMap<Address, u32>,
    roots: HashMap<RootPtr, SmallVec<[RootTarget; 1]>>,
    roots_by_addr: HashMap<Address, SmallVec<[RootPtr; 1]>>,
    next_id: u64,
}

impl PartialEq for HeapGraph {
    fn eq(&self, other: &Self) -> bool {
        self.next_id == other.next_id
            && self.objects == other.objects
            && self.by_id == other.by_id
            && self.generations == other.generations
            && self.roots == other.roots
            && normalized(&self.incoming) == normalized(&other.incoming)
    }
}

impl Eq for HeapGraph {}

fn normalized(incoming: &HashMap<ObjRef, SmallVec<[Pointer; 2]>>) -> HashMap<ObjRef, Vec<Pointer>> {
    incoming
        .iter()
        .map(|(target, pointers)| {
            let mut pointers = pointers.to_vec();
            pointers.sort_unstable();
            (*target, pointers)
        })
        .collect()
}

impl HeapGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.objects.values().map(|o| o.record.size).sum()
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn get(&self, addr: Address) -> Option<&LiveObject> {
        self.objects.get(&addr)
    }

    pub fn get_by_id(&self, id: u64) -> Option<(Address, &LiveObject)> {
        let addr = *self.by_id.get(&id)?;
        self.objects.get(&addr).map(|o| (addr, o))
    }

    pub fn object_ref(&self, addr: Address) -> Option<ObjRef> {
        self.objects.get(&addr).map(|o| ObjRef {
            addr,
            generation: o.generation,
        })
    }

    pub fn is_live(&self, r: ObjRef) -> bool {
        self.objects
            .get(&r.addr)
            .is_some_and(|o| o.generation == r.generation)
    }

    pub fn objects(&self) -> impl Iterator<Item = (Address, &LiveObject)> {
        self.objects.iter().map(|(addr, o)| (*addr, o))
    }

    pub fn outgoing(&self, addr: Address) -> impl Iterator<Item = (u32, ObjRef)> + '_ {
        self.objects.get(&addr).into_iter().flat_map(|o| o.targets())
    }

    /// Pointers held by live objects toward the object at `addr`
    pub fn incoming(&self, addr: Address) -> &[Pointer] {
        match self.object_ref(addr) {
            Some(r) => self.incoming_to(r),
            None => &[],
        }
    }

    pub fn incoming_to(&self, r: ObjRef) -> &[Pointer] {
        self.incoming.get(&r).map_or(&[], |p| p.as_slice())
    }

    pub fn incoming_index(&self) -> impl Iterator<Item = (ObjRef, &[Pointer])> {
        self.incoming.iter().map(|(t, p)| (*t, p.as_slice()))
    }

    /// Incoming-index entries whose target is not live
    pub fn dangling(&self) -> impl Iterator<Item = (ObjRef, &[Pointer])> {
        self.incoming_index().filter(|(t, _)| !self.is_live(*t))
    }

    pub fn generations(&self) -> &HashMap<Address, u32> {
        &self.generations
    }

    pub fn roots(&self) -> impl Iterator<Item = (&RootPtr, &RootTarget)> {
        self.roots
            .iter()
            .flat_map(|(root, targets)| targets.iter().map(move |t| (root, t)))
    }

    pub fn root_bindings(&self) -> impl Iterator<Item = (&RootPtr, &[RootTarget])> {
        self.roots.iter().map(|(root, t)| (root, t.as_slice()))
    }

    /// Roots bound to an object that is currently live
    pub fn resolved_roots(&self) -> impl Iterator<Item = (&RootPtr, ObjRef)> {
        self.roots()
            .filter_map(|(root, t)| t.resolved.map(|r| (root, r)))
            .filter(|(_, r)| self.is_live(*r))
    }

    /// Roots that were resolved to an object which has since died
    pub fn dead_roots(&self) -> impl Iterator<Item = (&RootPtr, ObjRef)> {
        self.roots()
            .filter_map(|(root, t)| t.resolved.map(|r| (root, r)))
            .filter(|(_, r)| !self.is_live(*r))
    }

    fn next_generation(&self, addr: Address) -> u32 {
        self.generations.get(&addr).map_or(0, |g| g + 1)
    }

    /// The live object at `addr`, or the one the next allocation there
    /// will create
    fn target_ref(&self, addr: Address) -> ObjRef {
        match self.objects.get(&addr) {
            Some(o) => ObjRef {
                addr,
                generation: o.generation,
            },
            None => ObjRef {
                addr,
                generation: self.next_generation(addr),
            },
        }
    }

    fn link(&mut self, target: ObjRef, pointer: Pointer) {
        self.incoming.entry(target).or_default().push(pointer);
    }

    fn unlink(&mut self, target: ObjRef, pointer: Pointer) {
        if let Some(pointers) = self.incoming.get_mut(&target) {
            if let Some(i) = pointers.iter().position(|p| *p == pointer) {
                pointers.swap_remove(i);
            }
            if pointers.is_empty() {
                self.incoming.remove(&target);
            }
        }
    }

    fn rekey(&mut self, target: ObjRef, from: Pointer, to: Pointer) {
        if let Some(pointers) = self.incoming.get_mut(&target) {
            if let Some(p) = pointers.iter_mut().find(|p| **p == from) {
                *p = to;
            }
        }
    }

    fn place(&mut self, addr: Address, object: LiveObject) {
        let this = ObjRef {
            addr,
            generation: object.generation,
        };
        self.generations.insert(addr, object.generation);
        self.by_id.insert(object.record.id, addr);
        self.objects.insert(addr, object);
        if let Some(roots) = self.roots_by_addr.get(&addr) {
            for root in roots {
                let Some(targets) = self.roots.get_mut(root) else {
                    continue;
                };
                for t in targets
                    .iter_mut()
                    .filter(|t| t.addr == addr && t.resolved.is_none())
                {
                    t.resolved = Some(this);
                }
            }
        }
    }

    /// Insert a new object, evicting whatever still occupies the address
    pub(crate) fn allocate(&mut self, alloc: &Allocation) -> (ObjectRecord, Option<ObjectRecord>) {
        let evicted = self.remove(alloc.addr);
        let record = ObjectRecord::from_allocation(self.next_id, alloc);
        self.next_id += 1;
        let generation = self.next_generation(alloc.addr);
        self.place(
            alloc.addr,
            LiveObject {
                record,
                generation,
                slots: SmallVec::new(),
            },
        );
        (record, evicted)
    }

    /// Remove the object at `addr` together with its outgoing pointers.
    /// Pointers toward it are left in place.
    pub(crate) fn remove(&mut self, addr: Address) -> Option<ObjectRecord> {
        let object = self.objects.remove(&addr)?;
        let this = ObjRef {
            addr,
            generation: object.generation,
        };
        for (slot, target) in object.targets() {
            self.unlink(target, Pointer { source: this, slot });
        }
        self.by_id.remove(&object.record.id);
        Some(object.record)
    }

    /// Move the object at `from` to `to`, rewriting every slot that points
    /// at it. Returns the moved record and anything evicted at `to`.
    pub(crate) fn relocate(&mut self, from: Address, to: Address) -> Option<(ObjectRecord, Option<ObjectRecord>)> {
        if from == to {
            return self.objects.get(&from).map(|o| (o.record, None));
        }
        let mut object = self.objects.remove(&from)?;
        self.by_id.remove(&object.record.id);
        let evicted = self.remove(to);
        let old = ObjRef {
            addr: from,
            generation: object.generation,
        };
        let new = ObjRef {
            addr: to,
            generation: self.next_generation(to),
        };

        let targets: SmallVec<[(u32, ObjRef); 8]> = object.targets().collect();
        for (slot, target) in targets {
            self.rekey(
                target,
                Pointer { source: old, slot },
                Pointer { source: new, slot },
            );
        }
        for pointer in self.incoming.remove(&old).unwrap_or_default() {
            if pointer.source == new {
                object.slots[pointer.slot as usize] = Some(new);
            } else if let Some(source) = self.objects.get_mut(&pointer.source.addr) {
                source.slots[pointer.slot as usize] = Some(new);
            }
            self.link(new, pointer);
        }

        self.move_roots(from, old, new);
        object.generation = new.generation;
        let record = object.record;
        self.place(to, object);
        Some((record, evicted))
    }

    fn move_roots(&mut self, from: Address, old: ObjRef, new: ObjRef) {
        let Some(roots) = self.roots_by_addr.remove(&from) else {
            return;
        };
        let mut stay: SmallVec<[RootPtr; 1]> = SmallVec::new();
        for root in roots {
            let (mut moved, mut kept) = (false, false);
            if let Some(targets) = self.roots.get_mut(&root) {
                for t in targets.iter_mut().filter(|t| t.addr == from) {
                    if t.resolved == Some(old) {
                        *t = RootTarget {
                            addr: new.addr,
                            resolved: Some(new),
                        };
                        moved = true;
                    } else {
                        kept = true;
                    }
                }
            }
            if moved {
                self.index_root(new.addr, &root);
            }
            if kept {
                stay.push(root);
            }
        }
        if !stay.is_empty() {
            self.roots_by_addr.insert(from, stay);
        }
    }

    /// Set or clear one slot. Returns false when no object lives at `addr`.
    pub(crate) fn set_pointer(&mut self, addr: Address, slot: u32, target: Address) -> bool {
        let Some(this) = self.object_ref(addr) else {
            return false;
        };
        let new_target = (target != 0).then(|| self.target_ref(target));
        let Some(object) = self.objects.get_mut(&addr) else {
            return false;
        };
        let index = slot as usize;
        if object.slots.len() <= index {
            object.slots.resize(index + 1, None);
        }
        let previous = std::mem::replace(&mut object.slots[index], new_target);
        let pointer = Pointer { source: this, slot };
        if let Some(previous) = previous {
            self.unlink(previous, pointer);
        }
        if let Some(target) = new_target {
            self.link(target, pointer);
        }
        true
    }

    fn index_root(&mut self, addr: Address, root: &RootPtr) {
        let roots = self.roots_by_addr.entry(addr).or_default();
        if !roots.contains(root) {
            roots.push(root.clone());
        }
    }

    fn unindex_root(&mut self, addr: Address, root: &RootPtr) {
        if let Some(roots) = self.roots_by_addr.get_mut(&addr) {
            roots.retain(|r| r != root);
            if roots.is_empty() {
                self.roots_by_addr.remove(&addr);
            }
        }
    }

    /// Bind `root` to `target`, or drop all its bindings for a null target.
    /// Rebinding an address the root already holds refreshes its
    /// resolution.
    pub(crate) fn bind_root(&mut self, root: &RootPtr, target: Address) {
        if target == 0 {
            if let Some(targets) = self.roots.remove(root) {
                for t in targets {
                    self.unindex_root(t.addr, root);
                }
            }
            return;
        }
        let resolved = self.object_ref(target);
        let targets = self.roots.entry(root.clone()).or_default();
        match targets.iter_mut().find(|t| t.addr == target) {
            Some(t) => t.resolved = resolved,
            None => targets.push(RootTarget {
                addr: target,
                resolved,
            }),
        }
        self.index_root(target, root);
    }

    pub(crate) fn clear_roots(&mut self) {
        self.roots.clear();
        self.roots_by_addr.clear();
    }

    /// Rebuild a graph from its persisted parts; the incoming index and the
    /// address lookups are derived.
    pub(crate) fn restore(
        next_id: u64,
        generations: HashMap<Address, u32>,
        objects: Vec<(Address, LiveObject)>,
        roots: Vec<(RootPtr, Vec<RootTarget>)>,
    ) -> HeapGraph {
        let mut graph = HeapGraph {
            next_id,
            generations,
            ..Default::default()
        };
        for (addr, object) in objects {
            let this = ObjRef {
                addr,
                generation: object.generation,
            };
            for (slot, target) in object.targets() {
                graph.link(target, Pointer { source: this, slot });
            }
            graph.by_id.insert(object.record.id, addr);
            graph.objects.insert(addr, object);
        }
        for (root, targets) in roots {
            for t in &targets {
                graph.index_root(t.addr, &root);
            }
            graph.roots.insert(root, targets.into_iter().collect());
        }
        graph
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sanity::verify_transpose;
    use crate::trace::AllocKind;

    pub(crate) fn alloc(addr: Address, size: u64) -> Allocation {
        Allocation {
            addr,
            thread: 1,
            site: 10,
            type_id: 1,
            kind: AllocKind::VmSlow,
            size,
            array_length: None,
            is_mirror: false,
        }
    }

    /// Deterministic generator for the randomized graph tests
    pub(crate) struct XorShift(pub u64);

    impl XorShift {
        pub(crate) fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }

        pub(crate) fn below(&mut self, n: u64) -> u64 {
            self.next() % n
        }
    }

    #[test]
    fn test_pointer_and_incoming() {
        let mut g = HeapGraph::new();
        g.allocate(&alloc(0x10, 16));
        g.allocate(&alloc(0x20, 16));
        assert!(g.set_pointer(0x10, 2, 0x20));
        let target = g.object_ref(0x20).unwrap();
        assert_eq!(g.outgoing(0x10).collect::<Vec<_>>(), vec![(2, target)]);
        assert_eq!(g.get(0x10).unwrap().slots.len(), 3);
        assert_eq!(g.incoming(0x20).len(), 1);
        assert_eq!(g.incoming(0x20)[0].source.addr, 0x10);
        assert!(g.set_pointer(0x10, 2, 0));
        assert!(g.incoming(0x20).is_empty());
        assert!(!g.set_pointer(0x30, 0, 0x20));
        assert!(verify_transpose(&g));
    }

    #[test]
    fn test_die_then_reallocate_does_not_resurrect() {
        let mut g = HeapGraph::new();
        g.allocate(&alloc(0x10, 16));
        g.allocate(&alloc(0x20, 16));
        g.set_pointer(0x10, 0, 0x20);
        g.set_pointer(0x20, 0, 0x10);
        let old = g.object_ref(0x20).unwrap();
        g.remove(0x20);
        // 0x10 still points at the dead object
        assert_eq!(g.dangling().count(), 1);
        g.allocate(&alloc(0x20, 32));
        let new = g.object_ref(0x20).unwrap();
        assert_ne!(old, new);
        assert_eq!(new.generation, old.generation + 1);
        assert!(g.get(0x20).unwrap().slots.is_empty());
        assert!(g.incoming(0x20).is_empty());
        assert_eq!(g.dangling().map(|(t, _)| t).collect::<Vec<_>>(), vec![old]);
        // the dead object's own pointer to 0x10 went with it
        assert!(g.incoming(0x10).is_empty());
        assert!(verify_transpose(&g));
    }

    #[test]
    fn test_pending_target_resolves_on_allocation() {
        let mut g = HeapGraph::new();
        g.allocate(&alloc(0x10, 16));
        g.set_pointer(0x10, 0, 0x40);
        assert_eq!(g.dangling().count(), 1);
        g.allocate(&alloc(0x40, 16));
        assert_eq!(g.dangling().count(), 0);
        assert_eq!(g.incoming(0x40).len(), 1);
    }

    #[test]
    fn test_allocate_evicts_occupant() {
        let mut g = HeapGraph::new();
        let (first, _) = g.allocate(&alloc(0x10, 16));
        let (second, evicted) = g.allocate(&alloc(0x10, 24));
        assert_eq!(evicted, Some(first));
        assert_eq!(g.len(), 1);
        assert_eq!(g.total_bytes(), 24);
        assert!(g.get_by_id(first.id).is_none());
        assert_eq!(g.get_by_id(second.id).unwrap().0, 0x10);
    }

    #[test]
    fn test_move_rewrites_in_edges() {
        let mut g = HeapGraph::new();
        for addr in [0x10, 0x20, 0x30] {
            g.allocate(&alloc(addr, 16));
        }
        g.set_pointer(0x10, 0, 0x20);
        g.set_pointer(0x30, 1, 0x20);
        g.set_pointer(0x20, 0, 0x30);
        g.set_pointer(0x20, 1, 0x20);
        let id = g.get(0x20).unwrap().record.id;

        let (record, evicted) = g.relocate(0x20, 0x80).unwrap();
        assert_eq!(record.id, id);
        assert!(evicted.is_none());
        assert!(g.get(0x20).is_none());
        let moved = g.object_ref(0x80).unwrap();
        assert_eq!(g.get(0x10).unwrap().slots[0], Some(moved));
        assert_eq!(g.get(0x30).unwrap().slots[1], Some(moved));
        // self loop follows the object
        assert_eq!(g.get(0x80).unwrap().slots[1], Some(moved));
        assert_eq!(g.incoming(0x80).len(), 3);
        assert_eq!(g.incoming(0x30)[0].source, moved);
        assert_eq!(g.get_by_id(id).unwrap().0, 0x80);
        assert_eq!(g.dangling().count(), 0);
        assert!(verify_transpose(&g));
        assert!(g.relocate(0x20, 0x90).is_none());
    }

    #[test]
    fn test_roots_resolve_and_follow_moves() {
        let mut g = HeapGraph::new();
        let root = RootPtr::StaticField {
            class_id: 1,
            offset: 8,
        };
        g.bind_root(&root, 0x10);
        assert_eq!(g.roots().count(), 1);
        assert_eq!(g.resolved_roots().count(), 0);
        g.allocate(&alloc(0x10, 16));
        assert_eq!(g.resolved_roots().count(), 1);
        g.relocate(0x10, 0x50);
        let (_, target) = g.resolved_roots().next().unwrap();
        assert_eq!(target.addr, 0x50);
        g.remove(0x50);
        assert_eq!(g.dead_roots().count(), 1);
        // a new object at the old address is not what the root saw
        g.allocate(&alloc(0x50, 16));
        assert_eq!(g.dead_roots().count(), 1);
        g.bind_root(&root, 0);
        assert_eq!(g.roots().count(), 0);
    }

    #[test]
    fn test_restore_equals_original() {
        let mut g = HeapGraph::new();
        let mut rng = XorShift(0x9e3779b97f4a7c15);
        for i in 0..64u64 {
            g.allocate(&alloc(0x1000 + i * 16, 16));
        }
        for _ in 0..200 {
            let from = 0x1000 + rng.below(64) * 16;
            let to = 0x1000 + rng.below(80) * 16;
            g.set_pointer(from, rng.below(4) as u32, to);
        }
        g.bind_root(&RootPtr::JniGlobal { weak: false }, 0x1000);
        g.bind_root(&RootPtr::JniGlobal { weak: false }, 0x1010);
        g.remove(0x1020);

        let objects = g.objects().map(|(a, o)| (a, o.clone())).collect();
        let roots = g
            .root_bindings()
            .map(|(r, t)| (r.clone(), t.to_vec()))
            .collect();
        let restored = HeapGraph::restore(g.next_id(), g.generations().clone(), objects, roots);
        assert_eq!(restored, g);
        assert_eq!(restored.dangling().count(), g.dangling().count());
    }
}
