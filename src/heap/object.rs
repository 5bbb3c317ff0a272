use crate::trace::{AllocKind, Allocation};

/// One live object. Two objects are equal only if every attribute matches;
/// statistics bucket by [`ObjectShape`] instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectRecord {
    /// Logical id, assigned at allocation and kept across moves
    pub id: u64,
    pub thread: u32,
    pub kind: AllocKind,
    pub site: u32,
    pub type_id: u32,
    pub size: u64,
    pub array_length: Option<u32>,
    pub is_mirror: bool,
}

/// Aggregation identity of an object: excludes id, size and the mirror flag
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectShape {
    pub thread: u32,
    pub kind: AllocKind,
    pub site: u32,
    pub type_id: u32,
    pub array_length: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Instance,
    SmallArray,
    BigArray,
}

impl ObjectRecord {
    pub fn from_allocation(id: u64, alloc: &Allocation) -> Self {
        ObjectRecord {
            id,
            thread: alloc.thread,
            kind: alloc.kind,
            site: alloc.site,
            type_id: alloc.type_id,
            size: alloc.size,
            array_length: alloc.array_length,
            is_mirror: alloc.is_mirror,
        }
    }

    pub fn is_array(&self) -> bool {
        self.array_length.is_some()
    }

    pub fn shape(&self) -> ObjectShape {
        ObjectShape {
            thread: self.thread,
            kind: self.kind,
            site: self.site,
            type_id: self.type_id,
            array_length: self.array_length,
        }
    }

    pub fn object_kind(&self, small_array_threshold: u32) -> ObjectKind {
        match self.array_length {
            None => ObjectKind::Instance,
            Some(len) if len < small_array_threshold => ObjectKind::SmallArray,
            Some(_) => ObjectKind::BigArray,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn record(id: u64, size: u64, len: Option<u32>, mirror: bool) -> ObjectRecord {
        ObjectRecord {
            id,
            thread: 1,
            kind: AllocKind::C2,
            site: 5,
            type_id: 9,
            size,
            array_length: len,
            is_mirror: mirror,
        }
    }

    #[test]
    fn test_two_tier_identity() {
        let a = record(1, 16, None, false);
        let b = record(2, 24, None, true);
        assert_ne!(a, b);
        assert_eq!(a.shape(), b.shape());
        // array length participates in the shape
        assert_ne!(a.shape(), record(1, 16, Some(3), false).shape());

        let mut buckets: HashMap<ObjectShape, u64> = HashMap::new();
        for r in [a, b] {
            *buckets.entry(r.shape()).or_default() += r.size;
        }
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[&a.shape()], 40);
    }

    #[test]
    fn test_object_kind() {
        assert_eq!(record(0, 0, None, false).object_kind(256), ObjectKind::Instance);
        assert_eq!(record(0, 0, Some(255), false).object_kind(256), ObjectKind::SmallArray);
        assert_eq!(record(0, 0, Some(256), false).object_kind(256), ObjectKind::BigArray);
    }
}
