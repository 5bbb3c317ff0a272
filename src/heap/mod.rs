//! The reconstructed heap and the builder that applies events to it.

mod builder;
mod graph;
mod object;
mod roots;

pub use builder::{ConsistencyReport, Effect, HeapGraphBuilder};
pub use graph::{HeapGraph, LiveObject, ObjRef, Pointer, RootTarget};
pub use object::{ObjectKind, ObjectRecord, ObjectShape};
pub use roots::{RootKind, RootPtr};

#[cfg(test)]
pub(crate) use graph::tests::{alloc as test_allocation, XorShift};
