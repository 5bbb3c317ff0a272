//! Protobuf messages of a checkpoint blob and their conversions.

use crate::error::TraceError;
use crate::heap::{LiveObject, ObjRef, ObjectRecord, RootKind, RootPtr, RootTarget};
use crate::statistics::{AllocatorBreakdown, MemoryConsumption, ObjectKindBreakdown, SpaceStatistics};
use crate::trace::{AllocKind, Address, GcKind, ParserGcInfo, SpaceInfo, SpaceKind};
use prost::Message;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GcInfoMsg {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(bool, tag = "2")]
    pub major: bool,
    #[prost(string, tag = "3")]
    pub cause: String,
    #[prost(bool, tag = "4")]
    pub concurrent: bool,
    #[prost(bool, tag = "5")]
    pub failed: bool,
    #[prost(uint64, tag = "6")]
    pub timestamp: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SlotMsg {
    #[prost(uint32, tag = "1")]
    pub slot: u32,
    #[prost(uint64, tag = "2")]
    pub addr: u64,
    #[prost(uint32, tag = "3")]
    pub generation: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ObjectMsg {
    #[prost(uint64, tag = "1")]
    pub addr: u64,
    #[prost(uint32, tag = "2")]
    pub generation: u32,
    #[prost(uint64, tag = "3")]
    pub id: u64,
    #[prost(uint32, tag = "4")]
    pub thread: u32,
    #[prost(uint32, tag = "5")]
    pub kind: u32,
    #[prost(uint32, tag = "6")]
    pub site: u32,
    #[prost(uint32, tag = "7")]
    pub type_id: u32,
    #[prost(uint64, tag = "8")]
    pub size: u64,
    #[prost(uint32, optional, tag = "9")]
    pub array_length: Option<u32>,
    #[prost(bool, tag = "10")]
    pub is_mirror: bool,
    /// Slot vector length, trailing nulls included
    #[prost(uint32, tag = "11")]
    pub slot_count: u32,
    /// Non-null slots only
    #[prost(message, repeated, tag = "12")]
    pub slots: Vec<SlotMsg>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RootMsg {
    #[prost(uint32, tag = "1")]
    pub kind: u32,
    #[prost(string, optional, tag = "2")]
    pub name: Option<String>,
    #[prost(uint32, optional, tag = "3")]
    pub class_id: Option<u32>,
    #[prost(uint32, optional, tag = "4")]
    pub offset: Option<u32>,
    #[prost(uint64, optional, tag = "5")]
    pub thread: Option<u64>,
    #[prost(uint32, optional, tag = "6")]
    pub method_id: Option<u32>,
    #[prost(uint32, optional, tag = "7")]
    pub slot: Option<u32>,
    #[prost(bool, optional, tag = "8")]
    pub weak: Option<bool>,
    #[prost(string, optional, tag = "9")]
    pub vm_call: Option<String>,
    /// Bindings in order; `resolved` runs parallel to `addrs`
    #[prost(uint64, repeated, tag = "10")]
    pub addrs: Vec<u64>,
    /// Resolved generation plus one, zero when unresolved
    #[prost(uint32, repeated, tag = "11")]
    pub resolved: Vec<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SpaceMsg {
    #[prost(uint32, tag = "1")]
    pub index: u32,
    #[prost(uint32, tag = "2")]
    pub kind: u32,
    #[prost(uint64, tag = "3")]
    pub start: u64,
    #[prost(uint64, tag = "4")]
    pub size: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatsMsg {
    #[prost(uint64, tag = "1")]
    pub objects: u64,
    #[prost(uint64, tag = "2")]
    pub bytes: u64,
    /// vm, interpreter, c1, c2, dump
    #[prost(uint64, repeated, tag = "3")]
    pub allocators: Vec<u64>,
    /// instances, small arrays, big arrays
    #[prost(uint64, repeated, tag = "4")]
    pub object_kinds: Vec<u64>,
    #[prost(uint64, repeated, tag = "5")]
    pub feature_objects: Vec<u64>,
    #[prost(uint64, repeated, tag = "6")]
    pub feature_bytes: Vec<u64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CheckpointBlob {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(uint64, tag = "2")]
    pub offset: u64,
    #[prost(uint32, tag = "3")]
    pub cycle: u32,
    #[prost(uint32, tag = "4")]
    pub nonce: u32,
    #[prost(uint32, tag = "5")]
    pub heap_word_size: u32,
    #[prost(message, optional, tag = "6")]
    pub committed: Option<GcInfoMsg>,
    #[prost(message, repeated, tag = "7")]
    pub open_cycles: Vec<GcInfoMsg>,
    #[prost(uint32, optional, tag = "8")]
    pub last_start_id: Option<u32>,
    #[prost(uint64, tag = "9")]
    pub next_object_id: u64,
    #[prost(uint64, repeated, tag = "10")]
    pub generation_addrs: Vec<u64>,
    #[prost(uint32, repeated, tag = "11")]
    pub generation_values: Vec<u32>,
    #[prost(message, repeated, tag = "12")]
    pub objects: Vec<ObjectMsg>,
    #[prost(message, repeated, tag = "13")]
    pub roots: Vec<RootMsg>,
    #[prost(message, repeated, tag = "14")]
    pub spaces: Vec<SpaceMsg>,
    /// One per space kind
    #[prost(message, repeated, tag = "15")]
    pub statistics: Vec<StatsMsg>,
}

impl CheckpointBlob {
    pub fn from_binpb_zst(p: impl AsRef<Path>) -> Result<CheckpointBlob, TraceError> {
        let file = File::open(p)?;
        let mut reader = zstd::Decoder::new(file)?;
        let mut buf = vec![];
        reader.read_to_end(&mut buf)?;
        Ok(CheckpointBlob::decode(buf.as_slice())?)
    }

    pub fn write_binpb_zst(&self, p: impl AsRef<Path>) -> Result<(), TraceError> {
        let file = BufWriter::new(File::create(p)?);
        let mut writer = zstd::Encoder::new(file, 3)?;
        writer.write_all(&self.encode_to_vec())?;
        writer.finish()?.flush()?;
        Ok(())
    }
}

fn malformed(what: impl std::fmt::Display) -> TraceError {
    TraceError::Checkpoint(format!("malformed checkpoint: {}", what))
}

pub(crate) fn gc_to_msg(gc: &ParserGcInfo) -> GcInfoMsg {
    GcInfoMsg {
        id: gc.id,
        major: gc.kind.is_full(),
        cause: gc.cause.clone(),
        concurrent: gc.concurrent,
        failed: gc.failed,
        timestamp: gc.timestamp,
    }
}

pub(crate) fn gc_from_msg(msg: GcInfoMsg) -> ParserGcInfo {
    ParserGcInfo {
        id: msg.id,
        kind: if msg.major { GcKind::Major } else { GcKind::Minor },
        cause: msg.cause,
        concurrent: msg.concurrent,
        failed: msg.failed,
        timestamp: msg.timestamp,
    }
}

pub(crate) fn object_to_msg(addr: Address, object: &LiveObject) -> ObjectMsg {
    let r = &object.record;
    ObjectMsg {
        addr,
        generation: object.generation,
        id: r.id,
        thread: r.thread,
        kind: r.kind.as_u8() as u32,
        site: r.site,
        type_id: r.type_id,
        size: r.size,
        array_length: r.array_length,
        is_mirror: r.is_mirror,
        slot_count: object.slots.len() as u32,
        slots: object
            .targets()
            .map(|(slot, t)| SlotMsg {
                slot,
                addr: t.addr,
                generation: t.generation,
            })
            .collect(),
    }
}

pub(crate) fn object_from_msg(msg: ObjectMsg) -> Result<(Address, LiveObject), TraceError> {
    let kind = u8::try_from(msg.kind)
        .ok()
        .and_then(AllocKind::from_u8)
        .ok_or_else(|| malformed(format!("allocator {}", msg.kind)))?;
    let mut slots = smallvec::smallvec![None; msg.slot_count as usize];
    for s in msg.slots {
        let slot = slots
            .get_mut(s.slot as usize)
            .ok_or_else(|| malformed(format!("slot {} of object {:#x}", s.slot, msg.addr)))?;
        *slot = Some(ObjRef {
            addr: s.addr,
            generation: s.generation,
        });
    }
    let record = ObjectRecord {
        id: msg.id,
        thread: msg.thread,
        kind,
        site: msg.site,
        type_id: msg.type_id,
        size: msg.size,
        array_length: msg.array_length,
        is_mirror: msg.is_mirror,
    };
    Ok((
        msg.addr,
        LiveObject {
            record,
            generation: msg.generation,
            slots,
        },
    ))
}

pub(crate) fn root_to_msg(root: &RootPtr, targets: &[RootTarget]) -> RootMsg {
    let mut msg = RootMsg {
        kind: root.kind() as u32,
        addrs: targets.iter().map(|t| t.addr).collect(),
        resolved: targets
            .iter()
            .map(|t| t.resolved.map_or(0, |r| r.generation + 1))
            .collect(),
        ..Default::default()
    };
    match root {
        RootPtr::ClassLoader { name } => msg.name = Some(name.clone()),
        RootPtr::Class { class_id } => msg.class_id = Some(*class_id),
        RootPtr::StaticField { class_id, offset } => {
            msg.class_id = Some(*class_id);
            msg.offset = Some(*offset);
        }
        RootPtr::LocalVariable {
            thread,
            class_id,
            method_id,
            slot,
        } => {
            msg.thread = Some(*thread);
            msg.class_id = Some(*class_id);
            msg.method_id = Some(*method_id);
            msg.slot = Some(*slot);
        }
        RootPtr::VmInternalThreadData { thread } | RootPtr::JniLocal { thread } => msg.thread = Some(*thread),
        RootPtr::CodeBlob { class_id, method_id } => {
            msg.class_id = Some(*class_id);
            msg.method_id = Some(*method_id);
        }
        RootPtr::JniGlobal { weak } => msg.weak = Some(*weak),
        RootPtr::Other(_) => {}
        RootPtr::Debug { vm_call } => msg.vm_call = Some(vm_call.clone()),
    }
    msg
}

pub(crate) fn root_from_msg(msg: RootMsg) -> Result<(RootPtr, Vec<RootTarget>), TraceError> {
    let kind = u8::try_from(msg.kind)
        .ok()
        .and_then(RootKind::from_u8)
        .ok_or_else(|| malformed(format!("root kind {}", msg.kind)))?;
    let missing = |field: &str| malformed(format!("{} root without {}", kind, field));
    let root = match kind {
        RootKind::ClassLoader => RootPtr::ClassLoader {
            name: msg.name.ok_or_else(|| missing("name"))?,
        },
        RootKind::Class => RootPtr::Class {
            class_id: msg.class_id.ok_or_else(|| missing("class"))?,
        },
        RootKind::StaticField => RootPtr::StaticField {
            class_id: msg.class_id.ok_or_else(|| missing("class"))?,
            offset: msg.offset.ok_or_else(|| missing("offset"))?,
        },
        RootKind::LocalVariable => RootPtr::LocalVariable {
            thread: msg.thread.ok_or_else(|| missing("thread"))?,
            class_id: msg.class_id.ok_or_else(|| missing("class"))?,
            method_id: msg.method_id.ok_or_else(|| missing("method"))?,
            slot: msg.slot.ok_or_else(|| missing("slot"))?,
        },
        RootKind::VmInternalThreadData => RootPtr::VmInternalThreadData {
            thread: msg.thread.ok_or_else(|| missing("thread"))?,
        },
        RootKind::CodeBlob => RootPtr::CodeBlob {
            class_id: msg.class_id.ok_or_else(|| missing("class"))?,
            method_id: msg.method_id.ok_or_else(|| missing("method"))?,
        },
        RootKind::JniLocal => RootPtr::JniLocal {
            thread: msg.thread.ok_or_else(|| missing("thread"))?,
        },
        RootKind::JniGlobal => RootPtr::JniGlobal {
            weak: msg.weak.ok_or_else(|| missing("weak flag"))?,
        },
        RootKind::Debug => RootPtr::Debug {
            vm_call: msg.vm_call.ok_or_else(|| missing("VM call"))?,
        },
        other => RootPtr::administrative(other).ok_or_else(|| missing("payload"))?,
    };
    if msg.addrs.len() != msg.resolved.len() {
        return Err(malformed(format!("{} root bindings", kind)));
    }
    let targets = msg
        .addrs
        .iter()
        .zip(&msg.resolved)
        .map(|(addr, resolved)| RootTarget {
            addr: *addr,
            resolved: resolved.checked_sub(1).map(|generation| ObjRef {
                addr: *addr,
                generation,
            }),
        })
        .collect();
    Ok((root, targets))
}

pub(crate) fn space_to_msg(space: &SpaceInfo) -> SpaceMsg {
    SpaceMsg {
        index: space.index,
        kind: space.kind.index() as u32,
        start: space.start,
        size: space.size,
    }
}

pub(crate) fn space_from_msg(msg: SpaceMsg) -> Result<SpaceInfo, TraceError> {
    let kind = u8::try_from(msg.kind)
        .ok()
        .and_then(SpaceKind::from_u8)
        .ok_or_else(|| malformed(format!("space kind {}", msg.kind)))?;
    Ok(SpaceInfo {
        index: msg.index,
        kind,
        start: msg.start,
        size: msg.size,
    })
}

pub(crate) fn stats_to_msg(stats: &SpaceStatistics) -> StatsMsg {
    let a = &stats.allocators;
    let k = &stats.object_kinds;
    StatsMsg {
        objects: stats.memory.objects,
        bytes: stats.memory.bytes,
        allocators: vec![a.vm, a.ir, a.c1, a.c2, a.dump],
        object_kinds: vec![k.instances, k.small_arrays, k.big_arrays],
        feature_objects: stats.features.iter().map(|f| f.objects).collect(),
        feature_bytes: stats.features.iter().map(|f| f.bytes).collect(),
    }
}

pub(crate) fn stats_from_msg(msg: StatsMsg) -> Result<SpaceStatistics, TraceError> {
    let (allocators, object_kinds) = match (msg.allocators.as_slice(), msg.object_kinds.as_slice()) {
        (&[vm, ir, c1, c2, dump], &[instances, small_arrays, big_arrays]) => (
            AllocatorBreakdown { vm, ir, c1, c2, dump },
            ObjectKindBreakdown {
                instances,
                small_arrays,
                big_arrays,
            },
        ),
        _ => return Err(malformed("statistics counters")),
    };
    if msg.feature_objects.len() != msg.feature_bytes.len() {
        return Err(malformed("feature statistics"));
    }
    Ok(SpaceStatistics {
        memory: MemoryConsumption::new(msg.objects, msg.bytes),
        allocators,
        object_kinds,
        features: msg
            .feature_objects
            .iter()
            .zip(&msg.feature_bytes)
            .map(|(objects, bytes)| MemoryConsumption::new(*objects, *bytes))
            .collect(),
    })
}
