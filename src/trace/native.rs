//! The native binary trace.
//!
//! After a fixed header every record is `tag: u8`, `len: u32`, then `len`
//! payload bytes, all big-endian. A record's events are released only once
//! the whole record has decoded and its length checked, so a truncated or
//! malformed record never leaks partial events.

use super::scanner::{be_u32, be_u64, be_u8, checked, mapped, parse_body, string, take, Parsed, WireError};
use super::*;
use crate::constants::{MAX_ROOTS_PER_EVENT, NATIVE_FORMAT_VERSION, NATIVE_TRACE_MAGIC};
use crate::error::{DecodeError, ProtocolError, SymbolKind};
use crate::heap::{RootKind, RootPtr};
use crate::symbols::Symbols;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::io::{Read, Seek};
use std::sync::Arc;

pub const TAG_NOP: u8 = 0x00;
pub const TAG_GC_START: u8 = 0x01;
pub const TAG_GC_END: u8 = 0x02;
pub const TAG_SPACE_CREATE: u8 = 0x03;
pub const TAG_ALLOC: u8 = 0x10;
pub const TAG_MOVE: u8 = 0x11;
pub const TAG_DIE: u8 = 0x12;
pub const TAG_PTR_UPDATE: u8 = 0x13;
pub const TAG_ROOTS: u8 = 0x14;
pub const TAG_ROOTS_OVERFLOW: u8 = 0x15;

/// Collections may overlap
pub const FLAG_NESTED_CYCLES: u8 = 1 << 0;
/// Pointers to a dead object may survive until the end of the next cycle
pub const FLAG_DANGLING_AFTER_DEATH: u8 = 1 << 1;

const GC_FLAG_CONCURRENT: u8 = 1 << 0;
const GC_FLAG_FAILED: u8 = 1 << 1;
const ALLOC_FLAG_ARRAY: u8 = 1 << 0;
const ALLOC_FLAG_MIRROR: u8 = 1 << 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NativeHeader {
    pub version: u8,
    pub flags: u8,
    pub nonce: u32,
}

impl NativeHeader {
    pub const SIZE: u64 = 10;

    pub fn new(nonce: u32) -> Self {
        NativeHeader {
            version: NATIVE_FORMAT_VERSION,
            flags: 0,
            nonce,
        }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn nested_cycles(&self) -> bool {
        self.flags & FLAG_NESTED_CYCLES != 0
    }

    pub fn dangling_after_death(&self) -> bool {
        self.flags & FLAG_DANGLING_AFTER_DEATH != 0
    }

    fn parse(input: &[u8]) -> Parsed<Self> {
        let (input, _) = checked(input, |i| take(i, 4), "trace magic", |m| *m == NATIVE_TRACE_MAGIC)?;
        let (rest, version) = be_u8(input)?;
        if version != NATIVE_FORMAT_VERSION {
            return Err(WireError::invalid(input, format!("trace version {}", version)));
        }
        let (rest, flags) = be_u8(rest)?;
        let (rest, nonce) = be_u32(rest)?;
        Ok((
            rest,
            NativeHeader {
                version,
                flags,
                nonce,
            },
        ))
    }
}

/// An allocation as written, before its type and site are looked up
struct RawAllocation {
    kind: AllocKind,
    flags: u8,
    thread: u32,
    site: u32,
    type_id: u32,
    addr: Address,
    size_or_len: u32,
}

enum Payload {
    Events(SmallVec<[Event; 3]>),
    Allocation(RawAllocation),
}

fn gc_info(input: &[u8]) -> Parsed<ParserGcInfo> {
    let (input, id) = be_u32(input)?;
    let (rest, kind) = be_u8(input)?;
    let kind = match kind {
        0 => GcKind::Minor,
        1 => GcKind::Major,
        other => return Err(WireError::invalid(input, format!("GC kind {}", other))),
    };
    let (rest, flags) = be_u8(rest)?;
    let (rest, timestamp) = be_u64(rest)?;
    let (rest, cause) = string(rest)?;
    Ok((
        rest,
        ParserGcInfo {
            id,
            kind,
            cause,
            concurrent: flags & GC_FLAG_CONCURRENT != 0,
            failed: flags & GC_FLAG_FAILED != 0,
            timestamp,
        },
    ))
}

fn space(input: &[u8]) -> Parsed<SpaceInfo> {
    let (input, index) = be_u32(input)?;
    let (input, kind) = mapped(input, be_u8, "space kind", |k| {
        SpaceKind::from_u8(k).filter(|k| *k != SpaceKind::Undefined)
    })?;
    let (input, start) = be_u64(input)?;
    let (input, size) = be_u64(input)?;
    Ok((
        input,
        SpaceInfo {
            index,
            kind,
            start,
            size,
        },
    ))
}

fn allocation(input: &[u8]) -> Parsed<RawAllocation> {
    let (input, kind) = mapped(input, be_u8, "allocator kind", |k| {
        AllocKind::from_u8(k).filter(|k| *k != AllocKind::Dump)
    })?;
    let (input, flags) = be_u8(input)?;
    let (input, thread) = be_u32(input)?;
    let (input, site) = be_u32(input)?;
    let (input, type_id) = be_u32(input)?;
    let (input, addr) = checked(input, be_u64, "null allocation address", |a| *a != 0)?;
    let (input, size_or_len) = be_u32(input)?;
    Ok((
        input,
        RawAllocation {
            kind,
            flags,
            thread,
            site,
            type_id,
            addr,
            size_or_len,
        },
    ))
}

fn root(input: &[u8]) -> Parsed<RootPtr> {
    let (input, kind) = mapped(input, be_u8, "root kind", RootKind::from_u8)?;
    match kind {
        RootKind::ClassLoader => {
            let (input, name) = string(input)?;
            Ok((input, RootPtr::ClassLoader { name }))
        }
        RootKind::Class => {
            let (input, class_id) = be_u32(input)?;
            Ok((input, RootPtr::Class { class_id }))
        }
        RootKind::StaticField => {
            let (input, class_id) = be_u32(input)?;
            let (input, offset) = be_u32(input)?;
            Ok((input, RootPtr::StaticField { class_id, offset }))
        }
        RootKind::LocalVariable => {
            let (input, thread) = be_u64(input)?;
            let (input, class_id) = be_u32(input)?;
            let (input, method_id) = be_u32(input)?;
            let (input, slot) = be_u32(input)?;
            Ok((
                input,
                RootPtr::LocalVariable {
                    thread,
                    class_id,
                    method_id,
                    slot,
                },
            ))
        }
        RootKind::VmInternalThreadData => {
            let (input, thread) = be_u64(input)?;
            Ok((input, RootPtr::VmInternalThreadData { thread }))
        }
        RootKind::CodeBlob => {
            let (input, class_id) = be_u32(input)?;
            let (input, method_id) = be_u32(input)?;
            Ok((
                input,
                RootPtr::CodeBlob {
                    class_id,
                    method_id,
                },
            ))
        }
        RootKind::JniLocal => {
            let (input, thread) = be_u64(input)?;
            Ok((input, RootPtr::JniLocal { thread }))
        }
        RootKind::JniGlobal => {
            let (input, weak) = be_u8(input)?;
            Ok((input, RootPtr::JniGlobal { weak: weak != 0 }))
        }
        RootKind::Debug => {
            let (input, vm_call) = string(input)?;
            Ok((input, RootPtr::Debug { vm_call }))
        }
        administrative => Ok((input, RootPtr::Other(administrative))),
    }
}

fn root_updates<'a>(
    mut input: &'a [u8],
    count: usize,
    events: &mut SmallVec<[Event; 3]>,
) -> Parsed<'a, ()> {
    for _ in 0..count {
        let (rest, root) = root(input)?;
        let (rest, target) = be_u64(rest)?;
        events.push(Event::RootUpdate { root, target });
        input = rest;
    }
    Ok((input, ()))
}

/// Body of a record with a known tag. Overflow records holding no more roots
/// than fit inline are malformed unless `lenient`.
fn payload(tag: u8, lenient: bool, input: &[u8]) -> Parsed<Payload> {
    let mut events: SmallVec<[Event; 3]> = SmallVec::new();
    let input = match tag {
        TAG_GC_START | TAG_GC_END => {
            let (input, info) = gc_info(input)?;
            events.push(if tag == TAG_GC_START {
                Event::GcStart(info)
            } else {
                Event::GcEnd(info)
            });
            input
        }
        TAG_SPACE_CREATE => {
            let (input, info) = space(input)?;
            events.push(Event::SpaceCreate(info));
            input
        }
        TAG_ALLOC => {
            let (input, raw) = allocation(input)?;
            return Ok((input, Payload::Allocation(raw)));
        }
        TAG_MOVE => {
            let (input, from) = be_u64(input)?;
            let (input, to) = be_u64(input)?;
            events.push(Event::Move { from, to });
            input
        }
        TAG_DIE => {
            let (input, addr) = be_u64(input)?;
            events.push(Event::Die { addr });
            input
        }
        TAG_PTR_UPDATE => {
            let (input, addr) = be_u64(input)?;
            let (input, slot) = be_u32(input)?;
            let (input, target) = be_u64(input)?;
            events.push(Event::PointerUpdate { addr, slot, target });
            input
        }
        TAG_ROOTS => {
            let (rest, count) = be_u8(input)?;
            let count = count as usize;
            if count == 0 || count > MAX_ROOTS_PER_EVENT {
                return Err(WireError::invalid(input, format!("inline root count {}", count)));
            }
            root_updates(rest, count, &mut events)?.0
        }
        TAG_ROOTS_OVERFLOW => {
            let (rest, count) = be_u32(input)?;
            if count as usize <= MAX_ROOTS_PER_EVENT {
                if !lenient {
                    return Err(WireError::invalid(input, format!("overflow root count {}", count)));
                }
                warn!("Overflow root record holds only {} roots", count);
            }
            root_updates(rest, count as usize, &mut events)?.0
        }
        _ => return Err(WireError::unknown_tag(input, tag)),
    };
    Ok((input, Payload::Events(events)))
}

fn is_known(tag: u8) -> bool {
    matches!(
        tag,
        TAG_GC_START
            | TAG_GC_END
            | TAG_SPACE_CREATE
            | TAG_ALLOC
            | TAG_MOVE
            | TAG_DIE
            | TAG_PTR_UPDATE
            | TAG_ROOTS
            | TAG_ROOTS_OVERFLOW
    )
}

pub struct NativeDecoder<R> {
    scanner: Scanner<R>,
    symbols: Arc<Symbols>,
    header: NativeHeader,
    pending: VecDeque<TracedEvent>,
    lenient: bool,
    stop_offset: Option<u64>,
    done: bool,
}

impl<R: Read> NativeDecoder<R> {
    pub fn new(reader: R, symbols: Arc<Symbols>) -> Result<Self, TraceError> {
        let mut scanner = Scanner::new(reader);
        let header = scanner.parse(NativeHeader::parse)?;
        if header.nonce != symbols.nonce {
            return Err(ProtocolError::HeaderMismatch {
                trace: header.nonce,
                symbols: symbols.nonce,
            }
            .into());
        }
        Ok(NativeDecoder {
            scanner,
            symbols,
            header,
            pending: VecDeque::new(),
            lenient: false,
            stop_offset: None,
            done: false,
        })
    }

    /// Skip unknown and short records, and end quietly on truncation
    #[must_use]
    pub fn lenient(mut self, lenient: bool) -> Self {
        self.lenient = lenient;
        self
    }

    #[must_use]
    pub fn stop_at(mut self, offset: Option<u64>) -> Self {
        self.stop_offset = offset;
        self
    }

    pub fn header(&self) -> NativeHeader {
        self.header
    }

    fn decode_record(&mut self) -> Result<bool, TraceError> {
        let start = self.scanner.offset();
        if self.stop_offset.is_some_and(|stop| start >= stop) {
            return Ok(false);
        }
        if self.scanner.at_eof()? {
            return Ok(false);
        }
        let (tag, declared) = self.scanner.parse(|input| {
            let (input, tag) = be_u8(input)?;
            let (input, len) = be_u32(input)?;
            Ok((input, (tag, len as u64)))
        })?;
        if tag == TAG_NOP {
            self.scanner.skip(declared)?;
            return Ok(true);
        }
        if !is_known(tag) {
            let err = DecodeError::UnknownTag { offset: start, tag };
            if !self.lenient {
                return Err(err.into());
            }
            warn!("{}, skipping {} bytes", err, declared);
            self.scanner.skip(declared)?;
            return Ok(true);
        }
        let body = self.scanner.offset();
        let bytes = self.scanner.bytes(declared as usize)?;
        let lenient = self.lenient;
        let (parsed, consumed) = parse_body(start, body, &bytes, |input| payload(tag, lenient, input))?;
        if consumed != declared {
            let err = DecodeError::RecordSizeMismatch {
                offset: start,
                declared,
                consumed,
            };
            if !self.lenient {
                return Err(err.into());
            }
            warn!("{}, skipping the remainder", err);
        }
        let events = match parsed {
            Payload::Events(events) => events,
            Payload::Allocation(raw) => {
                let mut events = SmallVec::new();
                events.push(Event::Allocate(self.resolve(raw, start)?));
                events
            }
        };
        self.pending
            .extend(events.into_iter().map(|event| TracedEvent { offset: start, event }));
        Ok(true)
    }

    fn resolve(&self, raw: RawAllocation, record: u64) -> Result<Allocation, TraceError> {
        if self.symbols.site(raw.site).is_none() {
            return Err(ProtocolError::MissingSymbol {
                kind: SymbolKind::AllocationSite,
                id: raw.site as u64,
                offset: record,
            }
            .into());
        }
        let ty = self
            .symbols
            .allocated_type(raw.type_id)
            .ok_or(ProtocolError::MissingSymbol {
                kind: SymbolKind::Type,
                id: raw.type_id as u64,
                offset: record,
            })?;
        let word = self.symbols.heap_word_size;
        let is_mirror = raw.flags & ALLOC_FLAG_MIRROR != 0;
        let (size, array_length) = if raw.flags & ALLOC_FLAG_ARRAY != 0 {
            (ty.object_size(Some(raw.size_or_len), word), Some(raw.size_or_len))
        } else if is_mirror || raw.size_or_len != 0 {
            (raw.size_or_len as u64, None)
        } else {
            (ty.object_size(None, word), None)
        };
        Ok(Allocation {
            addr: raw.addr,
            thread: raw.thread,
            site: raw.site,
            type_id: raw.type_id,
            kind: raw.kind,
            size,
            array_length,
            is_mirror,
        })
    }
}

impl<R: Read + Seek> NativeDecoder<R> {
    /// Open a trace and continue from a record boundary previously reported
    /// by [`EventSource::position`]
    pub fn resume(reader: R, symbols: Arc<Symbols>, offset: u64) -> Result<Self, TraceError> {
        let mut decoder = Self::new(reader, symbols)?;
        if offset < NativeHeader::SIZE {
            return Err(DecodeError::invalid(offset, "resume offset inside the header").into());
        }
        decoder.scanner.seek_to(offset)?;
        Ok(decoder)
    }
}

impl<R: Read> Iterator for NativeDecoder<R> {
    type Item = Result<TracedEvent, TraceError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(e) = self.pending.pop_front() {
                return Some(Ok(e));
            }
            if self.done {
                return None;
            }
            match self.decode_record() {
                Ok(true) => continue,
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(TraceError::Decode(DecodeError::UnexpectedEof { offset })) if self.lenient => {
                    warn!("Trace truncated at offset {}, stopping", offset);
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl<R: Read> EventSource for NativeDecoder<R> {
    fn position(&self) -> u64 {
        self.scanner.offset()
    }

    fn format(&self) -> TraceFormat {
        TraceFormat::Native
    }

    fn allows_nested_cycles(&self) -> bool {
        self.header.nested_cycles()
    }

    fn allows_dangling_after_death(&self) -> bool {
        self.header.dangling_after_death()
    }

    fn at_record_boundary(&self) -> bool {
        self.pending.is_empty()
    }
}

fn write_root(buf: &mut RecordBuf, root: &RootPtr) {
    buf.put_u8(root.kind() as u8);
    match root {
        RootPtr::ClassLoader { name } => {
            buf.put_str(name);
        }
        RootPtr::Class { class_id } => {
            buf.put_u32(*class_id);
        }
        RootPtr::StaticField { class_id, offset } => {
            buf.put_u32(*class_id).put_u32(*offset);
        }
        RootPtr::LocalVariable {
            thread,
            class_id,
            method_id,
            slot,
        } => {
            buf.put_u64(*thread)
                .put_u32(*class_id)
                .put_u32(*method_id)
                .put_u32(*slot);
        }
        RootPtr::VmInternalThreadData { thread } | RootPtr::JniLocal { thread } => {
            buf.put_u64(*thread);
        }
        RootPtr::CodeBlob {
            class_id,
            method_id,
        } => {
            buf.put_u32(*class_id).put_u32(*method_id);
        }
        RootPtr::JniGlobal { weak } => {
            buf.put_u8(*weak as u8);
        }
        RootPtr::Other(_) => {}
        RootPtr::Debug { vm_call } => {
            buf.put_str(vm_call);
        }
    }
}

/// Encoder for native traces, used to produce fixtures and synthetic
/// workloads
pub struct TraceWriter {
    buf: RecordBuf,
}

impl TraceWriter {
    pub fn new(header: NativeHeader) -> Self {
        let mut buf = RecordBuf::new();
        buf.put_bytes(&NATIVE_TRACE_MAGIC)
            .put_u8(header.version)
            .put_u8(header.flags)
            .put_u32(header.nonce);
        TraceWriter { buf }
    }

    /// Offset the next record will be written at
    pub fn position(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn bytes(&self) -> &[u8] {
        self.buf.as_slice()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf.into_inner()
    }

    pub fn raw_record(&mut self, tag: u8, payload: &[u8]) -> &mut Self {
        self.buf
            .put_u8(tag)
            .put_u32(payload.len() as u32)
            .put_bytes(payload);
        self
    }

    fn record(&mut self, tag: u8, f: impl FnOnce(&mut RecordBuf)) -> &mut Self {
        let mut payload = RecordBuf::new();
        f(&mut payload);
        self.raw_record(tag, payload.as_slice())
    }

    fn gc(&mut self, tag: u8, info: &ParserGcInfo) -> &mut Self {
        self.record(tag, |p| {
            let mut flags = 0;
            if info.concurrent {
                flags |= GC_FLAG_CONCURRENT;
            }
            if info.failed {
                flags |= GC_FLAG_FAILED;
            }
            p.put_u32(info.id)
                .put_u8(info.kind.is_full() as u8)
                .put_u8(flags)
                .put_u64(info.timestamp)
                .put_str(&info.cause);
        })
    }

    pub fn gc_start(&mut self, info: &ParserGcInfo) -> &mut Self {
        self.gc(TAG_GC_START, info)
    }

    pub fn gc_end(&mut self, info: &ParserGcInfo) -> &mut Self {
        self.gc(TAG_GC_END, info)
    }

    pub fn space(&mut self, space: &SpaceInfo) -> &mut Self {
        self.record(TAG_SPACE_CREATE, |p| {
            p.put_u32(space.index)
                .put_u8(space.kind as u8)
                .put_u64(space.start)
                .put_u64(space.size);
        })
    }

    /// Arrays are written with their length; other objects with their size
    pub fn alloc(&mut self, alloc: &Allocation) -> &mut Self {
        self.record(TAG_ALLOC, |p| {
            let mut flags = 0;
            if alloc.array_length.is_some() {
                flags |= ALLOC_FLAG_ARRAY;
            }
            if alloc.is_mirror {
                flags |= ALLOC_FLAG_MIRROR;
            }
            p.put_u8(alloc.kind.as_u8())
                .put_u8(flags)
                .put_u32(alloc.thread)
                .put_u32(alloc.site)
                .put_u32(alloc.type_id)
                .put_u64(alloc.addr)
                .put_u32(alloc.array_length.unwrap_or(alloc.size as u32));
        })
    }

    pub fn move_object(&mut self, from: Address, to: Address) -> &mut Self {
        self.record(TAG_MOVE, |p| {
            p.put_u64(from).put_u64(to);
        })
    }

    pub fn die(&mut self, addr: Address) -> &mut Self {
        self.record(TAG_DIE, |p| {
            p.put_u64(addr);
        })
    }

    pub fn pointer(&mut self, addr: Address, slot: u32, target: Address) -> &mut Self {
        self.record(TAG_PTR_UPDATE, |p| {
            p.put_u64(addr).put_u32(slot).put_u64(target);
        })
    }

    /// Up to three roots go inline, more use the overflow record
    pub fn roots(&mut self, roots: &[(RootPtr, Address)]) -> &mut Self {
        if roots.is_empty() {
            return self;
        }
        let inline = roots.len() <= MAX_ROOTS_PER_EVENT;
        let tag = if inline { TAG_ROOTS } else { TAG_ROOTS_OVERFLOW };
        self.record(tag, |p| {
            if inline {
                p.put_u8(roots.len() as u8);
            } else {
                p.put_u32(roots.len() as u32);
            }
            for (root, target) in roots {
                write_root(p, root);
                p.put_u64(*target);
            }
        })
    }

    pub fn nop(&mut self, len: usize) -> &mut Self {
        self.raw_record(TAG_NOP, &vec![0u8; len])
    }

    pub fn event(&mut self, event: &Event) -> &mut Self {
        match event {
            Event::Allocate(a) => self.alloc(a),
            Event::Move { from, to } => self.move_object(*from, *to),
            Event::Die { addr } => self.die(*addr),
            Event::PointerUpdate { addr, slot, target } => self.pointer(*addr, *slot, *target),
            Event::RootUpdate { root, target } => self.roots(&[(root.clone(), *target)]),
            Event::GcStart(info) => self.gc_start(info),
            Event::GcEnd(info) => self.gc_end(info),
            Event::SpaceCreate(space) => self.space(space),
        }
    }
}
