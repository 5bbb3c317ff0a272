//! HPROF heap dumps.
//!
//! Decoding takes two passes over the file. [`HprofSymbols::scan`] reads
//! the string table, class loads, stack traces and class dumps into an
//! immutable symbol table. [`HprofDecoder`] then turns every heap-dump
//! sub-record into core events.

use super::scanner::{be_i32, be_u16, be_u32, be_u64, be_u8, id, mapped, parse_body, take, utf8, Parsed, WireError};
use super::*;
use crate::config::CallContextMode;
use crate::constants::UNKNOWN_ID;
use crate::error::{DecodeError, ProtocolError, SymbolKind};
use crate::heap::{RootKind, RootPtr};
use crate::symbols::{
    external_name, trim_call_chain, AllocatedType, AllocationSite, CallSite, FieldInfo, Symbols,
    TypeLayout,
};
use crate::util::{align_up, array_header_size, object_header_size};
use nom::bytes::streaming::take_till;
use nom::multi::count;
use smallvec::SmallVec;
use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::sync::Arc;

const TAG_UTF8: u8 = 0x01;
const TAG_LOAD_CLASS: u8 = 0x02;
const TAG_UNLOAD_CLASS: u8 = 0x03;
const TAG_FRAME: u8 = 0x04;
const TAG_TRACE: u8 = 0x05;
const TAG_ALLOC_SITES: u8 = 0x06;
const TAG_HEAP_SUMMARY: u8 = 0x07;
const TAG_START_THREAD: u8 = 0x0a;
const TAG_END_THREAD: u8 = 0x0b;
const TAG_HEAP_DUMP: u8 = 0x0c;
const TAG_CPU_SAMPLES: u8 = 0x0d;
const TAG_CONTROL_SETTINGS: u8 = 0x0e;
const TAG_HEAP_DUMP_SEGMENT: u8 = 0x1c;
const TAG_HEAP_DUMP_END: u8 = 0x2c;

const SUB_ROOT_UNKNOWN: u8 = 0xff;
const SUB_ROOT_JNI_GLOBAL: u8 = 0x01;
const SUB_ROOT_JNI_LOCAL: u8 = 0x02;
const SUB_ROOT_JAVA_FRAME: u8 = 0x03;
const SUB_ROOT_NATIVE_STACK: u8 = 0x04;
const SUB_ROOT_STICKY_CLASS: u8 = 0x05;
const SUB_ROOT_THREAD_BLOCK: u8 = 0x06;
const SUB_ROOT_MONITOR_USED: u8 = 0x07;
const SUB_ROOT_THREAD_OBJECT: u8 = 0x08;
const SUB_CLASS_DUMP: u8 = 0x20;
const SUB_INSTANCE_DUMP: u8 = 0x21;
const SUB_OBJ_ARRAY_DUMP: u8 = 0x22;
const SUB_PRIM_ARRAY_DUMP: u8 = 0x23;

pub const BASIC_OBJECT: u8 = 2;
pub const BASIC_BOOLEAN: u8 = 4;
pub const BASIC_CHAR: u8 = 5;
pub const BASIC_FLOAT: u8 = 6;
pub const BASIC_DOUBLE: u8 = 7;
pub const BASIC_BYTE: u8 = 8;
pub const BASIC_SHORT: u8 = 9;
pub const BASIC_INT: u8 = 10;
pub const BASIC_LONG: u8 = 11;

const PRIMITIVE_ARRAYS: [(u8, &str); 8] = [
    (BASIC_BOOLEAN, "[Z"),
    (BASIC_CHAR, "[C"),
    (BASIC_FLOAT, "[F"),
    (BASIC_DOUBLE, "[D"),
    (BASIC_BYTE, "[B"),
    (BASIC_SHORT, "[S"),
    (BASIC_INT, "[I"),
    (BASIC_LONG, "[J"),
];

/// Longest format string accepted before its terminating NUL
const MAX_FORMAT_LEN: usize = 64;

/// Width in bytes of a basic type; `None` for an unknown type code
pub fn basic_type_size(ty: u8, id_size: u32) -> Option<u32> {
    match ty {
        BASIC_OBJECT => Some(id_size),
        BASIC_BOOLEAN | BASIC_BYTE => Some(1),
        BASIC_CHAR | BASIC_SHORT => Some(2),
        BASIC_FLOAT | BASIC_INT => Some(4),
        BASIC_DOUBLE | BASIC_LONG => Some(8),
        _ => None,
    }
}

fn descriptor_size(descriptor_char: Option<char>, id_size: u32) -> u32 {
    match descriptor_char {
        Some('Z') | Some('B') => 1,
        Some('C') | Some('S') => 2,
        Some('I') | Some('F') => 4,
        Some('J') | Some('D') => 8,
        _ => id_size,
    }
}

fn basic_type_descriptor(ty: u8) -> &'static str {
    match ty {
        BASIC_OBJECT => "Ljava/lang/Object;",
        BASIC_BOOLEAN => "Z",
        BASIC_CHAR => "C",
        BASIC_FLOAT => "F",
        BASIC_DOUBLE => "D",
        BASIC_BYTE => "B",
        BASIC_SHORT => "S",
        BASIC_INT => "I",
        _ => "J",
    }
}

/// The file header: format string, identifier size, timestamp
fn header(input: &[u8]) -> Parsed<u32> {
    let window = &input[..input.len().min(MAX_FORMAT_LEN + 1)];
    let (_, format) = match take_till::<_, _, WireError>(|b: u8| b == 0)(window) {
        Err(nom::Err::Incomplete(_)) if window.len() > MAX_FORMAT_LEN => {
            return Err(WireError::invalid(input, "HPROF header"))
        }
        other => other?,
    };
    if !format.starts_with(b"JAVA PROFILE") {
        return Err(WireError::invalid(input, "HPROF header"));
    }
    let (rest, _) = take(input, format.len() + 1)?;
    let (after, id_size) = be_u32(rest)?;
    if id_size != 4 && id_size != 8 {
        return Err(WireError::invalid(rest, format!("identifier size {}", id_size)));
    }
    let (after, _timestamp) = be_u64(after)?;
    Ok((after, id_size))
}

/// Tag and body length of a top-level record
fn record_header(input: &[u8]) -> Parsed<(u8, u64)> {
    let (input, tag) = be_u8(input)?;
    let (input, _time) = be_u32(input)?;
    let (input, len) = be_u32(input)?;
    Ok((input, (tag, len as u64)))
}

fn is_known_top_level(tag: u8) -> bool {
    matches!(
        tag,
        TAG_UTF8
            | TAG_LOAD_CLASS
            | TAG_UNLOAD_CLASS
            | TAG_FRAME
            | TAG_TRACE
            | TAG_ALLOC_SITES
            | TAG_HEAP_SUMMARY
            | TAG_START_THREAD
            | TAG_END_THREAD
            | TAG_HEAP_DUMP
            | TAG_CPU_SAMPLES
            | TAG_CONTROL_SETTINGS
            | TAG_HEAP_DUMP_SEGMENT
            | TAG_HEAP_DUMP_END
    )
}

struct ClassDump {
    class_id: u64,
    stack_serial: u32,
    super_id: u64,
    instance_size: u32,
    statics: Vec<(u64, u8, u64)>,
    fields: Vec<(u64, u8)>,
}

/// A value of basic type `ty`
fn value(input: &[u8], ty: u8, id_size: u32) -> Parsed<u64> {
    match basic_type_size(ty, id_size) {
        _ if ty == BASIC_OBJECT => id(input, id_size),
        Some(1) => be_u8(input).map(|(i, v)| (i, v as u64)),
        Some(2) => be_u16(input).map(|(i, v)| (i, v as u64)),
        Some(4) => be_u32(input).map(|(i, v)| (i, v as u64)),
        Some(_) => be_u64(input),
        None => Err(WireError::invalid(input, format!("basic type {}", ty))),
    }
}

fn basic_type(input: &[u8], id_size: u32) -> Parsed<u8> {
    let (rest, ty) = be_u8(input)?;
    match basic_type_size(ty, id_size) {
        Some(_) => Ok((rest, ty)),
        None => Err(WireError::invalid(input, format!("basic type {}", ty))),
    }
}

/// A type code followed by a value of that type
fn typed_value(input: &[u8], id_size: u32) -> Parsed<(u8, u64)> {
    let (input, ty) = basic_type(input, id_size)?;
    let (input, v) = value(input, ty, id_size)?;
    Ok((input, (ty, v)))
}

/// Values of each field type in turn
fn field_values<'a>(mut input: &'a [u8], types: &[u8], id_size: u32) -> Parsed<'a, Vec<u64>> {
    let mut values = Vec::with_capacity(types.len());
    for ty in types {
        let (rest, v) = value(input, *ty, id_size)?;
        values.push(v);
        input = rest;
    }
    Ok((input, values))
}

fn class_dump(input: &[u8], id_size: u32) -> Parsed<ClassDump> {
    let (input, class_id) = id(input, id_size)?;
    let (input, stack_serial) = be_u32(input)?;
    let (input, super_id) = id(input, id_size)?;
    // loader, signers, protection domain, two reserved
    let (input, _) = take(input, 5 * id_size as usize)?;
    let (input, instance_size) = be_u32(input)?;
    let (input, pool) = be_u16(input)?;
    let (input, _) = count(
        |i| {
            let (i, _) = be_u16(i)?;
            typed_value(i, id_size)
        },
        pool as usize,
    )(input)?;
    let (input, nstatics) = be_u16(input)?;
    let (input, statics) = count(
        |i| {
            let (i, name) = id(i, id_size)?;
            let (i, (ty, v)) = typed_value(i, id_size)?;
            Ok((i, (name, ty, v)))
        },
        nstatics as usize,
    )(input)?;
    let (input, nfields) = be_u16(input)?;
    let (input, fields) = count(
        |i| {
            let (i, name) = id(i, id_size)?;
            let (i, ty) = basic_type(i, id_size)?;
            Ok((i, (name, ty)))
        },
        nfields as usize,
    )(input)?;
    Ok((
        input,
        ClassDump {
            class_id,
            stack_serial,
            super_id,
            instance_size,
            statics,
            fields,
        },
    ))
}

/// Fixed part of an instance dump: address, stack serial, class and the
/// length of the field data that follows
fn instance_header(input: &[u8], id_size: u32) -> Parsed<(u64, u32, u64, u32)> {
    let (input, addr) = id(input, id_size)?;
    let (input, stack) = be_u32(input)?;
    let (input, class_id) = id(input, id_size)?;
    let (input, len) = be_u32(input)?;
    Ok((input, (addr, stack, class_id, len)))
}

/// Address, stack serial and length shared by both array dumps
fn array_header(input: &[u8], id_size: u32) -> Parsed<(u64, u32, u32)> {
    let (input, addr) = id(input, id_size)?;
    let (input, stack) = be_u32(input)?;
    let (input, len) = be_u32(input)?;
    Ok((input, (addr, stack, len)))
}

/// Element type and width of a primitive array dump
fn primitive_type(input: &[u8], id_size: u32) -> Parsed<(u8, u32)> {
    mapped(input, be_u8, "primitive array type", |ty| {
        basic_type_size(ty, id_size)
            .filter(|_| ty != BASIC_OBJECT)
            .map(|width| (ty, width))
    })
}

/// Target of a root sub-record, plus the thread serial and frame or stack
/// number where the sub-record carries them
fn root_fields(input: &[u8], tag: u8, id_size: u32) -> Parsed<(u64, u32, u32)> {
    let (input, target) = id(input, id_size)?;
    match tag {
        SUB_ROOT_JNI_GLOBAL => {
            let (input, _jni_ref) = id(input, id_size)?;
            Ok((input, (target, 0, 0)))
        }
        SUB_ROOT_JNI_LOCAL | SUB_ROOT_JAVA_FRAME | SUB_ROOT_THREAD_OBJECT => {
            let (input, thread) = be_u32(input)?;
            let (input, frame) = be_u32(input)?;
            Ok((input, (target, thread, frame)))
        }
        SUB_ROOT_NATIVE_STACK | SUB_ROOT_THREAD_BLOCK => {
            let (input, thread) = be_u32(input)?;
            Ok((input, (target, thread, 0)))
        }
        _ => Ok((input, (target, 0, 0))),
    }
}

fn is_root_sub_record(tag: u8) -> bool {
    matches!(
        tag,
        SUB_ROOT_UNKNOWN
            | SUB_ROOT_JNI_GLOBAL
            | SUB_ROOT_JNI_LOCAL
            | SUB_ROOT_JAVA_FRAME
            | SUB_ROOT_NATIVE_STACK
            | SUB_ROOT_STICKY_CLASS
            | SUB_ROOT_THREAD_BLOCK
            | SUB_ROOT_MONITOR_USED
            | SUB_ROOT_THREAD_OBJECT
    )
}

/// Skip a sub-record other than a class dump
fn skip_sub_record<R: Read>(s: &mut Scanner<R>, tag: u8, id_size: u32, start: u64) -> Result<(), TraceError> {
    match tag {
        _ if is_root_sub_record(tag) => s.parse(|i| root_fields(i, tag, id_size)).map(drop),
        SUB_INSTANCE_DUMP => {
            let (_, _, _, len) = s.parse(|i| instance_header(i, id_size))?;
            s.skip(len as u64)
        }
        SUB_OBJ_ARRAY_DUMP => {
            let (_, _, n) = s.parse(|i| array_header(i, id_size))?;
            s.skip(id_size as u64 + n as u64 * id_size as u64)
        }
        SUB_PRIM_ARRAY_DUMP => {
            let (_, _, n) = s.parse(|i| array_header(i, id_size))?;
            let (_, width) = s.parse(|i| primitive_type(i, id_size))?;
            s.skip(n as u64 * width as u64)
        }
        _ => Err(DecodeError::UnknownTag { offset: start, tag }.into()),
    }
}

/// Symbol table and class layouts recovered from a heap dump
#[derive(Debug)]
pub struct HprofSymbols {
    pub symbols: Arc<Symbols>,
    id_size: u32,
    class_types: HashMap<u64, u32>,
    /// Own instance fields of each type, in dump order
    instance_fields: HashMap<u32, Vec<u8>>,
    prim_array_types: HashMap<u8, u32>,
    object_array_type: u32,
    class_type: u32,
    trace_threads: HashMap<u32, u32>,
}

#[derive(Default)]
struct ScanState {
    strings: HashMap<u64, String>,
    class_names: HashMap<u64, u64>,
    class_serials: HashMap<u32, u64>,
    frames: HashMap<u64, (u64, u64, u32)>,
    traces: Vec<(u32, u32, Vec<u64>)>,
    dumps: Vec<ClassDump>,
}

impl HprofSymbols {
    pub fn id_size(&self) -> u32 {
        self.id_size
    }

    pub fn type_of_class(&self, class_id: u64) -> Option<u32> {
        self.class_types.get(&class_id).copied()
    }

    pub fn scan<R: Read>(reader: R, mode: CallContextMode, lenient: bool) -> Result<HprofSymbols, TraceError> {
        let mut s = Scanner::new(reader);
        let id_size = s.parse(header)?;
        let mut state = ScanState::default();
        match Self::scan_records(&mut s, id_size, &mut state, lenient) {
            Ok(()) => {}
            Err(TraceError::Decode(DecodeError::UnexpectedEof { offset })) if lenient => {
                warn!("Heap dump truncated at offset {}, using the symbols read so far", offset);
            }
            Err(e) => return Err(e),
        }
        Ok(Self::build(state, id_size, mode))
    }

    fn scan_records<R: Read>(
        s: &mut Scanner<R>,
        id_size: u32,
        state: &mut ScanState,
        lenient: bool,
    ) -> Result<(), TraceError> {
        while !s.at_eof()? {
            let start = s.offset();
            let (tag, len) = s.parse(record_header)?;
            let body = s.offset();
            match tag {
                TAG_UTF8 => {
                    if len < id_size as u64 {
                        return Err(DecodeError::invalid(start, "UTF8 record length").into());
                    }
                    let text_len = (len - id_size as u64) as usize;
                    let (string_id, text) = s.parse(|i| {
                        let (i, string_id) = id(i, id_size)?;
                        let (i, text) = utf8(i, text_len)?;
                        Ok((i, (string_id, text)))
                    })?;
                    state.strings.insert(string_id, text);
                }
                TAG_LOAD_CLASS => {
                    let (serial, class_id, name) = s.parse(|i| {
                        let (i, serial) = be_u32(i)?;
                        let (i, class_id) = id(i, id_size)?;
                        let (i, _stack) = be_u32(i)?;
                        let (i, name) = id(i, id_size)?;
                        Ok((i, (serial, class_id, name)))
                    })?;
                    state.class_names.insert(class_id, name);
                    state.class_serials.insert(serial, class_id);
                }
                TAG_FRAME => {
                    let (frame, method, signature, class_serial) = s.parse(|i| {
                        let (i, frame) = id(i, id_size)?;
                        let (i, method) = id(i, id_size)?;
                        let (i, signature) = id(i, id_size)?;
                        let (i, _source) = id(i, id_size)?;
                        let (i, class_serial) = be_u32(i)?;
                        let (i, _line) = be_i32(i)?;
                        Ok((i, (frame, method, signature, class_serial)))
                    })?;
                    state.frames.insert(frame, (method, signature, class_serial));
                }
                TAG_TRACE => {
                    let trace = s.parse(|i| {
                        let (i, serial) = be_u32(i)?;
                        let (i, thread) = be_u32(i)?;
                        let (i, n) = be_u32(i)?;
                        let (i, frames) = count(|i| id(i, id_size), n as usize)(i)?;
                        Ok((i, (serial, thread, frames)))
                    })?;
                    state.traces.push(trace);
                }
                TAG_HEAP_DUMP | TAG_HEAP_DUMP_SEGMENT => {
                    let end = body + len;
                    while s.offset() < end {
                        let sub = s.offset();
                        let sub_tag = s.parse(be_u8)?;
                        if sub_tag == SUB_CLASS_DUMP {
                            state.dumps.push(s.parse(|i| class_dump(i, id_size))?);
                        } else {
                            skip_sub_record(s, sub_tag, id_size, sub)?;
                        }
                    }
                }
                _ if is_known_top_level(tag) => s.skip(len)?,
                _ => {
                    let err = DecodeError::UnknownTag { offset: start, tag };
                    if !lenient {
                        return Err(err.into());
                    }
                    warn!("{}, skipping {} bytes", err, len);
                    s.skip(len)?;
                }
            }
            let consumed = s.offset() - body;
            if consumed != len {
                return Err(DecodeError::RecordSizeMismatch {
                    offset: start,
                    declared: len,
                    consumed,
                }
                .into());
            }
        }
        Ok(())
    }

    fn build(state: ScanState, id_size: u32, mode: CallContextMode) -> HprofSymbols {
        let mut symbols = Symbols::new(id_size);
        let mut class_types = HashMap::new();
        let mut instance_fields = HashMap::new();
        let string = |id: u64| state.strings.get(&id).cloned();
        let class_name = |class_id: u64| {
            state
                .class_names
                .get(&class_id)
                .and_then(|name| string(*name))
                .unwrap_or_else(|| format!("unknown-class@{:#x}", class_id))
        };

        let mut next_type = 1u32;
        for dump in &state.dumps {
            class_types.insert(dump.class_id, next_type);
            next_type += 1;
        }
        for dump in &state.dumps {
            let id = class_types[&dump.class_id];
            let name = class_name(dump.class_id);
            let layout = if let Some(element) = name.strip_prefix('[') {
                TypeLayout::Array {
                    header: array_header_size(id_size),
                    element: descriptor_size(element.chars().next(), id_size),
                }
            } else {
                TypeLayout::Instance {
                    size: object_header_size(id_size) + dump.instance_size,
                }
            };
            let mut fields = vec![];
            let mut offset = object_header_size(id_size);
            for (field_name, ty) in &dump.fields {
                fields.push(FieldInfo {
                    name: string(*field_name).unwrap_or_default(),
                    signature: basic_type_descriptor(*ty).to_string(),
                    offset,
                    is_static: false,
                });
                offset += basic_type_size(*ty, id_size).unwrap_or(id_size);
            }
            for (field_name, ty, _) in &dump.statics {
                fields.push(FieldInfo {
                    name: string(*field_name).unwrap_or_default(),
                    signature: basic_type_descriptor(*ty).to_string(),
                    offset: 0,
                    is_static: true,
                });
            }
            instance_fields.insert(id, dump.fields.iter().map(|(_, ty)| *ty).collect::<Vec<u8>>());
            symbols.insert_type(AllocatedType {
                id,
                super_id: class_types.get(&dump.super_id).copied(),
                name,
                layout,
                fields,
            });
        }

        let mut synthesize = |symbols: &mut Symbols, name: &str, layout: TypeLayout| -> u32 {
            if let Some(ty) = symbols.type_by_name(name) {
                return ty.id;
            }
            let id = next_type;
            next_type += 1;
            symbols.insert_type(AllocatedType {
                id,
                super_id: None,
                name: name.to_string(),
                layout,
                fields: vec![],
            });
            id
        };
        let mut prim_array_types = HashMap::new();
        for (ty, name) in PRIMITIVE_ARRAYS {
            let layout = TypeLayout::Array {
                header: array_header_size(id_size),
                element: basic_type_size(ty, id_size).unwrap_or(1),
            };
            prim_array_types.insert(ty, synthesize(&mut symbols, name, layout));
        }
        let object_array_type = synthesize(
            &mut symbols,
            "[Ljava/lang/Object;",
            TypeLayout::Array {
                header: array_header_size(id_size),
                element: id_size,
            },
        );
        let class_type = synthesize(
            &mut symbols,
            "java/lang/Class",
            TypeLayout::Instance {
                size: object_header_size(id_size),
            },
        );

        symbols.insert_site(AllocationSite {
            id: 0,
            allocated_type: None,
            call_sites: vec![],
        });
        let mut trace_threads = HashMap::new();
        for (serial, thread, frame_ids) in &state.traces {
            trace_threads.insert(*serial, *thread);
            let frames = frame_ids
                .iter()
                .filter_map(|f| state.frames.get(f))
                .map(|(method, signature, class_serial)| {
                    let declaring = state
                        .class_serials
                        .get(class_serial)
                        .map(|c| class_name(*c))
                        .unwrap_or_default();
                    let signature = string(*signature).unwrap_or_default();
                    let params = signature
                        .strip_prefix('(')
                        .and_then(|s| s.split(')').next())
                        .unwrap_or("")
                        .to_string();
                    let call_site = CallSite {
                        declaring_type: external_name(&declaring),
                        method: string(*method).unwrap_or_default(),
                        params,
                        bci: -1,
                    };
                    (call_site, false)
                })
                .collect();
            symbols.insert_site(AllocationSite {
                id: *serial,
                allocated_type: None,
                call_sites: trim_call_chain(frames, mode),
            });
        }

        debug!(
            "Heap dump declares {} classes and {} stack traces",
            state.dumps.len(),
            state.traces.len()
        );
        HprofSymbols {
            symbols: Arc::new(symbols),
            id_size,
            class_types,
            instance_fields,
            prim_array_types,
            object_array_type,
            class_type,
            trace_threads,
        }
    }

    fn site_of(&self, stack_serial: u32) -> u32 {
        if self.symbols.site(stack_serial).is_some() {
            stack_serial
        } else {
            0
        }
    }

    fn thread_of(&self, stack_serial: u32) -> u32 {
        self.trace_threads.get(&stack_serial).copied().unwrap_or(0)
    }
}

pub struct HprofDecoder<R> {
    scanner: Scanner<R>,
    index: Arc<HprofSymbols>,
    pending: VecDeque<TracedEvent>,
    /// Start, declared length and end of the heap-dump segment being read
    segment: Option<(u64, u64, u64)>,
    lenient: bool,
    stop_offset: Option<u64>,
    done: bool,
}

impl<R: Read> HprofDecoder<R> {
    pub fn new(reader: R, index: Arc<HprofSymbols>) -> Result<Self, TraceError> {
        let mut scanner = Scanner::new(reader);
        let id_size = scanner.parse(header)?;
        if id_size != index.id_size {
            return Err(DecodeError::invalid(0, "identifier size differs from the symbol pass").into());
        }
        Ok(HprofDecoder {
            scanner,
            index,
            pending: VecDeque::new(),
            segment: None,
            lenient: false,
            stop_offset: None,
            done: false,
        })
    }

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

    pub fn symbols(&self) -> &Arc<Symbols> {
        &self.index.symbols
    }

    fn step(&mut self) -> Result<bool, TraceError> {
        if let Some((start, declared, end)) = self.segment {
            let offset = self.scanner.offset();
            if offset == end {
                self.segment = None;
                return Ok(true);
            }
            let mut events = SmallVec::<[Event; 4]>::new();
            match self.decode_sub_record(&mut events) {
                Ok(()) => {}
                Err(TraceError::Decode(e @ DecodeError::UnknownTag { .. })) if self.lenient => {
                    warn!("{}, skipping the rest of the segment", e);
                    let here = self.scanner.offset();
                    self.scanner.skip(end.saturating_sub(here))?;
                }
                Err(e) => return Err(e),
            }
            if self.scanner.offset() > end {
                return Err(DecodeError::RecordSizeMismatch {
                    offset: start,
                    declared,
                    consumed: self.scanner.offset() - (end - declared),
                }
                .into());
            }
            self.pending
                .extend(events.into_iter().map(|event| TracedEvent { offset, event }));
            return Ok(true);
        }

        let start = self.scanner.offset();
        if self.stop_offset.is_some_and(|stop| start >= stop) {
            return Ok(false);
        }
        if self.scanner.at_eof()? {
            return Ok(false);
        }
        let (tag, len) = self.scanner.parse(record_header)?;
        match tag {
            TAG_HEAP_DUMP | TAG_HEAP_DUMP_SEGMENT => {
                let body = self.scanner.offset();
                self.segment = Some((start, len, body + len));
            }
            _ if is_known_top_level(tag) => self.scanner.skip(len)?,
            _ => {
                let err = DecodeError::UnknownTag { offset: start, tag };
                if !self.lenient {
                    return Err(err.into());
                }
                warn!("{}, skipping {} bytes", err, len);
                self.scanner.skip(len)?;
            }
        }
        Ok(true)
    }

    fn decode_sub_record(&mut self, events: &mut SmallVec<[Event; 4]>) -> Result<(), TraceError> {
        let start = self.scanner.offset();
        let id_size = self.index.id_size;
        let tag = self.scanner.parse(be_u8)?;
        match tag {
            _ if is_root_sub_record(tag) => {
                let (target, thread, frame) = self.scanner.parse(|i| root_fields(i, tag, id_size))?;
                if target == 0 {
                    return Ok(());
                }
                let thread = thread as u64;
                let root = match tag {
                    SUB_ROOT_JNI_GLOBAL => RootPtr::JniGlobal { weak: false },
                    SUB_ROOT_JNI_LOCAL => RootPtr::JniLocal { thread },
                    SUB_ROOT_JAVA_FRAME => RootPtr::LocalVariable {
                        thread,
                        class_id: UNKNOWN_ID,
                        method_id: UNKNOWN_ID,
                        slot: frame,
                    },
                    SUB_ROOT_NATIVE_STACK | SUB_ROOT_THREAD_BLOCK | SUB_ROOT_THREAD_OBJECT => {
                        RootPtr::VmInternalThreadData { thread }
                    }
                    SUB_ROOT_STICKY_CLASS => RootPtr::Class {
                        class_id: self.index.type_of_class(target).unwrap_or(UNKNOWN_ID),
                    },
                    SUB_ROOT_MONITOR_USED => RootPtr::Other(RootKind::BusyMonitor),
                    _ => RootPtr::Debug {
                        vm_call: "unknown".to_string(),
                    },
                };
                events.push(Event::RootUpdate { root, target });
            }
            SUB_CLASS_DUMP => {
                let dump = self.scanner.parse(|i| class_dump(i, id_size))?;
                self.class_dump(dump, events);
            }
            SUB_INSTANCE_DUMP => self.instance_dump(start, events)?,
            SUB_OBJ_ARRAY_DUMP => {
                let ((addr, stack, n), class_id) = self.scanner.parse(|i| {
                    let (i, header) = array_header(i, id_size)?;
                    let (i, class_id) = id(i, id_size)?;
                    Ok((i, (header, class_id)))
                })?;
                let type_id = self
                    .index
                    .type_of_class(class_id)
                    .unwrap_or(self.index.object_array_type);
                events.push(self.allocation(addr, stack, type_id, Some(n), None));
                for slot in 0..n {
                    let target = self.scanner.parse(|i| id(i, id_size))?;
                    if target != 0 {
                        events.push(Event::PointerUpdate { addr, slot, target });
                    }
                }
            }
            SUB_PRIM_ARRAY_DUMP => {
                let (addr, stack, n) = self.scanner.parse(|i| array_header(i, id_size))?;
                let ty_offset = self.scanner.offset();
                let (ty, width) = self.scanner.parse(|i| primitive_type(i, id_size))?;
                let type_id = *self
                    .index
                    .prim_array_types
                    .get(&ty)
                    .ok_or_else(|| DecodeError::invalid(ty_offset, format!("primitive array type {}", ty)))?;
                self.scanner.skip(n as u64 * width as u64)?;
                events.push(self.allocation(addr, stack, type_id, Some(n), None));
            }
            _ => return Err(DecodeError::UnknownTag { offset: start, tag }.into()),
        }
        Ok(())
    }

    fn allocation(&self, addr: u64, stack: u32, type_id: u32, array_length: Option<u32>, mirror_size: Option<u64>) -> Event {
        let size = match mirror_size {
            Some(size) => size,
            None => self
                .index
                .symbols
                .allocated_type(type_id)
                .map(|t| t.object_size(array_length, self.index.id_size))
                .unwrap_or(0),
        };
        Event::Allocate(Allocation {
            addr,
            thread: self.index.thread_of(stack),
            site: self.index.site_of(stack),
            type_id,
            kind: AllocKind::Dump,
            size,
            array_length,
            is_mirror: mirror_size.is_some(),
        })
    }

    /// The class object itself, plus one pointer per non-null static reference
    fn class_dump(&self, dump: ClassDump, events: &mut SmallVec<[Event; 4]>) {
        let id_size = self.index.id_size;
        let statics: u64 = dump
            .statics
            .iter()
            .map(|(_, ty, _)| basic_type_size(*ty, id_size).unwrap_or(id_size) as u64)
            .sum();
        let size = align_up(object_header_size(id_size) as u64 + statics, id_size as u64);
        events.push(self.allocation(dump.class_id, dump.stack_serial, self.index.class_type, None, Some(size)));
        let references = dump.statics.iter().filter(|(_, ty, _)| *ty == BASIC_OBJECT);
        for (slot, (_, _, value)) in references.enumerate() {
            if *value != 0 {
                events.push(Event::PointerUpdate {
                    addr: dump.class_id,
                    slot: slot as u32,
                    target: *value,
                });
            }
        }
    }

    fn instance_dump(&mut self, start: u64, events: &mut SmallVec<[Event; 4]>) -> Result<(), TraceError> {
        let id_size = self.index.id_size;
        let (addr, stack, class_id, len) = self.scanner.parse(|i| instance_header(i, id_size))?;
        let data_start = self.scanner.offset();
        let data = self.scanner.bytes(len as usize)?;
        let type_id = self
            .index
            .type_of_class(class_id)
            .ok_or(ProtocolError::MissingSymbol {
                kind: SymbolKind::Class,
                id: class_id,
                offset: start,
            })?;
        events.push(self.allocation(addr, stack, type_id, None, None));

        // fields of the class itself come first, then each superclass
        let mut types = Vec::new();
        let mut current = Some(type_id);
        while let Some(ty) = current {
            types.extend(self.index.instance_fields.get(&ty).into_iter().flatten());
            current = self
                .index
                .symbols
                .allocated_type(ty)
                .and_then(|t| t.super_id);
        }
        let (values, consumed) = parse_body(start, data_start, &data, |i| field_values(i, &types, id_size))?;
        if consumed != len as u64 {
            return Err(DecodeError::RecordSizeMismatch {
                offset: start,
                declared: len as u64,
                consumed,
            }
            .into());
        }
        let references = types
            .iter()
            .zip(values)
            .filter(|(ty, _)| **ty == BASIC_OBJECT)
            .map(|(_, v)| v);
        for (slot, target) in references.enumerate() {
            if target != 0 {
                events.push(Event::PointerUpdate {
                    addr,
                    slot: slot as u32,
                    target,
                });
            }
        }
        Ok(())
    }
}

impl<R: Read> Iterator for HprofDecoder<R> {
    type Item = Result<TracedEvent, TraceError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(e) = self.pending.pop_front() {
                return Some(Ok(e));
            }
            if self.done {
                return None;
            }
            match self.step() {
                Ok(true) => continue,
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(TraceError::Decode(DecodeError::UnexpectedEof { offset })) if self.lenient => {
                    warn!("Heap dump truncated at offset {}, stopping", offset);
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

impl<R: Read> EventSource for HprofDecoder<R> {
    fn position(&self) -> u64 {
        self.scanner.offset()
    }

    fn format(&self) -> TraceFormat {
        TraceFormat::Hprof
    }

    fn at_record_boundary(&self) -> bool {
        self.pending.is_empty() && self.segment.is_none()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds small heap dumps record by record
    pub(crate) struct HprofBuilder {
        id_size: u32,
        out: RecordBuf,
        segment: RecordBuf,
    }

    impl HprofBuilder {
        pub(crate) fn new(id_size: u32) -> Self {
            let mut out = RecordBuf::new();
            out.put_bytes(b"JAVA PROFILE 1.0.2\0").put_u32(id_size).put_u64(0);
            HprofBuilder {
                id_size,
                out,
                segment: RecordBuf::new(),
            }
        }

        fn top(&mut self, tag: u8, body: &RecordBuf) -> &mut Self {
            self.out
                .put_u8(tag)
                .put_u32(0)
                .put_u32(body.len() as u32)
                .put_bytes(body.as_slice());
            self
        }

        pub(crate) fn string(&mut self, id: u64, text: &str) -> &mut Self {
            let mut body = RecordBuf::new();
            body.put_id(self.id_size, id).put_bytes(text.as_bytes());
            self.top(TAG_UTF8, &body)
        }

        pub(crate) fn load_class(&mut self, serial: u32, class_id: u64, name_id: u64) -> &mut Self {
            let mut body = RecordBuf::new();
            body.put_u32(serial)
                .put_id(self.id_size, class_id)
                .put_u32(0)
                .put_id(self.id_size, name_id);
            self.top(TAG_LOAD_CLASS, &body)
        }

        pub(crate) fn frame(&mut self, frame: u64, method: u64, sig: u64, class_serial: u32) -> &mut Self {
            let mut body = RecordBuf::new();
            body.put_id(self.id_size, frame)
                .put_id(self.id_size, method)
                .put_id(self.id_size, sig)
                .put_id(self.id_size, 0)
                .put_u32(class_serial)
                .put_i32(12);
            self.top(TAG_FRAME, &body)
        }

        pub(crate) fn trace(&mut self, serial: u32, thread: u32, frames: &[u64]) -> &mut Self {
            let mut body = RecordBuf::new();
            body.put_u32(serial).put_u32(thread).put_u32(frames.len() as u32);
            for f in frames {
                body.put_id(self.id_size, *f);
            }
            self.top(TAG_TRACE, &body)
        }

        pub(crate) fn class_dump(&mut self, class_id: u64, super_id: u64, instance_size: u32, statics: &[(u64, u8, u64)], fields: &[(u64, u8)]) -> &mut Self {
            let id = self.id_size;
            let seg = &mut self.segment;
            seg.put_u8(SUB_CLASS_DUMP).put_id(id, class_id).put_u32(0).put_id(id, super_id);
            for _ in 0..5 {
                seg.put_id(id, 0);
            }
            seg.put_u32(instance_size).put_u16(0).put_u16(statics.len() as u16);
            for (name, ty, value) in statics {
                seg.put_id(id, *name).put_u8(*ty);
                put_value(seg, *ty, id, *value);
            }
            seg.put_u16(fields.len() as u16);
            for (name, ty) in fields {
                seg.put_id(id, *name).put_u8(*ty);
            }
            self
        }

        pub(crate) fn instance(&mut self, addr: u64, stack: u32, class_id: u64, values: &[(u8, u64)]) -> &mut Self {
            let id = self.id_size;
            let mut data = RecordBuf::new();
            for (ty, v) in values {
                put_value(&mut data, *ty, id, *v);
            }
            self.segment
                .put_u8(SUB_INSTANCE_DUMP)
                .put_id(id, addr)
                .put_u32(stack)
                .put_id(id, class_id)
                .put_u32(data.len() as u32)
                .put_bytes(data.as_slice());
            self
        }

        pub(crate) fn object_array(&mut self, addr: u64, class_id: u64, elements: &[u64]) -> &mut Self {
            let id = self.id_size;
            self.segment
                .put_u8(SUB_OBJ_ARRAY_DUMP)
                .put_id(id, addr)
                .put_u32(0)
                .put_u32(elements.len() as u32)
                .put_id(id, class_id);
            for e in elements {
                self.segment.put_id(id, *e);
            }
            self
        }

        pub(crate) fn prim_array(&mut self, addr: u64, ty: u8, len: u32) -> &mut Self {
            let width = basic_type_size(ty, self.id_size).unwrap();
            self.segment
                .put_u8(SUB_PRIM_ARRAY_DUMP)
                .put_id(self.id_size, addr)
                .put_u32(0)
                .put_u32(len)
                .put_u8(ty)
                .put_bytes(&vec![0u8; (len * width) as usize]);
            self
        }

        pub(crate) fn root_sticky_class(&mut self, class_id: u64) -> &mut Self {
            self.segment.put_u8(SUB_ROOT_STICKY_CLASS).put_id(self.id_size, class_id);
            self
        }

        pub(crate) fn root_java_frame(&mut self, target: u64, thread: u32, frame: u32) -> &mut Self {
            self.segment
                .put_u8(SUB_ROOT_JAVA_FRAME)
                .put_id(self.id_size, target)
                .put_u32(thread)
                .put_u32(frame);
            self
        }

        pub(crate) fn raw_sub_record(&mut self, bytes: &[u8]) -> &mut Self {
            self.segment.put_bytes(bytes);
            self
        }

        pub(crate) fn flush_segment(&mut self) -> &mut Self {
            let segment = std::mem::take(&mut self.segment);
            self.top(TAG_HEAP_DUMP_SEGMENT, &segment)
        }

        pub(crate) fn finish(&mut self) -> Vec<u8> {
            if !self.segment.is_empty() {
                self.flush_segment();
            }
            self.top(TAG_HEAP_DUMP_END, &RecordBuf::new());
            self.out.as_slice().to_vec()
        }
    }

    fn put_value(buf: &mut RecordBuf, ty: u8, id_size: u32, v: u64) {
        match basic_type_size(ty, id_size).unwrap() {
            1 => buf.put_u8(v as u8),
            2 => buf.put_u16(v as u16),
            4 => buf.put_u32(v as u32),
            _ => buf.put_u64(v),
        };
    }

    const BAR_CLASS: u64 = 0x100;
    const OBJECT_CLASS: u64 = 0x200;

    /// A `com/foo/Bar extends java/lang/Object` with an int and a reference
    /// field, two instances, a byte[10], an Object[3] and two roots
    pub(crate) fn sample_dump(id_size: u32) -> Vec<u8> {
        let mut b = HprofBuilder::new(id_size);
        b.string(1, "com/foo/Bar")
            .string(2, "java/lang/Object")
            .string(3, "next")
            .string(4, "count")
            .string(5, "make")
            .string(6, "(I)Lcom/foo/Bar;")
            .string(7, "CACHE")
            .load_class(1, BAR_CLASS, 1)
            .load_class(2, OBJECT_CLASS, 2)
            .frame(0x900, 5, 6, 1)
            .trace(7, 3, &[0x900])
            .class_dump(OBJECT_CLASS, 0, 0, &[], &[])
            .class_dump(BAR_CLASS, OBJECT_CLASS, 12, &[(7, BASIC_OBJECT, 0x1000)], &[(3, BASIC_OBJECT), (4, BASIC_INT)])
            .root_sticky_class(BAR_CLASS)
            .instance(0x1000, 7, BAR_CLASS, &[(BASIC_OBJECT, 0x2000), (BASIC_INT, 5)])
            .instance(0x2000, 0, BAR_CLASS, &[(BASIC_OBJECT, 0), (BASIC_INT, 6)])
            .flush_segment()
            .prim_array(0x3000, BASIC_BYTE, 10)
            .object_array(0x4000, 0xdead, &[0x1000, 0, 0x3000])
            .root_java_frame(0x4000, 3, 1);
        b.finish()
    }

    fn decode(bytes: &[u8], mode: CallContextMode) -> (Arc<HprofSymbols>, Vec<TracedEvent>) {
        let index = Arc::new(HprofSymbols::scan(bytes, mode, false).unwrap());
        let events = HprofDecoder::new(bytes, index.clone())
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        (index, events)
    }

    fn allocations(events: &[TracedEvent]) -> Vec<Allocation> {
        events
            .iter()
            .filter_map(|e| match &e.event {
                Event::Allocate(a) => Some(*a),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_symbol_pass() {
        let bytes = sample_dump(8);
        let (index, _) = decode(&bytes, CallContextMode::Full);
        let bar = index.type_of_class(BAR_CLASS).unwrap();
        let ty = index.symbols.allocated_type(bar).unwrap();
        assert_eq!(ty.external_name(), "com.foo.Bar");
        assert_eq!(ty.layout, TypeLayout::Instance { size: 16 + 12 });
        assert_eq!(ty.super_id, index.type_of_class(OBJECT_CLASS));
        assert_eq!(ty.fields.iter().filter(|f| f.is_static).count(), 1);
        let site = index.symbols.site(7).unwrap();
        assert_eq!(site.call_sites[0].declaring_type, "com.foo.Bar");
        assert_eq!(site.call_sites[0].method, "make");
        assert_eq!(site.call_sites[0].params, "I");
        assert!(index.symbols.type_by_name("[B").is_some());
    }

    #[test]
    fn test_byte_array_size() {
        for id_size in [4u32, 8] {
            let bytes = sample_dump(id_size);
            let (_, events) = decode(&bytes, CallContextMode::Full);
            let array = allocations(&events)
                .into_iter()
                .find(|a| a.addr == 0x3000)
                .unwrap();
            let expected = align_up((8 + id_size + 4 + 10) as u64, id_size as u64);
            assert_eq!(array.size, expected);
            assert_eq!(array.array_length, Some(10));
        }
    }

    #[test]
    fn test_instance_and_array_events() {
        let bytes = sample_dump(8);
        let (index, events) = decode(&bytes, CallContextMode::Full);
        let allocs = allocations(&events);
        assert_eq!(allocs.len(), 6);
        let mirror = allocs.iter().find(|a| a.addr == BAR_CLASS).unwrap();
        assert!(mirror.is_mirror);
        // header plus one static reference
        assert_eq!(mirror.size, 24);
        let first = allocs.iter().find(|a| a.addr == 0x1000).unwrap();
        assert_eq!(first.size, 32);
        assert_eq!(first.site, 7);
        assert_eq!(first.thread, 3);
        assert_eq!(first.kind, AllocKind::Dump);
        let objarray = allocs.iter().find(|a| a.addr == 0x4000).unwrap();
        assert_eq!(objarray.type_id, index.symbols.type_by_name("[Ljava/lang/Object;").unwrap().id);
        assert_eq!(objarray.size, align_up(20 + 3 * 8, 8));

        let pointers: Vec<(u64, u32, u64)> = events
            .iter()
            .filter_map(|e| match e.event {
                Event::PointerUpdate { addr, slot, target } => Some((addr, slot, target)),
                _ => None,
            })
            .collect();
        assert_eq!(
            pointers,
            vec![(BAR_CLASS, 0, 0x1000), (0x1000, 0, 0x2000), (0x4000, 0, 0x1000), (0x4000, 2, 0x3000)]
        );
    }

    #[test]
    fn test_roots() {
        let bytes = sample_dump(8);
        let (index, events) = decode(&bytes, CallContextMode::Full);
        let roots: Vec<(RootPtr, u64)> = events
            .iter()
            .filter_map(|e| match &e.event {
                Event::RootUpdate { root, target } => Some((root.clone(), *target)),
                _ => None,
            })
            .collect();
        assert_eq!(roots.len(), 2);
        assert_eq!(
            roots[0],
            (
                RootPtr::Class {
                    class_id: index.type_of_class(BAR_CLASS).unwrap()
                },
                BAR_CLASS
            )
        );
        assert_eq!(roots[1].0.kind(), RootKind::LocalVariable);
    }

    #[test]
    fn test_instance_size_mismatch() {
        let mut b = HprofBuilder::new(8);
        b.class_dump(BAR_CLASS, 0, 4, &[], &[(4, BASIC_INT)])
            .instance(0x1000, 0, BAR_CLASS, &[(BASIC_INT, 1), (BASIC_INT, 2)]);
        let bytes = b.finish();
        let index = Arc::new(HprofSymbols::scan(bytes.as_slice(), CallContextMode::Full, false).unwrap());
        let result: Result<Vec<_>, _> = HprofDecoder::new(bytes.as_slice(), index).unwrap().collect();
        assert!(matches!(
            result,
            Err(TraceError::Decode(DecodeError::RecordSizeMismatch { declared: 8, consumed: 4, .. }))
        ));
    }

    #[test]
    fn test_unknown_class() {
        let mut b = HprofBuilder::new(8);
        b.instance(0x1000, 0, 0x777, &[]);
        let bytes = b.finish();
        let index = Arc::new(HprofSymbols::scan(bytes.as_slice(), CallContextMode::Full, false).unwrap());
        let result: Result<Vec<_>, _> = HprofDecoder::new(bytes.as_slice(), index).unwrap().collect();
        assert!(matches!(
            result,
            Err(TraceError::Protocol(ProtocolError::MissingSymbol { kind: SymbolKind::Class, id: 0x777, .. }))
        ));
    }

    #[test]
    fn test_unknown_sub_record() {
        let mut b = HprofBuilder::new(8);
        b.prim_array(0x3000, BASIC_INT, 2).raw_sub_record(&[0x42, 0, 0]);
        let bytes = b.finish();
        assert!(matches!(
            HprofSymbols::scan(bytes.as_slice(), CallContextMode::Full, false),
            Err(TraceError::Decode(DecodeError::UnknownTag { tag: 0x42, .. }))
        ));
    }

    #[test]
    fn test_bad_identifier_size() {
        let mut out = RecordBuf::new();
        out.put_bytes(b"JAVA PROFILE 1.0.2\0").put_u32(2).put_u64(0);
        match HprofSymbols::scan(out.as_slice(), CallContextMode::Full, false) {
            Err(TraceError::Decode(DecodeError::InvalidValue { offset, .. })) => assert_eq!(offset, 19),
            other => panic!("unexpected {:?}", other),
        }
        let unterminated = vec![b'J'; 200];
        assert!(matches!(
            HprofSymbols::scan(unterminated.as_slice(), CallContextMode::Full, false),
            Err(TraceError::Decode(DecodeError::InvalidValue { offset: 0, .. }))
        ));
    }

    #[test]
    fn test_truncated_dump() {
        let bytes = sample_dump(8);
        let cut = bytes.len() - 20;
        let index = Arc::new(HprofSymbols::scan(&bytes[..cut], CallContextMode::Full, true).unwrap());
        let mut decoder = HprofDecoder::new(&bytes[..cut], index).unwrap();
        let err = decoder.find_map(|e| e.err()).unwrap();
        match err {
            TraceError::Decode(DecodeError::UnexpectedEof { offset }) => assert_eq!(offset, cut as u64),
            other => panic!("unexpected {:?}", other),
        }
    }
}
