//! Allocation-site and type metadata referenced by trace events.
//!
//! A [`Symbols`] table is loaded once per trace and shared read-only, so the
//! same table can back several concurrent parses.

use crate::config::CallContextMode;
use crate::constants::{NATIVE_FORMAT_VERSION, NATIVE_SYMBOLS_MAGIC, UNKNOWN_ID};
use crate::error::{DecodeError, ProtocolError, SymbolKind, TraceError};
use crate::trace::scanner::{be_i32, be_u16, be_u32, be_u8, checked, string, take, Parsed, WireError};
use crate::trace::{RecordBuf, Scanner};
use crate::util::align_up;
use nom::multi::count;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub mod features;

pub use features::{Feature, FeatureMap, OTHERS_FEATURE};

lazy_static! {
    static ref LOADED: Mutex<HashMap<(PathBuf, CallContextMode), Arc<Symbols>>> = Mutex::new(HashMap::new());
}

const SITE_MAGIC: u8 = 0x17;
const TYPE_MAGIC: u8 = 0x18;
const FIELD_MAGIC: u8 = 0x38;

const ACC_STATIC: u16 = 0x0008;

/// One frame of an allocation site's call chain
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CallSite {
    /// Declaring type, dotted external name
    pub declaring_type: String,
    pub method: String,
    /// Parameter descriptor without the enclosing parentheses
    pub params: String,
    /// Bytecode index, negative when unknown
    pub bci: i32,
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::{}({})",
            self.declaring_type, self.method, self.params
        )?;
        if self.bci >= 0 {
            write!(f, " @ {}", self.bci)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocationSite {
    pub id: u32,
    pub allocated_type: Option<u32>,
    /// Innermost frame first
    pub call_sites: Vec<CallSite>,
}

impl AllocationSite {
    pub fn immediate(&self) -> Option<&CallSite> {
        self.call_sites.first()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeLayout {
    /// Unpadded instance size including the object header
    Instance { size: u32 },
    Array { header: u32, element: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldInfo {
    pub name: String,
    pub signature: String,
    pub offset: u32,
    pub is_static: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocatedType {
    pub id: u32,
    pub super_id: Option<u32>,
    /// Internal name, e.g. `java/lang/String` or `[B`
    pub name: String,
    pub layout: TypeLayout,
    pub fields: Vec<FieldInfo>,
}

impl AllocatedType {
    pub fn is_array(&self) -> bool {
        matches!(self.layout, TypeLayout::Array { .. })
    }

    pub fn external_name(&self) -> String {
        external_name(&self.name)
    }

    /// Padded size of an object of this type
    pub fn object_size(&self, array_length: Option<u32>, word_size: u32) -> u64 {
        let unpadded = match self.layout {
            TypeLayout::Instance { size } => size as u64,
            TypeLayout::Array { header, element } => {
                header as u64 + element as u64 * array_length.unwrap_or(0) as u64
            }
        };
        align_up(unpadded, word_size as u64)
    }
}

/// Convert an internal or descriptor type name into its dotted Java form
pub fn external_name(internal: &str) -> String {
    let dims = internal.chars().take_while(|c| *c == '[').count();
    let base = &internal[dims..];
    let mut name = if dims > 0 {
        match base {
            "Z" => "boolean".to_string(),
            "B" => "byte".to_string(),
            "C" => "char".to_string(),
            "S" => "short".to_string(),
            "I" => "int".to_string(),
            "J" => "long".to_string(),
            "F" => "float".to_string(),
            "D" => "double".to_string(),
            _ => strip_descriptor(base).replace('/', "."),
        }
    } else {
        strip_descriptor(base).replace('/', ".")
    };
    for _ in 0..dims {
        name.push_str("[]");
    }
    name
}

fn strip_descriptor(name: &str) -> &str {
    name.strip_prefix('L')
        .and_then(|n| n.strip_suffix(';'))
        .unwrap_or(name)
}

#[derive(Clone, Debug, Default)]
pub struct Symbols {
    pub heap_word_size: u32,
    /// Pairs a symbols file with the trace it was written alongside
    pub nonce: u32,
    sites: HashMap<u32, AllocationSite>,
    types: HashMap<u32, AllocatedType>,
    type_names: HashMap<String, u32>,
}

impl Symbols {
    pub fn new(heap_word_size: u32) -> Self {
        Symbols {
            heap_word_size,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_nonce(mut self, nonce: u32) -> Self {
        self.nonce = nonce;
        self
    }

    pub fn insert_site(&mut self, site: AllocationSite) {
        self.sites.insert(site.id, site);
    }

    pub fn insert_type(&mut self, ty: AllocatedType) {
        self.type_names.insert(ty.name.clone(), ty.id);
        self.types.insert(ty.id, ty);
    }

    pub fn site(&self, id: u32) -> Option<&AllocationSite> {
        self.sites.get(&id)
    }

    pub fn allocated_type(&self, id: u32) -> Option<&AllocatedType> {
        self.types.get(&id)
    }

    pub fn type_by_name(&self, name: &str) -> Option<&AllocatedType> {
        self.type_names.get(name).and_then(|id| self.types.get(id))
    }

    pub fn sites(&self) -> impl Iterator<Item = &AllocationSite> {
        self.sites.values()
    }

    pub fn types(&self) -> impl Iterator<Item = &AllocatedType> {
        self.types.values()
    }

    pub fn from_path(path: impl AsRef<Path>, mode: CallContextMode) -> Result<Symbols, TraceError> {
        let reader = BufReader::new(File::open(path)?);
        Self::read_native(reader, mode)
    }

    /// Load a symbols file once per process and call-context mode; parses of
    /// several traces recorded against it share the same table.
    pub fn shared(path: impl AsRef<Path>, mode: CallContextMode) -> Result<Arc<Symbols>, TraceError> {
        let key = (path.as_ref().to_path_buf(), mode);
        if let Some(symbols) = LOADED.lock().unwrap_or_else(|e| e.into_inner()).get(&key) {
            return Ok(symbols.clone());
        }
        // load outside the lock; a racing loader just wins the insert
        let symbols = Arc::new(Self::from_path(&key.0, mode)?);
        let mut loaded = LOADED.lock().unwrap_or_else(|e| e.into_inner());
        Ok(loaded.entry(key).or_insert(symbols).clone())
    }

    /// Read a native symbols file, trimming call chains according to `mode`
    pub fn read_native<R: Read>(reader: R, mode: CallContextMode) -> Result<Symbols, TraceError> {
        let mut s = Scanner::new(reader);
        let (word_size, nonce) = s.parse(header)?;
        let mut symbols = Symbols::new(word_size).with_nonce(nonce);
        while !s.at_eof()? {
            let offset = s.offset();
            let tag = s.parse(be_u8)?;
            match tag {
                TYPE_MAGIC => {
                    let ty = s.parse(allocated_type)?;
                    symbols.insert_type(ty);
                }
                FIELD_MAGIC => {
                    let (type_id, field) = s.parse(field)?;
                    let ty = symbols.types.get_mut(&type_id).ok_or(ProtocolError::MissingSymbol {
                        kind: SymbolKind::Type,
                        id: type_id as u64,
                        offset,
                    })?;
                    ty.fields.push(field);
                }
                SITE_MAGIC => {
                    let site = s.parse(|i| site(i, mode))?;
                    symbols.insert_site(site);
                }
                tag => return Err(DecodeError::UnknownTag { offset, tag }.into()),
            }
        }
        debug!(
            "Loaded {} types and {} allocation sites",
            symbols.types.len(),
            symbols.sites.len()
        );
        Ok(symbols)
    }

    pub fn write_native<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        let mut buf = RecordBuf::new();
        buf.put_bytes(&NATIVE_SYMBOLS_MAGIC)
            .put_u8(NATIVE_FORMAT_VERSION)
            .put_u8(self.heap_word_size as u8)
            .put_u32(self.nonce);
        let mut types: Vec<&AllocatedType> = self.types.values().collect();
        types.sort_by_key(|t| t.id);
        for ty in &types {
            buf.put_u8(TYPE_MAGIC)
                .put_u32(ty.id)
                .put_u32(ty.super_id.unwrap_or(UNKNOWN_ID))
                .put_str(&ty.name);
            match ty.layout {
                TypeLayout::Instance { size } => {
                    buf.put_u8(0).put_u32(size);
                }
                TypeLayout::Array { header, element } => {
                    buf.put_u8(1).put_u32(header).put_u32(element);
                }
            }
        }
        for ty in &types {
            for field in &ty.fields {
                buf.put_u8(FIELD_MAGIC)
                    .put_u32(ty.id)
                    .put_u32(field.offset)
                    .put_str(&field.name)
                    .put_str(&field.signature)
                    .put_u16(if field.is_static { ACC_STATIC } else { 0 });
            }
        }
        let mut sites: Vec<&AllocationSite> = self.sites.values().collect();
        sites.sort_by_key(|s| s.id);
        for site in sites {
            buf.put_u8(SITE_MAGIC)
                .put_u32(site.id)
                .put_u32(site.allocated_type.unwrap_or(UNKNOWN_ID))
                .put_u16(site.call_sites.len() as u16);
            for cs in &site.call_sites {
                buf.put_str(&cs.declaring_type)
                    .put_str(&cs.method)
                    .put_str(&cs.params)
                    .put_i32(cs.bci)
                    .put_u8(0);
            }
        }
        w.write_all(buf.as_slice())
    }
}

fn optional_id(id: u32) -> Option<u32> {
    if id == UNKNOWN_ID {
        None
    } else {
        Some(id)
    }
}

/// Magic, version, heap word size and nonce
fn header(input: &[u8]) -> Parsed<(u32, u32)> {
    let (input, _) = checked(input, |i| take(i, 4), "symbols magic", |m| *m == NATIVE_SYMBOLS_MAGIC)?;
    let (rest, version) = be_u8(input)?;
    if version != NATIVE_FORMAT_VERSION {
        return Err(WireError::invalid(input, format!("symbols version {}", version)));
    }
    let (after, word_size) = be_u8(rest)?;
    if word_size != 4 && word_size != 8 {
        return Err(WireError::invalid(rest, format!("heap word size {}", word_size)));
    }
    let (after, nonce) = be_u32(after)?;
    Ok((after, (word_size as u32, nonce)))
}

fn allocated_type(input: &[u8]) -> Parsed<AllocatedType> {
    let (input, id) = be_u32(input)?;
    let (input, super_id) = be_u32(input)?;
    let (input, name) = string(input)?;
    let (rest, layout) = be_u8(input)?;
    let (rest, layout) = match layout {
        0 => {
            let (rest, size) = be_u32(rest)?;
            (rest, TypeLayout::Instance { size })
        }
        1 => {
            let (rest, header) = be_u32(rest)?;
            let (rest, element) = be_u32(rest)?;
            (rest, TypeLayout::Array { header, element })
        }
        other => return Err(WireError::invalid(input, format!("type layout {}", other))),
    };
    Ok((
        rest,
        AllocatedType {
            id,
            super_id: optional_id(super_id),
            name,
            layout,
            fields: vec![],
        },
    ))
}

/// A field and the id of the type declaring it
fn field(input: &[u8]) -> Parsed<(u32, FieldInfo)> {
    let (input, type_id) = be_u32(input)?;
    let (input, offset) = be_u32(input)?;
    let (input, name) = string(input)?;
    let (input, signature) = string(input)?;
    let (input, flags) = be_u16(input)?;
    Ok((
        input,
        (
            type_id,
            FieldInfo {
                name,
                signature,
                offset,
                is_static: flags & ACC_STATIC != 0,
            },
        ),
    ))
}

fn call_site(input: &[u8]) -> Parsed<(CallSite, bool)> {
    let (input, declaring_type) = string(input)?;
    let (input, method) = string(input)?;
    let (input, params) = string(input)?;
    let (input, bci) = be_i32(input)?;
    let (input, dynamic) = be_u8(input)?;
    let call_site = CallSite {
        declaring_type: external_name(&declaring_type),
        method,
        params,
        bci,
    };
    Ok((input, (call_site, dynamic != 0)))
}

fn site(input: &[u8], mode: CallContextMode) -> Parsed<AllocationSite> {
    let (input, id) = be_u32(input)?;
    let (input, allocated_type) = be_u32(input)?;
    let (input, n) = be_u16(input)?;
    let (input, frames) = count(call_site, n as usize)(input)?;
    Ok((
        input,
        AllocationSite {
            id,
            allocated_type: optional_id(allocated_type),
            call_sites: trim_call_chain(frames, mode),
        },
    ))
}

/// Keep the part of a call chain the call-context mode asks for. The
/// immediate frame always survives.
pub(crate) fn trim_call_chain(frames: Vec<(CallSite, bool)>, mode: CallContextMode) -> Vec<CallSite> {
    match mode {
        CallContextMode::None => frames.into_iter().take(1).map(|(cs, _)| cs).collect(),
        CallContextMode::Static => frames
            .into_iter()
            .enumerate()
            .filter(|(i, (_, dynamic))| *i == 0 || !dynamic)
            .map(|(_, (cs, _))| cs)
            .collect(),
        CallContextMode::Full => frames.into_iter().map(|(cs, _)| cs).collect(),
    }
}
