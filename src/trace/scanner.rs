//! Streaming `nom` parsers over a growable read buffer.
//!
//! Every wire parser in the crate is a `nom` streaming parser over the bytes
//! buffered so far. [`Scanner::parse`] reads more input whenever a parser
//! reports `Incomplete`, and turns parser errors back into absolute byte
//! offsets.

use crate::error::{DecodeError, TraceError};
use nom::bytes::streaming as bytes;
use nom::error::{ErrorKind, ParseError};
use nom::number::streaming as number;
use nom::Needed;
use std::borrow::Cow;
use std::io::{self, Read, Seek, SeekFrom};

const READ_CHUNK: usize = 64 * 1024;

/// Why a wire parser rejected its input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireErrorKind {
    Invalid(Cow<'static, str>),
    UnknownTag(u8),
}

/// Parser error pointing at the offending bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireError<'a> {
    pub input: &'a [u8],
    pub kind: WireErrorKind,
}

impl<'a> WireError<'a> {
    pub fn invalid(input: &'a [u8], what: impl Into<Cow<'static, str>>) -> nom::Err<Self> {
        nom::Err::Failure(WireError {
            input,
            kind: WireErrorKind::Invalid(what.into()),
        })
    }

    pub fn unknown_tag(input: &'a [u8], tag: u8) -> nom::Err<Self> {
        nom::Err::Failure(WireError {
            input,
            kind: WireErrorKind::UnknownTag(tag),
        })
    }

    fn into_decode_error(self, offset: u64) -> DecodeError {
        match self.kind {
            WireErrorKind::Invalid(what) => DecodeError::invalid(offset, what),
            WireErrorKind::UnknownTag(tag) => DecodeError::UnknownTag { offset, tag },
        }
    }
}

impl<'a> ParseError<&'a [u8]> for WireError<'a> {
    fn from_error_kind(input: &'a [u8], kind: ErrorKind) -> Self {
        WireError {
            input,
            kind: WireErrorKind::Invalid(Cow::Owned(kind.description().to_string())),
        }
    }

    fn append(_: &'a [u8], _: ErrorKind, other: Self) -> Self {
        other
    }
}

pub type Parsed<'a, T> = nom::IResult<&'a [u8], T, WireError<'a>>;

pub fn be_u8(input: &[u8]) -> Parsed<u8> {
    number::be_u8(input)
}

pub fn be_u16(input: &[u8]) -> Parsed<u16> {
    number::be_u16(input)
}

pub fn be_u32(input: &[u8]) -> Parsed<u32> {
    number::be_u32(input)
}

pub fn be_i32(input: &[u8]) -> Parsed<i32> {
    number::be_i32(input)
}

pub fn be_u64(input: &[u8]) -> Parsed<u64> {
    number::be_u64(input)
}

pub fn take(input: &[u8], n: usize) -> Parsed<&[u8]> {
    bytes::take(n)(input)
}

/// An identifier of `size` bytes, as used by HPROF; the size has been
/// checked to be 4 or 8 when the header was read
pub fn id(input: &[u8], size: u32) -> Parsed<u64> {
    if size == 4 {
        let (input, v) = be_u32(input)?;
        Ok((input, v as u64))
    } else {
        be_u64(input)
    }
}

/// `n` bytes of UTF-8
pub fn utf8(input: &[u8], n: usize) -> Parsed<String> {
    let (rest, raw) = take(input, n)?;
    match std::str::from_utf8(raw) {
        Ok(s) => Ok((rest, s.to_string())),
        Err(_) => Err(WireError::invalid(input, "UTF-8 string")),
    }
}

/// A `u16`-length-prefixed UTF-8 string
pub fn string(input: &[u8]) -> Parsed<String> {
    let (input, len) = be_u16(input)?;
    utf8(input, len as usize)
}

/// Run `parser` and reject its output unless `check` holds
pub fn checked<'a, T>(
    input: &'a [u8],
    parser: impl Fn(&'a [u8]) -> Parsed<'a, T>,
    what: &'static str,
    check: impl Fn(&T) -> bool,
) -> Parsed<'a, T> {
    let (rest, v) = parser(input)?;
    if check(&v) {
        Ok((rest, v))
    } else {
        Err(WireError::invalid(input, what))
    }
}

/// Run `parser` and convert its output, rejecting values `f` maps to `None`
pub fn mapped<'a, T, U>(
    input: &'a [u8],
    parser: impl Fn(&'a [u8]) -> Parsed<'a, T>,
    what: &'static str,
    f: impl Fn(T) -> Option<U>,
) -> Parsed<'a, U> {
    let (rest, v) = parser(input)?;
    match f(v) {
        Some(u) => Ok((rest, u)),
        None => Err(WireError::invalid(input, what)),
    }
}

/// Apply `parser` to a record body already held in memory. `record` is the
/// offset of the record and `body` that of its first body byte. Returns the
/// value and the number of body bytes it used; a parser that runs past the
/// body is a size mismatch.
pub fn parse_body<'a, T>(
    record: u64,
    body: u64,
    payload: &'a [u8],
    parser: impl FnOnce(&'a [u8]) -> Parsed<'a, T>,
) -> Result<(T, u64), TraceError> {
    let declared = payload.len() as u64;
    match parser(payload) {
        Ok((rest, value)) => Ok((value, declared - rest.len() as u64)),
        Err(nom::Err::Incomplete(needed)) => {
            let short = match needed {
                Needed::Size(n) => n.get() as u64,
                Needed::Unknown => 1,
            };
            Err(DecodeError::RecordSizeMismatch {
                offset: record,
                declared,
                consumed: declared + short,
            }
            .into())
        }
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            let at = body + (payload.len() - e.input.len()) as u64;
            Err(e.into_decode_error(at).into())
        }
    }
}

/// Drives streaming parsers over a reader, tracking the absolute offset of
/// the next unparsed byte.
pub struct Scanner<R> {
    reader: R,
    buf: Vec<u8>,
    pos: usize,
    offset: u64,
    eof: bool,
}

impl<R: Read> Scanner<R> {
    pub fn new(reader: R) -> Self {
        Scanner {
            reader,
            buf: Vec::new(),
            pos: 0,
            offset: 0,
            eof: false,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Read at least `want` more bytes unless the input ends first. Returns
    /// whether anything was read.
    fn fill(&mut self, want: usize) -> Result<bool, TraceError> {
        if self.eof {
            return Ok(false);
        }
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        let start = self.buf.len();
        let goal = start + want;
        let mut filled = start;
        self.buf.resize(start + want.max(READ_CHUNK), 0);
        while filled < goal {
            match self.reader.read(&mut self.buf[filled..]) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.buf.truncate(filled);
                    return Err(e.into());
                }
            }
        }
        self.buf.truncate(filled);
        Ok(filled > start)
    }

    pub fn at_eof(&mut self) -> Result<bool, TraceError> {
        Ok(self.buffered() == 0 && !self.fill(1)?)
    }

    /// Apply `parser` to the input, reading more whenever it is incomplete.
    /// Input that ends early reports the offset where it ran out.
    pub fn parse<T>(&mut self, mut parser: impl FnMut(&[u8]) -> Parsed<T>) -> Result<T, TraceError> {
        loop {
            let available = &self.buf[self.pos..];
            match parser(available) {
                Ok((rest, value)) => {
                    let used = available.len() - rest.len();
                    self.pos += used;
                    self.offset += used as u64;
                    return Ok(value);
                }
                Err(nom::Err::Incomplete(needed)) => {
                    let want = match needed {
                        Needed::Size(n) => n.get(),
                        Needed::Unknown => 1,
                    };
                    if !self.fill(want)? {
                        return Err(DecodeError::UnexpectedEof {
                            offset: self.offset + self.buffered() as u64,
                        }
                        .into());
                    }
                }
                Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
                    let at = self.offset + (available.len() - e.input.len()) as u64;
                    return Err(e.into_decode_error(at).into());
                }
            }
        }
    }

    pub fn bytes(&mut self, n: usize) -> Result<Vec<u8>, TraceError> {
        self.parse(|input| {
            let (rest, raw) = take(input, n)?;
            Ok((rest, raw.to_vec()))
        })
    }

    /// Discard `n` bytes without buffering them
    pub fn skip(&mut self, n: u64) -> Result<(), TraceError> {
        let step = (self.buffered() as u64).min(n);
        self.pos += step as usize;
        self.offset += step;
        let rest = n - step;
        if rest > 0 {
            let copied = io::copy(&mut (&mut self.reader).take(rest), &mut io::sink())?;
            self.offset += copied;
            if copied < rest {
                self.eof = true;
                return Err(DecodeError::UnexpectedEof { offset: self.offset }.into());
            }
        }
        Ok(())
    }
}

impl<R: Read + Seek> Scanner<R> {
    pub fn seek_to(&mut self, offset: u64) -> Result<(), TraceError> {
        self.reader.seek(SeekFrom::Start(offset))?;
        self.buf.clear();
        self.pos = 0;
        self.offset = offset;
        self.eof = false;
        Ok(())
    }
}

/// Big-endian output buffer, the writing half of the wire parsers
#[derive(Default, Debug, Clone)]
pub struct RecordBuf {
    bytes: Vec<u8>,
}

impl RecordBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.bytes.push(v);
        self
    }

    pub fn put_u16(&mut self, v: u16) -> &mut Self {
        self.bytes.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.bytes.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_i32(&mut self, v: i32) -> &mut Self {
        self.bytes.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.bytes.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_id(&mut self, size: u32, v: u64) -> &mut Self {
        if size == 4 {
            self.put_u32(v as u32)
        } else {
            self.put_u64(v)
        }
    }

    pub fn put_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(v);
        self
    }

    /// Strings longer than `u16::MAX` bytes are cut at the last character
    /// boundary that fits
    pub fn put_str(&mut self, s: &str) -> &mut Self {
        let mut len = s.len().min(u16::MAX as usize);
        while !s.is_char_boundary(len) {
            len -= 1;
        }
        self.put_u16(len as u16);
        self.bytes.extend_from_slice(&s.as_bytes()[..len]);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hands out one byte per read, so every parser has to resume
    struct Trickle<'a>(&'a [u8]);

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.0.is_empty() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.0[0];
            self.0 = &self.0[1..];
            Ok(1)
        }
    }

    #[test]
    fn test_read_back() {
        let mut buf = RecordBuf::new();
        buf.put_u8(1).put_u16(2).put_u32(3).put_u64(4).put_str("abc");
        let mut s = Scanner::new(Trickle(buf.as_slice()));
        assert_eq!(s.parse(be_u8).unwrap(), 1);
        assert_eq!(s.parse(be_u16).unwrap(), 2);
        assert_eq!(s.parse(be_u32).unwrap(), 3);
        assert_eq!(s.parse(be_u64).unwrap(), 4);
        assert_eq!(s.parse(string).unwrap(), "abc");
        assert_eq!(s.offset(), 20);
        assert!(s.at_eof().unwrap());
    }

    #[test]
    fn test_eof_offset_is_end_of_input() {
        let bytes = [0u8, 0, 0, 1, 0xff, 0xff];
        let mut s = Scanner::new(&bytes[..]);
        assert_eq!(s.parse(be_u32).unwrap(), 1);
        match s.parse(be_u64) {
            Err(TraceError::Decode(DecodeError::UnexpectedEof { offset })) => assert_eq!(offset, 6),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_skip_and_ids() {
        let mut buf = RecordBuf::new();
        buf.put_id(4, 7).put_id(8, 9).put_bytes(&[1, 2, 3]);
        let mut s = Scanner::new(buf.as_slice());
        assert_eq!(s.parse(|i| id(i, 4)).unwrap(), 7);
        assert_eq!(s.parse(|i| id(i, 8)).unwrap(), 9);
        s.skip(3).unwrap();
        assert!(matches!(
            s.skip(1),
            Err(TraceError::Decode(DecodeError::UnexpectedEof { offset: 15 }))
        ));
    }

    #[test]
    fn test_rejected_value_reports_its_offset() {
        let bytes = [0u8, 0, 7, 0];
        let mut s = Scanner::new(&bytes[..]);
        s.skip(2).unwrap();
        let result = s.parse(|i| checked(i, be_u8, "flag", |v| *v < 2));
        match result {
            Err(TraceError::Decode(DecodeError::InvalidValue { offset, what })) => {
                assert_eq!(offset, 2);
                assert_eq!(what, "flag");
            }
            other => panic!("unexpected {:?}", other),
        }
        // nothing was consumed by the failed parse
        assert_eq!(s.offset(), 2);
    }

    #[test]
    fn test_body_parsed_in_memory() {
        let body = [0u8, 0, 0, 9, 0xaa];
        let (v, used) = parse_body(100, 105, &body, be_u32).unwrap();
        assert_eq!((v, used), (9, 4));
        match parse_body(100, 105, &body[..2], be_u32) {
            Err(TraceError::Decode(DecodeError::RecordSizeMismatch {
                offset,
                declared,
                consumed,
            })) => assert_eq!((offset, declared, consumed), (100, 2, 4)),
            other => panic!("unexpected {:?}", other),
        }
        let rejected = parse_body(100, 105, &body, |i| {
            let (i, _) = be_u32(i)?;
            checked(i, be_u8, "marker", |v| *v == 0)
        });
        assert!(matches!(
            rejected,
            Err(TraceError::Decode(DecodeError::InvalidValue { offset: 109, .. }))
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        let bytes = [0u8, 2, 0xc3, 0x28];
        let mut s = Scanner::new(&bytes[..]);
        assert!(matches!(
            s.parse(string),
            Err(TraceError::Decode(DecodeError::InvalidValue { offset: 2, .. }))
        ));
    }

    #[test]
    fn test_long_string_cut_at_char_boundary() {
        // 'é' is two bytes, so u16::MAX bytes would end inside a character
        let long = "é".repeat(u16::MAX as usize / 2 + 1);
        let mut buf = RecordBuf::new();
        buf.put_str(&long);
        let read = Scanner::new(buf.as_slice()).parse(string).unwrap();
        assert_eq!(read.len(), u16::MAX as usize - 1);
        assert!(long.starts_with(&read));
    }
}
