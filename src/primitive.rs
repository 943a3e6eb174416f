//! The PDF object model: a tagged sum over every value the syntax can
//! express, plus the construction-time placeholders the cache uses.

use crate::error::*;
use crate::object::{PlainRef, Resolve};

use indexmap::map::{self, IndexMap};
use itertools::Itertools;
use std::borrow::{Borrow, Cow};
use std::fmt;
use std::io;
use std::ops::{Deref, Range};
use std::rc::Rc;
use std::str;

macro_rules! unexpected_primitive {
    ($expected:ident, $found:expr) => {
        Err(PdfError::UnexpectedPrimitive {
            expected: stringify!($expected),
            found: $found,
        })
    };
}

#[derive(Clone, Debug)]
pub enum Primitive {
    Null,
    Boolean(bool),
    Integer(i64),
    Real(Real),
    String(PdfString),
    Name(Name),
    Array(Vec<Primitive>),
    Dictionary(Dictionary),
    Stream(PdfStream),
    Reference(PlainRef),

    /// Forward reference created by `Storage::reserve`, to be replaced
    /// before writing. Writing a file with a live `Reserved` is an error.
    Reserved,
    /// Present in the xref, bytes not read yet. Only ever observed inside
    /// the cache; resolution replaces it.
    Unresolved,
    /// Content-stream token. Only meaningful while re-tokenizing content;
    /// serializes as `null` anywhere else.
    Operator(String),
}

impl Primitive {
    /// For debugging / error messages: get the name of the variant
    pub fn get_debug_name(&self) -> &'static str {
        match *self {
            Primitive::Null => "Null",
            Primitive::Boolean(..) => "Boolean",
            Primitive::Integer(..) => "Integer",
            Primitive::Real(..) => "Real",
            Primitive::String(..) => "String",
            Primitive::Name(..) => "Name",
            Primitive::Array(..) => "Array",
            Primitive::Dictionary(..) => "Dictionary",
            Primitive::Stream(..) => "Stream",
            Primitive::Reference(..) => "Reference",
            Primitive::Reserved => "Reserved",
            Primitive::Unresolved => "Unresolved",
            Primitive::Operator(..) => "Operator",
        }
    }
    pub fn name(name: impl Into<Name>) -> Primitive {
        Primitive::Name(name.into())
    }
    pub fn is_null(&self) -> bool {
        matches!(self, Primitive::Null)
    }

    pub fn as_integer(&self) -> Result<i64> {
        match *self {
            Primitive::Integer(n) => Ok(n),
            ref p => unexpected_primitive!(Integer, p.get_debug_name()),
        }
    }
    pub fn as_u32(&self) -> Result<u32> {
        match *self {
            Primitive::Integer(n) if n >= 0 && n <= u32::MAX as i64 => Ok(n as u32),
            Primitive::Integer(_) => bail!("integer out of range"),
            ref p => unexpected_primitive!(Integer, p.get_debug_name()),
        }
    }
    pub fn as_usize(&self) -> Result<usize> {
        match *self {
            Primitive::Integer(n) if n >= 0 => Ok(n as usize),
            Primitive::Integer(_) => bail!("negative integer"),
            ref p => unexpected_primitive!(Integer, p.get_debug_name()),
        }
    }
    pub fn as_number(&self) -> Result<f64> {
        match *self {
            Primitive::Integer(n) => Ok(n as f64),
            Primitive::Real(ref r) => r.as_f64(),
            ref p => unexpected_primitive!(Number, p.get_debug_name()),
        }
    }
    pub fn as_bool(&self) -> Result<bool> {
        match *self {
            Primitive::Boolean(b) => Ok(b),
            ref p => unexpected_primitive!(Boolean, p.get_debug_name()),
        }
    }
    pub fn as_name(&self) -> Result<&str> {
        match self {
            Primitive::Name(ref name) => Ok(name.as_str()),
            p => unexpected_primitive!(Name, p.get_debug_name()),
        }
    }
    pub fn as_string(&self) -> Result<&PdfString> {
        match self {
            Primitive::String(ref s) => Ok(s),
            p => unexpected_primitive!(String, p.get_debug_name()),
        }
    }
    pub fn as_array(&self) -> Result<&[Primitive]> {
        match self {
            Primitive::Array(ref v) => Ok(v),
            p => unexpected_primitive!(Array, p.get_debug_name()),
        }
    }
    pub fn as_dictionary(&self) -> Result<&Dictionary> {
        match self {
            Primitive::Dictionary(ref d) => Ok(d),
            Primitive::Stream(ref s) => Ok(&s.info),
            p => unexpected_primitive!(Dictionary, p.get_debug_name()),
        }
    }
    pub fn as_reference(&self) -> Result<PlainRef> {
        match *self {
            Primitive::Reference(r) => Ok(r),
            ref p => unexpected_primitive!(Reference, p.get_debug_name()),
        }
    }

    pub fn into_reference(self) -> Result<PlainRef> {
        match self {
            Primitive::Reference(r) => Ok(r),
            p => unexpected_primitive!(Reference, p.get_debug_name()),
        }
    }
    /// Does accept a Reference
    pub fn into_array(self, r: &impl Resolve) -> Result<Vec<Primitive>> {
        match self {
            Primitive::Array(v) => Ok(v),
            Primitive::Reference(id) => r.resolve(id)?.into_array(r),
            p => unexpected_primitive!(Array, p.get_debug_name()),
        }
    }
    /// Does accept a Reference
    pub fn into_dictionary(self, r: &impl Resolve) -> Result<Dictionary> {
        match self {
            Primitive::Dictionary(dict) => Ok(dict),
            Primitive::Stream(s) => Ok(s.info),
            Primitive::Reference(id) => r.resolve(id)?.into_dictionary(r),
            p => unexpected_primitive!(Dictionary, p.get_debug_name()),
        }
    }
    /// Doesn't accept a Reference
    pub fn into_name(self) -> Result<Name> {
        match self {
            Primitive::Name(name) => Ok(name),
            p => unexpected_primitive!(Name, p.get_debug_name()),
        }
    }
    /// Doesn't accept a Reference
    pub fn into_string(self) -> Result<PdfString> {
        match self {
            Primitive::String(s) => Ok(s),
            p => unexpected_primitive!(String, p.get_debug_name()),
        }
    }
    pub fn into_stream(self) -> Result<PdfStream> {
        match self {
            Primitive::Stream(s) => Ok(s),
            p => unexpected_primitive!(Stream, p.get_debug_name()),
        }
    }

    /// Serialization of everything that owns its bytes. Streams are laid
    /// out by the writer (their payload may live in the input file) and
    /// placeholders must not escape to disk.
    pub fn serialize(&self, out: &mut impl io::Write) -> Result<()> {
        match self {
            Primitive::Null => write!(out, "null")?,
            Primitive::Boolean(b) => write!(out, "{}", b)?,
            Primitive::Integer(i) => write!(out, "{}", i)?,
            Primitive::Real(r) => write!(out, "{}", r)?,
            Primitive::String(ref s) => s.serialize(out)?,
            Primitive::Name(ref n) => n.serialize(out)?,
            Primitive::Array(ref arr) => {
                write!(out, "[ ")?;
                for p in arr {
                    p.serialize(out)?;
                    write!(out, " ")?;
                }
                write!(out, "]")?;
            }
            Primitive::Dictionary(ref d) => d.serialize(out)?,
            Primitive::Reference(r) => write!(out, "{} {} R", r.id, r.gen)?,
            // tokens outside content streams degrade to null
            Primitive::Operator(_) => write!(out, "null")?,
            Primitive::Unresolved => write!(out, "null")?,
            Primitive::Stream(_) => bail!("streams are serialized by the writer"),
            Primitive::Reserved => err!(PdfError::ReservedObject { obj_nr: 0 }),
        }
        Ok(())
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Primitive::Stream(ref s) => write!(f, "stream {}", s.info),
            Primitive::Reserved => write!(f, "reserved"),
            Primitive::Unresolved => write!(f, "unresolved"),
            p => {
                let mut buf = Vec::new();
                p.serialize(&mut buf).map_err(|_| fmt::Error)?;
                f.write_str(&String::from_utf8_lossy(&buf))
            }
        }
    }
}

/// A PDF name in canonical form: `#xx` escapes already resolved. The
/// leading solidus is implied and re-added on serialization.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Name(pub String);

impl Name {
    pub fn as_str(&self) -> &str {
        &self.0
    }
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
    pub fn serialize(&self, out: &mut impl io::Write) -> Result<()> {
        write!(out, "/")?;
        for &b in self.0.as_bytes() {
            match b {
                // Delimiters, whitespace and '#' itself must be escaped.
                b'\0' => bail!("NUL in name"),
                b'#' | b'(' | b')' | b'<' | b'>' | b'[' | b']' | b'{' | b'}' | b'/' | b'%'
                | 0x01..=0x20 | 0x7f..=0xff => write!(out, "#{:02x}", b)?,
                _ => out.write_all(&[b])?,
            }
        }
        Ok(())
    }
}
impl Deref for Name {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}
impl Borrow<str> for Name {
    fn borrow(&self) -> &str {
        &self.0
    }
}
impl From<&str> for Name {
    fn from(s: &str) -> Name {
        Name(s.into())
    }
}
impl From<String> for Name {
    fn from(s: String) -> Name {
        Name(s)
    }
}
impl PartialEq<str> for Name {
    fn eq(&self, rhs: &str) -> bool {
        self.0 == rhs
    }
}
impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}
impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}

/// A real number kept as the canonical decimal text it was written with,
/// so rewriting a file does not drift precision.
#[derive(Clone, PartialEq, Eq)]
pub struct Real(String);

impl Real {
    /// Validates `[+-]?(\d*.\d+|\d+.?\d*)` and stores a trimmed form:
    /// `+` dropped, trailing `.` dropped, bare `.5` prefixed with `0`.
    pub fn from_text(text: &str) -> Result<Real> {
        let mut rest = text;
        let neg = match rest.as_bytes().first() {
            Some(b'-') => {
                rest = &rest[1..];
                true
            }
            Some(b'+') => {
                rest = &rest[1..];
                false
            }
            _ => false,
        };
        let (int_part, frac_part) = match rest.find('.') {
            Some(i) => (&rest[..i], &rest[i + 1..]),
            None => (rest, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            bail!("not a number: {:?}", text);
        }
        if !int_part.bytes().all(|b| b.is_ascii_digit()) || !frac_part.bytes().all(|b| b.is_ascii_digit()) {
            bail!("not a number: {:?}", text);
        }
        let mut s = String::with_capacity(text.len() + 2);
        if neg {
            s.push('-');
        }
        s.push_str(if int_part.is_empty() { "0" } else { int_part });
        let frac_part = frac_part.trim_end_matches('0');
        if !frac_part.is_empty() {
            s.push('.');
            s.push_str(frac_part);
        }
        if s == "-0" {
            s.truncate(0);
            s.push('0');
        }
        Ok(Real(s))
    }
    pub fn from_f64(v: f64) -> Real {
        // up to 6 fractional digits, like most producers emit
        let text = format!("{:.6}", v);
        Real::from_text(&text).unwrap_or_else(|_| Real("0".into()))
    }
    pub fn as_f64(&self) -> Result<f64> {
        Ok(t!(self.0.parse::<f64>()))
    }
    pub fn as_text(&self) -> &str {
        &self.0
    }
}
impl fmt::Debug for Real {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}
impl fmt::Display for Real {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Primitive Dictionary type. Keys are names in canonical form; insertion
/// order is preserved for stable output. Writing `Null` removes the key.
#[derive(Default, Clone)]
pub struct Dictionary {
    dict: IndexMap<Name, Primitive>,
}

impl Dictionary {
    pub fn new() -> Dictionary {
        Dictionary { dict: IndexMap::new() }
    }
    pub fn len(&self) -> usize {
        self.dict.len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn get(&self, key: &str) -> Option<&Primitive> {
        self.dict.get(key)
    }
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Primitive> {
        self.dict.get_mut(key)
    }
    pub fn contains_key(&self, key: &str) -> bool {
        self.dict.contains_key(key)
    }
    /// `Null` is the absent entry: inserting it removes the key.
    pub fn insert(&mut self, key: impl Into<Name>, val: Primitive) -> Option<Primitive> {
        let key = key.into();
        if val.is_null() {
            self.dict.shift_remove(&key)
        } else {
            self.dict.insert(key, val)
        }
    }
    pub fn remove(&mut self, key: &str) -> Option<Primitive> {
        self.dict.shift_remove(key)
    }
    pub fn iter(&self) -> map::Iter<Name, Primitive> {
        self.dict.iter()
    }
    pub fn keys(&self) -> impl Iterator<Item = &Name> {
        self.dict.keys()
    }
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut Primitive> {
        self.dict.values_mut()
    }
    /// like `remove`, but takes the name of the calling type and returns
    /// `PdfError::MissingEntry` if the entry is not found
    pub fn require(&mut self, typ: &'static str, key: &str) -> Result<Primitive> {
        self.remove(key).ok_or(PdfError::MissingEntry { typ, field: key.into() })
    }
    /// assert that the given key/value pair is in the dictionary
    /// (`required=true`), or the key is not present at all (`required=false`)
    pub fn expect(&self, typ: &'static str, key: &str, value: &str, required: bool) -> Result<()> {
        match self.dict.get(key) {
            Some(ty) => {
                let ty = ty.as_name()?;
                if ty != value {
                    Err(PdfError::WrongDictionaryType { expected: value.into(), found: ty.into() })
                } else {
                    Ok(())
                }
            }
            None if required => Err(PdfError::MissingEntry { typ, field: key.into() }),
            None => Ok(()),
        }
    }

    pub fn serialize(&self, out: &mut impl io::Write) -> Result<()> {
        write!(out, "<< ")?;
        for (key, val) in self.iter() {
            key.serialize(out)?;
            write!(out, " ")?;
            val.serialize(out)?;
            write!(out, " ")?;
        }
        write!(out, ">>")?;
        Ok(())
    }
}
impl fmt::Debug for Dictionary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{{")?;
        for (k, v) in self {
            writeln!(f, "{:>15}: {:?}", k.as_str(), v)?;
        }
        write!(f, "}}")
    }
}
impl fmt::Display for Dictionary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<{}>", self.iter().format_with(", ", |(k, v), f| f(&format_args!("{}={}", k, v))))
    }
}
impl IntoIterator for Dictionary {
    type Item = (Name, Primitive);
    type IntoIter = map::IntoIter<Name, Primitive>;
    fn into_iter(self) -> Self::IntoIter {
        self.dict.into_iter()
    }
}
impl<'a> IntoIterator for &'a Dictionary {
    type Item = (&'a Name, &'a Primitive);
    type IntoIter = map::Iter<'a, Name, Primitive>;
    fn into_iter(self) -> Self::IntoIter {
        self.dict.iter()
    }
}

/// Primitive String type. Arbitrary bytes, NULs included.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct PdfString {
    pub data: Vec<u8>,
}

impl PdfString {
    pub fn new(data: impl Into<Vec<u8>>) -> PdfString {
        PdfString { data: data.into() }
    }
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
    pub fn as_str(&self) -> Result<Cow<str>> {
        if self.data.starts_with(&[0xfe, 0xff]) {
            let utf16: Vec<u16> =
                self.data[2..].chunks(2).map(|c| (c[0] as u16) << 8 | *c.get(1).unwrap_or(&0) as u16).collect();
            Ok(Cow::Owned(t!(String::from_utf16(&utf16).map_err(|e| PdfError::Utf8 { source: e.into() }))))
        } else {
            Ok(Cow::Borrowed(t!(str::from_utf8(&self.data))))
        }
    }
    pub fn serialize(&self, out: &mut impl io::Write) -> Result<()> {
        if self.data.iter().any(|&b| b >= 0x80 || b == 0) {
            write!(out, "<")?;
            for &b in &self.data {
                write!(out, "{:02x}", b)?;
            }
            write!(out, ">")?;
        } else {
            write!(out, "(")?;
            for &b in &self.data {
                match b {
                    b'\\' | b'(' | b')' => {
                        write!(out, r"\")?;
                        out.write_all(&[b])?;
                    }
                    // a raw CR would be normalized away when read back
                    b'\r' => write!(out, r"\r")?,
                    _ => out.write_all(&[b])?,
                }
            }
            write!(out, ")")?;
        }
        Ok(())
    }
}
impl AsRef<[u8]> for PdfString {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}
impl fmt::Debug for PdfString {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "\"")?;
        for &b in &self.data {
            match b {
                b'"' => write!(f, "\\\"")?,
                b' '..=b'~' => write!(f, "{}", b as char)?,
                o @ 0..=7 => write!(f, "\\{}", o)?,
                x => write!(f, "\\x{:02x}", x)?,
            }
        }
        write!(f, "\"")
    }
}

/// Replacement payload for a stream: asked to produce the bytes on demand,
/// possibly more than once (linearization writes everything twice).
pub trait StreamDataProvider {
    fn provide(&self) -> Result<Vec<u8>>;
}

impl<F: Fn() -> Result<Vec<u8>>> StreamDataProvider for F {
    fn provide(&self) -> Result<Vec<u8>> {
        (self)()
    }
}

/// Where a stream's (still encoded) payload lives.
#[derive(Clone)]
pub enum StreamData {
    /// Byte range of the input file. Decryption happens when the range is
    /// fetched, so the bytes here are exactly the bytes on disk.
    InFile(Range<usize>),
    /// Owned bytes (constructed streams, eagerly copied foreign streams).
    InMemory(Rc<Vec<u8>>),
    /// Deferred to a caller-supplied provider.
    Provided(Rc<dyn StreamDataProvider>),
}

impl fmt::Debug for StreamData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StreamData::InFile(r) => write!(f, "InFile({}..{})", r.start, r.end),
            StreamData::InMemory(d) => write!(f, "InMemory({} bytes)", d.len()),
            StreamData::Provided(_) => write!(f, "Provided"),
        }
    }
}

/// Primitive stream: a dictionary plus a byte-addressable payload.
/// Always indirect; the payload is opaque to the object core.
#[derive(Clone, Debug)]
pub struct PdfStream {
    pub info: Dictionary,
    pub data: StreamData,
}

impl PdfStream {
    pub fn new(info: Dictionary, data: Vec<u8>) -> PdfStream {
        PdfStream { info, data: StreamData::InMemory(Rc::new(data)) }
    }
    pub fn with_provider(info: Dictionary, provider: Rc<dyn StreamDataProvider>) -> PdfStream {
        PdfStream { info, data: StreamData::Provided(provider) }
    }
    /// Declared `/Length`; the real byte count may disagree on damaged
    /// files, which the parser already warned about.
    pub fn declared_len(&self) -> Option<usize> {
        self.info.get("Length").and_then(|p| p.as_usize().ok())
    }
}

impl From<i64> for Primitive {
    fn from(x: i64) -> Primitive {
        Primitive::Integer(x)
    }
}
impl From<bool> for Primitive {
    fn from(x: bool) -> Primitive {
        Primitive::Boolean(x)
    }
}
impl From<Name> for Primitive {
    fn from(x: Name) -> Primitive {
        Primitive::Name(x)
    }
}
impl From<Real> for Primitive {
    fn from(x: Real) -> Primitive {
        Primitive::Real(x)
    }
}
impl From<PdfString> for Primitive {
    fn from(x: PdfString) -> Primitive {
        Primitive::String(x)
    }
}
impl From<PdfStream> for Primitive {
    fn from(x: PdfStream) -> Primitive {
        Primitive::Stream(x)
    }
}
impl From<Dictionary> for Primitive {
    fn from(x: Dictionary) -> Primitive {
        Primitive::Dictionary(x)
    }
}
impl From<Vec<Primitive>> for Primitive {
    fn from(x: Vec<Primitive>) -> Primitive {
        Primitive::Array(x)
    }
}
impl From<PlainRef> for Primitive {
    fn from(x: PlainRef) -> Primitive {
        Primitive::Reference(x)
    }
}

/// Integer parsing with clamping: over/underflow saturates at the i64
/// limits instead of failing the whole object.
pub fn parse_integer_clamped(text: &str) -> Result<i64> {
    match text.parse::<i64>() {
        Ok(v) => Ok(v),
        Err(_) if text.starts_with('-') && text[1..].bytes().all(|b| b.is_ascii_digit()) => {
            warn!("integer underflow, clamping: {}", text);
            Ok(i64::MIN)
        }
        Err(_) if text.bytes().all(|b| b.is_ascii_digit()) && !text.is_empty() => {
            warn!("integer overflow, clamping: {}", text);
            Ok(i64::MAX)
        }
        Err(e) => Err(PdfError::Parse { source: e.into() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_removes_key() {
        let mut dict = Dictionary::new();
        dict.insert("Root", Primitive::Integer(1));
        dict.insert("Root", Primitive::Null);
        assert!(dict.get("Root").is_none());
        assert!(dict.is_empty());
    }

    #[test]
    fn name_escapes() {
        let mut out = Vec::new();
        Name::from("A B#c").serialize(&mut out).unwrap();
        assert_eq!(out, b"/A#20B#23c");
    }

    #[test]
    fn real_canonical() {
        assert_eq!(Real::from_text("+1.50").unwrap().as_text(), "1.5");
        assert_eq!(Real::from_text(".5").unwrap().as_text(), "0.5");
        assert_eq!(Real::from_text("-0.0").unwrap().as_text(), "0");
        assert_eq!(Real::from_text("3.").unwrap().as_text(), "3");
        assert!(Real::from_text("x").is_err());
    }

    #[test]
    fn clamped_integers() {
        assert_eq!(parse_integer_clamped("99999999999999999999").unwrap(), i64::MAX);
        assert_eq!(parse_integer_clamped("-99999999999999999999").unwrap(), i64::MIN);
        assert_eq!(parse_integer_clamped("42").unwrap(), 42);
    }

    #[test]
    fn string_serialization() {
        let mut out = Vec::new();
        PdfString::new(*b"a(b)c\\").serialize(&mut out).unwrap();
        assert_eq!(out, br"(a\(b\)c\\)");

        let mut out = Vec::new();
        PdfString::new([0xfeu8, 0xff]).serialize(&mut out).unwrap();
        assert_eq!(out, b"<feff>");
    }
}
