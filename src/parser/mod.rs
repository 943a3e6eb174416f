//! Turning lexemes into primitives.

mod lexer;
mod parse_object;
mod parse_xref;

pub use self::lexer::*;
pub use self::parse_object::*;
pub use self::parse_xref::*;

use crate::error::*;
use crate::object::{GenNr, ObjNr, PlainRef, Resolve};
use crate::primitive::{parse_integer_clamped, Dictionary, Name, PdfStream, PdfString, Primitive, Real, StreamData};
use bitflags::bitflags;

/// Composite nesting bound; a dictionary inside an array inside ... deeper
/// than this is treated as an attack on the stack.
pub const MAX_DEPTH: usize = 20;

bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ParseFlags: u16 {
        const INTEGER = 1 << 0;
        const STREAM = 1 << 1;
        const DICT = 1 << 2;
        const NUMBER = 1 << 3;
        const NAME = 1 << 4;
        const ARRAY = 1 << 5;
        const STRING = 1 << 6;
        const BOOL = 1 << 7;
        const NULL = 1 << 8;
        const REF = 1 << 9;
        const ANY = (1 << 10) - 1;
    }
}

/// Strings parsed from an encrypted document pass through this before
/// they are stored. The containing object's identity selects the
/// per-object key.
pub trait StringDecrypter {
    fn decrypt_string(&self, id: PlainRef, data: Vec<u8>) -> Result<Vec<u8>>;
}

pub struct Context<'a> {
    pub decrypter: Option<&'a dyn StringDecrypter>,
    pub id: PlainRef,
}

impl<'a> Context<'a> {
    fn decrypt(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        match self.decrypter {
            Some(d) => d.decrypt_string(self.id, data),
            None => Ok(data),
        }
    }
}

/// Can parse a stream but only if its dictionary does not contain an
/// indirect `/Length`. Use `parse_indirect_object` when it may.
pub fn parse(data: &[u8], r: &impl Resolve, flags: ParseFlags) -> Result<Primitive> {
    parse_with_lexer(&mut Lexer::new(data), r, flags)
}

pub fn parse_with_lexer(lexer: &mut Lexer, r: &impl Resolve, flags: ParseFlags) -> Result<Primitive> {
    parse_with_lexer_ctx(lexer, r, None, flags, MAX_DEPTH)
}

/// Recursive workhorse. On failure the lexer is rolled back to where the
/// failed value began, so the caller can point at it or skip it.
pub fn parse_with_lexer_ctx(
    lexer: &mut Lexer,
    r: &impl Resolve,
    ctx: Option<&Context>,
    flags: ParseFlags,
    max_depth: usize,
) -> Result<Primitive> {
    let pos = lexer.get_pos();
    match parse_one(lexer, r, ctx, flags, max_depth) {
        Ok(p) => Ok(p),
        Err(e) => {
            lexer.set_pos(pos);
            Err(e)
        }
    }
}

#[inline]
fn check(flags: ParseFlags, allowed: ParseFlags) -> Result<()> {
    if !flags.intersects(allowed) {
        bail!("primitive not allowed here (allowed {:?})", flags);
    }
    Ok(())
}

fn parse_one(
    lexer: &mut Lexer,
    r: &impl Resolve,
    ctx: Option<&Context>,
    flags: ParseFlags,
    max_depth: usize,
) -> Result<Primitive> {
    let first_lexeme = t!(lexer.next());

    let obj = if first_lexeme.equals(b"<<") {
        check(flags, ParseFlags::DICT | ParseFlags::STREAM)?;
        if max_depth == 0 {
            return Err(PdfError::MaxDepth);
        }
        let dict = t!(parse_dictionary_body(lexer, r, ctx, max_depth - 1));
        // It might just be the dictionary in front of a stream.
        if t!(lexer.peek()).equals(b"stream") {
            check(flags, ParseFlags::STREAM)?;
            let id = ctx.map(|c| c.id).unwrap_or(PlainRef { id: 0, gen: 0 });
            Primitive::Stream(t!(parse_stream_body(dict, lexer, r, id)))
        } else {
            Primitive::Dictionary(dict)
        }
    } else if first_lexeme.is_integer() {
        // May be an Integer or the first third of a Reference
        check(flags, ParseFlags::INTEGER | ParseFlags::REF)?;
        let pos_bk = lexer.get_pos();

        let second_lexeme = t!(lexer.peek());
        if second_lexeme.is_integer() {
            t!(lexer.next());
            let third_lexeme = t!(lexer.peek());
            if third_lexeme.equals(b"R") {
                t!(lexer.next());
                check(flags, ParseFlags::REF)?;
                Primitive::Reference(PlainRef {
                    id: t!(first_lexeme.to::<ObjNr>()),
                    gen: t!(second_lexeme.to::<GenNr>()),
                })
            } else {
                check(flags, ParseFlags::INTEGER)?;
                // just two numbers in a row: keep only the first
                lexer.set_pos(pos_bk);
                Primitive::Integer(t!(parse_integer_clamped(first_lexeme.as_str()?)))
            }
        } else {
            check(flags, ParseFlags::INTEGER)?;
            Primitive::Integer(t!(parse_integer_clamped(first_lexeme.as_str()?)))
        }
    } else if first_lexeme.is_real_number() {
        check(flags, ParseFlags::NUMBER)?;
        Primitive::Real(t!(Real::from_text(first_lexeme.as_str()?)))
    } else if first_lexeme.starts_with(b"/") {
        check(flags, ParseFlags::NAME)?;
        Primitive::Name(t!(decode_name(&first_lexeme)))
    } else if first_lexeme.equals(b"[") {
        check(flags, ParseFlags::ARRAY)?;
        if max_depth == 0 {
            return Err(PdfError::MaxDepth);
        }
        let mut array = Vec::new();
        loop {
            if t!(lexer.peek()).equals(b"]") {
                break;
            }
            array.push(t!(parse_with_lexer_ctx(lexer, r, ctx, ParseFlags::ANY, max_depth - 1)));
        }
        t!(lexer.next()); // the closing delimiter
        Primitive::Array(array)
    } else if first_lexeme.equals(b"(") {
        check(flags, ParseFlags::STRING)?;
        let (data, consumed) = t!(scan_literal_string(lexer.get_remaining_slice()));
        lexer.offset_pos(consumed);
        let data = match ctx {
            Some(ctx) => t!(ctx.decrypt(data)),
            None => data,
        };
        Primitive::String(PdfString::new(data))
    } else if first_lexeme.equals(b"<") {
        check(flags, ParseFlags::STRING)?;
        let (data, consumed) = t!(scan_hex_string(lexer.get_remaining_slice()));
        lexer.offset_pos(consumed);
        let data = match ctx {
            Some(ctx) => t!(ctx.decrypt(data)),
            None => data,
        };
        Primitive::String(PdfString::new(data))
    } else if first_lexeme.equals(b"true") {
        check(flags, ParseFlags::BOOL)?;
        Primitive::Boolean(true)
    } else if first_lexeme.equals(b"false") {
        check(flags, ParseFlags::BOOL)?;
        Primitive::Boolean(false)
    } else if first_lexeme.equals(b"null") {
        check(flags, ParseFlags::NULL)?;
        Primitive::Null
    } else {
        err!(PdfError::UnknownType {
            pos: lexer.last_offset(),
            first_lexeme: first_lexeme.to_string(),
        });
    };

    Ok(obj)
}

/// `#xx` escapes resolved; the leading solidus is stripped here and
/// re-added on serialization.
fn decode_name(lexeme: &Substr) -> Result<Name> {
    let rest = lexeme.reslice(1..);
    let rest = rest.as_slice();
    if !rest.contains(&b'#') {
        return Ok(Name(std::str::from_utf8(rest)
            .map(|s| s.to_owned())
            .unwrap_or_else(|_| String::from_utf8_lossy(rest).into_owned())));
    }
    let mut out = Vec::with_capacity(rest.len());
    let mut i = 0;
    while i < rest.len() {
        if rest[i] == b'#' {
            let hi = *rest.get(i + 1).ok_or(PdfError::EOF)?;
            let lo = *rest.get(i + 2).ok_or(PdfError::EOF)?;
            let byte = match (hex_nibble(hi), hex_nibble(lo)) {
                (Some(h), Some(l)) => h << 4 | l,
                _ => return Err(PdfError::HexDecode { pos: lexeme.file_offset() + i, bytes: [hi, lo] }),
            };
            if byte == 0 {
                bail!("NUL byte in name");
            }
            out.push(byte);
            i += 3;
        } else {
            out.push(rest[i]);
            i += 1;
        }
    }
    Ok(Name(String::from_utf8_lossy(&out).into_owned()))
}

#[inline]
fn hex_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 0xa),
        b'A'..=b'F' => Some(c - b'A' + 0xA),
        _ => None,
    }
}

fn parse_dictionary_body(
    lexer: &mut Lexer,
    r: &impl Resolve,
    ctx: Option<&Context>,
    max_depth: usize,
) -> Result<Dictionary> {
    let mut dict = Dictionary::new();
    loop {
        // a Name followed by a value, or the closing '>>'
        let token = t!(lexer.next());
        if token.starts_with(b"/") {
            let key = t!(decode_name(&token));
            let value = t!(parse_with_lexer_ctx(lexer, r, ctx, ParseFlags::ANY, max_depth));
            if dict.contains_key(&key) {
                // last occurrence wins
                warn!("duplicate dictionary key {}", key);
            }
            if value.is_null() {
                // an explicit null is the same as an absent key, but it
                // must not *remove* an earlier duplicate
                dict.remove(&key);
            } else {
                dict.insert(key, value);
            }
        } else if token.equals(b">>") {
            break;
        } else {
            err!(PdfError::UnexpectedLexeme {
                pos: lexer.last_offset(),
                lexeme: token.to_string(),
                expected: "/ or >>",
            });
        }
    }
    Ok(dict)
}

/// The dictionary is already consumed; the lexer sits before `stream`.
/// The payload is never copied here - the stream keeps a byte range of
/// the input.
fn parse_stream_body(dict: Dictionary, lexer: &mut Lexer, r: &impl Resolve, id: PlainRef) -> Result<PdfStream> {
    t!(lexer.next_stream());

    let length = match dict.get("Length") {
        Some(&Primitive::Integer(n)) if n >= 0 => Some(n as usize),
        Some(&Primitive::Reference(len_ref)) => match r.resolve(len_ref) {
            Ok(p) => p.as_usize().ok(),
            Err(_) => None,
        },
        _ => None,
    };

    let data_range = match length {
        Some(length) => {
            let substr = lexer.read_n(length);
            if substr.len() == length && t!(lexer.peek()).equals(b"endstream") {
                t!(lexer.next());
                substr.file_range()
            } else {
                // declared length does not line up; fall back to scanning
                warn!("stream /Length {} is wrong for object {}", length, id);
                lexer.set_pos(lexer.get_pos() - substr.len());
                t!(scan_to_endstream(lexer, id))
            }
        }
        None => {
            warn!("stream /Length missing or unresolvable for object {}", id);
            t!(scan_to_endstream(lexer, id))
        }
    };

    let mut dict = dict;
    dict.insert("Length", Primitive::Integer(data_range.len() as i64));
    Ok(PdfStream { info: dict, data: StreamData::InFile(data_range) })
}

fn scan_to_endstream(lexer: &mut Lexer, id: PlainRef) -> Result<std::ops::Range<usize>> {
    let data = try_opt!(lexer.seek_substr(b"endstream"));
    let mut range = data.file_range();
    // the EOL preceding "endstream" belongs to the syntax, not the data
    let slice = data.as_slice();
    if slice.ends_with(b"\r\n") {
        range.end -= 2;
    } else if slice.ends_with(b"\n") || slice.ends_with(b"\r") {
        range.end -= 1;
    } else {
        warn!("no end-of-line before endstream of object {}", id);
    }
    Ok(range)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::NoResolve;

    #[test]
    fn dict_with_empty_name() {
        let data = b"<</App<</Name/>>>>";
        let primitive = parse(data, &NoResolve, ParseFlags::DICT).unwrap();
        let dict = primitive.into_dictionary(&NoResolve).unwrap();
        assert_eq!(dict.len(), 1);
        let app = dict.get("App").unwrap().as_dictionary().unwrap();
        assert_eq!(app.get("Name").unwrap().as_name().unwrap(), "");
    }

    #[test]
    fn name_escapes_resolved() {
        let p = parse(b"/A#42", &NoResolve, ParseFlags::NAME).unwrap();
        assert_eq!(p.as_name().unwrap(), "AB");
    }

    #[test]
    fn duplicate_keys_last_wins() {
        let p = parse(b"<</K 1 /K 2>>", &NoResolve, ParseFlags::DICT).unwrap();
        let dict = p.into_dictionary(&NoResolve).unwrap();
        assert_eq!(dict.get("K").unwrap().as_integer().unwrap(), 2);
    }

    #[test]
    fn reference_vs_integers() {
        let p = parse(b"[1 2 R 3]", &NoResolve, ParseFlags::ARRAY).unwrap();
        let arr = p.into_array(&NoResolve).unwrap();
        assert_eq!(arr.len(), 2);
        assert_eq!(arr[0].as_reference().unwrap(), PlainRef { id: 1, gen: 2 });
        assert_eq!(arr[1].as_integer().unwrap(), 3);

        let p = parse(b"[1 2 3]", &NoResolve, ParseFlags::ARRAY).unwrap();
        assert_eq!(p.into_array(&NoResolve).unwrap().len(), 3);
    }

    #[test]
    fn stream_with_direct_length() {
        let data = b"<</Length 5>>stream\nhello\nendstream";
        let p = parse(data, &NoResolve, ParseFlags::STREAM).unwrap();
        let s = p.into_stream().unwrap();
        match s.data {
            StreamData::InFile(ref r) => assert_eq!(r.len(), 5),
            _ => panic!("expected in-file data"),
        }
    }

    #[test]
    fn stream_with_bad_length_recovers() {
        let data = b"<</Length 9999>>stream\nhello\nendstream";
        let p = parse(data, &NoResolve, ParseFlags::STREAM).unwrap();
        let s = p.into_stream().unwrap();
        assert_eq!(s.declared_len(), Some(5));
    }

    #[test]
    fn real_numbers() {
        let p = parse(b"-.002", &NoResolve, ParseFlags::NUMBER).unwrap();
        assert_eq!(p.as_number().unwrap(), -0.002);
    }
}
