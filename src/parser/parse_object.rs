//! Parsing `n g obj ... endobj` at a known offset.

use crate::error::*;
use crate::object::{GenNr, ObjNr, PlainRef, Resolve};
use crate::parser::lexer::Lexer;
use crate::parser::{parse_with_lexer_ctx, Context, ParseFlags, StringDecrypter, MAX_DEPTH};
use crate::primitive::Primitive;

/// Where an indirect object ended: before and after the whitespace that
/// follows its body. The linearizer consults these when computing and
/// validating the first-page extent.
#[derive(Copy, Clone, Debug, Default)]
pub struct ObjSpan {
    pub end_before_space: usize,
    pub end_after_space: usize,
}

pub fn parse_indirect_object(
    lexer: &mut Lexer,
    r: &impl Resolve,
    decrypter: Option<&dyn StringDecrypter>,
) -> Result<(PlainRef, Primitive, ObjSpan)> {
    let obj_nr = t!(t!(lexer.next()).to::<ObjNr>());
    let gen_nr = t!(t!(lexer.next()).to::<GenNr>());
    t!(lexer.next_expect("obj"));

    let id = PlainRef { id: obj_nr, gen: gen_nr };
    let ctx = Context { decrypter, id };

    // `n g obj endobj` appears in the wild; the body defaults to null
    let obj = if t!(lexer.peek()).equals(b"endobj") {
        warn!("empty object body for {}, substituting null", id);
        Primitive::Null
    } else {
        t!(parse_with_lexer_ctx(lexer, r, Some(&ctx), ParseFlags::ANY, MAX_DEPTH))
    };

    let end_before_space = lexer.file_pos();
    t!(lexer.next_expect("endobj"));
    let mut span = ObjSpan { end_before_space, end_after_space: lexer.file_pos() };
    // swallow the EOL after endobj
    let rest = lexer.get_remaining_slice();
    let ws = rest.iter().take_while(|b| matches!(b, b' ' | b'\r' | b'\n' | b'\t')).count();
    span.end_after_space += ws;

    Ok((id, obj, span))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::NoResolve;

    #[test]
    fn simple_object() {
        let mut lexer = Lexer::new(b"7 0 obj\n<< /K 1 >>\nendobj\n");
        let (id, obj, span) = parse_indirect_object(&mut lexer, &NoResolve, None).unwrap();
        assert_eq!(id, PlainRef { id: 7, gen: 0 });
        assert_eq!(obj.as_dictionary().unwrap().get("K").unwrap().as_integer().unwrap(), 1);
        assert_eq!(span.end_after_space, 26);
    }

    #[test]
    fn empty_body_is_null() {
        let mut lexer = Lexer::new(b"3 0 obj endobj");
        let (_, obj, _) = parse_indirect_object(&mut lexer, &NoResolve, None).unwrap();
        assert!(obj.is_null());
    }
}
