//! Reading xref sections - the classical 20-byte-entry table and the
//! compressed xref-stream form - together with their trailer dictionary.

use crate::enc;
use crate::error::*;
use crate::object::{GenNr, NoResolve, ObjNr};
use crate::parser::lexer::Lexer;
use crate::parser::parse_object::parse_indirect_object;
use crate::parser::{parse_with_lexer, ParseFlags};
use crate::primitive::{Dictionary, Primitive, StreamData};
use crate::xref::{XRef, XRefSection};

/// Reads xref sections and the trailer starting wherever `startxref` (or
/// a `/Prev` link) pointed. Decides between the two syntaxes by peeking
/// for the `xref` keyword.
pub fn read_xref_and_trailer_at(lexer: &mut Lexer, file: &[u8]) -> Result<(Vec<XRefSection>, Dictionary)> {
    let next_word = t!(lexer.next());
    if next_word.equals(b"xref") {
        parse_xref_table_and_trailer(lexer)
    } else {
        t!(lexer.back());
        parse_xref_stream_and_trailer(lexer, file)
    }
}

/// Classical table: subsection headers `first count` followed by exactly
/// 20-byte entries. The token-based reading tolerates the whitespace
/// deviations seen in the wild.
pub fn parse_xref_table_and_trailer(lexer: &mut Lexer) -> Result<(Vec<XRefSection>, Dictionary)> {
    let mut sections = Vec::new();

    while !t!(lexer.peek()).equals(b"trailer") {
        let start_id = t!(lexer.next_as::<ObjNr>());
        let num_ids = t!(lexer.next_as::<u32>());

        let mut section = XRefSection::new(start_id);
        for i in 0..num_ids {
            let w1 = t!(lexer.next());
            if w1.equals(b"trailer") {
                err!(PdfError::damaged(
                    "xref table",
                    lexer.last_offset(),
                    format!("{} entries declared, only {} found", num_ids, i),
                ));
            }
            let w2 = t!(lexer.next());
            let w3 = t!(lexer.next());
            if w3.equals(b"f") {
                section.add_free_entry(t!(w1.to::<ObjNr>()), t!(w2.to::<GenNr>()));
            } else if w3.equals(b"n") {
                section.add_inuse_entry(t!(w1.to::<usize>()), t!(w2.to::<GenNr>()));
            } else {
                err!(PdfError::UnexpectedLexeme {
                    pos: lexer.last_offset(),
                    lexeme: w3.to_string(),
                    expected: "f or n",
                });
            }
        }
        sections.push(section);
    }

    t!(lexer.next_expect("trailer"));
    let trailer = t!(parse_with_lexer(lexer, &NoResolve, ParseFlags::DICT));
    Ok((sections, t!(trailer.into_dictionary(&NoResolve))))
}

/// Xref stream: `/W` gives the three field widths, `/Index` the id
/// ranges, and the payload is usually Flate + PNG predictor.
pub fn parse_xref_stream_and_trailer(lexer: &mut Lexer, file: &[u8]) -> Result<(Vec<XRefSection>, Dictionary)> {
    let (_, stream_obj, _) = t!(parse_indirect_object(lexer, &NoResolve, None));
    let stream = match stream_obj {
        Primitive::Stream(s) => s,
        p => err!(PdfError::UnexpectedPrimitive { expected: "Stream", found: p.get_debug_name() }),
    };
    stream.info.expect("XRef stream", "Type", "XRef", true)?;
    let trailer = stream.info.clone();

    let raw = match stream.data {
        StreamData::InFile(ref range) => file
            .get(range.clone())
            .ok_or_else(|| PdfError::damaged("xref stream", range.start, "data range outside file"))?
            .to_vec(),
        StreamData::InMemory(ref data) => data.as_ref().clone(),
        StreamData::Provided(ref p) => t!(p.provide()),
    };
    let mut data = raw;
    for filter in t!(enc::filters_of(&stream.info, &NoResolve)) {
        data = t!(enc::decode(&data, &filter));
    }

    let size = try_opt!(trailer.get("Size")).as_usize()?;
    let widths: Vec<usize> = match trailer.get("W") {
        Some(Primitive::Array(arr)) => {
            let mut v = Vec::with_capacity(arr.len());
            for p in arr {
                let w = p.as_usize()?;
                if w > 8 {
                    bail!("xref stream field width {} exceeds 8", w);
                }
                v.push(w);
            }
            v
        }
        _ => err!(PdfError::MissingEntry { typ: "XRef stream", field: "W".into() }),
    };
    if widths.len() != 3 {
        bail!("xref stream /W must have 3 elements");
    }

    let index: Vec<usize> = match trailer.get("Index") {
        Some(Primitive::Array(arr)) => {
            if arr.len() % 2 != 0 {
                bail!("xref stream /Index has an odd number of elements");
            }
            arr.iter().map(|p| p.as_usize()).collect::<Result<_>>()?
        }
        _ => vec![0, size],
    };

    let mut sections = Vec::new();
    let mut data = &data[..];
    for range in index.chunks_exact(2) {
        sections.push(t!(parse_xref_stream_section(range[0] as ObjNr, range[1], &widths, &mut data)));
    }

    Ok((sections, trailer))
}

fn parse_xref_stream_section(
    first_id: ObjNr,
    mut count: usize,
    widths: &[usize],
    data: &mut &[u8],
) -> Result<XRefSection> {
    let (w0, w1, w2) = (widths[0], widths[1], widths[2]);
    let entry_len = w0 + w1 + w2;
    if count * entry_len > data.len() {
        warn!("xref stream shorter than /Index declares, truncating");
        count = data.len() / entry_len.max(1);
    }

    let mut section = XRefSection::new(first_id);
    for _ in 0..count {
        // a zero-width type field defaults to "uncompressed"
        let ty = if w0 == 0 { 1 } else { read_be(w0, data) };
        let field1 = read_be(w1, data);
        let field2 = read_be(w2, data);
        match ty {
            0 => section.add_free_entry(field1 as ObjNr, field2 as GenNr),
            1 => section.add_inuse_entry(field1 as usize, field2 as GenNr),
            2 => section.add_stream_entry(field1 as ObjNr, field2 as usize),
            // 7.5.8.3: unknown types are references to the null object;
            // an Invalid entry resolves to null downstream
            other => {
                warn!("xref stream entry type {} treated as null", other);
                section.entries.push(XRef::Invalid);
            }
        }
    }
    Ok(section)
}

#[inline]
fn read_be(width: usize, data: &mut &[u8]) -> u64 {
    let mut result = 0u64;
    for _ in 0..width {
        result = result << 8 | data[0] as u64;
        *data = &data[1..];
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classic_table() {
        let data = b"xref\n0 3\n0000000000 65535 f \n0000000015 00000 n \n0000000123 00000 n \ntrailer\n<< /Size 3 /Root 1 0 R >>\n";
        let mut lexer = Lexer::new(data);
        let (sections, trailer) = read_xref_and_trailer_at(&mut lexer, data).unwrap();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].first_id, 0);
        assert_eq!(sections[0].entries[1], XRef::Raw { pos: 15, gen: 0 });
        assert_eq!(trailer.get("Size").unwrap().as_integer().unwrap(), 3);
    }

    #[test]
    fn short_table_is_damage() {
        let data = b"xref\n0 5\n0000000000 65535 f \ntrailer\n<<>>";
        let mut lexer = Lexer::new(data);
        assert!(read_xref_and_trailer_at(&mut lexer, data).is_err());
    }

    #[test]
    fn xref_stream() {
        // three entries: free, raw at 0x20, compressed in stream 4 index 1
        let rows: &[u8] = &[0, 0, 0, 0, 1, 0, 0x20, 0, 2, 0, 4, 1];
        let body = crate::enc::flate_encode(rows);
        let mut data = format!(
            "7 0 obj\n<< /Type /XRef /Size 3 /W [1 2 1] /Filter /FlateDecode /Length {} /Root 1 0 R >>\nstream\n",
            body.len()
        )
        .into_bytes();
        data.extend_from_slice(&body);
        data.extend_from_slice(b"\nendstream\nendobj\n");

        let mut lexer = Lexer::new(&data);
        let (sections, trailer) = read_xref_and_trailer_at(&mut lexer, &data).unwrap();
        assert_eq!(trailer.get("Size").unwrap().as_integer().unwrap(), 3);
        assert_eq!(sections.len(), 1);
        assert_eq!(
            sections[0].entries,
            vec![
                XRef::Free { next_free: 0, gen: 0 },
                XRef::Raw { pos: 0x20, gen: 0 },
                XRef::Stream { stream_id: 4, index: 1 },
            ]
        );
    }
}
