//! Xref reconstruction: when the declared structure is unusable, scan
//! the whole file for `n g obj` headers and trailer dictionaries and
//! rebuild the table from what is actually there.

use crate::error::*;
use crate::object::{GenNr, NoResolve, ObjNr};
use crate::parser::{parse_with_lexer, parse_xref_stream_and_trailer, Lexer, ParseFlags};
use crate::primitive::Dictionary;
use crate::xref::{XRef, XRefTable};

/// Recovery gives up after this many accumulated warnings; past that the
/// file is too far gone for the result to mean anything.
pub const MAX_RECOVERY_WARNINGS: usize = 1000;

/// Tokens any longer than this cannot be part of an object header.
const MAX_RECOVERY_LEXEME: usize = 10;

pub struct Reconstruction {
    pub trailer: Dictionary,
    pub warnings: Vec<PdfError>,
}

/// Rebuilds `table` in place from a forward scan of `buf`. Compressed
/// entries survive (they locate object streams the scan cannot see);
/// everything else is rebuilt. Errors returned here are fatal - a second
/// reconstruction attempt must not be made.
pub fn reconstruct_xref(buf: &[u8], table: &mut XRefTable) -> Result<Reconstruction> {
    let mut warnings = Vec::new();
    let warn = |warnings: &mut Vec<PdfError>, e: PdfError| -> Result<()> {
        warn!("recovery: {}", e);
        warnings.push(e);
        if warnings.len() > MAX_RECOVERY_WARNINGS {
            return Err(PdfError::TooManyErrors);
        }
        Ok(())
    };

    table.clear_uncompressed();

    // Phase 1: find `<int> <int> obj` triples starting at line boundaries,
    // and remember every `trailer` keyword.
    let mut found: Vec<(ObjNr, GenNr, usize)> = Vec::new();
    let mut trailer_offsets: Vec<usize> = Vec::new();
    let max_id = table.max_id();

    let mut lexer = Lexer::new(buf).with_max_lexeme(MAX_RECOVERY_LEXEME);
    let mut line_start = 0;
    while line_start < buf.len() {
        lexer.set_pos(line_start);
        match lexer.next() {
            Ok(t1) if t1.is_integer() => {
                let header_offset = t1.file_offset();
                let t2 = lexer.next();
                let t3 = lexer.next();
                if let (Ok(t2), Ok(t3)) = (t2, t3) {
                    if t2.is_integer() && t3.equals(b"obj") {
                        match (t1.to::<ObjNr>(), t2.to::<GenNr>()) {
                            (Ok(id), Ok(gen)) if id <= max_id => found.push((id, gen, header_offset)),
                            (Ok(id), _) => {
                                warn(&mut warnings, PdfError::damaged(
                                    "recovery",
                                    header_offset,
                                    format!("ignoring object with impossibly large id {}", id),
                                ))?;
                            }
                            _ => {}
                        }
                    }
                }
            }
            Ok(t1) if t1.equals(b"trailer") => {
                trailer_offsets.push(t1.file_offset() + b"trailer".len());
            }
            _ => {}
        }
        line_start = match buf[line_start..].iter().position(|&b| b == b'\n' || b == b'\r') {
            Some(i) => line_start + i + 1,
            None => break,
        };
    }

    // Phase 2: the last trailer in the file that parses as a dictionary
    // wins.
    let mut trailer: Option<Dictionary> = None;
    for &offset in trailer_offsets.iter().rev() {
        let mut lexer = Lexer::with_offset(&buf[offset..], offset);
        match parse_with_lexer(&mut lexer, &NoResolve, ParseFlags::DICT) {
            Ok(p) => match p.into_dictionary(&NoResolve) {
                Ok(dict) => {
                    trailer = Some(dict);
                    break;
                }
                Err(e) => warn(&mut warnings, e)?,
            },
            Err(e) => warn(&mut warnings, e)?,
        }
    }

    // Phase 3: insert what the scan found, later occurrences first so a
    // file with incremental updates resolves to its newest bodies.
    for &(id, gen, offset) in found.iter().rev() {
        if let Ok(XRef::Invalid) = table.get(id).or(Ok::<XRef, PdfError>(XRef::Invalid)) {
            table.set(id, XRef::Raw { pos: offset, gen });
        }
    }

    // Phase 4: no classical trailer - look for an xref stream among the
    // recovered objects; the last one in the file wins.
    if trailer.is_none() {
        let mut best: Option<(usize, ObjNr)> = None;
        for id in table.used_ids().collect::<Vec<_>>() {
            if let Ok(XRef::Raw { pos, .. }) = table.get(id) {
                if looks_like_xref_stream(&buf[pos.min(buf.len())..]) && best.map_or(true, |(p, _)| pos > p) {
                    best = Some((pos, id));
                }
            }
        }
        if let Some((pos, _)) = best {
            let mut lexer = Lexer::with_offset(&buf[pos..], pos);
            match parse_xref_stream_and_trailer(&mut lexer, buf) {
                Ok((sections, stream_trailer)) => {
                    for section in sections {
                        table.add_entries_from(section);
                    }
                    trailer = Some(stream_trailer);
                }
                Err(_) => {
                    err!(PdfError::damaged(
                        "recovery",
                        pos,
                        "error decoding candidate xref stream while recovering damaged file",
                    ));
                }
            }
        }
    }

    let trailer = match trailer {
        Some(t) => t,
        None => err!(PdfError::damaged(
            "recovery",
            0,
            "unable to find trailer dictionary while recovering damaged file",
        )),
    };
    if table.used_ids().next().is_none() {
        err!(PdfError::damaged("recovery", 0, "unable to find objects while recovering damaged file"));
    }

    Ok(Reconstruction { trailer, warnings })
}

/// Cheap test for `n g obj` followed by a dictionary with `/Type /XRef`,
/// without committing to a full parse.
fn looks_like_xref_stream(buf: &[u8]) -> bool {
    let head = &buf[..buf.len().min(512)];
    match head.windows(5).position(|w| w == b"/XRef") {
        Some(_) => {
            let mut lexer = Lexer::new(head);
            let mut ints = 0;
            while let Ok(token) = lexer.next() {
                if token.is_integer() {
                    ints += 1;
                } else {
                    return ints == 2 && token.equals(b"obj");
                }
            }
            false
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;

    fn minimal_pdf_without_xref() -> Vec<u8> {
        b"%PDF-1.4\n\
          1 0 obj\n<< /Type /Catalog /Pages 2 0 R >>\nendobj\n\
          2 0 obj\n<< /Type /Pages /Kids [3 0 R] /Count 1 >>\nendobj\n\
          3 0 obj\n<< /Type /Page /Parent 2 0 R >>\nendobj\n\
          trailer\n<< /Size 4 /Root 1 0 R >>\n\
          startxref\n99999\n%%EOF\n"
            .to_vec()
    }

    #[test]
    fn scan_finds_objects_and_trailer() {
        let buf = minimal_pdf_without_xref();
        let mut table = XRefTable::new(0, buf.max_id());
        let rec = reconstruct_xref(&buf, &mut table).unwrap();
        assert_eq!(rec.trailer.get("Size").unwrap().as_integer().unwrap(), 4);
        assert_eq!(table.used_ids().collect::<Vec<_>>(), vec![1, 2, 3]);
        // offsets point at the object headers
        match table.get(1).unwrap() {
            XRef::Raw { pos, .. } => assert!(buf[pos..].starts_with(b"1 0 obj")),
            e => panic!("unexpected entry {:?}", e),
        }
    }

    #[test]
    fn later_duplicate_wins() {
        let mut buf = minimal_pdf_without_xref();
        // append an incremental update of object 3
        let update_pos = buf.len();
        buf.extend_from_slice(b"3 0 obj\n<< /Type /Page /Rotate 90 >>\nendobj\n");
        let mut table = XRefTable::new(0, buf.max_id());
        reconstruct_xref(&buf, &mut table).unwrap();
        match table.get(3).unwrap() {
            XRef::Raw { pos, .. } => assert_eq!(pos, update_pos),
            e => panic!("unexpected entry {:?}", e),
        }
    }

    #[test]
    fn no_objects_is_fatal() {
        let buf = b"this is not a pdf at all\n".to_vec();
        let mut table = XRefTable::new(0, 100);
        assert!(reconstruct_xref(&buf, &mut table).is_err());
    }
}
