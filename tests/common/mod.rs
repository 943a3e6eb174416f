//! Shared helpers: assemble well-formed PDFs in memory, with a correct
//! classical xref, so the tests control exactly what the parser sees.
#![allow(dead_code)]

/// `objects` are `(id, body)` with ids dense from 1, in order. The body
/// of a stream object includes its `stream`/`endstream` lines.
pub fn build_pdf(objects: &[(u32, Vec<u8>)], trailer: &str) -> Vec<u8> {
    let mut out = b"%PDF-1.4\n%\xbf\xf7\xa2\xfe\n".to_vec();
    let mut offsets = Vec::new();
    for (i, (id, body)) in objects.iter().enumerate() {
        assert_eq!(*id as usize, i + 1, "ids must be dense starting at 1");
        offsets.push(out.len());
        out.extend_from_slice(format!("{} 0 obj\n", id).as_bytes());
        out.extend_from_slice(body);
        out.extend_from_slice(b"\nendobj\n");
    }
    let xref_pos = out.len();
    out.extend_from_slice(format!("xref\n0 {}\n", objects.len() + 1).as_bytes());
    out.extend_from_slice(b"0000000000 65535 f\r\n");
    for offset in offsets {
        out.extend_from_slice(format!("{:010} 00000 n\r\n", offset).as_bytes());
    }
    out.extend_from_slice(format!("trailer\n{}\nstartxref\n{}\n%%EOF\n", trailer, xref_pos).as_bytes());
    out
}

pub fn stream_body(dict_extra: &str, data: &[u8]) -> Vec<u8> {
    let mut body = format!("<< /Length {}{} >>\nstream\n", data.len(), dict_extra).into_bytes();
    body.extend_from_slice(data);
    body.extend_from_slice(b"\nendstream");
    body
}

/// One catalog, one pages node, one page, one content stream.
pub fn one_page_pdf() -> Vec<u8> {
    build_pdf(
        &[
            (1, b"<< /Type /Catalog /Pages 2 0 R >>".to_vec()),
            (2, b"<< /Type /Pages /Kids [ 3 0 R ] /Count 1 >>".to_vec()),
            (
                3,
                b"<< /Type /Page /Parent 2 0 R /MediaBox [ 0 0 612 792 ] /Contents 4 0 R >>".to_vec(),
            ),
            (4, stream_body("", b"BT ET\n")),
        ],
        "<< /Size 5 /Root 1 0 R >>",
    )
}

/// Three pages, each with its own content stream.
pub fn three_page_pdf() -> Vec<u8> {
    build_pdf(
        &[
            (1, b"<< /Type /Catalog /Pages 2 0 R >>".to_vec()),
            (2, b"<< /Type /Pages /Kids [ 3 0 R 5 0 R 7 0 R ] /Count 3 >>".to_vec()),
            (3, b"<< /Type /Page /Parent 2 0 R /MediaBox [ 0 0 612 792 ] /Contents 4 0 R >>".to_vec()),
            (4, stream_body("", b"(P1) Tj\n")),
            (5, b"<< /Type /Page /Parent 2 0 R /MediaBox [ 0 0 612 792 ] /Contents 6 0 R >>".to_vec()),
            (6, stream_body("", b"(P2) Tj\n")),
            (7, b"<< /Type /Page /Parent 2 0 R /MediaBox [ 0 0 612 792 ] /Contents 8 0 R >>".to_vec()),
            (8, stream_body("", b"(P3) Tj\n")),
        ],
        "<< /Size 9 /Root 1 0 R >>",
    )
}

/// Decoded content-stream bytes of page `n` (0-based).
pub fn page_content(file: &pdfmill::File<Vec<u8>>, n: usize) -> Vec<u8> {
    use pdfmill::primitive::Primitive;
    let pages = file.page_refs().unwrap();
    let page = file.resolve_ref(pages[n]).unwrap();
    let contents = page.as_dictionary().unwrap().get("Contents").unwrap().clone();
    let r = contents.as_reference().unwrap();
    match file.resolve_ref(r).unwrap() {
        Primitive::Stream(s) => file.stream_data_decoded(&s, r).unwrap(),
        p => panic!("contents is {:?}", p),
    }
}

/// Find `needle` and parse the integer that follows it.
pub fn int_after(haystack: &[u8], needle: &str) -> usize {
    let pos = haystack
        .windows(needle.len())
        .position(|w| w == needle.as_bytes())
        .unwrap_or_else(|| panic!("{:?} not found", needle));
    let rest = &haystack[pos + needle.len()..];
    let digits: Vec<u8> = rest.iter().copied().skip_while(|b| *b == b' ').take_while(|b| b.is_ascii_digit()).collect();
    String::from_utf8(digits).unwrap().parse().unwrap()
}
