//! Round-trips through the writer: clean input in, clean output out,
//! xref reconstruction, and object-stream handling.

mod common;

use common::{build_pdf, one_page_pdf, page_content, stream_body};
use pdfmill::writer::{ObjectStreamMode, StreamDataMode, WriteOptions};
use pdfmill::{File, Writer};

#[test]
fn clean_roundtrip() {
    let mut file = File::from_data(one_page_pdf()).unwrap();
    file.all_objects().unwrap();
    assert!(!file.any_warnings());
    assert_eq!(file.page_refs().unwrap().len(), 1);

    let out = Writer::new(&mut file, WriteOptions::default()).write_to_vec().unwrap();
    assert!(out.starts_with(b"%PDF-1."));
    // four objects plus the free entry, in one classical table
    let text = String::from_utf8_lossy(&out);
    assert!(text.contains("xref\n0 5\n"), "classical xref missing: {}", text);
    assert!(text.contains("startxref"));
    assert!(text.trim_end().ends_with("%%EOF"));

    let mut reparsed = File::from_data(out).unwrap();
    reparsed.all_objects().unwrap();
    assert!(!reparsed.any_warnings(), "warnings: {:?}", reparsed.warnings());
    assert_eq!(reparsed.page_refs().unwrap().len(), 1);
    assert_eq!(page_content(&reparsed, 0), b"BT ET\n");

    let catalog = reparsed.catalog().unwrap();
    assert_eq!(catalog.get("Type").unwrap().as_name().unwrap(), "Catalog");
}

#[test]
fn resolve_is_idempotent() {
    let file = File::from_data(one_page_pdf()).unwrap();
    let root = file.trailer().get("Root").unwrap().as_reference().unwrap();
    let once = file.resolve_ref(root).unwrap();
    let twice = file.resolve_ref(root).unwrap();
    assert_eq!(
        once.as_dictionary().unwrap().get("Type").unwrap().as_name().unwrap(),
        twice.as_dictionary().unwrap().get("Type").unwrap().as_name().unwrap(),
    );
}

#[test]
fn corrupt_startxref_triggers_reconstruction() {
    let mut data = one_page_pdf();
    // break the startxref value
    let pos = data.windows(10).rposition(|w| w == b"startxref\n").unwrap() + 10;
    let end = data[pos..].iter().position(|b| !b.is_ascii_digit()).unwrap() + pos;
    data.splice(pos..end, b"999999".iter().copied());

    let mut file = File::from_data(data).unwrap();
    assert!(file.any_warnings());
    assert_eq!(file.page_refs().unwrap().len(), 1);
    assert_eq!(page_content(&file, 0), b"BT ET\n");

    // the rewritten file is clean again
    let out = Writer::new(&mut file, WriteOptions::default()).write_to_vec().unwrap();
    let mut reparsed = File::from_data(out).unwrap();
    reparsed.all_objects().unwrap();
    assert!(!reparsed.any_warnings(), "warnings: {:?}", reparsed.warnings());
    assert_eq!(page_content(&reparsed, 0), b"BT ET\n");
}

#[test]
fn object_stream_generation_and_read_back() {
    let mut file = File::from_data(one_page_pdf()).unwrap();
    let options =
        WriteOptions { object_stream_mode: ObjectStreamMode::Generate, ..WriteOptions::default() };
    let out = Writer::new(&mut file, options).write_to_vec().unwrap();
    let text = String::from_utf8_lossy(&out);
    assert!(text.contains("/ObjStm"), "no object stream generated");
    assert!(text.contains("/XRef"), "no xref stream emitted");
    assert!(text.contains("%PDF-1.5") || text.contains("%PDF-1.6") || text.contains("%PDF-1.7"));

    // resolving the page goes through the object-stream reader
    let mut compressed = File::from_data(out).unwrap();
    let pages = compressed.page_refs().unwrap();
    assert_eq!(pages.len(), 1);
    let page = compressed.resolve_ref(pages[0]).unwrap();
    assert_eq!(page.as_dictionary().unwrap().get("Type").unwrap().as_name().unwrap(), "Page");
    assert_eq!(page_content(&compressed, 0), b"BT ET\n");

    // disable: the page comes back out as a standalone object
    let out = Writer::new(&mut compressed, WriteOptions { object_stream_mode: ObjectStreamMode::Disable, ..WriteOptions::default() })
        .write_to_vec()
        .unwrap();
    let text = String::from_utf8_lossy(&out);
    assert!(!text.contains("/ObjStm"));
    assert!(text.contains("xref\n"));
    let mut standalone = File::from_data(out).unwrap();
    standalone.all_objects().unwrap();
    assert!(!standalone.any_warnings(), "warnings: {:?}", standalone.warnings());

    // preserve: it goes back into a container
    let mut compressed = {
        let mut file = File::from_data(one_page_pdf()).unwrap();
        let options = WriteOptions { object_stream_mode: ObjectStreamMode::Generate, ..WriteOptions::default() };
        File::from_data(Writer::new(&mut file, options).write_to_vec().unwrap()).unwrap()
    };
    let out = Writer::new(&mut compressed, WriteOptions { object_stream_mode: ObjectStreamMode::Preserve, ..WriteOptions::default() })
        .write_to_vec()
        .unwrap();
    assert!(String::from_utf8_lossy(&out).contains("/ObjStm"));
}

#[test]
fn uncompress_and_recompress_stream_data() {
    // a flate-compressed content stream survives both data modes
    let compressed = {
        let deflated = pdfmill::enc::flate_encode(b"BT (x) Tj ET\n");
        stream_body(" /Filter /FlateDecode", &deflated)
    };
    let data = build_pdf(
        &[
            (1, b"<< /Type /Catalog /Pages 2 0 R >>".to_vec()),
            (2, b"<< /Type /Pages /Kids [ 3 0 R ] /Count 1 >>".to_vec()),
            (3, b"<< /Type /Page /Parent 2 0 R /Contents 4 0 R >>".to_vec()),
            (4, compressed),
        ],
        "<< /Size 5 /Root 1 0 R >>",
    );

    let mut file = File::from_data(data).unwrap();
    assert_eq!(page_content(&file, 0), b"BT (x) Tj ET\n");

    let out = Writer::new(&mut file, WriteOptions { stream_data_mode: StreamDataMode::Uncompress, ..WriteOptions::default() })
        .write_to_vec()
        .unwrap();
    let plain = File::from_data(out).unwrap();
    assert_eq!(page_content(&plain, 0), b"BT (x) Tj ET\n");

    let mut plain = plain;
    let out = Writer::new(&mut plain, WriteOptions { stream_data_mode: StreamDataMode::Compress, ..WriteOptions::default() })
        .write_to_vec()
        .unwrap();
    assert!(String::from_utf8_lossy(&out).contains("/FlateDecode"));
    let recompressed = File::from_data(out).unwrap();
    assert_eq!(page_content(&recompressed, 0), b"BT (x) Tj ET\n");
}

#[test]
fn static_id_is_reproducible() {
    let write = || {
        let mut file = File::from_data(one_page_pdf()).unwrap();
        Writer::new(&mut file, WriteOptions { static_id: true, ..WriteOptions::default() })
            .write_to_vec()
            .unwrap()
    };
    let (a, b) = (write(), write());
    assert_eq!(a, b, "static /ID output must be byte-identical across runs");

    let file = File::from_data(a).unwrap();
    let trailer = file.trailer();
    let ids = trailer.get("ID").unwrap().as_array().unwrap();
    let first = ids[0].as_string().unwrap().as_bytes();
    assert_eq!(first.len(), 16);
    assert_eq!(first, ids[1].as_string().unwrap().as_bytes());
}

#[test]
fn deterministic_id_preserves_input_first_word() {
    let options = || WriteOptions { deterministic_id: true, ..WriteOptions::default() };

    // an input /ID keeps its first word; the second becomes the digest
    let input = build_pdf(
        &[
            (1, b"<< /Type /Catalog /Pages 2 0 R >>".to_vec()),
            (2, b"<< /Type /Pages /Kids [ 3 0 R ] /Count 1 >>".to_vec()),
            (3, b"<< /Type /Page /Parent 2 0 R /Contents 4 0 R >>".to_vec()),
            (4, stream_body("", b"BT ET\n")),
        ],
        "<< /Size 5 /Root 1 0 R /ID [ <00112233445566778899aabbccddeeff> <00112233445566778899aabbccddeeff> ] >>",
    );
    let mut file = File::from_data(input).unwrap();
    let out = Writer::new(&mut file, options()).write_to_vec().unwrap();
    let reparsed = File::from_data(out).unwrap();
    let trailer = reparsed.trailer();
    let ids = trailer.get("ID").unwrap().as_array().unwrap();
    assert_eq!(
        ids[0].as_string().unwrap().as_bytes(),
        &[0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff],
    );
    assert_ne!(ids[0].as_string().unwrap().as_bytes(), ids[1].as_string().unwrap().as_bytes());

    // with no input /ID, both words take the output digest
    let mut file = File::from_data(one_page_pdf()).unwrap();
    let out = Writer::new(&mut file, options()).write_to_vec().unwrap();
    let reparsed = File::from_data(out).unwrap();
    let trailer = reparsed.trailer();
    let ids = trailer.get("ID").unwrap().as_array().unwrap();
    assert_eq!(ids[0].as_string().unwrap().as_bytes(), ids[1].as_string().unwrap().as_bytes());
    assert_eq!(ids[0].as_string().unwrap().as_bytes().len(), 16);
}

#[test]
fn replaced_stream_provider_is_written() {
    use pdfmill::primitive::{Dictionary, PdfStream, Primitive};

    let mut file = File::from_data(one_page_pdf()).unwrap();
    let pages = file.page_refs().unwrap();
    let page = file.resolve_ref(pages[0]).unwrap();
    let contents = page.as_dictionary().unwrap().get("Contents").unwrap().as_reference().unwrap();

    // swap the payload for a provider; the dictionary stays
    let provider = std::rc::Rc::new(|| -> pdfmill::error::Result<Vec<u8>> { Ok(b"0 0 m\n".to_vec()) });
    let stream = PdfStream::with_provider(Dictionary::new(), provider);
    file.replace(contents, Primitive::Stream(stream)).unwrap();

    let out = Writer::new(&mut file, WriteOptions::default()).write_to_vec().unwrap();
    let reparsed = File::from_data(out).unwrap();
    assert_eq!(page_content(&reparsed, 0), b"0 0 m\n");
}

#[test]
fn qdf_output_is_annotated() {
    let mut file = File::from_data(one_page_pdf()).unwrap();
    let out = Writer::new(&mut file, WriteOptions::qdf()).write_to_vec().unwrap();
    let text = String::from_utf8_lossy(&out);
    assert!(text.contains("%% Original object ID: 1 0"));
    // indirect stream lengths in QDF mode
    assert!(text.contains("/Length 5 0 R"), "{}", text);
    let mut reparsed = File::from_data(out).unwrap();
    reparsed.all_objects().unwrap();
    assert!(!reparsed.any_warnings(), "warnings: {:?}", reparsed.warnings());
    // QDF normalizes content: one operator per line
    assert_eq!(page_content(&reparsed, 0), b"BT\nET\n");
}
