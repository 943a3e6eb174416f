//! Linearized output: parameter dictionary, layout and read-back.

mod common;

use common::{int_after, page_content, three_page_pdf};
use pdfmill::writer::WriteOptions;
use pdfmill::{File, Writer};

fn linearized() -> Vec<u8> {
    let mut file = File::from_data(three_page_pdf()).unwrap();
    Writer::new(&mut file, WriteOptions::linearized()).write_to_vec().unwrap()
}

#[test]
fn parameter_dictionary_is_valid() {
    let out = linearized();

    // the parameter dictionary sits inside the first 1024 bytes
    let lin_pos = out.windows(14).position(|w| w == b"/Linearized 1 ").expect("no /Linearized key");
    assert!(lin_pos < 1024, "linearization dictionary too late: {}", lin_pos);

    // /L is the total file length
    assert_eq!(int_after(&out, "/L "), out.len());

    // /N is the page count
    assert_eq!(int_after(&out, "/N "), 3);

    // /H points at the hint stream object
    let h_offset = int_after(&out, "/H [ ");
    let hint_region = &out[h_offset..];
    assert!(hint_region.windows(7).position(|w| w == b"/Filter").is_some());
    assert!(hint_region.windows(3).position(|w| w == b"/S ").is_some());

    // /O is the renumbered first-page object
    let o = int_after(&out, "/O ");
    let header = format!("{} 0 obj", o);
    assert!(
        out.windows(header.len()).any(|w| w == header.as_bytes()),
        "first page object {} not present",
        o
    );

    // /E lies inside the file
    let e = int_after(&out, "/E ");
    assert!(e > 0 && e <= out.len());

    // /T points just before the first entry of the main xref table
    let t = int_after(&out, "/T ");
    assert!(out[t + 1..].starts_with(b"0000000000 65535 f"), "/T does not point at the main xref");
}

#[test]
fn first_xref_precedes_page_content() {
    let out = linearized();
    let xref_pos = out.windows(5).position(|w| w == b"xref\n").unwrap();
    let o = int_after(&out, "/O ");
    let header = format!("{} 0 obj", o);
    let page_pos = out.windows(header.len()).position(|w| w == header.as_bytes()).unwrap();
    assert!(xref_pos < page_pos, "first xref must come before the first page");
    // and the inner startxref of the first section points at 0
    assert!(out.windows(12).any(|w| w == b"startxref\n0\n"));
}

#[test]
fn reparses_with_all_pages_in_order() {
    let out = linearized();
    let mut file = File::from_data(out).unwrap();
    file.all_objects().unwrap();
    assert!(!file.any_warnings(), "warnings: {:?}", file.warnings());
    assert_eq!(file.page_refs().unwrap().len(), 3);
    assert_eq!(page_content(&file, 0), b"(P1) Tj\n");
    assert_eq!(page_content(&file, 1), b"(P2) Tj\n");
    assert_eq!(page_content(&file, 2), b"(P3) Tj\n");
}

#[test]
fn renumbered_first_page_leads_the_first_half() {
    let out = linearized();
    let o = int_after(&out, "/O ");
    let file = File::from_data(out).unwrap();
    let pages = file.page_refs().unwrap();
    assert_eq!(pages[0].id as usize, o);
    // other pages were placed in the second half, below the first half ids
    assert!(pages[1].id < pages[0].id);
    assert!(pages[2].id < pages[0].id);
}
