//! Linearized ("web-optimized") output: first page material at the
//! front behind its own xref, hint tables, everything else behind. Two
//! passes: the first measures offsets into a discarded buffer, the
//! second writes for real with the hint stream spliced in.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use super::hints::{HintTables, OutlineHints, PageOffsetEntry};
use super::{
    transform_for_write, write_header, write_value, ObjectStreamMode, Prepared, SerCtx, Writer,
};
use crate::backend::Backend;
use crate::crypt::Encoder;
use crate::error::*;
use crate::file::File;
use crate::object::{ObjNr, PlainRef};
use crate::primitive::{Dictionary, Primitive};

// Pass 2 must reproduce pass 1's layout exactly, so everything whose
// value is only known after pass 1 gets written into a fixed-width slot.
// With classical xref tables those slots are the two below plus the
// 20-byte entries themselves; a compressed first xref would additionally
// need worst-case deflate headroom (16 bytes plus 5 per 16 KiB block),
// which never arises here since linearized output always uses tables.

/// The linearization parameter dictionary is padded to this many bytes
/// so both passes place it identically; generous enough for 20-digit
/// offsets.
const LINDICT_PAD: usize = 200;

/// Pad /Prev in the first trailer to this width; its value is only known
/// after pass 1.
const PREV_PAD: usize = 21;

pub(super) fn write_linearized<B: Backend>(mut writer: Writer<B>) -> Result<Vec<u8>> {
    if writer.options.object_stream_mode != ObjectStreamMode::Disable {
        warn!("object streams are not generated in linearized output");
        writer.options.object_stream_mode = ObjectStreamMode::Disable;
    }
    t!(writer.file.fix_dangling_refs());

    let parts = t!(compute_parts(writer.file));
    let plan = t!(Plan::number(writer.file, &writer, &parts));

    let (id1, id2) = t!(writer.generate_id());
    let encoder = t!(writer.make_encoder(&id1));
    if encoder.is_some() && plan.encrypt_id.is_none() {
        err!(PdfError::logic("encryption requested but no id was reserved"));
    }

    // Pass 1: measure.
    let mut pass1 = t!(emit_pass(&writer, &plan, &parts, encoder.as_ref(), (&id1, &id2), None));

    // Hint tables from pass-1 offsets; their own bytes are excluded from
    // every offset they describe.
    let hint_buffer = t!(build_hint_stream(&plan, &parts, &pass1, encoder.as_ref()));
    let measured = Measured {
        offsets: std::mem::take(&mut pass1.offsets),
        hint_offset: pass1.hint_offset,
        hint_length: hint_buffer.len(),
        hint_buffer,
        second_xref_offset: pass1.second_xref_offset,
        space_before_zero: pass1.space_before_zero,
        part6_end_offset: pass1.part6_end_offset,
        file_size: pass1.out.len(),
    };

    // Pass 2: for real.
    let pass2 = t!(emit_pass(&writer, &plan, &parts, encoder.as_ref(), (&id1, &id2), Some(&measured)));

    // Offset stability: every object must land where pass 1 said,
    // shifted by the hint stream where applicable.
    for (&id, &p1) in &measured.offsets {
        if let Some(&p2) = pass2.offsets.get(&id) {
            let expect = if id == plan.hint_id || p1 < measured.hint_offset {
                p1
            } else {
                p1 + measured.hint_length
            };
            if p2 != expect {
                err!(PdfError::logic(format!(
                    "linearization offset drift for object {}: {} != {}",
                    id, p2, expect
                )));
            }
        }
    }

    writer.report(100);
    Ok(pass2.out)
}

//////////////////////////
// Object users and parts

/// Who references an object, transitively: the categories that decide
/// which part it lands in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum ObjUser {
    Root,
    TrailerKey(String),
    RootKey(String),
    Page(usize),
    Thumb(usize),
}

pub(super) struct Parts {
    pub part4: Vec<PlainRef>,
    pub part6: Vec<PlainRef>,
    pub part7: Vec<PlainRef>,
    pub part8: Vec<PlainRef>,
    pub part9: Vec<PlainRef>,
    pub pages: Vec<PlainRef>,
    /// Objects per page: all of part 6 for page 0, the page plus its
    /// private objects otherwise.
    pub page_nobjects: Vec<usize>,
    /// Shared-table indexes referenced per page (empty for page 0).
    pub page_shared: Vec<Vec<u64>>,
    pub nshared_first_page: usize,
    pub first_shared_old: Option<PlainRef>,
    pub shared_order: Vec<PlainRef>,
    pub outline_first: Option<PlainRef>,
    pub outline_count: usize,
    pub content_old: HashSet<PlainRef>,
}

fn walk_marking<B: Backend>(
    file: &File<B>,
    start: &Primitive,
    ou: &ObjUser,
    obj_users: &mut BTreeMap<PlainRef, BTreeSet<ObjUser>>,
    user_objs: &mut BTreeMap<ObjUser, BTreeSet<PlainRef>>,
) -> Result<()> {
    let mut stack = Vec::new();
    super::collect_refs(start, &mut stack);
    let mut visited: HashSet<PlainRef> = HashSet::new();
    while let Some(r) = stack.pop() {
        if !visited.insert(r) {
            continue;
        }
        let value = t!(file.resolve_ref(r));
        if value.is_null() {
            continue;
        }
        // Traversal stops at page objects: they belong to their own page
        // user, never to whoever happened to point at them.
        if let Ok(dict) = value.as_dictionary() {
            if dict.get("Type").and_then(|p| p.as_name().ok()) == Some("Page") {
                continue;
            }
        }
        obj_users.entry(r).or_default().insert(ou.clone());
        user_objs.entry(ou.clone()).or_default().insert(r);
        super::collect_refs(&value, &mut stack);
    }
    Ok(())
}

fn compute_parts<B: Backend>(file: &File<B>) -> Result<Parts> {
    let mut trailer = file.trailer();
    for key in ["ID", "Encrypt", "Prev", "Index", "W", "Length", "Filter", "DecodeParms", "Type", "XRefStm"] {
        trailer.remove(key);
    }
    let root_ref = trailer
        .get("Root")
        .and_then(|p| p.as_reference().ok())
        .ok_or(PdfError::MissingEntry { typ: "Trailer", field: "Root".into() })?;
    let root = t!(t!(file.resolve_ref(root_ref)).into_dictionary(file.storage()));
    let pages = t!(file.page_refs());
    if pages.is_empty() {
        err!(PdfError::damaged("linearization", 0, "no pages to linearize"));
    }

    let mut obj_users: BTreeMap<PlainRef, BTreeSet<ObjUser>> = BTreeMap::new();
    let mut user_objs: BTreeMap<ObjUser, BTreeSet<PlainRef>> = BTreeMap::new();

    obj_users.entry(root_ref).or_default().insert(ObjUser::Root);
    user_objs.entry(ObjUser::Root).or_default().insert(root_ref);

    for (key, value) in trailer.iter() {
        if key.as_str() == "Root" {
            continue;
        }
        let ou = ObjUser::TrailerKey(key.as_str().to_owned());
        t!(walk_marking(file, value, &ou, &mut obj_users, &mut user_objs));
    }
    for (key, value) in root.iter() {
        let ou = ObjUser::RootKey(key.as_str().to_owned());
        t!(walk_marking(file, value, &ou, &mut obj_users, &mut user_objs));
    }

    let mut content_old: HashSet<PlainRef> = HashSet::new();
    for (i, &page_ref) in pages.iter().enumerate() {
        let ou = ObjUser::Page(i);
        obj_users.entry(page_ref).or_default().insert(ou.clone());
        user_objs.entry(ou.clone()).or_default().insert(page_ref);
        let page = match t!(file.resolve_ref(page_ref)) {
            Primitive::Dictionary(d) => d,
            _ => continue,
        };
        // /Parent would drag the whole tree in; /Thumb is its own user
        let mut pruned = page.clone();
        pruned.remove("Parent");
        pruned.remove("Thumb");
        t!(walk_marking(file, &Primitive::Dictionary(pruned), &ou, &mut obj_users, &mut user_objs));
        if let Some(thumb) = page.get("Thumb") {
            let tu = ObjUser::Thumb(i);
            t!(walk_marking(file, thumb, &tu, &mut obj_users, &mut user_objs));
        }
        match page.get("Contents") {
            Some(&Primitive::Reference(r)) => {
                content_old.insert(r);
            }
            Some(Primitive::Array(arr)) => {
                for p in arr {
                    if let Primitive::Reference(r) = p {
                        content_old.insert(*r);
                    }
                }
            }
            _ => {}
        }
    }

    // Categorization, first applicable rule wins.
    let outlines_in_first_page = root.get("PageMode").and_then(|p| p.as_name().ok()) == Some("UseOutlines")
        && root.contains_key("Outlines");
    let open_document_keys = ["ViewerPreferences", "PageMode", "Threads", "OpenAction", "AcroForm"];

    let mut lc_open_document = BTreeSet::new();
    let mut lc_first_page_private = BTreeSet::new();
    let mut lc_first_page_shared = BTreeSet::new();
    let mut lc_other_page_private = BTreeSet::new();
    let mut lc_other_page_shared = BTreeSet::new();
    let mut lc_thumbnail_private = BTreeSet::new();
    let mut lc_thumbnail_shared = BTreeSet::new();
    let mut lc_outlines = BTreeSet::new();
    let mut lc_other = BTreeSet::new();

    for (&og, ous) in &obj_users {
        let mut in_open_document = false;
        let mut in_first_page = false;
        let mut other_pages = 0;
        let mut thumbs = 0;
        let mut others = 0;
        let mut in_outlines = false;
        let mut is_root = false;
        for ou in ous {
            match ou {
                ObjUser::TrailerKey(k) => {
                    if k == "Encrypt" {
                        in_open_document = true;
                    } else {
                        others += 1;
                    }
                }
                ObjUser::Thumb(_) => thumbs += 1,
                ObjUser::RootKey(k) => {
                    if open_document_keys.contains(&k.as_str()) {
                        in_open_document = true;
                    } else if k == "Outlines" {
                        in_outlines = true;
                    } else {
                        others += 1;
                    }
                }
                ObjUser::Page(0) => in_first_page = true,
                ObjUser::Page(_) => other_pages += 1,
                ObjUser::Root => is_root = true,
            }
        }
        if is_root {
            // part 4, placed first below
        } else if in_outlines {
            lc_outlines.insert(og);
        } else if in_open_document {
            lc_open_document.insert(og);
        } else if in_first_page && others == 0 && other_pages == 0 && thumbs == 0 {
            lc_first_page_private.insert(og);
        } else if in_first_page {
            lc_first_page_shared.insert(og);
        } else if other_pages == 1 && others == 0 && thumbs == 0 {
            lc_other_page_private.insert(og);
        } else if other_pages > 1 {
            lc_other_page_shared.insert(og);
        } else if thumbs == 1 && others == 0 {
            lc_thumbnail_private.insert(og);
        } else if thumbs > 1 {
            lc_thumbnail_shared.insert(og);
        } else {
            lc_other.insert(og);
        }
    }

    // Part 4: catalog and document-open objects.
    let mut part4 = vec![root_ref];
    part4.extend(lc_open_document.iter().copied());

    // Part 6: first page, its private objects, objects shared with the
    // first page, and outlines when the document opens on them.
    let first_page = pages[0];
    if !lc_first_page_private.remove(&first_page) {
        err!(PdfError::damaged("linearization", 0, "first page is not private to the first page"));
    }
    let mut part6 = vec![first_page];
    part6.extend(lc_first_page_private.iter().copied());
    part6.extend(lc_first_page_shared.iter().copied());
    let mut outline_first = None;
    let mut outline_count = 0;
    if outlines_in_first_page && !lc_outlines.is_empty() {
        outline_first = lc_outlines.iter().next().copied();
        outline_count = lc_outlines.len();
        part6.extend(lc_outlines.iter().copied());
        lc_outlines.clear();
    }

    // Part 7: the other pages, each followed by its private objects.
    let mut part7 = Vec::new();
    let mut page_nobjects = vec![part6.len()];
    for (i, &page_ref) in pages.iter().enumerate().skip(1) {
        lc_other_page_private.remove(&page_ref);
        part7.push(page_ref);
        let mut count = 1;
        if let Some(objs) = user_objs.get(&ObjUser::Page(i)) {
            for &og in objs {
                if lc_other_page_private.remove(&og) {
                    part7.push(og);
                    count += 1;
                }
            }
        }
        page_nobjects.push(count);
    }

    // Part 8: objects shared among pages 2..N.
    let part8: Vec<PlainRef> = lc_other_page_shared.iter().copied().collect();

    // Part 9: pages tree first, then thumbnails in page order, shared
    // thumbnails, outlines unless already placed, then the rest.
    let mut part9 = Vec::new();
    if let Some(pages_ogs) = user_objs.get(&ObjUser::RootKey("Pages".into())) {
        for &og in pages_ogs {
            if lc_other.remove(&og) {
                part9.push(og);
            }
        }
    }
    for (i, &page_ref) in pages.iter().enumerate() {
        let thumb = file
            .resolve_ref(page_ref)
            .ok()
            .and_then(|p| p.as_dictionary().ok().and_then(|d| d.get("Thumb").cloned()))
            .and_then(|p| p.as_reference().ok());
        if let Some(thumb) = thumb {
            if lc_thumbnail_private.remove(&thumb) {
                part9.push(thumb);
            }
            if let Some(objs) = user_objs.get(&ObjUser::Thumb(i)) {
                for &og in objs {
                    if lc_thumbnail_private.remove(&og) {
                        part9.push(og);
                    }
                }
            }
        }
    }
    part9.extend(lc_thumbnail_shared.iter().copied());
    if !lc_outlines.is_empty() {
        outline_first = lc_outlines.iter().next().copied();
        outline_count = lc_outlines.len();
        part9.extend(lc_outlines.iter().copied());
        lc_outlines.clear();
    }
    part9.extend(lc_other.iter().copied());

    // Shared-object table: all of part 6, then all of part 8.
    let mut shared_index: HashMap<PlainRef, u64> = HashMap::new();
    let mut shared_order = Vec::with_capacity(part6.len() + part8.len());
    for &og in part6.iter().chain(part8.iter()) {
        shared_index.insert(og, shared_order.len() as u64);
        shared_order.push(og);
    }
    let first_shared_old = part8.first().copied();

    let mut page_shared: Vec<Vec<u64>> = vec![Vec::new()];
    for i in 1..pages.len() {
        let mut ids = Vec::new();
        if let Some(objs) = user_objs.get(&ObjUser::Page(i)) {
            for og in objs {
                let shared_elsewhere = obj_users.get(og).map_or(false, |u| u.len() > 1);
                if shared_elsewhere {
                    if let Some(&idx) = shared_index.get(og) {
                        ids.push(idx);
                    }
                }
            }
        }
        page_shared.push(ids);
    }

    Ok(Parts {
        nshared_first_page: part6.len(),
        part4,
        part6,
        part7,
        part8,
        part9,
        pages,
        page_nobjects,
        page_shared,
        first_shared_old,
        shared_order,
        outline_first,
        outline_count,
        content_old,
    })
}

//////////////////////////
// Numbering

pub(super) struct Plan {
    pub prepared: Prepared,
    pub lindict_id: ObjNr,
    pub encrypt_id: Option<ObjNr>,
    pub hint_id: ObjNr,
    /// part4 then part6, in write order.
    pub first_half: Vec<ObjNr>,
    /// part7 then part8 then part9, in write order.
    pub second_half: Vec<ObjNr>,
    pub first_half_start: ObjNr,
    pub first_half_end: ObjNr,
    pub second_half_end: ObjNr,
    pub part4_last: Option<ObjNr>,
    pub part6_last: ObjNr,
    pub first_page_id: ObjNr,
    pub npages: usize,
}

impl Plan {
    fn number<B: Backend>(file: &File<B>, writer: &Writer<B>, parts: &Parts) -> Result<Plan> {
        let needs_encrypt = writer.options.encrypt.is_some() || writer.options.preserve_encryption;

        let mut trailer = file.trailer();
        // /Size is also dropped: both linearized trailers write their own.
        for key in
            ["ID", "Encrypt", "Prev", "Index", "W", "Length", "Filter", "DecodeParms", "Type", "XRefStm", "Size"]
        {
            trailer.remove(key);
        }

        let n_second = parts.part7.len() + parts.part8.len() + parts.part9.len();
        let mut renumber: HashMap<PlainRef, ObjNr> = HashMap::new();
        let mut next: ObjNr = 1;
        let mut second_half = Vec::with_capacity(n_second);
        for &old in parts.part7.iter().chain(parts.part8.iter()).chain(parts.part9.iter()) {
            renumber.insert(old, next);
            second_half.push(next);
            next += 1;
        }
        let second_half_end = next - 1;

        let first_half_start = next;
        let lindict_id = next;
        next += 1;
        let mut first_half = Vec::new();
        let mut part4_last = None;
        for &old in &parts.part4 {
            renumber.insert(old, next);
            first_half.push(next);
            part4_last = Some(next);
            next += 1;
        }
        let encrypt_id = if needs_encrypt {
            let id = next;
            next += 1;
            Some(id)
        } else {
            None
        };
        let hint_id = next;
        next += 1;
        let first_page_id = next;
        for &old in &parts.part6 {
            renumber.insert(old, next);
            first_half.push(next);
            next += 1;
        }
        let first_half_end = next - 1;
        let part6_last = first_half_end;

        // Snapshot and transform the values under their new numbers.
        let catalog_old = trailer.get("Root").and_then(|p| p.as_reference().ok());
        let mut values = HashMap::new();
        let mut old_of = HashMap::new();
        let mut content_streams = HashSet::new();
        let mut skip_encryption = HashSet::new();
        let keep_metadata_plain = file.decoder().map_or(false, |d| !d.encrypt_metadata)
            || writer.options.encrypt.as_ref().map_or(false, |p| !p.encrypt_metadata);
        let metadata_old = catalog_old
            .and_then(|r| file.resolve_ref(r).ok())
            .and_then(|c| c.as_dictionary().ok().and_then(|d| d.get("Metadata").cloned()))
            .and_then(|p| p.as_reference().ok());

        for (&old, &new_id) in &renumber {
            let value = t!(file.resolve_ref(old));
            if matches!(value, Primitive::Reserved) {
                err!(PdfError::ReservedObject { obj_nr: old.id });
            }
            let value = t!(transform_for_write(file, value, catalog_old == Some(old)));
            values.insert(new_id, value);
            old_of.insert(new_id, old);
            if parts.content_old.contains(&old) {
                content_streams.insert(new_id);
            }
            if keep_metadata_plain && metadata_old == Some(old) {
                skip_encryption.insert(new_id);
            }
        }

        let pages_new: Vec<ObjNr> = parts.pages.iter().filter_map(|r| renumber.get(r).copied()).collect();
        let catalog_new = catalog_old.and_then(|r| renumber.get(&r).copied());
        let prepared = Prepared {
            order: Vec::new(),
            values,
            old_of,
            renumber,
            trailer,
            content_streams,
            pages: pages_new,
            catalog: catalog_new,
            objstm_of: HashMap::new(),
            containers: Vec::new(),
            length_ids: HashMap::new(),
            skip_encryption,
            next,
        };

        Ok(Plan {
            prepared,
            lindict_id,
            encrypt_id,
            hint_id,
            first_half,
            second_half,
            first_half_start,
            first_half_end,
            second_half_end,
            part4_last,
            part6_last,
            first_page_id,
            npages: parts.pages.len(),
        })
    }
}

//////////////////////////
// Emission

struct Measured {
    offsets: HashMap<ObjNr, usize>,
    hint_offset: usize,
    hint_length: usize,
    hint_buffer: Vec<u8>,
    second_xref_offset: usize,
    space_before_zero: usize,
    part6_end_offset: usize,
    file_size: usize,
}

struct PassOut {
    out: Vec<u8>,
    offsets: HashMap<ObjNr, usize>,
    ends: HashMap<ObjNr, usize>,
    hint_offset: usize,
    second_xref_offset: usize,
    space_before_zero: usize,
    part6_end_offset: usize,
}

fn emit_pass<B: Backend>(
    writer: &Writer<B>,
    plan: &Plan,
    parts: &Parts,
    encoder: Option<&Encoder>,
    id: (&[u8], &[u8]),
    measured: Option<&Measured>,
) -> Result<PassOut> {
    let mut pass = PassOut {
        out: Vec::new(),
        offsets: HashMap::new(),
        ends: HashMap::new(),
        hint_offset: 0,
        second_xref_offset: 0,
        space_before_zero: 0,
        part6_end_offset: 0,
    };
    let out = &mut pass.out;
    let version = writer.output_version(false);
    write_header(out, version)?;

    // Part 2: linearization parameter dictionary, fixed-size block.
    let block_start = out.len();
    pass.offsets.insert(plan.lindict_id, block_start);
    out.extend_from_slice(format!("{} 0 obj\n<<", plan.lindict_id).as_bytes());
    if let Some(m) = measured {
        out.extend_from_slice(
            format!(
                " /Linearized 1 /L {} /H [ {} {} ] /O {} /E {} /N {} /T {}",
                m.file_size + m.hint_length,
                m.hint_offset,
                m.hint_length,
                plan.first_page_id,
                m.part6_end_offset + m.hint_length,
                plan.npages,
                m.space_before_zero + m.hint_length,
            )
            .as_bytes(),
        );
    }
    out.extend_from_slice(b" >>\nendobj\n");
    let used = out.len() - block_start;
    if used > LINDICT_PAD {
        err!(PdfError::logic("linearization parameter dictionary exceeds its padding"));
    }
    out.extend(std::iter::repeat(b' ').take(LINDICT_PAD - used));
    out.push(b'\n');

    // Part 3: first-page xref table and trailer.
    let first_xref_offset = out.len();
    {
        let count = plan.first_half_end - plan.first_half_start + 1;
        out.extend_from_slice(format!("xref\n{} {}\n", plan.first_half_start, count).as_bytes());
        for id in plan.first_half_start..=plan.first_half_end {
            let offset = match measured {
                Some(m) => {
                    let p1 = m.offsets.get(&id).copied().unwrap_or(0);
                    if id != plan.hint_id && p1 >= m.hint_offset {
                        p1 + m.hint_length
                    } else {
                        p1
                    }
                }
                None => 0,
            };
            out.extend_from_slice(format!("{:010} {:05} n\r\n", offset, 0).as_bytes());
        }
        let prev = measured.map(|m| m.second_xref_offset + m.hint_length).unwrap_or(0);
        write_lin_trailer(out, plan, encoder, id, plan.first_half_end as i64 + 1, Some(prev))?;
        out.extend_from_slice(b"startxref\n0\n%%EOF\n");
    }

    // Parts 4 through 9.
    let total = plan.first_half.len() + plan.second_half.len();
    let mut written = 0usize;
    let write_one = |pass: &mut PassOut, id: ObjNr| -> Result<()> {
        pass.offsets.insert(id, pass.out.len());
        t!(writer.write_object(&mut pass.out, &plan.prepared, id, encoder));
        pass.ends.insert(id, pass.out.len());
        Ok(())
    };

    for &id in &plan.first_half {
        t!(write_one(&mut pass, id));
        written += 1;
        writer.report((written * 100 / total.max(1)) as u32 / 2);
        if Some(id) == plan.part4_last {
            // Encryption dictionary, then part 5: the hint stream.
            if let (Some(enc), Some(encrypt_id)) = (encoder, plan.encrypt_id) {
                pass.offsets.insert(encrypt_id, pass.out.len());
                let mut body = Vec::new();
                let ctx = SerCtx::plain(&plan.prepared.renumber, false);
                t!(write_value(&mut body, &Primitive::Dictionary(enc.dict().clone()), &ctx, 0));
                pass.out.extend_from_slice(format!("{} 0 obj\n", encrypt_id).as_bytes());
                pass.out.extend_from_slice(&body);
                pass.out.extend_from_slice(b"\nendobj\n");
                pass.ends.insert(encrypt_id, pass.out.len());
            }
            pass.hint_offset = pass.out.len();
            pass.offsets.insert(plan.hint_id, pass.hint_offset);
            if let Some(m) = measured {
                pass.out.extend_from_slice(&m.hint_buffer);
            }
        }
        if id == plan.part6_last {
            pass.part6_end_offset = pass.out.len();
        }
    }

    for &id in &plan.second_half {
        t!(write_one(&mut pass, id));
        written += 1;
        writer.report(50 + (written * 100 / total.max(1)) as u32 / 2);
    }

    // Part 11: main xref table and trailer.
    let out = &mut pass.out;
    pass.second_xref_offset = out.len();
    out.extend_from_slice(format!("xref\n0 {}\n", plan.second_half_end + 1).as_bytes());
    pass.space_before_zero = out.len() - 1;
    out.extend_from_slice(b"0000000000 65535 f\r\n");
    for id in 1..=plan.second_half_end {
        let offset = pass.offsets.get(&id).copied().unwrap_or(0);
        out.extend_from_slice(format!("{:010} {:05} n\r\n", offset, 0).as_bytes());
    }
    write_lin_trailer(out, plan, encoder, id, plan.first_half_start as i64, None)?;
    out.extend_from_slice(format!("startxref\n{}\n%%EOF\n", first_xref_offset).as_bytes());

    Ok(pass)
}

/// Both linearized trailers: /Size, optionally a width-padded /Prev, and
/// the carried-over document keys.
fn write_lin_trailer(
    out: &mut Vec<u8>,
    plan: &Plan,
    encoder: Option<&Encoder>,
    id: (&[u8], &[u8]),
    size: i64,
    prev: Option<usize>,
) -> Result<()> {
    out.extend_from_slice(format!("trailer\n<< /Size {}", size).as_bytes());
    if let Some(prev) = prev {
        // padded so both passes produce identical layout
        let value = format!("{}", prev);
        if value.len() > PREV_PAD {
            err!(PdfError::logic("/Prev exceeds its padding"));
        }
        out.extend_from_slice(b" /Prev ");
        out.extend_from_slice(value.as_bytes());
        out.extend(std::iter::repeat(b' ').take(PREV_PAD - value.len()));
    }
    let ctx = SerCtx::plain(&plan.prepared.renumber, false);
    for (key, value) in plan.prepared.trailer.iter() {
        out.push(b' ');
        t!(key.serialize(out));
        out.push(b' ');
        t!(write_value(out, value, &ctx, 0));
    }
    if let (Some(_), Some(encrypt_id)) = (encoder, plan.encrypt_id) {
        out.extend_from_slice(format!(" /Encrypt {} 0 R", encrypt_id).as_bytes());
    }
    out.extend_from_slice(b" /ID [ <");
    for b in id.0 {
        out.extend_from_slice(format!("{:02x}", b).as_bytes());
    }
    out.extend_from_slice(b"> <");
    for b in id.1 {
        out.extend_from_slice(format!("{:02x}", b).as_bytes());
    }
    out.extend_from_slice(b"> ] >>\n");
    Ok(())
}

//////////////////////////
// Hint stream

fn build_hint_stream(
    plan: &Plan,
    parts: &Parts,
    pass1: &PassOut,
    encoder: Option<&Encoder>,
) -> Result<Vec<u8>> {
    let length_of_run = |first_new: ObjNr, count: usize| -> u64 {
        if count == 0 {
            return 0;
        }
        let last = first_new + count as ObjNr - 1;
        let start = pass1.offsets.get(&first_new).copied().unwrap_or(0);
        let end = pass1.ends.get(&last).copied().unwrap_or(start);
        (end - start) as u64
    };

    let mut tables = HintTables::default();

    // Page-offset table.
    let po = &mut tables.page_offset;
    po.first_page_offset = pass1.offsets.get(&plan.first_page_id).copied().unwrap_or(0) as u64;
    po.nshared_total = parts.shared_order.len() as u64;
    let mut page_first_new = Vec::with_capacity(parts.pages.len());
    page_first_new.push(plan.first_page_id);
    {
        // part 7 runs start at each page object
        let mut next = 1 as ObjNr;
        for i in 1..parts.pages.len() {
            page_first_new.push(next);
            next += parts.page_nobjects[i] as ObjNr;
        }
    }
    for (i, &nobjects) in parts.page_nobjects.iter().enumerate() {
        let entry = PageOffsetEntry {
            nobjects: nobjects as u64,
            page_length: length_of_run(page_first_new[i], nobjects),
            shared_identifiers: parts.page_shared.get(i).cloned().unwrap_or_default(),
        };
        po.entries.push(entry);
    }
    po.min_nobjects = po.entries.iter().map(|e| e.nobjects).min().unwrap_or(0);
    po.min_page_length = po.entries.iter().map(|e| e.page_length).min().unwrap_or(0);

    // Shared-object table: part 6 then part 8, one object per group.
    let sh = &mut tables.shared;
    sh.nshared_first_page = parts.nshared_first_page as u64;
    sh.nshared_total = parts.shared_order.len() as u64;
    for &old in &parts.shared_order {
        let new_id = plan.prepared.renumber.get(&old).copied().unwrap_or(0);
        sh.group_lengths.push(length_of_run(new_id, 1));
    }
    if let Some(first_old) = parts.first_shared_old {
        let new_id = plan.prepared.renumber.get(&first_old).copied().unwrap_or(0);
        sh.first_shared_obj = new_id;
        sh.first_shared_offset = pass1.offsets.get(&new_id).copied().unwrap_or(0) as u64;
    }

    // Outline table, only when the document opens on outlines.
    if let Some(first_old) = parts.outline_first {
        let new_id = plan.prepared.renumber.get(&first_old).copied().unwrap_or(0);
        tables.outline = Some(OutlineHints {
            first_object: new_id,
            first_object_offset: pass1.offsets.get(&new_id).copied().unwrap_or(0) as u64,
            nobjects: parts.outline_count as u64,
            group_length: length_of_run(new_id, parts.outline_count),
        });
    }

    let (payload, s_offset, o_offset) = t!(tables.serialize());
    let payload = match encoder {
        Some(enc) => t!(super::encrypt_via_pipeline(enc, PlainRef { id: plan.hint_id, gen: 0 }, &payload)),
        None => payload,
    };

    let mut dict = Dictionary::new();
    dict.insert("Filter", Primitive::name("FlateDecode"));
    dict.insert("S", Primitive::Integer(s_offset as i64));
    if let Some(o) = o_offset {
        dict.insert("O", Primitive::Integer(o as i64));
    }
    dict.insert("Length", Primitive::Integer(payload.len() as i64));

    let mut block = Vec::new();
    block.extend_from_slice(format!("{} 0 obj\n", plan.hint_id).as_bytes());
    t!(dict.serialize(&mut block));
    block.extend_from_slice(b"\nstream\n");
    block.extend_from_slice(&payload);
    block.extend_from_slice(b"\nendstream\nendobj\n");
    Ok(block)
}
