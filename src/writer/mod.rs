//! The reference-preserving writer: enqueue everything reachable from
//! the trailer, renumber densely, and emit a well-formed file. Exact
//! byte preservation is not a goal; structural equivalence is.

mod hints;
mod linearize;

pub use hints::HintTables;

use std::collections::{HashMap, HashSet};
use std::io;

use crate::backend::Backend;
use crate::crypt::{CryptMethod, Encoder, EncryptionParams};
use crate::enc;
use crate::error::*;
use crate::file::File;
use crate::object::{ObjNr, PlainRef, Resolve};
use crate::object_stream::ObjectStreamBuilder;
use crate::parser::{scan_literal_string, Lexer};
use crate::primitive::{Dictionary, PdfStream, PdfString, Primitive};
use crate::xref::{write_classic_table, xref_stream_data, XRef};

/// For reproducible output (test suites): the fixed /ID seed.
const STATIC_ID: [u8; 16] = [
    0x31, 0x41, 0x59, 0x26, 0x53, 0x58, 0x97, 0x93, 0x23, 0x84, 0x62, 0x64, 0x33, 0x83, 0x27, 0x95,
];

/// Object streams hold at most this many members.
const MAX_OBJSTM_MEMBERS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObjectStreamMode {
    /// Emit every object standalone; classical xref table.
    Disable,
    /// Objects that came from an object stream go back into one.
    #[default]
    Preserve,
    /// Pack everything eligible into generated object streams.
    Generate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamDataMode {
    /// Keep payload bytes and filters as they are.
    #[default]
    Preserve,
    /// Strip generalized filters where possible.
    Uncompress,
    /// Re-encode with Flate.
    Compress,
}

/// Which filters may be stripped when recoding stream data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Default)]
pub enum DecodeLevel {
    None,
    #[default]
    Generalized,
    Specialized,
    All,
}

#[derive(Default)]
pub struct WriteOptions {
    pub object_stream_mode: ObjectStreamMode,
    pub stream_data_mode: StreamDataMode,
    /// Lexically re-tokenize page content streams.
    pub normalize_content: bool,
    /// Human-readable layout: uncompressed streams, indirect lengths,
    /// original-id annotations. Excludes linearization.
    pub qdf_mode: bool,
    pub linearize: bool,
    /// Add Flate to streams that have no filter at all.
    pub compress_streams: bool,
    pub decode_level: DecodeLevel,
    /// Carry the input's encryption over to the output.
    pub preserve_encryption: bool,
    /// Encrypt the output with these parameters.
    pub encrypt: Option<EncryptionParams>,
    /// Fixed /ID for reproducible output.
    pub static_id: bool,
    /// /ID derived from the produced bytes instead of the clock.
    pub deterministic_id: bool,
    pub min_pdf_version: Option<(u8, u8)>,
    pub force_pdf_version: Option<(u8, u8)>,
    pub suppress_original_object_ids: bool,
}

impl WriteOptions {
    pub fn qdf() -> WriteOptions {
        WriteOptions {
            qdf_mode: true,
            stream_data_mode: StreamDataMode::Uncompress,
            normalize_content: true,
            object_stream_mode: ObjectStreamMode::Disable,
            ..WriteOptions::default()
        }
    }
    pub fn linearized() -> WriteOptions {
        WriteOptions { linearize: true, ..WriteOptions::default() }
    }

    fn validate(&self) -> Result<()> {
        if self.qdf_mode && self.linearize {
            err!(PdfError::logic("QDF mode excludes linearization"));
        }
        if self.deterministic_id && (self.encrypt.is_some() || self.preserve_encryption) {
            err!(PdfError::logic("deterministic /ID cannot be used with encryption"));
        }
        if self.deterministic_id && self.linearize {
            err!(PdfError::logic("deterministic /ID cannot be used with linearization"));
        }
        if self.encrypt.is_some() && self.preserve_encryption {
            err!(PdfError::logic("choose either fresh encryption or preserved encryption"));
        }
        Ok(())
    }
}

pub struct Writer<'a, B: Backend> {
    file: &'a mut File<B>,
    options: WriteOptions,
    progress: Option<Box<dyn Fn(u32) + 'a>>,
}

impl<'a, B: Backend> Writer<'a, B> {
    pub fn new(file: &'a mut File<B>, options: WriteOptions) -> Writer<'a, B> {
        Writer { file, options, progress: None }
    }

    /// Reporter called with a percentage, at 1% granularity.
    pub fn with_progress(mut self, cb: impl Fn(u32) + 'a) -> Self {
        self.progress = Some(Box::new(cb));
        self
    }

    pub fn write_to(self, out: &mut impl io::Write) -> Result<()> {
        let data = t!(self.write_to_vec());
        t!(out.write_all(&data));
        Ok(())
    }

    pub fn write_to_vec(self) -> Result<Vec<u8>> {
        t!(self.options.validate());
        if self.options.linearize {
            linearize::write_linearized(self)
        } else {
            self.write_standard()
        }
    }

    fn report(&self, percent: u32) {
        if let Some(ref cb) = self.progress {
            cb(percent.min(100));
        }
    }

    fn write_standard(mut self) -> Result<Vec<u8>> {
        t!(self.file.fix_dangling_refs());
        let mut prepared = t!(Prepared::build(self.file, &self.options));
        // Preserve/generate only matter when something actually went into
        // a container; otherwise the file gets a classical table.
        let xref_as_stream = !prepared.containers.is_empty();
        let version = self.output_version(xref_as_stream);

        // /ID before encryption: the legacy key derivation consumes it.
        let (id1, id2) = t!(self.generate_id());
        let encoder = t!(self.make_encoder(&id1));

        let mut out = Vec::new();
        write_header(&mut out, version)?;

        let mut entries: Vec<(ObjNr, XRef)> = vec![(0, XRef::Free { next_free: 0, gen: 65535 })];
        let total = prepared.order.len().max(1);
        let mut last_percent = 0;

        // Standalone objects first; members are emitted with their
        // containers afterwards.
        for (i, &new_id) in prepared.order.clone().iter().enumerate() {
            let percent = (i * 100 / total) as u32;
            if percent > last_percent {
                last_percent = percent;
                self.report(percent);
            }
            if prepared.objstm_of.contains_key(&new_id) {
                continue;
            }
            let pos = out.len();
            entries.push((new_id, XRef::Raw { pos, gen: 0 }));
            t!(self.write_object(&mut out, &prepared, new_id, encoder.as_ref()));
        }

        // Object-stream containers.
        for (container_id, members) in prepared.containers.clone() {
            let pos = out.len();
            entries.push((container_id, XRef::Raw { pos, gen: 0 }));
            for (index, &member) in members.iter().enumerate() {
                entries.push((member, XRef::Stream { stream_id: container_id, index }));
            }
            t!(self.write_object_stream(&mut out, &prepared, container_id, &members, encoder.as_ref()));
        }

        // The encryption dictionary never joins an object stream.
        let encrypt_ref = match encoder {
            Some(ref enc) => {
                let id = prepared.next_id();
                let pos = out.len();
                entries.push((id, XRef::Raw { pos, gen: 0 }));
                let mut body = Vec::new();
                let ctx = SerCtx::plain(&prepared.renumber, self.options.qdf_mode);
                t!(write_value(&mut body, &Primitive::Dictionary(enc.dict().clone()), &ctx, 0));
                write_wrapped_object(&mut out, id, &body)?;
                Some(PlainRef { id, gen: 0 })
            }
            None => None,
        };

        // Deterministic mode re-derives the second word from the bytes
        // produced so far. A first word preserved from the input stays;
        // only the fresh placeholder (id1 == id2) follows the digest.
        let (id1, id2) = if self.options.deterministic_id {
            let digest = md5::compute(&out).to_vec();
            let id1 = if id1 == id2 { digest.clone() } else { id1 };
            (id1, digest)
        } else {
            (id1, id2)
        };

        entries.sort_by_key(|&(id, _)| id);
        let size = entries.last().map(|&(id, _)| id + 1).unwrap_or(1) as i64;

        let mut trailer = prepared.trailer.clone();
        {
            let ctx = SerCtx::plain(&prepared.renumber, false);
            trailer = t!(rewrite_dict_refs(trailer, &ctx));
        }
        trailer.insert("ID", Primitive::Array(vec![
            Primitive::String(PdfString::new(id1)),
            Primitive::String(PdfString::new(id2)),
        ]));
        if let Some(r) = encrypt_ref {
            trailer.insert("Encrypt", Primitive::Reference(r));
        }

        let xref_pos = out.len();
        if !xref_as_stream {
            trailer.insert("Size", Primitive::Integer(size));
            t!(write_classic_table(&mut out, &entries));
            out.extend_from_slice(b"trailer\n");
            let ctx = SerCtx::plain(&prepared.renumber, true);
            t!(write_value(&mut out, &Primitive::Dictionary(trailer), &ctx, 0));
            out.extend_from_slice(b"\n");
        } else {
            let xref_id = prepared.next_id();
            entries.push((xref_id, XRef::Raw { pos: xref_pos, gen: 0 }));
            entries.sort_by_key(|&(id, _)| id);
            let size = entries.last().map(|&(id, _)| id + 1).unwrap_or(1) as i64;
            trailer.insert("Size", Primitive::Integer(size));
            t!(write_xref_stream(&mut out, xref_id, &entries, trailer));
        }

        out.extend_from_slice(format!("startxref\n{}\n%%EOF\n", xref_pos).as_bytes());
        self.report(100);
        Ok(out)
    }

    fn output_version(&self, xref_as_stream: bool) -> (u8, u8) {
        if let Some(v) = self.options.force_pdf_version {
            return v;
        }
        let mut v = self.file.version().max((1, 3));
        if let Some(min) = self.options.min_pdf_version {
            v = v.max(min);
        }
        if xref_as_stream {
            v = v.max((1, 5));
        }
        if let Some(ref params) = self.options.encrypt {
            v = v.max(match params.method {
                CryptMethod::Aesv3 => (1, 7),
                CryptMethod::Aesv2 => (1, 6),
                _ => (1, 4),
            });
        }
        if self.options.linearize {
            v = v.max((1, 4));
        }
        v
    }

    fn generate_id(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let fresh = if self.options.static_id {
            STATIC_ID.to_vec()
        } else if self.options.deterministic_id {
            // placeholder, replaced by a hash of the produced bytes
            STATIC_ID.to_vec()
        } else {
            let mut seed = Vec::new();
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            seed.extend_from_slice(format!("{}", now).as_bytes());
            if let Some(Primitive::Reference(info)) = self.file.trailer().get("Info") {
                if let Ok(Primitive::Dictionary(info)) = self.file.resolve_ref(*info) {
                    for (_, v) in &info {
                        if let Primitive::String(s) = v {
                            seed.push(b' ');
                            seed.extend_from_slice(s.as_bytes());
                        }
                    }
                }
            }
            md5::compute(&seed).to_vec()
        };
        // Keep the original first word when the input had an /ID.
        let id1 = match self.file.trailer().get("ID") {
            Some(Primitive::Array(ids)) => match ids.first() {
                Some(Primitive::String(s)) => s.as_bytes().to_vec(),
                _ => fresh.clone(),
            },
            _ => fresh.clone(),
        };
        Ok((id1, fresh))
    }

    fn make_encoder(&self, id1: &[u8]) -> Result<Option<Encoder>> {
        if let Some(ref params) = self.options.encrypt {
            return Ok(Some(t!(Encoder::new(params, id1))));
        }
        if self.options.preserve_encryption {
            if let Some(decoder) = self.file.decoder() {
                let dict = match self.file.trailer().get("Encrypt") {
                    Some(p) => t!(t!(self.file.storage().resolve_deref(p.clone()))
                        .into_dictionary(self.file.storage())),
                    None => err!(PdfError::NotEncrypted),
                };
                return Ok(Some(Encoder::from_decoder(decoder, dict)));
            }
        }
        Ok(None)
    }

    /// Emit one standalone object, plus its indirect length object in
    /// QDF mode.
    fn write_object(
        &self,
        out: &mut Vec<u8>,
        prepared: &Prepared,
        new_id: ObjNr,
        encoder: Option<&Encoder>,
    ) -> Result<()> {
        if self.options.qdf_mode && !self.options.suppress_original_object_ids {
            if let Some(old) = prepared.old_of.get(&new_id) {
                out.extend_from_slice(format!("%% Original object ID: {} {}\n", old.id, old.gen).as_bytes());
            }
        }
        let value = try_opt!(prepared.values.get(&new_id)).clone();
        match value {
            Primitive::Stream(stream) => {
                let is_content = prepared.content_streams.contains(&new_id);
                let old = prepared.old_of.get(&new_id).copied().unwrap_or(PlainRef { id: 0, gen: 0 });
                let (mut info, payload) = t!(self.stream_out(old, &stream, is_content));
                let payload = match encoder {
                    Some(enc) if !prepared.skip_encryption.contains(&new_id) => {
                        t!(encrypt_via_pipeline(enc, PlainRef { id: new_id, gen: 0 }, &payload))
                    }
                    _ => payload,
                };
                let length_id = prepared.length_ids.get(&new_id).copied();
                match length_id {
                    Some(lid) => info.insert("Length", Primitive::Reference(PlainRef { id: lid, gen: 0 })),
                    None => info.insert("Length", Primitive::Integer(payload.len() as i64)),
                };

                let mut body = Vec::new();
                let ctx = SerCtx {
                    renumber: &prepared.renumber,
                    encoder,
                    current: PlainRef { id: new_id, gen: 0 },
                    encrypt_strings: encoder.is_some() && !prepared.skip_encryption.contains(&new_id),
                    qdf: self.options.qdf_mode,
                };
                t!(write_value(&mut body, &Primitive::Dictionary(info), &ctx, 0));
                body.extend_from_slice(b"\nstream\n");
                body.extend_from_slice(&payload);
                body.extend_from_slice(b"\nendstream");
                write_wrapped_object(out, new_id, &body)?;

                if let Some(lid) = length_id {
                    let body = format!("{}", payload.len()).into_bytes();
                    write_wrapped_object(out, lid, &body)?;
                }
            }
            value => {
                let ctx = SerCtx {
                    renumber: &prepared.renumber,
                    encoder,
                    current: PlainRef { id: new_id, gen: 0 },
                    encrypt_strings: encoder.is_some(),
                    qdf: self.options.qdf_mode,
                };
                let mut body = Vec::new();
                t!(write_value(&mut body, &value, &ctx, 0));
                write_wrapped_object(out, new_id, &body)?;
            }
        }
        Ok(())
    }

    /// Pack members into an `/ObjStm` container and emit it. Strings
    /// inside members are not individually encrypted; the container
    /// payload is.
    fn write_object_stream(
        &self,
        out: &mut Vec<u8>,
        prepared: &Prepared,
        container_id: ObjNr,
        members: &[ObjNr],
        encoder: Option<&Encoder>,
    ) -> Result<()> {
        let mut builder = ObjectStreamBuilder::new();
        for &member in members {
            let value = try_opt!(prepared.values.get(&member)).clone();
            let ctx = SerCtx {
                renumber: &prepared.renumber,
                encoder: None,
                current: PlainRef { id: member, gen: 0 },
                encrypt_strings: false,
                qdf: self.options.qdf_mode,
            };
            let mut body = Vec::new();
            if self.options.qdf_mode && !self.options.suppress_original_object_ids {
                if let Some(old) = prepared.old_of.get(&member) {
                    body.extend_from_slice(
                        format!("%% Original object ID: {} {}\n", old.id, old.gen).as_bytes(),
                    );
                }
            }
            t!(write_value(&mut body, &value, &ctx, 0));
            builder.push(member, body);
        }
        let (mut info, payload) = builder.build();

        let (payload, filtered) = if self.options.qdf_mode {
            (payload, false)
        } else {
            (enc::flate_encode(&payload), true)
        };
        let payload = match encoder {
            Some(enc) => t!(encrypt_via_pipeline(enc, PlainRef { id: container_id, gen: 0 }, &payload)),
            None => payload,
        };
        if filtered {
            info.insert("Filter", Primitive::name("FlateDecode"));
        }
        info.insert("Length", Primitive::Integer(payload.len() as i64));

        if self.options.qdf_mode {
            out.extend_from_slice(format!("%% Object stream: {}\n", container_id).as_bytes());
        }
        let mut body = Vec::new();
        let ctx = SerCtx::plain(&prepared.renumber, self.options.qdf_mode);
        t!(write_value(&mut body, &Primitive::Dictionary(info), &ctx, 0));
        body.extend_from_slice(b"\nstream\n");
        body.extend_from_slice(&payload);
        body.extend_from_slice(b"\nendstream");
        write_wrapped_object(out, container_id, &body)?;
        Ok(())
    }

    /// Apply the stream-data mode: decode, normalize and re-encode as
    /// configured. Returns the final info dictionary (without /Length)
    /// and payload.
    pub(crate) fn stream_out(
        &self,
        old: PlainRef,
        stream: &PdfStream,
        is_content: bool,
    ) -> Result<(Dictionary, Vec<u8>)> {
        let raw = t!(self.file.stream_data(stream, old));
        let filters = t!(enc::filters_of(&stream.info, self.file.storage()));

        let decodable = match self.options.decode_level {
            DecodeLevel::None => false,
            _ => !filters.is_empty() && filters.iter().all(|f| f.is_generalized()),
        };

        let mut info = stream.info.clone();
        info.remove("Length");

        let normalize = self.options.normalize_content && is_content;
        let want_decode = normalize
            || matches!(self.options.stream_data_mode, StreamDataMode::Uncompress | StreamDataMode::Compress);

        let (mut data, mut is_decoded) = if want_decode && decodable {
            let mut data = raw;
            for filter in &filters {
                data = t!(enc::decode(&data, filter));
            }
            (data, true)
        } else if want_decode && filters.is_empty() {
            (raw, true)
        } else {
            (raw, false)
        };

        if normalize && is_decoded {
            data = match normalize_content(&data) {
                Ok(d) => d,
                Err(e) => {
                    t!(self.file.storage().push_warning(PdfError::damaged(
                        format!("content stream {}", old),
                        0,
                        format!("normalization failed: {}", e),
                    )));
                    data
                }
            };
        }

        if is_decoded {
            info.remove("Filter");
            info.remove("DecodeParms");
            info.remove("DP");
            if matches!(self.options.stream_data_mode, StreamDataMode::Compress) && !self.options.qdf_mode {
                data = enc::flate_encode(&data);
                info.insert("Filter", Primitive::name("FlateDecode"));
            }
        } else if self.options.compress_streams && filters.is_empty() && !self.options.qdf_mode {
            data = enc::flate_encode(&data);
            info.insert("Filter", Primitive::name("FlateDecode"));
        }

        Ok((info, data))
    }
}

/// Encryption is the innermost sink of the output pipeline: the cipher
/// sees the payload before anything else does, and AES prepends its
/// random IV and pads to whole blocks.
pub(crate) fn encrypt_via_pipeline(encoder: &Encoder, id: PlainRef, payload: &[u8]) -> Result<Vec<u8>> {
    use crate::pipeline::{AesEncrypt, Buffer, Pipeline, Rc4Pipeline};
    let key = encoder.object_key(id);
    let (buffer, data) = Buffer::new();
    let mut chain: Box<dyn Pipeline> = match encoder.method() {
        CryptMethod::None => Box::new(buffer),
        CryptMethod::Rc4 => Box::new(Rc4Pipeline::new(&key, Box::new(buffer))),
        CryptMethod::Aesv2 | CryptMethod::Aesv3 => {
            let mut iv = [0u8; 16];
            crate::crypt::default_crypto().random_bytes(&mut iv);
            Box::new(AesEncrypt::new(&key, iv, Box::new(buffer)))
        }
    };
    t!(chain.write(payload));
    t!(chain.finish());
    drop(chain);
    Ok(std::rc::Rc::try_unwrap(data).map(|c| c.into_inner()).unwrap_or_else(|rc| rc.borrow().clone()))
}

/// `n 0 obj` ... `endobj` around a serialized body.
fn write_wrapped_object(out: &mut Vec<u8>, id: ObjNr, body: &[u8]) -> Result<()> {
    out.extend_from_slice(format!("{} 0 obj\n", id).as_bytes());
    out.extend_from_slice(body);
    out.extend_from_slice(b"\nendobj\n");
    Ok(())
}

fn write_header(out: &mut Vec<u8>, version: (u8, u8)) -> Result<()> {
    out.extend_from_slice(format!("%PDF-{}.{}\n", version.0, version.1).as_bytes());
    // four high-bit bytes flag binary content
    out.extend_from_slice(b"%\xbf\xf7\xa2\xfe\n");
    Ok(())
}

/// The xref-stream form: self-describing, Flate + PNG-Up, pushed through
/// the predictor and compression pipelines.
fn write_xref_stream(out: &mut Vec<u8>, xref_id: ObjNr, entries: &[(ObjNr, XRef)], trailer: Dictionary) -> Result<()> {
    use crate::pipeline::{Buffer, FlateEncode, Pipeline, PredictorEncode};

    let (w, index, rows) = xref_stream_data(entries);
    let row_len: i64 = w.iter().sum();
    let payload = {
        let (buffer, data) = Buffer::new();
        let flate = FlateEncode::new(Box::new(buffer));
        let mut chain = PredictorEncode::new(row_len as usize, Box::new(flate));
        t!(chain.write(&rows));
        t!(chain.finish());
        drop(chain);
        std::rc::Rc::try_unwrap(data).map(|c| c.into_inner()).unwrap_or_else(|rc| rc.borrow().clone())
    };

    let mut dict = trailer;
    dict.insert("Type", Primitive::name("XRef"));
    dict.insert("W", Primitive::Array(w.into_iter().map(Primitive::Integer).collect()));
    dict.insert("Index", Primitive::Array(index.into_iter().map(Primitive::Integer).collect()));
    dict.insert("Filter", Primitive::name("FlateDecode"));
    let mut parms = Dictionary::new();
    parms.insert("Predictor", Primitive::Integer(12));
    parms.insert("Columns", Primitive::Integer(row_len));
    dict.insert("DecodeParms", Primitive::Dictionary(parms));
    dict.insert("Length", Primitive::Integer(payload.len() as i64));

    let mut body = Vec::new();
    dict.serialize(&mut body)?;
    body.extend_from_slice(b"\nstream\n");
    body.extend_from_slice(&payload);
    body.extend_from_slice(b"\nendstream");
    write_wrapped_object(out, xref_id, &body)?;
    Ok(())
}

//////////////////////////
// Enqueueing / renumbering

pub(crate) struct Prepared {
    /// New ids in first-encounter (depth-first) order.
    pub order: Vec<ObjNr>,
    pub values: HashMap<ObjNr, Primitive>,
    pub old_of: HashMap<ObjNr, PlainRef>,
    pub renumber: HashMap<PlainRef, ObjNr>,
    /// Cleaned trailer; references still carry old ids.
    pub trailer: Dictionary,
    /// New ids of page content streams, for normalization.
    pub content_streams: HashSet<ObjNr>,
    /// New ids of page objects, in page order.
    pub pages: Vec<ObjNr>,
    pub catalog: Option<ObjNr>,
    /// member (new id) -> container (new id)
    pub objstm_of: HashMap<ObjNr, ObjNr>,
    pub containers: Vec<(ObjNr, Vec<ObjNr>)>,
    /// stream (new id) -> indirect length object (new id), QDF mode
    pub length_ids: HashMap<ObjNr, ObjNr>,
    /// objects that must not be encrypted (plaintext metadata)
    pub skip_encryption: HashSet<ObjNr>,
    next: ObjNr,
}

impl Prepared {
    pub fn next_id(&mut self) -> ObjNr {
        let id = self.next;
        self.next += 1;
        id
    }

    pub(crate) fn build<B: Backend>(file: &File<B>, options: &WriteOptions) -> Result<Prepared> {
        let mut trailer = file.trailer();
        // Keys the writer regenerates. Removing /Encrypt here also keeps
        // the old encryption dictionary out of the traversal.
        for key in ["ID", "Encrypt", "Prev", "Index", "W", "Length", "Filter", "DecodeParms", "Type", "XRefStm"] {
            trailer.remove(key);
        }

        let catalog_old = trailer.get("Root").and_then(|p| p.as_reference().ok());
        let page_refs = file.page_refs().unwrap_or_default();

        // Old ids of page content streams.
        let mut content_old: HashSet<PlainRef> = HashSet::new();
        for &page in &page_refs {
            if let Ok(Primitive::Dictionary(dict)) = file.resolve_ref(page) {
                match dict.get("Contents") {
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
        }

        let metadata_old = catalog_old
            .and_then(|r| file.resolve_ref(r).ok())
            .and_then(|c| c.as_dictionary().ok().and_then(|d| d.get("Metadata").cloned()))
            .and_then(|p| p.as_reference().ok());
        let keep_metadata_plain = file.decoder().map_or(false, |d| !d.encrypt_metadata)
            || options.encrypt.as_ref().map_or(false, |p| !p.encrypt_metadata);

        let mut prepared = Prepared {
            order: Vec::new(),
            values: HashMap::new(),
            old_of: HashMap::new(),
            renumber: HashMap::new(),
            trailer: trailer.clone(),
            content_streams: HashSet::new(),
            pages: Vec::new(),
            catalog: None,
            objstm_of: HashMap::new(),
            containers: Vec::new(),
            length_ids: HashMap::new(),
            skip_encryption: HashSet::new(),
            next: 1,
        };

        // Depth-first traversal from the trailer, assigning new numbers
        // in first-encounter order. Scalars stay inline; references get
        // enqueued unless they resolve to null.
        let mut stack: Vec<PlainRef> = Vec::new();
        let mut push_children = |value: &Primitive, stack: &mut Vec<PlainRef>| {
            let mut children = Vec::new();
            collect_refs(value, &mut children);
            for r in children.into_iter().rev() {
                stack.push(r);
            }
        };

        for (_, v) in trailer.iter() {
            push_children(v, &mut stack);
        }

        while let Some(old) = stack.pop() {
            if prepared.renumber.contains_key(&old) {
                continue;
            }
            let value = t!(file.resolve_ref(old));
            match value {
                Primitive::Null => continue,
                Primitive::Reserved => err!(PdfError::ReservedObject { obj_nr: old.id }),
                _ => {}
            }
            let value = t!(transform_for_write(file, value, catalog_old == Some(old)));

            let new_id = prepared.next_id();
            prepared.renumber.insert(old, new_id);
            prepared.order.push(new_id);
            prepared.old_of.insert(new_id, old);
            if options.qdf_mode {
                if let Primitive::Stream(_) = value {
                    let lid = prepared.next_id();
                    prepared.length_ids.insert(new_id, lid);
                }
            }
            if catalog_old == Some(old) {
                prepared.catalog = Some(new_id);
            }
            if content_old.contains(&old) {
                prepared.content_streams.insert(new_id);
            }
            if keep_metadata_plain && metadata_old == Some(old) {
                prepared.skip_encryption.insert(new_id);
            }
            push_children(&value, &mut stack);
            prepared.values.insert(new_id, value);
        }

        for r in &page_refs {
            if let Some(&new_id) = prepared.renumber.get(r) {
                prepared.pages.push(new_id);
            }
        }

        t!(prepared.assign_object_streams(file, options));
        Ok(prepared)
    }

    /// Decide which objects go into which object stream.
    fn assign_object_streams<B: Backend>(&mut self, file: &File<B>, options: &WriteOptions) -> Result<()> {
        let encrypting = options.encrypt.is_some() || options.preserve_encryption;
        let eligible = |p: &Prepared, new_id: ObjNr| -> bool {
            let value = match p.values.get(&new_id) {
                Some(v) => v,
                None => return false,
            };
            if matches!(value, Primitive::Stream(_)) {
                return false;
            }
            if p.old_of.get(&new_id).map_or(false, |old| old.gen != 0) {
                return false;
            }
            if is_signature_dict(value) {
                return false;
            }
            if Some(new_id) == p.catalog && (encrypting || options.linearize) {
                return false;
            }
            if options.linearize && p.pages.contains(&new_id) {
                return false;
            }
            true
        };

        match options.object_stream_mode {
            ObjectStreamMode::Disable => {}
            ObjectStreamMode::Preserve => {
                // group by the container the object came from
                let xref = file.xref();
                let mut groups: HashMap<ObjNr, Vec<ObjNr>> = HashMap::new();
                let mut group_order: Vec<ObjNr> = Vec::new();
                for &new_id in &self.order {
                    if !eligible(self, new_id) {
                        continue;
                    }
                    let old = match self.old_of.get(&new_id) {
                        Some(old) => *old,
                        None => continue,
                    };
                    if let Ok(XRef::Stream { stream_id, .. }) = xref.get(old.id) {
                        if !groups.contains_key(&stream_id) {
                            group_order.push(stream_id);
                        }
                        groups.entry(stream_id).or_default().push(new_id);
                    }
                }
                drop(xref);
                for old_container in group_order {
                    let members = groups.remove(&old_container).unwrap_or_default();
                    self.add_container(members);
                }
            }
            ObjectStreamMode::Generate => {
                let members: Vec<ObjNr> =
                    self.order.clone().into_iter().filter(|&id| eligible(self, id)).collect();
                if members.is_empty() {
                    return Ok(());
                }
                let n_streams = (members.len() + MAX_OBJSTM_MEMBERS - 1) / MAX_OBJSTM_MEMBERS;
                let n_per = (members.len() + n_streams - 1) / n_streams;
                for chunk in members.chunks(n_per) {
                    self.add_container(chunk.to_vec());
                }
            }
        }
        Ok(())
    }

    fn add_container(&mut self, members: Vec<ObjNr>) {
        if members.is_empty() {
            return;
        }
        let container_id = self.next_id();
        for &m in &members {
            self.objstm_of.insert(m, container_id);
        }
        self.containers.push((container_id, members));
    }
}

/// References nested anywhere in a value, in traversal order.
fn collect_refs(value: &Primitive, out: &mut Vec<PlainRef>) {
    match value {
        Primitive::Reference(r) => out.push(*r),
        Primitive::Array(arr) => {
            for v in arr {
                collect_refs(v, out);
            }
        }
        Primitive::Dictionary(dict) => {
            for (_, v) in dict {
                collect_refs(v, out);
            }
        }
        Primitive::Stream(s) => {
            for (_, v) in &s.info {
                collect_refs(v, out);
            }
        }
        _ => {}
    }
}

/// Precondition rewriting: stream /Length, /Filter and /DecodeParms
/// become direct, as do the catalog's /Extensions; those keys must never
/// drift out of sync as separate objects.
fn transform_for_write<B: Backend>(file: &File<B>, value: Primitive, is_catalog: bool) -> Result<Primitive> {
    Ok(match value {
        Primitive::Stream(mut stream) => {
            for key in ["Length", "Filter", "DecodeParms"] {
                if let Some(p) = stream.info.get(key) {
                    if let Primitive::Reference(_) = p {
                        let direct = t!(file.storage().resolve_deref(p.clone()));
                        stream.info.insert(key, direct);
                    }
                }
            }
            Primitive::Stream(stream)
        }
        Primitive::Dictionary(mut dict) if is_catalog => {
            if let Some(p) = dict.get("Extensions") {
                let mut ext = t!(t!(file.storage().resolve_deref(p.clone())).into_dictionary(file.storage()));
                if let Some(adbe) = ext.get("ADBE") {
                    let direct = t!(file.storage().resolve_deref(adbe.clone()));
                    ext.insert("ADBE", direct);
                }
                dict.insert("Extensions", Primitive::Dictionary(ext));
            }
            Primitive::Dictionary(dict)
        }
        v => v,
    })
}

fn is_signature_dict(value: &Primitive) -> bool {
    match value {
        Primitive::Dictionary(dict) => {
            dict.get("Type").and_then(|p| p.as_name().ok()) == Some("Sig")
                && dict.contains_key("ByteRange")
                && dict.contains_key("Contents")
        }
        _ => false,
    }
}

//////////////////////////
// Value serialization

pub(crate) struct SerCtx<'a> {
    pub renumber: &'a HashMap<PlainRef, ObjNr>,
    pub encoder: Option<&'a Encoder>,
    /// The top-level object being written; keys strings to it.
    pub current: PlainRef,
    pub encrypt_strings: bool,
    pub qdf: bool,
}

impl<'a> SerCtx<'a> {
    fn plain(renumber: &'a HashMap<PlainRef, ObjNr>, qdf: bool) -> SerCtx<'a> {
        SerCtx { renumber, encoder: None, current: PlainRef { id: 0, gen: 0 }, encrypt_strings: false, qdf }
    }
}

pub(crate) fn write_value(out: &mut Vec<u8>, p: &Primitive, ctx: &SerCtx, depth: usize) -> Result<()> {
    match p {
        Primitive::Reference(r) => match ctx.renumber.get(r) {
            Some(new_id) => out.extend_from_slice(format!("{} 0 R", new_id).as_bytes()),
            // a reference to nothing is a reference to null
            None => out.extend_from_slice(b"null"),
        },
        Primitive::String(s) => {
            if ctx.encrypt_strings {
                let enc = try_opt!(ctx.encoder);
                let cipher = t!(enc.encrypt_string(ctx.current, s.as_bytes().to_vec()));
                t!(PdfString::new(cipher).serialize(out));
            } else {
                t!(s.serialize(out));
            }
        }
        Primitive::Array(arr) => {
            out.push(b'[');
            out.push(b' ');
            for v in arr {
                t!(write_value(out, v, ctx, depth + 1));
                out.push(b' ');
            }
            out.push(b']');
        }
        Primitive::Dictionary(dict) => {
            if ctx.qdf {
                out.extend_from_slice(b"<<\n");
                for (k, v) in dict {
                    out.extend_from_slice(&vec![b' '; 2 * (depth + 1)]);
                    t!(k.serialize(out));
                    out.push(b' ');
                    t!(write_value(out, v, ctx, depth + 1));
                    out.push(b'\n');
                }
                out.extend_from_slice(&vec![b' '; 2 * depth]);
                out.extend_from_slice(b">>");
            } else {
                out.extend_from_slice(b"<< ");
                for (k, v) in dict {
                    t!(k.serialize(out));
                    out.push(b' ');
                    t!(write_value(out, v, ctx, depth + 1));
                    out.push(b' ');
                }
                out.extend_from_slice(b">>");
            }
        }
        Primitive::Stream(_) => bail!("nested stream"),
        Primitive::Reserved => err!(PdfError::ReservedObject { obj_nr: ctx.current.id }),
        p => t!(p.serialize(out)),
    }
    Ok(())
}

fn rewrite_dict_refs(dict: Dictionary, ctx: &SerCtx) -> Result<Dictionary> {
    let mut out = Dictionary::new();
    for (k, v) in dict {
        out.insert(k, rewrite_refs(v, ctx)?);
    }
    Ok(out)
}

fn rewrite_refs(value: Primitive, ctx: &SerCtx) -> Result<Primitive> {
    Ok(match value {
        Primitive::Reference(r) => match ctx.renumber.get(&r) {
            Some(&new_id) => Primitive::Reference(PlainRef { id: new_id, gen: 0 }),
            None => Primitive::Null,
        },
        Primitive::Array(arr) => {
            Primitive::Array(arr.into_iter().map(|v| rewrite_refs(v, ctx)).collect::<Result<_>>()?)
        }
        Primitive::Dictionary(dict) => Primitive::Dictionary(rewrite_dict_refs(dict, ctx)?),
        v => v,
    })
}

//////////////////////////
// Content normalization

/// Re-tokenize a content stream: operands separated by spaces, a line
/// break after each operator, inline-image data copied untouched.
pub fn normalize_content(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut lexer = Lexer::new(data);
    loop {
        let token = match lexer.next() {
            Ok(t) => t,
            Err(PdfError::EOF) => break,
            Err(e) => return Err(e),
        };
        if token.equals(b"(") {
            let (string, consumed) = t!(scan_literal_string(lexer.get_remaining_slice()));
            lexer.offset_pos(consumed);
            t!(PdfString::new(string).serialize(&mut out));
            out.push(b' ');
        } else if token.equals(b"<") {
            let (string, consumed) = t!(crate::parser::scan_hex_string(lexer.get_remaining_slice()));
            lexer.offset_pos(consumed);
            t!(PdfString::new(string).serialize(&mut out));
            out.push(b' ');
        } else if token.equals(b"BI") {
            // inline image: copy through to EI without touching the bytes
            out.extend_from_slice(b"BI");
            let start = lexer.get_pos();
            match lexer.seek_substr(b"EI") {
                Some(span) => {
                    out.extend_from_slice(span.as_slice());
                    out.extend_from_slice(b"EI\n");
                }
                None => {
                    lexer.set_pos(start);
                    out.extend_from_slice(lexer.get_remaining_slice());
                    break;
                }
            }
        } else if is_operator(&token) {
            out.extend_from_slice(token.as_slice());
            out.push(b'\n');
        } else {
            out.extend_from_slice(token.as_slice());
            out.push(b' ');
        }
    }
    // drop a trailing separator for byte-stable output
    while out.last() == Some(&b' ') || out.last() == Some(&b'\n') {
        out.pop();
    }
    out.push(b'\n');
    Ok(out)
}

fn is_operator(token: &crate::parser::Substr) -> bool {
    if token.is_integer() || token.is_real_number() {
        return false;
    }
    !matches!(
        token.as_slice(),
        b"<<" | b">>" | b"[" | b"]" | b"<" | b"(" | b"true" | b"false" | b"null"
    ) && !token.starts_with(b"/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_bytes() {
        let mut out = Vec::new();
        write_header(&mut out, (1, 7)).unwrap();
        assert!(out.starts_with(b"%PDF-1.7\n%"));
        assert_eq!(&out[10..14], &[0xbf, 0xf7, 0xa2, 0xfe]);
    }

    #[test]
    fn normalize_simple_content() {
        let content = b"q  1 0 0 1 10   20 cm\n(hi) Tj Q";
        let out = normalize_content(content).unwrap();
        assert_eq!(out, b"q\n1 0 0 1 10 20 cm\n(hi) Tj\nQ\n");
    }

    #[test]
    fn signature_dicts_detected() {
        let mut dict = Dictionary::new();
        dict.insert("Type", Primitive::name("Sig"));
        dict.insert("ByteRange", Primitive::Array(vec![]));
        dict.insert("Contents", Primitive::String(PdfString::new(*b"x")));
        assert!(is_signature_dict(&Primitive::Dictionary(dict)));
    }
}
