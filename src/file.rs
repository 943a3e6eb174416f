//! The document: backend + xref + object cache. Objects live in the
//! cache keyed by `(id, gen)`; everything else holds `PlainRef` handles
//! and dereferences through here, so replacing an entry is observed by
//! every holder of a handle and cyclic graphs tear down trivially.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::rc::Rc;

use crate::backend::Backend;
use crate::crypt::{CryptDict, Decoder};
use crate::enc;
use crate::error::*;
use crate::object::{ObjNr, PlainRef, Resolve};
use crate::object_stream::ObjectStream;
use crate::parser::{
    parse_indirect_object, parse_with_lexer, read_xref_and_trailer_at, Lexer, ObjSpan, ParseFlags,
    StringDecrypter,
};
use crate::primitive::{Dictionary, PdfStream, Primitive, StreamData};
use crate::repair::{reconstruct_xref, MAX_RECOVERY_WARNINGS};
use crate::xref::{XRef, XRefTable};

/// Warnings accumulated on a document escalate to a hard failure past
/// this count.
pub const MAX_WARNINGS: usize = MAX_RECOVERY_WARNINGS;

pub struct Storage<B: Backend> {
    backend: Option<B>,
    /// Position of the `%PDF-` header; all xref offsets are relative to it.
    start_offset: usize,
    refs: RefCell<XRefTable>,
    cache: RefCell<HashMap<PlainRef, Primitive>>,
    /// Cycle guard: ids currently being resolved.
    resolving: RefCell<HashSet<PlainRef>>,
    /// Object streams already expanded into the cache.
    resolved_streams: RefCell<HashSet<ObjNr>>,
    spans: RefCell<HashMap<ObjNr, ObjSpan>>,
    trailer: RefCell<Dictionary>,
    pub(crate) decoder: Option<Decoder>,
    warnings: RefCell<Vec<PdfError>>,
    suppress_warning_log: Cell<bool>,
    attempt_recovery: Cell<bool>,
    reconstructed: Cell<bool>,
    /// Monotonic id allocation; never reuses.
    next_id: Cell<ObjNr>,
    /// Re-entrant parse guard for the public parse API.
    parsing: Cell<bool>,
    version: (u8, u8),
}

/// Removes the id from the resolving set on every exit path.
struct ResolvingGuard<'a> {
    set: &'a RefCell<HashSet<PlainRef>>,
    id: PlainRef,
}

impl<'a> ResolvingGuard<'a> {
    fn acquire(set: &'a RefCell<HashSet<PlainRef>>, id: PlainRef) -> Option<ResolvingGuard<'a>> {
        if set.borrow_mut().insert(id) {
            Some(ResolvingGuard { set, id })
        } else {
            None
        }
    }
}

impl Drop for ResolvingGuard<'_> {
    fn drop(&mut self) {
        self.set.borrow_mut().remove(&self.id);
    }
}

impl<B: Backend> Storage<B> {
    fn empty() -> Storage<B> {
        Storage {
            backend: None,
            start_offset: 0,
            refs: RefCell::new(XRefTable::new(0, ObjNr::MAX)),
            cache: RefCell::new(HashMap::new()),
            resolving: RefCell::new(HashSet::new()),
            resolved_streams: RefCell::new(HashSet::new()),
            spans: RefCell::new(HashMap::new()),
            trailer: RefCell::new(Dictionary::new()),
            decoder: None,
            warnings: RefCell::new(Vec::new()),
            suppress_warning_log: Cell::new(false),
            attempt_recovery: Cell::new(true),
            reconstructed: Cell::new(false),
            next_id: Cell::new(1),
            parsing: Cell::new(false),
            version: (1, 3),
        }
    }

    fn backend(&self) -> Result<&B> {
        self.backend
            .as_ref()
            .ok_or_else(|| PdfError::logic("operation on a document whose input was closed"))
    }

    pub fn push_warning(&self, e: PdfError) -> Result<()> {
        if !self.suppress_warning_log.get() {
            warn!("{}", e);
        }
        let mut warnings = self.warnings.borrow_mut();
        warnings.push(e);
        if warnings.len() > MAX_WARNINGS {
            return Err(PdfError::TooManyErrors);
        }
        Ok(())
    }

    /// Read the whole xref chain starting at `startxref`, triggering
    /// reconstruction when it cannot be followed.
    fn load_xref(&mut self) -> Result<()> {
        let result = self.read_xref_chain();
        match result {
            Ok(()) => Ok(()),
            Err(e) if self.attempt_recovery.get() && e.is_recoverable() => {
                self.push_warning(PdfError::damaged("xref", 0, format!("{}; attempting reconstruction", e)))?;
                self.reconstruct()
            }
            Err(e) => Err(e),
        }
    }

    fn reconstruct(&self) -> Result<()> {
        if self.reconstructed.get() {
            // one attempt only
            err!(PdfError::damaged("xref", 0, "reconstruction failed twice"));
        }
        self.reconstructed.set(true);
        let backend = self.backend()?;
        let buf = backend.read(self.start_offset..)?;
        let mut refs = self.refs.borrow_mut();
        let rec = reconstruct_xref(buf, &mut refs)?;
        drop(refs);
        for w in rec.warnings {
            self.push_warning(w)?;
        }
        *self.trailer.borrow_mut() = rec.trailer;
        // scanning may have found objects the cache resolved to null
        self.cache.borrow_mut().retain(|_, v| !v.is_null());
        let next = (self.refs.borrow().len() as ObjNr).max(self.next_id.get()).max(1);
        self.next_id.set(next);
        Ok(())
    }

    fn read_xref_chain(&mut self) -> Result<()> {
        let backend = self.backend()?;
        let buf = backend.read(self.start_offset..)?;
        let mut next = Some(t!(backend.locate_xref_offset()));
        let mut seen: Vec<usize> = Vec::new();
        let mut newest_trailer: Option<Dictionary> = None;

        while let Some(offset) = next {
            if seen.contains(&offset) {
                err!(PdfError::damaged("xref", offset, "loop in xref chain"));
            }
            seen.push(offset);
            if offset >= buf.len() {
                err!(PdfError::damaged("xref", offset, "xref offset outside file"));
            }

            let mut lexer = Lexer::with_offset(&buf[offset..], offset);
            let (sections, trailer) = t!(read_xref_and_trailer_at(&mut lexer, buf));

            // Hybrid files: the /XRefStm entries take precedence over the
            // classical section they accompany.
            if let Some(stm_offset) = trailer.get("XRefStm").and_then(|p| p.as_usize().ok()) {
                if stm_offset < buf.len() {
                    let mut lexer = Lexer::with_offset(&buf[stm_offset..], stm_offset);
                    match crate::parser::parse_xref_stream_and_trailer(&mut lexer, buf) {
                        Ok((stm_sections, _)) => {
                            let mut refs = self.refs.borrow_mut();
                            for section in stm_sections {
                                refs.add_entries_from(section);
                            }
                        }
                        Err(e) => self.push_warning(e)?,
                    }
                }
            }

            {
                let mut refs = self.refs.borrow_mut();
                for section in sections {
                    refs.add_entries_from(section);
                }
            }

            next = trailer.get("Prev").and_then(|p| p.as_usize().ok());
            if newest_trailer.is_none() {
                newest_trailer = Some(trailer);
            }
        }

        let trailer = newest_trailer.ok_or(PdfError::EOF)?;
        if trailer.get("Root").is_none() {
            err!(PdfError::MissingEntry { typ: "Trailer", field: "Root".into() });
        }
        let size = trailer.get("Size").and_then(|p| p.as_usize().ok()).unwrap_or(0);
        *self.trailer.borrow_mut() = trailer;
        let next = (size as ObjNr).max(self.refs.borrow().len() as ObjNr).max(1);
        self.next_id.set(next);
        Ok(())
    }

    fn decrypter(&self) -> Option<&dyn StringDecrypter> {
        self.decoder.as_ref().map(|d| d as &dyn StringDecrypter)
    }

    /// Resolution per the cache algorithm: cycle guard, xref lookup,
    /// parse, install. Failures downgrade to warnings plus null when
    /// recovery is on.
    fn resolve_uncached(&self, r: PlainRef) -> Result<Primitive> {
        let guard = match ResolvingGuard::acquire(&self.resolving, r) {
            Some(g) => g,
            None => {
                self.push_warning(PdfError::ReferenceCycle { obj_nr: r.id })?;
                return Ok(Primitive::Null);
            }
        };

        let entry = self.refs.borrow().get(r.id).unwrap_or(XRef::Invalid);
        let value = match entry {
            XRef::Free { .. } | XRef::Invalid => Primitive::Null,
            XRef::Raw { pos, gen } => {
                if gen != r.gen {
                    // an old generation is as absent as a free slot
                    Primitive::Null
                } else {
                    let backend = self.backend()?;
                    let file_pos = self.start_offset + pos;
                    let buf = t!(backend.read(self.start_offset..));
                    if pos >= buf.len() {
                        err!(PdfError::damaged(format!("object {}", r), file_pos, "offset outside file"));
                    }
                    let mut lexer = Lexer::with_offset(&buf[pos..], pos);
                    let (parsed_id, value, span) = t!(parse_indirect_object(&mut lexer, self, self.decrypter()));
                    if parsed_id != r {
                        err!(PdfError::damaged(
                            format!("object {}", r),
                            file_pos,
                            format!("found {} where {} was expected", parsed_id, r),
                        ));
                    }
                    self.spans.borrow_mut().insert(r.id, span);
                    value
                }
            }
            XRef::Stream { stream_id, index } => {
                t!(self.load_object_stream(stream_id));
                drop(guard);
                let cached = self.cache.borrow().get(&r).cloned();
                return match cached {
                    Some(Primitive::Unresolved) | None => {
                        self.push_warning(PdfError::damaged(
                            format!("object {}", r),
                            0,
                            format!("not found in object stream {} at index {}", stream_id, index),
                        ))?;
                        self.cache.borrow_mut().insert(r, Primitive::Null);
                        Ok(Primitive::Null)
                    }
                    Some(v) => Ok(v),
                };
            }
        };
        drop(guard);
        self.cache.borrow_mut().insert(r, value.clone());
        Ok(value)
    }

    /// Expand an object stream into the cache. Memoized; objects whose
    /// xref entry was superseded are parsed and discarded.
    fn load_object_stream(&self, stream_id: ObjNr) -> Result<()> {
        if self.resolved_streams.borrow().contains(&stream_id) {
            return Ok(());
        }
        let container = PlainRef { id: stream_id, gen: 0 };
        let stream = match t!(self.resolve(container)) {
            Primitive::Stream(s) => s,
            p => err!(PdfError::UnexpectedPrimitive { expected: "Stream", found: p.get_debug_name() }),
        };
        let decoded = t!(self.decoded_stream_data(&stream, container));
        let max_id = self.refs.borrow().max_id();
        let objstm = t!(ObjectStream::parse(stream_id, &stream.info, decoded, max_id));

        let mut parsed = Vec::with_capacity(objstm.len());
        for (index, id) in objstm.ids() {
            match objstm.parse_object(index, &crate::object::NoResolve) {
                Ok(v) => parsed.push((index, id, v)),
                Err(e) => self.push_warning(e)?,
            }
        }

        {
            let refs = self.refs.borrow();
            let mut cache = self.cache.borrow_mut();
            for (index, id, value) in parsed {
                // Install only what the current xref still attributes to
                // this stream; superseded entries were parsed for nothing,
                // which is what the format asks for.
                match refs.get(id) {
                    Ok(XRef::Stream { stream_id: s, index: i }) if s == stream_id && i == index => {
                        cache.entry(PlainRef { id, gen: 0 }).or_insert(value);
                    }
                    _ => {}
                }
            }
        }
        self.resolved_streams.borrow_mut().insert(stream_id);
        Ok(())
    }

    /// Raw (still filtered) payload bytes of a stream, decrypted.
    pub fn raw_stream_data(&self, stream: &PdfStream, id: PlainRef) -> Result<Vec<u8>> {
        match stream.data {
            StreamData::InFile(ref range) => {
                let backend = self.backend()?;
                let data = t!(backend.read(range.clone())).to_vec();
                match self.decoder {
                    Some(ref decoder) => decoder.decrypt_stream_data(id, data),
                    None => Ok(data),
                }
            }
            StreamData::InMemory(ref data) => Ok(data.as_ref().clone()),
            StreamData::Provided(ref p) => p.provide(),
        }
    }

    /// Fully decoded payload (generalized filters applied).
    pub fn decoded_stream_data(&self, stream: &PdfStream, id: PlainRef) -> Result<Vec<u8>> {
        let mut data = t!(self.raw_stream_data(stream, id));
        for filter in t!(enc::filters_of(&stream.info, self)) {
            if !filter.is_generalized() {
                bail!("cannot decode {} data", filter.pdf_name());
            }
            data = match enc::decode(&data, &filter) {
                Ok(data) => data,
                Err(e) => {
                    crate::error::dump_data(&data);
                    return Err(e);
                }
            };
        }
        Ok(data)
    }
}

impl<B: Backend> Resolve for Storage<B> {
    fn resolve(&self, r: PlainRef) -> Result<Primitive> {
        if r.id == 0 {
            return Ok(Primitive::Null);
        }
        if let Some(p) = self.cache.borrow().get(&r) {
            match p {
                Primitive::Unresolved => {}
                p => return Ok(p.clone()),
            }
        }
        match self.resolve_uncached(r) {
            Ok(v) => Ok(v),
            Err(e) if self.attempt_recovery.get() && e.is_recoverable() => {
                self.push_warning(e)?;
                if !self.reconstructed.get() && self.backend.is_some() {
                    // the declared structure lied; rebuild it and retry once
                    self.reconstruct()?;
                    if let Ok(v) = self.resolve_uncached(r) {
                        return Ok(v);
                    }
                }
                self.cache.borrow_mut().insert(r, Primitive::Null);
                Ok(Primitive::Null)
            }
            Err(e) => Err(e),
        }
    }
}

/// A loaded document.
pub struct File<B: Backend> {
    storage: Storage<B>,
}

impl File<Vec<u8>> {
    /// An empty document: no pages, a minimal catalog.
    pub fn new() -> File<Vec<u8>> {
        let mut file = File { storage: Storage::empty() };
        let mut catalog = Dictionary::new();
        catalog.insert("Type", Primitive::name("Catalog"));
        let root = file.make_indirect(Primitive::Dictionary(catalog));
        let mut trailer = Dictionary::new();
        trailer.insert("Root", Primitive::Reference(root));
        *file.storage.trailer.borrow_mut() = trailer;
        file
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_data(t!(fs::read(path)))
    }
    pub fn open_password(path: impl AsRef<Path>, password: &[u8]) -> Result<Self> {
        Self::from_data_password(t!(fs::read(path)), password)
    }
}

impl Default for File<Vec<u8>> {
    fn default() -> Self {
        File::new()
    }
}

impl<B: Backend> File<B> {
    pub fn from_data(backend: B) -> Result<Self> {
        Self::from_data_password(backend, b"")
    }

    pub fn from_data_password(backend: B, password: &[u8]) -> Result<Self> {
        Self::load(backend, password, None)
    }

    /// Hex-key mode: bypass password derivation, use `key` directly.
    pub fn from_data_with_key(backend: B, key: &[u8]) -> Result<Self> {
        Self::load(backend, b"", Some(key))
    }

    fn load(backend: B, password: &[u8], raw_key: Option<&[u8]>) -> Result<Self> {
        let start_offset = t!(backend.locate_start_offset());
        let version = parse_header_version(t!(backend.read(start_offset..(start_offset + 16).min(backend.len()))));
        let max_id = backend.max_id();

        let mut storage = Storage::empty();
        storage.start_offset = start_offset;
        storage.version = version;
        storage.backend = Some(backend);
        *storage.refs.borrow_mut() = XRefTable::new(0, max_id);
        t!(storage.load_xref());

        // Encryption setup needs the trailer; string decryption needs the
        // decoder. The /Encrypt dictionary itself is parsed before the
        // decoder exists, which is fine since its own strings are exempt.
        let (encrypt_ref, crypt_dict) = {
            let trailer = storage.trailer.borrow();
            match trailer.get("Encrypt") {
                Some(p) => {
                    let encrypt_ref = p.as_reference().ok();
                    let dict = t!(t!(storage.resolve_deref(p.clone())).into_dictionary(&storage));
                    (encrypt_ref, Some(dict))
                }
                None => (None, None),
            }
        };
        if let Some(dict) = crypt_dict {
            let id0 = {
                let trailer = storage.trailer.borrow();
                match trailer.get("ID") {
                    Some(Primitive::Array(ids)) => match ids.first() {
                        Some(Primitive::String(s)) => s.as_bytes().to_vec(),
                        _ => Vec::new(),
                    },
                    _ => Vec::new(),
                }
            };
            let crypt_dict = t!(CryptDict::from_dict(&dict, &storage));
            let mut decoder = match raw_key {
                Some(key) => t!(Decoder::from_raw_key(&crypt_dict, key)),
                None => t!(Decoder::from_password(&crypt_dict, &id0, password)),
            };
            decoder.encrypt_ref = encrypt_ref;
            // the metadata stream stays plaintext if the dictionary says so
            if !crypt_dict.encrypt_metadata {
                let root_ref = storage.trailer.borrow().get("Root").and_then(|p| p.as_reference().ok());
                if let Some(root_ref) = root_ref {
                    storage.decoder = Some(decoder);
                    let catalog = t!(t!(storage.resolve(root_ref)).into_dictionary(&storage));
                    let metadata_ref = catalog.get("Metadata").and_then(|p| p.as_reference().ok());
                    let decoder = storage.decoder.as_mut().expect("just set");
                    decoder.metadata_ref = metadata_ref;
                    // strings of the catalog were parsed with decryption
                    // already; drop it from the cache so nothing stale stays
                    storage.cache.borrow_mut().remove(&root_ref);
                    return Self::finish_load(File { storage });
                }
            }
            storage.decoder = Some(decoder);
        } else if raw_key.is_some() || !password.is_empty() {
            storage.push_warning(PdfError::NotEncrypted)?;
        }

        Self::finish_load(File { storage })
    }

    /// A reconstructed table that cannot reach a single page was not
    /// worth reconstructing.
    fn finish_load(file: File<B>) -> Result<File<B>> {
        if file.storage.reconstructed.get() {
            let pages = file.page_refs().unwrap_or_default();
            if pages.is_empty() {
                err!(PdfError::damaged("recovery", 0, "unable to find any pages while recovering damaged file"));
            }
        }
        Ok(file)
    }

    pub fn is_encrypted(&self) -> bool {
        self.storage.decoder.is_some()
    }
    pub fn decoder(&self) -> Option<&Decoder> {
        self.storage.decoder.as_ref()
    }

    /// `%PDF-x.y`, possibly overridden by the catalog's /Version.
    pub fn version(&self) -> (u8, u8) {
        let header = self.storage.version;
        let catalog_version = self
            .catalog()
            .ok()
            .and_then(|c| c.get("Version").map(|p| p.clone()))
            .and_then(|p| p.as_name().ok().and_then(parse_version_name));
        match catalog_version {
            Some(v) if v > header => v,
            _ => header,
        }
    }

    pub fn trailer(&self) -> Dictionary {
        self.storage.trailer.borrow().clone()
    }
    pub fn trailer_mut(&mut self) -> std::cell::RefMut<Dictionary> {
        self.storage.trailer.borrow_mut()
    }
    pub fn catalog(&self) -> Result<Dictionary> {
        let root = try_opt!(self.storage.trailer.borrow().get("Root").cloned());
        t!(self.storage.resolve_deref(root)).into_dictionary(&self.storage)
    }

    //////////////////
    // Warnings

    pub fn warnings(&self) -> std::cell::Ref<Vec<PdfError>> {
        self.storage.warnings.borrow()
    }
    pub fn any_warnings(&self) -> bool {
        !self.storage.warnings.borrow().is_empty()
    }
    pub fn take_warnings(&mut self) -> Vec<PdfError> {
        std::mem::take(&mut *self.storage.warnings.borrow_mut())
    }
    /// Queue warnings without echoing them to the log sink.
    pub fn suppress_warning_log(&mut self, suppress: bool) {
        self.storage.suppress_warning_log.set(suppress);
    }
    pub fn set_attempt_recovery(&mut self, attempt: bool) {
        self.storage.attempt_recovery.set(attempt);
    }

    /// Close the input early. Afterwards only the warning accessors work;
    /// anything touching the backend fails with a logic error.
    pub fn close_input(&mut self) {
        self.storage.backend = None;
    }

    //////////////////
    // Cache operations

    pub fn resolve_ref(&self, r: PlainRef) -> Result<Primitive> {
        self.storage.resolve(r)
    }

    /// Allocate the next free id (monotonic, never reused) and install `v`.
    pub fn make_indirect(&mut self, v: Primitive) -> PlainRef {
        let id = self.storage.next_id.get();
        self.storage.next_id.set(id + 1);
        let r = PlainRef { id, gen: 0 };
        self.storage.cache.borrow_mut().insert(r, v);
        r
    }

    /// Forward reference: allocate an id now, fill it later. Writing
    /// while it is unfilled is an error.
    pub fn reserve(&mut self) -> PlainRef {
        self.make_indirect(Primitive::Reserved)
    }

    /// Install a new value for an existing entry; every handle holder
    /// observes the change.
    pub fn replace(&mut self, r: PlainRef, v: Primitive) -> Result<()> {
        if r.id == 0 {
            err!(PdfError::logic("cannot replace the direct object"));
        }
        self.storage.cache.borrow_mut().insert(r, v);
        Ok(())
    }

    /// Exchange two entries, used by incremental-update workflows.
    pub fn swap(&mut self, a: PlainRef, b: PlainRef) -> Result<()> {
        let va = t!(self.storage.resolve(a));
        let vb = t!(self.storage.resolve(b));
        let mut cache = self.storage.cache.borrow_mut();
        cache.insert(a, vb);
        cache.insert(b, va);
        Ok(())
    }

    /// Convert to null and disconnect from the document.
    pub fn erase(&mut self, r: PlainRef) -> Result<()> {
        self.replace(r, Primitive::Null)
    }

    /// Parse a standalone object in the context of this document. The
    /// guard makes re-entry (through a resolve cycle back into this
    /// function) an API error rather than unbounded recursion.
    pub fn parse_object(&self, data: &[u8]) -> Result<Primitive> {
        if self.storage.parsing.replace(true) {
            err!(PdfError::logic("re-entrant parse"));
        }
        let result = parse_with_lexer(&mut Lexer::new(data), &self.storage, ParseFlags::ANY);
        self.storage.parsing.set(false);
        result
    }

    /// Force resolution of every xref entry, then replace references to
    /// absent objects with null, per the treatment of non-existent
    /// references.
    pub fn fix_dangling_refs(&mut self) -> Result<()> {
        let ids: Vec<(ObjNr, u16)> = {
            let refs = self.storage.refs.borrow();
            refs.used_ids().map(|id| (id, refs.get(id).map(|e| e.gen_nr()).unwrap_or(0))).collect()
        };
        for (id, gen) in ids {
            let _ = t!(self.storage.resolve(PlainRef { id, gen }));
        }
        let live: HashSet<ObjNr> = {
            let cache = self.storage.cache.borrow();
            cache.iter().filter(|(_, v)| !matches!(v, Primitive::Unresolved)).map(|(r, _)| r.id).collect()
        };
        let mut cache = self.storage.cache.borrow_mut();
        for value in cache.values_mut() {
            null_dangling(value, &live);
        }
        let mut trailer = self.storage.trailer.borrow_mut();
        let mut t = trailer.clone();
        for value in t.values_mut() {
            null_dangling(value, &live);
        }
        *trailer = t;
        Ok(())
    }

    /// Every live `(id, gen, value)`, after dangling-reference repair.
    pub fn all_objects(&mut self) -> Result<Vec<(PlainRef, Primitive)>> {
        t!(self.fix_dangling_refs());
        let cache = self.storage.cache.borrow();
        let mut objects: Vec<(PlainRef, Primitive)> = cache
            .iter()
            .filter(|(_, v)| !matches!(v, Primitive::Unresolved))
            .map(|(&r, v)| (r, v.clone()))
            .collect();
        objects.sort_by_key(|&(r, _)| r);
        Ok(objects)
    }

    pub fn xref(&self) -> std::cell::Ref<XRefTable> {
        self.storage.refs.borrow()
    }
    pub fn span_of(&self, id: ObjNr) -> Option<ObjSpan> {
        self.storage.spans.borrow().get(&id).copied()
    }
    pub fn storage(&self) -> &Storage<B> {
        &self.storage
    }

    /// Raw, decrypted (but still filtered) stream payload.
    pub fn stream_data(&self, stream: &PdfStream, id: PlainRef) -> Result<Vec<u8>> {
        self.storage.raw_stream_data(stream, id)
    }
    /// Fully decoded stream payload.
    pub fn stream_data_decoded(&self, stream: &PdfStream, id: PlainRef) -> Result<Vec<u8>> {
        self.storage.decoded_stream_data(stream, id)
    }

    /// The pages in document order, by walking the page tree. Cycles and
    /// malformed kids are warned about and skipped.
    pub fn page_refs(&self) -> Result<Vec<PlainRef>> {
        let catalog = t!(self.catalog());
        let pages_ref = match catalog.get("Pages") {
            Some(&Primitive::Reference(r)) => r,
            _ => return Ok(Vec::new()),
        };
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        t!(self.collect_pages(pages_ref, &mut visited, &mut out, 0));
        Ok(out)
    }

    fn collect_pages(
        &self,
        node_ref: PlainRef,
        visited: &mut HashSet<PlainRef>,
        out: &mut Vec<PlainRef>,
        depth: usize,
    ) -> Result<()> {
        if depth > 64 || !visited.insert(node_ref) {
            self.storage.push_warning(PdfError::ReferenceCycle { obj_nr: node_ref.id })?;
            return Ok(());
        }
        let node = match t!(self.storage.resolve(node_ref)) {
            Primitive::Dictionary(d) => d,
            _ => return Ok(()),
        };
        match node.get("Type").and_then(|p| p.as_name().ok()) {
            Some("Pages") => {
                let kids = match node.get("Kids") {
                    Some(p) => t!(self.storage.resolve_deref(p.clone())),
                    None => return Ok(()),
                };
                if let Primitive::Array(kids) = kids {
                    for kid in kids {
                        if let Primitive::Reference(r) = kid {
                            t!(self.collect_pages(r, visited, out, depth + 1));
                        }
                    }
                }
                Ok(())
            }
            // a leaf; some files omit /Type on pages
            _ => {
                out.push(node_ref);
                Ok(())
            }
        }
    }

    //////////////////
    // Foreign copy

    /// Copy the subgraph reachable from `foreign_ref` in `other` into
    /// this document, assigning fresh local ids. Cycles are preserved;
    /// each foreign object is copied once. Stream payloads are pulled
    /// out of the foreign document during the copy (decrypted, filters
    /// kept), so the foreign document may be dropped afterwards.
    pub fn copy_foreign<B2: Backend>(&mut self, other: &File<B2>, foreign_ref: PlainRef) -> Result<PlainRef> {
        let mut map: HashMap<PlainRef, PlainRef> = HashMap::new();
        let local = self.copy_foreign_inner(other, foreign_ref, &mut map)?;
        Ok(local)
    }

    fn copy_foreign_inner<B2: Backend>(
        &mut self,
        other: &File<B2>,
        foreign_ref: PlainRef,
        map: &mut HashMap<PlainRef, PlainRef>,
    ) -> Result<PlainRef> {
        if let Some(&local) = map.get(&foreign_ref) {
            return Ok(local);
        }
        // Reserve the local id first so cycles land on it.
        let local = self.reserve();
        map.insert(foreign_ref, local);

        let value = t!(other.storage.resolve(foreign_ref));
        let copied = t!(self.copy_foreign_value(other, value, foreign_ref, map));
        t!(self.replace(local, copied));
        Ok(local)
    }

    fn copy_foreign_value<B2: Backend>(
        &mut self,
        other: &File<B2>,
        value: Primitive,
        owner: PlainRef,
        map: &mut HashMap<PlainRef, PlainRef>,
    ) -> Result<Primitive> {
        Ok(match value {
            Primitive::Reference(r) => Primitive::Reference(t!(self.copy_foreign_inner(other, r, map))),
            Primitive::Array(arr) => {
                let mut out = Vec::with_capacity(arr.len());
                for item in arr {
                    out.push(t!(self.copy_foreign_value(other, item, owner, map)));
                }
                Primitive::Array(out)
            }
            Primitive::Dictionary(dict) => {
                let mut out = Dictionary::new();
                for (k, v) in dict {
                    let v = t!(self.copy_foreign_value(other, v, owner, map));
                    out.insert(k, v);
                }
                Primitive::Dictionary(out)
            }
            Primitive::Stream(stream) => {
                let data = t!(other.stream_data(&stream, owner));
                let mut info = Dictionary::new();
                for (k, v) in stream.info {
                    let v = t!(self.copy_foreign_value(other, v, owner, map));
                    info.insert(k, v);
                }
                Primitive::Stream(PdfStream { info, data: StreamData::InMemory(Rc::new(data)) })
            }
            p => p,
        })
    }
}

fn null_dangling(value: &mut Primitive, live: &HashSet<ObjNr>) {
    match value {
        Primitive::Reference(r) if !live.contains(&r.id) => *value = Primitive::Null,
        Primitive::Array(arr) => {
            for v in arr {
                null_dangling(v, live);
            }
        }
        Primitive::Dictionary(dict) => {
            for v in dict.values_mut() {
                null_dangling(v, live);
            }
        }
        Primitive::Stream(s) => {
            for v in s.info.values_mut() {
                null_dangling(v, live);
            }
        }
        _ => {}
    }
}

fn parse_header_version(buf: &[u8]) -> (u8, u8) {
    // "%PDF-x.y"
    if buf.len() >= 8 && &buf[..5] == b"%PDF-" {
        let major = buf[5].wrapping_sub(b'0');
        let minor = buf[7].wrapping_sub(b'0');
        if buf[6] == b'.' && major <= 9 && minor <= 9 {
            return (major, minor);
        }
    }
    warn!("unparsable PDF header version, assuming 1.3");
    (1, 3)
}

fn parse_version_name(name: &str) -> Option<(u8, u8)> {
    let mut parts = name.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_version() {
        assert_eq!(parse_header_version(b"%PDF-1.7\n%\xbf\xf7\xa2\xfe"), (1, 7));
        assert_eq!(parse_header_version(b"garbage"), (1, 3));
    }

    #[test]
    fn make_indirect_is_monotonic() {
        let mut file = File::new();
        let a = file.make_indirect(Primitive::Integer(1));
        file.erase(a).unwrap();
        let b = file.make_indirect(Primitive::Integer(2));
        assert!(b.id > a.id);
    }

    #[test]
    fn replace_changes_all_handles() {
        let mut file = File::new();
        let r = file.make_indirect(Primitive::Integer(1));
        let handle_copy = r;
        file.replace(r, Primitive::Integer(2)).unwrap();
        assert_eq!(file.resolve_ref(handle_copy).unwrap().as_integer().unwrap(), 2);
    }

    #[test]
    fn swap_exchanges_values() {
        let mut file = File::new();
        let a = file.make_indirect(Primitive::Integer(1));
        let b = file.make_indirect(Primitive::Integer(2));
        file.swap(a, b).unwrap();
        assert_eq!(file.resolve_ref(a).unwrap().as_integer().unwrap(), 2);
        assert_eq!(file.resolve_ref(b).unwrap().as_integer().unwrap(), 1);
    }

    #[test]
    fn foreign_copy_preserves_cycles() {
        // X: A = << /Self B >>, B = << /Back A >>
        let mut x = File::new();
        let a = x.reserve();
        let b = x.reserve();
        let mut dict_a = Dictionary::new();
        dict_a.insert("Self", Primitive::Reference(b));
        let mut dict_b = Dictionary::new();
        dict_b.insert("Back", Primitive::Reference(a));
        x.replace(a, Primitive::Dictionary(dict_a)).unwrap();
        x.replace(b, Primitive::Dictionary(dict_b)).unwrap();

        let mut y = File::new();
        let before = y.all_objects().unwrap().len();
        let ya = y.copy_foreign(&x, a).unwrap();
        let after = y.all_objects().unwrap().len();
        assert_eq!(after - before, 2);

        let da = y.resolve_ref(ya).unwrap().into_dictionary(&crate::object::NoResolve).unwrap();
        let yb = da.get("Self").unwrap().as_reference().unwrap();
        let db = y.resolve_ref(yb).unwrap().into_dictionary(&crate::object::NoResolve).unwrap();
        assert_eq!(db.get("Back").unwrap().as_reference().unwrap(), ya);
    }

    #[test]
    fn closed_input_is_logic_error() {
        let mut file = File::new();
        file.close_input();
        // cache-resident objects still resolve; backend reads must fail
        let r = PlainRef { id: 999, gen: 0 };
        assert!(matches!(file.storage().backend(), Err(PdfError::Logic { .. })));
        let _ = r;
    }
}
