//! Object streams (`/Type /ObjStm`): a compressed container of direct
//! objects. Reading decodes the whole stream once and parses the header
//! pair table; writing packs eligible objects back into such containers.

use crate::error::*;
use crate::object::{ObjNr, Resolve};
use crate::parser::{parse_with_lexer, Lexer, ParseFlags};
use crate::primitive::{Dictionary, Primitive};

/// A decoded object stream, ready to hand out object slices.
pub struct ObjectStream {
    /// `(object number, offset)` pairs from the header, offsets relative
    /// to `/First`, in header order. Xref entries address objects by
    /// this index, so invalidated entries keep their slot as `None`.
    pairs: Vec<Option<(ObjNr, usize)>>,
    first: usize,
    data: Vec<u8>,
}

impl ObjectStream {
    /// `decoded` is the fully decoded payload. Offsets must ascend; ids
    /// beyond `max_id` and the well-known self-reference malformation
    /// are dropped with a warning.
    pub fn parse(stream_id: ObjNr, dict: &Dictionary, decoded: Vec<u8>, max_id: ObjNr) -> Result<ObjectStream> {
        dict.expect("ObjStm", "Type", "ObjStm", true)?;
        let n = try_opt!(dict.get("N")).as_usize()?;
        let first = try_opt!(dict.get("First")).as_usize()?;
        if first > decoded.len() {
            err!(PdfError::damaged(format!("object stream {}", stream_id), 0, "/First beyond decoded data"));
        }

        let mut pairs = Vec::with_capacity(n);
        let mut lexer = Lexer::new(&decoded[..first]);
        let mut last_offset = None;
        for _ in 0..n {
            let id = t!(lexer.next_as::<ObjNr>());
            let offset = t!(lexer.next_as::<usize>());
            if let Some(last) = last_offset {
                if offset <= last {
                    err!(PdfError::damaged(
                        format!("object stream {}", stream_id),
                        0,
                        "offsets in object stream header do not ascend",
                    ));
                }
            }
            last_offset = Some(offset);
            if id > max_id {
                warn!("object stream {} names object {} beyond the file bound, ignoring", stream_id, id);
                pairs.push(None);
            } else if id == stream_id {
                warn!("object stream {} contains itself, ignoring", stream_id);
                pairs.push(None);
            } else if first + offset > decoded.len() {
                warn!("object stream {} offset for object {} is out of range, ignoring", stream_id, id);
                pairs.push(None);
            } else {
                pairs.push(Some((id, offset)));
            }
        }

        Ok(ObjectStream { pairs, first, data: decoded })
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// `(header index, object number)` for every surviving entry.
    pub fn ids(&self) -> impl Iterator<Item = (usize, ObjNr)> + '_ {
        self.pairs.iter().enumerate().filter_map(|(i, p)| p.map(|(id, _)| (i, id)))
    }

    pub fn object_slice(&self, index: usize) -> Result<&[u8]> {
        let (_, offset) = self
            .pairs
            .get(index)
            .copied()
            .flatten()
            .ok_or(PdfError::ObjStmOutOfBounds { index, max: self.pairs.len() })?;
        let start = self.first + offset;
        // the end is the next listed offset, valid or not
        let end = match self.pairs.get(index + 1).and_then(|p| p.map(|(_, o)| self.first + o)) {
            Some(next) => next.min(self.data.len()),
            None => self.data.len(),
        };
        Ok(&self.data[start..end])
    }

    /// Parse the object at `index`. Contained objects are direct and
    /// carry no `obj`/`endobj` wrapper; strings in them are never
    /// encrypted (the container stream already was).
    pub fn parse_object(&self, index: usize, r: &impl Resolve) -> Result<Primitive> {
        let slice = t!(self.object_slice(index));
        let mut lexer = Lexer::new(slice);
        parse_with_lexer(&mut lexer, r, ParseFlags::ANY)
    }
}

/// Accumulates serialized objects and lays out `/N`, `/First` and the
/// concatenated bodies.
pub struct ObjectStreamBuilder {
    entries: Vec<(ObjNr, Vec<u8>)>,
}

impl ObjectStreamBuilder {
    pub fn new() -> ObjectStreamBuilder {
        ObjectStreamBuilder { entries: Vec::new() }
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    pub fn push(&mut self, id: ObjNr, serialized: Vec<u8>) {
        self.entries.push((id, serialized));
    }

    /// The stream dictionary (sans filters) and the uncompressed payload.
    pub fn build(&self) -> (Dictionary, Vec<u8>) {
        let mut header = Vec::new();
        let mut bodies = Vec::new();
        for &(id, ref body) in &self.entries {
            header.extend_from_slice(format!("{} {}\n", id, bodies.len()).as_bytes());
            bodies.extend_from_slice(body);
            bodies.push(b'\n');
        }
        let mut dict = Dictionary::new();
        dict.insert("Type", Primitive::name("ObjStm"));
        dict.insert("N", Primitive::Integer(self.entries.len() as i64));
        dict.insert("First", Primitive::Integer(header.len() as i64));
        let mut payload = header;
        payload.extend_from_slice(&bodies);
        (dict, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::NoResolve;

    fn sample() -> (Dictionary, Vec<u8>) {
        let mut builder = ObjectStreamBuilder::new();
        builder.push(3, b"<< /Type /Page >>".to_vec());
        builder.push(5, b"42".to_vec());
        builder.build()
    }

    #[test]
    fn roundtrip() {
        let (dict, payload) = sample();
        let stm = ObjectStream::parse(10, &dict, payload, 1000).unwrap();
        assert_eq!(stm.len(), 2);
        let page = stm.parse_object(0, &NoResolve).unwrap();
        assert_eq!(page.as_dictionary().unwrap().get("Type").unwrap().as_name().unwrap(), "Page");
        let num = stm.parse_object(1, &NoResolve).unwrap();
        assert_eq!(num.as_integer().unwrap(), 42);
    }

    #[test]
    fn self_reference_dropped() {
        let mut builder = ObjectStreamBuilder::new();
        builder.push(10, b"1".to_vec());
        builder.push(4, b"2".to_vec());
        let (dict, payload) = builder.build();
        let stm = ObjectStream::parse(10, &dict, payload, 1000).unwrap();
        assert_eq!(stm.ids().map(|(_, id)| id).collect::<Vec<_>>(), vec![4]);
    }

    #[test]
    fn offsets_inside_payload() {
        let (dict, payload) = sample();
        let stm = ObjectStream::parse(10, &dict, payload.clone(), 1000).unwrap();
        for (i, _) in stm.ids().collect::<Vec<_>>() {
            assert!(stm.object_slice(i).unwrap().len() < payload.len());
        }
    }

    #[test]
    fn descending_offsets_rejected() {
        let mut dict = Dictionary::new();
        dict.insert("Type", Primitive::name("ObjStm"));
        dict.insert("N", Primitive::Integer(2));
        dict.insert("First", Primitive::Integer(10));
        let payload = b"1 5 2 3  AB".to_vec();
        assert!(ObjectStream::parse(9, &dict, payload, 100).is_err());
    }
}
