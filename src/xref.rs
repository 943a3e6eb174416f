//! The cross-reference table: object number to location.

use crate::error::*;
use crate::object::{GenNr, ObjNr};
use std::fmt::{self, Debug, Formatter};
use std::io::Write;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum XRef {
    /// Tombstone; `next_free` links the free list.
    Free { next_free: ObjNr, gen: GenNr },
    /// In use, uncompressed, at a byte offset of the file.
    Raw { pos: usize, gen: GenNr },
    /// In use, inside an object stream. Generation is implicitly 0.
    Stream { stream_id: ObjNr, index: usize },
    /// Not specified by any xref section.
    Invalid,
}

impl XRef {
    pub fn gen_nr(&self) -> GenNr {
        match *self {
            XRef::Free { gen, .. } | XRef::Raw { gen, .. } => gen,
            XRef::Stream { .. } | XRef::Invalid => 0,
        }
    }
    pub fn is_in_use(&self) -> bool {
        matches!(self, XRef::Raw { .. } | XRef::Stream { .. })
    }
}

/// Runtime lookup table of all objects, merged over the whole update
/// chain. Indexed by object number.
pub struct XRefTable {
    entries: Vec<XRef>,
    /// Ceiling derived from the file size; ids beyond it are garbage.
    max_id: ObjNr,
}

impl XRefTable {
    pub fn new(num_objects: usize, max_id: ObjNr) -> XRefTable {
        XRefTable { entries: vec![XRef::Invalid; num_objects], max_id }
    }

    pub fn max_id(&self) -> ObjNr {
        self.max_id
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: ObjNr) -> Result<XRef> {
        match self.entries.get(id as usize) {
            Some(&entry) => Ok(entry),
            None => Err(PdfError::UnspecifiedXRefEntry { id }),
        }
    }

    /// Grows the table as needed. Ids above `max_id` are dropped with a
    /// warning instead of allocating absurd amounts of table.
    pub fn set(&mut self, id: ObjNr, entry: XRef) {
        if id > self.max_id {
            warn!("ignoring xref entry for object {} beyond the file size bound {}", id, self.max_id);
            return;
        }
        if id as usize >= self.entries.len() {
            self.entries.resize(id as usize + 1, XRef::Invalid);
        }
        self.entries[id as usize] = entry;
    }

    /// The xref chain is read newest-to-oldest, so the first entry seen
    /// for an id is the authoritative one: filling a slot never
    /// overwrites.
    pub fn add_entries_from(&mut self, section: XRefSection) {
        for (i, &entry) in section.entries.iter().enumerate() {
            let id = section.first_id + i as ObjNr;
            if id > self.max_id {
                warn!("ignoring xref entry for object {} beyond the file size bound {}", id, self.max_id);
                continue;
            }
            if id as usize >= self.entries.len() {
                self.entries.resize(id as usize + 1, XRef::Invalid);
            }
            if let XRef::Invalid = self.entries[id as usize] {
                self.entries[id as usize] = entry;
            }
        }
    }

    /// Reconstruction keeps compressed entries (they locate object
    /// streams the scan may not find) and drops everything else.
    pub fn clear_uncompressed(&mut self) {
        for entry in &mut self.entries {
            if let XRef::Raw { .. } | XRef::Free { .. } = entry {
                *entry = XRef::Invalid;
            }
        }
    }

    /// Object numbers that are in use, ascending.
    pub fn used_ids(&self) -> impl Iterator<Item = ObjNr> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_in_use())
            .map(|(i, _)| i as ObjNr)
    }
}

impl Debug for XRefTable {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            match *entry {
                XRef::Free { next_free, gen } => writeln!(f, "{:4}: {:010} {:05} f", i, next_free, gen)?,
                XRef::Raw { pos, gen } => writeln!(f, "{:4}: {:010} {:05} n", i, pos, gen)?,
                XRef::Stream { stream_id, index } => {
                    writeln!(f, "{:4}: in stream {}, index {}", i, stream_id, index)?
                }
                XRef::Invalid => writeln!(f, "{:4}: invalid", i)?,
            }
        }
        Ok(())
    }
}

/// One contiguous subsection, as found in the file.
#[derive(Debug)]
pub struct XRefSection {
    pub first_id: ObjNr,
    pub entries: Vec<XRef>,
}

impl XRefSection {
    pub fn new(first_id: ObjNr) -> XRefSection {
        XRefSection { first_id, entries: Vec::new() }
    }
    pub fn add_free_entry(&mut self, next_free: ObjNr, gen: GenNr) {
        self.entries.push(XRef::Free { next_free, gen });
    }
    pub fn add_inuse_entry(&mut self, pos: usize, gen: GenNr) {
        self.entries.push(XRef::Raw { pos, gen });
    }
    pub fn add_stream_entry(&mut self, stream_id: ObjNr, index: usize) {
        self.entries.push(XRef::Stream { stream_id, index });
    }
}

/// Emit a classical table: `xref`, one subsection per contiguous id run,
/// exactly 20 bytes per entry.
pub fn write_classic_table(out: &mut impl Write, entries: &[(ObjNr, XRef)]) -> Result<()> {
    writeln!(out, "xref")?;
    let mut i = 0;
    while i < entries.len() {
        let mut j = i + 1;
        while j < entries.len() && entries[j].0 == entries[j - 1].0 + 1 {
            j += 1;
        }
        writeln!(out, "{} {}", entries[i].0, j - i)?;
        for &(id, entry) in &entries[i..j] {
            match entry {
                XRef::Free { next_free, gen } => write!(out, "{:010} {:05} f\r\n", next_free, gen)?,
                XRef::Raw { pos, gen } => write!(out, "{:010} {:05} n\r\n", pos, gen)?,
                _ => bail!("object {} cannot be written to a classical xref table", id),
            }
        }
        i = j;
    }
    Ok(())
}

/// Field widths and packed rows for an xref stream:
/// `[1, max(offset bytes, id bytes), index bytes]`.
pub fn xref_stream_data(entries: &[(ObjNr, XRef)]) -> (Vec<i64>, Vec<i64>, Vec<u8>) {
    let mut max_field1: u64 = 0;
    let mut max_field2: u64 = 0;
    for &(_, entry) in entries {
        let (f1, f2) = match entry {
            XRef::Free { next_free, gen } => (next_free as u64, gen as u64),
            XRef::Raw { pos, gen } => (pos as u64, gen as u64),
            XRef::Stream { stream_id, index } => (stream_id as u64, index as u64),
            XRef::Invalid => (0, 0),
        };
        max_field1 = max_field1.max(f1);
        max_field2 = max_field2.max(f2);
    }
    let w1 = bytes_needed(max_field1);
    let w2 = bytes_needed(max_field2);

    let mut index = Vec::new();
    let mut data = Vec::new();
    let mut i = 0;
    while i < entries.len() {
        let mut j = i + 1;
        while j < entries.len() && entries[j].0 == entries[j - 1].0 + 1 {
            j += 1;
        }
        index.push(entries[i].0 as i64);
        index.push((j - i) as i64);
        for &(_, entry) in &entries[i..j] {
            let (ty, f1, f2) = match entry {
                XRef::Free { next_free, gen } => (0u8, next_free as u64, gen as u64),
                XRef::Raw { pos, gen } => (1, pos as u64, gen as u64),
                XRef::Stream { stream_id, index } => (2, stream_id as u64, index as u64),
                XRef::Invalid => (0, 0, 0),
            };
            data.push(ty);
            data.extend_from_slice(&f1.to_be_bytes()[8 - w1..]);
            data.extend_from_slice(&f2.to_be_bytes()[8 - w2..]);
        }
        i = j;
    }
    (vec![1, w1 as i64, w2 as i64], index, data)
}

fn bytes_needed(v: u64) -> usize {
    let mut n = 1;
    while v >> (8 * n) != 0 {
        n += 1;
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newest_wins() {
        let mut table = XRefTable::new(3, 1000);
        // newest section first
        let mut newest = XRefSection::new(1);
        newest.add_inuse_entry(500, 0);
        table.add_entries_from(newest);
        // older section must not override
        let mut older = XRefSection::new(0);
        older.add_free_entry(0, 65535);
        older.add_inuse_entry(100, 0);
        older.add_inuse_entry(200, 0);
        table.add_entries_from(older);

        assert_eq!(table.get(1).unwrap(), XRef::Raw { pos: 500, gen: 0 });
        assert_eq!(table.get(2).unwrap(), XRef::Raw { pos: 200, gen: 0 });
    }

    #[test]
    fn max_id_bound() {
        let mut table = XRefTable::new(0, 10);
        table.set(11, XRef::Raw { pos: 0, gen: 0 });
        assert!(table.len() == 0);
    }

    #[test]
    fn classic_entries_are_20_bytes() {
        let mut out = Vec::new();
        write_classic_table(
            &mut out,
            &[(0, XRef::Free { next_free: 0, gen: 65535 }), (1, XRef::Raw { pos: 15, gen: 0 })],
        )
        .unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("xref"));
        assert_eq!(lines.next(), Some("0 2"));
        assert!(text.contains("0000000000 65535 f"));
        assert!(text.contains("0000000015 00000 n"));
        // "xref\n0 2\n" + 2 * 20
        assert_eq!(text.len(), 9 + 40);
    }

    #[test]
    fn stream_widths() {
        let entries =
            [(0, XRef::Free { next_free: 0, gen: 65535 }), (1, XRef::Raw { pos: 0x1234, gen: 0 }), (2, XRef::Stream { stream_id: 5, index: 1 })];
        let (w, index, data) = xref_stream_data(&entries);
        assert_eq!(w, vec![1, 2, 2]);
        assert_eq!(index, vec![0, 3]);
        assert_eq!(data.len(), 3 * 5);
        assert_eq!(&data[5..10], &[1, 0x12, 0x34, 0, 0]);
    }
}
