//! Byte-addressable input. Anything that derefs to a byte slice works as
//! a backend; `File::open` reads the whole file into a `Vec<u8>`.

use crate::error::*;
use crate::object::ObjNr;
use std::ops::{Deref, Range, RangeFrom, RangeFull, RangeTo};

/// How far before end-of-file the `startxref` keyword may start. The
/// keyword, a 20-digit offset, `%%EOF` and generous line endings all fit;
/// some producers also append padding after `%%EOF`.
pub const STARTXREF_WINDOW: usize = 1054;

pub trait Backend: Sized {
    fn read<T: IndexRange>(&self, range: T) -> Result<&[u8]>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offset of the `%PDF-` header. Viewers expect it within the first
    /// 1KB of the file and tolerate leading garbage; so do we.
    fn locate_start_offset(&self) -> Result<usize> {
        const HEADER: &[u8] = b"%PDF-";
        let buf = t!(self.read(..std::cmp::min(1024, self.len())));
        buf.windows(HEADER.len())
            .position(|window| window == HEADER)
            .ok_or_else(|| PdfError::Other { msg: "file header is missing".into() })
    }

    /// Last occurrence of `pattern` within `window`, subject to an
    /// arbitrary predicate on the match offset. Used for `startxref`
    /// and `%%EOF`, which must be found from the back of the file.
    fn find_last(
        &self,
        pattern: &[u8],
        window: Range<usize>,
        mut accept: impl FnMut(&[u8], usize) -> bool,
    ) -> Result<Option<usize>> {
        let window = window.start.min(self.len())..window.end.min(self.len());
        let buf = t!(self.read(window.clone()));
        if pattern.is_empty() || buf.len() < pattern.len() {
            return Ok(None);
        }
        for pos in (0..=buf.len() - pattern.len()).rev() {
            if &buf[pos..pos + pattern.len()] == pattern && accept(buf, pos) {
                return Ok(Some(window.start + pos));
            }
        }
        Ok(None)
    }

    /// The value of `startxref`, located by scanning backwards over the
    /// final window of the file.
    fn locate_xref_offset(&self) -> Result<usize> {
        let window = self.len().saturating_sub(STARTXREF_WINDOW)..self.len();
        let pos = t!(self.find_last(b"startxref", window, |_, _| true))
            .ok_or_else(|| PdfError::damaged("trailer", self.len(), "startxref not found"))?;
        let tail = t!(self.read(pos + b"startxref".len()..));
        let mut words = tail.split(|&b| matches!(b, b' ' | b'\r' | b'\n' | b'\t')).filter(|w| !w.is_empty());
        let offset = words
            .next()
            .and_then(|w| std::str::from_utf8(w).ok())
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| PdfError::damaged("trailer", pos, "startxref is not followed by an integer"))?;
        match words.next() {
            Some(b"%%EOF") => {}
            _ => warn!("%%EOF marker missing after startxref"),
        }
        Ok(offset)
    }

    /// Hard ceiling on object numbers: every object takes at least a few
    /// bytes in the file, so an id beyond this is garbage.
    fn max_id(&self) -> ObjNr {
        (self.len() / 3).min(u32::MAX as usize) as ObjNr
    }
}

impl<T> Backend for T
where
    T: Deref<Target = [u8]>,
{
    fn read<R: IndexRange>(&self, range: R) -> Result<&[u8]> {
        let r = t!(range.to_range(self.len()));
        Ok(&self[r])
    }
    fn len(&self) -> usize {
        (**self).len()
    }
}

/// `IndexRange` is implemented by Rust's built-in range types, produced
/// by range syntax like `..`, `a..`, `..b` or `c..d`.
pub trait IndexRange {
    /// Start index (inclusive)
    fn start(&self) -> Option<usize>;
    /// End index (exclusive)
    fn end(&self) -> Option<usize>;

    fn to_range(&self, len: usize) -> Result<Range<usize>> {
        match (self.start(), self.end()) {
            (None, None) => Ok(0..len),
            (Some(start), None) if start <= len => Ok(start..len),
            (None, Some(end)) if end <= len => Ok(0..end),
            (Some(start), Some(end)) if start <= end && end <= len => Ok(start..end),
            _ => Err(PdfError::EOF),
        }
    }
}

impl IndexRange for RangeFull {
    #[inline]
    fn start(&self) -> Option<usize> {
        None
    }
    #[inline]
    fn end(&self) -> Option<usize> {
        None
    }
}
impl IndexRange for RangeFrom<usize> {
    #[inline]
    fn start(&self) -> Option<usize> {
        Some(self.start)
    }
    #[inline]
    fn end(&self) -> Option<usize> {
        None
    }
}
impl IndexRange for RangeTo<usize> {
    #[inline]
    fn start(&self) -> Option<usize> {
        None
    }
    #[inline]
    fn end(&self) -> Option<usize> {
        Some(self.end)
    }
}
impl IndexRange for Range<usize> {
    #[inline]
    fn start(&self) -> Option<usize> {
        Some(self.start)
    }
    #[inline]
    fn end(&self) -> Option<usize> {
        Some(self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startxref_at_end() {
        let data = b"%PDF-1.4\njunk\nstartxref\n1234\n%%EOF\n".to_vec();
        assert_eq!(data.locate_xref_offset().unwrap(), 1234);
    }

    #[test]
    fn startxref_missing() {
        let data = b"%PDF-1.4\nno trailer here".to_vec();
        assert!(data.locate_xref_offset().is_err());
    }

    #[test]
    fn find_last_takes_final_match() {
        let data = b"obj obj obj".to_vec();
        let pos = data.find_last(b"obj", 0..data.len(), |_, _| true).unwrap();
        assert_eq!(pos, Some(8));
    }
}
