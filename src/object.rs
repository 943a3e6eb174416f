//! Object identity and the resolver seam.

use crate::error::*;
use crate::primitive::Primitive;

pub type ObjNr = u32;
pub type GenNr = u16;

/// `(object number, generation)`: the identity of an indirect object.
/// `id == 0` is reserved for direct values and never stored in the cache.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct PlainRef {
    pub id: ObjNr,
    pub gen: GenNr,
}

impl PlainRef {
    pub fn new(id: ObjNr, gen: GenNr) -> PlainRef {
        PlainRef { id, gen }
    }
}

impl std::fmt::Display for PlainRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} {} R", self.id, self.gen)
    }
}

/// Anything that can follow an indirect reference to its value.
pub trait Resolve {
    fn resolve(&self, r: PlainRef) -> Result<Primitive>;

    /// Follow references until a non-reference primitive comes back.
    /// `resolve_deref(resolve_deref(x)) == resolve_deref(x)`.
    fn resolve_deref(&self, p: Primitive) -> Result<Primitive> {
        let mut p = p;
        let mut seen = Vec::new();
        while let Primitive::Reference(r) = p {
            if seen.contains(&r) {
                err!(PdfError::ReferenceCycle { obj_nr: r.id });
            }
            seen.push(r);
            p = self.resolve(r)?;
        }
        Ok(p)
    }
}

/// Used where following references is impossible (parsing standalone
/// buffers, decoded object streams).
pub struct NoResolve;
impl Resolve for NoResolve {
    fn resolve(&self, r: PlainRef) -> Result<Primitive> {
        err!(PdfError::NullRef { obj_nr: r.id })
    }
}
