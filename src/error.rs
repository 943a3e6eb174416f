use std::error::Error;
use std::io;

/// Central error type. `Damaged` carries a byte offset and a description of
/// the surrounding structure so messages point at the right place in the
/// file; everything else is either an environment failure or API misuse.
#[derive(Debug, Snafu)]
pub enum PdfError {
    // Syntax / parsing
    #[snafu(display("Unexpected end of file"))]
    EOF,

    #[snafu(display("Error parsing from string: {}", source))]
    Parse { source: Box<dyn Error + Send + Sync> },

    #[snafu(display("Invalid encoding: {}", source))]
    Utf8 { source: Box<dyn Error + Send + Sync> },

    #[snafu(display("Unexpected token '{}' at {} - expected '{}'", lexeme, pos, expected))]
    UnexpectedLexeme { pos: usize, lexeme: String, expected: &'static str },

    #[snafu(display("Expecting an object, encountered {} at pos {}", first_lexeme, pos))]
    UnknownType { pos: usize, first_lexeme: String },

    #[snafu(display("Maximum recursion depth reached while parsing"))]
    MaxDepth,

    #[snafu(display("damaged PDF ({}, offset {}): {}", location, offset, msg))]
    Damaged { location: String, offset: usize, msg: String },

    #[snafu(display("too many errors while recovering damaged file"))]
    TooManyErrors,

    #[snafu(display("Erroneous 'type' field in xref stream - expected 0, 1 or 2, found {}", found))]
    XRefStreamType { found: u64 },

    #[snafu(display("xref entry for object {} missing", id))]
    UnspecifiedXRefEntry { id: crate::object::ObjNr },

    //////////////////
    // Encode/decode
    #[snafu(display("Hex decode error. Position {}, bytes {:?}", pos, bytes))]
    HexDecode { pos: usize, bytes: [u8; 2] },

    #[snafu(display("Ascii85 tail error"))]
    Ascii85TailError,

    #[snafu(display("Failed to convert '{}' into PredictorType", n))]
    IncorrectPredictorType { n: u8 },

    #[snafu(display("inflate error: {}", msg))]
    Inflate { msg: String },

    //////////////////
    // Dictionary
    #[snafu(display("Field /{} is missing in dictionary for type {}.", field, typ))]
    MissingEntry { typ: &'static str, field: String },

    #[snafu(display("Expected dictionary /Type = {}. Found /Type = {}.", expected, found))]
    WrongDictionaryType { expected: String, found: String },

    //////////////////
    // Objects
    #[snafu(display("Tried to dereference free object nr {}.", obj_nr))]
    FreeObject { obj_nr: crate::object::ObjNr },

    #[snafu(display("Tried to dereference non-existing object nr {}.", obj_nr))]
    NullRef { obj_nr: crate::object::ObjNr },

    #[snafu(display("Expected primitive {}, found primitive {} instead.", expected, found))]
    UnexpectedPrimitive { expected: &'static str, found: &'static str },

    #[snafu(display("Object stream index out of bounds ({}/{}).", index, max))]
    ObjStmOutOfBounds { index: usize, max: usize },

    #[snafu(display("object {} is still reserved at write time", obj_nr))]
    ReservedObject { obj_nr: crate::object::ObjNr },

    #[snafu(display("reference cycle through object nr {}", obj_nr))]
    ReferenceCycle { obj_nr: crate::object::ObjNr },

    //////////////////
    // Encryption
    #[snafu(display("Invalid password"))]
    InvalidPassword,

    #[snafu(display("file is not encrypted"))]
    NotEncrypted,

    #[snafu(display("unsupported encryption (V={}, R={})", v, r))]
    UnsupportedEncryption { v: i64, r: i64 },

    #[snafu(display("decryption failure"))]
    DecryptionFailure,

    //////////////////
    // Misc
    #[snafu(display("IO Error"))]
    Io { source: io::Error },

    #[snafu(display("api misuse: {}", msg))]
    Logic { msg: String },

    #[snafu(display("{}", msg))]
    Other { msg: String },

    #[snafu(display("NoneError at {}:{}:{}", file, line, column))]
    NoneError { file: &'static str, line: u32, column: u32 },
}

impl PdfError {
    pub fn is_eof(&self) -> bool {
        matches!(self, PdfError::EOF)
    }
    /// Errors the resolver may downgrade to a warning plus a Null
    /// substitute when `attempt_recovery` is on. I/O problems, bad
    /// passwords and API misuse always propagate.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            PdfError::Io { .. }
                | PdfError::Logic { .. }
                | PdfError::InvalidPassword
                | PdfError::NotEncrypted
                | PdfError::UnsupportedEncryption { .. }
                | PdfError::TooManyErrors
                | PdfError::ReservedObject { .. }
        )
    }
    pub fn damaged(location: impl Into<String>, offset: usize, msg: impl Into<String>) -> PdfError {
        PdfError::Damaged { location: location.into(), offset, msg: msg.into() }
    }
    pub fn logic(msg: impl Into<String>) -> PdfError {
        PdfError::Logic { msg: msg.into() }
    }
}

pub type Result<T, E = PdfError> = std::result::Result<T, E>;

impl From<io::Error> for PdfError {
    fn from(source: io::Error) -> PdfError {
        PdfError::Io { source }
    }
}
impl From<String> for PdfError {
    fn from(msg: String) -> PdfError {
        PdfError::Other { msg }
    }
}

#[macro_export]
macro_rules! try_opt {
    ($e:expr) => {
        match $e {
            Some(v) => v,
            None => {
                return Err($crate::PdfError::NoneError {
                    file: file!(),
                    line: line!(),
                    column: column!(),
                })
            }
        }
    };
}

/// `?` with breadcrumbs: extra arguments are logged when the expression
/// fails, which beats a bare backtrace when chasing damaged files.
macro_rules! t {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return Err(e.into()),
        }
    };
    ($e:expr, $($ctx:expr),+) => {
        match $e {
            Ok(v) => v,
            Err(e) => {
                debug!("failure context: {:?}", ($(&$ctx),+));
                return Err(e.into());
            }
        }
    };
}

macro_rules! err_from {
    ($($st:ty),* => $variant:ident) => (
        $(
            impl From<$st> for PdfError {
                fn from(e: $st) -> PdfError {
                    PdfError::$variant { source: e.into() }
                }
            }
        )*
    )
}
err_from!(std::str::Utf8Error, std::string::FromUtf8Error => Utf8);
err_from!(std::num::ParseIntError, std::num::ParseFloatError, std::string::ParseError => Parse);

macro_rules! err {
    ($e: expr) => {{
        return Err($e);
    }};
}
macro_rules! bail {
    ($($t:tt)*) => {
        err!($crate::PdfError::Other { msg: format!($($t)*) })
    }
}

#[cfg(feature = "dump")]
pub fn dump_data(data: &[u8]) {
    use std::io::Write;
    let result: std::io::Result<()> = (|| {
        let (mut file, path) = tempfile::Builder::new().prefix("pdfmill").tempfile()?.keep()?;
        file.write_all(data)?;
        info!("data written to {:?}", path);
        Ok(())
    })();
    if let Err(e) = result {
        warn!("unable to dump data: {}", e);
    }
}
#[cfg(not(feature = "dump"))]
pub fn dump_data(_data: &[u8]) {}
