#![allow(clippy::len_zero, clippy::should_implement_trait, clippy::manual_map)]

#[macro_use]
extern crate snafu;
#[macro_use]
extern crate log;

#[macro_use]
pub mod error;
pub mod backend;
pub mod object;
pub mod primitive;
pub mod parser;
pub mod xref;
pub mod repair;
pub mod object_stream;
pub mod file;
pub mod enc;
pub mod pipeline;
pub mod crypt;
pub mod writer;

pub use crate::error::PdfError;
pub use crate::file::File;
pub use crate::writer::{WriteOptions, Writer};
