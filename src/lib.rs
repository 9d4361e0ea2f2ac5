#![warn(clippy::all)]
#![allow(clippy::new_without_default)]
#![allow(clippy::too_long_first_doc_paragraph)]

pub mod codec;
pub mod error;
pub mod keydir;
pub mod lock;
pub mod logfile;
pub mod store;

pub use error::{Error, Result};
pub use store::{Store, DEFAULT_MAX_FILE_SIZE};
