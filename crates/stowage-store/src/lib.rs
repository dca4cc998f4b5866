#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(missing_docs, unreachable_pub, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

//! Local-disk implementation of the file store seam.
//!
//! Each owner gets a directory under the store root. Writes land in a hidden
//! temporary file beside the target and become visible on commit via rename.

mod handles;
mod local;
mod paths;
mod tree;

pub use local::LocalFileStore;
