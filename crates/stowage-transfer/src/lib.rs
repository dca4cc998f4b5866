#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(missing_docs, unreachable_pub, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

//! Direct client transfers: rate-limited channels plus the upload and
//! download paths between a client and the file store.

mod client;
mod throttle;

pub use client::{ClientTransfer, ReaderSource};
pub use throttle::Throttled;
