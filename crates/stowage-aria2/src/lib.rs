#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(missing_docs, unreachable_pub, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

//! aria2 adapter for the download daemon seam.
//!
//! Talks to a running `aria2c --enable-rpc` over JSON-RPC 2.0 via HTTP POST.

mod client;
mod wire;

pub use client::{Aria2Client, Aria2Config};
