#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(missing_docs, unreachable_pub, clippy::pedantic, clippy::nursery)]

//! Shared test helpers used across integration suites.
//! Layout: docker.rs (container availability probe), mocks.rs (fake daemon and file store).

pub mod docker;
pub mod mocks;
