#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(missing_docs, unreachable_pub, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

//! Download job registry and its persistence backends.
//!
//! Layout: `store` (persistence seam), `memory` and `postgres` (backends),
//! `registry` (state-machine enforcing front door), `error`.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod registry;
pub mod store;

pub use error::{RegistryError, RegistryResult};
pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;
pub use registry::JobRegistry;
pub use store::{InsertOutcome, JobFilter, JobStore};
