#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(missing_docs, unreachable_pub, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

//! Environment-driven configuration for the transfer subsystem.
//!
//! # Design
//! - Every knob has a default in [`defaults`]; the environment overrides it.
//! - Parsing failures name the variable and the reason so operators can fix them.

pub mod defaults;
pub mod error;
pub mod loader;
pub mod model;
mod validate;

pub use error::{ConfigError, ConfigResult};
pub use model::TransferConfig;
