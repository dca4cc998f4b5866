#![forbid(unsafe_code)]
#![deny(unused_must_use, missing_docs)]
#![warn(clippy::pedantic, clippy::nursery)]

//! Binary entrypoint that wires the Stowage services together and runs the
//! download poller until shutdown.

use stowage_app::{AppResult, run_app};

/// Bootstraps the service and blocks until shutdown.
#[tokio::main]
async fn main() -> AppResult<()> {
    run_app().await
}
