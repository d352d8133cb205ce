//! Common functionality shared across the CLI, indexer, and server.

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};

pub mod noodles;
pub mod s3;

/// Commonly used command line arguments.
#[derive(Parser, Debug)]
pub struct Args {
    /// Verbosity of the program
    #[clap(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            verbose: Verbosity::new(0, 0),
        }
    }
}

/// The version of the `bioindex` package.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Return the crate version, pinned to `x.y.z` in tests so snapshots stay stable.
pub fn worker_version() -> &'static str {
    if cfg!(test) {
        "x.y.z"
    } else {
        env!("CARGO_PKG_VERSION")
    }
}
