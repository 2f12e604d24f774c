//! Push vendor XML feed prices and stock to the Prom.ua marketplace.
//!
//! The binary is a thin wrapper around [`sync::run`]; everything it does is
//! reachable from here so the pipeline can be driven from tests.

pub mod config;
pub mod exit;
pub mod feed;
pub mod prom;
pub mod state;
pub mod sync;
pub mod util;
