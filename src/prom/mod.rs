//! Prom.ua marketplace API: update payloads and the HTTP client.

mod client;
mod types;

pub use client::{BatchOutcome, PromClient, PromError, PROM_USER_AGENT};
pub use types::{EditResponse, Presence, ProductUpdate};
