//! Vendor feed handling: list reading, fetching, offer parsing, code derivation.
//!
//! - [`list`] - Read the `feeds.txt` URL list
//! - [`fetcher`] - Concurrent HTTP retrieval with retry and size limits
//! - [`parser`] - Streaming extraction of `<offer>` elements via `quick-xml`
//! - [`code`] - Derivation of the unique per-offer product code
//!
//! # Example
//!
//! ```ignore
//! use crate::feed::{fetch_all, read_feed_list, FetchOptions};
//!
//! let urls = read_feed_list(Path::new("feeds.txt")).await?;
//! let results = fetch_all(&client, &urls, &options).await;
//! ```

mod code;
mod fetcher;
mod list;
mod parser;

pub use code::{fallback_hash, make_code};
pub use fetcher::{
    build_client, fetch_all, fetch_one, FetchError, FetchOptions, FetchResult, FetchedFeed,
    FEED_USER_AGENT, MAX_FEED_SIZE,
};
pub use list::{parse_feed_list, read_feed_list, FeedListError};
pub use parser::{parse_offers, Offer, ParseError, ParseResult};
