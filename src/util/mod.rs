//! Utility functions shared by the feed and marketplace sides.
//!
//! - **URL validation**: scheme/host checks for feed URLs and the
//!   credential-carrying API base URL
//! - **Retry**: the exponential backoff schedule used for HTTP retries

mod retry;
mod url_validator;

pub use retry::RetryPolicy;
pub use url_validator::{is_loopback, validate_secure_url, validate_url, UrlValidationError};
