use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Errors that can occur during URL validation.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL has no host component.
    #[error("URL has no host")]
    MissingHost,
    /// Plain HTTP to a remote host where credentials would travel in clear text.
    #[error("Insecure URL: HTTPS required (except localhost for testing)")]
    Insecure,
}

/// Validates a URL string for use as a feed source or API base.
///
/// Rejects anything that does not parse, is not `http`/`https`, or has no
/// host. Feed lists are operator-maintained, so loopback and private hosts
/// are accepted here.
///
/// # Examples
///
/// ```
/// use prom_feed_sync::util::validate_url;
///
/// let url = validate_url("https://vendor.example.com/export.xml").unwrap();
/// assert_eq!(url.host_str(), Some("vendor.example.com"));
///
/// assert!(validate_url("file:///etc/passwd").is_err());
/// assert!(validate_url("not a url").is_err());
/// ```
pub fn validate_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(url),
        _ => Err(UrlValidationError::MissingHost),
    }
}

/// Validates a URL that will carry credentials.
///
/// Same rules as [`validate_url`], plus HTTPS is mandatory unless the host
/// is loopback.
pub fn validate_secure_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = validate_url(url_str)?;
    if url.scheme() == "https" || is_loopback(&url) {
        Ok(url)
    } else {
        Err(UrlValidationError::Insecure)
    }
}

/// Returns true when the URL points at `localhost` or a loopback address.
pub fn is_loopback(url: &Url) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }

    // Strip brackets from IPv6 addresses for parsing
    let host_for_parse = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    host_for_parse
        .parse::<IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}
