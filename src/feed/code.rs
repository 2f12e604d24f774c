use md5::{Digest, Md5};

/// Builds the marketplace external code for an offer: `<prefix>_<base>`.
///
/// `base` is the first non-blank of `vendor_code` and `offer_id` (trimmed),
/// falling back to the MD5 of the raw `<offer>` element bytes. The hash is
/// stable for as long as the vendor leaves that offer's markup untouched.
pub fn make_code(
    prefix: &str,
    vendor_code: Option<&str>,
    offer_id: Option<&str>,
    raw_offer: &[u8],
) -> String {
    let base = [vendor_code, offer_id]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| fallback_hash(raw_offer));

    format!("{}_{}", prefix, base)
}

/// Lowercase hex MD5 of the given bytes.
pub fn fallback_hash(raw: &[u8]) -> String {
    format!("{:x}", Md5::digest(raw))
}
