use quick_xml::encoding::Decoder;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

use super::code::make_code;

/// Child elements that carry a stock count, in priority order.
const QUANTITY_TAGS: [&str; 4] = ["quantity", "stock_quantity", "count", "quantity_in_stock"];

/// Child elements that carry an availability flag when the attribute is absent.
const AVAILABILITY_TAGS: [&str; 3] = ["availability", "instock", "in_stock"];

#[derive(Debug, Error)]
pub enum ParseError {
    /// The document is malformed before a single offer could be read.
    #[error("XML parse error at byte {position}: {message}")]
    Xml { position: u64, message: String },
}

/// A product offer extracted from a vendor feed.
#[derive(Debug, Clone, PartialEq)]
pub struct Offer {
    /// Derived marketplace code, `<prefix>_<vendorCode|id|md5>`.
    pub code: String,
    /// The `id` attribute of `<offer>`.
    pub offer_id: Option<String>,
    /// The `<vendorCode>` child.
    pub vendor_code: Option<String>,
    pub name: Option<String>,
    pub price: Option<f64>,
    pub quantity: Option<u64>,
    pub available: Option<bool>,
}

/// Offers read from one document.
///
/// Parsing is best-effort: when the XML breaks partway through, the offers
/// read before the break are kept and the error message is kept in `error`.
#[derive(Debug, Default)]
pub struct ParseResult {
    pub offers: Vec<Offer>,
    pub error: Option<String>,
}

/// Extracts every `<offer>` element from a feed document.
///
/// Offers may sit at any depth (YML catalogs nest them under
/// `yml_catalog/shop/offers`). Only direct children of `<offer>` are read.
///
/// # Errors
///
/// Returns [`ParseError::Xml`] only when the document is malformed and no
/// offer was read before the failure. An empty but well-formed document
/// yields an empty [`ParseResult`].
pub fn parse_offers(bytes: &[u8], prefix: &str) -> Result<ParseResult, ParseError> {
    // quick-xml (0.37) never expands <!ENTITY> declarations, and unknown
    // entities in text are kept raw by `decode_text`. Text is decoded with
    // the charset from the XML declaration (windows-1251 is common).
    let mut reader = Reader::from_reader(bytes);
    // Vendor feeds are often sloppy; a stray closing tag must not end the run
    reader.config_mut().check_end_names = false;

    let mut result = ParseResult::default();
    let mut buf = Vec::new();

    let mut current: Option<OfferBuilder> = None;
    // Nesting depth below the open <offer>; 1 = direct child
    let mut depth: usize = 0;
    let mut child: Option<String> = None;
    let mut text = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if current.is_none() {
                    if e.name().as_ref() == b"offer" {
                        let start = tag_start(&reader, e.len(), 2);
                        current = Some(OfferBuilder::from_start(&e, &reader, start));
                        depth = 0;
                    }
                } else {
                    depth += 1;
                    if depth == 1 {
                        child = Some(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                        text.clear();
                    }
                }
            }
            Ok(Event::Empty(e)) => {
                if current.is_none() && e.name().as_ref() == b"offer" {
                    // `<offer .../>`: content plus `<`, `/` and `>`
                    let start = tag_start(&reader, e.len(), 3);
                    let builder = OfferBuilder::from_start(&e, &reader, start);
                    let end = reader.buffer_position() as usize;
                    result.offers.push(builder.finish(prefix, slice(bytes, start, end)));
                }
            }
            Ok(Event::Text(e)) => {
                if current.is_some() && depth == 1 && child.is_some() {
                    text.push_str(&decode_text(&e, reader.decoder()));
                }
            }
            Ok(Event::CData(e)) => {
                if current.is_some() && depth == 1 && child.is_some() {
                    text.push_str(&decode_raw(&e, reader.decoder()));
                }
            }
            Ok(Event::End(_)) => {
                if depth == 0 {
                    if let Some(builder) = current.take() {
                        let start = builder.start;
                        let end = reader.buffer_position() as usize;
                        result.offers.push(builder.finish(prefix, slice(bytes, start, end)));
                    }
                } else {
                    if depth == 1 {
                        if let (Some(name), Some(builder)) = (child.take(), current.as_mut()) {
                            builder.set_field(name, text.trim());
                        }
                    }
                    depth -= 1;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                let position = reader.buffer_position() as u64;
                if result.offers.is_empty() {
                    return Err(ParseError::Xml {
                        position,
                        message: e.to_string(),
                    });
                }
                tracing::warn!(
                    position = position,
                    parsed = result.offers.len(),
                    error = %e,
                    "Feed XML broken partway through, keeping offers read so far"
                );
                result.error = Some(format!("at byte {}: {}", position, e));
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(result)
}

/// Byte offset of the `<` that opened the tag just read.
fn tag_start(reader: &Reader<&[u8]>, content_len: usize, markup_len: usize) -> usize {
    (reader.buffer_position() as usize).saturating_sub(content_len + markup_len)
}

fn slice(bytes: &[u8], start: usize, end: usize) -> &[u8] {
    bytes.get(start..end).unwrap_or_default()
}

/// Unescapes element text, keeping the raw text when it contains entities
/// quick-xml does not know (`&nbsp;` and friends are common in vendor feeds).
fn decode_text(e: &quick_xml::events::BytesText<'_>, decoder: Decoder) -> String {
    match e.unescape() {
        Ok(text) => text.into_owned(),
        Err(_) => decode_raw(e, decoder),
    }
}

/// Decodes bytes in the document charset without unescaping.
fn decode_raw(bytes: &[u8], decoder: Decoder) -> String {
    match decoder.decode(bytes) {
        Ok(text) => text.into_owned(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Accumulates one `<offer>` while its children stream past.
#[derive(Debug, Default)]
struct OfferBuilder {
    /// Byte offset of the opening `<offer`.
    start: usize,
    offer_id: Option<String>,
    available_attr: Option<String>,
    /// Direct child texts; the first occurrence of a tag wins.
    fields: Vec<(String, String)>,
}

impl OfferBuilder {
    fn from_start(e: &BytesStart<'_>, reader: &Reader<&[u8]>, start: usize) -> Self {
        let mut builder = OfferBuilder {
            start,
            ..Default::default()
        };

        for attr_result in e.attributes() {
            let attr = match attr_result {
                Ok(attr) => attr,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping malformed offer attribute");
                    continue;
                }
            };
            let value = match attr.decode_and_unescape_value(reader.decoder()) {
                Ok(v) => v.trim().to_string(),
                Err(_) => decode_raw(&attr.value, reader.decoder()).trim().to_string(),
            };
            match attr.key.as_ref() {
                b"id" => builder.offer_id = Some(value).filter(|v| !v.is_empty()),
                b"available" => builder.available_attr = Some(value),
                _ => {}
            }
        }

        builder
    }

    fn set_field(&mut self, name: String, value: &str) {
        if value.is_empty() || self.fields.iter().any(|(n, _)| *n == name) {
            return;
        }
        self.fields.push((name, value.to_string()));
    }

    fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn finish(self, prefix: &str, raw: &[u8]) -> Offer {
        let vendor_code = self.field("vendorCode").map(str::to_string);
        let name = self
            .field("name")
            .or_else(|| self.field("title"))
            .map(str::to_string);
        let price = self.field("price").and_then(parse_price);
        let quantity = QUANTITY_TAGS
            .iter()
            .find_map(|tag| self.field(tag).and_then(parse_quantity));

        // A known count decides presence; flags only matter without one
        let available = quantity.map(|q| q > 0).or_else(|| {
            self.available_attr
                .as_deref()
                .and_then(parse_availability)
                .or_else(|| {
                    AVAILABILITY_TAGS
                        .iter()
                        .find_map(|tag| self.field(tag).and_then(parse_availability))
                })
        });

        let code = make_code(prefix, vendor_code.as_deref(), self.offer_id.as_deref(), raw);

        Offer {
            code,
            offer_id: self.offer_id,
            vendor_code,
            name,
            price,
            quantity,
            available,
        }
    }
}

/// Parses a price like `1299.50`, `1299,50` or `1 299,50`.
fn parse_price(raw: &str) -> Option<f64> {
    let normalized: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    normalized
        .parse::<f64>()
        .ok()
        .filter(|p| p.is_finite() && *p >= 0.0)
}

/// Parses a stock count. Fractions are truncated, negatives clamp to zero.
fn parse_quantity(raw: &str) -> Option<u64> {
    let value = raw.trim().replace(',', ".").parse::<f64>().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(if value <= 0.0 { 0 } else { value.trunc() as u64 })
}

fn parse_availability(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "available" | "in_stock" | "instock" | "in stock" => Some(true),
        "false" | "0" | "no" | "unavailable" | "out_of_stock" | "out of stock" => Some(false),
        _ => None,
    }
}
