//! Invoice parsing from a raw portal response.
//!
//! Both the portal's HTML view and NF-e XML documents are accepted; the
//! format is sniffed from the body.

mod html;
pub(crate) mod text;
mod xml;

use crate::error::{BrisaError, BrisaResult};
use crate::types::Invoice;

/// Source format of a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Html,
    Xml,
}

pub fn sniff(raw: &str) -> Format {
    let head = raw.trim_start_matches('\u{feff}').trim_start();
    if head.starts_with("<?xml") || head.starts_with("<nfeProc") || head.starts_with("<NFe") {
        Format::Xml
    } else if raw.contains("<nfeProc") || raw.contains("<NFe ") || raw.contains("<NFe>") {
        if head.to_ascii_lowercase().starts_with("<!doctype html") || head.starts_with("<html") {
            Format::Html
        } else {
            Format::Xml
        }
    } else {
        Format::Html
    }
}

/// Parse a raw response into a validated [`Invoice`].
///
/// Fails with `MalformedResponse` when a required field is missing or
/// unparseable, and with `InvalidAccessKey` when the embedded key is not a
/// valid 44-digit key.
pub fn parse(raw: &str) -> BrisaResult<Invoice> {
    if raw.trim().is_empty() {
        return Err(BrisaError::malformed("empty response body"));
    }
    let format = sniff(raw);
    tracing::debug!(?format, bytes = raw.len(), "parsing invoice");
    match format {
        Format::Xml => xml::parse_xml(raw),
        Format::Html => html::parse_html(raw),
    }
}
