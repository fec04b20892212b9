//! The JSON summary returned for every relayed request.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::client::UpstreamResponse;
use crate::http::Headers;

/// What the caller gets back: an identifier plus the upstream response head.
///
/// Cache hits replay the stored summary byte-for-byte equivalent, `id`
/// included, so repeating an envelope is observably idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSummary {
    /// Identifier allocated when this summary was first computed.
    pub id: String,
    /// Upstream status code, whatever it was — 5xx upstream answers are
    /// still successful relays.
    pub status: u16,
    /// Upstream headers collapsed to one value per name.
    pub headers: BTreeMap<String, String>,
    /// Declared upstream body length, `-1` when the upstream did not say.
    pub length: i64,
}

impl ResponseSummary {
    /// Builds a summary from an executed upstream response.
    pub fn from_upstream(id: String, response: &UpstreamResponse) -> Self {
        Self {
            id,
            status: response.status,
            headers: collapse(&response.headers),
            length: response.content_length,
        }
    }
}

/// Collapses a multi-value header sequence to one value per name: the first
/// value in wire order wins, names compared case-insensitively, and the
/// first-seen spelling of the name is the one kept. Later values for the
/// same name are dropped, not concatenated.
fn collapse(headers: &Headers) -> BTreeMap<String, String> {
    let mut collapsed: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers.iter() {
        if collapsed.keys().any(|kept| kept.eq_ignore_ascii_case(name)) {
            continue;
        }
        collapsed.insert(name.to_owned(), value.to_owned());
    }
    collapsed
}
