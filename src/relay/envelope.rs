//! The JSON envelope inbound callers POST to describe a request.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A relayed request, described as JSON.
///
/// `method` and `url` are required; `headers` defaults to empty when absent.
/// Unknown fields are tolerated and ignored — callers may carry extra
/// bookkeeping (a `body` field, say) without being rejected, though every
/// byte still counts toward the cache fingerprint, which is the envelope's
/// raw bytes rather than this decoded form.
///
/// # Examples
///
/// ```
/// use relayd::relay::envelope::RequestEnvelope;
///
/// let envelope =
///     RequestEnvelope::decode(br#"{"method":"GET","url":"http://example.com/"}"#).unwrap();
/// assert_eq!(envelope.method, "GET");
/// assert!(envelope.headers.is_empty());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// HTTP method for the outbound request, used verbatim.
    pub method: String,
    /// Absolute target URL.
    pub url: String,
    /// Headers to forward, one value per name.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl RequestEnvelope {
    /// Decodes an envelope from raw JSON bytes.
    ///
    /// # Errors
    ///
    /// Any malformed JSON, a missing `method` or `url`, or a field of the
    /// wrong type.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_full_envelope() {
        let raw = br#"{"method":"POST","url":"http://example.com/a","headers":{"Accept":"*/*"}}"#;
        let envelope = RequestEnvelope::decode(raw).unwrap();
        assert_eq!(envelope.method, "POST");
        assert_eq!(envelope.url, "http://example.com/a");
        assert_eq!(envelope.headers.get("Accept").map(String::as_str), Some("*/*"));
    }

    #[test]
    fn headers_default_to_empty() {
        let envelope =
            RequestEnvelope::decode(br#"{"method":"GET","url":"http://example.com/"}"#).unwrap();
        assert!(envelope.headers.is_empty());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let raw = br#"{"method":"GET","url":"http://example.com/","body":"ignored"}"#;
        let envelope = RequestEnvelope::decode(raw).unwrap();
        assert_eq!(envelope.method, "GET");
    }

    #[test]
    fn missing_url_is_an_error() {
        assert!(RequestEnvelope::decode(br#"{"method":"GET"}"#).is_err());
    }

    #[test]
    fn missing_method_is_an_error() {
        assert!(RequestEnvelope::decode(br#"{"url":"http://example.com/"}"#).is_err());
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(RequestEnvelope::decode(b"{not json").is_err());
        assert!(RequestEnvelope::decode(b"").is_err());
    }

    #[test]
    fn wrong_typed_field_is_an_error() {
        assert!(RequestEnvelope::decode(br#"{"method":7,"url":"http://example.com/"}"#).is_err());
        assert!(
            RequestEnvelope::decode(br#"{"method":"GET","url":"http://x/","headers":["a"]}"#)
                .is_err()
        );
    }
}
