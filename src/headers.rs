//! Ordered header maps and typed header names.

use crate::constants::{HEADER_REPLY_TEXT, HEADER_SEPARATOR};
use indexmap::IndexMap;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};

/// Ordered `name -> value` mapping used for frame headers, plain-text event
/// bodies and command arguments.
///
/// Keys are unique. Inserting an existing key replaces its value but keeps
/// the key's original position, so iteration order is first-insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(IndexMap<String, String>);

impl Headers {
    /// Create an empty header map.
    pub fn new() -> Self {
        Self(IndexMap::new())
    }

    /// Parse a header block: one `Name: value` per line, split on the first `": "`.
    ///
    /// A line without the separator becomes a header with an empty value.
    /// Blank lines are skipped and a trailing `\r` is stripped. Values are
    /// copied verbatim, unless `Reply-Text` starts with `%`, in which case every
    /// value of the block is percent-decoded.
    pub fn parse(block: &str) -> Self {
        let mut headers = Headers::new();

        for line in block.split('\n') {
            let line = line
                .strip_suffix('\r')
                .unwrap_or(line);
            if line.is_empty() {
                continue;
            }
            match line.split_once(HEADER_SEPARATOR) {
                Some((name, value)) => headers.insert(name, value),
                None => headers.insert(line, ""),
            }
        }

        if headers
            .get(HEADER_REPLY_TEXT)
            .is_some_and(|text| text.starts_with('%'))
        {
            headers.percent_decode_values();
        }

        headers
    }

    fn percent_decode_values(&mut self) {
        for value in self
            .0
            .values_mut()
        {
            let decoded = percent_decode_str(value)
                .decode_utf8_lossy()
                .into_owned();
            *value = decoded;
        }
    }

    /// Look up a header by name (case-sensitive).
    pub fn get(&self, name: impl AsRef<str>) -> Option<&str> {
        self.0
            .get(name.as_ref())
            .map(|s| s.as_str())
    }

    /// Whether the header is present.
    pub fn contains(&self, name: impl AsRef<str>) -> bool {
        self.0
            .contains_key(name.as_ref())
    }

    /// Set or overwrite a header.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0
            .insert(name.into(), value.into());
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// Remove a header, preserving the order of the remaining ones.
    pub fn remove(&mut self, name: impl AsRef<str>) -> Option<String> {
        self.0
            .shift_remove(name.as_ref())
    }

    /// Iterate `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.0
            .len()
    }

    /// Whether there are no headers.
    pub fn is_empty(&self) -> bool {
        self.0
            .is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

impl<K: Into<String>, V: Into<String>, const N: usize> From<[(K, V); N]> for Headers {
    fn from(pairs: [(K, V); N]) -> Self {
        pairs
            .into_iter()
            .collect()
    }
}

define_wire_enum! {
    error_type: ParseEventHeaderError,
    /// Header names carried by switch events and channel data.
    ///
    /// These are payload headers, not framing headers like `Content-Type`.
    pub enum EventHeader {
        EventName => "Event-Name",
        EventSubclass => "Event-Subclass",
        UniqueId => "Unique-ID",
        CallerUniqueId => "Caller-Unique-ID",
        JobUuid => "Job-UUID",
        Application => "Application",
        ApplicationData => "Application-Data",
        ApplicationResponse => "Application-Response",
        ApplicationUuid => "Application-UUID",
        ChannelName => "Channel-Name",
        ChannelState => "Channel-State",
        ChannelCallState => "Channel-Call-State",
        AnswerState => "Answer-State",
        CallDirection => "Call-Direction",
        HangupCause => "Hangup-Cause",
        CallerCallerIdName => "Caller-Caller-ID-Name",
        CallerCallerIdNumber => "Caller-Caller-ID-Number",
        CallerDestinationNumber => "Caller-Destination-Number",
        CoreUuid => "Core-UUID",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_on_first_separator() {
        let headers = Headers::parse("Content-Type: command/reply\nReply-Text: +OK a: b");
        assert_eq!(headers.get("Content-Type"), Some("command/reply"));
        assert_eq!(headers.get("Reply-Text"), Some("+OK a: b"));
    }

    #[test]
    fn parse_keeps_insertion_order() {
        let headers = Headers::parse("B: 2\nA: 1\nC: 3\nA: 4");
        let keys: Vec<&str> = headers
            .iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, ["B", "A", "C"]);
        assert_eq!(headers.get("A"), Some("4"));
    }

    #[test]
    fn malformed_line_becomes_empty_header() {
        let headers = Headers::parse("Content-Type: auth/request\ngarbage-line\nX-Colon:novalue");
        assert_eq!(headers.get("garbage-line"), Some(""));
        assert_eq!(headers.get("X-Colon:novalue"), Some(""));
        assert_eq!(headers.len(), 3);
    }

    #[test]
    fn values_are_verbatim() {
        let headers = Headers::parse("X-Spaced:  padded \r\nX-Empty: ");
        assert_eq!(headers.get("X-Spaced"), Some(" padded "));
        assert_eq!(headers.get("X-Empty"), Some(""));
    }

    #[test]
    fn percent_decoding_triggered_by_reply_text() {
        let headers =
            Headers::parse("Reply-Text: %2BOK\nCaller-Caller-ID-Name: Test%20User\nUnique-ID: abc");
        assert_eq!(headers.get("Reply-Text"), Some("+OK"));
        assert_eq!(headers.get("Caller-Caller-ID-Name"), Some("Test User"));
        assert_eq!(headers.get("Unique-ID"), Some("abc"));
    }

    #[test]
    fn no_percent_decoding_without_trigger() {
        let headers = Headers::parse("Reply-Text: +OK\nX-Encoded: a%20b");
        assert_eq!(headers.get("X-Encoded"), Some("a%20b"));

        let headers = Headers::parse("X-Encoded: a%20b");
        assert_eq!(headers.get("X-Encoded"), Some("a%20b"));
    }

    #[test]
    fn invalid_percent_sequence_kept_raw() {
        let headers = Headers::parse("Reply-Text: %2BOK\nX-Bad: %ZZinvalid");
        assert_eq!(headers.get("X-Bad"), Some("%ZZinvalid"));
    }

    #[test]
    fn remove_preserves_order() {
        let mut headers = Headers::from([("A", "1"), ("B", "2"), ("C", "3")]);
        assert_eq!(headers.remove("B"), Some("2".to_string()));
        let keys: Vec<&str> = headers
            .iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, ["A", "C"]);
    }

    #[test]
    fn event_header_wire_names() {
        assert_eq!(EventHeader::UniqueId.to_string(), "Unique-ID");
        assert_eq!(
            "application-uuid".parse::<EventHeader>(),
            Ok(EventHeader::ApplicationUuid)
        );
        let err = "X-Not-Known"
            .parse::<EventHeader>()
            .unwrap_err();
        assert_eq!(err.to_string(), "unknown EventHeader: X-Not-Known");
    }
}
