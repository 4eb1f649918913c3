//! ESL framing and message translation

use crate::{
    buffer::EslBuffer,
    constants::{
        CHANNEL_DATA_REPLY_HEADERS, CONTENT_TYPE_API_RESPONSE, CONTENT_TYPE_AUTH_REQUEST,
        CONTENT_TYPE_COMMAND_REPLY, CONTENT_TYPE_DISCONNECT_NOTICE, CONTENT_TYPE_LOG_DATA,
        CONTENT_TYPE_TEXT_EVENT_JSON, CONTENT_TYPE_TEXT_EVENT_PLAIN, EVENT_BODY_KEY,
        HEADER_CONTENT_LENGTH, HEADER_CONTENT_TYPE, HEADER_TERMINATOR, MAX_MESSAGE_SIZE,
    },
    error::{EslError, EslResult},
    event::{Body, EslEvent, EventKind, ProtocolKind},
    headers::{EventHeader, Headers},
};
use tracing::warn;

/// One framed unit: a header block and an optional length-delimited body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Parsed header block
    pub headers: Headers,
    /// Exactly `Content-Length` bytes, when that header is present
    pub body: Option<String>,
}

/// Parser state for handling incomplete messages
#[derive(Debug)]
enum ParseState {
    HeaderCapture,
    BodyCapture { headers: Headers, body_length: usize },
}

/// Incremental frame parser.
///
/// Feed chunks with [`add_data`](Self::add_data) and drain frames with
/// [`parse_message`](Self::parse_message) until it returns `Ok(None)`. Chunk
/// boundaries are irrelevant: header and body bytes are accounted exactly,
/// whatever the split.
pub struct FrameParser {
    buffer: EslBuffer,
    state: ParseState,
}

impl FrameParser {
    /// Create new parser
    pub fn new() -> Self {
        Self {
            buffer: EslBuffer::new(),
            state: ParseState::HeaderCapture,
        }
    }

    /// Add data to the parser buffer
    pub fn add_data(&mut self, data: &[u8]) -> EslResult<()> {
        self.buffer
            .extend_from_slice(data);
        self.buffer
            .check_size_limits()
    }

    /// Bytes buffered but not yet part of an emitted frame.
    ///
    /// Non-zero at end of stream means the peer closed mid-frame.
    pub fn buffered_len(&self) -> usize {
        self.buffer
            .len()
    }

    /// Whether the parser is waiting for the body of a frame whose headers it has seen.
    pub fn in_body(&self) -> bool {
        matches!(self.state, ParseState::BodyCapture { .. })
    }

    /// Try to parse a complete frame from the buffer
    pub fn parse_message(&mut self) -> EslResult<Option<Frame>> {
        loop {
            match std::mem::replace(&mut self.state, ParseState::HeaderCapture) {
                ParseState::HeaderCapture => {
                    let Some(block) = self
                        .buffer
                        .extract_until_pattern(HEADER_TERMINATOR.as_bytes())
                    else {
                        return Ok(None);
                    };
                    let headers = Headers::parse(&String::from_utf8_lossy(&block));

                    match headers.get(HEADER_CONTENT_LENGTH) {
                        Some(length_str) => {
                            let body_length = parse_content_length(length_str)?;
                            self.state = ParseState::BodyCapture {
                                headers,
                                body_length,
                            };
                        }
                        None => {
                            return Ok(Some(Frame {
                                headers,
                                body: None,
                            }))
                        }
                    }
                }
                ParseState::BodyCapture {
                    headers,
                    body_length,
                } => {
                    let Some(body) = self
                        .buffer
                        .extract_bytes(body_length)
                    else {
                        self.state = ParseState::BodyCapture {
                            headers,
                            body_length,
                        };
                        return Ok(None);
                    };
                    return Ok(Some(Frame {
                        headers,
                        body: Some(String::from_utf8_lossy(&body).into_owned()),
                    }));
                }
            }
        }
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_content_length(value: &str) -> EslResult<usize> {
    let length: usize = value
        .trim()
        .parse()
        .map_err(|_| EslError::InvalidHeader {
            header: format!("{}: {}", HEADER_CONTENT_LENGTH, value),
        })?;

    if length > MAX_MESSAGE_SIZE {
        return Err(EslError::protocol_error(format!(
            "Message too large: Content-Length {} exceeds limit {}",
            length, MAX_MESSAGE_SIZE
        )));
    }
    Ok(length)
}

/// Translate a frame into an event according to its `Content-Type`.
///
/// Fails only when a `text/event-json` body is not valid JSON.
pub fn translate(frame: Frame) -> EslResult<EslEvent> {
    let Frame { mut headers, body } = frame;

    let Some(content_type) = headers
        .get(HEADER_CONTENT_TYPE)
        .map(|ct| ct.to_string())
    else {
        warn!("Frame without Content-Type, passing through");
        return Ok(EslEvent::new(
            EventKind::Other(String::new()),
            headers,
            body.map(Body::Text),
        ));
    };

    let protocol = |kind: ProtocolKind, headers: Headers, body: Option<String>| {
        EslEvent::new(EventKind::Protocol(kind), headers, body.map(Body::Text))
    };

    let event = match content_type.as_str() {
        CONTENT_TYPE_AUTH_REQUEST => protocol(ProtocolKind::AuthRequest, headers, body),
        CONTENT_TYPE_COMMAND_REPLY => {
            if headers.get(EventHeader::EventName) == Some("CHANNEL_DATA") {
                // connect reply: channel data arrives flattened into the header block
                let mut reply_headers = Headers::new();
                for name in CHANNEL_DATA_REPLY_HEADERS {
                    if let Some(value) = headers.remove(name) {
                        reply_headers.insert(name, value);
                    }
                }
                EslEvent::new(
                    EventKind::Protocol(ProtocolKind::CommandReply),
                    reply_headers,
                    Some(Body::Headers(headers)),
                )
            } else {
                protocol(ProtocolKind::CommandReply, headers, body)
            }
        }
        CONTENT_TYPE_TEXT_EVENT_JSON => {
            let value: serde_json::Value = serde_json::from_str(
                body.as_deref()
                    .unwrap_or(""),
            )?;
            let name = value
                .get(EventHeader::EventName.as_str())
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            switch_event(name, content_type, headers, Body::Json(value))
        }
        CONTENT_TYPE_TEXT_EVENT_PLAIN => {
            let fields = parse_plain_event_body(
                body.as_deref()
                    .unwrap_or(""),
            );
            let name = fields
                .get(EventHeader::EventName)
                .map(|s| s.to_string());
            switch_event(name, content_type, headers, Body::Headers(fields))
        }
        CONTENT_TYPE_LOG_DATA => protocol(ProtocolKind::LogData, headers, body),
        CONTENT_TYPE_DISCONNECT_NOTICE => protocol(ProtocolKind::DisconnectNotice, headers, body),
        CONTENT_TYPE_API_RESPONSE => protocol(ProtocolKind::ApiResponse, headers, body),
        _ => EslEvent::new(
            EventKind::Other(content_type),
            headers,
            body.map(Body::Text),
        ),
    };

    Ok(event)
}

fn switch_event(name: Option<String>, content_type: String, headers: Headers, body: Body) -> EslEvent {
    let kind = match name {
        Some(name) => EventKind::Switch(name),
        None => {
            warn!("{} without Event-Name", content_type);
            EventKind::Other(content_type)
        }
    };
    EslEvent::new(kind, headers, Some(body))
}

/// Event headers, then an optional inner body after a blank line, kept under `_body`.
fn parse_plain_event_body(body: &str) -> Headers {
    let (header_section, inner_body) = match body.split_once(HEADER_TERMINATOR) {
        Some((headers, rest)) => (headers, Some(rest)),
        None => (body, None),
    };

    let mut fields = Headers::parse(header_section);
    if let Some(inner) = inner_body.filter(|b| !b.is_empty()) {
        fields.insert(EVENT_BODY_KEY, inner);
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(parser: &mut FrameParser) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = parser
            .parse_message()
            .unwrap()
        {
            frames.push(frame);
        }
        frames
    }

    fn frame(headers: &[(&str, &str)], body: Option<&str>) -> Frame {
        Frame {
            headers: headers
                .iter()
                .copied()
                .collect(),
            body: body.map(|b| b.to_string()),
        }
    }

    const STREAM: &str = "Content-Type: auth/request\n\n\
        Content-Type: api/response\nContent-Length: 2\n\nOK\
        Content-Type: command/reply\nReply-Text: +OK accepted\n\n\
        Content-Type: api/response\nContent-Length: 0\n\n\
        Content-Type: log/data\nContent-Length: 1\n\nX\
        Content-Type: text/disconnect-notice\nContent-Disposition: linger\n\n";

    fn expected_stream() -> Vec<Frame> {
        vec![
            frame(&[("Content-Type", "auth/request")], None),
            frame(
                &[("Content-Type", "api/response"), ("Content-Length", "2")],
                Some("OK"),
            ),
            frame(
                &[("Content-Type", "command/reply"), ("Reply-Text", "+OK accepted")],
                None,
            ),
            frame(
                &[("Content-Type", "api/response"), ("Content-Length", "0")],
                Some(""),
            ),
            frame(
                &[("Content-Type", "log/data"), ("Content-Length", "1")],
                Some("X"),
            ),
            frame(
                &[
                    ("Content-Type", "text/disconnect-notice"),
                    ("Content-Disposition", "linger"),
                ],
                None,
            ),
        ]
    }

    #[test]
    fn test_single_chunk_stream() {
        let mut parser = FrameParser::new();
        parser
            .add_data(STREAM.as_bytes())
            .unwrap();
        assert_eq!(parse_all(&mut parser), expected_stream());
        assert_eq!(parser.buffered_len(), 0);
    }

    #[test]
    fn test_split_at_every_offset_matches_single_chunk() {
        let bytes = STREAM.as_bytes();
        for split in 0..=bytes.len() {
            let mut parser = FrameParser::new();
            let mut frames = Vec::new();
            parser
                .add_data(&bytes[..split])
                .unwrap();
            frames.extend(parse_all(&mut parser));
            parser
                .add_data(&bytes[split..])
                .unwrap();
            frames.extend(parse_all(&mut parser));
            assert_eq!(frames, expected_stream(), "split at {}", split);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut parser = FrameParser::new();
        let mut frames = Vec::new();
        for byte in STREAM.as_bytes() {
            parser
                .add_data(std::slice::from_ref(byte))
                .unwrap();
            frames.extend(parse_all(&mut parser));
        }
        assert_eq!(frames, expected_stream());
        assert_eq!(parser.buffered_len(), 0);
    }

    #[test]
    fn test_two_header_only_messages_in_one_chunk() {
        let mut parser = FrameParser::new();
        parser
            .add_data(b"Content-Type: auth/request\n\nContent-Type: command/reply\nReply-Text: +OK\n\n")
            .unwrap();
        let frames = parse_all(&mut parser);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].headers.get("Content-Type"), Some("auth/request"));
        assert_eq!(frames[1].headers.get("Reply-Text"), Some("+OK"));
        assert_eq!(parser.buffered_len(), 0);
    }

    #[test]
    fn test_body_does_not_leak_into_next_headers() {
        // The body ends with what looks like a header terminator.
        let body = "a: b\n\n";
        let data = format!(
            "Content-Type: api/response\nContent-Length: {}\n\n{}Content-Type: auth/request\n\n",
            body.len(),
            body
        );
        let mut parser = FrameParser::new();
        parser
            .add_data(data.as_bytes())
            .unwrap();
        let frames = parse_all(&mut parser);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].body.as_deref(), Some(body));
        assert_eq!(frames[1].headers.len(), 1);
    }

    #[test]
    fn test_large_body_across_many_chunks() {
        let body = "x".repeat(200_000);
        let data = format!(
            "Content-Type: api/response\nContent-Length: {}\n\n{}Content-Type: auth/request\n\n",
            body.len(),
            body
        );
        let mut parser = FrameParser::new();
        let mut frames = Vec::new();
        for chunk in data
            .as_bytes()
            .chunks(4096)
        {
            parser
                .add_data(chunk)
                .unwrap();
            frames.extend(parse_all(&mut parser));
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(
            frames[0]
                .body
                .as_ref()
                .map(|b| b.len()),
            Some(200_000)
        );
        assert_eq!(frames[1].headers.get("Content-Type"), Some("auth/request"));
    }

    #[test]
    fn test_incomplete_body_waits() {
        let mut parser = FrameParser::new();
        parser
            .add_data(b"Content-Type: api/response\nContent-Length: 10\n\ntest")
            .unwrap();
        assert!(parser
            .parse_message()
            .unwrap()
            .is_none());
        assert!(parser.in_body());
        assert_eq!(parser.buffered_len(), 4);
    }

    #[test]
    fn test_leftover_reported() {
        let mut parser = FrameParser::new();
        parser
            .add_data(b"Content-Type: auth/request\n\nContent-Type: comm")
            .unwrap();
        assert_eq!(parse_all(&mut parser).len(), 1);
        assert_eq!(parser.buffered_len(), "Content-Type: comm".len());
    }

    #[test]
    fn test_crlf_header_terminator_not_matched() {
        let mut parser = FrameParser::new();
        parser
            .add_data(b"Content-Type: auth/request\r\n\r\n")
            .unwrap();
        assert!(parser
            .parse_message()
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_oversized_content_length_rejected() {
        let mut parser = FrameParser::new();
        let data = format!(
            "Content-Type: api/response\nContent-Length: {}\n\n",
            MAX_MESSAGE_SIZE + 1
        );
        parser
            .add_data(data.as_bytes())
            .unwrap();
        assert!(parser
            .parse_message()
            .is_err());
    }

    #[test]
    fn test_non_numeric_content_length_rejected() {
        let mut parser = FrameParser::new();
        parser
            .add_data(b"Content-Type: api/response\nContent-Length: abc\n\n")
            .unwrap();
        assert!(matches!(
            parser.parse_message(),
            Err(EslError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn test_percent_decoding_only_with_trigger() {
        let mut parser = FrameParser::new();
        parser
            .add_data(b"Content-Type: command/reply\nReply-Text: %2BOK\nX-Val: a%20b\n\nContent-Type: command/reply\nReply-Text: +OK\nX-Val: a%20b\n\n")
            .unwrap();
        let frames = parse_all(&mut parser);
        assert_eq!(frames[0].headers.get("Reply-Text"), Some("+OK"));
        assert_eq!(frames[0].headers.get("X-Val"), Some("a b"));
        assert_eq!(frames[1].headers.get("X-Val"), Some("a%20b"));
    }

    #[test]
    fn test_translate_protocol_kinds() {
        let cases = [
            ("auth/request", EventKind::Protocol(ProtocolKind::AuthRequest)),
            ("command/reply", EventKind::Protocol(ProtocolKind::CommandReply)),
            ("api/response", EventKind::Protocol(ProtocolKind::ApiResponse)),
            ("log/data", EventKind::Protocol(ProtocolKind::LogData)),
            (
                "text/disconnect-notice",
                EventKind::Protocol(ProtocolKind::DisconnectNotice),
            ),
            ("text/rude-rejection", EventKind::Other("text/rude-rejection".into())),
        ];
        for (content_type, kind) in cases {
            let event = translate(frame(&[("Content-Type", content_type)], Some("body"))).unwrap();
            assert_eq!(event.kind(), &kind);
            assert_eq!(event.body_text(), Some("body"));
        }
    }

    #[test]
    fn test_translate_missing_content_type() {
        let event = translate(frame(&[("X-Only", "1")], None)).unwrap();
        assert_eq!(event.kind(), &EventKind::Other(String::new()));
    }

    #[test]
    fn test_translate_channel_data_reply() {
        let headers = [
            ("Content-Type", "command/reply"),
            ("Reply-Text", "+OK"),
            ("Socket-Mode", "async"),
            ("Control", "full"),
            ("Event-Name", "CHANNEL_DATA"),
            ("Channel-Name", "sofia/internal/1000@example.com"),
            ("Unique-ID", "abcd-1234"),
            ("Caller-Caller-ID-Name", "Test User"),
        ];
        let event = translate(frame(&headers, None)).unwrap();

        assert_eq!(event.kind(), &EventKind::Protocol(ProtocolKind::CommandReply));
        let moved: Vec<&str> = event
            .headers()
            .iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(moved, ["Content-Type", "Reply-Text", "Socket-Mode", "Control"]);
        assert_eq!(event.reply_text(), Some("+OK"));

        let body = event
            .body()
            .and_then(|b| b.as_headers())
            .unwrap();
        for name in ["Content-Type", "Reply-Text", "Socket-Mode", "Control"] {
            assert!(!body.contains(name), "{} should leave the body", name);
        }
        assert_eq!(body.get("Event-Name"), Some("CHANNEL_DATA"));
        assert_eq!(body.get("Unique-ID"), Some("abcd-1234"));
        assert_eq!(body.get("Caller-Caller-ID-Name"), Some("Test User"));
        assert_eq!(event.unique_id(), Some("abcd-1234"));
    }

    #[test]
    fn test_translate_plain_event() {
        let body = "Event-Name: CHANNEL_ANSWER\nUnique-ID: test-uuid\n\n";
        let event = translate(frame(
            &[("Content-Type", "text/event-plain")],
            Some(body),
        ))
        .unwrap();
        assert_eq!(event.kind(), &EventKind::Switch("CHANNEL_ANSWER".into()));
        assert_eq!(event.unique_id(), Some("test-uuid"));
        assert_eq!(event.event_body(), None);
    }

    #[test]
    fn test_translate_plain_event_with_inner_body() {
        let body = "Event-Name: BACKGROUND_JOB\nJob-UUID: abc-123\nContent-Length: 11\n\n+OK Status\n";
        let event = translate(frame(
            &[("Content-Type", "text/event-plain")],
            Some(body),
        ))
        .unwrap();
        assert_eq!(event.name(), "BACKGROUND_JOB");
        assert_eq!(event.job_uuid(), Some("abc-123"));
        assert_eq!(event.event_body(), Some("+OK Status\n"));
    }

    #[test]
    fn test_translate_json_event() {
        let body = r#"{"Event-Name":"CHANNEL_HANGUP","Unique-ID":"u-1","Hangup-Cause":"NORMAL_CLEARING"}"#;
        let event = translate(frame(
            &[("Content-Type", "text/event-json")],
            Some(body),
        ))
        .unwrap();
        assert_eq!(event.kind(), &EventKind::Switch("CHANNEL_HANGUP".into()));
        assert_eq!(event.field("Hangup-Cause"), Some("NORMAL_CLEARING"));
        assert!(event
            .body()
            .and_then(|b| b.as_json())
            .is_some());
    }

    #[test]
    fn test_translate_bad_json_is_reported() {
        let result = translate(frame(
            &[("Content-Type", "text/event-json")],
            Some("{\"Event-Name\": "),
        ));
        assert!(matches!(result, Err(EslError::Json(_))));
    }

    #[test]
    fn test_translate_json_without_event_name() {
        let event = translate(frame(
            &[("Content-Type", "text/event-json")],
            Some(r#"{"Unique-ID":"u-1"}"#),
        ))
        .unwrap();
        assert_eq!(event.kind(), &EventKind::Other("text/event-json".into()));
    }
}
