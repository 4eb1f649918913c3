//! ESL event types and structures

use crate::command::ReplyStatus;
use crate::constants::{
    CONTENT_TYPE_API_RESPONSE, CONTENT_TYPE_AUTH_REQUEST, CONTENT_TYPE_COMMAND_REPLY,
    CONTENT_TYPE_DISCONNECT_NOTICE, CONTENT_TYPE_LOG_DATA, EVENT_BODY_KEY,
    HEADER_CONTENT_DISPOSITION, HEADER_REPLY_TEXT, JOB_UUID_REPLY_PREFIX,
};
use crate::headers::{EventHeader, Headers};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol-level message kinds, fixed by `Content-Type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolKind {
    /// `auth/request`: greeting on inbound connections
    AuthRequest,
    /// `command/reply`
    CommandReply,
    /// `api/response`
    ApiResponse,
    /// `log/data`
    LogData,
    /// `text/disconnect-notice`
    DisconnectNotice,
}

impl ProtocolKind {
    /// The `Content-Type` value this kind is decoded from.
    pub fn content_type(&self) -> &'static str {
        match self {
            ProtocolKind::AuthRequest => CONTENT_TYPE_AUTH_REQUEST,
            ProtocolKind::CommandReply => CONTENT_TYPE_COMMAND_REPLY,
            ProtocolKind::ApiResponse => CONTENT_TYPE_API_RESPONSE,
            ProtocolKind::LogData => CONTENT_TYPE_LOG_DATA,
            ProtocolKind::DisconnectNotice => CONTENT_TYPE_DISCONNECT_NOTICE,
        }
    }

    /// Replies answer commands positionally; everything else is unsolicited.
    pub fn is_reply(&self) -> bool {
        matches!(self, ProtocolKind::CommandReply | ProtocolKind::ApiResponse)
    }
}

/// What an event is, used for dispatch.
///
/// Switch events are named by their own `Event-Name` field so applications can
/// match call-state transitions directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Fixed protocol-level message.
    Protocol(ProtocolKind),
    /// Decoded switch event, carrying its `Event-Name`.
    Switch(String),
    /// Unrecognized `Content-Type`, passed through verbatim.
    Other(String),
}

impl EventKind {
    /// Dispatch name: the content type for protocol messages, the event name
    /// for switch events.
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Protocol(kind) => kind.content_type(),
            EventKind::Switch(name) => name,
            EventKind::Other(content_type) => content_type,
        }
    }

    /// Whether this is a command or API reply.
    pub fn is_reply(&self) -> bool {
        matches!(self, EventKind::Protocol(kind) if kind.is_reply())
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized event body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Body {
    /// Raw text, as received.
    Text(String),
    /// Decoded `text/event-json` payload.
    Json(serde_json::Value),
    /// Re-parsed header block (`text/event-plain`, channel data).
    Headers(Headers),
}

impl Body {
    /// Look up a field by name in a header or JSON object body.
    ///
    /// Non-string JSON values are not returned.
    pub fn field(&self, name: &str) -> Option<&str> {
        match self {
            Body::Text(_) => None,
            Body::Json(value) => value
                .get(name)
                .and_then(|v| v.as_str()),
            Body::Headers(headers) => headers.get(name),
        }
    }

    /// The raw text of a [`Body::Text`].
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Body::Text(text) => Some(text),
            _ => None,
        }
    }

    /// The header map of a [`Body::Headers`].
    pub fn as_headers(&self) -> Option<&Headers> {
        match self {
            Body::Headers(headers) => Some(headers),
            _ => None,
        }
    }

    /// The JSON value of a [`Body::Json`].
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Body::Json(value) => Some(value),
            _ => None,
        }
    }
}

define_wire_enum! {
    error_type: ParseEventTypeError,
    /// Well-known FreeSWITCH event names.
    ///
    /// Dispatch never depends on this list: [`EventKind::Switch`] carries the raw
    /// name, so events missing here are still delivered.
    pub enum EslEventType {
        Custom => "CUSTOM",
        ChannelCreate => "CHANNEL_CREATE",
        ChannelDestroy => "CHANNEL_DESTROY",
        ChannelState => "CHANNEL_STATE",
        ChannelCallstate => "CHANNEL_CALLSTATE",
        ChannelAnswer => "CHANNEL_ANSWER",
        ChannelHangup => "CHANNEL_HANGUP",
        ChannelHangupComplete => "CHANNEL_HANGUP_COMPLETE",
        ChannelExecute => "CHANNEL_EXECUTE",
        ChannelExecuteComplete => "CHANNEL_EXECUTE_COMPLETE",
        ChannelHold => "CHANNEL_HOLD",
        ChannelUnhold => "CHANNEL_UNHOLD",
        ChannelBridge => "CHANNEL_BRIDGE",
        ChannelUnbridge => "CHANNEL_UNBRIDGE",
        ChannelProgress => "CHANNEL_PROGRESS",
        ChannelProgressMedia => "CHANNEL_PROGRESS_MEDIA",
        ChannelOutgoing => "CHANNEL_OUTGOING",
        ChannelPark => "CHANNEL_PARK",
        ChannelUnpark => "CHANNEL_UNPARK",
        ChannelData => "CHANNEL_DATA",
        Dtmf => "DTMF",
        BackgroundJob => "BACKGROUND_JOB",
        Heartbeat => "HEARTBEAT",
        PlaybackStart => "PLAYBACK_START",
        PlaybackStop => "PLAYBACK_STOP",
        RecordStart => "RECORD_START",
        RecordStop => "RECORD_STOP",
        /// Subscribe to all events
        All => "ALL",
    }
}

/// Event delivered to listeners: a translated frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EslEvent {
    kind: EventKind,
    headers: Headers,
    body: Option<Body>,
}

impl EslEvent {
    /// Assemble an event from its parts.
    pub fn new(kind: EventKind, headers: Headers, body: Option<Body>) -> Self {
        Self {
            kind,
            headers,
            body,
        }
    }

    /// Dispatch kind.
    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    /// Dispatch name, see [`EventKind::as_str`].
    pub fn name(&self) -> &str {
        self.kind
            .as_str()
    }

    /// Typed switch event name, if this is a switch event with a known name.
    pub fn event_type(&self) -> Option<EslEventType> {
        match &self.kind {
            EventKind::Switch(name) => name
                .parse()
                .ok(),
            _ => None,
        }
    }

    /// Check whether this is a switch event of the given type.
    pub fn is_event_type(&self, event_type: EslEventType) -> bool {
        self.event_type() == Some(event_type)
    }

    /// Frame headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Look up a frame header by name.
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers
            .get(name)
    }

    /// Normalized body.
    pub fn body(&self) -> Option<&Body> {
        self.body
            .as_ref()
    }

    /// Body text for raw-text bodies (`api/response`, `log/data`, ...).
    pub fn body_text(&self) -> Option<&str> {
        self.body
            .as_ref()?
            .as_text()
    }

    /// Look up a field of the event payload.
    ///
    /// For switch events and channel data this reads the body; otherwise the
    /// frame headers.
    pub fn field(&self, name: impl AsRef<str>) -> Option<&str> {
        let name = name.as_ref();
        match &self.body {
            Some(body @ (Body::Headers(_) | Body::Json(_))) => body.field(name),
            _ => self
                .headers
                .get(name),
        }
    }

    /// `Unique-ID` field, falling back to `Caller-Unique-ID`.
    pub fn unique_id(&self) -> Option<&str> {
        self.field(EventHeader::UniqueId)
            .or_else(|| self.field(EventHeader::CallerUniqueId))
    }

    /// `Job-UUID` field of `BACKGROUND_JOB` events.
    pub fn job_uuid(&self) -> Option<&str> {
        self.field(EventHeader::JobUuid)
    }

    /// Inner body of a switch event (the `_body` field).
    pub fn event_body(&self) -> Option<&str> {
        self.field(EVENT_BODY_KEY)
    }

    /// Raw `Reply-Text` header (e.g. `+OK`, `-ERR invalid command`).
    pub fn reply_text(&self) -> Option<&str> {
        self.headers
            .get(HEADER_REPLY_TEXT)
    }

    /// Caller-side classification of `Reply-Text`.
    ///
    /// The engine never acts on this; it only helps callers inspect replies.
    pub fn reply_status(&self) -> ReplyStatus {
        ReplyStatus::from_reply_text(self.reply_text())
    }

    /// Job identifier from a `bgapi` reply (`+OK Job-UUID: <id>`).
    pub fn reply_job_uuid(&self) -> Option<&str> {
        self.reply_text()?
            .strip_prefix(JOB_UUID_REPLY_PREFIX)
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    /// `Content-Disposition` of a disconnect notice.
    pub fn disposition(&self) -> Option<&str> {
        self.headers
            .get(HEADER_CONTENT_DISPOSITION)
    }

    /// Split into parts.
    pub fn into_parts(self) -> (EventKind, Headers, Option<Body>) {
        (self.kind, self.headers, self.body)
    }
}
