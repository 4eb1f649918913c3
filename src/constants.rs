//! Protocol constants and configuration values

/// Default FreeSWITCH ESL port for inbound connections
pub const DEFAULT_ESL_PORT: u16 = 8021;

/// Default port FreeSWITCH dials for `socket` (outbound) applications
pub const DEFAULT_OUTBOUND_PORT: u16 = 8040;

/// Socket buffer size for reading from the stream (64KB)
pub const SOCKET_BUF_SIZE: usize = 65536;

/// Initial parser buffer allocation (64KB)
pub const BUF_CHUNK: usize = 64 * 1024;

/// Maximum single message size (8MB) - validates Content-Length header
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Maximum total buffer size (16MB) - safety limit to prevent runaway memory
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Protocol message terminators
pub const HEADER_TERMINATOR: &str = "\n\n";
pub const LINE_TERMINATOR: &str = "\n";

/// Separator between a header name and its value
pub const HEADER_SEPARATOR: &str = ": ";

/// Content-Type header values
pub const CONTENT_TYPE_AUTH_REQUEST: &str = "auth/request";
pub const CONTENT_TYPE_COMMAND_REPLY: &str = "command/reply";
pub const CONTENT_TYPE_API_RESPONSE: &str = "api/response";
pub const CONTENT_TYPE_TEXT_EVENT_PLAIN: &str = "text/event-plain";
pub const CONTENT_TYPE_TEXT_EVENT_JSON: &str = "text/event-json";
pub const CONTENT_TYPE_LOG_DATA: &str = "log/data";
pub const CONTENT_TYPE_DISCONNECT_NOTICE: &str = "text/disconnect-notice";

/// Protocol framing header: message kind.
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
/// Protocol framing header: body length.
pub const HEADER_CONTENT_LENGTH: &str = "Content-Length";
/// Protocol framing header: command reply status.
pub const HEADER_REPLY_TEXT: &str = "Reply-Text";
/// Disconnect notice disposition (`linger` or `disconnect`).
pub const HEADER_CONTENT_DISPOSITION: &str = "Content-Disposition";
/// Outbound `connect` reply: socket mode (`async` / `static`).
pub const HEADER_SOCKET_MODE: &str = "Socket-Mode";
/// Outbound `connect` reply: control level (`full` / `partial`).
pub const HEADER_CONTROL: &str = "Control";

/// Headers moved back out of the body of a malformed `connect` reply.
pub const CHANNEL_DATA_REPLY_HEADERS: [&str; 4] = [
    HEADER_CONTENT_TYPE,
    HEADER_REPLY_TEXT,
    HEADER_SOCKET_MODE,
    HEADER_CONTROL,
];

/// Key under which the inner body of a plain-text event is stored.
pub const EVENT_BODY_KEY: &str = "_body";

/// Prefix of a `bgapi` reply carrying the job identifier.
pub const JOB_UUID_REPLY_PREFIX: &str = "+OK Job-UUID: ";

/// TCP connect timeout in milliseconds (client role only)
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Maximum number of queued events before dropping
pub const MAX_EVENT_QUEUE_SIZE: usize = 1000;
