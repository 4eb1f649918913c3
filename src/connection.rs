//! Connection endpoint: reader task, command writer and reply correlation

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn, Instrument};

use crate::{
    command::{CallCommand, EslCommand, ReplyStatus},
    constants::{DEFAULT_TIMEOUT_MS, MAX_EVENT_QUEUE_SIZE, SOCKET_BUF_SIZE},
    error::{EslError, EslResult},
    event::{EslEvent, EventKind, ProtocolKind},
    headers::Headers,
    protocol::{translate, Frame, FrameParser},
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type ReplySender = oneshot::Sender<EslResult<EslEvent>>;

/// Connection status
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionStatus {
    /// Stream is open.
    Connected,
    /// Stream is closed; sends fail with [`EslError::NotConnected`].
    Disconnected(DisconnectReason),
}

/// Reason for disconnection
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// Transport error (io::Error is not Clone, so we store the message)
    IoError(String),
    /// Framing violation; the byte stream can no longer be trusted
    ProtocolError(String),
    /// Peer closed the stream. `unparsed_bytes` counts trailing bytes that
    /// never formed a complete frame.
    ConnectionClosed { unparsed_bytes: usize },
    /// Local side called `end()`
    ClientRequested,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::IoError(msg) => write!(f, "I/O error: {}", msg),
            DisconnectReason::ProtocolError(msg) => write!(f, "protocol error: {}", msg),
            DisconnectReason::ConnectionClosed { unparsed_bytes: 0 } => {
                write!(f, "connection closed")
            }
            DisconnectReason::ConnectionClosed { unparsed_bytes } => write!(
                f,
                "connection closed with {} unparsed bytes",
                unparsed_bytes
            ),
            DisconnectReason::ClientRequested => write!(f, "client requested disconnect"),
        }
    }
}

/// Options for a connection endpoint.
///
/// Fixed at start time. Use [`Default::default()`] for standard settings.
#[derive(Debug, Clone)]
pub struct EslConnectOptions {
    /// Capacity of the mpsc channel delivering events. Default: 1000.
    pub event_queue_size: usize,
    /// Log every received frame at `debug` level. Default: false.
    pub debug: bool,
}

impl Default for EslConnectOptions {
    fn default() -> Self {
        Self {
            event_queue_size: MAX_EVENT_QUEUE_SIZE,
            debug: false,
        }
    }
}

/// The single reply slot.
///
/// Replies answer commands in write order, so both directions are counted:
/// `sent` numbers commands as they hit the wire, `received` numbers replies
/// as they come back. A reply resolves the listener only when their numbers
/// match.
#[derive(Debug, Default)]
struct ReplySlot {
    sent: u64,
    received: u64,
    pending: Option<(u64, ReplySender)>,
    closed: bool,
}

impl ReplySlot {
    /// Number the next command and, if given, make `listener` the active one.
    ///
    /// Fails once the slot is closed, so no listener can outlive the connection.
    fn claim(&mut self, listener: Option<ReplySender>) -> EslResult<u64> {
        if self.closed {
            return Err(EslError::NotConnected);
        }
        self.sent += 1;
        let seq = self.sent;
        if let Some(tx) = listener {
            if let Some((old_seq, old)) = self
                .pending
                .replace((seq, tx))
            {
                trace!("Reply listener for command #{} superseded by #{}", old_seq, seq);
                let _ = old.send(Err(EslError::ReplySuperseded));
            }
        }
        Ok(seq)
    }

    /// Undo a claim whose command never made it onto the wire.
    fn unclaim(&mut self, seq: u64) {
        if self.sent == seq {
            self.sent -= 1;
        }
        if matches!(self.pending, Some((pending_seq, _)) if pending_seq == seq) {
            self.pending = None;
        }
    }

    /// Account for a reply. Returns it back if no listener wants it.
    fn resolve(&mut self, reply: EslEvent) -> Option<EslEvent> {
        self.received += 1;
        match self
            .pending
            .take()
        {
            Some((seq, tx)) if seq == self.received => match tx.send(Ok(reply)) {
                Ok(()) => None,
                Err(Ok(reply)) => Some(reply),
                Err(Err(_)) => None,
            },
            other => {
                self.pending = other;
                Some(reply)
            }
        }
    }

    /// Drop the listener so its future resolves with `ConnectionClosed`.
    fn close(&mut self) {
        self.closed = true;
        self.pending = None;
    }
}

/// Shared state between connection handles and the reader task
struct SharedState {
    replies: Mutex<ReplySlot>,
    status_tx: watch::Sender<ConnectionStatus>,
    /// Wakes the reader task when the local side ends the connection
    shutdown: Notify,
    /// Set when events have been dropped due to a full queue
    event_overflow: AtomicBool,
    /// Total count of dropped events
    dropped_event_count: AtomicU64,
}

impl SharedState {
    fn is_connected(&self) -> bool {
        matches!(
            *self
                .status_tx
                .borrow(),
            ConnectionStatus::Connected
        )
    }

    /// First reason wins.
    fn mark_disconnected(&self, reason: DisconnectReason) -> bool {
        self.status_tx
            .send_if_modified(|status| match status {
                ConnectionStatus::Connected => {
                    *status = ConnectionStatus::Disconnected(reason);
                    true
                }
                ConnectionStatus::Disconnected(_) => false,
            })
    }
}

/// Future for a command reply, returned by [`EslConnection::send_with_reply`].
///
/// Resolves with the correlated reply, with [`EslError::ReplySuperseded`] if a
/// later command took over the reply slot, or with
/// [`EslError::ConnectionClosed`] if the connection ends first.
#[must_use = "a reply future does nothing unless awaited"]
#[derive(Debug)]
pub struct PendingReply {
    rx: oneshot::Receiver<EslResult<EslEvent>>,
}

impl Future for PendingReply {
    type Output = EslResult<EslEvent>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(EslError::ConnectionClosed)))
    }
}

/// Command side of one ESL stream (Clone + Send).
///
/// Writes go through one mutex, which also fixes each command's position in
/// the reply order. The reader task hands a reply to the listener whose
/// position it matches and everything else to the [`EslEventStream`].
#[derive(Clone)]
pub struct EslConnection {
    id: u64,
    writer: Arc<Mutex<BoxedWriter>>,
    shared: Arc<SharedState>,
}

impl std::fmt::Debug for EslConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EslConnection")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Everything the reader task does not route to a reply listener (!Clone).
///
/// Items are `Result<EslEvent, EslError>`:
/// - `Err(EslError::QueueFull)`: events were dropped because the consumer fell
///   behind; [`EslConnection::dropped_event_count`] has the total.
/// - `Err(EslError::Json)`: a `text/event-json` body failed to decode. The
///   connection keeps running.
///
/// The stream ends when the connection does.
pub struct EslEventStream {
    rx: mpsc::Receiver<Result<EslEvent, EslError>>,
    status_rx: watch::Receiver<ConnectionStatus>,
}

impl std::fmt::Debug for EslEventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EslEventStream")
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Non-blocking hand-off to the event stream.
///
/// A full queue drops the item and counts it; the next successful hand-off
/// is preceded by one `QueueFull` marker. Returns false once the stream is gone.
fn dispatch_event(
    event_tx: &mpsc::Sender<Result<EslEvent, EslError>>,
    shared: &SharedState,
    item: Result<EslEvent, EslError>,
) -> bool {
    if shared
        .event_overflow
        .load(Ordering::Relaxed)
    {
        match event_tx.try_send(Err(EslError::QueueFull)) {
            Ok(()) => {
                shared
                    .event_overflow
                    .store(false, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return false,
            Err(mpsc::error::TrySendError::Full(_)) => {}
        }
    }

    match event_tx.try_send(item) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Closed(_)) => false,
        Err(mpsc::error::TrySendError::Full(_)) => {
            shared
                .event_overflow
                .store(true, Ordering::Relaxed);
            shared
                .dropped_event_count
                .fetch_add(1, Ordering::Relaxed);
            warn!("Event queue full, dropping event");
            true
        }
    }
}

/// Per-connection frame routing, owned by the reader task.
struct FrameRouter {
    shared: Arc<SharedState>,
    event_tx: mpsc::Sender<Result<EslEvent, EslError>>,
    events_open: bool,
    debug: bool,
}

impl FrameRouter {
    async fn route(&mut self, frame: Frame) {
        if self.debug {
            debug!(
                "[RECV] {:?} body={:?}",
                frame.headers,
                frame
                    .body
                    .as_deref()
            );
        }

        let event = match translate(frame) {
            Ok(event) => event,
            Err(e) => {
                warn!("Failed to decode event: {}", e);
                self.deliver(Err(e));
                return;
            }
        };

        if event
            .kind()
            .is_reply()
        {
            let unclaimed = self
                .shared
                .replies
                .lock()
                .await
                .resolve(event);
            if let Some(reply) = unclaimed {
                trace!("Reply without listener, delivering as event");
                self.deliver(Ok(reply));
            }
            return;
        }

        if matches!(
            event.kind(),
            EventKind::Protocol(ProtocolKind::DisconnectNotice)
        ) {
            info!(
                "Received disconnect notice ({})",
                event
                    .disposition()
                    .unwrap_or("no disposition")
            );
        }
        self.deliver(Ok(event));
    }

    fn deliver(&mut self, item: Result<EslEvent, EslError>) {
        if !self.events_open {
            return;
        }
        if !dispatch_event(&self.event_tx, &self.shared, item) {
            // Keep reading: replies must still reach their listeners.
            debug!("Event stream dropped, discarding further events");
            self.events_open = false;
        }
    }
}

/// Background reader loop
async fn reader_loop<R>(reader: R, mut router: FrameRouter)
where
    R: AsyncRead + Unpin + Send,
{
    let shared = router
        .shared
        .clone();
    let result = std::panic::AssertUnwindSafe(reader_loop_inner(reader, &mut router));
    let reason = match futures_util::FutureExt::catch_unwind(result).await {
        Ok(reason) => reason,
        Err(_) => {
            tracing::error!("reader task panicked");
            DisconnectReason::IoError("reader task panicked".to_string())
        }
    };

    // Status first, then waiters, then the event stream (router drop).
    if shared.mark_disconnected(reason.clone()) {
        info!("Connection ended: {}", reason);
    }
    shared
        .replies
        .lock()
        .await
        .close();
    drop(router);
}

async fn reader_loop_inner<R>(mut reader: R, router: &mut FrameRouter) -> DisconnectReason
where
    R: AsyncRead + Unpin + Send,
{
    let mut parser = FrameParser::new();
    let mut read_buffer = vec![0u8; SOCKET_BUF_SIZE];

    loop {
        // Drain every complete frame already buffered
        loop {
            match parser.parse_message() {
                Ok(Some(frame)) => {
                    router
                        .route(frame)
                        .await
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Parser error: {}", e);
                    return DisconnectReason::ProtocolError(e.to_string());
                }
            }
        }

        let read_result = tokio::select! {
            _ = router.shared.shutdown.notified() => {
                debug!("Reader stopping on local request");
                return DisconnectReason::ClientRequested;
            }
            result = reader.read(&mut read_buffer) => result,
        };

        match read_result {
            Ok(0) => {
                let unparsed_bytes = parser.buffered_len();
                if unparsed_bytes > 0 {
                    warn!(
                        "Connection closed with {} unparsed bytes (mid-{})",
                        unparsed_bytes,
                        if parser.in_body() { "body" } else { "headers" }
                    );
                } else {
                    info!("Connection closed (EOF)");
                }
                return DisconnectReason::ConnectionClosed { unparsed_bytes };
            }
            Ok(n) => {
                trace!("[RECV] Read {} bytes", n);
                if let Err(e) = parser.add_data(&read_buffer[..n]) {
                    warn!("Buffer error: {}", e);
                    return DisconnectReason::ProtocolError(e.to_string());
                }
            }
            Err(e) => {
                warn!("Read error: {}", e);
                return DisconnectReason::IoError(e.to_string());
            }
        }
    }
}

impl EslConnection {
    /// Start an endpoint over any byte stream.
    ///
    /// Spawns the reader task and returns immediately; nothing is read or
    /// written before this call. Must be called within a Tokio runtime.
    pub fn start<S>(stream: S, options: EslConnectOptions) -> (Self, EslEventStream)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let queue_size = options
            .event_queue_size
            .max(1);

        let (read_half, write_half) = tokio::io::split(stream);

        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connected);
        let shared = Arc::new(SharedState {
            replies: Mutex::new(ReplySlot::default()),
            status_tx,
            shutdown: Notify::new(),
            event_overflow: AtomicBool::new(false),
            dropped_event_count: AtomicU64::new(0),
        });
        let (event_tx, event_rx) = mpsc::channel(queue_size);

        let router = FrameRouter {
            shared: shared.clone(),
            event_tx,
            events_open: true,
            debug: options.debug,
        };
        let span = tracing::info_span!("esl_connection", id);
        tokio::spawn(reader_loop(read_half, router).instrument(span));

        let connection = EslConnection {
            id,
            writer: Arc::new(Mutex::new(Box::new(write_half))),
            shared,
        };
        let events = EslEventStream {
            rx: event_rx,
            status_rx,
        };

        (connection, events)
    }

    /// Process-unique identifier, also carried by the reader task's log span.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Serialize and write a command, numbering it for reply correlation.
    async fn write_command(
        &self,
        command: &EslCommand,
        listener: Option<ReplySender>,
    ) -> EslResult<()> {
        if !self.is_connected() {
            return Err(EslError::NotConnected);
        }
        let wire = command.to_wire_format()?;

        let mut writer = self
            .writer
            .lock()
            .await;
        // end() may have won the race for the writer
        if !self.is_connected() {
            return Err(EslError::NotConnected);
        }

        let seq = self
            .shared
            .replies
            .lock()
            .await
            .claim(listener)?;
        debug!("[SEND] #{} {}", seq, command.log_line());

        let written = async {
            writer
                .write_all(wire.as_bytes())
                .await?;
            writer
                .flush()
                .await
        }
        .await;

        if let Err(e) = written {
            warn!("Write failed: {}", e);
            self.shared
                .replies
                .lock()
                .await
                .unclaim(seq);
            return Err(EslError::Io(e));
        }
        Ok(())
    }

    /// Write a command without registering a reply listener.
    ///
    /// Its reply, when it arrives, is delivered on the event stream.
    pub async fn send(&self, command: EslCommand) -> EslResult<()> {
        self.write_command(&command, None)
            .await
    }

    /// Write a command and make it the connection's reply listener.
    ///
    /// Any previously registered listener resolves with
    /// [`EslError::ReplySuperseded`]. Errors writing the command are returned
    /// directly; the returned future only carries the reply.
    pub async fn send_with_reply(&self, command: EslCommand) -> EslResult<PendingReply> {
        let (tx, rx) = oneshot::channel();
        self.write_command(&command, Some(tx))
            .await?;
        Ok(PendingReply { rx })
    }

    /// Send a command and wait for its reply.
    ///
    /// Failure replies (`-ERR ...`) are returned as `Ok`, like any other
    /// reply; see [`EslEvent::reply_status`].
    pub async fn request(&self, command: EslCommand) -> EslResult<EslEvent> {
        self.send_with_reply(command)
            .await?
            .await
    }

    /// Execute API command, answered by an `api/response`.
    ///
    /// FreeSWITCH blocks the socket during `api`; no events are delivered
    /// until it returns. Use [`bgapi`](Self::bgapi) for long-running commands.
    ///
    /// ```rust,no_run
    /// # async fn example(conn: &freeswitch_esl_engine::EslConnection) -> Result<(), freeswitch_esl_engine::EslError> {
    /// let resp = conn.api("status").await?;
    /// println!("{}", resp.body_text().unwrap_or(""));
    /// # Ok(())
    /// # }
    /// ```
    pub async fn api(&self, command: &str) -> EslResult<EslEvent> {
        self.request(EslCommand::api(command))
            .await
    }

    /// Execute background API command, resolving with its job id.
    ///
    /// The result arrives later as a `BACKGROUND_JOB` event carrying the same
    /// id in [`EslEvent::job_uuid`].
    pub async fn bgapi(&self, command: &str) -> EslResult<String> {
        let reply = self
            .request(EslCommand::bgapi(command))
            .await?;
        if let Some(job_uuid) = reply.reply_job_uuid() {
            return Ok(job_uuid.to_string());
        }

        let reply_text = reply
            .reply_text()
            .unwrap_or("")
            .to_string();
        match reply.reply_status() {
            ReplyStatus::Err => Err(EslError::CommandFailed { reply_text }),
            _ => Err(EslError::UnexpectedReply { reply_text }),
        }
    }

    /// Subscribe to events in JSON format (`event json <names...>`).
    pub async fn event_json(&self, events: &[&str]) -> EslResult<EslEvent> {
        self.request(EslCommand::event_json(events))
            .await
    }

    /// Unsubscribe from specific events.
    pub async fn nixevent(&self, events: &[&str]) -> EslResult<EslEvent> {
        self.request(EslCommand::nixevent(events))
            .await
    }

    /// Unsubscribe from all events.
    pub async fn noevents(&self) -> EslResult<EslEvent> {
        self.request(EslCommand::noevents())
            .await
    }

    /// Only deliver events whose `header` equals `value`.
    pub async fn filter(&self, header: &str, value: &str) -> EslResult<EslEvent> {
        self.request(EslCommand::filter(header, value))
            .await
    }

    /// Remove an event filter.
    ///
    /// Without a value, removes all filters for the given header.
    pub async fn filter_delete(&self, header: &str, value: Option<&str>) -> EslResult<EslEvent> {
        self.request(EslCommand::filter_delete(header, value))
            .await
    }

    /// Fire an event into the switch's event bus.
    pub async fn sendevent(&self, event_name: &str, headers: Headers) -> EslResult<EslEvent> {
        self.request(EslCommand::sendevent(event_name, headers))
            .await
    }

    /// `auth <password>`. The reply is returned whatever its status.
    pub async fn auth(&self, password: &str) -> EslResult<EslEvent> {
        self.request(EslCommand::auth(password))
            .await
    }

    /// `userauth <user>:<password>`.
    pub async fn userauth(&self, user: &str, password: &str) -> EslResult<EslEvent> {
        self.request(EslCommand::userauth(user, password))
            .await
    }

    /// Attach to the call on an outbound socket.
    ///
    /// The reply carries the channel data as a [`Body::Headers`](crate::Body::Headers) body.
    pub async fn connect(&self) -> EslResult<EslEvent> {
        self.request(EslCommand::connect())
            .await
    }

    /// Keep an outbound socket open after hangup until `exit`.
    pub async fn linger(&self) -> EslResult<EslEvent> {
        self.request(EslCommand::linger())
            .await
    }

    /// Ask the switch to close the session.
    pub async fn exit(&self) -> EslResult<EslEvent> {
        self.request(EslCommand::exit())
            .await
    }

    /// Enable log forwarding at the given level (`log/data` events).
    pub async fn log(&self, level: &str) -> EslResult<EslEvent> {
        self.request(EslCommand::log(level))
            .await
    }

    /// Disable log forwarding.
    pub async fn nolog(&self) -> EslResult<EslEvent> {
        self.request(EslCommand::nolog())
            .await
    }

    /// `sendmsg` to the socket's own call (outbound).
    pub async fn sendmsg(&self, args: Headers) -> EslResult<EslEvent> {
        self.request(EslCommand::sendmsg(None, args))
            .await
    }

    /// `sendmsg` to an arbitrary call.
    pub async fn sendmsg_uuid(&self, uuid: &str, args: Headers) -> EslResult<EslEvent> {
        self.request(EslCommand::sendmsg(Some(uuid), args))
            .await
    }

    /// Execute a dialplan application on the socket's own call.
    pub async fn execute(&self, app: &str, arg: Option<&str>) -> EslResult<EslEvent> {
        self.sendmsg(CallCommand::execute(app, arg).to_args())
            .await
    }

    /// Execute a dialplan application on an arbitrary call.
    pub async fn execute_uuid(&self, uuid: &str, app: &str, arg: Option<&str>) -> EslResult<EslEvent> {
        self.sendmsg_uuid(uuid, CallCommand::execute(app, arg).to_args())
            .await
    }

    /// Hang up the socket's own call.
    pub async fn hangup(&self, cause: Option<&str>) -> EslResult<EslEvent> {
        self.sendmsg(CallCommand::hangup(cause).to_args())
            .await
    }

    /// Hang up an arbitrary call.
    pub async fn hangup_uuid(&self, uuid: &str, cause: Option<&str>) -> EslResult<EslEvent> {
        self.sendmsg_uuid(uuid, CallCommand::hangup(cause).to_args())
            .await
    }

    /// Hook the socket's own call media to a socket.
    pub async fn unicast(&self, args: Headers) -> EslResult<EslEvent> {
        self.sendmsg(CallCommand::unicast(args).to_args())
            .await
    }

    /// Hook an arbitrary call's media to a socket.
    pub async fn unicast_uuid(&self, uuid: &str, args: Headers) -> EslResult<EslEvent> {
        self.sendmsg_uuid(uuid, CallCommand::unicast(args).to_args())
            .await
    }

    /// Close the stream now.
    ///
    /// Later sends fail with [`EslError::NotConnected`], a pending reply
    /// resolves with [`EslError::ConnectionClosed`], and the event stream ends.
    /// Calling it again is a no-op.
    pub async fn end(&self) -> EslResult<()> {
        if !self
            .shared
            .mark_disconnected(DisconnectReason::ClientRequested)
        {
            return Ok(());
        }
        info!("Ending connection {}", self.id);

        self.shared
            .shutdown
            .notify_one();
        self.shared
            .replies
            .lock()
            .await
            .close();

        let mut writer = self
            .writer
            .lock()
            .await;
        writer
            .shutdown()
            .await
            .map_err(EslError::Io)
    }

    /// Number of events dropped due to a full event queue.
    pub fn dropped_event_count(&self) -> u64 {
        self.shared
            .dropped_event_count
            .load(Ordering::Relaxed)
    }

    /// Whether the connection is alive (not yet disconnected).
    pub fn is_connected(&self) -> bool {
        self.shared
            .is_connected()
    }

    /// Current connection status snapshot.
    pub fn status(&self) -> ConnectionStatus {
        self.shared
            .status_tx
            .borrow()
            .clone()
    }
}

/// Authentication method for inbound connections.
enum AuthMethod<'a> {
    Password(&'a str),
    User { user: &'a str, password: &'a str },
}

/// Client role: dial the switch and authenticate.
#[derive(Debug)]
#[non_exhaustive]
pub struct EslClient;

/// Dial the switch, bounded by [`DEFAULT_TIMEOUT_MS`].
async fn tcp_connect_with_timeout(host: &str, port: u16) -> EslResult<TcpStream> {
    let tcp_result = timeout(
        Duration::from_millis(DEFAULT_TIMEOUT_MS),
        TcpStream::connect((host, port)),
    )
    .await;

    match tcp_result {
        Ok(Ok(s)) => {
            debug!("[CONNECT] TCP connection established");
            Ok(s)
        }
        Ok(Err(e)) => {
            warn!("[CONNECT] TCP connect failed: {}", e);
            Err(EslError::Io(e))
        }
        Err(_) => {
            warn!(
                "[CONNECT] TCP connect timed out after {}ms",
                DEFAULT_TIMEOUT_MS
            );
            Err(EslError::Timeout {
                timeout_ms: DEFAULT_TIMEOUT_MS,
            })
        }
    }
}

/// Wait for the greeting, then authenticate.
async fn authenticate(
    connection: &EslConnection,
    events: &mut EslEventStream,
    method: AuthMethod<'_>,
) -> EslResult<()> {
    debug!("[AUTH] Waiting for auth request");
    loop {
        match events
            .recv()
            .await
        {
            Some(Ok(event))
                if matches!(event.kind(), EventKind::Protocol(ProtocolKind::AuthRequest)) =>
            {
                break
            }
            Some(Ok(event)) => debug!("[AUTH] Ignoring {} before auth request", event.kind()),
            Some(Err(e)) if e.is_fatal() => return Err(e),
            Some(Err(e)) => warn!("[AUTH] {}", e),
            None => return Err(EslError::ConnectionClosed),
        }
    }

    let command = match method {
        AuthMethod::Password(password) => EslCommand::auth(password),
        AuthMethod::User { user, password } => EslCommand::userauth(user, password),
    };
    let reply = connection
        .request(command)
        .await?;

    if reply.reply_status() != ReplyStatus::Ok {
        return Err(EslError::auth_failed(
            reply
                .reply_text()
                .unwrap_or("Authentication failed"),
        ));
    }

    debug!("Authentication successful");
    Ok(())
}

impl EslClient {
    /// Connect to FreeSWITCH (inbound mode) with password authentication
    pub async fn connect(
        host: &str,
        port: u16,
        password: &str,
    ) -> EslResult<(EslConnection, EslEventStream)> {
        Self::connect_with_options(host, port, password, EslConnectOptions::default()).await
    }

    /// Connect with password authentication and custom options
    pub async fn connect_with_options(
        host: &str,
        port: u16,
        password: &str,
        options: EslConnectOptions,
    ) -> EslResult<(EslConnection, EslEventStream)> {
        info!("Connecting to FreeSWITCH at {}:{}", host, port);
        let stream = tcp_connect_with_timeout(host, port).await?;
        Self::handshake(stream, AuthMethod::Password(password), options).await
    }

    /// Connect with user authentication
    ///
    /// The user must be in the format `user@domain` (e.g., `admin@default`).
    pub async fn connect_with_user(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
    ) -> EslResult<(EslConnection, EslEventStream)> {
        if !user.contains('@') {
            return Err(EslError::auth_failed(format!(
                "Invalid username format '{}': must be user@domain (e.g., admin@default)",
                user
            )));
        }
        info!("Connecting to FreeSWITCH at {}:{} as {}", host, port, user);
        let stream = tcp_connect_with_timeout(host, port).await?;
        Self::handshake(
            stream,
            AuthMethod::User { user, password },
            EslConnectOptions::default(),
        )
        .await
    }

    /// Authenticate over an already-open stream.
    pub async fn connect_stream<S>(
        stream: S,
        password: &str,
        options: EslConnectOptions,
    ) -> EslResult<(EslConnection, EslEventStream)>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::handshake(stream, AuthMethod::Password(password), options).await
    }

    async fn handshake<S>(
        stream: S,
        method: AuthMethod<'_>,
        options: EslConnectOptions,
    ) -> EslResult<(EslConnection, EslEventStream)>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (connection, mut events) = EslConnection::start(stream, options);

        if let Err(e) = authenticate(&connection, &mut events, method).await {
            warn!("Authentication failed: {}", e);
            let _ = connection
                .end()
                .await;
            return Err(e);
        }

        info!("Successfully connected and authenticated to FreeSWITCH");
        Ok((connection, events))
    }
}

impl EslEventStream {
    /// Receive the next event, or None once the connection has ended and
    /// every queued event has been consumed.
    ///
    /// Returns `Err(EslError::QueueFull)` if events were dropped because the
    /// application was not draining events fast enough. This is a one-time
    /// notification per overflow episode; subsequent calls return real events.
    pub async fn recv(&mut self) -> Option<Result<EslEvent, EslError>> {
        self.rx
            .recv()
            .await
    }

    /// Whether the connection is alive (not yet disconnected).
    pub fn is_connected(&self) -> bool {
        matches!(
            *self
                .status_rx
                .borrow(),
            ConnectionStatus::Connected
        )
    }

    /// Current connection status snapshot.
    pub fn status(&self) -> ConnectionStatus {
        self.status_rx
            .borrow()
            .clone()
    }
}

impl futures_util::Stream for EslEventStream {
    type Item = Result<EslEvent, EslError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx
            .poll_recv(cx)
    }
}
