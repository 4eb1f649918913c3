//! Call lifecycle controller for outbound sockets
//!
//! Every connection the switch opens carries exactly one call. The controller
//! attaches to it (`connect`), scopes the event feed to that call, hands a
//! ready [`Call`] to the application and reacts to the disconnect notice.
//!
//! ```rust,no_run
//! use freeswitch_esl_engine::{CallServer, CallServerOptions, EslError};
//!
//! # async fn run() -> Result<(), EslError> {
//! let server = CallServer::bind("0.0.0.0:8040", CallServerOptions::default()).await?;
//! let mut calls = server.serve();
//! while let Some(mut call) = calls.recv().await {
//!     tokio::spawn(async move {
//!         let handle = call.handle();
//!         let _ = handle.execute("answer", None).await;
//!         while let Some(Ok(event)) = call.recv().await {
//!             println!("{} {}", event.context().call_id(), event.name());
//!         }
//!     });
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::ToSocketAddrs;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn, Instrument};
use uuid::Uuid;

use crate::{
    command::{CallCommand, EslCommand, ReplyStatus},
    connection::{EslConnectOptions, EslConnection, EslEventStream},
    error::{EslError, EslResult},
    event::{EslEvent, EslEventType, EventKind, ProtocolKind},
    headers::{EventHeader, Headers},
    server::EslServer,
};

/// Pause before retrying after a failed `accept`
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// How `execute` completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallMode {
    /// Resolve with the command reply.
    #[default]
    Async,
    /// Linger on the socket and resolve with the application's
    /// `CHANNEL_EXECUTE_COMPLETE` event.
    Sync,
}

/// Lifecycle of one call connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// `connect` sent, waiting for channel data.
    Connecting,
    /// Running the subscription sequence.
    Handshaking,
    /// Handed to the application, events flowing.
    Active,
    /// Disconnect notice received.
    Disconnecting,
    /// Stream closed.
    Closed,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Connecting => "connecting",
            CallState::Handshaking => "handshaking",
            CallState::Active => "active",
            CallState::Disconnecting => "disconnecting",
            CallState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Options for [`CallServer`] and [`Call::establish`].
#[derive(Debug, Clone, Default)]
pub struct CallServerOptions {
    /// How `execute` completes. Sync mode also lingers the socket.
    pub mode: CallMode,
    /// Applied to each accepted endpoint. `event_queue_size` also bounds
    /// the per-call event channel.
    pub connection: EslConnectOptions,
}

/// Identity of a call, fixed once the `connect` reply arrives.
#[derive(Debug, Clone, PartialEq)]
pub struct CallContext {
    call_id: String,
    channel_data: Headers,
}

impl CallContext {
    /// The channel's `Unique-ID`.
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Channel variables from the `connect` reply.
    pub fn channel_data(&self) -> &Headers {
        &self.channel_data
    }

    /// Look up one channel variable by name.
    pub fn field(&self, name: impl AsRef<str>) -> Option<&str> {
        self.channel_data
            .get(name)
    }
}

/// A switch event scoped to its call.
#[derive(Debug, Clone)]
pub struct CallEvent {
    name: String,
    event: EslEvent,
    context: Arc<CallContext>,
}

impl CallEvent {
    /// Event name (`CHANNEL_ANSWER`, `DTMF`, ...).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The translated switch event.
    pub fn event(&self) -> &EslEvent {
        &self.event
    }

    /// Context of the call this event belongs to.
    pub fn context(&self) -> &Arc<CallContext> {
        &self.context
    }

    /// Unwrap into the underlying event.
    pub fn into_event(self) -> EslEvent {
        self.event
    }
}

/// Sync-mode executions awaiting their completion event, keyed by `Event-UUID`.
#[derive(Default)]
struct Executions {
    closed: bool,
    waiting: HashMap<String, oneshot::Sender<EslEvent>>,
}

struct CallShared {
    mode: CallMode,
    state: watch::Sender<CallState>,
    executions: Mutex<Executions>,
    /// Set when call events have been dropped due to a full queue
    event_overflow: AtomicBool,
    dropped_event_count: AtomicU64,
}

impl CallShared {
    fn set_state(&self, state: CallState) {
        let previous = self
            .state
            .send_replace(state);
        if previous != state {
            debug!("Call state {} -> {}", previous, state);
        }
    }
}

/// Clonable control handle for a call.
#[derive(Clone)]
pub struct CallHandle {
    context: Arc<CallContext>,
    connection: EslConnection,
    shared: Arc<CallShared>,
}

impl fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle")
            .field("call_id", &self.context.call_id)
            .field("state", &self.state())
            .finish()
    }
}

impl CallHandle {
    /// Identity and channel data of the call.
    pub fn context(&self) -> &Arc<CallContext> {
        &self.context
    }

    /// The call's `Unique-ID`.
    pub fn call_id(&self) -> &str {
        self.context
            .call_id()
    }

    /// Mode the call was established in.
    pub fn mode(&self) -> CallMode {
        self.shared.mode
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CallState {
        *self
            .shared
            .state
            .borrow()
    }

    /// Number of call events dropped because the application fell behind.
    pub fn dropped_event_count(&self) -> u64 {
        self.shared
            .dropped_event_count
            .load(Ordering::Relaxed)
    }

    /// The underlying endpoint, for commands not wrapped here.
    pub fn connection(&self) -> &EslConnection {
        &self.connection
    }

    /// Run a dialplan application on this call.
    ///
    /// In [`CallMode::Async`] this resolves with the command reply. In
    /// [`CallMode::Sync`] it resolves with the `CHANNEL_EXECUTE_COMPLETE`
    /// event whose `Application-UUID` matches the command; a `-ERR` reply
    /// fails with [`EslError::CommandFailed`] since no completion will follow.
    pub async fn execute(&self, app: &str, arg: Option<&str>) -> EslResult<EslEvent> {
        if self.shared.mode == CallMode::Async {
            return self
                .connection
                .execute(app, arg)
                .await;
        }

        let event_uuid = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut executions = self
                .shared
                .executions
                .lock()
                .await;
            if executions.closed {
                return Err(EslError::ConnectionClosed);
            }
            executions
                .waiting
                .insert(event_uuid.clone(), tx);
        }

        let command = CallCommand::Execute {
            app: app.to_string(),
            arg: arg.map(|a| a.to_string()),
            event_uuid: Some(event_uuid.clone()),
        };
        let reply = self
            .connection
            .sendmsg(command.to_args())
            .await;

        let failure = match reply {
            Ok(reply) if reply.reply_status() == ReplyStatus::Err => Some(EslError::CommandFailed {
                reply_text: reply
                    .reply_text()
                    .unwrap_or("")
                    .to_string(),
            }),
            Ok(_) => None,
            Err(e) => Some(e),
        };
        if let Some(e) = failure {
            self.shared
                .executions
                .lock()
                .await
                .waiting
                .remove(&event_uuid);
            return Err(e);
        }

        trace!("Waiting for completion of {} ({})", app, event_uuid);
        rx.await
            .map_err(|_| EslError::ConnectionClosed)
    }

    /// Hang the call up.
    pub async fn hangup(&self, cause: Option<&str>) -> EslResult<EslEvent> {
        self.connection
            .hangup(cause)
            .await
    }

    /// Kill the call from the switch side (`bgapi uuid_kill <call_id>`)
    /// without waiting for any reply.
    pub async fn force_disconnect(&self) -> EslResult<()> {
        info!("Force disconnecting call {}", self.call_id());
        self.connection
            .send(EslCommand::bgapi(&format!("uuid_kill {}", self.call_id())))
            .await
    }
}

/// A call in the Active state: its control handle and its event feed.
///
/// Events arrive as `Result<CallEvent, EslError>`; decode errors from the
/// underlying connection are forwarded. If the application falls behind,
/// events are dropped and the next delivered item is `Err(EslError::QueueFull)`.
/// Disconnect handling and sync `execute` completions never wait on the feed.
/// The feed ends when the call's connection closes.
pub struct Call {
    handle: CallHandle,
    events: mpsc::Receiver<Result<CallEvent, EslError>>,
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("handle", &self.handle)
            .finish()
    }
}

/// Run `step`, closing the connection if it fails.
async fn or_end<T>(connection: &EslConnection, step: EslResult<T>) -> EslResult<T> {
    if let Err(e) = &step {
        warn!("Call setup failed: {}", e);
        let _ = connection
            .end()
            .await;
    }
    step
}

impl Call {
    /// Drive a freshly started endpoint through the handshake.
    ///
    /// Sends `connect`, then `linger` (sync mode only), `filter Unique-ID
    /// <call_id>` and `event json ALL`, each awaiting the previous reply.
    /// On failure the connection is closed.
    pub async fn establish(
        connection: EslConnection,
        events: EslEventStream,
        options: &CallServerOptions,
    ) -> EslResult<Call> {
        let (state, _) = watch::channel(CallState::Connecting);
        let shared = Arc::new(CallShared {
            mode: options.mode,
            state,
            executions: Mutex::new(Executions::default()),
            event_overflow: AtomicBool::new(false),
            dropped_event_count: AtomicU64::new(0),
        });

        let reply = or_end(&connection, connection.connect().await).await?;
        // Without the channel data quirk the variables stay in the headers
        let channel_data = reply
            .body()
            .and_then(|body| body.as_headers())
            .cloned()
            .unwrap_or_else(|| {
                reply
                    .headers()
                    .clone()
            });
        let call_id = match channel_data.get(EventHeader::UniqueId) {
            Some(id) => id.to_string(),
            None => {
                return or_end(
                    &connection,
                    Err(EslError::protocol_error("connect reply carries no Unique-ID")),
                )
                .await
            }
        };
        let context = Arc::new(CallContext {
            call_id,
            channel_data,
        });
        let span = tracing::info_span!("esl_call", call_id = %context.call_id);

        async {
            shared.set_state(CallState::Handshaking);
            if shared.mode == CallMode::Sync {
                or_end(&connection, connection.linger().await).await?;
            }
            or_end(
                &connection,
                connection
                    .filter(EventHeader::UniqueId.as_str(), &context.call_id)
                    .await,
            )
            .await?;
            or_end(
                &connection,
                connection
                    .event_json(&[EslEventType::All.as_str()])
                    .await,
            )
            .await?;
            shared.set_state(CallState::Active);
            info!(
                "Call started: {}",
                context
                    .field(EventHeader::ChannelName)
                    .unwrap_or("unknown channel")
            );
            Ok::<(), EslError>(())
        }
        .instrument(span.clone())
        .await?;

        let queue_size = options
            .connection
            .event_queue_size
            .max(1);
        let (tx, rx) = mpsc::channel(queue_size);
        let pump = EventPump {
            connection: connection.clone(),
            shared: shared.clone(),
            context: context.clone(),
            tx,
        };
        tokio::spawn(
            pump.run(events)
                .instrument(span),
        );

        Ok(Call {
            handle: CallHandle {
                context,
                connection,
                shared,
            },
            events: rx,
        })
    }

    /// A clonable control handle for use from other tasks.
    pub fn handle(&self) -> CallHandle {
        self.handle
            .clone()
    }

    /// Identity and channel data of the call.
    pub fn context(&self) -> &Arc<CallContext> {
        self.handle
            .context()
    }

    /// The call's `Unique-ID`.
    pub fn call_id(&self) -> &str {
        self.handle
            .call_id()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CallState {
        self.handle
            .state()
    }

    /// Next call event, or None once the call has closed.
    pub async fn recv(&mut self) -> Option<Result<CallEvent, EslError>> {
        self.events
            .recv()
            .await
    }
}

impl futures_util::Stream for Call {
    type Item = Result<CallEvent, EslError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events
            .poll_recv(cx)
    }
}

/// Per-call task re-emitting connection events as call events.
struct EventPump {
    connection: EslConnection,
    shared: Arc<CallShared>,
    context: Arc<CallContext>,
    tx: mpsc::Sender<Result<CallEvent, EslError>>,
}

impl EventPump {
    async fn run(self, mut events: EslEventStream) {
        while let Some(item) = events
            .recv()
            .await
        {
            match item {
                Ok(event) => self.handle_event(event).await,
                Err(e) => self.emit(Err(e)),
            }
        }

        self.shared
            .set_state(CallState::Closed);
        let mut executions = self
            .shared
            .executions
            .lock()
            .await;
        executions.closed = true;
        executions
            .waiting
            .clear();
        info!("Call closed");
    }

    async fn handle_event(&self, event: EslEvent) {
        let name = match event.kind() {
            EventKind::Switch(name) => name.clone(),
            EventKind::Protocol(ProtocolKind::DisconnectNotice) => {
                self.on_disconnect_notice(&event)
                    .await;
                return;
            }
            other => {
                trace!("Not a call event: {}", other);
                return;
            }
        };

        if event.is_event_type(EslEventType::ChannelExecuteComplete) {
            if let Some(app_uuid) = event.field(EventHeader::ApplicationUuid) {
                let waiter = self
                    .shared
                    .executions
                    .lock()
                    .await
                    .waiting
                    .remove(app_uuid);
                if let Some(tx) = waiter {
                    let _ = tx.send(event.clone());
                }
            }
        }

        self.emit(Ok(CallEvent {
            name,
            event,
            context: self
                .context
                .clone(),
        }));
    }

    async fn on_disconnect_notice(&self, notice: &EslEvent) {
        self.shared
            .set_state(CallState::Disconnecting);
        match notice.disposition() {
            Some("linger") => {
                debug!("Lingering socket, sending exit");
                if let Err(e) = self
                    .connection
                    .send(EslCommand::exit())
                    .await
                {
                    warn!("Failed to send exit: {}", e);
                }
            }
            Some("disconnect") => {
                debug!("Switch disconnecting, closing stream");
                if let Err(e) = self
                    .connection
                    .end()
                    .await
                {
                    debug!("Error closing stream: {}", e);
                }
            }
            other => debug!("Ignoring disconnect notice with disposition {:?}", other),
        }
    }

    /// Non-blocking hand-off to the application.
    ///
    /// The pump keeps consuming the connection no matter how far behind the
    /// application is, or whether it still holds the Call at all.
    fn emit(&self, item: Result<CallEvent, EslError>) {
        let shared = &self.shared;
        if shared
            .event_overflow
            .load(Ordering::Relaxed)
        {
            match self
                .tx
                .try_send(Err(EslError::QueueFull))
            {
                Ok(()) => {
                    shared
                        .event_overflow
                        .store(false, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
                Err(mpsc::error::TrySendError::Full(_)) => {}
            }
        }

        match self
            .tx
            .try_send(item)
        {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                shared
                    .event_overflow
                    .store(true, Ordering::Relaxed);
                shared
                    .dropped_event_count
                    .fetch_add(1, Ordering::Relaxed);
                warn!("Call event queue full, dropping event");
            }
        }
    }
}

/// Accept loop producing ready calls.
#[derive(Debug)]
pub struct CallServer {
    server: EslServer,
    options: CallServerOptions,
}

impl CallServer {
    /// Listen on `addr` for outbound connections from the switch.
    pub async fn bind(addr: impl ToSocketAddrs, options: CallServerOptions) -> EslResult<Self> {
        let server = EslServer::bind_with_options(addr, options.connection.clone()).await?;
        Ok(Self { server, options })
    }

    /// Wrap an already bound endpoint server.
    pub fn from_server(server: EslServer, options: CallServerOptions) -> Self {
        Self { server, options }
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> EslResult<SocketAddr> {
        self.server
            .local_addr()
    }

    /// Start accepting. Each connection is handshaken on its own task; calls
    /// come out of [`Calls`] in the order their handshakes finish.
    ///
    /// Dropping [`Calls`] stops the accept loop.
    pub fn serve(self) -> Calls {
        let (tx, rx) = mpsc::channel(16);
        let accept_task = tokio::spawn(accept_loop(self.server, Arc::new(self.options), tx));
        Calls { rx, accept_task }
    }
}

async fn accept_loop(server: EslServer, options: Arc<CallServerOptions>, tx: mpsc::Sender<Call>) {
    loop {
        let accepted = tokio::select! {
            _ = tx.closed() => {
                debug!("Calls receiver dropped, stopping accept loop");
                return;
            }
            accepted = server.accept() => accepted,
        };

        let (connection, events) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };

        let options = options.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            match Call::establish(connection, events, &options).await {
                Ok(call) => {
                    if let Err(mpsc::error::SendError(call)) = tx
                        .send(call)
                        .await
                    {
                        debug!("No consumer for call {}", call.call_id());
                        let _ = call
                            .handle
                            .connection
                            .end()
                            .await;
                    }
                }
                Err(e) => warn!("Call handshake failed: {}", e),
            }
        });
    }
}

/// Stream of established calls from [`CallServer::serve`].
pub struct Calls {
    rx: mpsc::Receiver<Call>,
    accept_task: JoinHandle<()>,
}

impl fmt::Debug for Calls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Calls")
            .finish_non_exhaustive()
    }
}

impl Calls {
    /// Next established call, or None once the accept loop has stopped.
    pub async fn recv(&mut self) -> Option<Call> {
        self.rx
            .recv()
            .await
    }
}

impl futures_util::Stream for Calls {
    type Item = Call;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx
            .poll_recv(cx)
    }
}

impl Drop for Calls {
    fn drop(&mut self) {
        self.accept_task
            .abort();
    }
}
