//! FreeSWITCH Event Socket (ESL) protocol engine for Rust
//!
//! This crate implements both sides of FreeSWITCH's Event Socket: dialing the
//! switch to issue commands (inbound), and accepting the per-call connections
//! the switch opens through the `socket` dialplan application (outbound).
//!
//! # Architecture
//!
//! The library uses a split reader/writer design:
//! - [`EslConnection`] (Clone + Send): send commands from any task
//! - [`EslEventStream`]: receive events from a background reader task
//!
//! Replies are correlated positionally: the n-th `command/reply` or
//! `api/response` answers the n-th command written. A connection has one
//! reply slot; a later [`send_with_reply`](EslConnection::send_with_reply)
//! supersedes an earlier one. Replies nobody waits for go to the event stream.
//!
//! The engine never interprets command text. `-ERR` replies are returned
//! like any other; see [`EslEvent::reply_status`].
//!
//! # Examples
//!
//! ## Inbound Connection
//!
//! ```rust,no_run
//! use freeswitch_esl_engine::{EslClient, EslError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), EslError> {
//!     let (conn, mut events) = EslClient::connect("localhost", 8021, "ClueCon").await?;
//!
//!     let response = conn.api("status").await?;
//!     println!("Status: {}", response.body_text().unwrap_or("No body"));
//!
//!     conn.event_json(&["CHANNEL_ANSWER", "CHANNEL_HANGUP"]).await?;
//!     while let Some(Ok(event)) = events.recv().await {
//!         println!("{} {:?}", event.name(), event.unique_id());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Outbound Mode
//!
//! FreeSWITCH connects to *your* application per call. [`CallServer`] runs
//! the attach sequence (`connect`, optional `linger`, `filter Unique-ID`,
//! `event json ALL`) and hands out ready [`Call`]s:
//!
//! ```rust,no_run
//! use freeswitch_esl_engine::{CallMode, CallServer, CallServerOptions, EslError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), EslError> {
//!     let options = CallServerOptions {
//!         mode: CallMode::Sync,
//!         ..Default::default()
//!     };
//!     let mut calls = CallServer::bind("0.0.0.0:8040", options).await?.serve();
//!
//!     while let Some(mut call) = calls.recv().await {
//!         let handle = call.handle();
//!         tokio::spawn(async move {
//!             // Sync mode: resolves once playback has finished
//!             let _ = handle.execute("answer", None).await;
//!             let _ = handle.execute("playback", Some("ivr/ivr-welcome.wav")).await;
//!             let _ = handle.hangup(Some("NORMAL_CLEARING")).await;
//!         });
//!         tokio::spawn(async move {
//!             while let Some(Ok(event)) = call.recv().await {
//!                 println!("{}: {}", event.context().call_id(), event.name());
//!             }
//!         });
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Configure FreeSWITCH to connect to your app:
//! ```xml
//! <action application="socket" data="127.0.0.1:8040 async full"/>
//! ```
//!
//! ## Any byte stream
//!
//! [`EslConnection::start`] takes anything implementing `AsyncRead + AsyncWrite`,
//! so the engine runs just as well over an in-memory pipe:
//!
//! ```rust
//! use freeswitch_esl_engine::{EslConnectOptions, EslConnection};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (local, _switch) = tokio::io::duplex(4096);
//! let (conn, _events) = EslConnection::start(local, EslConnectOptions::default());
//! assert!(conn.is_connected());
//! # }
//! ```

#[macro_use]
mod macros;

pub mod call;
pub mod command;
pub mod connection;
pub mod constants;
pub mod error;
pub mod event;
pub mod headers;
pub mod protocol;
pub mod server;

pub(crate) mod buffer;

pub use call::{
    Call, CallContext, CallEvent, CallHandle, CallMode, CallServer, CallServerOptions, CallState,
    Calls,
};
pub use command::{CallCommand, EslCommand, ReplyStatus};
pub use connection::{
    ConnectionStatus, DisconnectReason, EslClient, EslConnectOptions, EslConnection,
    EslEventStream, PendingReply,
};
pub use constants::{DEFAULT_ESL_PORT, DEFAULT_OUTBOUND_PORT};
pub use error::{EslError, EslResult};
pub use event::{Body, EslEvent, EslEventType, EventKind, ParseEventTypeError, ProtocolKind};
pub use headers::{EventHeader, Headers, ParseEventHeaderError};
pub use protocol::{translate, Frame, FrameParser};
pub use server::EslServer;
