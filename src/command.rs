//! Command formatting and reply classification

use crate::{
    constants::{HEADER_SEPARATOR, LINE_TERMINATOR},
    error::{EslError, EslResult},
    headers::Headers,
};
use std::fmt;

/// Validate that a user-provided string contains no newline characters.
///
/// Commands are line-delimited; embedded newlines would allow injection
/// of arbitrary protocol commands.
fn validate_no_newlines(s: &str, context: &str) -> EslResult<()> {
    if s.contains('\n') || s.contains('\r') {
        return Err(EslError::protocol_error(format!(
            "{} must not contain newlines",
            context
        )));
    }
    Ok(())
}

/// Reply-Text classification.
///
/// Purely informational: replies are delivered to callers unchanged whatever
/// their status, and interpreting failures is up to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReplyStatus {
    /// Reply-Text starts with `+OK` or is absent/empty.
    Ok,
    /// Reply-Text starts with `-ERR`.
    Err,
    /// Reply-Text present but matches neither `+OK` nor `-ERR`.
    Other,
}

impl ReplyStatus {
    /// Classify a `Reply-Text` value.
    pub fn from_reply_text(reply_text: Option<&str>) -> Self {
        match reply_text {
            None | Some("") => ReplyStatus::Ok,
            Some(t) if t.starts_with("+OK") => ReplyStatus::Ok,
            Some(t) if t.starts_with("-ERR") => ReplyStatus::Err,
            Some(_) => ReplyStatus::Other,
        }
    }
}

/// One command: a command line plus ordered `key: value` argument lines.
///
/// ```
/// use freeswitch_esl_engine::EslCommand;
///
/// let cmd = EslCommand::new("sendmsg")
///     .arg("call-command", "hangup")
///     .arg("hangup-cause", "NORMAL_CLEARING");
/// assert_eq!(
///     cmd.to_wire_format().unwrap(),
///     "sendmsg\ncall-command: hangup\nhangup-cause: NORMAL_CLEARING\n\n"
/// );
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct EslCommand {
    command: String,
    args: Headers,
}

impl fmt::Debug for EslCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EslCommand")
            .field("command", &self.log_line())
            .field("args", &self.args)
            .finish()
    }
}

impl EslCommand {
    /// Command with no arguments.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Headers::new(),
        }
    }

    /// Command with an argument set, written in its iteration order.
    pub fn with_args(command: impl Into<String>, args: Headers) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    /// Append an argument line.
    pub fn arg(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.args
            .insert(name, value);
        self
    }

    /// The command line.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// The argument lines.
    pub fn args(&self) -> &Headers {
        &self.args
    }

    /// Command line safe for logs (credentials redacted).
    pub fn log_line(&self) -> String {
        let mut words = self
            .command
            .splitn(2, ' ');
        match (words.next(), words.next()) {
            (Some("auth"), Some(_)) => "auth [REDACTED]".to_string(),
            (Some("userauth"), Some(cred)) => {
                let user = cred
                    .split(':')
                    .next()
                    .unwrap_or("");
                format!("userauth {}:[REDACTED]", user)
            }
            _ => self
                .command
                .clone(),
        }
    }

    /// Validate, then serialize: command line, argument lines, blank line.
    pub fn to_wire_format(&self) -> EslResult<String> {
        use std::fmt::Write;

        validate_no_newlines(&self.command, "command")?;
        let mut result = self
            .command
            .clone();
        result.push_str(LINE_TERMINATOR);

        for (name, value) in self
            .args
            .iter()
        {
            validate_no_newlines(name, "argument name")?;
            validate_no_newlines(value, "argument value")?;
            let _ = write!(
                result,
                "{}{}{}{}",
                name, HEADER_SEPARATOR, value, LINE_TERMINATOR
            );
        }

        result.push_str(LINE_TERMINATOR);
        Ok(result)
    }

    /// `api <command>`: blocking API call, answered by `api/response`.
    pub fn api(command: &str) -> Self {
        Self::new(format!("api {}", command))
    }

    /// `bgapi <command>`: background job, answered with a `Job-UUID`.
    pub fn bgapi(command: &str) -> Self {
        Self::new(format!("bgapi {}", command))
    }

    /// `event json <names...>`
    pub fn event_json(events: &[&str]) -> Self {
        Self::new(format!("event json {}", events.join(" ")))
    }

    /// `nixevent <names...>`
    pub fn nixevent(events: &[&str]) -> Self {
        Self::new(format!("nixevent {}", events.join(" ")))
    }

    /// `noevents`
    pub fn noevents() -> Self {
        Self::new("noevents")
    }

    /// `filter <header> <value>`
    pub fn filter(header: &str, value: &str) -> Self {
        Self::new(format!("filter {} {}", header, value))
    }

    /// `filter delete <header> [<value>]`
    pub fn filter_delete(header: &str, value: Option<&str>) -> Self {
        match value {
            Some(value) => Self::new(format!("filter delete {} {}", header, value)),
            None => Self::new(format!("filter delete {}", header)),
        }
    }

    /// `sendevent <name>` with the event headers as arguments.
    pub fn sendevent(event_name: &str, headers: Headers) -> Self {
        Self::with_args(format!("sendevent {}", event_name), headers)
    }

    /// `auth <password>`
    pub fn auth(password: &str) -> Self {
        Self::new(format!("auth {}", password))
    }

    /// `userauth <user>:<password>`
    pub fn userauth(user: &str, password: &str) -> Self {
        Self::new(format!("userauth {}:{}", user, password))
    }

    /// `connect`: first command on an outbound socket, answered with channel data.
    pub fn connect() -> Self {
        Self::new("connect")
    }

    /// `linger`: keep an outbound socket open after hangup until `exit`.
    pub fn linger() -> Self {
        Self::new("linger")
    }

    /// `exit`
    pub fn exit() -> Self {
        Self::new("exit")
    }

    /// `log <level>`
    pub fn log(level: &str) -> Self {
        Self::new(format!("log {}", level))
    }

    /// `nolog`
    pub fn nolog() -> Self {
        Self::new("nolog")
    }

    /// `sendmsg [<uuid>]` carrying a call-control argument set.
    ///
    /// Without a uuid the message targets the socket's own call (outbound).
    pub fn sendmsg(uuid: Option<&str>, args: Headers) -> Self {
        match uuid {
            Some(uuid) => Self::with_args(format!("sendmsg {}", uuid), args),
            None => Self::with_args("sendmsg", args),
        }
    }
}

/// Call-control message carried by `sendmsg`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CallCommand {
    /// Run a dialplan application on the channel.
    Execute {
        app: String,
        arg: Option<String>,
        /// Echoed back as `Application-UUID` on `CHANNEL_EXECUTE_*` events.
        event_uuid: Option<String>,
    },
    /// Hang the channel up.
    Hangup { cause: Option<String> },
    /// Hook the channel's media to a UDP/TCP socket (`local-ip`, `remote-port`, ...).
    Unicast { args: Headers },
}

impl CallCommand {
    /// `execute` of `app` with an optional argument string.
    pub fn execute(app: &str, arg: Option<&str>) -> Self {
        CallCommand::Execute {
            app: app.to_string(),
            arg: arg.map(|a| a.to_string()),
            event_uuid: None,
        }
    }

    /// `hangup` with an optional cause (e.g. `NORMAL_CLEARING`).
    pub fn hangup(cause: Option<&str>) -> Self {
        CallCommand::Hangup {
            cause: cause.map(|c| c.to_string()),
        }
    }

    /// `unicast` with caller-provided arguments.
    pub fn unicast(args: Headers) -> Self {
        CallCommand::Unicast { args }
    }

    /// Argument set for `sendmsg`.
    pub fn to_args(&self) -> Headers {
        match self {
            CallCommand::Execute {
                app,
                arg,
                event_uuid,
            } => {
                let mut args = Headers::new()
                    .with("call-command", "execute")
                    .with("execute-app-name", app.as_str());
                if let Some(arg) = arg {
                    args.insert("execute-app-arg", arg.as_str());
                }
                if let Some(event_uuid) = event_uuid {
                    args.insert("Event-UUID", event_uuid.as_str());
                }
                args
            }
            CallCommand::Hangup { cause } => {
                let mut args = Headers::new().with("call-command", "hangup");
                if let Some(cause) = cause {
                    args.insert("hangup-cause", cause.as_str());
                }
                args
            }
            CallCommand::Unicast { args } => {
                let mut all = Headers::new().with("call-command", "unicast");
                for (name, value) in args.iter() {
                    all.insert(name, value);
                }
                all
            }
        }
    }
}
