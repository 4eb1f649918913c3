//! Scripted switch side for driving the engine over in-memory or TCP streams.

#![allow(dead_code)]

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub const CALL_ID: &str = "2a7e0a1c-4b5d-4e8f-9a0b-1c2d3e4f5a6b";

/// Engine end and switch end of an in-memory pipe.
pub fn pipe() -> (DuplexStream, MockSwitch<DuplexStream>) {
    let (engine, switch) = tokio::io::duplex(256 * 1024);
    (engine, MockSwitch::new(switch))
}

pub struct MockSwitch<S> {
    stream: S,
    buf: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> MockSwitch<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    /// Read one command block (without its terminating blank line).
    pub async fn read_command(&mut self) -> String {
        tokio::time::timeout(STEP_TIMEOUT, self.next_command())
            .await
            .expect("timed out waiting for a command")
            .expect("engine closed the stream")
    }

    /// Assert the engine writes nothing for `wait`.
    pub async fn assert_silent(&mut self, wait: Duration) {
        if let Ok(command) = tokio::time::timeout(wait, self.next_command()).await {
            panic!("unexpected command: {:?}", command);
        }
    }

    /// Wait for the engine to close its write side. Returns any commands
    /// written before closing.
    pub async fn expect_eof(&mut self) -> Vec<String> {
        tokio::time::timeout(STEP_TIMEOUT, async {
            let mut commands = Vec::new();
            while let Some(command) = self
                .next_command()
                .await
            {
                commands.push(command);
            }
            commands
        })
        .await
        .expect("engine did not close the stream")
    }

    async fn next_command(&mut self) -> Option<String> {
        loop {
            if let Some(pos) = self
                .buf
                .windows(2)
                .position(|w| w == b"\n\n")
            {
                let block: Vec<u8> = self
                    .buf
                    .drain(..pos + 2)
                    .collect();
                return Some(String::from_utf8_lossy(&block[..pos]).into_owned());
            }
            let mut chunk = [0u8; 4096];
            let n = self
                .stream
                .read(&mut chunk)
                .await
                .ok()?;
            if n == 0 {
                return None;
            }
            self.buf
                .extend_from_slice(&chunk[..n]);
        }
    }

    pub async fn send(&mut self, data: &str) {
        self.stream
            .write_all(data.as_bytes())
            .await
            .expect("write to engine");
    }

    pub async fn auth_request(&mut self) {
        self.send("Content-Type: auth/request\n\n")
            .await;
    }

    pub async fn reply(&mut self, reply_text: &str) {
        self.send(&format!(
            "Content-Type: command/reply\nReply-Text: {}\n\n",
            reply_text
        ))
        .await;
    }

    pub async fn api_response(&mut self, body: &str) {
        self.send(&format!(
            "Content-Type: api/response\nContent-Length: {}\n\n{}",
            body.len(),
            body
        ))
        .await;
    }

    pub async fn json_event(&mut self, body: &str) {
        self.send(&format!(
            "Content-Length: {}\nContent-Type: text/event-json\n\n{}",
            body.len(),
            body
        ))
        .await;
    }

    pub async fn plain_event(&mut self, fields: &[(&str, &str)]) {
        let body: String = fields
            .iter()
            .map(|(k, v)| format!("{}: {}\n", k, v))
            .collect::<String>()
            + "\n";
        self.send(&format!(
            "Content-Length: {}\nContent-Type: text/event-plain\n\n{}",
            body.len(),
            body
        ))
        .await;
    }

    pub async fn disconnect_notice(&mut self, disposition: &str) {
        let body = "Disconnected, goodbye.\nSee you at ClueCon! http://www.cluecon.com/\n";
        self.send(&format!(
            "Content-Type: text/disconnect-notice\nController-Session: {}\nContent-Disposition: {}\nContent-Length: {}\n\n{}",
            CALL_ID,
            disposition,
            body.len(),
            body
        ))
        .await;
    }

    /// The `connect` reply: channel variables flattened into the header block.
    pub async fn channel_data(&mut self, call_id: Option<&str>) {
        let mut data = String::from(
            "Content-Type: command/reply\nReply-Text: +OK\nSocket-Mode: async\nControl: full\nEvent-Name: CHANNEL_DATA\n",
        );
        if let Some(id) = call_id {
            data.push_str(&format!("Unique-ID: {}\n", id));
        }
        data.push_str(
            "Channel-Name: sofia/internal/1000%40example.com\nCaller-Caller-ID-Number: 1000\nCaller-Destination-Number: 9999\n\n",
        );
        self.send(&data)
            .await;
    }

    /// Answer the outbound attach sequence.
    pub async fn accept_attach(&mut self, sync: bool) {
        assert_eq!(self.read_command().await, "connect");
        self.channel_data(Some(CALL_ID))
            .await;
        if sync {
            assert_eq!(self.read_command().await, "linger");
            self.reply("+OK will linger")
                .await;
        }
        assert_eq!(
            self.read_command()
                .await,
            format!("filter Unique-ID {}", CALL_ID)
        );
        self.reply(&format!("+OK filter added. [Unique-ID]=[{}]", CALL_ID))
            .await;
        assert_eq!(self.read_command().await, "event json ALL");
        self.reply("+OK event listener enabled json")
            .await;
    }

    /// Close the switch side.
    pub async fn hang_up(mut self) {
        let _ = self
            .stream
            .shutdown()
            .await;
    }
}
