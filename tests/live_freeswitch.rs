//! Integration tests against a live FreeSWITCH instance.
//!
//! These tests require FreeSWITCH ESL on 127.0.0.1:8022 with password ClueCon.
//! Run with: cargo test --test live_freeswitch -- --ignored

use freeswitch_esl_engine::{
    EslClient, EslConnection, EslEvent, EslEventStream, EslEventType, Headers, ReplyStatus,
};
use std::time::Duration;
use tokio::time::Instant;

const ESL_HOST: &str = "127.0.0.1";
const ESL_PORT: u16 = 8022;
const ESL_PASSWORD: &str = "ClueCon";

async fn connect() -> (EslConnection, EslEventStream) {
    EslClient::connect(ESL_HOST, ESL_PORT, ESL_PASSWORD)
        .await
        .expect("failed to connect to FreeSWITCH")
}

/// Wait for the first event matching `pred`, skipping the rest.
async fn wait_for(
    events: &mut EslEventStream,
    within: Duration,
    pred: impl Fn(&EslEvent) -> bool,
) -> Option<EslEvent> {
    let deadline = Instant::now() + within;
    loop {
        let remaining = deadline.checked_duration_since(Instant::now())?;
        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Some(Ok(event))) if pred(&event) => return Some(event),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}

#[tokio::test]
#[ignore]
async fn live_connect_and_status() {
    let (conn, _events) = connect().await;
    assert!(conn.is_connected());

    let resp = conn
        .api("status")
        .await
        .unwrap();
    let body = resp
        .body_text()
        .expect("status should have body");
    assert!(body.contains("UP"), "expected UP in status: {}", body);
}

#[tokio::test]
#[ignore]
async fn live_subscribe_and_recv_heartbeat() {
    let (conn, mut events) = connect().await;

    conn.event_json(&[EslEventType::Heartbeat.as_str()])
        .await
        .unwrap();

    let event = wait_for(&mut events, Duration::from_secs(25), |e| {
        e.is_event_type(EslEventType::Heartbeat)
    })
    .await
    .expect("timeout waiting for heartbeat");
    assert!(event
        .field("Core-UUID")
        .is_some());
}

#[tokio::test]
#[ignore]
async fn live_recv_custom_sendevent() {
    let (conn, mut events) = connect().await;

    conn.event_json(&["CUSTOM", "esl_test::roundtrip"])
        .await
        .unwrap();

    let reply = conn
        .sendevent(
            "CUSTOM",
            Headers::from([
                ("Event-Subclass", "esl_test::roundtrip"),
                ("X-Test-Value", "hello"),
            ]),
        )
        .await
        .unwrap();
    assert_eq!(reply.reply_status(), ReplyStatus::Ok, "{:?}", reply.reply_text());

    let event = wait_for(&mut events, Duration::from_secs(5), |e| {
        e.field("Event-Subclass") == Some("esl_test::roundtrip")
    })
    .await
    .expect("custom event not received");
    assert_eq!(event.field("X-Test-Value"), Some("hello"));
}

#[tokio::test]
#[ignore]
async fn live_reply_status_err() {
    let (conn, _events) = connect().await;

    let reply = conn
        .filter_delete("X-Never-Set-Header", Some("nothing"))
        .await
        .unwrap();
    assert_ne!(reply.reply_status(), ReplyStatus::Other);

    let resp = conn
        .api("nonexistent_command_xyz")
        .await
        .unwrap();
    assert!(resp
        .body_text()
        .unwrap_or("")
        .starts_with("-ERR"));
}

#[tokio::test]
#[ignore]
async fn live_bgapi_job_completes() {
    let (conn, mut events) = connect().await;

    conn.event_json(&[EslEventType::BackgroundJob.as_str()])
        .await
        .unwrap();
    let job_uuid = conn
        .bgapi("version")
        .await
        .unwrap();

    let job = wait_for(&mut events, Duration::from_secs(5), |e| {
        e.job_uuid() == Some(job_uuid.as_str())
    })
    .await
    .expect("BACKGROUND_JOB not received");
    assert!(job
        .event_body()
        .unwrap_or("")
        .contains("FreeSWITCH"));
}

#[tokio::test]
#[ignore]
async fn live_noevents_stops_delivery() {
    let (conn, mut events) = connect().await;

    conn.event_json(&["CUSTOM", "esl_test::noevents"])
        .await
        .unwrap();
    conn.noevents()
        .await
        .unwrap();
    conn.sendevent(
        "CUSTOM",
        Headers::from([("Event-Subclass", "esl_test::noevents")]),
    )
    .await
    .unwrap();

    let event = wait_for(&mut events, Duration::from_secs(2), |e| {
        e.field("Event-Subclass") == Some("esl_test::noevents")
    })
    .await;
    assert!(event.is_none(), "event delivered after noevents");
}

#[tokio::test]
#[ignore]
async fn live_originate_and_kill() {
    let (conn, mut events) = connect().await;

    conn.event_json(&["CHANNEL_CREATE", "CHANNEL_HANGUP_COMPLETE"])
        .await
        .unwrap();
    let resp = conn
        .api("originate null/test &park()")
        .await
        .unwrap();
    let uuid = resp
        .body_text()
        .and_then(|b| b.strip_prefix("+OK "))
        .map(|s| s.trim().to_string())
        .expect("originate returns +OK <uuid>");

    wait_for(&mut events, Duration::from_secs(5), |e| {
        e.is_event_type(EslEventType::ChannelCreate) && e.unique_id() == Some(uuid.as_str())
    })
    .await
    .expect("CHANNEL_CREATE not received");

    conn.api(&format!("uuid_kill {}", uuid))
        .await
        .unwrap();

    wait_for(&mut events, Duration::from_secs(5), |e| {
        e.is_event_type(EslEventType::ChannelHangupComplete) && e.unique_id() == Some(uuid.as_str())
    })
    .await
    .expect("CHANNEL_HANGUP_COMPLETE not received");
}

#[tokio::test]
#[ignore]
async fn live_end_disconnects() {
    let (conn, mut events) = connect().await;
    conn.end()
        .await
        .unwrap();
    assert!(!conn.is_connected());
    assert!(tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .is_none());
}
