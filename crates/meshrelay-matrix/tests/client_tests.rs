//! MatrixClient against a canned HTTP responder
//!
//! Each test binds a local listener that answers one request with a fixed
//! response and hands back the raw request text for inspection.

use serde_json::json;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use meshrelay_core::OutboundChat;
use meshrelay_matrix::{message_content, MatrixApi, MatrixClient, MatrixError};

async fn respond_once(status: &str, body: &str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let response = format!(
        "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
            if n == 0 || request_complete(&request) {
                break;
            }
        }
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.ok();
        String::from_utf8_lossy(&request).into_owned()
    });
    (base, handle)
}

fn request_complete(request: &[u8]) -> bool {
    let text = String::from_utf8_lossy(request);
    let Some((head, body)) = text.split_once("\r\n\r\n") else {
        return false;
    };
    let length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    body.len() >= length
}

#[tokio::test]
async fn test_whoami_sends_bearer_token() {
    let (base, server) = respond_once("200 OK", r#"{"user_id":"@relay:example.org"}"#).await;
    let client = MatrixClient::new(&base, "secret-token").unwrap();

    assert_eq!(client.whoami().await.unwrap(), "@relay:example.org");
    let request = server.await.unwrap();
    assert!(request.starts_with("GET /_matrix/client/v3/account/whoami "));
    assert!(request.to_ascii_lowercase().contains("authorization: bearer secret-token"));
}

#[tokio::test]
async fn test_send_event_puts_content() {
    let (base, server) = respond_once("200 OK", r#"{"event_id":"$new"}"#).await;
    let client = MatrixClient::new(&base, "t").unwrap();

    let mut message = OutboundChat::text("ALI[Home]: hi");
    message.reply_to = Some("$orig".into());
    let event_id = client
        .send_event("!room:example.org", "m.room.message", message_content(&message))
        .await
        .unwrap();
    assert_eq!(event_id, "$new");

    let request = server.await.unwrap();
    assert!(request.starts_with("PUT /_matrix/client/v3/rooms/!room:example.org/send/m.room.message/"));
    let (_, body) = request.split_once("\r\n\r\n").unwrap();
    let body: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(body["body"], "ALI[Home]: hi");
    assert_eq!(body["m.relates_to"], json!({"m.in_reply_to": {"event_id": "$orig"}}));
}

#[tokio::test]
async fn test_error_document_is_parsed() {
    let (base, _server) = respond_once(
        "403 Forbidden",
        r#"{"errcode":"M_FORBIDDEN","error":"You are not invited to this room."}"#,
    )
    .await;
    let client = MatrixClient::new(&base, "t").unwrap();

    let err = client.join("!private:example.org").await.unwrap_err();
    match err {
        MatrixError::Api { status, errcode, message } => {
            assert_eq!(status, 403);
            assert_eq!(errcode, "M_FORBIDDEN");
            assert!(message.contains("not invited"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_missing_display_name_is_none() {
    let (base, _server) = respond_once("404 Not Found", r#"{"errcode":"M_NOT_FOUND","error":"Profile not found"}"#).await;
    let client = MatrixClient::new(&base, "t").unwrap();
    assert_eq!(client.display_name("@ghost:example.org").await.unwrap(), None);
}

#[tokio::test]
async fn test_sync_passes_token_and_timeout() {
    let body = json!({
        "next_batch": "s9",
        "rooms": {"join": {"!room:example.org": {"timeline": {"events": [
            {"event_id": "$1", "sender": "@a:example.org", "type": "m.room.message",
             "content": {"msgtype": "m.text", "body": "hello"}}
        ]}}}}
    })
    .to_string();
    let (base, server) = respond_once("200 OK", &body).await;
    let client = MatrixClient::new(&base, "t").unwrap();

    let sync = client.sync(Some("s8"), Duration::from_secs(5)).await.unwrap();
    assert_eq!(sync.next_batch, "s9");
    assert_eq!(sync.units_for(["!room:example.org"]).len(), 1);

    let request = server.await.unwrap();
    let request_line = request.lines().next().unwrap();
    assert!(request_line.contains("timeout=5000"));
    assert!(request_line.contains("since=s8"));
}

#[tokio::test]
async fn test_unreachable_homeserver_is_retriable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let client = MatrixClient::new(&base, "t").unwrap();
    let err = client.whoami().await.unwrap_err();
    assert!(err.is_retriable());
}
