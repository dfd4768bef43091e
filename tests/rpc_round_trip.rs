//! RPC calls between a client and a server over loopback TCP.

use std::sync::Arc;

use futures::future::join_all;
use kgnet::{
    client::{CallOptions, Client},
    handler::{Route, typed},
    packet::{CodecType, Request},
    router::RouteKey,
    server::Server,
};
use kgnet_testing::{TestResult, test_config};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, PartialEq)]
struct Text {
    text: String,
}

async fn pong_server() -> TestResult<(Server, String)> {
    let server = Server::builder()
        .config(test_config())
        .route(
            RouteKey::service("", "onPing"),
            Route::new(typed(|_ctx, msg: Text| {
                Ok(Text {
                    text: format!("pong:{}", msg.text),
                })
            })),
        )?
        .build()?;
    let addr = server.listen("127.0.0.1:0").await?;
    Ok((server, addr.to_string()))
}

#[tokio::test]
async fn json_call_round_trips() -> TestResult {
    let (server, addr) = pong_server().await?;
    let client = Client::builder().config(test_config()).build()?;

    let req = Request::new("onPing").with_value(CodecType::Json, &Text { text: "x".into() })?;
    let mut resp = client
        .call(&addr, req, CallOptions::default())
        .await?
        .ok_or("missing response")?;
    assert!(resp.is_success(), "status {}", resp.status_code());
    assert_eq!(resp.codec(), CodecType::Json);
    let reply: Text = resp.decode()?;
    assert_eq!(reply.text, "pong:x");

    client.close().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn response_sequence_ids_match_requests() -> TestResult {
    let (server, addr) = pong_server().await?;
    let client = Arc::new(Client::builder().config(test_config()).build()?);

    let calls = (0..32).map(|i| {
        let client = Arc::clone(&client);
        let addr = addr.clone();
        async move {
            let mut req = Request::new("onPing").with_value(CodecType::Json, &Text { text: i.to_string() })?;
            req.ident_mut().seq_id = kgnet::caller::next_seq_id();
            let seq_id = req.seq_id();
            let mut resp = client
                .call(&addr, req, CallOptions::default())
                .await?
                .ok_or("missing response")?;
            let reply: Text = resp.decode()?;
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>((seq_id, resp.seq_id(), i, reply.text))
        }
    });
    for outcome in join_all(calls).await {
        let (sent, received, i, text) = outcome?;
        assert_eq!(sent, received);
        assert_eq!(text, format!("pong:{i}"));
    }
    assert_eq!(client.outstanding(), 0);

    client.close().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn bincode_payloads_are_served() -> TestResult {
    let (server, addr) = pong_server().await?;
    let client = Client::builder().config(test_config()).build()?;

    let req = Request::new("onPing").with_value(CodecType::Bincode, &Text { text: "b".into() })?;
    let mut resp = client
        .call(&addr, req, CallOptions::default())
        .await?
        .ok_or("missing response")?;
    assert_eq!(resp.codec(), CodecType::Bincode);
    assert_eq!(resp.decode::<Text>()?.text, "pong:b");

    client.close().await;
    server.shutdown().await;
    Ok(())
}
