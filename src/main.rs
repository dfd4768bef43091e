//! Demo binary for `kgnet`.
//!
//! `kgnet serve` answers RPC `onPing` calls and HTTP `/echo` requests;
//! `kgnet ping` sends one RPC call and prints the reply.

mod cli;

use std::time::Duration;

use clap::Parser;
use cli::{Cli, Command};
use kgnet::{
    config::{ExecutorKind, RuntimeConfig, TransportKind},
    prelude::*,
};

fn echo(prefix: &'static str) -> impl Endpoint {
    handler_fn(move |_ctx, mut req| {
        let body = req.packet_mut().body.read_all()?;
        let mut reply = prefix.as_bytes().to_vec();
        reply.extend_from_slice(&body.bytes());
        Ok(Response::for_request(&req).with_body(reply))
    })
}

async fn serve(addr: &str, reactor: bool, workers: Option<usize>) -> std::result::Result<(), ServerError> {
    let mut config = RuntimeConfig::default();
    if reactor {
        config.transport = TransportKind::Reactor { pollers: 0 };
    }
    if let Some(workers) = workers {
        config.executor = ExecutorKind::Pooled { workers };
    }
    Server::builder()
        .config(config)
        .handle(RouteKey::service("", "onPing"), echo("pong:"))?
        .handle(RouteKey::path(Method::Any, "/echo"), echo(""))?
        .build()?
        .run(addr)
        .await
}

async fn ping(addr: &str, message: String, timeout: Duration) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let client = Client::builder().build()?;
    let reply = client
        .call(
            addr,
            Request::new("onPing").with_body(message.as_str()),
            CallOptions::default().call_timeout(timeout),
        )
        .await?;
    client.close().await;
    let Some(mut reply) = reply else {
        return Err("no reply".into());
    };
    let body = reply.body_mut().read_all()?;
    println!(
        "{} {}: {}",
        reply.status_code(),
        reply.status_info(),
        String::from_utf8_lossy(&body.bytes())
    );
    Ok(())
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    // Applications embedding the library install their own subscriber.
    tracing_subscriber::fmt::init();

    match Cli::parse().command {
        Command::Serve { addr, reactor, workers } => serve(&addr, reactor, workers).await?,
        Command::Ping {
            addr,
            message,
            timeout_ms,
        } => ping(&addr, message, Duration::from_millis(timeout_ms)).await?,
    }
    Ok(())
}
