//! Throwaway peers for integration tests.

use std::{io, net::SocketAddr};

use kgnet::{
    config::{ExecutorKind, RuntimeConfig},
    handler::{Endpoint, handler_fn},
    packet::{Method, Response},
    router::RouteKey,
    server::{Server, ServerError},
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::oneshot,
};

/// A running echo server; shut down with [`EchoServer::stop`].
pub struct EchoServer {
    /// Bound address.
    pub addr: SocketAddr,
    server: Server,
}

impl EchoServer {
    /// Address as a dialable string.
    #[must_use]
    pub fn address(&self) -> String { self.addr.to_string() }

    /// Server handle.
    #[must_use]
    pub fn server(&self) -> &Server { &self.server }

    /// Close every connection.
    pub async fn stop(self) { self.server.shutdown().await; }
}

fn echo(prefix: &'static str) -> impl Endpoint {
    handler_fn(move |_ctx, mut req| {
        let body = req.packet_mut().body.read_all()?;
        let mut reply = prefix.as_bytes().to_vec();
        reply.extend(body.bytes());
        Ok(Response::for_request(&req).with_body(reply))
    })
}

/// Start a server on an ephemeral loopback port answering RPC `onPing`
/// with `pong:<body>` and HTTP `/echo` with the request body.
///
/// # Errors
///
/// Returns an error if the server cannot be built or bound.
pub async fn spawn_echo_server(config: RuntimeConfig) -> Result<EchoServer, ServerError> {
    let server = Server::builder()
        .config(config)
        .handle(RouteKey::service("", "onPing"), echo("pong:"))?
        .handle(RouteKey::path(Method::Any, "/echo"), echo(""))?
        .build()?;
    let addr = server.listen("127.0.0.1:0").await?;
    Ok(EchoServer { addr, server })
}

/// Runtime configuration with a small callback pool, suited to tests.
#[must_use]
pub fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        executor: ExecutorKind::Pooled { workers: 4 },
        ..RuntimeConfig::default()
    }
}

/// Accept connections and hold them open without reading or replying.
///
/// Connections are dropped when the returned sender is dropped or fired.
///
/// # Errors
///
/// Returns an error if the loopback port cannot be bound.
pub async fn black_hole_listener() -> io::Result<(SocketAddr, oneshot::Sender<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (stop, mut stopped) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let mut held: Vec<TcpStream> = Vec::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => held.push(stream),
                    Err(_) => break,
                },
                _ = &mut stopped => break,
            }
        }
    });
    Ok((addr, stop))
}

/// A loopback address nothing listens on.
///
/// # Errors
///
/// Returns an error if a probe port cannot be bound.
pub fn unused_addr() -> io::Result<SocketAddr> {
    let probe = std::net::TcpListener::bind("127.0.0.1:0")?;
    probe.local_addr()
}
