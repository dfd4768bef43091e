//! Command line interface for the `kgnet` demo binary.

use clap::{Parser, Subcommand};

/// Command line arguments for the `kgnet` binary.
#[derive(Debug, Parser)]
#[command(name = "kgnet", version, about = "RPC and HTTP/1 networking demo")]
pub struct Cli {
    /// Action to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Demo actions.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve `onPing` over RPC and `/echo` over HTTP/1 until Ctrl+C.
    Serve {
        /// Address to listen on.
        #[arg(short, long, default_value = "127.0.0.1:8888")]
        addr: String,
        /// Drive sockets with `mio` pollers instead of tokio tasks.
        #[arg(long)]
        reactor: bool,
        /// Callback worker threads; defaults to one per CPU.
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Send one `onPing` RPC call and print the reply.
    Ping {
        /// Server address.
        #[arg(short, long, default_value = "127.0.0.1:8888")]
        addr: String,
        /// Request body.
        #[arg(short, long, default_value = "hello")]
        message: String,
        /// Call timeout in milliseconds; zero uses the default.
        #[arg(short, long, default_value_t = 0)]
        timeout_ms: u64,
    },
}
