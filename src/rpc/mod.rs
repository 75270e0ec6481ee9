//! JSON-RPC 2.0 over TCP, the coordinator's control surface.
//!
//! - `protocol`: request/response types and error codes
//! - `transport`: TCP listener with newline-delimited JSON framing
//! - `methods`: method names and the dispatcher
//! - `client`: one-shot client used by the completion notifier and the CLI

pub mod client;
pub mod methods;
mod protocol;
mod transport;

use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

use crate::core::transcode::Coordinator;
use transport::Transport;

pub use client::{ClientError, RpcClient};
pub use methods::MethodHandler;
pub use protocol::{Request, Response, RpcError};

pub struct RpcServer {
    transport: Transport,
}

impl RpcServer {
    /// Bind the listening socket. Port 0 picks a free port; see `local_addr`.
    pub async fn bind(coordinator: Coordinator, bind_addr: SocketAddr) -> anyhow::Result<Self> {
        let handler = MethodHandler::new(coordinator, bind_addr);
        let transport = Transport::bind(bind_addr, handler).await?;
        Ok(Self { transport })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn start(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.transport.listen(shutdown).await
    }
}
