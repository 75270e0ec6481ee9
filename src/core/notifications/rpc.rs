use super::CompletionNotifier;
use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::json;
use std::net::SocketAddr;

use crate::rpc::RpcClient;
use crate::rpc::methods::{NOTIFY_UPLOAD_COMPLETE, NotifyAck};

/// Calls `transcoder.notify_upload_complete` on the coordinator's JSON-RPC port.
pub struct RpcNotifier {
    client: RpcClient,
}

impl RpcNotifier {
    pub fn new(coordinator_addr: SocketAddr) -> Self {
        Self {
            client: RpcClient::new(coordinator_addr),
        }
    }
}

#[async_trait]
impl CompletionNotifier for RpcNotifier {
    async fn notify(&self, upload_id: &str) -> Result<()> {
        let ack: NotifyAck = self
            .client
            .call(NOTIFY_UPLOAD_COMPLETE, Some(json!({ "upload_id": upload_id })))
            .await?;

        if ack.status_code != 200 {
            bail!("coordinator answered with status {}", ack.status_code);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "rpc"
    }
}
