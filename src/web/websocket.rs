//! Progress feed over a websocket: one `{"percentage": f}` text frame per
//! tick, then `{"done": true}` and a normal close once the upload is gone.

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use serde_json::json;
use tracing::debug;

use super::WebState;
use crate::core::{ChannelOutcome, ProgressChannel, ProgressEvent, ProgressObserver};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<WebState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_progress(socket, state, id))
}

struct SocketObserver {
    socket: WebSocket,
}

#[async_trait]
impl ProgressObserver for SocketObserver {
    async fn emit(&mut self, event: ProgressEvent) -> Result<()> {
        let payload = match event {
            ProgressEvent::Percentage(percentage) => json!({ "percentage": percentage }),
            ProgressEvent::Finished => json!({ "done": true }),
        };
        self.socket
            .send(Message::Text(payload.to_string().into()))
            .await?;
        Ok(())
    }
}

async fn stream_progress(socket: WebSocket, state: WebState, upload_id: String) {
    let channel = ProgressChannel::new(state.sink.registry().clone(), state.progress_interval);
    let mut observer = SocketObserver { socket };

    let outcome = channel.run(&upload_id, &mut observer).await;
    if outcome == ChannelOutcome::Finished {
        let close = Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: "upload finished".into(),
        }));
        let _ = observer.socket.send(close).await;
    }

    debug!(upload_id = %upload_id, ?outcome, "Progress socket closed");
}
