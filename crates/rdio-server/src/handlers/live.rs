//! Live session socket

use crate::clients::Client;
use crate::state::AppState;
use axum::{
    extract::{
        State,
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use rdio_core::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Upgrade to a live session
#[allow(clippy::unused_async)]
pub async fn upgrade(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| serve_session(socket, state))
}

async fn serve_session(socket: WebSocket, state: Arc<AppState>) {
    let live = &state.config.live;
    let controller = Arc::clone(&state.controller);
    let (client, mut outbound) = Client::new(live.send_queue_size);
    let client_id = client.id();
    controller.register(Arc::clone(&client)).await;

    let (mut sink, mut stream) = socket.split();
    let ping_period = Duration::from_secs(live.ping_interval.max(1));
    let write_timeout = Duration::from_secs(live.write_timeout.max(1));

    let mut writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval_at(Instant::now() + ping_period, ping_period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let frame = tokio::select! {
                queued = outbound.recv() => {
                    let Some(message) = queued else { break };
                    match message.encode() {
                        Ok(text) => WsMessage::Text(text.into()),
                        Err(e) => {
                            warn!(client_id = %client_id, "Dropping unencodable message: {}", e);
                            continue;
                        }
                    }
                }
                _ = ping.tick() => WsMessage::Ping(Vec::new().into()),
            };

            match tokio::time::timeout(write_timeout, sink.send(frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(client_id = %client_id, "Socket write failed: {}", e);
                    break;
                }
                Err(_) => {
                    warn!(client_id = %client_id, "Socket write timed out");
                    break;
                }
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => match Message::decode(&text) {
                    Ok(message) => controller.process_message(&client, message).await,
                    Err(e) => {
                        warn!(client_id = %client_id, "Closing session on bad frame: {}", e);
                        break;
                    }
                },
                Some(Ok(WsMessage::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = &mut writer => break,
        }
    }

    writer.abort();
    controller.unregister(client).await;
    debug!(client_id = %client_id, "Session closed");
}
