//! Per-socket reader and writer tasks

use super::{ConnectionLease, Outbound};
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use sensorhub_common::Envelope;
use std::time::Duration;
use tracing::{debug, warn};

/// Time the writer gets to flush its close frame after the reader stops
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Parse a `?topics=a,b` filter; blank entries are ignored
pub fn parse_topics(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|topic| !topic.is_empty())
        .map(str::to_string)
        .collect()
}

/// Topic filter for a new connection; `None` subscribes to every topic
pub fn topic_filter(raw: Option<&str>) -> Option<Vec<String>> {
    raw.map(parse_topics).filter(|topics| !topics.is_empty())
}

/// Drive one upgraded socket until either side closes
pub async fn serve_socket(socket: WebSocket, lease: ConnectionLease) {
    let id = lease.id();
    let manager = lease.manager().clone();
    let connection = lease.connection().clone();

    lease.activate();
    if let Err(e) = manager.greeting(id) {
        warn!("Connection {} vanished before greeting: {}", id, e);
        return;
    }

    let (mut sink, mut stream) = socket.split();

    let writer_manager = manager.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = connection.queue().recv().await {
            let (message, is_data) = match frame {
                Outbound::Text(text) => (Message::Text(text.to_string()), true),
                Outbound::Ping => (Message::Ping(Vec::new()), false),
            };
            if let Err(e) = sink.send(message).await {
                debug!("Connection {} write failed: {}", id, e);
                return;
            }
            if is_data {
                writer_manager.record_delivered();
            }
        }
        // Queue closed by the manager: say goodbye
        let _ = sink.send(Message::Close(None)).await;
    });

    let writer_done = loop {
        tokio::select! {
            _ = &mut writer => break true,
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if manager.handle_client_message(id, &text).is_err() {
                        break false;
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    manager.touch(id);
                    let _ = manager.send_to(id, &Envelope::error("binary frames are not supported"));
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => manager.touch(id),
                Some(Ok(Message::Close(_))) | None => break false,
                Some(Err(e)) => {
                    debug!("Connection {} read error: {}", id, e);
                    break false;
                }
            }
        }
    };

    manager.disconnect(id);
    if !writer_done && tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }
    // Dropping the lease unregisters the connection
    drop(lease);
}
