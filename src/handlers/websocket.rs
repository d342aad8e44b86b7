use futures_util::sink::SinkExt;
use futures_util::stream::StreamExt;
use log::{debug, info, trace, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use warp::ws::{Message, WebSocket};

use crate::core::connection::Connection;
use crate::core::message_handler::MessageHandler;

// Handle a WebSocket connection until the client goes away
pub async fn handle_ws_client(ws: WebSocket, handler: Arc<MessageHandler>, outbound_buffer: usize) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (tx, mut rx) = mpsc::channel::<Message>(outbound_buffer.max(1));

    // Writer task: the only place that awaits the socket
    tokio::task::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = ws_tx.send(message).await {
                debug!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let connection = Connection::new(tx);
    info!("Client connected: {}", connection.id);

    // Inbound messages of one connection are handled in order
    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(msg) if msg.is_text() => match msg.to_str() {
                Ok(text) => handler.handle_text(&connection, text).await,
                Err(_) => warn!("Undecodable text frame from {}", connection.id),
            },
            Ok(msg) if msg.is_close() => break,
            Ok(_) => trace!("Ignoring non-text frame from {}", connection.id),
            Err(e) => {
                warn!("WebSocket error on {}: {}", connection.id, e);
                break;
            }
        }
    }

    handler.handle_disconnect(&connection).await;
    info!("Client disconnected: {}", connection.id);
}
