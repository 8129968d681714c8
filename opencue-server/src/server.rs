//! WebSocket endpoint.
//!
//! One session per connection. The socket splits into a read pump (raw
//! frames → parsed [`Inbound`] → session queue) and a write pump (session's
//! outbound queue → timestamped envelopes → socket). Dropping either pump
//! closes the session: the read side by dropping the inbound sender, the
//! write side by the session noticing send failures.

use std::sync::Arc;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use opencue_core::proto::messages::{Inbound, Outbound};
use opencue_core::SessionManager;

/// Outbound queue depth per connection.
const OUTBOUND_QUEUE: usize = 256;

/// Accept connections until the listener fails.
pub async fn run(listener: TcpListener, manager: Arc<SessionManager>) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, &manager).await {
                warn!(%peer, "connection ended with error: {e}");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, manager: &Arc<SessionManager>) -> anyhow::Result<()> {
    let peer = stream.peer_addr()?;
    let websocket = tokio_tungstenite::accept_async(stream).await?;
    info!(%peer, "client connected");

    let (mut sink, mut source) = websocket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE);
    let session = manager.spawn_session(outbound_tx);
    let session_id = session.id.clone();

    // Write pump: envelope, stamp, frame.
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let envelope = message.envelope(Some(Utc::now().timestamp_millis()));
            let frame = match serde_json::to_string(&envelope) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("failed to serialise outbound message: {e}");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(frame)).await {
                warn!("socket write failed: {e}");
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Read pump: parse each text frame, forward to the session in order.
    while let Some(frame) = source.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!(%peer, "socket read ended: {e}");
                break;
            }
        };
        match frame {
            Message::Text(raw) => match Inbound::parse(&raw) {
                Ok(message) => {
                    if session.inbound_tx.send(message).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(%peer, "bad message: {e}"),
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => {}
        }
    }

    // Dropping the handle's sender tears the session down.
    drop(session.inbound_tx);
    let _ = session.task.await;
    writer.abort();
    info!(%peer, session = session_id.as_str(), "client disconnected");
    Ok(())
}
