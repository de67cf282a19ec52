use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::actor::StruggleEngine;
use crate::hub::{ChannelSink, SubscriberFilter};
use crate::models::InteractionEvent;

/// Frames accepted from collaborators and dashboards. The connection
/// handshake/auth happens upstream; by the time a socket reaches us it is
/// trusted for its course.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Subscribe {
        course_id: String,
        role: Option<String>,
    },
    Unsubscribe,
    Interaction {
        event: InteractionEvent,
    },
}

pub async fn serve(engine: Arc<StruggleEngine>, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("struggle engine listening on {addr}");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(handle_connection(engine.clone(), stream, peer));
                    }
                    Err(err) => warn!(error = %err, "accept failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_connection(engine: Arc<StruggleEngine>, stream: TcpStream, peer: SocketAddr) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(err) => {
            debug!(%peer, error = %err, "websocket handshake failed");
            return;
        }
    };
    debug!(%peer, "connection established");

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(engine.config().send_queue_depth);
    let send_timeout = engine.config().send_timeout;

    // Writer drains the bounded queue onto the socket. One slow send kills
    // only this connection.
    let writer = tokio::spawn(async move {
        while let Some(payload) = out_rx.recv().await {
            match tokio::time::timeout(send_timeout, ws_tx.send(Message::Text(payload))).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!(%peer, error = %err, "websocket send failed");
                    break;
                }
                Err(_) => {
                    warn!(%peer, "send timed out, dropping connection");
                    break;
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut subscription: Option<u64> = None;

    while let Some(incoming) = ws_rx.next().await {
        let message = match incoming {
            Ok(message) => message,
            Err(err) => {
                debug!(%peer, error = %err, "websocket read failed");
                break;
            }
        };

        match message {
            Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Subscribe { course_id, role }) => {
                    if let Some(old) = subscription.take() {
                        engine.hub().unsubscribe(old).await;
                    }
                    let filter = SubscriberFilter {
                        course_id: course_id.clone(),
                        role,
                    };
                    let sink = Arc::new(ChannelSink::new(out_tx.clone()));
                    let id = engine.hub().subscribe(filter, sink).await;
                    subscription = Some(id);

                    let ack = serde_json::json!({
                        "type": "subscribed",
                        "course_id": course_id,
                    });
                    if out_tx.send(ack.to_string()).await.is_err() {
                        break;
                    }
                }
                Ok(ClientFrame::Unsubscribe) => {
                    if let Some(id) = subscription.take() {
                        engine.hub().unsubscribe(id).await;
                    }
                }
                Ok(ClientFrame::Interaction { event }) => {
                    if let Err(err) = engine.record(event).await {
                        let frame = serde_json::json!({
                            "type": "error",
                            "message": err.to_string(),
                        });
                        if out_tx.send(frame.to_string()).await.is_err() {
                            break;
                        }
                    }
                }
                Err(err) => {
                    debug!(%peer, error = %err, "unparseable frame");
                    let frame = serde_json::json!({
                        "type": "error",
                        "message": "unrecognized frame",
                    });
                    if out_tx.send(frame.to_string()).await.is_err() {
                        break;
                    }
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    if let Some(id) = subscription {
        engine.hub().unsubscribe(id).await;
    }
    drop(out_tx);
    let _ = writer.await;
    debug!(%peer, "connection closed");
}
