//! WebSocket listener for dashboard clients

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::MaestroError;
use crate::notifier::bus::EventBus;
use crate::notifier::protocol::{decode, encode, ControlMessage};

/// Bind the notifier listener
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, MaestroError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| MaestroError::NotifierError(format!("failed to bind {}: {}", addr, e)))
}

/// Accept dashboard clients until shutdown
pub async fn serve(
    listener: TcpListener,
    bus: EventBus,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    match listener.local_addr() {
        Ok(addr) => info!("Notifier listening on ws://{}", addr),
        Err(e) => warn!("Notifier listening on unknown address: {}", e),
    }

    let clients = CancellationToken::new();
    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Notifier server shutting down...");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let bus = bus.clone();
                        let control_tx = control_tx.clone();
                        let cancel = clients.child_token();
                        tokio::spawn(async move {
                            handle_client(stream, peer, bus, control_tx, cancel).await;
                        });
                    }
                    Err(e) => error!("Failed to accept notifier client: {}", e),
                }
            }
        }
    }
    clients.cancel();
}

async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    bus: EventBus,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    cancel: CancellationToken,
) {
    let mut ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", peer, e);
            return;
        }
    };
    info!("Dashboard client connected: {}", peer);

    let mut events = bus.subscribe(peer.to_string());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_stream.close(None).await;
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                let text = match encode(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to encode status event: {}", e);
                        continue;
                    }
                };
                if let Err(e) = ws_stream.send(Message::Text(text.into())).await {
                    debug!("Failed to send to {}: {}", peer, e);
                    break;
                }
            }
            msg = ws_stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => forward_control(text.as_str(), &peer.to_string(), &control_tx),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("WebSocket error from {}: {}", peer, e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
    info!("Dashboard client disconnected: {}", peer);
}

/// Decode a control frame and hand it to the control loop
pub(crate) fn forward_control(text: &str, from: &str, control_tx: &mpsc::UnboundedSender<ControlMessage>) {
    match decode::<ControlMessage>(text) {
        Ok(ControlMessage::Unknown) => debug!("Ignoring unknown message type from {}", from),
        Ok(message) => {
            debug!("Control message from {}: {:?}", from, message);
            let _ = control_tx.send(message);
        }
        Err(e) => warn!("Rejected message from {}: {}", from, e),
    }
}
