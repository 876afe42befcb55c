//! Outbound link to the dashboard control listener

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::errors::MaestroError;
use crate::notifier::bus::EventBus;
use crate::notifier::protocol::{encode, ControlMessage};
use crate::notifier::server::forward_control;
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Dashboard link options
#[derive(Debug, Clone)]
pub struct Options {
    /// Dashboard control endpoint
    pub url: Url,

    /// Reconnect backoff
    pub cooldown: CooldownOptions,

    /// Ping interval while connected
    pub heartbeat_interval: Duration,
}

impl Options {
    pub fn for_port(port: u16) -> Result<Self, MaestroError> {
        let url = Url::parse(&format!("ws://127.0.0.1:{}/", port))
            .map_err(|e| MaestroError::NotifierError(e.to_string()))?;
        Ok(Self {
            url,
            cooldown: CooldownOptions::default(),
            heartbeat_interval: Duration::from_secs(30),
        })
    }
}

/// Keep the dashboard link open until shutdown
pub async fn run(
    options: &Options,
    bus: EventBus,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    info!("Dashboard link starting...");

    let mut attempt: u32 = 0;
    loop {
        debug!("Connecting to dashboard: {}", options.url);

        let connection = tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Dashboard link shutting down...");
                return;
            }
            connection = connect_async(options.url.as_str()) => connection,
        };

        match connection {
            Ok((mut ws_stream, _)) => {
                info!("Connected to dashboard at {}", options.url);
                attempt = 0;

                // Subscribe after connecting; a new link only sees new events
                let mut events = bus.subscribe(options.url.to_string());
                let mut heartbeat_tick = tokio::time::interval(options.heartbeat_interval);

                loop {
                    tokio::select! {
                        _ = &mut shutdown_signal => {
                            info!("Dashboard link shutting down connection...");
                            let _ = ws_stream.close(None).await;
                            return;
                        }
                        _ = heartbeat_tick.tick() => {
                            if let Err(e) = ws_stream.send(Message::Ping(Vec::new().into())).await {
                                warn!("Failed to send heartbeat: {}", e);
                                break;
                            }
                        }
                        event = events.recv() => {
                            let Some(event) = event else { return };
                            match encode(&event) {
                                Ok(text) => {
                                    if let Err(e) = ws_stream.send(Message::Text(text.into())).await {
                                        warn!("Failed to send status event: {}", e);
                                        break;
                                    }
                                }
                                Err(e) => error!("Failed to encode status event: {}", e),
                            }
                        }
                        msg = ws_stream.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => {
                                    forward_control(text.as_str(), "dashboard", &control_tx);
                                }
                                Some(Ok(Message::Close(_))) | None => {
                                    warn!("Dashboard closed the link");
                                    break;
                                }
                                Some(Err(e)) => {
                                    error!("Dashboard link error: {}", e);
                                    break;
                                }
                                _ => {}
                            }
                        }
                    }
                }
            }
            Err(e) => {
                debug!("Dashboard not reachable at {}: {}", options.url, e);
            }
        }

        let delay = calc_exp_backoff(&options.cooldown, attempt);
        attempt = attempt.saturating_add(1);
        debug!("Reconnecting to dashboard in {:?}", delay);
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Dashboard link shutting down...");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
