//! KISS-over-TCP TNC client with tokio mpsc command/notification pattern.
//!
//! The connection loop runs in a dedicated tokio task. External code talks
//! to it through typed channels: commands carry encoded AX.25 frames out,
//! notifications carry decoded KISS payloads (still AX.25 bytes) back in.
//! Reconnection is automatic with exponential backoff; on (re)connect the
//! KISS decoder is reset so stale bytes are discarded up to the next FEND.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use rfmp_shared::kiss;

use crate::carrier::CarrierSense;
use crate::error::NetError;

/// Commands sent *into* the TNC task.
#[derive(Debug)]
pub enum TncCommand {
    /// Transmit an encoded AX.25 frame on KISS port 0.
    SendFrame(Vec<u8>),
    /// Close the connection and stop the task.
    Shutdown,
}

/// Notifications sent *from* the TNC task to the engine.
#[derive(Debug, Clone)]
pub enum TncNotification {
    /// Connection to the TNC established.
    Connected,
    /// Connection lost; the task keeps reconnecting until shut down.
    Disconnected,
    /// A KISS data frame arrived; payload is raw AX.25 bytes.
    Frame(Vec<u8>),
    /// Writing a frame to the TNC failed after it was handed over.
    SendFailed,
}

#[derive(Debug, Clone)]
pub struct TncConfig {
    pub host: String,
    pub port: u16,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl Default for TncConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8001,
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

/// Spawn the TNC client in a background tokio task.
///
/// Returns `(command_tx, notification_rx)`. The `carrier` handle is marked
/// on every receive so the TX scheduler can defer while the channel is busy.
pub fn spawn_tnc(
    config: TncConfig,
    carrier: CarrierSense,
) -> (mpsc::Sender<TncCommand>, mpsc::Receiver<TncNotification>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (notify_tx, notify_rx) = mpsc::channel(256);

    tokio::spawn(run(config, carrier, cmd_rx, notify_tx));

    (cmd_tx, notify_rx)
}

async fn run(
    config: TncConfig,
    carrier: CarrierSense,
    mut cmd_rx: mpsc::Receiver<TncCommand>,
    notify_tx: mpsc::Sender<TncNotification>,
) {
    let mut backoff = config.reconnect_initial;

    loop {
        let stream = tokio::select! {
            conn = TcpStream::connect((config.host.as_str(), config.port)) => conn,
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(TncCommand::Shutdown) | None => {
                        debug!("TNC task shutting down while disconnected");
                        return;
                    }
                    Some(TncCommand::SendFrame(_)) => {
                        // Not connected; the frame stays leased in the queue
                        // and will be retried by the scheduler.
                        let _ = notify_tx.send(TncNotification::SendFailed).await;
                        continue;
                    }
                }
            }
        };

        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                warn!(
                    host = %config.host,
                    port = config.port,
                    error = %e,
                    retry_in = ?backoff,
                    "TNC connection failed"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(config.reconnect_max);
                continue;
            }
        };

        info!(host = %config.host, port = config.port, "connected to TNC");
        backoff = config.reconnect_initial;
        let _ = notify_tx.send(TncNotification::Connected).await;

        let disconnect_for_shutdown =
            serve_connection(stream, &carrier, &mut cmd_rx, &notify_tx).await;
        let _ = notify_tx.send(TncNotification::Disconnected).await;

        if disconnect_for_shutdown {
            return;
        }
        warn!("TNC connection lost, reconnecting");
    }
}

/// Drive one live connection. Returns `true` when the task should stop
/// instead of reconnecting.
async fn serve_connection(
    mut stream: TcpStream,
    carrier: &CarrierSense,
    cmd_rx: &mut mpsc::Receiver<TncCommand>,
    notify_tx: &mpsc::Sender<TncNotification>,
) -> bool {
    // Fresh decoder per connection: anything before the first FEND is stale.
    let mut decoder = kiss::Decoder::new();
    let mut read_buf = [0u8; 2048];

    loop {
        tokio::select! {
            read = stream.read(&mut read_buf) => {
                match read {
                    Ok(0) => {
                        if decoder.finish().is_err() {
                            warn!("TNC stream ended mid-frame");
                        }
                        return false;
                    }
                    Ok(n) => {
                        carrier.mark_activity();
                        for (port, payload) in decoder.push(&read_buf[..n]) {
                            if port != 0 {
                                debug!(port, "ignoring frame on non-zero KISS port");
                                continue;
                            }
                            if notify_tx.send(TncNotification::Frame(payload)).await.is_err() {
                                return true;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "TNC read error");
                        return false;
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(TncCommand::SendFrame(ax25)) => {
                        let encoded = kiss::encode(0, &ax25);
                        if let Err(e) = stream.write_all(&encoded).await {
                            warn!(error = %e, "TNC write error");
                            let _ = notify_tx.send(TncNotification::SendFailed).await;
                            return false;
                        }
                        debug!(len = ax25.len(), "frame written to TNC");
                    }
                    Some(TncCommand::Shutdown) | None => {
                        let _ = stream.shutdown().await;
                        return true;
                    }
                }
            }
        }
    }
}

/// Hand a frame to the TNC task, surfacing task death as an error.
pub async fn send_frame(
    cmd_tx: &mpsc::Sender<TncCommand>,
    ax25: Vec<u8>,
) -> Result<(), NetError> {
    cmd_tx
        .send(TncCommand::SendFrame(ax25))
        .await
        .map_err(|_| NetError::ChannelClosed)
}
