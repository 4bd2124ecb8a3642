//! TCP listener for payment terminal notifications
//!
//! The terminal bridge pushes transaction state changes as text lines:
//! "PAY <transaction_id> <COMPLETED|FAILED|CANCELLED>"
//! Notifications are forwarded to the pipeline, which routes them to the
//! owning session.

use crate::domain::types::{PaymentState, PaymentUpdate};
use crate::infra::metrics::Metrics;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Payment listener configuration
#[derive(Debug, Clone)]
pub struct PaymentListenerConfig {
    pub port: u16,
    pub enabled: bool,
}

impl Default for PaymentListenerConfig {
    fn default() -> Self {
        Self { port: 25901, enabled: true }
    }
}

/// Start the payment notification TCP listener
///
/// Listens for connections from the terminal bridge and forwards updates
/// to the pipeline. Updates are sent via try_send to avoid blocking -
/// drops are counted in metrics.
pub async fn start_payment_listener(
    config: PaymentListenerConfig,
    update_tx: mpsc::Sender<PaymentUpdate>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if !config.enabled {
        info!("payment_listener_disabled");
        return Ok(());
    }

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;

    info!(port = %config.port, "payment_listener_started");

    loop {
        tokio::select! {
            // Check for shutdown
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("payment_listener_shutdown");
                    return Ok(());
                }
            }
            // Accept new connections
            result = listener.accept() => {
                match result {
                    Ok((socket, addr)) => {
                        let tx = update_tx.clone();
                        let m = metrics.clone();
                        tokio::spawn(async move {
                            handle_terminal_connection(socket, addr, tx, m).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "payment_listener_accept_failed");
                    }
                }
            }
        }
    }
}

async fn handle_terminal_connection(
    socket: tokio::net::TcpStream,
    addr: SocketAddr,
    update_tx: mpsc::Sender<PaymentUpdate>,
    metrics: Arc<Metrics>,
) {
    let peer_ip = addr.ip().to_string();
    debug!(ip = %peer_ip, "terminal_connection_accepted");

    let reader = BufReader::new(socket);
    let mut lines = reader.lines();

    // Rate-limit drop warnings to 1 per second
    let mut last_drop_warn = Instant::now() - Duration::from_secs(2);

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();

        let Some(update) = parse_payment_line(line) else {
            if !line.is_empty() {
                debug!(peer_ip = %peer_ip, line = %line, "terminal_unknown_message");
            }
            continue;
        };

        info!(
            transaction_id = %update.transaction_id,
            state = %update.state.as_str(),
            peer_ip = %peer_ip,
            "payment_notification_received"
        );

        // Use try_send to never block the connection handler
        match update_tx.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                metrics.record_payment_update_dropped();
                if last_drop_warn.elapsed() > Duration::from_secs(1) {
                    warn!(peer_ip = %peer_ip, "payment_update_dropped: channel full");
                    last_drop_warn = Instant::now();
                }
            }
            Err(TrySendError::Closed(_)) => {
                warn!(peer_ip = %peer_ip, "payment_update_channel_closed");
                break;
            }
        }
    }

    debug!(peer_ip = %peer_ip, "terminal_connection_closed");
}

/// Parse a "PAY <transaction_id> <state>" line
fn parse_payment_line(line: &str) -> Option<PaymentUpdate> {
    let rest = line.strip_prefix("PAY ")?;
    let mut parts = rest.split_whitespace();
    let transaction_id = parts.next()?.to_string();
    let state: PaymentState = parts.next()?.parse().ok()?;

    Some(PaymentUpdate { transaction_id, state, received_at: Instant::now() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_payment_line() {
        let update = parse_payment_line("PAY tx-42 COMPLETED").unwrap();
        assert_eq!(update.transaction_id, "tx-42");
        assert_eq!(update.state, PaymentState::Completed);

        let update = parse_payment_line("PAY tx-9 failed").unwrap();
        assert_eq!(update.state, PaymentState::Failed);
    }

    #[test]
    fn test_parse_rejects_malformed_lines() {
        assert!(parse_payment_line("").is_none());
        assert!(parse_payment_line("PAY").is_none());
        assert!(parse_payment_line("PAY tx-42").is_none());
        assert!(parse_payment_line("PAY tx-42 EXPLODED").is_none());
        assert!(parse_payment_line("ACK tx-42 COMPLETED").is_none());
    }
}
