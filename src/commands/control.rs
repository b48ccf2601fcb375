//! A line-oriented TCP endpoint to control consumers at runtime.
//!
//! Each line received is executed as a [`Command`](super::Command); the resulting reports are
//! written back, one per line, followed by an empty line.
//!
//! ```text
//! $ nc localhost 7070
//! consumer status all
//! [SUCCESS] Consumer 'orders' has 3 subscribers (subscribed)
//!
//! ```
use crate::amqp::Transport;
use crate::commands::Dispatcher;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Accept control connections until `shutdown` resolves, then stop every consumer.
pub async fn serve<T, F>(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher<T>>,
    shutdown: F,
) -> Result<(), anyhow::Error>
where
    T: Transport,
    F: Future<Output = ()>,
{
    tracing::info!(address = ?listener.local_addr()?, "Control listener started");
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                tracing::info!("Control listener received shutdown signal");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept a control connection");
                        continue;
                    }
                };
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, dispatcher).await {
                        tracing::warn!(%peer, error = ?e, "Control connection failed");
                    }
                });
            }
        }
    }
    dispatcher.shutdown().await;
    Ok(())
}

#[tracing::instrument(name = "control_connection", skip_all, fields(peer = ?stream.peer_addr().ok()))]
async fn handle_connection<T: Transport>(
    stream: TcpStream,
    dispatcher: Arc<Dispatcher<T>>,
) -> Result<(), anyhow::Error> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let mut response = String::new();
        for report in dispatcher.dispatch(&line).await {
            response.push_str(&report.to_string());
            response.push('\n');
        }
        response.push('\n');
        writer.write_all(response.as_bytes()).await?;
    }
    Ok(())
}

/// Resolves on Ctrl+C, for use as the `shutdown` future of [`serve`].
pub async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for the shutdown signal");
        std::future::pending::<()>().await;
    }
}
