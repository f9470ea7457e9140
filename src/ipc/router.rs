//! Per-connection receive loop.
//!
//! Reads framed messages in order, dispatches to the role's handler, and on
//! recv failure invokes the disconnect path. Handler errors that are not
//! connection-local escalate to the shutdown manager.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::tcp::OwnedReadHalf;

use super::connection::{ClientConnection, ConnectionRegistry};
use super::encoding::read_frame;
use super::protocol::{decode_message, Message};
use crate::shutdown::ShutdownManager;
use crate::ControlError;

/// Whether the receive loop keeps going after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopFlow {
    Continue,
    /// Terminal message handled; close the connection cleanly.
    Terminate,
}

/// Role-specific message handling attached to a receive loop.
#[async_trait]
pub trait RecvHandler: Send + Sync + 'static {
    /// Runs once before the first message is processed. Used to hold new
    /// servers in a preamble wait (e.g. the retraining gate).
    async fn preamble(&self, _conn: &Arc<ClientConnection>) {}

    /// Handle one message. The reader is exposed so handlers can consume a
    /// trailing payload stream on the same socket.
    async fn handle(
        &self,
        conn: &Arc<ClientConnection>,
        msg: Message,
        reader: &mut OwnedReadHalf,
    ) -> Result<LoopFlow, ControlError>;

    /// Runs exactly once when the receive loop exits, for any reason.
    async fn on_disconnect(&self, _conn: &Arc<ClientConnection>) {}
}

/// Spawn the receive loop task for a connection.
pub fn spawn_recv_loop(
    conn: Arc<ClientConnection>,
    mut reader: OwnedReadHalf,
    handler: Arc<dyn RecvHandler>,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownManager>,
) {
    tokio::spawn(async move {
        handler.preamble(&conn).await;

        // Cancellation is connection-scoped rather than process-scoped:
        // teardown closes connections explicitly, which lets rating workers
        // finish an in-flight match before their loop is cut.
        loop {
            let frame = tokio::select! {
                biased;
                _ = conn.closed() => break,
                frame = read_frame(&mut reader) => frame,
            };

            let bytes = match frame {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::info!(%conn, error = %e, "connection closed by peer");
                    break;
                }
            };

            let msg = match decode_message(&bytes) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::warn!(%conn, error = %e, "dropping connection on malformed message");
                    break;
                }
            };

            match handler.handle(&conn, msg, &mut reader).await {
                Ok(LoopFlow::Continue) => {}
                Ok(LoopFlow::Terminate) => break,
                Err(e) if e.is_connection_local() => {
                    tracing::warn!(%conn, error = %e, "closing connection");
                    break;
                }
                Err(e) => {
                    tracing::error!(%conn, error = %e, "fatal error handling message");
                    shutdown.request_shutdown(1);
                    break;
                }
            }
        }

        registry.remove(conn.client_id);
        conn.mark_closed();
        handler.on_disconnect(&conn).await;
        tracing::debug!(%conn, "receive loop exited");
    });
}
