//! Per-connection state and the live-connection registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::encoding::{write_frame, write_payload};
use super::protocol::{encode_message, Message, ProtocolError};
use crate::gpu::{Domain, GpuId};
use crate::{ClientId, Generation};

/// Auxiliary per-connection state touched by the pause/unpause handshakes
/// and GPU runtime accounting.
#[derive(Debug, Default)]
struct AuxState {
    pending_pause_ack: bool,
    pending_unpause_ack: bool,
    /// Set while the worker is unpaused; basis for runtime attribution.
    start_ts: Option<i64>,
    total_runtime: i64,
    /// Generation whose weights were last sent to this worker.
    sent_gen: Option<Generation>,
}

/// One live client connection.
pub struct ClientConnection {
    pub client_id: ClientId,
    pub role: super::ClientRole,
    pub domain: Domain,
    pub gpu_id: GpuId,
    pub start_timestamp: i64,
    /// Auxiliary tags from the handshake (e.g. a rating tag).
    pub aux_tags: HashMap<String, serde_json::Value>,

    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    aux: Mutex<AuxState>,
    ack_notify: Notify,
    closed: CancellationToken,
}

impl ClientConnection {
    pub fn new(
        client_id: ClientId,
        role: super::ClientRole,
        gpu_id: GpuId,
        start_timestamp: i64,
        aux_tags: HashMap<String, serde_json::Value>,
        writer: OwnedWriteHalf,
    ) -> Arc<Self> {
        Arc::new(Self {
            client_id,
            role,
            domain: role.domain(),
            gpu_id,
            start_timestamp,
            aux_tags,
            writer: tokio::sync::Mutex::new(writer),
            aux: Mutex::new(AuxState::default()),
            ack_notify: Notify::new(),
            closed: CancellationToken::new(),
        })
    }

    /// Send one framed message.
    pub async fn send(&self, message: &Message) -> Result<(), ProtocolError> {
        if self.closed.is_cancelled() {
            return Err(ProtocolError::Disconnected);
        }
        let bytes = encode_message(message)?;
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &bytes).await
    }

    /// Send a message followed by its payload stream, atomically with
    /// respect to other writers on this connection.
    pub async fn send_with_payload(
        &self,
        message: &Message,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        if self.closed.is_cancelled() {
            return Err(ProtocolError::Disconnected);
        }
        let bytes = encode_message(message)?;
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &bytes).await?;
        write_payload(&mut *writer, payload).await
    }

    /// Mark the connection closed: clears pending acks and wakes every
    /// waiter so handshakes in flight unwind.
    pub fn mark_closed(&self) {
        {
            let mut aux = self.aux.lock();
            aux.pending_pause_ack = false;
            aux.pending_unpause_ack = false;
        }
        self.closed.cancel();
        self.ack_notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn closed(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    // ---- pause/unpause handshake ----

    /// Flag an outstanding pause request before sending it.
    pub fn set_pending_pause(&self) {
        self.aux.lock().pending_pause_ack = true;
    }

    pub fn set_pending_unpause(&self) {
        self.aux.lock().pending_unpause_ack = true;
    }

    /// Wait until the pause ack clears (or the peer disconnects).
    /// Returns true if the ack arrived, false on disconnect.
    pub async fn wait_pause_ack(&self) -> bool {
        loop {
            let notified = self.ack_notify.notified();
            if !self.aux.lock().pending_pause_ack {
                return !self.is_closed();
            }
            notified.await;
        }
    }

    pub async fn wait_unpause_ack(&self) -> bool {
        loop {
            let notified = self.ack_notify.notified();
            if !self.aux.lock().pending_unpause_ack {
                return !self.is_closed();
            }
            notified.await;
        }
    }

    /// Handle an incoming pause ack: close the runtime interval and clear
    /// the pending flag. Acking a non-pending pause is an invariant
    /// violation.
    pub fn handle_pause_ack(&self, now_ns: i64) -> Result<(), String> {
        let mut aux = self.aux.lock();
        if !aux.pending_pause_ack {
            return Err(format!("{self} acked a pause that was never requested"));
        }
        if let Some(start) = aux.start_ts.take() {
            aux.total_runtime += now_ns - start;
        }
        aux.pending_pause_ack = false;
        drop(aux);
        self.ack_notify.notify_waiters();
        Ok(())
    }

    /// Handle an incoming unpause ack: open a runtime interval and clear
    /// the pending flag.
    pub fn handle_unpause_ack(&self, now_ns: i64) -> Result<(), String> {
        let mut aux = self.aux.lock();
        if !aux.pending_unpause_ack {
            return Err(format!("{self} acked an unpause that was never requested"));
        }
        if aux.start_ts.is_none() {
            aux.start_ts = Some(now_ns);
        }
        aux.pending_unpause_ack = false;
        drop(aux);
        self.ack_notify.notify_waiters();
        Ok(())
    }

    /// Take the accumulated GPU runtime for flush attribution, re-basing
    /// the open interval at `now_ns`. Returns the generation the worker is
    /// currently on and the runtime to charge.
    pub fn take_runtime_charge(&self, now_ns: i64) -> (Option<Generation>, i64) {
        let mut aux = self.aux.lock();
        let mut runtime = std::mem::take(&mut aux.total_runtime);
        if let Some(start) = aux.start_ts {
            runtime += now_ns - start;
            aux.start_ts = Some(now_ns);
        }
        (aux.sent_gen, runtime)
    }

    pub fn sent_gen(&self) -> Option<Generation> {
        self.aux.lock().sent_gen
    }

    pub fn set_sent_gen(&self, gen: Generation) {
        self.aux.lock().sent_gen = Some(gen);
    }
}

impl fmt::Display for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "client {} ({} on {})",
            self.client_id, self.role, self.gpu_id
        )
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("client_id", &self.client_id)
            .field("role", &self.role)
            .field("gpu_id", &self.gpu_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// List of live connections, serialized by its own mutex.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<Vec<Arc<ClientConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert a connection, enforcing that no two active connections share
    /// `(role, gpu_id)` and that a client id is active at most once.
    pub fn try_insert(&self, conn: Arc<ClientConnection>) -> Result<(), String> {
        let mut connections = self.connections.lock();
        if let Some(clash) = connections
            .iter()
            .find(|c| c.role == conn.role && c.gpu_id == conn.gpu_id)
        {
            return Err(format!(
                "connection of same role/cuda-device from same ip already exists ({clash})"
            ));
        }
        if connections.iter().any(|c| c.client_id == conn.client_id) {
            return Err("illegal reuse of client-id".to_string());
        }
        connections.push(conn);
        Ok(())
    }

    /// Whether an active connection already claims `(role, gpu_id)`.
    pub fn has_clash(&self, role: super::ClientRole, gpu_id: &GpuId) -> bool {
        self.connections
            .lock()
            .iter()
            .any(|c| c.role == role && c.gpu_id == *gpu_id)
    }

    pub fn remove(&self, client_id: ClientId) {
        self.connections
            .lock()
            .retain(|c| c.client_id != client_id);
    }

    pub fn snapshot(&self) -> Vec<Arc<ClientConnection>> {
        self.connections.lock().clone()
    }

    pub fn by_role(&self, role: super::ClientRole) -> Vec<Arc<ClientConnection>> {
        self.connections
            .lock()
            .iter()
            .filter(|c| c.role == role)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    /// Close every connection and empty the registry.
    pub fn close_all(&self) {
        let connections = {
            let mut guard = self.connections.lock();
            std::mem::take(&mut *guard)
        };
        for conn in connections {
            conn.mark_closed();
        }
    }
}
