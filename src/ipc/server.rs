// Copyright 2025-2026 Arcade Loop Contributors
// Licensed under the Apache License, Version 2.0

//! TCP accept path: handshake, client id assignment, registration.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;

use super::connection::{ClientConnection, ConnectionRegistry};
use super::encoding::{read_frame, write_frame};
use super::protocol::{decode_message, encode_message, Message};
use crate::db::Database;
use crate::gpu::GpuId;
use crate::{ClientId, ControlError};

/// How long a freshly accepted socket gets to produce its handshake frame.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Performs the handshake on freshly accepted sockets.
pub struct Acceptor {
    registry: Arc<ConnectionRegistry>,
    clients_db: Arc<Database>,
    /// Worker-manager identity to previously assigned client id.
    manager_ids: DashMap<String, ClientId>,
    game: String,
}

impl Acceptor {
    pub fn new(registry: Arc<ConnectionRegistry>, clients_db: Arc<Database>, game: String) -> Self {
        Self {
            registry,
            clients_db,
            manager_ids: DashMap::new(),
            game,
        }
    }

    /// Run the handshake for one accepted socket.
    ///
    /// On success the connection is registered and returned together with
    /// its read half (for the receive loop). Rejections are replied to and
    /// return `Ok(None)`; the offending socket is closed and the accept
    /// loop continues.
    pub async fn accept(
        &self,
        stream: TcpStream,
    ) -> Result<Option<(Arc<ClientConnection>, OwnedReadHalf)>, ControlError> {
        let peer = stream.peer_addr().map_err(ControlError::Io)?;
        let (mut reader, mut writer) = stream.into_split();

        let frame = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut reader)).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                tracing::warn!(%peer, error = %e, "handshake read failed");
                return Ok(None);
            }
            Err(_) => {
                tracing::warn!(%peer, "handshake timed out");
                return Ok(None);
            }
        };

        let (role, start_timestamp, cuda_device, aux, manager_id) =
            match decode_message(&frame) {
                Ok(Message::Handshake {
                    role,
                    start_timestamp,
                    cuda_device,
                    aux,
                    manager_id,
                }) => (role, start_timestamp, cuda_device, aux, manager_id),
                Ok(other) => {
                    tracing::warn!(%peer, got = other.kind(), "expected handshake");
                    return Ok(None);
                }
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "malformed handshake");
                    return Ok(None);
                }
            };

        let gpu_id = GpuId::new(peer.ip().to_string(), cuda_device.clone());

        // Clash check before any client id is assigned, so a duplicate
        // never leaves a stray clients row behind.
        if self.registry.has_clash(role, &gpu_id) {
            tracing::warn!(%peer, %role, gpu = %gpu_id, "rejecting connection due to role/gpu clash");
            reject(
                &mut writer,
                "connection of same role/cuda-device from same ip already exists",
            )
            .await;
            return Ok(None);
        }

        // Resolve or assign the client id. A reconnecting worker with a
        // known manager identity must present the exact same attributes.
        let client_id = match self.resolve_client_id(
            manager_id.as_deref(),
            &peer.ip().to_string(),
            i64::from(peer.port()),
            role,
            start_timestamp,
            &cuda_device,
        )? {
            Ok(id) => id,
            Err(rejection) => {
                tracing::warn!(%peer, %role, rejection, "rejecting connection");
                reject(&mut writer, rejection).await;
                return Ok(None);
            }
        };

        let conn = ClientConnection::new(
            client_id,
            role,
            gpu_id,
            start_timestamp,
            aux.unwrap_or_default(),
            writer,
        );

        if let Err(rejection) = self.registry.try_insert(conn.clone()) {
            tracing::warn!(%peer, %role, %rejection, "rejecting connection");
            // The write half now lives inside `conn`; reply through it.
            let _ = conn
                .send(&Message::HandshakeAck {
                    client_id: None,
                    game: None,
                    rejection: Some(rejection),
                })
                .await;
            conn.mark_closed();
            return Ok(None);
        }

        conn.send(&Message::HandshakeAck {
            client_id: Some(client_id),
            game: Some(self.game.clone()),
            rejection: None,
        })
        .await
        .map_err(ControlError::Protocol)?;

        tracing::info!(%conn, %peer, "added connection");
        crate::telemetry::record_client_connected(role.as_str());
        Ok(Some((conn, reader)))
    }

    /// Returns `Ok(Ok(id))` on success, `Ok(Err(rejection))` for reply-able
    /// rejections, `Err` only for persistence failures.
    fn resolve_client_id(
        &self,
        manager_id: Option<&str>,
        ip_address: &str,
        port: i64,
        role: super::ClientRole,
        start_timestamp: i64,
        cuda_device: &str,
    ) -> Result<Result<ClientId, &'static str>, ControlError> {
        if let Some(manager_id) = manager_id {
            if let Some(existing) = self.manager_ids.get(manager_id) {
                let client_id = *existing;
                drop(existing);
                let row: Option<(String, String, String)> =
                    self.clients_db.with_conn(|conn| {
                        conn.query_row(
                            "SELECT ip_address, role, cuda_device FROM clients WHERE id = ?1",
                            (client_id,),
                            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                        )
                        .map(Some)
                        .or_else(|e| match e {
                            rusqlite::Error::QueryReturnedNoRows => Ok(None),
                            other => Err(other),
                        })
                    })?;
                let Some((db_ip, db_role, db_device)) = row else {
                    return Err(ControlError::Invariant(format!(
                        "manager id {manager_id} maps to client {client_id} with no clients row"
                    )));
                };
                if db_ip != ip_address || db_role != role.as_str() || db_device != cuda_device {
                    tracing::error!(
                        client_id,
                        manager_id,
                        "client attributes changed since last connection"
                    );
                    return Ok(Err("worker attributes changed since last connection"));
                }
                return Ok(Ok(client_id));
            }
        }

        let client_id = self.clients_db.with_txn(|txn| {
            txn.execute(
                "INSERT INTO clients (ip_address, port, role, start_timestamp, cuda_device) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                (ip_address, port, role.as_str(), start_timestamp, cuda_device),
            )?;
            Ok(txn.last_insert_rowid())
        })?;

        if let Some(manager_id) = manager_id {
            self.manager_ids.insert(manager_id.to_string(), client_id);
        }
        Ok(Ok(client_id))
    }
}

/// Best-effort rejection reply on a raw write half.
async fn reject(writer: &mut tokio::net::tcp::OwnedWriteHalf, rejection: &str) {
    let ack = Message::HandshakeAck {
        client_id: None,
        game: None,
        rejection: Some(rejection.to_string()),
    };
    if let Ok(bytes) = encode_message(&ack) {
        let _ = write_frame(writer, &bytes).await;
    }
}
