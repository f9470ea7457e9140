//! Shared fixtures for the control-plane integration tests: a controller
//! bound to an ephemeral port, a scripted trainer, and a minimal client
//! speaking the wire protocol.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use arcade_loop::ipc::{
    decode_message, encode_message, read_frame, write_frame, write_payload, ClientRole, Message,
};
use arcade_loop::training::{HeadStats, TrainError, TrainJob, TrainOutcome, TrainStep};
use arcade_loop::{ClientId, ControllerParams, LoopController, TrainingParams};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// Trainer that fabricates artifacts instantly.
pub struct ScriptedTrainer;

#[async_trait]
impl TrainStep for ScriptedTrainer {
    async fn execute(&self, job: &TrainJob) -> Result<TrainOutcome, TrainError> {
        tokio::fs::write(&job.model_out, format!("weights-gen-{}", job.gen)).await?;
        tokio::fs::write(&job.checkpoint_out, format!("ckpt-gen-{}", job.gen)).await?;
        Ok(TrainOutcome {
            minibatches: job.snapshot_steps,
            total_loss: 0.5,
            heads: vec![
                HeadStats {
                    head: "policy".to_string(),
                    accuracy_num: 700.0,
                    loss_num: 300.0,
                    den: 1000,
                },
                HeadStats {
                    head: "value".to_string(),
                    accuracy_num: 650.0,
                    loss_num: 400.0,
                    den: 1000,
                },
            ],
        })
    }
}

/// Start a controller on an ephemeral port.
pub async fn start_controller(
    base_dir: &Path,
    samples_per_window: u64,
    max_positions_per_generation: Option<u64>,
) -> (SocketAddr, Arc<LoopController>) {
    let params = ControllerParams {
        port: 0,
        output_dir: base_dir.to_path_buf(),
        game: "c4".to_string(),
        max_positions_per_generation,
        ..ControllerParams::default()
    };
    let training_params = TrainingParams {
        samples_per_window,
        ..TrainingParams::default()
    };
    let controller =
        LoopController::new(params, training_params, Arc::new(ScriptedTrainer)).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(controller.clone().serve_on(listener));
    (addr, controller)
}

pub async fn send(stream: &mut TcpStream, msg: &Message) {
    let bytes = encode_message(msg).unwrap();
    write_frame(stream, &bytes).await.unwrap();
}

pub async fn recv(stream: &mut TcpStream) -> Message {
    let frame = tokio::time::timeout(RECV_TIMEOUT, read_frame(stream))
        .await
        .expect("timed out waiting for a message")
        .expect("connection closed while waiting for a message");
    decode_message(&frame).unwrap()
}

/// Expect no message within `window`; panics if one arrives.
pub async fn expect_silence(stream: &mut TcpStream, window: Duration) {
    match tokio::time::timeout(window, read_frame(stream)).await {
        Err(_) => {}
        Ok(Ok(frame)) => {
            let msg = decode_message(&frame).unwrap();
            panic!("expected silence, got {}", msg.kind());
        }
        Ok(Err(_)) => {}
    }
}

/// Handshake as `role`; returns the connected stream and assigned client id.
pub async fn connect(
    addr: SocketAddr,
    role: ClientRole,
    cuda_device: &str,
    manager_id: Option<&str>,
) -> (TcpStream, ClientId) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    send(
        &mut stream,
        &Message::Handshake {
            role,
            start_timestamp: 1,
            cuda_device: cuda_device.to_string(),
            aux: None,
            manager_id: manager_id.map(String::from),
        },
    )
    .await;
    match recv(&mut stream).await {
        Message::HandshakeAck {
            client_id: Some(client_id),
            rejection: None,
            ..
        } => (stream, client_id),
        other => panic!("handshake rejected: {other:?}"),
    }
}

/// Send a `game` message followed by its file payload.
#[allow(clippy::too_many_arguments)]
pub async fn send_game(
    stream: &mut TcpStream,
    gen: u32,
    start_ts: i64,
    end_ts: i64,
    rows: u64,
    flush: bool,
    done: bool,
    payload: &[u8],
) {
    send(
        stream,
        &Message::Game {
            gen,
            start_timestamp: start_ts,
            end_timestamp: end_ts,
            rows,
            flush,
            done,
            metrics: None,
        },
    )
    .await;
    write_payload(stream, payload).await.unwrap();
}

/// Poll the self-play database until `games` has `expected` rows.
pub async fn wait_for_game_rows(db_path: &Path, expected: i64) {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    loop {
        let count = rusqlite::Connection::open(db_path)
            .and_then(|conn| conn.query_row("SELECT COUNT(*) FROM games", [], |r| r.get::<_, i64>(0)))
            .unwrap_or(0);
        if count >= expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {expected} game rows (have {count})"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
