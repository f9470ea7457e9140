//! Wire format and schema for control-plane messages.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gpu::Domain;
use crate::Generation;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid message: {0}")]
    InvalidFormat(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: u64, max: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    Disconnected,

    #[error("handshake timed out")]
    HandshakeTimeout,
}

/// Role announced by a client in its handshake.
///
/// Servers orchestrate native worker processes; workers are the per-GPU
/// children doing the actual game generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientRole {
    #[serde(rename = "self-play-server")]
    SelfPlayServer,
    #[serde(rename = "self-play-worker")]
    SelfPlayWorker,
    #[serde(rename = "ratings-server")]
    RatingsServer,
    #[serde(rename = "ratings-worker")]
    RatingsWorker,
}

impl ClientRole {
    /// Workload class the role competes under for GPU time.
    pub fn domain(&self) -> Domain {
        match self {
            ClientRole::SelfPlayServer | ClientRole::SelfPlayWorker => Domain::SelfPlay,
            ClientRole::RatingsServer | ClientRole::RatingsWorker => Domain::Ratings,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClientRole::SelfPlayServer => "self-play-server",
            ClientRole::SelfPlayWorker => "self-play-worker",
            ClientRole::RatingsServer => "ratings-server",
            ClientRole::RatingsWorker => "ratings-worker",
        }
    }
}

impl fmt::Display for ClientRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ClientRole {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "self-play-server" => Ok(ClientRole::SelfPlayServer),
            "self-play-worker" => Ok(ClientRole::SelfPlayWorker),
            "ratings-server" => Ok(ClientRole::RatingsServer),
            "ratings-worker" => Ok(ClientRole::RatingsWorker),
            other => Err(ProtocolError::InvalidFormat(format!(
                "unknown client role: {other}"
            ))),
        }
    }
}

/// MCTS cache/eval counters reported by workers.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MctsMetrics {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub positions_evaluated: u64,
    pub batches_evaluated: u64,
    pub full_batches_evaluated: u64,
}

/// Outcome of a rating match, from the MCTS agent's point of view.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MatchRecord {
    pub wins: u32,
    pub draws: u32,
    pub losses: u32,
}

impl MatchRecord {
    pub fn n_games(&self) -> u32 {
        self.wins + self.draws + self.losses
    }

    pub fn win_rate(&self) -> f64 {
        let n = self.n_games();
        if n == 0 {
            return 0.0;
        }
        (f64::from(self.wins) + 0.5 * f64::from(self.draws)) / f64::from(n)
    }
}

/// All control-plane message types, in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    // ---- client -> controller ----
    #[serde(rename = "handshake")]
    Handshake {
        role: ClientRole,
        start_timestamp: i64,
        #[serde(default)]
        cuda_device: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        aux: Option<HashMap<String, serde_json::Value>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        manager_id: Option<String>,
    },

    #[serde(rename = "ready")]
    Ready,

    #[serde(rename = "gen0-complete")]
    Gen0Complete,

    #[serde(rename = "pause-ack")]
    PauseAck,

    #[serde(rename = "unpause-ack")]
    UnpauseAck,

    /// Request for model bytes. Self-play workers omit the generation and
    /// receive whatever is latest; ratings workers pin the generation their
    /// match was assigned for.
    #[serde(rename = "weights-request")]
    WeightsRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        generation: Option<Generation>,
    },

    #[serde(rename = "metrics")]
    Metrics {
        gen: Generation,
        timestamp: i64,
        metrics: MctsMetrics,
    },

    /// Immediately followed by the game file bytes as a payload stream.
    #[serde(rename = "game")]
    Game {
        gen: Generation,
        start_timestamp: i64,
        end_timestamp: i64,
        rows: u64,
        flush: bool,
        done: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metrics: Option<MctsMetrics>,
    },

    #[serde(rename = "match-result")]
    MatchResult {
        record: MatchRecord,
        mcts_gen: Generation,
        ref_strength: u32,
    },

    #[serde(rename = "log")]
    Log {
        line: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
    },

    #[serde(rename = "worker-exit")]
    WorkerExit { src: String, close_log: bool },

    #[serde(rename = "done")]
    Done,

    // ---- controller -> client ----
    #[serde(rename = "handshake-ack")]
    HandshakeAck {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<crate::ClientId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        game: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rejection: Option<String>,
    },

    #[serde(rename = "start-gen0")]
    StartGen0 { max_rows: u64 },

    #[serde(rename = "start")]
    Start,

    #[serde(rename = "restart")]
    Restart,

    #[serde(rename = "pause")]
    Pause,

    #[serde(rename = "unpause")]
    Unpause,

    /// Immediately followed by the model bytes as a payload stream.
    #[serde(rename = "reload-weights")]
    ReloadWeights { generation: Generation },

    #[serde(rename = "match-request")]
    MatchRequest {
        mcts_gen: Generation,
        ref_strength: u32,
        n_games: u32,
    },

    #[serde(rename = "quit")]
    Quit,
}

impl Message {
    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Handshake { .. } => "handshake",
            Message::Ready => "ready",
            Message::Gen0Complete => "gen0-complete",
            Message::PauseAck => "pause-ack",
            Message::UnpauseAck => "unpause-ack",
            Message::WeightsRequest { .. } => "weights-request",
            Message::Metrics { .. } => "metrics",
            Message::Game { .. } => "game",
            Message::MatchResult { .. } => "match-result",
            Message::Log { .. } => "log",
            Message::WorkerExit { .. } => "worker-exit",
            Message::Done => "done",
            Message::HandshakeAck { .. } => "handshake-ack",
            Message::StartGen0 { .. } => "start-gen0",
            Message::Start => "start",
            Message::Restart => "restart",
            Message::Pause => "pause",
            Message::Unpause => "unpause",
            Message::ReloadWeights { .. } => "reload-weights",
            Message::MatchRequest { .. } => "match-request",
            Message::Quit => "quit",
        }
    }
}

/// Encode message to JSON bytes.
pub fn encode_message(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let bytes = serde_json::to_vec(message)?;
    if bytes.len() > super::MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: bytes.len(),
            max: super::MAX_FRAME_SIZE,
        });
    }
    Ok(bytes)
}

/// Decode message from JSON bytes.
pub fn decode_message(bytes: &[u8]) -> Result<Message, ProtocolError> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_tags_are_kebab_case() {
        let msg = Message::StartGen0 { max_rows: 1000 };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "start-gen0");
        assert_eq!(json["max_rows"], 1000);
    }

    #[test]
    fn handshake_roundtrip() {
        let msg = Message::Handshake {
            role: ClientRole::SelfPlayWorker,
            start_timestamp: 1_700_000_000_000,
            cuda_device: "cuda:1".into(),
            aux: None,
            manager_id: Some("mgr-7".into()),
        };
        let bytes = encode_message(&msg).unwrap();
        match decode_message(&bytes).unwrap() {
            Message::Handshake {
                role,
                cuda_device,
                manager_id,
                ..
            } => {
                assert_eq!(role, ClientRole::SelfPlayWorker);
                assert_eq!(cuda_device, "cuda:1");
                assert_eq!(manager_id.as_deref(), Some("mgr-7"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn handshake_optional_fields_default() {
        let bytes =
            br#"{"type":"handshake","role":"ratings-server","start_timestamp":42}"#.to_vec();
        match decode_message(&bytes).unwrap() {
            Message::Handshake {
                cuda_device,
                aux,
                manager_id,
                ..
            } => {
                assert_eq!(cuda_device, "");
                assert!(aux.is_none());
                assert!(manager_id.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn ack_rejection_omits_client_id() {
        let msg = Message::HandshakeAck {
            client_id: None,
            game: None,
            rejection: Some("role/gpu clash".into()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("client_id"));
        assert!(json.contains("rejection"));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = decode_message(br#"{"type":"warp-drive"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Serialization(_)));
    }

    #[test]
    fn match_record_win_rate() {
        let record = MatchRecord {
            wins: 6,
            draws: 2,
            losses: 2,
        };
        assert_eq!(record.n_games(), 10);
        assert!((record.win_rate() - 0.7).abs() < 1e-9);
        assert_eq!(MatchRecord::default().win_rate(), 0.0);
    }

    #[test]
    fn role_maps_to_domain() {
        assert_eq!(ClientRole::SelfPlayServer.domain(), Domain::SelfPlay);
        assert_eq!(ClientRole::RatingsWorker.domain(), Domain::Ratings);
    }
}
