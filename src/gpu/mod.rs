//! GPU contention arbitration between the three workload domains.
//!
//! Every GPU known to the controller gets a [`GpuContentionTable`]: a small
//! priority/lock state machine that serializes all GPU work. Training,
//! self-play batches and rating matches all funnel through these tables.

mod manager;
mod table;

pub use manager::GpuContentionManager;
pub use table::GpuContentionTable;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Workload class competing for GPU time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Domain {
    Training,
    SelfPlay,
    Ratings,
}

impl Domain {
    pub const ALL: [Domain; 3] = [Domain::Training, Domain::SelfPlay, Domain::Ratings];

    pub(crate) fn index(self) -> usize {
        match self {
            Domain::Training => 0,
            Domain::SelfPlay => 1,
            Domain::Ratings => 2,
        }
    }

    /// Fixed ordering used to break priority ties.
    pub(crate) fn tie_break_rank(self) -> u8 {
        match self {
            Domain::Training => 2,
            Domain::SelfPlay => 1,
            Domain::Ratings => 0,
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::Training => write!(f, "training"),
            Domain::SelfPlay => write!(f, "self-play"),
            Domain::Ratings => write!(f, "ratings"),
        }
    }
}

/// A physical GPU, identified by host address plus device string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GpuId {
    pub ip_address: String,
    pub device: String,
}

impl GpuId {
    pub fn new(ip_address: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            device: device.into(),
        }
    }
}

impl fmt::Display for GpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip_address, self.device)
    }
}

/// Lock lease durations per domain class.
#[derive(Debug, Clone, Copy)]
pub struct LeaseConfig {
    /// Slice granted to a training lock acquisition.
    pub training_slice: Duration,
    /// Slice granted to self-play and ratings acquisitions.
    pub short_slice: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            training_slice: Duration::from_secs(60),
            short_slice: Duration::from_secs(10),
        }
    }
}

impl LeaseConfig {
    pub(crate) fn slice_for(&self, domain: Domain) -> Duration {
        match domain {
            Domain::Training => self.training_slice,
            Domain::SelfPlay | Domain::Ratings => self.short_slice,
        }
    }
}

#[derive(Error, Debug)]
pub enum ContentionError {
    #[error("{domain} released a lock it does not hold on {gpu}")]
    NotLockHolder { domain: Domain, gpu: GpuId },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tie_break_prefers_training() {
        assert!(Domain::Training.tie_break_rank() > Domain::SelfPlay.tie_break_rank());
        assert!(Domain::SelfPlay.tie_break_rank() > Domain::Ratings.tie_break_rank());
    }

    #[test]
    fn gpu_id_display() {
        let id = GpuId::new("10.0.0.4", "cuda:1");
        assert_eq!(id.to_string(), "10.0.0.4/cuda:1");
    }
}
