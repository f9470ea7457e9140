//! Optional TOML configuration overlay.
//!
//! CLI flags always win; the file only fills in scheduling knobs that are
//! too niche for the command line.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::training::WindowParams;
use crate::{ControllerParams, TrainingParams};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {0}")]
    Read(String, #[source] std::io::Error),

    #[error("failed to parse {0}")]
    Parse(String, #[source] toml::de::Error),
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub training: TrainingSection,
    #[serde(default)]
    pub gpu: GpuSection,
    #[serde(default)]
    pub ratings: RatingsSection,
    #[serde(default)]
    pub self_play: SelfPlaySection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainingSection {
    pub samples_per_window: Option<u64>,
    pub minibatch_size: Option<u32>,
    pub snapshot_steps: Option<u32>,
    pub window_c: Option<f64>,
    pub window_alpha: Option<f64>,
    pub window_beta: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GpuSection {
    pub training_slice_secs: Option<u64>,
    pub short_slice_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RatingsSection {
    pub n_games_per_match: Option<u32>,
    pub min_ref_strength: Option<u32>,
    pub max_ref_strength: Option<u32>,
    pub max_probes_per_gen: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelfPlaySection {
    pub restart_interval_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let body = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(display.clone(), e))?;
        toml::from_str(&body).map_err(|e| ConfigError::Parse(display, e))
    }

    /// Fold the file values into params assembled from CLI defaults.
    pub fn apply(&self, controller: &mut ControllerParams, training: &mut TrainingParams) {
        let t = &self.training;
        apply_opt(&mut training.samples_per_window, t.samples_per_window);
        apply_opt(&mut training.minibatch_size, t.minibatch_size);
        apply_opt(&mut training.snapshot_steps, t.snapshot_steps);

        let w: &mut WindowParams = &mut training.window;
        apply_opt(&mut w.c, t.window_c);
        apply_opt(&mut w.alpha, t.window_alpha);
        apply_opt(&mut w.beta, t.window_beta);

        if let Some(secs) = self.gpu.training_slice_secs {
            controller.leases.training_slice = Duration::from_secs(secs);
        }
        if let Some(secs) = self.gpu.short_slice_secs {
            controller.leases.short_slice = Duration::from_secs(secs);
        }
        if let Some(secs) = self.self_play.restart_interval_secs {
            controller.restart_interval = Duration::from_secs(secs);
        }

        let r = &self.ratings;
        apply_opt(&mut controller.ratings.n_games_per_match, r.n_games_per_match);
        apply_opt(&mut controller.ratings.min_ref_strength, r.min_ref_strength);
        apply_opt(&mut controller.ratings.max_ref_strength, r.max_ref_strength);
        apply_opt(&mut controller.ratings.max_probes_per_gen, r.max_probes_per_gen);
    }
}

fn apply_opt<T: Copy>(target: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *target = v;
    }
}
