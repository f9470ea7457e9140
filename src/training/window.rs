//! Sliding-window sizing over the self-play position history.

use serde::Deserialize;

use crate::Generation;

/// Shape parameters of the sliding window.
///
/// From Appendix C of the KataGo paper (arXiv:1902.10565).
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WindowParams {
    pub c: f64,
    pub alpha: f64,
    pub beta: f64,
}

impl Default for WindowParams {
    fn default() -> Self {
        Self {
            c: 250_000.0,
            alpha: 0.75,
            beta: 0.4,
        }
    }
}

/// Number of most-recent positions to sample from, given `n_total`
/// accumulated positions:
///
/// `window(N) = min(N, c * (1 + beta * ((N/c)^alpha - 1) / alpha))`
pub fn window_size(n_total: u64, params: &WindowParams) -> u64 {
    if n_total == 0 {
        return 0;
    }
    let n = n_total as f64;
    let c = params.c;
    let grown = c * (1.0 + params.beta * ((n / c).powf(params.alpha) - 1.0) / params.alpha);
    n_total.min(grown.max(0.0) as u64)
}

/// A contiguous slice of one generation's positions within the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenSlice {
    pub gen: Generation,
    /// Positions taken from this generation (newest generations first fill
    /// the window completely; the oldest included generation may be cut).
    pub positions: u64,
}

/// Dataset window handed to the trainer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainWindow {
    pub n_total: u64,
    pub n_window: u64,
    /// Newest generation first.
    pub slices: Vec<GenSlice>,
}

/// Compose the window from per-generation aggregates.
///
/// `per_gen` holds `(gen, augmented_positions)` pairs in any order; the
/// window is filled from the newest generation backwards.
pub fn compose_window(per_gen: &[(Generation, u64)], params: &WindowParams) -> TrainWindow {
    let n_total: u64 = per_gen.iter().map(|(_, n)| n).sum();
    let n_window = window_size(n_total, params);

    let mut ordered: Vec<(Generation, u64)> = per_gen.to_vec();
    ordered.sort_by(|a, b| b.0.cmp(&a.0));

    let mut slices = Vec::new();
    let mut remaining = n_window;
    for (gen, positions) in ordered {
        if remaining == 0 {
            break;
        }
        if positions == 0 {
            continue;
        }
        let take = positions.min(remaining);
        slices.push(GenSlice {
            gen,
            positions: take,
        });
        remaining -= take;
    }

    TrainWindow {
        n_total,
        n_window,
        slices,
    }
}
