// Copyright 2025-2026 Arcade Loop Contributors
// Licensed under the Apache License, Version 2.0

//! Table registry, the training switcheroo, and ratings elevation.

use std::sync::Arc;

use dashmap::DashMap;

use super::{Domain, GpuContentionTable, GpuId, LeaseConfig};

/// Owns all per-GPU contention tables.
pub struct GpuContentionManager {
    tables: DashMap<GpuId, Arc<GpuContentionTable>>,
    default_training_gpu: GpuId,
    leases: LeaseConfig,
}

impl GpuContentionManager {
    pub fn new(default_training_gpu: GpuId, leases: LeaseConfig) -> Self {
        let manager = Self {
            tables: DashMap::new(),
            default_training_gpu: default_training_gpu.clone(),
            leases,
        };
        // Materialize the default table up front; the training domain is
        // only activated on it for the duration of a train step, so
        // self-play on a shared GPU runs between steps.
        manager.table(&default_training_gpu);
        manager
    }

    pub fn default_training_gpu(&self) -> &GpuId {
        &self.default_training_gpu
    }

    /// Get or create the table for a GPU.
    pub fn table(&self, gpu_id: &GpuId) -> Arc<GpuContentionTable> {
        self.tables
            .entry(gpu_id.clone())
            .or_insert_with(|| GpuContentionTable::new(gpu_id.clone(), self.leases))
            .clone()
    }

    /// Table to run the next train step on.
    ///
    /// By default this is the default training GPU. If another domain
    /// currently outranks training there, and a second local GPU exists where
    /// training holds the highest priority, that table is returned instead.
    /// This switcheroo keeps both GPUs busy when three domains compete for
    /// two devices on one host.
    pub fn table_for_training(&self) -> Arc<GpuContentionTable> {
        let default = self.table(&self.default_training_gpu);
        if default.has_highest_priority(Domain::Training) {
            return default;
        }
        for entry in self.tables.iter() {
            let table = entry.value();
            if *table.gpu_id() == self.default_training_gpu {
                continue;
            }
            if table.gpu_id().ip_address == self.default_training_gpu.ip_address
                && table.has_highest_priority(Domain::Training)
            {
                tracing::debug!(
                    from = %self.default_training_gpu,
                    to = %table.gpu_id(),
                    "performing training switcheroo"
                );
                return table.clone();
            }
        }
        default
    }

    /// Elevate or restore ratings priority.
    ///
    /// At most one table is elevated globally. When elevating, the table is
    /// chosen among those with ratings active, preferring tables where
    /// neither training nor self-play is active.
    pub fn set_ratings_priority(&self, elevate: bool) {
        let mut ratings_tables: Vec<Arc<GpuContentionTable>> = self
            .tables
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|table| table.active(Domain::Ratings))
            .collect();

        if !elevate {
            for table in self.tables.iter() {
                if table.value().ratings_prioritized() {
                    table.value().deprioritize_ratings();
                }
            }
            return;
        }

        if ratings_tables.is_empty() {
            return;
        }
        if ratings_tables.iter().any(|t| t.ratings_prioritized()) {
            // Elevated table already exists, just keep it.
            return;
        }

        ratings_tables.sort_by_key(|table| {
            (
                table.active(Domain::Training),
                table.active(Domain::SelfPlay),
            )
        });
        let table = &ratings_tables[0];
        tracing::debug!(gpu = %table.gpu_id(), "prioritizing ratings");
        table.prioritize_ratings();
    }

    /// Whether any table's lock is currently held by the given domain.
    pub fn any_lock_held_by(&self, domain: Domain) -> bool {
        self.tables
            .iter()
            .any(|entry| entry.value().lock_holder() == Some(domain))
    }

    /// One log line per table, for the status-dump signal handler.
    pub fn status_dump(&self) {
        for entry in self.tables.iter() {
            tracing::info!(table = ?entry.value(), "gpu contention state");
        }
    }
}
