//! Experiment Registry - process-wide lifecycle map
//!
//! Volatile by construction: it answers "is a run I started still alive" and
//! is rebuilt empty on restart. Persisted history lives in the log store.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{Experiment, Transition};
use crate::validate::PartitionName;
use crate::{Error, Result};

/// Concurrent name -> [`Experiment`] map.
///
/// Each mutation holds the write lock of the shard owning the name for the
/// duration of a single read-modify-write, so transitions on one name are
/// serialized while unrelated names proceed in parallel. Reads clone the
/// entry; callers never see a reference into mutable state.
#[derive(Debug, Default)]
pub struct ExperimentRegistry {
    entries: DashMap<String, Experiment>,
    next_run_id: AtomicU64,
}

impl ExperimentRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending run.
    ///
    /// A prior entry in a terminal state is replaced. A prior non-terminal
    /// entry is replaced only when `override_existing` is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateRun`] if a live run exists and
    /// `override_existing` is false.
    pub fn register(&self, name: &PartitionName, override_existing: bool) -> Result<Experiment> {
        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed) + 1;
        let pending = Experiment::pending(name.as_str(), run_id);
        match self.entries.entry(name.as_str().to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_terminal() && !override_existing {
                    return Err(Error::DuplicateRun(name.to_string()));
                }
                occupied.insert(pending.clone());
            }
            Entry::Vacant(vacant) => {
                vacant.insert(pending.clone());
            }
        }
        Ok(pending)
    }

    /// Atomically apply `transition` to the entry registered as `run_id`.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the name is not registered
    /// - [`Error::StaleRun`] if the entry belongs to a newer registration
    /// - [`Error::InvalidTransition`] if the lifecycle forbids the edge
    pub fn transition(&self, name: &str, run_id: u64, transition: Transition) -> Result<Experiment> {
        let mut entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        if entry.run_id() != run_id {
            return Err(Error::StaleRun {
                name: name.to_string(),
                run_id,
            });
        }
        entry
            .apply(transition)
            .map_err(|(from, to)| Error::InvalidTransition {
                name: name.to_string(),
                from,
                to,
            })?;
        Ok(entry.value().clone())
    }

    /// Snapshot of one experiment.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Experiment> {
        self.entries.get(name).map(|entry| entry.value().clone())
    }

    /// Snapshots of all experiments, ordered by name.
    #[must_use]
    pub fn list(&self) -> Vec<Experiment> {
        let mut all: Vec<Experiment> = self
            .entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Number of registered experiments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
