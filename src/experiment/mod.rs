//! Experiment lifecycle tracking
//!
//! ## Lifecycle
//!
//! ```text
//! pending ──> running ──┬──> completed
//!                       └──> failed (error)
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use labrelay::experiment::{ExperimentRegistry, ExperimentStatus, Transition};
//! use labrelay::validate::PartitionName;
//!
//! let registry = ExperimentRegistry::new();
//! let name = PartitionName::new("exp_a")?;
//!
//! let exp = registry.register(&name, false)?;
//! registry.transition("exp_a", exp.run_id(), Transition::Start)?;
//! let done = registry.transition("exp_a", exp.run_id(), Transition::Complete)?;
//!
//! assert_eq!(done.status(), ExperimentStatus::Completed);
//! # Ok::<(), labrelay::Error>(())
//! ```

mod record;
mod registry;

pub use record::{Experiment, ExperimentStatus, Transition};
pub use registry::ExperimentRegistry;
