//! Periodic statistics for a school platform.
//!
//! A [`job::JobRunner`] sweeps every active class and student on a fixed
//! cadence, aggregates growth, attendance and nutrition for the current day,
//! week and month, and upserts one [`models::AggregatedStat`] per entity,
//! metric group and period. The [`api`] module serves what was last written.

pub mod aggregate;
pub mod api;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod job;
pub mod memory;
pub mod models;
pub mod period;
pub mod report;
pub mod sources;

pub use engine::StatsEngine;
pub use error::StatsError;
pub use job::{JobHandle, JobRunner, RunnerState, TickOutcome, TickReport};
pub use memory::MemoryBackend;
pub use period::{PeriodCalculator, PeriodKind, PeriodWindow};
pub use sources::{SourceReader, StatStore};
