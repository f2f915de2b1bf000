//! Session materialization, user property write-back, and batch scheduling.
//!
//! - Materializer (candidate group → persisted session)
//! - User sessionizer (boundary detection and materialization for one user)
//! - Property merger (customer identity merge write-back)
//! - Project driver (windowed, concurrent per-user runs with a checkpoint)
//! - Scheduler (periodic passes over projects)

pub mod batch;
pub mod identity;
pub mod materializer;
pub mod scheduler;
pub mod sessionizer;

pub use batch::{DriverConfig, ProjectReport, ProjectSessionizer, SessionWindow};
pub use identity::{PropertyMerger, PropertyUpdate};
pub use materializer::{MaterializedSession, SessionMaterializer, SessionResolution};
pub use scheduler::{SchedulerConfig, SessionScheduler};
pub use sessionizer::{UserRunOutcome, UserSessionizer};
