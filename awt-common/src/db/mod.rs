//! Database layer
//!
//! One SQLite pool backs every entity; all queries live in per-entity
//! modules so callers never write SQL inline.

pub mod init;
pub mod jobs;
pub mod models;
pub mod reagents;
pub mod results;
pub mod settings;
pub mod swatches;

pub use init::init_database;
pub use models::{
    Cadence, Job, JobCause, JobStatus, ReagentSlot, ReagentStep, ResultStatus, SwatchEntry,
    TestDefinition, TestResult, TestSchedule, TitrationSpec,
};
pub use settings::InstrumentSettings;
