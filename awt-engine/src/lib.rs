//! # AWT Engine
//!
//! The test execution service for the automated water tester: hardware
//! interface traits, the swatch color matcher, the titration controller,
//! the test step runner and execution engine, the job queue consumer,
//! the recurring scheduler, diagnostics, and the HTTP control surface.

pub mod api;
pub mod diag;
pub mod exec;
pub mod hardware;
pub mod matcher;
pub mod queue;
pub mod schedule;
pub mod state;
