//! Pipeline orchestration for matflow.
//!
//! This crate ties together catalog loading, prompt rendering, the model
//! gateway, schema validation and artifact storage into the two-stage
//! profile-then-match run (`run_pipeline`).

pub mod catalog;
pub mod inputs;
pub mod manifest;
pub mod pipeline;
pub mod retry;
pub mod runner;
pub mod shutdown;
pub mod template;
