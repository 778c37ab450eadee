//! Schema contracts and structural validation of model output.
//!
//! A [`SchemaContract`] wraps a JSON-Schema document (a supported subset,
//! see [`validator`]) with a name and a version string. [`validate`] is a
//! pure function: it never touches the filesystem and returns every
//! violation it finds rather than stopping at the first.

mod contract;
pub mod validator;

pub use contract::{SchemaContract, ValidatorOptions};
pub use validator::{ValidationOutcome, Violation, validate};
