//! `locate-core`: shared identifiers and the domain error model.
//!
//! This crate has no infrastructure concerns: it is depended on by both the
//! inference boundary and the job infrastructure.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::JobId;
