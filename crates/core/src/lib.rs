//! `caseflow-core` — identifiers and error classification shared by every layer.
//!
//! This crate contains **pure** primitives (no I/O, no async).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult, SourceError};
pub use id::{EntityId, TenantId};
