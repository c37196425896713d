//! Query catalogue domain module.
//!
//! The fixed set of structured questions asked per case, plus their temporal
//! versioning. Pure domain logic: no IO, no HTTP, no storage.

pub mod query;

pub use query::{Query, QueryDefinition, QueryVersion};
