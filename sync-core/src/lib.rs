//! Shared foundation for the settlement sync engine: error taxonomy,
//! retry policy, and logging bootstrap.

pub mod error;
pub mod observability;
pub mod retry;
