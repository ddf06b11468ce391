//! Shared error taxonomy for the tandem database kernel.
//!
//! Every tandem crate reports failures through [`TandemError`] so that
//! callers can match on a stable kind regardless of which backend produced
//! the underlying fault.

pub mod error;

pub use error::{Result, TandemError};
