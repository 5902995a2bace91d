//! Public facade crate for `tipwire`.
//!
//! This crate contains no IO or fetcher-specific logic.
//! It re-exports the backend-agnostic types/traits from `tipwire-core`.

pub use tipwire_core::*;
