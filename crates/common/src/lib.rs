//! Shared types for the fleet control-plane workspace.
//!
//! Keep wire-format DTOs used by more than one crate (or by integration
//! tests) here to avoid duplication.

#![warn(missing_docs)]

/// Shared API DTOs for cross-crate use.
pub mod api;
