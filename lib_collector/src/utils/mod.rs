//! # Utilities Module
//!
//! Small helpers with no dependency on the engine state.

/// Random alphanumeric identifiers for registry entries.
pub mod ids;
