//! # Workflows Module
//!
//! Top-level entry points for users of molcons.
//!
//! - **Apply Workflow** ([`apply`]) - applies a constraint set to a system, checks the
//!   outcome and reports iteration counts, changed molecules and version changes.

pub mod apply;
