//! # Engine Module
//!
//! The constraint engine: constraints that remember which system version they
//! last judged, and a container that applies many of them together.
//!
//! - **Protocol** ([`constraint`]) - the `Constraint` trait, its cached state and shared handles
//! - **Container** ([`constraints`]) - the fixed-point apply loop, molecule resolution and rollback
//! - **Component and property constraints** ([`kinds`]) - expression, windowed and geometry constraints
//! - **Molecule constraints** ([`molecule`]) - perturbation, wrapping, identity and charge constraints
//! - **Configuration** ([`config`]) - iteration budgets
//! - **Error Handling** ([`error`]) - violations, non-convergence and construction errors

pub mod config;
pub mod constraint;
pub mod constraints;
pub mod error;
pub mod kinds;
pub mod molecule;
