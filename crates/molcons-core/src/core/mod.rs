//! # Core Module
//!
//! The data the constraint engine reads and writes, and the numerics it needs.
//!
//! - **Models** ([`models`]) - identifiers, properties, molecules, groups, deltas and the `System`
//! - **Expressions** ([`expression`]) - symbols, values and a small parsed expression language
//! - **Spaces** ([`space`]) - cartesian and periodic geometry with minimum-image conventions
//! - **Points** ([`point`]) - references to positions that follow molecules
//! - **Perturbations** ([`perturbation`]) - interpolation of molecule properties by component values
//! - **File I/O** ([`io`]) - scenario files describing a system and its constraints

pub mod expression;
pub mod io;
pub mod models;
pub mod perturbation;
pub mod point;
pub mod space;
