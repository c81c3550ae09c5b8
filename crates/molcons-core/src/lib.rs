//! # molcons Core Library
//!
//! A constraint engine for molecular simulation systems that are versioned and
//! copied on write. Constraints cache their verdict against one exact system
//! version, are re-applied to a fixed point when they interact, and are rolled
//! back as a whole when they cannot be satisfied together.
//!
//! ## Architectural Philosophy
//!
//! The library follows a strict three-layer architecture:
//!
//! - **[`core`]: The Foundation.** Data models (`System`, `Molecule`, `Delta`), the
//!   expression language used to write constraints, periodic spaces and perturbations.
//!   Nothing in this layer knows about constraints.
//!
//! - **[`engine`]: The Logic Core.** The `Constraint` protocol with its cached state,
//!   the concrete constraint kinds, and the `Constraints` container that drives ordinary
//!   constraints to a fixed point and resolves conflicting molecule constraints.
//!
//! - **[`workflows`]: The Public API.** Entry points that apply a constraint set to a
//!   system, check the result and report what happened.

pub mod core;
pub mod engine;
pub mod workflows;
