//! # Core Models Module
//!
//! Versioned data structures describing a molecular system.
//!
//! Every model carries a version. Structural edits (adding or removing molecules,
//! groups or forcefields) bump the major number; any other committed edit bumps
//! the minor number. Constraints key their caches on these versions, so the
//! models never change without saying so.
//!
//! - [`ids`] - molecule, group and forcefield identifiers, system UIDs and versions
//! - [`property`] - named property values and property-name maps
//! - [`molecule`] - molecules and ordered molecule collections
//! - [`group`] - numbered molecule groups
//! - [`delta`] - immutable records of what changed between two system states
//! - [`system`] - the system itself: components, properties, forcefields and groups
//!
//! ## Usage
//!
//! ```ignore
//! use molcons::core::models::{group::MoleculeGroup, ids::{MGNum, MolNum}, molecule::Molecule, system::System};
//!
//! let mut system = System::new("box");
//! let ion = Molecule::new(MolNum(1), "NA", vec![Point3::new(0.0, 0.0, 0.0)]);
//! system.add_group(MoleculeGroup::new(MGNum(1), "ions").with_molecule(ion))?;
//! ```

pub mod delta;
pub mod group;
pub mod ids;
pub mod molecule;
pub mod property;
pub mod system;
