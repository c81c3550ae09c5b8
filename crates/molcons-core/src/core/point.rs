use crate::core::models::ids::MolNum;
use crate::core::models::system::{System, SystemError};
use nalgebra::Point3;
use std::fmt;

/// A handle to a location in a system.
///
/// Points that live on a molecule follow that molecule as the system changes;
/// absolute points never move.
#[derive(Debug, Clone, PartialEq)]
pub enum PointRef {
    Absolute(Point3<f64>),
    Atom { molecule: MolNum, index: usize },
    Center { molecule: MolNum },
}

impl PointRef {
    /// The molecule this point is attached to, if any.
    pub fn molecule(&self) -> Option<MolNum> {
        match self {
            PointRef::Absolute(_) => None,
            PointRef::Atom { molecule, .. } | PointRef::Center { molecule } => Some(*molecule),
        }
    }

    pub fn position(&self, system: &System) -> Result<Point3<f64>, SystemError> {
        match self {
            PointRef::Absolute(p) => Ok(*p),
            PointRef::Atom { molecule, index } => system
                .molecule(*molecule)?
                .coordinates()
                .get(*index)
                .copied()
                .ok_or(SystemError::MissingMolecule(*molecule)),
            PointRef::Center { molecule } => Ok(system.molecule(*molecule)?.center()),
        }
    }

    /// Returns `true` if both points are attached to the same molecule.
    pub fn same_molecule(&self, other: &PointRef) -> bool {
        matches!((self.molecule(), other.molecule()), (Some(a), Some(b)) if a == b)
    }
}

impl fmt::Display for PointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointRef::Absolute(p) => write!(f, "({}, {}, {})", p.x, p.y, p.z),
            PointRef::Atom { molecule, index } => write!(f, "atom {} of {}", index, molecule),
            PointRef::Center { molecule } => write!(f, "center of {}", molecule),
        }
    }
}
