use super::{MoleculeConstraint, molecule_constraint_boilerplate, molecule_constraint_impl};
use crate::core::models::delta::Delta;
use crate::core::models::ids::{MGNum, MolNum};
use crate::core::models::molecule::{Molecule, Molecules};
use crate::core::models::property::{Property, PropertyMap};
use crate::core::models::system::{SPACE_PROPERTY, System};
use crate::core::space::Space;
use crate::engine::constraint::ConstraintState;
use crate::engine::error::ConstraintError;
use nalgebra::Point3;
use std::collections::BTreeSet;
use std::fmt;

pub const CHARGE_PROPERTY: &str = "charge";
pub const FIXED_CHARGE_PROPERTY: &str = "fixed_charge";
pub const POLARISABILITY_PROPERTY: &str = "polarisability";

/// What every charge constraint shares: the group it edits and how it names
/// the properties it reads and writes.
#[derive(Debug, Clone, PartialEq)]
pub struct ChargeConstraint {
    mgnum: MGNum,
    map: PropertyMap,
}

impl ChargeConstraint {
    pub fn new(mgnum: MGNum, map: PropertyMap) -> Self {
        Self { mgnum, map }
    }

    pub fn mgnum(&self) -> MGNum {
        self.mgnum
    }

    pub fn charge_property(&self) -> &str {
        self.map.get(CHARGE_PROPERTY)
    }

    pub fn property_name<'a>(&'a self, default_name: &'a str) -> &'a str {
        self.map.get(default_name)
    }

    pub fn space(&self, system: &System) -> Space {
        system.space_named(self.map.get(SPACE_PROPERTY))
    }

    /// Per-atom values of `default_name` on `molecule`, which must have one per atom.
    pub fn per_atom<'m>(
        &self,
        molecule: &'m Molecule,
        default_name: &str,
    ) -> Result<&'m [f64], ConstraintError> {
        let name = self.map.get(default_name);
        let values = molecule
            .property(name)
            .and_then(Property::as_values)
            .ok_or_else(|| {
                ConstraintError::MissingProperty(format!("{} on {}", name, molecule.number()))
            })?;
        if values.len() != molecule.n_atoms() {
            return Err(ConstraintError::Incompatible(format!(
                "{} on {} has {} values for {} atoms",
                name,
                molecule.number(),
                values.len(),
                molecule.n_atoms()
            )));
        }
        Ok(values)
    }

    /// `molecule` with its charges replaced, or `None` if it already holds them.
    pub fn with_charges(&self, molecule: &Molecule, charges: Vec<f64>) -> Option<Molecule> {
        let mut charged = molecule.clone();
        charged
            .set_property(self.charge_property(), Property::Values(charges))
            .then_some(charged)
    }
}

/// Sets the charges of each group molecule from its fixed charges,
/// polarised by the electrostatic potential of every other molecule.
///
/// Atom `i` receives `q_i - (a_i * phi_i - mean_j(a_j * phi_j))`, where `q`
/// are the fixed charges, `a` the polarisabilities and `phi` the Coulomb
/// potential from the fixed charges of all other molecules in the system.
/// The shift sums to zero, so each molecule keeps its total charge.
#[derive(Debug, Clone)]
pub struct PolariseCharges {
    base: ChargeConstraint,
    state: ConstraintState,
}

impl PolariseCharges {
    pub fn new(mgnum: MGNum) -> Self {
        Self::with_map(mgnum, PropertyMap::new())
    }

    pub fn with_map(mgnum: MGNum, map: PropertyMap) -> Self {
        Self {
            base: ChargeConstraint::new(mgnum, map),
            state: ConstraintState::default(),
        }
    }

    pub fn base(&self) -> &ChargeConstraint {
        &self.base
    }

    fn potential(
        space: &Space,
        at: &Point3<f64>,
        sources: &[(MolNum, &[Point3<f64>], &[f64])],
        exclude: MolNum,
    ) -> f64 {
        sources
            .iter()
            .filter(|(molnum, _, _)| *molnum != exclude)
            .flat_map(|(_, coords, charges)| coords.iter().zip(charges.iter()))
            .map(|(position, charge)| {
                let r = space.calc_dist(at, position);
                if r > 0.0 { charge / r } else { 0.0 }
            })
            .sum()
    }

    /// The potential on every member depends on every molecule in the system,
    /// so any molecule change counts.
    fn affected_by(&self, delta: &Delta) -> bool {
        let space_property = self.base.property_name(SPACE_PROPERTY);
        delta.involves_property(space_property) || !delta.new_molecules().is_empty()
    }
}

impl PartialEq for PolariseCharges {
    fn eq(&self, other: &Self) -> bool {
        self.base == other.base
    }
}

molecule_constraint_impl!(PolariseCharges, "polarise-charges");

impl MoleculeConstraint for PolariseCharges {
    molecule_constraint_boilerplate!();

    fn update(&mut self, system: &System) -> Result<Molecules, ConstraintError> {
        let group = system.group(self.base.mgnum())?;
        let space = self.base.space(system);

        let fixed_name = self.base.property_name(FIXED_CHARGE_PROPERTY);
        let mut seen = BTreeSet::new();
        let mut sources = Vec::new();
        for molecule in system.groups().flat_map(|g| g.molecules().iter()) {
            if !seen.insert(molecule.number()) {
                continue;
            }
            if let Some(charges) = molecule.property(fixed_name).and_then(Property::as_values) {
                if charges.len() == molecule.n_atoms() {
                    sources.push((molecule.number(), molecule.coordinates(), charges));
                }
            }
        }

        let mut changes = Molecules::new();
        for molecule in group.molecules().iter() {
            let fixed = self.base.per_atom(molecule, FIXED_CHARGE_PROPERTY)?;
            let alpha = self.base.per_atom(molecule, POLARISABILITY_PROPERTY)?;
            if fixed.is_empty() {
                continue;
            }
            let weighted: Vec<f64> = molecule
                .coordinates()
                .iter()
                .zip(alpha)
                .map(|(at, a)| a * Self::potential(&space, at, &sources, molecule.number()))
                .collect();
            let mean = weighted.iter().sum::<f64>() / weighted.len() as f64;
            let charges = fixed
                .iter()
                .zip(&weighted)
                .map(|(q, w)| q - (w - mean))
                .collect();
            if let Some(charged) = self.base.with_charges(molecule, charges) {
                changes.insert(charged);
            }
        }
        Ok(changes)
    }
}

impl fmt::Display for PolariseCharges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PolariseCharges( {} )", self.base.mgnum())
    }
}
