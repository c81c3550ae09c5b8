use super::{MoleculeConstraint, SyncState, molecule_constraint_boilerplate, molecule_constraint_impl};
use crate::core::expression::{Symbol, Values};
use crate::core::models::delta::Delta;
use crate::core::models::ids::{MGNum, MolNum, Version};
use crate::core::models::molecule::{Molecule, Molecules};
use crate::core::models::property::{Property, PropertyMap};
use crate::core::models::system::System;
use crate::core::perturbation::Perturbation;
use crate::engine::constraint::ConstraintState;
use crate::engine::error::ConstraintError;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

/// Default name of the molecule property listing a molecule's perturbations.
pub const PERTURBATIONS_PROPERTY: &str = "perturbations";

#[derive(Debug, Clone, PartialEq)]
struct PerturbationRecord {
    perturbations: Vec<Perturbation>,
    values: Values,
    /// Version of the molecule the record was computed from.
    source: Version,
}

/// Keeps every molecule of a group consistent with its own perturbations.
///
/// Each molecule may carry a list of [`Perturbation`]s. The constraint
/// evaluates them with the current system components and requires the
/// perturbed properties to hold the resulting values.
#[derive(Debug, Clone)]
pub struct PerturbationConstraint {
    mgnum: MGNum,
    map: PropertyMap,

    sync: SyncState,
    members: BTreeSet<MolNum>,
    symbols: BTreeSet<Symbol>,
    records: BTreeMap<MolNum, PerturbationRecord>,
    perturbed: BTreeMap<MolNum, Molecule>,
    state: ConstraintState,
}

impl PerturbationConstraint {
    pub fn new(mgnum: MGNum) -> Self {
        Self::with_map(mgnum, PropertyMap::new())
    }

    /// Reads the perturbation list through `map` (key `perturbations`).
    pub fn with_map(mgnum: MGNum, map: PropertyMap) -> Self {
        Self {
            mgnum,
            map,
            sync: SyncState::default(),
            members: BTreeSet::new(),
            symbols: BTreeSet::new(),
            records: BTreeMap::new(),
            perturbed: BTreeMap::new(),
            state: ConstraintState::default(),
        }
    }

    pub fn mgnum(&self) -> MGNum {
        self.mgnum
    }

    pub fn perturbation_property(&self) -> &str {
        self.map.get(PERTURBATIONS_PROPERTY)
    }

    /// Returns `true` if perturbation data is cached for `molnum`.
    pub fn is_tracking(&self, molnum: MolNum) -> bool {
        self.records.contains_key(&molnum)
    }

    /// The pending perturbed version of `molnum`, if it differs from the system's.
    pub fn perturbed_molecule(&self, molnum: MolNum) -> Option<&Molecule> {
        self.perturbed.get(&molnum)
    }

    fn purge_departed(&mut self) {
        let members = &self.members;
        let before = self.records.len();
        self.records.retain(|molnum, _| members.contains(molnum));
        self.perturbed.retain(|molnum, _| members.contains(molnum));
        if self.records.len() != before {
            debug!(
                group = %self.mgnum,
                purged = before - self.records.len(),
                "Dropped perturbation data of molecules that left the group"
            );
        }
    }

    fn perturb(&mut self, molecule: &Molecule, values: &Values) -> Result<(), ConstraintError> {
        let molnum = molecule.number();
        let perturbations = match molecule
            .property(self.perturbation_property())
            .and_then(Property::as_perturbations)
        {
            Some(perturbations) => perturbations.to_vec(),
            None => {
                self.records.remove(&molnum);
                self.perturbed.remove(&molnum);
                return Ok(());
            }
        };

        let record_values: Values = perturbations
            .iter()
            .flat_map(|p| p.symbols())
            .filter_map(|s| values.get(&s).map(|v| (s, v)))
            .collect();
        let unchanged = self.records.get(&molnum).is_some_and(|r| {
            r.source == molecule.version()
                && r.perturbations == perturbations
                && r.values == record_values
        });
        if unchanged {
            return Ok(());
        }

        let mut result = molecule.clone();
        for perturbation in &perturbations {
            result = perturbation.perturb(&result, values)?;
        }
        if result == *molecule {
            self.perturbed.remove(&molnum);
        } else {
            self.perturbed.insert(molnum, result);
        }
        self.records.insert(
            molnum,
            PerturbationRecord {
                perturbations,
                values: record_values,
                source: molecule.version(),
            },
        );
        Ok(())
    }

    fn affected_by(&self, delta: &Delta) -> bool {
        delta.involves_any_component(&self.symbols)
            || self.members.iter().any(|m| delta.involves_molecule(*m))
    }
}

impl PartialEq for PerturbationConstraint {
    fn eq(&self, other: &Self) -> bool {
        self.mgnum == other.mgnum && self.map == other.map
    }
}

molecule_constraint_impl!(PerturbationConstraint, "perturbation");

impl MoleculeConstraint for PerturbationConstraint {
    molecule_constraint_boilerplate!();

    fn update(&mut self, system: &System) -> Result<Molecules, ConstraintError> {
        let group = system.group(self.mgnum)?;
        let structure_changed = self.sync.structure_changed(system);
        self.members = group.molecules().numbers().collect();
        if structure_changed {
            self.purge_departed();
        }

        let property = self.perturbation_property().to_string();
        self.symbols = group
            .molecules()
            .iter()
            .filter_map(|m| m.property(&property).and_then(Property::as_perturbations))
            .flatten()
            .flat_map(Perturbation::symbols)
            .collect();
        let values = system.component_values(&self.symbols)?;

        for molecule in group.molecules().iter() {
            self.perturb(molecule, &values)?;
        }
        self.sync.sync(system);
        Ok(self.perturbed.values().cloned().collect())
    }
}

impl fmt::Display for PerturbationConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PerturbationConstraint( {}, property = {} )",
            self.mgnum,
            self.perturbation_property()
        )
    }
}
