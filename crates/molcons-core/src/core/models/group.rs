use super::ids::{MGNum, MolNum, Version};
use super::molecule::{Molecule, Molecules};

/// A numbered, versioned collection of molecules.
///
/// Adding or removing molecules advances the major version; replacing a
/// contained molecule with a different version advances the minor version.
#[derive(Debug, Clone, PartialEq)]
pub struct MoleculeGroup {
    number: MGNum,
    name: String,
    version: Version,
    molecules: Molecules,
}

impl MoleculeGroup {
    pub fn new(number: MGNum, name: &str) -> Self {
        Self {
            number,
            name: name.to_string(),
            version: Version::new(1, 0),
            molecules: Molecules::new(),
        }
    }

    pub fn with_molecule(mut self, molecule: Molecule) -> Self {
        self.add(molecule);
        self
    }

    pub fn number(&self) -> MGNum {
        self.number
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn molecules(&self) -> &Molecules {
        &self.molecules
    }

    pub fn molecule(&self, molnum: MolNum) -> Option<&Molecule> {
        self.molecules.get(molnum)
    }

    pub fn contains(&self, molnum: MolNum) -> bool {
        self.molecules.contains(molnum)
    }

    pub fn n_molecules(&self) -> usize {
        self.molecules.len()
    }

    /// Adds a molecule, returning `false` if one with this number is already present.
    pub fn add(&mut self, molecule: Molecule) -> bool {
        if self.molecules.contains(molecule.number()) {
            return false;
        }
        self.molecules.insert(molecule);
        self.version = self.version.next_major();
        true
    }

    pub fn remove(&mut self, molnum: MolNum) -> Option<Molecule> {
        let removed = self.molecules.remove(molnum)?;
        self.version = self.version.next_major();
        Some(removed)
    }

    /// Replaces a contained molecule, returning `true` if the group changed.
    ///
    /// The stored copy always ends up with a version newer than the one it
    /// replaces, so equal number and version keep meaning equal data even when
    /// the caller hands in a fresh molecule or a stale clone.
    pub fn update(&mut self, molecule: &Molecule) -> bool {
        let Some(current) = self.molecules.get_mut(molecule.number()) else {
            return false;
        };
        if current.same_content(molecule) {
            return false;
        }
        let version = if molecule.version() > current.version() {
            molecule.version()
        } else {
            current.version().next_minor()
        };
        *current = molecule.clone();
        current.stamp(version);
        self.version = self.version.next_minor();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::property::Property;
    use nalgebra::Point3;

    fn mol(n: u32) -> Molecule {
        Molecule::new(MolNum(n), "ION", vec![Point3::new(n as f64, 0.0, 0.0)])
    }

    #[test]
    fn structural_changes_bump_major_version() {
        let mut group = MoleculeGroup::new(MGNum(1), "solvent");
        let v0 = group.version();
        assert!(group.add(mol(1)));
        assert!(!group.add(mol(1)));
        assert_eq!(group.version(), v0.next_major());
        assert!(group.remove(MolNum(1)).is_some());
        assert_eq!(group.version(), v0.next_major().next_major());
        assert!(group.remove(MolNum(1)).is_none());
    }

    #[test]
    fn update_bumps_minor_version_only_for_contained_changed_molecules() {
        let mut group = MoleculeGroup::new(MGNum(1), "solvent").with_molecule(mol(1));
        let v0 = group.version();

        assert!(!group.update(&mol(1)));
        assert!(!group.update(&mol(2)));

        let changed = mol(1).with_property("charge", Property::Number(-1.0));
        assert!(group.update(&changed));
        assert_eq!(group.version(), v0.next_minor());
        assert_eq!(group.molecule(MolNum(1)), Some(&changed));
    }

    #[test]
    fn fresh_molecule_with_the_same_number_gets_a_newer_version() {
        let mut group = MoleculeGroup::new(MGNum(1), "solvent").with_molecule(mol(1));
        let before = group.molecule(MolNum(1)).unwrap().version();

        let fresh = Molecule::new(MolNum(1), "ION", vec![Point3::new(5.0, 0.0, 0.0)]);
        assert_eq!(fresh.version(), before);
        assert!(group.update(&fresh));

        let stored = group.molecule(MolNum(1)).unwrap();
        assert!(stored.same_content(&fresh));
        assert_eq!(stored.version(), before.next_minor());
    }

    #[test]
    fn competing_edits_of_one_snapshot_get_distinct_versions() {
        let mut group = MoleculeGroup::new(MGNum(1), "solvent").with_molecule(mol(1));
        let snapshot = group.molecule(MolNum(1)).unwrap().clone();
        let first = snapshot.clone().with_property("charge", Property::Number(1.0));
        let second = snapshot.with_property("charge", Property::Number(-1.0));
        assert_eq!(first.version(), second.version());

        assert!(group.update(&first));
        assert!(group.update(&second));
        assert_eq!(
            group.molecule(MolNum(1)).unwrap().version(),
            first.version().next_minor()
        );
    }

    #[test]
    fn identical_data_with_another_version_is_not_a_change() {
        let mut group = MoleculeGroup::new(MGNum(1), "solvent").with_molecule(mol(1));
        let v0 = group.version();
        let mut restamped = mol(1);
        restamped.stamp(restamped.version().next_minor());
        assert!(!group.update(&restamped));
        assert_eq!(group.version(), v0);
    }
}
