use super::ids::{MolNum, Version};
use super::property::Property;
use nalgebra::{Point3, Vector3};
use std::collections::BTreeMap;

/// A versioned molecule: coordinates plus named per-molecule properties.
///
/// Every edit that actually changes the molecule advances its minor version,
/// so two snapshots with equal number and version hold the same data.
#[derive(Debug, Clone, PartialEq)]
pub struct Molecule {
    number: MolNum,
    name: String,
    version: Version,
    coordinates: Vec<Point3<f64>>,
    properties: BTreeMap<String, Property>,
}

impl Molecule {
    pub fn new(number: MolNum, name: &str, coordinates: Vec<Point3<f64>>) -> Self {
        Self {
            number,
            name: name.to_string(),
            version: Version::new(1, 0),
            coordinates,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, name: &str, value: impl Into<Property>) -> Self {
        self.set_property(name, value.into());
        self
    }

    pub fn number(&self) -> MolNum {
        self.number
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn n_atoms(&self) -> usize {
        self.coordinates.len()
    }

    pub fn coordinates(&self) -> &[Point3<f64>] {
        &self.coordinates
    }

    /// Geometric centre of the atoms (the origin for an empty molecule).
    pub fn center(&self) -> Point3<f64> {
        if self.coordinates.is_empty() {
            return Point3::origin();
        }
        let sum = self
            .coordinates
            .iter()
            .fold(Vector3::zeros(), |acc, p| acc + p.coords);
        Point3::from(sum / self.coordinates.len() as f64)
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.get(name)
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    pub fn properties(&self) -> impl Iterator<Item = (&str, &Property)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Sets a property, returning `true` if the molecule changed.
    pub fn set_property(&mut self, name: &str, value: Property) -> bool {
        if self.properties.get(name) == Some(&value) {
            return false;
        }
        self.properties.insert(name.to_string(), value);
        self.version = self.version.next_minor();
        true
    }

    /// Replaces the coordinates, returning `true` if the molecule changed.
    pub fn set_coordinates(&mut self, coordinates: Vec<Point3<f64>>) -> bool {
        if self.coordinates == coordinates {
            return false;
        }
        self.coordinates = coordinates;
        self.version = self.version.next_minor();
        true
    }

    /// Returns `true` if both molecules hold the same data, whatever their versions.
    pub fn same_content(&self, other: &Molecule) -> bool {
        self.number == other.number
            && self.name == other.name
            && self.coordinates == other.coordinates
            && self.properties == other.properties
    }

    pub(crate) fn stamp(&mut self, version: Version) {
        self.version = version;
    }

    /// Rigidly moves every atom, returning `true` if the molecule changed.
    pub fn translate(&mut self, delta: &Vector3<f64>) -> bool {
        if *delta == Vector3::zeros() {
            return false;
        }
        for p in &mut self.coordinates {
            *p += delta;
        }
        self.version = self.version.next_minor();
        true
    }
}

/// An ordered collection of molecules keyed by molecule number.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Molecules(BTreeMap<MolNum, Molecule>);

impl Molecules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a molecule, replacing any previous version with the same number.
    pub fn insert(&mut self, molecule: Molecule) {
        self.0.insert(molecule.number(), molecule);
    }

    pub fn get(&self, molnum: MolNum) -> Option<&Molecule> {
        self.0.get(&molnum)
    }

    pub fn get_mut(&mut self, molnum: MolNum) -> Option<&mut Molecule> {
        self.0.get_mut(&molnum)
    }

    pub fn contains(&self, molnum: MolNum) -> bool {
        self.0.contains_key(&molnum)
    }

    pub fn remove(&mut self, molnum: MolNum) -> Option<Molecule> {
        self.0.remove(&molnum)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn numbers(&self) -> impl Iterator<Item = MolNum> + '_ {
        self.0.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Molecule> {
        self.0.values()
    }

    /// Adds every molecule of `other`, with `other` winning on conflicts.
    pub fn unite(&mut self, other: Molecules) {
        self.0.extend(other.0);
    }
}

impl From<Molecule> for Molecules {
    fn from(molecule: Molecule) -> Self {
        let mut molecules = Molecules::new();
        molecules.insert(molecule);
        molecules
    }
}

impl FromIterator<Molecule> for Molecules {
    fn from_iter<I: IntoIterator<Item = Molecule>>(iter: I) -> Self {
        Self(iter.into_iter().map(|m| (m.number(), m)).collect())
    }
}

impl IntoIterator for Molecules {
    type Item = Molecule;
    type IntoIter = std::collections::btree_map::IntoValues<MolNum, Molecule>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn water(n: u32, x: f64) -> Molecule {
        Molecule::new(
            MolNum(n),
            "WAT",
            vec![
                Point3::new(x, 0.0, 0.0),
                Point3::new(x + 1.0, 0.0, 0.0),
                Point3::new(x + 2.0, 0.0, 0.0),
            ],
        )
    }

    #[test]
    fn center_is_mean_of_coordinates() {
        assert_eq!(water(1, 3.0).center(), Point3::new(4.0, 0.0, 0.0));
    }

    #[test]
    fn edits_bump_version_only_when_something_changes() {
        let mut mol = water(1, 0.0);
        let v0 = mol.version();

        assert!(!mol.translate(&Vector3::zeros()));
        assert_eq!(mol.version(), v0);

        assert!(mol.set_property("charge", Property::Number(1.0)));
        assert!(!mol.set_property("charge", Property::Number(1.0)));
        assert_eq!(mol.version(), v0.next_minor());

        assert!(mol.translate(&Vector3::new(1.0, 0.0, 0.0)));
        assert_eq!(mol.version(), v0.next_minor().next_minor());
    }

    #[test]
    fn same_content_ignores_versions() {
        let mut moved = water(1, 0.0);
        moved.translate(&Vector3::new(1.0, 0.0, 0.0));
        assert!(moved.same_content(&water(1, 1.0)));
        assert_ne!(moved, water(1, 1.0));
        assert!(!moved.same_content(&water(1, 0.0)));
    }

    #[test]
    fn unite_prefers_incoming_molecules() {
        let mut a: Molecules = vec![water(1, 0.0), water(2, 5.0)].into_iter().collect();
        let mut moved = water(2, 5.0);
        moved.translate(&Vector3::new(1.0, 0.0, 0.0));
        a.unite(Molecules::from(moved.clone()));

        assert_eq!(a.len(), 2);
        assert_eq!(a.get(MolNum(2)), Some(&moved));
    }
}
