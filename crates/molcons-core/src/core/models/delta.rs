use super::ids::{FFIdx, MolNum};
use super::molecule::{Molecule, Molecules};
use super::property::Property;
use crate::core::expression::{Symbol, Values};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Add;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeltaError {
    #[error("Cannot build a delta from {old} to a different molecule {new}")]
    IncompatibleMolecules { old: MolNum, new: MolNum },
}

/// An immutable record of what changes between two states of a system.
///
/// Each entry pairs the value before the change (absent if there was none)
/// with the value after it. Entries whose old and new values agree are never
/// stored, so an empty delta really means "nothing changed".
///
/// The merge counter grows every time content is folded into a delta, which
/// lets callers cheaply tell whether a delta passed through a constraint came
/// back modified.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Delta {
    old_molecules: Molecules,
    new_molecules: Molecules,
    old_components: BTreeMap<Symbol, f64>,
    new_components: BTreeMap<Symbol, f64>,
    old_properties: BTreeMap<String, Property>,
    new_properties: BTreeMap<String, Property>,
    old_ff_properties: BTreeMap<(FFIdx, String), Property>,
    new_ff_properties: BTreeMap<(FFIdx, String), Property>,
    merge_count: u32,
}

impl Delta {
    /// The delta that changes nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Delta replacing a single molecule. Empty if `old` and `new` are the same snapshot.
    pub fn molecule(old: &Molecule, new: Molecule) -> Result<Self, DeltaError> {
        if old.number() != new.number() {
            return Err(DeltaError::IncompatibleMolecules {
                old: old.number(),
                new: new.number(),
            });
        }
        Ok(Self::empty().with_molecule(Some(old), new))
    }

    /// Delta replacing a set of molecules; `old` supplies the prior snapshots.
    pub fn molecules(old: &Molecules, new: Molecules) -> Self {
        new.into_iter().fold(Self::empty(), |delta, molecule| {
            let previous = old.get(molecule.number());
            delta.with_molecule(previous, molecule)
        })
    }

    pub fn component(symbol: Symbol, old: Option<f64>, new: f64) -> Self {
        Self::empty().with_component(symbol, old, new)
    }

    pub fn property(name: &str, old: Option<Property>, new: Property) -> Self {
        Self::empty().with_property(name, old, new)
    }

    pub fn ff_property(ffidx: FFIdx, name: &str, old: Option<Property>, new: Property) -> Self {
        Self::empty().with_ff_property(ffidx, name, old, new)
    }

    pub fn is_empty(&self) -> bool {
        self.new_molecules.is_empty()
            && self.new_components.is_empty()
            && self.new_properties.is_empty()
            && self.new_ff_properties.is_empty()
    }

    pub fn merge_count(&self) -> u32 {
        self.merge_count
    }

    /// Adds or replaces a molecule entry. A previously recorded old snapshot is kept.
    pub fn with_molecule(mut self, old: Option<&Molecule>, new: Molecule) -> Self {
        let molnum = new.number();
        let old = self.old_molecules.get(molnum).or(old).cloned();
        if self.new_molecules.get(molnum) == Some(&new) {
            return self;
        }
        if old.as_ref() == Some(&new) {
            self.new_molecules.remove(molnum);
            self.old_molecules.remove(molnum);
        } else {
            if let Some(old) = old {
                self.old_molecules.insert(old);
            }
            self.new_molecules.insert(new);
        }
        self.merge_count += 1;
        self
    }

    /// Adds or replaces every molecule of `new`, taking old snapshots from `old`.
    pub fn with_molecules(self, old: &Molecules, new: Molecules) -> Self {
        new.into_iter().fold(self, |delta, molecule| {
            let previous = old.get(molecule.number());
            delta.with_molecule(previous, molecule)
        })
    }

    pub fn with_component(mut self, symbol: Symbol, old: Option<f64>, new: f64) -> Self {
        let old = self.old_components.get(&symbol).copied().or(old);
        if self.new_components.get(&symbol) == Some(&new) {
            return self;
        }
        if old == Some(new) {
            self.new_components.remove(&symbol);
            self.old_components.remove(&symbol);
        } else {
            if let Some(old) = old {
                self.old_components.insert(symbol.clone(), old);
            }
            self.new_components.insert(symbol, new);
        }
        self.merge_count += 1;
        self
    }

    pub fn with_property(mut self, name: &str, old: Option<Property>, new: Property) -> Self {
        let old = self.old_properties.get(name).cloned().or(old);
        if self.new_properties.get(name) == Some(&new) {
            return self;
        }
        if old.as_ref() == Some(&new) {
            self.new_properties.remove(name);
            self.old_properties.remove(name);
        } else {
            if let Some(old) = old {
                self.old_properties.insert(name.to_string(), old);
            }
            self.new_properties.insert(name.to_string(), new);
        }
        self.merge_count += 1;
        self
    }

    pub fn with_ff_property(
        mut self,
        ffidx: FFIdx,
        name: &str,
        old: Option<Property>,
        new: Property,
    ) -> Self {
        let key = (ffidx, name.to_string());
        let old = self.old_ff_properties.get(&key).cloned().or(old);
        if self.new_ff_properties.get(&key) == Some(&new) {
            return self;
        }
        if old.as_ref() == Some(&new) {
            self.new_ff_properties.remove(&key);
            self.old_ff_properties.remove(&key);
        } else {
            if let Some(old) = old {
                self.old_ff_properties.insert(key.clone(), old);
            }
            self.new_ff_properties.insert(key, new);
        }
        self.merge_count += 1;
        self
    }

    /// Combines two deltas, `other` being applied after `self`.
    pub fn combine(&self, other: &Delta) -> Delta {
        if self.is_empty() {
            return other.clone();
        }
        if other.is_empty() {
            return self.clone();
        }

        let mut merged = self.clone();
        for molecule in other.new_molecules.iter() {
            let old = other.old_molecules.get(molecule.number());
            merged = merged.with_molecule(old, molecule.clone());
        }
        for (symbol, value) in &other.new_components {
            let old = other.old_components.get(symbol).copied();
            merged = merged.with_component(symbol.clone(), old, *value);
        }
        for (name, value) in &other.new_properties {
            let old = other.old_properties.get(name).cloned();
            merged = merged.with_property(name, old, value.clone());
        }
        for ((ffidx, name), value) in &other.new_ff_properties {
            let old = other
                .old_ff_properties
                .get(&(*ffidx, name.clone()))
                .cloned();
            merged = merged.with_ff_property(*ffidx, name, old, value.clone());
        }
        merged.merge_count = self.merge_count + other.merge_count + 1;
        merged
    }

    pub fn involves_molecule(&self, molnum: MolNum) -> bool {
        self.new_molecules.contains(molnum)
    }

    pub fn new_molecule(&self, molnum: MolNum) -> Option<&Molecule> {
        self.new_molecules.get(molnum)
    }

    pub fn old_molecule(&self, molnum: MolNum) -> Option<&Molecule> {
        self.old_molecules.get(molnum)
    }

    pub fn new_molecules(&self) -> &Molecules {
        &self.new_molecules
    }

    pub fn involves_component(&self, symbol: &Symbol) -> bool {
        self.new_components.contains_key(symbol)
    }

    pub fn involves_any_component<'a>(&self, symbols: impl IntoIterator<Item = &'a Symbol>) -> bool {
        symbols.into_iter().any(|s| self.involves_component(s))
    }

    pub fn new_component(&self, symbol: &Symbol) -> Option<f64> {
        self.new_components.get(symbol).copied()
    }

    pub fn old_component(&self, symbol: &Symbol) -> Option<f64> {
        self.old_components.get(symbol).copied()
    }

    /// The new component values as a set of symbol values.
    pub fn component_values(&self) -> Values {
        self.new_components
            .iter()
            .map(|(s, v)| (s.clone(), *v))
            .collect()
    }

    pub fn new_components(&self) -> impl Iterator<Item = (&Symbol, f64)> {
        self.new_components.iter().map(|(s, v)| (s, *v))
    }

    pub fn involves_property(&self, name: &str) -> bool {
        self.new_properties.contains_key(name)
    }

    pub fn new_property(&self, name: &str) -> Option<&Property> {
        self.new_properties.get(name)
    }

    pub fn old_property(&self, name: &str) -> Option<&Property> {
        self.old_properties.get(name)
    }

    pub fn new_properties(&self) -> impl Iterator<Item = (&str, &Property)> {
        self.new_properties.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn involves_ff_property(&self, ffidx: FFIdx, name: &str) -> bool {
        self.new_ff_properties
            .contains_key(&(ffidx, name.to_string()))
    }

    pub fn new_ff_property(&self, ffidx: FFIdx, name: &str) -> Option<&Property> {
        self.new_ff_properties.get(&(ffidx, name.to_string()))
    }

    pub fn old_ff_property(&self, ffidx: FFIdx, name: &str) -> Option<&Property> {
        self.old_ff_properties.get(&(ffidx, name.to_string()))
    }

    pub fn new_ff_properties(&self) -> impl Iterator<Item = (FFIdx, &str, &Property)> {
        self.new_ff_properties
            .iter()
            .map(|((idx, name), v)| (*idx, name.as_str(), v))
    }
}

impl Add for Delta {
    type Output = Delta;

    fn add(self, rhs: Delta) -> Delta {
        self.combine(&rhs)
    }
}

impl fmt::Display for Delta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("Delta::empty");
        }
        write!(
            f,
            "Delta( molecules={} components={} properties={} ff_properties={} )",
            self.new_molecules.len(),
            self.new_components.len(),
            self.new_properties.len(),
            self.new_ff_properties.len()
        )
    }
}
