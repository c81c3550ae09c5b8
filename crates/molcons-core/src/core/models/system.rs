use super::delta::Delta;
use super::group::MoleculeGroup;
use super::ids::{FFId, FFIdx, MGNum, MolNum, SystemUid, Version};
use super::molecule::{Molecule, Molecules};
use super::property::Property;
use crate::core::expression::{Expression, ExpressionError, Symbol, Values};
use crate::core::space::Space;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Name of the global property holding the simulation [`Space`].
pub const SPACE_PROPERTY: &str = "space";

const MAX_COMPONENT_DEPTH: usize = 64;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SystemError {
    #[error("System has no component '{0}'")]
    MissingComponent(Symbol),
    #[error("Component '{0}' is defined by an expression and cannot be set to a constant")]
    DerivedComponent(Symbol),
    #[error("Component '{0}' depends on itself")]
    CyclicComponent(Symbol),
    #[error("System has no molecule group {0}")]
    MissingGroup(MGNum),
    #[error("Molecule group {0} already exists")]
    DuplicateGroup(MGNum),
    #[error("Molecule {0} is not part of any group in the system")]
    MissingMolecule(MolNum),
    #[error("System has no forcefield at {0}")]
    MissingForceField(FFIdx),
    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

/// A named holder of forcefield-scoped properties.
#[derive(Debug, Clone, PartialEq)]
pub struct ForceField {
    name: String,
    properties: BTreeMap<String, Property>,
}

impl ForceField {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, name: &str, value: impl Into<Property>) -> Self {
        self.properties.insert(name.to_string(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.get(name)
    }
}

/// The versioned simulation system that constraints read from and write to.
///
/// A system carries a unique identity and a `(major, minor)` version. Structural
/// edits (molecule groups, forcefields, group membership) advance the major
/// version; every other edit that changes something advances the minor version
/// by exactly one. Cloning produces a snapshot with the same identity and
/// version, which is what makes snapshot/restore rollback possible.
#[derive(Debug, Clone, PartialEq)]
pub struct System {
    uid: SystemUid,
    name: String,
    version: Version,
    constants: BTreeMap<Symbol, f64>,
    expressions: BTreeMap<Symbol, Expression>,
    properties: BTreeMap<String, Property>,
    forcefields: Vec<ForceField>,
    groups: BTreeMap<MGNum, MoleculeGroup>,
}

impl System {
    pub fn new(name: &str) -> Self {
        Self {
            uid: SystemUid::new(),
            name: name.to_string(),
            version: Version::new(1, 0),
            constants: BTreeMap::new(),
            expressions: BTreeMap::new(),
            properties: BTreeMap::new(),
            forcefields: Vec::new(),
            groups: BTreeMap::new(),
        }
    }

    pub fn uid(&self) -> SystemUid {
        self.uid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> Version {
        self.version
    }

    fn bump_minor(&mut self) {
        self.version = self.version.next_minor();
    }

    fn bump_major(&mut self) {
        self.version = self.version.next_major();
    }

    // --- Components ---

    pub fn constant(&self, symbol: &Symbol) -> Option<f64> {
        self.constants.get(symbol).copied()
    }

    pub fn has_constant(&self, symbol: &Symbol) -> bool {
        self.constants.contains_key(symbol)
    }

    /// All constant components.
    pub fn constants(&self) -> Values {
        self.constants
            .iter()
            .map(|(s, v)| (s.clone(), *v))
            .collect()
    }

    /// Sets a constant component, returning `true` if the system changed.
    pub fn set_constant(&mut self, symbol: Symbol, value: f64) -> Result<bool, SystemError> {
        if self.expressions.contains_key(&symbol) {
            return Err(SystemError::DerivedComponent(symbol));
        }
        if self.constants.get(&symbol) == Some(&value) {
            return Ok(false);
        }
        self.constants.insert(symbol, value);
        self.bump_minor();
        Ok(true)
    }

    /// Defines a component as an expression over other components.
    pub fn set_component_expression(
        &mut self,
        symbol: Symbol,
        expression: Expression,
    ) -> Result<bool, SystemError> {
        if self.expressions.get(&symbol) == Some(&expression) {
            return Ok(false);
        }
        let previous_constant = self.constants.remove(&symbol);
        let previous_expression = self.expressions.insert(symbol.clone(), expression);

        if let Err(e) = self.component_dependencies([&symbol]) {
            // Undo the definition so a rejected expression leaves no trace.
            match previous_expression {
                Some(expr) => self.expressions.insert(symbol.clone(), expr),
                None => self.expressions.remove(&symbol),
            };
            if let Some(value) = previous_constant {
                self.constants.insert(symbol, value);
            }
            return Err(e);
        }
        self.bump_minor();
        Ok(true)
    }

    pub fn has_component(&self, symbol: &Symbol) -> bool {
        self.constants.contains_key(symbol) || self.expressions.contains_key(symbol)
    }

    /// Value of a constant or derived component.
    pub fn component_value(&self, symbol: &Symbol) -> Result<f64, SystemError> {
        self.evaluate_component(symbol, &Values::new(), 0)
    }

    pub fn component_values<'a>(
        &self,
        symbols: impl IntoIterator<Item = &'a Symbol>,
    ) -> Result<Values, SystemError> {
        self.component_values_with(symbols, &Values::new())
    }

    /// Component values as they would be if the constants in `overrides` were set.
    ///
    /// Derived components are re-evaluated against the overridden constants,
    /// so this answers "what if" questions without touching the system.
    pub fn component_values_with<'a>(
        &self,
        symbols: impl IntoIterator<Item = &'a Symbol>,
        overrides: &Values,
    ) -> Result<Values, SystemError> {
        symbols
            .into_iter()
            .map(|s| Ok((s.clone(), self.evaluate_component(s, overrides, 0)?)))
            .collect()
    }

    fn evaluate_component(
        &self,
        symbol: &Symbol,
        overrides: &Values,
        depth: usize,
    ) -> Result<f64, SystemError> {
        if depth > MAX_COMPONENT_DEPTH {
            return Err(SystemError::CyclicComponent(symbol.clone()));
        }
        if let Some(value) = overrides.get(symbol) {
            return Ok(value);
        }
        if let Some(value) = self.constants.get(symbol) {
            return Ok(*value);
        }
        let expression = self
            .expressions
            .get(symbol)
            .ok_or_else(|| SystemError::MissingComponent(symbol.clone()))?;
        let mut values = Values::new();
        for dep in expression.symbols() {
            let value = self.evaluate_component(&dep, overrides, depth + 1)?;
            values.set(dep, value);
        }
        Ok(expression.evaluate(&values)?)
    }

    /// The constant components that `symbols` ultimately read, following derived components.
    ///
    /// Symbols that are not defined in the system are returned as-is, so a
    /// constraint still notices when they are created later.
    pub fn component_dependencies<'a>(
        &self,
        symbols: impl IntoIterator<Item = &'a Symbol>,
    ) -> Result<BTreeSet<Symbol>, SystemError> {
        let mut out = BTreeSet::new();
        for symbol in symbols {
            self.collect_dependencies(symbol, &mut out, 0)?;
        }
        Ok(out)
    }

    fn collect_dependencies(
        &self,
        symbol: &Symbol,
        out: &mut BTreeSet<Symbol>,
        depth: usize,
    ) -> Result<(), SystemError> {
        if depth > MAX_COMPONENT_DEPTH {
            return Err(SystemError::CyclicComponent(symbol.clone()));
        }
        match self.expressions.get(symbol) {
            Some(expression) => {
                for dep in expression.symbols() {
                    self.collect_dependencies(&dep, out, depth + 1)?;
                }
            }
            None => {
                out.insert(symbol.clone());
            }
        }
        Ok(())
    }

    // --- Properties ---

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.get(name)
    }

    pub fn contains_property(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    pub fn set_property(&mut self, name: &str, value: Property) -> bool {
        if self.properties.get(name) == Some(&value) {
            return false;
        }
        self.properties.insert(name.to_string(), value);
        self.bump_minor();
        true
    }

    /// The simulation space, read from the `space` property (cartesian if unset).
    pub fn space(&self) -> Space {
        self.space_named(SPACE_PROPERTY)
    }

    pub fn space_named(&self, property: &str) -> Space {
        self.properties
            .get(property)
            .and_then(Property::as_space)
            .copied()
            .unwrap_or_default()
    }

    pub fn set_space(&mut self, space: Space) -> bool {
        self.set_property(SPACE_PROPERTY, Property::Space(space))
    }

    // --- Forcefields ---

    pub fn add_forcefield(&mut self, forcefield: ForceField) -> FFIdx {
        self.forcefields.push(forcefield);
        self.bump_major();
        FFIdx(self.forcefields.len() - 1)
    }

    pub fn forcefields(&self) -> &[ForceField] {
        &self.forcefields
    }

    /// Indices of every forcefield matched by `ffid`.
    pub fn resolve(&self, ffid: &FFId) -> Vec<FFIdx> {
        match ffid {
            FFId::Index(idx) if idx.0 < self.forcefields.len() => vec![*idx],
            FFId::Index(_) => Vec::new(),
            FFId::Name(name) => self
                .forcefields
                .iter()
                .enumerate()
                .filter(|(_, ff)| ff.name == *name)
                .map(|(i, _)| FFIdx(i))
                .collect(),
        }
    }

    pub fn ff_property(&self, ffidx: FFIdx, name: &str) -> Option<&Property> {
        self.forcefields.get(ffidx.0)?.properties.get(name)
    }

    pub fn set_ff_property(
        &mut self,
        ffidx: FFIdx,
        name: &str,
        value: Property,
    ) -> Result<bool, SystemError> {
        let forcefield = self
            .forcefields
            .get_mut(ffidx.0)
            .ok_or(SystemError::MissingForceField(ffidx))?;
        if forcefield.properties.get(name) == Some(&value) {
            return Ok(false);
        }
        forcefield.properties.insert(name.to_string(), value);
        self.bump_minor();
        Ok(true)
    }

    // --- Molecule groups ---

    pub fn add_group(&mut self, group: MoleculeGroup) -> Result<(), SystemError> {
        if self.groups.contains_key(&group.number()) {
            return Err(SystemError::DuplicateGroup(group.number()));
        }
        self.groups.insert(group.number(), group);
        self.bump_major();
        Ok(())
    }

    pub fn group(&self, mgnum: MGNum) -> Result<&MoleculeGroup, SystemError> {
        self.groups
            .get(&mgnum)
            .ok_or(SystemError::MissingGroup(mgnum))
    }

    pub fn groups(&self) -> impl Iterator<Item = &MoleculeGroup> {
        self.groups.values()
    }

    /// The current version of a molecule, taken from the first group containing it.
    pub fn molecule(&self, molnum: MolNum) -> Result<&Molecule, SystemError> {
        self.groups
            .values()
            .find_map(|g| g.molecule(molnum))
            .ok_or(SystemError::MissingMolecule(molnum))
    }

    pub fn contains_molecule(&self, molnum: MolNum) -> bool {
        self.groups.values().any(|g| g.contains(molnum))
    }

    pub fn add_molecule(&mut self, mgnum: MGNum, molecule: Molecule) -> Result<bool, SystemError> {
        let group = self
            .groups
            .get_mut(&mgnum)
            .ok_or(SystemError::MissingGroup(mgnum))?;
        let added = group.add(molecule);
        if added {
            self.bump_major();
        }
        Ok(added)
    }

    pub fn remove_molecule(
        &mut self,
        mgnum: MGNum,
        molnum: MolNum,
    ) -> Result<Option<Molecule>, SystemError> {
        let group = self
            .groups
            .get_mut(&mgnum)
            .ok_or(SystemError::MissingGroup(mgnum))?;
        let removed = group.remove(molnum);
        if removed.is_some() {
            self.bump_major();
        }
        Ok(removed)
    }

    /// Commits a batch of changed molecules to every group that contains them.
    pub fn update(&mut self, molecules: &Molecules) -> Result<bool, SystemError> {
        if let Some(missing) = molecules.numbers().find(|n| !self.contains_molecule(*n)) {
            return Err(SystemError::MissingMolecule(missing));
        }
        let changed = self.write_molecules(molecules);
        if changed {
            self.bump_minor();
        }
        Ok(changed)
    }

    fn write_molecules(&mut self, molecules: &Molecules) -> bool {
        let mut changed = false;
        for molecule in molecules.iter() {
            for group in self.groups.values_mut() {
                changed |= group.update(molecule);
            }
        }
        changed
    }

    /// Commits every change recorded in `delta` as a single minor version step.
    ///
    /// The delta is validated before anything is written, so a rejected delta
    /// leaves the system untouched.
    pub fn apply_delta(&mut self, delta: &Delta) -> Result<bool, SystemError> {
        if delta.is_empty() {
            return Ok(false);
        }
        if let Some((symbol, _)) = delta
            .new_components()
            .find(|(s, _)| self.expressions.contains_key(*s))
        {
            return Err(SystemError::DerivedComponent(symbol.clone()));
        }
        if let Some((ffidx, _, _)) = delta
            .new_ff_properties()
            .find(|(idx, _, _)| idx.0 >= self.forcefields.len())
        {
            return Err(SystemError::MissingForceField(ffidx));
        }
        if let Some(missing) = delta
            .new_molecules()
            .numbers()
            .find(|n| !self.contains_molecule(*n))
        {
            return Err(SystemError::MissingMolecule(missing));
        }

        let mut changed = false;
        for (symbol, value) in delta.new_components() {
            if self.constants.get(symbol) != Some(&value) {
                self.constants.insert(symbol.clone(), value);
                changed = true;
            }
        }
        for (name, value) in delta.new_properties() {
            if self.properties.get(name) != Some(value) {
                self.properties.insert(name.to_string(), value.clone());
                changed = true;
            }
        }
        for (ffidx, name, value) in delta.new_ff_properties() {
            let forcefield = &mut self.forcefields[ffidx.0];
            if forcefield.properties.get(name) != Some(value) {
                forcefield.properties.insert(name.to_string(), value.clone());
                changed = true;
            }
        }
        changed |= self.write_molecules(delta.new_molecules());

        if changed {
            self.bump_minor();
        }
        Ok(changed)
    }
}
