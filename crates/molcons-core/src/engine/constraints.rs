use super::config::ApplyConfig;
use super::constraint::{Constraint, ConstraintHandle};
use super::error::{ConstraintError, Stage, Violation};
use super::kinds::component::ComponentConstraint;
use super::kinds::geometry::{DistanceComponent, Geometry, GeometryComponent};
use super::kinds::property::PropertyConstraint;
use super::kinds::windowed::WindowedComponent;
use super::molecule::charge::PolariseCharges;
use super::molecule::identity::IdentityConstraint;
use super::molecule::perturbation::{PERTURBATIONS_PROPERTY, PerturbationConstraint};
use super::molecule::space_wrapper::SpaceWrapper;
use super::molecule::MoleculeConstraintHandle;
use crate::core::io::scenario::ConstraintSpec;
use crate::core::models::delta::Delta;
use crate::core::models::ids::MolNum;
use crate::core::models::molecule::Molecules;
use crate::core::models::property::PropertyMap;
use crate::core::models::system::System;
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info, instrument, trace, warn};

/// A constraint of either pool, as accepted by [`Constraints::add`].
#[derive(Debug, Clone)]
pub enum AnyConstraint {
    Ordinary(ConstraintHandle),
    Molecule(MoleculeConstraintHandle),
}

impl From<ConstraintHandle> for AnyConstraint {
    fn from(handle: ConstraintHandle) -> Self {
        AnyConstraint::Ordinary(handle)
    }
}

impl From<MoleculeConstraintHandle> for AnyConstraint {
    fn from(handle: MoleculeConstraintHandle) -> Self {
        AnyConstraint::Molecule(handle)
    }
}

macro_rules! impl_from_ordinary {
    ($($ty:ty),*) => {
        $(impl From<$ty> for AnyConstraint {
            fn from(constraint: $ty) -> Self {
                AnyConstraint::Ordinary(ConstraintHandle::new(constraint))
            }
        })*
    };
}

macro_rules! impl_from_molecule {
    ($($ty:ty),*) => {
        $(impl From<$ty> for AnyConstraint {
            fn from(constraint: $ty) -> Self {
                AnyConstraint::Molecule(MoleculeConstraintHandle::new(constraint))
            }
        })*
    };
}

impl_from_ordinary!(ComponentConstraint, PropertyConstraint, WindowedComponent);
impl_from_molecule!(PerturbationConstraint, SpaceWrapper, IdentityConstraint, PolariseCharges);

impl<G: Geometry> From<GeometryComponent<G>> for AnyConstraint {
    fn from(constraint: GeometryComponent<G>) -> Self {
        AnyConstraint::Ordinary(ConstraintHandle::new(constraint))
    }
}

impl TryFrom<ConstraintSpec> for AnyConstraint {
    type Error = ConstraintError;

    fn try_from(spec: ConstraintSpec) -> Result<Self, Self::Error> {
        Ok(match spec {
            ConstraintSpec::Property {
                property,
                forcefield: Some(ffid),
                expression,
            } => PropertyConstraint::for_forcefield(ffid, &property, expression).into(),
            ConstraintSpec::Property {
                property,
                forcefield: None,
                expression,
            } => PropertyConstraint::new(&property, expression).into(),
            ConstraintSpec::Component { symbol, expression } => {
                ComponentConstraint::new(symbol, expression)?.into()
            }
            ConstraintSpec::Windowed {
                symbol,
                reference,
                values,
                step,
            } => WindowedComponent::new(symbol, reference, values, step)?.into(),
            ConstraintSpec::Distance {
                symbol,
                point0,
                point1,
                expression,
            } => DistanceComponent::new(symbol, point0, point1, expression)?.into(),
            ConstraintSpec::Perturbation { group, property } => {
                let map = property.map_or_else(PropertyMap::new, |name| {
                    PropertyMap::new().with(PERTURBATIONS_PROPERTY, &name)
                });
                PerturbationConstraint::with_map(group, map).into()
            }
            ConstraintSpec::SpaceWrapper { group, point } => SpaceWrapper::new(point, group).into(),
            ConstraintSpec::Identity {
                group,
                points,
                nbuffer,
            } => {
                let identity = IdentityConstraint::new(points, group);
                let identity = match nbuffer {
                    Some(nbuffer) => identity.with_nbuffer(nbuffer),
                    None => identity,
                };
                identity.into()
            }
            ConstraintSpec::PolariseCharges { group } => PolariseCharges::new(group).into(),
        })
    }
}

/// Iteration counts and molecules touched by one [`Constraints::apply`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyStats {
    /// Passes over the ordinary constraints, including the final quiet pass.
    pub passes: usize,
    /// Molecule resolution passes, including the final quiet pass.
    pub molecule_passes: usize,
    pub molecules_changed: BTreeSet<MolNum>,
}

#[derive(Clone, Copy)]
enum Hint<'a> {
    All,
    Molecule(MolNum),
    Molecules(&'a Molecules),
}

/// Two pools of constraints applied together to a system.
///
/// Ordinary constraints are iterated to a fixed point first, then molecule
/// constraints are resolved against each other. Cloning is cheap: the pools
/// hold copy-on-write handles, so a clone only pays for the constraints it
/// later evaluates.
#[derive(Debug, Clone, Default)]
pub struct Constraints {
    cons: Vec<ConstraintHandle>,
    molcons: Vec<MoleculeConstraintHandle>,
}

impl Constraints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a pool from scenario descriptions, in order.
    pub fn from_specs(
        specs: impl IntoIterator<Item = ConstraintSpec>,
    ) -> Result<Self, ConstraintError> {
        let mut constraints = Self::new();
        for spec in specs {
            constraints.add(AnyConstraint::try_from(spec)?);
        }
        Ok(constraints)
    }

    /// Adds a constraint, returning `false` if an equal ordinary constraint is already present.
    ///
    /// Molecule constraints are always appended.
    pub fn add(&mut self, constraint: impl Into<AnyConstraint>) -> bool {
        match constraint.into() {
            AnyConstraint::Ordinary(handle) => {
                if self.cons.contains(&handle) {
                    debug!(constraint = %handle, "Skipping duplicate constraint");
                    return false;
                }
                self.cons.push(handle);
            }
            AnyConstraint::Molecule(handle) => self.molcons.push(handle),
        }
        true
    }

    /// Removes every constraint equal to `constraint`, returning whether any was removed.
    pub fn remove(&mut self, constraint: impl Into<AnyConstraint>) -> bool {
        match constraint.into() {
            AnyConstraint::Ordinary(handle) => {
                let before = self.cons.len();
                self.cons.retain(|c| *c != handle);
                self.cons.len() != before
            }
            AnyConstraint::Molecule(handle) => {
                let before = self.molcons.len();
                self.molcons.retain(|c| *c != handle);
                self.molcons.len() != before
            }
        }
    }

    /// Total number of constraints in both pools.
    pub fn n_constraints(&self) -> usize {
        self.cons.len() + self.molcons.len()
    }

    pub fn n_molecule_constraints(&self) -> usize {
        self.molcons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.n_constraints() == 0
    }

    /// The constraint at `index`, counting ordinary constraints first.
    pub fn get(&self, index: usize) -> Option<&dyn Constraint> {
        match index.checked_sub(self.cons.len()) {
            None => self.cons.get(index).map(|c| &**c),
            Some(i) => self.molcons.get(i).map(|c| c.as_constraint()),
        }
    }

    pub fn constraints(&self) -> &[ConstraintHandle] {
        &self.cons
    }

    pub fn molecule_constraints(&self) -> &[MoleculeConstraintHandle] {
        &self.molcons
    }

    pub fn clear_last_system(&mut self) {
        for c in &mut self.cons {
            c.make_mut().clear_last_system();
        }
        for c in &mut self.molcons {
            c.make_mut().clear_last_system();
        }
    }

    /// Applies every constraint to `system` until all of them hold.
    ///
    /// On any error both `system` and the constraint pools are restored to
    /// their state before the call.
    #[instrument(skip_all, name = "constraints_apply", fields(system = %system.name()))]
    pub fn apply(
        &mut self,
        system: &mut System,
        config: &ApplyConfig,
    ) -> Result<ApplyStats, ConstraintError> {
        self.atomically(system, |constraints, system| {
            let mut stats = ApplyStats::default();
            if !constraints.cons.is_empty() {
                stats.passes = constraints.apply_components(system, config.max_passes)?;
            }
            constraints.apply_molecules(system, Hint::All, config.max_molecule_passes, &mut stats)?;
            info!(
                passes = stats.passes,
                molecule_passes = stats.molecule_passes,
                molecules_changed = stats.molecules_changed.len(),
                version = %system.version(),
                "Constraints converged"
            );
            Ok(stats)
        })
    }

    /// Applies only the molecule constraints, treating the whole system as changed.
    pub fn apply_molecule_constraints(
        &mut self,
        system: &mut System,
        config: &ApplyConfig,
    ) -> Result<ApplyStats, ConstraintError> {
        self.apply_molecule_constraints_hinted(system, Hint::All, config)
    }

    /// Applies only the molecule constraints, hinted that just `molnum` changed.
    pub fn apply_molecule_constraints_for_molecule(
        &mut self,
        system: &mut System,
        molnum: MolNum,
        config: &ApplyConfig,
    ) -> Result<ApplyStats, ConstraintError> {
        self.apply_molecule_constraints_hinted(system, Hint::Molecule(molnum), config)
    }

    /// Applies only the molecule constraints, hinted that just `molecules` changed.
    pub fn apply_molecule_constraints_for_molecules(
        &mut self,
        system: &mut System,
        molecules: &Molecules,
        config: &ApplyConfig,
    ) -> Result<ApplyStats, ConstraintError> {
        let hint = if molecules.is_empty() {
            Hint::All
        } else {
            Hint::Molecules(molecules)
        };
        self.apply_molecule_constraints_hinted(system, hint, config)
    }

    fn apply_molecule_constraints_hinted(
        &mut self,
        system: &mut System,
        hint: Hint<'_>,
        config: &ApplyConfig,
    ) -> Result<ApplyStats, ConstraintError> {
        self.atomically(system, |constraints, system| {
            let mut stats = ApplyStats::default();
            constraints.apply_molecules(system, hint, config.max_molecule_passes, &mut stats)?;
            Ok(stats)
        })
    }

    /// Runs `action`, restoring `system` and `self` to their prior state if it fails.
    fn atomically<R>(
        &mut self,
        system: &mut System,
        action: impl FnOnce(&mut Self, &mut System) -> Result<R, ConstraintError>,
    ) -> Result<R, ConstraintError> {
        let system_snapshot = system.clone();
        let pool_snapshot = self.clone();
        let result = action(self, system);
        if let Err(err) = &result {
            warn!(error = %err, version = %system_snapshot.version(), "Rolling back system and constraints");
            *system = system_snapshot;
            *self = pool_snapshot;
        }
        result
    }

    /// Commits each ordinary constraint in pool order until a full pass changes nothing.
    #[instrument(skip_all, level = "debug")]
    fn apply_components(
        &mut self,
        system: &mut System,
        max_passes: usize,
    ) -> Result<usize, ConstraintError> {
        for pass in 1..=max_passes {
            let mut changed = false;
            for i in 0..self.cons.len() {
                let delta = self.cons[i].make_mut().commit(system)?;
                if delta.is_empty() {
                    continue;
                }
                changed = true;
                trace!(pass, constraint = %self.cons[i], version = %system.version(), "Committed");
                self.propagate(i, system, &delta)?;
            }
            if !changed {
                debug!(pass, "Ordinary constraints reached a fixed point");
                return Ok(pass);
            }
            debug!(pass, "Ordinary constraints changed the system");
        }
        let violations =
            Self::violations_in(&mut self.cons, 0, |c| c.make_mut().is_satisfied(system))?;
        Err(ConstraintError::NonConvergence {
            stage: Stage::Components,
            passes: max_passes,
            system: system.name().to_string(),
            violations,
        })
    }

    /// Lets every other ordinary constraint one step behind `system` catch up on `delta`.
    fn propagate(
        &mut self,
        committed_by: usize,
        system: &System,
        delta: &Delta,
    ) -> Result<(), ConstraintError> {
        for (j, c) in self.cons.iter_mut().enumerate() {
            if j != committed_by && c.state().precedes(system) {
                c.make_mut().accept(system, delta)?;
            }
        }
        Ok(())
    }

    fn apply_molecules(
        &mut self,
        system: &mut System,
        hint: Hint<'_>,
        max_passes: usize,
        stats: &mut ApplyStats,
    ) -> Result<(), ConstraintError> {
        if self.molcons.is_empty() {
            return Ok(());
        }
        let mut changed = Molecules::new();
        for c in &mut self.molcons {
            let c = c.make_mut();
            let updates = match hint {
                Hint::All => c.update(system)?,
                Hint::Molecule(molnum) => c.update_for_molecule(system, molnum)?,
                Hint::Molecules(molecules) => c.update_for_molecules(system, molecules)?,
            };
            changed.unite(updates);
        }
        if changed.is_empty() {
            return Ok(());
        }
        debug!(molecules = changed.len(), "Molecule constraints requested changes");
        system.update(&changed)?;
        stats.molecules_changed.extend(changed.numbers());
        self.resolve_molecule_constraints(system, changed, max_passes, stats)
    }

    /// Re-runs the molecule constraints on what the previous pass changed until
    /// none of them asks for anything.
    #[instrument(skip_all, level = "debug")]
    fn resolve_molecule_constraints(
        &mut self,
        system: &mut System,
        mut changed: Molecules,
        max_passes: usize,
        stats: &mut ApplyStats,
    ) -> Result<(), ConstraintError> {
        for pass in 1..=max_passes {
            let single = match changed.numbers().next() {
                Some(molnum) if changed.len() == 1 => Some(molnum),
                _ => None,
            };
            let mut next = Molecules::new();
            for c in &mut self.molcons {
                let c = c.make_mut();
                let updates = match single {
                    Some(molnum) => c.update_for_molecule(system, molnum)?,
                    None => c.update_for_molecules(system, &changed)?,
                };
                next.unite(updates);
            }
            stats.molecule_passes = pass;
            if next.is_empty() {
                debug!(pass, "Molecule constraints reached a fixed point");
                return Ok(());
            }
            trace!(pass, molecules = next.len(), "Committing molecule changes");
            system.update(&next)?;
            stats.molecules_changed.extend(next.numbers());
            changed = next;
        }
        let violations = Self::violations_in(&mut self.molcons, self.cons.len(), |c| {
            c.make_mut().is_satisfied(system)
        })?;
        Err(ConstraintError::NonConvergence {
            stage: Stage::Molecules,
            passes: max_passes,
            system: system.name().to_string(),
            violations,
        })
    }

    /// The members of `pool` failing `is_satisfied`, numbered from `offset`.
    fn violations_in<T: fmt::Display>(
        pool: &mut [T],
        offset: usize,
        mut is_satisfied: impl FnMut(&mut T) -> Result<bool, ConstraintError>,
    ) -> Result<Vec<Violation>, ConstraintError> {
        let mut violations = Vec::new();
        for (i, c) in pool.iter_mut().enumerate() {
            if !is_satisfied(c)? {
                violations.push(Violation {
                    index: offset + i,
                    description: c.to_string(),
                });
            }
        }
        Ok(violations)
    }

    /// Every unsatisfied constraint, numbered as in [`get`](Self::get).
    pub fn violations(&mut self, system: &System) -> Result<Vec<Violation>, ConstraintError> {
        let mut violations =
            Self::violations_in(&mut self.cons, 0, |c| c.make_mut().is_satisfied(system))?;
        violations.extend(Self::violations_in(&mut self.molcons, self.cons.len(), |c| {
            c.make_mut().is_satisfied(system)
        })?);
        Ok(violations)
    }

    pub fn are_satisfied(&mut self, system: &System) -> Result<bool, ConstraintError> {
        for c in &mut self.cons {
            if !c.make_mut().is_satisfied(system)? {
                return Ok(false);
            }
        }
        for c in &mut self.molcons {
            if !c.make_mut().is_satisfied(system)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Fails with every unsatisfied constraint listed, not just the first.
    pub fn assert_satisfied(&mut self, system: &System) -> Result<(), ConstraintError> {
        let violations = self.violations(system)?;
        if violations.is_empty() {
            return Ok(());
        }
        Err(ConstraintError::Violation {
            system: system.name().to_string(),
            violations,
        })
    }

    /// Folds a proposed delta through every ordinary constraint so that
    /// committing the result keeps them all satisfied.
    pub fn adjust(&mut self, system: &System, delta: &Delta) -> Result<Delta, ConstraintError> {
        self.cons
            .iter_mut()
            .try_fold(delta.clone(), |delta, c| c.make_mut().apply_with(system, &delta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::expression::{Expression, ExpressionError, Symbol};
    use crate::core::models::group::MoleculeGroup;
    use crate::core::models::ids::MGNum;
    use crate::core::models::molecule::Molecule;
    use crate::core::models::property::Property;
    use crate::core::perturbation::{LAMBDA, Perturbation};
    use crate::core::point::PointRef;
    use crate::core::space::Space;
    use crate::engine::config::ApplyConfigBuilder;
    use crate::engine::molecule::perturbation::PERTURBATIONS_PROPERTY;
    use nalgebra::Point3;

    fn sym(name: &str) -> Symbol {
        Symbol::new(name)
    }

    fn component(constrained: &str, expression: &str) -> ComponentConstraint {
        ComponentConstraint::new(sym(constrained), Expression::parse(expression).unwrap()).unwrap()
    }

    fn system_with(constants: &[(&str, f64)]) -> System {
        let mut system = System::new("pool");
        for (name, value) in constants {
            system.set_constant(sym(name), *value).unwrap();
        }
        system
    }

    #[test]
    fn ordinary_constraints_are_deduplicated_but_molecule_constraints_are_not() {
        let mut constraints = Constraints::new();
        assert!(constraints.add(component("y", "x * 2")));
        assert!(!constraints.add(component("y", "x * 2")));
        assert!(constraints.add(component("y", "x * 3")));

        let wrapper = SpaceWrapper::new(PointRef::Absolute(Point3::origin()), MGNum(1));
        assert!(constraints.add(wrapper.clone()));
        assert!(constraints.add(wrapper.clone()));
        assert_eq!(constraints.n_constraints(), 4);
        assert_eq!(constraints.n_molecule_constraints(), 2);
        assert_eq!(constraints.get(2).map(|c| c.kind()), Some("space-wrapper"));
        assert!(constraints.get(4).is_none());

        assert!(constraints.remove(wrapper));
        assert!(constraints.remove(component("y", "x * 3")));
        assert!(!constraints.remove(component("y", "x * 3")));
        assert_eq!(constraints.n_constraints(), 1);
    }

    #[test]
    fn scenario_specs_build_both_pools() {
        let scenario = crate::core::io::scenario::Scenario::from_toml_str(
            r#"
format-version = 1
[system]
name = "s"
constants = { x = 1.0 }

[[constraints]]
type = "component"
symbol = "y"
expression = "x * 2"

[[constraints]]
type = "component"
symbol = "y"
expression = "x * 2"

[[constraints]]
type = "space-wrapper"
group = 1
point = { absolute = [0.0, 0.0, 0.0] }
"#,
        )
        .unwrap();
        let constraints = Constraints::from_specs(scenario.constraints).unwrap();
        assert_eq!(constraints.n_constraints(), 2);
        assert_eq!(constraints.n_molecule_constraints(), 1);
    }

    #[test]
    fn invalid_specs_are_rejected_at_construction() {
        let spec = ConstraintSpec::Windowed {
            symbol: sym("a"),
            reference: sym("a"),
            values: vec![0.0],
            step: 1,
        };
        assert!(matches!(
            Constraints::from_specs([spec]),
            Err(ConstraintError::Incompatible(_))
        ));
    }

    #[test]
    fn dependency_chain_converges_in_few_passes() {
        let mut system = system_with(&[("x", 1.0), ("y", 0.0), ("z", 0.0)]);
        let mut constraints = Constraints::new();
        constraints.add(component("z", "y + 1"));
        constraints.add(component("y", "x * 2"));

        let stats = constraints.apply(&mut system, &ApplyConfig::default()).unwrap();
        assert!(stats.passes <= 3);
        assert_eq!(system.constant(&sym("y")), Some(2.0));
        assert_eq!(system.constant(&sym("z")), Some(3.0));
        assert!(constraints.are_satisfied(&system).unwrap());
        assert!(stats.molecules_changed.is_empty());
    }

    #[test]
    fn already_satisfied_constraints_take_one_quiet_pass() {
        let mut system = system_with(&[("x", 1.0), ("y", 2.0)]);
        let version = system.version();
        let mut constraints = Constraints::new();
        constraints.add(component("y", "x * 2"));
        let stats = constraints.apply(&mut system, &ApplyConfig::default()).unwrap();
        assert_eq!(stats.passes, 1);
        assert_eq!(system.version(), version);
    }

    #[test]
    fn oscillating_pair_fails_and_rolls_back() {
        let mut system = system_with(&[("a", 0.0), ("b", 0.0)]);
        let mut constraints = Constraints::new();
        constraints.add(component("a", "b + 1"));
        constraints.add(component("b", "a + 1"));
        assert!(!constraints.are_satisfied(&system).unwrap());

        let uid = system.uid();
        let version = system.version();
        let states: Vec<_> = constraints
            .constraints()
            .iter()
            .map(|c| c.state().clone())
            .collect();

        let config = ApplyConfigBuilder::new().max_passes(10).build().unwrap();
        let err = constraints.apply(&mut system, &config).unwrap_err();
        match &err {
            ConstraintError::NonConvergence {
                stage, passes, violations, ..
            } => {
                assert_eq!(*stage, Stage::Components);
                assert_eq!(*passes, 10);
                assert!(!violations.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(system.uid(), uid);
        assert_eq!(system.version(), version);
        assert_eq!(system.constant(&sym("a")), Some(0.0));
        let after: Vec<_> = constraints
            .constraints()
            .iter()
            .map(|c| c.state().clone())
            .collect();
        assert_eq!(after, states);
    }

    #[test]
    fn non_finite_targets_are_reported_instead_of_oscillating() {
        let mut system = system_with(&[("x", -1.0), ("y", 0.0)]);
        let version = system.version();
        let mut constraints = Constraints::new();
        constraints.add(component("y", "sqrt(x)"));

        let err = constraints.apply(&mut system, &ApplyConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            ConstraintError::Expression(ExpressionError::NonFinite { .. })
        ));
        assert_eq!(system.version(), version);
        assert_eq!(system.constant(&sym("y")), Some(0.0));
    }

    #[test]
    fn committed_deltas_are_accepted_by_the_other_constraints() {
        let mut system = system_with(&[("x", 1.0), ("y", 0.0), ("w", 5.0), ("v", 10.0)]);
        let mut constraints = Constraints::new();
        constraints.add(component("v", "w * 2"));
        constraints.add(component("y", "x * 2"));
        constraints.are_satisfied(&system).unwrap();

        constraints.apply(&mut system, &ApplyConfig::default()).unwrap();
        let untouched = &constraints.constraints()[0];
        assert!(untouched.state().was_last_system(&system));
        assert_eq!(untouched.state().evaluations(), 1);
    }

    #[test]
    fn assert_satisfied_lists_every_violation() {
        let system = system_with(&[("x", 1.0), ("y", 0.0), ("z", 0.0)]);
        let mut constraints = Constraints::new();
        constraints.add(component("y", "x * 2"));
        constraints.add(component("x", "1"));
        constraints.add(component("z", "x + 1"));

        let err = constraints.assert_satisfied(&system).unwrap_err();
        let indices: Vec<_> = err.violations().unwrap().iter().map(|v| v.index).collect();
        assert_eq!(indices, vec![0, 2]);
        assert!(err.to_string().contains("2 constraint(s) violated"));
    }

    #[test]
    fn adjust_folds_a_proposed_change_through_every_constraint() {
        let system = system_with(&[("x", 1.0), ("y", 2.0), ("z", 3.0)]);
        let mut constraints = Constraints::new();
        constraints.add(component("y", "x * 2"));
        constraints.add(component("z", "y + 1"));

        let proposed = Delta::component(sym("x"), Some(1.0), 2.0);
        let adjusted = constraints.adjust(&system, &proposed).unwrap();
        assert_eq!(adjusted.new_component(&sym("x")), Some(2.0));
        assert_eq!(adjusted.new_component(&sym("y")), Some(4.0));
        assert_eq!(adjusted.new_component(&sym("z")), Some(5.0));
    }

    fn box_system() -> System {
        let mut system = System::new("box");
        system.set_space(Space::periodic_box(10.0, 10.0, 10.0));
        system.set_constant(sym(LAMBDA), 0.5).unwrap();
        let p = Perturbation::new("scale", Property::Number(1.0), Property::Number(0.0)).unwrap();
        let ligand = Molecule::new(MolNum(1), "LIG", vec![Point3::new(12.0, 1.0, 1.0)])
            .with_property("scale", 1.0)
            .with_property(PERTURBATIONS_PROPERTY, Property::Perturbations(vec![p]));
        let group = MoleculeGroup::new(MGNum(1), "ligands").with_molecule(ligand);
        system.add_group(group).unwrap();
        system
    }

    #[test]
    fn molecule_constraints_on_the_same_molecule_are_resolved_together() {
        let mut system = box_system();
        let mut constraints = Constraints::new();
        constraints.add(PerturbationConstraint::new(MGNum(1)));
        constraints.add(SpaceWrapper::new(
            PointRef::Absolute(Point3::origin()),
            MGNum(1),
        ));

        let stats = constraints.apply(&mut system, &ApplyConfig::default()).unwrap();
        let ligand = system.molecule(MolNum(1)).unwrap();
        assert_eq!(ligand.coordinates(), &[Point3::new(2.0, 1.0, 1.0)]);
        assert_eq!(ligand.property("scale"), Some(&Property::Number(0.5)));
        assert_eq!(stats.molecules_changed, BTreeSet::from([MolNum(1)]));
        assert!(stats.molecule_passes >= 1);
        constraints.assert_satisfied(&system).unwrap();
    }

    #[test]
    fn violations_are_numbered_across_both_pools() {
        let mut system = box_system();
        system.set_constant(sym("x"), 1.0).unwrap();
        system.set_constant(sym("y"), 0.0).unwrap();
        let mut constraints = Constraints::new();
        constraints.add(SpaceWrapper::new(PointRef::Absolute(Point3::origin()), MGNum(1)));
        constraints.add(component("x", "1"));
        constraints.add(component("y", "x * 2"));

        let violations = constraints.violations(&system).unwrap();
        let indices: Vec<_> = violations.iter().map(|v| v.index).collect();
        assert_eq!(indices, vec![1, 2]);
        assert_eq!(
            violations[1].description,
            constraints.get(2).unwrap().to_string()
        );
    }

    #[test]
    fn component_changes_reach_molecule_constraints() {
        let mut system = box_system();
        system.set_constant(sym("t"), 1.0).unwrap();
        let mut constraints = Constraints::new();
        constraints.add(PerturbationConstraint::new(MGNum(1)));
        constraints.add(component(LAMBDA, "t"));

        constraints.apply(&mut system, &ApplyConfig::default()).unwrap();
        let ligand = system.molecule(MolNum(1)).unwrap();
        assert_eq!(ligand.property("scale"), Some(&Property::Number(0.0)));
    }

    #[test]
    fn conflicting_wrappers_fail_without_leaving_changes() {
        let mut system = System::new("box");
        system.set_space(Space::periodic_box(10.0, 10.0, 10.0));
        let group = MoleculeGroup::new(MGNum(1), "ions").with_molecule(Molecule::new(
            MolNum(1),
            "ION",
            vec![Point3::new(-2.0, 0.0, 0.0)],
        ));
        system.add_group(group).unwrap();
        let version = system.version();

        let mut constraints = Constraints::new();
        constraints.add(SpaceWrapper::new(PointRef::Absolute(Point3::origin()), MGNum(1)));
        constraints.add(SpaceWrapper::new(
            PointRef::Absolute(Point3::new(5.0, 0.0, 0.0)),
            MGNum(1),
        ));

        let config = ApplyConfigBuilder::new().max_molecule_passes(4).build().unwrap();
        let err = constraints.apply(&mut system, &config).unwrap_err();
        assert!(matches!(
            err,
            ConstraintError::NonConvergence {
                stage: Stage::Molecules,
                passes: 4,
                ..
            }
        ));
        assert_eq!(system.version(), version);
        assert_eq!(
            system.molecule(MolNum(1)).unwrap().coordinates(),
            &[Point3::new(-2.0, 0.0, 0.0)]
        );
    }

    #[test]
    fn hinted_molecule_application_only_wraps_the_hinted_molecule() {
        let mut system = System::new("box");
        system.set_space(Space::periodic_box(10.0, 10.0, 10.0));
        let group = MoleculeGroup::new(MGNum(1), "ions")
            .with_molecule(Molecule::new(MolNum(1), "ION", vec![Point3::new(1.0, 0.0, 0.0)]))
            .with_molecule(Molecule::new(MolNum(2), "ION", vec![Point3::new(2.0, 0.0, 0.0)]));
        system.add_group(group).unwrap();

        let mut constraints = Constraints::new();
        constraints.add(SpaceWrapper::new(PointRef::Absolute(Point3::origin()), MGNum(1)));
        constraints.apply(&mut system, &ApplyConfig::default()).unwrap();

        let mut moved = system.molecule(MolNum(2)).unwrap().clone();
        moved.set_coordinates(vec![Point3::new(17.0, 0.0, 0.0)]);
        system.update(&Molecules::from(moved)).unwrap();

        let stats = constraints
            .apply_molecule_constraints_for_molecule(&mut system, MolNum(2), &ApplyConfig::default())
            .unwrap();
        assert_eq!(stats.molecules_changed, BTreeSet::from([MolNum(2)]));
        assert_eq!(
            system.molecule(MolNum(2)).unwrap().coordinates(),
            &[Point3::new(-3.0, 0.0, 0.0)]
        );
    }

    #[test]
    fn cloned_pools_do_not_share_cached_state() {
        let system = system_with(&[("x", 1.0), ("y", 2.0)]);
        let mut constraints = Constraints::new();
        constraints.add(component("y", "x * 2"));
        let copy = constraints.clone();

        assert!(constraints.are_satisfied(&system).unwrap());
        assert!(constraints.constraints()[0].state().is_bound());
        assert!(!copy.constraints()[0].state().is_bound());

        constraints.clear_last_system();
        assert!(!constraints.constraints()[0].state().is_bound());
    }
}
