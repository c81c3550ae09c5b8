use super::{refresh_values, values_after};
use crate::core::expression::{Expression, Symbol, Values};
use crate::core::models::delta::Delta;
use crate::core::models::ids::{FFId, FFIdx};
use crate::core::models::property::Property;
use crate::core::models::system::System;
use crate::engine::constraint::{Constraint, ConstraintState, constraint_boilerplate};
use crate::engine::error::ConstraintError;
use std::collections::BTreeSet;
use std::fmt;
use tracing::trace;

/// Returns the value shared by every entry, or `None` if any entry is missing or differs.
fn coherent<'a>(values: impl IntoIterator<Item = Option<&'a Property>>) -> Option<&'a Property> {
    let mut values = values.into_iter();
    let first = values.next()??;
    values
        .all(|v| v == Some(first))
        .then_some(first)
}

/// Holds a property equal to an expression over system components.
///
/// Without a forcefield id the constraint targets a global system property.
/// With one, it targets the property on every forcefield the id matches, and
/// is satisfied only when all of them hold the same numeric value as the
/// expression. An id that matches no forcefield is never satisfied.
#[derive(Debug, Clone)]
pub struct PropertyConstraint {
    ffid: Option<FFId>,
    property: String,
    expression: Expression,
    symbols: BTreeSet<Symbol>,

    dependencies: BTreeSet<Symbol>,
    ffidxs: Vec<FFIdx>,
    ff_values: Vec<Option<Property>>,
    values: Values,
    old_property: Option<Property>,
    old_value: Option<f64>,
    new_value: f64,
    state: ConstraintState,
}

impl PropertyConstraint {
    /// Constrains the global property `property`.
    pub fn new(property: &str, expression: Expression) -> Self {
        let symbols = expression.symbols();
        Self {
            ffid: None,
            property: property.to_string(),
            expression,
            dependencies: symbols.clone(),
            symbols,
            ffidxs: Vec::new(),
            ff_values: Vec::new(),
            values: Values::new(),
            old_property: None,
            old_value: None,
            new_value: f64::NAN,
            state: ConstraintState::default(),
        }
    }

    /// Constrains `property` on every forcefield matched by `ffid`.
    pub fn for_forcefield(ffid: FFId, property: &str, expression: Expression) -> Self {
        Self {
            ffid: Some(ffid),
            ..Self::new(property, expression)
        }
    }

    pub fn property(&self) -> &str {
        &self.property
    }

    pub fn ffid(&self) -> Option<&FFId> {
        self.ffid.as_ref()
    }

    /// The forcefields matched when last evaluated.
    pub fn ffidxs(&self) -> &[FFIdx] {
        &self.ffidxs
    }

    /// Returns `true` if every matched forcefield held the same value when last evaluated.
    pub fn has_coherent_old_property(&self) -> bool {
        self.old_property.is_some()
    }

    fn ensure_current(&mut self, system: &System) -> Result<(), ConstraintError> {
        if !self.state.was_last_system(system) {
            self.set_system(system)?;
        }
        Ok(())
    }

    fn refresh_old_property(&mut self) {
        if self.ffid.is_some() {
            self.old_property = coherent(self.ff_values.iter().map(Option::as_ref)).cloned();
        }
        self.old_value = self.old_property.as_ref().and_then(Property::as_f64);
    }

    fn satisfied(&self) -> bool {
        self.old_value == Some(self.new_value)
    }
}

impl PartialEq for PropertyConstraint {
    fn eq(&self, other: &Self) -> bool {
        self.ffid == other.ffid
            && self.property == other.property
            && self.expression == other.expression
    }
}

impl Constraint for PropertyConstraint {
    constraint_boilerplate!("property");

    fn set_system(&mut self, system: &System) -> Result<(), ConstraintError> {
        match &self.ffid {
            Some(ffid) => {
                self.ffidxs = system.resolve(ffid);
                self.ff_values = self
                    .ffidxs
                    .iter()
                    .map(|idx| system.ff_property(*idx, &self.property).cloned())
                    .collect();
            }
            None => self.old_property = system.property(&self.property).cloned(),
        }
        self.refresh_old_property();

        self.dependencies = system.component_dependencies(&self.symbols)?;
        self.values = system.component_values(&self.symbols)?;
        self.new_value = self.expression.evaluate(&self.values)?;

        let satisfied = self.satisfied();
        trace!(constraint = %self, satisfied, "Evaluated property constraint");
        self.state.set_satisfied(system, satisfied);
        Ok(())
    }

    fn apply(&mut self, system: &System) -> Result<Delta, ConstraintError> {
        self.ensure_current(system)?;
        if self.state.last_was_satisfied() {
            return Ok(Delta::empty());
        }
        let new = Property::Number(self.new_value);
        let delta = match &self.ffid {
            None => Delta::property(&self.property, self.old_property.clone(), new),
            Some(_) => self.ffidxs.iter().zip(&self.ff_values).fold(
                Delta::empty(),
                |delta, (idx, old)| delta.with_ff_property(*idx, &self.property, old.clone(), new.clone()),
            ),
        };
        Ok(delta)
    }

    fn apply_with(&mut self, system: &System, delta: &Delta) -> Result<Delta, ConstraintError> {
        self.ensure_current(system)?;

        let after: Vec<Option<&Property>> = match &self.ffid {
            None => vec![
                delta
                    .new_property(&self.property)
                    .or(self.old_property.as_ref()),
            ],
            Some(_) => self
                .ffidxs
                .iter()
                .zip(&self.ff_values)
                .map(|(idx, old)| {
                    delta
                        .new_ff_property(*idx, &self.property)
                        .or(old.as_ref())
                })
                .collect(),
        };
        let old_after = coherent(after.iter().copied());

        // An ambiguous old property forces a full re-evaluation.
        let new_value = if old_after.is_none() || delta.involves_any_component(&self.dependencies) {
            self.expression
                .evaluate(&values_after(&self.symbols, system, delta)?)?
        } else {
            self.new_value
        };

        if old_after.and_then(Property::as_f64) == Some(new_value) {
            return Ok(delta.clone());
        }

        let target = Property::Number(new_value);
        let adjusted = match &self.ffid {
            None => delta
                .clone()
                .with_property(&self.property, self.old_property.clone(), target),
            Some(_) => self
                .ffidxs
                .iter()
                .zip(&self.ff_values)
                .zip(after)
                .filter(|(_, current)| *current != Some(&target))
                .fold(delta.clone(), |delta, ((idx, old), _)| {
                    delta.with_ff_property(*idx, &self.property, old.clone(), target.clone())
                }),
        };
        Ok(adjusted)
    }

    fn would_be_affected_by(&self, delta: &Delta) -> bool {
        let touches_property = match &self.ffid {
            None => delta.involves_property(&self.property),
            Some(_) => self
                .ffidxs
                .iter()
                .any(|idx| delta.involves_ff_property(*idx, &self.property)),
        };
        touches_property || delta.involves_any_component(&self.dependencies)
    }

    fn accept(&mut self, system: &System, delta: &Delta) -> Result<(), ConstraintError> {
        if !self.state.precedes(system) {
            return self.set_system(system);
        }
        if delta.involves_any_component(&self.dependencies) {
            refresh_values(&mut self.values, &self.symbols, system, delta)?;
            self.new_value = self.expression.evaluate(&self.values)?;
        }
        match &self.ffid {
            None => {
                if let Some(value) = delta.new_property(&self.property) {
                    self.old_property = Some(value.clone());
                }
            }
            Some(_) => {
                for (idx, value) in self.ffidxs.iter().zip(self.ff_values.iter_mut()) {
                    if let Some(new) = delta.new_ff_property(*idx, &self.property) {
                        *value = Some(new.clone());
                    }
                }
            }
        }
        self.refresh_old_property();
        let satisfied = self.satisfied();
        self.state.advance_to(system, satisfied);
        Ok(())
    }
}

impl fmt::Display for PropertyConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ffid {
            None => write!(
                f,
                "PropertyConstraint( {} == {} )",
                self.property, self.expression
            ),
            Some(ffid) => write!(
                f,
                "PropertyConstraint( {}[{}] == {} )",
                self.property, ffid, self.expression
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::system::ForceField;

    fn system() -> System {
        let mut system = System::new("props");
        system.set_constant(Symbol::new("lambda"), 0.5).unwrap();
        system.add_forcefield(ForceField::new("inter").with_property("cutoff", 10.0));
        system.add_forcefield(ForceField::new("inter").with_property("cutoff", 10.0));
        system.add_forcefield(ForceField::new("intra").with_property("cutoff", 8.0));
        system
    }

    fn scaled_cutoff() -> Expression {
        Expression::symbol("lambda") * 20.0
    }

    #[test]
    fn unmatched_forcefield_id_is_never_satisfied() {
        let mut system = system();
        let mut c = PropertyConstraint::for_forcefield(
            FFId::Name("missing".into()),
            "cutoff",
            scaled_cutoff(),
        );
        assert!(!c.is_satisfied(&system).unwrap());
        assert!(!c.has_coherent_old_property());
        assert!(c.ffidxs().is_empty());
        assert!(c.apply(&system).unwrap().is_empty());

        system.add_forcefield(ForceField::new("missing").with_property("cutoff", 10.0));
        assert!(c.is_satisfied(&system).unwrap());
    }

    #[test]
    fn global_property_is_written_as_a_number() {
        let mut system = system();
        let mut c = PropertyConstraint::new("temperature", Expression::symbol("lambda") * 600.0);
        let delta = c.apply(&system).unwrap();
        assert_eq!(delta.old_property("temperature"), None);
        assert_eq!(
            delta.new_property("temperature"),
            Some(&Property::Number(300.0))
        );
        system.apply_delta(&delta).unwrap();
        assert!(c.apply(&system).unwrap().is_empty());
    }

    #[test]
    fn every_matching_forcefield_is_updated_together() {
        let mut system = system();
        system
            .set_ff_property(FFIdx(1), "cutoff", Property::Number(12.0))
            .unwrap();
        let mut c = PropertyConstraint::for_forcefield(
            FFId::Name("inter".into()),
            "cutoff",
            Expression::symbol("lambda") * 24.0,
        );
        assert!(!c.is_satisfied(&system).unwrap());
        assert!(!c.has_coherent_old_property());

        let delta = c.commit(&mut system).unwrap();
        assert_eq!(
            delta.new_ff_property(FFIdx(0), "cutoff"),
            Some(&Property::Number(12.0))
        );
        assert!(!delta.involves_ff_property(FFIdx(1), "cutoff"));
        assert!(!delta.involves_ff_property(FFIdx(2), "cutoff"));
        assert_eq!(system.ff_property(FFIdx(2), "cutoff"), Some(&Property::Number(8.0)));
        assert!(c.is_satisfied(&system).unwrap());
        assert!(c.has_coherent_old_property());
        assert!(c.apply(&system).unwrap().is_empty());
    }

    #[test]
    fn numeric_text_counts_as_the_expected_value() {
        let mut system = system();
        system.set_property("temperature", Property::Text("300".into()));
        let mut c = PropertyConstraint::new("temperature", Expression::symbol("lambda") * 600.0);
        assert!(c.is_satisfied(&system).unwrap());
    }

    #[test]
    fn apply_with_tracks_component_changes_in_the_delta() {
        let mut system = system();
        let mut c = PropertyConstraint::for_forcefield(
            FFId::Name("inter".into()),
            "cutoff",
            scaled_cutoff(),
        );
        c.commit(&mut system).unwrap();
        assert_eq!(system.ff_property(FFIdx(0), "cutoff"), Some(&Property::Number(10.0)));

        let proposed = Delta::component(Symbol::new("lambda"), Some(0.5), 0.75);
        assert!(c.would_be_affected_by(&proposed));
        let adjusted = c.apply_with(&system, &proposed).unwrap();
        assert_eq!(adjusted.new_component(&Symbol::new("lambda")), Some(0.75));
        for idx in [FFIdx(0), FFIdx(1)] {
            assert_eq!(adjusted.new_ff_property(idx, "cutoff"), Some(&Property::Number(15.0)));
            assert_eq!(adjusted.old_ff_property(idx, "cutoff"), Some(&Property::Number(10.0)));
        }

        system.apply_delta(&adjusted).unwrap();
        c.accept(&system, &adjusted).unwrap();
        assert!(c.is_satisfied(&system).unwrap());
        assert_eq!(c.state().evaluations(), 1);
    }

    #[test]
    fn apply_with_passes_through_deltas_that_already_satisfy_it() {
        let mut system = system();
        let mut c = PropertyConstraint::new("temperature", Expression::symbol("lambda") * 600.0);
        c.commit(&mut system).unwrap();
        let proposed = Delta::component(Symbol::new("lambda"), Some(0.5), 0.75)
            .with_property("temperature", Some(Property::Number(300.0)), Property::Number(450.0));
        assert_eq!(c.apply_with(&system, &proposed).unwrap(), proposed);
    }

    #[test]
    fn major_version_change_re_resolves_forcefields() {
        let mut system = system();
        let mut c = PropertyConstraint::for_forcefield(
            FFId::Name("inter".into()),
            "cutoff",
            scaled_cutoff(),
        );
        c.commit(&mut system).unwrap();
        assert_eq!(c.ffidxs(), &[FFIdx(0), FFIdx(1)]);

        system.add_forcefield(ForceField::new("inter"));
        assert!(!c.is_satisfied(&system).unwrap());
        assert_eq!(c.ffidxs(), &[FFIdx(0), FFIdx(1), FFIdx(3)]);
        c.commit(&mut system).unwrap();
        assert_eq!(system.ff_property(FFIdx(3), "cutoff"), Some(&Property::Number(10.0)));
    }
}
