use super::values_after;
use crate::core::expression::Symbol;
use crate::core::models::delta::Delta;
use crate::core::models::system::System;
use crate::engine::constraint::{Constraint, ConstraintState, constraint_boilerplate};
use crate::engine::error::ConstraintError;
use itertools::Itertools;
use std::collections::BTreeSet;
use std::fmt;
use tracing::trace;

/// Holds a component on a window value a fixed number of steps away from
/// the window value nearest to a reference component.
///
/// Stepping past either end of the window clamps to the first or last value.
#[derive(Debug, Clone)]
pub struct WindowedComponent {
    constrained: Symbol,
    reference: Symbol,
    window_values: Vec<f64>,
    step_size: isize,

    dependencies: BTreeSet<Symbol>,
    target: f64,
    current: Option<f64>,
    state: ConstraintState,
}

impl WindowedComponent {
    /// Duplicate window values are dropped, keeping the first occurrence of each.
    pub fn new(
        constrained: Symbol,
        reference: Symbol,
        window_values: Vec<f64>,
        step_size: isize,
    ) -> Result<Self, ConstraintError> {
        if constrained == reference {
            return Err(ConstraintError::Incompatible(format!(
                "windowed component '{}' cannot use itself as the reference",
                constrained
            )));
        }
        let mut unique: Vec<f64> = Vec::with_capacity(window_values.len());
        for value in window_values {
            if !unique.contains(&value) {
                unique.push(value);
            }
        }
        if unique.is_empty() {
            return Err(ConstraintError::Incompatible(format!(
                "windowed component '{}' needs at least one window value",
                constrained
            )));
        }
        let dependencies = BTreeSet::from([reference.clone()]);
        Ok(Self {
            constrained,
            reference,
            window_values: unique,
            step_size,
            dependencies,
            target: f64::NAN,
            current: None,
            state: ConstraintState::default(),
        })
    }

    pub fn constrained(&self) -> &Symbol {
        &self.constrained
    }

    pub fn reference(&self) -> &Symbol {
        &self.reference
    }

    pub fn window_values(&self) -> &[f64] {
        &self.window_values
    }

    pub fn step_size(&self) -> isize {
        self.step_size
    }

    /// Index of the window value nearest to `value`; the first index wins ties.
    fn nearest_index(&self, value: f64) -> usize {
        if let Some(exact) = self.window_values.iter().position(|v| *v == value) {
            return exact;
        }
        let mut best = 0;
        let mut best_dist2 = f64::INFINITY;
        for (i, v) in self.window_values.iter().enumerate() {
            let dist2 = (v - value) * (v - value);
            if dist2 < best_dist2 {
                best = i;
                best_dist2 = dist2;
            }
        }
        best
    }

    /// The window value the constrained component should hold for a reference value.
    pub fn target_for(&self, reference_value: f64) -> f64 {
        let last = self.window_values.len() as isize - 1;
        let idx = (self.nearest_index(reference_value) as isize + self.step_size).clamp(0, last);
        self.window_values[idx as usize]
    }

    fn ensure_current(&mut self, system: &System) -> Result<(), ConstraintError> {
        if !self.state.was_last_system(system) {
            self.set_system(system)?;
        }
        Ok(())
    }
}

impl PartialEq for WindowedComponent {
    fn eq(&self, other: &Self) -> bool {
        self.constrained == other.constrained
            && self.reference == other.reference
            && self.window_values == other.window_values
            && self.step_size == other.step_size
    }
}

impl Constraint for WindowedComponent {
    constraint_boilerplate!("windowed");

    fn set_system(&mut self, system: &System) -> Result<(), ConstraintError> {
        self.dependencies = system.component_dependencies([&self.reference])?;
        self.target = self.target_for(system.component_value(&self.reference)?);
        self.current = system.constant(&self.constrained);
        let satisfied = self.current == Some(self.target);
        trace!(constraint = %self, satisfied, "Evaluated windowed component");
        self.state.set_satisfied(system, satisfied);
        Ok(())
    }

    fn apply(&mut self, system: &System) -> Result<Delta, ConstraintError> {
        self.ensure_current(system)?;
        if self.state.last_was_satisfied() {
            return Ok(Delta::empty());
        }
        Ok(Delta::component(
            self.constrained.clone(),
            self.current,
            self.target,
        ))
    }

    fn apply_with(&mut self, system: &System, delta: &Delta) -> Result<Delta, ConstraintError> {
        self.ensure_current(system)?;
        let target = if delta.involves_any_component(&self.dependencies) {
            let reference = BTreeSet::from([self.reference.clone()]);
            let values = values_after(&reference, system, delta)?;
            match values.get(&self.reference) {
                Some(value) => self.target_for(value),
                None => return Err(ConstraintError::MissingComponent(self.reference.clone())),
            }
        } else {
            self.target
        };
        let current = delta.new_component(&self.constrained).or(self.current);
        if current == Some(target) {
            return Ok(delta.clone());
        }
        Ok(delta
            .clone()
            .with_component(self.constrained.clone(), self.current, target))
    }

    fn would_be_affected_by(&self, delta: &Delta) -> bool {
        delta.involves_component(&self.constrained)
            || delta.involves_any_component(&self.dependencies)
    }

    /// Sets the constrained component directly on the system.
    fn commit(&mut self, system: &mut System) -> Result<Delta, ConstraintError> {
        self.ensure_current(system)?;
        if self.state.last_was_satisfied() {
            return Ok(Delta::empty());
        }
        let old = self.current;
        system.set_constant(self.constrained.clone(), self.target)?;
        self.current = Some(self.target);
        self.state.advance_to(system, true);
        Ok(Delta::component(self.constrained.clone(), old, self.target))
    }
}

impl fmt::Display for WindowedComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WindowedComponent( {} = {} {:+} in [{}] )",
            self.constrained,
            self.reference,
            self.step_size,
            self.window_values.iter().join(", ")
        )
    }
}
