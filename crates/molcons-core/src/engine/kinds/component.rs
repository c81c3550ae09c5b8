use super::{refresh_values, values_after};
use crate::core::expression::{Expression, Symbol, Values};
use crate::core::models::delta::Delta;
use crate::core::models::system::System;
use crate::engine::constraint::{Constraint, ConstraintState, constraint_boilerplate};
use crate::engine::error::ConstraintError;
use std::collections::BTreeSet;
use std::fmt;
use tracing::trace;

/// Holds a system constant equal to an expression over other components.
///
/// Equality is exact: the constraint is satisfied only when the constant
/// holds precisely the value the expression evaluates to.
#[derive(Debug, Clone)]
pub struct ComponentConstraint {
    constrained: Symbol,
    expression: Expression,
    symbols: BTreeSet<Symbol>,
    dependencies: BTreeSet<Symbol>,
    values: Values,
    target: f64,
    current: Option<f64>,
    state: ConstraintState,
}

impl ComponentConstraint {
    pub fn new(constrained: Symbol, expression: Expression) -> Result<Self, ConstraintError> {
        if expression.depends_on(&constrained) {
            return Err(ConstraintError::Incompatible(format!(
                "component '{}' cannot be constrained to an expression of itself ({})",
                constrained, expression
            )));
        }
        let symbols = expression.symbols();
        Ok(Self {
            constrained,
            expression,
            dependencies: symbols.clone(),
            symbols,
            values: Values::new(),
            target: f64::NAN,
            current: None,
            state: ConstraintState::default(),
        })
    }

    pub fn constrained(&self) -> &Symbol {
        &self.constrained
    }

    pub fn expression(&self) -> &Expression {
        &self.expression
    }

    fn ensure_current(&mut self, system: &System) -> Result<(), ConstraintError> {
        if !self.state.was_last_system(system) {
            self.set_system(system)?;
        }
        Ok(())
    }

    fn satisfied(&self) -> bool {
        self.current == Some(self.target)
    }
}

impl PartialEq for ComponentConstraint {
    fn eq(&self, other: &Self) -> bool {
        self.constrained == other.constrained && self.expression == other.expression
    }
}

impl Constraint for ComponentConstraint {
    constraint_boilerplate!("component");

    fn set_system(&mut self, system: &System) -> Result<(), ConstraintError> {
        self.dependencies = system.component_dependencies(&self.symbols)?;
        self.values = system.component_values(&self.symbols)?;
        self.target = self.expression.evaluate(&self.values)?;
        self.current = system.constant(&self.constrained);
        let satisfied = self.satisfied();
        trace!(constraint = %self, satisfied, "Evaluated component constraint");
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
            self.expression
                .evaluate(&values_after(&self.symbols, system, delta)?)?
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

    fn accept(&mut self, system: &System, delta: &Delta) -> Result<(), ConstraintError> {
        if !self.state.precedes(system) {
            return self.set_system(system);
        }
        if delta.involves_any_component(&self.dependencies) {
            refresh_values(&mut self.values, &self.symbols, system, delta)?;
            self.target = self.expression.evaluate(&self.values)?;
        }
        if let Some(value) = delta.new_component(&self.constrained) {
            self.current = Some(value);
        }
        let satisfied = self.satisfied();
        self.state.advance_to(system, satisfied);
        Ok(())
    }
}

impl fmt::Display for ComponentConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ComponentConstraint( {} == {} )",
            self.constrained, self.expression
        )
    }
}
