use crate::core::expression::{Expression, ExpressionError, Symbol, Values};
use crate::core::models::molecule::Molecule;
use crate::core::models::property::Property;
use std::collections::BTreeSet;
use thiserror::Error;

pub const INITIAL: &str = "initial";
pub const FINAL: &str = "final";
pub const LAMBDA: &str = "lambda";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PerturbationError {
    #[error("Initial and final values of perturbed property '{0}' are not compatible")]
    Incompatible(String),
    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

/// Interpolates a molecule property between an initial and a final value.
///
/// The mapping expression reads the symbols `initial` and `final` plus any
/// system components; by default it is `(1 - lambda) * initial + lambda * final`.
/// Numeric properties are mapped directly, per-atom arrays element by element.
#[derive(Debug, Clone, PartialEq)]
pub struct Perturbation {
    property: String,
    initial: Property,
    final_value: Property,
    mapping: Expression,
}

impl Perturbation {
    pub fn new(
        property: &str,
        initial: Property,
        final_value: Property,
    ) -> Result<Self, PerturbationError> {
        let compatible = match (&initial, &final_value) {
            (Property::Number(_), Property::Number(_)) => true,
            (Property::Values(a), Property::Values(b)) => a.len() == b.len(),
            _ => false,
        };
        if !compatible {
            return Err(PerturbationError::Incompatible(property.to_string()));
        }
        Ok(Self {
            property: property.to_string(),
            initial,
            final_value,
            mapping: Self::default_mapping(),
        })
    }

    pub fn default_mapping() -> Expression {
        let lambda = Expression::symbol(LAMBDA);
        (Expression::constant(1.0) - lambda.clone()) * Expression::symbol(INITIAL)
            + lambda * Expression::symbol(FINAL)
    }

    pub fn with_mapping(mut self, mapping: Expression) -> Self {
        self.mapping = mapping;
        self
    }

    pub fn property(&self) -> &str {
        &self.property
    }

    pub fn mapping(&self) -> &Expression {
        &self.mapping
    }

    /// System components the mapping reads.
    pub fn symbols(&self) -> BTreeSet<Symbol> {
        let mut symbols = self.mapping.symbols();
        symbols.remove(&Symbol::new(INITIAL));
        symbols.remove(&Symbol::new(FINAL));
        symbols
    }

    /// The value of the perturbed property for the given component values.
    pub fn value(&self, values: &Values) -> Result<Property, PerturbationError> {
        let evaluate = |initial: f64, final_value: f64| {
            let mut v = values.clone();
            v.set(Symbol::new(INITIAL), initial);
            v.set(Symbol::new(FINAL), final_value);
            self.mapping.evaluate(&v)
        };
        match (&self.initial, &self.final_value) {
            (Property::Number(a), Property::Number(b)) => Ok(Property::Number(evaluate(*a, *b)?)),
            (Property::Values(a), Property::Values(b)) => Ok(Property::Values(
                a.iter()
                    .zip(b)
                    .map(|(x, y)| evaluate(*x, *y))
                    .collect::<Result<Vec<_>, _>>()?,
            )),
            _ => Err(PerturbationError::Incompatible(self.property.clone())),
        }
    }

    /// Applies the perturbation to a copy of `molecule`.
    ///
    /// The copy only gets a new version if the property actually changes.
    pub fn perturb(&self, molecule: &Molecule, values: &Values) -> Result<Molecule, PerturbationError> {
        let mut perturbed = molecule.clone();
        perturbed.set_property(&self.property, self.value(values)?);
        Ok(perturbed)
    }
}
