use crate::core::expression::{ExpressionError, Symbol};
use crate::core::models::delta::DeltaError;
use crate::core::models::system::SystemError;
use crate::core::perturbation::PerturbationError;
use itertools::Itertools;
use std::fmt;
use thiserror::Error;

/// One unsatisfied constraint, identified by its position in its pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub index: usize,
    pub description: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.index, self.description)
    }
}

/// The phase of `Constraints::apply` that failed to reach a fixed point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Components,
    Molecules,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Components => f.write_str("Component"),
            Stage::Molecules => f.write_str("Molecule"),
        }
    }
}

fn render(violations: &[Violation]) -> String {
    violations.iter().map(|v| format!("  {}", v)).join("\n")
}

#[derive(Debug, Error)]
pub enum ConstraintError {
    #[error("{} constraint(s) violated in system '{system}':\n{}", .violations.len(), render(.violations))]
    Violation {
        system: String,
        violations: Vec<Violation>,
    },

    #[error("{stage} constraints failed to converge after {passes} passes in system '{system}':\n{}", render(.violations))]
    NonConvergence {
        stage: Stage,
        passes: usize,
        system: String,
        violations: Vec<Violation>,
    },

    #[error("Incompatible constraint: {0}")]
    Incompatible(String),

    #[error("System has no value for component '{0}'")]
    MissingComponent(Symbol),

    #[error("System has no property '{0}'")]
    MissingProperty(String),

    #[error(transparent)]
    System(#[from] SystemError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Delta(#[from] DeltaError),

    #[error(transparent)]
    Perturbation(#[from] PerturbationError),
}

impl ConstraintError {
    /// The unsatisfied constraints carried by a violation or non-convergence error.
    pub fn violations(&self) -> Option<&[Violation]> {
        match self {
            ConstraintError::Violation { violations, .. }
            | ConstraintError::NonConvergence { violations, .. } => Some(violations),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn violation_message_lists_every_constraint() {
        let err = ConstraintError::Violation {
            system: "box".into(),
            violations: vec![
                Violation {
                    index: 0,
                    description: "x == 1".into(),
                },
                Violation {
                    index: 3,
                    description: "y == 2".into(),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.starts_with("2 constraint(s) violated in system 'box'"));
        assert!(text.contains("0: x == 1"));
        assert!(text.contains("3: y == 2"));
        assert_eq!(err.violations().map(|v| v.len()), Some(2));
    }

    #[test]
    fn non_convergence_names_stage_and_passes() {
        let err = ConstraintError::NonConvergence {
            stage: Stage::Molecules,
            passes: 10,
            system: "box".into(),
            violations: Vec::new(),
        };
        assert!(err.to_string().starts_with("Molecule constraints failed to converge after 10 passes"));
        assert!(ConstraintError::Incompatible("x".into()).violations().is_none());
    }
}
