use crate::core::models::ids::{MolNum, Version};
use crate::core::models::system::System;
use crate::engine::config::ApplyConfig;
use crate::engine::constraints::Constraints;
use crate::engine::error::{ConstraintError, Violation};
use std::collections::BTreeSet;
use tracing::{info, instrument, warn};

/// What one run of the apply workflow did to a system.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyReport {
    pub passes: usize,
    pub molecule_passes: usize,
    pub molecules_changed: BTreeSet<MolNum>,
    /// Constraints still unsatisfied once both stages converged.
    pub violations: Vec<Violation>,
    pub version_before: Version,
    pub version_after: Version,
}

impl ApplyReport {
    pub fn is_satisfied(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn system_changed(&self) -> bool {
        self.version_before != self.version_after
    }
}

/// Applies `constraints` to `system` and checks that every one of them holds afterwards.
///
/// Molecule constraints run after the ordinary ones and can move molecules an
/// ordinary constraint measured, so the final check may still find violations.
/// Those are reported rather than raised; a failure to converge is an error and
/// leaves `system` untouched.
#[instrument(skip_all, name = "apply_workflow", fields(system = %system.name()))]
pub fn run(
    system: &mut System,
    constraints: &mut Constraints,
    config: &ApplyConfig,
) -> Result<ApplyReport, ConstraintError> {
    info!(
        constraints = constraints.n_constraints(),
        molecule_constraints = constraints.n_molecule_constraints(),
        version = %system.version(),
        "Applying constraints"
    );
    let version_before = system.version();
    let stats = constraints.apply(system, config)?;
    let violations = constraints.violations(system)?;
    if violations.is_empty() {
        info!(version = %system.version(), "All constraints satisfied");
    } else {
        warn!(
            count = violations.len(),
            "Constraints left unsatisfied after molecule resolution"
        );
    }

    Ok(ApplyReport {
        passes: stats.passes,
        molecule_passes: stats.molecule_passes,
        molecules_changed: stats.molecules_changed,
        violations,
        version_before,
        version_after: system.version(),
    })
}
