pub mod apply;
pub mod check;

use crate::error::Result;
use molcons::core::io::scenario::Scenario;
use molcons::engine::constraints::Constraints;
use std::path::Path;
use tracing::info;

/// Reads a scenario and builds its constraint pools.
fn load(path: &Path) -> Result<(Scenario, Constraints)> {
    info!("Loading scenario from {:?}", path);
    let mut scenario = Scenario::load(path)?;
    let constraints = Constraints::from_specs(std::mem::take(&mut scenario.constraints))?;
    info!(
        "Scenario '{}' defines {} constraint(s), {} of them molecule constraints.",
        scenario.system.name(),
        constraints.n_constraints(),
        constraints.n_molecule_constraints()
    );
    Ok((scenario, constraints))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::Write;
    use tempfile::NamedTempFile;

    pub const CHAIN: &str = r#"
format-version = 1

[system]
name = "chain"
constants = { x = 2, y = 0, z = 0 }

[[constraints]]
type = "component"
symbol = "y"
expression = "x + 1"

[[constraints]]
type = "component"
symbol = "z"
expression = "y * 2 + 1"
"#;

    pub const SATISFIED: &str = r#"
format-version = 1

[system]
name = "settled"
constants = { x = 2, y = 3 }

[[constraints]]
type = "component"
symbol = "y"
expression = "x + 1"
"#;

    pub fn write_scenario(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::error::CliError;

    #[test]
    fn load_builds_both_pools_from_a_scenario() {
        let file = write_scenario(CHAIN);
        let (scenario, constraints) = load(file.path()).unwrap();
        assert_eq!(scenario.system.name(), "chain");
        assert!(scenario.constraints.is_empty());
        assert_eq!(constraints.n_constraints(), 2);
        assert_eq!(constraints.constraints().len(), 2);
        assert_eq!(constraints.n_molecule_constraints(), 0);
    }

    #[test]
    fn load_reports_missing_files_as_scenario_errors() {
        let dir = tempfile::tempdir().unwrap();
        let result = load(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(CliError::Scenario(_))));
    }
}
