use crate::cli::CheckArgs;
use crate::error::{CliError, Result};
use tracing::info;

pub fn run(args: CheckArgs) -> Result<()> {
    let (scenario, mut constraints) = super::load(&args.scenario)?;
    let system = &scenario.system;

    info!("Checking constraints against system version {}.", system.version());
    let violations = constraints.violations(system)?;
    if violations.is_empty() {
        println!(
            "All {} constraint(s) of '{}' are satisfied.",
            constraints.n_constraints(),
            system.name()
        );
        return Ok(());
    }

    println!("{} constraint(s) violated in '{}':", violations.len(), system.name());
    for violation in &violations {
        println!("  ✗ {}", violation);
    }
    Err(CliError::Unsatisfied {
        count: violations.len(),
    })
}
