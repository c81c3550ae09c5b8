use crate::cli::ApplyArgs;
use crate::error::{CliError, Result};
use itertools::Itertools;
use molcons::core::io::scenario::ApplySettings;
use molcons::engine::config::{ApplyConfig, ApplyConfigBuilder};
use molcons::workflows;
use molcons::workflows::apply::ApplyReport;
use tracing::{info, warn};

pub fn run(args: ApplyArgs) -> Result<()> {
    let (mut scenario, mut constraints) = super::load(&args.scenario)?;
    let config = build_config(&args, &scenario.apply)?;
    info!(
        "Applying with a budget of {} pass(es) and {} molecule pass(es).",
        config.max_passes, config.max_molecule_passes
    );

    println!("Applying constraints to '{}'...", scenario.system.name());
    let report = workflows::apply::run(&mut scenario.system, &mut constraints, &config)?;
    print_report(&report);

    println!("Constants:");
    for (symbol, value) in scenario.system.constants().iter() {
        println!("  {} = {}", symbol, value);
    }

    if report.is_satisfied() {
        Ok(())
    } else {
        warn!("{} constraint(s) left unsatisfied.", report.violations.len());
        Err(CliError::Unsatisfied {
            count: report.violations.len(),
        })
    }
}

/// Command-line budgets take precedence over the scenario's `[apply]` section.
pub fn build_config(args: &ApplyArgs, settings: &ApplySettings) -> Result<ApplyConfig> {
    let mut builder = ApplyConfigBuilder::new();
    if let Some(passes) = args.max_passes.or(settings.max_passes) {
        builder = builder.max_passes(passes);
    }
    if let Some(passes) = args.max_molecule_passes.or(settings.max_molecule_passes) {
        builder = builder.max_molecule_passes(passes);
    }
    Ok(builder.build()?)
}

fn print_report(report: &ApplyReport) {
    println!(
        "Converged after {} pass(es) and {} molecule pass(es).",
        report.passes, report.molecule_passes
    );
    if report.system_changed() {
        println!(
            "System version {} -> {}.",
            report.version_before, report.version_after
        );
    } else {
        println!("System already satisfied every constraint; nothing changed.");
    }
    if !report.molecules_changed.is_empty() {
        println!(
            "Molecules changed: {}",
            report.molecules_changed.iter().join(", ")
        );
    }
    for violation in &report.violations {
        println!("  ✗ {}", violation);
    }
}
