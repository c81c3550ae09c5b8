use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{author-with-newline}{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
";

#[derive(Parser, Debug)]
#[command(
    author = "molcons developers",
    version,
    about = "molcons CLI - Apply and check constraints on molecular systems described by TOML scenario files.",
    help_template = HELP_TEMPLATE,
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity level (-v for INFO, -vv for DEBUG, -vvv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all log output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Write logs to a specified file in addition to the console output
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Apply every constraint of a scenario and report what changed.
    Apply(ApplyArgs),
    /// Report which constraints of a scenario are violated, without changing anything.
    Check(CheckArgs),
}

/// Arguments for the `apply` subcommand.
#[derive(Args, Debug)]
pub struct ApplyArgs {
    /// Path to the scenario file in TOML format.
    #[arg(value_name = "SCENARIO")]
    pub scenario: PathBuf,

    /// Override the pass budget for ordinary constraints.
    #[arg(long, value_name = "NUM")]
    pub max_passes: Option<usize>,

    /// Override the pass budget for molecule constraints.
    #[arg(long, value_name = "NUM")]
    pub max_molecule_passes: Option<usize>,
}

/// Arguments for the `check` subcommand.
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Path to the scenario file in TOML format.
    #[arg(value_name = "SCENARIO")]
    pub scenario: PathBuf,
}
