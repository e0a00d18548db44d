use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "merger",
    about = "Merge time-stamped record streams into one time-ordered stream",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Merge JSON-lines inputs into one output
    Merge(MergeArgs),
    /// Print the effective configuration as TOML
    Config(ShowConfigArgs),
}

/// Settings shared by `merge` and `config`; flags override the file.
#[derive(Args, Debug, Default)]
pub struct ConfigArgs {
    /// TOML configuration file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
    /// Order by the record's first timestamp instead of its last
    #[arg(long)]
    pub time_first: bool,
    /// Seconds a source may stay silent before it is considered stalled
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<f64>,
    /// Forward records as they arrive, without time ordering
    #[arg(long)]
    pub interleave: bool,
    /// Do not send the end-of-stream marker when the merge finishes
    #[arg(long)]
    pub no_terminal: bool,
    /// Starting output schema, e.g. "time TIME_FIRST,uint32 PACKETS"
    #[arg(long, value_name = "SPEC")]
    pub schema: Option<String>,
}

#[derive(Args, Debug)]
pub struct MergeArgs {
    /// Input file, one per source
    #[arg(short, long = "input", value_name = "FILE", required = true)]
    pub inputs: Vec<PathBuf>,
    /// Output file (default: stdout)
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,
    #[command(flatten)]
    pub config: ConfigArgs,
}

#[derive(Args, Debug)]
pub struct ShowConfigArgs {
    /// Number of sources
    #[arg(long)]
    pub sources: Option<usize>,
    #[command(flatten)]
    pub config: ConfigArgs,
}
