use std::fs::{self, File};
use std::io::{self, Write};
use std::time::Duration;

use anyhow::{bail, Context};
use colored::Colorize;
use merger_engine::{MergeConfig, MergeEngine, MergeMode, MergeReport, SourceState};
use merger_transport::{channel, InputChannel};
use merger_types::{Schema, TimestampSelector};
use tracing::{info, warn};

use crate::cli::*;
use crate::jsonl::{spawn_feeder, JsonLinesOutput};

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Merge(args) => cmd_merge(args, &cli.format).await,
        Command::Config(args) => cmd_config(args, &cli.format),
    }
}

/// Load the configuration file, if any, and apply flag overrides on top.
pub fn resolve_config(args: &ConfigArgs, sources: Option<usize>) -> anyhow::Result<MergeConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            MergeConfig::from_toml_str(&text)
                .with_context(|| format!("invalid configuration in {}", path.display()))?
        }
        None => MergeConfig::default(),
    };
    if let Some(sources) = sources {
        config.sources = sources;
    }
    if args.time_first {
        config.timestamp = TimestampSelector::First;
    }
    if let Some(secs) = args.timeout {
        if !secs.is_finite() || secs <= 0.0 {
            bail!("--timeout must be a positive number of seconds, got {secs}");
        }
        config.initial_timeout = match Duration::try_from_secs_f64(secs) {
            Ok(timeout) => timeout,
            Err(err) => bail!("--timeout {secs} is out of range: {err}"),
        };
    }
    if args.interleave {
        config.mode = MergeMode::Interleave;
    }
    if args.no_terminal {
        config.suppress_terminal = true;
    }
    if let Some(spec) = &args.schema {
        config.output_schema = Some(Schema::parse(spec).context("invalid --schema")?);
    }
    config.validate()?;
    Ok(config)
}

async fn cmd_merge(args: MergeArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let report = merge(args).await?;
    print_report(&report, format)
}

/// Run one merge over the given files, stopping gracefully on Ctrl-C.
pub async fn merge(args: MergeArgs) -> anyhow::Result<MergeReport> {
    let config = resolve_config(&args.config, Some(args.inputs.len()))?;

    let writer: Box<dyn Write + Send> = match &args.output {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        ),
        None => Box::new(io::stdout()),
    };

    let mut inputs: Vec<Box<dyn InputChannel>> = Vec::with_capacity(args.inputs.len());
    for (source, path) in args.inputs.iter().enumerate() {
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let (sender, input) = channel();
        // Feeders are detached: an input that never ends must not hold up exit.
        spawn_feeder(source, file, sender).context("failed to start input feeder")?;
        inputs.push(Box::new(input));
    }

    let engine = MergeEngine::new(config, inputs, Box::new(JsonLinesOutput::new(writer)))?;
    let stop = engine.stop_handle();
    let mut run = tokio::task::spawn_blocking(move || engine.run());

    let finished = tokio::select! {
        joined = &mut run => Some(joined),
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => {
                    info!("interrupt received, draining");
                    stop.stop();
                }
                Err(err) => warn!(error = %err, "cannot listen for interrupts"),
            }
            None
        }
    };
    let joined = match finished {
        Some(joined) => joined,
        None => run.await,
    };
    let report = joined.context("merge task failed")??;
    Ok(report)
}

fn print_report(report: &MergeReport, format: &OutputFormat) -> anyhow::Result<()> {
    // stdout may be carrying the merged stream.
    let mut err = io::stderr().lock();
    match format {
        OutputFormat::Json => writeln!(err, "{}", serde_json::to_string_pretty(report)?)?,
        OutputFormat::Text => {
            writeln!(
                err,
                "{} Merged {} records from {} sources ({})",
                "✓".green().bold(),
                report.total_forwarded().to_string().bold(),
                report.sources.len(),
                report.cause
            )?;
            writeln!(
                err,
                "  Mode: {}  Timestamp: {}  Rounds: {}  Elapsed: {} ms",
                report.mode.to_string().cyan(),
                report.timestamp.to_string().cyan(),
                report.rounds,
                report.elapsed_ms()
            )?;
            if let Some(schema) = &report.output_schema {
                writeln!(err, "  Schema: {}", schema.to_spec_string().blue())?;
            }
            let terminal = if report.terminal_sent {
                "sent".green()
            } else {
                "not sent".yellow()
            };
            writeln!(err, "  Terminal marker: {terminal}")?;
            for s in &report.sources {
                let state = match s.state {
                    SourceState::Ended => s.state.to_string().dimmed(),
                    SourceState::Stalled => s.state.to_string().yellow(),
                    SourceState::Active => s.state.to_string().green(),
                };
                writeln!(
                    err,
                    "  {:>4}  {:<8} received {:>6}  forwarded {:>6}  timeouts {:>3}  malformed {:>3}",
                    s.source.to_string().bold(),
                    state,
                    s.received,
                    s.forwarded,
                    s.timeouts,
                    s.malformed
                )?;
            }
            if report.dropped() > 0 {
                writeln!(
                    err,
                    "  {} {} records were not forwarded",
                    "!".yellow().bold(),
                    report.dropped()
                )?;
            }
        }
    }
    Ok(())
}

fn cmd_config(args: ShowConfigArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let config = resolve_config(&args.config, args.sources)?;
    match format {
        OutputFormat::Text => print!("{}", config.to_toml_string()?),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
    }
    Ok(())
}
