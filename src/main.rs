use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value as JsonValue;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use barrage::script::{Composable, Expression, Segment};
use barrage::{compile, load_config, Background, CompileOptions};

#[derive(Parser, Debug)]
#[command(name = "barrage", version, about = "Programmable HTTP load generator and response validator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the schedules of a configuration
    Run(RunArgs),
    /// Load and compile a configuration without sending anything
    Check(CheckArgs),
    /// Compose one segment (or evaluate one expression) and print the result
    Eval(EvalArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to the configuration document
    config: PathBuf,

    /// Only run the named schedule (repeatable)
    #[arg(long = "schedule", value_name = "NAME")]
    schedules: Vec<String>,

    /// Set the DEBUG global and log at debug level
    #[arg(long)]
    debug: bool,

    /// Tracing filter, e.g. `info` or `barrage=debug`
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[derive(Parser, Debug)]
struct CheckArgs {
    /// Path to the configuration document
    config: PathBuf,
}

#[derive(Parser, Debug)]
struct EvalArgs {
    /// Segment source, or an expression with `-e`
    source: String,

    /// JSON value pushed as the current `$<...>` scope
    #[arg(long, value_name = "JSON")]
    json: Option<String>,

    /// Treat SOURCE as an expression
    #[arg(short = 'e', long = "expr")]
    expression: bool,
}

fn init_tracing(log_level: Option<&str>, debug: bool) {
    let fallback = if debug { "debug" } else { "info" };
    let env_filter = match log_level {
        Some(level) => EnvFilter::try_new(level).ok(),
        None => EnvFilter::try_from_default_env().ok(),
    }
    .unwrap_or_else(|| EnvFilter::new(fallback));

    if tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_err()
    {
        tracing::debug!("global tracing subscriber already initialized, skipping");
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Check(args) => check(args),
        Commands::Eval(args) => eval(args),
    };
    if let Err(err) = result {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let log_level = args.log_level.as_deref().or(args.debug.then_some("debug"));
    init_tracing(log_level, args.debug);

    let config = load_config(&args.config)?;
    let options = CompileOptions {
        debug: args.debug,
        schedules: args.schedules,
    };
    let engine = compile(&config, &options)?;
    tracing::info!(
        config = %config.name,
        schedules = engine.plans().len(),
        mode = ?engine.mode(),
        "run started"
    );
    engine.run_checked().await?;
    Ok(())
}

fn check(args: CheckArgs) -> Result<()> {
    init_tracing(None, false);
    let config = load_config(&args.config)?;
    let engine = compile(&config, &CompileOptions::default())?;
    let runners: usize = engine
        .plans()
        .iter()
        .map(|plan| plan.assembler().runners().len())
        .sum();
    println!(
        "{}: {} hosts, {} messages, {} tests, {} schedules ({} runners)",
        args.config.display(),
        config.hosts.len(),
        config.messages.len(),
        config.tests.len(),
        engine.plans().len(),
        runners
    );
    Ok(())
}

fn eval(args: EvalArgs) -> Result<()> {
    init_tracing(None, false);
    let mut bg = Background::new("eval");
    if let Some(json) = &args.json {
        let value: JsonValue = serde_json::from_str(json).context("invalid --json value")?;
        bg.push_json_env("", value);
    }

    let output = if args.expression {
        Expression::compile(&args.source)?.eval(&mut bg)?
    } else {
        let segment = Segment::compile(&args.source)?;
        let output = segment.compose(&mut bg);
        segment.close();
        output?
    };
    println!("{output}");
    Ok(())
}
