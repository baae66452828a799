use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use xmnz_tester::console::{BenchCommand, Console, MENU};
use xmnz_tester::engine::{StepEvent, StepRegistry, TestRunner};
use xmnz_tester::{Bench, StationConfig};

#[derive(Parser)]
#[command(
    name = "xmnz-tester",
    about = "Production test station for XMNZ IoT boards",
    version,
    long_about = None
)]
struct Cli {
    /// Station configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the test sequence once against the configured bench
    Run {
        /// Print the finalized result record as JSON when done
        #[arg(long)]
        json: bool,
    },

    /// List the test sequence that would run
    Steps,

    /// Load and validate the configuration, then exit
    CheckConfig,

    /// Drive the bench devices by hand; reads one command per line from stdin
    Bench,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // stdout carries the operator event stream.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_event(event: &StepEvent) {
    let tag = format!("[{}]", event.status);
    println!("{:<10}{:<24}{}", tag, event.step_id, event.message);
}

/// Interactive bench console. Devices are released on `quit` or end of input.
async fn bench_console(config: &StationConfig) -> Result<ExitCode> {
    let mut bench = Bench::from_config(config).context("building device bench")?;
    if let Err(e) = bench.connect_all().await {
        eprintln!("CRITICAL ERROR during initialisation: {}", e);
        bench.disconnect_all().await;
        return Ok(ExitCode::from(1));
    }

    println!("{}", MENU);
    let mut console = Console::new(&mut bench, config);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<BenchCommand>() {
            Ok(BenchCommand::Quit) => break,
            Ok(command) => match console.execute(&command).await {
                Ok(out) => println!("{}", out),
                Err(e) => println!("Error: {:#}", e),
            },
            Err(e) => println!("Error: {}", e),
        }
    }

    println!("Disconnecting hardware");
    for failure in bench.disconnect_all().await {
        eprintln!("{}", failure);
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = StationConfig::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Run { json } => {
            let config = Arc::new(config);
            let bench = Bench::from_config(&config).context("building device bench")?;
            let (tx, mut rx) = mpsc::unbounded_channel();
            let mut runner = TestRunner::new(Arc::clone(&config), bench, Some(tx))?;

            let cancel = runner.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Ctrl-C: stopping after the current step");
                    cancel.cancel();
                }
            });

            let ui = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    print_event(&event);
                }
            });

            let worker = tokio::spawn(async move { runner.run().await });
            let result = worker.await.context("test worker died")?;
            ui.await.context("event printer died")?;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            }

            if result.overall_status().is_pass() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(1))
            }
        }
        Commands::Steps => {
            let sequence = config.sequence();
            StepRegistry::builtin().validate(&sequence)?;
            for (index, def) in sequence.steps().iter().enumerate() {
                println!(
                    "{:>2}. {:<24}{}",
                    index + 1,
                    def.key,
                    config.step_message(&def.key, index)
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::CheckConfig => {
            let sequence = config.sequence();
            StepRegistry::builtin().validate(&sequence)?;
            println!(
                "Configuration OK: station {}, {} steps, stop_on_fail={}, bench={}",
                config.station_id,
                sequence.len(),
                config.stop_on_fail,
                if config.bench.simulated { "simulated" } else { "hardware" },
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Bench => bench_console(&config).await,
    }
}
