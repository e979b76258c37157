//! CLI entrypoint for the guardheap self-test harness.

use std::io::Write;

use clap::{Parser, Subcommand};

use guardheap_core::{DiagnosticSink, HeapConfig, JsonLinesSink};
use guardheap_harness::corrupt::run_corruption;
use guardheap_harness::scenario::run_scenario;
use guardheap_harness::stress::run_stress;
use guardheap_harness::{CorruptionKind, HarnessError, StressConfig, parse_seed};

/// Self-test tooling for guardheap.
#[derive(Debug, Parser)]
#[command(name = "guardheap-harness")]
#[command(about = "Self-test harness for the guarded heap")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the reference scenario and print its terminate report.
    Scenario {
        /// Print the outcome as JSON instead of the text report.
        #[arg(long)]
        json: bool,
        /// Skip pre-operation scans and fills.
        #[arg(long)]
        quick: bool,
    },
    /// Balanced concurrent allocate/free workload; prints a JSON summary.
    Stress {
        /// Worker threads.
        #[arg(long, default_value_t = 4)]
        threads: usize,
        /// Operations per thread.
        #[arg(long, default_value_t = 10_000)]
        iterations: usize,
        /// Root seed (decimal or 0x...).
        #[arg(long, default_value = "0xDEAD_BEEF")]
        seed: String,
        /// Skip pre-operation scans and fills.
        #[arg(long)]
        quick: bool,
        /// Largest payload requested.
        #[arg(long, default_value_t = 1024)]
        max_size: usize,
    },
    /// Damage the heap on purpose and print the resulting diagnostics as JSON lines.
    Corrupt {
        /// What to damage; omit to run every drill.
        #[arg(long, value_enum)]
        kind: Option<CorruptionKind>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Scenario { json, quick } => {
            let outcome = run_scenario(HeapConfig::default().with_quick_mode(quick))?;
            let mut out = std::io::stdout().lock();
            if json {
                serde_json::to_writer_pretty(&mut out, &outcome)?;
                writeln!(out)?;
            } else {
                out.write_all(outcome.report_text.as_bytes())?;
            }
            if !outcome.matches_reference() {
                return Err("scenario deviated from the reference outcome".into());
            }
        }
        Command::Stress {
            threads,
            iterations,
            seed,
            quick,
            max_size,
        } => {
            let config = StressConfig {
                threads,
                iterations,
                seed: parse_seed(&seed)?,
                quick_mode: quick,
                max_size,
                ..StressConfig::default()
            };
            eprintln!(
                "Stressing with {threads} threads x {iterations} operations (seed {:#x})",
                config.seed
            );
            let summary = run_stress(config)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if !summary.is_balanced() {
                return Err("stress run left the heap unbalanced".into());
            }
        }
        Command::Corrupt { kind } => {
            let kinds = kind.map_or_else(|| CorruptionKind::ALL.to_vec(), |kind| vec![kind]);
            let sink = JsonLinesSink::new(std::io::stdout());
            let mut missed = Vec::new();
            for kind in kinds {
                let outcome = run_corruption(kind)?;
                for diagnostic in &outcome.diagnostics {
                    sink.emit(diagnostic);
                }
                eprintln!(
                    "{kind}: {}",
                    if outcome.detected { "detected" } else { "MISSED" }
                );
                if !outcome.detected {
                    missed.push(kind);
                }
            }
            if let Some(kind) = missed.first() {
                return Err(HarnessError::Undetected {
                    kind: kind.to_string(),
                }
                .into());
            }
        }
    }

    Ok(())
}
