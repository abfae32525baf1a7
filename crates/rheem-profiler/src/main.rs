//! Fit load profile coefficients from an execution log.

use clap::Parser;
use rheem_common::Configuration;
use rheem_profiler::GeneticOptimizerApp;

#[derive(Parser, Debug)]
#[command(name = "rheem-profiler", about = "Genetic load profile learner")]
struct Args {
    /// Configuration file (TOML); defaults apply if omitted.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Execution log to train on; overrides `rheem.core.log.executions`.
    #[arg(long)]
    log: Option<std::path::PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let mut configuration = match &args.config {
        Some(path) => Configuration::load_from_file(path)?,
        None => Configuration::new(),
    };
    if let Some(log) = &args.log {
        configuration.set("rheem.core.log.executions", log.display().to_string());
    }

    let mut app = GeneticOptimizerApp::new(configuration)?;
    let model = app.run()?;

    println!("# fitness: {:.4} after {} generations", model.fitness, model.generations);
    for line in &model.configuration_lines {
        println!("{line}");
    }
    Ok(())
}
