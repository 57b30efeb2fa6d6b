use anyhow::Context;
use clap::Parser;
use covirt::cli::Cli;

fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let input = cli.input.clone();

    let report = covirt::run(&cli).with_context(|| format!("failed to virtualize {}", input.display()))?;

    for warning in &report.warnings {
        tracing::warn!("{warning}");
    }
    if let Some(table) = &report.dump_table {
        println!("{table}");
    }

    Ok(())
}
