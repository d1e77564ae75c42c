use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use herbsync_storage::{PgStore, RunLogStore};
use herbsync_sync::{ImportPipeline, RunSummary, SyncConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "herbsync")]
#[command(about = "Herb catalog import pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one bounded import; every enabled provider when --provider is omitted.
    Import {
        #[arg(long)]
        provider: Option<String>,
    },
    /// Trigger imports on the configured cron until Ctrl-C.
    Schedule,
    /// Put a provider's checkpoint back to page 1.
    Reset {
        #[arg(long)]
        provider: String,
    },
    /// Print every provider's checkpoint and the latest runs.
    Status,
    /// Merge catalog entities that share a scientific name.
    Consolidate {
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply the Postgres migrations.
    Migrate,
    /// Serve the operator JSON API on HERBSYNC_WEB_PORT.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,herbsync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Import { provider: None }) {
        Commands::Import { provider } => {
            let pipeline = Arc::new(ImportPipeline::from_env().await?);
            let summaries = match provider {
                Some(provider) => vec![pipeline.run_provider(&provider).await?],
                None => pipeline.run_all().await,
            };
            for summary in &summaries {
                print_summary(summary);
            }
        }
        Commands::Schedule => {
            let pipeline = Arc::new(ImportPipeline::from_env().await?);
            let mut sched = pipeline.build_scheduler().await?;
            sched.start().await.context("starting scheduler")?;
            tracing::info!("scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Reset { provider } => {
            let pipeline = ImportPipeline::from_env().await?;
            let checkpoint = pipeline.reset_checkpoint(&provider).await?;
            println!(
                "reset {}: current_page={} is_complete={}",
                checkpoint.provider, checkpoint.current_page, checkpoint.is_complete
            );
        }
        Commands::Status => {
            let pipeline = ImportPipeline::from_env().await?;
            for checkpoint in pipeline.checkpoints().await? {
                println!(
                    "{}: page={} complete={} last_run={} state={:?}",
                    checkpoint.provider,
                    checkpoint.current_page,
                    checkpoint.is_complete,
                    checkpoint
                        .last_run_at
                        .map(|at| at.to_rfc3339())
                        .unwrap_or_else(|| "never".into()),
                    checkpoint.state(),
                );
            }
            let runs = pipeline
                .stores()
                .run_log
                .recent_run_logs(10)
                .await
                .context("loading recent runs")?;
            for run in runs {
                println!(
                    "run {} {} pages={:?}..{:?} processed={} created={} updated={} skipped={} errors={} flagged={} outcome={}",
                    run.run_id,
                    run.provider,
                    run.first_page,
                    run.last_page,
                    run.counts.processed,
                    run.counts.created,
                    run.counts.updated,
                    run.counts.skipped,
                    run.counts.errors,
                    run.counts.flagged,
                    run.outcome,
                );
            }
        }
        Commands::Consolidate { dry_run } => {
            let pipeline = ImportPipeline::from_env().await?;
            let report = pipeline.consolidate(dry_run).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let pipeline = ImportPipeline::from_env().await?;
            let port = pipeline.config().web_port;
            herbsync_web::serve(herbsync_web::AppState::from_pipeline(&pipeline), port).await?;
        }
    }

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{}: run_id={} pages={:?}..{:?} processed={} created={} updated={} skipped={} errors={} flagged={} complete={} outcome={}",
        summary.provider,
        summary.run_id,
        summary.first_page,
        summary.last_page,
        summary.counts.processed,
        summary.counts.created,
        summary.counts.updated,
        summary.counts.skipped,
        summary.counts.errors,
        summary.counts.flagged,
        summary.is_complete,
        summary.outcome.label(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn every_subcommand_has_help_text() {
        let cli = Cli::command();
        for sub in cli.get_subcommands() {
            assert!(sub.get_about().is_some(), "{} has no about", sub.get_name());
        }
    }

    #[test]
    fn import_is_the_default_command() {
        let cli = Cli::try_parse_from(["herbsync"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn parses_provider_and_dry_run_flags() {
        let cli = Cli::try_parse_from(["herbsync", "import", "--provider", "trefle"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Import { provider: Some(ref p) }) if p == "trefle"
        ));

        let cli = Cli::try_parse_from(["herbsync", "consolidate", "--dry-run"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Consolidate { dry_run: true })));

        assert!(Cli::try_parse_from(["herbsync", "reset"]).is_err());
    }
}
