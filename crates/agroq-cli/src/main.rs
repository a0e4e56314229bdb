use agroq_core::SyncResult;
use agroq_sync::{BatchSyncSummary, CompanySelection, SyncConfig, SyncRequest};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "agroq-cli")]
#[command(about = "Quality data synchronization command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull quality data from the external API into the local store.
    Sync(SyncArgs),
    Migrate,
    Serve,
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Company to synchronize.
    #[arg(long)]
    empresa: Option<String>,
    /// Synchronize every active company registered locally.
    #[arg(long, conflicts_with = "empresa")]
    all_companies: bool,
    /// Email of the administrator credited with created records.
    #[arg(long)]
    admin_user: Option<String>,
    /// Maximum number of records to synchronize per company.
    #[arg(long)]
    limit: Option<usize>,
}

impl SyncArgs {
    fn into_request(self, config: &SyncConfig) -> SyncRequest {
        let selection = match (self.empresa, self.all_companies) {
            (Some(label), _) => CompanySelection::Explicit(label),
            (None, true) => CompanySelection::AllActive,
            (None, false) => CompanySelection::Defaults,
        };
        SyncRequest {
            selection,
            admin_email: self.admin_user.or_else(|| config.admin_email.clone()),
            record_limit: self.limit,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or_else(|| Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let config = SyncConfig::from_env();
            let request = args.into_request(&config);
            println!("starting quality data sync...");
            let summary = agroq_sync::run_sync_from_env(&config, &request).await?;
            print_summary(&summary);
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let pool = agroq_storage::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            agroq_storage::run_migrations(&pool)
                .await
                .context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => {
            agroq_web::serve_from_env().await?;
        }
    }

    Ok(())
}

fn print_result(result: &SyncResult) {
    if result.success {
        println!(
            "ok   {}: {} processed, {} created, {} updated, {} failed",
            result.company_label,
            result.records_processed,
            result.records_created,
            result.records_updated,
            result.records_failed
        );
    } else {
        println!("fail {}: {}", result.company_label, result.message);
    }
}

fn print_summary(summary: &BatchSyncSummary) {
    for result in &summary.results {
        print_result(result);
    }
    let totals = &summary.totals;
    println!("{}", "=".repeat(50));
    println!("sync summary (run {}):", summary.run_id);
    println!("  companies processed: {}", totals.companies);
    println!("  companies failed:    {}", totals.companies_failed);
    println!("  records processed:   {}", totals.records_processed);
    println!("  records created:     {}", totals.records_created);
    println!("  records updated:     {}", totals.records_updated);
    println!("  records failed:      {}", totals.records_failed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_flags_map_to_selection() {
        let config = SyncConfig::from_env();

        let cli = Cli::try_parse_from(["agroq-cli", "sync", "--empresa", "ACME", "--limit", "5"]).unwrap();
        let Some(Commands::Sync(args)) = cli.command else {
            panic!("expected sync command");
        };
        let request = args.into_request(&config);
        assert_eq!(request.selection, CompanySelection::Explicit("ACME".into()));
        assert_eq!(request.record_limit, Some(5));

        let cli = Cli::try_parse_from(["agroq-cli", "sync", "--all-companies", "--admin-user", "root@agroq.test"]).unwrap();
        let Some(Commands::Sync(args)) = cli.command else {
            panic!("expected sync command");
        };
        let request = args.into_request(&config);
        assert_eq!(request.selection, CompanySelection::AllActive);
        assert_eq!(request.admin_email.as_deref(), Some("root@agroq.test"));

        let request = SyncArgs::default().into_request(&config);
        assert_eq!(request.selection, CompanySelection::Defaults);
    }

    #[test]
    fn explicit_company_conflicts_with_all_companies() {
        assert!(Cli::try_parse_from(["agroq-cli", "sync", "--empresa", "ACME", "--all-companies"]).is_err());
    }

    #[test]
    fn no_subcommand_is_accepted() {
        let cli = Cli::try_parse_from(["agroq-cli"]).unwrap();
        assert!(cli.command.is_none());
    }
}
