use anyhow::{Context, Result};
use blobdex::config::Config;
use blobdex::index::{SearchFilters, SearchQuery};
use blobdex::scheduler::SyncScheduler;
use blobdex::search::{SearchResult, SearchService};
use blobdex::sync::{SyncReport, SyncService, SyncStatus};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "blobdex", version, about = "Incremental code search over git branches and tags")]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Root directory for mirrors, settings, state and the index
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Index the local mirrors without fetching from remotes
    #[arg(long, global = true)]
    skip_fetch: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the sync scheduler until interrupted
    Serve {
        /// Sync every repository once before the first scheduled run
        #[arg(long)]
        sync_now: bool,
    },
    /// Sync every configured repository, or just one
    Sync {
        organization: Option<String>,
        project: Option<String>,
        repository: Option<String>,
    },
    /// Register a repository without syncing it
    Add {
        organization: String,
        project: String,
        url: String,
    },
    /// Register a repository and sync it right away
    Import {
        organization: String,
        project: String,
        url: String,
    },
    /// Search the index
    Search {
        query: String,
        /// Filter by file extension
        #[arg(short = 'x', long = "ext")]
        extensions: Vec<String>,
        #[arg(short = 'o', long = "org")]
        organizations: Vec<String>,
        #[arg(short = 'p', long = "project")]
        projects: Vec<String>,
        #[arg(short = 'r', long = "repo")]
        repositories: Vec<String>,
        /// Filter by branch or tag name
        #[arg(short = 'b', long = "ref")]
        refs: Vec<String>,
        /// Zero-based page number
        #[arg(long, default_value_t = 0)]
        page: usize,
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show index statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();

    // BUILD_TIMESTAMP and GIT_COMMIT_HASH come from build.rs; the hash is
    // "unknown" when building outside a git checkout
    tracing::info!(
        "blobdex {} (built {}, commit {})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIMESTAMP"),
        env!("GIT_COMMIT_HASH")
    );

    let mut config = Config::load_or_default(cli.config.as_deref())?;
    config.apply_env_overrides();
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }
    if cli.skip_fetch {
        config.git.skip_fetch = true;
    }
    config.validate()?;
    tracing::info!("Using data directory {}", config.storage.data_dir.display());

    let service = SyncService::open(config).context("Failed to open blobdex data directory")?;

    match cli.command {
        Command::Serve { sync_now } => serve(service, sync_now).await,
        Command::Sync {
            organization,
            project,
            repository,
        } => match (organization, project, repository) {
            (Some(organization), Some(project), Some(repository)) => {
                let report = service.sync_one(&organization, &project, &repository).await?;
                print_report(&report);
                Ok(())
            }
            (None, None, None) => {
                let results = service.sync_all().await;
                let mut failed = 0;
                for (repository, result) in results {
                    match result {
                        Ok(report) => print_report(&report),
                        Err(e) => {
                            failed += 1;
                            println!("{}: failed: {}", repository, e);
                        }
                    }
                }
                if failed > 0 {
                    anyhow::bail!("{} repositories failed to sync", failed);
                }
                Ok(())
            }
            _ => anyhow::bail!("Give organization, project and repository together, or none of them"),
        },
        Command::Add {
            organization,
            project,
            url,
        } => {
            let target = service
                .settings()
                .add_repository(&organization, &project, &url)
                .await?;
            println!("Added {} ({})", target, target.url);
            Ok(())
        }
        Command::Import {
            organization,
            project,
            url,
        } => {
            let report = service.import(&organization, &project, &url).await?;
            print_report(&report);
            Ok(())
        }
        Command::Search {
            query,
            extensions,
            organizations,
            projects,
            repositories,
            refs,
            page,
            json,
        } => {
            let search = SearchService::new(
                service.index().clone(),
                service.locator().clone(),
                Arc::new(blobdex::classifier::ContentClassifier::new(
                    &service.config().indexing.encodings,
                )?),
                service.config().search.clone(),
            );
            let mut request = SearchQuery::new(query);
            request.filters = SearchFilters {
                extensions,
                organizations,
                projects,
                repositories,
                refs,
            };
            request.page = page;
            request.page_size = 0;

            let result = search.search(request).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_search(&result);
            }
            Ok(())
        }
        Command::Stats => {
            let stats = service.index().stats()?;
            let repositories = service.settings().list_repositories().await;
            println!("Repositories: {}", repositories.len());
            println!("Documents:    {}", stats.total_documents);
            Ok(())
        }
    }
}

async fn serve(service: SyncService, sync_now: bool) -> Result<()> {
    let scheduler = SyncScheduler::new(service)?;

    if sync_now {
        scheduler.trigger_all().await;
    }
    scheduler.start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");
    scheduler.stop().await;
    Ok(())
}

fn print_report(report: &SyncReport) {
    match report.status {
        SyncStatus::AlreadyRunning => println!("{}: already syncing", report.repository),
        SyncStatus::UpToDate => println!("{}: up to date", report.repository),
        SyncStatus::Completed => {
            println!(
                "{}: {} created, {} updated, {} removed refs; {} adds, {} deletes, {} skipped files in {:?}",
                report.repository,
                report.created,
                report.updated,
                report.removed,
                report.adds,
                report.deletes,
                report.skipped_files,
                report.elapsed
            );
            for (name, reason) in &report.failed_refs {
                println!("  {} not indexed: {}", name, reason);
            }
        }
    }
}

fn print_search(result: &SearchResult) {
    println!(
        "{} hits (page {}, {}ms)",
        result.total, result.page, result.duration_ms
    );
    for hit in &result.hits {
        println!(
            "\n{}:{}/{} {} [{}]",
            hit.organization,
            hit.project,
            hit.repository,
            hit.path,
            hit.refs.join(", ")
        );
        for preview in &hit.previews {
            for (i, line) in preview.preview.lines().enumerate() {
                let number = preview.offset + i;
                let marker = if preview.hits.contains(&number) { '>' } else { ' ' };
                println!("{}{:>6}: {}", marker, number + 1, line);
            }
            println!("   ...");
        }
    }
}
