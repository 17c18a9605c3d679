use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use pmc_harvester::catalog::{HttpListingClient, PackageCatalog};
use pmc_harvester::config::HarvestConfig;
use pmc_harvester::db::DocumentStore;
use pmc_harvester::downloader::{
    HttpPackageFetcher, PackageDownloader, RetryPolicy, download_status, estimate_download_time,
};
use pmc_harvester::error::HarvestError;
use pmc_harvester::importer::{BatchImporter, import_status};
use pmc_harvester::output::JsonOutput;
use pmc_harvester::state::PersistentState;
use pmc_harvester::store::Store;

#[derive(Parser)]
#[command(name = "pmc-harvest")]
#[command(about = "Bulk downloader and importer for PMC open-access full-text packages")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    /// Overrides the configured output directory.
    #[arg(long, global = true)]
    output_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "List known packages, refreshing the remote catalog with --refresh")]
    List(ListArgs),
    #[command(about = "Download and verify pending packages")]
    Download(LimitArgs),
    #[command(about = "Re-verify all downloaded packages, deleting corrupt files")]
    Verify,
    #[command(about = "Show download progress")]
    Status,
    #[command(about = "Estimate remaining download time")]
    Estimate,
    #[command(about = "Import downloaded packages into the document store")]
    Import(LimitArgs),
    #[command(about = "Parse one downloaded package without importing it")]
    VerifyPackage(VerifyPackageArgs),
    #[command(about = "Show import progress")]
    ImportStatus,
}

#[derive(Args)]
struct ListArgs {
    #[arg(long)]
    refresh: bool,
}

#[derive(Args)]
struct LimitArgs {
    /// Stop after this many packages.
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Args)]
struct VerifyPackageArgs {
    filename: String,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(harvest) = report.downcast_ref::<HarvestError>() {
            return ExitCode::from(map_exit_code(harvest));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &HarvestError) -> u8 {
    match error {
        HarvestError::ConfigRead(_) | HarvestError::ConfigParse(_) => 2,
        HarvestError::CatalogHttp(_)
        | HarvestError::CatalogStatus { .. }
        | HarvestError::CatalogEmpty(_)
        | HarvestError::Download { .. }
        | HarvestError::DownloadStatus { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = HarvestConfig::resolve(cli.config.as_deref()).into_diagnostic()?;
    if let Some(output_dir) = cli.output_dir {
        config.output_dir = output_dir;
    }

    let store = Store::new(config.output_dir.clone().into());
    let mut state = PersistentState::load(store.clone());

    match cli.command {
        Commands::List(args) => {
            let listing = HttpListingClient::new().into_diagnostic()?;
            let catalog = PackageCatalog::new(
                &listing,
                config.base_url.clone(),
                config.pmcid_min,
                config.pmcid_max,
            );
            let packages = catalog
                .list_available_packages(args.refresh, &mut state)
                .into_diagnostic()?;
            JsonOutput::print(&packages).into_diagnostic()?;
            Ok(())
        }
        Commands::Download(args) => {
            let listing = HttpListingClient::new().into_diagnostic()?;
            let catalog = PackageCatalog::new(
                &listing,
                config.base_url.clone(),
                config.pmcid_min,
                config.pmcid_max,
            );
            // An empty catalog on a fresh output directory refreshes once
            // before downloading.
            if state.download.packages.is_empty() {
                catalog
                    .list_available_packages(true, &mut state)
                    .into_diagnostic()?;
            }
            let fetcher = HttpPackageFetcher::new().into_diagnostic()?;
            let downloader = PackageDownloader::new(
                &fetcher,
                store,
                RetryPolicy::default(),
                Duration::from_secs(config.download_delay_secs),
            );
            downloader
                .download_packages(&mut state, args.limit, &JsonOutput)
                .into_diagnostic()?;
            JsonOutput::print(&download_status(&state)).into_diagnostic()?;
            Ok(())
        }
        Commands::Verify => {
            let fetcher = HttpPackageFetcher::new().into_diagnostic()?;
            let downloader = PackageDownloader::new(
                &fetcher,
                store,
                RetryPolicy::default(),
                Duration::from_secs(config.download_delay_secs),
            );
            let result = downloader
                .verify_all_downloads(&mut state)
                .into_diagnostic()?;
            JsonOutput::print(&result).into_diagnostic()?;
            Ok(())
        }
        Commands::Status => {
            JsonOutput::print(&download_status(&state)).into_diagnostic()?;
            Ok(())
        }
        Commands::Estimate => {
            let estimate = estimate_download_time(
                &state,
                Duration::from_secs(config.download_delay_secs),
            );
            JsonOutput::print(&estimate).into_diagnostic()?;
            Ok(())
        }
        Commands::Import(args) => {
            store.ensure_layout().into_diagnostic()?;
            let mut db =
                DocumentStore::open(config.resolved_database_path()).into_diagnostic()?;
            let mut importer = BatchImporter::new(
                &mut db,
                store,
                config.batch_size,
                config.allow_updates,
                config.source_name.clone(),
            );
            let status = importer
                .import_all_packages(&mut state, args.limit, &JsonOutput)
                .into_diagnostic()?;
            JsonOutput::print(&status).into_diagnostic()?;
            Ok(())
        }
        Commands::VerifyPackage(args) => {
            let mut db =
                DocumentStore::in_memory().into_diagnostic()?;
            let importer = BatchImporter::new(
                &mut db,
                store,
                config.batch_size,
                config.allow_updates,
                config.source_name.clone(),
            );
            let report = importer.verify_package(&args.filename).into_diagnostic()?;
            JsonOutput::print(&report).into_diagnostic()?;
            Ok(())
        }
        Commands::ImportStatus => {
            JsonOutput::print(&import_status(&state)).into_diagnostic()?;
            Ok(())
        }
    }
}
