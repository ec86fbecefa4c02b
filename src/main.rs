//! fedstat - federated analytics query engine
//!
//! A CLI that runs statistical tests across the sites of a federation,
//! fetching only per-group aggregates from each site.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime error (config, validation, unknown federation, etc.)
//!   2 - The query ran and failed

use anyhow::{anyhow, Context, Result};
use fedstat::cli::{Args, Command, OutputFormat, QueriesCommand};
use fedstat::collector::{AggregateCollector, CollectorSettings, HttpSiteClient};
use fedstat::config::{Config, DEFAULT_CONFIG_FILE};
use fedstat::lifecycle::LifecycleSettings;
use fedstat::models::{AnalyticsQuery, QueryParameters, QueryStatus};
use fedstat::report;
use fedstat::{AnalyticsService, QueryManager, QueryRepository};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle init-config early (no logging needed)
    if matches!(args.command, Command::InitConfig) {
        return handle_init_config();
    }

    // Load configuration before logging so `general.verbose` can raise the level
    let (config, config_source) = match load_config(&args) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    if let Err(e) = init_logging(&args, config.general.verbose) {
        eprintln!("Warning: {}", e);
    }

    info!("fedstat v{}", env!("CARGO_PKG_VERSION"));
    match config_source {
        Some(path) => info!("Loaded config from: {}", path.display()),
        None => debug!("No config file found, using defaults"),
    }
    debug!("Arguments: {:?}", args);

    match run(args, config).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Command failed: {}", e);
            eprintln!("\n❌ Error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Handle init-config: generate a default .fedstat.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(DEFAULT_CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            DEFAULT_CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", DEFAULT_CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", DEFAULT_CONFIG_FILE);
    println!("   Edit it to declare your federations, members and variables.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args, config_verbose: bool) -> Result<()> {
    let level = args.log_level(config_verbose);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow!("Failed to set tracing subscriber: {}", e))
}

/// Dispatch the subcommand. Returns the exit code (0 or 2).
async fn run(args: Args, config: Config) -> Result<i32> {
    let (service, repository) = build_service(&config)?;
    let exit_code = dispatch(&args, &service).await;
    repository.flush();
    exit_code
}

async fn dispatch(args: &Args, service: &AnalyticsService) -> Result<i32> {
    let (federation_id, parameters) = match &args.command {
        Command::Descriptive(a) => (
            a.scope.federation.clone(),
            QueryParameters::Descriptive(a.to_request().map_err(|e| anyhow!(e))?),
        ),
        Command::Ttest(a) => (
            a.scope.federation.clone(),
            QueryParameters::TTest(a.to_request().map_err(|e| anyhow!(e))?),
        ),
        Command::Chisquare(a) => (
            a.scope.federation.clone(),
            QueryParameters::ChiSquare(a.to_request().map_err(|e| anyhow!(e))?),
        ),
        Command::Anova(a) => (
            a.scope.federation.clone(),
            QueryParameters::Anova(a.to_request().map_err(|e| anyhow!(e))?),
        ),
        Command::Queries(queries) => return handle_queries(args, service, queries),
        Command::InitConfig => return Ok(0),
    };

    run_query(args, service, &federation_id, parameters).await
}

/// Wire the site client, collector, repository and manager together.
fn build_service(config: &Config) -> Result<(AnalyticsService, Arc<QueryRepository>)> {
    let collector_settings = CollectorSettings::from(&config.collector);
    let client = HttpSiteClient::new(collector_settings.site_timeout)?;
    let collector = Arc::new(AggregateCollector::new(Arc::new(client), collector_settings));

    let repository = match &config.general.history_file {
        Some(path) => {
            info!("Using query history at: {}", path.display());
            QueryRepository::open(path)?
        }
        None => {
            debug!("No history file configured, keeping queries in memory");
            QueryRepository::in_memory()
        }
    };

    let repository = Arc::new(repository);
    let manager = QueryManager::new(
        collector,
        repository.clone(),
        LifecycleSettings::from(&config.queries),
    );
    for snapshot in config.snapshots() {
        manager.register_federation(snapshot);
    }
    if config.federations.is_empty() {
        warn!("No federations configured. Run `fedstat init-config` to create an example.");
    }

    Ok((AnalyticsService::new(manager), repository))
}

/// Submit one query, wait for it and emit the report.
async fn run_query(
    args: &Args,
    service: &AnalyticsService,
    federation_id: &str,
    parameters: QueryParameters,
) -> Result<i32> {
    let start_time = Instant::now();
    let kind = parameters.kind();

    let handle = service
        .manager()
        .submit(federation_id, parameters)
        .map_err(|e| anyhow!(e))?;

    let spinner = if args.quiet {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed}] {msg}")
        {
            pb.set_style(style);
        }
        pb.enable_steady_tick(Duration::from_millis(120));
        pb
    };
    spinner.set_message(format!("Running {} query on {}...", kind, federation_id));

    let outcome = tokio::select! {
        query = service.manager().wait(handle.query_id) => query.map_err(|e| anyhow!(e)),
        _ = tokio::signal::ctrl_c() => {
            spinner.set_message("Cancelling...");
            service.manager().shutdown();
            service.manager().wait(handle.query_id).await.map_err(|e| anyhow!(e))
        }
    };
    spinner.finish_and_clear();
    let query = outcome?;

    emit(args, &query)?;

    let duration = start_time.elapsed().as_secs_f64();
    match query.status {
        QueryStatus::Completed => {
            if !args.quiet {
                eprintln!("✅ Query {} completed in {:.1}s", query.id, duration);
                for warning in &query.warnings {
                    eprintln!("⚠️  {}", warning.message);
                }
            }
            Ok(0)
        }
        _ => {
            if let Some(ref e) = query.error {
                eprintln!("⛔ Query {} failed: {}", query.id, e);
            }
            Ok(2)
        }
    }
}

/// Handle the `queries` subcommands.
fn handle_queries(args: &Args, service: &AnalyticsService, command: &QueriesCommand) -> Result<i32> {
    match command {
        QueriesCommand::List {
            federation,
            limit,
            offset,
        } => {
            let page = service
                .list_queries(federation, *limit, *offset)
                .map_err(|e| anyhow!(e))?;
            let output = match args.format {
                OutputFormat::Json => report::generate_json_report(&page)?,
                OutputFormat::Markdown => report::generate_history_markdown(federation, &page),
            };
            write_output(args, &output)?;
            Ok(0)
        }
        QueriesCommand::Show { federation, id } => {
            let query = service.get_query(federation, *id).map_err(|e| anyhow!(e))?;
            emit(args, &query)?;
            Ok(0)
        }
    }
}

/// Render a query in the requested format and write it out.
fn emit(args: &Args, query: &AnalyticsQuery) -> Result<()> {
    let output = match args.format {
        OutputFormat::Json => report::generate_json_report(query)?,
        OutputFormat::Markdown => report::generate_markdown_report(query),
    };
    write_output(args, &output)
}

fn write_output(args: &Args, output: &str) -> Result<()> {
    match &args.output {
        Some(path) => {
            report::write_report(output, path)?;
            if !args.quiet {
                eprintln!("📝 Report saved to: {}", path.display());
            }
        }
        None => println!("{}", output),
    }
    Ok(())
}

/// Load configuration from file or use defaults, then apply CLI overrides.
///
/// Runs before logging is set up, so it returns the file it read instead
/// of logging it.
fn load_config(args: &Args) -> Result<(Config, Option<PathBuf>)> {
    let (mut config, source) = if let Some(ref config_path) = args.config {
        (Config::load(config_path)?, Some(config_path.clone()))
    } else {
        match Config::load_default()? {
            Some(config) => (config, Some(PathBuf::from(DEFAULT_CONFIG_FILE))),
            None => (Config::default(), None),
        }
    };

    config.merge_with_args(args);
    config.validate()?;
    Ok((config, source))
}
