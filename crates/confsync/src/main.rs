use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use confsync_core::changes::ChangeOptions;
use confsync_core::config::{self, SyncConfig};
use confsync_core::git;
use confsync_core::publish::{PublishOptions, PublishReport, publish_to_remote};
use confsync_core::sync::{SyncOptions, SyncReport, sync_to_remote};

#[derive(Debug, Parser)]
#[command(
    name = "confsync",
    version,
    about = "Mirror a markdown tree onto a Confluence space"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH", help = "Working directory")]
    dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "KEY", help = "Confluence space key")]
    space: Option<String>,
    #[arg(long, global = true, value_name = "URL", help = "Confluence wiki endpoint")]
    endpoint: Option<String>,
    #[arg(long, global = true, help = "Confluence username")]
    username: Option<String>,
    #[arg(long, global = true, help = "Confluence password or API token")]
    password: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone)]
struct ConfigOverrides {
    space: Option<String>,
    endpoint: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

impl ConfigOverrides {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            space: cli.space.clone(),
            endpoint: cli.endpoint.clone(),
            username: cli.username.clone(),
            password: cli.password.clone(),
        }
    }

    fn apply(&self, config: &mut SyncConfig) {
        if let Some(space) = &self.space {
            config.space = space.clone();
        }
        if let Some(endpoint) = &self.endpoint {
            config.endpoint = endpoint.clone();
        }
        if let Some(username) = &self.username {
            config.username = username.clone();
        }
        if let Some(password) = &self.password {
            config.password = password.clone();
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Detect committed-tree changes and mirror them remotely")]
    Sync(SyncArgs),
    #[command(about = "Push the given markdown files or directories")]
    Publish(PublishArgs),
    #[command(about = "List detected changes without touching the remote")]
    Status(StatusArgs),
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(long, value_name = "DIR", help = "Restrict the run to this subdirectory")]
    sync_dir: Option<String>,
    #[arg(long, value_name = "TITLE", help = "Parent page path every page hangs under")]
    parent: Option<String>,
    #[arg(long, help = "Take page titles from the first level-1 heading")]
    use_document_title: bool,
    #[arg(
        long = "exclude",
        value_name = "PATTERN",
        help = "Skip files matching this regular expression (repeatable)"
    )]
    exclude: Vec<String>,
    #[arg(long, help = "Render soft line breaks as hard breaks")]
    hard_wraps: bool,
    #[arg(long, help = "Report the planned actions without writing anything")]
    dry_run: bool,
    #[arg(long, help = "Print the report as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct PublishArgs {
    #[arg(value_name = "SOURCE", required = true, help = "Markdown files or directories")]
    sources: Vec<String>,
    #[arg(long, value_name = "TITLE", help = "Fixed page title (single file only)")]
    title: Option<String>,
    #[arg(
        long,
        value_name = "MIN",
        help = "Only publish files modified within the last MIN minutes"
    )]
    since: Option<u64>,
    #[arg(long, value_name = "TITLE", help = "Parent page path every page hangs under")]
    parent: Option<String>,
    #[arg(long, help = "Take page titles from the first level-1 heading")]
    use_document_title: bool,
    #[arg(
        long = "exclude",
        value_name = "PATTERN",
        help = "Skip files matching this regular expression (repeatable)"
    )]
    exclude: Vec<String>,
    #[arg(long, help = "Render soft line breaks as hard breaks")]
    hard_wraps: bool,
    #[arg(long, help = "Print the report as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct StatusArgs {
    #[arg(long, value_name = "DIR", help = "Restrict the run to this subdirectory")]
    sync_dir: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let workdir = resolve_workdir(cli.dir.as_deref())?;
    let overrides = ConfigOverrides::from_cli(&cli);

    match cli.command {
        Commands::Sync(args) => run_sync(&workdir, &overrides, args),
        Commands::Publish(args) => run_publish(&workdir, &overrides, args),
        Commands::Status(args) => run_status(&workdir, args),
    }
}

fn resolve_workdir(dir: Option<&Path>) -> Result<PathBuf> {
    dotenvy::dotenv().ok();

    let workdir = match dir {
        Some(dir) => dir.to_path_buf(),
        None => env::current_dir().context("failed to read current directory")?,
    };
    let project_env = workdir.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }
    Ok(workdir)
}

fn load_run_config(workdir: &Path, overrides: &ConfigOverrides) -> Result<SyncConfig> {
    let mut config = config::load_config(workdir)?;
    overrides.apply(&mut config);
    Ok(config)
}

fn run_sync(workdir: &Path, overrides: &ConfigOverrides, args: SyncArgs) -> Result<()> {
    let config = load_run_config(workdir, overrides)?;
    let mut options = SyncOptions::from_config(&config);
    if args.sync_dir.is_some() {
        options.sync_root = args.sync_dir;
    }
    if args.parent.is_some() {
        options.base_parent = args.parent;
    }
    options.use_document_title = args.use_document_title;
    options.hard_wraps = args.hard_wraps;
    options.exclude_patterns = args.exclude;
    options.dry_run = args.dry_run;

    let report = sync_to_remote(workdir, &config, &options)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_sync_report(&report);
    }
    if !report.success {
        bail!("sync finished with {} error(s)", report.errors.len());
    }
    Ok(())
}

fn run_publish(workdir: &Path, overrides: &ConfigOverrides, args: PublishArgs) -> Result<()> {
    let config = load_run_config(workdir, overrides)?;
    let options = PublishOptions {
        sources: args.sources,
        title: args.title,
        base_parent: args.parent.or_else(|| config.base_parent()),
        use_document_title: args.use_document_title,
        hard_wraps: args.hard_wraps,
        exclude_patterns: args.exclude,
        since_minutes: args.since,
    };

    let report = publish_to_remote(workdir, &config, &options)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_publish_report(&report);
    }
    if !report.success {
        bail!("publish finished with {} error(s)", report.errors.len());
    }
    Ok(())
}

fn run_status(workdir: &Path, args: StatusArgs) -> Result<()> {
    let config = config::load_config(workdir)?;
    let sync_root = args.sync_dir.or_else(|| config.sync_root());
    let changes = git::detect_changes(workdir, &ChangeOptions { sync_root })?;

    println!("working tree status");
    println!("uploads: {}", changes.uploads.len());
    println!("deletions: {}", changes.deletions.len());
    for record in &changes.uploads {
        println!("{}: {}", record.kind.as_str(), record.path);
    }
    for path in &changes.deletions {
        println!("delete: {path}");
    }
    Ok(())
}

fn print_sync_report(report: &SyncReport) {
    println!("sync report");
    println!("success: {}", report.success);
    if report.dry_run {
        println!("dry_run: true");
    }
    println!("created: {}", report.created);
    println!("updated: {}", report.updated);
    println!("deleted: {}", report.deleted);
    println!("skipped: {}", report.skipped);
    println!("requests: {}", report.request_count);
    for page in &report.pages {
        match &page.detail {
            Some(detail) => println!("{}: {} ({detail})", page.action, page.title),
            None => println!("{}: {}", page.action, page.title),
        }
    }
    if !report.errors.is_empty() {
        println!("errors:");
        for error in &report.errors {
            println!("  - {error}");
        }
    }
}

fn print_publish_report(report: &PublishReport) {
    println!("publish report");
    println!("success: {}", report.success);
    println!("created: {}", report.created);
    println!("updated: {}", report.updated);
    println!("skipped: {}", report.skipped);
    println!("requests: {}", report.request_count);
    for page in &report.pages {
        match &page.detail {
            Some(detail) => println!("{}: {} ({detail})", page.action, page.title),
            None => println!("{}: {}", page.action, page.title),
        }
    }
    if !report.errors.is_empty() {
        println!("errors:");
        for error in &report.errors {
            println!("  - {error}");
        }
    }
}
