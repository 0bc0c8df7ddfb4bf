//! tmlsync CLI
//!
//! Moves TML content between platform environments:
//! - `export`: pull selected objects from an environment into a content root
//! - `import`: push a content root into an environment, remapping GUIDs
//! - `mapping-details`: show and export the GUID mapping for a pair of environments

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use tmlsync_content::ContentType;
use tmlsync_migrate::{
    CancelToken, ContentApi, ContentFilter, ContentHeader, ExportSelector, Exporter,
    ImportOptions, ImportPolicy, ImportSource, Importer, MigrationContext, ShareTarget,
    WaitPolicy, MAX_GUIDS_PER_CALL,
};
use tmlsync_storage::{ContentFilesystem, GuidMappingStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod report;
mod rest;

use config::{Config, Environment};
use rest::RestClient;

#[derive(Parser)]
#[command(name = "tmlsync")]
#[command(author, version, about = "Move TML content between environments")]
struct Cli {
    /// Environment profiles (default: $TMLSYNC_CONFIG, then ./tmlsync.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export content from an environment into a content root.
    ///
    /// Select by `--guid` or by any combination of `--tag`, `--author`,
    /// `--type`, `--exclude-type` and `--pattern`; the two styles cannot mix.
    Export(ExportArgs),

    /// Import a content root into an environment.
    Import(ImportArgs),

    /// Print the GUID mapping between two environments and write it as CSV.
    MappingDetails(MappingArgs),
}

#[derive(Args)]
struct ExportArgs {
    /// Content root to export into (created if missing).
    root: PathBuf,

    /// Environment profile to export from.
    #[arg(long)]
    env: String,

    #[arg(long = "guid", value_delimiter = ',')]
    guids: Vec<String>,

    #[arg(long = "tag", value_delimiter = ',')]
    tags: Vec<String>,

    #[arg(long)]
    author: Option<String>,

    #[arg(long = "type", value_delimiter = ',')]
    types: Vec<ContentType>,

    #[arg(long = "exclude-type", value_delimiter = ',')]
    exclude_types: Vec<ContentType>,

    /// Name pattern; `%` matches any run of characters.
    #[arg(long)]
    pattern: Option<String>,

    /// Also export the objects the selected ones depend on.
    #[arg(long)]
    associated: bool,
}

impl ExportArgs {
    fn filter(&self) -> ContentFilter {
        ContentFilter {
            guids: self.guids.clone(),
            tags: self.tags.clone(),
            author: self.author.clone(),
            content_types: self.types.clone(),
            exclude_content_types: self.exclude_types.clone(),
            name_pattern: self.pattern.clone(),
            ..ContentFilter::default()
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum PolicyArg {
    #[value(alias = "validate-only")]
    Validate,
    AllOrNone,
    Partial,
}

impl From<PolicyArg> for ImportPolicy {
    fn from(value: PolicyArg) -> Self {
        match value {
            PolicyArg::Validate => ImportPolicy::ValidateOnly,
            PolicyArg::AllOrNone => ImportPolicy::AllOrNone,
            PolicyArg::Partial => ImportPolicy::Partial,
        }
    }
}

#[derive(Args)]
struct ImportArgs {
    /// Content root to import from.
    path: PathBuf,

    #[arg(long, value_enum)]
    policy: PolicyArg,

    /// Create new objects even where the mapping knows a destination.
    #[arg(long)]
    force_create: bool,

    /// Environment the content was exported from (mapping key only).
    #[arg(long)]
    source: String,

    /// Environment profile to import into.
    #[arg(long)]
    dest: String,

    /// Import only this object.
    #[arg(long)]
    guid: Option<String>,

    #[arg(long = "type", value_delimiter = ',')]
    types: Vec<ContentType>,

    #[arg(long = "exclude-type", value_delimiter = ',')]
    exclude_types: Vec<ContentType>,

    /// Tags to assign to every imported object.
    #[arg(long, value_delimiter = ',')]
    tags: Vec<String>,

    /// Principals to share imported objects with: `NAME` or `NAME:modify`.
    #[arg(long, value_delimiter = ',')]
    share_with: Vec<ShareTarget>,

    #[command(flatten)]
    wait: WaitArgs,
}

impl ImportArgs {
    fn options(&self) -> ImportOptions {
        ImportOptions {
            force_create: self.force_create,
            tags: self.tags.clone(),
            share_with: self.share_with.clone(),
            wait: self.wait.policy(),
            ..ImportOptions::new(self.policy.into(), &self.source, &self.dest)
        }
    }
}

#[derive(Args)]
struct WaitArgs {
    /// Seconds between visibility checks after import.
    #[arg(long)]
    poll_interval_secs: Option<u64>,

    /// Give up waiting for imported objects after this many seconds.
    #[arg(long)]
    wait_timeout_secs: Option<u64>,

    /// Skip the visibility wait.
    #[arg(long)]
    no_wait: bool,
}

impl WaitArgs {
    fn policy(&self) -> Option<WaitPolicy> {
        if self.no_wait {
            return None;
        }
        let mut policy = WaitPolicy::default();
        if let Some(secs) = self.poll_interval_secs {
            policy.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.wait_timeout_secs {
            policy.timeout = Duration::from_secs(secs);
        }
        Some(policy)
    }
}

#[derive(Args)]
struct MappingArgs {
    /// Content root holding the mapping.
    root: PathBuf,

    #[arg(long)]
    source: String,

    #[arg(long)]
    dest: String,

    /// CSV destination (default: next to the mapping file, as `.csv`).
    #[arg(long)]
    out: Option<PathBuf>,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {err:#}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let cancel = CancelToken::new();
    signal_hook::flag::register(signal_hook::consts::SIGINT, cancel.flag())
        .context("failed to install the SIGINT handler")?;

    let config_path = Config::locate(cli.config.as_deref());
    match cli.command {
        Commands::Export(args) => {
            let config = Config::load(&config_path)?;
            cmd_export(&config, &args, cancel)
        }
        Commands::Import(args) => {
            let config = Config::load(&config_path)?;
            cmd_import(&config, &args, cancel)
        }
        Commands::MappingDetails(args) => {
            let config = Config::load_optional(&config_path)?;
            cmd_mapping_details(&config, &args)
        }
    }
}

fn connect(env: &Environment, cancel: CancelToken) -> Result<(RestClient, MigrationContext)> {
    let client = RestClient::new(env)?;
    let version = match &env.platform_version {
        Some(v) => v.clone(),
        None => client
            .platform_version()
            .with_context(|| format!("failed to read the platform version of `{}`", env.name))?,
    };
    let mut ctx = MigrationContext::new(version).with_cancel(cancel);
    if let Some(org) = &env.org {
        ctx = ctx.with_org(org.clone());
    }
    Ok((client, ctx))
}

fn cmd_export(config: &Config, args: &ExportArgs, cancel: CancelToken) -> Result<ExitCode> {
    let selector = ExportSelector::new(args.filter())?;
    let env = config.environment(&args.env)?;
    let fs = ContentFilesystem::initialize(&args.root)?;
    let (client, ctx) = connect(&env, cancel)?;
    export_with(&client, &ctx, &selector, args.associated, &fs)
}

fn export_with(
    api: &dyn ContentApi,
    ctx: &MigrationContext,
    selector: &ExportSelector,
    associated: bool,
    fs: &ContentFilesystem,
) -> Result<ExitCode> {
    let results = Exporter::new(api, ctx).export(selector, associated, fs)?;
    report::print_results(&results);

    if results.is_empty() {
        eprintln!("{}", "nothing matched the selection".yellow());
        return Ok(ExitCode::FAILURE);
    }
    if results.iter().all(|r| r.is_error()) {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_import(config: &Config, args: &ImportArgs, cancel: CancelToken) -> Result<ExitCode> {
    let source = ImportSource::new(
        args.guid.clone(),
        args.types.clone(),
        args.exclude_types.clone(),
    )?;
    let fs = ContentFilesystem::open(&args.path)?;
    let env = config.environment(&args.dest)?;
    let (client, ctx) = connect(&env, cancel)?;
    import_with(&client, &ctx, &fs, &source, &args.options())
}

fn import_with(
    api: &dyn ContentApi,
    ctx: &MigrationContext,
    fs: &ContentFilesystem,
    source: &ImportSource,
    options: &ImportOptions,
) -> Result<ExitCode> {
    let report = Importer::new(api, ctx).import(fs, source, options)?;
    report::print_results(&report.results);
    println!("stage: {}", report.stage.to_string().bold());
    Ok(ExitCode::SUCCESS)
}

fn cmd_mapping_details(config: &Config, args: &MappingArgs) -> Result<ExitCode> {
    let fs = ContentFilesystem::open(&args.root)?;
    let mapping = GuidMappingStore::load(
        &fs.mapping_path(&args.source, &args.dest),
        &args.source,
        &args.dest,
    )?;

    let guids_in = |env: &str| -> Vec<String> {
        mapping
            .entries()
            .filter_map(|(_, envs)| envs.get(env).cloned())
            .collect()
    };
    let source_names = describe(config, &args.source, &guids_in(&args.source));
    let dest_names = describe(config, &args.dest, &guids_in(&args.dest));

    let rows = report::mapping_rows(&mapping, &source_names, &dest_names);
    report::print_mapping(&rows);

    let out = args
        .out
        .clone()
        .unwrap_or_else(|| fs.mapping_csv_path(&args.source, &args.dest));
    report::write_csv(&out, &rows)?;
    println!("wrote {}", out.display());
    Ok(ExitCode::SUCCESS)
}

/// Headers for `guids` in `env`, keyed by lowercased GUID. Empty when the
/// environment has no usable profile or cannot be reached.
fn describe(config: &Config, env: &str, guids: &[String]) -> BTreeMap<String, ContentHeader> {
    let mut out = BTreeMap::new();
    if !config.has(env) || guids.is_empty() {
        return out;
    }
    let client = match config
        .environment(env)
        .map_err(anyhow::Error::from)
        .and_then(|e| RestClient::new(&e))
    {
        Ok(client) => client,
        Err(err) => {
            tracing::warn!(env = %env, error = %err, "cannot resolve names");
            return out;
        }
    };
    for chunk in guids.chunks(MAX_GUIDS_PER_CALL) {
        let filter = ContentFilter {
            guids: chunk.to_vec(),
            ..ContentFilter::default()
        };
        match client.list_content(&filter) {
            Ok(headers) => {
                for h in headers {
                    out.insert(h.guid.to_ascii_lowercase(), h);
                }
            }
            Err(err) => {
                tracing::warn!(env = %env, error = %err, "name lookup failed");
                break;
            }
        }
    }
    out
}
