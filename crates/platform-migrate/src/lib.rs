//! Platform Migrate - command line front end
//!
//! Runs the migration engine over a JSON file of platform documents:
//! - `migrate` converts every document to a target version, one task per
//!   resource or as a single background batch
//! - `analyze` counts documents per version and reports the conversion
//!   path of each one without touching it
//!
//! Conversions come from a TOML rules file of `[[rules]]` tables; engine
//! settings from an optional TOML config file.

use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use platform_migration::{
    ConversionRegistry, ConversionRule, Document, InMemoryResourceStore, MigrationAnalytics,
    MigrationConfig, MigrationManager, MigrationPath, MigrationReport, MigrationStatus,
    ResourceRef, SchemaEvolutionTracker,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Declarative conversion rules file
#[derive(Debug, Default, Deserialize)]
pub struct RulesFile {
    #[serde(default)]
    pub rules: Vec<ConversionRule>,
}

/// Build the command line definition
#[must_use]
pub fn build_cli() -> Command {
    let input = Arg::new("input")
        .long("input")
        .short('i')
        .required(true)
        .value_parser(value_parser!(PathBuf))
        .help("JSON file with an array of platform documents");
    let target = Arg::new("target-version")
        .long("target-version")
        .short('t')
        .required(true)
        .help("Schema version to migrate to");
    let rules = Arg::new("rules")
        .long("rules")
        .short('r')
        .required(true)
        .value_parser(value_parser!(PathBuf))
        .help("TOML file with [[rules]] conversion tables");
    let namespace = Arg::new("namespace")
        .long("namespace")
        .short('n')
        .help("Only consider documents in this namespace");

    Command::new("platform-migrate")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Migrate observability platform resources between schema versions")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(
            Command::new("migrate")
                .about("Convert documents to the target version")
                .arg(input.clone())
                .arg(target.clone())
                .arg(rules.clone())
                .arg(namespace.clone())
                .arg(
                    Arg::new("output")
                        .long("output")
                        .short('o')
                        .value_parser(value_parser!(PathBuf))
                        .help("Write migrated documents here instead of stdout"),
                )
                .arg(
                    Arg::new("config")
                        .long("config")
                        .short('c')
                        .value_parser(value_parser!(PathBuf))
                        .help("TOML engine configuration"),
                )
                .arg(
                    Arg::new("dry-run")
                        .long("dry-run")
                        .action(ArgAction::SetTrue)
                        .help("Run every step except the write"),
                )
                .arg(
                    Arg::new("batch")
                        .long("batch")
                        .action(ArgAction::SetTrue)
                        .help("Migrate all documents as one background batch"),
                )
                .arg(
                    Arg::new("timeout")
                        .long("timeout")
                        .default_value("300")
                        .value_parser(value_parser!(u64))
                        .help("Seconds to wait for a batch to finish"),
                ),
        )
        .subcommand(
            Command::new("analyze")
                .about("Report conversion paths without migrating")
                .arg(input)
                .arg(target)
                .arg(rules)
                .arg(namespace),
        )
}

/// Install the global tracing subscriber on stderr
pub fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

/// Read a JSON array of documents
///
/// # Errors
/// When the file cannot be read or parsed.
pub fn load_documents(path: &Path) -> Result<Vec<Document>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid documents in {}", path.display()))
}

/// Read conversion rules into a registry
///
/// # Errors
/// When the file cannot be read or parsed, or holds no rules.
pub fn load_rules(path: &Path) -> Result<(ConversionRegistry, Vec<(String, String)>)> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let file: RulesFile =
        toml::from_str(&raw).with_context(|| format!("invalid rules in {}", path.display()))?;
    if file.rules.is_empty() {
        bail!("{} defines no conversion rules", path.display());
    }

    let mut registry = ConversionRegistry::new();
    let mut paths = Vec::with_capacity(file.rules.len());
    for rule in file.rules {
        paths.push((rule.from.clone(), rule.to.clone()));
        registry.register_rule(rule);
    }
    Ok((registry, paths))
}

fn select_documents(documents: Vec<Document>, namespace: Option<&str>) -> Vec<Document> {
    let mut selected: Vec<Document> = documents
        .into_iter()
        .filter(|d| namespace.map_or(true, |ns| d.reference.namespace == ns))
        .collect();
    selected.sort_by(|a, b| a.reference.cmp(&b.reference));
    selected
}

fn required<'a, T: Clone + Send + Sync + 'static>(args: &'a ArgMatches, name: &str) -> Result<&'a T> {
    args.get_one::<T>(name)
        .with_context(|| format!("missing --{name}"))
}

/// Options of the `migrate` subcommand
#[derive(Debug, Clone)]
pub struct MigrateOptions {
    pub input: PathBuf,
    pub output: Option<PathBuf>,
    pub target_version: String,
    pub rules: PathBuf,
    pub config: Option<PathBuf>,
    pub namespace: Option<String>,
    pub dry_run: bool,
    pub batch: bool,
    pub timeout: Duration,
}

impl MigrateOptions {
    /// Extract options from parsed arguments
    ///
    /// # Errors
    /// When a required argument is missing.
    pub fn from_matches(args: &ArgMatches) -> Result<Self> {
        Ok(Self {
            input: required::<PathBuf>(args, "input")?.clone(),
            output: args.get_one::<PathBuf>("output").cloned(),
            target_version: required::<String>(args, "target-version")?.clone(),
            rules: required::<PathBuf>(args, "rules")?.clone(),
            config: args.get_one::<PathBuf>("config").cloned(),
            namespace: args.get_one::<String>("namespace").cloned(),
            dry_run: args.get_flag("dry-run"),
            batch: args.get_flag("batch"),
            timeout: Duration::from_secs(*required::<u64>(args, "timeout")?),
        })
    }
}

/// Outcome of a `migrate` run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSummary {
    pub total: usize,
    pub migrated: usize,
    pub failed: usize,
    pub skipped: usize,
    pub dry_run: bool,
    pub analytics: MigrationAnalytics,
    pub reports: Vec<MigrationReport>,
    #[serde(skip)]
    pub documents: Vec<Document>,
}

impl MigrationSummary {
    #[inline]
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Migrate the input documents
///
/// Per-resource failures are counted, not returned.
///
/// # Errors
/// When inputs cannot be loaded, the configuration is invalid or a batch
/// does not finish within the timeout.
pub async fn run_migrate(options: &MigrateOptions) -> Result<MigrationSummary> {
    let mut config = match &options.config {
        Some(path) => MigrationConfig::load(path)?,
        None => MigrationConfig::default(),
    };
    if options.dry_run {
        config = config.with_dry_run(true);
    }
    let (conversions, _) = load_rules(&options.rules)?;
    let documents = select_documents(
        load_documents(&options.input)?,
        options.namespace.as_deref(),
    );
    let refs: Vec<ResourceRef> = documents.iter().map(|d| d.reference.clone()).collect();
    let total = refs.len();
    tracing::info!(
        resources = total,
        target_version = %options.target_version,
        dry_run = config.dry_run,
        batch = options.batch,
        "Loaded documents"
    );

    let store = Arc::new(InMemoryResourceStore::with_documents(documents));
    let manager = MigrationManager::new(store.clone(), conversions, config)?;

    let (migrated, failed, skipped) = if refs.is_empty() {
        (0, 0, 0)
    } else if options.batch {
        let task = manager.migrate_batch(refs, &options.target_version).await?;
        let done = manager.wait_for_completion(&task.id, options.timeout).await?;
        let progress = done.progress;
        (
            progress.migrated_resources,
            progress.failed_resources,
            progress.skipped_resources,
        )
    } else {
        let mut counts = (0, 0, 0);
        for resource in &refs {
            let current = store
                .snapshot(resource)
                .is_some_and(|d| d.version() == options.target_version);
            if current {
                tracing::info!(%resource, "Already at target version, skipping");
                counts.2 += 1;
                continue;
            }
            match manager.migrate_resource(resource, &options.target_version).await {
                Ok(()) => counts.0 += 1,
                Err(error) => {
                    tracing::error!(%resource, %error, stage = ?error.stage(), "Migration failed");
                    counts.1 += 1;
                }
            }
        }
        counts
    };

    let failed_tasks = manager
        .list_active_migrations()
        .iter()
        .filter(|t| t.status == MigrationStatus::Failed)
        .count();
    tracing::info!(migrated, failed, skipped, failed_tasks, "Migration run finished");

    let mut documents = store.documents();
    documents.sort_by(|a, b| a.reference.cmp(&b.reference));
    Ok(MigrationSummary {
        total,
        migrated,
        failed,
        skipped,
        dry_run: manager.config().dry_run,
        analytics: manager.tracker().analytics(),
        reports: manager.reporter().all_reports(),
        documents,
    })
}

/// Options of the `analyze` subcommand
#[derive(Debug, Clone)]
pub struct AnalyzeOptions {
    pub input: PathBuf,
    pub target_version: String,
    pub rules: PathBuf,
    pub namespace: Option<String>,
}

impl AnalyzeOptions {
    /// Extract options from parsed arguments
    ///
    /// # Errors
    /// When a required argument is missing.
    pub fn from_matches(args: &ArgMatches) -> Result<Self> {
        Ok(Self {
            input: required::<PathBuf>(args, "input")?.clone(),
            target_version: required::<String>(args, "target-version")?.clone(),
            rules: required::<PathBuf>(args, "rules")?.clone(),
            namespace: args.get_one::<String>("namespace").cloned(),
        })
    }
}

/// Analysis of one document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAnalysis {
    pub resource: ResourceRef,
    pub version: String,
    /// Version hops to the target, `None` when unreachable
    pub path: Option<Vec<String>>,
    /// Whether a single registered rule reaches the target
    pub direct: bool,
}

/// Result of the `analyze` subcommand
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub target_version: String,
    /// Document count per observed version
    pub versions: BTreeMap<String, usize>,
    /// Resources not yet at the target version
    pub needs_migration: Vec<ResourceRef>,
    pub resources: Vec<ResourceAnalysis>,
}

impl AnalysisReport {
    /// Check if every document can reach the target
    #[must_use]
    pub fn all_reachable(&self) -> bool {
        self.resources.iter().all(|a| a.path.is_some())
    }
}

/// Analyze the input documents
///
/// # Errors
/// When inputs cannot be loaded.
pub fn run_analyze(options: &AnalyzeOptions) -> Result<AnalysisReport> {
    let (conversions, paths) = load_rules(&options.rules)?;
    let tracker = SchemaEvolutionTracker::new();
    for (from, to) in paths {
        tracker.register_path(MigrationPath::direct(from, to));
    }

    let documents = select_documents(
        load_documents(&options.input)?,
        options.namespace.as_deref(),
    );
    let target = options.target_version.as_str();
    let mut report = AnalysisReport {
        target_version: target.to_string(),
        versions: BTreeMap::new(),
        needs_migration: Vec::new(),
        resources: Vec::with_capacity(documents.len()),
    };
    for doc in documents {
        let version = doc.version().to_string();
        *report.versions.entry(version.clone()).or_default() += 1;
        if version != target {
            report.needs_migration.push(doc.reference.clone());
        }
        report.resources.push(ResourceAnalysis {
            path: tracker.find_path(&version, target),
            direct: conversions.supports(&version, target),
            resource: doc.reference,
            version,
        });
    }

    let unreachable = report.resources.iter().filter(|a| a.path.is_none()).count();
    tracing::info!(
        resources = report.resources.len(),
        needs_migration = report.needs_migration.len(),
        unreachable,
        "Analysis finished"
    );
    Ok(report)
}

fn write_json(value: &impl Serialize, output: Option<&Path>) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => std::fs::write(path, rendered)
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => println!("{rendered}"),
    }
    Ok(())
}

/// Dispatch a parsed command line
///
/// Returns `false` when some resource could not be migrated or reached.
///
/// # Errors
/// Any error that stopped the run as a whole.
pub async fn run(matches: &ArgMatches) -> Result<bool> {
    match matches.subcommand() {
        Some(("migrate", args)) => {
            let options = MigrateOptions::from_matches(args)?;
            let summary = run_migrate(&options).await?;
            write_json(&summary.documents, options.output.as_deref())?;
            eprintln!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(summary.succeeded())
        }
        Some(("analyze", args)) => {
            let options = AnalyzeOptions::from_matches(args)?;
            let report = run_analyze(&options)?;
            write_json(&report, None)?;
            Ok(report.all_reachable())
        }
        Some((other, _)) => bail!("unknown subcommand {other}"),
        None => bail!("no subcommand given"),
    }
}
