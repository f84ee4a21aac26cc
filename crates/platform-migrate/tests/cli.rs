use platform_migrate::{
    build_cli, load_rules, run_analyze, run_migrate, AnalyzeOptions, MigrateOptions,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

const RULES: &str = r#"
[[rules]]
from = "v1alpha1"
to = "v1beta1"

[rules.rename]
"/spec/monitoring" = "/spec/metrics"

[rules.defaults]
"/spec/alerting/enabled" = true

[[rules]]
from = "v1beta1"
to = "v1"
remove = ["/spec/legacy"]
"#;

fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

fn documents() -> serde_json::Value {
    json!([
        {
            "reference": {"namespace": "monitoring", "name": "alpha"},
            "apiVersion": "v1alpha1",
            "content": {"spec": {"monitoring": {"retention": "7d"}}}
        },
        {
            "reference": {"namespace": "monitoring", "name": "beta"},
            "apiVersion": "v1beta1",
            "content": {"spec": {"metrics": {"retention": "30d"}}}
        },
        {
            "reference": {"namespace": "other", "name": "gamma"},
            "apiVersion": "v1alpha1",
            "content": {"spec": {}}
        }
    ])
}

struct Fixture {
    _dir: TempDir,
    input: PathBuf,
    rules: PathBuf,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let input = write(dir.path(), "documents.json", &documents().to_string());
    let rules = write(dir.path(), "rules.toml", RULES);
    Fixture {
        _dir: dir,
        input,
        rules,
    }
}

fn migrate_options(fx: &Fixture, namespace: Option<&str>) -> MigrateOptions {
    MigrateOptions {
        input: fx.input.clone(),
        output: None,
        target_version: "v1beta1".into(),
        rules: fx.rules.clone(),
        config: None,
        namespace: namespace.map(str::to_string),
        dry_run: false,
        batch: false,
        timeout: Duration::from_secs(10),
    }
}

#[test]
fn cli_parses_migrate_arguments() {
    let matches = build_cli()
        .try_get_matches_from([
            "platform-migrate",
            "migrate",
            "--input",
            "docs.json",
            "--target-version",
            "v1beta1",
            "--rules",
            "rules.toml",
            "--batch",
            "--dry-run",
        ])
        .unwrap();
    let (_, args) = matches.subcommand().unwrap();
    let options = MigrateOptions::from_matches(args).unwrap();

    assert_eq!(options.target_version, "v1beta1");
    assert!(options.batch);
    assert!(options.dry_run);
    assert_eq!(options.timeout, Duration::from_secs(300));
}

#[test]
fn cli_requires_target_version() {
    let result = build_cli().try_get_matches_from([
        "platform-migrate",
        "migrate",
        "--input",
        "docs.json",
        "--rules",
        "rules.toml",
    ]);
    assert!(result.is_err());
}

#[test]
fn empty_rules_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let rules = write(dir.path(), "rules.toml", "");
    assert!(load_rules(&rules).is_err());
}

#[tokio::test]
async fn migrate_applies_rules_and_skips_current_documents() {
    let fx = fixture();
    let summary = run_migrate(&migrate_options(&fx, Some("monitoring")))
        .await
        .unwrap();

    assert_eq!(summary.total, 2);
    assert_eq!(summary.migrated, 1);
    assert_eq!(summary.skipped, 1);
    assert!(summary.succeeded());

    let alpha = &summary.documents[0];
    assert_eq!(alpha.reference.name, "alpha");
    assert_eq!(alpha.version(), "v1beta1");
    assert_eq!(alpha.pointer("/spec/metrics/retention"), Some(&json!("7d")));
    assert_eq!(alpha.pointer("/spec/alerting/enabled"), Some(&json!(true)));
    assert!(alpha.pointer("/spec/monitoring").is_none());
}

#[tokio::test]
async fn batch_dry_run_leaves_documents_untouched() {
    let fx = fixture();
    let options = MigrateOptions {
        dry_run: true,
        batch: true,
        ..migrate_options(&fx, None)
    };

    let summary = run_migrate(&options).await.unwrap();

    assert!(summary.dry_run);
    assert_eq!(summary.migrated, 2);
    assert_eq!(summary.skipped, 1);
    assert!(summary
        .documents
        .iter()
        .filter(|d| d.reference.name != "beta")
        .all(|d| d.version() == "v1alpha1"));
}

#[tokio::test]
async fn unreachable_target_counts_failures() {
    let fx = fixture();
    let options = MigrateOptions {
        target_version: "v2".into(),
        ..migrate_options(&fx, None)
    };

    let summary = run_migrate(&options).await.unwrap();

    assert_eq!(summary.failed, 3);
    assert!(!summary.succeeded());
    assert_eq!(summary.reports.len(), 3);
    assert_eq!(summary.analytics.failed_migrations, 3);
}

#[test]
fn analyze_reports_multi_hop_paths() {
    let fx = fixture();
    let report = run_analyze(&AnalyzeOptions {
        input: fx.input.clone(),
        target_version: "v1".into(),
        rules: fx.rules.clone(),
        namespace: None,
    })
    .unwrap();

    assert_eq!(report.resources.len(), 3);
    assert_eq!(report.versions.get("v1alpha1"), Some(&2));
    assert_eq!(report.versions.get("v1beta1"), Some(&1));
    assert_eq!(report.needs_migration.len(), 3);
    assert!(report.all_reachable());

    let alpha = &report.resources[0];
    assert_eq!(
        alpha.path.as_deref(),
        Some(&["v1alpha1".to_string(), "v1beta1".to_string(), "v1".to_string()][..])
    );
    assert!(!alpha.direct);
    assert!(report.resources[1].direct);
}

#[test]
fn analyze_flags_unreachable_versions() {
    let fx = fixture();
    let report = run_analyze(&AnalyzeOptions {
        input: fx.input.clone(),
        target_version: "v1alpha1".into(),
        rules: fx.rules.clone(),
        namespace: Some("monitoring".into()),
    })
    .unwrap();

    assert_eq!(report.needs_migration, vec![report.resources[1].resource.clone()]);
    assert!(!report.all_reachable());
}
