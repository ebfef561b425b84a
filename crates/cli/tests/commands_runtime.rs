use std::env;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use serde_json::Value;
use triage_cli::commands::{config, migrate, reorder};
use triage_core::config::AppConfig;
use triage_core::domain::condition::{
    Condition, ConditionInput, ConditionSet, Conjunction, LeafCondition, SignalRef,
};
use triage_core::domain::item::{ItemTypeId, OrgId};
use triage_core::domain::job::QueueId;
use triage_core::domain::routing::RoutingRuleId;
use triage_core::routing::rules::{CreateRoutingRule, RoutingRuleStore};
use triage_core::RoutingRuleService;
use triage_db::{connect_with_settings, migrations, SqlQueueStore, SqlRoutingRuleStore};

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(&[("TRIAGE_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run(None);
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn migrate_returns_config_failure_for_non_sqlite_url() {
    with_env(&[("TRIAGE_DATABASE_URL", "postgres://localhost/triage")], || {
        let result = migrate::run(None);
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn migrate_requires_an_explicitly_named_config_file() {
    with_env(&[], || {
        let result = migrate::run(Some(Path::new("does/not/exist.toml")));
        assert_eq!(result.exit_code, 2);
        assert_eq!(parse_payload(&result.output)["error_class"], "config_validation");
    });
}

#[test]
fn config_reports_sources_and_redacts_the_signing_key() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("triage.toml");
    std::fs::write(&path, "[ingestion]\nitem_topic = \"items-from-file\"\n").expect("write config");

    with_env(
        &[
            ("TRIAGE_DATABASE_URL", "sqlite::memory:"),
            ("TRIAGE_LOG_LEVEL", "debug"),
            ("TRIAGE_SIGNING_MASTER_KEY", "super-secret"),
        ],
        || {
            let result = config::run(Some(path.as_path()));
            assert_eq!(result.exit_code, 0);

            let output = &result.output;
            assert!(output.contains(
                "- database.url = sqlite::memory: (source: env (TRIAGE_DATABASE_URL))"
            ));
            assert!(output.contains("- logging.level = debug (source: env (TRIAGE_LOG_LEVEL))"));
            assert!(output.contains(&format!(
                "- ingestion.item_topic = items-from-file (source: file ({}))",
                path.display()
            )));
            assert!(output.contains("(source: default)"));
            assert!(!output.contains("super-secret"));

            let payload = parse_payload(last_line(output));
            assert_eq!(payload["command"], "config");
            assert_eq!(payload["status"], "ok");
        },
    );
}

#[test]
fn reorder_moves_listed_rules_to_the_front() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("triage.db").display());

    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().expect("runtime");
    let ids = runtime.block_on(seed_rules(&url, &["first", "second", "third"]));

    with_env(&[("TRIAGE_DATABASE_URL", url.as_str())], || {
        let result = reorder::run(None, "org-1", &[ids[2].0.clone(), ids[0].0.clone()]);
        assert_eq!(result.exit_code, 0, "unexpected output: {}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "reorder-routing-rules");
        assert_eq!(payload["details"]["changes"].as_array().map(Vec::len), Some(3));
    });

    let order = runtime.block_on(async {
        let pool = connect_with_settings(&url, 1, 5).await.expect("connect");
        let rules = SqlRoutingRuleStore::new(pool.clone())
            .list_current_rules(&org())
            .await
            .expect("list");
        pool.close().await;
        rules.into_iter().map(|rule| rule.id).collect::<Vec<_>>()
    });
    assert_eq!(order, vec![ids[2].clone(), ids[0].clone(), ids[1].clone()]);
}

#[test]
fn reorder_rejects_unknown_rules_as_validation_failures() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("triage.db").display());

    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().expect("runtime");
    runtime.block_on(seed_rules(&url, &["only"]));

    with_env(&[("TRIAGE_DATABASE_URL", url.as_str())], || {
        let result = reorder::run(None, "org-1", &["missing".to_string()]);
        assert_eq!(result.exit_code, 6);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "validation");
    });
}

fn org() -> OrgId {
    OrgId("org-1".to_string())
}

async fn seed_rules(url: &str, names: &[&str]) -> Vec<RoutingRuleId> {
    let pool = connect_with_settings(url, 1, 5).await.expect("connect");
    migrations::run_pending(&pool).await.expect("migrations");

    let queues = Arc::new(SqlQueueStore::new(pool.clone()));
    let queue = QueueId("review".to_string());
    queues.save_queue(&org(), &queue, "Review", true).await.expect("queue");
    let service = RoutingRuleService::new(Arc::new(SqlRoutingRuleStore::new(pool.clone())), queues);

    let mut ids = Vec::new();
    for name in names {
        let rule = service
            .create(CreateRoutingRule {
                org_id: org(),
                name: (*name).to_string(),
                description: None,
                condition_set: ConditionSet {
                    conjunction: Conjunction::And,
                    conditions: vec![Condition::Leaf(LeafCondition {
                        input: ConditionInput::AllText,
                        signal: Some(SignalRef { id: "text_contains".to_string(), subcategory: None }),
                        matching_values: vec!["spam".to_string()],
                        comparator: None,
                        threshold: None,
                    })],
                },
                destination_queue_id: queue.clone(),
                item_type_ids: vec![ItemTypeId("post".to_string())],
                creator_id: "mod-1".to_string(),
                is_appeals_rule: false,
                sequence_number: None,
            })
            .await
            .expect("create rule");
        ids.push(rule.id);
    }
    pool.close().await;
    ids
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be JSON")
}

fn last_line(output: &str) -> &str {
    output.lines().last().expect("output should not be empty")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let mut keys: Vec<String> =
        AppConfig::default().entries().into_iter().map(|entry| entry.env_key).collect();
    keys.push("TRIAGE_LOG_LEVEL".to_string());
    keys.push("TRIAGE_LOG_FORMAT".to_string());

    let previous_values: Vec<(String, Option<String>)> =
        keys.iter().map(|key| (key.clone(), env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(&key, value);
        } else {
            env::remove_var(&key);
        }
    }
}
