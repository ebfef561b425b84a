use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use triage_core::domain::item::OrgId;
use triage_core::domain::routing::RoutingRuleId;
use triage_core::routing::rules::RoutingRuleError;
use triage_core::{Classify, ErrorClass, RoutingRuleService};
use triage_db::{connect_with_settings, SqlQueueStore, SqlRoutingRuleStore};

use crate::commands::{load_config, runtime, CommandResult};

const COMMAND: &str = "reorder-routing-rules";

pub fn run(config_path: Option<&Path>, org_id: &str, rule_ids: &[String]) -> CommandResult {
    let config = match load_config(COMMAND, config_path) {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime(COMMAND) {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let org_id = OrgId(org_id.to_string());
    let order: Vec<RoutingRuleId> = rule_ids.iter().cloned().map(RoutingRuleId).collect();

    runtime.block_on(async {
        let pool = match connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        {
            Ok(pool) => pool,
            Err(error) => {
                return CommandResult::failure(COMMAND, "db_connectivity", error.to_string(), 4)
            }
        };

        let service = RoutingRuleService::new(
            Arc::new(SqlRoutingRuleStore::new(pool.clone())),
            Arc::new(SqlQueueStore::new(pool.clone())),
        );
        let result = service.reorder(&org_id, &order).await;
        pool.close().await;

        match result {
            Ok(changes) => CommandResult::success_with_details(
                COMMAND,
                format!("{} rules moved", changes.len()),
                Some(json!({ "org_id": org_id.0, "changes": changes })),
            ),
            Err(error) => failure(&error),
        }
    })
}

fn failure(error: &RoutingRuleError) -> CommandResult {
    let class = error.class();
    let exit_code = match class {
        ErrorClass::Validation | ErrorClass::Data => 6,
        _ => 7,
    };
    CommandResult::failure(COMMAND, class.as_str(), error.to_string(), exit_code)
}
