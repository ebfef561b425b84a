pub mod actions;
pub mod audit;
pub mod cache;
pub mod catalog;
pub mod conditions;
pub mod config;
pub mod decisioning;
pub mod domain;
pub mod errors;
pub mod ingestion;
pub mod investigation;
pub mod memory;
pub mod queue;
pub mod retry;
pub mod routing;
pub mod rule_engine;

#[cfg(test)]
mod testing;

pub use actions::{ActionError, ActionPublisher, PublishError};
pub use conditions::{evaluate, EvaluationContext, SignalExecutor, TextSignals};
pub use config::{AppConfig, ConfigError, LoadOptions};
pub use decisioning::{DecisionDispatcher, DecisionError, JobDecisioning, SubmitDecision};
pub use domain::correlation::{CorrelationId, CorrelationSource};
pub use domain::item::{ItemIdentifier, ItemSubmission, OrgId};
pub use domain::job::{JobId, QueueId};
pub use errors::{Classify, ErrorClass, InterfaceError, StoreError};
pub use ingestion::{
    ColdStorageBatcher, ConsumerRunner, IngestionError, ItemProcessingPipeline, LogConsumer,
    RunnerSettings,
};
pub use routing::{JobRouter, RoutingEngine, RoutingError, RoutingRuleCache, RoutingRuleService};
pub use rule_engine::{RuleEngine, RuleEngineError};
