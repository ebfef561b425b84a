//! Boolean condition trees evaluated against a single item.
//!
//! Passing children count toward a set, failed and errored children count against it,
//! and inapplicable children are neutral. A set whose evaluated children are all neutral
//! is itself inapplicable. AND stops at the first child counted against it, OR stops at
//! the first pass, XOR always evaluates every child. Children after a short-circuit are
//! kept in the trace without an outcome.

pub mod signal;

use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tracing::warn;

use crate::domain::condition::{
    Comparator, Condition, ConditionInput, ConditionOutcome, ConditionSet, ConditionTrace,
    Conjunction, LeafCondition, LeafResult, SignalRef,
};
use crate::domain::item::{ItemSubmission, OrgId};

pub use signal::{
    SignalError, SignalExecutor, SignalOutput, SignalRequest, SignalScore, TextSignals,
};

type SignalKey = (SignalRef, String);

/// Everything a condition may read while evaluating one item.
///
/// Signal results are memoised for the lifetime of the context so that several rules
/// consulting the same signal on the same input trigger one lookup.
pub struct EvaluationContext<'a> {
    pub org_id: &'a OrgId,
    pub item: &'a ItemSubmission,
    signals: &'a dyn SignalExecutor,
    memo: Mutex<HashMap<SignalKey, Result<SignalOutput, SignalError>>>,
}

impl<'a> EvaluationContext<'a> {
    pub fn new(item: &'a ItemSubmission, signals: &'a dyn SignalExecutor) -> Self {
        Self { org_id: &item.org_id, item, signals, memo: Mutex::new(HashMap::new()) }
    }

    async fn run_signal(
        &self,
        signal: &SignalRef,
        value: &str,
        matching_values: &[String],
    ) -> Result<SignalOutput, SignalError> {
        let key = (signal.clone(), value.to_string());
        if let Some(cached) = self.cached(&key) {
            return cached;
        }

        let result = self
            .signals
            .run(SignalRequest { org_id: self.org_id, signal, value, matching_values })
            .await;

        match self.memo.lock() {
            Ok(mut memo) => memo.insert(key, result.clone()),
            Err(poisoned) => poisoned.into_inner().insert(key, result.clone()),
        };
        result
    }

    fn cached(&self, key: &SignalKey) -> Option<Result<SignalOutput, SignalError>> {
        match self.memo.lock() {
            Ok(memo) => memo.get(key).cloned(),
            Err(poisoned) => poisoned.into_inner().get(key).cloned(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Evaluation {
    pub passed: bool,
    pub outcome: ConditionOutcome,
    pub trace: ConditionTrace,
}

pub async fn evaluate(set: &ConditionSet, context: &EvaluationContext<'_>) -> Evaluation {
    let trace = evaluate_set(set, context).await;
    let outcome = trace.outcome().unwrap_or(ConditionOutcome::Inapplicable);
    Evaluation { passed: outcome == ConditionOutcome::Passed, outcome, trace }
}

fn evaluate_set<'a>(
    set: &'a ConditionSet,
    context: &'a EvaluationContext<'_>,
) -> BoxFuture<'a, ConditionTrace> {
    async move {
        let mut children = Vec::with_capacity(set.conditions.len());
        let mut passed = 0_usize;
        let mut failed = 0_usize;
        let mut decided = None;

        for condition in &set.conditions {
            if decided.is_some() {
                children.push(ConditionTrace::unevaluated_condition(condition));
                continue;
            }

            let child = match condition {
                Condition::Set(nested) => evaluate_set(nested, context).await,
                Condition::Leaf(leaf) => ConditionTrace::Leaf {
                    condition: leaf.clone(),
                    result: Some(evaluate_leaf(leaf, context).await),
                },
            };

            match child.outcome() {
                Some(ConditionOutcome::Passed) => passed += 1,
                Some(ConditionOutcome::Failed | ConditionOutcome::Errored) => failed += 1,
                Some(ConditionOutcome::Inapplicable) | None => {}
            }
            children.push(child);

            decided = match set.conjunction {
                Conjunction::And if failed > 0 => Some(ConditionOutcome::Failed),
                Conjunction::Or if passed > 0 => Some(ConditionOutcome::Passed),
                _ => None,
            };
        }

        let outcome = decided.unwrap_or_else(|| aggregate(set.conjunction, passed, failed));
        ConditionTrace::Set {
            conjunction: set.conjunction,
            outcome: Some(outcome),
            conditions: children,
        }
    }
    .boxed()
}

fn aggregate(conjunction: Conjunction, passed: usize, failed: usize) -> ConditionOutcome {
    if passed == 0 && failed == 0 {
        return ConditionOutcome::Inapplicable;
    }
    let holds = match conjunction {
        Conjunction::And => failed == 0,
        Conjunction::Or => passed > 0,
        Conjunction::Xor => passed == 1,
    };
    if holds {
        ConditionOutcome::Passed
    } else {
        ConditionOutcome::Failed
    }
}

async fn evaluate_leaf(leaf: &LeafCondition, context: &EvaluationContext<'_>) -> LeafResult {
    let values = resolve_input(&leaf.input, context.item);

    if leaf.comparator == Some(Comparator::IsNotProvided) {
        let outcome =
            if values.is_empty() { ConditionOutcome::Passed } else { ConditionOutcome::Failed };
        return LeafResult::outcome(outcome);
    }

    let Some(signal) = &leaf.signal else {
        return LeafResult::outcome(ConditionOutcome::Inapplicable);
    };
    if values.is_empty() {
        return LeafResult::outcome(ConditionOutcome::Inapplicable);
    }

    let expects_unavailable = leaf.comparator == Some(Comparator::IsUnavailable);
    let mut last_score = None;
    let mut last_error = None;

    for value in &values {
        match context.run_signal(signal, value, &leaf.matching_values).await {
            Ok(output) => {
                if expects_unavailable {
                    continue;
                }
                match leaf_passes(leaf, &output.score) {
                    Ok(true) => {
                        return LeafResult {
                            outcome: ConditionOutcome::Passed,
                            score: Some(output.score.render()),
                            matched_value: output.matched_value,
                            error: None,
                        };
                    }
                    Ok(false) => last_score = Some(output.score.render()),
                    Err(message) => last_error = Some(message),
                }
            }
            Err(error) => {
                if expects_unavailable {
                    return LeafResult::outcome(ConditionOutcome::Passed);
                }
                warn!(
                    event_name = "conditions.signal.errored",
                    org_id = %context.org_id.0,
                    item_id = %context.item.item.id,
                    signal_id = %signal.id,
                    error = %error,
                    "signal lookup failed; leaf recorded as errored"
                );
                last_error = Some(error.to_string());
            }
        }
    }

    match last_error {
        Some(error) => LeafResult {
            outcome: ConditionOutcome::Errored,
            score: last_score,
            matched_value: None,
            error: Some(error),
        },
        None => LeafResult {
            outcome: ConditionOutcome::Failed,
            score: last_score,
            matched_value: None,
            error: None,
        },
    }
}

fn leaf_passes(leaf: &LeafCondition, score: &SignalScore) -> Result<bool, String> {
    match (score, leaf.comparator, leaf.threshold) {
        (SignalScore::Boolean(value), Some(comparator), Some(threshold)) => {
            Ok(comparator.compare(if *value { 1.0 } else { 0.0 }, threshold))
        }
        (SignalScore::Boolean(value), _, _) => Ok(*value),
        (SignalScore::Number(value), Some(comparator), Some(threshold)) => {
            Ok(comparator.compare(*value, threshold))
        }
        (SignalScore::Number(_), _, _) => {
            Err("numeric signal requires a comparator and threshold".to_string())
        }
    }
}

fn resolve_input(input: &ConditionInput, item: &ItemSubmission) -> Vec<String> {
    match input {
        ConditionInput::FullItem => {
            serde_json::to_string(&item.data).map(|json| vec![json]).unwrap_or_default()
        }
        ConditionInput::Field { name } => item.field(name).map(scalar_values).unwrap_or_default(),
        ConditionInput::AllText => item.text_values(),
        ConditionInput::Author => {
            item.creator.as_ref().map(|creator| vec![creator.id.clone()]).unwrap_or_default()
        }
    }
}

fn scalar_values(value: &Value) -> Vec<String> {
    match value {
        Value::Null => Vec::new(),
        Value::String(text) if text.is_empty() => Vec::new(),
        Value::String(text) => vec![text.clone()],
        Value::Bool(_) | Value::Number(_) => vec![value.to_string()],
        Value::Array(entries) => entries.iter().flat_map(scalar_values).collect(),
        Value::Object(_) => vec![value.to_string()],
    }
}
