use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conjunction {
    And,
    Or,
    Xor,
}

impl Conjunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConditionSet {
    pub conjunction: Conjunction,
    pub conditions: Vec<Condition>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Set(ConditionSet),
    Leaf(LeafCondition),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionInput {
    FullItem,
    Field { name: String },
    AllText,
    Author,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignalRef {
    pub id: String,
    #[serde(default)]
    pub subcategory: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Equals,
    NotEqualTo,
    LessThan,
    LessThanOrEquals,
    GreaterThan,
    GreaterThanOrEquals,
    IsUnavailable,
    IsNotProvided,
}

impl Comparator {
    pub fn compare(&self, score: f64, threshold: f64) -> bool {
        match self {
            Self::Equals => score == threshold,
            Self::NotEqualTo => score != threshold,
            Self::LessThan => score < threshold,
            Self::LessThanOrEquals => score <= threshold,
            Self::GreaterThan => score > threshold,
            Self::GreaterThanOrEquals => score >= threshold,
            Self::IsUnavailable | Self::IsNotProvided => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeafCondition {
    pub input: ConditionInput,
    #[serde(default)]
    pub signal: Option<SignalRef>,
    #[serde(default)]
    pub matching_values: Vec<String>,
    #[serde(default)]
    pub comparator: Option<Comparator>,
    #[serde(default)]
    pub threshold: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOutcome {
    Passed,
    Failed,
    Inapplicable,
    Errored,
}

impl ConditionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Inapplicable => "inapplicable",
            Self::Errored => "errored",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeafResult {
    pub outcome: ConditionOutcome,
    pub score: Option<String>,
    pub matched_value: Option<String>,
    pub error: Option<String>,
}

impl LeafResult {
    pub fn outcome(outcome: ConditionOutcome) -> Self {
        Self { outcome, score: None, matched_value: None, error: None }
    }
}

/// Per-node record of an evaluation. A node without an outcome was never evaluated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionTrace {
    Set {
        conjunction: Conjunction,
        outcome: Option<ConditionOutcome>,
        conditions: Vec<ConditionTrace>,
    },
    Leaf {
        condition: LeafCondition,
        result: Option<LeafResult>,
    },
}

impl ConditionTrace {
    pub fn unevaluated(set: &ConditionSet) -> Self {
        Self::Set {
            conjunction: set.conjunction,
            outcome: None,
            conditions: set.conditions.iter().map(Self::unevaluated_condition).collect(),
        }
    }

    pub fn unevaluated_condition(condition: &Condition) -> Self {
        match condition {
            Condition::Set(set) => Self::unevaluated(set),
            Condition::Leaf(leaf) => Self::Leaf { condition: leaf.clone(), result: None },
        }
    }

    pub fn outcome(&self) -> Option<ConditionOutcome> {
        match self {
            Self::Set { outcome, .. } => *outcome,
            Self::Leaf { result, .. } => result.as_ref().map(|result| result.outcome),
        }
    }

    pub fn children(&self) -> &[ConditionTrace] {
        match self {
            Self::Set { conditions, .. } => conditions,
            Self::Leaf { .. } => &[],
        }
    }
}

impl ConditionSet {
    pub fn validate(&self) -> Result<(), String> {
        if self.conditions.is_empty() {
            return Err(format!("{} condition set has no conditions", self.conjunction.as_str()));
        }
        for condition in &self.conditions {
            match condition {
                Condition::Set(set) => set.validate()?,
                Condition::Leaf(leaf) => {
                    let numeric = leaf.comparator.is_some_and(|comparator| {
                        !matches!(comparator, Comparator::IsUnavailable | Comparator::IsNotProvided)
                    });
                    if numeric && leaf.threshold.is_none() {
                        return Err("leaf comparator requires a threshold".to_string());
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Comparator, Condition, ConditionInput, ConditionSet, ConditionTrace, Conjunction};

    #[test]
    fn condition_tree_deserializes_from_tagged_json() {
        let set: ConditionSet = serde_json::from_value(json!({
            "conjunction": "or",
            "conditions": [
                {
                    "type": "leaf",
                    "input": { "type": "field", "name": "title" },
                    "signal": { "id": "toxicity" },
                    "comparator": "greater_than",
                    "threshold": 0.8
                },
                {
                    "type": "set",
                    "conjunction": "and",
                    "conditions": [
                        { "type": "leaf", "input": { "type": "author" }, "comparator": "is_not_provided" }
                    ]
                }
            ]
        }))
        .expect("condition set should deserialize");

        assert_eq!(set.conjunction, Conjunction::Or);
        assert!(matches!(
            &set.conditions[0],
            Condition::Leaf(leaf) if leaf.input == ConditionInput::Field { name: "title".to_owned() }
                && leaf.comparator == Some(Comparator::GreaterThan)
        ));
        assert!(set.validate().is_ok());
    }

    #[test]
    fn validation_rejects_empty_nested_sets_and_missing_thresholds() {
        let empty_nested = ConditionSet {
            conjunction: Conjunction::And,
            conditions: vec![Condition::Set(ConditionSet {
                conjunction: Conjunction::Or,
                conditions: vec![],
            })],
        };
        assert!(empty_nested.validate().is_err());

        let missing_threshold: ConditionSet = serde_json::from_value(json!({
            "conjunction": "and",
            "conditions": [
                { "type": "leaf", "input": { "type": "all_text" }, "signal": { "id": "spam" }, "comparator": "less_than" }
            ]
        }))
        .expect("condition set should deserialize");
        assert!(missing_threshold.validate().is_err());
    }

    #[test]
    fn unevaluated_trace_mirrors_tree_without_outcomes() {
        let set: ConditionSet = serde_json::from_value(json!({
            "conjunction": "xor",
            "conditions": [
                { "type": "leaf", "input": { "type": "full_item" } },
                { "type": "set", "conjunction": "and", "conditions": [
                    { "type": "leaf", "input": { "type": "all_text" } }
                ] }
            ]
        }))
        .expect("condition set should deserialize");

        let trace = ConditionTrace::unevaluated(&set);
        assert_eq!(trace.outcome(), None);
        assert_eq!(trace.children().len(), 2);
        assert!(trace.children().iter().all(|child| child.outcome().is_none()));
    }
}
