use async_trait::async_trait;
use thiserror::Error;

use crate::domain::condition::SignalRef;
use crate::domain::item::OrgId;

#[derive(Clone, Debug, PartialEq)]
pub enum SignalScore {
    Number(f64),
    Boolean(bool),
}

impl SignalScore {
    pub fn render(&self) -> String {
        match self {
            Self::Number(value) => value.to_string(),
            Self::Boolean(value) => value.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SignalOutput {
    pub score: SignalScore,
    pub matched_value: Option<String>,
}

#[derive(Clone, Copy, Debug)]
pub struct SignalRequest<'a> {
    pub org_id: &'a OrgId,
    pub signal: &'a SignalRef,
    pub value: &'a str,
    pub matching_values: &'a [String],
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("signal `{0}` is not available")]
    Unavailable(String),
    #[error("signal lookup failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait SignalExecutor: Send + Sync {
    async fn run(&self, request: SignalRequest<'_>) -> Result<SignalOutput, SignalError>;
}

/// Signals computed locally from the input text.
///
/// `text_contains` matches any of the condition's matching values, case-insensitively.
/// `text_length` scores the input by its character count.
#[derive(Clone, Debug, Default)]
pub struct TextSignals;

#[async_trait]
impl SignalExecutor for TextSignals {
    async fn run(&self, request: SignalRequest<'_>) -> Result<SignalOutput, SignalError> {
        match request.signal.id.as_str() {
            "text_contains" => {
                let haystack = request.value.to_lowercase();
                let matched = request
                    .matching_values
                    .iter()
                    .find(|candidate| haystack.contains(&candidate.to_lowercase()))
                    .cloned();
                Ok(SignalOutput {
                    score: SignalScore::Boolean(matched.is_some()),
                    matched_value: matched,
                })
            }
            "text_length" => Ok(SignalOutput {
                score: SignalScore::Number(request.value.chars().count() as f64),
                matched_value: None,
            }),
            other => Err(SignalError::Unavailable(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SignalError, SignalExecutor, SignalRequest, SignalScore, TextSignals};
    use crate::domain::condition::SignalRef;
    use crate::domain::item::OrgId;

    #[tokio::test]
    async fn text_contains_reports_first_matching_value() {
        let org = OrgId("org-1".to_owned());
        let signal = SignalRef { id: "text_contains".to_owned(), subcategory: None };
        let matching = vec!["spam".to_owned(), "scam".to_owned()];

        let output = TextSignals
            .run(SignalRequest {
                org_id: &org,
                signal: &signal,
                value: "Obvious SCAM here",
                matching_values: &matching,
            })
            .await
            .expect("text signal should run");

        assert_eq!(output.score, SignalScore::Boolean(true));
        assert_eq!(output.matched_value.as_deref(), Some("scam"));
    }

    #[tokio::test]
    async fn unknown_signal_is_unavailable() {
        let org = OrgId("org-1".to_owned());
        let signal = SignalRef { id: "image_hash".to_owned(), subcategory: None };

        let error = TextSignals
            .run(SignalRequest { org_id: &org, signal: &signal, value: "x", matching_values: &[] })
            .await
            .expect_err("unknown signal should fail");

        assert_eq!(error, SignalError::Unavailable("image_hash".to_owned()));
    }
}
