//! Signed webhook delivery for custom actions.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Map, Value};
use sha2::Sha256;
use thiserror::Error;
use tracing::warn;

use crate::actions::ActionError;
use crate::domain::action::{ActionId, MatchingRule, Policy};
use crate::domain::item::{ItemIdentifier, OrgId};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Debug, PartialEq)]
pub struct WebhookRequest {
    pub org_id: OrgId,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait WebhookTransport: Send + Sync {
    /// 2xx and 3xx succeed, 4xx is `ActionError::Rejected`, anything else is retryable.
    async fn post(&self, request: WebhookRequest) -> Result<(), ActionError>;
}

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("no signing key is configured")]
    MissingKey,
    #[error("signing key rejected: {0}")]
    InvalidKey(String),
}

#[async_trait]
pub trait RequestSigner: Send + Sync {
    async fn sign(&self, org_id: &OrgId, body: &[u8]) -> Result<String, SigningError>;
}

/// Signs with a per-org key derived from a master secret.
pub struct HmacRequestSigner {
    master_key: SecretString,
}

impl HmacRequestSigner {
    pub fn new(master_key: SecretString) -> Self {
        Self { master_key }
    }

    fn org_key(&self, org_id: &OrgId) -> Result<Vec<u8>, SigningError> {
        let master = self.master_key.expose_secret();
        if master.is_empty() {
            return Err(SigningError::MissingKey);
        }
        let mut mac = HmacSha256::new_from_slice(master.as_bytes())
            .map_err(|error| SigningError::InvalidKey(error.to_string()))?;
        mac.update(org_id.0.as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

#[async_trait]
impl RequestSigner for HmacRequestSigner {
    async fn sign(&self, org_id: &OrgId, body: &[u8]) -> Result<String, SigningError> {
        let key = self.org_key(org_id)?;
        let mut mac = HmacSha256::new_from_slice(&key)
            .map_err(|error| SigningError::InvalidKey(error.to_string()))?;
        mac.update(body);
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }
}

pub struct ReqwestWebhookTransport {
    client: Client,
    signer: Arc<dyn RequestSigner>,
    signature_header: String,
}

impl ReqwestWebhookTransport {
    pub fn new(
        signer: Arc<dyn RequestSigner>,
        signature_header: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, signer, signature_header: signature_header.into() })
    }

    fn headers(&self, request: &WebhookRequest, signature: Option<String>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(
                    event_name = "actions.webhook.header_skipped",
                    org_id = %request.org_id.0,
                    header = %name,
                    "skipping invalid custom webhook header"
                ),
            }
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(signature) = signature {
            match (
                HeaderName::from_bytes(self.signature_header.as_bytes()),
                HeaderValue::from_str(&signature),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(
                    event_name = "actions.webhook.signature_header_invalid",
                    header = %self.signature_header,
                    "signature header could not be attached"
                ),
            }
        }
        headers
    }
}

#[async_trait]
impl WebhookTransport for ReqwestWebhookTransport {
    async fn post(&self, request: WebhookRequest) -> Result<(), ActionError> {
        let signature = match self.signer.sign(&request.org_id, &request.body).await {
            Ok(signature) => Some(signature),
            Err(error) => {
                warn!(
                    event_name = "actions.webhook.signing_failed",
                    org_id = %request.org_id.0,
                    error = %error,
                    "sending webhook unsigned"
                );
                None
            }
        };

        let response = self
            .client
            .post(&request.url)
            .headers(self.headers(&request, signature))
            .body(request.body)
            .send()
            .await
            .map_err(|error| ActionError::Transport(error.to_string()))?;

        let status = response.status();
        if status.is_success() || status.is_redirection() {
            Ok(())
        } else if status.is_client_error() {
            Err(ActionError::Rejected { status: status.as_u16() })
        } else {
            Err(ActionError::Transport(format!("webhook responded with {status}")))
        }
    }
}

/// JSON body sent to a custom action's callback.
pub fn webhook_body(
    target: &ItemIdentifier,
    action_id: &ActionId,
    policies: &[Policy],
    rules: &[MatchingRule],
    custom: &Map<String, Value>,
    actor_email: Option<&str>,
) -> Value {
    json!({
        "item": { "id": target.id, "typeId": target.type_id.0 },
        "policies": policies
            .iter()
            .map(|policy| json!({ "id": policy.id.0, "name": policy.name, "penalty": policy.penalty }))
            .collect::<Vec<_>>(),
        "rules": rules
            .iter()
            .map(|rule| json!({ "id": rule.id.0, "name": rule.name }))
            .collect::<Vec<_>>(),
        "action": { "id": action_id.0 },
        "custom": custom,
        "actorEmail": actor_email,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use mockito::Matcher;
    use secrecy::SecretString;
    use serde_json::{json, Map};

    use super::{
        webhook_body, HmacRequestSigner, ReqwestWebhookTransport, RequestSigner, WebhookRequest,
        WebhookTransport,
    };
    use crate::actions::ActionError;
    use crate::domain::action::{ActionId, Policy, PolicyId};
    use crate::domain::item::{ItemIdentifier, OrgId};

    fn signer(key: &str) -> Arc<HmacRequestSigner> {
        Arc::new(HmacRequestSigner::new(SecretString::from(key.to_owned())))
    }

    fn request(url: String) -> WebhookRequest {
        let mut headers = BTreeMap::new();
        headers.insert("x-tenant".to_owned(), "acme".to_owned());
        headers.insert("content-type".to_owned(), "text/plain".to_owned());
        WebhookRequest {
            org_id: OrgId("org-1".to_owned()),
            url,
            headers,
            body: br#"{"action":{"id":"a-1"}}"#.to_vec(),
        }
    }

    #[tokio::test]
    async fn signatures_are_per_org_and_base64() {
        let signer = signer("master");
        let body = b"payload";

        let first = signer.sign(&OrgId("org-1".to_owned()), body).await.expect("sign");
        let second = signer.sign(&OrgId("org-2".to_owned()), body).await.expect("sign");

        assert_ne!(first, second);
        assert_eq!(STANDARD.decode(&first).expect("base64").len(), 32);
    }

    #[tokio::test]
    async fn signed_post_forces_json_content_type() {
        let mut server = mockito::Server::new_async().await;
        let signer = signer("master");
        let expected = signer
            .sign(&OrgId("org-1".to_owned()), br#"{"action":{"id":"a-1"}}"#)
            .await
            .expect("sign");
        let mock = server
            .mock("POST", "/hook")
            .match_header("content-type", "application/json")
            .match_header("x-tenant", "acme")
            .match_header("x-triage-signature", expected.as_str())
            .match_body(Matcher::Exact(r#"{"action":{"id":"a-1"}}"#.to_owned()))
            .with_status(202)
            .create_async()
            .await;

        let transport =
            ReqwestWebhookTransport::new(signer, "x-triage-signature", Duration::from_secs(5))
                .expect("client");
        transport.post(request(format!("{}/hook", server.url()))).await.expect("delivered");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn client_errors_are_permanent_and_server_errors_retryable() {
        let mut server = mockito::Server::new_async().await;
        let _missing = server.mock("POST", "/missing").with_status(404).create_async().await;
        let _broken = server.mock("POST", "/broken").with_status(503).create_async().await;
        let transport =
            ReqwestWebhookTransport::new(signer("master"), "x-sig", Duration::from_secs(5))
                .expect("client");

        let rejected = transport
            .post(request(format!("{}/missing", server.url())))
            .await
            .expect_err("404");
        assert!(matches!(rejected, ActionError::Rejected { status: 404 }));
        assert!(!rejected.is_retryable());

        let unavailable = transport
            .post(request(format!("{}/broken", server.url())))
            .await
            .expect_err("503");
        assert!(unavailable.is_retryable());
    }

    #[tokio::test]
    async fn missing_master_key_sends_unsigned() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_header("x-sig", Matcher::Missing)
            .with_status(200)
            .create_async()
            .await;
        let transport = ReqwestWebhookTransport::new(signer(""), "x-sig", Duration::from_secs(5))
            .expect("client");

        transport.post(request(format!("{}/hook", server.url()))).await.expect("delivered");
        mock.assert_async().await;
    }

    #[test]
    fn body_carries_item_policies_and_actor() {
        let policy = Policy {
            id: PolicyId("p-1".to_owned()),
            org_id: OrgId("org-1".to_owned()),
            name: "Spam".to_owned(),
            penalty: "low".to_owned(),
            user_strike_count: 1,
        };
        let mut custom = Map::new();
        custom.insert("label".to_owned(), json!("remove"));

        let body = webhook_body(
            &ItemIdentifier::new("item-1", "post"),
            &ActionId("a-1".to_owned()),
            &[policy],
            &[],
            &custom,
            Some("mod@example.com"),
        );

        assert_eq!(body["item"], json!({ "id": "item-1", "typeId": "post" }));
        assert_eq!(body["policies"][0]["penalty"], "low");
        assert_eq!(body["custom"]["label"], "remove");
        assert_eq!(body["actorEmail"], "mod@example.com");
        assert_eq!(body["rules"], json!([]));
    }
}
