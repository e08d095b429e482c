//! Payment provider API client used to look up checkout line items.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{Result, WorkflowError};
use crate::webhook::{LineItem, parse_stripe_line_items};

const STRIPE_API_BASE: &str = "https://api.stripe.com";

/// Trait for reading checkout sessions back from a provider.
#[async_trait]
pub trait CheckoutProvider: Send + Sync {
    /// Line items of a completed checkout session.
    async fn session_line_items(&self, session_id: &str) -> Result<Vec<LineItem>>;
}

/// Stripe REST client.
#[derive(Debug, Clone)]
pub struct StripeClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl StripeClient {
    /// Creates a client whose requests give up after `timeout`.
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| WorkflowError::upstream("stripe", err))?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url: STRIPE_API_BASE.to_string(),
        })
    }

    /// Points the client at another host, e.g. a local mock.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl CheckoutProvider for StripeClient {
    #[tracing::instrument(skip(self))]
    async fn session_line_items(&self, session_id: &str) -> Result<Vec<LineItem>> {
        let url = format!(
            "{}/v1/checkout/sessions/{}/line_items",
            self.base_url, session_id
        );
        let response: serde_json::Value = self
            .http
            .get(url)
            .basic_auth(&self.api_key, None::<&str>)
            .query(&[("expand[]", "data.price.product")])
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| WorkflowError::upstream("stripe", err))?
            .json()
            .await
            .map_err(|err| WorkflowError::upstream("stripe", err))?;

        Ok(parse_stripe_line_items(&response))
    }
}

#[derive(Debug, Default)]
struct InMemoryProviderState {
    sessions: HashMap<String, Vec<LineItem>>,
    fail_on_lookup: bool,
}

/// In-memory checkout provider for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckoutProvider {
    state: Arc<RwLock<InMemoryProviderState>>,
}

impl InMemoryCheckoutProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_session(&self, session_id: impl Into<String>, lines: Vec<LineItem>) {
        self.state
            .write()
            .await
            .sessions
            .insert(session_id.into(), lines);
    }

    pub async fn set_fail_on_lookup(&self, fail: bool) {
        self.state.write().await.fail_on_lookup = fail;
    }
}

#[async_trait]
impl CheckoutProvider for InMemoryCheckoutProvider {
    async fn session_line_items(&self, session_id: &str) -> Result<Vec<LineItem>> {
        let state = self.state.read().await;
        if state.fail_on_lookup {
            return Err(WorkflowError::upstream("checkout provider", "lookup failed"));
        }
        state
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(format!("checkout session {session_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Sku;
    use domain::Money;

    #[tokio::test]
    async fn test_in_memory_lookup() {
        let provider = InMemoryCheckoutProvider::new();
        provider
            .add_session(
                "cs_1",
                vec![LineItem {
                    product_id: None,
                    variant_sku: Some(Sku::new("A")),
                    quantity: 1,
                    amount_total: Money::from_cents(100),
                }],
            )
            .await;

        assert_eq!(provider.session_line_items("cs_1").await.unwrap().len(), 1);
        assert!(matches!(
            provider.session_line_items("cs_2").await,
            Err(WorkflowError::NotFound(_))
        ));

        provider.set_fail_on_lookup(true).await;
        assert!(provider.session_line_items("cs_1").await.is_err());
    }

    #[test]
    fn test_stripe_client_builds() {
        let client = StripeClient::new("sk_test", Duration::from_secs(1))
            .unwrap()
            .with_base_url("http://localhost:12111");
        assert_eq!(client.base_url, "http://localhost:12111");
    }
}
