//! REST marketplace driver
//!
//! JSON over HTTPS with a bearer token:
//!
//! | Operation | Request |
//! |---|---|
//! | search  | `GET /offers?gpu_class=..&region=..&max_price=..&min_reliability=..` |
//! | create  | `POST /instances` `{offer_id, label}` |
//! | poll    | `GET /instances/{id}` (404 means gone) |
//! | destroy | `DELETE /instances/{id}` (404 tolerated) |
//! | exec    | `POST /instances/{id}/exec` `{command}` |
//! | pause   | `POST /instances/{id}/pause` |
//! | resume  | `POST /instances/{id}/resume` |

use crate::config::MarketplaceConfig;
use crate::error::Result;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tether_core::{
    ExecOutput, MarketplaceDriver, Offer, Provisioned, RemoteState, ResourceSpec, StatusSnapshot,
    TetherError,
};
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
struct CreateBody<'a> {
    offer_id: &'a str,
    label: &'a str,
}

#[derive(Debug, Serialize)]
struct ExecBody<'a> {
    command: &'a str,
}

#[derive(Debug, Deserialize)]
struct OffersResponse {
    offers: Vec<Offer>,
}

/// Marketplace reached over its REST API
#[derive(Clone)]
pub struct RestMarketplaceDriver {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl RestMarketplaceDriver {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, config: &MarketplaceConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Build from config, reading the token from `config.api_key_env`
    pub fn from_config(config: &MarketplaceConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).ok();
        if api_key.is_none() {
            warn!(env = %config.api_key_env, "No marketplace API key set, sending unauthenticated requests");
        }
        Self::new(config.base_url.clone(), api_key, config)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> tether_core::traits::Result<reqwest::Response> {
        self.authorize(request).send().await.map_err(transport_err)
    }

    async fn json<T: DeserializeOwned>(&self, response: reqwest::Response) -> tether_core::traits::Result<T> {
        let status = response.status();
        let text = response.text().await.map_err(transport_err)?;
        if !status.is_success() {
            return Err(status_err(status, text));
        }
        serde_json::from_str(&text).map_err(|e| {
            warn!(error = %e, body = %text, "Failed to parse marketplace response");
            TetherError::Provider(format!("unexpected response: {}", e))
        })
    }

    async fn expect_success(&self, response: reqwest::Response) -> tether_core::traits::Result<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(status_err(status, text))
    }
}

/// Query parameters for `GET /offers`
fn offer_query(spec: &ResourceSpec) -> Vec<(&'static str, String)> {
    let mut query = vec![("gpu_class", spec.gpu_class.clone())];
    if let Some(region) = &spec.region {
        query.push(("region", region.clone()));
    }
    if let Some(max) = spec.max_price_per_hour {
        query.push(("max_price", max.to_string()));
    }
    if let Some(min) = spec.min_reliability {
        query.push(("min_reliability", min.to_string()));
    }
    query
}

fn transport_err(e: reqwest::Error) -> TetherError {
    if e.is_timeout() {
        TetherError::Timeout(e.to_string())
    } else {
        TetherError::Network(e.to_string())
    }
}

fn status_err(status: StatusCode, body: String) -> TetherError {
    match status {
        StatusCode::NOT_FOUND => TetherError::NotFound(body),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => TetherError::Timeout(body),
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            TetherError::Network(format!("{}: {}", s, body))
        }
        s => TetherError::Provider(format!("{}: {}", s, body)),
    }
}

#[async_trait]
impl MarketplaceDriver for RestMarketplaceDriver {
    async fn search(&self, spec: &ResourceSpec) -> tether_core::traits::Result<Vec<Offer>> {
        let request = self.client.get(self.url("/offers")).query(&offer_query(spec));
        let response = self.send(request).await?;
        let offers: OffersResponse = self.json(response).await?;
        debug!(gpu_class = %spec.gpu_class, offers = offers.offers.len(), "Offers found");
        Ok(offers.offers)
    }

    async fn create(&self, offer: &Offer, label: &str) -> tether_core::traits::Result<Provisioned> {
        let body = CreateBody {
            offer_id: &offer.id,
            label,
        };
        let response = self.send(self.client.post(self.url("/instances")).json(&body)).await?;
        let provisioned: Provisioned = self.json(response).await?;
        debug!(offer_id = %offer.id, remote_id = %provisioned.remote_id, "Instance created");
        Ok(provisioned)
    }

    async fn poll(&self, remote_id: &str) -> tether_core::traits::Result<StatusSnapshot> {
        let response = self
            .send(self.client.get(self.url(&format!("/instances/{}", remote_id))))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(StatusSnapshot::new(RemoteState::Gone));
        }
        self.json(response).await
    }

    async fn destroy(&self, remote_id: &str) -> tether_core::traits::Result<()> {
        let response = self
            .send(self.client.delete(self.url(&format!("/instances/{}", remote_id))))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(remote_id, "Instance already gone");
            return Ok(());
        }
        self.expect_success(response).await
    }

    async fn exec(&self, remote_id: &str, command: &str) -> tether_core::traits::Result<ExecOutput> {
        let request = self
            .client
            .post(self.url(&format!("/instances/{}/exec", remote_id)))
            .json(&ExecBody { command });
        let response = self.send(request).await?;
        self.json(response).await
    }

    async fn pause(&self, remote_id: &str) -> tether_core::traits::Result<()> {
        let response = self
            .send(self.client.post(self.url(&format!("/instances/{}/pause", remote_id))))
            .await?;
        self.expect_success(response).await
    }

    async fn resume(&self, remote_id: &str) -> tether_core::traits::Result<()> {
        let response = self
            .send(self.client.post(self.url(&format!("/instances/{}/resume", remote_id))))
            .await?;
        self.expect_success(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_query_includes_only_set_filters() {
        let query = offer_query(&ResourceSpec::new("RTX_4090"));
        assert_eq!(query, vec![("gpu_class", "RTX_4090".to_string())]);

        let spec = ResourceSpec::new("A100")
            .with_region("us-east")
            .with_max_price(1.5)
            .with_min_reliability(0.9);
        let query = offer_query(&spec);
        assert_eq!(query.len(), 4);
        assert!(query.contains(&("max_price", "1.5".to_string())));
        assert!(query.contains(&("min_reliability", "0.9".to_string())));
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            status_err(StatusCode::NOT_FOUND, String::new()),
            TetherError::NotFound(_)
        ));
        assert!(status_err(StatusCode::SERVICE_UNAVAILABLE, String::new()).is_transient());
        assert!(status_err(StatusCode::TOO_MANY_REQUESTS, String::new()).is_transient());
        assert!(!status_err(StatusCode::PAYMENT_REQUIRED, "balance".to_string()).is_transient());
    }

    #[test]
    fn test_payloads() {
        let offers: OffersResponse = serde_json::from_str(
            r#"{"offers":[{"id":"o-9","gpu_class":"RTX_4090","region":"eu-west","price_per_hour":0.42,"reliability_score":0.97}]}"#,
        )
        .unwrap();
        assert_eq!(offers.offers[0].id, "o-9");

        let status: StatusSnapshot =
            serde_json::from_str(r#"{"state":"running","endpoint":"10.1.2.3:22"}"#).unwrap();
        assert_eq!(status.state, RemoteState::Running);
        assert_eq!(status.endpoint.as_deref(), Some("10.1.2.3:22"));

        let body = serde_json::to_string(&CreateBody {
            offer_id: "o-9",
            label: "tether-w-1",
        })
        .unwrap();
        assert_eq!(body, r#"{"offer_id":"o-9","label":"tether-w-1"}"#);
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let driver =
            RestMarketplaceDriver::new("https://market.example/api/v0/", None, &MarketplaceConfig::default()).unwrap();
        assert_eq!(driver.url("/offers"), "https://market.example/api/v0/offers");
    }
}
