//! Bootstrapping the price table from the upstream's model catalogue.
//!
//! The upstream exposes an OpenAI-style `/models` endpoint whose entries carry
//! per-token `input_price` / `output_price` fields. When the local table is
//! empty at startup, the catalogue is fetched once and stored.

use crate::cost::ModelPrice;
use crate::error::{ProxyError, Result};
use crate::ledger::PriceStore;
use serde::Deserialize;

/// One entry of the upstream `/models` response.
#[derive(Debug, Deserialize)]
pub struct PricedModel {
    pub id: String,
    #[serde(default)]
    pub input_price: f64,
    #[serde(default)]
    pub output_price: f64,
}

/// The upstream `/models` response.
#[derive(Debug, Deserialize)]
pub struct PricedModelsResponse {
    pub data: Vec<PricedModel>,
}

/// Fetch the priced model catalogue from the upstream.
///
/// # Errors
/// Returns `ProxyError::Provider` if the request fails or the response cannot be parsed.
pub async fn fetch_model_prices(
    client: &reqwest::Client,
    target_url: &str,
) -> Result<Vec<ModelPrice>> {
    let url = format!("{}/models", target_url.trim_end_matches('/'));
    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| ProxyError::provider(format!("Failed to fetch models: {e}")))?;

    let status = response.status().as_u16();
    if status != 200 {
        return Err(ProxyError::provider(format!(
            "Upstream returned status {status} when fetching models"
        )));
    }

    let parsed: PricedModelsResponse = response
        .json()
        .await
        .map_err(|e| ProxyError::provider(format!("Failed to parse models response: {e}")))?;

    Ok(parsed
        .data
        .into_iter()
        .map(|m| ModelPrice {
            model_name: m.id,
            input_price: m.input_price,
            output_price: m.output_price,
        })
        .collect())
}

/// Fill an empty price table from the upstream. Returns how many prices were stored;
/// a table that already has rows is left alone and yields `0`.
pub async fn bootstrap_prices(
    store: &dyn PriceStore,
    client: &reqwest::Client,
    target_url: &str,
) -> Result<usize> {
    if !store.is_empty().await? {
        tracing::info!("ModelPrice table already has data, skipping fetch");
        return Ok(0);
    }

    tracing::info!("ModelPrice table is empty, fetching model pricing");
    let prices = fetch_model_prices(client, target_url).await?;

    let mut stored = 0;
    for price in &prices {
        match store.upsert_price(price).await {
            Ok(()) => {
                stored += 1;
                tracing::debug!(
                    model = %price.model_name,
                    input = price.input_price,
                    output = price.output_price,
                    "Stored pricing"
                );
            }
            Err(e) => tracing::warn!(model = %price.model_name, "Error storing model pricing: {e}"),
        }
    }
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStore;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_bootstrap_fills_empty_table() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "object": "list",
                "data": [
                    {"id": "openai/gpt-4o", "input_price": 0.0000025, "output_price": 0.00001},
                    {"id": "openai/gpt-4o-mini"},
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = SqliteStore::open_in_memory().unwrap();
        let client = reqwest::Client::new();
        let url = format!("{}/v1/", server.uri());

        let stored = bootstrap_prices(&store, &client, &url).await.unwrap();
        assert_eq!(stored, 2);
        let price = store.get_price("openai/gpt-4o").await.unwrap().unwrap();
        assert_eq!(price.output_price, 0.00001);

        // Second run sees a populated table and does not fetch again.
        assert_eq!(bootstrap_prices(&store, &client, &url).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bootstrap_surfaces_upstream_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let store = SqliteStore::open_in_memory().unwrap();
        let err = bootstrap_prices(&store, &reqwest::Client::new(), &server.uri())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("503"));
        assert!(store.is_empty().await.unwrap());
    }
}
